//! Predictive dosing strategies.
//!
//! The controller asks a [`DosePredictor`] whether a reading is trending
//! towards trouble and, if so, how much to dose ahead of time. The default
//! [`NoopPredictor`] never pre-empts; [`TrendPredictor`] fits a line to
//! recent readings and learns how strongly the solution resists each pump.

use std::collections::VecDeque;
use std::sync::{Mutex, RwLock};
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, warn};

use crate::actuator::{Actuator, Effect, ACTUATOR_COUNT};
use crate::config::PredictionSettings;
use crate::pid::Gains;

/// Readings kept per actuator.
const HISTORY_LEN: usize = 50;
/// Readings needed before a trend is trusted at all.
const MIN_HISTORY: usize = 10;
/// How far ahead the trend is projected.
const HORIZON_HOURS: f32 = 1.0;
/// Predicted error must exceed the current one by this factor.
const WORSENING_FACTOR: f32 = 1.5;
/// Learned capacities outside this range are treated as noise.
const CAPACITY_RANGE: std::ops::RangeInclusive<f32> = 0.1..=50.0;
/// Smallest change in the measured value that teaches anything.
const MIN_LEARN_DELTA: f32 = 0.01;
const MIN_LEARN_DOSE_ML: f32 = 0.1;
/// Pre-emptive dosing stays off this long after a forecast misses.
const PAUSE_AFTER_MISS: Duration = Duration::from_secs(3 * 3600);
const PAUSED: &str = "predictions paused after a missed forecast";

#[derive(Debug, Clone, PartialEq)]
pub struct Prediction {
    pub should_preempt: bool,
    /// R^2 of the trend fit, 0 when there is no fit.
    pub confidence: f32,
    pub predicted_value: Option<f32>,
    pub recommendation: String,
}

impl Prediction {
    pub fn none(reason: &str) -> Self {
        Self {
            should_preempt: false,
            confidence: 0.0,
            predicted_value: None,
            recommendation: reason.to_string(),
        }
    }
}

pub trait DosePredictor: Send + Sync {
    /// Feed one reading taken for `actuator`'s parameter.
    fn observe(&self, _actuator: Actuator, _value: f32, _now: Instant) {}

    fn predict(&self, actuator: Actuator, current: f32, target: f32) -> Prediction;

    /// Pre-emptive dose (ml) for the current trend.
    fn calculate_dose(&self, actuator: Actuator, current: f32, target: f32) -> f32;

    fn adaptive_coefficients(&self, _actuator: Actuator, base: Gains) -> Gains {
        base
    }

    /// A dose of `dose_ml` was delivered while the value read `value_before`.
    fn record_dose(&self, _actuator: Actuator, _value_before: f32, _dose_ml: f32, _preemptive: bool) {}

    fn reset_daily(&self) {}

    fn apply_settings(&self, _settings: &PredictionSettings) {}
}

/// Never pre-empts, always returns the configured gains.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopPredictor;

impl DosePredictor for NoopPredictor {
    fn predict(&self, _actuator: Actuator, _current: f32, _target: f32) -> Prediction {
        Prediction::none("prediction disabled")
    }

    fn calculate_dose(&self, _actuator: Actuator, _current: f32, _target: f32) -> f32 {
        0.0
    }
}

// ---------------------------------------------------------------------------
// Trend predictor
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq)]
struct Fit {
    slope_per_hour: f32,
    /// Value projected [`HORIZON_HOURS`] past the newest sample.
    projected: f32,
    r_squared: f32,
}

/// What a pre-emptive dose expects to see once the horizon has passed.
#[derive(Debug, Clone, Copy, PartialEq)]
struct Forecast {
    due: Instant,
    expected: f32,
    /// Largest miss still counted as a hit: the change the trend predicted.
    tolerance: f32,
}

#[derive(Debug, Default)]
struct History {
    samples: VecDeque<(Instant, f32)>,
    preemptive_today: u32,
    capacity_ml: Option<f32>,
    pending: Option<(f32, f32)>,
    forecast: Option<Forecast>,
    paused_until: Option<Instant>,
}

impl History {
    /// Paused relative to the newest sample, so the check follows the
    /// reading timeline rather than the wall clock.
    fn paused(&self) -> bool {
        match (self.paused_until, self.samples.back()) {
            (Some(until), Some(&(newest, _))) => newest < until,
            _ => false,
        }
    }

    fn fit(&self) -> Option<Fit> {
        if self.samples.len() < MIN_HISTORY {
            return None;
        }
        let (t0, _) = *self.samples.front()?;
        let n = self.samples.len() as f64;
        let points: Vec<(f64, f64)> = self
            .samples
            .iter()
            .map(|(t, v)| {
                (
                    t.saturating_duration_since(t0).as_secs_f64() / 3600.0,
                    f64::from(*v),
                )
            })
            .collect();

        let mean_x = points.iter().map(|p| p.0).sum::<f64>() / n;
        let mean_y = points.iter().map(|p| p.1).sum::<f64>() / n;
        let sxx: f64 = points.iter().map(|p| (p.0 - mean_x).powi(2)).sum();
        let sxy: f64 = points.iter().map(|p| (p.0 - mean_x) * (p.1 - mean_y)).sum();
        let syy: f64 = points.iter().map(|p| (p.1 - mean_y).powi(2)).sum();
        if sxx <= f64::EPSILON {
            return None;
        }

        let slope = sxy / sxx;
        let intercept = mean_y - slope * mean_x;
        let r_squared = if syy <= f64::EPSILON {
            0.0
        } else {
            (sxy * sxy) / (sxx * syy)
        };
        let last_x = points.last().map_or(0.0, |p| p.0);
        let projected = intercept + slope * (last_x + f64::from(HORIZON_HOURS));

        Some(Fit {
            slope_per_hour: slope as f32,
            projected: projected as f32,
            r_squared: r_squared.clamp(0.0, 1.0) as f32,
        })
    }
}

pub struct TrendPredictor {
    settings: RwLock<PredictionSettings>,
    history: [Mutex<History>; ACTUATOR_COUNT],
}

impl TrendPredictor {
    pub fn new(settings: PredictionSettings) -> Self {
        Self {
            settings: RwLock::new(settings),
            history: std::array::from_fn(|_| Mutex::new(History::default())),
        }
    }

    fn settings(&self) -> PredictionSettings {
        self.settings
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    fn history(&self, actuator: Actuator) -> std::sync::MutexGuard<'_, History> {
        self.history[actuator.index()]
            .lock()
            .unwrap_or_else(|e| e.into_inner())
    }

    /// Millilitres needed to move the value by 0.1 units.
    pub fn buffer_capacity(&self, actuator: Actuator) -> f32 {
        self.history(actuator)
            .capacity_ml
            .unwrap_or_else(|| self.settings().buffer_capacity_ml)
    }

    /// Refine the capacity estimate from an observed response to a dose.
    pub fn learn(&self, actuator: Actuator, value_before: f32, value_after: f32, dose_ml: f32) {
        let delta = (value_after - value_before).abs();
        if delta < MIN_LEARN_DELTA || dose_ml < MIN_LEARN_DOSE_ML {
            return;
        }
        let measured = dose_ml / (delta * 10.0);
        if !CAPACITY_RANGE.contains(&measured) {
            debug!(%actuator, measured, "ignoring implausible buffer capacity");
            return;
        }
        let mut h = self.history(actuator);
        let next = match h.capacity_ml {
            None => measured,
            Some(prev) => prev * 0.7 + measured * 0.3,
        };
        h.capacity_ml = Some(next);
        debug!(%actuator, capacity_ml = next, "buffer capacity updated");
    }
}

impl DosePredictor for TrendPredictor {
    fn observe(&self, actuator: Actuator, value: f32, now: Instant) {
        if !value.is_finite() {
            return;
        }
        let pending = {
            let mut h = self.history(actuator);
            if h.samples.len() == HISTORY_LEN {
                h.samples.pop_front();
            }
            h.samples.push_back((now, value));
            if let Some(f) = h.forecast.filter(|f| now >= f.due) {
                h.forecast = None;
                let miss = (value - f.expected).abs();
                if miss > f.tolerance {
                    h.paused_until = now.checked_add(PAUSE_AFTER_MISS);
                    warn!(
                        %actuator,
                        expected = f.expected,
                        actual = value,
                        "forecast missed, pre-emptive dosing paused"
                    );
                }
            }
            h.pending.take()
        };
        if let Some((before, dose_ml)) = pending {
            self.learn(actuator, before, value, dose_ml);
        }
    }

    fn predict(&self, actuator: Actuator, current: f32, target: f32) -> Prediction {
        let settings = self.settings();
        if !settings.enabled {
            return Prediction::none("prediction disabled");
        }
        let h = self.history(actuator);
        if h.paused() {
            return Prediction::none(PAUSED);
        }
        let Some(fit) = h.fit() else {
            return Prediction::none("not enough history");
        };

        let current_err = actuator.directed_error(current, target);
        let predicted_err = actuator.directed_error(fit.projected, target);
        let worsening = predicted_err > 0.0 && predicted_err > current_err.abs() * WORSENING_FACTOR;
        let confident = fit.r_squared > settings.confidence_threshold;

        let (should_preempt, recommendation) = if !(worsening && confident) {
            (false, "forecast within bounds".to_string())
        } else if h.preemptive_today >= settings.max_preemptive_per_day {
            (false, "daily pre-emptive limit reached".to_string())
        } else {
            (
                true,
                format!(
                    "pre-emptive dose advised: trend {:+.3}/h towards {:.2}",
                    fit.slope_per_hour, fit.projected
                ),
            )
        };

        Prediction {
            should_preempt,
            confidence: fit.r_squared,
            predicted_value: Some(fit.projected),
            recommendation,
        }
    }

    fn calculate_dose(&self, actuator: Actuator, _current: f32, target: f32) -> f32 {
        let projected = match self.history(actuator).fit() {
            Some(fit) => fit.projected,
            None => return 0.0,
        };
        let predicted_err = actuator.directed_error(projected, target);
        (predicted_err * 10.0 * self.buffer_capacity(actuator)).max(0.0)
    }

    fn adaptive_coefficients(&self, actuator: Actuator, base: Gains) -> Gains {
        let Some(capacity) = self.history(actuator).capacity_ml else {
            return base;
        };
        // Strongly buffered solutions tolerate more aggressive gains.
        let factor = if capacity > 5.0 {
            1.2
        } else if capacity < 2.0 {
            0.8
        } else {
            1.0
        };
        Gains {
            kp: base.kp * factor,
            ki: base.ki * factor,
            kd: base.kd * factor,
        }
    }

    fn record_dose(&self, actuator: Actuator, value_before: f32, dose_ml: f32, preemptive: bool) {
        let capacity = self.buffer_capacity(actuator);
        let mut h = self.history(actuator);
        h.pending = Some((value_before, dose_ml));
        if !preemptive {
            return;
        }
        h.preemptive_today += 1;
        let (Some(fit), Some(&(newest, _))) = (h.fit(), h.samples.back()) else {
            return;
        };
        // Trend projection shifted by the dose's expected effect.
        let effect = if capacity > 0.0 {
            dose_ml / (capacity * 10.0)
        } else {
            0.0
        };
        let expected = match actuator.effect() {
            Effect::Raises => fit.projected + effect,
            Effect::Lowers => fit.projected - effect,
        };
        h.forecast = Some(Forecast {
            due: newest + Duration::from_secs_f32(HORIZON_HOURS * 3600.0),
            expected,
            tolerance: (fit.projected - value_before).abs().max(MIN_LEARN_DELTA),
        });
    }

    fn apply_settings(&self, settings: &PredictionSettings) {
        *self.settings.write().unwrap_or_else(|e| e.into_inner()) = settings.clone();
    }

    fn reset_daily(&self) {
        for slot in &self.history {
            slot.lock().unwrap_or_else(|e| e.into_inner()).preemptive_today = 0;
        }
    }
}
