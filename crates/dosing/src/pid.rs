//! PID math for one actuator. Pure state plus a `step` function; the
//! safety governors around it live in the controller.

use serde::Serialize;
use tokio::time::Instant;

use crate::config::PidConfig;

/// Smallest `dt` used between two computations (1 ms).
const MIN_DT_SEC: f32 = 0.001;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Gains {
    pub kp: f32,
    pub ki: f32,
    pub kd: f32,
}

impl From<&PidConfig> for Gains {
    fn from(cfg: &PidConfig) -> Self {
        Self {
            kp: cfg.kp,
            ki: cfg.ki,
            kd: cfg.kd,
        }
    }
}

/// Contribution of each term to the last output.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
pub struct PidTerms {
    pub p: f32,
    pub i: f32,
    pub d: f32,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PidStep {
    pub terms: PidTerms,
    /// `P + I + D` before clamping.
    pub raw: f32,
    /// Clamped into `[output_min, output_max]`, floored at 0.
    pub output: f32,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct PidState {
    pub integral: f32,
    pub prev_error: f32,
    pub prev_derivative: f32,
    pub last_compute: Option<Instant>,
}

impl PidState {
    pub fn reset(&mut self) {
        *self = Self::default();
    }

    pub fn step(&mut self, cfg: &PidConfig, gains: Gains, error: f32, now: Instant) -> PidStep {
        let (dt, first) = match self.last_compute {
            Some(prev) => (
                now.saturating_duration_since(prev).as_secs_f32().max(MIN_DT_SEC),
                false,
            ),
            None => (1.0, true),
        };

        if cfg.auto_reset_integral
            && self.prev_error != 0.0
            && error != 0.0
            && self.prev_error.signum() != error.signum()
        {
            self.integral = 0.0;
        }
        let limit = cfg.integral_max.abs();
        self.integral = (self.integral + error * dt).max(-limit).min(limit);

        let mut derivative = if first {
            0.0
        } else {
            (error - self.prev_error) / dt
        };
        if cfg.use_derivative_filter && !first {
            derivative = 0.5 * derivative + 0.5 * self.prev_derivative;
        }

        let terms = PidTerms {
            p: gains.kp * error,
            i: gains.ki * self.integral,
            d: gains.kd * derivative,
        };
        let mut raw = terms.p + terms.i + terms.d;
        // An overflowed term saturates through the clamp below; NaN has no direction.
        if raw.is_nan() {
            raw = 0.0;
        }
        let output = raw.max(cfg.output_min).min(cfg.output_max).max(0.0);

        self.prev_error = error;
        self.prev_derivative = derivative;
        self.last_compute = Some(now);

        PidStep { terms, raw, output }
    }
}
