//! Per-actuator PID dosing with safety governors.
//!
//! ```text
//! Idle ──▶ Computing ──▶ Dosing
//!               │
//!               ├──▶ Skipped  (disabled, deadband, activation, negligible)
//!               └──▶ Blocked  (cooldown, run spacing, hourly runs, daily limit)
//! ```
//!
//! Everything from the PID computation to the end of the pump run happens
//! under the actuator's own lock.

use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, error, info};

use crate::actuator::Actuator;
use crate::config::{PumpEntry, PumpPhysicalConfig};
use crate::events::{DosingEvent, EventBus};
use crate::pid::{Gains, PidTerms};
use crate::predict::DosePredictor;
use crate::pump::{PumpExecutor, RunContext};
use crate::registry::{ActuatorSlot, ActuatorState};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SkipReason {
    NotWired,
    Disabled,
    InvalidReading,
    Deadband,
    BelowActivation,
    NegligibleOutput,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlockReason {
    Cooldown { remaining_ms: u64 },
    /// Too soon after the previous run of this pump.
    MinInterval { remaining_ms: u64 },
    HourlyLimit,
    DailyLimit,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    Dosed,
    Skipped(SkipReason),
    Blocked(BlockReason),
    /// The pump failed after every retry.
    Failed,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DosingDecision {
    pub actuator: Actuator,
    pub dose_ml: f32,
    pub duration_ms: u32,
    pub outcome: Outcome,
    pub terms: PidTerms,
    pub preemptive: bool,
}

impl DosingDecision {
    fn without_dose(actuator: Actuator, outcome: Outcome) -> Self {
        Self {
            actuator,
            dose_ml: 0.0,
            duration_ms: 0,
            outcome,
            terms: PidTerms::default(),
            preemptive: false,
        }
    }

    pub fn dosed(&self) -> bool {
        self.outcome == Outcome::Dosed
    }
}

pub struct DosingController {
    pumps: Arc<PumpExecutor>,
    predictor: Arc<dyn DosePredictor>,
    events: EventBus,
}

impl DosingController {
    pub fn new(pumps: Arc<PumpExecutor>, predictor: Arc<dyn DosePredictor>, events: EventBus) -> Self {
        Self {
            pumps,
            predictor,
            events,
        }
    }

    pub fn pumps(&self) -> &PumpExecutor {
        &self.pumps
    }

    /// Feed a reading to the predictor for every pump acting on it.
    pub fn observe(&self, actuators: &[Actuator], value: f32) {
        let now = Instant::now();
        for a in actuators {
            self.predictor.observe(*a, value, now);
        }
    }

    /// One control cycle for `actuator`.
    pub async fn correct(&self, actuator: Actuator, current: f32, target: f32) -> DosingDecision {
        self.correct_share(actuator, current, target, 1.0).await
    }

    /// Like [`correct`](Self::correct), but the pump delivers only `share`
    /// of the computed dose. Used to split an EC correction across the
    /// nutrient pumps.
    pub async fn correct_share(
        &self,
        actuator: Actuator,
        current: f32,
        target: f32,
        share: f32,
    ) -> DosingDecision {
        let decision = self.correct_inner(actuator, current, target, share).await;
        match decision.outcome {
            Outcome::Dosed => info!(
                %actuator,
                dose_ml = decision.dose_ml,
                duration_ms = decision.duration_ms,
                preemptive = decision.preemptive,
                "dose delivered"
            ),
            outcome => debug!(%actuator, current, target, ?outcome, "no dose"),
        }
        decision
    }

    async fn correct_inner(
        &self,
        actuator: Actuator,
        current: f32,
        target: f32,
        share: f32,
    ) -> DosingDecision {
        let mut slot = self.pumps.registry().slot(actuator).lock().await;
        let Some(entry) = slot.entry.clone() else {
            return DosingDecision::without_dose(actuator, Outcome::Skipped(SkipReason::NotWired));
        };
        if !current.is_finite() || !target.is_finite() {
            return DosingDecision::without_dose(
                actuator,
                Outcome::Skipped(SkipReason::InvalidReading),
            );
        }
        if !slot.state.enabled {
            return DosingDecision::without_dose(actuator, Outcome::Skipped(SkipReason::Disabled));
        }

        let now = Instant::now();
        let hold = cooldown_remaining(&slot, &entry, now)
            .map(|remaining| BlockReason::Cooldown {
                remaining_ms: remaining.as_millis() as u64,
            })
            .or_else(|| rate_limit(&slot.state, &entry.physical, now));
        let share = if share.is_finite() { share.max(0.0) } else { 0.0 };

        // Predictive pre-pass: skips deadband and PID, keeps every limit.
        if hold.is_none() {
            let prediction = self.predictor.predict(actuator, current, target);
            if prediction.should_preempt {
                let dose = self.predictor.calculate_dose(actuator, current, target) * share;
                if dose > 0.0 {
                    info!(
                        %actuator,
                        confidence = prediction.confidence,
                        dose_ml = dose,
                        "{}",
                        prediction.recommendation
                    );
                    return self
                        .dispense(&mut slot, &entry, current, target, dose, PidTerms::default(), true)
                        .await;
                }
            }
        }

        let pid = &entry.pid;
        let error = actuator.directed_error(current, target);
        if error.abs() < pid.deadband {
            return DosingDecision::without_dose(actuator, Outcome::Skipped(SkipReason::Deadband));
        }
        if error.abs() < pid.activation_threshold {
            return DosingDecision::without_dose(
                actuator,
                Outcome::Skipped(SkipReason::BelowActivation),
            );
        }
        if let Some(reason) = hold {
            return DosingDecision::without_dose(actuator, Outcome::Blocked(reason));
        }

        let gains = self
            .predictor
            .adaptive_coefficients(actuator, Gains::from(pid));
        let step = slot.state.pid.step(pid, gains, error, now);
        slot.state.last_terms = step.terms;

        let requested_ml = step.output * share;
        if step.raw < pid.output_min || requested_ml <= 0.0 {
            return DosingDecision {
                terms: step.terms,
                ..DosingDecision::without_dose(
                    actuator,
                    Outcome::Skipped(SkipReason::NegligibleOutput),
                )
            };
        }

        self.dispense(&mut slot, &entry, current, target, requested_ml, step.terms, false)
            .await
    }

    /// Per-cycle cap, daily cap, conversion, and the pump run.
    #[allow(clippy::too_many_arguments)]
    async fn dispense(
        &self,
        slot: &mut ActuatorSlot,
        entry: &PumpEntry,
        current: f32,
        target: f32,
        requested_ml: f32,
        terms: PidTerms,
        preemptive: bool,
    ) -> DosingDecision {
        let actuator = slot.actuator;
        let pid = &entry.pid;
        let dose_ml = requested_ml.min(pid.max_dose_per_cycle);

        if self.exceeds_daily_limit(slot, entry, dose_ml, current, target) {
            return DosingDecision {
                terms,
                preemptive,
                ..DosingDecision::without_dose(actuator, Outcome::Blocked(BlockReason::DailyLimit))
            };
        }

        let duration_ms = entry.physical.duration_for(dose_ml);
        let mut decision = DosingDecision {
            actuator,
            dose_ml,
            duration_ms,
            outcome: Outcome::Dosed,
            terms,
            preemptive,
        };

        match self
            .pumps
            .run_locked(slot, duration_ms, RunContext { current, target })
            .await
        {
            Ok(()) => {
                slot.state.credit_volume(dose_ml);
                slot.state.last_terms = terms;
                self.predictor
                    .record_dose(actuator, current, dose_ml, preemptive);
                self.events.publish(DosingEvent::DoseExecuted {
                    actuator,
                    current,
                    target,
                    dose_ml,
                    duration_ms,
                    terms,
                    preemptive,
                });
            }
            Err(_) => {
                decision.outcome = Outcome::Failed;
                decision.dose_ml = 0.0;
            }
        }
        decision
    }

    /// True when `dose_ml` would push the pump past its daily volume. The
    /// pump is then disabled and a `DailyLimitHit` alert goes out.
    pub(crate) fn exceeds_daily_limit(
        &self,
        slot: &mut ActuatorSlot,
        entry: &PumpEntry,
        dose_ml: f32,
        current: f32,
        target: f32,
    ) -> bool {
        let max_daily_ml = entry.pid.max_daily_volume;
        if slot.state.daily_volume_ml + dose_ml <= max_daily_ml {
            return false;
        }
        let actuator = slot.actuator;
        slot.state.enabled = false;
        error!(
            %actuator,
            daily_volume_ml = slot.state.daily_volume_ml,
            dose_ml,
            max_daily_ml,
            "daily volume exhausted, controller disabled"
        );
        self.events.publish(DosingEvent::DailyLimitHit {
            actuator,
            daily_volume_ml: slot.state.daily_volume_ml,
            requested_ml: dose_ml,
            max_daily_ml,
            current,
            target,
        });
        true
    }

    /// Clear integral, previous error and derivative.
    pub async fn reset_pid(&self, actuator: Actuator) {
        self.pumps
            .registry()
            .slot(actuator)
            .lock()
            .await
            .state
            .pid
            .reset();
        info!(%actuator, "PID state reset");
    }

    /// Resume or halt a controller. Returns `false` for an unwired pump.
    pub async fn set_enabled(&self, actuator: Actuator, enabled: bool) -> bool {
        let mut slot = self.pumps.registry().slot(actuator).lock().await;
        if slot.entry.is_none() {
            return false;
        }
        slot.state.enabled = enabled;
        info!(%actuator, enabled, "controller enable changed");
        true
    }
}

fn cooldown_remaining(slot: &ActuatorSlot, entry: &PumpEntry, now: Instant) -> Option<Duration> {
    let last = slot.state.last_run?;
    let cooldown = Duration::from_millis(entry.pid.cooldown_ms);
    let elapsed = now.saturating_duration_since(last);
    (elapsed < cooldown).then(|| cooldown - elapsed)
}

/// Minimum spacing and hourly cap shared by every automatic run.
pub(crate) fn rate_limit(
    state: &ActuatorState,
    physical: &PumpPhysicalConfig,
    now: Instant,
) -> Option<BlockReason> {
    if let Some(last) = state.last_run {
        let interval = Duration::from_millis(physical.min_interval_ms);
        let elapsed = now.saturating_duration_since(last);
        if elapsed < interval {
            return Some(BlockReason::MinInterval {
                remaining_ms: (interval - elapsed).as_millis() as u64,
            });
        }
    }
    let cap = physical.max_doses_per_hour as usize;
    (cap > 0 && state.runs_in_window(now) >= cap).then_some(BlockReason::HourlyLimit)
}

// ===========================================================================
// Tests
// ===========================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{ControllerConfig, PidConfig, PumpPhysicalConfig};
    use crate::error::HardwareError;
    use crate::predict::NoopPredictor;
    use crate::pump::Actuate;
    use crate::registry::ActuatorRegistry;
    use async_trait::async_trait;
    use std::sync::Mutex as StdMutex;

    #[derive(Default)]
    struct RecordingPump {
        runs: StdMutex<Vec<(Actuator, u32)>>,
    }

    #[async_trait]
    impl Actuate for RecordingPump {
        async fn actuate(&self, actuator: Actuator, duration_ms: u32) -> Result<(), HardwareError> {
            self.runs.lock().unwrap().push((actuator, duration_ms));
            Ok(())
        }

        async fn all_off(&self) -> Result<(), HardwareError> {
            Ok(())
        }
    }

    fn pid() -> PidConfig {
        PidConfig {
            kp: 10.0,
            ki: 0.0,
            kd: 0.0,
            output_min: 0.5,
            output_max: 10.0,
            deadband: 0.05,
            activation_threshold: 0.1,
            max_dose_per_cycle: 4.0,
            cooldown_ms: 60_000,
            max_daily_volume: 10.0,
            ..PidConfig::default()
        }
    }

    fn physical() -> PumpPhysicalConfig {
        PumpPhysicalConfig {
            flow_rate_ml_per_sec: 1.0,
            min_duration_ms: 100,
            max_duration_ms: 10_000,
            ..PumpPhysicalConfig::default()
        }
    }

    fn controller(pid: PidConfig) -> (DosingController, Arc<RecordingPump>, EventBus) {
        controller_with(physical(), pid)
    }

    fn controller_with(
        physical: PumpPhysicalConfig,
        pid: PidConfig,
    ) -> (DosingController, Arc<RecordingPump>, EventBus) {
        let mut cfg = ControllerConfig::default();
        cfg.pumps.ph_down = Some(PumpEntry { physical, pid });
        let hw = Arc::new(RecordingPump::default());
        let bus = EventBus::new();
        let reg = Arc::new(ActuatorRegistry::new(&cfg));
        let pumps = Arc::new(PumpExecutor::new(hw.clone(), reg, bus.clone()));
        (
            DosingController::new(pumps, Arc::new(NoopPredictor), bus.clone()),
            hw,
            bus,
        )
    }

    // -- Gates ------------------------------------------------------------

    #[tokio::test]
    async fn deadband_skips() {
        let (c, hw, _) = controller(pid());
        let d = c.correct(Actuator::PhDown, 6.52, 6.5).await;
        assert_eq!(d.outcome, Outcome::Skipped(SkipReason::Deadband));
        assert!(hw.runs.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn activation_threshold_skips() {
        let (c, _, _) = controller(pid());
        let d = c.correct(Actuator::PhDown, 6.58, 6.5).await;
        assert_eq!(d.outcome, Outcome::Skipped(SkipReason::BelowActivation));
    }

    #[tokio::test]
    async fn wrong_direction_is_negligible() {
        let (c, hw, _) = controller(pid());
        // pH below target: the acid pump must not run.
        let d = c.correct(Actuator::PhDown, 6.0, 6.5).await;
        assert_eq!(d.outcome, Outcome::Skipped(SkipReason::NegligibleOutput));
        assert!(hw.runs.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn unwired_skips() {
        let (c, _, _) = controller(pid());
        let d = c.correct(Actuator::Water, 3.0, 1.5).await;
        assert_eq!(d.outcome, Outcome::Skipped(SkipReason::NotWired));
    }

    #[tokio::test]
    async fn nan_reading_skips() {
        let (c, _, _) = controller(pid());
        let d = c.correct(Actuator::PhDown, f32::NAN, 6.5).await;
        assert_eq!(d.outcome, Outcome::Skipped(SkipReason::InvalidReading));
    }

    // -- Dosing -----------------------------------------------------------

    #[tokio::test(start_paused = true)]
    async fn dose_is_capped_per_cycle_and_credited() {
        let (c, hw, _) = controller(pid());
        // error 0.5 * kp 10 = 5 ml, capped at 4 ml.
        let d = c.correct(Actuator::PhDown, 7.0, 6.5).await;
        assert_eq!(d.outcome, Outcome::Dosed);
        assert_eq!(d.dose_ml, 4.0);
        assert_eq!(d.duration_ms, 4000);
        assert_eq!(d.terms.p, 5.0);
        assert_eq!(*hw.runs.lock().unwrap(), vec![(Actuator::PhDown, 4000)]);

        let s = c.pumps().registry().stats(Actuator::PhDown).await;
        assert_eq!(s.daily_volume_ml, 4.0);
        assert_eq!(s.total_runs, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn cooldown_blocks_then_releases() {
        let (c, _, _) = controller(pid());
        assert!(c.correct(Actuator::PhDown, 7.0, 6.5).await.dosed());

        let d = c.correct(Actuator::PhDown, 7.0, 6.5).await;
        assert!(matches!(d.outcome, Outcome::Blocked(BlockReason::Cooldown { .. })));

        tokio::time::advance(Duration::from_secs(60)).await;
        assert!(c.correct(Actuator::PhDown, 7.0, 6.5).await.dosed());
    }

    #[tokio::test(start_paused = true)]
    async fn min_interval_holds_even_without_cooldown() {
        let (c, _, _) = controller(PidConfig {
            cooldown_ms: 0,
            ..pid()
        });
        assert!(c.correct(Actuator::PhDown, 7.0, 6.5).await.dosed());

        let d = c.correct(Actuator::PhDown, 7.0, 6.5).await;
        assert_eq!(
            d.outcome,
            Outcome::Blocked(BlockReason::MinInterval {
                remaining_ms: 10_000
            })
        );

        tokio::time::advance(Duration::from_secs(10)).await;
        assert!(c.correct(Actuator::PhDown, 7.0, 6.5).await.dosed());
    }

    #[tokio::test(start_paused = true)]
    async fn hourly_run_cap_blocks_until_window_rolls() {
        let (c, hw, _) = controller_with(
            PumpPhysicalConfig {
                min_interval_ms: 0,
                max_doses_per_hour: 2,
                ..physical()
            },
            PidConfig {
                cooldown_ms: 0,
                max_daily_volume: 100.0,
                ..pid()
            },
        );
        for _ in 0..2 {
            assert!(c.correct(Actuator::PhDown, 7.0, 6.5).await.dosed());
            tokio::time::advance(Duration::from_secs(60)).await;
        }
        let d = c.correct(Actuator::PhDown, 7.0, 6.5).await;
        assert_eq!(d.outcome, Outcome::Blocked(BlockReason::HourlyLimit));
        assert_eq!(hw.runs.lock().unwrap().len(), 2);

        // The first run leaves the window one hour after it started.
        tokio::time::advance(Duration::from_secs(3600 - 120)).await;
        assert!(c.correct(Actuator::PhDown, 7.0, 6.5).await.dosed());
        let s = c.pumps().registry().stats(Actuator::PhDown).await;
        assert_eq!(s.runs_last_hour, 2);
    }

    #[tokio::test(start_paused = true)]
    async fn share_scales_the_delivered_dose() {
        let (c, hw, _) = controller(pid());
        // error 0.5 * kp 10 = 5 ml, a quarter of it delivered.
        let d = c.correct_share(Actuator::PhDown, 7.0, 6.5, 0.25).await;
        assert_eq!(d.outcome, Outcome::Dosed);
        assert_eq!(d.dose_ml, 1.25);
        assert_eq!(*hw.runs.lock().unwrap(), vec![(Actuator::PhDown, 1250)]);
    }

    #[tokio::test(start_paused = true)]
    async fn zero_share_never_runs() {
        let (c, hw, _) = controller(pid());
        let d = c.correct_share(Actuator::PhDown, 7.0, 6.5, 0.0).await;
        assert_eq!(d.outcome, Outcome::Skipped(SkipReason::NegligibleOutput));
        assert!(hw.runs.lock().unwrap().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn daily_limit_blocks_and_disables() {
        let (c, hw, bus) = controller(pid());
        let mut rx = bus.subscribe();
        // 4 + 4 = 8 ml fits; a third 4 ml dose would reach 12 > 10.
        for _ in 0..2 {
            assert!(c.correct(Actuator::PhDown, 7.0, 6.5).await.dosed());
            tokio::time::advance(Duration::from_secs(60)).await;
        }
        let d = c.correct(Actuator::PhDown, 7.0, 6.5).await;
        assert_eq!(d.outcome, Outcome::Blocked(BlockReason::DailyLimit));
        assert_eq!(hw.runs.lock().unwrap().len(), 2);

        let s = c.pumps().registry().stats(Actuator::PhDown).await;
        assert!(!s.enabled);
        assert!(s.daily_volume_ml <= 10.0);

        let hits = std::iter::from_fn(|| rx.try_recv().ok())
            .filter(|r| matches!(r.event, DosingEvent::DailyLimitHit { .. }))
            .count();
        assert_eq!(hits, 1);

        // Disabled: no further alerts.
        tokio::time::advance(Duration::from_secs(60)).await;
        let d = c.correct(Actuator::PhDown, 7.0, 6.5).await;
        assert_eq!(d.outcome, Outcome::Skipped(SkipReason::Disabled));
    }

    #[tokio::test(start_paused = true)]
    async fn set_enabled_resumes_disabled_controller() {
        let (c, _, _) = controller(pid());
        assert!(c.set_enabled(Actuator::PhDown, false).await);
        assert_eq!(
            c.correct(Actuator::PhDown, 7.0, 6.5).await.outcome,
            Outcome::Skipped(SkipReason::Disabled)
        );
        assert!(c.set_enabled(Actuator::PhDown, true).await);
        assert!(c.correct(Actuator::PhDown, 7.0, 6.5).await.dosed());
        assert!(!c.set_enabled(Actuator::Water, true).await);
    }

    #[tokio::test(start_paused = true)]
    async fn crossing_target_resets_integral() {
        let (c, _, _) = controller(PidConfig {
            ki: 1.0,
            cooldown_ms: 0,
            ..pid()
        });
        // First computation: dt 1 s, error +0.5.
        assert!(c.correct(Actuator::PhDown, 7.0, 6.5).await.dosed());
        tokio::time::advance(Duration::from_secs(10)).await;

        // Overshoot: error -0.2 over 10 s. Without the reset the integral
        // would be 0.5 - 2.0 = -1.5.
        let d = c.correct(Actuator::PhDown, 6.3, 6.5).await;
        assert_eq!(d.outcome, Outcome::Skipped(SkipReason::NegligibleOutput));
        let integral = c
            .pumps()
            .registry()
            .slot(Actuator::PhDown)
            .lock()
            .await
            .state
            .pid
            .integral;
        assert!((integral + 2.0).abs() < 1e-4, "integral {integral}");

        let s = c.pumps().registry().stats(Actuator::PhDown).await;
        assert!((s.last_terms.i + 2.0).abs() < 1e-4);
        assert!(s.last_terms.p < 0.0);
    }

    #[tokio::test(start_paused = true)]
    async fn reset_pid_clears_integral() {
        let (c, _, _) = controller(PidConfig {
            ki: 1.0,
            cooldown_ms: 0,
            ..pid()
        });
        c.correct(Actuator::PhDown, 7.0, 6.5).await;
        assert!(
            c.pumps().registry().slot(Actuator::PhDown).lock().await.state.pid.integral > 0.0
        );
        c.reset_pid(Actuator::PhDown).await;
        assert_eq!(
            c.pumps().registry().slot(Actuator::PhDown).lock().await.state.pid.integral,
            0.0
        );
    }
}
