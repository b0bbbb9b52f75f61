//! Threshold dosing orchestrator: turns pH / EC readings into pump
//! selections under either the fixed-duration or the PID policy.
//!
//! Both policies are gated per parameter by the auto-mode flags and do
//! nothing on invalid readings or unwired pumps.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, RwLock};
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::actuator::{Actuator, Channel};
use crate::config::{AutoMode, ControllerConfig, EcRatios, FixedDosing, Policy, PumpEntry, Targets};
use crate::controller::{
    rate_limit, BlockReason, DosingController, DosingDecision, Outcome, SkipReason,
};
use crate::events::{DosingEvent, EventBus};
use crate::pid::PidTerms;
use crate::pump::RunContext;
use crate::registry::ActuatorState;
use crate::sensor::SensorSnapshot;

/// Gap between consecutive nutrient pumps in one PID correction.
pub const EC_PUMP_SPACING: Duration = Duration::from_millis(500);

const PH_PUMPS: [Actuator; 2] = [Actuator::PhUp, Actuator::PhDown];
const EC_PUMPS: [Actuator; 4] = [Actuator::EcA, Actuator::EcB, Actuator::EcC, Actuator::Water];

#[derive(Debug, Clone)]
struct Settings {
    policy: Policy,
    auto: AutoMode,
    targets: Targets,
    fixed: FixedDosing,
    ec_ratios: EcRatios,
}

impl From<&ControllerConfig> for Settings {
    fn from(cfg: &ControllerConfig) -> Self {
        Self {
            policy: cfg.policy,
            auto: cfg.auto,
            targets: cfg.targets.clone(),
            fixed: cfg.fixed.clone(),
            ec_ratios: cfg.ec_ratios.clone(),
        }
    }
}

pub struct Orchestrator {
    controller: Arc<DosingController>,
    settings: RwLock<Settings>,
    /// Next EC component for the fixed policy.
    ec_cursor: AtomicUsize,
    /// Serialises whole EC corrections.
    ec_sequence: Mutex<()>,
    events: EventBus,
}

impl Orchestrator {
    pub fn new(controller: Arc<DosingController>, config: &ControllerConfig, events: EventBus) -> Self {
        Self {
            controller,
            settings: RwLock::new(Settings::from(config)),
            ec_cursor: AtomicUsize::new(0),
            ec_sequence: Mutex::new(()),
            events,
        }
    }

    pub fn controller(&self) -> &DosingController {
        &self.controller
    }

    fn settings(&self) -> Settings {
        self.settings
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    pub fn apply(&self, config: &ControllerConfig) {
        *self.settings.write().unwrap_or_else(|e| e.into_inner()) = Settings::from(config);
        self.ec_cursor.store(0, Ordering::SeqCst);
    }

    pub fn set_auto_mode(&self, ph: bool, ec: bool) {
        self.settings
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .auto = AutoMode { ph, ec };
        info!(ph, ec, "auto mode changed");
    }

    /// Correct both parameters from one snapshot. pH and EC pumps run
    /// concurrently; invalid channels are skipped.
    pub async fn update(&self, snapshot: &SensorSnapshot) -> Vec<DosingDecision> {
        let ph = snapshot.get(Channel::Ph).get();
        let ec = snapshot.get(Channel::Ec).get();
        let (mut out, ec_out) = tokio::join!(
            async {
                match ph {
                    Some(v) => self.correct_ph(v).await,
                    None => Vec::new(),
                }
            },
            async {
                match ec {
                    Some(v) => self.correct_ec(v).await,
                    None => Vec::new(),
                }
            }
        );
        out.extend(ec_out);
        out
    }

    pub async fn correct_ph(&self, current: f32) -> Vec<DosingDecision> {
        let s = self.settings();
        if !s.auto.ph || !current.is_finite() {
            return Vec::new();
        }
        let target = s.targets.ph_target;
        match s.policy {
            Policy::Fixed => {
                let tol = s.targets.ph_tolerance;
                let pump = if current > target + tol {
                    Actuator::PhDown
                } else if current < target - tol {
                    Actuator::PhUp
                } else {
                    return Vec::new();
                };
                self.fire_fixed(pump, current, target, &s.fixed)
                    .await
                    .into_iter()
                    .collect()
            }
            Policy::Pid => {
                self.controller.observe(&PH_PUMPS, current);
                let pump = if current > target {
                    Actuator::PhDown
                } else {
                    Actuator::PhUp
                };
                wired(vec![self.controller.correct(pump, current, target).await])
            }
        }
    }

    pub async fn correct_ec(&self, current: f32) -> Vec<DosingDecision> {
        let s = self.settings();
        if !s.auto.ec || !current.is_finite() {
            return Vec::new();
        }
        let target = s.targets.ec_target;
        let _sequence = self.ec_sequence.lock().await;
        match s.policy {
            Policy::Fixed => {
                if current < target - s.targets.ec_tolerance {
                    self.fire_next_ec(current, target, &s.fixed)
                        .await
                        .into_iter()
                        .collect()
                } else {
                    Vec::new()
                }
            }
            Policy::Pid => {
                self.controller.observe(&EC_PUMPS, current);
                if current > target {
                    return wired(vec![
                        self.controller
                            .correct(Actuator::Water, current, target)
                            .await,
                    ]);
                }
                let mut out = Vec::with_capacity(Actuator::EC_COMPONENTS.len());
                let mut dosed_prev = false;
                for pump in Actuator::EC_COMPONENTS {
                    let share = s.ec_ratios.for_actuator(pump);
                    if !(share > 0.0) {
                        continue;
                    }
                    if dosed_prev {
                        tokio::time::sleep(EC_PUMP_SPACING).await;
                    }
                    let d = self
                        .controller
                        .correct_share(pump, current, target, share)
                        .await;
                    dosed_prev = d.dosed();
                    out.push(d);
                }
                wired(out)
            }
        }
    }

    /// Round-robin over the wired, enabled EC components. Starting at the
    /// cursor, the first pump not held by a cooldown or rate limit is
    /// fired; the cursor then moves past whichever pump was selected.
    async fn fire_next_ec(
        &self,
        current: f32,
        target: f32,
        fixed: &FixedDosing,
    ) -> Option<DosingDecision> {
        let registry = self.controller.pumps().registry();
        let now = Instant::now();
        let mut candidates = Vec::with_capacity(Actuator::EC_COMPONENTS.len());
        for pump in Actuator::EC_COMPONENTS {
            let slot = registry.slot(pump).lock().await;
            if let Some(entry) = slot.entry.as_ref().filter(|_| slot.state.enabled) {
                let ready = fixed_hold(&slot.state, entry, fixed, now).is_none();
                candidates.push((pump, ready));
            }
        }
        if candidates.is_empty() {
            debug!("no EC pump available");
            return None;
        }

        let n = candidates.len();
        let start = self.ec_cursor.load(Ordering::SeqCst) % n;
        // All held: report the cursor pump's hold and still move on.
        let chosen = (0..n)
            .map(|k| (start + k) % n)
            .find(|&i| candidates[i].1)
            .unwrap_or(start);
        self.ec_cursor.store((chosen + 1) % n, Ordering::SeqCst);
        self.fire_fixed(candidates[chosen].0, current, target, fixed)
            .await
    }

    /// Fixed-duration pulse gated by the pump's own cooldown, its rate
    /// limits and its daily volume. `None` when the pump is not wired.
    async fn fire_fixed(
        &self,
        actuator: Actuator,
        current: f32,
        target: f32,
        fixed: &FixedDosing,
    ) -> Option<DosingDecision> {
        let pumps = self.controller.pumps();
        let mut slot = pumps.registry().slot(actuator).lock().await;
        let entry = slot.entry.clone()?;

        let mut decision = DosingDecision {
            actuator,
            dose_ml: 0.0,
            duration_ms: 0,
            outcome: Outcome::Skipped(SkipReason::Disabled),
            terms: PidTerms::default(),
            preemptive: false,
        };
        if !slot.state.enabled {
            return Some(decision);
        }

        if let Some(reason) = fixed_hold(&slot.state, &entry, fixed, Instant::now()) {
            decision.outcome = Outcome::Blocked(reason);
            debug!(%actuator, ?decision.outcome, "fixed pulse held");
            return Some(decision);
        }

        let duration_ms = fixed.duration_ms;
        let volume = entry.physical.volume_for(duration_ms);
        if self
            .controller
            .exceeds_daily_limit(&mut slot, &entry, volume, current, target)
        {
            decision.outcome = Outcome::Blocked(BlockReason::DailyLimit);
            return Some(decision);
        }

        decision.duration_ms = duration_ms;
        let result = pumps
            .run_locked(&mut slot, duration_ms, RunContext { current, target })
            .await;
        let success = result.is_ok();
        if success {
            slot.state.credit_volume(volume);
            decision.dose_ml = volume;
            decision.outcome = Outcome::Dosed;
            info!(%actuator, duration_ms, current, target, "fixed pulse");
        } else {
            decision.outcome = Outcome::Failed;
            warn!(%actuator, duration_ms, "fixed pulse failed");
        }
        self.events.publish(DosingEvent::PumpRun {
            actuator,
            duration_ms,
            success,
        });
        Some(decision)
    }
}

/// Fixed-policy cooldown (0 disables it), then the pump's rate limits.
fn fixed_hold(
    state: &ActuatorState,
    entry: &PumpEntry,
    fixed: &FixedDosing,
    now: Instant,
) -> Option<BlockReason> {
    let cooldown = Duration::from_secs(fixed.cooldown_sec);
    if let Some(last) = state.last_run.filter(|_| !cooldown.is_zero()) {
        let elapsed = now.saturating_duration_since(last);
        if elapsed < cooldown {
            return Some(BlockReason::Cooldown {
                remaining_ms: (cooldown - elapsed).as_millis() as u64,
            });
        }
    }
    rate_limit(state, &entry.physical, now)
}

/// Drop decisions for pumps that are not wired.
fn wired(decisions: Vec<DosingDecision>) -> Vec<DosingDecision> {
    decisions
        .into_iter()
        .filter(|d| d.outcome != Outcome::Skipped(SkipReason::NotWired))
        .collect()
}

// ===========================================================================
// Tests
// ===========================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{PidConfig, PumpPhysicalConfig};
    use crate::error::HardwareError;
    use crate::predict::NoopPredictor;
    use crate::pump::{Actuate, PumpExecutor};
    use crate::registry::ActuatorRegistry;
    use crate::sensor::SensorReading;
    use async_trait::async_trait;
    use std::sync::Mutex as StdMutex;

    #[derive(Default)]
    struct RecordingPump {
        runs: StdMutex<Vec<(Actuator, u32, Instant)>>,
    }

    impl RecordingPump {
        fn pumps(&self) -> Vec<Actuator> {
            self.runs.lock().unwrap().iter().map(|r| r.0).collect()
        }
    }

    #[async_trait]
    impl Actuate for RecordingPump {
        async fn actuate(&self, actuator: Actuator, duration_ms: u32) -> Result<(), HardwareError> {
            self.runs
                .lock()
                .unwrap()
                .push((actuator, duration_ms, Instant::now()));
            tokio::time::sleep(Duration::from_millis(u64::from(duration_ms))).await;
            Ok(())
        }

        async fn all_off(&self) -> Result<(), HardwareError> {
            Ok(())
        }
    }

    fn entry(cooldown_ms: u64) -> PumpEntry {
        PumpEntry {
            physical: PumpPhysicalConfig {
                min_interval_ms: 0,
                ..PumpPhysicalConfig::default()
            },
            pid: PidConfig {
                kp: 4.0,
                ki: 0.0,
                kd: 0.0,
                cooldown_ms,
                ..PidConfig::default()
            },
        }
    }

    fn config(policy: Policy, pumps: &[Actuator]) -> ControllerConfig {
        let mut cfg = ControllerConfig {
            policy,
            auto: AutoMode { ph: true, ec: true },
            fixed: FixedDosing {
                duration_ms: 1000,
                cooldown_sec: 0,
            },
            ..ControllerConfig::default()
        };
        for a in pumps {
            cfg.pumps.set(*a, Some(entry(0)));
        }
        cfg
    }

    fn orchestrator(cfg: &ControllerConfig) -> (Orchestrator, Arc<RecordingPump>) {
        let hw = Arc::new(RecordingPump::default());
        let bus = EventBus::new();
        let reg = Arc::new(ActuatorRegistry::new(cfg));
        let pumps = Arc::new(PumpExecutor::new(hw.clone(), reg, bus.clone()));
        let ctl = Arc::new(DosingController::new(pumps, Arc::new(NoopPredictor), bus.clone()));
        (Orchestrator::new(ctl, cfg, bus), hw)
    }

    // -- Fixed policy -----------------------------------------------------

    #[tokio::test(start_paused = true)]
    async fn fixed_ph_picks_pump_by_band() {
        let cfg = config(Policy::Fixed, &[Actuator::PhUp, Actuator::PhDown]);
        let (o, hw) = orchestrator(&cfg);
        o.correct_ph(7.0).await;
        o.correct_ph(6.0).await;
        assert!(o.correct_ph(6.6).await.is_empty());
        assert_eq!(hw.pumps(), vec![Actuator::PhDown, Actuator::PhUp]);
    }

    #[tokio::test(start_paused = true)]
    async fn fixed_ec_round_robin_skips_unwired() {
        let cfg = config(Policy::Fixed, &[Actuator::EcA, Actuator::EcC]);
        let (o, hw) = orchestrator(&cfg);
        for _ in 0..4 {
            o.correct_ec(1.0).await;
        }
        assert_eq!(
            hw.pumps(),
            vec![Actuator::EcA, Actuator::EcC, Actuator::EcA, Actuator::EcC]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn fixed_ec_cursor_moves_past_cooling_pump() {
        let mut cfg = config(Policy::Fixed, &Actuator::EC_COMPONENTS);
        cfg.fixed.cooldown_sec = 120;
        let (o, hw) = orchestrator(&cfg);
        // EcB ran just now, outside this policy.
        o.controller()
            .pumps()
            .registry()
            .slot(Actuator::EcB)
            .lock()
            .await
            .state
            .record_run(1000, Instant::now());

        assert!(o.correct_ec(1.0).await[0].dosed());
        assert!(o.correct_ec(1.0).await[0].dosed());
        assert_eq!(hw.pumps(), vec![Actuator::EcA, Actuator::EcC]);

        // Everything cooling: held, but the rotation still moves on.
        let held = o.correct_ec(1.0).await;
        assert!(matches!(
            held[0].outcome,
            Outcome::Blocked(BlockReason::Cooldown { .. })
        ));
        assert_eq!(held[0].actuator, Actuator::EcA);

        tokio::time::advance(Duration::from_secs(120)).await;
        o.correct_ec(1.0).await;
        assert_eq!(
            hw.pumps(),
            vec![Actuator::EcA, Actuator::EcC, Actuator::EcB]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn fixed_pulse_respects_daily_volume() {
        let mut cfg = config(Policy::Fixed, &[Actuator::PhDown]);
        let mut e = entry(0);
        e.pid.max_daily_volume = 15.0;
        cfg.pumps.ph_down = Some(e);
        let (o, hw) = orchestrator(&cfg);

        assert!(o.correct_ph(8.0).await[0].dosed());
        // A second 10 ml pulse would reach 20 ml.
        let d = o.correct_ph(8.0).await;
        assert_eq!(d[0].outcome, Outcome::Blocked(BlockReason::DailyLimit));
        let d = o.correct_ph(8.0).await;
        assert_eq!(d[0].outcome, Outcome::Skipped(SkipReason::Disabled));

        assert_eq!(hw.pumps(), vec![Actuator::PhDown]);
        let s = o.controller().pumps().registry().stats(Actuator::PhDown).await;
        assert_eq!(s.daily_volume_ml, 10.0);
        assert!(!s.enabled);
    }

    #[tokio::test(start_paused = true)]
    async fn fixed_pulse_honours_min_interval() {
        let mut cfg = config(Policy::Fixed, &[Actuator::PhDown]);
        cfg.pumps.ph_down = Some(PumpEntry::default());
        let (o, hw) = orchestrator(&cfg);

        assert!(o.correct_ph(8.0).await[0].dosed());
        let d = o.correct_ph(8.0).await;
        assert!(matches!(
            d[0].outcome,
            Outcome::Blocked(BlockReason::MinInterval { .. })
        ));
        tokio::time::advance(Duration::from_secs(10)).await;
        assert!(o.correct_ph(8.0).await[0].dosed());
        assert_eq!(hw.pumps().len(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn fixed_ec_ignores_high_reading() {
        let cfg = config(Policy::Fixed, &Actuator::EC_COMPONENTS);
        let (o, hw) = orchestrator(&cfg);
        assert!(o.correct_ec(2.5).await.is_empty());
        assert!(hw.pumps().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn fixed_pulse_credits_estimated_volume() {
        let cfg = config(Policy::Fixed, &[Actuator::PhDown]);
        let (o, _) = orchestrator(&cfg);
        let d = o.correct_ph(7.5).await;
        // Default flow 10 ml/s for 1 s.
        assert_eq!(d[0].dose_ml, 10.0);
        let s = o.controller().pumps().registry().stats(Actuator::PhDown).await;
        assert_eq!(s.daily_volume_ml, 10.0);
    }

    // -- Gating -----------------------------------------------------------

    #[tokio::test(start_paused = true)]
    async fn auto_mode_gates_each_parameter() {
        let cfg = config(Policy::Fixed, &[Actuator::PhDown, Actuator::EcA]);
        let (o, hw) = orchestrator(&cfg);
        o.set_auto_mode(false, true);
        assert!(o.correct_ph(8.0).await.is_empty());
        assert_eq!(o.correct_ec(0.5).await.len(), 1);
        assert_eq!(hw.pumps(), vec![Actuator::EcA]);
    }

    #[tokio::test(start_paused = true)]
    async fn invalid_reading_is_ignored() {
        let cfg = config(Policy::Pid, &[Actuator::PhDown]);
        let (o, hw) = orchestrator(&cfg);
        assert!(o.correct_ph(f32::NAN).await.is_empty());
        assert!(o.update(&SensorSnapshot::empty()).await.is_empty());
        assert!(hw.pumps().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn unwired_pump_is_silent() {
        let cfg = config(Policy::Pid, &[]);
        let (o, _) = orchestrator(&cfg);
        assert!(o.correct_ph(8.0).await.is_empty());
        assert!(o.correct_ec(3.0).await.is_empty());
    }

    // -- PID policy -------------------------------------------------------

    #[tokio::test(start_paused = true)]
    async fn pid_ec_runs_components_in_order_with_spacing() {
        let cfg = config(Policy::Pid, &Actuator::EC_COMPONENTS);
        let (o, hw) = orchestrator(&cfg);
        let out = o.correct_ec(1.0).await;
        assert_eq!(out.len(), 3);
        assert!(out.iter().all(|d| d.dosed()));
        let doses: Vec<f32> = out.iter().map(|d| d.dose_ml).collect();
        assert_eq!(doses, vec![2.0 * 0.4, 2.0 * 0.4, 2.0 * 0.2]);

        let runs = hw.runs.lock().unwrap().clone();
        assert_eq!(
            runs.iter().map(|r| r.0).collect::<Vec<_>>(),
            Actuator::EC_COMPONENTS.to_vec()
        );
        for pair in runs.windows(2) {
            let (_, dur, start) = pair[0];
            let gap = pair[1].2.duration_since(start) - Duration::from_millis(u64::from(dur));
            assert!(gap >= EC_PUMP_SPACING, "gap {gap:?}");
        }
    }

    #[tokio::test(start_paused = true)]
    async fn pid_ec_splits_correction_by_ratio() {
        let mut cfg = config(Policy::Pid, &Actuator::EC_COMPONENTS);
        cfg.ec_ratios = EcRatios {
            a: 0.5,
            b: 0.5,
            c: 0.0,
        };
        let (o, hw) = orchestrator(&cfg);
        // error 0.5 * kp 4 = 2 ml, split evenly between A and B.
        let out = o.correct_ec(1.0).await;
        assert_eq!(out.len(), 2);
        assert!(out.iter().all(|d| d.dosed() && d.dose_ml == 1.0));
        assert_eq!(hw.pumps(), vec![Actuator::EcA, Actuator::EcB]);
    }

    #[tokio::test(start_paused = true)]
    async fn pid_ec_dilutes_with_water() {
        let cfg = config(
            Policy::Pid,
            &[Actuator::EcA, Actuator::EcB, Actuator::EcC, Actuator::Water],
        );
        let (o, hw) = orchestrator(&cfg);
        o.correct_ec(2.5).await;
        assert_eq!(hw.pumps(), vec![Actuator::Water]);
    }

    #[tokio::test(start_paused = true)]
    async fn update_doses_ph_and_ec_from_snapshot() {
        let cfg = config(Policy::Pid, &[Actuator::PhDown, Actuator::EcA]);
        let (o, hw) = orchestrator(&cfg);
        let mut snap = SensorSnapshot::empty();
        snap.readings[Channel::Ph.index()] = SensorReading::valid(7.2);
        snap.readings[Channel::Ec.index()] = SensorReading::valid(1.0);
        let out = o.update(&snap).await;
        assert_eq!(out.len(), 2);
        let mut pumps = hw.pumps();
        pumps.sort();
        assert_eq!(pumps, vec![Actuator::PhDown, Actuator::EcA]);
    }

    #[tokio::test(start_paused = true)]
    async fn apply_switches_policy() {
        let cfg = config(Policy::Pid, &[Actuator::PhDown]);
        let (o, hw) = orchestrator(&cfg);
        let mut fixed = cfg.clone();
        fixed.policy = Policy::Fixed;
        o.apply(&fixed);
        let out = o.correct_ph(7.0).await;
        assert_eq!(out[0].duration_ms, 1000);
        assert_eq!(hw.pumps(), vec![Actuator::PhDown]);
    }
}
