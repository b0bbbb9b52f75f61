//! Fixed-size per-actuator registry. One `tokio::sync::Mutex` per pump; no
//! operation ever holds two of them at once.

use serde::Serialize;
use std::collections::VecDeque;
use std::time::Duration;
use time::OffsetDateTime;
use tokio::sync::Mutex;
use tokio::time::Instant;

use crate::actuator::{Actuator, ACTUATOR_COUNT};
use crate::config::{ControllerConfig, PumpEntry};
use crate::pid::{PidState, PidTerms};

/// Window for the per-pump hourly run count.
pub const RUN_WINDOW: Duration = Duration::from_secs(3600);

/// Runtime state of one pump. Replaced wholesale on configuration reload.
#[derive(Debug, Clone)]
pub struct ActuatorState {
    pub pid: PidState,
    pub last_run: Option<Instant>,
    pub last_run_at: Option<OffsetDateTime>,
    pub daily_volume_ml: f32,
    pub total_volume_ml: f32,
    pub total_runs: u64,
    pub total_run_time_ms: u64,
    pub enabled: bool,
    pub last_terms: PidTerms,
    /// Start times of runs inside the last [`RUN_WINDOW`], oldest first.
    pub recent_runs: VecDeque<Instant>,
}

impl ActuatorState {
    fn fresh(entry: Option<&PumpEntry>) -> Self {
        Self {
            pid: PidState::default(),
            last_run: None,
            last_run_at: None,
            daily_volume_ml: 0.0,
            total_volume_ml: 0.0,
            total_runs: 0,
            total_run_time_ms: 0,
            enabled: entry.map_or(false, |e| e.pid.enabled),
            last_terms: PidTerms::default(),
            recent_runs: VecDeque::new(),
        }
    }

    /// Stamp a successful pump run that began at `started`.
    pub fn record_run(&mut self, duration_ms: u32, started: Instant) {
        self.total_runs += 1;
        self.total_run_time_ms += u64::from(duration_ms);
        self.last_run = Some(started);
        self.last_run_at = Some(OffsetDateTime::now_utc());
        self.prune_runs(started);
        self.recent_runs.push_back(started);
    }

    fn prune_runs(&mut self, now: Instant) {
        while let Some(&oldest) = self.recent_runs.front() {
            if now.saturating_duration_since(oldest) < RUN_WINDOW {
                break;
            }
            self.recent_runs.pop_front();
        }
    }

    /// Runs started within the last hour as seen from `now`.
    pub fn runs_in_window(&self, now: Instant) -> usize {
        self.recent_runs
            .iter()
            .filter(|&&t| now.saturating_duration_since(t) < RUN_WINDOW)
            .count()
    }

    pub fn credit_volume(&mut self, ml: f32) {
        self.daily_volume_ml += ml;
        self.total_volume_ml += ml;
    }
}

/// Configuration and state guarded together by one lock.
#[derive(Debug)]
pub struct ActuatorSlot {
    pub actuator: Actuator,
    /// `None` when the pump is not wired.
    pub entry: Option<PumpEntry>,
    pub state: ActuatorState,
}

impl ActuatorSlot {
    fn new(actuator: Actuator, entry: Option<PumpEntry>) -> Self {
        let state = ActuatorState::fresh(entry.as_ref());
        Self {
            actuator,
            entry,
            state,
        }
    }

    pub fn stats(&self) -> ActuatorStats {
        ActuatorStats {
            actuator: self.actuator,
            wired: self.entry.is_some(),
            enabled: self.state.enabled,
            total_runs: self.state.total_runs,
            total_volume_ml: self.state.total_volume_ml,
            daily_volume_ml: self.state.daily_volume_ml,
            total_run_time_ms: self.state.total_run_time_ms,
            last_run_at: self.state.last_run_at,
            runs_last_hour: self.state.runs_in_window(Instant::now()) as u32,
            last_terms: self.state.last_terms,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ActuatorStats {
    pub actuator: Actuator,
    pub wired: bool,
    pub enabled: bool,
    pub total_runs: u64,
    pub total_volume_ml: f32,
    pub daily_volume_ml: f32,
    pub total_run_time_ms: u64,
    #[serde(with = "time::serde::rfc3339::option")]
    pub last_run_at: Option<OffsetDateTime>,
    pub runs_last_hour: u32,
    /// PID contributions behind the most recent computation.
    pub last_terms: PidTerms,
}

#[derive(Debug)]
pub struct ActuatorRegistry {
    slots: [Mutex<ActuatorSlot>; ACTUATOR_COUNT],
}

impl ActuatorRegistry {
    pub fn new(config: &ControllerConfig) -> Self {
        Self {
            slots: std::array::from_fn(|i| {
                let a = Actuator::ALL[i];
                Mutex::new(ActuatorSlot::new(a, config.pumps.get(a).cloned()))
            }),
        }
    }

    pub fn slot(&self, actuator: Actuator) -> &Mutex<ActuatorSlot> {
        &self.slots[actuator.index()]
    }

    /// Replace every slot's configuration and state.
    pub async fn apply(&self, config: &ControllerConfig) {
        for a in Actuator::ALL {
            let mut slot = self.slot(a).lock().await;
            *slot = ActuatorSlot::new(a, config.pumps.get(a).cloned());
        }
    }

    /// Zero daily volume on every pump. Does not re-enable anything.
    pub async fn reset_daily(&self) {
        for a in Actuator::ALL {
            self.slot(a).lock().await.state.daily_volume_ml = 0.0;
        }
    }

    pub async fn stats(&self, actuator: Actuator) -> ActuatorStats {
        self.slot(actuator).lock().await.stats()
    }

    pub async fn all_stats(&self) -> Vec<ActuatorStats> {
        let mut out = Vec::with_capacity(ACTUATOR_COUNT);
        for a in Actuator::ALL {
            out.push(self.stats(a).await);
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config_with_ph_up() -> ControllerConfig {
        let mut cfg = ControllerConfig::default();
        cfg.pumps.ph_up = Some(PumpEntry::default());
        cfg
    }

    #[tokio::test]
    async fn unwired_pumps_start_disabled() {
        let reg = ActuatorRegistry::new(&config_with_ph_up());
        assert!(reg.stats(Actuator::PhUp).await.enabled);
        let down = reg.stats(Actuator::PhDown).await;
        assert!(!down.wired);
        assert!(!down.enabled);
    }

    #[tokio::test]
    async fn reset_daily_keeps_totals_and_enabled_flag() {
        let reg = ActuatorRegistry::new(&config_with_ph_up());
        {
            let mut slot = reg.slot(Actuator::PhUp).lock().await;
            slot.state.credit_volume(12.0);
            slot.state.enabled = false;
        }
        reg.reset_daily().await;
        let s = reg.stats(Actuator::PhUp).await;
        assert_eq!(s.daily_volume_ml, 0.0);
        assert_eq!(s.total_volume_ml, 12.0);
        assert!(!s.enabled);
    }

    #[tokio::test]
    async fn apply_replaces_state_wholesale() {
        let reg = ActuatorRegistry::new(&config_with_ph_up());
        {
            let mut slot = reg.slot(Actuator::PhUp).lock().await;
            slot.state.credit_volume(5.0);
            slot.state.enabled = false;
        }
        let mut cfg = config_with_ph_up();
        cfg.pumps.water = Some(PumpEntry::default());
        reg.apply(&cfg).await;

        let up = reg.stats(Actuator::PhUp).await;
        assert!(up.enabled);
        assert_eq!(up.daily_volume_ml, 0.0);
        assert!(reg.stats(Actuator::Water).await.wired);
    }

    #[tokio::test(start_paused = true)]
    async fn run_window_forgets_runs_after_an_hour() {
        let reg = ActuatorRegistry::new(&config_with_ph_up());
        let mut slot = reg.slot(Actuator::PhUp).lock().await;
        let t0 = Instant::now();
        slot.state.record_run(500, t0);
        slot.state.record_run(500, t0 + Duration::from_secs(1800));
        assert_eq!(slot.state.runs_in_window(t0 + Duration::from_secs(1800)), 2);
        assert_eq!(slot.state.runs_in_window(t0 + RUN_WINDOW), 1);

        slot.state.record_run(500, t0 + Duration::from_secs(5400));
        assert_eq!(slot.state.recent_runs.len(), 1);
        assert_eq!(slot.state.total_runs, 3);
    }

    #[tokio::test]
    async fn stats_expose_last_terms() {
        let reg = ActuatorRegistry::new(&config_with_ph_up());
        let terms = PidTerms {
            p: 1.5,
            i: 0.25,
            d: -0.5,
        };
        reg.slot(Actuator::PhUp).lock().await.state.last_terms = terms;
        assert_eq!(reg.stats(Actuator::PhUp).await.last_terms, terms);
    }

    #[tokio::test]
    async fn all_stats_lists_every_pump_in_order() {
        let reg = ActuatorRegistry::new(&ControllerConfig::default());
        let all = reg.all_stats().await;
        let order: Vec<Actuator> = all.iter().map(|s| s.actuator).collect();
        assert_eq!(order, Actuator::ALL.to_vec());
    }
}
