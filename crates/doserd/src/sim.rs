//! Simulated nutrient reservoir for local development.
//!
//! One shared solution model backs both the pumps and the sensors:
//! - pH and EC drift over time (plant uptake, CO2 absorption)
//! - every pump run moves the solution in its direction of effect
//! - per-reading sensor noise and occasional read/relay faults
//! - slow diurnal swing on temperature and light

use async_trait::async_trait;
use std::fmt;
use std::sync::Mutex;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, info};

use hydro_dosing::config::Targets;
use hydro_dosing::{Actuate, Actuator, Channel, HardwareError, SensorSource};

// ---------------------------------------------------------------------------
// Gaussian approximation (no extra dependency)
// ---------------------------------------------------------------------------

/// Irwin-Hall: sum of 12 uniform [0,1) values minus 6.
fn approx_std_normal() -> f64 {
    let mut sum: f64 = 0.0;
    for _ in 0..12 {
        sum += fastrand::f64();
    }
    sum - 6.0
}

fn gaussian(mean: f64, sigma: f64) -> f64 {
    mean + sigma * approx_std_normal()
}

// ---------------------------------------------------------------------------
// Scenario presets
// ---------------------------------------------------------------------------

/// Simulation profiles selectable via `SIM_SCENARIO`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Scenario {
    /// pH creeps up and EC falls as plants feed. The normal case.
    Drifting,
    /// Solution sits at target with little noise. Nothing should dose.
    Stable,
    /// Noisy electrodes, frequent read failures, occasional relay faults.
    /// Exercises retries and the sensor breaker.
    Flaky,
    /// Starts well below pH target and keeps sinking.
    Acidic,
}

impl Scenario {
    pub fn from_str_lossy(s: &str) -> Self {
        match s.to_ascii_lowercase().as_str() {
            "stable" => Self::Stable,
            "flaky" => Self::Flaky,
            "acidic" => Self::Acidic,
            _ => Self::Drifting,
        }
    }
}

impl fmt::Display for Scenario {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Drifting => write!(f, "drifting"),
            Self::Stable => write!(f, "stable"),
            Self::Flaky => write!(f, "flaky"),
            Self::Acidic => write!(f, "acidic"),
        }
    }
}

struct Params {
    ph_drift_per_hour: f64,
    ec_drift_per_hour: f64,
    ph_noise: f64,
    ec_noise: f64,
    read_fail_prob: f32,
    pump_fail_prob: f32,
    start_ph_offset: f64,
    start_ec_offset: f64,
}

impl Params {
    fn for_scenario(scenario: Scenario) -> Self {
        match scenario {
            Scenario::Drifting => Self {
                ph_drift_per_hour: 0.15,
                ec_drift_per_hour: -0.05,
                ph_noise: 0.01,
                ec_noise: 0.005,
                read_fail_prob: 0.01,
                pump_fail_prob: 0.0,
                start_ph_offset: 0.0,
                start_ec_offset: 0.0,
            },
            Scenario::Stable => Self {
                ph_drift_per_hour: 0.0,
                ec_drift_per_hour: 0.0,
                ph_noise: 0.005,
                ec_noise: 0.002,
                read_fail_prob: 0.0,
                pump_fail_prob: 0.0,
                start_ph_offset: 0.0,
                start_ec_offset: 0.0,
            },
            Scenario::Flaky => Self {
                ph_drift_per_hour: 0.1,
                ec_drift_per_hour: -0.03,
                ph_noise: 0.05,
                ec_noise: 0.03,
                read_fail_prob: 0.15,
                pump_fail_prob: 0.1,
                start_ph_offset: 0.2,
                start_ec_offset: -0.1,
            },
            Scenario::Acidic => Self {
                ph_drift_per_hour: -0.2,
                ec_drift_per_hour: 0.02,
                ph_noise: 0.01,
                ec_noise: 0.005,
                read_fail_prob: 0.01,
                pump_fail_prob: 0.0,
                start_ph_offset: -0.9,
                start_ec_offset: 0.0,
            },
        }
    }
}

/// Change in the measured value per second of pump run.
fn pump_effect_per_sec(actuator: Actuator) -> (f64, f64) {
    match actuator {
        Actuator::PhUp => (0.04, 0.0),
        Actuator::PhDown => (-0.04, 0.0),
        Actuator::EcA | Actuator::EcB | Actuator::EcC => (0.0, 0.01),
        Actuator::Water => (0.0, -0.02),
    }
}

// ---------------------------------------------------------------------------
// Simulator
// ---------------------------------------------------------------------------

struct Solution {
    ph: f64,
    ec: f64,
    last_step: Instant,
    started: Instant,
}

pub struct ReservoirSim {
    scenario: Scenario,
    params: Params,
    solution: Mutex<Solution>,
    /// Length of the simulated day.
    diurnal_period: Duration,
}

impl ReservoirSim {
    pub fn new(scenario: Scenario, targets: &Targets, diurnal_period: Duration) -> Self {
        let params = Params::for_scenario(scenario);
        let now = Instant::now();
        let solution = Solution {
            ph: f64::from(targets.ph_target) + params.start_ph_offset,
            ec: (f64::from(targets.ec_target) + params.start_ec_offset).max(0.0),
            last_step: now,
            started: now,
        };
        info!(%scenario, ph = solution.ph, ec = solution.ec, "reservoir simulator ready");
        Self {
            scenario,
            params,
            solution: Mutex::new(solution),
            diurnal_period,
        }
    }

    pub fn scenario(&self) -> Scenario {
        self.scenario
    }

    fn solution(&self) -> std::sync::MutexGuard<'_, Solution> {
        self.solution.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Advance the drift model to now.
    fn step(&self, sol: &mut Solution) {
        let now = Instant::now();
        let hours = now.saturating_duration_since(sol.last_step).as_secs_f64() / 3600.0;
        sol.ph = (sol.ph + self.params.ph_drift_per_hour * hours).clamp(0.0, 14.0);
        sol.ec = (sol.ec + self.params.ec_drift_per_hour * hours).max(0.0);
        sol.last_step = now;
    }

    fn diurnal(&self, sol: &Solution) -> f64 {
        let t = Instant::now()
            .saturating_duration_since(sol.started)
            .as_secs_f64();
        let period = self.diurnal_period.as_secs_f64().max(1.0);
        (2.0 * std::f64::consts::PI * t / period).sin()
    }

    /// One sensor reading, or `None` for a simulated read fault.
    pub fn sample(&self, channel: Channel) -> Option<f32> {
        if fastrand::f32() < self.params.read_fail_prob {
            return None;
        }
        let mut sol = self.solution();
        self.step(&mut sol);
        let day = self.diurnal(&sol);
        let value = match channel {
            Channel::Ph => gaussian(sol.ph, self.params.ph_noise).clamp(0.0, 14.0),
            Channel::Ec => gaussian(sol.ec, self.params.ec_noise).max(0.0),
            Channel::Temperature => gaussian(21.0 + 3.0 * day, 0.1),
            Channel::Humidity => gaussian(60.0 - 10.0 * day, 0.5).clamp(0.0, 100.0),
            Channel::Illuminance => (20_000.0 * day).max(0.0) + gaussian(50.0, 5.0).max(0.0),
            Channel::Co2 => gaussian(420.0, 10.0).max(0.0),
        };
        Some(value as f32)
    }

    /// Apply the chemical effect of running `actuator` for `duration_ms`.
    pub fn dose(&self, actuator: Actuator, duration_ms: u32) {
        let secs = f64::from(duration_ms) / 1000.0;
        let (dph, dec) = pump_effect_per_sec(actuator);
        let mut sol = self.solution();
        self.step(&mut sol);
        sol.ph = (sol.ph + dph * secs).clamp(0.0, 14.0);
        sol.ec = (sol.ec + dec * secs).max(0.0);
        debug!(%actuator, duration_ms, ph = sol.ph, ec = sol.ec, "[sim] dosed");
    }
}

#[async_trait]
impl Actuate for ReservoirSim {
    async fn actuate(&self, actuator: Actuator, duration_ms: u32) -> Result<(), HardwareError> {
        if fastrand::f32() < self.params.pump_fail_prob {
            return Err(HardwareError::Bus("simulated relay fault".into()));
        }
        tokio::time::sleep(Duration::from_millis(u64::from(duration_ms))).await;
        self.dose(actuator, duration_ms);
        Ok(())
    }

    async fn all_off(&self) -> Result<(), HardwareError> {
        info!("[sim] all pumps off");
        Ok(())
    }
}

#[async_trait]
impl SensorSource for ReservoirSim {
    async fn read(&self, channel: Channel) -> Result<f32, HardwareError> {
        self.sample(channel).ok_or(HardwareError::Timeout)
    }
}

// ===========================================================================
// Tests
// ===========================================================================
