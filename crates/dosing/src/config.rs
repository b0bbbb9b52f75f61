//! TOML configuration model, validation, and the file-backed store.
//!
//! ```toml
//! policy = "pid"
//!
//! [auto]
//! ph = true
//! ec = true
//!
//! [targets]
//! ph_target = 6.5
//! ph_tolerance = 0.3
//!
//! [pumps.ph_down]
//! flow_rate_ml_per_sec = 1.2
//! gpio_pin = 17
//!
//! [pumps.ph_down.pid]
//! kp = 2.0
//! ```
//!
//! A pump without a `[pumps.<name>]` table is treated as not wired.

use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::{Path, PathBuf};

use crate::actuator::Actuator;

// ---------------------------------------------------------------------------
// Config file structures
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ControllerConfig {
    pub policy: Policy,
    pub auto: AutoMode,
    pub targets: Targets,
    pub fixed: FixedDosing,
    pub sensors: SensorSettings,
    pub prediction: PredictionSettings,
    pub ec_ratios: EcRatios,
    pub pumps: PumpTable,
}

/// Which orchestrator policy decides doses.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Policy {
    /// Fire a fixed-duration pulse when a reading leaves its tolerance band.
    Fixed,
    /// Size every dose through the per-pump PID controller.
    #[default]
    Pid,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct AutoMode {
    pub ph: bool,
    pub ec: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Targets {
    pub ph_target: f32,
    pub ph_tolerance: f32,
    pub ec_target: f32,
    pub ec_tolerance: f32,
}

impl Default for Targets {
    fn default() -> Self {
        Self {
            ph_target: 6.5,
            ph_tolerance: 0.3,
            ec_target: 1.5,
            ec_tolerance: 0.1,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct FixedDosing {
    pub duration_ms: u32,
    /// Per-pump minimum gap between pulses. 0 fires unconditionally.
    pub cooldown_sec: u64,
}

impl Default for FixedDosing {
    fn default() -> Self {
        Self {
            duration_ms: 1000,
            cooldown_sec: 120,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SensorSettings {
    /// How long a tripped channel stays disabled.
    pub cooloff_sec: u64,
    pub retry_delay_ms: u64,
}

impl Default for SensorSettings {
    fn default() -> Self {
        Self {
            cooloff_sec: 60,
            retry_delay_ms: 50,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PredictionSettings {
    pub enabled: bool,
    pub confidence_threshold: f32,
    pub max_preemptive_per_day: u32,
    /// Millilitres needed to move the measured value by 0.1 units.
    pub buffer_capacity_ml: f32,
}

impl Default for PredictionSettings {
    fn default() -> Self {
        Self {
            enabled: false,
            confidence_threshold: 0.75,
            max_preemptive_per_day: 10,
            buffer_capacity_ml: 1.0,
        }
    }
}

/// Share of a PID EC correction given to each nutrient pump.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EcRatios {
    pub a: f32,
    pub b: f32,
    pub c: f32,
}

impl Default for EcRatios {
    fn default() -> Self {
        Self {
            a: 0.4,
            b: 0.4,
            c: 0.2,
        }
    }
}

impl EcRatios {
    /// Ratio for an EC component pump; 1.0 for anything else.
    pub fn for_actuator(&self, actuator: Actuator) -> f32 {
        match actuator {
            Actuator::EcA => self.a,
            Actuator::EcB => self.b,
            Actuator::EcC => self.c,
            _ => 1.0,
        }
    }
}

/// One optional entry per pump; `None` means not wired.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PumpTable {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ph_up: Option<PumpEntry>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ph_down: Option<PumpEntry>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ec_a: Option<PumpEntry>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ec_b: Option<PumpEntry>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ec_c: Option<PumpEntry>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub water: Option<PumpEntry>,
}

impl PumpTable {
    pub fn get(&self, actuator: Actuator) -> Option<&PumpEntry> {
        match actuator {
            Actuator::PhUp => self.ph_up.as_ref(),
            Actuator::PhDown => self.ph_down.as_ref(),
            Actuator::EcA => self.ec_a.as_ref(),
            Actuator::EcB => self.ec_b.as_ref(),
            Actuator::EcC => self.ec_c.as_ref(),
            Actuator::Water => self.water.as_ref(),
        }
    }

    pub fn set(&mut self, actuator: Actuator, entry: Option<PumpEntry>) {
        let slot = match actuator {
            Actuator::PhUp => &mut self.ph_up,
            Actuator::PhDown => &mut self.ph_down,
            Actuator::EcA => &mut self.ec_a,
            Actuator::EcB => &mut self.ec_b,
            Actuator::EcC => &mut self.ec_c,
            Actuator::Water => &mut self.water,
        };
        *slot = entry;
    }

    /// Wired pumps in [`Actuator::ALL`] order.
    pub fn wired(&self) -> impl Iterator<Item = (Actuator, &PumpEntry)> + '_ {
        Actuator::ALL
            .into_iter()
            .filter_map(move |a| self.get(a).map(|e| (a, e)))
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PumpEntry {
    #[serde(flatten)]
    pub physical: PumpPhysicalConfig,
    pub pid: PidConfig,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PumpPhysicalConfig {
    pub flow_rate_ml_per_sec: f32,
    pub min_duration_ms: u32,
    pub max_duration_ms: u32,
    /// Shortest gap between automatic runs, start to start. 0 disables.
    pub min_interval_ms: u64,
    /// Automatic runs allowed in any rolling hour. 0 disables.
    pub max_doses_per_hour: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub gpio_pin: Option<u8>,
}

/// Lowest flow rate used when converting a dose to a run time.
pub const MIN_FLOW_RATE_ML_PER_SEC: f32 = 0.1;

impl Default for PumpPhysicalConfig {
    fn default() -> Self {
        Self {
            flow_rate_ml_per_sec: 10.0,
            min_duration_ms: 100,
            max_duration_ms: 5000,
            min_interval_ms: 10_000,
            max_doses_per_hour: 20,
            gpio_pin: None,
        }
    }
}

impl PumpPhysicalConfig {
    /// Run time for `dose_ml`, clamped to the pump's duration window.
    pub fn duration_for(&self, dose_ml: f32) -> u32 {
        let flow = if self.flow_rate_ml_per_sec.is_finite() {
            self.flow_rate_ml_per_sec.max(MIN_FLOW_RATE_ML_PER_SEC)
        } else {
            MIN_FLOW_RATE_ML_PER_SEC
        };
        let raw_ms = (dose_ml.max(0.0) / flow * 1000.0).round();
        let raw_ms = if raw_ms.is_finite() {
            raw_ms.min(u32::MAX as f32) as u32
        } else {
            u32::MAX
        };
        // Manual clamp: a misconfigured min > max must not panic.
        raw_ms.max(self.min_duration_ms).min(self.max_duration_ms)
    }

    /// Volume dispensed by running for `duration_ms`.
    pub fn volume_for(&self, duration_ms: u32) -> f32 {
        self.flow_rate_ml_per_sec.max(0.0) * duration_ms as f32 / 1000.0
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PidConfig {
    pub kp: f32,
    pub ki: f32,
    pub kd: f32,
    /// Smallest dose worth running (ml).
    pub output_min: f32,
    /// Largest PID output (ml).
    pub output_max: f32,
    pub deadband: f32,
    pub activation_threshold: f32,
    pub integral_max: f32,
    pub max_dose_per_cycle: f32,
    pub cooldown_ms: u64,
    pub max_daily_volume: f32,
    pub enabled: bool,
    pub auto_reset_integral: bool,
    pub use_derivative_filter: bool,
}

impl Default for PidConfig {
    fn default() -> Self {
        Self {
            kp: 2.0,
            ki: 0.1,
            kd: 0.5,
            output_min: 0.5,
            output_max: 10.0,
            deadband: 0.05,
            activation_threshold: 0.1,
            integral_max: 50.0,
            max_dose_per_cycle: 5.0,
            cooldown_ms: 60_000,
            max_daily_volume: 200.0,
            enabled: true,
            auto_reset_integral: true,
            use_derivative_filter: false,
        }
    }
}

// ---------------------------------------------------------------------------
// GPIO whitelist
// ---------------------------------------------------------------------------

/// BCM GPIO pins available on the Raspberry Pi 40-pin header for general
/// use. GPIO 0-1 are reserved for the ID EEPROM.
const VALID_GPIO_PINS: &[u8] = &[
    2, 3, 4, 5, 6, 7, 8, 9, 10, 11, 12, 13, 14, 15, 16, 17, 18, 19, 20, 21, 22, 23, 24, 25, 26, 27,
];

/// Longest accepted sensor cool-off (one day).
pub const MAX_COOLOFF_SEC: u64 = 86_400;
/// Longest accepted pause between sensor read attempts.
pub const MAX_RETRY_DELAY_MS: u64 = 10_000;

// ---------------------------------------------------------------------------
// Validation
// ---------------------------------------------------------------------------

impl ControllerConfig {
    /// Validate every section. Returns `Ok(())` or an error describing
    /// every violation found (not just the first one).
    pub fn validate(&self) -> Result<()> {
        let mut errors: Vec<String> = Vec::new();

        self.validate_targets(&mut errors);
        self.validate_runtime(&mut errors);
        self.validate_pumps(&mut errors);

        if errors.is_empty() {
            Ok(())
        } else {
            bail!(
                "config validation failed ({} error{}):\n  - {}",
                errors.len(),
                if errors.len() == 1 { "" } else { "s" },
                errors.join("\n  - ")
            );
        }
    }

    fn validate_targets(&self, errors: &mut Vec<String>) {
        let t = &self.targets;
        if !(0.0..=14.0).contains(&t.ph_target) {
            errors.push(format!("targets: ph_target {} out of range [0, 14]", t.ph_target));
        }
        if !(t.ph_tolerance >= 0.0) {
            errors.push(format!("targets: ph_tolerance must be >= 0, got {}", t.ph_tolerance));
        }
        if !(t.ec_target >= 0.0) || !t.ec_target.is_finite() {
            errors.push(format!("targets: ec_target must be >= 0, got {}", t.ec_target));
        }
        if !(t.ec_tolerance >= 0.0) {
            errors.push(format!("targets: ec_tolerance must be >= 0, got {}", t.ec_tolerance));
        }
    }

    fn validate_runtime(&self, errors: &mut Vec<String>) {
        let s = &self.sensors;
        if s.cooloff_sec == 0 || s.cooloff_sec > MAX_COOLOFF_SEC {
            errors.push(format!(
                "sensors: cooloff_sec {} out of range [1, {MAX_COOLOFF_SEC}]",
                s.cooloff_sec
            ));
        }
        if s.retry_delay_ms > MAX_RETRY_DELAY_MS {
            errors.push(format!(
                "sensors: retry_delay_ms {} exceeds {MAX_RETRY_DELAY_MS}",
                s.retry_delay_ms
            ));
        }
        let r = &self.ec_ratios;
        let ratios = [("a", r.a), ("b", r.b), ("c", r.c)];
        for (name, v) in ratios {
            if !(v >= 0.0) || !v.is_finite() {
                errors.push(format!("ec_ratios: {name} must be >= 0, got {v}"));
            }
        }
        let sum: f32 = ratios.iter().map(|(_, v)| v).sum();
        if (sum - 1.0).abs() > 1e-3 {
            errors.push(format!("ec_ratios: a + b + c must equal 1, got {sum}"));
        }
        let p = &self.prediction;
        if !(0.0..=1.0).contains(&p.confidence_threshold) {
            errors.push(format!(
                "prediction: confidence_threshold {} out of range [0, 1]",
                p.confidence_threshold
            ));
        }
        if !(p.buffer_capacity_ml >= 0.0) {
            errors.push(format!(
                "prediction: buffer_capacity_ml must be >= 0, got {}",
                p.buffer_capacity_ml
            ));
        }
    }

    fn validate_pumps(&self, errors: &mut Vec<String>) {
        let mut seen_pins: HashSet<u8> = HashSet::new();

        for (actuator, entry) in self.pumps.wired() {
            let ctx = format!("pump '{}'", actuator.key());
            let phys = &entry.physical;
            let pid = &entry.pid;

            // ── Physical ────────────────────────────────────────
            if !(phys.flow_rate_ml_per_sec >= 0.0) || !phys.flow_rate_ml_per_sec.is_finite() {
                errors.push(format!(
                    "{ctx}: flow_rate_ml_per_sec must be >= 0, got {}",
                    phys.flow_rate_ml_per_sec
                ));
            }
            if phys.max_duration_ms == 0 {
                errors.push(format!("{ctx}: max_duration_ms must be positive"));
            }
            if phys.min_duration_ms > phys.max_duration_ms {
                errors.push(format!(
                    "{ctx}: min_duration_ms ({}) exceeds max_duration_ms ({})",
                    phys.min_duration_ms, phys.max_duration_ms
                ));
            }

            // ── PID gains and governors ─────────────────────────
            for (name, v) in [("kp", pid.kp), ("ki", pid.ki), ("kd", pid.kd)] {
                if !v.is_finite() {
                    errors.push(format!("{ctx}: {name} must be finite, got {v}"));
                }
            }
            if !(pid.output_max > 0.0) || !pid.output_max.is_finite() {
                errors.push(format!("{ctx}: output_max must be positive, got {}", pid.output_max));
            }
            if !(pid.output_min >= 0.0) || !pid.output_min.is_finite() {
                errors.push(format!("{ctx}: output_min must be >= 0, got {}", pid.output_min));
            }
            if pid.output_min > pid.output_max {
                errors.push(format!(
                    "{ctx}: output_min ({}) exceeds output_max ({})",
                    pid.output_min, pid.output_max
                ));
            }
            for (name, v) in [
                ("deadband", pid.deadband),
                ("activation_threshold", pid.activation_threshold),
                ("integral_max", pid.integral_max),
            ] {
                if !(v >= 0.0) {
                    errors.push(format!("{ctx}: {name} must be >= 0, got {v}"));
                }
            }
            if !(pid.max_dose_per_cycle > 0.0) {
                errors.push(format!(
                    "{ctx}: max_dose_per_cycle must be positive, got {}",
                    pid.max_dose_per_cycle
                ));
            }
            if !(pid.max_daily_volume > 0.0) {
                errors.push(format!(
                    "{ctx}: max_daily_volume must be positive, got {}",
                    pid.max_daily_volume
                ));
            }
            if pid.max_dose_per_cycle > pid.max_daily_volume {
                errors.push(format!(
                    "{ctx}: max_dose_per_cycle ({}) exceeds max_daily_volume ({})",
                    pid.max_dose_per_cycle, pid.max_daily_volume
                ));
            }

            // ── GPIO pin whitelist ──────────────────────────────
            if let Some(pin) = phys.gpio_pin {
                if !VALID_GPIO_PINS.contains(&pin) {
                    errors.push(format!(
                        "{ctx}: gpio_pin {pin} is not a valid BCM GPIO pin (allowed: 2-27)"
                    ));
                } else if !seen_pins.insert(pin) {
                    errors.push(format!("{ctx}: gpio_pin {pin} is already used by another pump"));
                }
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Store
// ---------------------------------------------------------------------------

/// Where configuration is persisted. The engine only needs load and save.
pub trait ConfigStore: Send + Sync {
    fn load(&self) -> Result<ControllerConfig>;
    fn save(&self, config: &ControllerConfig) -> Result<()>;
}

/// TOML file on local disk.
#[derive(Debug, Clone)]
pub struct TomlFileStore {
    path: PathBuf,
}

impl TomlFileStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

impl ConfigStore for TomlFileStore {
    fn load(&self) -> Result<ControllerConfig> {
        load(&self.path)
    }

    fn save(&self, config: &ControllerConfig) -> Result<()> {
        config
            .validate()
            .with_context(|| format!("refusing to save invalid config: {}", self.path.display()))?;
        let contents = toml::to_string_pretty(config).context("failed to serialise config")?;
        std::fs::write(&self.path, contents)
            .with_context(|| format!("failed to write config: {}", self.path.display()))?;
        tracing::info!(path = %self.path.display(), "config saved");
        Ok(())
    }
}

/// Read, parse, and validate a TOML config file.
pub fn load(path: &Path) -> Result<ControllerConfig> {
    let contents = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read config: {}", path.display()))?;
    let config: ControllerConfig = toml::from_str(&contents)
        .with_context(|| format!("failed to parse config: {}", path.display()))?;
    config
        .validate()
        .with_context(|| format!("invalid config: {}", path.display()))?;
    Ok(config)
}

// ===========================================================================
// Tests
// ===========================================================================
