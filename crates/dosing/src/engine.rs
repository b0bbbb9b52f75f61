//! `DosingEngine`: the one handle the daemon (or any other host) talks to.

use anyhow::{Context, Result};
use std::sync::{Arc, RwLock};
use tokio::sync::broadcast;
use tracing::{info, warn};

use crate::actuator::{Actuator, Channel};
use crate::config::{ConfigStore, ControllerConfig};
use crate::controller::{DosingController, DosingDecision};
use crate::error::{HardwareError, PumpError};
use crate::events::{EventBus, EventRecord};
use crate::orchestrator::Orchestrator;
use crate::predict::{DosePredictor, TrendPredictor};
use crate::pump::{Actuate, PumpExecutor};
use crate::registry::{ActuatorRegistry, ActuatorStats};
use crate::sensor::{SensorHealth, SensorMonitor, SensorReading, SensorSnapshot, SensorSource};

pub struct DosingEngine {
    config: RwLock<ControllerConfig>,
    events: EventBus,
    sensors: SensorMonitor,
    registry: Arc<ActuatorRegistry>,
    pumps: Arc<PumpExecutor>,
    controller: Arc<DosingController>,
    predictor: Arc<dyn DosePredictor>,
    orchestrator: Orchestrator,
}

impl DosingEngine {
    /// Engine with the bundled [`TrendPredictor`].
    pub fn new(
        config: ControllerConfig,
        hw: Arc<dyn Actuate>,
        source: Arc<dyn SensorSource>,
    ) -> Result<Self> {
        let predictor = Arc::new(TrendPredictor::new(config.prediction.clone()));
        Self::with_predictor(config, hw, source, predictor)
    }

    pub fn with_predictor(
        config: ControllerConfig,
        hw: Arc<dyn Actuate>,
        source: Arc<dyn SensorSource>,
        predictor: Arc<dyn DosePredictor>,
    ) -> Result<Self> {
        config.validate().context("cannot start dosing engine")?;

        let events = EventBus::new();
        let sensors = SensorMonitor::new(source, config.sensors.clone(), events.clone());
        let registry = Arc::new(ActuatorRegistry::new(&config));
        let pumps = Arc::new(PumpExecutor::new(hw, registry.clone(), events.clone()));
        let controller = Arc::new(DosingController::new(
            pumps.clone(),
            predictor.clone(),
            events.clone(),
        ));
        let orchestrator = Orchestrator::new(controller.clone(), &config, events.clone());

        info!(
            policy = ?config.policy,
            wired = config.pumps.wired().count(),
            "dosing engine ready"
        );

        Ok(Self {
            config: RwLock::new(config),
            events,
            sensors,
            registry,
            pumps,
            controller,
            predictor,
            orchestrator,
        })
    }

    pub fn config(&self) -> ControllerConfig {
        self.config
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    /// Validate and install a new configuration. An invalid one leaves the
    /// running configuration untouched.
    pub async fn apply_config(&self, config: ControllerConfig) -> Result<()> {
        if let Err(e) = config.validate() {
            warn!("configuration rejected: {e:#}");
            return Err(e);
        }
        self.registry.apply(&config).await;
        self.orchestrator.apply(&config);
        self.sensors.set_settings(config.sensors.clone());
        self.predictor.apply_settings(&config.prediction);
        info!(policy = ?config.policy, "configuration applied");
        *self.config.write().unwrap_or_else(|e| e.into_inner()) = config;
        Ok(())
    }

    pub async fn apply_from(&self, store: &dyn ConfigStore) -> Result<()> {
        let config = store.load()?;
        self.apply_config(config).await
    }

    pub fn save_to(&self, store: &dyn ConfigStore) -> Result<()> {
        store.save(&self.config())
    }

    pub fn subscribe(&self) -> broadcast::Receiver<EventRecord> {
        self.events.subscribe()
    }

    // -- Sensors ----------------------------------------------------------

    pub async fn read_sensors(&self) -> SensorSnapshot {
        self.sensors.read_all().await
    }

    pub async fn read_channel(&self, channel: Channel) -> SensorReading {
        self.sensors.read_channel(channel).await
    }

    pub async fn calibrate(&self, channel: Channel, measured: f32, actual: f32) {
        self.sensors.calibrate(channel, measured, actual).await;
    }

    pub async fn set_calibration(&self, channel: Channel, scale: f32, offset: f32) {
        self.sensors.set_calibration(channel, scale, offset).await;
    }

    pub async fn clear_calibration(&self, channel: Channel) {
        self.sensors.clear_calibration(channel).await;
    }

    pub async fn sensor_health(&self, channel: Channel) -> SensorHealth {
        self.sensors.health(channel).await
    }

    pub async fn is_healthy(&self, channel: Channel) -> bool {
        self.sensors.is_healthy(channel).await
    }

    // -- Dosing -----------------------------------------------------------

    pub async fn update(&self, snapshot: &SensorSnapshot) -> Vec<DosingDecision> {
        self.orchestrator.update(snapshot).await
    }

    pub async fn correct_ph(&self, current: f32) -> Vec<DosingDecision> {
        self.orchestrator.correct_ph(current).await
    }

    pub async fn correct_ec(&self, current: f32) -> Vec<DosingDecision> {
        self.orchestrator.correct_ec(current).await
    }

    pub fn set_auto_mode(&self, ph: bool, ec: bool) {
        self.orchestrator.set_auto_mode(ph, ec);
    }

    pub async fn run_direct(&self, actuator: Actuator, duration_ms: u32) -> Result<(), PumpError> {
        self.pumps.run_direct(actuator, duration_ms).await
    }

    pub async fn run_with_dose(&self, actuator: Actuator, dose_ml: f32) -> Result<u32, PumpError> {
        self.pumps.run_with_dose(actuator, dose_ml).await
    }

    pub async fn reset_pid(&self, actuator: Actuator) {
        self.controller.reset_pid(actuator).await;
    }

    pub async fn set_enabled(&self, actuator: Actuator, enabled: bool) -> bool {
        self.controller.set_enabled(actuator, enabled).await
    }

    pub async fn emergency_stop(&self) -> Result<(), HardwareError> {
        self.pumps.emergency_stop().await
    }

    // -- Statistics -------------------------------------------------------

    pub async fn stats(&self, actuator: Actuator) -> ActuatorStats {
        self.registry.stats(actuator).await
    }

    pub async fn all_stats(&self) -> Vec<ActuatorStats> {
        self.registry.all_stats().await
    }

    /// Zero daily volumes and pre-emptive counters.
    pub async fn reset_daily(&self) {
        self.registry.reset_daily().await;
        self.predictor.reset_daily();
        info!("daily counters reset");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{PumpEntry, TomlFileStore};
    use async_trait::async_trait;

    struct Idle;

    #[async_trait]
    impl Actuate for Idle {
        async fn actuate(&self, _a: Actuator, _ms: u32) -> Result<(), HardwareError> {
            Ok(())
        }

        async fn all_off(&self) -> Result<(), HardwareError> {
            Ok(())
        }
    }

    #[async_trait]
    impl SensorSource for Idle {
        async fn read(&self, _c: Channel) -> Result<f32, HardwareError> {
            Ok(1.0)
        }
    }

    fn engine() -> DosingEngine {
        let mut cfg = ControllerConfig::default();
        cfg.pumps.ph_up = Some(PumpEntry::default());
        DosingEngine::new(cfg, Arc::new(Idle), Arc::new(Idle)).unwrap()
    }

    #[test]
    fn invalid_startup_config_is_rejected() {
        let mut cfg = ControllerConfig::default();
        cfg.targets.ph_target = 20.0;
        assert!(DosingEngine::new(cfg, Arc::new(Idle), Arc::new(Idle)).is_err());
    }

    #[tokio::test]
    async fn invalid_config_is_a_no_op() {
        let e = engine();
        let mut bad = e.config();
        bad.pumps.water = Some(PumpEntry::default());
        bad.targets.ec_target = -1.0;
        assert!(e.apply_config(bad).await.is_err());
        assert!(!e.stats(Actuator::Water).await.wired);
        assert_eq!(e.config().targets.ec_target, 1.5);
    }

    #[tokio::test]
    async fn apply_config_rewires_pumps() {
        let e = engine();
        let mut cfg = e.config();
        cfg.pumps.water = Some(PumpEntry::default());
        e.apply_config(cfg).await.unwrap();
        assert!(e.stats(Actuator::Water).await.wired);
    }

    #[tokio::test]
    async fn config_round_trips_through_store() {
        let path = std::env::temp_dir().join(format!("dosing-engine-{}.toml", std::process::id()));
        let store = TomlFileStore::new(&path);
        let e = engine();
        e.save_to(&store).unwrap();
        e.apply_from(&store).await.unwrap();
        assert!(e.stats(Actuator::PhUp).await.wired);
        let _ = std::fs::remove_file(&path);
    }

    #[tokio::test]
    async fn direct_run_updates_stats() {
        let e = engine();
        e.run_direct(Actuator::PhUp, 250).await.unwrap();
        let s = e.stats(Actuator::PhUp).await;
        assert_eq!(s.total_runs, 1);
        assert_eq!(s.total_run_time_ms, 250);
        // Manual runs count towards the hourly cap on automatic dosing.
        assert_eq!(s.runs_last_hour, 1);
        assert_eq!(e.all_stats().await.len(), 6);
    }
}
