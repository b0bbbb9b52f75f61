//! Closed-loop pH / EC dosing core for a hydroponic reservoir.
//!
//! Hardware comes in through two traits: [`Actuate`] runs a pump for a
//! duration and [`SensorSource`] returns one raw reading. Everything else
//! (sensor health, PID dosing, safety limits, retries, statistics) lives
//! behind [`DosingEngine`].

pub mod actuator;
pub mod config;
pub mod controller;
pub mod engine;
pub mod error;
pub mod events;
pub mod orchestrator;
pub mod pid;
pub mod predict;
pub mod pump;
pub mod registry;
pub mod sensor;

pub use actuator::{Actuator, Channel};
pub use config::{ConfigStore, ControllerConfig, EcRatios, TomlFileStore};
pub use controller::{BlockReason, DosingDecision, Outcome, SkipReason};
pub use engine::DosingEngine;
pub use error::{HardwareError, PumpError};
pub use events::{DosingEvent, EventRecord, Notification, Severity};
pub use predict::{DosePredictor, NoopPredictor, TrendPredictor};
pub use pump::Actuate;
pub use registry::ActuatorStats;
pub use sensor::{SensorHealth, SensorReading, SensorSnapshot, SensorSource};
