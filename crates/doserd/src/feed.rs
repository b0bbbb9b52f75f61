//! Sensor values from a JSON feed file written by an external sensor reader.
//!
//! ```json
//! { "ph": 6.42, "ec": 1.38, "temperature": 21.5 }
//! ```
//!
//! Missing keys read as "device not present".

use anyhow::Context;
use async_trait::async_trait;
use serde::Deserialize;
use std::path::PathBuf;
use tracing::debug;

use hydro_dosing::{Channel, HardwareError, SensorSource};

#[derive(Debug, Default, Deserialize)]
struct FeedValues {
    ph: Option<f32>,
    ec: Option<f32>,
    temperature: Option<f32>,
    humidity: Option<f32>,
    illuminance: Option<f32>,
    co2: Option<f32>,
}

impl FeedValues {
    fn get(&self, channel: Channel) -> Option<f32> {
        match channel {
            Channel::Ph => self.ph,
            Channel::Ec => self.ec,
            Channel::Temperature => self.temperature,
            Channel::Humidity => self.humidity,
            Channel::Illuminance => self.illuminance,
            Channel::Co2 => self.co2,
        }
    }
}

pub struct FeedFile {
    path: PathBuf,
}

impl FeedFile {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    async fn load(&self) -> anyhow::Result<FeedValues> {
        let bytes = tokio::fs::read(&self.path)
            .await
            .with_context(|| format!("failed to read feed: {}", self.path.display()))?;
        serde_json::from_slice(&bytes)
            .with_context(|| format!("bad feed json: {}", self.path.display()))
    }
}

#[async_trait]
impl SensorSource for FeedFile {
    async fn read(&self, channel: Channel) -> Result<f32, HardwareError> {
        let values = self.load().await.map_err(|e| {
            debug!(%channel, "{e:#}");
            HardwareError::Bus(format!("{e:#}"))
        })?;
        values.get(channel).ok_or(HardwareError::NotPresent)
    }
}
