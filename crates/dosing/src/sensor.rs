//! Sensor health monitor: retried, calibrated reads behind a per-channel
//! circuit breaker.
//!
//! ```text
//! Closed ──[10 consecutive failures]──▶ Open (cool-off, no hardware access)
//!   ▲                                        │
//!   └──────[first successful read after]─────┘
//! ```
//!
//! The failure counter resets at the moment the breaker trips, so once the
//! cool-off expires the channel is read again regardless of history.

use async_trait::async_trait;
use serde::Serialize;
use std::sync::{Arc, RwLock as StdRwLock};
use std::time::Duration;
use time::OffsetDateTime;
use tokio::sync::RwLock;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::actuator::{Channel, CHANNEL_COUNT};
use crate::config::{SensorSettings, MAX_COOLOFF_SEC};
use crate::error::HardwareError;
use crate::events::{DosingEvent, EventBus};

/// Attempts per read before the read counts as one failure.
pub const READ_ATTEMPTS: u32 = 3;

/// Consecutive failed reads that trip the breaker.
pub const TRIP_THRESHOLD: u32 = 10;

/// Reads needed before the success ratio decides health.
const HEALTH_MIN_READS: u64 = 50;
const HEALTH_MIN_SUCCESS_RATE: f64 = 0.8;

/// Below [`HEALTH_MIN_READS`], any failure this recent marks the channel
/// unhealthy.
const RECENT_FAILURE_WINDOW: Duration = Duration::from_secs(10);

/// Raw sensor access (bus mechanics live behind this).
#[async_trait]
pub trait SensorSource: Send + Sync {
    async fn read(&self, channel: Channel) -> Result<f32, HardwareError>;
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct SensorReading {
    pub value: f32,
    pub valid: bool,
}

impl SensorReading {
    pub fn valid(value: f32) -> Self {
        Self { value, valid: true }
    }

    pub fn invalid() -> Self {
        Self {
            value: 0.0,
            valid: false,
        }
    }

    /// The value if the read succeeded.
    pub fn get(self) -> Option<f32> {
        self.valid.then_some(self.value)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SensorSnapshot {
    #[serde(with = "time::serde::rfc3339")]
    pub taken_at: OffsetDateTime,
    pub readings: [SensorReading; CHANNEL_COUNT],
}

impl SensorSnapshot {
    pub fn get(&self, channel: Channel) -> SensorReading {
        self.readings[channel.index()]
    }

    /// Snapshot with every channel invalid.
    pub fn empty() -> Self {
        Self {
            taken_at: OffsetDateTime::now_utc(),
            readings: [SensorReading::invalid(); CHANNEL_COUNT],
        }
    }
}

/// Linear correction: `value * scale + offset`.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct Calibration {
    pub scale: f32,
    pub offset: f32,
}

impl Calibration {
    pub fn apply(&self, raw: f32) -> f32 {
        raw * self.scale + self.offset
    }
}

#[derive(Debug, Default)]
struct ChannelHealth {
    consecutive_failures: u32,
    disabled_until: Option<Instant>,
    total_reads: u64,
    successful_reads: u64,
    last_failure: Option<Instant>,
    last_success: Option<Instant>,
    calibration: Option<Calibration>,
    tripped: bool,
}

impl ChannelHealth {
    fn is_open(&self, now: Instant) -> bool {
        self.disabled_until.map_or(false, |until| now < until)
    }

    fn is_healthy(&self, now: Instant) -> bool {
        if self.total_reads >= HEALTH_MIN_READS {
            self.successful_reads as f64 / self.total_reads as f64 >= HEALTH_MIN_SUCCESS_RATE
        } else {
            self.last_failure
                .map_or(true, |t| now.saturating_duration_since(t) >= RECENT_FAILURE_WINDOW)
        }
    }
}

/// Point-in-time view of one channel's breaker and counters.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SensorHealth {
    pub channel: Channel,
    pub healthy: bool,
    pub disabled: bool,
    pub disabled_for_ms: u64,
    pub consecutive_failures: u32,
    pub total_reads: u64,
    pub successful_reads: u64,
    pub success_rate: f64,
    /// Milliseconds since the last good read.
    pub last_success_age_ms: Option<u64>,
    pub calibration: Option<Calibration>,
}

pub struct SensorMonitor {
    source: Arc<dyn SensorSource>,
    channels: [RwLock<ChannelHealth>; CHANNEL_COUNT],
    settings: StdRwLock<SensorSettings>,
    events: EventBus,
}

impl SensorMonitor {
    pub fn new(source: Arc<dyn SensorSource>, settings: SensorSettings, events: EventBus) -> Self {
        Self {
            source,
            channels: std::array::from_fn(|_| RwLock::new(ChannelHealth::default())),
            settings: StdRwLock::new(settings),
            events,
        }
    }

    pub fn set_settings(&self, settings: SensorSettings) {
        *self.settings.write().unwrap_or_else(|e| e.into_inner()) = settings;
    }

    fn settings(&self) -> SensorSettings {
        self.settings
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    /// Read one channel. Never fails; problems surface as `valid = false`.
    pub async fn read_channel(&self, channel: Channel) -> SensorReading {
        let lock = &self.channels[channel.index()];
        let calibration = {
            let st = lock.read().await;
            if st.is_open(Instant::now()) {
                debug!(%channel, "breaker open, read skipped");
                return SensorReading::invalid();
            }
            st.calibration
        };

        let settings = self.settings();
        let value = self.read_with_retry(channel, calibration, &settings).await;

        let mut st = lock.write().await;
        let now = Instant::now();
        st.total_reads += 1;
        match value {
            Some(v) => {
                st.successful_reads += 1;
                st.consecutive_failures = 0;
                st.disabled_until = None;
                st.last_success = Some(now);
                if st.tripped {
                    st.tripped = false;
                    info!(%channel, "sensor recovered");
                    self.events.publish(DosingEvent::SensorRecovered { channel });
                }
                SensorReading::valid(v)
            }
            None => {
                st.consecutive_failures += 1;
                st.last_failure = Some(now);
                if st.consecutive_failures >= TRIP_THRESHOLD {
                    // Unvalidated settings may carry any u64.
                    let cooloff_sec = settings.cooloff_sec.min(MAX_COOLOFF_SEC);
                    let until = now.checked_add(Duration::from_secs(cooloff_sec));
                    st.disabled_until = Some(until.unwrap_or(now));
                    st.consecutive_failures = 0;
                    st.tripped = true;
                    warn!(%channel, cooloff_sec, "sensor breaker tripped");
                    self.events.publish(DosingEvent::SensorTripped {
                        channel,
                        cooloff_sec,
                    });
                }
                SensorReading::invalid()
            }
        }
    }

    async fn read_with_retry(
        &self,
        channel: Channel,
        calibration: Option<Calibration>,
        settings: &SensorSettings,
    ) -> Option<f32> {
        let range = channel.valid_range();
        for attempt in 0..READ_ATTEMPTS {
            match self.source.read(channel).await {
                Ok(raw) => {
                    let value = calibration.map_or(raw, |c| c.apply(raw));
                    if value.is_finite() && range.contains(&value) {
                        return Some(value);
                    }
                    debug!(%channel, attempt, raw, value, "reading out of range");
                }
                Err(e) => debug!(%channel, attempt, "read failed: {e}"),
            }
            if attempt + 1 < READ_ATTEMPTS {
                tokio::time::sleep(Duration::from_millis(settings.retry_delay_ms)).await;
            }
        }
        None
    }

    pub async fn read_all(&self) -> SensorSnapshot {
        let mut readings = [SensorReading::invalid(); CHANNEL_COUNT];
        for channel in Channel::ALL {
            readings[channel.index()] = self.read_channel(channel).await;
        }
        SensorSnapshot {
            taken_at: OffsetDateTime::now_utc(),
            readings,
        }
    }

    pub async fn is_healthy(&self, channel: Channel) -> bool {
        self.channels[channel.index()]
            .read()
            .await
            .is_healthy(Instant::now())
    }

    /// One-point calibration: `offset = actual - measured`, `scale = 1`.
    pub async fn calibrate(&self, channel: Channel, measured: f32, actual: f32) {
        self.set_calibration(channel, 1.0, actual - measured).await;
    }

    pub async fn set_calibration(&self, channel: Channel, scale: f32, offset: f32) {
        if !scale.is_finite() || !offset.is_finite() {
            warn!(%channel, scale, offset, "ignoring non-finite calibration");
            return;
        }
        self.channels[channel.index()].write().await.calibration =
            Some(Calibration { scale, offset });
        info!(%channel, scale, offset, "calibration set");
    }

    pub async fn clear_calibration(&self, channel: Channel) {
        self.channels[channel.index()].write().await.calibration = None;
        info!(%channel, "calibration cleared");
    }

    pub async fn health(&self, channel: Channel) -> SensorHealth {
        let st = self.channels[channel.index()].read().await;
        let now = Instant::now();
        let disabled_for_ms = st
            .disabled_until
            .map_or(0, |u| u.saturating_duration_since(now).as_millis() as u64);
        SensorHealth {
            channel,
            healthy: st.is_healthy(now),
            disabled: st.is_open(now),
            disabled_for_ms,
            consecutive_failures: st.consecutive_failures,
            total_reads: st.total_reads,
            successful_reads: st.successful_reads,
            success_rate: if st.total_reads == 0 {
                1.0
            } else {
                st.successful_reads as f64 / st.total_reads as f64
            },
            last_success_age_ms: st
                .last_success
                .map(|t| now.saturating_duration_since(t).as_millis() as u64),
            calibration: st.calibration,
        }
    }
}

// ===========================================================================
// Tests
// ===========================================================================
