//! Typed domain events. Every component publishes onto one broadcast bus;
//! the daemon's sink task logs them and forwards warnings and above to
//! whatever notification channel is configured.

use serde::Serialize;
use time::OffsetDateTime;
use tokio::sync::broadcast;

use crate::actuator::{Actuator, Channel};
use crate::pid::PidTerms;

/// Events buffered per subscriber before the slowest one starts lagging.
const EVENT_CAPACITY: usize = 256;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Debug,
    Info,
    Warning,
    Error,
    Critical,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum DosingEvent {
    SensorTripped {
        channel: Channel,
        cooloff_sec: u64,
    },
    SensorRecovered {
        channel: Channel,
    },
    DoseExecuted {
        actuator: Actuator,
        current: f32,
        target: f32,
        dose_ml: f32,
        duration_ms: u32,
        terms: PidTerms,
        preemptive: bool,
    },
    /// Retries exhausted. PID fields are zeroed.
    DoseFailed {
        actuator: Actuator,
        current: f32,
        target: f32,
        terms: PidTerms,
        reason: String,
    },
    /// Fixed-duration pulse or direct run.
    PumpRun {
        actuator: Actuator,
        duration_ms: u32,
        success: bool,
    },
    ActuatorDisabled {
        actuator: Actuator,
        reason: String,
    },
    DailyLimitHit {
        actuator: Actuator,
        daily_volume_ml: f32,
        requested_ml: f32,
        max_daily_ml: f32,
        current: f32,
        target: f32,
    },
}

impl DosingEvent {
    pub fn severity(&self) -> Severity {
        match self {
            DosingEvent::SensorTripped { .. } => Severity::Warning,
            DosingEvent::SensorRecovered { .. } => Severity::Info,
            DosingEvent::DoseExecuted { .. } => Severity::Info,
            DosingEvent::DoseFailed { .. } => Severity::Error,
            DosingEvent::PumpRun { success: true, .. } => Severity::Debug,
            DosingEvent::PumpRun { success: false, .. } => Severity::Warning,
            DosingEvent::ActuatorDisabled { .. } => Severity::Critical,
            DosingEvent::DailyLimitHit { .. } => Severity::Critical,
        }
    }

    /// Component that raised the event.
    pub fn source(&self) -> &'static str {
        match self {
            DosingEvent::SensorTripped { .. } | DosingEvent::SensorRecovered { .. } => "sensor",
            DosingEvent::DoseExecuted { .. } | DosingEvent::DailyLimitHit { .. } => "pid",
            DosingEvent::DoseFailed { .. }
            | DosingEvent::PumpRun { .. }
            | DosingEvent::ActuatorDisabled { .. } => "pump",
        }
    }

    pub fn message(&self) -> String {
        match self {
            DosingEvent::SensorTripped { channel, cooloff_sec } => {
                format!("{channel} sensor disabled for {cooloff_sec}s after repeated failures")
            }
            DosingEvent::SensorRecovered { channel } => format!("{channel} sensor recovered"),
            DosingEvent::DoseExecuted {
                actuator,
                current,
                target,
                dose_ml,
                duration_ms,
                terms,
                preemptive,
            } => format!(
                "{actuator}: {dose_ml:.2} ml in {duration_ms} ms ({current:.2} -> {target:.2}, \
                 P={:.3} I={:.3} D={:.3}){}",
                terms.p,
                terms.i,
                terms.d,
                if *preemptive { " [predictive]" } else { "" }
            ),
            DosingEvent::DoseFailed {
                actuator,
                current,
                target,
                reason,
                ..
            } => format!("{actuator}: dose failed at {current:.2} (target {target:.2}): {reason}"),
            DosingEvent::PumpRun {
                actuator,
                duration_ms,
                success,
            } => format!(
                "{actuator}: {} run of {duration_ms} ms",
                if *success { "completed" } else { "failed" }
            ),
            DosingEvent::ActuatorDisabled { actuator, reason } => {
                format!("{actuator} disabled: {reason}")
            }
            DosingEvent::DailyLimitHit {
                actuator,
                daily_volume_ml,
                requested_ml,
                max_daily_ml,
                current,
                target,
            } => format!(
                "{actuator}: daily limit reached ({daily_volume_ml:.1} + {requested_ml:.1} ml \
                 > {max_daily_ml:.1} ml) at {current:.2} (target {target:.2}), controller disabled"
            ),
        }
    }

    /// Notification payload for warning-and-above events.
    pub fn notification(&self) -> Option<Notification> {
        let severity = self.severity();
        (severity >= Severity::Warning).then(|| Notification {
            severity,
            source: self.source(),
            message: self.message(),
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Notification {
    pub severity: Severity,
    pub source: &'static str,
    pub message: String,
}

/// Timestamped envelope as delivered to subscribers.
#[derive(Debug, Clone, Serialize)]
pub struct EventRecord {
    #[serde(with = "time::serde::rfc3339")]
    pub ts: OffsetDateTime,
    #[serde(flatten)]
    pub event: DosingEvent,
}

/// Cloneable publisher handle.
#[derive(Debug, Clone)]
pub struct EventBus {
    tx: broadcast::Sender<EventRecord>,
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

impl EventBus {
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(EVENT_CAPACITY);
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<EventRecord> {
        self.tx.subscribe()
    }

    pub fn publish(&self, event: DosingEvent) {
        // No subscribers is fine: events are advisory.
        let _ = self.tx.send(EventRecord {
            ts: OffsetDateTime::now_utc(),
            event,
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn only_warning_and_above_notify() {
        let info = DosingEvent::SensorRecovered {
            channel: Channel::Ph,
        };
        assert!(info.notification().is_none());

        let crit = DosingEvent::ActuatorDisabled {
            actuator: Actuator::PhDown,
            reason: "retries exhausted".into(),
        };
        let n = crit.notification().unwrap();
        assert_eq!(n.severity, Severity::Critical);
        assert_eq!(n.source, "pump");
        assert!(n.message.contains("pH DOWN"));
    }

    #[test]
    fn record_serialises_with_kind_tag() {
        let rec = EventRecord {
            ts: OffsetDateTime::UNIX_EPOCH,
            event: DosingEvent::SensorTripped {
                channel: Channel::Ec,
                cooloff_sec: 60,
            },
        };
        let json = serde_json::to_value(&rec).unwrap();
        assert_eq!(json["kind"], "sensor_tripped");
        assert_eq!(json["channel"], "ec");
        assert_eq!(json["ts"], "1970-01-01T00:00:00Z");
    }

    #[tokio::test]
    async fn subscribers_receive_published_events() {
        let bus = EventBus::new();
        let mut rx = bus.subscribe();
        bus.publish(DosingEvent::SensorRecovered {
            channel: Channel::Temperature,
        });
        let rec = rx.recv().await.unwrap();
        assert_eq!(
            rec.event,
            DosingEvent::SensorRecovered {
                channel: Channel::Temperature
            }
        );
    }

    #[test]
    fn publish_without_subscribers_is_harmless() {
        EventBus::new().publish(DosingEvent::SensorRecovered {
            channel: Channel::Ph,
        });
    }
}
