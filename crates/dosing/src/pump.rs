//! Pump execution layer: retry-protected calls into the actuation
//! primitive, run statistics, and escalation when a pump keeps failing.

use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{error, info, warn};

use crate::actuator::Actuator;
use crate::error::{HardwareError, PumpError};
use crate::events::{DosingEvent, EventBus};
use crate::pid::PidTerms;
use crate::registry::{ActuatorRegistry, ActuatorSlot};

/// Attempts before a pump is declared failed.
pub const PUMP_ATTEMPTS: u32 = 3;

const BACKOFF_BASE_MS: u64 = 100;

/// Drives the physical pumps. `actuate` returns once the run has finished.
#[async_trait]
pub trait Actuate: Send + Sync {
    async fn actuate(&self, actuator: Actuator, duration_ms: u32) -> Result<(), HardwareError>;

    /// De-energise every pump.
    async fn all_off(&self) -> Result<(), HardwareError>;
}

/// Delay after failed attempt `attempt` (0-based): 100 ms, 200 ms, 400 ms...
pub fn retry_backoff(attempt: u32) -> Duration {
    Duration::from_millis(BACKOFF_BASE_MS.saturating_mul(1u64 << attempt.min(16)))
}

/// Readings attached to a failure report.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct RunContext {
    pub current: f32,
    pub target: f32,
}

pub struct PumpExecutor {
    hw: Arc<dyn Actuate>,
    registry: Arc<ActuatorRegistry>,
    events: EventBus,
}

impl PumpExecutor {
    pub fn new(hw: Arc<dyn Actuate>, registry: Arc<ActuatorRegistry>, events: EventBus) -> Self {
        Self {
            hw,
            registry,
            events,
        }
    }

    pub fn registry(&self) -> &ActuatorRegistry {
        &self.registry
    }

    /// Retrying run for a caller that already holds the actuator's lock.
    ///
    /// On success the slot's run statistics are updated. When every attempt
    /// fails the actuator is disabled and exactly one critical event is
    /// published.
    pub async fn run_locked(
        &self,
        slot: &mut ActuatorSlot,
        duration_ms: u32,
        ctx: RunContext,
    ) -> Result<(), PumpError> {
        let actuator = slot.actuator;
        let mut last = HardwareError::NotPresent;

        for attempt in 0..PUMP_ATTEMPTS {
            let started = Instant::now();
            match self.hw.actuate(actuator, duration_ms).await {
                Ok(()) => {
                    slot.state.record_run(duration_ms, started);
                    return Ok(());
                }
                Err(e) => {
                    warn!(%actuator, attempt, duration_ms, "pump attempt failed: {e}");
                    last = e;
                }
            }
            if attempt + 1 < PUMP_ATTEMPTS {
                tokio::time::sleep(retry_backoff(attempt)).await;
            }
        }

        slot.state.enabled = false;
        let err = PumpError::RetriesExhausted {
            actuator,
            attempts: PUMP_ATTEMPTS,
            last,
        };
        error!(
            %actuator,
            current = ctx.current,
            target = ctx.target,
            "pump disabled: {err}"
        );
        self.events.publish(DosingEvent::ActuatorDisabled {
            actuator,
            reason: err.to_string(),
        });
        self.events.publish(DosingEvent::DoseFailed {
            actuator,
            current: ctx.current,
            target: ctx.target,
            terms: PidTerms::default(),
            reason: err.to_string(),
        });
        Err(err)
    }

    pub async fn run_with_retry(&self, actuator: Actuator, duration_ms: u32) -> Result<(), PumpError> {
        let mut slot = self.registry.slot(actuator).lock().await;
        if slot.entry.is_none() {
            return Err(PumpError::NotWired(actuator));
        }
        self.run_locked(&mut slot, duration_ms, RunContext::default())
            .await
    }

    /// Single attempt, no safety gates. Statistics are still recorded.
    pub async fn run_direct(&self, actuator: Actuator, duration_ms: u32) -> Result<(), PumpError> {
        let mut slot = self.registry.slot(actuator).lock().await;
        if slot.entry.is_none() {
            return Err(PumpError::NotWired(actuator));
        }
        let started = Instant::now();
        let result = self.hw.actuate(actuator, duration_ms).await;
        let success = result.is_ok();
        if success {
            slot.state.record_run(duration_ms, started);
            info!(%actuator, duration_ms, "direct run");
        } else {
            warn!(%actuator, duration_ms, "direct run failed");
        }
        self.events.publish(DosingEvent::PumpRun {
            actuator,
            duration_ms,
            success,
        });
        result.map_err(|source| PumpError::Hardware { actuator, source })
    }

    /// Convert `dose_ml` to a run time, run it, and credit the volume.
    /// Returns the duration used.
    pub async fn run_with_dose(&self, actuator: Actuator, dose_ml: f32) -> Result<u32, PumpError> {
        let mut slot = self.registry.slot(actuator).lock().await;
        let Some(entry) = slot.entry.as_ref() else {
            return Err(PumpError::NotWired(actuator));
        };
        let duration_ms = entry.physical.duration_for(dose_ml);
        self.run_locked(&mut slot, duration_ms, RunContext::default())
            .await?;
        slot.state.credit_volume(dose_ml.max(0.0));
        Ok(duration_ms)
    }

    pub async fn emergency_stop(&self) -> Result<(), HardwareError> {
        warn!("emergency stop: all pumps off");
        self.hw.all_off().await.map_err(|e| {
            error!("emergency stop failed: {e}");
            e
        })
    }
}

// ===========================================================================
// Tests
// ===========================================================================
