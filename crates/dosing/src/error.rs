use std::fmt;

use crate::actuator::Actuator;

/// Failure reported by a hardware backend (pump driver or sensor bus).
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HardwareError {
    Bus(String),
    Timeout,
    NotPresent,
}

impl fmt::Display for HardwareError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            HardwareError::Bus(msg) => write!(f, "bus transaction failed: {msg}"),
            HardwareError::Timeout => write!(f, "device timed out"),
            HardwareError::NotPresent => write!(f, "device not present"),
        }
    }
}

impl std::error::Error for HardwareError {}

/// Why a pump run did not happen or did not complete.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PumpError {
    RetriesExhausted {
        actuator: Actuator,
        attempts: u32,
        last: HardwareError,
    },
    NotWired(Actuator),
    Hardware {
        actuator: Actuator,
        source: HardwareError,
    },
}

impl fmt::Display for PumpError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PumpError::RetriesExhausted {
                actuator,
                attempts,
                last,
            } => write!(f, "{actuator} failed after {attempts} attempts: {last}"),
            PumpError::NotWired(actuator) => write!(f, "{actuator} is not wired"),
            PumpError::Hardware { actuator, source } => write!(f, "{actuator}: {source}"),
        }
    }
}

impl std::error::Error for PumpError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            PumpError::RetriesExhausted { last, .. } => Some(last),
            PumpError::Hardware { source, .. } => Some(source),
            PumpError::NotWired(_) => None,
        }
    }
}
