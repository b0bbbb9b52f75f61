//! Actuator and sensor channel identities.
//!
//! Both sets are closed and small, so per-item state lives in fixed-size
//! arrays indexed by [`Actuator::index`] / [`Channel::index`] instead of
//! maps keyed by strings.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::ops::RangeInclusive;

// ---------------------------------------------------------------------------
// Actuators
// ---------------------------------------------------------------------------

/// One peristaltic dosing pump.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Actuator {
    PhUp,
    PhDown,
    EcA,
    EcB,
    EcC,
    Water,
}

pub const ACTUATOR_COUNT: usize = 6;

/// Which way a pump moves the measured value when it runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Effect {
    Raises,
    Lowers,
}

impl Actuator {
    pub const ALL: [Actuator; ACTUATOR_COUNT] = [
        Actuator::PhUp,
        Actuator::PhDown,
        Actuator::EcA,
        Actuator::EcB,
        Actuator::EcC,
        Actuator::Water,
    ];

    /// Nutrient component pumps in dosing order.
    pub const EC_COMPONENTS: [Actuator; 3] = [Actuator::EcA, Actuator::EcB, Actuator::EcC];

    pub fn index(self) -> usize {
        self as usize
    }

    pub fn name(self) -> &'static str {
        match self {
            Actuator::PhUp => "pH UP",
            Actuator::PhDown => "pH DOWN",
            Actuator::EcA => "EC A",
            Actuator::EcB => "EC B",
            Actuator::EcC => "EC C",
            Actuator::Water => "Water",
        }
    }

    /// Config / event key (`ph_up`, `ec_a`, ...).
    pub fn key(self) -> &'static str {
        match self {
            Actuator::PhUp => "ph_up",
            Actuator::PhDown => "ph_down",
            Actuator::EcA => "ec_a",
            Actuator::EcB => "ec_b",
            Actuator::EcC => "ec_c",
            Actuator::Water => "water",
        }
    }

    pub fn effect(self) -> Effect {
        match self {
            Actuator::PhDown | Actuator::Water => Effect::Lowers,
            _ => Effect::Raises,
        }
    }

    /// Control error in this pump's direction of effect: positive means the
    /// pump should run.
    pub fn directed_error(self, current: f32, target: f32) -> f32 {
        match self.effect() {
            Effect::Raises => target - current,
            Effect::Lowers => current - target,
        }
    }
}

impl fmt::Display for Actuator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

// ---------------------------------------------------------------------------
// Sensor channels
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Channel {
    Ph,
    Ec,
    Temperature,
    Humidity,
    Illuminance,
    Co2,
}

pub const CHANNEL_COUNT: usize = 6;

impl Channel {
    pub const ALL: [Channel; CHANNEL_COUNT] = [
        Channel::Ph,
        Channel::Ec,
        Channel::Temperature,
        Channel::Humidity,
        Channel::Illuminance,
        Channel::Co2,
    ];

    pub fn index(self) -> usize {
        self as usize
    }

    pub fn name(self) -> &'static str {
        match self {
            Channel::Ph => "pH",
            Channel::Ec => "EC",
            Channel::Temperature => "temperature",
            Channel::Humidity => "humidity",
            Channel::Illuminance => "illuminance",
            Channel::Co2 => "CO2",
        }
    }

    /// Physically plausible raw values. Anything outside is a failed read.
    pub fn valid_range(self) -> RangeInclusive<f32> {
        match self {
            Channel::Ph => 0.0..=14.0,
            Channel::Temperature => -40.0..=125.0,
            Channel::Humidity => 0.0..=100.0,
            Channel::Ec | Channel::Illuminance | Channel::Co2 => 0.0..=f32::MAX,
        }
    }
}

impl fmt::Display for Channel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

// ===========================================================================
// Tests
// ===========================================================================
