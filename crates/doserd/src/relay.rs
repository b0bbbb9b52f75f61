//! Relay-switched dosing pumps on Raspberry Pi GPIO (rppal).

use anyhow::Result;
use async_trait::async_trait;
use rppal::gpio::{Gpio, OutputPin};
use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;
use tracing::{info, warn};

use hydro_dosing::{Actuate, Actuator, HardwareError};

/// Output level that puts a relay in the requested state. Many common
/// relay boards are active-low.
fn drive_high(on: bool, active_low: bool) -> bool {
    on != active_low
}

pub struct RelayBoard {
    pins: Mutex<HashMap<Actuator, OutputPin>>,
    active_low: bool,
}

impl RelayBoard {
    pub fn new(wiring: &[(Actuator, u8)], active_low: bool) -> Result<Self> {
        let gpio = Gpio::new()?;
        let mut pins = HashMap::new();

        for (actuator, pin_num) in wiring {
            let mut pin = gpio.get(*pin_num)?.into_output();
            // Fail-safe: relay OFF at startup.
            if drive_high(false, active_low) {
                pin.set_high();
            } else {
                pin.set_low();
            }
            info!(%actuator, gpio = pin_num, "relay registered");
            pins.insert(*actuator, pin);
        }

        Ok(Self {
            pins: Mutex::new(pins),
            active_low,
        })
    }

    fn set(&self, actuator: Actuator, on: bool) -> Result<(), HardwareError> {
        let mut pins = self.pins.lock().unwrap_or_else(|e| e.into_inner());
        let pin = pins.get_mut(&actuator).ok_or(HardwareError::NotPresent)?;
        if drive_high(on, self.active_low) {
            pin.set_high();
        } else {
            pin.set_low();
        }
        Ok(())
    }
}

#[async_trait]
impl Actuate for RelayBoard {
    async fn actuate(&self, actuator: Actuator, duration_ms: u32) -> Result<(), HardwareError> {
        self.set(actuator, true)?;
        tokio::time::sleep(Duration::from_millis(u64::from(duration_ms))).await;
        self.set(actuator, false)
    }

    async fn all_off(&self) -> Result<(), HardwareError> {
        let keys: Vec<Actuator> = self
            .pins
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .keys()
            .copied()
            .collect();
        for a in keys {
            if let Err(e) = self.set(a, false) {
                warn!(actuator = %a, "relay off failed: {e}");
            }
        }
        Ok(())
    }
}
