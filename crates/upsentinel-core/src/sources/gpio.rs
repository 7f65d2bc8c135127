//! Digital status lines and the board thermal zone.
//!
//! The UPS HAT wires two open-drain outputs to the SoC: a power-loss line
//! (external supply present / absent) and a charging line. They override
//! whatever the sampled source inferred about power source and charging.
//! Lines are read through sysfs first and `gpioget` second; an unreadable
//! line leaves the reading untouched.

use std::path::PathBuf;
use std::time::Duration;

use crate::config::GpioConfig;
use crate::reading::{ChargeState, PowerSource, Reading};

use super::helpers::{read_thermal_c, read_trimmed, run_command};

/// The HAT's status lines plus the SoC thermal zone.
#[derive(Debug, Clone)]
pub struct SignalLines {
    enabled: bool,
    chip: String,
    power_loss_pin: u32,
    power_present_level: u8,
    charging_pin: u32,
    charging_level: u8,
    sysfs_root: PathBuf,
    thermal_path: PathBuf,
    timeout: Duration,
}

impl SignalLines {
    pub fn new(cfg: &GpioConfig) -> Self {
        Self {
            enabled: cfg.enabled,
            chip: cfg.chip.clone(),
            power_loss_pin: cfg.power_loss_pin,
            power_present_level: cfg.power_present_level,
            charging_pin: cfg.charging_pin,
            charging_level: cfg.charging_level,
            sysfs_root: cfg.sysfs_root.clone(),
            thermal_path: cfg.thermal_path.clone(),
            timeout: Duration::from_millis(cfg.timeout_ms),
        }
    }

    /// Read one line's level (0 or 1).
    pub fn read_line(&self, pin: u32) -> Option<u8> {
        let path = self.sysfs_root.join(format!("gpio{pin}")).join("value");
        let raw = match read_trimmed(&path) {
            Some(v) => v,
            None => run_command("gpioget", &[&self.chip, &pin.to_string()], self.timeout)?,
        };
        parse_level(&raw)
    }

    /// Power source as reported by the power-loss line.
    pub fn power_source(&self) -> Option<PowerSource> {
        if !self.enabled {
            return None;
        }
        let level = self.read_line(self.power_loss_pin)?;
        Some(if level == self.power_present_level {
            PowerSource::External
        } else {
            PowerSource::Battery
        })
    }

    /// Charging state as reported by the charging line.
    pub fn charging(&self) -> Option<ChargeState> {
        if !self.enabled {
            return None;
        }
        let level = self.read_line(self.charging_pin)?;
        Some(if level == self.charging_level {
            ChargeState::Charging
        } else {
            ChargeState::NotCharging
        })
    }

    /// SoC temperature in °C.
    pub fn temperature_c(&self) -> Option<f64> {
        read_thermal_c(&self.thermal_path)
    }

    /// Overlay line states and temperature onto a sampled reading.
    pub fn augment(&self, reading: &mut Reading) {
        if let Some(ps) = self.power_source() {
            reading.power_source = ps;
        }
        if let Some(cs) = self.charging() {
            reading.charging = cs;
        }
        if reading.temperature_c.is_none() {
            reading.temperature_c = self.temperature_c();
        }
    }
}

/// Accept sysfs (`0`/`1`) and `gpioget` (`0`, `1`, `"6"=active`, ...) output.
fn parse_level(raw: &str) -> Option<u8> {
    let last = raw.split(['=', ' ']).next_back()?.trim();
    match last {
        "0" | "inactive" => Some(0),
        "1" | "active" => Some(1),
        _ => None,
    }
}
