//! Normalized sensor readings.
//!
//! Every [`SensorSource`](crate::source::SensorSource) produces the same
//! [`Reading`] shape. Fields a source cannot measure are `None`; the
//! [`SourceId`] tells downstream stages which fields to expect.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Identity of the sensor source that produced a reading.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SourceId {
    /// Battery fuel gauge (voltage + state of charge).
    FuelGauge,
    /// Shunt current/voltage monitor.
    CurrentSensor,
    /// Operating-system power-supply and thermal counters.
    HostStats,
}

impl SourceId {
    pub const ALL: [SourceId; 3] = [Self::FuelGauge, Self::CurrentSensor, Self::HostStats];

    pub fn as_str(self) -> &'static str {
        match self {
            Self::FuelGauge => "fuel_gauge",
            Self::CurrentSensor => "current_sensor",
            Self::HostStats => "host_stats",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|id| id.as_str() == s)
    }
}

impl std::fmt::Display for SourceId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Where the board is drawing power from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PowerSource {
    External,
    Battery,
    Unknown,
}

impl PowerSource {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::External => "external",
            Self::Battery => "battery",
            Self::Unknown => "unknown",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "external" => Some(Self::External),
            "battery" => Some(Self::Battery),
            "unknown" => Some(Self::Unknown),
            _ => None,
        }
    }
}

impl std::fmt::Display for PowerSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Tri-state charging indicator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChargeState {
    Charging,
    NotCharging,
    Unknown,
}

impl ChargeState {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Charging => "charging",
            Self::NotCharging => "not_charging",
            Self::Unknown => "unknown",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "charging" => Some(Self::Charging),
            "not_charging" => Some(Self::NotCharging),
            "unknown" => Some(Self::Unknown),
            _ => None,
        }
    }
}

impl std::fmt::Display for ChargeState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One normalized sample. Immutable once recorded; keyed by
/// (`source`, `timestamp`).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Reading {
    /// Wall-clock time of the sample.
    pub timestamp: DateTime<Utc>,
    /// Milliseconds since the monitor process started.
    pub mono_ms: u64,
    /// Pack/bus voltage in volts.
    pub voltage_v: Option<f64>,
    /// Current in milliamps; negative means the battery is discharging.
    pub current_ma: Option<f64>,
    /// Power in milliwatts.
    pub power_mw: Option<f64>,
    /// State of charge, 0–100.
    pub battery_percent: Option<f64>,
    /// Board temperature in °C.
    pub temperature_c: Option<f64>,
    pub power_source: PowerSource,
    pub charging: ChargeState,
    pub source: SourceId,
    /// False when the device answered but the data is unusable (e.g. the fuel
    /// gauge reports its "no battery" signature).
    pub valid: bool,
}

impl Reading {
    /// An empty valid reading from `source`, stamped with the current time.
    pub fn new(source: SourceId) -> Self {
        Self {
            timestamp: Utc::now(),
            mono_ms: crate::sources::helpers::monotonic_ms(),
            voltage_v: None,
            current_ma: None,
            power_mw: None,
            battery_percent: None,
            temperature_c: None,
            power_source: PowerSource::Unknown,
            charging: ChargeState::Unknown,
            source,
            valid: true,
        }
    }

    /// Whether the board is running from the battery.
    pub fn on_battery(&self) -> bool {
        self.power_source == PowerSource::Battery
    }
}

/// Clamp a state-of-charge value into 0–100.
pub fn clamp_percent(p: f64) -> f64 {
    if p.is_nan() { 0.0 } else { p.clamp(0.0, 100.0) }
}
