//! Monitor configuration.
//!
//! One TOML file, every field defaulted. A missing file means "all defaults";
//! a present but malformed file is the only fatal error the monitor has.
//!
//! ```toml
//! [poll]
//! interval_secs = 5
//!
//! [thresholds]
//! low_voltage_v = 10.5
//! warning_score = 40
//! critical_score = 70
//!
//! [alerts]
//! cooldown_secs = 1800
//! webhook_url = "https://push.example.net/hook"
//!
//! [heartbeat]
//! servers = ["https://bypass-a.example.net/beat"]
//! ```

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;
use crate::reading::SourceId;

/// Default location checked when no `--config` is given.
pub const DEFAULT_CONFIG_PATH: &str = "/etc/upsentinel/config.toml";

/// Longest accepted retention window (ten years).
pub const MAX_RETENTION_HOURS: u64 = 10 * 365 * 24;

/// Longest accepted alert cooldown (thirty days).
pub const MAX_COOLDOWN_SECS: u64 = 30 * 24 * 3600;

/// Complete monitor configuration.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MonitorConfig {
    pub poll: PollConfig,
    pub thresholds: Thresholds,
    pub weights: Weights,
    pub alerts: AlertConfig,
    pub recorder: RecorderConfig,
    pub sources: SourcesConfig,
    pub gpio: GpioConfig,
    pub heartbeat: HeartbeatConfig,
    pub logs: LogScanConfig,
}

impl MonitorConfig {
    /// Parse and validate a TOML document.
    pub fn from_toml(text: &str) -> Result<Self, ConfigError> {
        let cfg: Self = toml::from_str(text)?;
        cfg.validate()?;
        Ok(cfg)
    }

    /// Load and validate `path`.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path)?;
        Self::from_toml(&text)
    }

    /// Load `path` if given, else [`DEFAULT_CONFIG_PATH`] if it exists, else
    /// defaults. An explicitly named file that doesn't exist is an error.
    pub fn load_or_default(path: Option<&Path>) -> Result<Self, ConfigError> {
        match path {
            Some(p) => Self::load(p),
            None => {
                let default = Path::new(DEFAULT_CONFIG_PATH);
                if default.exists() {
                    Self::load(default)
                } else {
                    Ok(Self::default())
                }
            }
        }
    }

    /// Render the effective configuration.
    pub fn to_toml_string(&self) -> Result<String, ConfigError> {
        Ok(toml::to_string_pretty(self)?)
    }

    /// Reject values the pipeline cannot run with.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let p = &self.poll;
        if p.interval_secs == 0 {
            return Err(ConfigError::invalid("poll.interval_secs", "must be > 0"));
        }
        if p.sample_timeout_ms == 0 {
            return Err(ConfigError::invalid("poll.sample_timeout_ms", "must be > 0"));
        }
        if p.health_timeout_ms == 0 {
            return Err(ConfigError::invalid("poll.health_timeout_ms", "must be > 0"));
        }
        if p.missing_ticks_alert == 0 {
            return Err(ConfigError::invalid("poll.missing_ticks_alert", "must be > 0"));
        }
        if p.window < 3 {
            return Err(ConfigError::invalid("poll.window", "must be at least 3"));
        }

        self.thresholds.validate(p.window)?;
        self.weights.validate()?;

        let s = &self.sources;
        if s.order.is_empty() {
            return Err(ConfigError::invalid("sources.order", "must name at least one source"));
        }
        let mut seen = HashSet::new();
        for id in &s.order {
            if !seen.insert(*id) {
                return Err(ConfigError::invalid(
                    "sources.order",
                    format!("`{id}` listed more than once"),
                ));
            }
        }
        let valid_addr = |a: u8| (0x03..=0x77).contains(&a);
        if !valid_addr(s.fuel_gauge_address) {
            return Err(ConfigError::invalid(
                "sources.fuel_gauge_address",
                "not a 7-bit I2C address",
            ));
        }
        if s.current_sensor_addresses.is_empty()
            || !s.current_sensor_addresses.iter().all(|&a| valid_addr(a))
        {
            return Err(ConfigError::invalid(
                "sources.current_sensor_addresses",
                "must be a non-empty list of 7-bit I2C addresses",
            ));
        }
        if s.cells_in_series == 0 {
            return Err(ConfigError::invalid("sources.cells_in_series", "must be > 0"));
        }
        if !(s.shunt_ohms.is_finite() && s.shunt_ohms > 0.0) {
            return Err(ConfigError::invalid("sources.shunt_ohms", "must be > 0"));
        }
        if !(s.capacity_mah.is_finite() && s.capacity_mah > 0.0) {
            return Err(ConfigError::invalid("sources.capacity_mah", "must be > 0"));
        }

        let g = &self.gpio;
        if g.power_present_level > 1 || g.charging_level > 1 {
            return Err(ConfigError::invalid("gpio", "line levels must be 0 or 1"));
        }

        let a = &self.alerts;
        if let Some(url) = &a.webhook_url {
            check_url("alerts.webhook_url", url)?;
        }
        if a.initial_backoff_ms == 0 || a.max_backoff_ms < a.initial_backoff_ms {
            return Err(ConfigError::invalid(
                "alerts.max_backoff_ms",
                "backoff must be > 0 and max >= initial",
            ));
        }
        if a.cooldown_secs > MAX_COOLDOWN_SECS {
            return Err(ConfigError::invalid(
                "alerts.cooldown_secs",
                format!("must be at most {MAX_COOLDOWN_SECS}"),
            ));
        }

        let r = &self.recorder;
        if r.retention_hours == 0 || r.retention_hours > MAX_RETENTION_HOURS {
            return Err(ConfigError::invalid(
                "recorder.retention_hours",
                format!("must be between 1 and {MAX_RETENTION_HOURS}"),
            ));
        }
        if r.write_retries == 0 {
            return Err(ConfigError::invalid("recorder.write_retries", "must be > 0"));
        }

        let h = &self.heartbeat;
        for url in &h.servers {
            check_url("heartbeat.servers", url)?;
        }
        if h.interval_secs == 0 {
            return Err(ConfigError::invalid("heartbeat.interval_secs", "must be > 0"));
        }

        Ok(())
    }
}

fn check_url(field: &'static str, url: &str) -> Result<(), ConfigError> {
    if url.starts_with("http://") || url.starts_with("https://") {
        Ok(())
    } else {
        Err(ConfigError::invalid(field, format!("`{url}` is not an http(s) URL")))
    }
}

// ---------------------------------------------------------------------------
// Sections
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PollConfig {
    /// Seconds between ticks.
    pub interval_secs: u64,
    /// Deadline for one source's sample.
    pub sample_timeout_ms: u64,
    /// Deadline for one host-health collection.
    pub health_timeout_ms: u64,
    /// Consecutive missing ticks before "no telemetry" is raised.
    pub missing_ticks_alert: u32,
    /// Trailing readings the scorer looks at.
    pub window: usize,
}

impl Default for PollConfig {
    fn default() -> Self {
        Self {
            interval_secs: 5,
            sample_timeout_ms: 2000,
            health_timeout_ms: 3000,
            missing_ticks_alert: 3,
            window: 5,
        }
    }
}

impl PollConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_secs)
    }

    pub fn sample_timeout(&self) -> Duration {
        Duration::from_millis(self.sample_timeout_ms)
    }

    pub fn health_timeout(&self) -> Duration {
        Duration::from_millis(self.health_timeout_ms)
    }
}

/// Rule predicates and state-machine bands.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Thresholds {
    pub low_voltage_v: f64,
    /// Consecutive latest readings below `low_voltage_v` that count as sustained.
    pub low_voltage_ticks: usize,
    pub high_current_ma: f64,
    pub high_temp_c: f64,
    pub high_load: f64,
    /// Divide the 1-minute load by the core count before comparing.
    pub normalize_load_by_cores: bool,
    pub high_cpu_percent: f64,
    pub memory_percent: f64,
    /// Battery percent lost per minute that counts as a fast drain.
    pub drain_percent_per_min: f64,
    /// State of charge below which the battery is low.
    pub low_battery_percent: f64,
    /// State of charge below which the battery is critically low.
    pub critical_battery_percent: f64,
    pub warning_score: f64,
    pub critical_score: f64,
    /// Consecutive ticks at or above `warning_score` to leave Normal.
    pub warning_ticks: u32,
    /// Consecutive ticks below a band to step down out of it.
    pub recovery_ticks: u32,
}

impl Default for Thresholds {
    fn default() -> Self {
        Self {
            low_voltage_v: 10.5,
            low_voltage_ticks: 3,
            high_current_ma: 4000.0,
            high_temp_c: 80.0,
            high_load: 8.0,
            normalize_load_by_cores: false,
            high_cpu_percent: 95.0,
            memory_percent: 95.0,
            drain_percent_per_min: 2.0,
            low_battery_percent: 20.0,
            critical_battery_percent: 10.0,
            warning_score: 40.0,
            critical_score: 70.0,
            warning_ticks: 2,
            recovery_ticks: 3,
        }
    }
}

impl Thresholds {
    /// Check internal consistency against a trailing window of `window` readings.
    pub fn validate(&self, window: usize) -> Result<(), ConfigError> {
        let in_band = |v: f64| v.is_finite() && (0.0..=100.0).contains(&v);
        if !in_band(self.warning_score) || !in_band(self.critical_score) {
            return Err(ConfigError::invalid("thresholds", "scores must be within 0-100"));
        }
        if self.warning_score >= self.critical_score {
            return Err(ConfigError::invalid(
                "thresholds.warning_score",
                "must be below critical_score",
            ));
        }
        if self.low_voltage_ticks == 0 || self.low_voltage_ticks > window {
            return Err(ConfigError::invalid(
                "thresholds.low_voltage_ticks",
                format!("must be between 1 and the window ({window})"),
            ));
        }
        if self.warning_ticks == 0 || self.recovery_ticks == 0 {
            return Err(ConfigError::invalid(
                "thresholds.recovery_ticks",
                "tick counts must be > 0",
            ));
        }
        let pct = |v: f64| v.is_finite() && (0.0..=100.0).contains(&v);
        if !pct(self.low_battery_percent)
            || !pct(self.critical_battery_percent)
            || self.critical_battery_percent >= self.low_battery_percent
        {
            return Err(ConfigError::invalid(
                "thresholds.critical_battery_percent",
                "battery levels must be within 0-100 with critical below low",
            ));
        }
        let finite = [
            self.low_voltage_v,
            self.high_current_ma,
            self.high_temp_c,
            self.high_load,
            self.high_cpu_percent,
            self.memory_percent,
            self.drain_percent_per_min,
        ];
        if finite.iter().any(|v| !v.is_finite()) {
            return Err(ConfigError::invalid("thresholds", "values must be finite"));
        }
        Ok(())
    }
}

/// Weight and cap of one risk rule.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct RuleWeight {
    pub weight: f64,
    pub cap: f64,
}

impl RuleWeight {
    pub const fn new(weight: f64, cap: f64) -> Self {
        Self { weight, cap }
    }
}

/// Per-rule weights. Each rule contributes `min(weight × units, cap)`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Weights {
    pub low_voltage: RuleWeight,
    pub high_current: RuleWeight,
    pub high_temperature: RuleWeight,
    pub high_load: RuleWeight,
    pub high_cpu: RuleWeight,
    pub memory_pressure: RuleWeight,
    pub log_errors: RuleWeight,
    pub kernel_panic: RuleWeight,
    pub battery_drain: RuleWeight,
    pub low_battery: RuleWeight,
    pub critical_battery: RuleWeight,
}

impl Default for Weights {
    fn default() -> Self {
        Self {
            low_voltage: RuleWeight::new(75.0, 75.0),
            high_current: RuleWeight::new(25.0, 25.0),
            high_temperature: RuleWeight::new(30.0, 30.0),
            high_load: RuleWeight::new(20.0, 20.0),
            high_cpu: RuleWeight::new(25.0, 25.0),
            memory_pressure: RuleWeight::new(20.0, 20.0),
            log_errors: RuleWeight::new(15.0, 45.0),
            kernel_panic: RuleWeight::new(50.0, 50.0),
            battery_drain: RuleWeight::new(25.0, 25.0),
            low_battery: RuleWeight::new(20.0, 20.0),
            critical_battery: RuleWeight::new(45.0, 45.0),
        }
    }
}

impl Weights {
    fn validate(&self) -> Result<(), ConfigError> {
        let all = [
            self.low_voltage,
            self.high_current,
            self.high_temperature,
            self.high_load,
            self.high_cpu,
            self.memory_pressure,
            self.log_errors,
            self.kernel_panic,
            self.battery_drain,
            self.low_battery,
            self.critical_battery,
        ];
        for w in all {
            if !(w.weight.is_finite() && w.cap.is_finite() && w.weight >= 0.0 && w.cap >= 0.0) {
                return Err(ConfigError::invalid(
                    "weights",
                    "weights and caps must be finite and non-negative",
                ));
            }
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AlertConfig {
    /// Minimum seconds between two events with the same fingerprint.
    pub cooldown_secs: u64,
    /// Push-notification endpoint. `None` logs alerts instead.
    pub webhook_url: Option<String>,
    /// Retries after the first failed delivery attempt.
    pub max_retries: u32,
    pub initial_backoff_ms: u64,
    pub max_backoff_ms: u64,
    pub request_timeout_secs: u64,
}

impl Default for AlertConfig {
    fn default() -> Self {
        Self {
            cooldown_secs: 1800,
            webhook_url: None,
            max_retries: 3,
            initial_backoff_ms: 500,
            max_backoff_ms: 30_000,
            request_timeout_secs: 10,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RecorderConfig {
    /// Holds `readings.csv`, `alerts.jsonl` and `status.json`.
    pub data_dir: PathBuf,
    pub retention_hours: u64,
    /// Attempts per row before it is counted as lost.
    pub write_retries: u32,
    pub write_backoff_ms: u64,
    /// Run retention pruning every this many ticks.
    pub prune_every_ticks: u64,
}

impl Default for RecorderConfig {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from("/var/lib/upsentinel"),
            retention_hours: 168,
            write_retries: 3,
            write_backoff_ms: 50,
            prune_every_ticks: 720,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SourcesConfig {
    /// Fallback order; the first valid reading each tick wins.
    pub order: Vec<SourceId>,
    /// I2C bus numbers, tried in order.
    pub i2c_buses: Vec<u8>,
    pub fuel_gauge_address: u8,
    pub current_sensor_addresses: Vec<u8>,
    /// Cells the fuel gauge's single-cell voltage is multiplied by.
    pub cells_in_series: u32,
    pub shunt_ohms: f64,
    /// Pack capacity, used to estimate current from state-of-charge changes
    /// when no current sensor answers.
    pub capacity_mah: f64,
    pub power_supply_root: PathBuf,
}

impl Default for SourcesConfig {
    fn default() -> Self {
        Self {
            order: SourceId::ALL.to_vec(),
            i2c_buses: vec![1, 11, 4],
            fuel_gauge_address: 0x36,
            current_sensor_addresses: (0x40..=0x45).collect(),
            cells_in_series: 3,
            shunt_ohms: 0.1,
            capacity_mah: 5000.0,
            power_supply_root: PathBuf::from("/sys/class/power_supply"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct GpioConfig {
    pub enabled: bool,
    /// Chip passed to `gpioget` when sysfs is unavailable.
    pub chip: String,
    pub power_loss_pin: u32,
    /// Line level meaning "external power present".
    pub power_present_level: u8,
    pub charging_pin: u32,
    /// Line level meaning "charging".
    pub charging_level: u8,
    pub sysfs_root: PathBuf,
    pub thermal_path: PathBuf,
    pub timeout_ms: u64,
}

impl Default for GpioConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            chip: "gpiochip0".into(),
            power_loss_pin: 6,
            power_present_level: 1,
            charging_pin: 16,
            charging_level: 0,
            sysfs_root: PathBuf::from("/sys/class/gpio"),
            thermal_path: PathBuf::from("/sys/class/thermal/thermal_zone0/temp"),
            timeout_ms: 500,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct HeartbeatConfig {
    /// Bypass servers in priority order. Empty disables the heartbeat.
    pub servers: Vec<String>,
    pub interval_secs: u64,
    /// Defaults to the hostname.
    pub unit_id: Option<String>,
    pub auth_key: Option<String>,
    pub timeout_secs: u64,
}

impl Default for HeartbeatConfig {
    fn default() -> Self {
        Self {
            servers: Vec::new(),
            interval_secs: 60,
            unit_id: None,
            auth_key: None,
            timeout_secs: 10,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LogScanConfig {
    /// Syslog files, first readable one wins.
    pub syslog_paths: Vec<PathBuf>,
    /// Only lines newer than this count.
    pub window_secs: u64,
    /// Bytes read from the end of the log.
    pub tail_bytes: u64,
    /// Also scan the kernel ring buffer via `dmesg`.
    pub scan_kernel: bool,
}

impl Default for LogScanConfig {
    fn default() -> Self {
        Self {
            syslog_paths: vec![
                PathBuf::from("/var/log/syslog"),
                PathBuf::from("/var/log/messages"),
            ],
            window_secs: 300,
            tail_bytes: 256 * 1024,
            scan_kernel: true,
        }
    }
}
