//! HostStatsSource: power-supply class devices exposed by the kernel.
//!
//! Used when neither I2C device answers. Reads the first `Battery` entry under
//! `/sys/class/power_supply` and the `online` flag of `Mains`/`USB` entries.

use std::path::{Path, PathBuf};

use log::debug;

use crate::error::SensorUnavailable;
use crate::reading::{ChargeState, PowerSource, Reading, SourceId, clamp_percent};
use crate::source::{SensorSource, SourceInfo, Transport};

use super::helpers::{read_i64, read_trimmed};

pub struct HostStatsSource {
    info: SourceInfo,
    root: PathBuf,
}

impl HostStatsSource {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            info: SourceInfo {
                id: SourceId::HostStats,
                description: "Kernel power_supply class: battery voltage/current/capacity, mains online",
                measures: "voltage_now (uV), current_now (uA), capacity (%) and status of the \
                    first Battery supply; online flag of Mains/USB supplies.",
                transport: Transport::Host,
                addresses: &[],
            },
            root: root.into(),
        }
    }

    /// Supply directories grouped by their `type` attribute.
    fn supplies(&self) -> std::io::Result<Vec<(String, PathBuf)>> {
        let mut out = Vec::new();
        for entry in std::fs::read_dir(&self.root)? {
            let path = entry?.path();
            if let Some(kind) = read_trimmed(&path.join("type")) {
                out.push((kind, path));
            }
        }
        out.sort_by(|a, b| a.1.cmp(&b.1));
        Ok(out)
    }
}

fn read_battery(dir: &Path, r: &mut Reading) -> bool {
    let mut any = false;
    if let Some(uv) = read_i64(&dir.join("voltage_now")) {
        r.voltage_v = Some(uv as f64 / 1_000_000.0);
        any = true;
    }
    if let Some(cap) = read_i64(&dir.join("capacity")) {
        r.battery_percent = Some(clamp_percent(cap as f64));
        any = true;
    }
    let status = read_trimmed(&dir.join("status"));
    if let Some(ua) = read_i64(&dir.join("current_now")) {
        let mut ma = ua as f64 / 1000.0;
        // Some drivers report magnitude only.
        if status.as_deref() == Some("Discharging") && ma > 0.0 {
            ma = -ma;
        }
        r.current_ma = Some(ma);
        if let Some(v) = r.voltage_v {
            r.power_mw = Some(v * ma);
        }
        any = true;
    }
    if let Some(s) = status {
        r.charging = match s.as_str() {
            "Charging" => ChargeState::Charging,
            "Discharging" | "Not charging" | "Full" => ChargeState::NotCharging,
            _ => ChargeState::Unknown,
        };
        if s == "Discharging" {
            r.power_source = PowerSource::Battery;
        }
        any = true;
    }
    any
}

impl SensorSource for HostStatsSource {
    fn info(&self) -> &SourceInfo {
        &self.info
    }

    fn sample(&self) -> Result<Reading, SensorUnavailable> {
        let supplies = self.supplies()?;
        let mut r = Reading::new(SourceId::HostStats);
        let mut any = false;

        if let Some((_, dir)) = supplies.iter().find(|(kind, _)| kind == "Battery") {
            any |= read_battery(dir, &mut r);
        }

        let online: Vec<i64> = supplies
            .iter()
            .filter(|(kind, _)| kind == "Mains" || kind == "USB")
            .filter_map(|(_, dir)| read_i64(&dir.join("online")))
            .collect();
        if !online.is_empty() {
            r.power_source = if online.iter().any(|&o| o == 1) {
                PowerSource::External
            } else {
                PowerSource::Battery
            };
            any = true;
        }

        if !any {
            debug!("host stats: nothing readable under {}", self.root.display());
            return Err(SensorUnavailable::NotDetected(format!(
                "no power supply under {}",
                self.root.display()
            )));
        }
        Ok(r)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn supply(root: &Path, name: &str, attrs: &[(&str, &str)]) {
        let dir = root.join(name);
        std::fs::create_dir_all(&dir).unwrap();
        for (k, v) in attrs {
            std::fs::write(dir.join(k), format!("{v}\n")).unwrap();
        }
    }

    #[test]
    fn test_battery_and_mains() {
        let tmp = tempfile::tempdir().unwrap();
        supply(
            tmp.path(),
            "BAT0",
            &[
                ("type", "Battery"),
                ("voltage_now", "11400000"),
                ("current_now", "850000"),
                ("capacity", "64"),
                ("status", "Discharging"),
            ],
        );
        supply(tmp.path(), "AC", &[("type", "Mains"), ("online", "0")]);

        let r = HostStatsSource::new(tmp.path()).sample().unwrap();
        assert_eq!(r.source, SourceId::HostStats);
        assert!((r.voltage_v.unwrap() - 11.4).abs() < 1e-9);
        assert!((r.current_ma.unwrap() + 850.0).abs() < 1e-9);
        assert_eq!(r.battery_percent, Some(64.0));
        assert_eq!(r.power_source, PowerSource::Battery);
        assert_eq!(r.charging, ChargeState::NotCharging);
        assert!(r.valid);
    }

    #[test]
    fn test_mains_only() {
        let tmp = tempfile::tempdir().unwrap();
        supply(tmp.path(), "usb", &[("type", "USB"), ("online", "1")]);
        let r = HostStatsSource::new(tmp.path()).sample().unwrap();
        assert_eq!(r.power_source, PowerSource::External);
        assert!(r.voltage_v.is_none());
    }

    #[test]
    fn test_charging_status() {
        let tmp = tempfile::tempdir().unwrap();
        supply(
            tmp.path(),
            "battery",
            &[("type", "Battery"), ("status", "Charging"), ("capacity", "101")],
        );
        let r = HostStatsSource::new(tmp.path()).sample().unwrap();
        assert_eq!(r.charging, ChargeState::Charging);
        assert_eq!(r.battery_percent, Some(100.0));
    }

    #[test]
    fn test_empty_root_not_detected() {
        let tmp = tempfile::tempdir().unwrap();
        let err = HostStatsSource::new(tmp.path()).sample().unwrap_err();
        assert!(matches!(err, SensorUnavailable::NotDetected(_)));
    }

    #[test]
    fn test_missing_root_is_io() {
        let err = HostStatsSource::new("/nonexistent/power_supply").sample().unwrap_err();
        assert!(matches!(err, SensorUnavailable::Io(_)));
    }
}
