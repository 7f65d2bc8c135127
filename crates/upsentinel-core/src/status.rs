//! Point-in-time status snapshot shared with the heartbeat thread and
//! persisted as `status.json` for out-of-process readers.

use std::collections::BTreeMap;
use std::fs;
use std::io::{self, Write};
use std::path::Path;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::health::HostHealthSample;
use crate::heartbeat::ServerStats;
use crate::reading::{Reading, SourceId};
use crate::risk::RiskAssessment;
use crate::selector::HealthReport;

pub const STATUS_FILE: &str = "status.json";

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StatusSnapshot {
    pub updated_at: Option<DateTime<Utc>>,
    pub ticks: u64,
    pub latest: Option<Reading>,
    pub active_source: Option<SourceId>,
    pub assessment: Option<RiskAssessment>,
    #[serde(default)]
    pub health: HostHealthSample,
    #[serde(default)]
    pub sources: HealthReport,
    pub missing_streak: u32,
    pub on_battery_since: Option<DateTime<Utc>>,
    /// Percent per minute, positive while discharging.
    pub drain_percent_per_min: Option<f64>,
    /// Battery current derived from the charge trend when the winning source
    /// doesn't measure current. Negative while discharging.
    #[serde(default)]
    pub estimated_current_ma: Option<f64>,
    pub estimated_runtime_min: Option<f64>,
    pub readings_written: u64,
    pub readings_lost: u64,
    /// Pending suppressed occurrences per fingerprint.
    #[serde(default)]
    pub suppressed: BTreeMap<String, u64>,
    #[serde(default)]
    pub heartbeat: Vec<ServerStats>,
}

impl StatusSnapshot {
    /// Write `status.json` into `dir` via a temporary file and rename.
    pub fn persist(&self, dir: &Path) -> io::Result<()> {
        let json = serde_json::to_vec_pretty(self).map_err(io::Error::other)?;
        let tmp = dir.join(format!("{STATUS_FILE}.tmp"));
        {
            let mut f = fs::File::create(&tmp)?;
            f.write_all(&json)?;
            f.write_all(b"\n")?;
            f.sync_all()?;
        }
        fs::rename(&tmp, dir.join(STATUS_FILE))
    }

    /// Load `status.json` from `dir`. `Ok(None)` if the daemon never wrote one.
    pub fn load(dir: &Path) -> io::Result<Option<Self>> {
        let text = match fs::read_to_string(dir.join(STATUS_FILE)) {
            Ok(t) => t,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e),
        };
        serde_json::from_str(&text)
            .map(Some)
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))
    }
}

/// Minutes until empty at the current drain rate.
pub fn estimate_runtime_min(battery_percent: Option<f64>, drain_per_min: Option<f64>) -> Option<f64> {
    let pct = battery_percent?;
    let drain = drain_per_min.filter(|d| *d > 0.0)?;
    Some(pct / drain)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_persist_and_load() {
        let tmp = tempfile::tempdir().unwrap();
        assert!(StatusSnapshot::load(tmp.path()).unwrap().is_none());

        let mut snap = StatusSnapshot {
            ticks: 7,
            missing_streak: 1,
            estimated_runtime_min: Some(42.0),
            ..Default::default()
        };
        snap.suppressed.insert("high_cpu:warning".into(), 2);
        snap.persist(tmp.path()).unwrap();

        let back = StatusSnapshot::load(tmp.path()).unwrap().unwrap();
        assert_eq!(back, snap);
        assert!(!tmp.path().join("status.json.tmp").exists());
    }

    #[test]
    fn test_load_rejects_garbage() {
        let tmp = tempfile::tempdir().unwrap();
        fs::write(tmp.path().join(STATUS_FILE), "not json").unwrap();
        let err = StatusSnapshot::load(tmp.path()).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::InvalidData);
    }

    #[test]
    fn test_runtime_estimate() {
        assert_eq!(estimate_runtime_min(Some(60.0), Some(2.0)), Some(30.0));
        assert_eq!(estimate_runtime_min(Some(60.0), Some(-1.0)), None);
        assert_eq!(estimate_runtime_min(Some(60.0), Some(0.0)), None);
        assert_eq!(estimate_runtime_min(None, Some(2.0)), None);
    }
}
