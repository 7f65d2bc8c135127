//! Alert dispatch: fingerprints, cooldown, resolution notices and history.
//!
//! The dispatcher decides *whether* to alert. Delivery happens elsewhere
//! ([`notify`](crate::notify)) and reports back through [`AlertHistory`].

use std::collections::{HashMap, HashSet};
use std::fs::{File, OpenOptions};
use std::io::{self, BufRead, BufReader, Write};
use std::path::{Path, PathBuf};
use std::sync::{Mutex, PoisonError, RwLock};

use chrono::{DateTime, Utc};
use log::{debug, info, warn};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::reading::{ChargeState, PowerSource, Reading};
use crate::risk::{FactorKind, RiskAssessment, RiskFactor, RiskState, Transition};

pub const ALERTS_FILE: &str = "alerts.jsonl";

/// Metric of the overall state fingerprint family.
pub const RISK_STATE_METRIC: &str = "risk_state";
pub const NO_TELEMETRY_METRIC: &str = "no_telemetry";
pub const POWER_SOURCE_METRIC: &str = "power_source";
pub const CHARGING_STARTED_METRIC: &str = "charging_started";
pub const CHARGING_STOPPED_METRIC: &str = "charging_stopped";

// ---------------------------------------------------------------------------
// Event model
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    Info,
    Warning,
    Critical,
}

impl Severity {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Info => "info",
            Self::Warning => "warning",
            Self::Critical => "critical",
        }
    }
}

impl std::fmt::Display for Severity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Severity band of a fingerprint.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Band {
    Info,
    Warning,
    Critical,
    Resolved,
}

impl Band {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Info => "info",
            Self::Warning => "warning",
            Self::Critical => "critical",
            Self::Resolved => "resolved",
        }
    }

    pub fn severity(self) -> Severity {
        match self {
            Self::Warning => Severity::Warning,
            Self::Critical => Severity::Critical,
            Self::Info | Self::Resolved => Severity::Info,
        }
    }
}

/// Dedup key: (metric kind, severity band), rendered `metric:band`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Fingerprint {
    pub metric: String,
    pub band: Band,
}

impl Fingerprint {
    pub fn new(metric: impl Into<String>, band: Band) -> Self {
        Self {
            metric: metric.into(),
            band,
        }
    }
}

impl std::fmt::Display for Fingerprint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.metric, self.band.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeliveryStatus {
    Pending,
    Sent,
    Failed,
}

impl std::fmt::Display for DeliveryStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            Self::Pending => "pending",
            Self::Sent => "sent",
            Self::Failed => "failed",
        })
    }
}

/// One emitted alert.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AlertEvent {
    pub id: Uuid,
    pub timestamp: DateTime<Utc>,
    pub severity: Severity,
    pub fingerprint: Fingerprint,
    pub message: String,
    pub status: DeliveryStatus,
    #[serde(default)]
    pub acknowledged: bool,
    #[serde(default)]
    pub attempts: u32,
    /// Occurrences of this fingerprint suppressed since the previous event.
    #[serde(default)]
    pub suppressed_before: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
}

// ---------------------------------------------------------------------------
// Dispatcher
// ---------------------------------------------------------------------------

/// Decides which conditions become alerts.
pub struct AlertDispatcher {
    cooldown: chrono::Duration,
    last_emitted: HashMap<Fingerprint, DateTime<Utc>>,
    suppressed: HashMap<Fingerprint, u64>,
    active_factors: HashSet<FactorKind>,
    power: PowerSource,
    charging: ChargeState,
    on_battery_since: Option<DateTime<Utc>>,
}

impl AlertDispatcher {
    /// A cooldown too long to represent saturates rather than disabling dedup.
    pub fn new(cooldown: std::time::Duration) -> Self {
        Self {
            cooldown: chrono::Duration::from_std(cooldown).unwrap_or(chrono::Duration::MAX),
            last_emitted: HashMap::new(),
            suppressed: HashMap::new(),
            active_factors: HashSet::new(),
            power: PowerSource::Unknown,
            charging: ChargeState::Unknown,
            on_battery_since: None,
        }
    }

    /// Occurrences of `fp` suppressed since it last fired.
    pub fn suppressed_count(&self, fp: &Fingerprint) -> u64 {
        self.suppressed.get(fp).copied().unwrap_or(0)
    }

    /// All pending suppressed counts, keyed by rendered fingerprint.
    pub fn suppressed_counts(&self) -> HashMap<String, u64> {
        self.suppressed
            .iter()
            .map(|(fp, n)| (fp.to_string(), *n))
            .collect()
    }

    /// Time the board switched to battery, if it's on battery now.
    pub fn on_battery_since(&self) -> Option<DateTime<Utc>> {
        self.on_battery_since
    }

    /// Emit `fp` unless it fired within the cooldown.
    pub fn emit(
        &mut self,
        fp: Fingerprint,
        message: String,
        now: DateTime<Utc>,
    ) -> Option<AlertEvent> {
        let cooling = self
            .last_emitted
            .get(&fp)
            .is_some_and(|&last| now - last < self.cooldown);
        if cooling {
            let n = self.suppressed.entry(fp.clone()).or_insert(0);
            *n += 1;
            debug!("alert {fp} suppressed ({n} in cooldown)");
            return None;
        }
        let suppressed_before = self.suppressed.remove(&fp).unwrap_or(0);
        self.last_emitted.insert(fp.clone(), now);
        info!("alert {fp}: {message}");
        Some(AlertEvent {
            id: Uuid::new_v4(),
            timestamp: now,
            severity: fp.band.severity(),
            fingerprint: fp,
            message,
            status: DeliveryStatus::Pending,
            acknowledged: false,
            attempts: 0,
            suppressed_before,
            last_error: None,
        })
    }

    /// Forget cooldowns for every fingerprint of `metric`.
    pub fn clear_family(&mut self, metric: &str) {
        self.last_emitted.retain(|fp, _| fp.metric != metric);
    }

    /// Alerts for a risk-state change.
    pub fn on_transition(
        &mut self,
        tr: Transition,
        assessment: &RiskAssessment,
        now: DateTime<Utc>,
    ) -> Option<AlertEvent> {
        let (band, message) = match tr.to {
            RiskState::Warning => (
                Band::Warning,
                format!("Crash risk elevated: score {:.0} ({})", assessment.score, factor_list(assessment)),
            ),
            RiskState::Critical => (
                Band::Critical,
                format!("Crash risk CRITICAL: score {:.0} ({})", assessment.score, factor_list(assessment)),
            ),
            RiskState::Normal => (
                Band::Resolved,
                format!("Crash risk back to normal (was {}), score {:.0}", tr.from, assessment.score),
            ),
        };
        let event = self.emit(Fingerprint::new(RISK_STATE_METRIC, band), message, now);
        if tr.to == RiskState::Normal {
            self.clear_family(RISK_STATE_METRIC);
        }
        event
    }

    /// Alerts for factors that started firing this tick.
    pub fn on_factors(&mut self, assessment: &RiskAssessment, now: DateTime<Utc>) -> Vec<AlertEvent> {
        let current: HashSet<FactorKind> = assessment.factors.iter().map(|f| f.kind).collect();
        let mut out = Vec::new();
        for f in &assessment.factors {
            if self.active_factors.contains(&f.kind) {
                continue;
            }
            let band = if f.kind.is_critical() {
                Band::Critical
            } else {
                Band::Warning
            };
            let message = describe_factor(f);
            if let Some(e) = self.emit(Fingerprint::new(f.kind.metric(), band), message, now) {
                out.push(e);
            }
        }
        self.active_factors = current;
        out
    }

    /// "No telemetry" reached its threshold.
    pub fn on_no_telemetry(&mut self, missing_ticks: u32, now: DateTime<Utc>) -> Option<AlertEvent> {
        self.emit(
            Fingerprint::new(NO_TELEMETRY_METRIC, Band::Critical),
            format!("No telemetry from any sensor for {missing_ticks} consecutive polls"),
            now,
        )
    }

    /// Telemetry came back after "no telemetry".
    pub fn on_telemetry_restored(&mut self, source: &str, now: DateTime<Utc>) -> Option<AlertEvent> {
        let event = self.emit(
            Fingerprint::new(NO_TELEMETRY_METRIC, Band::Resolved),
            format!("Telemetry restored ({source})"),
            now,
        );
        self.clear_family(NO_TELEMETRY_METRIC);
        event
    }

    /// Power and charging notices for a new reading.
    pub fn on_reading(&mut self, reading: &Reading, now: DateTime<Utc>) -> Vec<AlertEvent> {
        let mut out = Vec::new();
        out.extend(self.on_power_source(reading, now));
        out.extend(self.on_charging(reading.charging, now));
        out
    }

    /// Power-loss and power-restored notices. `Unknown` never changes state.
    fn on_power_source(&mut self, reading: &Reading, now: DateTime<Utc>) -> Option<AlertEvent> {
        let next = reading.power_source;
        if next == PowerSource::Unknown || next == self.power {
            return None;
        }
        let prev = std::mem::replace(&mut self.power, next);
        match next {
            PowerSource::Battery => {
                self.on_battery_since = Some(now);
                let pct = reading
                    .battery_percent
                    .map(|p| format!(", battery at {p:.0}%"))
                    .unwrap_or_default();
                self.emit(
                    Fingerprint::new(POWER_SOURCE_METRIC, Band::Warning),
                    format!("External power lost, running on battery{pct}"),
                    now,
                )
            }
            PowerSource::External => {
                let since = self.on_battery_since.take();
                if prev != PowerSource::Battery {
                    return None;
                }
                let runtime = since
                    .map(|s| format!(" after {}", format_runtime(now - s)))
                    .unwrap_or_default();
                let event = self.emit(
                    Fingerprint::new(POWER_SOURCE_METRIC, Band::Resolved),
                    format!("External power restored{runtime}"),
                    now,
                );
                self.clear_family(POWER_SOURCE_METRIC);
                event
            }
            PowerSource::Unknown => None,
        }
    }

    /// Charging started / stopped. The first known state is a baseline and
    /// `Unknown` never changes state.
    fn on_charging(&mut self, next: ChargeState, now: DateTime<Utc>) -> Option<AlertEvent> {
        if next == ChargeState::Unknown || next == self.charging {
            return None;
        }
        let prev = std::mem::replace(&mut self.charging, next);
        if prev == ChargeState::Unknown {
            return None;
        }
        let (metric, message) = match next {
            ChargeState::Charging => (CHARGING_STARTED_METRIC, "Battery charging started"),
            _ => (CHARGING_STOPPED_METRIC, "Battery charging stopped"),
        };
        self.emit(Fingerprint::new(metric, Band::Info), message.into(), now)
    }
}

fn factor_list(a: &RiskAssessment) -> String {
    if a.factors.is_empty() {
        return "no active factors".into();
    }
    a.factors
        .iter()
        .map(|f| f.kind.as_str())
        .collect::<Vec<_>>()
        .join(", ")
}

fn describe_factor(f: &RiskFactor) -> String {
    let m = f.magnitude;
    match f.kind {
        FactorKind::SustainedLowVoltage => format!("Sustained low battery voltage: {m:.2} V"),
        FactorKind::HighCurrent if f.estimated => {
            format!("High discharge rate: ~{m:.0} mA (estimated from charge level)")
        }
        FactorKind::HighCurrent => format!("High current draw: {m:.0} mA"),
        FactorKind::HighTemperature => format!("High temperature: {m:.1} °C"),
        FactorKind::HighLoad => format!("High system load: {m:.2}"),
        FactorKind::HighCpu => format!("CPU saturated: {m:.0}%"),
        FactorKind::MemoryPressure => format!("Memory pressure: {m:.0}% used"),
        FactorKind::LogErrors => format!("{m:.0} error lines in recent system log"),
        FactorKind::KernelPanic => format!("Kernel crash pattern in recent messages ({m:.0})"),
        FactorKind::BatteryDrain => format!("Battery draining fast: {m:.1}%/min"),
        FactorKind::LowBattery => format!("Low battery: {m:.0}%"),
        FactorKind::CriticalBattery => format!("Battery critically low: {m:.0}%"),
    }
}

fn format_runtime(d: chrono::Duration) -> String {
    let secs = d.num_seconds().max(0);
    if secs >= 3600 {
        format!("{}h{:02}m", secs / 3600, (secs % 3600) / 60)
    } else if secs >= 60 {
        format!("{}m{:02}s", secs / 60, secs % 60)
    } else {
        format!("{secs}s")
    }
}

// ---------------------------------------------------------------------------
// History
// ---------------------------------------------------------------------------

/// Append-only alert log.
///
/// Every status change is appended as a new record with the same `id`;
/// loading folds records so the last one per id wins, keeping the position
/// of the first.
pub struct AlertHistory {
    path: PathBuf,
    file: Mutex<File>,
    events: RwLock<Vec<AlertEvent>>,
}

impl AlertHistory {
    /// Open (or create) `alerts.jsonl` in `dir`.
    pub fn open(dir: &Path) -> io::Result<Self> {
        std::fs::create_dir_all(dir)?;
        let path = dir.join(ALERTS_FILE);
        let events = Self::read(&path)?;
        let file = OpenOptions::new().create(true).append(true).open(&path)?;
        Ok(Self {
            path,
            file: Mutex::new(file),
            events: RwLock::new(events),
        })
    }

    /// Load and fold a history file without opening it for writing.
    pub fn read(path: &Path) -> io::Result<Vec<AlertEvent>> {
        let file = match File::open(path) {
            Ok(f) => f,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e),
        };
        let mut events: Vec<AlertEvent> = Vec::new();
        let mut index: HashMap<Uuid, usize> = HashMap::new();
        for line in BufReader::new(file).lines() {
            let line = line?;
            if line.trim().is_empty() {
                continue;
            }
            let Ok(event) = serde_json::from_str::<AlertEvent>(&line) else {
                debug!("alert history: skipping malformed record");
                continue;
            };
            match index.get(&event.id) {
                Some(&i) => events[i] = event,
                None => {
                    index.insert(event.id, events.len());
                    events.push(event);
                }
            }
        }
        Ok(events)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn write_record(&self, event: &AlertEvent) -> io::Result<()> {
        let mut line = serde_json::to_string(event).map_err(io::Error::other)?;
        line.push('\n');
        let mut f = self.file.lock().unwrap_or_else(PoisonError::into_inner);
        f.write_all(line.as_bytes())?;
        f.flush()
    }

    /// Record a new event.
    pub fn append(&self, event: &AlertEvent) -> io::Result<()> {
        self.events
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .push(event.clone());
        self.write_record(event)
    }

    /// Apply `f` to event `id` and persist the result. Returns the updated
    /// event, or `None` if the id is unknown.
    pub fn update(&self, id: Uuid, f: impl FnOnce(&mut AlertEvent)) -> io::Result<Option<AlertEvent>> {
        let updated = {
            let mut events = self.events.write().unwrap_or_else(PoisonError::into_inner);
            let Some(e) = events.iter_mut().find(|e| e.id == id) else {
                return Ok(None);
            };
            f(e);
            e.clone()
        };
        self.write_record(&updated)?;
        Ok(Some(updated))
    }

    /// Record the outcome of a delivery.
    pub fn record_delivery(
        &self,
        id: Uuid,
        status: DeliveryStatus,
        attempts: u32,
        error: Option<String>,
    ) -> io::Result<Option<AlertEvent>> {
        self.update(id, |e| {
            e.status = status;
            e.attempts = attempts;
            e.last_error = error;
        })
    }

    pub fn acknowledge(&self, id: Uuid) -> io::Result<Option<AlertEvent>> {
        self.update(id, |e| e.acknowledged = true)
    }

    /// The `n` most recent events, newest first.
    pub fn recent(&self, n: usize) -> Vec<AlertEvent> {
        let events = self.events.read().unwrap_or_else(PoisonError::into_inner);
        events.iter().rev().take(n).cloned().collect()
    }

    /// Events at or after `ts`, oldest first.
    pub fn since(&self, ts: DateTime<Utc>) -> Vec<AlertEvent> {
        let events = self.events.read().unwrap_or_else(PoisonError::into_inner);
        events.iter().filter(|e| e.timestamp >= ts).cloned().collect()
    }

    pub fn get(&self, id: Uuid) -> Option<AlertEvent> {
        let events = self.events.read().unwrap_or_else(PoisonError::into_inner);
        events.iter().find(|e| e.id == id).cloned()
    }

    pub fn len(&self) -> usize {
        self.events.read().unwrap_or_else(PoisonError::into_inner).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Append to history, logging rather than failing on I/O errors.
pub(crate) fn record_or_warn(history: &AlertHistory, event: &AlertEvent) {
    if let Err(e) = history.append(event) {
        warn!("alert history: cannot append {}: {e}", event.fingerprint);
    }
}
