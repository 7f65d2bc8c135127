//! Liveness beacon to bypass servers.
//!
//! Runs on its own thread with its own interval and only reads the shared
//! [`StatusSnapshot`]. Each beat walks the servers in priority order and
//! posts to every one of them; per-server counters are kept for the status
//! display.

use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError, RwLock};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use log::{debug, info, warn};
use serde::{Deserialize, Serialize};
use sysinfo::System;

use crate::config::HeartbeatConfig;
use crate::error::DeliveryError;
use crate::reading::PowerSource;
use crate::risk::RiskState;
use crate::status::StatusSnapshot;

pub const UNIT_ID_HEADER: &str = "X-UPS-Unit-ID";
pub const AUTH_KEY_HEADER: &str = "X-UPS-Auth-Key";

/// Body of one heartbeat.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HeartbeatPayload {
    pub unit_id: String,
    pub timestamp: DateTime<Utc>,
    pub health_type: String,
    pub version: String,
    pub risk_state: Option<RiskState>,
    pub risk_score: Option<f64>,
    pub battery_voltage: Option<f64>,
    pub battery_percentage: Option<f64>,
    pub external_power: Option<bool>,
    pub estimated_runtime_minutes: Option<f64>,
    pub cpu_percent: Option<f64>,
    pub cpu_temp: Option<f64>,
    pub memory_percent: Option<f64>,
    pub load_avg: Option<[f64; 3]>,
    pub uptime_seconds: Option<u64>,
}

impl HeartbeatPayload {
    pub fn from_snapshot(snap: &StatusSnapshot, unit_id: &str, now: DateTime<Utc>) -> Self {
        let latest = snap.latest.as_ref();
        Self {
            unit_id: unit_id.to_string(),
            timestamp: now,
            health_type: "heartbeat".into(),
            version: crate::VERSION.to_string(),
            risk_state: snap.assessment.as_ref().map(|a| a.state),
            risk_score: snap.assessment.as_ref().map(|a| a.score),
            battery_voltage: latest.and_then(|r| r.voltage_v),
            battery_percentage: latest.and_then(|r| r.battery_percent),
            external_power: latest.and_then(|r| match r.power_source {
                PowerSource::External => Some(true),
                PowerSource::Battery => Some(false),
                PowerSource::Unknown => None,
            }),
            estimated_runtime_minutes: snap.estimated_runtime_min,
            cpu_percent: snap.health.cpu_percent,
            cpu_temp: snap.health.cpu_temp_c,
            memory_percent: snap.health.memory_percent,
            load_avg: snap.health.load_avg,
            uptime_seconds: snap.health.uptime_secs,
        }
    }
}

/// Where heartbeats go.
pub trait BeaconSink: Send + Sync {
    fn send(&self, server: &str, payload: &HeartbeatPayload) -> Result<(), DeliveryError>;
}

/// POSTs to `<server>/api/ups/health` with the unit headers.
pub struct HttpBeaconSink {
    client: reqwest::blocking::Client,
    unit_id: String,
    auth_key: Option<String>,
}

impl HttpBeaconSink {
    pub fn new(unit_id: String, auth_key: Option<String>, timeout: Duration) -> Result<Self, DeliveryError> {
        let client = reqwest::blocking::Client::builder()
            .timeout(timeout)
            .user_agent(concat!("upsentinel/", env!("CARGO_PKG_VERSION")))
            .build()?;
        Ok(Self {
            client,
            unit_id,
            auth_key,
        })
    }
}

impl BeaconSink for HttpBeaconSink {
    fn send(&self, server: &str, payload: &HeartbeatPayload) -> Result<(), DeliveryError> {
        let url = format!("{}/api/ups/health", server.trim_end_matches('/'));
        let mut req = self
            .client
            .post(url)
            .header(UNIT_ID_HEADER, &self.unit_id)
            .json(payload);
        if let Some(key) = &self.auth_key {
            req = req.header(AUTH_KEY_HEADER, key);
        }
        let resp = req.send()?;
        if resp.status().is_success() {
            Ok(())
        } else {
            Err(DeliveryError::Status(resp.status().as_u16()))
        }
    }
}

/// Per-server delivery counters.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ServerStats {
    pub url: String,
    pub successes: u64,
    pub failures: u64,
    pub last_success: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
    pub last_response_ms: Option<u64>,
}

/// Sends heartbeats to every configured server.
pub struct HeartbeatReporter {
    servers: Vec<String>,
    unit_id: String,
    sink: Arc<dyn BeaconSink>,
    stats: Mutex<Vec<ServerStats>>,
}

impl HeartbeatReporter {
    pub fn new(servers: Vec<String>, unit_id: String, sink: Arc<dyn BeaconSink>) -> Self {
        let stats = servers
            .iter()
            .map(|url| ServerStats {
                url: url.clone(),
                ..Default::default()
            })
            .collect();
        Self {
            servers,
            unit_id,
            sink,
            stats: Mutex::new(stats),
        }
    }

    /// HTTP reporter for a configuration. `None` when no servers are set.
    pub fn from_config(cfg: &HeartbeatConfig) -> Result<Option<Self>, DeliveryError> {
        if cfg.servers.is_empty() {
            return Ok(None);
        }
        let unit_id = cfg.unit_id.clone().unwrap_or_else(default_unit_id);
        let sink = HttpBeaconSink::new(
            unit_id.clone(),
            cfg.auth_key.clone(),
            Duration::from_secs(cfg.timeout_secs),
        )?;
        Ok(Some(Self::new(cfg.servers.clone(), unit_id, Arc::new(sink))))
    }

    pub fn unit_id(&self) -> &str {
        &self.unit_id
    }

    pub fn stats(&self) -> Vec<ServerStats> {
        self.stats.lock().unwrap_or_else(PoisonError::into_inner).clone()
    }

    /// Send one heartbeat to every server. Returns how many accepted it.
    pub fn beat(&self, snap: &StatusSnapshot, now: DateTime<Utc>) -> usize {
        let payload = HeartbeatPayload::from_snapshot(snap, &self.unit_id, now);
        let mut ok = 0;
        for (i, server) in self.servers.iter().enumerate() {
            let started = Instant::now();
            let result = self.sink.send(server, &payload);
            let elapsed_ms = started.elapsed().as_millis() as u64;
            let mut stats = self.stats.lock().unwrap_or_else(PoisonError::into_inner);
            let s = &mut stats[i];
            s.last_response_ms = Some(elapsed_ms);
            match result {
                Ok(()) => {
                    ok += 1;
                    s.successes += 1;
                    s.last_success = Some(now);
                    s.last_error = None;
                }
                Err(e) => {
                    debug!("heartbeat to {server} failed: {e}");
                    s.failures += 1;
                    s.last_error = Some(e.to_string());
                }
            }
        }
        if ok > 0 {
            debug!("heartbeat sent to {ok}/{} servers", self.servers.len());
        } else {
            warn!("heartbeat failed for all {} servers", self.servers.len());
        }
        ok
    }

    /// Run [`beat`](Self::beat) every `interval` on a new thread until
    /// [`HeartbeatHandle::stop`] is called.
    pub fn spawn(
        self: Arc<Self>,
        status: Arc<RwLock<StatusSnapshot>>,
        interval: Duration,
    ) -> std::io::Result<HeartbeatHandle> {
        let stop = Arc::new(AtomicBool::new(false));
        let flag = Arc::clone(&stop);
        let handle = thread::Builder::new()
            .name("heartbeat".into())
            .spawn(move || {
                info!(
                    "heartbeat: {} server(s) every {interval:?} as {}",
                    self.servers.len(),
                    self.unit_id
                );
                let mut next = Instant::now();
                while !flag.load(Ordering::Relaxed) {
                    if Instant::now() >= next {
                        let snap = status.read().unwrap_or_else(PoisonError::into_inner).clone();
                        self.beat(&snap, Utc::now());
                        next = Instant::now() + interval;
                    }
                    thread::sleep(Duration::from_millis(200));
                }
            })?;
        Ok(HeartbeatHandle {
            stop,
            handle: Some(handle),
        })
    }
}

/// Stops the heartbeat thread.
pub struct HeartbeatHandle {
    stop: Arc<AtomicBool>,
    handle: Option<JoinHandle<()>>,
}

impl HeartbeatHandle {
    pub fn stop(mut self) {
        self.halt();
    }

    fn halt(&mut self) {
        self.stop.store(true, Ordering::Relaxed);
        if let Some(h) = self.handle.take() {
            let _ = h.join();
        }
    }
}

impl Drop for HeartbeatHandle {
    fn drop(&mut self) {
        self.halt();
    }
}

/// `ups_<hostname>_<last 6 of MAC>`, or `ups_<hostname>` without a NIC.
pub fn default_unit_id() -> String {
    let host = System::host_name().unwrap_or_else(|| "unknown".into());
    let mac = ["eth0", "wlan0", "wg0"]
        .iter()
        .find_map(|nic| mac_suffix(&Path::new("/sys/class/net").join(nic).join("address")));
    match mac {
        Some(m) => format!("ups_{host}_{m}"),
        None => format!("ups_{host}"),
    }
}

fn mac_suffix(path: &Path) -> Option<String> {
    let raw = std::fs::read_to_string(path).ok()?;
    let hex: String = raw.trim().chars().filter(|c| *c != ':').collect();
    if hex.len() < 6 || hex.chars().all(|c| c == '0') {
        return None;
    }
    Some(hex[hex.len() - 6..].to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::reading::{Reading, SourceId};

    /// Records calls; servers containing "down" fail.
    #[derive(Default)]
    struct Recording {
        calls: Mutex<Vec<String>>,
    }

    impl BeaconSink for Recording {
        fn send(&self, server: &str, _payload: &HeartbeatPayload) -> Result<(), DeliveryError> {
            self.calls.lock().unwrap().push(server.to_string());
            if server.contains("down") {
                Err(DeliveryError::Transport("connection refused".into()))
            } else {
                Ok(())
            }
        }
    }

    fn reporter(servers: &[&str]) -> (HeartbeatReporter, Arc<Recording>) {
        let sink = Arc::new(Recording::default());
        let r = HeartbeatReporter::new(
            servers.iter().map(|s| s.to_string()).collect(),
            "ups_test".into(),
            Arc::clone(&sink) as Arc<dyn BeaconSink>,
        );
        (r, sink)
    }

    // -----------------------------------------------------------------------
    // Payload tests
    // -----------------------------------------------------------------------

    #[test]
    fn test_payload_from_snapshot() {
        let mut r = Reading::new(SourceId::FuelGauge);
        r.voltage_v = Some(11.9);
        r.battery_percent = Some(77.0);
        r.power_source = PowerSource::Battery;
        let snap = StatusSnapshot {
            latest: Some(r),
            estimated_runtime_min: Some(55.0),
            ..Default::default()
        };
        let p = HeartbeatPayload::from_snapshot(&snap, "ups_pi", Utc::now());
        assert_eq!(p.health_type, "heartbeat");
        assert_eq!(p.external_power, Some(false));
        assert_eq!(p.battery_voltage, Some(11.9));
        assert_eq!(p.estimated_runtime_minutes, Some(55.0));
        assert!(p.risk_state.is_none());
    }

    // -----------------------------------------------------------------------
    // Reporter tests
    // -----------------------------------------------------------------------

    #[test]
    fn test_beat_priority_order_and_counters() {
        let (r, sink) = reporter(&["http://a", "http://down", "http://c"]);
        let ok = r.beat(&StatusSnapshot::default(), Utc::now());
        assert_eq!(ok, 2);
        assert_eq!(
            *sink.calls.lock().unwrap(),
            vec!["http://a", "http://down", "http://c"]
        );
        r.beat(&StatusSnapshot::default(), Utc::now());
        let stats = r.stats();
        assert_eq!(stats[0].successes, 2);
        assert_eq!(stats[1].failures, 2);
        assert!(stats[1].last_error.as_deref().unwrap().contains("refused"));
        assert!(stats[2].last_success.is_some());
    }

    #[test]
    fn test_spawned_thread_beats_and_stops() {
        let (r, sink) = reporter(&["http://a"]);
        let status = Arc::new(RwLock::new(StatusSnapshot::default()));
        let handle = Arc::new(r)
            .spawn(status, Duration::from_secs(3600))
            .unwrap();
        thread::sleep(Duration::from_millis(300));
        handle.stop();
        assert_eq!(sink.calls.lock().unwrap().len(), 1);
    }

    #[test]
    fn test_from_config_disabled_without_servers() {
        let cfg = HeartbeatConfig::default();
        assert!(HeartbeatReporter::from_config(&cfg).unwrap().is_none());
    }

    #[test]
    fn test_mac_suffix() {
        let tmp = tempfile::tempdir().unwrap();
        let p = tmp.path().join("address");
        std::fs::write(&p, "dc:a6:32:12:34:56\n").unwrap();
        assert_eq!(mac_suffix(&p).as_deref(), Some("123456"));
        std::fs::write(&p, "00:00:00:00:00:00\n").unwrap();
        assert!(mac_suffix(&p).is_none());
    }

    #[test]
    fn test_default_unit_id_prefix() {
        assert!(default_unit_id().starts_with("ups_"));
    }
}
