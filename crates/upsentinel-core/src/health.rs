//! Host health sampling.
//!
//! CPU, memory, load and temperature come from `sysinfo` and the thermal zone;
//! error pressure comes from the tail of the syslog and the kernel ring
//! buffer. Every signal is optional: whatever cannot be read this tick is
//! `None` and its risk rule sits the tick out.

use std::io::{Read, Seek, SeekFrom};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::{DateTime, Datelike, Local, NaiveDateTime, TimeZone, Utc};
use log::debug;
use serde::{Deserialize, Serialize};
use sysinfo::System;

use crate::config::LogScanConfig;
use crate::sources::helpers::{read_thermal_c, run_command, run_with_timeout};

/// One host-health observation. Ephemeral.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct HostHealthSample {
    pub cpu_percent: Option<f64>,
    pub memory_percent: Option<f64>,
    /// 1, 5 and 15 minute load averages.
    pub load_avg: Option<[f64; 3]>,
    pub cores: Option<usize>,
    pub cpu_temp_c: Option<f64>,
    pub warning_lines: Option<u32>,
    pub error_lines: Option<u32>,
    pub critical_lines: Option<u32>,
    /// Kernel messages matching a crash pattern.
    pub kernel_panic_lines: Option<u32>,
    pub uptime_secs: Option<u64>,
}

// ---------------------------------------------------------------------------
// Log classification
// ---------------------------------------------------------------------------

/// Severity of a syslog line.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LineSeverity {
    Warning,
    Error,
    Critical,
}

const CRITICAL_KEYWORDS: &[&str] = &[
    "critical",
    "emergency",
    "alert",
    "segfault",
    "kernel panic",
    "oops",
    "crash",
];
const ERROR_KEYWORDS: &[&str] = &["error", "fail"];
const WARNING_KEYWORDS: &[&str] = &["warning", "bug"];

/// Patterns in kernel messages that precede or indicate a crash.
pub const KERNEL_CRASH_KEYWORDS: &[&str] = &[
    "segfault",
    "kernel panic",
    "oops",
    "hung task",
    "out of memory",
];

/// Classify a log line by keyword, most severe match first.
pub fn classify_line(line: &str) -> Option<LineSeverity> {
    let lower = line.to_lowercase();
    let has = |words: &[&str]| words.iter().any(|w| lower.contains(w));
    if has(CRITICAL_KEYWORDS) {
        Some(LineSeverity::Critical)
    } else if has(ERROR_KEYWORDS) {
        Some(LineSeverity::Error)
    } else if has(WARNING_KEYWORDS) {
        Some(LineSeverity::Warning)
    } else {
        None
    }
}

/// Line counts per severity.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct LogCounts {
    pub warning: u32,
    pub error: u32,
    pub critical: u32,
}

/// Timestamp at the start of a syslog line: RFC 3339 (`2026-10-17T08:00:01.5+02:00`)
/// or BSD (`Oct 17 08:00:01`, local time, year inferred from `now`).
pub fn line_timestamp(line: &str, now: DateTime<Local>) -> Option<DateTime<Utc>> {
    let first = line.split_whitespace().next()?;
    if let Ok(ts) = DateTime::parse_from_rfc3339(first) {
        return Some(ts.with_timezone(&Utc));
    }
    let prefix = line.get(..15)?;
    let with_year = |year: i32| {
        NaiveDateTime::parse_from_str(&format!("{year} {prefix}"), "%Y %b %e %H:%M:%S")
            .ok()
            .and_then(|n| Local.from_local_datetime(&n).single())
    };
    let ts = with_year(now.year())?;
    // A December line read in January belongs to last year.
    let ts = if ts > now + chrono::Duration::days(1) {
        with_year(now.year() - 1)?
    } else {
        ts
    };
    Some(ts.with_timezone(&Utc))
}

/// Count classified lines newer than `now - window`. Lines without a
/// parseable timestamp are ignored.
pub fn scan_syslog(text: &str, now: DateTime<Local>, window: Duration) -> LogCounts {
    let horizon = now.with_timezone(&Utc)
        - chrono::Duration::from_std(window).unwrap_or(chrono::Duration::zero());
    let mut counts = LogCounts::default();
    for line in text.lines() {
        let Some(ts) = line_timestamp(line, now) else {
            continue;
        };
        if ts < horizon {
            continue;
        }
        match classify_line(line) {
            Some(LineSeverity::Critical) => counts.critical += 1,
            Some(LineSeverity::Error) => counts.error += 1,
            Some(LineSeverity::Warning) => counts.warning += 1,
            None => {}
        }
    }
    counts
}

/// Count crash-pattern kernel messages from the last `window`.
///
/// `text` is `dmesg` output with `[seconds.micros]` boot-relative stamps.
pub fn scan_kernel(text: &str, uptime_secs: f64, window: Duration) -> u32 {
    let horizon = uptime_secs - window.as_secs_f64();
    text.lines()
        .filter(|line| {
            let stamp = line
                .trim_start()
                .strip_prefix('[')
                .and_then(|rest| rest.split_once(']'))
                .and_then(|(secs, _)| secs.trim().parse::<f64>().ok());
            match stamp {
                Some(s) => s >= horizon,
                None => false,
            }
        })
        .filter(|line| {
            let lower = line.to_lowercase();
            KERNEL_CRASH_KEYWORDS.iter().any(|k| lower.contains(k))
        })
        .count() as u32
}

/// Read at most `max_bytes` from the end of `path`, starting on a line boundary.
fn read_tail(path: &Path, max_bytes: u64) -> Option<String> {
    let mut file = std::fs::File::open(path).ok()?;
    let len = file.metadata().ok()?.len();
    let start = len.saturating_sub(max_bytes);
    file.seek(SeekFrom::Start(start)).ok()?;
    let mut buf = Vec::new();
    file.read_to_end(&mut buf).ok()?;
    let text = String::from_utf8_lossy(&buf).into_owned();
    if start > 0 {
        // First line is probably cut.
        Some(text.split_once('\n').map(|(_, rest)| rest.to_string()).unwrap_or_default())
    } else {
        Some(text)
    }
}

// ---------------------------------------------------------------------------
// Collector
// ---------------------------------------------------------------------------

/// Source of host-health samples for the pipeline.
pub trait HealthCheck: Send + Sync {
    /// Take one sample, giving up after `timeout`.
    fn sample_health(self: Arc<Self>, timeout: Duration) -> HostHealthSample;
}

impl HealthCheck for HostHealthCollector {
    fn sample_health(self: Arc<Self>, timeout: Duration) -> HostHealthSample {
        self.collect_with_timeout(timeout)
    }
}

/// A fixed sample, for replaying recorded conditions.
impl HealthCheck for HostHealthSample {
    fn sample_health(self: Arc<Self>, _timeout: Duration) -> HostHealthSample {
        (*self).clone()
    }
}

/// Samples host health. Holds a `sysinfo::System` across ticks so CPU usage
/// is measured between consecutive refreshes.
pub struct HostHealthCollector {
    system: Mutex<System>,
    primed: AtomicBool,
    logs: LogScanConfig,
    thermal_path: PathBuf,
}

impl HostHealthCollector {
    pub fn new(logs: LogScanConfig, thermal_path: PathBuf) -> Self {
        Self {
            system: Mutex::new(System::new()),
            primed: AtomicBool::new(false),
            logs,
            thermal_path,
        }
    }

    /// Collect one sample, abandoning it after `timeout`. A timed-out
    /// collection yields an all-`None` sample.
    pub fn collect_with_timeout(self: &Arc<Self>, timeout: Duration) -> HostHealthSample {
        let this = Arc::clone(self);
        run_with_timeout(timeout, move || this.collect()).unwrap_or_else(|| {
            debug!("host health: collection timed out after {timeout:?}");
            HostHealthSample::default()
        })
    }

    /// Collect one sample on the calling thread.
    pub fn collect(&self) -> HostHealthSample {
        let mut s = HostHealthSample::default();

        // A wedged previous collection may still hold the lock; skip rather than queue.
        if let Ok(mut sys) = self.system.try_lock() {
            sys.refresh_cpu();
            sys.refresh_memory();
            if self.primed.swap(true, Ordering::Relaxed) {
                s.cpu_percent = Some(f64::from(sys.global_cpu_info().cpu_usage()));
            }
            let cores = sys.cpus().len();
            if cores > 0 {
                s.cores = Some(cores);
            }
            let total = sys.total_memory();
            if total > 0 {
                s.memory_percent = Some(sys.used_memory() as f64 / total as f64 * 100.0);
            }
        }

        let load = System::load_average();
        if load.one > 0.0 || load.five > 0.0 || load.fifteen > 0.0 {
            s.load_avg = Some([load.one, load.five, load.fifteen]);
        }
        let uptime = System::uptime();
        if uptime > 0 {
            s.uptime_secs = Some(uptime);
        }
        s.cpu_temp_c = read_thermal_c(&self.thermal_path);

        let window = Duration::from_secs(self.logs.window_secs);
        if let Some(text) = self
            .logs
            .syslog_paths
            .iter()
            .find_map(|p| read_tail(p, self.logs.tail_bytes))
        {
            let counts = scan_syslog(&text, Local::now(), window);
            s.warning_lines = Some(counts.warning);
            s.error_lines = Some(counts.error);
            s.critical_lines = Some(counts.critical);
        }

        if self.logs.scan_kernel {
            s.kernel_panic_lines = s.uptime_secs.and_then(|up| {
                let text = run_command(
                    "dmesg",
                    &["--level=err,crit,alert,emerg"],
                    Duration::from_secs(2),
                )?;
                Some(scan_kernel(&text, up as f64, window))
            });
        }

        s
    }
}
