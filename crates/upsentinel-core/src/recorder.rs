//! Append-only telemetry log.
//!
//! Readings go to `readings.csv` in the data directory, one row per tick.
//! Each row is written with a single `write_all` followed by a flush, so a
//! crash can leave at most one partial trailing line, which readers skip.
//!
//! # Storage Format
//!
//! ```text
//! timestamp,mono_ms,voltage_v,current_ma,power_mw,battery_percent,temperature_c,power_source,charging_state,sensor_source_id,validity
//! 2026-10-17T08:00:00.123456789Z,5012,11.52,-812.5,-9360,71.25,48.3,battery,not_charging,fuel_gauge,valid
//! ```
//!
//! Timestamps are RFC 3339 with nanoseconds; absent measurements are empty.

use std::fs::{self, File, OpenOptions};
use std::io::{self, BufRead, BufReader, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, PoisonError, RwLock};
use std::time::Duration;

use chrono::{DateTime, SecondsFormat, Utc};
use log::{debug, error, info, warn};

use crate::config::RecorderConfig;
use crate::error::RecorderError;
use crate::reading::{ChargeState, PowerSource, Reading, SourceId};

pub const READINGS_FILE: &str = "readings.csv";

pub const CSV_HEADER: &str = "timestamp,mono_ms,voltage_v,current_ma,power_mw,battery_percent,\
temperature_c,power_source,charging_state,sensor_source_id,validity";

const FIELDS: usize = 11;

// ---------------------------------------------------------------------------
// Row codec
// ---------------------------------------------------------------------------

fn opt(v: Option<f64>) -> String {
    v.map(|x| x.to_string()).unwrap_or_default()
}

/// Encode one reading as a CSV row, including the trailing newline.
pub fn encode_row(r: &Reading) -> String {
    format!(
        "{},{},{},{},{},{},{},{},{},{},{}\n",
        r.timestamp.to_rfc3339_opts(SecondsFormat::Nanos, true),
        r.mono_ms,
        opt(r.voltage_v),
        opt(r.current_ma),
        opt(r.power_mw),
        opt(r.battery_percent),
        opt(r.temperature_c),
        r.power_source,
        r.charging,
        r.source,
        if r.valid { "valid" } else { "invalid" },
    )
}

fn parse_opt(s: &str) -> Option<Option<f64>> {
    if s.is_empty() {
        Some(None)
    } else {
        s.parse().ok().map(Some)
    }
}

/// Decode a row (without newline). `None` for headers and malformed lines.
pub fn parse_row(line: &str) -> Option<Reading> {
    let f: Vec<&str> = line.split(',').collect();
    if f.len() != FIELDS {
        return None;
    }
    Some(Reading {
        timestamp: DateTime::parse_from_rfc3339(f[0]).ok()?.with_timezone(&Utc),
        mono_ms: f[1].parse().ok()?,
        voltage_v: parse_opt(f[2])?,
        current_ma: parse_opt(f[3])?,
        power_mw: parse_opt(f[4])?,
        battery_percent: parse_opt(f[5])?,
        temperature_c: parse_opt(f[6])?,
        power_source: PowerSource::parse(f[7])?,
        charging: ChargeState::parse(f[8])?,
        source: SourceId::parse(f[9])?,
        valid: match f[10] {
            "valid" => true,
            "invalid" => false,
            _ => return None,
        },
    })
}

// ---------------------------------------------------------------------------
// Recorder
// ---------------------------------------------------------------------------

/// Single-writer, many-reader telemetry log.
pub struct TelemetryRecorder {
    path: PathBuf,
    writer: Mutex<Box<dyn Write + Send>>,
    latest: RwLock<Option<Reading>>,
    written: AtomicU64,
    lost: AtomicU64,
    write_retries: u32,
    write_backoff: Duration,
    retention: chrono::Duration,
}

impl TelemetryRecorder {
    /// Open (or create) `readings.csv` under `cfg.data_dir`.
    pub fn open(cfg: &RecorderConfig) -> io::Result<Self> {
        fs::create_dir_all(&cfg.data_dir)?;
        let path = cfg.data_dir.join(READINGS_FILE);
        let file = open_append(&path)?;
        let recorder = Self::from_writer(path, Box::new(file), cfg);
        let last = recorder.range_all().iter().last();
        if let Some(r) = &last {
            debug!("recorder: resuming after {}", r.timestamp);
        }
        *recorder.latest.write().unwrap_or_else(PoisonError::into_inner) = last;
        Ok(recorder)
    }

    /// Recorder that appends to an arbitrary writer but reads from `path`.
    pub fn from_writer(path: PathBuf, writer: Box<dyn Write + Send>, cfg: &RecorderConfig) -> Self {
        Self {
            path,
            writer: Mutex::new(writer),
            latest: RwLock::new(None),
            written: AtomicU64::new(0),
            lost: AtomicU64::new(0),
            write_retries: cfg.write_retries.max(1),
            write_backoff: Duration::from_millis(cfg.write_backoff_ms),
            retention: i64::try_from(cfg.retention_hours)
                .ok()
                .and_then(chrono::Duration::try_hours)
                .unwrap_or(chrono::Duration::MAX),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Persist one reading. Never fails: after the last retry the reading is
    /// dropped and counted in [`lost`](Self::lost).
    pub fn append(&self, reading: &Reading) {
        let row = encode_row(reading);
        let mut backoff = self.write_backoff;
        for attempt in 0..self.write_retries {
            // A failed attempt may have left a fragment; terminate it so the
            // retried row starts on a fresh line.
            let result = if attempt == 0 {
                self.write_row(row.as_bytes())
            } else {
                self.write_row(format!("\n{row}").as_bytes())
            };
            match result {
                Ok(()) => {
                    self.written.fetch_add(1, Ordering::Relaxed);
                    *self.latest.write().unwrap_or_else(PoisonError::into_inner) =
                        Some(reading.clone());
                    return;
                }
                Err(e) => {
                    warn!(
                        "recorder: write attempt {}/{} failed: {e}",
                        attempt + 1,
                        self.write_retries
                    );
                    if attempt + 1 < self.write_retries {
                        std::thread::sleep(backoff);
                        backoff *= 2;
                    }
                }
            }
        }
        let total = self.lost.fetch_add(1, Ordering::Relaxed) + 1;
        error!("recorder: dropped reading at {} ({total} lost)", reading.timestamp);
    }

    fn write_row(&self, bytes: &[u8]) -> Result<(), RecorderError> {
        let mut w = self.writer.lock().unwrap_or_else(PoisonError::into_inner);
        w.write_all(bytes)?;
        w.flush()?;
        Ok(())
    }

    /// Most recent reading that was persisted.
    pub fn latest(&self) -> Option<Reading> {
        self.latest.read().unwrap_or_else(PoisonError::into_inner).clone()
    }

    /// Readings dropped after exhausting write retries.
    pub fn lost(&self) -> u64 {
        self.lost.load(Ordering::Relaxed)
    }

    /// Rows written by this process.
    pub fn written(&self) -> u64 {
        self.written.load(Ordering::Relaxed)
    }

    /// Readings with `from <= timestamp <= to`, lazily, in log order.
    pub fn range(&self, from: DateTime<Utc>, to: DateTime<Utc>) -> ReadingRange {
        ReadingRange {
            path: self.path.clone(),
            from: Some(from),
            to: Some(to),
        }
    }

    /// Every reading in the log.
    pub fn range_all(&self) -> ReadingRange {
        ReadingRange {
            path: self.path.clone(),
            from: None,
            to: None,
        }
    }

    /// The last `n` readings, oldest first.
    pub fn tail(&self, n: usize) -> Vec<Reading> {
        let mut window = std::collections::VecDeque::with_capacity(n + 1);
        for r in self.range_all().iter() {
            window.push_back(r);
            if window.len() > n {
                window.pop_front();
            }
        }
        window.into()
    }

    /// Drop rows older than the retention horizon.
    ///
    /// Returns `Ok(None)` without doing anything if an append is in progress;
    /// otherwise the number of rows removed.
    pub fn prune(&self, now: DateTime<Utc>) -> io::Result<Option<usize>> {
        let Ok(mut writer) = self.writer.try_lock() else {
            debug!("recorder: writer busy, skipping prune");
            return Ok(None);
        };
        writer.flush()?;

        // A horizon before the representable range keeps everything.
        let horizon = now
            .checked_sub_signed(self.retention)
            .unwrap_or(DateTime::<Utc>::MIN_UTC);
        let tmp = self.path.with_extension("csv.tmp");
        let mut out = io::BufWriter::new(File::create(&tmp)?);
        writeln!(out, "{CSV_HEADER}")?;
        let mut removed = 0;
        for r in self.range_all().iter() {
            if r.timestamp < horizon {
                removed += 1;
            } else {
                out.write_all(encode_row(&r).as_bytes())?;
            }
        }
        out.flush()?;
        drop(out);

        if removed == 0 {
            fs::remove_file(&tmp)?;
            return Ok(Some(0));
        }
        fs::rename(&tmp, &self.path)?;
        // The old descriptor points at the replaced inode.
        *writer = Box::new(open_append(&self.path)?);
        info!("recorder: pruned {removed} readings older than {horizon}");
        Ok(Some(removed))
    }
}

fn open_append(path: &Path) -> io::Result<File> {
    let mut file = OpenOptions::new().create(true).append(true).open(path)?;
    if file.metadata()?.len() == 0 {
        writeln!(file, "{CSV_HEADER}")?;
        file.flush()?;
    }
    Ok(file)
}

// ---------------------------------------------------------------------------
// Range queries
// ---------------------------------------------------------------------------

/// Lazy, restartable view over a slice of the log. Every call to
/// [`iter`](Self::iter) reopens the file and starts from the beginning.
#[derive(Debug, Clone)]
pub struct ReadingRange {
    path: PathBuf,
    from: Option<DateTime<Utc>>,
    to: Option<DateTime<Utc>>,
}

impl ReadingRange {
    pub fn iter(&self) -> ReadingIter {
        ReadingIter {
            reader: File::open(&self.path).ok().map(BufReader::new),
            from: self.from,
            to: self.to,
            buf: Vec::new(),
        }
    }
}

impl IntoIterator for &ReadingRange {
    type Item = Reading;
    type IntoIter = ReadingIter;

    fn into_iter(self) -> ReadingIter {
        self.iter()
    }
}

pub struct ReadingIter {
    reader: Option<BufReader<File>>,
    from: Option<DateTime<Utc>>,
    to: Option<DateTime<Utc>>,
    buf: Vec<u8>,
}

impl Iterator for ReadingIter {
    type Item = Reading;

    fn next(&mut self) -> Option<Reading> {
        let reader = self.reader.as_mut()?;
        loop {
            self.buf.clear();
            match reader.read_until(b'\n', &mut self.buf) {
                Ok(0) | Err(_) => {
                    self.reader = None;
                    return None;
                }
                Ok(_) => {}
            }
            // Partial trailing line from an interrupted append.
            if self.buf.last() != Some(&b'\n') {
                self.reader = None;
                return None;
            }
            let Ok(line) = std::str::from_utf8(&self.buf[..self.buf.len() - 1]) else {
                continue;
            };
            let Some(r) = parse_row(line.trim_end_matches('\r')) else {
                continue;
            };
            if self.from.is_some_and(|f| r.timestamp < f) || self.to.is_some_and(|t| r.timestamp > t) {
                continue;
            }
            return Some(r);
        }
    }
}
