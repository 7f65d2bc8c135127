//! Abstract sensor source trait and runtime state.
//!
//! Every sensor source implements the [`SensorSource`] trait, which provides
//! metadata via [`SourceInfo`] and a single blocking [`sample`](SensorSource::sample)
//! operation. The [`SourceSelector`](crate::selector::SourceSelector) wraps each
//! registered source in a [`SourceState`] to track its health.

use std::time::Duration;

use chrono::{DateTime, Utc};

use crate::error::SensorUnavailable;
use crate::reading::{Reading, SourceId};

/// How a source reaches its data.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Transport {
    /// I2C transaction against a fixed 7-bit device address.
    I2c,
    /// Operating-system counters (sysfs/procfs), no bus I/O.
    Host,
}

impl std::fmt::Display for Transport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::I2c => write!(f, "i2c"),
            Self::Host => write!(f, "host"),
        }
    }
}

/// Metadata about a sensor source.
#[derive(Debug, Clone)]
pub struct SourceInfo {
    /// Identity stamped on every reading the source produces.
    pub id: SourceId,
    /// One-line human-readable description.
    pub description: &'static str,
    /// What the device measures and how the raw registers are converted.
    pub measures: &'static str,
    pub transport: Transport,
    /// Candidate 7-bit bus addresses, in detection order. Empty for host sources.
    pub addresses: &'static [u8],
}

/// Trait that every sensor source must implement.
pub trait SensorSource: Send + Sync {
    /// Source metadata.
    fn info(&self) -> &SourceInfo;

    /// Take one sample. May block on bus I/O; callers bound it with a timeout.
    fn sample(&self) -> Result<Reading, SensorUnavailable>;

    /// Convenience: identity from info.
    fn id(&self) -> SourceId {
        self.info().id
    }
}

/// Runtime state for a registered source in the selector.
#[derive(Debug, Clone)]
pub struct SourceState {
    pub id: SourceId,
    pub successes: u64,
    pub failures: u64,
    pub consecutive_failures: u64,
    pub last_error: Option<String>,
    pub last_sample_time: Duration,
    pub last_success_at: Option<DateTime<Utc>>,
    pub healthy: bool,
}

impl SourceState {
    pub fn new(id: SourceId) -> Self {
        Self {
            id,
            successes: 0,
            failures: 0,
            consecutive_failures: 0,
            last_error: None,
            last_sample_time: Duration::ZERO,
            last_success_at: None,
            healthy: true,
        }
    }

    pub(crate) fn record_success(&mut self, elapsed: Duration, at: DateTime<Utc>) {
        self.successes += 1;
        self.consecutive_failures = 0;
        self.last_error = None;
        self.last_sample_time = elapsed;
        self.last_success_at = Some(at);
        self.healthy = true;
    }

    pub(crate) fn record_failure(&mut self, elapsed: Duration, error: String) {
        self.failures += 1;
        self.consecutive_failures += 1;
        self.last_error = Some(error);
        self.last_sample_time = elapsed;
        self.healthy = false;
    }
}
