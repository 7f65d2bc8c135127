//! Error taxonomy for the monitoring pipeline.
//!
//! Only [`ConfigError`] is ever fatal. Everything else is recovered locally by
//! the stage that observes it: a sensor failure advances the fallback chain, a
//! write failure is retried and then counted as a loss, a delivery failure is
//! retried and then recorded on the alert.

use std::time::Duration;

use thiserror::Error;

/// A sensor source could not produce a reading this tick.
#[derive(Debug, Error)]
pub enum SensorUnavailable {
    /// No device answered at any of the tried bus/address combinations.
    #[error("no device detected: {0}")]
    NotDetected(String),

    /// The sample did not complete within the per-source deadline.
    #[error("sample timed out after {0:?}")]
    Timeout(Duration),

    /// Bus or filesystem I/O failed (wrong device, missing permissions, ...).
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// The device answered but the data made no sense.
    #[error("invalid data: {0}")]
    InvalidData(String),
}

/// A single attempt to append to the telemetry log failed.
#[derive(Debug, Error)]
pub enum RecorderError {
    #[error("write failed: {0}")]
    Io(#[from] std::io::Error),
}

/// An outbound notification attempt failed.
#[derive(Debug, Error)]
pub enum DeliveryError {
    /// The collaborator answered with a non-success status.
    #[error("HTTP {0}")]
    Status(u16),

    /// Connection refused, DNS failure, TLS error, ...
    #[error("transport error: {0}")]
    Transport(String),

    /// The request did not complete in time.
    #[error("request timed out")]
    Timeout,
}

impl From<reqwest::Error> for DeliveryError {
    fn from(e: reqwest::Error) -> Self {
        if e.is_timeout() {
            Self::Timeout
        } else if let Some(status) = e.status() {
            Self::Status(status.as_u16())
        } else {
            Self::Transport(e.to_string())
        }
    }
}

/// Startup configuration could not be loaded or is malformed.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("cannot read config file: {0}")]
    Io(#[from] std::io::Error),

    #[error("cannot parse config: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("cannot render config: {0}")]
    Render(#[from] toml::ser::Error),

    #[error("invalid config value `{field}`: {reason}")]
    Invalid { field: &'static str, reason: String },
}

impl ConfigError {
    pub(crate) fn invalid(field: &'static str, reason: impl Into<String>) -> Self {
        Self::Invalid {
            field,
            reason: reason.into(),
        }
    }
}

/// The daemon could not start.
#[derive(Debug, Error)]
pub enum StartupError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error("cannot open data directory: {0}")]
    Io(#[from] std::io::Error),

    #[error("cannot build notifier: {0}")]
    Notifier(#[from] DeliveryError),
}
