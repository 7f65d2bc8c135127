//! # upsentinel-core
//!
//! **Crash-risk monitoring for UPS-backed single-board computers.**
//!
//! `upsentinel-core` polls a UPS HAT's sensors (battery fuel gauge, shunt
//! current monitor, kernel power-supply class), records the readings as a
//! time series, scores the risk that the host is about to crash or lose power,
//! and raises deduplicated alerts when that risk crosses a threshold.
//!
//! ## Quick Start
//!
//! ```no_run
//! use std::sync::atomic::AtomicBool;
//! use upsentinel_core::{MonitorConfig, Pipeline};
//!
//! let config = MonitorConfig::load_or_default(None).unwrap();
//! let mut pipeline = Pipeline::from_config(config).unwrap();
//!
//! // One pass through the whole chain
//! let report = pipeline.tick();
//! println!("risk {:.0} ({})", report.assessment.score, report.assessment.state);
//!
//! // Or run until stopped
//! let stop = AtomicBool::new(false);
//! pipeline.run(&stop);
//! ```
//!
//! ## Architecture
//!
//! Sources → Selector (fallback) → Recorder → Risk scoring → Alert dispatch
//!
//! Every sensor implements the [`SensorSource`] trait. The [`SourceSelector`]
//! tries them in preference order each tick and keeps the first valid
//! [`Reading`]. The [`RiskStateMachine`] turns composite scores into
//! Normal / Warning / Critical with hysteresis, and the [`AlertDispatcher`]
//! applies per-fingerprint cooldowns before anything reaches a [`Notifier`].

pub mod alert;
pub mod config;
pub mod error;
pub mod health;
pub mod heartbeat;
pub mod notify;
pub mod pipeline;
pub mod reading;
pub mod recorder;
pub mod risk;
pub mod selector;
pub mod source;
pub mod sources;
pub mod status;

pub use alert::{
    AlertDispatcher, AlertEvent, AlertHistory, Band, DeliveryStatus, Fingerprint, Severity,
};
pub use config::{
    AlertConfig, DEFAULT_CONFIG_PATH, GpioConfig, HeartbeatConfig, LogScanConfig, MonitorConfig,
    PollConfig, RecorderConfig, RuleWeight, SourcesConfig, Thresholds, Weights,
};
pub use error::{ConfigError, DeliveryError, SensorUnavailable, StartupError};
pub use health::{HealthCheck, HostHealthCollector, HostHealthSample};
pub use heartbeat::{HeartbeatPayload, HeartbeatReporter, ServerStats};
pub use notify::{LogNotifier, NotificationPayload, Notifier, RetryPolicy, WebhookNotifier};
pub use pipeline::{Pipeline, QueryHandle, TickReport};
pub use reading::{ChargeState, PowerSource, Reading, SourceId};
pub use recorder::{ReadingRange, TelemetryRecorder};
pub use risk::{
    FactorKind, RiskAssessment, RiskFactor, RiskState, RiskStateMachine, ScoringInput, Transition,
    score,
};
pub use selector::{HealthReport, SourceHealth, SourceSelector, TickSample};
pub use source::{SensorSource, SourceInfo, SourceState, Transport};
pub use status::StatusSnapshot;

/// Library version (from Cargo.toml).
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
