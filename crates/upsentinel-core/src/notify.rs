//! Push-notification delivery.
//!
//! Alerts are handed to a [`DeliveryWorker`], which owns one background
//! thread and delivers events in FIFO order through a [`Notifier`]. Failed
//! attempts are retried with exponential backoff; the outcome is written back
//! to the [`AlertHistory`].

use std::sync::Arc;
use std::sync::mpsc::{self, Sender};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use chrono::{DateTime, Utc};
use log::{debug, error, info, warn};
use rand::Rng;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::alert::{AlertEvent, AlertHistory, DeliveryStatus, Severity};
use crate::config::AlertConfig;
use crate::error::DeliveryError;

/// JSON body sent to the notification endpoint.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NotificationPayload {
    pub severity: Severity,
    pub message: String,
    pub fingerprint: String,
    pub timestamp: DateTime<Utc>,
    pub unit_id: String,
    pub alert_id: Uuid,
}

impl NotificationPayload {
    pub fn from_event(event: &AlertEvent, unit_id: &str) -> Self {
        let message = if event.suppressed_before > 0 {
            format!(
                "{} (+{} suppressed since last notice)",
                event.message, event.suppressed_before
            )
        } else {
            event.message.clone()
        };
        Self {
            severity: event.severity,
            message,
            fingerprint: event.fingerprint.to_string(),
            timestamp: event.timestamp,
            unit_id: unit_id.to_string(),
            alert_id: event.id,
        }
    }
}

/// Something that can deliver a notification.
pub trait Notifier: Send + Sync {
    fn name(&self) -> &str;

    fn send(&self, payload: &NotificationPayload) -> Result<(), DeliveryError>;
}

/// POSTs the payload as JSON to a webhook.
pub struct WebhookNotifier {
    client: reqwest::blocking::Client,
    url: String,
}

impl WebhookNotifier {
    pub fn new(url: impl Into<String>, timeout: Duration) -> Result<Self, DeliveryError> {
        let client = reqwest::blocking::Client::builder()
            .timeout(timeout)
            .user_agent(concat!("upsentinel/", env!("CARGO_PKG_VERSION")))
            .build()?;
        Ok(Self {
            client,
            url: url.into(),
        })
    }
}

impl Notifier for WebhookNotifier {
    fn name(&self) -> &str {
        &self.url
    }

    fn send(&self, payload: &NotificationPayload) -> Result<(), DeliveryError> {
        let resp = self.client.post(&self.url).json(payload).send()?;
        let status = resp.status();
        if status.is_success() {
            Ok(())
        } else {
            Err(DeliveryError::Status(status.as_u16()))
        }
    }
}

/// Writes alerts to the log. Used when no endpoint is configured.
pub struct LogNotifier;

impl Notifier for LogNotifier {
    fn name(&self) -> &str {
        "log"
    }

    fn send(&self, payload: &NotificationPayload) -> Result<(), DeliveryError> {
        match payload.severity {
            Severity::Critical => warn!("[{}] {}", payload.fingerprint, payload.message),
            _ => info!("[{}] {}", payload.fingerprint, payload.message),
        }
        Ok(())
    }
}

/// Pick the notifier for a configuration.
pub fn notifier_for(cfg: &AlertConfig) -> Result<Arc<dyn Notifier>, DeliveryError> {
    match &cfg.webhook_url {
        Some(url) => Ok(Arc::new(WebhookNotifier::new(
            url.clone(),
            Duration::from_secs(cfg.request_timeout_secs),
        )?)),
        None => Ok(Arc::new(LogNotifier)),
    }
}

// ---------------------------------------------------------------------------
// Retry
// ---------------------------------------------------------------------------

/// Retry configuration for failed deliveries.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Retries after the first attempt.
    pub max_retries: u32,
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
    /// Add up to 25% random jitter to each wait.
    pub jitter: bool,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            initial_backoff: Duration::from_millis(500),
            max_backoff: Duration::from_secs(30),
            jitter: true,
        }
    }
}

impl RetryPolicy {
    pub fn from_config(cfg: &AlertConfig) -> Self {
        Self {
            max_retries: cfg.max_retries,
            initial_backoff: Duration::from_millis(cfg.initial_backoff_ms),
            max_backoff: Duration::from_millis(cfg.max_backoff_ms),
            jitter: true,
        }
    }

    /// No waiting between attempts.
    pub fn immediate(max_retries: u32) -> Self {
        Self {
            max_retries,
            initial_backoff: Duration::ZERO,
            max_backoff: Duration::ZERO,
            jitter: false,
        }
    }

    /// Wait before retry number `attempt` (0-based), without jitter.
    pub fn backoff_for(&self, attempt: u32) -> Duration {
        let base = self.initial_backoff.as_millis() as u64;
        let backoff = base.saturating_mul(2u64.saturating_pow(attempt));
        let max = self.max_backoff.as_millis() as u64;
        Duration::from_millis(backoff.min(max))
    }

    fn wait_for(&self, attempt: u32) -> Duration {
        let d = self.backoff_for(attempt);
        if !self.jitter || d.is_zero() {
            return d;
        }
        let extra = rand::rng().random_range(0..=d.as_millis() as u64 / 4);
        d + Duration::from_millis(extra)
    }
}

/// Result of delivering one event.
#[derive(Debug, Clone, PartialEq)]
pub struct DeliveryOutcome {
    pub status: DeliveryStatus,
    pub attempts: u32,
    pub last_error: Option<String>,
}

/// Send with bounded retries. Never panics or propagates.
pub fn deliver_with_retry(
    notifier: &dyn Notifier,
    payload: &NotificationPayload,
    policy: &RetryPolicy,
) -> DeliveryOutcome {
    let mut attempts = 0;
    let mut last_error = None;
    loop {
        attempts += 1;
        match notifier.send(payload) {
            Ok(()) => {
                return DeliveryOutcome {
                    status: DeliveryStatus::Sent,
                    attempts,
                    last_error: None,
                };
            }
            Err(e) => {
                debug!(
                    "delivery of {} via {} failed (attempt {attempts}): {e}",
                    payload.fingerprint,
                    notifier.name()
                );
                last_error = Some(e.to_string());
            }
        }
        if attempts > policy.max_retries {
            break;
        }
        thread::sleep(policy.wait_for(attempts - 1));
    }
    DeliveryOutcome {
        status: DeliveryStatus::Failed,
        attempts,
        last_error,
    }
}

// ---------------------------------------------------------------------------
// Worker
// ---------------------------------------------------------------------------

/// Background delivery thread fed by a channel.
pub struct DeliveryWorker {
    tx: Option<Sender<AlertEvent>>,
    handle: Option<JoinHandle<()>>,
}

impl DeliveryWorker {
    pub fn spawn(
        notifier: Arc<dyn Notifier>,
        policy: RetryPolicy,
        history: Arc<AlertHistory>,
        unit_id: String,
    ) -> Self {
        let (tx, rx) = mpsc::channel::<AlertEvent>();
        let handle = thread::Builder::new()
            .name("alert-delivery".into())
            .spawn(move || {
                for event in rx {
                    let payload = NotificationPayload::from_event(&event, &unit_id);
                    let outcome = deliver_with_retry(notifier.as_ref(), &payload, &policy);
                    if outcome.status == DeliveryStatus::Failed {
                        error!(
                            "alert {} undeliverable after {} attempts: {}",
                            event.fingerprint,
                            outcome.attempts,
                            outcome.last_error.as_deref().unwrap_or("unknown error")
                        );
                    }
                    if let Err(e) = history.record_delivery(
                        event.id,
                        outcome.status,
                        outcome.attempts,
                        outcome.last_error,
                    ) {
                        warn!("alert history: cannot record delivery of {}: {e}", event.id);
                    }
                }
            });
        let handle = match handle {
            Ok(h) => Some(h),
            Err(e) => {
                error!("cannot start alert delivery thread: {e}");
                None
            }
        };
        Self {
            tx: Some(tx),
            handle,
        }
    }

    /// Queue an event. Never blocks on delivery.
    pub fn submit(&self, event: AlertEvent) {
        let Some(tx) = &self.tx else { return };
        if tx.send(event).is_err() {
            warn!("alert delivery thread is gone; event stays pending");
        }
    }

    /// Stop accepting events and wait for the queue to drain.
    pub fn shutdown(mut self) {
        self.finish();
    }

    fn finish(&mut self) {
        self.tx.take();
        let panicked = self.handle.take().is_some_and(|h| h.join().is_err());
        if panicked {
            error!("alert delivery thread panicked");
        }
    }
}

impl Drop for DeliveryWorker {
    fn drop(&mut self) {
        self.finish();
    }
}
