//! The monitoring pipeline: acquisition, recording, scoring, alerting.
//!
//! [`Pipeline`] owns every stage explicitly; nothing lives in statics. One
//! call to [`Pipeline::tick`] runs the whole chain once:
//!
//! 1. the selector polls sources in preference order,
//! 2. the recorder appends the winning reading,
//! 3. host health is sampled under a deadline,
//! 4. the scoring engine assesses the trailing window,
//! 5. the dispatcher turns transitions and new factors into alerts, which
//!    are recorded and queued for delivery.
//!
//! [`QueryHandle`] is the read-only view handed to dashboards. Its only
//! writes are threshold and fallback-order updates, which take effect on the
//! next tick.

use std::collections::VecDeque;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, PoisonError, RwLock};
use std::thread;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use log::{debug, info, warn};

use crate::alert::{AlertDispatcher, AlertEvent, AlertHistory, record_or_warn};
use crate::config::{MonitorConfig, Thresholds, Weights};
use crate::error::{ConfigError, StartupError};
use crate::health::{HealthCheck, HostHealthCollector, HostHealthSample};
use crate::heartbeat::{HeartbeatHandle, HeartbeatReporter, default_unit_id};
use crate::notify::{DeliveryWorker, Notifier, RetryPolicy, notifier_for};
use crate::reading::{Reading, SourceId};
use crate::recorder::{ReadingRange, TelemetryRecorder};
use crate::risk::{
    RiskAssessment, RiskStateMachine, ScoringInput, Transition, drain_rate_per_min,
    estimate_current_ma,
};
use crate::selector::{SourceSelector, validate_order};
use crate::source::SensorSource;
use crate::sources::{SignalLines, registered_sources};
use crate::status::{StatusSnapshot, estimate_runtime_min};

/// Outcome of one tick.
#[derive(Debug, Clone)]
pub struct TickReport {
    pub reading: Option<Reading>,
    pub assessment: RiskAssessment,
    pub transition: Option<Transition>,
    pub events: Vec<AlertEvent>,
}

/// The whole monitor, wired together.
pub struct Pipeline {
    config: MonitorConfig,
    data_dir: PathBuf,
    selector: SourceSelector,
    recorder: Arc<TelemetryRecorder>,
    health: Arc<dyn HealthCheck>,
    thresholds: Arc<RwLock<Thresholds>>,
    weights: Weights,
    machine: RiskStateMachine,
    dispatcher: AlertDispatcher,
    history: Arc<AlertHistory>,
    delivery: Option<DeliveryWorker>,
    heartbeat: Option<Arc<HeartbeatReporter>>,
    heartbeat_handle: Option<HeartbeatHandle>,
    status: Arc<RwLock<StatusSnapshot>>,
    window: VecDeque<Reading>,
    last_health: HostHealthSample,
    ticks: u64,
}

impl Pipeline {
    /// Build the production pipeline: hardware sources, GPIO overlay, host
    /// health collector, configured notifier and heartbeat.
    pub fn from_config(config: MonitorConfig) -> Result<Self, StartupError> {
        config.validate()?;
        let sources = registered_sources(&config.sources);
        let health: Arc<dyn HealthCheck> = Arc::new(HostHealthCollector::new(
            config.logs.clone(),
            config.gpio.thermal_path.clone(),
        ));
        let notifier = notifier_for(&config.alerts)?;
        let heartbeat = HeartbeatReporter::from_config(&config.heartbeat)?.map(Arc::new);
        let lines = config.gpio.enabled.then(|| SignalLines::new(&config.gpio));

        let mut pipeline = Self::build(config, sources, health, notifier, lines)?;
        pipeline.heartbeat = heartbeat;
        Ok(pipeline)
    }

    /// Build a pipeline from explicit parts, without GPIO or heartbeat.
    pub fn with_parts(
        config: MonitorConfig,
        sources: Vec<Arc<dyn SensorSource>>,
        health: Arc<dyn HealthCheck>,
        notifier: Arc<dyn Notifier>,
    ) -> Result<Self, StartupError> {
        Self::build(config, sources, health, notifier, None)
    }

    fn build(
        config: MonitorConfig,
        sources: Vec<Arc<dyn SensorSource>>,
        health: Arc<dyn HealthCheck>,
        notifier: Arc<dyn Notifier>,
        lines: Option<SignalLines>,
    ) -> Result<Self, StartupError> {
        config.validate()?;
        let data_dir = config.recorder.data_dir.clone();
        let recorder = Arc::new(TelemetryRecorder::open(&config.recorder)?);
        let history = Arc::new(AlertHistory::open(&data_dir)?);
        let unit_id = config
            .heartbeat
            .unit_id
            .clone()
            .unwrap_or_else(default_unit_id);
        let delivery = DeliveryWorker::spawn(
            notifier,
            RetryPolicy::from_config(&config.alerts),
            Arc::clone(&history),
            unit_id,
        );
        let mut selector = SourceSelector::new(
            sources,
            config.sources.order.clone(),
            config.poll.sample_timeout(),
            config.poll.missing_ticks_alert,
        );
        if let Some(lines) = lines {
            selector = selector.with_signal_lines(lines);
        }
        let now = Utc::now();
        Ok(Self {
            thresholds: Arc::new(RwLock::new(config.thresholds.clone())),
            weights: config.weights.clone(),
            machine: RiskStateMachine::new(now),
            dispatcher: AlertDispatcher::new(Duration::from_secs(config.alerts.cooldown_secs)),
            window: VecDeque::with_capacity(config.poll.window),
            status: Arc::new(RwLock::new(StatusSnapshot::default())),
            delivery: Some(delivery),
            heartbeat: None,
            heartbeat_handle: None,
            last_health: HostHealthSample::default(),
            ticks: 0,
            config,
            data_dir,
            selector,
            recorder,
            health,
            history,
        })
    }

    pub fn config(&self) -> &MonitorConfig {
        &self.config
    }

    pub fn selector(&self) -> &SourceSelector {
        &self.selector
    }

    pub fn recorder(&self) -> &Arc<TelemetryRecorder> {
        &self.recorder
    }

    pub fn history(&self) -> &Arc<AlertHistory> {
        &self.history
    }

    pub fn dispatcher(&self) -> &AlertDispatcher {
        &self.dispatcher
    }

    pub fn status(&self) -> StatusSnapshot {
        self.status.read().unwrap_or_else(PoisonError::into_inner).clone()
    }

    /// Read-only view for dashboards and other threads.
    pub fn query_handle(&self) -> QueryHandle {
        QueryHandle {
            recorder: Arc::clone(&self.recorder),
            history: Arc::clone(&self.history),
            status: Arc::clone(&self.status),
            thresholds: Arc::clone(&self.thresholds),
            order: self.selector.order_handle(),
            registered: self.selector.registered(),
            window: self.config.poll.window,
        }
    }

    /// Run one tick at the current time.
    pub fn tick(&mut self) -> TickReport {
        self.tick_at(Utc::now())
    }

    /// Run one tick, using `now` for scoring and alert timing.
    pub fn tick_at(&mut self, now: DateTime<Utc>) -> TickReport {
        self.ticks += 1;
        let mut events = Vec::new();

        let sample = self.selector.poll();
        if let Some(reading) = &sample.reading {
            self.recorder.append(reading);
            if self.window.len() == self.config.poll.window {
                self.window.pop_front();
            }
            self.window.push_back(reading.clone());
            if sample.telemetry_restored {
                events.extend(self.dispatcher.on_telemetry_restored(reading.source.as_str(), now));
            }
            events.extend(self.dispatcher.on_reading(reading, now));
        }
        if sample.no_telemetry_raised {
            events.extend(self.dispatcher.on_no_telemetry(sample.missing_streak, now));
        }

        let health = Arc::clone(&self.health).sample_health(self.config.poll.health_timeout());
        let thresholds = self
            .thresholds
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();
        let window: &[Reading] = self.window.make_contiguous();
        let capacity = self.config.sources.capacity_mah;
        let input = ScoringInput {
            window,
            health: &health,
            thresholds: &thresholds,
            capacity_mah: Some(capacity),
        };
        let (assessment, transition) = self.machine.assess(&input, &self.weights, now);
        let drain = drain_rate_per_min(window);
        let estimated_current = window
            .last()
            .filter(|r| r.current_ma.is_none())
            .and_then(|_| estimate_current_ma(window, capacity));

        if let Some(tr) = transition {
            info!("risk state {} -> {} (score {:.0})", tr.from, tr.to, assessment.score);
            events.extend(self.dispatcher.on_transition(tr, &assessment, now));
        }
        events.extend(self.dispatcher.on_factors(&assessment, now));

        for event in &events {
            record_or_warn(&self.history, event);
            if let Some(worker) = &self.delivery {
                worker.submit(event.clone());
            }
        }

        let every = self.config.recorder.prune_every_ticks;
        if every > 0 && self.ticks % every == 0 {
            if let Err(e) = self.recorder.prune(now) {
                warn!("recorder: prune failed: {e}");
            }
        }

        self.last_health = health;
        self.publish(&assessment, drain, estimated_current, sample.missing_streak, now);

        TickReport {
            reading: sample.reading,
            assessment,
            transition,
            events,
        }
    }

    fn publish(
        &self,
        assessment: &RiskAssessment,
        drain: Option<f64>,
        estimated_current: Option<f64>,
        missing_streak: u32,
        now: DateTime<Utc>,
    ) {
        let latest = self.recorder.latest();
        let on_battery_since = self.dispatcher.on_battery_since();
        let runtime = on_battery_since
            .and_then(|_| estimate_runtime_min(latest.as_ref().and_then(|r| r.battery_percent), drain));
        let snap = StatusSnapshot {
            updated_at: Some(now),
            ticks: self.ticks,
            active_source: self.selector.active(),
            latest,
            assessment: Some(assessment.clone()),
            health: self.last_health.clone(),
            sources: self.selector.health_report(),
            missing_streak,
            on_battery_since,
            drain_percent_per_min: drain,
            estimated_current_ma: estimated_current,
            estimated_runtime_min: runtime,
            readings_written: self.recorder.written(),
            readings_lost: self.recorder.lost(),
            suppressed: self.dispatcher.suppressed_counts().into_iter().collect(),
            heartbeat: self.heartbeat.as_ref().map(|h| h.stats()).unwrap_or_default(),
        };
        if let Err(e) = snap.persist(&self.data_dir) {
            debug!("status: cannot write snapshot: {e}");
        }
        *self.status.write().unwrap_or_else(PoisonError::into_inner) = snap;
    }

    /// Start the heartbeat thread, if a reporter is configured.
    pub fn start_heartbeat(&mut self) {
        let Some(reporter) = &self.heartbeat else {
            return;
        };
        if self.heartbeat_handle.is_some() {
            return;
        }
        let interval = Duration::from_secs(self.config.heartbeat.interval_secs);
        match Arc::clone(reporter).spawn(Arc::clone(&self.status), interval) {
            Ok(h) => self.heartbeat_handle = Some(h),
            Err(e) => warn!("heartbeat: cannot start thread: {e}"),
        }
    }

    /// Tick every poll interval until `stop` is set, then shut down.
    pub fn run(&mut self, stop: &AtomicBool) {
        let interval = self.config.poll.interval();
        info!(
            "monitoring every {interval:?}, sources {:?}, data in {}",
            self.selector.order(),
            self.data_dir.display()
        );
        self.start_heartbeat();
        while !stop.load(Ordering::Relaxed) {
            let started = Instant::now();
            let report = self.tick();
            debug!(
                "tick {}: score {:.0} ({}), {} event(s)",
                self.ticks,
                report.assessment.score,
                report.assessment.state,
                report.events.len()
            );
            while !stop.load(Ordering::Relaxed) {
                let elapsed = started.elapsed();
                if elapsed >= interval {
                    break;
                }
                thread::sleep((interval - elapsed).min(Duration::from_millis(100)));
            }
        }
        self.shutdown();
    }

    /// Stop the heartbeat, drain pending deliveries and write a final
    /// status snapshot. Idempotent.
    pub fn shutdown(&mut self) {
        if let Some(h) = self.heartbeat_handle.take() {
            h.stop();
        }
        if let Some(worker) = self.delivery.take() {
            info!("draining alert delivery queue");
            worker.shutdown();
        }
        let snap = self.status();
        if snap.updated_at.is_none() {
            return;
        }
        if let Err(e) = snap.persist(&self.data_dir) {
            warn!("status: cannot write final snapshot: {e}");
        }
    }
}

impl Drop for Pipeline {
    fn drop(&mut self) {
        self.shutdown();
    }
}

// ---------------------------------------------------------------------------
// Query surface
// ---------------------------------------------------------------------------

/// Thread-safe, mostly read-only view of a running pipeline.
#[derive(Clone)]
pub struct QueryHandle {
    recorder: Arc<TelemetryRecorder>,
    history: Arc<AlertHistory>,
    status: Arc<RwLock<StatusSnapshot>>,
    thresholds: Arc<RwLock<Thresholds>>,
    order: Arc<RwLock<Vec<SourceId>>>,
    registered: Vec<SourceId>,
    window: usize,
}

impl QueryHandle {
    pub fn latest_reading(&self) -> Option<Reading> {
        self.recorder.latest()
    }

    pub fn readings_between(&self, from: DateTime<Utc>, to: DateTime<Utc>) -> ReadingRange {
        self.recorder.range(from, to)
    }

    pub fn current_assessment(&self) -> Option<RiskAssessment> {
        self.status
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .assessment
            .clone()
    }

    pub fn recent_alerts(&self, n: usize) -> Vec<AlertEvent> {
        self.history.recent(n)
    }

    pub fn alerts_since(&self, ts: DateTime<Utc>) -> Vec<AlertEvent> {
        self.history.since(ts)
    }

    /// Source health, host health, counters and battery runtime as of the
    /// last tick.
    pub fn health_summary(&self) -> StatusSnapshot {
        self.status.read().unwrap_or_else(PoisonError::into_inner).clone()
    }

    pub fn thresholds(&self) -> Thresholds {
        self.thresholds.read().unwrap_or_else(PoisonError::into_inner).clone()
    }

    /// Replace the scoring thresholds. Takes effect on the next tick.
    pub fn set_thresholds(&self, t: Thresholds) -> Result<(), ConfigError> {
        t.validate(self.window)?;
        *self.thresholds.write().unwrap_or_else(PoisonError::into_inner) = t;
        Ok(())
    }

    /// Replace the source preference order. Takes effect on the next tick.
    pub fn set_fallback_order(&self, order: Vec<SourceId>) -> Result<(), ConfigError> {
        validate_order(&order, &self.registered)?;
        info!("fallback order set to {order:?}");
        *self.order.write().unwrap_or_else(PoisonError::into_inner) = order;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::alert::DeliveryStatus;
    use crate::error::DeliveryError;
    use crate::notify::{LogNotifier, NotificationPayload};
    use crate::reading::PowerSource;
    use crate::risk::{FactorKind, RiskState};
    use crate::selector::tests::{ScriptedSource, Step};
    use std::sync::Mutex;

    struct Capture(Mutex<Vec<NotificationPayload>>);

    impl Notifier for Capture {
        fn name(&self) -> &str {
            "capture"
        }
        fn send(&self, p: &NotificationPayload) -> Result<(), DeliveryError> {
            self.0.lock().unwrap().push(p.clone());
            Ok(())
        }
    }

    fn config(dir: &std::path::Path) -> MonitorConfig {
        let mut cfg = MonitorConfig::default();
        cfg.recorder.data_dir = dir.to_path_buf();
        cfg.poll.sample_timeout_ms = 200;
        cfg.poll.health_timeout_ms = 200;
        cfg.gpio.enabled = false;
        cfg.heartbeat.unit_id = Some("ups_test".into());
        cfg.alerts.initial_backoff_ms = 1;
        cfg.alerts.max_backoff_ms = 1;
        cfg
    }

    fn pipeline(dir: &std::path::Path, sources: Vec<Arc<dyn SensorSource>>) -> Pipeline {
        Pipeline::with_parts(
            config(dir),
            sources,
            Arc::new(HostHealthSample::default()),
            Arc::new(LogNotifier),
        )
        .unwrap()
    }

    fn secs(n: i64) -> chrono::Duration {
        chrono::Duration::seconds(n)
    }

    // -----------------------------------------------------------------------
    // Tick tests
    // -----------------------------------------------------------------------

    #[test]
    fn test_tick_records_and_publishes() {
        let tmp = tempfile::tempdir().unwrap();
        let src = ScriptedSource::new(SourceId::FuelGauge, vec![], Step::Volts(12.1));
        let mut p = pipeline(tmp.path(), vec![src]);
        let report = p.tick();
        assert_eq!(report.reading.unwrap().source, SourceId::FuelGauge);
        assert_eq!(report.assessment.state, RiskState::Normal);
        assert!(report.events.is_empty());

        let q = p.query_handle();
        assert_eq!(q.latest_reading().unwrap().voltage_v, Some(12.1));
        assert!(q.current_assessment().is_some());
        assert_eq!(q.health_summary().ticks, 1);
        assert_eq!(q.health_summary().active_source, Some(SourceId::FuelGauge));
        assert!(StatusSnapshot::load(tmp.path()).unwrap().is_some());
    }

    #[test]
    fn test_low_voltage_goes_critical_and_alerts() {
        let tmp = tempfile::tempdir().unwrap();
        let src = ScriptedSource::new(SourceId::FuelGauge, vec![], Step::Volts(10.0));
        let mut p = pipeline(tmp.path(), vec![src]);
        let t0 = Utc::now();
        p.tick_at(t0);
        p.tick_at(t0 + secs(5));
        let third = p.tick_at(t0 + secs(10));
        assert_eq!(third.assessment.state, RiskState::Critical);
        let fps: Vec<String> = third.events.iter().map(|e| e.fingerprint.to_string()).collect();
        assert!(fps.contains(&"risk_state:critical".to_string()));
        assert!(fps.contains(&"low_voltage:critical".to_string()));
        assert_eq!(p.history().len(), fps.len());
    }

    #[test]
    fn test_no_telemetry_alert_once() {
        let tmp = tempfile::tempdir().unwrap();
        let src = ScriptedSource::new(SourceId::FuelGauge, vec![], Step::Fail);
        let mut p = pipeline(tmp.path(), vec![src]);
        let t0 = Utc::now();
        let mut fired = 0;
        for i in 0..6 {
            let r = p.tick_at(t0 + secs(5 * i));
            fired += r
                .events
                .iter()
                .filter(|e| e.fingerprint.to_string() == "no_telemetry:critical")
                .count();
        }
        assert_eq!(fired, 1);
        assert_eq!(p.status().missing_streak, 6);
    }

    #[test]
    fn test_telemetry_restored_notice() {
        let tmp = tempfile::tempdir().unwrap();
        let src = ScriptedSource::new(
            SourceId::FuelGauge,
            vec![Step::Fail, Step::Fail, Step::Fail],
            Step::Volts(12.0),
        );
        let mut p = pipeline(tmp.path(), vec![src]);
        let t0 = Utc::now();
        for i in 0..3 {
            p.tick_at(t0 + secs(5 * i));
        }
        let back = p.tick_at(t0 + secs(15));
        assert!(
            back.events
                .iter()
                .any(|e| e.fingerprint.to_string() == "no_telemetry:resolved")
        );
    }

    #[test]
    fn test_delivery_reaches_notifier_and_history() {
        let tmp = tempfile::tempdir().unwrap();
        let src = ScriptedSource::new(SourceId::FuelGauge, vec![], Step::Fail);
        let capture = Arc::new(Capture(Mutex::new(Vec::new())));
        let mut p = Pipeline::with_parts(
            config(tmp.path()),
            vec![src],
            Arc::new(HostHealthSample::default()),
            Arc::clone(&capture) as Arc<dyn Notifier>,
        )
        .unwrap();
        for _ in 0..3 {
            p.tick();
        }
        p.shutdown();
        let sent = capture.0.lock().unwrap();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].unit_id, "ups_test");
        let recent = p.history().recent(1);
        assert_eq!(recent[0].status, DeliveryStatus::Sent);
    }

    #[test]
    fn test_test_config_passes_validation() {
        let tmp = tempfile::tempdir().unwrap();
        config(tmp.path()).validate().unwrap();

        let mut zero = config(tmp.path());
        zero.alerts.initial_backoff_ms = 0;
        zero.alerts.max_backoff_ms = 0;
        let built = Pipeline::with_parts(
            zero,
            vec![],
            Arc::new(HostHealthSample::default()),
            Arc::new(LogNotifier),
        );
        assert!(built.is_err());
    }

    #[test]
    fn test_estimated_current_from_fuel_gauge() {
        let tmp = tempfile::tempdir().unwrap();
        let src = ScriptedSource::new(
            SourceId::FuelGauge,
            vec![
                Step::Soc(60.0, 0),
                Step::Soc(59.8, 5),
                Step::Soc(59.7, 10),
            ],
            Step::Soc(59.6, 15),
        );
        let mut p = pipeline(tmp.path(), vec![src]);
        let t0 = Utc::now();
        for i in 0..3 {
            p.tick_at(t0 + secs(5 * i));
        }
        let report = p.tick_at(t0 + secs(15));
        let hc = report
            .assessment
            .factors
            .iter()
            .find(|f| f.kind == FactorKind::HighCurrent)
            .expect("high current from charge trend");
        assert!(hc.estimated);
        assert!(hc.magnitude > 4000.0 && hc.magnitude <= 4800.0);

        let est = p.status().estimated_current_ma.unwrap();
        assert!(est < -4000.0);
        assert!(report.reading.unwrap().current_ma.is_none());
    }

    #[test]
    fn test_power_loss_runtime_and_restore() {
        let tmp = tempfile::tempdir().unwrap();
        let src = ScriptedSource::new(
            SourceId::CurrentSensor,
            vec![
                Step::Power(PowerSource::External, 100.0),
                Step::Power(PowerSource::Battery, 90.0),
                Step::Power(PowerSource::Battery, 89.0),
            ],
            Step::Power(PowerSource::External, 89.0),
        );
        let mut p = pipeline(tmp.path(), vec![src]);
        let t0 = Utc::now();
        assert!(p.tick_at(t0).events.is_empty());
        let lost = p.tick_at(t0 + secs(60));
        assert_eq!(lost.events[0].fingerprint.to_string(), "power_source:warning");
        p.tick_at(t0 + secs(120));
        assert_eq!(p.status().on_battery_since, Some(t0 + secs(60)));

        let back = p.tick_at(t0 + secs(180));
        assert_eq!(back.events[0].fingerprint.to_string(), "power_source:resolved");
        assert!(p.status().on_battery_since.is_none());
        assert!(p.status().estimated_runtime_min.is_none());
    }

    // -----------------------------------------------------------------------
    // Query handle tests
    // -----------------------------------------------------------------------

    #[test]
    fn test_set_fallback_order_validates() {
        let tmp = tempfile::tempdir().unwrap();
        let a = ScriptedSource::new(SourceId::FuelGauge, vec![], Step::Volts(12.0));
        let b = ScriptedSource::new(SourceId::HostStats, vec![], Step::Volts(11.0));
        let mut p = pipeline(tmp.path(), vec![a, b]);
        let q = p.query_handle();
        assert!(q.set_fallback_order(vec![SourceId::CurrentSensor]).is_err());
        q.set_fallback_order(vec![SourceId::HostStats, SourceId::FuelGauge])
            .unwrap();
        assert_eq!(p.tick().reading.unwrap().source, SourceId::HostStats);
    }

    #[test]
    fn test_set_thresholds_applies_next_tick() {
        let tmp = tempfile::tempdir().unwrap();
        let src = ScriptedSource::new(SourceId::FuelGauge, vec![], Step::Volts(11.0));
        let mut p = pipeline(tmp.path(), vec![src]);
        let q = p.query_handle();
        let mut bad = q.thresholds();
        bad.warning_score = 90.0;
        bad.critical_score = 50.0;
        assert!(q.set_thresholds(bad).is_err());

        let mut t = q.thresholds();
        t.low_voltage_v = 11.5;
        t.low_voltage_ticks = 1;
        q.set_thresholds(t).unwrap();
        let r = p.tick();
        assert_eq!(r.assessment.state, RiskState::Critical);
    }

    #[test]
    fn test_readings_between() {
        let tmp = tempfile::tempdir().unwrap();
        let src = ScriptedSource::new(SourceId::FuelGauge, vec![], Step::Volts(12.0));
        let mut p = pipeline(tmp.path(), vec![src]);
        let start = Utc::now() - secs(1);
        p.tick();
        p.tick();
        let q = p.query_handle();
        let range = q.readings_between(start, Utc::now() + secs(1));
        assert_eq!(range.iter().count(), 2);
        assert_eq!(range.iter().count(), 2);
    }

    #[test]
    fn test_run_stops_on_flag() {
        let tmp = tempfile::tempdir().unwrap();
        let src = ScriptedSource::new(SourceId::FuelGauge, vec![], Step::Volts(12.0));
        let mut p = pipeline(tmp.path(), vec![src]);
        let stop = AtomicBool::new(true);
        p.run(&stop);
        assert_eq!(p.status().ticks, 0);
    }
}
