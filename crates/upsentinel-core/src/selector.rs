//! Fallback chain over the registered sensor sources.
//!
//! Each tick walks the preference order and takes the first valid reading.
//! Every sample runs under a deadline on a helper thread, so one wedged bus
//! transaction costs at most `sample_timeout` before the next source is tried.
//! A source whose previous sample thread is still blocked is reported as timed
//! out without spawning another, so a permanently wedged bus holds one thread.
//! There is no sticky pinning: the preferred source is retried every tick.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, PoisonError, RwLock};
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use log::{debug, info, warn};
use serde::{Deserialize, Serialize};

use crate::error::{ConfigError, SensorUnavailable};
use crate::reading::{Reading, SourceId};
use crate::source::{SensorSource, SourceState};
use crate::sources::SignalLines;
use crate::sources::helpers::run_with_timeout;

/// What one poll produced.
#[derive(Debug, Clone)]
pub struct TickSample {
    /// The winning reading, if any source produced a valid one.
    pub reading: Option<Reading>,
    /// Consecutive ticks without a valid reading, including this one.
    pub missing_streak: u32,
    /// The missing streak reached the threshold on this tick.
    pub no_telemetry_raised: bool,
    /// A reading arrived after "no telemetry" had been raised.
    pub telemetry_restored: bool,
}

struct Registered {
    source: Arc<dyn SensorSource>,
    state: SourceState,
    in_flight: Arc<AtomicBool>,
}

/// Clears the in-flight flag when the sample thread finishes, panics, or is
/// never started.
struct InFlight(Arc<AtomicBool>);

impl Drop for InFlight {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

impl Registered {
    /// Sample under `timeout`, unless an earlier sample is still running.
    fn sample(&self, timeout: Duration) -> Result<Reading, SensorUnavailable> {
        if self
            .in_flight
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            debug!("{}: previous sample still running", self.state.id);
            return Err(SensorUnavailable::Timeout(timeout));
        }
        let guard = InFlight(Arc::clone(&self.in_flight));
        let source = Arc::clone(&self.source);
        run_with_timeout(timeout, move || {
            let _guard = guard;
            source.sample()
        })
        .unwrap_or(Err(SensorUnavailable::Timeout(timeout)))
    }
}

/// Ordered fallback over pluggable sources.
pub struct SourceSelector {
    sources: Vec<Registered>,
    order: Arc<RwLock<Vec<SourceId>>>,
    lines: Option<SignalLines>,
    sample_timeout: Duration,
    missing_threshold: u32,
    missing_streak: u32,
    no_telemetry_active: bool,
    active: Option<SourceId>,
    last_timestamp: Option<DateTime<Utc>>,
}

impl SourceSelector {
    pub fn new(
        sources: Vec<Arc<dyn SensorSource>>,
        order: Vec<SourceId>,
        sample_timeout: Duration,
        missing_threshold: u32,
    ) -> Self {
        Self {
            sources: sources
                .into_iter()
                .map(|source| Registered {
                    state: SourceState::new(source.id()),
                    source,
                    in_flight: Arc::new(AtomicBool::new(false)),
                })
                .collect(),
            order: Arc::new(RwLock::new(order)),
            lines: None,
            sample_timeout,
            missing_threshold: missing_threshold.max(1),
            missing_streak: 0,
            no_telemetry_active: false,
            active: None,
            last_timestamp: None,
        }
    }

    /// Overlay GPIO line states and thermal zone on every winning reading.
    pub fn with_signal_lines(mut self, lines: SignalLines) -> Self {
        self.lines = Some(lines);
        self
    }

    /// Registered source ids, in registration order.
    pub fn registered(&self) -> Vec<SourceId> {
        self.sources.iter().map(|r| r.state.id).collect()
    }

    pub fn order(&self) -> Vec<SourceId> {
        self.order.read().unwrap_or_else(PoisonError::into_inner).clone()
    }

    /// Shared handle to the preference order, for out-of-band reordering.
    pub fn order_handle(&self) -> Arc<RwLock<Vec<SourceId>>> {
        Arc::clone(&self.order)
    }

    /// Replace the preference order. Takes effect on the next tick.
    pub fn set_order(&self, order: Vec<SourceId>) -> Result<(), ConfigError> {
        validate_order(&order, &self.registered())?;
        *self.order.write().unwrap_or_else(PoisonError::into_inner) = order;
        Ok(())
    }

    /// Source that won the most recent successful tick.
    pub fn active(&self) -> Option<SourceId> {
        self.active
    }

    pub fn missing_streak(&self) -> u32 {
        self.missing_streak
    }

    /// Poll sources in preference order and return the first valid reading.
    pub fn poll(&mut self) -> TickSample {
        let order = self.order();
        let mut winner = None;

        for id in order {
            let Some(idx) = self.sources.iter().position(|r| r.state.id == id) else {
                continue;
            };
            let t0 = Instant::now();
            let result = self.sources[idx].sample(self.sample_timeout);
            let elapsed = t0.elapsed();
            let state = &mut self.sources[idx].state;

            match result {
                Ok(reading) if reading.valid => {
                    state.record_success(elapsed, reading.timestamp);
                    winner = Some(reading);
                    break;
                }
                Ok(_) => {
                    debug!("{id}: answered with unusable data");
                    state.record_failure(elapsed, "invalid reading".into());
                }
                Err(e) => {
                    debug!("{id}: unavailable: {e}");
                    state.record_failure(elapsed, e.to_string());
                }
            }
        }

        match winner {
            Some(mut reading) => {
                if let Some(lines) = &self.lines {
                    lines.augment(&mut reading);
                }
                // Wall clock stepped backwards: hold the merged stream steady.
                if let Some(prev) = self.last_timestamp.filter(|p| reading.timestamp < *p) {
                    reading.timestamp = prev;
                }
                self.last_timestamp = Some(reading.timestamp);

                if self.active != Some(reading.source) {
                    match self.active {
                        Some(prev) => warn!("telemetry source changed: {prev} -> {}", reading.source),
                        None => info!("telemetry source: {}", reading.source),
                    }
                    self.active = Some(reading.source);
                }

                let restored = self.no_telemetry_active;
                if restored {
                    info!("telemetry restored after {} missing ticks", self.missing_streak);
                }
                self.missing_streak = 0;
                self.no_telemetry_active = false;
                TickSample {
                    reading: Some(reading),
                    missing_streak: 0,
                    no_telemetry_raised: false,
                    telemetry_restored: restored,
                }
            }
            None => {
                self.missing_streak = self.missing_streak.saturating_add(1);
                let raised = !self.no_telemetry_active && self.missing_streak >= self.missing_threshold;
                if raised {
                    warn!("no telemetry for {} consecutive ticks", self.missing_streak);
                    self.no_telemetry_active = true;
                }
                TickSample {
                    reading: None,
                    missing_streak: self.missing_streak,
                    no_telemetry_raised: raised,
                    telemetry_restored: false,
                }
            }
        }
    }

    /// Sample every registered source once, ignoring the order. Used by `scan`.
    pub fn sample_all(&self) -> Vec<(SourceId, Result<Reading, SensorUnavailable>)> {
        self.sources
            .iter()
            .map(|r| (r.state.id, r.sample(self.sample_timeout)))
            .collect()
    }

    /// Per-source health.
    pub fn health_report(&self) -> HealthReport {
        let sources: Vec<SourceHealth> = self
            .sources
            .iter()
            .map(|r| SourceHealth::from(&r.state))
            .collect();
        HealthReport {
            healthy: sources.iter().filter(|s| s.healthy).count(),
            total: sources.len(),
            active: self.active,
            missing_streak: self.missing_streak,
            sources,
        }
    }
}

/// Reject empty, duplicated or unregistered orders.
pub fn validate_order(order: &[SourceId], registered: &[SourceId]) -> Result<(), ConfigError> {
    if order.is_empty() {
        return Err(ConfigError::invalid("sources.order", "must name at least one source"));
    }
    for (i, id) in order.iter().enumerate() {
        if order[..i].contains(id) {
            return Err(ConfigError::invalid(
                "sources.order",
                format!("`{id}` listed more than once"),
            ));
        }
        if !registered.contains(id) {
            return Err(ConfigError::invalid(
                "sources.order",
                format!("`{id}` is not a registered source"),
            ));
        }
    }
    Ok(())
}

/// Health of the whole chain.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct HealthReport {
    /// Number of healthy sources.
    pub healthy: usize,
    /// Total number of registered sources.
    pub total: usize,
    /// Source that produced the latest reading.
    pub active: Option<SourceId>,
    pub missing_streak: u32,
    pub sources: Vec<SourceHealth>,
}

/// Health of a single source.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SourceHealth {
    pub id: SourceId,
    pub healthy: bool,
    pub successes: u64,
    pub failures: u64,
    pub consecutive_failures: u64,
    pub last_error: Option<String>,
    /// Duration of the last sample attempt in seconds.
    pub time: f64,
    pub last_success_at: Option<DateTime<Utc>>,
}

impl From<&SourceState> for SourceHealth {
    fn from(s: &SourceState) -> Self {
        Self {
            id: s.id,
            healthy: s.healthy,
            successes: s.successes,
            failures: s.failures,
            consecutive_failures: s.consecutive_failures,
            last_error: s.last_error.clone(),
            time: s.last_sample_time.as_secs_f64(),
            last_success_at: s.last_success_at,
        }
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::source::{SourceInfo, Transport};
    use std::collections::VecDeque;
    use std::sync::Mutex;

    /// What a scripted source does on one call.
    #[derive(Clone)]
    pub enum Step {
        Volts(f64),
        Invalid,
        Fail,
        Hang(Duration),
        /// 12 V on the given supply at the given battery percent.
        Power(crate::reading::PowerSource, f64),
        /// On battery at the given percent, stamped this many seconds ahead.
        Soc(f64, i64),
    }

    pub struct ScriptedSource {
        info: SourceInfo,
        steps: Mutex<VecDeque<Step>>,
        default: Step,
    }

    impl ScriptedSource {
        pub fn new(id: SourceId, steps: Vec<Step>, default: Step) -> Arc<dyn SensorSource> {
            Arc::new(Self {
                info: SourceInfo {
                    id,
                    description: "scripted",
                    measures: "scripted",
                    transport: Transport::Host,
                    addresses: &[],
                },
                steps: Mutex::new(steps.into()),
                default,
            })
        }
    }

    impl SensorSource for ScriptedSource {
        fn info(&self) -> &SourceInfo {
            &self.info
        }

        fn sample(&self) -> Result<Reading, SensorUnavailable> {
            let step = self
                .steps
                .lock()
                .unwrap()
                .pop_front()
                .unwrap_or_else(|| self.default.clone());
            let mut r = Reading::new(self.info.id);
            match step {
                Step::Volts(v) => r.voltage_v = Some(v),
                Step::Invalid => r.valid = false,
                Step::Fail => return Err(SensorUnavailable::NotDetected("scripted".into())),
                Step::Hang(d) => {
                    std::thread::sleep(d);
                    r.voltage_v = Some(0.0);
                }
                Step::Power(supply, pct) => {
                    r.voltage_v = Some(12.0);
                    r.battery_percent = Some(pct);
                    r.power_source = supply;
                }
                Step::Soc(pct, ahead) => {
                    r.timestamp += chrono::Duration::seconds(ahead);
                    r.voltage_v = Some(11.8);
                    r.battery_percent = Some(pct);
                    r.power_source = crate::reading::PowerSource::Battery;
                }
            }
            Ok(r)
        }
    }

    fn selector(sources: Vec<Arc<dyn SensorSource>>, threshold: u32) -> SourceSelector {
        let order = sources.iter().map(|s| s.id()).collect();
        SourceSelector::new(sources, order, Duration::from_millis(100), threshold)
    }

    // -----------------------------------------------------------------------
    // Fallback tests
    // -----------------------------------------------------------------------

    #[test]
    fn test_first_valid_wins() {
        let a = ScriptedSource::new(SourceId::FuelGauge, vec![], Step::Volts(11.9));
        let b = ScriptedSource::new(SourceId::CurrentSensor, vec![], Step::Volts(12.1));
        let mut sel = selector(vec![a, b], 3);
        let t = sel.poll();
        assert_eq!(t.reading.unwrap().source, SourceId::FuelGauge);
        assert_eq!(sel.active(), Some(SourceId::FuelGauge));
    }

    #[test]
    fn test_timeout_falls_back() {
        let slow = ScriptedSource::new(
            SourceId::FuelGauge,
            vec![],
            Step::Hang(Duration::from_millis(600)),
        );
        let ok = ScriptedSource::new(SourceId::HostStats, vec![], Step::Volts(12.0));
        let mut sel = selector(vec![slow, ok], 3);
        let start = Instant::now();
        let t = sel.poll();
        assert!(start.elapsed() < Duration::from_millis(500));
        assert_eq!(t.reading.unwrap().source, SourceId::HostStats);
        assert!(!t.no_telemetry_raised);

        let health = sel.health_report();
        let fg = &health.sources[0];
        assert!(!fg.healthy);
        assert!(fg.last_error.as_deref().unwrap().contains("timed out"));
        assert_eq!(health.healthy, 1);
    }

    /// Blocks every sample for `hold` and counts how often it was entered.
    struct Wedged {
        info: SourceInfo,
        hold: Duration,
        calls: Arc<std::sync::atomic::AtomicUsize>,
    }

    impl SensorSource for Wedged {
        fn info(&self) -> &SourceInfo {
            &self.info
        }

        fn sample(&self) -> Result<Reading, SensorUnavailable> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            std::thread::sleep(self.hold);
            Ok(Reading::new(self.info.id))
        }
    }

    #[test]
    fn test_wedged_source_holds_one_thread() {
        let calls = Arc::new(std::sync::atomic::AtomicUsize::new(0));
        let wedged: Arc<dyn SensorSource> = Arc::new(Wedged {
            info: SourceInfo {
                id: SourceId::FuelGauge,
                description: "wedged",
                measures: "nothing",
                transport: Transport::I2c,
                addresses: &[],
            },
            hold: Duration::from_millis(600),
            calls: Arc::clone(&calls),
        });
        let ok = ScriptedSource::new(SourceId::HostStats, vec![], Step::Volts(12.0));
        let mut sel = selector(vec![wedged, ok], 3);

        for _ in 0..3 {
            let t = sel.poll();
            assert_eq!(t.reading.unwrap().source, SourceId::HostStats);
        }
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        let fg = &sel.health_report().sources[0];
        assert!(fg.last_error.as_deref().unwrap().contains("timed out"));
        assert_eq!(fg.consecutive_failures, 3);

        // Once the stuck call returns the source is sampled again.
        std::thread::sleep(Duration::from_millis(700));
        sel.poll();
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_hang_then_recover_is_sampled_again() {
        let a = ScriptedSource::new(
            SourceId::FuelGauge,
            vec![Step::Hang(Duration::from_millis(250))],
            Step::Volts(11.9),
        );
        let mut sel = selector(vec![a], 3);
        assert!(sel.poll().reading.is_none());
        assert!(sel.poll().reading.is_none());
        std::thread::sleep(Duration::from_millis(300));
        assert_eq!(sel.poll().reading.unwrap().voltage_v, Some(11.9));
    }

    #[test]
    fn test_invalid_reading_skipped() {
        let a = ScriptedSource::new(SourceId::FuelGauge, vec![], Step::Invalid);
        let b = ScriptedSource::new(SourceId::CurrentSensor, vec![], Step::Volts(12.0));
        let mut sel = selector(vec![a, b], 3);
        assert_eq!(sel.poll().reading.unwrap().source, SourceId::CurrentSensor);
    }

    #[test]
    fn test_no_sticky_pinning() {
        let a = ScriptedSource::new(SourceId::FuelGauge, vec![Step::Fail], Step::Volts(11.8));
        let b = ScriptedSource::new(SourceId::HostStats, vec![], Step::Volts(12.0));
        let mut sel = selector(vec![a, b], 3);
        assert_eq!(sel.poll().reading.unwrap().source, SourceId::HostStats);
        assert_eq!(sel.poll().reading.unwrap().source, SourceId::FuelGauge);
    }

    // -----------------------------------------------------------------------
    // Missing telemetry tests
    // -----------------------------------------------------------------------

    #[test]
    fn test_no_telemetry_raised_once() {
        let a = ScriptedSource::new(SourceId::FuelGauge, vec![], Step::Fail);
        let mut sel = selector(vec![a], 3);
        let raised: Vec<bool> = (0..6).map(|_| sel.poll().no_telemetry_raised).collect();
        assert_eq!(raised, vec![false, false, true, false, false, false]);
        assert_eq!(sel.missing_streak(), 6);
    }

    #[test]
    fn test_telemetry_restored() {
        let a = ScriptedSource::new(
            SourceId::FuelGauge,
            vec![Step::Fail, Step::Fail],
            Step::Volts(12.0),
        );
        let mut sel = selector(vec![a], 2);
        sel.poll();
        assert!(sel.poll().no_telemetry_raised);
        let t = sel.poll();
        assert!(t.telemetry_restored);
        assert_eq!(t.missing_streak, 0);
        assert!(!sel.poll().telemetry_restored);
    }

    #[test]
    fn test_short_outage_does_not_restore() {
        let a = ScriptedSource::new(SourceId::FuelGauge, vec![Step::Fail], Step::Volts(12.0));
        let mut sel = selector(vec![a], 3);
        assert!(sel.poll().reading.is_none());
        let t = sel.poll();
        assert!(t.reading.is_some());
        assert!(!t.telemetry_restored);
    }

    // -----------------------------------------------------------------------
    // Ordering tests
    // -----------------------------------------------------------------------

    #[test]
    fn test_timestamps_non_decreasing() {
        let a = ScriptedSource::new(SourceId::FuelGauge, vec![], Step::Volts(12.0));
        let mut sel = selector(vec![a], 3);
        let first = sel.poll().reading.unwrap().timestamp;
        // Simulate a backwards wall-clock step.
        sel.last_timestamp = Some(first + chrono::Duration::hours(1));
        let second = sel.poll().reading.unwrap().timestamp;
        assert_eq!(second, first + chrono::Duration::hours(1));
    }

    #[test]
    fn test_set_order() {
        let a = ScriptedSource::new(SourceId::FuelGauge, vec![], Step::Volts(11.0));
        let b = ScriptedSource::new(SourceId::HostStats, vec![], Step::Volts(12.0));
        let mut sel = selector(vec![a, b], 3);
        sel.set_order(vec![SourceId::HostStats, SourceId::FuelGauge]).unwrap();
        assert_eq!(sel.poll().reading.unwrap().source, SourceId::HostStats);

        assert!(sel.set_order(vec![]).is_err());
        assert!(sel.set_order(vec![SourceId::CurrentSensor]).is_err());
        assert!(sel.set_order(vec![SourceId::HostStats, SourceId::HostStats]).is_err());
    }

    #[test]
    fn test_sample_all_ignores_order() {
        let a = ScriptedSource::new(SourceId::FuelGauge, vec![], Step::Fail);
        let b = ScriptedSource::new(SourceId::HostStats, vec![], Step::Volts(12.0));
        let sel = SourceSelector::new(
            vec![a, b],
            vec![SourceId::HostStats],
            Duration::from_millis(100),
            3,
        );
        let results = sel.sample_all();
        assert_eq!(results.len(), 2);
        assert!(results[0].1.is_err());
        assert!(results[1].1.is_ok());
    }
}
