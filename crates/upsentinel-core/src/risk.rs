//! Crash-risk scoring.
//!
//! The score is a pure function of the trailing reading window, the current
//! host-health sample, the thresholds and the weights. Each entry of the rule
//! table either fires, producing `units`, or sits the tick out; a firing rule
//! contributes `min(weight × units, cap)` and the total is clamped to 0–100.
//!
//! [`RiskStateMachine`] turns the raw score into a Normal / Warning / Critical
//! state with hysteresis so a single noisy tick can't flap the state.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::config::{RuleWeight, Thresholds, Weights};
use crate::health::HostHealthSample;
use crate::reading::Reading;

// ---------------------------------------------------------------------------
// Factors
// ---------------------------------------------------------------------------

/// Kinds of risk factor, one per rule.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FactorKind {
    #[serde(rename = "low_voltage")]
    SustainedLowVoltage,
    HighCurrent,
    HighTemperature,
    HighLoad,
    HighCpu,
    MemoryPressure,
    LogErrors,
    KernelPanic,
    BatteryDrain,
    LowBattery,
    CriticalBattery,
}

impl FactorKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::SustainedLowVoltage => "low_voltage",
            Self::HighCurrent => "high_current",
            Self::HighTemperature => "high_temperature",
            Self::HighLoad => "high_load",
            Self::HighCpu => "high_cpu",
            Self::MemoryPressure => "memory_pressure",
            Self::LogErrors => "log_errors",
            Self::KernelPanic => "kernel_panic",
            Self::BatteryDrain => "battery_drain",
            Self::LowBattery => "low_battery",
            Self::CriticalBattery => "critical_battery",
        }
    }

    /// Alert family the factor belongs to. Both battery-level bands share one.
    pub fn metric(self) -> &'static str {
        match self {
            Self::LowBattery | Self::CriticalBattery => "battery_level",
            other => other.as_str(),
        }
    }

    /// Factors that on their own mean a crash is imminent.
    pub fn is_critical(self) -> bool {
        matches!(
            self,
            Self::SustainedLowVoltage | Self::KernelPanic | Self::CriticalBattery
        )
    }
}

impl std::fmt::Display for FactorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One firing rule.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RiskFactor {
    pub kind: FactorKind,
    /// The measured value that tripped the rule (volts, mA, °C, %, count, %/min).
    pub magnitude: f64,
    /// Points added to the score.
    pub contribution: f64,
    /// The magnitude was derived rather than measured.
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub estimated: bool,
}

// ---------------------------------------------------------------------------
// Rule table
// ---------------------------------------------------------------------------

/// Inputs visible to the rules.
pub struct ScoringInput<'a> {
    /// Trailing readings, oldest first.
    pub window: &'a [Reading],
    pub health: &'a HostHealthSample,
    pub thresholds: &'a Thresholds,
    /// Pack capacity for current estimation; `None` disables it.
    pub capacity_mah: Option<f64>,
}

impl ScoringInput<'_> {
    fn latest(&self) -> Option<&Reading> {
        self.window.last()
    }
}

/// A firing rule's raw result.
struct Hit {
    units: f64,
    magnitude: f64,
    estimated: bool,
}

impl Hit {
    fn new(units: f64, magnitude: f64) -> Self {
        Self {
            units,
            magnitude,
            estimated: false,
        }
    }
}

type Eval = fn(&ScoringInput<'_>) -> Option<Hit>;

struct Rule {
    kind: FactorKind,
    weight: fn(&Weights) -> RuleWeight,
    eval: Eval,
}

const RULES: &[Rule] = &[
    Rule {
        kind: FactorKind::SustainedLowVoltage,
        weight: |w| w.low_voltage,
        eval: sustained_low_voltage,
    },
    Rule {
        kind: FactorKind::HighCurrent,
        weight: |w| w.high_current,
        eval: high_current,
    },
    Rule {
        kind: FactorKind::HighTemperature,
        weight: |w| w.high_temperature,
        eval: |i| {
            let t = i.health.cpu_temp_c.or_else(|| i.latest()?.temperature_c)?;
            (t > i.thresholds.high_temp_c).then(|| Hit::new(1.0, t))
        },
    },
    Rule {
        kind: FactorKind::HighLoad,
        weight: |w| w.high_load,
        eval: |i| {
            let mut load = i.health.load_avg?[0];
            if i.thresholds.normalize_load_by_cores {
                load /= i.health.cores.filter(|&c| c > 0)? as f64;
            }
            (load > i.thresholds.high_load).then(|| Hit::new(1.0, load))
        },
    },
    Rule {
        kind: FactorKind::HighCpu,
        weight: |w| w.high_cpu,
        eval: |i| {
            let cpu = i.health.cpu_percent?;
            (cpu > i.thresholds.high_cpu_percent).then(|| Hit::new(1.0, cpu))
        },
    },
    Rule {
        kind: FactorKind::MemoryPressure,
        weight: |w| w.memory_pressure,
        eval: |i| {
            let mem = i.health.memory_percent?;
            (mem > i.thresholds.memory_percent).then(|| Hit::new(1.0, mem))
        },
    },
    Rule {
        kind: FactorKind::LogErrors,
        weight: |w| w.log_errors,
        eval: |i| {
            let n = i.health.error_lines.unwrap_or(0) + i.health.critical_lines.unwrap_or(0);
            if i.health.error_lines.is_none() && i.health.critical_lines.is_none() {
                return None;
            }
            (n > 0).then(|| Hit::new(f64::from(n), f64::from(n)))
        },
    },
    Rule {
        kind: FactorKind::KernelPanic,
        weight: |w| w.kernel_panic,
        eval: |i| {
            let n = i.health.kernel_panic_lines?;
            (n > 0).then(|| Hit::new(1.0, f64::from(n)))
        },
    },
    Rule {
        kind: FactorKind::BatteryDrain,
        weight: |w| w.battery_drain,
        eval: battery_drain,
    },
    Rule {
        kind: FactorKind::LowBattery,
        weight: |w| w.low_battery,
        eval: |i| {
            let pct = i.latest()?.battery_percent?;
            let t = i.thresholds;
            (pct < t.low_battery_percent && pct >= t.critical_battery_percent)
                .then(|| Hit::new(1.0, pct))
        },
    },
    Rule {
        kind: FactorKind::CriticalBattery,
        weight: |w| w.critical_battery,
        eval: |i| {
            let pct = i.latest()?.battery_percent?;
            (pct < i.thresholds.critical_battery_percent).then(|| Hit::new(1.0, pct))
        },
    },
];

fn sustained_low_voltage(i: &ScoringInput<'_>) -> Option<Hit> {
    let need = i.thresholds.low_voltage_ticks;
    if need == 0 || i.window.len() < need {
        return None;
    }
    let tail = &i.window[i.window.len() - need..];
    let all_low = tail
        .iter()
        .all(|r| r.voltage_v.is_some_and(|v| v < i.thresholds.low_voltage_v));
    if !all_low {
        return None;
    }
    Some(Hit::new(1.0, tail.last()?.voltage_v?))
}

/// Measured current if the latest reading has it, else the discharge current
/// estimated from the state-of-charge trend.
fn high_current(i: &ScoringInput<'_>) -> Option<Hit> {
    let (ma, estimated) = match i.latest()?.current_ma {
        Some(ma) => (ma, false),
        None => {
            let est = estimate_current_ma(i.window, i.capacity_mah?).filter(|&ma| ma < 0.0)?;
            (est, true)
        }
    };
    let ma = ma.abs();
    (ma > i.thresholds.high_current_ma).then_some(Hit {
        units: 1.0,
        magnitude: ma,
        estimated,
    })
}

/// Shortest span of readings a current estimate is based on.
pub const MIN_ESTIMATE_SPAN_SECS: f64 = 10.0;

/// Battery current in mA implied by the change in state of charge across the
/// window, for readings from the same source as the latest one. Negative
/// while discharging. `None` when the span is too short to be meaningful.
pub fn estimate_current_ma(window: &[Reading], capacity_mah: f64) -> Option<f64> {
    let latest = window.last()?;
    let mut same = window
        .iter()
        .filter(|r| r.source == latest.source && r.battery_percent.is_some());
    let first = same.next()?;
    let last = same.last()?;
    let secs = (last.timestamp - first.timestamp).num_milliseconds() as f64 / 1000.0;
    if secs < MIN_ESTIMATE_SPAN_SECS {
        return None;
    }
    let delta_pct = last.battery_percent? - first.battery_percent?;
    Some(delta_pct / 100.0 * capacity_mah / (secs / 3600.0))
}

/// Percent lost per minute across the window, while on battery.
pub fn drain_rate_per_min(window: &[Reading]) -> Option<f64> {
    let latest = window.last()?;
    if !latest.on_battery() {
        return None;
    }
    let first = window.iter().find(|r| r.battery_percent.is_some())?;
    let last = window.iter().rev().find(|r| r.battery_percent.is_some())?;
    let minutes = (last.timestamp - first.timestamp).num_milliseconds() as f64 / 60_000.0;
    if minutes <= 0.0 {
        return None;
    }
    Some((first.battery_percent? - last.battery_percent?) / minutes)
}

fn battery_drain(i: &ScoringInput<'_>) -> Option<Hit> {
    let rate = drain_rate_per_min(i.window)?;
    (rate > i.thresholds.drain_percent_per_min).then(|| Hit::new(1.0, rate))
}

/// Result of running the rule table.
#[derive(Debug, Clone, PartialEq)]
pub struct Score {
    pub value: f64,
    pub factors: Vec<RiskFactor>,
}

/// Evaluate every rule. Rules whose inputs are missing don't fire.
pub fn score(input: &ScoringInput<'_>, weights: &Weights) -> Score {
    let factors: Vec<RiskFactor> = RULES
        .iter()
        .filter_map(|rule| {
            let hit = (rule.eval)(input)?;
            let w = (rule.weight)(weights);
            Some(RiskFactor {
                kind: rule.kind,
                magnitude: hit.magnitude,
                contribution: (w.weight * hit.units).min(w.cap),
                estimated: hit.estimated,
            })
        })
        .collect();
    let total: f64 = factors.iter().map(|f| f.contribution).sum();
    Score {
        value: total.clamp(0.0, 100.0),
        factors,
    }
}

// ---------------------------------------------------------------------------
// State machine
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RiskState {
    Normal,
    Warning,
    Critical,
}

impl RiskState {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Normal => "normal",
            Self::Warning => "warning",
            Self::Critical => "critical",
        }
    }
}

impl std::fmt::Display for RiskState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Scored and classified risk at one tick.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RiskAssessment {
    /// 0–100.
    pub score: f64,
    /// Firing rules, in rule-table order.
    pub factors: Vec<RiskFactor>,
    pub state: RiskState,
    pub state_since: DateTime<Utc>,
    pub computed_at: DateTime<Utc>,
}

impl RiskAssessment {
    pub fn has_factor(&self, kind: FactorKind) -> bool {
        self.factors.iter().any(|f| f.kind == kind)
    }
}

/// A state change.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Transition {
    pub from: RiskState,
    pub to: RiskState,
}

/// Hysteresis over successive scores.
#[derive(Debug, Clone)]
pub struct RiskStateMachine {
    state: RiskState,
    since: DateTime<Utc>,
    at_or_above_warning: u32,
    below_warning: u32,
    below_critical: u32,
}

impl RiskStateMachine {
    pub fn new(now: DateTime<Utc>) -> Self {
        Self {
            state: RiskState::Normal,
            since: now,
            at_or_above_warning: 0,
            below_warning: 0,
            below_critical: 0,
        }
    }

    pub fn state(&self) -> RiskState {
        self.state
    }

    pub fn since(&self) -> DateTime<Utc> {
        self.since
    }

    /// Feed one score; returns the transition it caused, if any.
    pub fn update(&mut self, score: f64, t: &Thresholds, now: DateTime<Utc>) -> Option<Transition> {
        let critical = score >= t.critical_score;
        let warning = score >= t.warning_score;

        if warning {
            self.at_or_above_warning += 1;
            self.below_warning = 0;
        } else {
            self.at_or_above_warning = 0;
            self.below_warning += 1;
        }
        if critical {
            self.below_critical = 0;
        } else {
            self.below_critical += 1;
        }

        let next = match self.state {
            _ if critical => RiskState::Critical,
            RiskState::Normal if self.at_or_above_warning >= t.warning_ticks => RiskState::Warning,
            RiskState::Warning | RiskState::Critical if self.below_warning >= t.recovery_ticks => {
                RiskState::Normal
            }
            RiskState::Critical if self.below_critical >= t.recovery_ticks => RiskState::Warning,
            s => s,
        };

        if next == self.state {
            return None;
        }
        let tr = Transition {
            from: self.state,
            to: next,
        };
        self.state = next;
        self.since = now;
        Some(tr)
    }

    /// Score the inputs, advance the state machine and build the assessment.
    pub fn assess(
        &mut self,
        input: &ScoringInput<'_>,
        weights: &Weights,
        now: DateTime<Utc>,
    ) -> (RiskAssessment, Option<Transition>) {
        let s = score(input, weights);
        let tr = self.update(s.value, input.thresholds, now);
        let assessment = RiskAssessment {
            score: s.value,
            factors: s.factors,
            state: self.state,
            state_since: self.since,
            computed_at: now,
        };
        (assessment, tr)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::reading::{PowerSource, SourceId};

    fn volts(vs: &[f64]) -> Vec<Reading> {
        let t0 = Utc::now();
        vs.iter()
            .enumerate()
            .map(|(i, &v)| {
                let mut r = Reading::new(SourceId::FuelGauge);
                r.timestamp = t0 + chrono::Duration::seconds(5 * i as i64);
                r.voltage_v = Some(v);
                r
            })
            .collect()
    }

    fn run(window: &[Reading], health: &HostHealthSample) -> Score {
        let t = Thresholds::default();
        score(
            &ScoringInput {
                window,
                health,
                thresholds: &t,
                capacity_mah: Some(5000.0),
            },
            &Weights::default(),
        )
    }

    // -----------------------------------------------------------------------
    // Rule tests
    // -----------------------------------------------------------------------

    #[test]
    fn test_three_low_readings_fire_fixed_penalty() {
        let s = run(&volts(&[12.0, 11.9, 10.4, 10.3, 10.2]), &HostHealthSample::default());
        assert_eq!(s.value, 75.0);
        assert_eq!(s.factors.len(), 1);
        assert_eq!(s.factors[0].kind, FactorKind::SustainedLowVoltage);
        assert_eq!(s.factors[0].magnitude, 10.2);
    }

    #[test]
    fn test_two_low_readings_do_not_fire() {
        let s = run(&volts(&[12.0, 11.9, 10.8, 10.3, 10.2]), &HostHealthSample::default());
        assert_eq!(s.value, 0.0);
        assert!(s.factors.is_empty());
    }

    #[test]
    fn test_missing_voltage_breaks_streak() {
        let mut w = volts(&[10.0, 10.0, 10.0]);
        w[1].voltage_v = None;
        assert_eq!(run(&w, &HostHealthSample::default()).value, 0.0);
    }

    #[test]
    fn test_empty_inputs_score_zero() {
        let s = run(&[], &HostHealthSample::default());
        assert_eq!(s.value, 0.0);
    }

    #[test]
    fn test_log_errors_capped() {
        let h = HostHealthSample {
            error_lines: Some(4),
            critical_lines: Some(3),
            ..Default::default()
        };
        let s = run(&[], &h);
        assert_eq!(s.factors[0].kind, FactorKind::LogErrors);
        assert_eq!(s.factors[0].contribution, 45.0);
        assert_eq!(s.factors[0].magnitude, 7.0);

        let h = HostHealthSample {
            error_lines: Some(2),
            critical_lines: Some(0),
            ..Default::default()
        };
        assert_eq!(run(&[], &h).value, 30.0);
    }

    #[test]
    fn test_total_clamped_to_100() {
        let h = HostHealthSample {
            cpu_percent: Some(99.0),
            memory_percent: Some(98.0),
            load_avg: Some([12.0, 10.0, 9.0]),
            cpu_temp_c: Some(85.0),
            kernel_panic_lines: Some(1),
            error_lines: Some(10),
            ..Default::default()
        };
        let s = run(&volts(&[10.0, 10.0, 10.0]), &h);
        assert_eq!(s.value, 100.0);
        assert!(s.factors.iter().map(|f| f.contribution).sum::<f64>() > 100.0);
    }

    #[test]
    fn test_high_current_uses_magnitude() {
        let mut w = volts(&[12.0]);
        w[0].current_ma = Some(-4500.0);
        let s = run(&w, &HostHealthSample::default());
        assert_eq!(s.factors[0].kind, FactorKind::HighCurrent);
        assert!(!s.factors[0].estimated);
        assert_eq!(s.value, 25.0);
    }

    #[test]
    fn test_temperature_falls_back_to_reading() {
        let mut w = volts(&[12.0]);
        w[0].temperature_c = Some(81.0);
        let s = run(&w, &HostHealthSample::default());
        assert_eq!(s.factors[0].kind, FactorKind::HighTemperature);
    }

    #[test]
    fn test_load_normalized_by_cores() {
        let h = HostHealthSample {
            load_avg: Some([9.0, 8.0, 7.0]),
            cores: Some(4),
            ..Default::default()
        };
        assert_eq!(run(&[], &h).value, 20.0);

        let t = Thresholds {
            normalize_load_by_cores: true,
            ..Thresholds::default()
        };
        let s = score(
            &ScoringInput {
                window: &[],
                health: &h,
                thresholds: &t,
                capacity_mah: None,
            },
            &Weights::default(),
        );
        assert_eq!(s.value, 0.0);
    }

    #[test]
    fn test_battery_drain() {
        let t0 = Utc::now();
        let w: Vec<Reading> = (0..5)
            .map(|i| {
                let mut r = Reading::new(SourceId::FuelGauge);
                r.timestamp = t0 + chrono::Duration::seconds(15 * i);
                r.battery_percent = Some(80.0 - i as f64 * 1.0);
                r.power_source = PowerSource::Battery;
                r.voltage_v = Some(11.8);
                r
            })
            .collect();
        // 4 % over one minute.
        let rate = drain_rate_per_min(&w).unwrap();
        assert!((rate - 4.0).abs() < 1e-9);
        let s = run(&w, &HostHealthSample::default());
        assert!(s.factors.iter().any(|f| f.kind == FactorKind::BatteryDrain));

        let mut on_mains = w.clone();
        on_mains.last_mut().unwrap().power_source = PowerSource::External;
        assert!(drain_rate_per_min(&on_mains).is_none());
    }

    #[test]
    fn test_load_with_zero_cores_does_not_fire() {
        let h = HostHealthSample {
            load_avg: Some([9.0, 8.0, 7.0]),
            cores: Some(0),
            ..Default::default()
        };
        let t = Thresholds {
            normalize_load_by_cores: true,
            ..Thresholds::default()
        };
        let s = score(
            &ScoringInput {
                window: &[],
                health: &h,
                thresholds: &t,
                capacity_mah: None,
            },
            &Weights::default(),
        );
        assert!(s.factors.is_empty());
    }

    fn soc(pcts: &[f64], step_secs: i64) -> Vec<Reading> {
        let t0 = Utc::now();
        pcts.iter()
            .enumerate()
            .map(|(i, &p)| {
                let mut r = Reading::new(SourceId::FuelGauge);
                r.timestamp = t0 + chrono::Duration::seconds(step_secs * i as i64);
                r.battery_percent = Some(p);
                r.voltage_v = Some(11.8);
                r
            })
            .collect()
    }

    #[test]
    fn test_battery_level_bands() {
        let low = run(&soc(&[18.0], 5), &HostHealthSample::default());
        assert_eq!(low.factors.len(), 1);
        assert_eq!(low.factors[0].kind, FactorKind::LowBattery);
        assert_eq!(low.value, 20.0);

        let critical = run(&soc(&[9.5], 5), &HostHealthSample::default());
        assert_eq!(critical.factors.len(), 1);
        assert_eq!(critical.factors[0].kind, FactorKind::CriticalBattery);
        assert_eq!(critical.value, 45.0);

        assert!(run(&soc(&[20.0], 5), &HostHealthSample::default()).factors.is_empty());
        assert_eq!(FactorKind::LowBattery.metric(), "battery_level");
        assert_eq!(FactorKind::CriticalBattery.metric(), "battery_level");
        assert!(FactorKind::CriticalBattery.is_critical());
        assert!(!FactorKind::LowBattery.is_critical());
    }

    #[test]
    fn test_estimate_current_from_soc() {
        // 1 % of 5000 mAh over 15 s is 12 A of discharge.
        let w = soc(&[81.0, 80.5, 80.2, 80.0], 5);
        let ma = estimate_current_ma(&w, 5000.0).unwrap();
        assert!((ma + 12_000.0).abs() < 1e-6);

        // Too short a span gives no estimate.
        assert!(estimate_current_ma(&soc(&[81.0, 80.0], 5), 5000.0).is_none());
    }

    #[test]
    fn test_high_current_fires_from_estimate() {
        // 0.4 % of 5000 mAh over 15 s.
        let w = soc(&[60.0, 59.8, 59.7, 59.6], 5);
        let s = run(&w, &HostHealthSample::default());
        let f = s
            .factors
            .iter()
            .find(|f| f.kind == FactorKind::HighCurrent)
            .unwrap();
        assert!(f.estimated);
        assert!((f.magnitude - 4000.0 * 1.2).abs() < 1e-6);

        // Charging never counts as an estimated spike.
        let charging = soc(&[59.6, 59.7, 59.8, 60.0], 5);
        assert!(run(&charging, &HostHealthSample::default()).factors.is_empty());

        // A measured current wins over the estimate.
        let mut measured = w.clone();
        measured.last_mut().unwrap().current_ma = Some(-500.0);
        let s = run(&measured, &HostHealthSample::default());
        assert!(!s.factors.iter().any(|f| f.kind == FactorKind::HighCurrent));
    }

    #[test]
    fn test_score_is_pure() {
        let w = volts(&[10.0, 10.1, 10.2]);
        let h = HostHealthSample {
            cpu_percent: Some(97.0),
            ..Default::default()
        };
        assert_eq!(run(&w, &h), run(&w, &h));
    }

    // -----------------------------------------------------------------------
    // Hysteresis tests
    // -----------------------------------------------------------------------

    fn feed(m: &mut RiskStateMachine, scores: &[f64]) -> Vec<RiskState> {
        let t = Thresholds::default();
        scores
            .iter()
            .map(|&s| {
                m.update(s, &t, Utc::now());
                m.state()
            })
            .collect()
    }

    #[test]
    fn test_warning_needs_two_ticks() {
        let mut m = RiskStateMachine::new(Utc::now());
        let states = feed(&mut m, &[45.0, 30.0, 45.0, 50.0]);
        use RiskState::*;
        assert_eq!(states, vec![Normal, Normal, Normal, Warning]);
    }

    #[test]
    fn test_critical_is_immediate() {
        let mut m = RiskStateMachine::new(Utc::now());
        assert_eq!(feed(&mut m, &[75.0]), vec![RiskState::Critical]);
    }

    #[test]
    fn test_one_tick_dip_keeps_warning() {
        let mut m = RiskStateMachine::new(Utc::now());
        use RiskState::*;
        let states = feed(&mut m, &[50.0, 50.0, 10.0, 50.0, 10.0, 10.0]);
        assert_eq!(states, vec![Normal, Warning, Warning, Warning, Warning, Warning]);
        assert_eq!(feed(&mut m, &[10.0]), vec![Normal]);
    }

    #[test]
    fn test_critical_steps_down_through_warning() {
        let mut m = RiskStateMachine::new(Utc::now());
        use RiskState::*;
        let states = feed(&mut m, &[80.0, 50.0, 50.0, 50.0, 50.0]);
        assert_eq!(states, vec![Critical, Critical, Critical, Warning, Warning]);
    }

    #[test]
    fn test_critical_to_normal_directly() {
        let mut m = RiskStateMachine::new(Utc::now());
        let t = Thresholds::default();
        m.update(90.0, &t, Utc::now());
        assert_eq!(m.update(0.0, &t, Utc::now()), None);
        assert_eq!(m.update(0.0, &t, Utc::now()), None);
        assert_eq!(
            m.update(0.0, &t, Utc::now()),
            Some(Transition {
                from: RiskState::Critical,
                to: RiskState::Normal
            })
        );
    }

    #[test]
    fn test_assess_records_since() {
        let t0 = Utc::now();
        let mut m = RiskStateMachine::new(t0);
        let w = volts(&[10.0, 10.0, 10.0]);
        let h = HostHealthSample::default();
        let th = Thresholds::default();
        let later = t0 + chrono::Duration::seconds(10);
        let (a, tr) = m.assess(
            &ScoringInput {
                window: &w,
                health: &h,
                thresholds: &th,
                capacity_mah: None,
            },
            &Weights::default(),
            later,
        );
        assert_eq!(a.state, RiskState::Critical);
        assert_eq!(a.state_since, later);
        assert_eq!(a.score, 75.0);
        assert!(a.has_factor(FactorKind::SustainedLowVoltage));
        assert_eq!(tr.unwrap().from, RiskState::Normal);
    }
}
