//! FuelGaugeSource: MAX17040-class battery fuel gauge over I2C.
//!
//! Reads the VCELL and SOC registers. The gauge measures a single cell, so the
//! cell voltage is scaled by the configured number of cells in series to get
//! the pack voltage the risk thresholds are written against.

use std::sync::{Mutex, PoisonError};

use log::debug;

use crate::error::SensorUnavailable;
use crate::reading::{Reading, SourceId, clamp_percent};
use crate::source::{SensorSource, SourceInfo, Transport};

use super::i2c::I2cBus;

/// Default 7-bit address.
pub const FUEL_GAUGE_ADDRESS: u8 = 0x36;

/// Cell voltage, 12 bits left-aligned, 1.25 mV/LSB.
pub const REG_VCELL: u8 = 0x02;
/// State of charge, high byte = %, low byte = 1/256 %.
pub const REG_SOC: u8 = 0x04;
/// IC version, used only to detect presence.
pub const REG_VERSION: u8 = 0x08;

/// Convert a raw VCELL word to volts.
pub fn cell_voltage(raw: u16) -> f64 {
    f64::from(raw >> 4) * 1.25 / 1000.0
}

/// Convert a raw SOC word to percent (not clamped).
pub fn soc_percent(raw: u16) -> f64 {
    f64::from(raw) / 256.0
}

/// The gauge keeps answering with plausible-looking numbers when no cell is
/// fitted: the charger's float voltage with a mid-range SOC, or an empty SOC,
/// or a cell voltage no lithium cell survives.
pub fn looks_disconnected(cell_v: f64, soc: f64) -> bool {
    let float_signature = (4.19..=4.21).contains(&cell_v) && (36.0..=43.0).contains(&soc);
    float_signature || soc < 0.1 || cell_v < 2.5
}

pub struct FuelGaugeSource {
    info: SourceInfo,
    buses: Vec<Box<dyn I2cBus>>,
    address: u8,
    cells_in_series: u32,
    /// Index into `buses` of the last bus that answered.
    last_bus: Mutex<Option<usize>>,
}

impl FuelGaugeSource {
    pub fn new(buses: Vec<Box<dyn I2cBus>>, address: u8, cells_in_series: u32) -> Self {
        Self {
            info: SourceInfo {
                id: SourceId::FuelGauge,
                description: "MAX17040-class fuel gauge: pack voltage and state of charge",
                measures: "VCELL (reg 0x02, (raw >> 4) x 1.25 mV) scaled by cells in series; \
                    SOC (reg 0x04, raw / 256 %). Version reg 0x08 confirms presence.",
                transport: Transport::I2c,
                addresses: &[FUEL_GAUGE_ADDRESS],
            },
            buses,
            address,
            cells_in_series: cells_in_series.max(1),
            last_bus: Mutex::new(None),
        }
    }

    /// Find the gauge: returns `(bus number, version word)`.
    pub fn detect(&self) -> Option<(u8, u16)> {
        self.buses.iter().find_map(|bus| {
            bus.read_word_be(self.address, REG_VERSION)
                .ok()
                .map(|v| (bus.number(), v))
        })
    }

    /// Buses in try order: the one that answered last time first.
    fn bus_order(&self) -> Vec<usize> {
        let preferred = *self.last_bus.lock().unwrap_or_else(PoisonError::into_inner);
        let mut order: Vec<usize> = (0..self.buses.len()).collect();
        if let Some(p) = preferred.filter(|&p| p < order.len()) {
            order.retain(|&i| i != p);
            order.insert(0, p);
        }
        order
    }

    fn read_registers(&self) -> Result<(u16, u16), SensorUnavailable> {
        if self.buses.is_empty() {
            return Err(SensorUnavailable::NotDetected("no I2C bus available".into()));
        }
        let mut last_error = None;
        for idx in self.bus_order() {
            let bus = &self.buses[idx];
            let regs = bus
                .read_word_be(self.address, REG_VCELL)
                .and_then(|v| Ok((v, bus.read_word_be(self.address, REG_SOC)?)));
            match regs {
                Ok(words) => {
                    *self.last_bus.lock().unwrap_or_else(PoisonError::into_inner) = Some(idx);
                    return Ok(words);
                }
                Err(e) => {
                    debug!(
                        "fuel gauge: bus {} addr 0x{:02x}: {e}",
                        bus.number(),
                        self.address
                    );
                    last_error = Some(e);
                }
            }
        }
        let detail = last_error.map(|e| e.to_string()).unwrap_or_default();
        Err(SensorUnavailable::NotDetected(format!(
            "fuel gauge at 0x{:02x}: {detail}",
            self.address
        )))
    }
}

impl SensorSource for FuelGaugeSource {
    fn info(&self) -> &SourceInfo {
        &self.info
    }

    fn sample(&self) -> Result<Reading, SensorUnavailable> {
        let (vcell_raw, soc_raw) = self.read_registers()?;
        let cell_v = cell_voltage(vcell_raw);
        let soc = soc_percent(soc_raw);

        let mut r = Reading::new(SourceId::FuelGauge);
        r.voltage_v = Some(cell_v * f64::from(self.cells_in_series));
        r.battery_percent = Some(clamp_percent(soc));
        r.valid = !looks_disconnected(cell_v, soc);
        if !r.valid {
            debug!("fuel gauge: no-battery signature ({cell_v:.3} V/cell, {soc:.1}%)");
        }
        Ok(r)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sources::i2c::mock::MockBus;

    /// Encode a cell voltage the way the gauge does.
    fn vcell_raw(volts: f64) -> u16 {
        (((volts * 1000.0 / 1.25).round() as u16) << 4) & 0xFFF0
    }

    fn gauge_on(bus: MockBus) -> FuelGaugeSource {
        FuelGaugeSource::new(vec![Box::new(bus)], FUEL_GAUGE_ADDRESS, 3)
    }

    // -----------------------------------------------------------------------
    // Conversion tests
    // -----------------------------------------------------------------------

    #[test]
    fn test_cell_voltage_conversion() {
        // 0xD000 >> 4 = 3328 → 4.16 V
        assert!((cell_voltage(0xD000) - 4.16).abs() < 1e-9);
        assert_eq!(cell_voltage(0x000F), 0.0);
    }

    #[test]
    fn test_soc_conversion() {
        assert!((soc_percent(0x5080) - 80.5).abs() < 1e-9);
        assert_eq!(soc_percent(0), 0.0);
    }

    #[test]
    fn test_no_battery_signature() {
        assert!(looks_disconnected(4.20, 40.0));
        assert!(looks_disconnected(3.9, 0.05));
        assert!(looks_disconnected(1.2, 60.0));
        assert!(!looks_disconnected(3.9, 72.0));
        assert!(!looks_disconnected(4.20, 99.0));
    }

    // -----------------------------------------------------------------------
    // Sampling tests
    // -----------------------------------------------------------------------

    #[test]
    fn test_sample_scales_pack_voltage() {
        let bus = MockBus::new(1)
            .with(0x36, REG_VCELL, vcell_raw(3.8))
            .with(0x36, REG_SOC, 0x4B00);
        let r = gauge_on(bus).sample().unwrap();
        assert_eq!(r.source, SourceId::FuelGauge);
        assert!(r.valid);
        assert!((r.voltage_v.unwrap() - 11.4).abs() < 0.01);
        assert_eq!(r.battery_percent, Some(75.0));
        assert!(r.current_ma.is_none());
    }

    #[test]
    fn test_sample_clamps_soc() {
        let bus = MockBus::new(1)
            .with(0x36, REG_VCELL, vcell_raw(4.1))
            .with(0x36, REG_SOC, 0x6800); // 104 %
        let r = gauge_on(bus).sample().unwrap();
        assert_eq!(r.battery_percent, Some(100.0));
    }

    #[test]
    fn test_sample_flags_missing_battery() {
        let bus = MockBus::new(1)
            .with(0x36, REG_VCELL, vcell_raw(4.2))
            .with(0x36, REG_SOC, 0x2800); // 40 %
        let r = gauge_on(bus).sample().unwrap();
        assert!(!r.valid);
    }

    #[test]
    fn test_falls_through_to_second_bus() {
        let dead = MockBus::new(1);
        let live = MockBus::new(11)
            .with(0x36, REG_VCELL, vcell_raw(3.7))
            .with(0x36, REG_SOC, 0x3200)
            .with(0x36, REG_VERSION, 0x0002);
        let g = FuelGaugeSource::new(vec![Box::new(dead), Box::new(live)], 0x36, 3);
        assert!(g.sample().is_ok());
        assert_eq!(g.bus_order(), vec![1, 0]);
        assert_eq!(g.detect(), Some((11, 0x0002)));
    }

    #[test]
    fn test_no_device_is_not_detected() {
        let err = gauge_on(MockBus::new(1)).sample().unwrap_err();
        assert!(matches!(err, SensorUnavailable::NotDetected(_)));
    }

    #[test]
    fn test_no_buses() {
        let g = FuelGaugeSource::new(Vec::new(), 0x36, 3);
        assert!(matches!(g.sample(), Err(SensorUnavailable::NotDetected(_))));
        assert_eq!(g.detect(), None);
    }
}
