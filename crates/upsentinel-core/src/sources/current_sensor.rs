//! CurrentSensorSource: INA219-class shunt monitor over I2C.
//!
//! Bus voltage and shunt voltage registers give pack voltage and signed
//! current. Negative current means the battery is discharging into the board.

use std::sync::{Mutex, PoisonError};

use log::debug;

use crate::error::SensorUnavailable;
use crate::reading::{PowerSource, Reading, SourceId};
use crate::source::{SensorSource, SourceInfo, Transport};

use super::i2c::I2cBus;

/// Candidate addresses, tried in order (A0/A1 strap combinations).
pub const CURRENT_SENSOR_ADDRESSES: [u8; 6] = [0x40, 0x41, 0x42, 0x43, 0x44, 0x45];

/// Shunt voltage, signed, 10 µV/LSB.
pub const REG_SHUNT: u8 = 0x01;
/// Bus voltage, bits 15..3, 4 mV/LSB.
pub const REG_BUS: u8 = 0x02;

/// Raw bus-voltage word to volts.
pub fn bus_voltage(raw: u16) -> f64 {
    f64::from(raw >> 3) * 4.0 / 1000.0
}

/// Raw shunt word to millivolts.
pub fn shunt_millivolts(raw: u16) -> f64 {
    f64::from(raw as i16) * 0.01
}

pub struct CurrentSensorSource {
    info: SourceInfo,
    buses: Vec<Box<dyn I2cBus>>,
    addresses: Vec<u8>,
    shunt_ohms: f64,
    /// `(bus index, address)` that answered last.
    found: Mutex<Option<(usize, u8)>>,
}

impl CurrentSensorSource {
    pub fn new(buses: Vec<Box<dyn I2cBus>>, addresses: Vec<u8>, shunt_ohms: f64) -> Self {
        Self {
            info: SourceInfo {
                id: SourceId::CurrentSensor,
                description: "INA219-class shunt monitor: bus voltage, current, power",
                measures: "Bus voltage (reg 0x02, (raw >> 3) x 4 mV); shunt voltage (reg 0x01, \
                    signed 10 uV/LSB) over the shunt resistance gives current; power = V x I.",
                transport: Transport::I2c,
                addresses: &CURRENT_SENSOR_ADDRESSES,
            },
            buses,
            addresses,
            shunt_ohms,
            found: Mutex::new(None),
        }
    }

    /// Every `(bus, address)` candidate, last known-good first.
    fn candidates(&self) -> Vec<(usize, u8)> {
        let mut all: Vec<(usize, u8)> = (0..self.buses.len())
            .flat_map(|b| self.addresses.iter().map(move |&a| (b, a)))
            .collect();
        let hit = *self.found.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(pos) = hit.and_then(|h| all.iter().position(|&c| c == h)) {
            let first = all.remove(pos);
            all.insert(0, first);
        }
        all
    }

    /// Find the sensor: returns `(bus number, address)`.
    pub fn detect(&self) -> Option<(u8, u8)> {
        self.candidates().into_iter().find_map(|(b, a)| {
            let bus = &self.buses[b];
            bus.read_word_be(a, REG_BUS).ok().map(|_| (bus.number(), a))
        })
    }
}

impl SensorSource for CurrentSensorSource {
    fn info(&self) -> &SourceInfo {
        &self.info
    }

    fn sample(&self) -> Result<Reading, SensorUnavailable> {
        if self.buses.is_empty() {
            return Err(SensorUnavailable::NotDetected("no I2C bus available".into()));
        }
        for (b, addr) in self.candidates() {
            let bus = &self.buses[b];
            let words = bus
                .read_word_be(addr, REG_BUS)
                .and_then(|v| Ok((v, bus.read_word_be(addr, REG_SHUNT)?)));
            let (bus_raw, shunt_raw) = match words {
                Ok(w) => w,
                Err(e) => {
                    debug!("current sensor: bus {} addr 0x{addr:02x}: {e}", bus.number());
                    continue;
                }
            };
            *self.found.lock().unwrap_or_else(PoisonError::into_inner) = Some((b, addr));

            let volts = bus_voltage(bus_raw);
            let current_ma = shunt_millivolts(shunt_raw) / self.shunt_ohms;

            let mut r = Reading::new(SourceId::CurrentSensor);
            r.voltage_v = Some(volts);
            r.current_ma = Some(current_ma);
            r.power_mw = Some(volts * current_ma);
            r.power_source = if current_ma < 0.0 {
                PowerSource::Battery
            } else {
                PowerSource::External
            };
            // A powered sensor reporting 0 V on the bus isn't wired to anything.
            r.valid = volts > 0.0;
            return Ok(r);
        }
        Err(SensorUnavailable::NotDetected(format!(
            "current sensor at {:02x?}",
            self.addresses
        )))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sources::i2c::mock::MockBus;

    fn sensor_on(buses: Vec<MockBus>) -> CurrentSensorSource {
        CurrentSensorSource::new(
            buses.into_iter().map(|b| Box::new(b) as Box<dyn I2cBus>).collect(),
            CURRENT_SENSOR_ADDRESSES.to_vec(),
            0.1,
        )
    }

    // -----------------------------------------------------------------------
    // Conversion tests
    // -----------------------------------------------------------------------

    #[test]
    fn test_bus_voltage_conversion() {
        // 12.0 V = 3000 LSB << 3
        assert!((bus_voltage(3000 << 3) - 12.0).abs() < 1e-9);
        // Low three status bits are ignored.
        assert!((bus_voltage((3000 << 3) | 0b011) - 12.0).abs() < 1e-9);
    }

    #[test]
    fn test_shunt_is_signed() {
        assert!((shunt_millivolts(1000) - 10.0).abs() < 1e-9);
        assert!((shunt_millivolts((-500i16) as u16) + 5.0).abs() < 1e-9);
    }

    // -----------------------------------------------------------------------
    // Sampling tests
    // -----------------------------------------------------------------------

    #[test]
    fn test_discharging_reads_as_battery() {
        // -20 mV over 0.1 Ω = -200 mA
        let bus = MockBus::new(1)
            .with(0x40, REG_BUS, 2750 << 3)
            .with(0x40, REG_SHUNT, (-2000i16) as u16);
        let r = sensor_on(vec![bus]).sample().unwrap();
        assert_eq!(r.source, SourceId::CurrentSensor);
        assert!((r.voltage_v.unwrap() - 11.0).abs() < 1e-9);
        assert!((r.current_ma.unwrap() + 200.0).abs() < 1e-9);
        assert!((r.power_mw.unwrap() + 2200.0).abs() < 1e-6);
        assert_eq!(r.power_source, PowerSource::Battery);
        assert!(r.battery_percent.is_none());
        assert!(r.valid);
    }

    #[test]
    fn test_detects_later_address_and_bus() {
        let empty = MockBus::new(1);
        let bus = MockBus::new(4)
            .with(0x44, REG_BUS, 3000 << 3)
            .with(0x44, REG_SHUNT, 500);
        let s = sensor_on(vec![empty, bus]);
        let r = s.sample().unwrap();
        assert_eq!(r.power_source, PowerSource::External);
        assert_eq!(s.candidates()[0], (1, 0x44));
        assert_eq!(s.detect(), Some((4, 0x44)));
    }

    #[test]
    fn test_zero_bus_voltage_invalid() {
        let bus = MockBus::new(1).with(0x40, REG_BUS, 0).with(0x40, REG_SHUNT, 0);
        let r = sensor_on(vec![bus]).sample().unwrap();
        assert!(!r.valid);
    }

    #[test]
    fn test_absent_sensor() {
        let err = sensor_on(vec![MockBus::new(1)]).sample().unwrap_err();
        assert!(matches!(err, SensorUnavailable::NotDetected(_)));
    }
}
