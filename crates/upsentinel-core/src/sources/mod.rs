//! Sensor source implementations and the bus plumbing they share.

pub mod helpers;

pub mod current_sensor;
pub mod fuel_gauge;
pub mod gpio;
pub mod host_stats;
pub mod i2c;

use std::sync::Arc;

use crate::config::SourcesConfig;
use crate::reading::SourceId;
use crate::source::SensorSource;

pub use current_sensor::CurrentSensorSource;
pub use fuel_gauge::FuelGaugeSource;
pub use gpio::SignalLines;
pub use host_stats::HostStatsSource;

/// Construct one source.
pub fn build_source(id: SourceId, cfg: &SourcesConfig) -> Box<dyn SensorSource> {
    match id {
        SourceId::FuelGauge => Box::new(FuelGaugeSource::new(
            i2c::linux_buses(&cfg.i2c_buses),
            cfg.fuel_gauge_address,
            cfg.cells_in_series,
        )),
        SourceId::CurrentSensor => Box::new(CurrentSensorSource::new(
            i2c::linux_buses(&cfg.i2c_buses),
            cfg.current_sensor_addresses.clone(),
            cfg.shunt_ohms,
        )),
        SourceId::HostStats => Box::new(HostStatsSource::new(cfg.power_supply_root.clone())),
    }
}

/// Every known source, those named in `cfg.order` first. Sources left out
/// of the order are still registered so the order can be changed at runtime.
pub fn registered_sources(cfg: &SourcesConfig) -> Vec<Arc<dyn SensorSource>> {
    let rest = SourceId::ALL.into_iter().filter(|id| !cfg.order.contains(id));
    cfg.order
        .iter()
        .copied()
        .chain(rest)
        .map(|id| -> Arc<dyn SensorSource> { Arc::from(build_source(id, cfg)) })
        .collect()
}
