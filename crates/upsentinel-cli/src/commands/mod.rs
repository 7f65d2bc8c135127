pub mod alerts;
pub mod config;
pub mod history;
pub mod run;
pub mod scan;
pub mod status;

use std::path::Path;

use upsentinel_core::{MonitorConfig, Reading};

/// Load and validate the configuration, applying CLI overrides.
/// Exits with status 1 on any error.
pub fn load_config(path: Option<&Path>, data_dir: Option<&Path>) -> MonitorConfig {
    let mut config = match MonitorConfig::load_or_default(path) {
        Ok(c) => c,
        Err(e) => {
            eprintln!("Error: {e}");
            std::process::exit(1);
        }
    };
    if let Some(dir) = data_dir {
        config.recorder.data_dir = dir.to_path_buf();
    }
    if let Err(e) = config.validate() {
        eprintln!("Error: {e}");
        std::process::exit(1);
    }
    config
}

/// Format an optional measurement, `-` when absent.
pub fn fmt_opt(v: Option<f64>, unit: &str, precision: usize) -> String {
    match v {
        Some(x) => format!("{x:.precision$}{unit}"),
        None => "-".to_string(),
    }
}

/// One-line human summary of a reading.
pub fn reading_line(r: &Reading) -> String {
    format!(
        "{}  {:<14} {:>8} {:>10} {:>6} {:>7}  {:<8} {}{}",
        r.timestamp.format("%Y-%m-%d %H:%M:%S"),
        r.source.as_str(),
        fmt_opt(r.voltage_v, "V", 2),
        fmt_opt(r.current_ma, "mA", 0),
        fmt_opt(r.battery_percent, "%", 0),
        fmt_opt(r.temperature_c, "C", 1),
        r.power_source.as_str(),
        r.charging.as_str(),
        if r.valid { "" } else { "  (invalid)" },
    )
}
