//! `upsentinel config`: print the effective configuration.

use upsentinel_core::MonitorConfig;

pub fn run(config: &MonitorConfig) {
    match config.to_toml_string() {
        Ok(s) => print!("{s}"),
        Err(e) => {
            eprintln!("Error: {e}");
            std::process::exit(1);
        }
    }
}
