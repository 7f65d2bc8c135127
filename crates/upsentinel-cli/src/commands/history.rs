//! `upsentinel history`: print recorded readings.

use chrono::{Duration, Utc};
use upsentinel_core::recorder::{ReadingRange, TelemetryRecorder};
use upsentinel_core::{MonitorConfig, Reading};

use super::reading_line;

pub fn run(config: &MonitorConfig, minutes: Option<i64>, last: usize, json: bool) {
    let recorder = match TelemetryRecorder::open(&config.recorder) {
        Ok(r) => r,
        Err(e) => {
            eprintln!("Error opening {}: {e}", config.recorder.data_dir.display());
            std::process::exit(1);
        }
    };

    let rows: Vec<Reading> = match minutes {
        Some(m) => {
            let now = Utc::now();
            let range: ReadingRange = recorder.range(now - Duration::minutes(m), now);
            range.iter().collect()
        }
        None => recorder.tail(last),
    };

    if rows.is_empty() {
        println!("No readings recorded.");
        return;
    }
    for r in &rows {
        if json {
            match serde_json::to_string(r) {
                Ok(s) => println!("{s}"),
                Err(e) => eprintln!("Error: {e}"),
            }
        } else {
            println!("{}", reading_line(r));
        }
    }
    if !json {
        println!("\n{} reading(s), {} lost this session", rows.len(), recorder.lost());
    }
}
