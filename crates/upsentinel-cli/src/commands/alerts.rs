//! `upsentinel alerts`: list and acknowledge alerts.

use chrono::{Duration, Utc};
use upsentinel_core::{AlertEvent, AlertHistory, MonitorConfig};
use uuid::Uuid;

pub fn run(config: &MonitorConfig, last: usize, minutes: Option<i64>, ack: Option<&str>, json: bool) {
    let history = match AlertHistory::open(&config.recorder.data_dir) {
        Ok(h) => h,
        Err(e) => {
            eprintln!("Error opening alert history: {e}");
            std::process::exit(1);
        }
    };

    if let Some(id) = ack {
        let Ok(id) = Uuid::parse_str(id) else {
            eprintln!("Error: '{id}' is not an alert id");
            std::process::exit(1);
        };
        match history.acknowledge(id) {
            Ok(Some(e)) => println!("Acknowledged {} ({})", e.id, e.fingerprint),
            Ok(None) => {
                eprintln!("Error: no alert with id {id}");
                std::process::exit(1);
            }
            Err(e) => {
                eprintln!("Error: {e}");
                std::process::exit(1);
            }
        }
        return;
    }

    let events: Vec<AlertEvent> = match minutes {
        Some(m) => {
            let mut v = history.since(Utc::now() - Duration::minutes(m));
            v.reverse();
            v.truncate(last);
            v
        }
        None => history.recent(last),
    };

    if json {
        match serde_json::to_string_pretty(&events) {
            Ok(s) => println!("{s}"),
            Err(e) => {
                eprintln!("Error: {e}");
                std::process::exit(1);
            }
        }
        return;
    }

    if events.is_empty() {
        println!("No alerts.");
        return;
    }
    for e in &events {
        let ack = if e.acknowledged { " [ack]" } else { "" };
        let suppressed = if e.suppressed_before > 0 {
            format!(" (+{} suppressed)", e.suppressed_before)
        } else {
            String::new()
        };
        println!(
            "{}  {:<8} {:<26} {:<7} {}{suppressed}{ack}",
            e.timestamp.format("%Y-%m-%d %H:%M:%S"),
            e.severity.as_str(),
            e.fingerprint.to_string(),
            e.status.to_string(),
            e.message
        );
        if let Some(err) = &e.last_error {
            println!("{:>21}last error after {} attempt(s): {err}", "", e.attempts);
        }
        println!("{:>21}id {}", "", e.id);
    }
}
