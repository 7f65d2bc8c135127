//! `upsentinel status`: show the monitor's last published snapshot.

use chrono::Utc;
use upsentinel_core::{MonitorConfig, StatusSnapshot};

use super::{fmt_opt, reading_line};

pub fn run(config: &MonitorConfig, json: bool) {
    let dir = &config.recorder.data_dir;
    let snap = match StatusSnapshot::load(dir) {
        Ok(Some(s)) => s,
        Ok(None) => {
            eprintln!("No status in {}; is the monitor running?", dir.display());
            std::process::exit(1);
        }
        Err(e) => {
            eprintln!("Error reading status: {e}");
            std::process::exit(1);
        }
    };

    if json {
        match serde_json::to_string_pretty(&snap) {
            Ok(s) => println!("{s}"),
            Err(e) => {
                eprintln!("Error: {e}");
                std::process::exit(1);
            }
        }
        return;
    }

    if let Some(at) = snap.updated_at {
        let age = (Utc::now() - at).num_seconds();
        println!("Updated {} ({age}s ago), tick {}", at.format("%Y-%m-%d %H:%M:%S"), snap.ticks);
    }
    match &snap.assessment {
        Some(a) => {
            println!("Risk:     {} (score {:.0}) since {}", a.state, a.score, a.state_since.format("%H:%M:%S"));
            for f in &a.factors {
                println!("          {:<18} +{:.0}", f.kind.as_str(), f.contribution);
            }
        }
        None => println!("Risk:     not yet assessed"),
    }
    match &snap.latest {
        Some(r) => println!("Latest:   {}", reading_line(r)),
        None => println!("Latest:   no readings"),
    }
    if let Some(since) = snap.on_battery_since {
        println!(
            "Battery:  on battery since {}, drain {}, est. runtime {}",
            since.format("%H:%M:%S"),
            fmt_opt(snap.drain_percent_per_min, "%/min", 2),
            fmt_opt(snap.estimated_runtime_min, " min", 0)
        );
    }

    let h = &snap.health;
    println!(
        "Host:     cpu {}  mem {}  temp {}  load {}",
        fmt_opt(h.cpu_percent, "%", 0),
        fmt_opt(h.memory_percent, "%", 0),
        fmt_opt(h.cpu_temp_c, "C", 1),
        h.load_avg
            .map(|l| format!("{:.2} {:.2} {:.2}", l[0], l[1], l[2]))
            .unwrap_or_else(|| "-".into())
    );

    println!(
        "\nSources ({}/{} healthy, missing streak {}):",
        snap.sources.healthy, snap.sources.total, snap.missing_streak
    );
    for s in &snap.sources.sources {
        let mark = if s.healthy { "\u{2705}" } else { "\u{274C}" };
        let active = if snap.active_source == Some(s.id) { " *" } else { "" };
        println!(
            "  {mark} {:<15} ok {:>6}  fail {:>6}{active}{}",
            s.id.as_str(),
            s.successes,
            s.failures,
            s.last_error
                .as_deref()
                .map(|e| format!("  ({e})"))
                .unwrap_or_default()
        );
    }

    println!(
        "\nRecorder: {} written, {} lost",
        snap.readings_written, snap.readings_lost
    );
    if !snap.suppressed.is_empty() {
        println!("Suppressed in cooldown:");
        for (fp, n) in &snap.suppressed {
            println!("  {fp:<28} {n}");
        }
    }
    if !snap.heartbeat.is_empty() {
        println!("Heartbeat:");
        for s in &snap.heartbeat {
            println!(
                "  {:<36} ok {:>5}  fail {:>5}{}",
                s.url,
                s.successes,
                s.failures,
                s.last_error
                    .as_deref()
                    .map(|e| format!("  ({e})"))
                    .unwrap_or_default()
            );
        }
    }
}
