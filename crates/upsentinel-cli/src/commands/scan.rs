//! `upsentinel scan`: sample every sensor source once.

use upsentinel_core::sources::{SignalLines, registered_sources};
use upsentinel_core::{MonitorConfig, SensorSource, SourceSelector};

use super::reading_line;

pub fn run(config: &MonitorConfig, json: bool) {
    let sources = registered_sources(&config.sources);
    let infos: Vec<_> = sources.iter().map(|s| s.info().clone()).collect();
    let selector = SourceSelector::new(
        sources,
        config.sources.order.clone(),
        config.poll.sample_timeout(),
        config.poll.missing_ticks_alert,
    );
    let lines = config.gpio.enabled.then(|| SignalLines::new(&config.gpio));

    let results = selector.sample_all();
    if json {
        let out: Vec<serde_json::Value> = results
            .iter()
            .map(|(id, r)| match r {
                Ok(reading) => serde_json::json!({ "source": id, "reading": reading }),
                Err(e) => serde_json::json!({ "source": id, "error": e.to_string() }),
            })
            .collect();
        match serde_json::to_string_pretty(&out) {
            Ok(s) => println!("{s}"),
            Err(e) => {
                eprintln!("Error: {e}");
                std::process::exit(1);
            }
        }
        return;
    }

    println!("Probing {} sensor source(s):\n", results.len());
    for (id, result) in &results {
        let desc = infos
            .iter()
            .find(|i| i.id == *id)
            .map(|i| i.description)
            .unwrap_or("");
        match result {
            Ok(r) if r.valid => println!("  \u{2705} {:<15} {desc}", id.as_str()),
            Ok(_) => println!("  \u{26A0}\u{FE0F}  {:<15} answered with unusable data", id.as_str()),
            Err(e) => println!("  \u{274C} {:<15} {e}", id.as_str()),
        }
        if let Ok(r) = result {
            let mut r = r.clone();
            if let Some(lines) = &lines {
                lines.augment(&mut r);
            }
            println!("     {}", reading_line(&r));
        }
    }

    let order: Vec<&str> = config.sources.order.iter().map(|id| id.as_str()).collect();
    println!("\nFallback order: {}", order.join(" -> "));
    if let Some(lines) = &lines {
        println!(
            "GPIO: power {}  charging {}",
            lines.power_source().map_or("unreadable", |p| p.as_str()),
            lines.charging().map_or("unreadable", |c| c.as_str())
        );
    }
}
