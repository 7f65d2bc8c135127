//! `upsentinel run`: the monitoring daemon.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use log::info;
use upsentinel_core::{MonitorConfig, Pipeline};

pub fn run(config: MonitorConfig, ticks: u64) {
    let mut pipeline = match Pipeline::from_config(config) {
        Ok(p) => p,
        Err(e) => {
            eprintln!("Error: {e}");
            std::process::exit(1);
        }
    };

    let stop = Arc::new(AtomicBool::new(false));
    let s = Arc::clone(&stop);
    if let Err(e) = ctrlc::set_handler(move || {
        s.store(true, Ordering::SeqCst);
    }) {
        eprintln!("Error setting Ctrl+C handler: {e}");
        std::process::exit(1);
    }

    info!("upsentinel {} starting", upsentinel_core::VERSION);
    if ticks == 0 {
        pipeline.run(&stop);
    } else {
        pipeline.start_heartbeat();
        let interval = pipeline.config().poll.interval();
        for i in 0..ticks {
            if stop.load(Ordering::SeqCst) {
                break;
            }
            let report = pipeline.tick();
            println!(
                "tick {}: score {:.0} ({}), {} alert(s)",
                i + 1,
                report.assessment.score,
                report.assessment.state,
                report.events.len()
            );
            if i + 1 < ticks {
                std::thread::sleep(interval);
            }
        }
        pipeline.shutdown();
    }
    info!("upsentinel stopped");
}
