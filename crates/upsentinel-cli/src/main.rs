//! CLI for upsentinel: watch a UPS HAT, score crash risk, raise alerts.

mod commands;

use std::path::PathBuf;

use clap::{Parser, Subcommand};

#[derive(Parser)]
#[command(name = "upsentinel")]
#[command(about = "upsentinel: crash-risk monitor for UPS-backed single-board computers")]
#[command(version = upsentinel_core::VERSION)]
struct Cli {
    /// Config file (TOML). Defaults to /etc/upsentinel/config.toml when present.
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Override the data directory (readings, alerts, status)
    #[arg(long, global = true)]
    data_dir: Option<PathBuf>,

    /// Log level when RUST_LOG is unset: error, warn, info, debug, trace
    #[arg(long, global = true, default_value = "info")]
    log_level: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the monitor until interrupted
    Run {
        /// Stop after this many ticks (0 = run until Ctrl+C)
        #[arg(long, default_value = "0")]
        ticks: u64,
    },

    /// Sample every sensor source once and print what answered
    Scan {
        /// Print readings as JSON
        #[arg(long)]
        json: bool,
    },

    /// Show the latest status snapshot written by the monitor
    Status {
        /// Print the raw snapshot as JSON
        #[arg(long)]
        json: bool,
    },

    /// Print recorded readings
    History {
        /// Only readings from the last N minutes
        #[arg(long)]
        minutes: Option<i64>,

        /// Only the last N readings
        #[arg(long, default_value = "20")]
        last: usize,

        /// Print as JSON lines
        #[arg(long)]
        json: bool,
    },

    /// List alerts, newest first
    Alerts {
        /// Number of alerts to show
        #[arg(long, default_value = "20")]
        last: usize,

        /// Only alerts from the last N minutes
        #[arg(long)]
        minutes: Option<i64>,

        /// Mark an alert as acknowledged
        #[arg(long)]
        ack: Option<String>,

        /// Print as JSON
        #[arg(long)]
        json: bool,
    },

    /// Print the effective configuration as TOML
    Config {
        /// Print built-in defaults instead of the loaded file
        #[arg(long)]
        defaults: bool,
    },
}

fn main() {
    let cli = Cli::parse();

    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(&cli.log_level))
        .format_timestamp_millis()
        .init();

    let config = if matches!(cli.command, Commands::Config { defaults: true }) {
        upsentinel_core::MonitorConfig::default()
    } else {
        commands::load_config(cli.config.as_deref(), cli.data_dir.as_deref())
    };

    match cli.command {
        Commands::Run { ticks } => commands::run::run(config, ticks),
        Commands::Scan { json } => commands::scan::run(&config, json),
        Commands::Status { json } => commands::status::run(&config, json),
        Commands::History {
            minutes,
            last,
            json,
        } => commands::history::run(&config, minutes, last, json),
        Commands::Alerts {
            last,
            minutes,
            ack,
            json,
        } => commands::alerts::run(&config, last, minutes, ack.as_deref(), json),
        Commands::Config { .. } => commands::config::run(&config),
    }
}
