//! Tether demo: hosts a session server or joins one as a pinging client.
//!
//! `tether-demo --host` listens; without `--host` the process connects to
//! the configured server, heartbeats it and measures round trips.

mod host;
mod join;
mod protocol;
mod settings;

use std::path::PathBuf;
use std::process::ExitCode;
use std::time::Duration;

use clap::Parser;
use tether_config::{CliArgs, Config, ConfigError};

/// How often the event pumps run.
const PUMP_INTERVAL: Duration = Duration::from_millis(50);

#[derive(Debug, thiserror::Error)]
enum DemoError {
    #[error("configuration: {0}")]
    Config(#[from] ConfigError),

    #[error("network setup: {0}")]
    Io(#[from] std::io::Error),
}

fn client_name() -> String {
    std::env::var("USER")
        .or_else(|_| std::env::var("USERNAME"))
        .unwrap_or_else(|_| "player".to_string())
}

#[tokio::main]
async fn main() -> ExitCode {
    let args = CliArgs::parse();

    // Resolve config directory
    let config_dir = args
        .config
        .clone()
        .or_else(tether_config::default_config_dir)
        .unwrap_or_else(|| PathBuf::from("."));

    // Load or create config, then apply CLI overrides
    let mut config = Config::load_or_create(&config_dir).unwrap_or_else(|e| {
        eprintln!("Failed to load config: {e}, using defaults");
        Config::default()
    });
    config.apply_cli_overrides(&args);

    let log_dir = config_dir.join("logs");
    tether_log::init_logging(Some(&log_dir), cfg!(debug_assertions), Some(&config));

    let pipeline = protocol::build_pipeline(&config);
    let result = if args.host {
        host::run(&config, pipeline).await
    } else {
        join::run(&config, pipeline, client_name()).await
    };

    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            tracing::error!(error = %e, "Demo stopped");
            ExitCode::FAILURE
        }
    }
}
