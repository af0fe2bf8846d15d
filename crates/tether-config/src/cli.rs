//! Command-line argument parsing.

use std::path::PathBuf;

use clap::Parser;

use crate::Config;

/// Tether command-line arguments.
///
/// CLI values override settings loaded from `config.ron`.
#[derive(Parser, Debug, Default)]
#[command(name = "tether", about = "Tether session host and client")]
pub struct CliArgs {
    /// Run as the server instead of a client.
    #[arg(long)]
    pub host: bool,

    /// Server address to connect to.
    #[arg(long)]
    pub server: Option<String>,

    /// Server port.
    #[arg(long)]
    pub port: Option<u16>,

    /// IPv4 multicast group for the UDP side-channel.
    #[arg(long)]
    pub multicast: Option<String>,

    /// Reconnect automatically after a failed heartbeat.
    #[arg(long)]
    pub auto_repair: Option<bool>,

    /// Heartbeat probe timeout in milliseconds.
    #[arg(long)]
    pub heartbeat_timeout_ms: Option<u64>,

    /// Log level (error, warn, info, debug, trace).
    #[arg(long)]
    pub log_level: Option<String>,

    /// Path to config directory (overrides default location).
    #[arg(long)]
    pub config: Option<PathBuf>,
}

impl Config {
    /// Apply CLI overrides to a loaded config.
    pub fn apply_cli_overrides(&mut self, args: &CliArgs) {
        if let Some(ref addr) = args.server {
            self.network.server_address = addr.clone();
        }
        if let Some(port) = args.port {
            self.network.server_port = port;
        }
        if let Some(ref group) = args.multicast {
            self.network.multicast_group = group.clone();
        }
        if let Some(repair) = args.auto_repair {
            self.network.auto_repair = repair;
        }
        if let Some(timeout) = args.heartbeat_timeout_ms {
            self.network.heartbeat_timeout_ms = timeout;
        }
        if let Some(ref level) = args.log_level {
            self.debug.log_level = level.clone();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cli_override() {
        let mut config = Config::default();
        let args = CliArgs {
            server: Some("192.168.1.1".to_string()),
            auto_repair: Some(false),
            heartbeat_timeout_ms: Some(200),
            ..Default::default()
        };
        config.apply_cli_overrides(&args);
        assert_eq!(config.network.server_address, "192.168.1.1");
        assert!(!config.network.auto_repair);
        assert_eq!(config.network.heartbeat_timeout_ms, 200);
        // Non-overridden fields retain defaults
        assert_eq!(config.network.server_port, 9000);
        assert_eq!(config.debug.log_level, "info");
    }

    #[test]
    fn test_cli_no_override() {
        let original = Config::default();
        let mut config = Config::default();
        config.apply_cli_overrides(&CliArgs::default());
        assert_eq!(config, original);
    }

    #[test]
    fn test_parse_flags() {
        let args = CliArgs::parse_from([
            "tether",
            "--host",
            "--port",
            "7000",
            "--multicast",
            "239.1.2.3",
            "--auto-repair",
            "false",
        ]);
        assert!(args.host);
        assert_eq!(args.port, Some(7000));
        assert_eq!(args.multicast.as_deref(), Some("239.1.2.3"));
        assert_eq!(args.auto_repair, Some(false));
        assert!(args.server.is_none());
    }
}
