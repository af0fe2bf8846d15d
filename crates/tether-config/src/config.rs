//! Configuration structs with sensible defaults and RON persistence.

use std::net::Ipv4Addr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;

/// Top-level configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct Config {
    /// Transport settings shared by host and client.
    pub network: NetworkConfig,
    /// Debug/development settings.
    pub debug: DebugConfig,
}

/// Transport configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct NetworkConfig {
    /// Server address a client connects to (IP or host name).
    pub server_address: String,
    /// TCP port the server listens on and the client connects to.
    pub server_port: u16,
    /// Local port a client binds before connecting (0 = ephemeral).
    pub local_port: u16,
    /// IPv4 multicast group for the UDP side-channel (empty = none).
    pub multicast_group: String,
    /// UDP side-channel port relative to `server_port`.
    pub udp_port_offset: u16,
    /// Reconnect automatically when a heartbeat fails.
    pub auto_repair: bool,
    /// Heartbeat probe timeout in milliseconds.
    pub heartbeat_timeout_ms: u64,
    /// Reachability probe timeout during repair in milliseconds.
    pub repair_probe_timeout_ms: u64,
    /// How often the demo loop heartbeats, in milliseconds.
    pub heartbeat_interval_ms: u64,
    /// Maximum concurrent connections (server only).
    pub max_connections: usize,
    /// Largest accepted frame payload in bytes.
    pub max_payload_bytes: u32,
    /// Compress outgoing packets.
    pub compress: bool,
}

/// Debug/development configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct DebugConfig {
    /// Log level override (e.g., "debug", "info", "warn").
    pub log_level: String,
    /// Artificial receive lag in milliseconds (0 = off).
    pub simulate_lag_ms: u64,
    /// Percentage of received packets to drop (0 = off).
    pub simulate_drop_percent: u8,
    /// Trace every packet passing through the pipeline.
    pub full_packet_log: bool,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            server_address: "127.0.0.1".to_string(),
            server_port: 9000,
            local_port: 0,
            multicast_group: String::new(),
            udp_port_offset: 1,
            auto_repair: true,
            heartbeat_timeout_ms: 500,
            repair_probe_timeout_ms: 1000,
            heartbeat_interval_ms: 1000,
            max_connections: 256,
            max_payload_bytes: 1024 * 1024,
            compress: false,
        }
    }
}

impl Default for DebugConfig {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
            simulate_lag_ms: 0,
            simulate_drop_percent: 0,
            full_packet_log: false,
        }
    }
}

impl NetworkConfig {
    /// Parsed multicast group, `None` when the side-channel is disabled.
    pub fn multicast_group(&self) -> Result<Option<Ipv4Addr>, ConfigError> {
        let group = self.multicast_group.trim();
        if group.is_empty() {
            return Ok(None);
        }
        match group.parse::<Ipv4Addr>() {
            Ok(addr) if addr.is_multicast() => Ok(Some(addr)),
            _ => Err(ConfigError::InvalidValue {
                field: "multicast_group",
                value: self.multicast_group.clone(),
            }),
        }
    }

    /// UDP side-channel port.
    pub fn udp_port(&self) -> u16 {
        self.server_port.wrapping_add(self.udp_port_offset)
    }

    /// Client bind port, `None` for an ephemeral one.
    pub fn local_port(&self) -> Option<u16> {
        (self.local_port != 0).then_some(self.local_port)
    }

    /// How long a heartbeat waits for the transport before failing.
    pub fn heartbeat_timeout(&self) -> Duration {
        Duration::from_millis(self.heartbeat_timeout_ms)
    }

    /// Reachability probe timeout used while repairing.
    pub fn repair_probe_timeout(&self) -> Duration {
        Duration::from_millis(self.repair_probe_timeout_ms)
    }

    /// Heartbeat period, never shorter than one millisecond.
    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_millis(self.heartbeat_interval_ms.max(1))
    }
}

/// Platform config directory for tether, e.g. `~/.config/tether`.
pub fn default_config_dir() -> Option<PathBuf> {
    dirs::config_dir().map(|dir| dir.join("tether"))
}

// --- Load / Save / Reload ---

impl Config {
    /// Load config from the given directory, or create a default config file.
    pub fn load_or_create(config_dir: &Path) -> Result<Self, ConfigError> {
        let config_path = config_dir.join("config.ron");

        if config_path.exists() {
            let contents = std::fs::read_to_string(&config_path).map_err(ConfigError::ReadError)?;
            let config: Config = ron::from_str(&contents).map_err(ConfigError::ParseError)?;
            log::info!("Loaded config from {}", config_path.display());
            Ok(config)
        } else {
            let config = Config::default();
            config.save(config_dir)?;
            log::info!("Created default config at {}", config_path.display());
            Ok(config)
        }
    }

    /// Save config to the given directory as `config.ron`.
    pub fn save(&self, config_dir: &Path) -> Result<(), ConfigError> {
        std::fs::create_dir_all(config_dir).map_err(ConfigError::WriteError)?;

        let config_path = config_dir.join("config.ron");
        let pretty = ron::ser::PrettyConfig::new()
            .depth_limit(2)
            .enumerate_arrays(false);

        let serialized =
            ron::ser::to_string_pretty(self, pretty).map_err(ConfigError::SerializeError)?;

        std::fs::write(&config_path, serialized).map_err(ConfigError::WriteError)?;
        Ok(())
    }

    /// Hot-reload: returns `Some(new_config)` if the file changed, `None` otherwise.
    pub fn reload(&self, config_dir: &Path) -> Result<Option<Self>, ConfigError> {
        let config_path = config_dir.join("config.ron");
        let contents = std::fs::read_to_string(&config_path).map_err(ConfigError::ReadError)?;
        let new_config: Config = ron::from_str(&contents).map_err(ConfigError::ParseError)?;

        if new_config != *self {
            log::info!("Config reloaded with changes");
            Ok(Some(new_config))
        } else {
            Ok(None)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_serializes() {
        let config = Config::default();
        let ron_str =
            ron::ser::to_string_pretty(&config, ron::ser::PrettyConfig::new().depth_limit(2))
                .unwrap();
        assert!(ron_str.contains("server_port: 9000"));
        assert!(ron_str.contains("auto_repair: true"));
        assert!(ron_str.contains("heartbeat_timeout_ms: 500"));
    }

    #[test]
    fn test_missing_section_uses_default() {
        let config: Config = ron::from_str("(network: (server_port: 4000))").unwrap();
        assert_eq!(config.network.server_port, 4000);
        assert_eq!(config.network.heartbeat_timeout_ms, 500);
        assert_eq!(config.debug, DebugConfig::default());
    }

    #[test]
    fn test_extra_field_ignored() {
        let result: Result<Config, _> = ron::from_str("(future_setting: true)");
        assert!(result.is_ok());
    }

    #[test]
    fn test_invalid_ron_produces_error() {
        let result: Result<Config, _> = ron::from_str("{{not valid}}");
        assert!(result.is_err());
    }

    #[test]
    fn test_multicast_group_parsing() {
        let mut network = NetworkConfig::default();
        assert_eq!(network.multicast_group().unwrap(), None);

        network.multicast_group = "239.255.0.7".to_string();
        assert_eq!(
            network.multicast_group().unwrap(),
            Some(Ipv4Addr::new(239, 255, 0, 7))
        );

        network.multicast_group = "10.0.0.1".to_string();
        assert!(matches!(
            network.multicast_group(),
            Err(ConfigError::InvalidValue { field: "multicast_group", .. })
        ));

        network.multicast_group = "not an address".to_string();
        assert!(network.multicast_group().is_err());
    }

    #[test]
    fn test_derived_ports_and_durations() {
        let mut network = NetworkConfig::default();
        assert_eq!(network.udp_port(), 9001);
        assert_eq!(network.local_port(), None);
        assert_eq!(network.heartbeat_timeout(), Duration::from_millis(500));
        assert_eq!(network.repair_probe_timeout(), Duration::from_secs(1));

        network.local_port = 9100;
        network.heartbeat_interval_ms = 0;
        assert_eq!(network.local_port(), Some(9100));
        assert_eq!(network.heartbeat_interval(), Duration::from_millis(1));
    }

    #[test]
    fn test_save_and_load() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = Config::default();
        config.network.server_address = "10.0.0.1".to_string();
        config.network.auto_repair = false;
        config.debug.simulate_drop_percent = 25;

        config.save(dir.path()).unwrap();
        let loaded = Config::load_or_create(dir.path()).unwrap();
        assert_eq!(config, loaded);
    }

    #[test]
    fn test_load_creates_default_file() {
        let dir = tempfile::tempdir().unwrap();
        let config = Config::load_or_create(dir.path()).unwrap();
        assert_eq!(config, Config::default());
        assert!(dir.path().join("config.ron").exists());
    }

    #[test]
    fn test_reload_detects_changes() {
        let dir = tempfile::tempdir().unwrap();
        let config = Config::default();
        config.save(dir.path()).unwrap();

        let mut modified = config.clone();
        modified.network.heartbeat_timeout_ms = 250;
        modified.save(dir.path()).unwrap();

        let result = config.reload(dir.path()).unwrap();
        assert_eq!(result.unwrap().network.heartbeat_timeout_ms, 250);
    }

    #[test]
    fn test_reload_no_changes() {
        let dir = tempfile::tempdir().unwrap();
        let config = Config::default();
        config.save(dir.path()).unwrap();

        assert!(config.reload(dir.path()).unwrap().is_none());
    }

    #[test]
    fn test_ron_comments_preserved() {
        let ron_str = "// tether settings\n(\n  // nothing overridden\n)";
        let config: Config = ron::from_str(ron_str).unwrap();
        assert_eq!(config, Config::default());
    }
}
