//! Maps the persisted configuration onto transport settings.

use std::net::{IpAddr, Ipv4Addr, SocketAddr};

use tether_config::{Config, ConfigError};
use tether_net::{ClientConfig, FrameConfig, ServerConfig, UdpConfig};

pub fn server_config(config: &Config) -> ServerConfig {
    let network = &config.network;
    ServerConfig {
        bind_addr: SocketAddr::from((Ipv4Addr::UNSPECIFIED, network.server_port)),
        max_connections: network.max_connections,
        heartbeat_timeout: network.heartbeat_timeout(),
        frame: frame_config(config),
        ..Default::default()
    }
}

pub fn client_config(config: &Config) -> ClientConfig {
    let network = &config.network;
    ClientConfig {
        local_port: network.local_port(),
        auto_repair: network.auto_repair,
        heartbeat_timeout: network.heartbeat_timeout(),
        repair_probe_timeout: network.repair_probe_timeout(),
        frame: frame_config(config),
        ..Default::default()
    }
}

/// Side-channel settings, `None` when no multicast group is configured.
/// The group itself is the send target.
pub fn udp_config(config: &Config) -> Result<Option<UdpConfig>, ConfigError> {
    let Some(group) = config.network.multicast_group()? else {
        return Ok(None);
    };
    let port = config.network.udp_port();

    let mut udp = UdpConfig::new(SocketAddr::from((Ipv4Addr::UNSPECIFIED, port)));
    udp.multicast_group = Some(group);
    udp.target = Some(SocketAddr::from((group, port)));
    Ok(Some(udp))
}

/// Where a client connects: a literal IP, or a host name still to resolve.
#[derive(Debug, PartialEq, Eq)]
pub enum ServerTarget {
    Addr(SocketAddr),
    Host(String, u16),
}

pub fn server_target(config: &Config) -> ServerTarget {
    let network = &config.network;
    let host = network.server_address.trim();
    match host.parse::<IpAddr>() {
        Ok(ip) => ServerTarget::Addr(SocketAddr::new(ip, network.server_port)),
        Err(_) => ServerTarget::Host(host.to_string(), network.server_port),
    }
}

fn frame_config(config: &Config) -> FrameConfig {
    FrameConfig {
        max_payload_size: config.network.max_payload_bytes,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn test_server_listens_on_configured_port() {
        let mut config = Config::default();
        config.network.server_port = 7100;
        config.network.max_connections = 8;

        let server = server_config(&config);
        assert_eq!(server.bind_addr, "0.0.0.0:7100".parse().unwrap());
        assert_eq!(server.max_connections, 8);
        assert_eq!(server.heartbeat_timeout, Duration::from_millis(500));
    }

    #[test]
    fn test_client_carries_repair_settings() {
        let mut config = Config::default();
        config.network.auto_repair = false;
        config.network.local_port = 9100;
        config.network.repair_probe_timeout_ms = 250;
        config.network.max_payload_bytes = 4096;

        let client = client_config(&config);
        assert!(!client.auto_repair);
        assert_eq!(client.local_port, Some(9100));
        assert_eq!(client.repair_probe_timeout, Duration::from_millis(250));
        assert_eq!(client.frame.max_payload_size, 4096);
    }

    #[test]
    fn test_udp_only_with_multicast_group() {
        let mut config = Config::default();
        assert!(udp_config(&config).unwrap().is_none());

        config.network.multicast_group = "239.255.10.1".to_string();
        let udp = udp_config(&config).unwrap().unwrap();
        assert_eq!(udp.multicast_group, Some(Ipv4Addr::new(239, 255, 10, 1)));
        assert_eq!(udp.bind_addr.port(), 9001);
        assert_eq!(udp.target, Some("239.255.10.1:9001".parse().unwrap()));

        config.network.multicast_group = "192.168.0.1".to_string();
        assert!(udp_config(&config).is_err());
    }

    #[test]
    fn test_server_target_kinds() {
        let mut config = Config::default();
        assert_eq!(
            server_target(&config),
            ServerTarget::Addr("127.0.0.1:9000".parse().unwrap())
        );

        config.network.server_address = "play.example.net".to_string();
        assert_eq!(
            server_target(&config),
            ServerTarget::Host("play.example.net".to_string(), 9000)
        );
    }
}
