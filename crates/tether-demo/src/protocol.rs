//! Packet family exchanged by the demo host and clients.

use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tether_config::Config;
use tether_net::{
    DefaultPipeline, Envelope, EnvelopePipeline, Packet, PacketCodec, PacketKind,
    PipelineStrategy, SimulatedPipeline, SimulationSettings,
};
use tracing::info;

pub type DemoPipeline = Arc<dyn PipelineStrategy<DemoPacket, DemoPacket>>;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum DemoPacket {
    /// Handshake sent by every client on connect and after repair.
    Hello { name: String },
    /// Host reply to an accepted handshake.
    Welcome { motd: String },
    Ping { seq: u32, sent_ms: u64 },
    Pong { seq: u32, sent_ms: u64 },
    /// Host tick announced over the UDP side-channel.
    Tick { frame: u64, clients: u32 },
}

const HELLO: PacketKind = PacketKind("Hello");
const WELCOME: PacketKind = PacketKind("Welcome");
const PING: PacketKind = PacketKind("Ping");
const PONG: PacketKind = PacketKind("Pong");
const TICK: PacketKind = PacketKind("Tick");

impl Packet for DemoPacket {
    fn kind(&self) -> PacketKind {
        match self {
            DemoPacket::Hello { .. } => HELLO,
            DemoPacket::Welcome { .. } => WELCOME,
            DemoPacket::Ping { .. } => PING,
            DemoPacket::Pong { .. } => PONG,
            DemoPacket::Tick { .. } => TICK,
        }
    }
}

pub fn build_codec() -> PacketCodec {
    PacketCodec::new([HELLO, WELCOME, PING, PONG, TICK])
}

/// Codec, optional compression, then the debug simulation layer when any of
/// its settings is active.
pub fn build_pipeline(config: &Config) -> DemoPipeline {
    let codec = Arc::new(build_codec());
    let base: DemoPipeline = if config.network.compress {
        Arc::new(EnvelopePipeline::new(codec, Envelope::default(), true, false))
    } else {
        Arc::new(DefaultPipeline::new(codec))
    };

    let debug = &config.debug;
    if debug.simulate_lag_ms == 0 && debug.simulate_drop_percent == 0 && !debug.full_packet_log {
        return base;
    }

    let settings = SimulationSettings {
        lag: Duration::from_millis(debug.simulate_lag_ms),
        drop_percent: debug.simulate_drop_percent,
        full_log: debug.full_packet_log,
    };
    info!(?settings, "Network simulation enabled");
    Arc::new(SimulatedPipeline::new(base, settings))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_every_variant_is_registered() {
        let codec = build_codec();
        let packets = [
            DemoPacket::Hello { name: "a".into() },
            DemoPacket::Welcome { motd: "b".into() },
            DemoPacket::Ping { seq: 1, sent_ms: 2 },
            DemoPacket::Pong { seq: 1, sent_ms: 2 },
            DemoPacket::Tick { frame: 3, clients: 4 },
        ];
        for packet in packets {
            let bytes = codec.serialize(&packet).unwrap();
            let decoded: DemoPacket = codec.deserialize(&bytes, Some(packet.kind())).unwrap();
            assert_eq!(decoded, packet);
        }
    }

    #[test]
    fn test_pipeline_layers_follow_config() {
        let mut config = Config::default();
        config.network.compress = true;
        config.debug.simulate_drop_percent = 100;
        let pipeline = build_pipeline(&config);

        let bytes = pipeline
            .convert_send(&DemoPacket::Ping { seq: 7, sent_ms: 0 })
            .unwrap();
        assert_eq!(pipeline.convert_receive(&bytes).unwrap(), None);

        config.debug.simulate_drop_percent = 0;
        let pipeline = build_pipeline(&config);
        let bytes = pipeline
            .convert_send(&DemoPacket::Ping { seq: 7, sent_ms: 0 })
            .unwrap();
        assert_eq!(
            pipeline.convert_receive(&bytes).unwrap(),
            Some(DemoPacket::Ping { seq: 7, sent_ms: 0 })
        );
    }
}
