//! Packet family and helpers shared by the unit tests.

use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::codec::{Packet, PacketCodec, PacketKind};
use crate::pipeline::DefaultPipeline;
use crate::simulation::{SimulatedPipeline, SimulationSettings};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum TestPacket {
    Ping { seq: u32 },
    Pong { seq: u32 },
    Hello { name: String },
    Chat { from: u32, text: String },
    Blob(Vec<u8>),
}

impl Packet for TestPacket {
    fn kind(&self) -> PacketKind {
        match self {
            TestPacket::Ping { .. } => PacketKind("Ping"),
            TestPacket::Pong { .. } => PacketKind("Pong"),
            TestPacket::Hello { .. } => PacketKind("Hello"),
            TestPacket::Chat { .. } => PacketKind("Chat"),
            TestPacket::Blob(_) => PacketKind("Blob"),
        }
    }
}

pub fn test_codec() -> PacketCodec {
    PacketCodec::new([
        PacketKind("Ping"),
        PacketKind("Pong"),
        PacketKind("Hello"),
        PacketKind("Chat"),
        PacketKind("Blob"),
    ])
}

pub fn test_pipeline() -> Arc<DefaultPipeline> {
    Arc::new(DefaultPipeline::new(Arc::new(test_codec())))
}

pub type TestSimulation = SimulatedPipeline<Arc<DefaultPipeline>, TestPacket, TestPacket>;

pub fn simulated_pipeline(settings: SimulationSettings) -> Arc<TestSimulation> {
    Arc::new(SimulatedPipeline::new(test_pipeline(), settings))
}

/// Poll `condition` every 10 ms until it holds or `timeout` elapses.
pub async fn wait_until(timeout: Duration, mut condition: impl FnMut() -> bool) -> bool {
    let deadline = tokio::time::Instant::now() + timeout;
    while tokio::time::Instant::now() < deadline {
        if condition() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    condition()
}
