//! Client/server session transport: typed packets over TCP with heartbeat
//! and repair, an optional UDP side-channel, and deferred event dispatch.

pub mod client;
pub mod codec;
pub mod envelope;
pub mod events;
pub mod framing;
pub mod pipeline;
pub mod platform;
pub mod server;
pub mod simulation;
pub mod udp;

#[cfg(test)]
mod testkit;

pub use client::{ClientConfig, ConnectionState, ConnectionStateWatch, GameClient};
pub use codec::{CodecError, PROTOCOL_VERSION, Packet, PacketCodec, PacketKind};
pub use envelope::{Envelope, EnvelopeError, KeyMaterial, META_COMPRESSED, META_ENCRYPTED};
pub use events::{ClientEvent, ClientHandler, EventBuffer, ServerEvent, ServerHandler};
pub use framing::{FrameConfig, FrameError};
pub use pipeline::{
    DefaultPipeline, EnvelopePipeline, PipelineError, PipelineSlot, PipelineStrategy,
};
pub use platform::SocketConfig;
pub use server::{
    Approval, ConnectionApprover, ConnectionId, ConnectionRegistry, GameServer, IdAllocator,
    RegistryError, ServerConfig,
};
pub use simulation::{SimulatedPipeline, SimulationSettings, TrafficStats};
pub use udp::{UdpChannel, UdpConfig};
