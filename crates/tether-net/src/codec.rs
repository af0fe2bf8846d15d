//! Packet serialization against an explicitly registered set of packet kinds.
//!
//! A [`PacketCodec`] is built once by the composition root with every
//! [`PacketKind`] the application exchanges, then shared (`Arc`) by every
//! session and pipeline. Nothing here is global.
//!
//! Wire body: `[version: u8] [postcard-encoded packet]`.

use std::collections::HashSet;
use std::fmt;

use serde::Serialize;
use serde::de::DeserializeOwned;

/// Current wire-protocol version. Prepended to every serialized packet.
pub const PROTOCOL_VERSION: u8 = 1;

/// Name of one packet kind (one variant of an application packet enum).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct PacketKind(pub &'static str);

impl fmt::Display for PacketKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.0)
    }
}

/// A typed message the transport can carry.
///
/// Implemented by the application's packet enums. `kind` must return the
/// same [`PacketKind`] for every value of one variant.
pub trait Packet: Serialize + DeserializeOwned + Clone + fmt::Debug + Send + Sync + 'static {
    /// The kind of this packet value.
    fn kind(&self) -> PacketKind;
}

/// Errors produced while encoding or decoding packets.
#[derive(Debug, thiserror::Error)]
pub enum CodecError {
    /// The payload was empty (no version byte).
    #[error("empty payload, no version byte")]
    EmptyPayload,

    /// The version byte does not match the codec's protocol version.
    #[error("unsupported protocol version: {0}")]
    UnsupportedVersion(u8),

    /// The body is truncated or does not decode to a known packet.
    #[error("malformed packet body: {0}")]
    Malformed(#[from] postcard::Error),

    /// The packet kind was never registered with this codec. This is a
    /// configuration error of the composition root, not a transport fault.
    #[error("packet kind `{0}` is not registered with the codec")]
    UnregisteredKind(PacketKind),

    /// A packet decoded fine but is not the kind the caller asked for.
    #[error("expected packet kind `{expected}`, got `{found}`")]
    UnexpectedKind {
        /// Kind the caller expected.
        expected: PacketKind,
        /// Kind actually decoded.
        found: PacketKind,
    },
}

impl CodecError {
    /// Whether this error points at a misconfigured codec rather than at a
    /// bad message from the peer.
    pub fn is_configuration_error(&self) -> bool {
        matches!(self, CodecError::UnregisteredKind(_))
    }
}

/// Serializer/deserializer bound to a closed set of packet kinds.
#[derive(Debug, Clone)]
pub struct PacketCodec {
    registered: HashSet<PacketKind>,
    version: u8,
}

impl PacketCodec {
    /// Build a codec that accepts exactly `kinds`.
    pub fn new(kinds: impl IntoIterator<Item = PacketKind>) -> Self {
        Self {
            registered: kinds.into_iter().collect(),
            version: PROTOCOL_VERSION,
        }
    }

    /// Override the protocol version byte (both peers must agree).
    pub fn with_version(mut self, version: u8) -> Self {
        self.version = version;
        self
    }

    /// Protocol version written by this codec.
    pub fn version(&self) -> u8 {
        self.version
    }

    /// Whether `kind` was registered.
    pub fn is_registered(&self, kind: PacketKind) -> bool {
        self.registered.contains(&kind)
    }

    /// Number of registered kinds.
    pub fn registered_len(&self) -> usize {
        self.registered.len()
    }

    /// Serialize a packet into a versioned binary body.
    pub fn serialize<P: Packet>(&self, packet: &P) -> Result<Vec<u8>, CodecError> {
        let kind = packet.kind();
        if !self.is_registered(kind) {
            return Err(CodecError::UnregisteredKind(kind));
        }

        let body = postcard::to_allocvec(packet)?;
        let mut out = Vec::with_capacity(1 + body.len());
        out.push(self.version);
        out.extend_from_slice(&body);
        Ok(out)
    }

    /// Deserialize a versioned binary body.
    ///
    /// With `expected` set, a packet of any other kind is rejected with
    /// [`CodecError::UnexpectedKind`].
    pub fn deserialize<P: Packet>(
        &self,
        data: &[u8],
        expected: Option<PacketKind>,
    ) -> Result<P, CodecError> {
        let (&version, body) = data.split_first().ok_or(CodecError::EmptyPayload)?;
        if version != self.version {
            return Err(CodecError::UnsupportedVersion(version));
        }

        let packet: P = postcard::from_bytes(body)?;
        let kind = packet.kind();
        if !self.is_registered(kind) {
            return Err(CodecError::UnregisteredKind(kind));
        }
        if let Some(expected) = expected
            && expected != kind
        {
            return Err(CodecError::UnexpectedKind {
                expected,
                found: kind,
            });
        }

        Ok(packet)
    }
}
