//! Pluggable conversion between packets and wire bytes.
//!
//! Sessions never touch the codec directly; they hold an
//! `Arc<dyn PipelineStrategy<R, T>>` that turns received bytes into `R` and
//! outgoing `T` into bytes. Strategies are shared across sessions and called
//! concurrently from receive tasks and the application thread, so every
//! implementation must be reentrant.

use std::sync::{Arc, PoisonError, RwLock};
use std::time::Duration;

use crate::codec::{CodecError, Packet, PacketCodec};
use crate::envelope::{Envelope, EnvelopeError};

/// Errors surfaced by a pipeline strategy.
#[derive(Debug, thiserror::Error)]
pub enum PipelineError {
    /// Serialization or deserialization failed.
    #[error(transparent)]
    Codec(#[from] CodecError),
    /// The envelope layer failed.
    #[error(transparent)]
    Envelope(#[from] EnvelopeError),
}

impl PipelineError {
    /// Whether the error is a misconfiguration of this process.
    pub fn is_configuration_error(&self) -> bool {
        match self {
            PipelineError::Codec(e) => e.is_configuration_error(),
            PipelineError::Envelope(EnvelopeError::CryptoUnavailable(_)) => true,
            PipelineError::Envelope(_) => false,
        }
    }
}

/// Conversion contract between a session and the wire.
///
/// `R` is what this endpoint receives, `T` what it transmits.
pub trait PipelineStrategy<R, T>: Send + Sync {
    /// Convert one received frame. `Ok(None)` means the strategy chose to
    /// drop the frame (for instance a simulated loss).
    fn convert_receive(&self, bytes: &[u8]) -> Result<Option<R>, PipelineError>;

    /// Convert one outgoing packet into frame payload bytes.
    fn convert_send(&self, packet: &T) -> Result<Vec<u8>, PipelineError>;

    /// Delay the receive task waits before converting each frame.
    fn receive_delay(&self) -> Duration {
        Duration::ZERO
    }
}

impl<R, T, P> PipelineStrategy<R, T> for Arc<P>
where
    P: PipelineStrategy<R, T> + ?Sized,
{
    fn convert_receive(&self, bytes: &[u8]) -> Result<Option<R>, PipelineError> {
        (**self).convert_receive(bytes)
    }

    fn convert_send(&self, packet: &T) -> Result<Vec<u8>, PipelineError> {
        (**self).convert_send(packet)
    }

    fn receive_delay(&self) -> Duration {
        (**self).receive_delay()
    }
}

/// Swappable strategy shared by a session and its UDP channel.
///
/// Clones point at the same slot, so [`replace`](Self::replace) on any clone
/// is seen by every holder on its next conversion.
pub struct PipelineSlot<R, T> {
    current: Arc<RwLock<Arc<dyn PipelineStrategy<R, T>>>>,
}

impl<R, T> PipelineSlot<R, T> {
    pub fn new(pipeline: Arc<dyn PipelineStrategy<R, T>>) -> Self {
        Self {
            current: Arc::new(RwLock::new(pipeline)),
        }
    }

    /// Strategy to use for the next conversion.
    pub fn current(&self) -> Arc<dyn PipelineStrategy<R, T>> {
        let slot = self.current.read().unwrap_or_else(PoisonError::into_inner);
        Arc::clone(&slot)
    }

    /// Swap in a new strategy for every holder of this slot.
    pub fn replace(&self, pipeline: Arc<dyn PipelineStrategy<R, T>>) {
        *self.current.write().unwrap_or_else(PoisonError::into_inner) = pipeline;
    }
}

impl<R, T> Clone for PipelineSlot<R, T> {
    fn clone(&self) -> Self {
        Self {
            current: Arc::clone(&self.current),
        }
    }
}

/// Plain (de)serialization through the codec.
#[derive(Debug, Clone)]
pub struct DefaultPipeline {
    codec: Arc<PacketCodec>,
}

impl DefaultPipeline {
    /// Wrap a shared codec.
    pub fn new(codec: Arc<PacketCodec>) -> Self {
        Self { codec }
    }

    /// The codec this pipeline uses.
    pub fn codec(&self) -> &Arc<PacketCodec> {
        &self.codec
    }
}

impl<R: Packet, T: Packet> PipelineStrategy<R, T> for DefaultPipeline {
    fn convert_receive(&self, bytes: &[u8]) -> Result<Option<R>, PipelineError> {
        Ok(Some(self.codec.deserialize(bytes, None)?))
    }

    fn convert_send(&self, packet: &T) -> Result<Vec<u8>, PipelineError> {
        Ok(self.codec.serialize(packet)?)
    }
}

/// Codec plus the compression/encryption envelope.
///
/// Outgoing packets get the layers chosen here; incoming envelopes are
/// opened according to their own meta byte.
#[derive(Debug, Clone)]
pub struct EnvelopePipeline {
    codec: Arc<PacketCodec>,
    envelope: Envelope,
    compress: bool,
    encrypt: bool,
}

impl EnvelopePipeline {
    /// Create an envelope pipeline. `compress`/`encrypt` apply to sends.
    pub fn new(codec: Arc<PacketCodec>, envelope: Envelope, compress: bool, encrypt: bool) -> Self {
        Self {
            codec,
            envelope,
            compress,
            encrypt,
        }
    }
}

impl<R: Packet, T: Packet> PipelineStrategy<R, T> for EnvelopePipeline {
    fn convert_receive(&self, bytes: &[u8]) -> Result<Option<R>, PipelineError> {
        let body = self.envelope.unwrap(bytes)?;
        Ok(Some(self.codec.deserialize(&body, None)?))
    }

    fn convert_send(&self, packet: &T) -> Result<Vec<u8>, PipelineError> {
        let body = self.codec.serialize(packet)?;
        Ok(self.envelope.wrap(&body, self.compress, self.encrypt)?)
    }
}
