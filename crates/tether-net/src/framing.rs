//! Length-prefixed frames on a TCP stream.
//!
//! ```text
//! +-------------------+--------------------+
//! | length (4 bytes)  |   payload          |
//! | u32 little-endian |   (length bytes)   |
//! +-------------------+--------------------+
//! ```
//!
//! The length excludes the prefix itself. A zero-length frame is legal and
//! carries an empty payload. A prefix above the configured maximum means the
//! reader can no longer find frame boundaries, so the stream must be dropped.

use std::io::ErrorKind;

use tokio::io::{AsyncReadExt, AsyncWriteExt};

/// Size of the length prefix in bytes.
pub const HEADER_LEN: usize = 4;

/// Configuration for the framing layer.
#[derive(Debug, Clone)]
pub struct FrameConfig {
    /// Maximum allowed payload size in bytes. Default: 1 MB.
    pub max_payload_size: u32,
}

impl Default for FrameConfig {
    fn default() -> Self {
        Self {
            max_payload_size: 1_048_576,
        }
    }
}

/// Errors that can occur while reading or writing frames.
#[derive(Debug, thiserror::Error)]
pub enum FrameError {
    /// A length prefix exceeds the configured maximum.
    #[error("payload size {size} exceeds maximum {max}")]
    PayloadTooLarge {
        /// Size announced or requested.
        size: usize,
        /// The configured maximum.
        max: u32,
    },

    /// The peer closed the stream at a frame boundary or mid-frame.
    #[error("connection closed")]
    ConnectionClosed,

    /// An I/O error occurred.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// What a session should do after a failed read.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReadFailure {
    /// No data yet (timeout or interrupt); read again.
    Retry,
    /// The peer went away cleanly.
    Closed,
    /// Frame boundaries are lost; the stream is unusable.
    Desynchronized,
    /// The transport reported a fault; check liveness.
    Broken,
}

impl FrameError {
    /// Classify this error for the receive loop.
    pub fn classify(&self) -> ReadFailure {
        match self {
            FrameError::PayloadTooLarge { .. } => ReadFailure::Desynchronized,
            FrameError::ConnectionClosed => ReadFailure::Closed,
            FrameError::Io(e) => match e.kind() {
                ErrorKind::TimedOut | ErrorKind::Interrupted | ErrorKind::WouldBlock => {
                    ReadFailure::Retry
                }
                ErrorKind::UnexpectedEof => ReadFailure::Closed,
                _ => ReadFailure::Broken,
            },
        }
    }
}

/// Build a complete frame (prefix + payload) in one buffer.
pub fn encode_frame(payload: &[u8], config: &FrameConfig) -> Result<Vec<u8>, FrameError> {
    if payload.len() > config.max_payload_size as usize {
        return Err(FrameError::PayloadTooLarge {
            size: payload.len(),
            max: config.max_payload_size,
        });
    }

    let mut frame = Vec::with_capacity(HEADER_LEN + payload.len());
    frame.extend_from_slice(&(payload.len() as u32).to_le_bytes());
    frame.extend_from_slice(payload);
    Ok(frame)
}

/// Read one frame and return its payload.
pub async fn read_frame<R: AsyncReadExt + Unpin>(
    reader: &mut R,
    config: &FrameConfig,
) -> Result<Vec<u8>, FrameError> {
    let mut header = [0u8; HEADER_LEN];
    reader.read_exact(&mut header).await.map_err(eof_as_closed)?;

    let len = u32::from_le_bytes(header);
    if len > config.max_payload_size {
        return Err(FrameError::PayloadTooLarge {
            size: len as usize,
            max: config.max_payload_size,
        });
    }

    let mut payload = vec![0u8; len as usize];
    if len > 0 {
        reader
            .read_exact(&mut payload)
            .await
            .map_err(eof_as_closed)?;
    }
    Ok(payload)
}

/// Write one frame with a single `write_all` and flush.
///
/// A writer that accepts zero bytes surfaces as `ErrorKind::WriteZero`.
pub async fn write_frame<W: AsyncWriteExt + Unpin>(
    writer: &mut W,
    payload: &[u8],
    config: &FrameConfig,
) -> Result<(), FrameError> {
    let frame = encode_frame(payload, config)?;
    writer.write_all(&frame).await?;
    writer.flush().await?;
    Ok(())
}

fn eof_as_closed(e: std::io::Error) -> FrameError {
    if e.kind() == ErrorKind::UnexpectedEof {
        FrameError::ConnectionClosed
    } else {
        FrameError::Io(e)
    }
}
