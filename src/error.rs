//! Domain-specific error types for the channel layer.
//!
//! All fallible operations return `Result<T, ChannelError>`.
//! No panics on invalid input — every error is typed and recoverable:
//! frame-level errors abort a single frame, transport errors force a
//! disconnect, and nothing here is fatal to the hosting process.

use std::time::Duration;
use thiserror::Error;

/// The canonical error type for the channel layer.
#[derive(Debug, Error)]
pub enum ChannelError {
    // ── Frame errors ─────────────────────────────────────────────
    /// A frame failed structural decoding (zero length, length mismatch
    /// in the multi-post payload, short confirmation payload).
    #[error("malformed frame: {0}")]
    MalformedFrame(&'static str),

    /// The command byte does not map to any known command.
    #[error("unsupported command id={0:#04x}")]
    UnsupportedCommand(u8),

    /// Frame size exceeded the codec limit.
    #[error("frame too large: {size} bytes (max {max})")]
    FrameTooLarge { size: usize, max: usize },

    // ── Transport errors ─────────────────────────────────────────
    /// The TCP/IO layer reported an error.
    #[error("transport error: {0}")]
    Transport(#[from] std::io::Error),

    /// An operation exceeded its deadline.
    #[error("timeout after {0:?}")]
    Timeout(Duration),

    /// An internal mpsc channel was closed unexpectedly.
    #[error("channel closed")]
    ChannelClosed,

    /// The connection was torn down (idle timeout, peer close, or a
    /// requested teardown).
    #[error("disconnected: {0}")]
    Disconnected(&'static str),
}

impl<T> From<tokio::sync::mpsc::error::SendError<T>> for ChannelError {
    fn from(_: tokio::sync::mpsc::error::SendError<T>) -> Self {
        ChannelError::ChannelClosed
    }
}
