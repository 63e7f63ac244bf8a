//! # veil-channel
//!
//! Client-side transport layer for an anonymous end-to-end-encrypted
//! messaging network. Sits between the TCP socket and the encryption
//! layer above: everything it carries is opaque ciphertext, and the
//! routing server learns nothing beyond a numeric traffic domain.
//!
//! This crate contains:
//! - **Frame**: the binary command protocol (`Command`, `Frame`, multi-post
//!   `Messages` payloads, content-derived data ids)
//! - **Codec**: `ChannelCodec` for length-delimited framed TCP I/O via
//!   `tokio_util`
//! - **Connection**: one managed TCP socket with reader/writer tasks and
//!   idle teardown
//! - **Channel**: connection lifecycle, frame dispatch, delivery
//!   confirmations, and diagnostics
//! - **Spooler**: FIFO outbound queue with at-least-once redelivery
//! - **AntiDuplicate**: bounded replay window for inbound posts
//! - **Registry**: process-wide channel set and connectivity fan-out
//! - **Error**: `ChannelError` — typed, `thiserror`-based error hierarchy

pub mod anti_duplicate;
pub mod channel;
pub mod codec;
pub mod command;
pub mod connection;
pub mod error;
pub mod frame;
pub mod registry;
pub mod spooler;

// ── Re-exports for ergonomic usage ───────────────────────────────

pub use anti_duplicate::AntiDuplicate;
pub use channel::{Channel, ChannelEvents, ChannelOptions, ChannelStatus, DiagnosticsSnapshot};
pub use codec::{ChannelCodec, MAX_FRAME_SIZE};
pub use command::Command;
pub use connection::{Connection, ConnectionEvents, ConnectionInfo, ConnectionPhase};
pub use error::ChannelError;
pub use frame::{Frame, data_id};
pub use registry::ChannelRegistry;
pub use spooler::Spooler;
