//! Wire command definitions.
//!
//! Uses a proper enum with `TryFrom` — no panics on unknown values.

use crate::error::ChannelError;
use std::fmt;

/// All commands understood by the routing protocol.
///
/// The set is closed: an unrecognized byte is a decode error, never
/// silently ignored. Forward compatibility is negotiated at the layer
/// above this one, so a byte outside this set is always a fault.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Command {
    /// Session login (client → router: identity + domain); also sent by
    /// the router to re-affirm an established session.
    ConnectionEstablished = 0,
    /// Acknowledges receipt of a frame, referenced by data id.
    DataReceivedConfirmation = 1,
    /// Keep-alive. Empty payload, no observable effect besides liveness.
    Ping = 2,
    /// A bundle of posts for a single chat.
    Messages = 3,
}

impl TryFrom<u8> for Command {
    type Error = ChannelError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(Command::ConnectionEstablished),
            1 => Ok(Command::DataReceivedConfirmation),
            2 => Ok(Command::Ping),
            3 => Ok(Command::Messages),
            other => Err(ChannelError::UnsupportedCommand(other)),
        }
    }
}

impl fmt::Display for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

impl Command {
    /// Whether an inbound frame with this command must be acknowledged.
    ///
    /// Every application frame is acked on receipt; acking a confirmation
    /// would ack the ack forever.
    pub fn requires_ack(&self) -> bool {
        !matches!(self, Command::DataReceivedConfirmation)
    }
}
