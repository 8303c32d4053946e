//! Error type shared by the framing and codec layers.

use std::io;

use thiserror::Error;

/// Errors surfaced by the link.
///
/// Transient line problems (bad CRC, short reads, peer NACK) are handled
/// inside the framing loops and never reach the caller; the variants here
/// are the conditions that end the session.
#[derive(Debug, Error)]
pub enum LinkError {
    /// The underlying byte device failed.
    #[error(transparent)]
    Io(#[from] io::Error),

    /// The operator requested shutdown (CTRL-C) during a wait.
    #[error("interrupted")]
    Interrupted,

    /// The peer announced a payload larger than the receive buffer.
    #[error("payload of {len} bytes exceeds the {max} byte receive buffer")]
    PayloadTooLarge { len: usize, max: usize },

    /// The peer sent a message code this implementation does not know.
    #[error("unknown opcode 0x{0:02x}")]
    UnknownOpcode(u8),

    /// A payload record was shorter than its fixed prefix requires.
    #[error("truncated {0} record")]
    Truncated(&'static str),
}

/// Result alias used throughout the crate.
pub type Result<T> = std::result::Result<T, LinkError>;
