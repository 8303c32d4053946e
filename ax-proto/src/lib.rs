//! # ax-proto
//!
//! Wire format and framing for the serial link protocol spoken by the
//! Amiga Explorer host software.
//!
//! The link is a point-to-point RS-232 connection with no hardware
//! reliability guarantees. Every message is a 12-byte header protected by a
//! CRC-32 over its first 8 bytes, optionally followed by a payload of up to
//! 1024 bytes with its own trailing CRC-32. The receiver answers each frame
//! with a 4-byte handshake token: `PkOk` (accepted) or `PkRs` (resend).
//!
//! ## Features
//!
//! - IEEE 802.3 CRC-32 checksums
//! - Header, receive-metadata and directory-entry codecs
//! - Blocking send/receive with ACK/NACK handshake, retransmit and
//!   re-synchronization on a corrupted line
//! - Sequence number validation on the receive path
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use std::sync::atomic::AtomicBool;
//! use ax_proto::{Framer, Opcode, wire::MAX_PAYLOAD};
//!
//! // Open serial port (using serialport crate)
//! let port = serialport::new("/dev/ttyS0", 19200)
//!     .timeout(std::time::Duration::from_secs(1))
//!     .open()
//!     .unwrap();
//!
//! let stop = Arc::new(AtomicBool::new(false));
//! let mut link = Framer::new(port, stop);
//!
//! loop {
//!     let msg = link.read_message(MAX_PAYLOAD).unwrap();
//!     if msg.header.opcode == Opcode::Init as u8 {
//!         link.write_message(Opcode::Init, b"Cloanto").unwrap();
//!     }
//! }
//! ```
//!
//! ## Modules
//!
//! - [`crc`] - CRC-32 checksum implementation
//! - [`wire`] - On-wire record layouts and protocol limits
//! - [`framing`] - Framed send/receive over a byte stream

#[macro_use]
extern crate log;

/// CRC-32 checksum implementation.
pub mod crc;

/// Error type shared by the framing and codec layers.
pub mod error;

/// Framed send/receive over a byte stream.
pub mod framing;

/// On-wire record layouts and protocol limits.
pub mod wire;

pub use error::{LinkError, Result};
pub use framing::{Framer, Message};
pub use wire::{Header, Opcode};
