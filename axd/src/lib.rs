//! # axd
//!
//! Device-side agent for the Amiga Explorer serial link.
//!
//! `axd` sits on the device end of an RS-232 connection and services the
//! host's requests: volume and directory listings, file uploads and
//! downloads, and filesystem maintenance (delete, rename, move, copy,
//! attributes). The wire protocol lives in the `ax-proto` crate; this
//! crate supplies the session state machine, the request dispatcher and
//! the platform filesystem operations behind it.
//!
//! ## Modules
//!
//! - [`agent`] - Request dispatcher and message handlers
//! - [`config`] - Volume table configuration
//! - [`dirlist`] - Directory listing encoder and chunked streaming
//! - [`platform`] - Filesystem operations, volume statistics, datestamps
//! - [`session`] - Per-session transfer state

#[macro_use]
extern crate log;
#[macro_use]
extern crate anyhow;

/// Request dispatcher and message handlers.
pub mod agent;

/// Volume table configuration.
pub mod config;

/// Directory listing encoder and chunked streaming.
pub mod dirlist;

/// Filesystem operations, volume statistics, datestamps.
pub mod platform;

/// Per-session transfer state.
pub mod session;
