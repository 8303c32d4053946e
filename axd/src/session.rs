//! Per-session transfer state.

use std::fs::File;
use std::path::PathBuf;

use ax_proto::wire::RecvMeta;

use crate::dirlist::DirBuffer;

/// The transfer the session is currently engaged in, if any.
///
/// Exactly one mode can be active because the modes are variants of one
/// value; starting a new transfer replaces whatever was in flight.
#[derive(Debug, Default)]
pub enum Transfer {
    /// Waiting for the next request.
    #[default]
    Idle,
    /// Host-to-device download: the host announced `expected` bytes and
    /// `done` of them have been written so far.
    Receiving { expected: u32, done: u32 },
    /// Device-to-host upload of an open file of `total` bytes; `sent` is
    /// the position reported by the last read.
    Sending { total: u32, sent: u32 },
    /// Device-to-host upload of an encoded directory listing.
    StreamingDir(DirBuffer),
}

impl Transfer {
    fn mode(&self) -> &'static str {
        match self {
            Transfer::Idle => "idle",
            Transfer::Receiving { .. } => "receiving",
            Transfer::Sending { .. } => "sending",
            Transfer::StreamingDir(_) => "streaming directory",
        }
    }
}

/// Mutable state of one agent session.
pub struct Session {
    /// File opened by a download announcement or an upload request.
    /// Replaced (and the old handle closed) whenever a new file opens;
    /// closed for good by FILE_CLOSE or at shutdown.
    pub file: Option<File>,
    /// Host path of `file` / of the last announced target.
    pub path: Option<PathBuf>,
    /// Metadata cached by FILE_RECV, committed by FILE_CLOSE.
    pub pending: Option<(PathBuf, RecvMeta)>,
    /// Active transfer mode.
    pub transfer: Transfer,
}

impl Session {
    pub fn new() -> Self {
        Self {
            file: None,
            path: None,
            pending: None,
            transfer: Transfer::Idle,
        }
    }

    /// Closes the open file, if any.
    pub fn close_file(&mut self) {
        if self.file.take().is_some() {
            trace!("closed open file");
        }
    }

    pub fn set_transfer(&mut self, transfer: Transfer) {
        trace!("transfer mode: {} -> {}", self.transfer.mode(), transfer.mode());
        self.transfer = transfer;
    }
}

impl Default for Session {
    fn default() -> Self {
        Self::new()
    }
}
