//! Request dispatcher and message handlers.
//!
//! The agent is strictly single-threaded: it reads one message, handles
//! it, replies, and goes back to listening. Filesystem trouble is
//! reported to the peer as IOERR (DIR requests answer EOF instead, which
//! is what the host expects there) and never ends the session. What does
//! end the session: an oversized payload, an unknown message code, a
//! BLOCK outside a download, a dead serial device, or CTRL-C.

use std::fs::{self, File};
use std::io::{Read, Seek, SeekFrom, Write};
use std::sync::Arc;
use std::sync::atomic::AtomicBool;

use anyhow::Result;
use byte_unit::{Byte, UnitType};
use byteorder::{ByteOrder, LittleEndian};

use ax_proto::wire::{FILE_CHUNK, FILE_TYPE_DIR, MAX_PAYLOAD, PATH_MAX, RecvMeta, nul_str};
use ax_proto::{Framer, Opcode};

use crate::dirlist::DirBuffer;
use crate::platform::{self, VolumeTable};
use crate::session::{Session, Transfer};

/// What a NEXT_PART poll decided to do, computed before touching the
/// link so the session borrow is released first.
enum Poll {
    Send(Vec<u8>),
    Finish,
    Fail,
    Silent,
}

/// The device side of one serial link session.
pub struct Agent<P: Read + Write> {
    link: Framer<P>,
    volumes: VolumeTable,
    session: Session,
}

impl<P: Read + Write> Agent<P> {
    pub fn new(port: P, stop: Arc<AtomicBool>, volumes: VolumeTable) -> Self {
        Self {
            link: Framer::new(port, stop),
            volumes,
            session: Session::new(),
        }
    }

    /// Services requests until the session dies. Does not return on its
    /// own; the error carries the reason (including operator CTRL-C,
    /// surfaced as `LinkError::Interrupted`).
    pub fn run(&mut self) -> Result<()> {
        loop {
            let msg = self.link.read_message(MAX_PAYLOAD)?;
            let opcode = msg.opcode()?;
            match opcode {
                Opcode::Init => self.on_init()?,
                Opcode::FileRecv => self.on_file_recv(&msg.payload)?,
                Opcode::Mparth => self.on_mparth(&msg.payload)?,
                Opcode::Block => self.on_block(&msg.payload)?,
                Opcode::Eof => self.on_eof(),
                Opcode::NextPart => self.on_next_part()?,
                Opcode::FileClose => self.on_file_close()?,
                Opcode::FileSend => self.on_file_send(&msg.payload)?,
                Opcode::Dir => self.on_dir(&msg.payload)?,
                Opcode::FileDelete => self.on_file_delete(&msg.payload)?,
                Opcode::FileRename => self.on_file_rename(&msg.payload)?,
                Opcode::FileMove => self.on_file_move(&msg.payload)?,
                Opcode::FileCopy => self.on_file_copy(&msg.payload)?,
                Opcode::FileAttr => self.on_file_attr(&msg.payload)?,
                Opcode::IoErr | Opcode::AckClose => {
                    bail!("unexpected {opcode:?} message from the host")
                }
            }
        }
    }

    fn reply(&mut self, opcode: Opcode, payload: &[u8]) -> Result<()> {
        self.link.write_message(opcode, payload)?;
        Ok(())
    }

    fn reply_status(&mut self, ok: bool) -> Result<()> {
        self.reply(if ok { Opcode::NextPart } else { Opcode::IoErr }, &[])
    }

    fn on_init(&mut self) -> Result<()> {
        info!("host handshake");
        self.reply(Opcode::Init, b"Cloanto")
    }

    /// FILE_RECV: the host announces a download. An existing target is
    /// refused, a directory is created on the spot, a regular file is
    /// acknowledged and its metadata cached for the FILE_CLOSE commit.
    fn on_file_recv(&mut self, payload: &[u8]) -> Result<()> {
        let meta = match RecvMeta::decode(payload) {
            Ok(meta) => meta,
            Err(e) => {
                warn!("malformed FILE_RECV payload: {e}");
                return self.reply_status(false);
            }
        };
        debug!(
            "FILE_RECV {} size={} attrs={:#010x} date={} time={} type={}",
            meta.path, meta.file_size, meta.attrs, meta.date, meta.time, meta.file_type
        );
        if meta.path.len() >= PATH_MAX {
            warn!("path exceeds {PATH_MAX} bytes");
            return self.reply_status(false);
        }
        let host = match self.volumes.resolve(&meta.path) {
            Ok(path) => path,
            Err(e) => {
                warn!("{e}");
                return self.reply_status(false);
            }
        };
        if fs::symlink_metadata(&host).is_ok() {
            info!("refusing to overwrite {}", meta.path);
            return self.reply_status(false);
        }
        if meta.file_type == FILE_TYPE_DIR {
            match fs::create_dir(&host) {
                Ok(()) => {
                    debug!("created directory {}", host.display());
                    self.reply_status(true)
                }
                Err(e) => {
                    error!("cannot create directory {}: {e}", host.display());
                    self.reply_status(false)
                }
            }
        } else {
            self.session.path = Some(host.clone());
            self.session.pending = Some((host, meta));
            self.reply_status(true)
        }
    }

    /// MPARTH from the host: the download's stream header. Opens the
    /// announced target for truncating write.
    fn on_mparth(&mut self, payload: &[u8]) -> Result<()> {
        if payload.len() < 4 {
            warn!("malformed MPARTH payload");
            return self.reply_status(false);
        }
        let total = LittleEndian::read_u32(&payload[0..4]);
        if payload.len() >= 8 {
            // The host puts a constant here; nothing interprets it.
            let flags = LittleEndian::read_u32(&payload[4..8]);
            debug!("MPARTH total={total} flags={flags:#010x} (flags ignored)");
        } else {
            debug!("MPARTH total={total}");
        }
        self.session.close_file();
        let Some(path) = self.session.path.clone() else {
            warn!("MPARTH without an announced target");
            return self.reply_status(false);
        };
        match File::create(&path) {
            Ok(file) => {
                self.session.file = Some(file);
                self.session.set_transfer(Transfer::Receiving {
                    expected: total,
                    done: 0,
                });
                info!("receiving {} ({})", path.display(), fmt_size(total));
                self.reply_status(true)
            }
            Err(e) => {
                error!("cannot open {} for writing: {e}", path.display());
                self.session.set_transfer(Transfer::Idle);
                self.reply_status(false)
            }
        }
    }

    /// BLOCK during a download: a random-access write at the carried
    /// position. Outside a download the state machine is violated and
    /// the session ends.
    fn on_block(&mut self, payload: &[u8]) -> Result<()> {
        let (expected, done) = match self.session.transfer {
            Transfer::Receiving { expected, done } => (expected, done),
            _ => bail!("BLOCK received outside of a download"),
        };
        if payload.len() < 4 {
            warn!("malformed BLOCK payload");
            return self.reply_status(false);
        }
        let pos = LittleEndian::read_u32(&payload[0..4]);
        let data = &payload[4..];
        let Some(file) = self.session.file.as_mut() else {
            bail!("download in progress but no open file");
        };
        let written = file
            .seek(SeekFrom::Start(pos as u64))
            .and_then(|_| file.write_all(data));
        match written {
            Ok(()) => {
                let done = done + data.len() as u32;
                trace!("block pos={pos}, {done}/{expected}");
                self.session.transfer = Transfer::Receiving { expected, done };
                self.reply_status(true)
            }
            Err(e) => {
                error!("write failed at {pos}: {e}");
                self.session.close_file();
                self.session.set_transfer(Transfer::Idle);
                self.reply_status(false)
            }
        }
    }

    /// EOF from the host: ends whatever stream was in flight. No reply.
    /// The open file stays open until FILE_CLOSE.
    fn on_eof(&mut self) {
        debug!("end of stream");
        self.session.set_transfer(Transfer::Idle);
    }

    /// NEXT_PART poll during a device-to-host transfer: the next file
    /// chunk or directory buffer chunk, EOF once the stream is done. A
    /// poll with nothing in flight is logged and left unanswered.
    fn on_next_part(&mut self) -> Result<()> {
        let action = match &mut self.session.transfer {
            Transfer::Sending { total, sent } => {
                let Some(file) = self.session.file.as_mut() else {
                    bail!("upload in progress but no open file");
                };
                let read = file.stream_position().and_then(|pos| {
                    let mut data = vec![0u8; FILE_CHUNK];
                    let n = file.read(&mut data)?;
                    data.truncate(n);
                    Ok((pos, data))
                });
                match read {
                    Ok((pos, data)) if !data.is_empty() => {
                        *sent = pos as u32;
                        debug!("upload {}/{total}", pos as usize + data.len());
                        let mut payload = Vec::with_capacity(4 + data.len());
                        payload.extend_from_slice(&(pos as u32).to_le_bytes());
                        payload.extend_from_slice(&data);
                        Poll::Send(payload)
                    }
                    Ok(_) => Poll::Finish,
                    Err(e) => {
                        error!("read failed during upload: {e}");
                        Poll::Fail
                    }
                }
            }
            Transfer::StreamingDir(buf) => match buf.next_chunk() {
                Some((pos, chunk)) => {
                    let mut payload = Vec::with_capacity(4 + chunk.len());
                    payload.extend_from_slice(&pos.to_le_bytes());
                    payload.extend_from_slice(chunk);
                    Poll::Send(payload)
                }
                None => Poll::Finish,
            },
            Transfer::Idle | Transfer::Receiving { .. } => {
                debug!("spurious NEXT_PART poll");
                Poll::Silent
            }
        };
        match action {
            Poll::Send(payload) => self.reply(Opcode::Block, &payload),
            Poll::Finish => {
                self.session.set_transfer(Transfer::Idle);
                self.reply(Opcode::Eof, &[])
            }
            Poll::Fail => {
                self.session.set_transfer(Transfer::Idle);
                self.reply_status(false)
            }
            Poll::Silent => Ok(()),
        }
    }

    /// FILE_CLOSE: closes the open file and commits the metadata cached
    /// by FILE_RECV. The cache is consumed either way, so a close after
    /// an upload never stamps stale download metadata onto the file.
    fn on_file_close(&mut self) -> Result<()> {
        let had_file = self.session.file.take().is_some();
        let pending = self.session.pending.take();
        if had_file {
            if let Some((path, meta)) = pending {
                if let Err(e) = platform::set_protection(&path, meta.attrs) {
                    warn!("cannot set protection on {}: {e}", path.display());
                }
                if let Err(e) = platform::set_file_date(&path, meta.date, meta.time) {
                    warn!("cannot set date on {}: {e}", path.display());
                }
                info!("received {}", path.display());
            }
        }
        self.reply(Opcode::AckClose, &[])
    }

    /// FILE_SEND: the host requests an upload. Replies with the stream
    /// header carrying the file size; the host then polls with NEXT_PART.
    fn on_file_send(&mut self, payload: &[u8]) -> Result<()> {
        let (path_str, _) = nul_str(payload);
        debug!("FILE_SEND {path_str}");
        let host = match self.volumes.resolve(&path_str) {
            Ok(path) => path,
            Err(e) => {
                warn!("{e}");
                return self.reply_status(false);
            }
        };
        match fs::metadata(&host) {
            Ok(meta) if meta.is_file() => {}
            Ok(_) => {
                warn!("not a regular file: {path_str}");
                return self.reply_status(false);
            }
            Err(e) => {
                error!("cannot open {path_str} for reading: {e}");
                return self.reply_status(false);
            }
        }
        self.session.close_file();
        self.session.pending = None;
        let opened = File::open(&host).and_then(|mut file| {
            let size = file.seek(SeekFrom::End(0))?;
            file.seek(SeekFrom::Start(0))?;
            Ok((file, size))
        });
        match opened {
            Ok((file, size)) => {
                self.session.file = Some(file);
                self.session.path = Some(host);
                self.session.set_transfer(Transfer::Sending {
                    total: size as u32,
                    sent: 0,
                });
                info!("sending {path_str} ({})", fmt_size(size as u32));
                let mut header = [0u8; 4];
                LittleEndian::write_u32(&mut header, size as u32);
                self.reply(Opcode::Mparth, &header)
            }
            Err(e) => {
                error!("cannot open {path_str} for reading: {e}");
                self.reply_status(false)
            }
        }
    }

    /// DIR: encodes a directory listing (or, for an empty path, the
    /// volume list) and announces it with a stream header. Failures
    /// answer EOF rather than IOERR; that is what the host expects from
    /// a listing request.
    fn on_dir(&mut self, payload: &[u8]) -> Result<()> {
        let (path_str, _) = nul_str(payload);
        let entries = if path_str.is_empty() {
            info!("listing volumes");
            self.volumes.volume_entries()
        } else {
            debug!("DIR {path_str}");
            let host = match self.volumes.resolve(&path_str) {
                Ok(path) => path,
                Err(e) => {
                    warn!("{e}");
                    return self.reply(Opcode::Eof, &[]);
                }
            };
            match fs::metadata(&host) {
                Ok(meta) if meta.is_dir() => {}
                Ok(_) => {
                    warn!("not a directory: {path_str}");
                    return self.reply(Opcode::Eof, &[]);
                }
                Err(e) => {
                    warn!("cannot examine {path_str}: {e}");
                    return self.reply(Opcode::Eof, &[]);
                }
            }
            match platform::list_dir(&host) {
                Ok(entries) => entries,
                Err(e) => {
                    warn!("cannot list {path_str}: {e}");
                    return self.reply(Opcode::Eof, &[]);
                }
            }
        };
        let buf = DirBuffer::encode(entries);
        let mut header = [0u8; 4];
        LittleEndian::write_u32(&mut header, buf.total() as u32);
        self.session.set_transfer(Transfer::StreamingDir(buf));
        self.reply(Opcode::Mparth, &header)
    }

    fn on_file_delete(&mut self, payload: &[u8]) -> Result<()> {
        let (path_str, _) = nul_str(payload);
        info!("delete {path_str}");
        let result = self
            .volumes
            .resolve(&path_str)
            .and_then(|path| platform::delete(&path).map_err(anyhow::Error::from));
        if let Err(e) = &result {
            warn!("delete failed: {e}");
        }
        self.reply_status(result.is_ok())
    }

    fn on_file_rename(&mut self, payload: &[u8]) -> Result<()> {
        let (old, consumed) = nul_str(payload);
        let (new, _) = nul_str(&payload[consumed..]);
        info!("rename {old} -> {new}");
        let result = self.volumes.resolve(&old).and_then(|src| {
            let dst = self.volumes.resolve_sibling(&src, &new)?;
            fs::rename(&src, &dst).map_err(anyhow::Error::from)
        });
        if let Err(e) = &result {
            warn!("rename failed: {e}");
        }
        self.reply_status(result.is_ok())
    }

    fn on_file_move(&mut self, payload: &[u8]) -> Result<()> {
        let (old, consumed) = nul_str(payload);
        let (new, _) = nul_str(&payload[consumed..]);
        info!("move {old} -> {new}");
        let result = self.volumes.resolve(&old).and_then(|src| {
            let dst = self.volumes.resolve(&new)?;
            platform::move_entry(&src, &dst).map_err(anyhow::Error::from)
        });
        if let Err(e) = &result {
            warn!("move failed: {e}");
        }
        self.reply_status(result.is_ok())
    }

    fn on_file_copy(&mut self, payload: &[u8]) -> Result<()> {
        let (old, consumed) = nul_str(payload);
        let (new, _) = nul_str(&payload[consumed..]);
        info!("copy {old} -> {new}");
        let result = self.volumes.resolve(&old).and_then(|src| {
            let dst = self.volumes.resolve(&new)?;
            platform::copy_entry(&src, &dst).map_err(anyhow::Error::from)
        });
        if let Err(e) = &result {
            warn!("copy failed: {e}");
        }
        self.reply_status(result.is_ok())
    }

    fn on_file_attr(&mut self, payload: &[u8]) -> Result<()> {
        if payload.len() < 5 {
            warn!("malformed FILE_ATTR payload");
            return self.reply_status(false);
        }
        let attrs = LittleEndian::read_u32(&payload[0..4]);
        let (path_str, consumed) = nul_str(&payload[4..]);
        let (comment, _) = nul_str(&payload[4 + consumed..]);
        debug!("FILE_ATTR {path_str} attrs={attrs:#010x} comment={comment:?}");
        let result = self.volumes.resolve(&path_str).and_then(|path| {
            platform::set_protection(&path, attrs)?;
            platform::set_comment(&path, &comment)?;
            Ok(())
        });
        if let Err(e) = &result {
            warn!("setting attributes failed: {e}");
        }
        self.reply_status(result.is_ok())
    }
}

fn fmt_size(bytes: u32) -> String {
    format!(
        "{:.1}",
        Byte::from_u64(bytes as u64).get_appropriate_unit(UnitType::Binary)
    )
}
