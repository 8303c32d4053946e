//! Framed send/receive over a byte stream.
//!
//! The stream is any blocking `Read + Write` whose reads return either
//! `Ok(0)` or `ErrorKind::TimedOut` after roughly a second of silence,
//! which is how a serial port opened with a 1 second timeout behaves.
//! The framing loops rely on that to tell a silent peer from a corrupted
//! one: a pure timeout keeps the receiver listening, while a short or
//! mangled frame triggers a drain and a `PkRs` handshake so the peer
//! retransmits.

use std::io::{self, Read, Write};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use byteorder::{ByteOrder, LittleEndian};

use crate::crc::crc32;
use crate::error::{LinkError, Result};
use crate::wire::{ACK, HEADER_LEN, Header, MAX_PAYLOAD, NACK, Opcode};

/// Scratch size used while draining a corrupted line.
const DRAIN_CHUNK: usize = 512;

/// One received message: validated header plus payload bytes.
#[derive(Debug, Clone)]
pub struct Message {
    pub header: Header,
    pub payload: Vec<u8>,
}

impl Message {
    /// Decodes the header's message code, failing on codes this
    /// implementation does not know.
    pub fn opcode(&self) -> Result<Opcode> {
        Opcode::try_from(self.header.opcode)
    }
}

/// Framed, CRC-checked messaging over a byte device.
///
/// Owns the device, both sequence counters and the shutdown flag. The
/// flag is checked before every wait so that CTRL-C interrupts any
/// blocking read or write with [`LinkError::Interrupted`].
pub struct Framer<P> {
    port: P,
    stop: Arc<AtomicBool>,
    tx_seq: u32,
    rx_seq: u32,
}

impl<P: Read + Write> Framer<P> {
    pub fn new(port: P, stop: Arc<AtomicBool>) -> Self {
        Self {
            port,
            stop,
            tx_seq: 0,
            rx_seq: 0,
        }
    }

    fn check_stop(&self) -> Result<()> {
        if self.stop.load(Ordering::Acquire) {
            return Err(LinkError::Interrupted);
        }
        Ok(())
    }

    /// Reads until `buf` is full or the line stays silent for one timeout
    /// interval. Returns the number of bytes actually delivered.
    pub fn read_filling(&mut self, buf: &mut [u8]) -> Result<usize> {
        let mut filled = 0;
        while filled < buf.len() {
            self.check_stop()?;
            match self.port.read(&mut buf[filled..]) {
                Ok(0) => break,
                Ok(n) => filled += n,
                Err(e)
                    if e.kind() == io::ErrorKind::TimedOut
                        || e.kind() == io::ErrorKind::WouldBlock =>
                {
                    trace!("read timed out after {filled} bytes");
                    break;
                }
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e.into()),
            }
        }
        Ok(filled)
    }

    /// Writes all of `buf`; a device refusing bytes is fatal.
    pub fn write_exact(&mut self, buf: &[u8]) -> Result<()> {
        self.check_stop()?;
        self.port.write_all(buf)?;
        self.port.flush()?;
        Ok(())
    }

    /// Reads and discards bytes until the line goes quiet. Used to
    /// re-synchronize after a framing error.
    pub fn drain(&mut self) -> Result<()> {
        let mut scratch = [0u8; DRAIN_CHUNK];
        loop {
            if self.read_filling(&mut scratch)? == 0 {
                break;
            }
        }
        debug!("line drained");
        Ok(())
    }

    fn send_ack(&mut self) -> Result<()> {
        debug!("ACK");
        self.write_exact(&ACK)
    }

    fn send_nack(&mut self) -> Result<()> {
        debug!("NACK");
        self.write_exact(&NACK)
    }

    /// Receives one well-formed message, looping until the line delivers
    /// one. Corrupted headers and payloads are answered with `PkRs` after
    /// draining the line; a silent line keeps the receiver waiting. An
    /// announced payload larger than `max_payload` is unrecoverable and
    /// ends the session.
    ///
    /// Messages arriving out of sequence are treated exactly like
    /// corrupted ones, so a retransmission carrying the expected sequence
    /// number heals the session.
    pub fn read_message(&mut self, max_payload: usize) -> Result<Message> {
        loop {
            let mut raw = [0u8; HEADER_LEN];
            let got = self.read_filling(&mut raw)?;
            if got == 0 {
                // Silent line: keep listening.
                continue;
            }
            trace!("header bytes: {:02x?}", &raw[..got]);
            let decoded = if got == HEADER_LEN {
                Header::decode(&raw)
            } else {
                None
            };
            let Some(header) = decoded else {
                warn!("corrupted message header ({got} of {HEADER_LEN} bytes)");
                self.drain()?;
                self.send_nack()?;
                continue;
            };
            debug!(
                "RX  cmd=0x{:02x} len={} seq={}",
                header.opcode, header.len, header.seq
            );
            if header.len < 0 {
                warn!("negative payload length {}", header.len);
                self.drain()?;
                self.send_nack()?;
                continue;
            }
            let len = header.len as usize;
            if len > max_payload {
                error!("payload overflow ({len} > {max_payload})");
                self.send_nack()?;
                return Err(LinkError::PayloadTooLarge {
                    len,
                    max: max_payload,
                });
            }
            if header.seq != self.rx_seq {
                warn!(
                    "out-of-sequence message (expected {}, got {})",
                    self.rx_seq, header.seq
                );
                self.drain()?;
                self.send_nack()?;
                continue;
            }
            let mut payload = vec![0u8; len];
            if len > 0 {
                let got = self.read_filling(&mut payload)?;
                trace!("payload bytes: {:02x?}", &payload[..got]);
                let mut crc_raw = [0u8; 4];
                let got_crc = self.read_filling(&mut crc_raw)?;
                let wire_crc = LittleEndian::read_u32(&crc_raw);
                if got != len || got_crc != 4 || wire_crc != crc32(&payload) {
                    warn!(
                        "corrupted payload ({got} of {len} bytes, crc {wire_crc:08x} vs {:08x})",
                        crc32(&payload)
                    );
                    self.send_nack()?;
                    continue;
                }
            }
            self.rx_seq = header.seq.wrapping_add(1);
            self.send_ack()?;
            return Ok(Message { header, payload });
        }
    }

    /// Sends one message and waits for the peer's handshake. `PkRs`
    /// triggers a drain and a retransmit; a garbled or missing token is
    /// logged and the message is considered delivered best-effort, so one
    /// broken handshake cannot wedge the session in a retry loop.
    pub fn write_message(&mut self, opcode: Opcode, payload: &[u8]) -> Result<()> {
        debug_assert!(payload.len() <= MAX_PAYLOAD);
        let header = Header {
            opcode: opcode as u8,
            len: payload.len() as i16,
            seq: self.tx_seq,
        };
        self.tx_seq += 1;
        let raw = header.encode();
        debug!(
            "TX  cmd=0x{:02x} len={} seq={}",
            header.opcode, header.len, header.seq
        );
        loop {
            self.write_exact(&raw)?;
            if !payload.is_empty() {
                self.write_exact(payload)?;
                let mut crc_raw = [0u8; 4];
                LittleEndian::write_u32(&mut crc_raw, crc32(payload));
                self.write_exact(&crc_raw)?;
            }
            let mut token = [0u8; 4];
            let got = self.read_filling(&mut token)?;
            if got == 4 && token == ACK {
                return Ok(());
            }
            if got == 4 && token == NACK {
                warn!("peer requested retransmit");
                self.drain()?;
                continue;
            }
            error!("handshake failed (got {:02x?})", &token[..got]);
            return Ok(());
        }
    }
}
