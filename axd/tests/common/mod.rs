//! Test harness: an in-memory duplex pipe standing in for the serial
//! line, a host-side protocol driver, and an agent running on its own
//! thread against a scratch directory.

use std::collections::VecDeque;
use std::io::{self, Read, Write};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use byteorder::{ByteOrder, LittleEndian};
use tempfile::TempDir;

use ax_proto::crc::crc32;
use ax_proto::wire::{ACK, HEADER_LEN, Header};
use ax_proto::LinkError;
use axd::agent::Agent;
use axd::config::{Config, VolumeConfig};
use axd::platform::VolumeTable;

/// How long one end waits on an empty pipe before reporting a timeout,
/// mimicking a serial port's read timeout (shortened to keep tests fast).
const PIPE_TIMEOUT: Duration = Duration::from_millis(200);

#[derive(Default)]
struct Channel {
    queue: Mutex<VecDeque<u8>>,
    ready: Condvar,
}

/// One end of an in-memory duplex byte pipe.
pub struct PipeEnd {
    rx: Arc<Channel>,
    tx: Arc<Channel>,
}

/// Creates a connected pair of pipe ends.
pub fn duplex() -> (PipeEnd, PipeEnd) {
    let a = Arc::new(Channel::default());
    let b = Arc::new(Channel::default());
    (
        PipeEnd {
            rx: a.clone(),
            tx: b.clone(),
        },
        PipeEnd { rx: b, tx: a },
    )
}

impl Read for PipeEnd {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let mut queue = self.rx.queue.lock().unwrap();
        while queue.is_empty() {
            let (guard, wait) = self.rx.ready.wait_timeout(queue, PIPE_TIMEOUT).unwrap();
            queue = guard;
            if wait.timed_out() && queue.is_empty() {
                return Err(io::Error::new(io::ErrorKind::TimedOut, "pipe timeout"));
            }
        }
        let n = buf.len().min(queue.len());
        for slot in &mut buf[..n] {
            *slot = queue.pop_front().unwrap();
        }
        Ok(n)
    }
}

impl Write for PipeEnd {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let mut queue = self.tx.queue.lock().unwrap();
        queue.extend(buf);
        self.tx.ready.notify_all();
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

/// Host-side protocol driver: frames messages the way the host peer
/// does and checks every handshake and sequence number on the way.
pub struct Host {
    port: PipeEnd,
    tx_seq: u32,
    rx_seq: u32,
}

impl Host {
    fn read_exact_patient(&mut self, buf: &mut [u8]) {
        let deadline = Instant::now() + Duration::from_secs(10);
        let mut filled = 0;
        while filled < buf.len() {
            match self.port.read(&mut buf[filled..]) {
                Ok(n) => filled += n,
                Err(e) if e.kind() == io::ErrorKind::TimedOut => {
                    assert!(Instant::now() < deadline, "timed out waiting for the agent");
                }
                Err(e) => panic!("pipe read failed: {e}"),
            }
        }
    }

    /// Raw frame bytes for `opcode`/`payload` at the current sequence.
    pub fn frame(&self, opcode: u8, payload: &[u8]) -> Vec<u8> {
        let mut raw = Header {
            opcode,
            len: payload.len() as i16,
            seq: self.tx_seq,
        }
        .encode()
        .to_vec();
        if !payload.is_empty() {
            raw.extend_from_slice(payload);
            let mut crc_raw = [0u8; 4];
            LittleEndian::write_u32(&mut crc_raw, crc32(payload));
            raw.extend_from_slice(&crc_raw);
        }
        raw
    }

    /// Writes raw bytes and returns the agent's 4-byte handshake token.
    /// Does not advance the send sequence.
    pub fn send_raw(&mut self, raw: &[u8]) -> [u8; 4] {
        self.port.write_all(raw).unwrap();
        let mut token = [0u8; 4];
        self.read_exact_patient(&mut token);
        token
    }

    /// Sends one message and asserts the agent accepts the frame.
    pub fn send(&mut self, opcode: u8, payload: &[u8]) {
        let raw = self.frame(opcode, payload);
        let token = self.send_raw(&raw);
        assert_eq!(token, ACK, "agent rejected frame 0x{opcode:02x}");
        self.tx_seq += 1;
    }

    /// Receives one message from the agent, verifying CRCs and the
    /// sequence number, and acknowledges it.
    pub fn recv(&mut self) -> (u8, Vec<u8>) {
        let mut raw = [0u8; HEADER_LEN];
        self.read_exact_patient(&mut raw);
        let header = Header::decode(&raw).expect("agent sent a corrupt header");
        assert_eq!(header.seq, self.rx_seq, "agent sequence out of order");
        self.rx_seq += 1;
        let len = header.len as usize;
        let mut payload = vec![0u8; len];
        if len > 0 {
            self.read_exact_patient(&mut payload);
            let mut crc_raw = [0u8; 4];
            self.read_exact_patient(&mut crc_raw);
            assert_eq!(
                LittleEndian::read_u32(&crc_raw),
                crc32(&payload),
                "agent sent a corrupt payload"
            );
        }
        self.port.write_all(&ACK).unwrap();
        (header.opcode, payload)
    }
}

/// An agent running on its own thread against a scratch directory
/// exported as volume `T`.
pub struct Rig {
    pub host: Host,
    pub dir: TempDir,
    stop: Arc<AtomicBool>,
    handle: JoinHandle<anyhow::Result<()>>,
}

pub fn start() -> Rig {
    let _ = env_logger::builder().is_test(true).try_init();
    let dir = tempfile::tempdir().unwrap();
    let (host_end, agent_end) = duplex();
    let stop = Arc::new(AtomicBool::new(false));
    let volumes = VolumeTable::from_config(&Config {
        volumes: vec![VolumeConfig {
            name: "T".into(),
            path: dir.path().to_path_buf(),
        }],
    })
    .unwrap();
    let handle = thread::spawn({
        let stop = stop.clone();
        move || Agent::new(agent_end, stop, volumes).run()
    });
    Rig {
        host: Host {
            port: host_end,
            tx_seq: 0,
            rx_seq: 0,
        },
        dir,
        stop,
        handle,
    }
}

impl Rig {
    /// Stops the agent and asserts it went down on the operator signal,
    /// not on a protocol error.
    pub fn shutdown(self) {
        self.stop.store(true, Ordering::Release);
        let result = self.handle.join().expect("agent thread panicked");
        let err = result.expect_err("the agent loop only ends with an error");
        assert!(
            matches!(err.downcast_ref::<LinkError>(), Some(LinkError::Interrupted)),
            "agent died on its own: {err:?}"
        );
    }

    /// Waits for the agent to die on a protocol violation and returns
    /// the error.
    pub fn join_error(self) -> anyhow::Error {
        self.handle
            .join()
            .expect("agent thread panicked")
            .expect_err("expected the agent to abort the session")
    }
}
