//! Directory listing encoder and chunked streaming.
//!
//! A DIR request is answered by encoding the whole listing into one
//! in-memory buffer up front: a u32 entry count followed by one wire
//! record per entry. The host then polls the buffer out of the device in
//! BLOCK-sized chunks, so the directory can be walked once and released
//! before the first chunk leaves the wire.

use byteorder::{ByteOrder, LittleEndian};

use ax_proto::wire::{DIR_CHUNK, DIRBUF_SIZE, DirEntry};

/// An encoded directory listing being streamed to the host.
#[derive(Debug, Default)]
pub struct DirBuffer {
    data: Vec<u8>,
    offset: usize,
}

impl DirBuffer {
    /// Encodes a listing. Entries that would push the buffer past its
    /// capacity are dropped; the host still receives everything encoded
    /// up to that point.
    pub fn encode(entries: impl IntoIterator<Item = DirEntry>) -> Self {
        let mut data = vec![0u8; 4];
        let mut count: u32 = 0;
        for entry in entries {
            if data.len() + entry.encoded_len() > DIRBUF_SIZE {
                error!("directory listing overflows {DIRBUF_SIZE} byte buffer, truncating");
                break;
            }
            entry.encode_into(&mut data);
            count += 1;
        }
        LittleEndian::write_u32(&mut data[..4], count);
        debug!("encoded {count} directory entries, {} bytes", data.len());
        DirBuffer { data, offset: 0 }
    }

    /// Total encoded size in bytes.
    pub fn total(&self) -> usize {
        self.data.len()
    }

    /// The next chunk to stream: its buffer offset and up to
    /// [`DIR_CHUNK`] bytes, or `None` once the buffer is exhausted.
    pub fn next_chunk(&mut self) -> Option<(u32, &[u8])> {
        if self.offset >= self.data.len() {
            return None;
        }
        let start = self.offset;
        let end = (start + DIR_CHUNK).min(self.data.len());
        self.offset = end;
        Some((start as u32, &self.data[start..end]))
    }
}
