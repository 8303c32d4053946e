//! CRC-32 checksum implementation.
//!
//! The link protects headers and payloads with the IEEE 802.3 CRC-32:
//! reflected, polynomial 0xEDB88320, register initialised to 0xFFFFFFFF,
//! final XOR 0xFFFFFFFF. This is the `CRC-32/ISO-HDLC` parameterisation.

use crc::{CRC_32_ISO_HDLC, Crc};

const CRC32: Crc<u32> = Crc::<u32>::new(&CRC_32_ISO_HDLC);

/// Computes the CRC-32 of a byte span.
///
/// An empty span checksums to 0.
pub fn crc32(data: &[u8]) -> u32 {
    CRC32.checksum(data)
}
