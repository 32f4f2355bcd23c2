//! Fixed 10-byte preamble codec.
//!
//! Layout, network (big-endian) byte order:
//! ```text
//! offset  size  field
//!  0      1     checksum
//!  1      4     body_size     (unsigned, excludes the preamble itself)
//!  5      4     msg_id
//!  9      1     is_compressed (0 or 1)
//! ```
//! The version byte is part of the one-time handshake, not of this
//! per-message preamble.

use crate::error::ProtocolError;
use bytes::{Buf, BufMut, BytesMut};

pub const PREAMBLE_SIZE: usize = 10;

const CHECKSUM_MAGIC: u8 = 194;

fn checksum(body_size: u32, msg_id: u32) -> u8 {
    let low_byte = body_size.wrapping_add(msg_id) as u8;
    CHECKSUM_MAGIC ^ (low_byte ^ 0xFF)
}

/// Encode a preamble for a message of `body_size` bytes.
pub fn encode(msg_id: u32, body_size: u32, is_compressed: bool, dst: &mut BytesMut) {
    dst.reserve(PREAMBLE_SIZE);
    dst.put_u8(checksum(body_size, msg_id));
    dst.put_u32(body_size);
    dst.put_u32(msg_id);
    dst.put_u8(is_compressed as u8);
}

/// Decode a 10-byte preamble. `src` must contain at least `PREAMBLE_SIZE`
/// bytes; only that many are consumed.
pub fn decode(src: &mut BytesMut) -> Result<(u32, u32, bool), ProtocolError> {
    debug_assert!(src.len() >= PREAMBLE_SIZE);
    let got = src.get_u8();
    let body_size = src.get_u32();
    let msg_id = src.get_u32();
    let is_compressed = src.get_u8() != 0;

    let expected = checksum(body_size, msg_id);
    if got != expected {
        return Err(ProtocolError::Checksum { expected, got });
    }

    Ok((body_size, msg_id, is_compressed))
}
