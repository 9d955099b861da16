//! Frame encoding.
//!
//! The event loop has no write path, so this is used by tests, benchmarks
//! and load tools that need to produce client frames.

use bytes::{BufMut, BytesMut};

use crate::frame::OpCode;
use crate::mask::apply_mask;

/// Append one frame to `dst`.
///
/// When `mask` is given the payload is masked with it, as a client must do.
pub fn encode_frame(
    dst: &mut BytesMut,
    fin: bool,
    opcode: OpCode,
    payload: &[u8],
    mask: Option<[u8; 4]>,
) {
    let b0 = (opcode as u8) | if fin { 0x80 } else { 0x00 };
    let mask_bit = if mask.is_some() { 0x80 } else { 0x00 };
    let len = payload.len();

    dst.reserve(crate::MAX_HEADER_LEN + len);
    dst.put_u8(b0);
    if len <= 125 {
        dst.put_u8(mask_bit | len as u8);
    } else if len <= u16::MAX as usize {
        dst.put_u8(mask_bit | 126);
        dst.put_u16(len as u16);
    } else {
        dst.put_u8(mask_bit | 127);
        dst.put_u64(len as u64);
    }

    match mask {
        Some(key) => {
            dst.put_slice(&key);
            let start = dst.len();
            dst.put_slice(payload);
            apply_mask(&mut dst[start..], key);
        }
        None => dst.put_slice(payload),
    }
}
