//! Frame header parsing (RFC 6455 Section 5.2).
//!
//! ```text
//!  0                   1                   2                   3
//!  0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1
//! +-+-+-+-+-------+-+-------------+-------------------------------+
//! |F|R|R|R| opcode|M| Payload len |    Extended payload length    |
//! |I|S|S|S|  (4)  |A|     (7)     |             (16/64)           |
//! |N|V|V|V|       |S|             |   (if payload len==126/127)   |
//! | |1|2|3|       |K|             |                               |
//! +-+-+-+-+-------+-+-------------+ - - - - - - - - - - - - - - - +
//! ```

use crate::error::{FrameError, Result};
use crate::MAX_CONTROL_PAYLOAD;

const FIN_BIT: u8 = 0x80;
const RSV_BITS: u8 = 0x70;
const OPCODE_MASK: u8 = 0x0F;
const MASK_BIT: u8 = 0x80;
const LEN_MASK: u8 = 0x7F;

/// WebSocket opcode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum OpCode {
    Continuation = 0x0,
    Text = 0x1,
    Binary = 0x2,
    Close = 0x8,
    Ping = 0x9,
    Pong = 0xA,
}

impl OpCode {
    /// Parse an opcode nibble. Reserved values return `None`.
    #[inline]
    pub fn from_u8(byte: u8) -> Option<Self> {
        match byte {
            0x0 => Some(OpCode::Continuation),
            0x1 => Some(OpCode::Text),
            0x2 => Some(OpCode::Binary),
            0x8 => Some(OpCode::Close),
            0x9 => Some(OpCode::Ping),
            0xA => Some(OpCode::Pong),
            _ => None,
        }
    }

    /// Control frames are close, ping and pong.
    #[inline]
    pub fn is_control(self) -> bool {
        (self as u8) & 0x8 != 0
    }

    /// Data frames are text and binary (continuation excluded).
    #[inline]
    pub fn is_data(self) -> bool {
        matches!(self, OpCode::Text | OpCode::Binary)
    }
}

impl std::fmt::Display for OpCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            OpCode::Continuation => "continuation",
            OpCode::Text => "text",
            OpCode::Binary => "binary",
            OpCode::Close => "close",
            OpCode::Ping => "ping",
            OpCode::Pong => "pong",
        };
        f.write_str(name)
    }
}

/// A fully parsed frame header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameHeader {
    /// Final fragment flag.
    pub fin: bool,
    pub opcode: OpCode,
    /// Masking key, present on client-to-server frames.
    pub mask: Option<[u8; 4]>,
    /// Declared payload length.
    pub payload_len: u64,
    /// Number of header bytes, mask included.
    pub header_len: usize,
}

impl FrameHeader {
    /// Total encoded size of the frame (header plus payload).
    #[inline]
    pub fn frame_len(&self) -> u64 {
        self.header_len as u64 + self.payload_len
    }
}

/// Parse one frame header from the start of `input`.
///
/// Returns `Ok(None)` when `input` is too short to hold the whole header.
/// The payload itself is not required to be present. Structural rules that
/// can be checked from the header alone are enforced here: reserved bits,
/// opcode validity, control frame shape and minimal length encoding.
///
/// Masking rules depend on the peer role and are checked by the decoder.
pub fn parse_header(input: &[u8]) -> Result<Option<FrameHeader>> {
    if input.len() < 2 {
        return Ok(None);
    }

    let b0 = input[0];
    let b1 = input[1];

    let rsv = (b0 & RSV_BITS) >> 4;
    if rsv != 0 {
        return Err(FrameError::ReservedBits(rsv));
    }

    let raw_opcode = b0 & OPCODE_MASK;
    let opcode = OpCode::from_u8(raw_opcode).ok_or(FrameError::UnknownOpcode(raw_opcode))?;
    let fin = b0 & FIN_BIT != 0;

    if opcode.is_control() && !fin {
        return Err(FrameError::FragmentedControl);
    }

    let masked = b1 & MASK_BIT != 0;
    let (payload_len, mut header_len) = match b1 & LEN_MASK {
        126 => {
            if input.len() < 4 {
                return Ok(None);
            }
            let len = u16::from_be_bytes([input[2], input[3]]) as u64;
            if len < 126 {
                return Err(FrameError::NonMinimalLength);
            }
            (len, 4)
        }
        127 => {
            if input.len() < 10 {
                return Ok(None);
            }
            let mut raw = [0u8; 8];
            raw.copy_from_slice(&input[2..10]);
            let len = u64::from_be_bytes(raw);
            if len >> 63 != 0 {
                return Err(FrameError::InvalidLength);
            }
            if len <= u16::MAX as u64 {
                return Err(FrameError::NonMinimalLength);
            }
            (len, 10)
        }
        short => (short as u64, 2),
    };

    if opcode.is_control() && payload_len > MAX_CONTROL_PAYLOAD as u64 {
        return Err(FrameError::ControlTooLong(payload_len));
    }

    let mask = if masked {
        if input.len() < header_len + 4 {
            return Ok(None);
        }
        let key = [
            input[header_len],
            input[header_len + 1],
            input[header_len + 2],
            input[header_len + 3],
        ];
        header_len += 4;
        Some(key)
    } else {
        None
    };

    Ok(Some(FrameHeader {
        fin,
        opcode,
        mask,
        payload_len,
        header_len,
    }))
}
