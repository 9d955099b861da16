//! Minimal RFC 6455 frame decoding for the wsring event loop.
//!
//! This crate turns the bytes delivered by a single completed read into
//! application-level WebSocket messages. It is deliberately small:
//!
//! - **Stateless decoding**: every call starts from a frame boundary. Bytes
//!   that do not yet form a complete message are reported back to the caller,
//!   which decides whether to carry them into the next read.
//! - **Control frames are skipped**: ping and pong frames are consumed
//!   without producing a message. A close frame stops decoding; it is
//!   reported by [`Messages::close_frame`] so the caller can tear the
//!   connection down, and the bytes after it are left undecoded.
//! - **Interest filtering**: data messages that do not match the awaited
//!   opcode are discarded, fragments included.
//! - **No extensions**: RSV bits must be zero (no permessage-deflate).
//!
//! # Example
//!
//! ```rust
//! use bytes::BytesMut;
//! use wsring_proto::{encode_frame, Decoder, DecoderConfig, OpCode};
//!
//! let mut wire = BytesMut::new();
//! encode_frame(&mut wire, true, OpCode::Text, b"hello", Some([1, 2, 3, 4]));
//!
//! let decoder = Decoder::new(DecoderConfig::default());
//! let decoded = decoder.decode(&wire).unwrap();
//! assert_eq!(decoded.message.opcode, OpCode::Text);
//! assert_eq!(&decoded.message.payload[..], b"hello");
//! assert_eq!(decoded.consumed, wire.len());
//! ```

pub mod decoder;
pub mod encoder;
pub mod error;
pub mod frame;
pub mod mask;

pub use decoder::{CloseFrame, Decoded, Decoder, DecoderConfig, Interest, Message, Messages, Role};
pub use encoder::encode_frame;
pub use error::{FrameError, Result};
pub use frame::{parse_header, FrameHeader, OpCode};

/// Largest possible frame header: 2 base bytes, 8 length bytes, 4 mask bytes.
pub const MAX_HEADER_LEN: usize = 14;

/// Largest payload a control frame may carry (RFC 6455 Section 5.5).
pub const MAX_CONTROL_PAYLOAD: usize = 125;
