//! Message decoding over a single read buffer.
//!
//! The decoder walks successive frames from the start of its input:
//!
//! - ping and pong frames are consumed and skipped,
//! - a close frame ends decoding: nothing after it is returned,
//! - data messages that do not match the configured [`Interest`] are
//!   discarded together with their continuation fragments,
//! - the first matching message is reassembled across its fragments and
//!   returned along with the number of input bytes it consumed.
//!
//! The decoder keeps no state between calls. If the input ends before a
//! message is complete the result is [`FrameError::Incomplete`]; the
//! [`Messages`] iterator additionally reports which tail of the input is still
//! undecoded so a caller can carry it into the next read.

use bytes::{Bytes, BytesMut};

use crate::error::{FrameError, Result};
use crate::frame::{parse_header, FrameHeader, OpCode};
use crate::mask::apply_mask;

/// Default upper bound for a single frame or reassembled message (1 MiB).
pub const DEFAULT_MAX_MESSAGE_SIZE: usize = 1024 * 1024;

/// Which side of the connection the decoder runs on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Role {
    /// Decoding frames sent by a client: every frame must be masked.
    #[default]
    Server,
    /// Decoding frames sent by a server: no frame may be masked.
    Client,
}

/// The data message kind the caller is waiting for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Interest {
    #[default]
    Text,
    Binary,
    /// Text or binary.
    Data,
}

impl Interest {
    /// Returns true if a message starting with `opcode` should be delivered.
    #[inline]
    pub fn accepts(self, opcode: OpCode) -> bool {
        match self {
            Interest::Text => opcode == OpCode::Text,
            Interest::Binary => opcode == OpCode::Binary,
            Interest::Data => opcode.is_data(),
        }
    }
}

/// Decoder settings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DecoderConfig {
    pub role: Role,
    pub interest: Interest,
    /// Reject text messages that are not valid UTF-8.
    pub check_utf8: bool,
    /// Upper bound for a single frame payload and for a reassembled message.
    pub max_message_size: usize,
}

impl Default for DecoderConfig {
    fn default() -> Self {
        Self {
            role: Role::Server,
            interest: Interest::Text,
            check_utf8: true,
            max_message_size: DEFAULT_MAX_MESSAGE_SIZE,
        }
    }
}

/// A complete application message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    /// `Text` or `Binary`.
    pub opcode: OpCode,
    /// Unmasked, reassembled payload.
    pub payload: Bytes,
}

impl Message {
    /// The payload as a string, for text messages.
    pub fn as_text(&self) -> Option<&str> {
        if self.opcode != OpCode::Text {
            return None;
        }
        std::str::from_utf8(&self.payload).ok()
    }
}

/// Status carried by a close frame that was skipped during decoding.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CloseFrame {
    /// `None` when the peer sent an empty close payload.
    pub code: Option<u16>,
    pub reason: String,
}

/// Result of a successful [`Decoder::decode`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Decoded {
    pub message: Message,
    /// Input bytes consumed up to and including the message's final frame.
    pub consumed: usize,
}

/// Outcome of one scan over the input.
enum Scan {
    Message(Message, usize),
    /// Input ran out. `committed` bytes at the front were fully processed
    /// frames that belong to no pending message and can be dropped.
    NeedMore { committed: usize },
    /// A close frame ended the stream after `consumed` bytes. Nothing past
    /// it is decoded.
    Closed { consumed: usize },
}

/// Stateless WebSocket message decoder.
#[derive(Debug, Clone, Default)]
pub struct Decoder {
    config: DecoderConfig,
}

impl Decoder {
    pub fn new(config: DecoderConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &DecoderConfig {
        &self.config
    }

    /// Decode the first message matching the configured interest.
    ///
    /// Fails with [`FrameError::Incomplete`] if `input` ends, or a close
    /// frame arrives, before a matching message is complete.
    pub fn decode(&self, input: &[u8]) -> Result<Decoded> {
        let mut close = None;
        match self.scan(input, &mut close)? {
            Scan::Message(message, consumed) => Ok(Decoded { message, consumed }),
            Scan::NeedMore { .. } | Scan::Closed { .. } => Err(FrameError::Incomplete),
        }
    }

    /// Iterate over every matching message in `input`.
    pub fn messages<'d, 'a>(&'d self, input: &'a [u8]) -> Messages<'d, 'a> {
        Messages {
            decoder: self,
            input,
            pos: 0,
            close: None,
            finished: false,
        }
    }

    fn scan(&self, input: &[u8], close: &mut Option<CloseFrame>) -> Result<Scan> {
        let mut pos = 0;
        let mut committed = 0;
        let mut assembling: Option<(OpCode, BytesMut)> = None;
        let mut discarding = false;

        loop {
            let Some(header) = parse_header(&input[pos..])? else {
                return Ok(Scan::NeedMore { committed });
            };
            self.check_header(&header)?;

            if ((input.len() - pos) as u64) < header.frame_len() {
                return Ok(Scan::NeedMore { committed });
            }
            let start = pos + header.header_len;
            let end = start + header.payload_len as usize;
            let payload = &input[start..end];
            pos = end;

            match header.opcode {
                OpCode::Close => {
                    // A fragmented message still in progress is abandoned.
                    *close = Some(self.parse_close(payload, header.mask)?);
                    return Ok(Scan::Closed { consumed: pos });
                }
                OpCode::Ping | OpCode::Pong => {
                    if assembling.is_none() && !discarding {
                        committed = pos;
                    }
                }
                OpCode::Continuation => {
                    if let Some((_, buf)) = assembling.as_mut() {
                        let total = buf.len() + payload.len();
                        if total > self.config.max_message_size {
                            return Err(FrameError::MessageTooLarge {
                                size: total as u64,
                                limit: self.config.max_message_size,
                            });
                        }
                        append_unmasked(buf, payload, header.mask);
                        if header.fin {
                            if let Some((opcode, buf)) = assembling.take() {
                                return Ok(Scan::Message(self.finish(opcode, buf)?, pos));
                            }
                        }
                    } else if discarding {
                        if header.fin {
                            discarding = false;
                            committed = pos;
                        }
                    } else {
                        return Err(FrameError::UnexpectedContinuation);
                    }
                }
                OpCode::Text | OpCode::Binary => {
                    if assembling.is_some() || discarding {
                        return Err(FrameError::InterleavedMessage);
                    }
                    if !self.config.interest.accepts(header.opcode) {
                        if header.fin {
                            committed = pos;
                        } else {
                            discarding = true;
                        }
                        continue;
                    }

                    let mut buf = BytesMut::with_capacity(payload.len());
                    append_unmasked(&mut buf, payload, header.mask);
                    if header.fin {
                        return Ok(Scan::Message(self.finish(header.opcode, buf)?, pos));
                    }
                    assembling = Some((header.opcode, buf));
                }
            }
        }
    }

    fn check_header(&self, header: &FrameHeader) -> Result<()> {
        match (self.config.role, header.mask.is_some()) {
            (Role::Server, false) => return Err(FrameError::UnmaskedFrame),
            (Role::Client, true) => return Err(FrameError::UnexpectedMask),
            _ => {}
        }
        if header.payload_len > self.config.max_message_size as u64 {
            return Err(FrameError::MessageTooLarge {
                size: header.payload_len,
                limit: self.config.max_message_size,
            });
        }
        Ok(())
    }

    fn finish(&self, opcode: OpCode, buf: BytesMut) -> Result<Message> {
        if opcode == OpCode::Text && self.config.check_utf8 && std::str::from_utf8(&buf).is_err() {
            return Err(FrameError::InvalidUtf8);
        }
        Ok(Message {
            opcode,
            payload: buf.freeze(),
        })
    }

    fn parse_close(&self, payload: &[u8], mask: Option<[u8; 4]>) -> Result<CloseFrame> {
        let mut data = payload.to_vec();
        if let Some(key) = mask {
            apply_mask(&mut data, key);
        }
        match data.len() {
            0 => Ok(CloseFrame {
                code: None,
                reason: String::new(),
            }),
            1 => Err(FrameError::InvalidClosePayload),
            _ => {
                let code = u16::from_be_bytes([data[0], data[1]]);
                let reason = if self.config.check_utf8 {
                    String::from_utf8(data[2..].to_vec())
                        .map_err(|_| FrameError::InvalidClosePayload)?
                } else {
                    String::from_utf8_lossy(&data[2..]).into_owned()
                };
                Ok(CloseFrame {
                    code: Some(code),
                    reason,
                })
            }
        }
    }
}

fn append_unmasked(dst: &mut BytesMut, payload: &[u8], mask: Option<[u8; 4]>) {
    let start = dst.len();
    dst.extend_from_slice(payload);
    if let Some(key) = mask {
        apply_mask(&mut dst[start..], key);
    }
}

/// Iterator over every matching message in one buffer.
///
/// Iteration stops at the first error or when the remaining bytes do not
/// hold a complete message. [`Messages::remaining`] then returns the tail
/// that still has to be decoded.
pub struct Messages<'d, 'a> {
    decoder: &'d Decoder,
    input: &'a [u8],
    pos: usize,
    close: Option<CloseFrame>,
    finished: bool,
}

impl<'d, 'a> Messages<'d, 'a> {
    /// Bytes not yet decoded into a message or a skipped frame.
    pub fn remaining(&self) -> &'a [u8] {
        &self.input[self.pos..]
    }

    /// Bytes decoded so far.
    pub fn consumed(&self) -> usize {
        self.pos
    }

    /// The first close frame skipped so far, if any.
    pub fn close_frame(&self) -> Option<&CloseFrame> {
        self.close.as_ref()
    }
}

impl Iterator for Messages<'_, '_> {
    type Item = Result<Message>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.finished {
            return None;
        }
        match self.decoder.scan(&self.input[self.pos..], &mut self.close) {
            Ok(Scan::Message(message, consumed)) => {
                self.pos += consumed;
                Some(Ok(message))
            }
            Ok(Scan::NeedMore { committed }) => {
                self.pos += committed;
                self.finished = true;
                None
            }
            Ok(Scan::Closed { consumed }) => {
                self.pos += consumed;
                self.finished = true;
                None
            }
            Err(e) => {
                self.finished = true;
                Some(Err(e))
            }
        }
    }
}
