//! Error types for frame decoding.
//!
//! Every variant except [`FrameError::Incomplete`] means the byte stream can
//! no longer be trusted and the connection must be torn down. Variants map to
//! the close codes of RFC 6455 Section 7.4.1.

use thiserror::Error;

/// Result type for frame operations.
pub type Result<T> = std::result::Result<T, FrameError>;

/// Errors that can occur while decoding WebSocket frames.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum FrameError {
    /// The input ended before a complete message was available.
    ///
    /// This is the only recoverable variant: the caller may keep the
    /// undecoded bytes and retry once more data has arrived.
    #[error("input ended before a complete message was decoded")]
    Incomplete,

    /// RSV1-3 were set but no extension was negotiated.
    #[error("reserved bits set without a negotiated extension: {0:#05b}")]
    ReservedBits(u8),

    /// The opcode nibble is one of the reserved values.
    #[error("unknown opcode {0:#x}")]
    UnknownOpcode(u8),

    /// A control frame arrived without FIN set.
    #[error("control frame must not be fragmented")]
    FragmentedControl,

    /// A control frame declared more than 125 payload bytes.
    #[error("control frame payload of {0} bytes exceeds 125")]
    ControlTooLong(u64),

    /// The payload length used a longer encoding than needed.
    #[error("payload length is not minimally encoded")]
    NonMinimalLength,

    /// The 64-bit payload length had its most significant bit set.
    #[error("payload length has the most significant bit set")]
    InvalidLength,

    /// A client frame arrived without a masking key.
    #[error("frames sent by a client must be masked")]
    UnmaskedFrame,

    /// A server frame arrived with a masking key.
    #[error("frames sent by a server must not be masked")]
    UnexpectedMask,

    /// A frame or reassembled message exceeded the configured limit.
    #[error("message of {size} bytes exceeds limit of {limit}")]
    MessageTooLarge { size: u64, limit: usize },

    /// A text message was not valid UTF-8.
    #[error("text message is not valid UTF-8")]
    InvalidUtf8,

    /// A continuation frame arrived with no fragmented message in progress.
    #[error("continuation frame without a message in progress")]
    UnexpectedContinuation,

    /// A new data frame started while a fragmented message was in progress.
    #[error("new data frame while a fragmented message is in progress")]
    InterleavedMessage,

    /// A close frame carried a one-byte payload or an invalid reason.
    #[error("malformed close frame payload")]
    InvalidClosePayload,
}

impl FrameError {
    /// Returns true if more input may turn this into a successful decode.
    pub fn is_incomplete(&self) -> bool {
        matches!(self, FrameError::Incomplete)
    }

    /// Returns the close status code a peer should be sent for this error.
    pub fn close_code(&self) -> u16 {
        match self {
            FrameError::Incomplete => 1006,
            FrameError::InvalidUtf8 | FrameError::InvalidClosePayload => 1007,
            FrameError::MessageTooLarge { .. } => 1009,
            _ => 1002,
        }
    }
}
