//! Errors raised by the event loop core.
//!
//! Every per-connection variant carries the handle it concerns and leads to
//! the removal of exactly that connection. `Facility` errors concern the
//! multiplexer or the ring as a whole; they are logged and the loop carries
//! on.

use crate::netio::SubmitFailure;
use std::io;
use std::os::fd::RawFd;
use thiserror::Error;
use wsring_proto::FrameError;

#[derive(Debug, Error)]
pub enum CoreError {
    #[error("failed to register fd {fd} for readiness: {source}")]
    Registration {
        fd: RawFd,
        #[source]
        source: io::Error,
    },

    #[error("failed to submit read for fd {fd}: {source}")]
    Submission {
        fd: RawFd,
        #[source]
        source: SubmitFailure,
    },

    #[error("read failed on fd {fd}: {source}")]
    ReadFailure {
        fd: RawFd,
        #[source]
        source: io::Error,
    },

    #[error("frame error on fd {fd}: {source}")]
    Frame {
        fd: RawFd,
        #[source]
        source: FrameError,
    },

    #[error("{facility} failed: {source}")]
    Facility {
        facility: &'static str,
        #[source]
        source: io::Error,
    },
}

impl CoreError {
    /// A zero-byte read: the peer closed its side.
    pub fn peer_closed(fd: RawFd) -> Self {
        CoreError::ReadFailure {
            fd,
            source: io::Error::new(io::ErrorKind::UnexpectedEof, "peer closed the connection"),
        }
    }

    /// The connection this error concerns, if any.
    pub fn fd(&self) -> Option<RawFd> {
        match self {
            CoreError::Registration { fd, .. }
            | CoreError::Submission { fd, .. }
            | CoreError::ReadFailure { fd, .. }
            | CoreError::Frame { fd, .. } => Some(*fd),
            CoreError::Facility { .. } => None,
        }
    }

    /// Whether this is an orderly close rather than a fault worth a warning.
    pub fn is_peer_close(&self) -> bool {
        matches!(
            self,
            CoreError::ReadFailure { source, .. }
                if source.kind() == io::ErrorKind::UnexpectedEof
                    || source.kind() == io::ErrorKind::ConnectionReset
        )
    }

    /// Short label for structured logs.
    pub fn kind(&self) -> &'static str {
        match self {
            CoreError::Registration { .. } => "registration",
            CoreError::Submission { .. } => "submission",
            CoreError::ReadFailure { .. } => "read",
            CoreError::Frame { .. } => "frame",
            CoreError::Facility { .. } => "facility",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fd_per_variant() {
        let frame = CoreError::Frame {
            fd: 7,
            source: FrameError::InvalidUtf8,
        };
        assert_eq!(frame.fd(), Some(7));
        assert_eq!(frame.kind(), "frame");

        let facility = CoreError::Facility {
            facility: "epoll_wait",
            source: io::Error::from_raw_os_error(libc::EBADF),
        };
        assert_eq!(facility.fd(), None);
        assert!(facility.to_string().starts_with("epoll_wait failed"));
    }

    #[test]
    fn test_peer_close_classification() {
        assert!(CoreError::peer_closed(9).is_peer_close());
        let reset = CoreError::ReadFailure {
            fd: 9,
            source: io::Error::from(io::ErrorKind::ConnectionReset),
        };
        assert!(reset.is_peer_close());
        let canceled = CoreError::ReadFailure {
            fd: 9,
            source: io::Error::from_raw_os_error(libc::ECANCELED),
        };
        assert!(!canceled.is_peer_close());
    }

    #[test]
    fn test_display_includes_source() {
        let err = CoreError::Submission {
            fd: 3,
            source: SubmitFailure::QueueFull,
        };
        assert_eq!(
            err.to_string(),
            "failed to submit read for fd 3: submission queue is full"
        );
    }
}
