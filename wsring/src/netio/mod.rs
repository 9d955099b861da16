//! Network I/O facilities.
//!
//! - [`buffer`]: bounded pool of fixed-size read buffers
//! - [`epoll`]: readiness multiplexer
//! - [`ring`]: io_uring completion ring and its reaper
//! - [`socket`]: upgrade listener and the upgraded-socket boundary
//!
//! For the loop that drives them, see the `worker` module.

pub mod buffer;
pub mod config;
pub mod epoll;
pub mod ring;
pub mod socket;

pub use buffer::{Buffer, BufferPool};
pub use config::{BufferPoolConfig, NetIoConfig, ReadinessMode};
pub use epoll::{Epoll, Readiness};
pub use ring::{Completion, CompletionRing, SubmitError, SubmitFailure, Submitter};
pub use socket::{create_listener, prepare_upgraded, UpgradedSocket};
