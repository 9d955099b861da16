//! wsring: a WebSocket server that reads upgraded connections with epoll
//! readiness and io_uring reads.
//!
//! The binary is in main.rs; the library exposes the pieces for tests and
//! benchmarks.

#[cfg(not(target_os = "linux"))]
compile_error!("wsring requires Linux (epoll and io_uring)");

pub mod acceptor;
pub mod config;
pub mod error;
pub mod netio;
pub mod runtime;
pub mod telemetry;
pub mod upgrade;
pub mod worker;
