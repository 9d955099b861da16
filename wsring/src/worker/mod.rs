//! Event loop threads.
//!
//! One [`EventLoop`] serves every upgraded connection with three native
//! threads:
//!
//! - **wsring-poll**: waits on epoll and submits one read per ready handle
//! - **wsring-reaper**: reaps io_uring completions (owned by
//!   [`CompletionRing`])
//! - **wsring-drain**: decodes completed reads and re-arms connections
//!
//! With `readiness_mode = "ring"` the poll thread is not started; the drain
//! thread submits each connection's next read itself.
//!
//! The tokio runtime only runs the upgrade acceptor; it never touches a
//! connection after [`EventLoop::register`].

pub mod connection;
pub mod event_loop;

#[cfg(test)]
pub(crate) mod testing;


pub use connection::{ConnState, Connection, ConnectionId, Registry};
pub use event_loop::{EventLoop, LogHandler, LoopSettings, MessageHandler};

use crate::config::ServerConfig;
use crate::netio::{BufferPool, CompletionRing, Epoll, ReadinessMode};
use anyhow::{Context, Result};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;
use tracing::{debug, error, info};
use wsring_proto::Decoder;

/// The event loop over the kernel facilities.
pub type IoEventLoop = EventLoop<Epoll, Arc<CompletionRing>>;

impl LoopSettings {
    pub fn from_config(config: &ServerConfig) -> Self {
        Self {
            carry_partial: config.decoder.carry_partial,
            max_pending_bytes: config.decoder.max_pending_bytes,
            log_threshold: config.logging.read_log_threshold,
            wait_timeout: Duration::from_millis(config.netio.wait_timeout_ms),
            ring_only: config.netio.readiness_mode == ReadinessMode::Ring,
            ..Self::default()
        }
    }
}

/// Running event loop threads.
///
/// Dropping the handle signals shutdown without waiting; call
/// [`EventLoopHandle::shutdown`] for an orderly stop.
pub struct EventLoopHandle {
    core: Arc<IoEventLoop>,
    ring: Arc<CompletionRing>,
    threads: Vec<(&'static str, JoinHandle<()>)>,
}

impl EventLoopHandle {
    pub fn core(&self) -> &Arc<IoEventLoop> {
        &self.core
    }

    /// Stop polling, drain outstanding completions and close every
    /// connection. Returns the number of connections closed.
    pub fn shutdown(mut self) -> usize {
        info!("shutting down event loop");
        self.core.begin_shutdown();

        // Poll first so no new reads are submitted, then the reaper, whose
        // exit closes the completion channel and ends the drain thread.
        let mut threads = std::mem::take(&mut self.threads);
        let mut join = |name: &str| {
            if let Some(pos) = threads.iter().position(|(n, _)| *n == name) {
                let (name, handle) = threads.remove(pos);
                if handle.join().is_err() {
                    error!(thread = name, "thread panicked");
                } else {
                    debug!(thread = name, "thread exited");
                }
            }
        };
        join("wsring-poll");
        self.ring.shutdown();
        join("wsring-reaper");
        join("wsring-drain");

        let closed = self.core.close_all();
        info!(closed, "event loop stopped");
        closed
    }
}

impl Drop for EventLoopHandle {
    fn drop(&mut self) {
        if !self.threads.is_empty() {
            debug!("EventLoopHandle dropped, signaling shutdown");
            self.core.begin_shutdown();
            self.ring.shutdown();
        }
    }
}

impl std::fmt::Debug for EventLoopHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventLoopHandle")
            .field("core", &self.core)
            .field("threads", &self.threads.len())
            .finish()
    }
}

/// Create the kernel facilities and start the event loop threads.
///
/// # Errors
///
/// Fails if epoll or io_uring cannot be created or a thread cannot be
/// spawned.
pub fn spawn(config: &ServerConfig, handler: Arc<dyn MessageHandler>) -> Result<EventLoopHandle> {
    let netio = &config.netio;
    info!(
        readiness_mode = %netio.readiness_mode,
        uring_entries = netio.uring_entries,
        read_deadline_ms = ?netio.read_deadline_ms,
        pool_capacity = netio.buffer_pool.capacity,
        buffer_size = netio.buffer_pool.buffer_size,
        "starting event loop"
    );

    let epoll = Epoll::new(netio.readiness_mode, netio.max_events)
        .context("failed to create epoll instance")?;
    let ring = Arc::new(
        CompletionRing::new(
            netio.uring_entries,
            netio.read_deadline_ms.map(Duration::from_millis),
        )
        .context("failed to create io_uring instance")?,
    );
    let pool = Arc::new(BufferPool::from_config(&netio.buffer_pool));

    let core = Arc::new(EventLoop::new(
        epoll,
        Arc::clone(&ring),
        pool,
        Decoder::new(config.decoder.decoder_config()),
        handler,
        LoopSettings::from_config(config),
    ));

    let (completions, reaper) = ring.start().context("failed to start completion reaper")?;
    let mut threads = vec![("wsring-reaper", reaper)];

    let drain_core = Arc::clone(&core);
    let drain = thread::Builder::new()
        .name("wsring-drain".to_string())
        .spawn(move || drain_core.run_drain_loop(completions));
    match drain {
        Ok(handle) => threads.push(("wsring-drain", handle)),
        Err(e) => {
            ring.shutdown();
            return Err(e).context("failed to spawn drain thread");
        }
    }

    if netio.readiness_mode != ReadinessMode::Ring {
        let poll_core = Arc::clone(&core);
        let poll = thread::Builder::new()
            .name("wsring-poll".to_string())
            .spawn(move || poll_core.run_poll_loop());
        match poll {
            Ok(handle) => threads.push(("wsring-poll", handle)),
            Err(e) => {
                ring.shutdown();
                return Err(e).context("failed to spawn poll thread");
            }
        }
    }

    info!("event loop started");
    Ok(EventLoopHandle {
        core,
        ring,
        threads,
    })
}
