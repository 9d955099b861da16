//! The two-stage read loop.
//!
//! The poll thread waits on the readiness multiplexer and, for every ready
//! connection without a read in flight, takes a buffer from the pool and
//! submits a read to the ring. The drain thread receives completions, feeds
//! the bytes to the frame decoder, hands decoded messages to the
//! [`MessageHandler`], returns the buffer and re-arms the connection.
//!
//! In ring-only mode there is no poll stage: a connection's first read is
//! submitted at registration and every completion that leaves it open
//! submits the next read with the same buffer.
//!
//! Any per-connection failure removes exactly that connection from the
//! registry and the multiplexer. Facility failures are logged and the loop
//! keeps going.

use crate::error::CoreError;
use crate::netio::{
    Buffer, BufferPool, Completion, Readiness, SubmitError, Submitter, UpgradedSocket,
};
use crate::worker::connection::{ConnState, Connection, ConnectionId, Registry};
use crossbeam_channel::Receiver;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::io;
use std::os::fd::RawFd;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;
use tracing::{debug, error, info, trace, warn};
use wsring_proto::{CloseFrame, Decoder, FrameError, Message};

/// Receives every decoded message.
///
/// Called on the drain thread; a slow handler delays every connection.
pub trait MessageHandler: Send + Sync {
    fn on_message(&self, conn: &Connection, message: Message);
}

impl<F> MessageHandler for F
where
    F: Fn(&Connection, Message) + Send + Sync,
{
    fn on_message(&self, conn: &Connection, message: Message) {
        self(conn, message)
    }
}

/// Handler that only traces payloads.
#[derive(Debug, Default, Clone, Copy)]
pub struct LogHandler;

impl MessageHandler for LogHandler {
    fn on_message(&self, conn: &Connection, message: Message) {
        match message.as_text() {
            Some(text) => trace!(fd = conn.fd(), text, "text message"),
            None => trace!(fd = conn.fd(), len = message.payload.len(), "binary message"),
        }
    }
}

/// Loop tuning taken from configuration.
#[derive(Debug, Clone)]
pub struct LoopSettings {
    /// Keep an incomplete trailing frame for the next read.
    pub carry_partial: bool,
    /// Upper bound on a connection's carried bytes.
    pub max_pending_bytes: usize,
    /// Per-read events are logged at info below this many connections and
    /// at debug above it.
    pub log_threshold: usize,
    /// Longest single readiness wait.
    pub wait_timeout: Duration,
    /// How long the poll thread waits for a buffer before checking for
    /// shutdown.
    pub acquire_poll: Duration,
    /// Skip the multiplexer: submit the next read as soon as one completes.
    pub ring_only: bool,
}

impl Default for LoopSettings {
    fn default() -> Self {
        Self {
            carry_partial: true,
            max_pending_bytes: wsring_proto::decoder::DEFAULT_MAX_MESSAGE_SIZE
                + wsring_proto::MAX_HEADER_LEN,
            log_threshold: 100,
            wait_timeout: Duration::from_millis(100),
            acquire_poll: Duration::from_millis(50),
            ring_only: false,
        }
    }
}

/// What a successfully decoded read leaves behind.
#[derive(Debug)]
enum ReadOutcome {
    Open,
    Closed(CloseFrame),
}

/// Connection registry plus the facilities that serve it.
pub struct EventLoop<R, S> {
    readiness: R,
    ring: S,
    pool: Arc<BufferPool>,
    registry: Registry,
    decoder: Decoder,
    handler: Arc<dyn MessageHandler>,
    settings: LoopSettings,
    shutdown: AtomicBool,
    /// Evicted connections whose read is still queued in the ring. The
    /// socket stays open until that read completes.
    parked: Mutex<HashMap<ConnectionId, Arc<Connection>>>,
}

impl<R: Readiness, S: Submitter> EventLoop<R, S> {
    pub fn new(
        readiness: R,
        ring: S,
        pool: Arc<BufferPool>,
        decoder: Decoder,
        handler: Arc<dyn MessageHandler>,
        settings: LoopSettings,
    ) -> Self {
        Self {
            readiness,
            ring,
            pool,
            registry: Registry::new(),
            decoder,
            handler,
            settings,
            shutdown: AtomicBool::new(false),
            parked: Mutex::new(HashMap::new()),
        }
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    pub fn pool(&self) -> &BufferPool {
        &self.pool
    }

    pub fn settings(&self) -> &LoopSettings {
        &self.settings
    }

    /// Take ownership of an upgraded socket and start watching it.
    ///
    /// On failure nothing stays registered and the socket is closed.
    pub fn register(&self, socket: Box<dyn UpgradedSocket>) -> Result<ConnectionId, CoreError> {
        let fd = socket.raw_handle();
        let conn = self.registry.insert(socket).map_err(|_socket| CoreError::Registration {
            fd,
            source: io::Error::new(io::ErrorKind::AlreadyExists, "handle already registered"),
        })?;

        if self.settings.ring_only {
            self.start_ring_reads(&conn)?;
        } else if let Err(source) = self.readiness.add(fd) {
            self.registry.remove_if(fd, conn.id());
            conn.mark_closed();
            return Err(CoreError::Registration { fd, source });
        }

        debug!(
            fd,
            conn_id = conn.id(),
            peer = ?conn.peer(),
            connections = self.registry.len(),
            "connection registered"
        );
        Ok(conn.id())
    }

    /// Submit the first read of a ring-only connection.
    fn start_ring_reads(&self, conn: &Arc<Connection>) -> Result<(), CoreError> {
        let fd = conn.fd();
        let started = if !conn.begin_read() {
            Err(CoreError::Registration {
                fd,
                source: io::Error::new(io::ErrorKind::Other, "connection already reading"),
            })
        } else if let Some(buffer) = self.pool.try_acquire() {
            self.submit(conn, buffer)
        } else {
            Err(CoreError::Registration {
                fd,
                source: io::Error::new(io::ErrorKind::OutOfMemory, "buffer pool exhausted"),
            })
        };
        if started.is_err() {
            self.teardown(conn);
        }
        started
    }

    /// Close a connection explicitly. Returns false for an unknown handle.
    pub fn close(&self, fd: RawFd) -> bool {
        match self.registry.get(fd) {
            Some(conn) => {
                self.teardown(&conn);
                true
            }
            None => false,
        }
    }

    /// Close every connection.
    pub fn close_all(&self) -> usize {
        let connections = self.registry.drain();
        for conn in &connections {
            conn.mark_closed();
            if !self.settings.ring_only {
                if let Err(e) = self.readiness.remove(conn.fd()) {
                    debug!(fd = conn.fd(), error = %e, "deregistration failed during close");
                }
            }
            conn.socket().shutdown();
        }
        let parked: Vec<_> = self.parked.lock().drain().map(|(_, conn)| conn).collect();
        for conn in &parked {
            conn.socket().shutdown();
        }
        connections.len()
    }

    pub fn begin_shutdown(&self) {
        self.shutdown.store(true, Ordering::Release);
    }

    pub fn is_shutting_down(&self) -> bool {
        self.shutdown.load(Ordering::Acquire)
    }

    /// Submit one read per ready handle.
    pub fn handle_ready(&self, ready: &[RawFd]) {
        for &fd in ready {
            self.dispatch_read(fd);
        }
    }

    fn dispatch_read(&self, fd: RawFd) {
        let Some(conn) = self.registry.get(fd) else {
            trace!(fd, "readiness for unknown handle ignored");
            return;
        };
        if !conn.begin_read() {
            trace!(fd, state = ?conn.state(), "read already in flight");
            return;
        }

        let Some(buffer) = self.acquire_buffer() else {
            conn.abort_read();
            return;
        };

        if let Err(err) = self.submit(&conn, buffer) {
            self.evict(&conn, err);
        }
    }

    /// Hand a read to the ring. On failure the caller evicts `conn`.
    ///
    /// A read that stayed queued after a failed enter still owns its buffer
    /// and handle, so the connection is parked until that read completes.
    fn submit(&self, conn: &Arc<Connection>, buffer: Buffer) -> Result<(), CoreError> {
        let fd = conn.fd();
        match self.ring.submit_read(fd, conn.id(), buffer) {
            Ok(()) => Ok(()),
            Err(SubmitError {
                buffer: Some(buffer),
                reason,
            }) => {
                self.pool.release(buffer);
                Err(CoreError::Submission { fd, source: reason })
            }
            Err(SubmitError {
                buffer: None,
                reason,
            }) => {
                self.parked.lock().insert(conn.id(), Arc::clone(conn));
                Err(CoreError::Submission { fd, source: reason })
            }
        }
    }

    /// Blocks while the pool is empty, giving up only on shutdown.
    fn acquire_buffer(&self) -> Option<Buffer> {
        loop {
            if let Some(buffer) = self.pool.acquire_timeout(self.settings.acquire_poll) {
                return Some(buffer);
            }
            if self.is_shutting_down() {
                return None;
            }
            trace!(capacity = self.pool.capacity(), "buffer pool exhausted, waiting");
        }
    }

    /// Decode one finished read and release its buffer.
    pub fn handle_completion(&self, completion: Completion) {
        let Completion {
            fd,
            conn_id,
            result,
            mut buffer,
        } = completion;

        let parked = self.parked.lock().remove(&conn_id);
        if parked.is_some() {
            debug!(fd, conn_id, "queued read of evicted connection finished");
            self.pool.release(buffer);
            return;
        }

        let conn = match self.registry.get(fd) {
            Some(conn) if conn.id() == conn_id => conn,
            _ => {
                debug!(fd, conn_id, "discarding completion for closed connection");
                self.pool.release(buffer);
                return;
            }
        };
        if !conn.complete_read() {
            debug!(fd, state = ?conn.state(), "completion raced with close");
            self.pool.release(buffer);
            return;
        }

        let outcome = match result {
            Ok(0) => Err(CoreError::peer_closed(fd)),
            Ok(_) => self.consume(&conn, buffer.as_slice()),
            // Spurious wake-up on a non-blocking socket.
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => Ok(ReadOutcome::Open),
            Err(source) => Err(CoreError::ReadFailure { fd, source }),
        };

        match outcome {
            Ok(ReadOutcome::Open) if self.settings.ring_only => {
                buffer.clear();
                self.resubmit(&conn, buffer);
            }
            Ok(ReadOutcome::Open) => {
                self.pool.release(buffer);
                self.rearm(&conn);
            }
            Ok(ReadOutcome::Closed(frame)) => {
                self.pool.release(buffer);
                debug!(fd, code = ?frame.code, reason = %frame.reason, "peer sent close frame");
                self.teardown(&conn);
            }
            Err(err) => {
                self.pool.release(buffer);
                self.evict(&conn, err);
            }
        }
    }

    /// Ring-only: the connection's next read reuses the finished buffer.
    fn resubmit(&self, conn: &Arc<Connection>, buffer: Buffer) {
        if !conn.resubmit_read() {
            self.pool.release(buffer);
            return;
        }
        if self.is_shutting_down() {
            self.pool.release(buffer);
            self.teardown(conn);
            return;
        }
        if let Err(err) = self.submit(conn, buffer) {
            self.evict(conn, err);
        }
    }

    /// Decode `data` after any carried bytes. The carry-over lock is not
    /// held while the handler runs.
    fn consume(&self, conn: &Connection, data: &[u8]) -> Result<ReadOutcome, CoreError> {
        let fd = conn.fd();
        let carried = {
            let mut pending = conn.pending();
            if pending.is_empty() {
                None
            } else {
                pending.extend_from_slice(data);
                Some(pending.split().freeze())
            }
        };
        let input: &[u8] = carried.as_deref().unwrap_or(data);

        let mut messages = self.decoder.messages(input);
        let mut delivered = 0usize;
        for message in messages.by_ref() {
            let message = message.map_err(|source| CoreError::Frame { fd, source })?;
            self.log_message(conn, data.len(), &message);
            self.handler.on_message(conn, message);
            delivered += 1;
        }

        if let Some(close) = messages.close_frame() {
            return Ok(ReadOutcome::Closed(close.clone()));
        }

        let tail = messages.remaining();
        if !tail.is_empty() {
            if self.settings.carry_partial {
                if tail.len() > self.settings.max_pending_bytes {
                    return Err(CoreError::Frame {
                        fd,
                        source: FrameError::MessageTooLarge {
                            size: tail.len() as u64,
                            limit: self.settings.max_pending_bytes,
                        },
                    });
                }
                conn.pending().extend_from_slice(tail);
                trace!(fd, carried = tail.len(), "partial frame carried to next read");
            } else if delivered == 0 {
                return Err(CoreError::Frame {
                    fd,
                    source: FrameError::Incomplete,
                });
            } else {
                debug!(fd, dropped = tail.len(), "discarding trailing partial frame");
            }
        }
        Ok(ReadOutcome::Open)
    }

    fn log_message(&self, conn: &Connection, bytes: usize, message: &Message) {
        let connections = self.registry.len();
        if connections < self.settings.log_threshold {
            info!(
                fd = conn.fd(),
                peer = ?conn.peer(),
                bytes,
                opcode = %message.opcode,
                len = message.payload.len(),
                connections,
                "message received"
            );
        } else {
            debug!(
                fd = conn.fd(),
                bytes,
                opcode = %message.opcode,
                len = message.payload.len(),
                "message received"
            );
        }
    }

    fn rearm(&self, conn: &Arc<Connection>) {
        // Registered before the kernel can report the handle again.
        if !conn.rearmed() {
            return;
        }
        if let Err(source) = self.readiness.rearm(conn.fd()) {
            self.evict(
                conn,
                CoreError::Registration {
                    fd: conn.fd(),
                    source,
                },
            );
        }
    }

    fn evict(&self, conn: &Arc<Connection>, err: CoreError) {
        if err.is_peer_close() {
            debug!(fd = conn.fd(), conn_id = conn.id(), error = %err, "connection closed by peer");
        } else {
            warn!(
                fd = conn.fd(),
                conn_id = conn.id(),
                peer = ?conn.peer(),
                kind = err.kind(),
                error = %err,
                "dropping connection"
            );
        }
        self.teardown(conn);
    }

    /// Deregister before the socket can close, so a reused handle number
    /// never meets a stale registration.
    fn teardown(&self, conn: &Arc<Connection>) {
        let previous = conn.mark_closed();
        if previous == ConnState::Closed {
            return;
        }
        if !self.settings.ring_only {
            if let Err(e) = self.readiness.remove(conn.fd()) {
                warn!(fd = conn.fd(), error = %e, "epoll deregistration failed");
            }
        }
        self.registry.remove_if(conn.fd(), conn.id());
        if previous == ConnState::ReadPending {
            conn.socket().shutdown();
        }
        debug!(
            fd = conn.fd(),
            conn_id = conn.id(),
            connections = self.registry.len(),
            "connection removed"
        );
    }

    /// Readiness loop. Returns once shutdown has been requested.
    pub fn run_poll_loop(&self) {
        let mut ready = Vec::new();
        while !self.is_shutting_down() {
            ready.clear();
            if let Err(source) = self.readiness.wait(&mut ready, Some(self.settings.wait_timeout)) {
                let err = CoreError::Facility {
                    facility: "epoll_wait",
                    source,
                };
                error!(error = %err, "readiness wait failed");
                thread::sleep(Duration::from_millis(10));
                continue;
            }
            self.handle_ready(&ready);
        }
        debug!("poll loop stopped");
    }

    /// Completion loop. Returns once the ring closes its channel.
    pub fn run_drain_loop(&self, completions: Receiver<Completion>) {
        for completion in completions.iter() {
            self.handle_completion(completion);
        }
        debug!("drain loop stopped");
    }
}

impl<R, S> std::fmt::Debug for EventLoop<R, S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventLoop")
            .field("registry", &self.registry)
            .field("pool", &self.pool)
            .field("settings", &self.settings)
            .field("parked", &self.parked.lock().len())
            .finish()
    }
}
