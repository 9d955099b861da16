//! Connection state and the handle-keyed registry.
//!
//! # Connection lifecycle
//! 1. **Registered**: in the registry and armed in the multiplexer
//! 2. **ReadPending**: a read is in flight on the ring (at most one)
//! 3. **Completed**: the read finished and its bytes are being decoded
//! 4. back to **Registered** once re-armed, or **Closed** on any error
//!
//! In ring-only mode a completed connection goes straight back to
//! **ReadPending** with its next read.
//!
//! The OS reuses handle numbers, so each connection also gets a
//! process-unique [`ConnectionId`]. Completions carry the id they were
//! submitted with and are discarded when it no longer matches.

use crate::netio::UpgradedSocket;
use bytes::BytesMut;
use parking_lot::{Mutex, MutexGuard, RwLock};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::os::fd::RawFd;
use std::sync::atomic::{AtomicU64, AtomicU8, Ordering};
use std::sync::Arc;
use std::time::Instant;

pub type ConnectionId = u64;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ConnState {
    Registered = 0,
    ReadPending = 1,
    Completed = 2,
    Closed = 3,
}

impl ConnState {
    fn from_u8(v: u8) -> Self {
        match v {
            0 => ConnState::Registered,
            1 => ConnState::ReadPending,
            2 => ConnState::Completed,
            _ => ConnState::Closed,
        }
    }
}

/// One upgraded WebSocket connection.
pub struct Connection {
    id: ConnectionId,
    fd: RawFd,
    peer: Option<SocketAddr>,
    state: AtomicU8,
    /// Undecoded tail of the previous read.
    pending: Mutex<BytesMut>,
    opened_at: Instant,
    /// Closed when the last `Arc<Connection>` drops.
    socket: Box<dyn UpgradedSocket>,
}

impl Connection {
    fn new(id: ConnectionId, socket: Box<dyn UpgradedSocket>) -> Self {
        Self {
            id,
            fd: socket.raw_handle(),
            peer: socket.peer_addr(),
            state: AtomicU8::new(ConnState::Registered as u8),
            pending: Mutex::new(BytesMut::new()),
            opened_at: Instant::now(),
            socket,
        }
    }

    pub fn id(&self) -> ConnectionId {
        self.id
    }

    pub fn fd(&self) -> RawFd {
        self.fd
    }

    pub fn peer(&self) -> Option<SocketAddr> {
        self.peer
    }

    pub fn opened_at(&self) -> Instant {
        self.opened_at
    }

    pub fn socket(&self) -> &dyn UpgradedSocket {
        self.socket.as_ref()
    }

    pub fn state(&self) -> ConnState {
        ConnState::from_u8(self.state.load(Ordering::Acquire))
    }

    fn transition(&self, from: ConnState, to: ConnState) -> bool {
        self.state
            .compare_exchange(from as u8, to as u8, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    /// Registered -> ReadPending. False if a read is already in flight or
    /// the connection is closed.
    pub fn begin_read(&self) -> bool {
        self.transition(ConnState::Registered, ConnState::ReadPending)
    }

    /// ReadPending -> Registered, for a read that was never submitted.
    pub fn abort_read(&self) -> bool {
        self.transition(ConnState::ReadPending, ConnState::Registered)
    }

    /// ReadPending -> Completed.
    pub fn complete_read(&self) -> bool {
        self.transition(ConnState::ReadPending, ConnState::Completed)
    }

    /// Completed -> ReadPending, when the next read is submitted without
    /// waiting for readiness.
    pub fn resubmit_read(&self) -> bool {
        self.transition(ConnState::Completed, ConnState::ReadPending)
    }

    /// Completed -> Registered, once the handle is armed again.
    pub fn rearmed(&self) -> bool {
        self.transition(ConnState::Completed, ConnState::Registered)
    }

    /// Move to Closed from any state. Returns the previous state.
    pub fn mark_closed(&self) -> ConnState {
        ConnState::from_u8(self.state.swap(ConnState::Closed as u8, Ordering::AcqRel))
    }

    /// The carry-over buffer. Only the completion thread touches it.
    pub fn pending(&self) -> MutexGuard<'_, BytesMut> {
        self.pending.lock()
    }
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("id", &self.id)
            .field("fd", &self.fd)
            .field("peer", &self.peer)
            .field("state", &self.state())
            .finish()
    }
}

/// Handle -> connection map shared by the poll and completion threads.
#[derive(Default)]
pub struct Registry {
    connections: RwLock<HashMap<RawFd, Arc<Connection>>>,
    next_id: AtomicU64,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Take ownership of `socket` and index it by its handle.
    ///
    /// Fails, handing the socket back, if the handle is already registered.
    pub fn insert(
        &self,
        socket: Box<dyn UpgradedSocket>,
    ) -> Result<Arc<Connection>, Box<dyn UpgradedSocket>> {
        let fd = socket.raw_handle();
        let mut connections = self.connections.write();
        if connections.contains_key(&fd) {
            return Err(socket);
        }
        let id = self.next_id.fetch_add(1, Ordering::Relaxed) + 1;
        let conn = Arc::new(Connection::new(id, socket));
        connections.insert(fd, Arc::clone(&conn));
        Ok(conn)
    }

    pub fn get(&self, fd: RawFd) -> Option<Arc<Connection>> {
        self.connections.read().get(&fd).cloned()
    }

    /// Remove whatever is registered under `fd`. Idempotent.
    pub fn remove(&self, fd: RawFd) -> Option<Arc<Connection>> {
        self.connections.write().remove(&fd)
    }

    /// Remove the entry under `fd` only if it is still connection `id`.
    pub fn remove_if(&self, fd: RawFd, id: ConnectionId) -> Option<Arc<Connection>> {
        let mut connections = self.connections.write();
        match connections.get(&fd) {
            Some(conn) if conn.id() == id => connections.remove(&fd),
            _ => None,
        }
    }

    pub fn len(&self) -> usize {
        self.connections.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.connections.read().is_empty()
    }

    /// Snapshot of registered handles.
    pub fn handles(&self) -> Vec<RawFd> {
        self.connections.read().keys().copied().collect()
    }

    /// Remove every connection, closing their sockets once the caller drops
    /// the returned values.
    pub fn drain(&self) -> Vec<Arc<Connection>> {
        self.connections.write().drain().map(|(_, conn)| conn).collect()
    }
}

impl std::fmt::Debug for Registry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Registry")
            .field("connections", &self.len())
            .finish()
    }
}
