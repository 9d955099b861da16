//! In-memory stand-ins for the readiness multiplexer, the ring and sockets.

use crate::netio::{
    Buffer, BufferPool, Completion, Readiness, SubmitError, SubmitFailure, Submitter,
    UpgradedSocket,
};
use crate::worker::{EventLoop, LoopSettings, MessageHandler};
use crate::worker::connection::Connection;
use parking_lot::Mutex;
use std::io;
use std::net::SocketAddr;
use std::os::fd::RawFd;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use wsring_proto::{Decoder, DecoderConfig, Message};

#[derive(Debug, Default)]
pub struct FakeReadiness {
    pub added: Mutex<Vec<RawFd>>,
    pub removed: Mutex<Vec<RawFd>>,
    pub rearmed: Mutex<Vec<RawFd>>,
    pub fail_add: AtomicBool,
    pub fail_rearm: AtomicBool,
}

impl FakeReadiness {
    pub fn is_added(&self, fd: RawFd) -> bool {
        self.added.lock().contains(&fd)
    }

    pub fn rearm_count(&self, fd: RawFd) -> usize {
        self.rearmed.lock().iter().filter(|&&f| f == fd).count()
    }
}

impl Readiness for FakeReadiness {
    fn add(&self, fd: RawFd) -> io::Result<()> {
        if self.fail_add.load(Ordering::SeqCst) {
            return Err(io::Error::from_raw_os_error(libc::ENOSPC));
        }
        self.added.lock().push(fd);
        Ok(())
    }

    fn remove(&self, fd: RawFd) -> io::Result<()> {
        self.removed.lock().push(fd);
        Ok(())
    }

    fn rearm(&self, fd: RawFd) -> io::Result<()> {
        if self.fail_rearm.load(Ordering::SeqCst) {
            return Err(io::Error::from_raw_os_error(libc::ENOENT));
        }
        self.rearmed.lock().push(fd);
        Ok(())
    }

    fn wait(&self, _ready: &mut Vec<RawFd>, timeout: Option<Duration>) -> io::Result<()> {
        std::thread::sleep(timeout.unwrap_or(Duration::from_millis(1)));
        Ok(())
    }
}

/// A read the fake ring accepted and has not completed yet.
#[derive(Debug)]
pub struct QueuedRead {
    pub fd: RawFd,
    pub conn_id: u64,
    pub buffer: Buffer,
}

#[derive(Debug, Default)]
pub struct FakeRing {
    pub queued: Mutex<Vec<QueuedRead>>,
    pub fail_submit: AtomicBool,
    /// Queue the read but report the enter as failed.
    pub fail_enter: AtomicBool,
}

impl FakeRing {
    pub fn queued_len(&self) -> usize {
        self.queued.lock().len()
    }

    /// Finish the queued read on `fd` with `data` as the bytes read.
    pub fn complete(&self, fd: RawFd, data: &[u8]) -> Completion {
        let QueuedRead {
            fd,
            conn_id,
            mut buffer,
        } = self.take(fd);
        buffer.as_mut_slice_for_io()[..data.len()].copy_from_slice(data);
        buffer.set_len(data.len());
        Completion {
            fd,
            conn_id,
            result: Ok(data.len()),
            buffer,
        }
    }

    /// Finish the queued read on `fd` with a kernel error.
    pub fn fail(&self, fd: RawFd, errno: i32) -> Completion {
        let QueuedRead { fd, conn_id, buffer } = self.take(fd);
        Completion {
            fd,
            conn_id,
            result: Err(io::Error::from_raw_os_error(errno)),
            buffer,
        }
    }

    fn take(&self, fd: RawFd) -> QueuedRead {
        let mut queued = self.queued.lock();
        let pos = queued
            .iter()
            .position(|r| r.fd == fd)
            .unwrap_or_else(|| panic!("no read queued for fd {fd}"));
        queued.remove(pos)
    }
}

impl Submitter for FakeRing {
    fn submit_read(&self, fd: RawFd, conn_id: u64, buffer: Buffer) -> Result<(), SubmitError> {
        if self.fail_submit.load(Ordering::SeqCst) {
            return Err(SubmitError::new(buffer, SubmitFailure::QueueFull));
        }
        self.queued.lock().push(QueuedRead {
            fd,
            conn_id,
            buffer,
        });
        if self.fail_enter.load(Ordering::SeqCst) {
            return Err(SubmitError::queued(SubmitFailure::Enter(
                io::Error::from_raw_os_error(libc::ENOMEM),
            )));
        }
        Ok(())
    }
}

/// Socket with an arbitrary handle number. Never touches the OS.
#[derive(Debug)]
pub struct FakeSocket {
    pub fd: RawFd,
    pub dropped: Arc<AtomicBool>,
    pub shutdowns: Arc<AtomicUsize>,
}

impl FakeSocket {
    pub fn new(fd: RawFd) -> Self {
        Self {
            fd,
            dropped: Arc::new(AtomicBool::new(false)),
            shutdowns: Arc::new(AtomicUsize::new(0)),
        }
    }
}

impl UpgradedSocket for FakeSocket {
    fn raw_handle(&self) -> RawFd {
        self.fd
    }

    fn peer_addr(&self) -> Option<SocketAddr> {
        Some(SocketAddr::from(([127, 0, 0, 1], 40000 + self.fd as u16)))
    }

    fn shutdown(&self) {
        self.shutdowns.fetch_add(1, Ordering::SeqCst);
    }
}

impl Drop for FakeSocket {
    fn drop(&mut self) {
        self.dropped.store(true, Ordering::SeqCst);
    }
}

/// Records every delivered message with the handle it came from.
#[derive(Debug, Default)]
pub struct Collector {
    pub messages: Mutex<Vec<(RawFd, Message)>>,
}

impl Collector {
    pub fn texts(&self) -> Vec<String> {
        self.messages
            .lock()
            .iter()
            .filter_map(|(_, m)| m.as_text().map(String::from))
            .collect()
    }
}

impl MessageHandler for Collector {
    fn on_message(&self, conn: &Connection, message: Message) {
        self.messages.lock().push((conn.fd(), message));
    }
}

pub type TestLoop = EventLoop<Arc<FakeReadiness>, Arc<FakeRing>>;

pub struct Harness {
    pub core: TestLoop,
    pub readiness: Arc<FakeReadiness>,
    pub ring: Arc<FakeRing>,
    pub pool: Arc<BufferPool>,
    pub collector: Arc<Collector>,
}

impl Harness {
    pub fn new(settings: LoopSettings) -> Self {
        Self::with_pool(settings, 4, 64)
    }

    pub fn with_pool(settings: LoopSettings, capacity: usize, buffer_size: usize) -> Self {
        let readiness = Arc::new(FakeReadiness::default());
        let ring = Arc::new(FakeRing::default());
        let pool = Arc::new(BufferPool::new(capacity, buffer_size));
        let collector = Arc::new(Collector::default());
        let core = EventLoop::new(
            Arc::clone(&readiness),
            Arc::clone(&ring),
            Arc::clone(&pool),
            Decoder::new(DecoderConfig::default()),
            Arc::clone(&collector) as Arc<dyn MessageHandler>,
            settings,
        );
        Self {
            core,
            readiness,
            ring,
            pool,
            collector,
        }
    }
}

/// A masked client frame.
pub fn client_frame(opcode: wsring_proto::OpCode, payload: &[u8]) -> Vec<u8> {
    let mut wire = bytes::BytesMut::new();
    wsring_proto::encode_frame(&mut wire, true, opcode, payload, Some([0x11, 0x22, 0x33, 0x44]));
    wire.to_vec()
}
