//! Completion ring over io_uring.
//!
//! Reads are pushed from the poll thread and reaped on a dedicated thread
//! that blocks in `io_uring_enter` and forwards every finished read as a
//! [`Completion`] on a crossbeam channel, in completion order.
//!
//! Each in-flight read is parked in a slab until its completion is reaped.
//! The slab owns the buffer the kernel is writing into, so the memory stays
//! valid for as long as the kernel may touch it. The slab lock also guards
//! the submission queue, which keeps the slot insert and the SQE push atomic
//! with respect to the reaper.

use crate::netio::buffer::Buffer;
use crossbeam_channel::{unbounded, Receiver, Sender};
use io_uring::{opcode, squeue, types, IoUring};
use parking_lot::Mutex;
use slab::Slab;
use std::io;
use std::os::fd::RawFd;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, error, trace, warn};

/// A finished operation, handed from the reaper to the event loop.
#[derive(Debug)]
pub struct Completion {
    pub fd: RawFd,
    /// Connection id captured at submission time.
    pub conn_id: u64,
    /// Bytes read, or the kernel error.
    pub result: io::Result<usize>,
    /// The buffer the read targeted; `len()` equals the byte count.
    pub buffer: Buffer,
}

#[derive(Debug, Error)]
pub enum SubmitFailure {
    #[error("submission queue is full")]
    QueueFull,
    #[error("invalid handle {0}")]
    InvalidHandle(RawFd),
    #[error("completion ring is shut down")]
    ShutDown,
    /// The read was queued but `io_uring_enter` failed. It stays in the
    /// submission queue and is sent by the next successful enter.
    #[error("io_uring_enter failed: {0}")]
    Enter(#[source] io::Error),
}

/// A rejected submission.
///
/// `buffer` is `Some` when nothing was queued and the buffer goes back to the
/// caller. It is `None` when the read is still queued in the ring, which keeps
/// the buffer until the read completes.
#[derive(Debug)]
pub struct SubmitError {
    pub buffer: Option<Buffer>,
    pub reason: SubmitFailure,
}

impl SubmitError {
    pub fn new(buffer: Buffer, reason: SubmitFailure) -> Self {
        Self {
            buffer: Some(buffer),
            reason,
        }
    }

    /// The read remains queued; its completion still arrives later.
    pub fn queued(reason: SubmitFailure) -> Self {
        Self {
            buffer: None,
            reason,
        }
    }

    pub fn is_queued(&self) -> bool {
        self.buffer.is_none()
    }
}

/// Asynchronous read submission.
pub trait Submitter: Send + Sync {
    /// Queue a read of up to `buffer.capacity()` bytes from `fd`. Returns
    /// without waiting for the read.
    fn submit_read(&self, fd: RawFd, conn_id: u64, buffer: Buffer) -> Result<(), SubmitError>;
}

impl<T: Submitter + ?Sized> Submitter for Arc<T> {
    fn submit_read(&self, fd: RawFd, conn_id: u64, buffer: Buffer) -> Result<(), SubmitError> {
        (**self).submit_read(fd, conn_id, buffer)
    }
}

/// user_data layout: op tag in the top byte, slab slot below.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum OpTag {
    Read(u64),
    Timeout(u64),
    Wake,
}

const SLOT_MASK: u64 = 0x00FF_FFFF_FFFF_FFFF;

impl OpTag {
    fn decode(val: u64) -> Option<Self> {
        let slot = val & SLOT_MASK;
        match (val >> 56) as u8 {
            0 => Some(OpTag::Read(slot)),
            1 => Some(OpTag::Timeout(slot)),
            2 => Some(OpTag::Wake),
            _ => None,
        }
    }
}

impl From<OpTag> for u64 {
    fn from(tag: OpTag) -> Self {
        match tag {
            OpTag::Read(slot) => slot & SLOT_MASK,
            OpTag::Timeout(slot) => (1u64 << 56) | (slot & SLOT_MASK),
            OpTag::Wake => 2u64 << 56,
        }
    }
}

/// State that must outlive the kernel's use of an in-flight read.
struct ReadOp {
    fd: RawFd,
    conn_id: u64,
    buffer: Buffer,
    /// Referenced by the linked timeout SQE.
    deadline: Option<Box<types::Timespec>>,
}

/// A shared io_uring instance with a single reaper.
pub struct CompletionRing {
    ring: IoUring,
    in_flight: Mutex<Slab<ReadOp>>,
    read_deadline: Option<Duration>,
    shutdown: AtomicBool,
    entries: u32,
}

impl CompletionRing {
    pub fn new(entries: u32, read_deadline: Option<Duration>) -> io::Result<Self> {
        let ring = IoUring::builder().build(entries)?;
        debug!(entries, ?read_deadline, "io_uring created");
        Ok(Self {
            ring,
            in_flight: Mutex::new(Slab::with_capacity(entries as usize)),
            read_deadline,
            shutdown: AtomicBool::new(false),
            entries,
        })
    }

    pub fn entries(&self) -> u32 {
        self.entries
    }

    /// Reads submitted and not yet reaped.
    pub fn in_flight(&self) -> usize {
        self.in_flight.lock().len()
    }

    /// Spawn the reaper thread. Completions arrive on the returned channel,
    /// which closes once the reaper exits after [`CompletionRing::shutdown`].
    pub fn start(self: &Arc<Self>) -> io::Result<(Receiver<Completion>, JoinHandle<()>)> {
        let (tx, rx) = unbounded();
        let ring = Arc::clone(self);
        let handle = thread::Builder::new()
            .name("wsring-reaper".to_string())
            .spawn(move || ring.reap(tx))?;
        Ok((rx, handle))
    }

    /// Stop accepting reads and wake the reaper so it exits.
    pub fn shutdown(&self) {
        if self.shutdown.swap(true, Ordering::AcqRel) {
            return;
        }
        let nop = opcode::Nop::new().build().user_data(OpTag::Wake.into());
        {
            let _guard = self.in_flight.lock();
            // SAFETY: the in_flight lock serialises every submission queue
            // user, and a NOP references no memory.
            let pushed = unsafe { self.ring.submission_shared().push(&nop).is_ok() };
            if !pushed {
                // The reaper is still woken by the pending reads it flushes.
                warn!("submission queue full, reaper wake deferred");
            }
        }
        if let Err(e) = self.ring.submitter().submit() {
            warn!(error = %e, "failed to submit reaper wake-up");
        }
    }

    fn reap(&self, tx: Sender<Completion>) {
        debug!("completion reaper started");
        let mut reaped: Vec<(u64, i32)> = Vec::with_capacity(64);

        loop {
            match self.ring.submitter().submit_and_wait(1) {
                Ok(_) => {}
                Err(ref e) if e.raw_os_error() == Some(libc::EINTR) => continue,
                // Completion queue overflow backpressure: drain and retry.
                Err(ref e) if e.raw_os_error() == Some(libc::EBUSY) => {}
                Err(e) => {
                    error!(error = %e, "io_uring_enter failed");
                    if self.shutdown.load(Ordering::Acquire) {
                        break;
                    }
                    thread::sleep(Duration::from_millis(10));
                    continue;
                }
            }

            reaped.clear();
            {
                // SAFETY: this thread is the only completion queue consumer.
                let cq = unsafe { self.ring.completion_shared() };
                reaped.extend(cq.map(|cqe| (cqe.user_data(), cqe.result())));
            }

            for &(user_data, result) in &reaped {
                match OpTag::decode(user_data) {
                    Some(OpTag::Read(slot)) => {
                        let op = self.in_flight.lock().try_remove(slot as usize);
                        let Some(op) = op else {
                            warn!(slot, "completion for unknown read slot");
                            continue;
                        };
                        let completion = finish_read(op, result);
                        if tx.send(completion).is_err() {
                            debug!("completion receiver dropped, reaper exiting");
                            return;
                        }
                    }
                    // ETIME when the deadline fired, ECANCELED or ENOENT when
                    // the read finished first.
                    Some(OpTag::Timeout(slot)) => trace!(slot, result, "link timeout reaped"),
                    Some(OpTag::Wake) => trace!("reaper woken"),
                    None => warn!(user_data, "completion with unknown tag"),
                }
            }

            if self.shutdown.load(Ordering::Acquire) {
                break;
            }
        }
        debug!(pending = self.in_flight(), "completion reaper stopped");
    }
}

fn finish_read(op: ReadOp, result: i32) -> Completion {
    let ReadOp {
        fd,
        conn_id,
        mut buffer,
        ..
    } = op;
    let result = if result < 0 {
        buffer.clear();
        Err(io::Error::from_raw_os_error(-result))
    } else {
        buffer.set_len(result as usize);
        Ok(buffer.len())
    };
    Completion {
        fd,
        conn_id,
        result,
        buffer,
    }
}

impl Submitter for CompletionRing {
    fn submit_read(&self, fd: RawFd, conn_id: u64, buffer: Buffer) -> Result<(), SubmitError> {
        if self.shutdown.load(Ordering::Acquire) {
            return Err(SubmitError::new(buffer, SubmitFailure::ShutDown));
        }
        if fd < 0 {
            return Err(SubmitError::new(buffer, SubmitFailure::InvalidHandle(fd)));
        }

        let deadline = self.read_deadline.map(|d| {
            Box::new(
                types::Timespec::new()
                    .sec(d.as_secs())
                    .nsec(d.subsec_nanos()),
            )
        });

        let mut in_flight = self.in_flight.lock();
        let slot = in_flight.insert(ReadOp {
            fd,
            conn_id,
            buffer,
            deadline,
        }) as u64;

        let op = &mut in_flight[slot as usize];
        let target = op.buffer.as_mut_slice_for_io();
        let read = opcode::Read::new(types::Fd(fd), target.as_mut_ptr(), target.len() as u32)
            .build()
            .user_data(OpTag::Read(slot).into());
        let timeout = op.deadline.as_deref().map(|ts| {
            opcode::LinkTimeout::new(ts as *const types::Timespec)
                .build()
                .user_data(OpTag::Timeout(slot).into())
        });

        // SAFETY: the buffer and timespec live in the slab until the read is
        // reaped, and the in_flight lock serialises submission queue access.
        let pushed = unsafe {
            let mut sq = self.ring.submission_shared();
            match timeout {
                Some(timeout) => {
                    if sq.capacity() - sq.len() < 2 {
                        false
                    } else {
                        sq.push(&read.flags(squeue::Flags::IO_LINK)).is_ok()
                            && sq.push(&timeout).is_ok()
                    }
                }
                None => sq.push(&read).is_ok(),
            }
        };

        if !pushed {
            let op = in_flight.remove(slot as usize);
            return Err(SubmitError::new(op.buffer, SubmitFailure::QueueFull));
        }
        drop(in_flight);

        loop {
            match self.ring.submitter().submit() {
                Ok(_) => return Ok(()),
                Err(ref e) if e.raw_os_error() == Some(libc::EINTR) => continue,
                // Completion queue overflow: the reaper is awake draining it
                // and its next enter sends the queued read.
                Err(ref e) if e.raw_os_error() == Some(libc::EBUSY) => return Ok(()),
                Err(e) => {
                    warn!(fd, conn_id, error = %e, "io_uring submit failed, read left queued");
                    return Err(SubmitError::queued(SubmitFailure::Enter(e)));
                }
            }
        }
    }
}

impl Drop for CompletionRing {
    fn drop(&mut self) {
        let pending = std::mem::take(self.in_flight.get_mut());
        if !pending.is_empty() {
            // The kernel may still write into these until the ring is torn
            // down, so their memory is never returned to the allocator.
            debug!(pending = pending.len(), "leaking buffers of unfinished reads");
            std::mem::forget(pending);
        }
    }
}

impl std::fmt::Debug for CompletionRing {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CompletionRing")
            .field("entries", &self.entries)
            .field("read_deadline", &self.read_deadline)
            .finish()
    }
}
