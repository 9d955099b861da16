//! Bounded pool of fixed-size read buffers.
//!
//! The pool is a bounded crossbeam channel pre-filled with `capacity`
//! buffers. It keeps both ends of the channel, so `acquire` never sees a
//! disconnect and simply blocks while every buffer is checked out. That
//! blocking is the only admission control in front of the completion ring:
//! the number of reads in flight can never exceed the pool capacity.
//!
//! Every buffer is owned by exactly one of the pool, an in-flight read, or
//! the decoder. `release` truncates the buffer before it goes back, so no
//! data from one read is visible to the next.

use crate::netio::config::BufferPoolConfig;
use crossbeam_channel::{bounded, Receiver, RecvTimeoutError, Sender, TrySendError};
use std::time::Duration;

/// A fixed-size byte region plus the length of valid data in it.
#[derive(Debug)]
pub struct Buffer {
    data: Box<[u8]>,
    len: usize,
}

impl Buffer {
    fn with_size(size: usize) -> Self {
        Self {
            data: vec![0u8; size].into_boxed_slice(),
            len: 0,
        }
    }

    /// Bytes written by the last read.
    #[inline]
    pub fn len(&self) -> usize {
        self.len
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Fixed size of the underlying region.
    #[inline]
    pub fn capacity(&self) -> usize {
        self.data.len()
    }

    /// The valid bytes.
    #[inline]
    pub fn as_slice(&self) -> &[u8] {
        &self.data[..self.len]
    }

    /// The whole region, for handing to the kernel as a read target.
    #[inline]
    pub fn as_mut_slice_for_io(&mut self) -> &mut [u8] {
        &mut self.data
    }

    /// Record how many bytes the kernel wrote.
    ///
    /// Clamped to the capacity.
    #[inline]
    pub fn set_len(&mut self, len: usize) {
        debug_assert!(len <= self.data.len());
        self.len = len.min(self.data.len());
    }

    #[inline]
    pub fn clear(&mut self) {
        self.len = 0;
    }
}

/// Shared, bounded buffer pool.
///
/// `available() + checked_out() == capacity()` holds at every quiescent
/// point.
pub struct BufferPool {
    tx: Sender<Buffer>,
    rx: Receiver<Buffer>,
    capacity: usize,
    buffer_size: usize,
}

impl BufferPool {
    /// Pre-allocate `capacity` buffers of `buffer_size` bytes each.
    pub fn new(capacity: usize, buffer_size: usize) -> Self {
        let (tx, rx) = bounded(capacity);
        for _ in 0..capacity {
            // Cannot fail: the channel has room for exactly `capacity` items.
            let _ = tx.try_send(Buffer::with_size(buffer_size));
        }
        tracing::debug!(capacity, buffer_size, "buffer pool allocated");
        Self {
            tx,
            rx,
            capacity,
            buffer_size,
        }
    }

    pub fn from_config(config: &BufferPoolConfig) -> Self {
        Self::new(config.capacity, config.buffer_size)
    }

    /// Take a buffer, waiting while the pool is empty.
    pub fn acquire(&self) -> Buffer {
        match self.rx.recv() {
            Ok(buffer) => buffer,
            // The pool owns a sender for its whole lifetime.
            Err(_) => unreachable!("buffer pool channel disconnected"),
        }
    }

    /// Take a buffer if one is available right now.
    pub fn try_acquire(&self) -> Option<Buffer> {
        self.rx.try_recv().ok()
    }

    /// Take a buffer, waiting at most `timeout`.
    pub fn acquire_timeout(&self, timeout: Duration) -> Option<Buffer> {
        match self.rx.recv_timeout(timeout) {
            Ok(buffer) => Some(buffer),
            Err(RecvTimeoutError::Timeout) | Err(RecvTimeoutError::Disconnected) => None,
        }
    }

    /// Truncate `buffer` and return it to the pool.
    ///
    /// Never blocks. A buffer that does not belong to this pool (wrong size,
    /// or one too many) is dropped.
    pub fn release(&self, mut buffer: Buffer) {
        debug_assert_eq!(buffer.capacity(), self.buffer_size);
        buffer.clear();
        if buffer.capacity() != self.buffer_size {
            tracing::warn!(
                size = buffer.capacity(),
                expected = self.buffer_size,
                "dropping foreign buffer"
            );
            return;
        }
        if let Err(TrySendError::Full(_)) = self.tx.try_send(buffer) {
            tracing::warn!(capacity = self.capacity, "pool already full, dropping buffer");
        }
    }

    /// Buffers currently in the pool.
    pub fn available(&self) -> usize {
        self.rx.len()
    }

    /// Buffers currently held by reads or the decoder.
    pub fn checked_out(&self) -> usize {
        self.capacity.saturating_sub(self.available())
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn buffer_size(&self) -> usize {
        self.buffer_size
    }
}

impl std::fmt::Debug for BufferPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BufferPool")
            .field("capacity", &self.capacity)
            .field("buffer_size", &self.buffer_size)
            .field("available", &self.available())
            .finish()
    }
}
