use serde::{Deserialize, Serialize};

/// Size of each pooled read buffer. One read never returns more than this.
pub const DEFAULT_BUFFER_SIZE: usize = 4096;

/// Number of pooled buffers, which is also the cap on concurrent reads.
pub const DEFAULT_POOL_CAPACITY: usize = 1000;

/// io_uring submission queue entries. Power of 2.
pub const DEFAULT_URING_ENTRIES: u32 = 4096;

/// Ready handles fetched per `epoll_wait`.
pub const DEFAULT_MAX_EVENTS: usize = 1024;

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct BufferPoolConfig {
    /// Buffers allocated up front. Acquire blocks once all are checked out.
    pub capacity: usize,
    /// Bytes per buffer.
    pub buffer_size: usize,
}

impl Default for BufferPoolConfig {
    fn default() -> Self {
        Self {
            capacity: DEFAULT_POOL_CAPACITY,
            buffer_size: DEFAULT_BUFFER_SIZE,
        }
    }
}

/// How connections are told apart as readable.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ReadinessMode {
    /// `EPOLLONESHOT`: a handle fires once and is re-armed after its read
    /// completes.
    #[default]
    Oneshot,
    /// `EPOLLET`: a handle fires on every new arrival. Re-arming re-reports
    /// data that arrived while a read was in flight.
    Edge,
    /// No epoll registration. Each connection always has one read queued on
    /// the ring; the next one is submitted when it completes.
    Ring,
}

impl std::fmt::Display for ReadinessMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ReadinessMode::Oneshot => write!(f, "oneshot"),
            ReadinessMode::Edge => write!(f, "edge"),
            ReadinessMode::Ring => write!(f, "ring"),
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct NetIoConfig {
    /// io_uring queue depth. Must be a power of 2.
    pub uring_entries: u32,

    /// Cancel a read that has not completed after this many milliseconds.
    /// The connection is then torn down. `None` lets reads wait forever.
    pub read_deadline_ms: Option<u64>,

    pub readiness_mode: ReadinessMode,

    /// Ready handles fetched per wait.
    pub max_events: usize,

    /// Upper bound on one readiness wait, so the poll thread notices
    /// shutdown.
    pub wait_timeout_ms: u64,

    /// Listen backlog for the upgrade acceptor.
    pub listen_backlog: i32,

    /// Optional kernel receive buffer size (SO_RCVBUF) for upgraded sockets.
    pub socket_recv_buffer_size: Option<usize>,

    pub buffer_pool: BufferPoolConfig,
}

impl Default for NetIoConfig {
    fn default() -> Self {
        Self {
            uring_entries: DEFAULT_URING_ENTRIES,
            read_deadline_ms: None,
            readiness_mode: ReadinessMode::Oneshot,
            max_events: DEFAULT_MAX_EVENTS,
            wait_timeout_ms: 100,
            listen_backlog: 1024,
            socket_recv_buffer_size: None,
            buffer_pool: BufferPoolConfig::default(),
        }
    }
}

impl NetIoConfig {
    pub fn validate(&self) -> Result<(), Vec<String>> {
        let mut errors = Vec::new();

        if self.uring_entries == 0 || !self.uring_entries.is_power_of_two() {
            errors.push(format!(
                "netio.uring_entries must be a non-zero power of 2, got {}",
                self.uring_entries
            ));
        } else if self.uring_entries > 32768 {
            errors.push(format!(
                "netio.uring_entries too large: {} (max 32768)",
                self.uring_entries
            ));
        }

        if self.read_deadline_ms == Some(0) {
            errors.push("netio.read_deadline_ms must be > 0 when set".to_string());
        }

        if self.max_events == 0 {
            errors.push("netio.max_events must be > 0".to_string());
        }

        if self.wait_timeout_ms == 0 {
            errors.push("netio.wait_timeout_ms must be > 0".to_string());
        }

        if self.listen_backlog <= 0 {
            errors.push(format!(
                "netio.listen_backlog must be > 0, got {}",
                self.listen_backlog
            ));
        }

        if self.buffer_pool.capacity == 0 {
            errors.push("netio.buffer_pool.capacity must be > 0".to_string());
        }

        if self.buffer_pool.buffer_size < 16 {
            errors.push(format!(
                "netio.buffer_pool.buffer_size too small: {} (min 16)",
                self.buffer_pool.buffer_size
            ));
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(errors)
        }
    }
}
