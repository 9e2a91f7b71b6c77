/// Size of one pool block in bytes.
pub const BLOCK_SIZE: usize = 4096;

/// Maximum iovec entries per vectored receive.
pub const RECV_IOVS: usize = 32;

/// Maximum iovec entries per vectored send.
pub const SEND_IOVS: usize = 32;

/// Upper bound on the bytes a single `writev` can cover.
pub const MAX_SEND: usize = BLOCK_SIZE * SEND_IOVS;

/// Default TCP listen backlog.
pub const LISTEN_BACKLOG: i32 = 128;

/// Configuration for one transport instance.
#[derive(Clone)]
pub struct Config {
    /// CPU to pin the loop thread to, and the value used for
    /// `SO_INCOMING_CPU` on listeners. None = no pinning.
    pub cpu: Option<usize>,
    /// TCP listen backlog.
    pub backlog: i32,
    /// Batch write-readiness completions through the loop's coalesce
    /// queue instead of resuming each sender individually.
    pub coalesce_writes: bool,
    /// Number of blocks in the per-loop buffer pool.
    pub pool_blocks: usize,
    /// Pipe flow control: a flush parks once this many bytes are
    /// buffered and unread.
    pub pause_threshold: usize,
    /// Pipe flow control: a parked flush resumes once buffered bytes
    /// drop to this level.
    pub resume_threshold: usize,
    /// Options applied to every listener this transport binds.
    pub listener: ListenerOptions,
    /// Multi-loop deployment shape, used by `TransportSet::launch`.
    pub worker: WorkerConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            cpu: None,
            backlog: LISTEN_BACKLOG,
            coalesce_writes: false,
            pool_blocks: 1024,
            pause_threshold: 64 * 1024,
            resume_threshold: 32 * 1024,
            listener: ListenerOptions::default(),
            worker: WorkerConfig::default(),
        }
    }
}

/// Socket options for listeners.
#[derive(Clone, Copy)]
pub struct ListenerOptions {
    /// Set `SO_REUSEPORT` so multiple loops can bind the same address
    /// and let the kernel balance accepts.
    pub reuse_port: bool,
    /// Set `TCP_DEFER_ACCEPT`; accepted sockets are then known to be
    /// readable and the first readability wait is skipped.
    pub defer_accept: bool,
    /// Set `IPV6_V6ONLY` on IPv6 listeners.
    pub ipv6_only: bool,
}

impl Default for ListenerOptions {
    fn default() -> Self {
        Self {
            reuse_port: false,
            defer_accept: false,
            ipv6_only: true,
        }
    }
}

/// Configuration for the thread-per-core deployment model.
#[derive(Clone, Copy)]
pub struct WorkerConfig {
    /// Number of transports to launch. 0 = number of CPUs.
    pub threads: usize,
    /// Whether to pin each loop thread to a core.
    pub pin_to_core: bool,
    /// Starting CPU index for pinning.
    pub core_offset: usize,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            threads: 0,
            pin_to_core: true,
            core_offset: 0,
        }
    }
}
