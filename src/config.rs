//! Construction-time options recognized by the engine (original §6).

use std::time::Duration;

/// Which [`Reactor`](crate::reactor::Reactor) backend an [`EventLoop`](crate::EventLoop) is built with.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReactorKind {
    /// io_uring-backed; readiness is delivered through the completion queue
    /// via `IORING_OP_POLL_ADD`, matching original §4.1's "completion-ring".
    CompletionRing,
    /// Linux epoll, registered edge-triggered.
    Readiness,
    /// Cross-platform selector (`mio::Poll`), used off Linux or on request.
    Portable,
}

impl ReactorKind {
    /// The backend used when none is requested: io_uring on Linux, the
    /// portable selector elsewhere.
    pub fn default_for_platform() -> Self {
        if cfg!(target_os = "linux") {
            ReactorKind::CompletionRing
        } else {
            ReactorKind::Portable
        }
    }
}

/// Per-engine configuration. Construct with [`Config::default`] and override
/// fields, mirroring the teacher's `Config { ..Default::default() }` idiom.
#[derive(Debug, Clone)]
pub struct Config {
    /// Number of event loops to construct; defaults to the physical core count.
    pub loop_count: usize,

    /// Reactor backend every loop is constructed with.
    pub reactor: ReactorKind,

    /// If true, loops never park in a blocking kernel wait; they busy-poll.
    pub spin: bool,

    /// CPU pinning for each loop's thread, by index. `None` disables pinning.
    pub core_ids: Option<Vec<core_affinity::CoreId>>,

    /// Submission queue entry count for the completion-ring backend.
    pub ringbuffer_size: u32,

    /// Number of in-flight syscalls above which a syscall is treated as
    /// asynchronous bookkeeping rather than opportunistically inlined.
    pub ioseq_async_threshold: u32,

    /// Raw `io_uring::IoUring::builder` setup flags for the completion-ring backend.
    pub ring_flags: u32,

    /// Capacity of the per-loop file I/O request scheduler (original §6 default: 512).
    pub io_request_scheduler_capacity: usize,

    /// Soft byte limit on a socket's outbound queue before `write` starts
    /// returning `false` (original §4.2 backpressure).
    pub outbound_backpressure_bytes: usize,

    /// Largest `frameSize` a socket's decoder accepts before failing the
    /// connection with [`crate::Error::Protocol`] (original §6, §7).
    pub max_frame_size: usize,

    /// Default deadline for a [`RequestFuture`](crate::actor::RequestFuture);
    /// `None` disables timeout-based slot reclamation.
    pub request_timeout: Option<Duration>,

    /// Initial per-buffer capacity handed out by a loop's [`Allocator`](crate::buffer::Allocator).
    pub buffer_capacity: usize,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            loop_count: std::thread::available_parallelism()
                .map(|n| n.get())
                .unwrap_or(1),
            reactor: ReactorKind::default_for_platform(),
            spin: false,
            core_ids: None,
            ringbuffer_size: 256,
            ioseq_async_threshold: 32,
            ring_flags: 0,
            io_request_scheduler_capacity: 512,
            outbound_backpressure_bytes: 4 * 1024 * 1024,
            max_frame_size: 16 * 1024 * 1024,
            request_timeout: Some(Duration::from_secs(30)),
            buffer_capacity: 64 * 1024,
        }
    }
}
