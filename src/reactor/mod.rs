//! Pluggable OS reactor backends (original §4.1, §9).
//!
//! The event loop core is generic over a single [`Reactor`] trait with three
//! implementations selected at construction: [`uring::CompletionRingReactor`]
//! (io_uring), [`epoll::ReadinessReactor`] (Linux epoll), and
//! [`portable::PortableReactor`] (`mio::Poll`, any platform mio supports).
//!
//! To keep socket and file-I/O code identical across all three backends,
//! every backend speaks the same readiness vocabulary: `register`/
//! `reregister`/`deregister` a file descriptor for [`Interest`], and `poll`
//! delivers [`ReactorEvent::Readable`]/[`ReactorEvent::Writable`]. The
//! completion-ring backend gets there by registering fds with
//! `IORING_OP_POLL_ADD` and re-arming on every completion, rather than by
//! performing the read/write/accept itself through the ring — see
//! `DESIGN.md` for why that's the right trade for a single socket
//! implementation shared by all backends.

pub mod epoll;
pub mod portable;
pub mod uring;

use std::io;
use std::os::fd::RawFd;
use std::time::Duration;

/// Identifies a registered fd's dispatch entry (original §9 "per-fd dispatch table").
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Token(pub u64);

/// Readiness interest a caller registers for an fd.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Interest {
    Readable,
    Writable,
    ReadWritable,
}

impl Interest {
    pub fn is_readable(self) -> bool {
        matches!(self, Interest::Readable | Interest::ReadWritable)
    }

    pub fn is_writable(self) -> bool {
        matches!(self, Interest::Writable | Interest::ReadWritable)
    }
}

/// An event delivered by [`Reactor::poll`].
#[derive(Debug, Clone, Copy)]
pub enum ReactorEvent {
    Readable(Token),
    Writable(Token),
    /// The fd hit an unrecoverable error; the registration is implicitly dropped.
    Error(Token),
}

/// Common interface over the three reactor backends (original §9).
///
/// `register`/`deregister` must only be called from the owning loop's
/// thread; implementations are not required to be `Send`.
pub trait Reactor {
    /// Registers `fd` for `interest`, dispatched under `token` on readiness.
    fn register(&mut self, fd: RawFd, interest: Interest, token: Token) -> io::Result<()>;

    /// Changes the interest set for an already-registered `fd`.
    fn reregister(&mut self, fd: RawFd, interest: Interest, token: Token) -> io::Result<()>;

    /// Drops a registration. Idempotent: deregistering an unknown fd is not an error.
    fn deregister(&mut self, fd: RawFd) -> io::Result<()>;

    /// Submits any queued kernel operations without blocking (original §4.1 step 1/2).
    fn submit(&mut self) -> io::Result<()>;

    /// Waits up to `timeout` (`None` = forever) for at least one event, then
    /// appends ready events to `events`. A `Some(Duration::ZERO)` timeout
    /// polls without blocking.
    fn poll(&mut self, timeout: Option<Duration>, events: &mut Vec<ReactorEvent>) -> io::Result<()>;

    /// Submits a raw completion-ring operation, invoking `callback` with its
    /// result once a later [`Reactor::poll`] observes the completion
    /// (original §1 file I/O, restricted to the completion-ring backend —
    /// regular files have no readiness-based non-blocking mode on Linux).
    ///
    /// The default implementation invokes `callback` synchronously with an
    /// `Unsupported` error rather than dropping it silently, so a caller
    /// waiting on the resulting future observes a failure instead of a hang.
    fn submit_op(
        &mut self,
        _entry: io_uring::squeue::Entry,
        callback: Box<dyn FnOnce(io::Result<i32>)>,
    ) -> io::Result<()> {
        callback(Err(io::Error::new(
            io::ErrorKind::Unsupported,
            "file I/O requires the completion-ring reactor",
        )));
        Err(io::Error::new(
            io::ErrorKind::Unsupported,
            "file I/O requires the completion-ring reactor",
        ))
    }
}

/// Constructs the reactor requested by [`crate::config::ReactorKind`].
pub fn build(kind: crate::config::ReactorKind, config: &crate::config::Config) -> io::Result<Box<dyn Reactor>> {
    match kind {
        crate::config::ReactorKind::CompletionRing => {
            Ok(Box::new(uring::CompletionRingReactor::new(config)?))
        }
        crate::config::ReactorKind::Readiness => Ok(Box::new(epoll::ReadinessReactor::new()?)),
        crate::config::ReactorKind::Portable => Ok(Box::new(portable::PortableReactor::new()?)),
    }
}
