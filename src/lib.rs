//! A thread-per-core I/O and actor dispatch engine.
//!
//! Each [`EventLoop`](event_loop::EventLoop) is a single-threaded cooperative
//! scheduler pinned to a CPU, driving non-blocking socket and file I/O
//! through a pluggable [`Reactor`](reactor::Reactor) backend. [`TpcEngine`]
//! owns a fixed set of loops; [`PartitionActorRef`](actor::PartitionActorRef)
//! routes a request to the loop or remote socket that owns its partition.

pub mod actor;
pub mod buffer;
pub mod config;
pub mod engine;
pub mod event_loop;
pub mod fs;
pub mod frame;
pub mod reactor;
pub mod socket;
pub mod sync;
pub mod timer;

#[doc(hidden)]
pub mod testing;

#[cfg(test)]
mod utils;

pub use config::Config;
pub use engine::TpcEngine;
pub use event_loop::{EventLoop, LoopHandle, LoopState};

/// Error kinds exposed across the engine's public API (original §7).
#[derive(thiserror::Error, Debug)]
pub enum Error {
    /// OS-level failure on a file descriptor; the owning socket or file is closed.
    #[error("io error: {0}")]
    Io(#[source] std::io::Error),

    /// The partition owner is unknown, or changed mid-flight.
    #[error("routing error for partition {partition_id}: {reason}")]
    Routing {
        partition_id: u64,
        reason: &'static str,
    },

    /// The remote socket correlated with an in-flight request closed.
    #[error("connection lost while awaiting response")]
    ConnectionLost,

    /// A [`RequestFuture`](actor::RequestFuture) exceeded its configured deadline.
    #[error("request timed out")]
    Timeout,

    /// The loop or engine is shutting down and rejects new work.
    #[error("event loop is shutting down")]
    Shutdown,

    /// A decoded frame header violated the wire format (original §6).
    #[error("protocol error: {0}")]
    Protocol(&'static str),
}

impl From<std::io::Error> for Error {
    fn from(error: std::io::Error) -> Self {
        Error::Io(error)
    }
}

/// Result alias used throughout the engine's public surface.
pub type Result<T> = std::result::Result<T, Error>;
