//! Single-threaded synchronization primitives shared by actor request
//! correlation (see [`crate::actor`]).

pub mod oneshot_notify;
