//! Partition-affine request dispatch (original §3 "Request / RequestFuture",
//! §4.3 `PartitionActorRef`).
//!
//! `Requests`, the call-id correlation table, lives on the `EventLoop` that
//! calls [`PartitionActorRef::submit`], the same way its `Allocator` does —
//! not because the original wording says so, but because an `Rc`-based
//! table can't itself cross the thread boundary between two loops. Routing
//! a request to a *different* local loop therefore never moves an `Rc`
//! across threads: it copies the frame's bytes into a plain `Vec<u8>`,
//! hands that to [`LoopHandle::execute`], and the destination reassembles
//! an `IoBuffer` from its own allocator via [`EventLoop::current`]. The
//! reply travels back the same way, through [`reply`].

use std::cell::{Cell, RefCell};
use std::collections::hash_map::DefaultHasher;
use std::collections::HashMap;
use std::future::Future;
use std::hash::{Hash, Hasher};
use std::pin::Pin;
use std::rc::Rc;
use std::task::{Context, Poll, Waker};
use std::time::Instant;

use tracing::trace;

use crate::buffer::IoBuffer;
use crate::event_loop::{EventLoop, LoopHandle};
use crate::frame::{self, FrameHeader, HEADER_LEN};
use crate::socket::{AsyncSocket, FrameHandler};
use crate::{Error, Result};

/// Deterministic partition-to-loop hash, stable for the engine's lifetime
/// (original §4.3 "actor-affinity invariant": the same partition always
/// maps to the same loop index).
pub fn loop_index_for(partition_id: u64, loop_count: usize) -> usize {
    (stable_hash(partition_id) as usize) % loop_count
}

fn stable_hash(value: u64) -> u64 {
    let mut hasher = DefaultHasher::new();
    value.hash(&mut hasher);
    hasher.finish()
}

/// Where a partition's work currently executes — answered by an external
/// collaborator, the [`PartitionDirectory`].
pub enum PartitionOwner {
    /// Owned by this process; routed to `hash(partitionId) mod loop_count`.
    Local,
    /// Owned by a remote peer, reachable over `connection`.
    Remote(Rc<RemoteConnection>),
}

/// Maps a partition id to its current owner (original §9 "partition
/// directory... an external collaborator, out of scope for this engine").
pub trait PartitionDirectory {
    fn partition_owner(&self, partition_id: u64) -> Option<PartitionOwner>;
}

/// A peer's socket array for remote delivery (original §4.3 "peer
/// connection"). A partition's socket is `hash(partitionId) mod
/// socket_count`, stable for the connection's lifetime.
pub struct RemoteConnection {
    sockets: Vec<Rc<AsyncSocket>>,
}

impl RemoteConnection {
    pub fn new(sockets: Vec<Rc<AsyncSocket>>) -> Self {
        RemoteConnection { sockets }
    }

    pub fn socket_count(&self) -> usize {
        self.sockets.len()
    }

    fn socket_for(&self, partition_id: u64) -> Option<&Rc<AsyncSocket>> {
        if self.sockets.is_empty() {
            return None;
        }
        let index = (stable_hash(partition_id) as usize) % self.sockets.len();
        self.sockets.get(index)
    }
}

/// Decodes reply frames on a remote connection's sockets and completes the
/// corresponding `Requests` slot on this loop. Install with
/// `socket.set_frame_handler(Rc::new(ReplyDispatcher))` on every socket
/// passed to [`RemoteConnection::new`]; the socket and the `Requests` table
/// it replies into must live on the same loop.
pub struct ReplyDispatcher;

impl FrameHandler for ReplyDispatcher {
    fn on_frame(self: Rc<Self>, _socket: &Rc<AsyncSocket>, header: FrameHeader, payload: &[u8]) {
        if header.is_one_way() {
            return;
        }
        EventLoop::current(|lp| {
            let buf = lp.allocator().allocate(payload.len());
            buf.clear();
            buf.write_bytes(payload);
            buf.flip();
            lp.requests().complete(header.call_id, buf);
        });
    }

    // A closed connection doesn't know which call ids it was carrying, so
    // it can't selectively fail just those — `Requests::expire` is the
    // fallback that reclaims a slot left stranded by a dead socket.
    fn on_close(self: Rc<Self>, _cause: Option<Error>) {}
}

struct SlotState {
    result: Option<Result<IoBuffer>>,
    waker: Option<Waker>,
}

/// Awaitable handle for one in-flight request (original §3 `RequestFuture`).
///
/// Modeled on [`crate::sync::oneshot_notify`]'s `Rc<RefCell<..>>` state
/// machine, generalized to carry a value instead of a bare signal — there's
/// no bundled executor here either; whatever polls this is the caller's own.
pub struct RequestFuture {
    state: Rc<RefCell<SlotState>>,
}

impl Future for RequestFuture {
    type Output = Result<IoBuffer>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let mut state = self.state.borrow_mut();
        if let Some(result) = state.result.take() {
            Poll::Ready(result)
        } else {
            state.waker = Some(cx.waker().clone());
            Poll::Pending
        }
    }
}

struct Slot {
    state: Rc<RefCell<SlotState>>,
    /// The extra reference a remotely-routed request's slot holds on its
    /// buffer until the slot is removed — released on completion, timeout,
    /// or connection loss, never by the caller directly (original §9 Open
    /// Question: who owns the buffer reference while a reply is pending).
    buffer: RefCell<Option<IoBuffer>>,
    deadline: Option<Instant>,
}

/// A bounded, per-client-loop mapping from call id to [`RequestFuture`]
/// (original §3 "Requests table"). Owned by the `EventLoop` that calls
/// [`PartitionActorRef::submit`], reached through [`EventLoop::requests`].
pub struct Requests {
    slots: RefCell<HashMap<i64, Slot>>,
    next_call_id: Cell<i64>,
}

impl Requests {
    pub fn new() -> Rc<Self> {
        Rc::new(Requests {
            slots: RefCell::new(HashMap::new()),
            next_call_id: Cell::new(0),
        })
    }

    fn allocate(&self, deadline: Option<Instant>) -> (i64, RequestFuture) {
        let call_id = self.next_call_id.get();
        self.next_call_id.set(call_id.wrapping_add(1) & i64::MAX);

        let state = Rc::new(RefCell::new(SlotState {
            result: None,
            waker: None,
        }));
        self.slots.borrow_mut().insert(
            call_id,
            Slot {
                state: Rc::clone(&state),
                buffer: RefCell::new(None),
                deadline,
            },
        );
        (call_id, RequestFuture { state })
    }

    /// Acquires and stores the extra buffer reference a remotely-routed
    /// request's slot holds until its reply or timeout.
    fn hold_buffer(&self, call_id: i64, buf: &IoBuffer) {
        if let Some(slot) = self.slots.borrow().get(&call_id) {
            *slot.buffer.borrow_mut() = Some(buf.acquire());
        }
    }

    pub fn len(&self) -> usize {
        self.slots.borrow().len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.borrow().is_empty()
    }

    /// Completes `call_id`'s future; a no-op if the slot already completed,
    /// expired, or was never allocated here (e.g. a stray reply).
    pub fn complete(&self, call_id: i64, response: IoBuffer) {
        self.finish(call_id, Ok(response));
    }

    pub fn fail_one(&self, call_id: i64, error: Error) {
        self.finish(call_id, Err(error));
    }

    fn finish(&self, call_id: i64, result: Result<IoBuffer>) {
        let Some(slot) = self.slots.borrow_mut().remove(&call_id) else {
            trace!(call_id, "reply for unknown or already-completed call id, dropped");
            return;
        };
        if let Some(buf) = slot.buffer.borrow_mut().take() {
            buf.release();
        }
        let waker = {
            let mut state = slot.state.borrow_mut();
            state.result = Some(result);
            state.waker.take()
        };
        if let Some(waker) = waker {
            waker.wake();
        }
    }

    /// Fails every outstanding slot; used when the owning loop shuts down.
    pub fn fail_all(&self, mut error_for: impl FnMut(i64) -> Error) {
        let call_ids: Vec<i64> = self.slots.borrow().keys().copied().collect();
        for call_id in call_ids {
            let error = error_for(call_id);
            self.finish(call_id, Err(error));
        }
    }

    /// Removes every slot whose deadline has passed, failing each with
    /// [`Error::Timeout`] (original §4.3 "future timeout removes the slot").
    pub fn expire(&self, now: Instant) {
        let expired: Vec<i64> = self
            .slots
            .borrow()
            .iter()
            .filter(|(_, slot)| slot.deadline.is_some_and(|d| d <= now))
            .map(|(id, _)| *id)
            .collect();
        for call_id in expired {
            self.finish(call_id, Err(Error::Timeout));
        }
    }
}

/// The local per-partition executor. The RPC application logic that
/// actually interprets a request's payload is an external collaborator
/// (original §1); this is only the interface point it plugs into (§6).
pub trait LocalDispatch {
    /// Handles one locally-routed request. `reply_to` is the client loop
    /// awaiting `call_id`'s [`RequestFuture`]; call [`reply`] on it once a
    /// response (or failure) is ready.
    fn dispatch_local(self: Rc<Self>, partition_id: u64, call_id: i64, request: IoBuffer, reply_to: LoopHandle);
}

/// Completes `call_id` on `reply_to`'s `Requests` table with `response`.
/// Safe to call from any thread — plain bytes and a `LoopHandle` cross, an
/// `Rc` never does.
pub fn reply(reply_to: LoopHandle, call_id: i64, response: std::result::Result<Vec<u8>, Error>) {
    let task = move || {
        EventLoop::current(|lp| match response {
            Ok(bytes) => {
                let buf = lp.allocator().allocate(bytes.len());
                buf.clear();
                buf.write_bytes(&bytes);
                buf.flip();
                lp.requests().complete(call_id, buf);
            }
            Err(error) => lp.requests().fail_one(call_id, error),
        });
    };

    if reply_to.is_owner_thread() {
        task();
    } else {
        let _ = reply_to.execute(task);
    }
}

/// Client-facing send primitive (original §4.3 `PartitionActorRef`).
///
/// Bound to one loop, the same way a socket is: constructed and
/// [`PartitionActorRef::submit`] only ever called from the owning thread,
/// since it reaches its `Requests` table through [`EventLoop::current`].
pub struct PartitionActorRef<D> {
    directory: Rc<D>,
    eventloops: Vec<LoopHandle>,
    home: LoopHandle,
    request_timeout: Option<std::time::Duration>,
}

impl<D: PartitionDirectory> PartitionActorRef<D> {
    pub fn new(
        directory: Rc<D>,
        eventloops: Vec<LoopHandle>,
        home: LoopHandle,
        request_timeout: Option<std::time::Duration>,
    ) -> Self {
        PartitionActorRef {
            directory,
            eventloops,
            home,
            request_timeout,
        }
    }

    /// Allocates a correlation id, builds the wire frame via `write_payload`,
    /// and routes it to whichever loop or remote socket owns `partition_id`
    /// (original §4.3 algorithm steps 1-4). Must be called on `home`'s
    /// thread.
    pub fn submit(&self, partition_id: u64, write_payload: impl FnOnce(&IoBuffer)) -> RequestFuture {
        debug_assert!(self.home.is_owner_thread(), "submit() off the owning loop thread");

        let deadline = self.request_timeout.map(|d| Instant::now() + d);
        let (call_id, future) = EventLoop::current(|lp| {
            let (call_id, future) = lp.requests().allocate(deadline);
            if let Some(deadline) = deadline {
                let requests = Rc::clone(lp.requests());
                lp.schedule(deadline, move || requests.expire(Instant::now()));
            }
            (call_id, future)
        });

        let buf = EventLoop::current(|lp| lp.allocator().allocate(HEADER_LEN + 64));
        frame::begin_frame(&buf, call_id);
        write_payload(&buf);
        frame::construct_complete(&buf);
        buf.flip();

        match self.directory.partition_owner(partition_id) {
            None => {
                EventLoop::current(|lp| {
                    lp.requests().fail_one(
                        call_id,
                        Error::Routing {
                            partition_id,
                            reason: "owner unknown",
                        },
                    )
                });
                buf.release();
            }
            Some(PartitionOwner::Local) => self.submit_local(partition_id, call_id, buf),
            Some(PartitionOwner::Remote(connection)) => self.submit_remote(partition_id, call_id, &connection, buf),
        }

        future
    }

    fn submit_local(&self, partition_id: u64, call_id: i64, buf: IoBuffer) {
        let loop_index = loop_index_for(partition_id, self.eventloops.len());
        let target = self.eventloops[loop_index].clone();

        if target.is_owner_thread() {
            let dispatch = EventLoop::current(|lp| lp.local_dispatch());
            match dispatch {
                Some(dispatch) => dispatch.dispatch_local(partition_id, call_id, buf, self.home.clone()),
                None => {
                    buf.release();
                    reply(self.home.clone(), call_id, Err(Error::Shutdown));
                }
            }
            return;
        }

        let payload = buf.with_data(|data| data.to_vec());
        buf.release();
        let reply_to = self.home.clone();

        let result = target.execute(move || {
            EventLoop::current(|lp| {
                let fresh = lp.allocator().allocate(payload.len());
                fresh.clear();
                fresh.write_bytes(&payload);
                fresh.flip();
                match lp.local_dispatch() {
                    Some(dispatch) => dispatch.dispatch_local(partition_id, call_id, fresh, reply_to.clone()),
                    None => {
                        fresh.release();
                        reply(reply_to.clone(), call_id, Err(Error::Shutdown));
                    }
                }
            });
        });

        if result.is_err() {
            reply(self.home.clone(), call_id, Err(Error::Shutdown));
        }
    }

    fn submit_remote(&self, partition_id: u64, call_id: i64, connection: &RemoteConnection, buf: IoBuffer) {
        let Some(socket) = connection.socket_for(partition_id) else {
            buf.release();
            EventLoop::current(|lp| {
                lp.requests().fail_one(
                    call_id,
                    Error::Routing {
                        partition_id,
                        reason: "no socket on connection",
                    },
                )
            });
            return;
        };

        EventLoop::current(|lp| lp.requests().hold_buffer(call_id, &buf));
        if !socket.write_and_flush(buf.acquire()) {
            trace!(partition_id, call_id, "remote write backpressured, still queued");
        }
        buf.release();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::engine::TpcEngine;
    use crate::utils::poll;
    use std::time::Duration;

    struct SingleLoopDirectory;
    impl PartitionDirectory for SingleLoopDirectory {
        fn partition_owner(&self, _partition_id: u64) -> Option<PartitionOwner> {
            Some(PartitionOwner::Local)
        }
    }

    struct UnknownDirectory;
    impl PartitionDirectory for UnknownDirectory {
        fn partition_owner(&self, _partition_id: u64) -> Option<PartitionOwner> {
            None
        }
    }

    struct Echo;
    impl LocalDispatch for Echo {
        fn dispatch_local(self: Rc<Self>, _partition_id: u64, call_id: i64, request: IoBuffer, reply_to: LoopHandle) {
            let payload = request.with_data(|d| d[HEADER_LEN..].to_vec());
            request.release();
            reply(reply_to, call_id, Ok(payload));
        }
    }

    #[test]
    fn local_submit_on_the_single_owning_loop_completes_inline() {
        let config = Config {
            loop_count: 1,
            ..Config::default()
        };
        let engine = TpcEngine::start_default(config).unwrap();
        let handle = engine.eventloop(0).clone();

        let (tx, rx) = std::sync::mpsc::channel();
        handle
            .execute(move || {
                EventLoop::current(|lp| lp.set_local_dispatch(Echo));
                let loop_handle = EventLoop::current(|lp| lp.handle().clone());
                let actor_ref = PartitionActorRef::new(
                    Rc::new(SingleLoopDirectory),
                    vec![loop_handle.clone()],
                    loop_handle,
                    Some(Duration::from_secs(5)),
                );

                let mut future = actor_ref.submit(42, |buf| buf.write_bytes(b"ping"));
                let result = match poll(&mut future) {
                    Poll::Ready(r) => r,
                    Poll::Pending => panic!("same-loop dispatch should complete inline"),
                };
                let buf = result.unwrap();
                let payload = buf.with_data(|d| d.to_vec());
                buf.release();
                tx.send(payload).unwrap();
            })
            .unwrap();

        let payload = rx.recv_timeout(Duration::from_secs(5)).unwrap();
        assert_eq!(payload, b"ping");

        engine.shutdown();
        engine.await_termination(Duration::from_secs(5));
    }

    #[test]
    fn unknown_partition_owner_fails_the_future_with_a_routing_error() {
        let config = Config {
            loop_count: 1,
            ..Config::default()
        };
        let engine = TpcEngine::start_default(config).unwrap();
        let handle = engine.eventloop(0).clone();

        let (tx, rx) = std::sync::mpsc::channel();
        handle
            .execute(move || {
                let loop_handle = EventLoop::current(|lp| lp.handle().clone());
                let actor_ref = PartitionActorRef::new(
                    Rc::new(UnknownDirectory),
                    vec![loop_handle.clone()],
                    loop_handle,
                    None,
                );

                let mut future = actor_ref.submit(7, |buf| buf.write_bytes(b"x"));
                let result = match poll(&mut future) {
                    Poll::Ready(r) => r,
                    Poll::Pending => panic!("routing failure should resolve synchronously"),
                };
                tx.send(matches!(result, Err(Error::Routing { .. }))).unwrap();
            })
            .unwrap();

        assert!(rx.recv_timeout(Duration::from_secs(5)).unwrap());

        engine.shutdown();
        engine.await_termination(Duration::from_secs(5));
    }
}
