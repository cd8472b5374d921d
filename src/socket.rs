//! Connection-oriented byte duplex bound to exactly one loop, and the
//! listener that accepts into it (original §4.2).
//!
//! Grounded on the teacher's `net::tcp` (`std::net::TcpStream`/`TcpListener`
//! for address resolution and `bind`/`connect`, raw fd extraction, direct
//! `libc` read/write), generalized from a fiber-blocking call into a
//! readiness-driven [`IoHandler`]. A thread-confined `Rc`-based handler
//! can't itself be moved across threads to be "activated elsewhere", so
//! unlike the literal source wording, a socket is always constructed and
//! registered on the loop thread that will own it; reaching a socket from
//! another loop goes through [`crate::actor::PartitionActorRef`] or
//! [`crate::EventLoop::offer`], which move a plain closure instead of the
//! handler itself.

use std::cell::{Cell, RefCell};
use std::collections::VecDeque;
use std::io;
use std::net::{SocketAddr, TcpListener, TcpStream};
use std::os::fd::{FromRawFd, IntoRawFd, RawFd};
use std::rc::Rc;

use tracing::{debug, trace, warn};

use crate::buffer::IoBuffer;
use crate::event_loop::{EventLoop, IoHandler, LoopHandle};
use crate::frame::{self, FrameHeader};
use crate::reactor::{Interest, Token};
use crate::{Error, Result};

/// Receives decoded frames for one [`AsyncSocket`] (original §4.2 "read handler").
///
/// Set with [`AsyncSocket::set_frame_handler`] before [`AsyncSocket::activate`].
pub trait FrameHandler {
    /// Called once per complete frame decoded from the socket's receive
    /// buffer, in wire order. Never called concurrently with another
    /// callback on the same loop.
    fn on_frame(self: Rc<Self>, socket: &Rc<AsyncSocket>, header: FrameHeader, payload: &[u8]);

    /// Called exactly once when the socket closes, with the cause if it
    /// wasn't a local, intentional [`AsyncSocket::close`].
    fn on_close(self: Rc<Self>, _cause: Option<Error>) {}
}

/// Receives accepted connections for one [`AsyncServerSocket`].
pub trait AcceptHandler {
    fn on_accept(self: Rc<Self>, socket: Rc<AsyncSocket>);
}

fn set_nonblocking(fd: RawFd) -> io::Result<()> {
    let flags = unsafe { libc::fcntl(fd, libc::F_GETFL) };
    if flags < 0 {
        return Err(io::Error::last_os_error());
    }
    if unsafe { libc::fcntl(fd, libc::F_SETFL, flags | libc::O_NONBLOCK) } < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}

/// A connection-level state machine bound to exactly one loop (original §4.2).
///
/// All reads, writes, and callbacks happen on the owning loop's thread;
/// every method here debug-asserts that contract rather than silently
/// hopping threads.
pub struct AsyncSocket {
    fd: Cell<RawFd>,
    loop_handle: LoopHandle,
    token: Cell<Option<Token>>,
    handler: RefCell<Option<Rc<dyn FrameHandler>>>,
    outbound: RefCell<VecDeque<IoBuffer>>,
    outbound_bytes: Cell<usize>,
    recv_buf: RefCell<Vec<u8>>,
    recv_filled: Cell<usize>,
    closed: Cell<bool>,
    writable_armed: Cell<bool>,
    backpressure_bytes: usize,
    max_frame_size: usize,
}

impl AsyncSocket {
    /// Wraps an already-open, not-yet-registered fd; used by both
    /// [`AsyncSocket::connect`] and [`AsyncServerSocket`]'s accept loop.
    fn from_fd(fd: RawFd, loop_handle: LoopHandle, backpressure_bytes: usize, max_frame_size: usize) -> Rc<Self> {
        Rc::new(AsyncSocket {
            fd: Cell::new(fd),
            loop_handle,
            token: Cell::new(None),
            handler: RefCell::new(None),
            outbound: RefCell::new(VecDeque::new()),
            outbound_bytes: Cell::new(0),
            recv_buf: RefCell::new(vec![0u8; 64 * 1024]),
            recv_filled: Cell::new(0),
            closed: Cell::new(false),
            writable_armed: Cell::new(false),
            backpressure_bytes,
            max_frame_size,
        })
    }

    /// Synchronously connects (original `c.connect(addr) -> future`, realized
    /// here without a bundled executor — see crate docs). Must be called on
    /// the thread that owns `loop_handle`.
    pub fn connect(
        addr: SocketAddr,
        loop_handle: LoopHandle,
        backpressure_bytes: usize,
        max_frame_size: usize,
    ) -> Result<Rc<Self>> {
        let stream = TcpStream::connect(addr).map_err(Error::from)?;
        stream.set_nodelay(true).ok();
        let fd = stream.into_raw_fd();
        set_nonblocking(fd).map_err(Error::from)?;
        Ok(Self::from_fd(fd, loop_handle, backpressure_bytes, max_frame_size))
    }

    /// Sets `TCP_NODELAY`. Must be called before [`AsyncSocket::activate`].
    pub fn set_tcp_nodelay(&self, enabled: bool) -> io::Result<()> {
        let value: libc::c_int = enabled as libc::c_int;
        let result = unsafe {
            libc::setsockopt(
                self.fd.get(),
                libc::IPPROTO_TCP,
                libc::TCP_NODELAY,
                &value as *const _ as *const libc::c_void,
                std::mem::size_of::<libc::c_int>() as libc::socklen_t,
            )
        };
        if result < 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(())
    }

    /// Installs the frame handler. Must be set before [`AsyncSocket::activate`].
    pub fn set_frame_handler(&self, handler: Rc<dyn FrameHandler>) {
        *self.handler.borrow_mut() = Some(handler);
    }

    /// Registers the socket with its loop's reactor for readability. Only
    /// callable from the owning loop's thread (original "registration must
    /// be performed on the loop's thread").
    pub fn activate(self: &Rc<Self>) -> io::Result<()> {
        debug_assert!(self.loop_handle.is_owner_thread(), "activate() off the owning loop thread");
        let handler = Rc::clone(self) as Rc<dyn IoHandler>;
        let token = EventLoop::current(|lp| lp.register_io(self.fd.get(), Interest::Readable, handler))?;
        self.token.set(Some(token));
        trace!(fd = self.fd.get(), "socket activated");
        Ok(())
    }

    /// `true` once [`AsyncSocket::close`] has run; further writes no-op.
    pub fn is_closed(&self) -> bool {
        self.closed.get()
    }

    /// Appends `buf` to the outbound queue. Returns `false` if the socket is
    /// closed (the buffer is released immediately and not queued) or if the
    /// queue is now over its backpressure limit (the buffer is still queued;
    /// the caller must slow down, not retry the write).
    ///
    /// `buf` must already be [`construct_complete`](crate::frame::construct_complete)d
    /// and flipped into read mode (`position = 0`, `limit` = the frame's
    /// total length) — the same ready-to-send contract `PartitionActorRef`
    /// hands to local dispatch, so a buffer can go either way without a
    /// format change. `write` reuses `position`/`limit` as this socket's
    /// own per-buffer write progress.
    pub fn write(&self, buf: IoBuffer) -> bool {
        debug_assert!(self.loop_handle.is_owner_thread(), "write() off the owning loop thread");
        if self.closed.get() {
            buf.release();
            return false;
        }
        self.outbound_bytes.set(self.outbound_bytes.get() + buf.remaining());
        self.outbound.borrow_mut().push_back(buf);
        self.outbound_bytes.get() <= self.backpressure_bytes
    }

    /// Drains as much of the outbound queue as the socket will currently
    /// accept without blocking. Only callable from the owning thread.
    pub fn flush(self: &Rc<Self>) {
        debug_assert!(self.loop_handle.is_owner_thread(), "flush() off the owning loop thread");
        self.try_flush();
    }

    /// `write` followed by `flush` (original "convenience composition").
    pub fn write_and_flush(self: &Rc<Self>, buf: IoBuffer) -> bool {
        let accepted = self.write(buf);
        self.try_flush();
        accepted
    }

    /// Idempotent. Deregisters the fd, closes it, and releases every queued
    /// outbound buffer exactly once.
    pub fn close(self: &Rc<Self>) {
        if self.closed.replace(true) {
            return;
        }
        if let Some(token) = self.token.take() {
            EventLoop::current(|lp| {
                let _ = lp.deregister_io(self.fd.get(), token);
            });
        }
        unsafe { libc::close(self.fd.get()) };

        for buf in self.outbound.borrow_mut().drain(..) {
            buf.release();
        }
        self.outbound_bytes.set(0);

        if let Some(handler) = self.handler.borrow_mut().take() {
            handler.on_close(None);
        }
        debug!(fd = self.fd.get(), "socket closed");
    }

    fn fail(self: &Rc<Self>, cause: Error) {
        if self.closed.get() {
            return;
        }
        warn!(fd = self.fd.get(), error = %cause, "socket failing");
        self.closed.set(true);
        if let Some(token) = self.token.take() {
            EventLoop::current(|lp| {
                let _ = lp.deregister_io(self.fd.get(), token);
            });
        }
        unsafe { libc::close(self.fd.get()) };
        for buf in self.outbound.borrow_mut().drain(..) {
            buf.release();
        }
        self.outbound_bytes.set(0);
        if let Some(handler) = self.handler.borrow_mut().take() {
            handler.on_close(Some(cause));
        }
    }

    fn arm_writable(self: &Rc<Self>, want: bool) {
        if self.writable_armed.get() == want {
            return;
        }
        let Some(token) = self.token.get() else { return };
        let interest = if want { Interest::ReadWritable } else { Interest::Readable };
        let result = EventLoop::current(|lp| lp.reregister_io(self.fd.get(), interest, token));
        if let Err(e) = result {
            self.fail(Error::Io(e));
            return;
        }
        self.writable_armed.set(want);
    }

    /// One buffer written per syscall, matching the teacher's single-`Send`-
    /// per-call style rather than a gathered vectored write.
    fn try_flush(self: &Rc<Self>) {
        if self.closed.get() {
            return;
        }
        loop {
            let remaining = {
                let queue = self.outbound.borrow();
                queue.front().map(IoBuffer::remaining)
            };
            let Some(remaining) = remaining else {
                self.arm_writable(false);
                break;
            };
            if remaining == 0 {
                self.pop_front_written();
                continue;
            }

            let (ptr, len) = {
                let queue = self.outbound.borrow();
                queue.front().unwrap().with_data(|data| (data.as_ptr(), data.len()))
            };

            let n = unsafe { libc::write(self.fd.get(), ptr as *const libc::c_void, len) };
            if n < 0 {
                let err = io::Error::last_os_error();
                if err.kind() == io::ErrorKind::WouldBlock {
                    self.arm_writable(true);
                    break;
                }
                self.fail(Error::Io(err));
                return;
            }

            let n = n as usize;
            self.outbound_bytes.set(self.outbound_bytes.get().saturating_sub(n));
            {
                let queue = self.outbound.borrow();
                let buf = queue.front().unwrap();
                buf.set_position(buf.position() + n);
            }

            if n < len {
                self.arm_writable(true);
                break;
            }
        }
    }

    fn pop_front_written(&self) {
        if let Some(buf) = self.outbound.borrow_mut().pop_front() {
            buf.release();
        }
    }

    fn do_read(self: &Rc<Self>) {
        loop {
            let (n, len) = {
                let mut recv = self.recv_buf.borrow_mut();
                let filled = self.recv_filled.get();
                if filled == recv.len() {
                    let grow_to = recv.len() * 2;
                    recv.resize(grow_to, 0);
                }
                let slice = &mut recv[filled..];
                let len = slice.len();
                let n = unsafe { libc::read(self.fd.get(), slice.as_mut_ptr() as *mut libc::c_void, len) };
                (n, len)
            };

            if n < 0 {
                let err = io::Error::last_os_error();
                if err.kind() == io::ErrorKind::WouldBlock {
                    break;
                }
                self.fail(Error::Io(err));
                return;
            }
            if n == 0 {
                self.fail(Error::ConnectionLost);
                return;
            }

            self.recv_filled.set(self.recv_filled.get() + n as usize);
            self.decode_ready_frames();

            if (n as usize) < len {
                break; // short read: drained the socket for now
            }
        }
    }

    fn decode_ready_frames(self: &Rc<Self>) {
        loop {
            let filled = self.recv_filled.get();
            let decoded = {
                let recv = self.recv_buf.borrow();
                match frame::decode(&recv[..filled], self.max_frame_size) {
                    Ok(Some((header, payload, consumed))) => Some((header, payload.to_vec(), consumed)),
                    Ok(None) => None,
                    Err(e) => {
                        self.fail(e);
                        return;
                    }
                }
            };

            let Some((header, payload, consumed)) = decoded else {
                break;
            };

            if let Some(handler) = self.handler.borrow().clone() {
                handler.on_frame(self, header, &payload);
            }

            let mut recv = self.recv_buf.borrow_mut();
            recv.copy_within(consumed..filled, 0);
            drop(recv);
            self.recv_filled.set(filled - consumed);
        }
    }
}

impl IoHandler for AsyncSocket {
    fn on_readable(self: Rc<Self>) {
        self.do_read();
    }

    fn on_writable(self: Rc<Self>) {
        self.try_flush();
    }

    fn on_error(self: Rc<Self>, error: io::Error) {
        self.fail(Error::Io(error));
    }
}

/// Guarantees the fd is closed even if the caller never calls
/// [`AsyncSocket::close`] (original §8 "every registered fd is closed" on
/// shutdown). A socket is `!Send` (its handler is an `Rc`), so its last
/// reference — typically the loop's own `IoHandler` table — is always
/// dropped on the owning thread; unlike [`crate::fs::File`], that drop
/// commonly happens *after* the loop has already cleared its
/// thread-local "current loop" during shutdown, so this reaches straight
/// for `libc::close` rather than going through `EventLoop::current` to
/// deregister first.
impl Drop for AsyncSocket {
    fn drop(&mut self) {
        if self.closed.replace(true) {
            return;
        }
        unsafe { libc::close(self.fd.get()) };
        for buf in self.outbound.borrow_mut().drain(..) {
            buf.release();
        }
    }
}

/// Listens and accepts, activating each accepted connection onto its own
/// loop (original §4.2 `AsyncServerSocket`).
pub struct AsyncServerSocket {
    fd: Cell<RawFd>,
    loop_handle: LoopHandle,
    token: Cell<Option<Token>>,
    accept_handler: RefCell<Option<Rc<dyn AcceptHandler>>>,
    closed: Cell<bool>,
    backpressure_bytes: usize,
    max_frame_size: usize,
}

impl AsyncServerSocket {
    /// Binds and starts listening. Must be called on `loop_handle`'s own
    /// thread (original `open(loop) -> bind -> listen`, collapsed into one
    /// step for the same reason as [`AsyncSocket::activate`]).
    pub fn open(
        addr: SocketAddr,
        backlog: i32,
        loop_handle: LoopHandle,
        backpressure_bytes: usize,
        max_frame_size: usize,
    ) -> Result<Rc<Self>> {
        debug_assert!(loop_handle.is_owner_thread(), "AsyncServerSocket::open off the owning loop thread");
        let listener = TcpListener::bind(addr).map_err(Error::from)?;
        let fd = listener.into_raw_fd();
        set_nonblocking(fd).map_err(Error::from)?;
        if unsafe { libc::listen(fd, backlog) } < 0 {
            let err = io::Error::last_os_error();
            unsafe { libc::close(fd) };
            return Err(Error::from(err));
        }

        Ok(Rc::new(AsyncServerSocket {
            fd: Cell::new(fd),
            loop_handle,
            token: Cell::new(None),
            accept_handler: RefCell::new(None),
            closed: Cell::new(false),
            backpressure_bytes,
            max_frame_size,
        }))
    }

    /// Installs the accept handler and registers for readability.
    pub fn accept(self: &Rc<Self>, handler: Rc<dyn AcceptHandler>) -> io::Result<()> {
        *self.accept_handler.borrow_mut() = Some(handler);
        let io_handler = Rc::clone(self) as Rc<dyn IoHandler>;
        let token = EventLoop::current(|lp| lp.register_io(self.fd.get(), Interest::Readable, io_handler))?;
        self.token.set(Some(token));
        Ok(())
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        let listener = unsafe { std::net::TcpListener::from_raw_fd(self.fd.get()) };
        let addr = listener.local_addr();
        std::mem::forget(listener);
        addr
    }

    pub fn close(self: &Rc<Self>) {
        if self.closed.replace(true) {
            return;
        }
        if let Some(token) = self.token.take() {
            EventLoop::current(|lp| {
                let _ = lp.deregister_io(self.fd.get(), token);
            });
        }
        unsafe { libc::close(self.fd.get()) };
        debug!(fd = self.fd.get(), "server socket closed");
    }

    fn do_accept(self: &Rc<Self>) {
        loop {
            let mut storage: libc::sockaddr_storage = unsafe { std::mem::zeroed() };
            let mut len = std::mem::size_of_val(&storage) as libc::socklen_t;
            let fd = unsafe {
                libc::accept4(
                    self.fd.get(),
                    &mut storage as *mut _ as *mut libc::sockaddr,
                    &mut len,
                    libc::SOCK_NONBLOCK | libc::SOCK_CLOEXEC,
                )
            };
            if fd < 0 {
                let err = io::Error::last_os_error();
                if err.kind() != io::ErrorKind::WouldBlock {
                    warn!(error = %err, "accept failed");
                }
                break;
            }

            let socket = AsyncSocket::from_fd(fd, self.loop_handle.clone(), self.backpressure_bytes, self.max_frame_size);
            if let Some(handler) = self.accept_handler.borrow().clone() {
                handler.on_accept(socket);
            } else {
                socket.close();
            }
        }
    }
}

impl IoHandler for AsyncServerSocket {
    fn on_readable(self: Rc<Self>) {
        self.do_accept();
    }

    fn on_writable(self: Rc<Self>) {}

    fn on_error(self: Rc<Self>, error: io::Error) {
        warn!(fd = self.fd.get(), error = %error, "listener error");
        self.close();
    }
}

/// See [`AsyncSocket`]'s `Drop` impl: same `!Send` reasoning, same reason
/// to close directly rather than through `EventLoop::current`.
impl Drop for AsyncServerSocket {
    fn drop(&mut self) {
        if self.closed.replace(true) {
            return;
        }
        unsafe { libc::close(self.fd.get()) };
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::engine::TpcEngine;
    use crate::frame::{begin_frame, construct_complete};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use std::time::Duration;

    struct Echo;
    impl FrameHandler for Echo {
        fn on_frame(self: Rc<Self>, socket: &Rc<AsyncSocket>, header: FrameHeader, payload: &[u8]) {
            let reply = IoBuffer::with_capacity(crate::frame::HEADER_LEN + payload.len());
            begin_frame(&reply, header.call_id);
            reply.write_bytes(payload);
            construct_complete(&reply);
            reply.flip();
            socket.write_and_flush(reply);
        }
    }

    struct EchoAcceptor;
    impl AcceptHandler for EchoAcceptor {
        fn on_accept(self: Rc<Self>, socket: Rc<AsyncSocket>) {
            socket.set_frame_handler(Rc::new(Echo));
            socket.activate().unwrap();
        }
    }

    struct CountingHandler(Arc<AtomicUsize>);
    impl FrameHandler for CountingHandler {
        fn on_frame(self: Rc<Self>, _socket: &Rc<AsyncSocket>, _header: FrameHeader, _payload: &[u8]) {
            self.0.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[test]
    fn echoes_frames_back_to_the_client() {
        let config = Config {
            loop_count: 1,
            ..Config::default()
        };
        let engine = TpcEngine::start_default(config).unwrap();
        let handle = engine.eventloop(0).clone();
        let received = Arc::new(AtomicUsize::new(0));
        let received2 = Arc::clone(&received);

        let (tx, rx) = std::sync::mpsc::channel();
        handle
            .execute(move || {
                let server = AsyncServerSocket::open(
                    "127.0.0.1:0".parse().unwrap(),
                    128,
                    EventLoop::current(|lp| lp.handle().clone()),
                    4 * 1024 * 1024,
                    1 << 20,
                )
                .unwrap();
                let addr = server.local_addr().unwrap();
                server.accept(Rc::new(EchoAcceptor)).unwrap();
                // `server`'s own registration in the loop's handler table keeps
                // it alive; dropping this local binding just releases our extra ref.
                tx.send(addr).unwrap();
            })
            .unwrap();

        let addr = rx.recv_timeout(Duration::from_secs(5)).unwrap();

        handle
            .execute(move || {
                let loop_handle = EventLoop::current(|lp| lp.handle().clone());
                let client = AsyncSocket::connect(addr, loop_handle, 4 * 1024 * 1024, 1 << 20).unwrap();
                client.set_frame_handler(Rc::new(CountingHandler(received2)));
                client.activate().unwrap();

                let request = IoBuffer::with_capacity(32);
                begin_frame(&request, 7);
                request.write_bytes(b"ping");
                construct_complete(&request);
                request.flip();
                client.write_and_flush(request);
            })
            .unwrap();

        std::thread::sleep(Duration::from_millis(200));
        engine.shutdown();
        engine.await_termination(Duration::from_secs(5));

        assert_eq!(received.load(Ordering::SeqCst), 1);
    }
}
