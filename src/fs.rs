//! Asynchronous file I/O over the completion-ring reactor (original §1,
//! mentioned only at its interface boundary; expanded per `SPEC_FULL.md`).
//!
//! Grounded on the teacher's `fs::File`/`OpenOptions` (`open`, `create`,
//! `sync_all`, `sync_data`, a `Drop` that submits `io_uring::opcode::Close`),
//! generalized from a hidden thread-local runtime singleton to submitting
//! through a loop's own [`Reactor`](crate::reactor::Reactor) via
//! [`EventLoop::submit_file_op`] — restricted to the completion-ring
//! backend, since regular files have no readiness-based non-blocking mode
//! on Linux. `ioRequestScheduler`'s capacity
//! ([`Config::io_request_scheduler_capacity`](crate::config::Config)) bounds
//! in-flight operations per loop; a saturated scheduler queues new
//! submissions rather than failing them.

use std::cell::{Cell, RefCell};
use std::collections::VecDeque;
use std::ffi::CString;
use std::future::Future;
use std::io;
use std::os::fd::RawFd;
use std::os::unix::ffi::OsStrExt;
use std::path::Path;
use std::pin::Pin;
use std::rc::Rc;
use std::task::{Context, Poll, Waker};

use io_uring::types::FsyncFlags;
use io_uring::{opcode, types};

use crate::buffer::IoBuffer;
use crate::event_loop::{EventLoop, LoopHandle};
use crate::{Error, Result};

struct OpState<T> {
    result: Option<Result<T>>,
    waker: Option<Waker>,
}

/// Resolves once the submitted completion-ring operation finishes. Modeled
/// on [`crate::actor::RequestFuture`]'s `Rc<RefCell<..>>` state machine,
/// generic over the decoded output.
pub struct FileOpFuture<T> {
    state: Rc<RefCell<OpState<T>>>,
}

impl<T> Future for FileOpFuture<T> {
    type Output = Result<T>;

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

/// Bounds the number of in-flight completion-ring operations a loop admits
/// at once (original §6 `ioRequestScheduler`, default capacity 512);
/// submissions past the limit queue instead of failing.
pub(crate) struct FileScheduler {
    capacity: usize,
    in_flight: Cell<usize>,
    queued: RefCell<VecDeque<(io_uring::squeue::Entry, Box<dyn FnOnce(io::Result<i32>)>)>>,
}

impl FileScheduler {
    pub(crate) fn new(capacity: usize) -> Rc<Self> {
        Rc::new(FileScheduler {
            capacity: capacity.max(1),
            in_flight: Cell::new(0),
            queued: RefCell::new(VecDeque::new()),
        })
    }

    pub(crate) fn in_flight(&self) -> usize {
        self.in_flight.get()
    }

    pub(crate) fn queued_len(&self) -> usize {
        self.queued.borrow().len()
    }

    /// Submits `entry` now if under capacity, otherwise queues it for
    /// [`FileScheduler::on_completion`] to drain as slots free up.
    fn submit(self: &Rc<Self>, lp: &EventLoop, entry: io_uring::squeue::Entry, callback: Box<dyn FnOnce(io::Result<i32>)>) {
        if self.in_flight.get() < self.capacity {
            self.in_flight.set(self.in_flight.get() + 1);
            let scheduler = Rc::clone(self);
            // `lp.submit_file_op` invokes the wrapper synchronously with an
            // error if the active reactor can't carry it (see
            // `Reactor::submit_op`'s default), so `in_flight`/`drain_one`
            // are handled uniformly whether this resolves now or later.
            let _ = lp.submit_file_op(
                entry,
                Box::new(move |result| {
                    scheduler.in_flight.set(scheduler.in_flight.get() - 1);
                    callback(result);
                    scheduler.drain_one();
                }),
            );
        } else {
            self.queued.borrow_mut().push_back((entry, callback));
        }
    }

    /// Pulls the next queued operation onto the ring now that a slot is
    /// free. Only callable from the owning loop's thread.
    ///
    /// Deferred onto the local task deque rather than submitted inline: this
    /// runs from inside a completion callback, itself invoked from within
    /// `Reactor::poll`'s own `&mut self` borrow — resubmitting synchronously
    /// here would re-enter that borrow.
    fn drain_one(self: &Rc<Self>) {
        let Some((entry, callback)) = self.queued.borrow_mut().pop_front() else {
            return;
        };
        let scheduler = Rc::clone(self);
        EventLoop::current(|lp| {
            lp.spawn_local(move || {
                EventLoop::current(|lp| scheduler.submit(lp, entry, callback));
            });
        });
    }
}

fn submit_scheduled<T: 'static>(
    entry: io_uring::squeue::Entry,
    decode: impl FnOnce(io::Result<i32>) -> Result<T> + 'static,
) -> FileOpFuture<T> {
    let state = Rc::new(RefCell::new(OpState { result: None, waker: None }));
    let state_for_completion = Rc::clone(&state);

    EventLoop::current(|lp| {
        let scheduler = Rc::clone(lp.file_scheduler());
        scheduler.submit(
            lp,
            entry,
            Box::new(move |raw| {
                let waker = {
                    let mut state = state_for_completion.borrow_mut();
                    state.result = Some(decode(raw));
                    state.waker.take()
                };
                if let Some(waker) = waker {
                    waker.wake();
                }
            }),
        );
    });

    FileOpFuture { state }
}

/// Handle to an open file, bound to the loop that opened it (original
/// `fs::File`).
pub struct File {
    fd: RawFd,
    loop_handle: LoopHandle,
}

impl File {
    /// Opens a file in read-only mode.
    pub fn open(path: impl AsRef<Path>) -> FileOpFuture<Self> {
        OpenOptions::new().read(true).open(path.as_ref())
    }

    /// Opens a file in write-only mode, creating and truncating it.
    pub fn create(path: impl AsRef<Path>) -> FileOpFuture<Self> {
        OpenOptions::new().write(true).create(true).truncate(true).open(path.as_ref())
    }

    #[must_use]
    pub fn options() -> OpenOptions {
        OpenOptions::new()
    }

    /// Reads into `buf` (`position..limit`) at `offset`, returning `buf`
    /// with `position` advanced by the bytes read.
    pub fn read_at(&self, buf: IoBuffer, offset: u64) -> FileOpFuture<IoBuffer> {
        let (ptr, len) = buf.with_uninit_mut(|slice| (slice.as_mut_ptr(), slice.len()));
        let entry = opcode::Read::new(types::Fd(self.fd), ptr, len as u32).offset(offset).build();
        submit_scheduled(entry, move |raw| {
            let n = raw.map_err(Error::Io)?;
            buf.set_position(buf.position() + n as usize);
            Ok(buf)
        })
    }

    /// Writes `buf` (`position..limit`) at `offset`, returning `buf` with
    /// `position` advanced by the bytes written.
    pub fn write_at(&self, buf: IoBuffer, offset: u64) -> FileOpFuture<IoBuffer> {
        let (ptr, len) = buf.with_data(|data| (data.as_ptr(), data.len()));
        let entry = opcode::Write::new(types::Fd(self.fd), ptr, len as u32).offset(offset).build();
        submit_scheduled(entry, move |raw| {
            let n = raw.map_err(Error::Io)?;
            buf.set_position(buf.position() + n as usize);
            Ok(buf)
        })
    }

    /// Syncs all OS-internal metadata to disk.
    pub fn sync_all(&self) -> FileOpFuture<()> {
        let entry = opcode::Fsync::new(types::Fd(self.fd)).build();
        submit_scheduled(entry, |raw| raw.map(|_| ()).map_err(Error::Io))
    }

    /// Syncs content, but maybe not metadata; fewer disk operations than
    /// [`File::sync_all`].
    pub fn sync_data(&self) -> FileOpFuture<()> {
        let entry = opcode::Fsync::new(types::Fd(self.fd)).flags(FsyncFlags::DATASYNC).build();
        submit_scheduled(entry, |raw| raw.map(|_| ()).map_err(Error::Io))
    }

    /// Truncates or extends the underlying file. No `io_uring` opcode for
    /// this exists; falls back to a direct `ftruncate` syscall (synchronous,
    /// but metadata-only, matching the teacher's own `set_len`).
    pub fn set_len(&self, size: u64) -> io::Result<()> {
        if unsafe { libc::ftruncate(self.fd, size as libc::off_t) } < 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(())
    }
}

impl Drop for File {
    fn drop(&mut self) {
        if !self.loop_handle.is_owner_thread() {
            tracing::warn!(fd = self.fd, "File dropped off its owning loop thread, fd leaked");
            return;
        }
        let entry = opcode::Close::new(types::Fd(self.fd)).build();
        let _ = EventLoop::current(|lp| lp.submit_file_op(entry, Box::new(|_| {})));
    }
}

/// Options and flags for configuring how a file is opened (original
/// `OpenOptions`, `open()` generalized to submit `OpenAt` asynchronously).
#[derive(Clone, Debug)]
pub struct OpenOptions {
    read: bool,
    write: bool,
    append: bool,
    truncate: bool,
    create: bool,
    create_new: bool,
    custom_flags: i32,
    mode: libc::mode_t,
}

impl OpenOptions {
    pub fn new() -> Self {
        OpenOptions {
            read: false,
            write: false,
            append: false,
            truncate: false,
            create: false,
            create_new: false,
            custom_flags: 0,
            mode: 0o666,
        }
    }

    pub fn read(&mut self, read: bool) -> &mut Self {
        self.read = read;
        self
    }

    pub fn write(&mut self, write: bool) -> &mut Self {
        self.write = write;
        self
    }

    pub fn append(&mut self, append: bool) -> &mut Self {
        self.append = append;
        self
    }

    pub fn truncate(&mut self, truncate: bool) -> &mut Self {
        self.truncate = truncate;
        self
    }

    pub fn create(&mut self, create: bool) -> &mut Self {
        self.create = create;
        self
    }

    pub fn create_new(&mut self, create_new: bool) -> &mut Self {
        self.create_new = create_new;
        self
    }

    fn get_access_mode(&self) -> io::Result<libc::c_int> {
        match (self.read, self.write, self.append) {
            (true, false, false) => Ok(libc::O_RDONLY),
            (false, true, false) => Ok(libc::O_WRONLY),
            (true, true, false) => Ok(libc::O_RDWR),
            (false, _, true) => Ok(libc::O_WRONLY | libc::O_APPEND),
            (true, _, true) => Ok(libc::O_RDWR | libc::O_APPEND),
            (false, false, false) => Err(io::Error::from_raw_os_error(libc::EINVAL)),
        }
    }

    fn get_creation_mode(&self) -> io::Result<libc::c_int> {
        match (self.write, self.append) {
            (true, false) => {}
            (false, false) => {
                if self.truncate || self.create || self.create_new {
                    return Err(io::Error::from_raw_os_error(libc::EINVAL));
                }
            }
            (_, true) => {
                if self.truncate && !self.create_new {
                    return Err(io::Error::from_raw_os_error(libc::EINVAL));
                }
            }
        }

        Ok(match (self.create, self.truncate, self.create_new) {
            (false, false, false) => 0,
            (true, false, false) => libc::O_CREAT,
            (false, true, false) => libc::O_TRUNC,
            (true, true, false) => libc::O_CREAT | libc::O_TRUNC,
            (_, _, true) => libc::O_CREAT | libc::O_EXCL,
        })
    }

    /// Opens a file at `path` with the options specified by `self`. Must be
    /// called on the thread running the loop the returned [`File`] is bound to.
    pub fn open(&self, path: impl AsRef<Path>) -> FileOpFuture<File> {
        let access_mode = self.get_access_mode();
        let creation_mode = self.get_creation_mode();
        let path = CString::new(path.as_ref().as_os_str().as_bytes()).expect("path contains a NUL byte");
        let mode = self.mode;
        let custom_flags = self.custom_flags;

        let (access_mode, creation_mode) = match (access_mode, creation_mode) {
            (Ok(a), Ok(c)) => (a, c),
            (Err(e), _) | (_, Err(e)) => {
                let state = Rc::new(RefCell::new(OpState {
                    result: Some(Err(Error::Io(e))),
                    waker: None,
                }));
                return FileOpFuture { state };
            }
        };

        let flags = libc::O_CLOEXEC | access_mode | creation_mode | (custom_flags & !libc::O_ACCMODE);
        let at_cwd = types::Fd(libc::AT_FDCWD);
        let entry = opcode::OpenAt::new(at_cwd, path.as_ptr()).mode(mode).flags(flags).build();
        let loop_handle = EventLoop::current(|lp| lp.handle().clone());

        submit_scheduled(entry, move |raw| {
            let _path = path; // kept alive until the kernel has read it
            let fd = raw.map_err(Error::Io)?;
            Ok(File { fd, loop_handle })
        })
    }
}

impl Default for OpenOptions {
    fn default() -> Self {
        Self::new()
    }
}

/// Removes a file from the filesystem.
pub fn remove_file(path: impl AsRef<Path>) -> FileOpFuture<()> {
    let at_cwd = types::Fd(libc::AT_FDCWD);
    let path = CString::new(path.as_ref().as_os_str().as_bytes()).expect("path contains a NUL byte");
    let entry = opcode::UnlinkAt::new(at_cwd, path.as_ptr()).build();
    submit_scheduled(entry, move |raw| {
        let _path = path;
        raw.map(|_| ()).map_err(Error::Io)
    })
}
