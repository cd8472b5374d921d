//! io_uring-backed reactor.
//!
//! Grounded on the teacher's `runtime::syscall::Interface`: one `IoUring`
//! instance, submission batched until `submit`/`poll` is called, completions
//! drained by user_data. Readiness is obtained by submitting
//! `IORING_OP_POLL_ADD` per registered fd and re-arming it every time it
//! fires, the same "always-armed, re-arms on completion" shape the original
//! spec describes for the loop's own wakeup-fd registration.

use std::collections::HashMap;
use std::io;
use std::os::fd::RawFd;
use std::time::Duration;

use io_uring::{opcode, types, IoUring};

use super::{Interest, Reactor, ReactorEvent, Token};
use crate::config::Config;

fn poll_mask(interest: Interest) -> u32 {
    let mut mask = 0u32;
    if interest.is_readable() {
        mask |= libc::POLLIN as u32;
    }
    if interest.is_writable() {
        mask |= libc::POLLOUT as u32;
    }
    mask
}

struct Registration {
    fd: RawFd,
    interest: Interest,
    token: Token,
    /// `false` once a `PollAdd` for this fd is in flight; re-armed after its completion.
    armed: bool,
    /// `user_data` of the currently in-flight `PollAdd`, if any. A completion
    /// whose `user_data` doesn't match this is a cancelled poll still
    /// draining out of the ring and is dropped rather than re-armed.
    op_id: Option<u64>,
}

/// A file-I/O operation submitted via [`Reactor::submit_op`], awaiting completion.
struct PendingOp {
    callback: Box<dyn FnOnce(io::Result<i32>)>,
}

pub struct CompletionRingReactor {
    ring: IoUring,
    registrations: HashMap<RawFd, Registration>,
    /// Maps the poll operation's `user_data` back to the registered fd.
    op_to_fd: HashMap<u64, RawFd>,
    /// Maps a submitted file op's `user_data` to its completion callback.
    pending_ops: HashMap<u64, PendingOp>,
    next_op_id: u64,
}

impl CompletionRingReactor {
    pub fn new(config: &Config) -> io::Result<Self> {
        let mut builder = IoUring::builder();
        builder.setup_clamp();
        let ring = builder.build(config.ringbuffer_size.max(8))?;

        Ok(CompletionRingReactor {
            ring,
            registrations: HashMap::new(),
            op_to_fd: HashMap::new(),
            pending_ops: HashMap::new(),
            next_op_id: 1,
        })
    }

    fn arm(&mut self, fd: RawFd) -> io::Result<()> {
        let op_id = self.next_op_id;
        self.next_op_id += 1;

        let interest = self.registrations.get(&fd).map(|r| r.interest).unwrap();
        let sqe = opcode::PollAdd::new(types::Fd(fd), poll_mask(interest))
            .build()
            .user_data(op_id);

        unsafe {
            while self.ring.submission().push(&sqe).is_err() {
                self.ring.submit()?;
            }
        }

        self.op_to_fd.insert(op_id, fd);
        if let Some(registration) = self.registrations.get_mut(&fd) {
            registration.armed = true;
            registration.op_id = Some(op_id);
        }

        Ok(())
    }

    /// Cancels the fd's in-flight `PollAdd`, if any, via `IORING_OP_POLL_REMOVE`.
    /// Best-effort: a completion for the cancelled op may still arrive later
    /// and is dropped in `poll` once it no longer matches the registration's
    /// current `op_id`.
    fn cancel_armed(&mut self, fd: RawFd) -> io::Result<()> {
        let Some(op_id) = self.registrations.get(&fd).and_then(|r| r.op_id) else {
            return Ok(());
        };

        let remove_id = self.next_op_id;
        self.next_op_id += 1;
        let sqe = opcode::PollRemove::new(op_id).build().user_data(remove_id);

        unsafe {
            while self.ring.submission().push(&sqe).is_err() {
                self.ring.submit()?;
            }
        }

        Ok(())
    }
}

impl Reactor for CompletionRingReactor {
    fn register(&mut self, fd: RawFd, interest: Interest, token: Token) -> io::Result<()> {
        self.registrations.insert(
            fd,
            Registration {
                fd,
                interest,
                token,
                armed: false,
                op_id: None,
            },
        );
        self.arm(fd)
    }

    fn reregister(&mut self, fd: RawFd, interest: Interest, token: Token) -> io::Result<()> {
        let changed = self
            .registrations
            .get(&fd)
            .is_some_and(|r| r.interest != interest);

        if let Some(registration) = self.registrations.get_mut(&fd) {
            registration.interest = interest;
            registration.token = token;
        } else {
            return Ok(());
        }

        if changed {
            // The mask just submitted won't reflect `interest` (e.g. a
            // write-blocked socket newly armed for `Writable` needs a fresh
            // `PollAdd` with `POLLOUT` set, not just a stored field update) —
            // cancel it and arm a fresh one now rather than waiting for a
            // completion that may never come.
            self.cancel_armed(fd)?;
            self.arm(fd)?;
        }

        Ok(())
    }

    fn deregister(&mut self, fd: RawFd) -> io::Result<()> {
        self.registrations.remove(&fd);
        // Stale completions for this fd are dropped in `poll` once `op_to_fd`
        // no longer resolves to a live registration.
        Ok(())
    }

    fn submit(&mut self) -> io::Result<()> {
        self.ring.submit()?;
        Ok(())
    }

    fn submit_op(
        &mut self,
        entry: io_uring::squeue::Entry,
        callback: Box<dyn FnOnce(io::Result<i32>)>,
    ) -> io::Result<()> {
        let op_id = self.next_op_id;
        self.next_op_id += 1;
        let entry = entry.user_data(op_id);

        unsafe {
            while self.ring.submission().push(&entry).is_err() {
                self.ring.submit()?;
            }
        }

        self.pending_ops.insert(op_id, PendingOp { callback });
        Ok(())
    }

    fn poll(&mut self, timeout: Option<Duration>, events: &mut Vec<ReactorEvent>) -> io::Result<()> {
        match timeout {
            Some(Duration::ZERO) => {
                self.ring.submit()?;
            }
            Some(duration) => {
                let timespec = types::Timespec::new()
                    .sec(duration.as_secs())
                    .nsec(duration.subsec_nanos());
                let args = types::SubmitArgs::new().timespec(&timespec);
                match self.ring.submitter().submit_with_args(1, &args) {
                    Ok(_) => {}
                    Err(e) if e.raw_os_error() == Some(libc::ETIME) => {}
                    Err(e) => return Err(e),
                }
            }
            None => {
                self.ring.submit_and_wait(1)?;
            }
        }

        let completed: Vec<(u64, i32)> = {
            // Safety: this is the only completion queue handle in scope.
            let cq = unsafe { self.ring.completion_shared() };
            cq.map(|cqe| (cqe.user_data(), cqe.result())).collect()
        };

        for (op_id, result) in completed {
            if let Some(op) = self.pending_ops.remove(&op_id) {
                let outcome = if result < 0 {
                    Err(io::Error::from_raw_os_error(-result))
                } else {
                    Ok(result)
                };
                (op.callback)(outcome);
                continue;
            }

            let Some(fd) = self.op_to_fd.remove(&op_id) else {
                continue;
            };
            let Some(registration) = self.registrations.get(&fd) else {
                continue; // deregistered while the poll was in flight
            };
            if registration.op_id != Some(op_id) {
                continue; // cancelled by `reregister`; a fresh PollAdd is already armed
            }
            let token = registration.token;

            if result < 0 {
                events.push(ReactorEvent::Error(token));
                continue;
            }

            let revents = result as u32;
            if revents & (libc::POLLIN as u32) != 0 {
                events.push(ReactorEvent::Readable(token));
            }
            if revents & (libc::POLLOUT as u32) != 0 {
                events.push(ReactorEvent::Writable(token));
            }
            if revents & (libc::POLLERR as u32 | libc::POLLHUP as u32) != 0 {
                events.push(ReactorEvent::Error(token));
            }

            self.arm(fd)?;
        }

        Ok(())
    }
}
