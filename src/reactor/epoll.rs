//! Linux epoll-backed reactor.
//!
//! Grounded on the teacher's direct-libc style (`net::tcp`'s raw `sockaddr`
//! handling, `circular_buffer`'s raw `mmap`): sockets and the wakeup fd are
//! registered edge-triggered for `EPOLLIN`/`EPOLLOUT`, matching original
//! §4.1's "Readiness backend (epoll-style)".

use std::collections::HashMap;
use std::io;
use std::os::fd::RawFd;
use std::time::Duration;

use super::{Interest, Reactor, ReactorEvent, Token};

fn epoll_events(interest: Interest) -> u32 {
    let mut events = libc::EPOLLET as u32;
    if interest.is_readable() {
        events |= libc::EPOLLIN as u32;
    }
    if interest.is_writable() {
        events |= libc::EPOLLOUT as u32;
    }
    events
}

pub struct ReadinessReactor {
    epoll_fd: RawFd,
    tokens: HashMap<RawFd, Token>,
    buffer: Vec<libc::epoll_event>,
}

impl ReadinessReactor {
    pub fn new() -> io::Result<Self> {
        let epoll_fd = unsafe { libc::epoll_create1(libc::EPOLL_CLOEXEC) };
        if epoll_fd < 0 {
            return Err(io::Error::last_os_error());
        }

        Ok(ReadinessReactor {
            epoll_fd,
            tokens: HashMap::new(),
            buffer: vec![unsafe { std::mem::zeroed() }; 256],
        })
    }

    fn ctl(&self, op: i32, fd: RawFd, events: u32, token: Token) -> io::Result<()> {
        let mut event = libc::epoll_event {
            events,
            u64: token.0,
        };
        let result = unsafe { libc::epoll_ctl(self.epoll_fd, op, fd, &mut event) };
        if result < 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(())
    }
}

impl Reactor for ReadinessReactor {
    fn register(&mut self, fd: RawFd, interest: Interest, token: Token) -> io::Result<()> {
        self.ctl(libc::EPOLL_CTL_ADD, fd, epoll_events(interest), token)?;
        self.tokens.insert(fd, token);
        Ok(())
    }

    fn reregister(&mut self, fd: RawFd, interest: Interest, token: Token) -> io::Result<()> {
        self.ctl(libc::EPOLL_CTL_MOD, fd, epoll_events(interest), token)?;
        self.tokens.insert(fd, token);
        Ok(())
    }

    fn deregister(&mut self, fd: RawFd) -> io::Result<()> {
        if self.tokens.remove(&fd).is_some() {
            // Deregistering defensively: an already-closed fd yields EBADF,
            // which is expected once the caller closes before deregistering.
            let mut dummy: libc::epoll_event = unsafe { std::mem::zeroed() };
            unsafe { libc::epoll_ctl(self.epoll_fd, libc::EPOLL_CTL_DEL, fd, &mut dummy) };
        }
        Ok(())
    }

    fn submit(&mut self) -> io::Result<()> {
        Ok(()) // epoll has no separate submission phase
    }

    fn poll(&mut self, timeout: Option<Duration>, events: &mut Vec<ReactorEvent>) -> io::Result<()> {
        let timeout_ms = match timeout {
            None => -1,
            Some(d) => d.as_millis().min(i32::MAX as u128) as i32,
        };

        let n = unsafe {
            libc::epoll_wait(
                self.epoll_fd,
                self.buffer.as_mut_ptr(),
                self.buffer.len() as i32,
                timeout_ms,
            )
        };

        if n < 0 {
            let err = io::Error::last_os_error();
            if err.kind() == io::ErrorKind::Interrupted {
                return Ok(());
            }
            return Err(err);
        }

        for raw in &self.buffer[..n as usize] {
            let token = Token(raw.u64);

            if raw.events & (libc::EPOLLERR as u32 | libc::EPOLLHUP as u32) != 0 {
                events.push(ReactorEvent::Error(token));
                continue;
            }
            if raw.events & libc::EPOLLIN as u32 != 0 {
                events.push(ReactorEvent::Readable(token));
            }
            if raw.events & libc::EPOLLOUT as u32 != 0 {
                events.push(ReactorEvent::Writable(token));
            }
        }

        Ok(())
    }
}

impl Drop for ReadinessReactor {
    fn drop(&mut self) {
        unsafe { libc::close(self.epoll_fd) };
    }
}
