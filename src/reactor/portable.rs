//! Cross-platform selector backend, built on `mio::Poll`.
//!
//! Grounded on `tokio-rs/mio`: `Poll`/`Events`/`Token` are mio's own
//! selector vocabulary, used here for any platform where neither io_uring
//! nor raw epoll apply (original §4.1 "Portable backend").

use std::io;
use std::os::fd::RawFd;
use std::time::Duration;

use mio::unix::SourceFd;
use mio::{Events, Interest as MioInterest, Poll, Token as MioToken};

use super::{Interest, Reactor, ReactorEvent, Token};

fn mio_interest(interest: Interest) -> MioInterest {
    match interest {
        Interest::Readable => MioInterest::READABLE,
        Interest::Writable => MioInterest::WRITABLE,
        Interest::ReadWritable => MioInterest::READABLE | MioInterest::WRITABLE,
    }
}

pub struct PortableReactor {
    poll: Poll,
    events: Events,
}

impl PortableReactor {
    pub fn new() -> io::Result<Self> {
        Ok(PortableReactor {
            poll: Poll::new()?,
            events: Events::with_capacity(256),
        })
    }
}

impl Reactor for PortableReactor {
    fn register(&mut self, fd: RawFd, interest: Interest, token: Token) -> io::Result<()> {
        self.poll
            .registry()
            .register(&mut SourceFd(&fd), MioToken(token.0 as usize), mio_interest(interest))
    }

    fn reregister(&mut self, fd: RawFd, interest: Interest, token: Token) -> io::Result<()> {
        self.poll
            .registry()
            .reregister(&mut SourceFd(&fd), MioToken(token.0 as usize), mio_interest(interest))
    }

    fn deregister(&mut self, fd: RawFd) -> io::Result<()> {
        // mio requires deregistering the same source value used to register;
        // a bare fd re-wrapped in SourceFd is accepted by every mio poller
        // implementation for this purpose.
        let _ = self.poll.registry().deregister(&mut SourceFd(&fd));
        Ok(())
    }

    fn submit(&mut self) -> io::Result<()> {
        Ok(()) // mio has no separate submission phase
    }

    fn poll(&mut self, timeout: Option<Duration>, events: &mut Vec<ReactorEvent>) -> io::Result<()> {
        match self.poll.poll(&mut self.events, timeout) {
            Ok(()) => {}
            Err(e) if e.kind() == io::ErrorKind::Interrupted => return Ok(()),
            Err(e) => return Err(e),
        }

        for event in self.events.iter() {
            let token = Token(event.token().0 as u64);

            if event.is_error() || event.is_read_closed() && event.is_write_closed() {
                events.push(ReactorEvent::Error(token));
                continue;
            }
            if event.is_readable() {
                events.push(ReactorEvent::Readable(token));
            }
            if event.is_writable() {
                events.push(ReactorEvent::Writable(token));
            }
        }

        Ok(())
    }
}
