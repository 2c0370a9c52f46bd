//! Readiness multiplexer over epoll.
//!
//! Registrations are identified by a caller-chosen token (the broker packs the
//! slot position and generation into it), mirroring mio's `Token`. Registration is level-triggered:
//! a listener with a backlog keeps reporting ready until it is drained.

use crate::error::Result;
use nix::errno::Errno;
use nix::sys::epoll::{Epoll, EpollCreateFlags, EpollEvent, EpollFlags, EpollTimeout};
use std::os::fd::AsFd;
use std::time::Duration;

/// What a registration waits for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Interest {
    /// A listening socket has a connection to accept.
    Accept,
    /// A stream has data, or the peer hung up.
    ReadOrClose,
    /// Only the peer hanging up.
    CloseOnly,
    /// The wake channel has a pending byte.
    Wake,
}

impl Interest {
    fn flags(self) -> EpollFlags {
        match self {
            Interest::Accept | Interest::Wake => EpollFlags::EPOLLIN,
            Interest::ReadOrClose => EpollFlags::EPOLLIN | EpollFlags::EPOLLRDHUP,
            Interest::CloseOnly => EpollFlags::EPOLLRDHUP,
        }
    }
}

/// One readiness notification.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Event {
    pub token: u64,
    pub readable: bool,
    pub closed: bool,
}

impl Event {
    fn from_epoll(event: &EpollEvent) -> Self {
        let flags = event.events();
        Self {
            token: event.data(),
            readable: flags.contains(EpollFlags::EPOLLIN),
            closed: flags
                .intersects(EpollFlags::EPOLLRDHUP | EpollFlags::EPOLLHUP | EpollFlags::EPOLLERR),
        }
    }
}

/// Buffer receiving the events of one `wait` call.
pub struct Events {
    buf: Vec<EpollEvent>,
    len: usize,
}

impl Events {
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            buf: vec![EpollEvent::empty(); capacity.max(1)],
            len: 0,
        }
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn get(&self, index: usize) -> Option<Event> {
        self.buf[..self.len].get(index).map(Event::from_epoll)
    }

    /// Events in the order the kernel returned them.
    pub fn iter(&self) -> impl Iterator<Item = Event> + '_ {
        self.buf[..self.len].iter().map(Event::from_epoll)
    }
}

/// Fixed-capacity epoll set.
pub struct Poller {
    epoll: Epoll,
    capacity: usize,
    registered: usize,
}

impl Poller {
    pub fn new(capacity: usize) -> Result<Self> {
        Ok(Self {
            epoll: Epoll::new(EpollCreateFlags::EPOLL_CLOEXEC)?,
            capacity,
            registered: 0,
        })
    }

    pub fn registered(&self) -> usize {
        self.registered
    }

    /// Register `fd` under `token`.
    ///
    /// Returns `Ok(false)` without touching epoll when the set is full.
    pub fn register<F: AsFd>(&mut self, fd: F, token: u64, interest: Interest) -> Result<bool> {
        if self.registered >= self.capacity {
            return Ok(false);
        }
        self.epoll
            .add(fd, EpollEvent::new(interest.flags(), token))?;
        self.registered += 1;
        Ok(true)
    }

    /// Change what an existing registration waits for.
    pub fn modify<F: AsFd>(&self, fd: F, token: u64, interest: Interest) -> Result<()> {
        let mut event = EpollEvent::new(interest.flags(), token);
        self.epoll.modify(fd, &mut event)?;
        Ok(())
    }

    /// Remove a registration. Must happen before the descriptor is closed.
    pub fn deregister<F: AsFd>(&mut self, fd: F) -> Result<()> {
        self.epoll.delete(fd)?;
        self.registered -= 1;
        Ok(())
    }

    /// Block until at least one registration is ready, or `timeout` passes.
    ///
    /// `None` waits indefinitely. Interrupted waits are retried.
    pub fn wait(&self, events: &mut Events, timeout: Option<Duration>) -> Result<()> {
        let timeout = match timeout {
            None => EpollTimeout::NONE,
            Some(d) => EpollTimeout::from(u16::try_from(d.as_millis()).unwrap_or(u16::MAX)),
        };
        loop {
            match self.epoll.wait(&mut events.buf, timeout) {
                Ok(n) => {
                    events.len = n;
                    return Ok(());
                }
                Err(Errno::EINTR) => continue,
                Err(e) => return Err(e.into()),
            }
        }
    }
}
