use std::io;
use std::os::unix::io::RawFd;
use std::time::Duration;

use libc::c_int;

/// What a registered descriptor is polled for.
///
/// `Idle` keeps the descriptor registered with an empty interest set, so
/// only errors and hangups are reported.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Interest {
    Readable,
    Writable,
    Idle,
}

impl Interest {
    fn bits(self) -> u32 {
        match self {
            Interest::Readable => (libc::EPOLLIN | libc::EPOLLRDHUP) as u32,
            Interest::Writable => libc::EPOLLOUT as u32,
            Interest::Idle => 0,
        }
    }
}

/// One readiness report
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Event {
    token: u64,
    readiness: u32,
}

impl Event {
    pub fn token(&self) -> u64 {
        self.token
    }

    pub fn is_readable(&self) -> bool {
        self.readiness & libc::EPOLLIN as u32 != 0
    }

    pub fn is_writable(&self) -> bool {
        self.readiness & libc::EPOLLOUT as u32 != 0
    }

    pub fn is_error(&self) -> bool {
        self.readiness & libc::EPOLLERR as u32 != 0
    }

    /// Peer hung up, fully or its writing half
    pub fn is_hangup(&self) -> bool {
        self.readiness & (libc::EPOLLHUP | libc::EPOLLRDHUP) as u32 != 0
    }
}

/// Buffer `Poller::wait` fills
pub struct Events {
    buffer: Vec<libc::epoll_event>,
    len: usize,
}

impl Events {
    pub fn with_capacity(capacity: usize) -> Self {
        Events {
            buffer: vec![libc::epoll_event { events: 0, u64: 0 }; capacity.max(1)],
            len: 0,
        }
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn iter(&self) -> impl Iterator<Item = Event> + '_ {
        self.buffer[..self.len].iter().map(|e| {
            // Copy out of the (packed on x86_64) kernel struct
            let token = e.u64;
            let readiness = e.events;
            Event { token, readiness }
        })
    }
}

/// Level-triggered epoll instance. Each registration carries a caller
/// chosen token that comes back with its events.
#[derive(Debug)]
pub struct Poller {
    epoll_fd: RawFd,
}

impl Poller {
    pub fn new() -> io::Result<Self> {
        let epoll_fd = unsafe { libc::epoll_create1(libc::EPOLL_CLOEXEC) };
        if epoll_fd == -1 {
            return Err(io::Error::last_os_error());
        }
        Ok(Poller { epoll_fd })
    }

    pub fn register(&self, fd: RawFd, interest: Interest, token: u64) -> io::Result<()> {
        self.ctl(libc::EPOLL_CTL_ADD, fd, interest, token)
    }

    pub fn modify(&self, fd: RawFd, interest: Interest, token: u64) -> io::Result<()> {
        self.ctl(libc::EPOLL_CTL_MOD, fd, interest, token)
    }

    pub fn deregister(&self, fd: RawFd) -> io::Result<()> {
        let result = unsafe { libc::epoll_ctl(self.epoll_fd, libc::EPOLL_CTL_DEL, fd, std::ptr::null_mut()) };
        if result == -1 {
            return Err(io::Error::last_os_error());
        }
        Ok(())
    }

    fn ctl(&self, op: c_int, fd: RawFd, interest: Interest, token: u64) -> io::Result<()> {
        let mut event = libc::epoll_event {
            events: interest.bits(),
            u64: token,
        };
        let result = unsafe { libc::epoll_ctl(self.epoll_fd, op, fd, &mut event as *mut libc::epoll_event) };
        if result == -1 {
            return Err(io::Error::last_os_error());
        }
        Ok(())
    }

    /// Block until something is ready or `timeout` passes (`None` waits
    /// forever). An interrupted wait reports no events so the caller can
    /// look at its shutdown flag.
    pub fn wait(&self, events: &mut Events, timeout: Option<Duration>) -> io::Result<usize> {
        let timeout_ms: c_int = match timeout {
            // Round up so a sub-millisecond deadline does not spin
            Some(t) => t.as_nanos().div_ceil(1_000_000).min(c_int::MAX as u128) as c_int,
            None => -1,
        };

        let nfds = unsafe {
            libc::epoll_wait(
                self.epoll_fd,
                events.buffer.as_mut_ptr(),
                events.buffer.len() as c_int,
                timeout_ms,
            )
        };

        if nfds == -1 {
            let err = io::Error::last_os_error();
            events.len = 0;
            if err.kind() == io::ErrorKind::Interrupted {
                return Ok(0);
            }
            return Err(err);
        }

        events.len = nfds as usize;
        Ok(events.len)
    }
}

impl Drop for Poller {
    fn drop(&mut self) {
        unsafe {
            libc::close(self.epoll_fd);
        }
    }
}
