//! epoll backend

use std::os::fd::{AsRawFd, FromRawFd, OwnedFd};
use std::time::Duration;

use nix::errno::Errno;
use urpc_core::HandleId;

use super::{Event, Interest, IoSource};

pub struct Poller {
    epfd: OwnedFd,
    events: Vec<libc::epoll_event>,
}

impl Poller {
    /// New epoll instance fetching up to `max_events` events per wait.
    pub fn new(max_events: usize) -> Result<Self, Errno> {
        // SAFETY: plain syscall.
        let fd = Errno::result(unsafe { libc::epoll_create1(libc::EPOLL_CLOEXEC) })?;
        Ok(Self {
            // SAFETY: epoll_create1 returned a fresh descriptor we now own.
            epfd: unsafe { OwnedFd::from_raw_fd(fd) },
            events: vec![libc::epoll_event { events: 0, u64: 0 }; max_events.max(1)],
        })
    }

    fn ctl(&self, op: libc::c_int, src: &IoSource, interest: Interest) -> Result<(), Errno> {
        let fd = src.fd().ok_or(Errno::EBADF)?;
        let mut flags = libc::EPOLLET | libc::EPOLLRDHUP;
        if interest.contains(Interest::READ) {
            flags |= libc::EPOLLIN;
        }
        if interest.contains(Interest::WRITE) {
            flags |= libc::EPOLLOUT;
        }
        let mut ev = libc::epoll_event {
            events: flags as u32,
            u64: src.token.to_token(),
        };
        // SAFETY: `ev` is valid for the call; DEL ignores it on modern kernels.
        let ret = unsafe { libc::epoll_ctl(self.epfd.as_raw_fd(), op, fd.as_raw_fd(), &mut ev) };
        Errno::result(ret).map(drop)
    }

    fn register(&self, src: &mut IoSource, dir: Interest) -> Result<(), Errno> {
        if src.interest.contains(dir) {
            return Ok(());
        }
        let op = if src.interest.is_empty() {
            libc::EPOLL_CTL_ADD
        } else {
            libc::EPOLL_CTL_MOD
        };
        let want = src.interest | dir;
        self.ctl(op, src, want)?;
        src.interest = want;
        Ok(())
    }

    pub fn register_read(&self, src: &mut IoSource) -> Result<(), Errno> {
        self.register(src, Interest::READ)
    }

    pub fn register_write(&self, src: &mut IoSource) -> Result<(), Errno> {
        self.register(src, Interest::WRITE)
    }

    /// Remove the OS registration and clear both directions.
    /// Does not close the descriptor.
    pub fn unregister(&self, src: &mut IoSource) -> Result<(), Errno> {
        if src.interest.is_empty() {
            return Ok(());
        }
        src.interest = Interest::empty();
        self.ctl(libc::EPOLL_CTL_DEL, src, Interest::empty())
    }

    /// Wait for readiness; `None` blocks indefinitely.
    ///
    /// Fills `out` (cleared first) and returns the number of events. An
    /// interrupted wait returns zero events.
    pub fn wait(&mut self, timeout: Option<Duration>, out: &mut Vec<Event>) -> Result<usize, Errno> {
        out.clear();
        let timeout_ms = match timeout {
            None => -1,
            Some(d) => {
                // Round up so a sub-millisecond deadline does not busy-spin.
                let ms = d.as_nanos().div_ceil(1_000_000);
                ms.min(i32::MAX as u128) as libc::c_int
            }
        };
        // SAFETY: the events buffer is valid for `len` entries.
        let ret = unsafe {
            libc::epoll_wait(
                self.epfd.as_raw_fd(),
                self.events.as_mut_ptr(),
                self.events.len() as libc::c_int,
                timeout_ms,
            )
        };
        let n = match Errno::result(ret) {
            Ok(n) => n as usize,
            Err(Errno::EINTR) => return Ok(0),
            Err(e) => return Err(e),
        };
        for raw in &self.events[..n] {
            let flags = raw.events as libc::c_int;
            let error = flags & (libc::EPOLLERR | libc::EPOLLHUP) != 0;
            out.push(Event {
                token: HandleId::from_token(raw.u64),
                readable: error || flags & (libc::EPOLLIN | libc::EPOLLRDHUP) != 0,
                writable: error || flags & libc::EPOLLOUT != 0,
                error,
            });
        }
        Ok(n)
    }
}

impl std::fmt::Debug for Poller {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Poller")
            .field("epfd", &self.epfd.as_raw_fd())
            .field("max_events", &self.events.len())
            .finish()
    }
}
