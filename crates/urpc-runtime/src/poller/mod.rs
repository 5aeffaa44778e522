//! Readiness multiplexer
//!
//! Edge-triggered: a handle is told once per transition to ready and must
//! drain its descriptor until `EAGAIN` before it can expect another event.
//!
//! ```text
//!   IoSource ──register_read/write──▶ Poller ──wait()──▶ [Event { token, r, w }]
//!      │                                                        │
//!      └── interest (READ | WRITE), only changed by the Poller ◀┘ dispatch by token
//! ```
//!
//! Registration is idempotent per direction and upgrades an existing
//! registration in place (`EPOLL_CTL_MOD`) rather than re-adding it.

use std::os::fd::{AsFd, BorrowedFd, OwnedFd};

use bitflags::bitflags;
use urpc_core::HandleId;

cfg_if::cfg_if! {
    if #[cfg(target_os = "linux")] {
        mod epoll;
        pub use epoll::Poller;
    } else {
        compile_error!("urpc-runtime requires epoll (Linux)");
    }
}

bitflags! {
    /// Directions a source is registered for
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct Interest: u8 {
        const READ = 0b01;
        const WRITE = 0b10;
    }
}

/// One readiness notification
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Event {
    pub token: HandleId,
    pub readable: bool,
    pub writable: bool,
    /// Error or hang-up; also reported as readable and writable
    pub error: bool,
}

/// A descriptor as the poller sees it: the fd, what it is registered for,
/// and the token events for it carry.
///
/// Dropping a source whose descriptor is still open is a bug in the
/// owning handle (it skipped `reset`) and panics.
pub struct IoSource {
    fd: Option<OwnedFd>,
    interest: Interest,
    token: HandleId,
}

impl IoSource {
    pub fn new(token: HandleId, fd: Option<OwnedFd>) -> Self {
        Self {
            fd,
            interest: Interest::empty(),
            token,
        }
    }

    #[inline]
    pub fn token(&self) -> HandleId {
        self.token
    }

    #[inline]
    pub fn interest(&self) -> Interest {
        self.interest
    }

    #[inline]
    pub fn is_open(&self) -> bool {
        self.fd.is_some()
    }

    #[inline]
    pub fn fd(&self) -> Option<BorrowedFd<'_>> {
        self.fd.as_ref().map(|fd| fd.as_fd())
    }

    /// Install a fresh descriptor (reconnect). The previous one must have
    /// been closed.
    pub fn attach(&mut self, fd: OwnedFd) {
        debug_assert!(self.fd.is_none(), "attach over an open descriptor");
        debug_assert!(self.interest.is_empty());
        self.fd = Some(fd);
    }

    /// Unregister and close. Returns false if already closed.
    pub fn close(&mut self, poller: &Poller) -> bool {
        if self.fd.is_none() {
            return false;
        }
        if !self.interest.is_empty() {
            if let Err(e) = poller.unregister(self) {
                tracing::debug!(token = ?self.token, error = %e, "epoll_ctl(DEL) failed on close");
            }
        }
        self.interest = Interest::empty();
        self.fd = None;
        true
    }
}

impl Drop for IoSource {
    fn drop(&mut self) {
        if self.fd.is_some() && !std::thread::panicking() {
            panic!("IoSource {:?} dropped with its descriptor still open", self.token);
        }
    }
}

impl std::fmt::Debug for IoSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IoSource")
            .field("token", &self.token)
            .field("open", &self.is_open())
            .field("interest", &self.interest)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use std::os::unix::net::UnixStream;
    use std::time::Duration;

    fn pair_source(token: HandleId) -> (IoSource, UnixStream) {
        let (a, b) = UnixStream::pair().unwrap();
        a.set_nonblocking(true).unwrap();
        (IoSource::new(token, Some(OwnedFd::from(a))), b)
    }

    #[test]
    fn test_register_is_idempotent_and_upgrades() {
        let poller = Poller::new(8).unwrap();
        let (mut src, _peer) = pair_source(HandleId::new(1, 0));

        poller.register_read(&mut src).unwrap();
        poller.register_read(&mut src).unwrap();
        assert_eq!(src.interest(), Interest::READ);

        poller.register_write(&mut src).unwrap();
        assert_eq!(src.interest(), Interest::READ | Interest::WRITE);

        poller.unregister(&mut src).unwrap();
        assert!(src.interest().is_empty());
        assert!(src.close(&poller));
        assert!(!src.close(&poller));
    }

    #[test]
    fn test_edge_triggered_read_event() {
        let mut poller = Poller::new(8).unwrap();
        let token = HandleId::new(3, 7);
        let (mut src, mut peer) = pair_source(token);
        poller.register_read(&mut src).unwrap();

        let mut events = Vec::new();
        assert_eq!(poller.wait(Some(Duration::ZERO), &mut events).unwrap(), 0);

        peer.write_all(b"x").unwrap();
        assert_eq!(poller.wait(Some(Duration::from_secs(1)), &mut events).unwrap(), 1);
        assert_eq!(events[0].token, token);
        assert!(events[0].readable);

        // Not drained, but no new edge: no second event.
        assert_eq!(poller.wait(Some(Duration::ZERO), &mut events).unwrap(), 0);
        src.close(&poller);
    }

    #[test]
    fn test_hangup_reports_both_directions() {
        let mut poller = Poller::new(8).unwrap();
        let (mut src, peer) = pair_source(HandleId::new(0, 0));
        poller.register_read(&mut src).unwrap();
        drop(peer);

        let mut events = Vec::new();
        assert_eq!(poller.wait(Some(Duration::from_secs(1)), &mut events).unwrap(), 1);
        assert!(events[0].readable);
        src.close(&poller);
    }

    #[test]
    #[should_panic(expected = "still open")]
    fn test_drop_open_source_panics() {
        let (src, _peer) = pair_source(HandleId::new(9, 0));
        drop(src);
    }
}
