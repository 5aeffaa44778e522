//! Transports: duplex byte pipes over one descriptor
//!
//! ```text
//!            on_readable                          start_write(owner, bytes)
//!   fd ──read──▶ read_buf ──▶ hooks.on_read      ──▶ in flight? ──no──▶ write_buf ──write──▶ fd
//!                                                        │yes
//!                                                        ▼
//!                                                 pending (FIFO) ──on drain──▶ write_buf
//! ```
//!
//! At most one write is in flight. Queued writes drain in issue order, and
//! each owner hears exactly once: `on_write_done` when its bytes are fully
//! written, or `on_write_failed` when the transport resets first.
//!
//! The base [`Transport`] is specialised by its hooks: the server side
//! ([`ServerTransport`]) parses requests and serves them, the client side
//! ([`ConnectTransport`]) connects on demand and matches responses to
//! pending calls.

pub mod connect;
pub mod server;

use std::collections::VecDeque;
use std::os::fd::OwnedFd;

use nix::errno::Errno;
use urpc_core::{CorrelationId, ErrorCode, HandleId, RpcError};

use crate::event_loop::LoopCore;
use crate::iobuf::ByteStream;
use crate::poller::IoSource;

pub use connect::{ConnState, ConnectError, ConnectProgress, ConnectTransport, PendingCall, PendingCalls};
pub use server::ServerTransport;

/// Callbacks that give a transport its meaning
pub trait TransportHooks {
    /// Inbound bytes arrived. Consume whole frames from `buf`; leave
    /// partial ones. An error resets the transport.
    fn on_read(
        &mut self,
        conn: HandleId,
        buf: &mut ByteStream,
        core: &mut LoopCore,
    ) -> Result<(), RpcError>;

    /// `owner`'s bytes are fully written.
    fn on_write_done(&mut self, _owner: CorrelationId, _core: &mut LoopCore) {}

    /// `owner`'s bytes will never be written.
    fn on_write_failed(&mut self, _owner: CorrelationId, _err: &RpcError, _core: &mut LoopCore) {}

    /// The transport was reset; runs after every write owner was failed.
    fn on_reset(&mut self, _err: &RpcError, _core: &mut LoopCore) {}
}

pub struct Transport<H> {
    source: IoSource,
    read_buf: ByteStream,
    write_buf: ByteStream,
    current: Option<CorrelationId>,
    pending: VecDeque<(CorrelationId, ByteStream)>,
    hooks: H,
}

impl<H: TransportHooks> Transport<H> {
    pub fn new(id: HandleId, fd: Option<OwnedFd>, hooks: H) -> Self {
        Self {
            source: IoSource::new(id, fd),
            read_buf: ByteStream::new(),
            write_buf: ByteStream::new(),
            current: None,
            pending: VecDeque::new(),
            hooks,
        }
    }

    #[inline]
    pub fn id(&self) -> HandleId {
        self.source.token()
    }

    #[inline]
    pub fn source(&self) -> &IoSource {
        &self.source
    }

    #[inline]
    pub(crate) fn source_mut(&mut self) -> &mut IoSource {
        &mut self.source
    }

    #[inline]
    pub fn is_open(&self) -> bool {
        self.source.is_open()
    }

    #[inline]
    pub fn hooks(&self) -> &H {
        &self.hooks
    }

    #[inline]
    pub fn hooks_mut(&mut self) -> &mut H {
        &mut self.hooks
    }

    /// Writes not yet fully drained, the in-flight one included.
    pub fn queued_writes(&self) -> usize {
        self.pending.len() + usize::from(self.current.is_some())
    }

    /// Register for read readiness. Idempotent.
    pub fn start_read(&mut self, core: &mut LoopCore) -> Result<(), RpcError> {
        core.poller
            .register_read(&mut self.source)
            .map_err(|e| RpcError::io("epoll_ctl", e))
    }

    /// Queue `buf` without touching the descriptor. Returns true if it
    /// became the in-flight write.
    pub fn enqueue_write(&mut self, owner: CorrelationId, buf: ByteStream) -> bool {
        debug_assert!(!buf.is_empty(), "empty write for {:?}", owner);
        if self.current.is_none() {
            self.current = Some(owner);
            self.write_buf = buf;
            true
        } else {
            self.pending.push_back((owner, buf));
            false
        }
    }

    /// Queue `buf` and, if nothing else is in flight, start writing it now.
    pub fn start_write(
        &mut self,
        owner: CorrelationId,
        buf: ByteStream,
        core: &mut LoopCore,
    ) -> Result<(), RpcError> {
        if !self.is_open() {
            return Err(RpcError::new(ErrorCode::SHUTDOWN, "write on a closed transport"));
        }
        if self.enqueue_write(owner, buf) {
            self.on_writable(core)?;
        }
        Ok(())
    }

    /// Drain the descriptor, feeding each chunk to the hooks.
    pub fn on_readable(&mut self, core: &mut LoopCore) -> Result<(), RpcError> {
        let chunk = core.config.read_chunk;
        loop {
            let Some(fd) = self.source.fd() else {
                return Ok(());
            };
            match self.read_buf.append_from(fd, chunk) {
                Ok(0) => return Err(RpcError::peer_closed()),
                Ok(n) => {
                    tracing::trace!(conn = ?self.source.token(), bytes = n, "read");
                    let conn = self.source.token();
                    self.hooks.on_read(conn, &mut self.read_buf, core)?;
                }
                Err(Errno::EINTR) => continue,
                Err(Errno::EAGAIN) => return Ok(()),
                Err(e) => return Err(RpcError::io("read", e)),
            }
        }
    }

    /// Drain the in-flight write, then each queued one, until the queue is
    /// empty or the descriptor would block.
    pub fn on_writable(&mut self, core: &mut LoopCore) -> Result<(), RpcError> {
        loop {
            let Some(owner) = self.current else {
                return Ok(());
            };
            if self.write_buf.is_empty() {
                self.current = None;
                self.hooks.on_write_done(owner, core);
                if let Some((next, buf)) = self.pending.pop_front() {
                    self.current = Some(next);
                    self.write_buf = buf;
                }
                continue;
            }
            let Some(fd) = self.source.fd() else {
                return Ok(());
            };
            match self.write_buf.drain_to(fd) {
                Ok(n) if n > 0 => continue,
                Err(Errno::EINTR) => continue,
                Ok(_) | Err(Errno::EAGAIN) => {
                    return core
                        .poller
                        .register_write(&mut self.source)
                        .map_err(|e| RpcError::io("epoll_ctl", e));
                }
                Err(e) => return Err(RpcError::io("write", e)),
            }
        }
    }

    /// Fail every write owner with `err`, then unregister and close.
    /// Returns false if the transport was already closed.
    pub fn reset(&mut self, err: &RpcError, core: &mut LoopCore) -> bool {
        if !self.source.is_open() {
            return false;
        }
        tracing::debug!(conn = ?self.source.token(), error = %err, "transport reset");
        self.read_buf.clear();
        self.write_buf.clear();
        if let Some(owner) = self.current.take() {
            self.hooks.on_write_failed(owner, err, core);
        }
        for (owner, _) in std::mem::take(&mut self.pending) {
            self.hooks.on_write_failed(owner, err, core);
        }
        self.source.close(&core.poller);
        self.hooks.on_reset(err, core);
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event_loop::EventLoop;
    use std::io::{Read, Write};
    use std::os::unix::net::UnixStream;

    /// Hooks that record what happened, in order.
    #[derive(Default)]
    struct Recorder {
        reads: Vec<u8>,
        done: Vec<u64>,
        failed: Vec<(u64, ErrorCode)>,
        resets: usize,
    }

    impl TransportHooks for Recorder {
        fn on_read(&mut self, _conn: HandleId, buf: &mut ByteStream, _core: &mut LoopCore) -> Result<(), RpcError> {
            let n = buf.len();
            self.reads.extend_from_slice(buf.peek(n));
            buf.consume(n);
            Ok(())
        }

        fn on_write_done(&mut self, owner: CorrelationId, _core: &mut LoopCore) {
            self.done.push(owner.as_u64());
        }

        fn on_write_failed(&mut self, owner: CorrelationId, err: &RpcError, _core: &mut LoopCore) {
            self.failed.push((owner.as_u64(), err.code));
        }

        fn on_reset(&mut self, _err: &RpcError, _core: &mut LoopCore) {
            self.resets += 1;
        }
    }

    fn pair() -> (Transport<Recorder>, UnixStream) {
        let (a, b) = UnixStream::pair().unwrap();
        a.set_nonblocking(true).unwrap();
        let t = Transport::new(HandleId::new(0, 0), Some(OwnedFd::from(a)), Recorder::default());
        (t, b)
    }

    fn id(n: u64) -> CorrelationId {
        CorrelationId::new(n)
    }

    #[test]
    fn test_writes_complete_in_issue_order() {
        let mut ev = EventLoop::new().unwrap();
        let core = ev.core_mut();
        let (mut t, mut peer) = pair();

        for n in 1..=5u64 {
            t.enqueue_write(id(n), ByteStream::from(vec![n as u8; 3]));
        }
        assert_eq!(t.queued_writes(), 5);
        t.on_writable(core).unwrap();
        assert_eq!(t.hooks().done, vec![1, 2, 3, 4, 5]);
        assert_eq!(t.queued_writes(), 0);

        let mut got = [0u8; 15];
        peer.read_exact(&mut got).unwrap();
        assert_eq!(&got[..6], &[1, 1, 1, 2, 2, 2]);
        assert_eq!(got[14], 5);
        t.reset(&RpcError::shutdown(), core);
    }

    #[test]
    fn test_backpressure_registers_for_write() {
        let mut ev = EventLoop::new().unwrap();
        let core = ev.core_mut();
        let (mut t, mut peer) = pair();

        // Far more than a socket buffer holds.
        let big = vec![7u8; 4 << 20];
        t.start_write(id(1), ByteStream::from(big.clone()), core).unwrap();
        t.start_write(id(2), ByteStream::from(&b"tail"[..]), core).unwrap();
        assert!(t.hooks().done.is_empty());
        assert!(t.source().interest().contains(crate::poller::Interest::WRITE));

        let reader = std::thread::spawn(move || {
            let mut all = Vec::new();
            peer.read_to_end(&mut all).unwrap();
            all
        });
        while t.queued_writes() > 0 {
            t.on_writable(core).unwrap();
            std::thread::yield_now();
        }
        assert_eq!(t.hooks().done, vec![1, 2]);
        t.reset(&RpcError::shutdown(), core);

        let all = reader.join().unwrap();
        assert_eq!(all.len(), big.len() + 4);
        assert_eq!(&all[big.len()..], b"tail");
    }

    #[test]
    fn test_reset_is_idempotent() {
        let mut ev = EventLoop::new().unwrap();
        let core = ev.core_mut();
        let (mut t, _peer) = pair();

        t.enqueue_write(id(1), ByteStream::from(&b"a"[..]));
        t.enqueue_write(id(2), ByteStream::from(&b"b"[..]));
        t.enqueue_write(id(3), ByteStream::from(&b"c"[..]));

        let err = RpcError::new(ErrorCode::IO_FAILURE, "boom");
        assert!(t.reset(&err, core));
        assert!(!t.reset(&err, core));

        let failed: Vec<u64> = t.hooks().failed.iter().map(|(o, _)| *o).collect();
        assert_eq!(failed, vec![1, 2, 3]);
        assert!(t.hooks().failed.iter().all(|(_, c)| *c == ErrorCode::IO_FAILURE));
        assert_eq!(t.hooks().resets, 1);
        assert!(!t.is_open());
        assert_eq!(
            t.start_write(id(4), ByteStream::from(&b"d"[..]), core).unwrap_err().code,
            ErrorCode::SHUTDOWN
        );
    }

    #[test]
    fn test_read_until_would_block_then_peer_close() {
        let mut ev = EventLoop::new().unwrap();
        let core = ev.core_mut();
        let (mut t, mut peer) = pair();

        peer.write_all(b"hello ").unwrap();
        peer.write_all(b"world").unwrap();
        t.on_readable(core).unwrap();
        assert_eq!(t.hooks().reads, b"hello world");

        drop(peer);
        let err = t.on_readable(core).unwrap_err();
        assert_eq!(err.code, ErrorCode::PEER_CLOSED);
        t.reset(&err, core);
    }
}
