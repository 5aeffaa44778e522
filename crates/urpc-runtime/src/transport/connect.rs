//! Client side of a connection
//!
//! A `ConnectTransport` owns the route to one remote address. It connects
//! lazily on the first write and reconnects on the first write after a
//! reset, so it stays in the handle table across resets.
//!
//! ```text
//!   Idle ──connect_if_needed──▶ Connecting ──first writable, SO_ERROR == 0──▶ Connected
//!    ▲                             │                                            │
//!    └──────────── reset (I/O error, peer close, connect timeout) ◀─────────────┘
//! ```
//!
//! Writes issued while connecting are queued and drain once the connect
//! completes. Calls wait in [`PendingCalls`] keyed by correlation id until
//! their response arrives, their deadline passes, or the transport resets.

use std::collections::{BTreeMap, BTreeSet, VecDeque};
use std::net::SocketAddr;
use std::os::fd::AsFd;
use std::rc::Rc;
use std::time::{Duration, Instant};

use urpc_core::{CorrelationId, ErrorCode, HandleId, RpcError};

use super::{Transport, TransportHooks};
use crate::event_loop::LoopCore;
use crate::handle::{HandleResult, IoHandle};
use crate::iobuf::ByteStream;
use crate::poller::IoSource;
use crate::protocol::{Parsed, Protocol};
use crate::socket::{self, ConnectStatus};
use crate::timer::{Deadline, DeadlineQueue, TimerId};

/// Late responses remembered per connection after their call timed out
const EXPIRED_MEMORY: usize = 1024;

// ── Pending calls ──

/// Completion of one client call: the encoded response body or the error.
pub type Completion = Box<dyn FnOnce(Result<Vec<u8>, RpcError>)>;

pub struct PendingCall {
    complete: Completion,
    timer: Option<TimerId>,
}

impl PendingCall {
    pub fn new(complete: Completion, timer: Option<TimerId>) -> Self {
        Self { complete, timer }
    }

    /// Complete the call, disarming its deadline.
    pub fn finish(self, result: Result<Vec<u8>, RpcError>, timers: &mut DeadlineQueue) {
        if let Some(timer) = self.timer {
            timers.cancel(timer);
        }
        (self.complete)(result);
    }

    /// Complete the call from its own (already fired) deadline.
    fn expire(self, err: RpcError) {
        (self.complete)(Err(err));
    }
}

/// Result of matching a response to the pending table
pub enum Lookup {
    Found(PendingCall),
    /// The call already failed with `TIMEOUT`; drop the response
    Expired,
    /// Never issued or already resolved
    Unknown,
}

/// Client calls awaiting responses on one transport
pub struct PendingCalls {
    calls: BTreeMap<CorrelationId, PendingCall>,
    next_id: CorrelationId,
    expired: BTreeSet<CorrelationId>,
    expired_order: VecDeque<CorrelationId>,
}

impl Default for PendingCalls {
    fn default() -> Self {
        Self::new()
    }
}

impl PendingCalls {
    pub fn new() -> Self {
        Self {
            calls: BTreeMap::new(),
            next_id: CorrelationId::FIRST,
            expired: BTreeSet::new(),
            expired_order: VecDeque::new(),
        }
    }

    /// Next correlation id; strictly increasing, never reused.
    pub fn allocate_id(&mut self) -> CorrelationId {
        let id = self.next_id;
        self.next_id = id.next();
        id
    }

    pub fn insert(&mut self, id: CorrelationId, call: PendingCall) {
        let prev = self.calls.insert(id, call);
        debug_assert!(prev.is_none(), "correlation id {} reused", id);
    }

    /// Remove a live call, if any.
    pub fn remove(&mut self, id: CorrelationId) -> Option<PendingCall> {
        self.calls.remove(&id)
    }

    /// Match a response carrying `id`.
    pub fn take(&mut self, id: CorrelationId) -> Lookup {
        if let Some(call) = self.calls.remove(&id) {
            return Lookup::Found(call);
        }
        if self.expired.remove(&id) {
            return Lookup::Expired;
        }
        Lookup::Unknown
    }

    /// Match a response that carries no id: it answers the oldest call
    /// still owed one, timed-out calls included.
    pub fn take_oldest(&mut self) -> Lookup {
        let live = self.calls.keys().next().copied();
        let expired = self.expired.first().copied();
        match (live, expired) {
            (_, Some(e)) if live.map_or(true, |l| e < l) => {
                self.expired.remove(&e);
                Lookup::Expired
            }
            (Some(l), _) => match self.calls.remove(&l) {
                Some(call) => Lookup::Found(call),
                None => Lookup::Unknown,
            },
            _ => Lookup::Unknown,
        }
    }

    /// Remove a call whose deadline passed, remembering its id so a late
    /// response is recognised and dropped.
    pub fn expire(&mut self, id: CorrelationId) -> Option<PendingCall> {
        let call = self.calls.remove(&id)?;
        self.expired.insert(id);
        self.expired_order.push_back(id);
        if self.expired_order.len() > EXPIRED_MEMORY {
            if let Some(old) = self.expired_order.pop_front() {
                self.expired.remove(&old);
            }
        }
        Some(call)
    }

    /// Remove every live call; forget expired ids (their responses can no
    /// longer arrive).
    pub fn drain(&mut self) -> Vec<PendingCall> {
        self.expired.clear();
        self.expired_order.clear();
        std::mem::take(&mut self.calls).into_values().collect()
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.calls.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.calls.is_empty()
    }

    #[inline]
    pub fn contains(&self, id: CorrelationId) -> bool {
        self.calls.contains_key(&id)
    }
}

// ── Hooks ──

pub struct ClientHooks {
    protocol: Rc<dyn Protocol>,
    calls: PendingCalls,
}

impl TransportHooks for ClientHooks {
    fn on_read(
        &mut self,
        conn: HandleId,
        buf: &mut ByteStream,
        core: &mut LoopCore,
    ) -> Result<(), RpcError> {
        let max_frame = core.config.max_frame_size;
        loop {
            let frame = match self.protocol.parse_response(buf, max_frame) {
                Parsed::Ok(frame) => frame,
                Parsed::TooSmall => return Ok(()),
                Parsed::Error(e) => return Err(e),
                Parsed::Mismatch => {
                    return Err(RpcError::new(
                        ErrorCode::NOT_SUPPORTED,
                        format!(
                            "expected a {} response, got header {:?}",
                            self.protocol.name(),
                            String::from_utf8_lossy(buf.peek(4))
                        ),
                    ))
                }
            };
            let lookup = match frame.correlation_id {
                Some(id) => self.calls.take(id),
                None => self.calls.take_oldest(),
            };
            match lookup {
                Lookup::Found(call) => {
                    tracing::trace!(?conn, id = ?frame.correlation_id, "response");
                    call.finish(frame.result, &mut core.timers);
                }
                Lookup::Expired => {
                    tracing::debug!(?conn, id = ?frame.correlation_id, "late response for timed-out call dropped");
                }
                Lookup::Unknown => {
                    tracing::warn!(?conn, id = ?frame.correlation_id, "response for unknown call");
                    return Err(RpcError::new(
                        ErrorCode::CORRELATION_MISMATCH,
                        format!("response for unknown call {:?}", frame.correlation_id),
                    ));
                }
            }
        }
    }

    fn on_write_failed(&mut self, owner: CorrelationId, err: &RpcError, core: &mut LoopCore) {
        if let Some(call) = self.calls.remove(owner) {
            call.finish(Err(err.clone()), &mut core.timers);
        }
    }

    fn on_reset(&mut self, err: &RpcError, core: &mut LoopCore) {
        for call in self.calls.drain() {
            call.finish(Err(err.clone()), &mut core.timers);
        }
    }
}

// ── Transport ──

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnState {
    Idle,
    Connecting,
    Connected,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectProgress {
    Connected,
    Connecting,
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ConnectError {
    #[error("connect already in progress")]
    AlreadyConnecting,
    #[error(transparent)]
    Failed(#[from] RpcError),
}

pub struct ConnectTransport {
    remote: SocketAddr,
    state: ConnState,
    attempt: u64,
    connect_timeout: Option<Duration>,
    connect_timer: Option<TimerId>,
    inner: Transport<ClientHooks>,
}

impl ConnectTransport {
    pub fn new(
        id: HandleId,
        remote: SocketAddr,
        protocol: Rc<dyn Protocol>,
        connect_timeout: Option<Duration>,
    ) -> Self {
        let hooks = ClientHooks {
            protocol,
            calls: PendingCalls::new(),
        };
        Self {
            remote,
            state: ConnState::Idle,
            attempt: 0,
            connect_timeout,
            connect_timer: None,
            inner: Transport::new(id, None, hooks),
        }
    }

    #[inline]
    pub fn id(&self) -> HandleId {
        self.inner.id()
    }

    #[inline]
    pub fn remote(&self) -> SocketAddr {
        self.remote
    }

    #[inline]
    pub fn state(&self) -> ConnState {
        self.state
    }

    #[inline]
    pub fn protocol(&self) -> &Rc<dyn Protocol> {
        &self.inner.hooks().protocol
    }

    #[inline]
    pub fn pending_calls(&self) -> &PendingCalls {
        &self.inner.hooks().calls
    }

    pub fn allocate_id(&mut self) -> CorrelationId {
        self.inner.hooks_mut().calls.allocate_id()
    }

    /// Make sure a connection exists or is being made.
    pub fn connect_if_needed(&mut self, core: &mut LoopCore) -> Result<ConnectProgress, ConnectError> {
        match self.state {
            ConnState::Connected => return Ok(ConnectProgress::Connected),
            ConnState::Connecting => return Err(ConnectError::AlreadyConnecting),
            ConnState::Idle => {}
        }

        let fd = socket::tcp_socket(&self.remote).map_err(|e| RpcError::io("socket", e))?;
        if let Err(e) = socket::set_nodelay(fd.as_fd(), true) {
            tracing::debug!(remote = %self.remote, error = %e, "TCP_NODELAY not set");
        }
        let status = socket::connect(fd.as_fd(), &self.remote).map_err(|e| RpcError::io("connect", e))?;
        self.inner.source_mut().attach(fd);
        self.attempt += 1;

        match status {
            ConnectStatus::Connected => {
                tracing::debug!(conn = ?self.id(), remote = %self.remote, "connected");
                self.state = ConnState::Connected;
                if let Err(e) = self.inner.start_read(core) {
                    self.reset(&e, core);
                    return Err(e.into());
                }
                Ok(ConnectProgress::Connected)
            }
            ConnectStatus::InProgress => {
                tracing::debug!(conn = ?self.id(), remote = %self.remote, attempt = self.attempt, "connecting");
                self.state = ConnState::Connecting;
                if let Err(e) = core.poller.register_write(self.inner.source_mut()) {
                    let e = RpcError::io("epoll_ctl", e);
                    self.reset(&e, core);
                    return Err(e.into());
                }
                if let Some(timeout) = self.connect_timeout {
                    self.connect_timer = Some(core.timers.insert(
                        Instant::now() + timeout,
                        Deadline::Connect {
                            conn: self.id(),
                            attempt: self.attempt,
                        },
                    ));
                }
                Ok(ConnectProgress::Connecting)
            }
        }
    }

    /// Register `call` and send its request, connecting first if needed.
    /// Failures reach the call's completion, never the caller.
    pub fn issue(
        &mut self,
        id: CorrelationId,
        request: ByteStream,
        call: PendingCall,
        core: &mut LoopCore,
    ) {
        let connected = match self.connect_if_needed(core) {
            Ok(ConnectProgress::Connected) => true,
            Ok(ConnectProgress::Connecting) | Err(ConnectError::AlreadyConnecting) => false,
            Err(ConnectError::Failed(e)) => {
                tracing::debug!(remote = %self.remote, error = %e, "connect failed");
                call.finish(Err(e), &mut core.timers);
                return;
            }
        };
        self.inner.hooks_mut().calls.insert(id, call);
        if connected {
            if let Err(e) = self.inner.start_write(id, request, core) {
                self.reset(&e, core);
            }
        } else {
            self.inner.enqueue_write(id, request);
        }
    }

    /// Complete a pending connect once the socket reports ready.
    fn finish_connect(&mut self, core: &mut LoopCore) -> Result<(), RpcError> {
        if self.state != ConnState::Connecting {
            return Ok(());
        }
        let Some(fd) = self.inner.source().fd() else {
            return Ok(());
        };
        match socket::take_error(fd) {
            Ok(None) => {}
            Ok(Some(e)) | Err(e) => return Err(RpcError::io("connect", e)),
        }
        self.state = ConnState::Connected;
        if let Some(timer) = self.connect_timer.take() {
            core.timers.cancel(timer);
        }
        tracing::debug!(conn = ?self.id(), remote = %self.remote, "connected");
        self.inner.start_read(core)?;
        // Requests queued while connecting.
        self.inner.on_writable(core)
    }

    /// A connect deadline fired. Stale attempts are ignored.
    pub fn on_connect_timeout(&mut self, attempt: u64, core: &mut LoopCore) {
        if self.state != ConnState::Connecting || attempt != self.attempt {
            return;
        }
        self.connect_timer = None;
        let timeout_ms = self.connect_timeout.map_or(0, |d| d.as_millis());
        let err = RpcError::new(
            ErrorCode::CONNECT_TIMEOUT,
            format!("connect to {} timed out after {}ms", self.remote, timeout_ms),
        );
        self.reset(&err, core);
    }

    /// A call deadline fired. Fails only that call.
    pub fn on_call_timeout(&mut self, id: CorrelationId, _core: &mut LoopCore) {
        if let Some(call) = self.inner.hooks_mut().calls.expire(id) {
            tracing::debug!(conn = ?self.id(), %id, "call timed out");
            call.expire(RpcError::new(ErrorCode::TIMEOUT, format!("call {} timed out", id)));
        }
    }

    pub fn reset(&mut self, err: &RpcError, core: &mut LoopCore) -> bool {
        if let Some(timer) = self.connect_timer.take() {
            core.timers.cancel(timer);
        }
        self.state = ConnState::Idle;
        self.inner.reset(err, core)
    }
}

impl IoHandle for ConnectTransport {
    fn source(&self) -> &IoSource {
        self.inner.source()
    }

    fn on_readable(&mut self, core: &mut LoopCore) -> HandleResult {
        self.finish_connect(core)?;
        Ok(self.inner.on_readable(core)?)
    }

    fn on_writable(&mut self, core: &mut LoopCore) -> HandleResult {
        self.finish_connect(core)?;
        Ok(self.inner.on_writable(core)?)
    }

    fn reset(&mut self, err: &RpcError, core: &mut LoopCore) {
        ConnectTransport::reset(self, err, core);
    }

    fn survives_reset(&self) -> bool {
        true
    }
}
