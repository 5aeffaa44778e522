//! # Event loop
//!
//! One thread, one poller, every handle. A pass of [`EventLoop::run_once`]:
//!
//! ```text
//!   flush replies ─▶ wait (≤ caller timeout, ≤ next deadline)
//!        ▲                │
//!        │                ▼
//!   free retired ◀─ fire deadlines ◀─ adopt accepted ◀─ dispatch events
//! ```
//!
//! Handles live in a generational [`HandleTable`]. Event tokens are handle
//! ids; an id whose handle was retired earlier in the same batch resolves
//! to nothing, so a late event can never reach a freed slot. Retired
//! handles are dropped only at the end of the pass.
//!
//! Server replies are produced while the connection that owns them is
//! borrowed (inside its own read callback), so they go through the
//! mailbox and are written after the callback returns.
//!
//! The loop and every handle are `!Send`. Only the [`StopHandle`] crosses
//! threads.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::os::fd::OwnedFd;
use std::rc::Rc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use urpc_core::{Error, ErrorCode, HandleId, Result, RpcError};

use crate::acceptor::{Accepted, Acceptor};
use crate::config::LoopConfig;
use crate::handle::{HandleError, HandleTable, IoHandle};
use crate::poller::{Event, Poller};
use crate::protocol::{ProtocolRegistry, ProtocolType};
use crate::service::{Mailbox, ServiceRegistry};
use crate::timer::{Deadline, DeadlineQueue};
use crate::transport::{ConnectTransport, ServerTransport};

// ── Handles ──

/// Everything the loop can poll
pub enum Pollable {
    Acceptor(Acceptor),
    /// Accepted server-side connection
    Passive(ServerTransport),
    /// Client-side connection
    Connect(ConnectTransport),
}

impl Pollable {
    fn handle_mut(&mut self) -> &mut dyn IoHandle {
        match self {
            Pollable::Acceptor(h) => h,
            Pollable::Passive(h) => h,
            Pollable::Connect(h) => h,
        }
    }
}

/// Loop state handed to every callback
///
/// Holds everything a handle may touch besides itself: the poller, the
/// deadline queue and the queues the loop drains between callbacks.
pub struct LoopCore {
    pub(crate) poller: Poller,
    pub(crate) protocols: Rc<ProtocolRegistry>,
    pub(crate) timers: DeadlineQueue,
    pub(crate) mailbox: Mailbox,
    pub(crate) accepted: Vec<Accepted>,
    pub(crate) connections: HashMap<(SocketAddr, ProtocolType), HandleId>,
    pub(crate) config: LoopConfig,
}

/// Asks a running loop to return. Cloneable and `Send`.
#[derive(Debug, Clone, Default)]
pub struct StopHandle(Arc<AtomicBool>);

impl StopHandle {
    pub fn stop(&self) {
        self.0.store(true, Ordering::Release);
    }

    #[inline]
    pub fn is_stopped(&self) -> bool {
        self.0.load(Ordering::Acquire)
    }
}

// ── Loop ──

pub struct EventLoop {
    handles: HandleTable<Pollable>,
    core: LoopCore,
    events: Vec<Event>,
    stop: StopHandle,
}

impl EventLoop {
    /// Loop with environment-derived config and the built-in protocols.
    pub fn new() -> Result<Self> {
        Self::with_config(LoopConfig::default())
    }

    pub fn with_config(config: LoopConfig) -> Result<Self> {
        Self::with_protocols(config, ProtocolRegistry::with_defaults())
    }

    pub fn with_protocols(config: LoopConfig, protocols: ProtocolRegistry) -> Result<Self> {
        let poller = Poller::new(config.max_events).map_err(|e| Error::os("epoll_create1", e))?;
        tracing::debug!(
            max_events = config.max_events,
            read_chunk = config.read_chunk,
            max_frame_size = config.max_frame_size,
            protocols = protocols.len(),
            "event loop created"
        );
        Ok(Self {
            handles: HandleTable::new(),
            events: Vec::with_capacity(config.max_events),
            core: LoopCore {
                poller,
                protocols: Rc::new(protocols),
                timers: DeadlineQueue::new(),
                mailbox: Mailbox::default(),
                accepted: Vec::new(),
                connections: HashMap::new(),
                config,
            },
            stop: StopHandle::default(),
        })
    }

    #[inline]
    pub fn config(&self) -> &LoopConfig {
        &self.core.config
    }

    #[inline]
    pub fn protocols(&self) -> &Rc<ProtocolRegistry> {
        &self.core.protocols
    }

    pub fn stop_handle(&self) -> StopHandle {
        self.stop.clone()
    }

    /// Handles in the table, including ones retiring this pass.
    #[inline]
    pub fn len(&self) -> usize {
        self.handles.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.handles.is_empty()
    }

    /// Calls awaiting a response on client connection `conn`.
    pub fn pending_calls(&self, conn: HandleId) -> Option<usize> {
        match self.handles.get(conn) {
            Some(Pollable::Connect(t)) => Some(t.pending_calls().len()),
            _ => None,
        }
    }

    #[cfg(test)]
    pub(crate) fn core_mut(&mut self) -> &mut LoopCore {
        &mut self.core
    }

    /// A client connection together with the core it needs for issuing.
    pub(crate) fn connect_parts(&mut self, id: HandleId) -> Option<(&mut ConnectTransport, &mut LoopCore)> {
        match self.handles.get_mut(id) {
            Some(Pollable::Connect(t)) => Some((t, &mut self.core)),
            _ => None,
        }
    }

    /// The shared client connection to `remote` speaking `protocol`,
    /// created (unconnected) on first use.
    pub fn connection_for(
        &mut self,
        remote: SocketAddr,
        protocol: ProtocolType,
        connect_timeout: Option<Duration>,
    ) -> Result<HandleId> {
        if let Some(&id) = self.core.connections.get(&(remote, protocol)) {
            if self.handles.contains(id) {
                return Ok(id);
            }
        }
        let proto = self.core.protocols.get(protocol).ok_or_else(|| {
            Error::Rpc(RpcError::new(
                ErrorCode::NOT_SUPPORTED,
                format!("protocol {:?} is not registered", protocol),
            ))
        })?;
        let id = self.handles.insert_with(|id| {
            Pollable::Connect(ConnectTransport::new(id, remote, proto, connect_timeout))
        });
        self.core.connections.insert((remote, protocol), id);
        tracing::debug!(conn = ?id, %remote, ?protocol, "connection created");
        Ok(id)
    }

    /// Install a listening socket and start accepting.
    pub fn add_acceptor(
        &mut self,
        listener: OwnedFd,
        local: SocketAddr,
        services: Rc<ServiceRegistry>,
        nodelay: bool,
    ) -> Result<HandleId> {
        let id = self.handles.insert_with(|id| {
            Pollable::Acceptor(Acceptor::new(id, listener, local, services, nodelay))
        });
        let started = match self.handles.get_mut(id) {
            Some(Pollable::Acceptor(a)) => a.start(&mut self.core),
            _ => Ok(()),
        };
        if let Err(e) = started {
            self.close_handle(id, &RpcError::new(ErrorCode::IO_FAILURE, e.to_string()));
            return Err(e);
        }
        Ok(id)
    }

    /// Server connections accepted under `services`.
    pub(crate) fn passive_ids_for(&self, services: &Rc<ServiceRegistry>) -> Vec<HandleId> {
        self.handles
            .ids()
            .into_iter()
            .filter(|&id| {
                matches!(self.handles.get(id), Some(Pollable::Passive(t)) if Rc::ptr_eq(t.services(), services))
            })
            .collect()
    }

    /// Reset `id` with `err` and drop it now. Outside a pass only.
    pub fn close_handle(&mut self, id: HandleId, err: &RpcError) -> bool {
        let Some(pollable) = self.handles.get_mut(id) else {
            return false;
        };
        pollable.handle_mut().reset(err, &mut self.core);
        self.core.connections.retain(|_, conn| *conn != id);
        self.handles.retire(id);
        drop(self.handles.flush_retired());
        true
    }

    // ── Running ──

    /// One pass: wait up to `timeout` (`None` blocks until an event or
    /// deadline), dispatch, fire deadlines. Returns the number of events.
    pub fn run_once(&mut self, timeout: Option<Duration>) -> Result<usize> {
        self.flush_replies();

        let wait = match (timeout, self.core.timers.next_deadline()) {
            (t, None) => t,
            (t, Some(at)) => {
                let until = at.saturating_duration_since(Instant::now());
                Some(t.map_or(until, |t| t.min(until)))
            }
        };

        let mut events = std::mem::take(&mut self.events);
        let waited = self.core.poller.wait(wait, &mut events);
        let n = match waited {
            Ok(n) => n,
            Err(e) => {
                self.events = events;
                return Err(Error::os("epoll_wait", e));
            }
        };

        let mut fatal = None;
        for ev in &events {
            if let Some(e) = self.dispatch(ev) {
                fatal.get_or_insert(e);
            }
            self.flush_replies();
        }
        self.events = events;

        self.adopt_accepted();
        self.flush_replies();
        self.fire_deadlines();
        drop(self.handles.flush_retired());

        match fatal {
            Some(e) => Err(e),
            None => Ok(n),
        }
    }

    /// Run until [`StopHandle::stop`] is called.
    pub fn run_forever(&mut self) -> Result<()> {
        tracing::info!("event loop running");
        while !self.stop.is_stopped() {
            self.run_once(Some(self.core.config.idle_timeout))?;
        }
        tracing::info!("event loop stopped");
        Ok(())
    }

    /// Run until `done` returns true, the loop is stopped, or `timeout`
    /// elapses. Returns the final value of `done`.
    pub fn run_until(&mut self, timeout: Duration, mut done: impl FnMut() -> bool) -> Result<bool> {
        let deadline = Instant::now() + timeout;
        while !done() {
            let now = Instant::now();
            if now >= deadline || self.stop.is_stopped() {
                return Ok(false);
            }
            let slice = self.core.config.idle_timeout.min(deadline - now);
            self.run_once(Some(slice))?;
        }
        Ok(true)
    }

    // ── Pass steps ──

    fn dispatch(&mut self, ev: &Event) -> Option<Error> {
        let Some(pollable) = self.handles.get_mut(ev.token) else {
            tracing::trace!(token = ?ev.token, "event for retired handle");
            return None;
        };
        let handle = pollable.handle_mut();
        let mut result = Ok(());
        if ev.readable {
            result = handle.on_readable(&mut self.core);
        }
        if result.is_ok() && ev.writable && handle.source().is_open() {
            result = handle.on_writable(&mut self.core);
        }
        match result {
            Ok(()) => None,
            Err(HandleError::Reset(e)) => {
                self.fail_handle(ev.token, &e);
                None
            }
            Err(HandleError::Fatal(e)) => {
                self.fail_handle(ev.token, &RpcError::new(ErrorCode::IO_FAILURE, e.to_string()));
                Some(e)
            }
        }
    }

    /// Reset a handle after a callback failed. Server connections and
    /// acceptors are retired; client connections stay for reconnecting.
    fn fail_handle(&mut self, id: HandleId, err: &RpcError) {
        let Some(pollable) = self.handles.get_mut(id) else {
            return;
        };
        let handle = pollable.handle_mut();
        handle.reset(err, &mut self.core);
        if !handle.survives_reset() {
            self.handles.retire(id);
        }
    }

    /// Write every reply the handlers produced.
    fn flush_replies(&mut self) {
        loop {
            let Some(reply) = self.core.mailbox.borrow_mut().pop_front() else {
                return;
            };
            let Some(Pollable::Passive(conn)) = self.handles.get_mut(reply.conn) else {
                tracing::debug!(conn = ?reply.conn, id = %reply.correlation_id, "reply for closed connection dropped");
                continue;
            };
            let written = match reply.frame {
                Ok(frame) => conn.start_write(reply.correlation_id, frame, &mut self.core),
                Err(e) => {
                    // The protocol cannot express this outcome; the peer
                    // would wait forever for a reply.
                    tracing::warn!(conn = ?reply.conn, id = %reply.correlation_id, error = %e, "reply not encodable");
                    Err(e)
                }
            };
            if let Err(e) = written {
                self.fail_handle(reply.conn, &e);
            }
        }
    }

    fn adopt_accepted(&mut self) {
        for accepted in std::mem::take(&mut self.core.accepted) {
            let Accepted { fd, peer, services } = accepted;
            let id = self
                .handles
                .insert_with(|id| Pollable::Passive(ServerTransport::new(id, fd, peer, services)));
            let started = match self.handles.get_mut(id) {
                Some(Pollable::Passive(t)) => t.start_read(&mut self.core),
                _ => Ok(()),
            };
            if let Err(e) = started {
                self.fail_handle(id, &e);
            }
        }
    }

    fn fire_deadlines(&mut self) {
        for deadline in self.core.timers.poll_expired(Instant::now()) {
            match deadline {
                Deadline::Call { conn, id } => {
                    if let Some(Pollable::Connect(t)) = self.handles.get_mut(conn) {
                        t.on_call_timeout(id, &mut self.core);
                    }
                }
                Deadline::Connect { conn, attempt } => {
                    if let Some(Pollable::Connect(t)) = self.handles.get_mut(conn) {
                        t.on_connect_timeout(attempt, &mut self.core);
                    }
                }
            }
        }
    }
}

impl Drop for EventLoop {
    fn drop(&mut self) {
        let err = RpcError::shutdown();
        for id in self.handles.ids() {
            if let Some(pollable) = self.handles.get_mut(id) {
                pollable.handle_mut().reset(&err, &mut self.core);
            }
            self.handles.retire(id);
        }
        self.core.mailbox.borrow_mut().clear();
        self.core.accepted.clear();
        drop(self.handles.flush_retired());
        tracing::debug!("event loop dropped");
    }
}

impl std::fmt::Debug for EventLoop {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventLoop")
            .field("handles", &self.handles.len())
            .field("timers", &self.core.timers.len())
            .field("stopped", &self.stop.is_stopped())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::socket;
    use std::io::{Read, Write};
    use std::net::TcpStream;
    use std::os::fd::AsFd;

    fn listen(ev: &mut EventLoop, services: Rc<ServiceRegistry>) -> (HandleId, SocketAddr) {
        let addr: SocketAddr = "127.0.0.1:0".parse().unwrap();
        let fd = socket::tcp_listener(&addr, 16, false).unwrap();
        let local = socket::local_addr(fd.as_fd()).unwrap();
        let id = ev.add_acceptor(fd, local, services, true).unwrap();
        (id, local)
    }

    #[test]
    fn test_idle_pass_times_out() {
        let mut ev = EventLoop::new().unwrap();
        let start = Instant::now();
        assert_eq!(ev.run_once(Some(Duration::from_millis(5))).unwrap(), 0);
        assert!(start.elapsed() >= Duration::from_millis(5));
    }

    #[test]
    fn test_echo_over_tcp() {
        let mut ev = EventLoop::new().unwrap();
        let (_, local) = listen(&mut ev, Rc::new(ServiceRegistry::new()));

        let mut client = TcpStream::connect(local).unwrap();
        client.write_all(b"ECHO\x02\x00\x00\x00hi").unwrap();
        client.set_read_timeout(Some(Duration::from_secs(5))).unwrap();

        // The reader gets a clone; `client` stays open until the end.
        let mut reader = client.try_clone().unwrap();
        let reply = std::thread::spawn(move || {
            let mut got = [0u8; 10];
            reader.read_exact(&mut got).unwrap();
            got
        });
        let ok = ev
            .run_until(Duration::from_secs(5), || reply.is_finished())
            .unwrap();
        assert!(ok);
        assert_eq!(&reply.join().unwrap(), b"ECHO\x02\x00\x00\x00hi");
        // Acceptor plus one server connection.
        assert_eq!(ev.len(), 2);
        drop(client);
    }

    #[test]
    fn test_peer_close_retires_server_connection() {
        let mut ev = EventLoop::new().unwrap();
        let services = Rc::new(ServiceRegistry::new());
        let (_, local) = listen(&mut ev, Rc::clone(&services));

        let client = TcpStream::connect(local).unwrap();
        let mut accepted = false;
        for _ in 0..100 {
            ev.run_once(Some(Duration::from_millis(10))).unwrap();
            if ev.passive_ids_for(&services).len() == 1 {
                accepted = true;
                break;
            }
        }
        assert!(accepted);

        drop(client);
        let mut retired = false;
        for _ in 0..100 {
            ev.run_once(Some(Duration::from_millis(10))).unwrap();
            if ev.passive_ids_for(&services).is_empty() {
                retired = true;
                break;
            }
        }
        assert!(retired);
        assert_eq!(ev.len(), 1);
    }

    #[test]
    fn test_stop_handle_ends_run_forever() {
        let mut ev = EventLoop::with_config(LoopConfig::new().idle_timeout(Duration::from_millis(1))).unwrap();
        let stop = ev.stop_handle();
        let t = std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(20));
            stop.stop();
        });
        ev.run_forever().unwrap();
        t.join().unwrap();
    }

    #[test]
    fn test_connection_for_is_shared_per_protocol() {
        let mut ev = EventLoop::new().unwrap();
        let remote: SocketAddr = "127.0.0.1:9".parse().unwrap();
        let a = ev.connection_for(remote, ProtocolType::Urpc, None).unwrap();
        let b = ev.connection_for(remote, ProtocolType::Urpc, None).unwrap();
        let c = ev.connection_for(remote, ProtocolType::Echo, None).unwrap();
        assert_eq!(a, b);
        assert_ne!(a, c);
        assert_eq!(ev.pending_calls(a), Some(0));

        assert!(ev.close_handle(a, &RpcError::shutdown()));
        assert!(ev.pending_calls(a).is_none());
        let d = ev.connection_for(remote, ProtocolType::Urpc, None).unwrap();
        assert_ne!(a, d);
    }

    #[test]
    fn test_unregistered_protocol_is_rejected() {
        let mut ev = EventLoop::with_protocols(LoopConfig::new(), ProtocolRegistry::new()).unwrap();
        let remote: SocketAddr = "127.0.0.1:9".parse().unwrap();
        assert!(ev.connection_for(remote, ProtocolType::Urpc, None).is_err());
    }
}
