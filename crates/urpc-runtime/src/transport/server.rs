//! Server side of a connection
//!
//! Created by the acceptor for each accepted socket, already connected.
//! Inbound bytes go through the connection's protocol [`Detector`]; every
//! complete request is served with a [`ServerDone`] that routes the reply
//! back to this connection through the event loop's mailbox.

use std::net::SocketAddr;
use std::os::fd::OwnedFd;
use std::rc::Rc;

use urpc_core::{Controller, CorrelationId, ErrorCode, HandleId, RpcError};

use super::{Transport, TransportHooks};
use crate::event_loop::LoopCore;
use crate::handle::{HandleResult, IoHandle};
use crate::iobuf::ByteStream;
use crate::poller::IoSource;
use crate::protocol::{Detector, Parsed};
use crate::service::{ServerDone, ServiceRegistry};

pub struct ServerHooks {
    services: Rc<ServiceRegistry>,
    detector: Detector,
    peer: Option<SocketAddr>,
    served: u64,
}

impl TransportHooks for ServerHooks {
    fn on_read(
        &mut self,
        conn: HandleId,
        buf: &mut ByteStream,
        core: &mut LoopCore,
    ) -> Result<(), RpcError> {
        let max_frame = core.config.max_frame_size;
        loop {
            let (proto, frame) = match self.detector.parse_request(&core.protocols, buf, max_frame) {
                Parsed::Ok(parsed) => parsed,
                Parsed::TooSmall => return Ok(()),
                Parsed::Error(e) => return Err(e),
                Parsed::Mismatch => {
                    return Err(RpcError::new(ErrorCode::NOT_SUPPORTED, "protocol mismatch"))
                }
            };
            tracing::trace!(
                ?conn,
                protocol = proto.name(),
                id = %frame.correlation_id,
                service = %frame.service,
                method = %frame.method,
                "request"
            );
            self.served += 1;

            let mut cntl = Controller::new();
            cntl.set_log_id(frame.log_id);
            if let Some(peer) = self.peer {
                cntl.set_remote_side(peer);
            }
            let done = ServerDone::new(
                conn,
                frame.correlation_id,
                Rc::clone(&proto),
                Rc::clone(&core.mailbox),
            );
            proto.serve(frame, &self.services, cntl, done);
        }
    }

    fn on_write_failed(&mut self, owner: CorrelationId, err: &RpcError, _core: &mut LoopCore) {
        tracing::debug!(id = %owner, error = %err, "reply not delivered");
    }
}

pub struct ServerTransport {
    inner: Transport<ServerHooks>,
}

impl ServerTransport {
    pub fn new(
        id: HandleId,
        fd: OwnedFd,
        peer: Option<SocketAddr>,
        services: Rc<ServiceRegistry>,
    ) -> Self {
        let hooks = ServerHooks {
            services,
            detector: Detector::new(),
            peer,
            served: 0,
        };
        Self {
            inner: Transport::new(id, Some(fd), hooks),
        }
    }

    #[inline]
    pub fn id(&self) -> HandleId {
        self.inner.id()
    }

    #[inline]
    pub fn peer(&self) -> Option<SocketAddr> {
        self.inner.hooks().peer
    }

    #[inline]
    pub fn services(&self) -> &Rc<ServiceRegistry> {
        &self.inner.hooks().services
    }

    /// Requests parsed on this connection.
    #[inline]
    pub fn served(&self) -> u64 {
        self.inner.hooks().served
    }

    #[inline]
    pub fn detector(&self) -> &Detector {
        &self.inner.hooks().detector
    }

    pub fn start_read(&mut self, core: &mut LoopCore) -> Result<(), RpcError> {
        self.inner.start_read(core)
    }

    pub fn start_write(
        &mut self,
        owner: CorrelationId,
        buf: ByteStream,
        core: &mut LoopCore,
    ) -> Result<(), RpcError> {
        self.inner.start_write(owner, buf, core)
    }
}

impl IoHandle for ServerTransport {
    fn source(&self) -> &IoSource {
        self.inner.source()
    }

    fn on_readable(&mut self, core: &mut LoopCore) -> HandleResult {
        Ok(self.inner.on_readable(core)?)
    }

    fn on_writable(&mut self, core: &mut LoopCore) -> HandleResult {
        Ok(self.inner.on_writable(core)?)
    }

    fn reset(&mut self, err: &RpcError, core: &mut LoopCore) {
        self.inner.reset(err, core);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event_loop::EventLoop;
    use crate::handle::HandleError;
    use crate::protocol::{EchoProtocol, Protocol, RequestFrame, UrpcProtocol};
    use std::io::{Read, Write};
    use std::os::unix::net::UnixStream;

    fn serve_pair() -> (ServerTransport, UnixStream) {
        let (a, b) = UnixStream::pair().unwrap();
        a.set_nonblocking(true).unwrap();
        let t = ServerTransport::new(
            HandleId::new(0, 0),
            OwnedFd::from(a),
            None,
            Rc::new(ServiceRegistry::new()),
        );
        (t, b)
    }

    fn read(t: &mut ServerTransport, core: &mut LoopCore) -> Result<(), RpcError> {
        match t.on_readable(core) {
            Ok(()) => Ok(()),
            Err(HandleError::Reset(e)) => Err(e),
            Err(HandleError::Fatal(e)) => panic!("fatal: {e}"),
        }
    }

    #[test]
    fn test_echo_frames_are_answered_in_order() {
        let mut ev = EventLoop::new().unwrap();
        let (mut t, mut peer) = serve_pair();
        let core = ev.core_mut();

        for body in [&b"one"[..], b"two"] {
            let wire = EchoProtocol
                .encode_request(&RequestFrame {
                    body: body.to_vec(),
                    ..RequestFrame::default()
                })
                .unwrap();
            peer.write_all(wire.as_slice()).unwrap();
        }
        read(&mut t, core).unwrap();
        assert_eq!(t.served(), 2);
        assert_eq!(t.detector().probes(), 1);

        let replies: Vec<_> = core.mailbox.borrow_mut().drain(..).collect();
        assert_eq!(replies.len(), 2);
        for reply in replies {
            t.start_write(reply.correlation_id, reply.frame.unwrap(), core).unwrap();
        }
        let mut got = [0u8; 22];
        peer.read_exact(&mut got).unwrap();
        assert_eq!(&got[..11], b"ECHO\x03\x00\x00\x00one");
        assert_eq!(&got[11..], b"ECHO\x03\x00\x00\x00two");
        t.reset(&RpcError::shutdown(), core);
    }

    #[test]
    fn test_unknown_service_gets_error_frame() {
        let mut ev = EventLoop::new().unwrap();
        let (mut t, mut peer) = serve_pair();
        let core = ev.core_mut();

        let wire = UrpcProtocol
            .encode_request(&RequestFrame {
                correlation_id: CorrelationId::new(3),
                service: "missing.Service".into(),
                method: "Call".into(),
                log_id: 0,
                body: vec![],
            })
            .unwrap();
        peer.write_all(wire.as_slice()).unwrap();
        read(&mut t, core).unwrap();

        let reply = core.mailbox.borrow_mut().pop_front().unwrap();
        let mut frame = reply.frame.unwrap();
        match UrpcProtocol.parse_response(&mut frame, usize::MAX) {
            Parsed::Ok(resp) => {
                assert_eq!(resp.correlation_id, Some(CorrelationId::new(3)));
                assert_eq!(resp.result.unwrap_err().code, ErrorCode::NO_SERVICE);
            }
            other => panic!("bad reply: {:?}", other),
        }
        t.reset(&RpcError::shutdown(), core);
    }

    #[test]
    fn test_garbage_is_not_supported() {
        let mut ev = EventLoop::new().unwrap();
        let (mut t, mut peer) = serve_pair();
        let core = ev.core_mut();

        peer.write_all(b"GET / HTTP/1.1\r\n\r\n").unwrap();
        let err = read(&mut t, core).unwrap_err();
        assert_eq!(err.code, ErrorCode::NOT_SUPPORTED);
        t.reset(&err, core);
    }
}
