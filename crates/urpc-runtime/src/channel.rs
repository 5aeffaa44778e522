//! Client surface
//!
//! A `Channel` names a remote service endpoint on one event loop. Channels
//! to the same address and protocol share one connection; the first call
//! connects it.
//!
//! ```ignore
//! let channel = Channel::init(&mut ev, "127.0.0.1:8000", ChannelOptions::default())?;
//! let method = MethodDescriptor::new("example.EchoService", "Echo");
//! channel.call(&mut ev, &method, Controller::new(), &req, |cntl, resp: EchoResponse| {
//!     if !cntl.failed() {
//!         println!("{}", resp.message);
//!     }
//! });
//! ev.run_once(None)?;
//! ```
//!
//! Completions run on the loop thread, from inside `run_once`, or before
//! `call` returns when the call fails up front (encode error, connect
//! refused synchronously).

use std::net::SocketAddr;
use std::time::Instant;

use urpc_core::codec;
use urpc_core::{
    timeout_from_ms, Controller, ErrorCode, HandleId, Message, Result, RpcError,
};

use crate::config::ChannelOptions;
use crate::event_loop::EventLoop;
use crate::protocol::RequestFrame;
use crate::service::MethodDescriptor;
use crate::socket;
use crate::timer::Deadline;
use crate::transport::connect::Completion;
use crate::transport::PendingCall;

#[derive(Debug, Clone)]
pub struct Channel {
    conn: HandleId,
    remote: SocketAddr,
    options: ChannelOptions,
}

impl Channel {
    /// Resolve `server` (`host:port`) and bind to its connection on `ev`.
    /// Does not connect.
    pub fn init(ev: &mut EventLoop, server: &str, options: ChannelOptions) -> Result<Self> {
        let remote = socket::resolve(server)?;
        let conn = ev.connection_for(remote, options.protocol, options.connect_timeout())?;
        tracing::debug!(%remote, ?conn, protocol = ?options.protocol, "channel initialised");
        Ok(Self {
            conn,
            remote,
            options,
        })
    }

    #[inline]
    pub fn connection(&self) -> HandleId {
        self.conn
    }

    #[inline]
    pub fn remote(&self) -> SocketAddr {
        self.remote
    }

    #[inline]
    pub fn options(&self) -> &ChannelOptions {
        &self.options
    }

    /// Call `method` with a typed request. `done` receives the controller
    /// and the decoded response; on failure the controller says why and
    /// the response is `Resp::default()`.
    pub fn call<Req, Resp, F>(
        &self,
        ev: &mut EventLoop,
        method: &MethodDescriptor,
        mut cntl: Controller,
        request: &Req,
        done: F,
    ) where
        Req: Message,
        Resp: Message + Default,
        F: FnOnce(Controller, Resp) + 'static,
    {
        let body = match codec::encode(request) {
            Ok(body) => body,
            Err(e) => {
                cntl.set_failed(ErrorCode::BAD_REQUEST, format!("encode request: {}", e));
                done(cntl, Resp::default());
                return;
            }
        };
        self.call_raw(ev, method, cntl, body, move |mut cntl, result| {
            let decoded = result.and_then(|body| {
                codec::decode::<Resp>(&body).map_err(|e| {
                    RpcError::new(ErrorCode::BAD_RESPONSE, format!("decode response: {}", e))
                })
            });
            match decoded {
                Ok(resp) => done(cntl, resp),
                Err(e) => {
                    cntl.set_failed(e.code, e.reason);
                    done(cntl, Resp::default());
                }
            }
        });
    }

    /// Call `method` with an already-encoded request body. `done` receives
    /// the raw response body; the controller carries the same failure as
    /// the `Err`.
    pub fn call_raw<F>(
        &self,
        ev: &mut EventLoop,
        method: &MethodDescriptor,
        cntl: Controller,
        body: Vec<u8>,
        done: F,
    ) where
        F: FnOnce(Controller, std::result::Result<Vec<u8>, RpcError>) + 'static,
    {
        let start = Instant::now();
        let remote = self.remote;
        let timeout = match cntl.timeout_ms() {
            Some(ms) => timeout_from_ms(ms),
            None => self.options.timeout(),
        };
        let log_id = cntl.log_id();

        let mut cntl = cntl;
        let complete: Completion = Box::new(move |result| {
            cntl.set_latency(start.elapsed());
            cntl.set_remote_side(remote);
            if let Err(e) = &result {
                cntl.set_failed(e.code, e.reason.clone());
            }
            done(cntl, result);
        });

        let Some((conn, core)) = ev.connect_parts(self.conn) else {
            complete(Err(RpcError::new(
                ErrorCode::SHUTDOWN,
                format!("connection to {} is closed", remote),
            )));
            return;
        };

        let id = conn.allocate_id();
        let frame = RequestFrame {
            correlation_id: id,
            service: method.service.clone(),
            method: method.method.clone(),
            log_id,
            body,
        };
        let wire = match conn.protocol().encode_request(&frame) {
            Ok(wire) => wire,
            Err(e) => {
                complete(Err(e));
                return;
            }
        };
        tracing::trace!(%remote, %id, %method, bytes = wire.len(), "call");

        let timer = timeout.map(|d| {
            core.timers.insert(
                start + d,
                Deadline::Call {
                    conn: self.conn,
                    id,
                },
            )
        });
        conn.issue(id, wire, PendingCall::new(complete, timer), core);
    }
}
