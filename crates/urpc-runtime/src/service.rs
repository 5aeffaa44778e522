//! Services, methods and server-side completion
//!
//! A [`Service`] is a named set of methods invoked with the still-encoded
//! request body. [`ServiceBuilder`] builds one from typed closures:
//!
//! ```ignore
//! let echo = ServiceBuilder::new("example.EchoService")
//!     .method("Echo", |_cntl, req: EchoRequest, done: Done<EchoResponse>| {
//!         done.finish(EchoResponse { message: req.message });
//!     })
//!     .build();
//! server.add_service(Rc::new(echo), ServiceOwnership::ServerOwned)?;
//! ```
//!
//! Every call is answered exactly once through its [`ServerDone`]: either
//! explicitly, or with `INTERNAL` when the handler drops it unanswered.

use std::cell::RefCell;
use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::marker::PhantomData;
use std::rc::Rc;

use urpc_core::codec::{self, Message};
use urpc_core::{Controller, CorrelationId, Error, ErrorCode, HandleId, Result, RpcError};

use crate::iobuf::ByteStream;
use crate::protocol::{Protocol, RequestFrame};

// ── Method identity ──

/// Fully qualified method name, as a client addresses it
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct MethodDescriptor {
    pub service: String,
    pub method: String,
}

impl MethodDescriptor {
    pub fn new(service: impl Into<String>, method: impl Into<String>) -> Self {
        Self {
            service: service.into(),
            method: method.into(),
        }
    }

    /// `service.method`
    pub fn full_name(&self) -> String {
        format!("{}.{}", self.service, self.method)
    }
}

impl fmt::Display for MethodDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.service, self.method)
    }
}

// ── Server-side completion ──

/// An encoded reply waiting for the event loop to write it
pub(crate) struct ServerReply {
    pub conn: HandleId,
    pub correlation_id: CorrelationId,
    /// Framed reply, or the reason the reply could not be framed
    pub frame: std::result::Result<ByteStream, RpcError>,
}

/// Replies produced while the connection that owns them is borrowed
pub(crate) type Mailbox = Rc<RefCell<VecDeque<ServerReply>>>;

/// Answers one server call. Dropping it unanswered answers `INTERNAL`.
pub struct ServerDone {
    conn: HandleId,
    correlation_id: CorrelationId,
    protocol: Rc<dyn Protocol>,
    mailbox: Mailbox,
    answered: bool,
}

impl ServerDone {
    pub(crate) fn new(
        conn: HandleId,
        correlation_id: CorrelationId,
        protocol: Rc<dyn Protocol>,
        mailbox: Mailbox,
    ) -> Self {
        Self {
            conn,
            correlation_id,
            protocol,
            mailbox,
            answered: false,
        }
    }

    #[inline]
    pub fn correlation_id(&self) -> CorrelationId {
        self.correlation_id
    }

    /// Answer with an encoded response body.
    pub fn finish(mut self, body: Vec<u8>) {
        self.send(Ok(body));
    }

    /// Answer with an error frame.
    pub fn fail(mut self, err: RpcError) {
        self.send(Err(err));
    }

    fn send(&mut self, result: std::result::Result<Vec<u8>, RpcError>) {
        if self.answered {
            return;
        }
        self.answered = true;
        let frame = self.protocol.encode_response(self.correlation_id, &result);
        self.mailbox.borrow_mut().push_back(ServerReply {
            conn: self.conn,
            correlation_id: self.correlation_id,
            frame,
        });
    }
}

impl Drop for ServerDone {
    fn drop(&mut self) {
        if !self.answered {
            tracing::warn!(id = %self.correlation_id, "handler dropped its completion unanswered");
            self.send(Err(RpcError::new(
                ErrorCode::INTERNAL,
                "handler finished without a response",
            )));
        }
    }
}

/// Typed completion handed to handlers built with [`ServiceBuilder`]
pub struct Done<Resp> {
    inner: ServerDone,
    _resp: PhantomData<fn(Resp)>,
}

impl<Resp: Message> Done<Resp> {
    pub fn finish(self, resp: Resp) {
        match codec::encode(&resp) {
            Ok(body) => self.inner.finish(body),
            Err(e) => self.inner.fail(RpcError::new(
                ErrorCode::INTERNAL,
                format!("encode response: {}", e),
            )),
        }
    }

    pub fn fail(self, code: ErrorCode, text: impl Into<String>) {
        self.inner.fail(RpcError::new(code, text));
    }

    #[inline]
    pub fn correlation_id(&self) -> CorrelationId {
        self.inner.correlation_id()
    }
}

// ── Services ──

pub trait Service {
    fn name(&self) -> &str;

    fn has_method(&self, method: &str) -> bool;

    /// Invoke `method` with the encoded request. Only called for methods
    /// `has_method` accepts.
    fn call(&self, method: &str, cntl: Controller, request: &[u8], done: ServerDone);
}

type RawHandler = Box<dyn Fn(Controller, &[u8], ServerDone)>;

/// Service built from typed closures
pub struct TypedService {
    name: String,
    methods: HashMap<String, RawHandler>,
}

impl Service for TypedService {
    fn name(&self) -> &str {
        &self.name
    }

    fn has_method(&self, method: &str) -> bool {
        self.methods.contains_key(method)
    }

    fn call(&self, method: &str, cntl: Controller, request: &[u8], done: ServerDone) {
        match self.methods.get(method) {
            Some(handler) => handler(cntl, request, done),
            None => done.fail(no_method(&self.name, method)),
        }
    }
}

pub struct ServiceBuilder {
    name: String,
    methods: HashMap<String, RawHandler>,
}

impl ServiceBuilder {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            methods: HashMap::new(),
        }
    }

    /// Add a method. The request is decoded before `handler` runs; a body
    /// that fails to decode is answered with `BAD_REQUEST`.
    pub fn method<Req, Resp, F>(mut self, name: impl Into<String>, handler: F) -> Self
    where
        Req: Message,
        Resp: Message,
        F: Fn(&Controller, Req, Done<Resp>) + 'static,
    {
        let raw: RawHandler = Box::new(move |cntl: Controller, body: &[u8], done: ServerDone| {
            match codec::decode::<Req>(body) {
                Ok(req) => handler(
                    &cntl,
                    req,
                    Done {
                        inner: done,
                        _resp: PhantomData,
                    },
                ),
                Err(e) => done.fail(RpcError::new(
                    ErrorCode::BAD_REQUEST,
                    format!("decode request: {}", e),
                )),
            }
        });
        self.methods.insert(name.into(), raw);
        self
    }

    pub fn build(self) -> TypedService {
        TypedService {
            name: self.name,
            methods: self.methods,
        }
    }
}

// ── Registry ──

/// Who releases a registered service
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServiceOwnership {
    /// Released by the registry when its server shuts down
    ServerOwned,
    /// The caller keeps it; shutdown leaves it registered
    CallerOwned,
}

struct Registered {
    service: Rc<dyn Service>,
    ownership: ServiceOwnership,
}

#[derive(Default)]
pub struct ServiceRegistry {
    services: HashMap<String, Registered>,
}

fn no_method(service: &str, method: &str) -> RpcError {
    RpcError::new(
        ErrorCode::NO_METHOD,
        format!("service {} has no method {}", service, method),
    )
}

impl ServiceRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_service(&mut self, service: Rc<dyn Service>, ownership: ServiceOwnership) -> Result<()> {
        let name = service.name().to_owned();
        if self.services.contains_key(&name) {
            return Err(Error::DuplicateService(name));
        }
        self.services.insert(name, Registered { service, ownership });
        Ok(())
    }

    pub fn find_service(&self, name: &str) -> Option<Rc<dyn Service>> {
        self.services.get(name).map(|r| Rc::clone(&r.service))
    }

    pub fn find_method(&self, service: &str, method: &str) -> Option<MethodDescriptor> {
        self.services
            .get(service)
            .filter(|r| r.service.has_method(method))
            .map(|_| MethodDescriptor::new(service, method))
    }

    /// Release every `ServerOwned` service.
    pub fn release_owned(&mut self) {
        self.services
            .retain(|_, r| r.ownership == ServiceOwnership::CallerOwned);
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.services.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.services.is_empty()
    }

    /// Route a request to its handler, or answer it with `NO_SERVICE` /
    /// `NO_METHOD`.
    pub fn dispatch(&self, frame: RequestFrame, cntl: Controller, done: ServerDone) {
        let Some(reg) = self.services.get(&frame.service) else {
            tracing::warn!(service = %frame.service, method = %frame.method, "no such service");
            done.fail(RpcError::new(
                ErrorCode::NO_SERVICE,
                format!("no service {}", frame.service),
            ));
            return;
        };
        if !reg.service.has_method(&frame.method) {
            tracing::warn!(service = %frame.service, method = %frame.method, "no such method");
            done.fail(no_method(&frame.service, &frame.method));
            return;
        }
        tracing::trace!(service = %frame.service, method = %frame.method, id = %frame.correlation_id, "dispatch");
        reg.service.call(&frame.method, cntl, &frame.body, done);
    }
}
