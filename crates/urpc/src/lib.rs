//! # urpc - lightweight RPC runtime
//!
//! Single-threaded, readiness-driven RPC over TCP. One event loop per
//! thread owns every connection; clients and servers share it.
//!
//! ## Features
//!
//! - **Edge-triggered epoll**: one poller per loop, handles drained to `EAGAIN`
//! - **Pluggable protocols**: 4-byte header registry, per-connection detection
//! - **URPC framing**: header, metadata and body lengths, correlation ids
//! - **ECHO framing**: header and length only, strictly ordered
//! - **Typed services**: serde messages encoded with postcard
//! - **Deadlines**: per-call and per-connect timeouts
//!
//! ## Quick Start
//!
//! ```ignore
//! use std::rc::Rc;
//! use urpc::{Channel, ChannelOptions, Controller, Done, EventLoop, MethodDescriptor,
//!            Server, ServerOptions, ServiceBuilder, ServiceOwnership};
//!
//! let mut ev = EventLoop::new()?;
//!
//! let mut server = Server::new(ServerOptions::default());
//! server.add_service(
//!     Rc::new(
//!         ServiceBuilder::new("example.EchoService")
//!             .method("Echo", |_cntl: &Controller, msg: String, done: Done<String>| done.finish(msg))
//!             .build(),
//!     ),
//!     ServiceOwnership::ServerOwned,
//! )?;
//! let addr = server.start(&mut ev, "127.0.0.1:0")?;
//!
//! let channel = Channel::init(&mut ev, &addr.to_string(), ChannelOptions::default())?;
//! let method = MethodDescriptor::new("example.EchoService", "Echo");
//! channel.call(&mut ev, &method, Controller::new(), &"hello".to_string(), |cntl, resp: String| {
//!     assert!(!cntl.failed());
//!     println!("{}", resp);
//! });
//! ev.run_once(None)?;
//! ```
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                      User Code                              │
//! │        Channel::call, Server::add_service, run_once         │
//! └─────────────────────────────────────────────────────────────┘
//!                              │
//!                              ▼
//! ┌─────────────────────────────────────────────────────────────┐
//! │                      EventLoop                              │
//! │     handle table, deadlines, reply mailbox, epoll wait      │
//! └─────────────────────────────────────────────────────────────┘
//!                              │
//!          ┌───────────────────┼───────────────────┐
//!          ▼                   ▼                   ▼
//!    ┌───────────┐      ┌───────────┐      ┌───────────┐
//!    │ Acceptor  │      │  Server   │      │  Connect  │
//!    │           │      │ Transport │      │ Transport │
//!    └───────────┘      └───────────┘      └───────────┘
//!                              │                   │
//!                              └─────────┬─────────┘
//!                                        ▼
//!    ┌─────────────────────────────────────────────────────────┐
//!    │                  Protocols                              │
//!    │        URPC / ECHO framing, 4-byte header detection     │
//!    └─────────────────────────────────────────────────────────┘
//! ```

// Re-export core types
pub use urpc_core::{
    Controller,
    CorrelationId,
    HandleId,
    Error,
    ErrorCode,
    Result,
    RpcError,
    Message,
    Codec,
    PostcardCodec,
    RpcMeta,
    RequestMeta,
    ResponseMeta,
};

// Re-export env utilities
pub use urpc_core::{env_get, env_get_bool, env_get_opt, timeout_from_ms};

// Re-export runtime types
pub use urpc_runtime::{
    ByteStream,
    Channel,
    ChannelOptions,
    Done,
    EventLoop,
    LoopConfig,
    MethodDescriptor,
    Parsed,
    Protocol,
    ProtocolRegistry,
    ProtocolType,
    RequestFrame,
    ResponseFrame,
    Server,
    ServerDone,
    ServerOptions,
    Service,
    ServiceBuilder,
    ServiceOwnership,
    ServiceRegistry,
    StopHandle,
};

pub use urpc_core::codec;
pub use urpc_runtime::protocol::{EchoProtocol, UrpcProtocol};
