//! # urpc-runtime
//!
//! Linux runtime for urpc: one event loop per thread driving
//! edge-triggered epoll, with client and server transports speaking
//! pluggable 4-byte-header wire protocols.
//!
//! This crate provides:
//! - Byte stream buffers with descriptor read/write
//! - Non-blocking socket helpers
//! - The readiness poller and the handle table
//! - Call and connect deadlines
//! - The URPC and ECHO protocols, registry and per-connection detection
//! - Server and client transports, the acceptor
//! - The service registry and typed services
//! - `EventLoop`, `Channel` (client) and `Server`
//!
//! ```text
//!   Channel::call ──▶ ConnectTransport ──fd──▶  network  ──fd──▶ Acceptor
//!        ▲                 │                                       │
//!        │            PendingCalls                                 ▼
//!   completion ◀── parse_response                  ServerTransport ── Detector
//!                                                              │
//!                                                     ServiceRegistry::dispatch
//! ```

pub mod config;
pub mod iobuf;
pub mod socket;
pub mod poller;
pub mod handle;
pub mod timer;
pub mod protocol;
pub mod service;
pub mod transport;
pub mod acceptor;
pub mod event_loop;
pub mod channel;
pub mod server;

// Re-exports
pub use config::{ChannelOptions, LoopConfig, ServerOptions};
pub use iobuf::ByteStream;
pub use event_loop::{EventLoop, StopHandle};
pub use channel::Channel;
pub use server::Server;
pub use protocol::{Parsed, Protocol, ProtocolRegistry, ProtocolType, RequestFrame, ResponseFrame};
pub use service::{
    Done, MethodDescriptor, ServerDone, Service, ServiceBuilder, ServiceOwnership, ServiceRegistry,
};
