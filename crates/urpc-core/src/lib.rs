//! # urpc-core
//!
//! Platform-agnostic types shared by the urpc runtime and its users.
//!
//! This crate holds no OS-facing code; sockets, the readiness multiplexer
//! and the event loop live in `urpc-runtime`.
//!
//! ## Modules
//!
//! - `error` - Error codes, per-call errors and setup errors
//! - `id` - Handle and correlation identifiers
//! - `env` - Environment variable overrides
//! - `coding` - Fixed-width little-endian integers for frame headers
//! - `codec` - Message trait and the postcard codec
//! - `meta` - RPC metadata carried in every URPC frame
//! - `controller` - Per-call options and outcome

pub mod error;
pub mod id;
pub mod env;
pub mod coding;
pub mod codec;
pub mod meta;
pub mod controller;

// Re-exports for convenience
pub use error::{Error, ErrorCode, Result, RpcError};
pub use id::{CorrelationId, HandleId};
pub use env::{env_get, env_get_bool, env_get_opt, timeout_from_ms};
pub use codec::{Codec, Message, PostcardCodec};
pub use meta::{RequestMeta, ResponseMeta, RpcMeta};
pub use controller::Controller;
