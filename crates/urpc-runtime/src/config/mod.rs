//! urpc Configuration
//!
//! Provides compile-time defaults with runtime environment overrides.
//!
//! # Configuration Priority (highest wins)
//!
//! 1. Builder methods (programmatic)
//! 2. Environment variables (runtime)
//! 3. Library defaults (`defaults` module)
//!
//! # Example
//!
//! ```rust,ignore
//! use urpc_runtime::config::{ChannelOptions, LoopConfig};
//!
//! // Defaults with env overrides
//! let config = LoopConfig::from_env();
//!
//! // Or customize programmatically
//! let options = ChannelOptions::from_env()
//!     .connect_timeout_ms(50)
//!     .timeout_ms(-1);
//! ```

pub mod defaults;

use std::time::Duration;

use urpc_core::env::{env_get, env_get_bool, timeout_from_ms};

use crate::protocol::ProtocolType;

// ── Event loop ──

/// Event loop tuning.
#[derive(Debug, Clone)]
pub struct LoopConfig {
    /// Readiness events fetched per poll
    pub max_events: usize,
    /// Bytes read from a descriptor per syscall
    pub read_chunk: usize,
    /// Largest frame (metadata + body) a peer may declare
    pub max_frame_size: usize,
    /// Poll wait between stop-flag checks in `run_forever`
    pub idle_timeout: Duration,
}

impl Default for LoopConfig {
    fn default() -> Self {
        Self::from_env()
    }
}

impl LoopConfig {
    /// Library defaults with environment overrides.
    ///
    /// Environment variables (all optional):
    /// - `URPC_MAX_EVENTS` - Events per poll
    /// - `URPC_READ_CHUNK` - Bytes per read syscall
    /// - `URPC_MAX_FRAME_SIZE` - Largest accepted frame
    /// - `URPC_IDLE_TIMEOUT_MS` - `run_forever` poll wait
    pub fn from_env() -> Self {
        Self {
            max_events: env_get("URPC_MAX_EVENTS", defaults::MAX_EVENTS).max(1),
            read_chunk: env_get("URPC_READ_CHUNK", defaults::READ_CHUNK).max(1),
            max_frame_size: env_get("URPC_MAX_FRAME_SIZE", defaults::MAX_FRAME_SIZE),
            idle_timeout: Duration::from_millis(env_get(
                "URPC_IDLE_TIMEOUT_MS",
                defaults::IDLE_TIMEOUT_MS,
            )),
        }
    }

    /// Library defaults, no environment lookups.
    pub fn new() -> Self {
        Self {
            max_events: defaults::MAX_EVENTS,
            read_chunk: defaults::READ_CHUNK,
            max_frame_size: defaults::MAX_FRAME_SIZE,
            idle_timeout: Duration::from_millis(defaults::IDLE_TIMEOUT_MS),
        }
    }

    pub fn max_events(mut self, n: usize) -> Self {
        self.max_events = n.max(1);
        self
    }

    pub fn read_chunk(mut self, n: usize) -> Self {
        self.read_chunk = n.max(1);
        self
    }

    pub fn max_frame_size(mut self, n: usize) -> Self {
        self.max_frame_size = n;
        self
    }

    pub fn idle_timeout(mut self, d: Duration) -> Self {
        self.idle_timeout = d;
        self
    }
}

// ── Client ──

/// Options for a client channel.
#[derive(Debug, Clone)]
pub struct ChannelOptions {
    /// Connect deadline in milliseconds, -1 for none
    pub connect_timeout_ms: i32,
    /// Call deadline in milliseconds, -1 for none
    pub timeout_ms: i32,
    /// Wire protocol spoken on the connection
    pub protocol: ProtocolType,
}

impl Default for ChannelOptions {
    fn default() -> Self {
        Self::from_env()
    }
}

impl ChannelOptions {
    /// Environment variables (all optional):
    /// - `URPC_CONNECT_TIMEOUT_MS` - Connect deadline, -1 for none
    /// - `URPC_TIMEOUT_MS` - Call deadline, -1 for none
    pub fn from_env() -> Self {
        Self {
            connect_timeout_ms: env_get("URPC_CONNECT_TIMEOUT_MS", defaults::CONNECT_TIMEOUT_MS),
            timeout_ms: env_get("URPC_TIMEOUT_MS", defaults::TIMEOUT_MS),
            protocol: ProtocolType::Urpc,
        }
    }

    pub fn new() -> Self {
        Self {
            connect_timeout_ms: defaults::CONNECT_TIMEOUT_MS,
            timeout_ms: defaults::TIMEOUT_MS,
            protocol: ProtocolType::Urpc,
        }
    }

    pub fn connect_timeout_ms(mut self, ms: i32) -> Self {
        self.connect_timeout_ms = ms;
        self
    }

    pub fn timeout_ms(mut self, ms: i32) -> Self {
        self.timeout_ms = ms;
        self
    }

    pub fn protocol(mut self, protocol: ProtocolType) -> Self {
        self.protocol = protocol;
        self
    }

    #[inline]
    pub fn connect_timeout(&self) -> Option<Duration> {
        timeout_from_ms(self.connect_timeout_ms)
    }

    #[inline]
    pub fn timeout(&self) -> Option<Duration> {
        timeout_from_ms(self.timeout_ms)
    }
}

// ── Server ──

/// Options for a listening server.
#[derive(Debug, Clone)]
pub struct ServerOptions {
    pub backlog: i32,
    pub reuse_port: bool,
    /// Disable Nagle on accepted connections
    pub tcp_nodelay: bool,
}

impl Default for ServerOptions {
    fn default() -> Self {
        Self::from_env()
    }
}

impl ServerOptions {
    /// Environment variables (all optional):
    /// - `URPC_LISTEN_BACKLOG` - `listen(2)` backlog
    /// - `URPC_REUSE_PORT` - Set `SO_REUSEPORT` (0/1)
    pub fn from_env() -> Self {
        Self {
            backlog: env_get("URPC_LISTEN_BACKLOG", defaults::LISTEN_BACKLOG),
            reuse_port: env_get_bool("URPC_REUSE_PORT", defaults::REUSE_PORT),
            tcp_nodelay: defaults::TCP_NODELAY,
        }
    }

    pub fn new() -> Self {
        Self {
            backlog: defaults::LISTEN_BACKLOG,
            reuse_port: defaults::REUSE_PORT,
            tcp_nodelay: defaults::TCP_NODELAY,
        }
    }

    pub fn backlog(mut self, backlog: i32) -> Self {
        self.backlog = backlog;
        self
    }

    pub fn reuse_port(mut self, on: bool) -> Self {
        self.reuse_port = on;
        self
    }

    pub fn tcp_nodelay(mut self, on: bool) -> Self {
        self.tcp_nodelay = on;
        self
    }
}
