//! Library defaults, overridable through the environment.

/// Readiness events fetched per `epoll_wait`
pub const MAX_EVENTS: usize = 32;

/// Bytes read from a socket per `read` call
pub const READ_CHUNK: usize = 16 * 1024;

/// Largest metadata + body a single frame may declare
pub const MAX_FRAME_SIZE: usize = 64 * 1024 * 1024;

/// Poll wait used by `run_forever` between stop-flag checks
pub const IDLE_TIMEOUT_MS: u64 = 10;

/// Connect deadline; negative waits forever
pub const CONNECT_TIMEOUT_MS: i32 = 200;

/// Call deadline; negative waits forever
pub const TIMEOUT_MS: i32 = 500;

/// `listen(2)` backlog
pub const LISTEN_BACKLOG: i32 = 1024;

pub const REUSE_PORT: bool = false;

pub const TCP_NODELAY: bool = true;
