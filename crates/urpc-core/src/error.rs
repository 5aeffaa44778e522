//! Error types for the urpc runtime
//!
//! Two layers:
//!
//! - [`ErrorCode`] / [`RpcError`]: what a call or a connection fails with.
//!   Codes travel on the wire in response metadata, so `ErrorCode` is an
//!   open newtype; a code minted by a newer peer is carried through as-is.
//! - [`Error`]: setup and process-level failures (bind, epoll creation,
//!   a dead acceptor). These are returned from `Result`-producing APIs and
//!   never delivered through a call's completion.

use core::fmt;

use nix::errno::Errno;

use crate::id::HandleId;

/// Result type for setup and event-loop operations
pub type Result<T> = std::result::Result<T, Error>;

/// Numeric failure code, `0` meaning success
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
#[repr(transparent)]
pub struct ErrorCode(i32);

impl ErrorCode {
    pub const OK: ErrorCode = ErrorCode(0);

    // ── Framing (never leave the protocol layer) ──
    pub const TOO_SMALL: ErrorCode = ErrorCode(1001);
    pub const MISMATCH: ErrorCode = ErrorCode(1002);
    pub const NOT_SUPPORTED: ErrorCode = ErrorCode(1003);

    // ── Dispatch ──
    pub const NO_SERVICE: ErrorCode = ErrorCode(1004);
    pub const NO_METHOD: ErrorCode = ErrorCode(1005);
    pub const BAD_REQUEST: ErrorCode = ErrorCode(1006);
    pub const BAD_RESPONSE: ErrorCode = ErrorCode(1007);

    // ── Deadlines ──
    pub const TIMEOUT: ErrorCode = ErrorCode(1008);
    pub const CONNECT_TIMEOUT: ErrorCode = ErrorCode(1009);

    // ── Connection ──
    pub const IO_FAILURE: ErrorCode = ErrorCode(1010);
    pub const PEER_CLOSED: ErrorCode = ErrorCode(1011);
    pub const CORRELATION_MISMATCH: ErrorCode = ErrorCode(1012);
    pub const FRAME_TOO_LARGE: ErrorCode = ErrorCode(1013);
    pub const SHUTDOWN: ErrorCode = ErrorCode(1014);
    pub const INTERNAL: ErrorCode = ErrorCode(1015);

    #[inline]
    pub const fn new(code: i32) -> Self {
        ErrorCode(code)
    }

    #[inline]
    pub const fn as_i32(self) -> i32 {
        self.0
    }

    #[inline]
    pub const fn is_ok(self) -> bool {
        self.0 == 0
    }

    /// Symbolic name, `None` for codes this build does not know.
    pub fn name(self) -> Option<&'static str> {
        let name = match self {
            ErrorCode::OK => "OK",
            ErrorCode::TOO_SMALL => "TOO_SMALL",
            ErrorCode::MISMATCH => "MISMATCH",
            ErrorCode::NOT_SUPPORTED => "NOT_SUPPORTED",
            ErrorCode::NO_SERVICE => "NO_SERVICE",
            ErrorCode::NO_METHOD => "NO_METHOD",
            ErrorCode::BAD_REQUEST => "BAD_REQUEST",
            ErrorCode::BAD_RESPONSE => "BAD_RESPONSE",
            ErrorCode::TIMEOUT => "TIMEOUT",
            ErrorCode::CONNECT_TIMEOUT => "CONNECT_TIMEOUT",
            ErrorCode::IO_FAILURE => "IO_FAILURE",
            ErrorCode::PEER_CLOSED => "PEER_CLOSED",
            ErrorCode::CORRELATION_MISMATCH => "CORRELATION_MISMATCH",
            ErrorCode::FRAME_TOO_LARGE => "FRAME_TOO_LARGE",
            ErrorCode::SHUTDOWN => "SHUTDOWN",
            ErrorCode::INTERNAL => "INTERNAL",
            _ => return None,
        };
        Some(name)
    }
}

impl From<i32> for ErrorCode {
    #[inline]
    fn from(code: i32) -> Self {
        ErrorCode(code)
    }
}

impl From<ErrorCode> for i32 {
    #[inline]
    fn from(code: ErrorCode) -> Self {
        code.0
    }
}

impl fmt::Debug for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.name() {
            Some(name) => write!(f, "ErrorCode({})", name),
            None => write!(f, "ErrorCode({})", self.0),
        }
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.name() {
            Some(name) => write!(f, "{} ({})", name, self.0),
            None => write!(f, "error {}", self.0),
        }
    }
}

/// A failed call or connection: code plus human-readable reason
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{code}: {reason}")]
pub struct RpcError {
    pub code: ErrorCode,
    pub reason: String,
}

impl RpcError {
    pub fn new(code: ErrorCode, reason: impl Into<String>) -> Self {
        Self {
            code,
            reason: reason.into(),
        }
    }

    /// An unexpected descriptor error, tagged with the syscall that failed.
    pub fn io(op: &'static str, errno: Errno) -> Self {
        Self::new(ErrorCode::IO_FAILURE, format!("{}: {}", op, errno.desc()))
    }

    pub fn peer_closed() -> Self {
        Self::new(ErrorCode::PEER_CLOSED, "connection closed by peer")
    }

    pub fn shutdown() -> Self {
        Self::new(ErrorCode::SHUTDOWN, "event loop shut down")
    }
}

/// Setup and process-level errors
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// A syscall failed outside of any connection's lifetime
    #[error("{op} failed: {errno}")]
    Os { op: &'static str, errno: Errno },

    /// `host:port` did not resolve to a socket address
    #[error("invalid address {0:?}")]
    InvalidAddress(String),

    /// A service with this name is already registered
    #[error("service {0:?} already registered")]
    DuplicateService(String),

    /// The listening socket failed in a way the acceptor cannot survive
    #[error("acceptor failed: {0}")]
    Acceptor(Errno),

    /// Services can only be added before the server starts
    #[error("server already started")]
    AlreadyStarted,

    /// The handle id no longer names a live handle
    #[error("stale handle {0:?}")]
    StaleHandle(HandleId),

    #[error(transparent)]
    Rpc(#[from] RpcError),
}

impl Error {
    #[inline]
    pub fn os(op: &'static str, errno: Errno) -> Self {
        Error::Os { op, errno }
    }
}
