//! Wire protocols
//!
//! A protocol is identified by a 4-byte ASCII header at the start of every
//! frame. It cuts complete frames out of a connection's inbound
//! [`ByteStream`] and encodes outbound ones.
//!
//! Parsing is incremental. Each parse either
//!
//! - reports `TooSmall` and leaves the buffer untouched (wait for more bytes),
//! - reports `Mismatch` and leaves the buffer untouched (not this protocol),
//! - consumes exactly one frame and returns it, or
//! - reports a framing error that is fatal to the connection.
//!
//! Two protocols ship with the runtime:
//!
//! | Header | Frame                                                       |
//! |--------|-------------------------------------------------------------|
//! | `URPC` | `[URPC][meta len: u32 LE][body len: u32 LE][meta][body]`    |
//! | `ECHO` | `[ECHO][body len: u32 LE][body]`                            |

pub mod echo;
pub mod registry;
pub mod urpc;

use urpc_core::{Controller, CorrelationId, ErrorCode, RpcError};

use crate::iobuf::ByteStream;
use crate::service::{ServerDone, ServiceRegistry};

pub use echo::EchoProtocol;
pub use registry::{Detector, ProtocolRegistry};
pub use urpc::UrpcProtocol;

/// Length of every protocol header
pub const HEADER_LEN: usize = 4;

/// Built-in protocols, selectable per channel
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum ProtocolType {
    #[default]
    Urpc,
    Echo,
}

impl ProtocolType {
    pub const fn header(self) -> [u8; HEADER_LEN] {
        match self {
            ProtocolType::Urpc => urpc::HEADER,
            ProtocolType::Echo => echo::HEADER,
        }
    }
}

/// Outcome of one parse attempt
#[derive(Debug, PartialEq, Eq)]
pub enum Parsed<T> {
    /// Not a whole frame yet; buffer untouched
    TooSmall,
    /// Header belongs to another protocol; buffer untouched
    Mismatch,
    /// One frame consumed
    Ok(T),
    /// Malformed frame; the connection must be reset
    Error(RpcError),
}

/// A request cut from the wire, payload still encoded
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct RequestFrame {
    pub correlation_id: CorrelationId,
    pub service: String,
    pub method: String,
    pub log_id: u64,
    pub body: Vec<u8>,
}

/// A response cut from the wire
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResponseFrame {
    /// `None` for protocols without ids: the response answers the oldest
    /// outstanding call.
    pub correlation_id: Option<CorrelationId>,
    /// Encoded response body, or the error the server answered with
    pub result: Result<Vec<u8>, RpcError>,
}

pub trait Protocol {
    fn name(&self) -> &'static str;

    fn header(&self) -> [u8; HEADER_LEN];

    /// Cut one request frame from the head of `buf`.
    fn parse_request(&self, buf: &mut ByteStream, max_frame: usize) -> Parsed<RequestFrame>;

    /// Cut one response frame from the head of `buf`.
    fn parse_response(&self, buf: &mut ByteStream, max_frame: usize) -> Parsed<ResponseFrame>;

    fn encode_request(&self, frame: &RequestFrame) -> Result<ByteStream, RpcError>;

    fn encode_response(
        &self,
        correlation_id: CorrelationId,
        result: &Result<Vec<u8>, RpcError>,
    ) -> Result<ByteStream, RpcError>;

    /// Execute a parsed request. The default looks the method up in the
    /// service registry; `done` must eventually be answered.
    fn serve(
        &self,
        frame: RequestFrame,
        services: &ServiceRegistry,
        cntl: Controller,
        done: ServerDone,
    ) {
        services.dispatch(frame, cntl, done);
    }
}

/// Header gate shared by the built-in protocols: `Some` when the caller
/// must stop (not enough bytes to tell, or a foreign header).
pub(crate) fn check_header<T>(buf: &ByteStream, header: &[u8; HEADER_LEN]) -> Option<Parsed<T>> {
    let head = buf.peek(HEADER_LEN);
    if head.len() < HEADER_LEN {
        if header.starts_with(head) {
            return Some(Parsed::TooSmall);
        }
        return Some(Parsed::Mismatch);
    }
    if head != header {
        return Some(Parsed::Mismatch);
    }
    None
}

/// Reject declared lengths above `max_frame`.
pub(crate) fn check_frame_size(declared: usize, max_frame: usize) -> Result<(), RpcError> {
    if declared > max_frame {
        return Err(RpcError::new(
            ErrorCode::FRAME_TOO_LARGE,
            format!("frame of {} bytes exceeds limit of {}", declared, max_frame),
        ));
    }
    Ok(())
}

/// Length field for an outbound section.
pub(crate) fn encode_len(len: usize) -> Result<[u8; 4], RpcError> {
    u32::try_from(len)
        .map(urpc_core::coding::encode_fixed32)
        .map_err(|_| RpcError::new(ErrorCode::FRAME_TOO_LARGE, format!("{} bytes do not fit a frame", len)))
}
