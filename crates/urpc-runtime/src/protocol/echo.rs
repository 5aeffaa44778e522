//! ECHO framing: `[ECHO][body len: u32 LE][body]`
//!
//! No metadata and no correlation id. The server answers every request
//! with its own body, without consulting the service registry, and a
//! client matches each response to its oldest outstanding call.

use urpc_core::coding::decode_fixed32;
use urpc_core::{Controller, CorrelationId, ErrorCode, RpcError};

use super::{
    check_frame_size, check_header, encode_len, Parsed, Protocol, RequestFrame, ResponseFrame,
    HEADER_LEN,
};
use crate::iobuf::ByteStream;
use crate::service::{ServerDone, ServiceRegistry};

pub const HEADER: [u8; HEADER_LEN] = *b"ECHO";

const PREFIX_LEN: usize = HEADER_LEN + 4;

#[derive(Debug, Default, Clone, Copy)]
pub struct EchoProtocol;

fn cut_body(buf: &mut ByteStream, max_frame: usize) -> Parsed<Vec<u8>> {
    if let Some(stop) = check_header(buf, &HEADER) {
        return stop;
    }
    let Some(len) = decode_fixed32(&buf.peek(PREFIX_LEN)[HEADER_LEN..]) else {
        return Parsed::TooSmall;
    };
    let len = len as usize;
    if let Err(e) = check_frame_size(len, max_frame) {
        return Parsed::Error(e);
    }
    if buf.len() < PREFIX_LEN + len {
        return Parsed::TooSmall;
    }
    buf.consume(PREFIX_LEN);
    Parsed::Ok(buf.cut_to_vec(len))
}

fn frame(body: &[u8]) -> Result<ByteStream, RpcError> {
    let mut out = ByteStream::with_capacity(PREFIX_LEN + body.len());
    out.append(&HEADER);
    out.append(&encode_len(body.len())?);
    out.append(body);
    Ok(out)
}

impl Protocol for EchoProtocol {
    fn name(&self) -> &'static str {
        "echo"
    }

    fn header(&self) -> [u8; HEADER_LEN] {
        HEADER
    }

    fn parse_request(&self, buf: &mut ByteStream, max_frame: usize) -> Parsed<RequestFrame> {
        match cut_body(buf, max_frame) {
            Parsed::Ok(body) => Parsed::Ok(RequestFrame {
                body,
                ..RequestFrame::default()
            }),
            Parsed::TooSmall => Parsed::TooSmall,
            Parsed::Mismatch => Parsed::Mismatch,
            Parsed::Error(e) => Parsed::Error(e),
        }
    }

    fn parse_response(&self, buf: &mut ByteStream, max_frame: usize) -> Parsed<ResponseFrame> {
        match cut_body(buf, max_frame) {
            Parsed::Ok(body) => Parsed::Ok(ResponseFrame {
                correlation_id: None,
                result: Ok(body),
            }),
            Parsed::TooSmall => Parsed::TooSmall,
            Parsed::Mismatch => Parsed::Mismatch,
            Parsed::Error(e) => Parsed::Error(e),
        }
    }

    fn encode_request(&self, req: &RequestFrame) -> Result<ByteStream, RpcError> {
        frame(&req.body)
    }

    fn encode_response(
        &self,
        _correlation_id: CorrelationId,
        result: &Result<Vec<u8>, RpcError>,
    ) -> Result<ByteStream, RpcError> {
        match result {
            Ok(body) => frame(body),
            Err(e) => Err(RpcError::new(
                ErrorCode::NOT_SUPPORTED,
                format!("echo frames cannot carry errors ({})", e),
            )),
        }
    }

    fn serve(
        &self,
        frame: RequestFrame,
        _services: &ServiceRegistry,
        _cntl: Controller,
        done: ServerDone,
    ) {
        done.finish(frame.body);
    }
}
