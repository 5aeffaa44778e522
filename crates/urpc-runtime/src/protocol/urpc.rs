//! URPC framing
//!
//! ```text
//!   0      4            8            12          12+M        12+M+B
//!   +------+------------+------------+-----------+-----------+
//!   | URPC | meta len M | body len B |  RpcMeta  |   body    |
//!   +------+------------+------------+-----------+-----------+
//!            u32 LE       u32 LE       postcard    message
//! ```
//!
//! Requests and responses share the layout; the metadata says which.

use urpc_core::coding::decode_fixed32;
use urpc_core::{CorrelationId, ErrorCode, RpcError, RpcMeta};

use super::{
    check_frame_size, check_header, encode_len, Parsed, Protocol, RequestFrame, ResponseFrame,
    HEADER_LEN,
};
use crate::iobuf::ByteStream;

pub const HEADER: [u8; HEADER_LEN] = *b"URPC";

/// Header plus both length fields
const PREFIX_LEN: usize = HEADER_LEN + 8;

#[derive(Debug, Default, Clone, Copy)]
pub struct UrpcProtocol;

/// Cut `(meta, body)` of one frame, or say why not.
fn cut_frame(buf: &mut ByteStream, max_frame: usize) -> Parsed<(Vec<u8>, Vec<u8>)> {
    if let Some(stop) = check_header(buf, &HEADER) {
        return stop;
    }
    let prefix = buf.peek(PREFIX_LEN);
    if prefix.len() < PREFIX_LEN {
        return Parsed::TooSmall;
    }
    let (Some(meta_len), Some(body_len)) = (
        decode_fixed32(&prefix[HEADER_LEN..]),
        decode_fixed32(&prefix[HEADER_LEN + 4..]),
    ) else {
        return Parsed::TooSmall;
    };
    let (meta_len, body_len) = (meta_len as usize, body_len as usize);
    if let Err(e) = check_frame_size(meta_len + body_len, max_frame) {
        return Parsed::Error(e);
    }
    if buf.len() < PREFIX_LEN + meta_len + body_len {
        return Parsed::TooSmall;
    }
    buf.consume(PREFIX_LEN);
    let meta = buf.cut_to_vec(meta_len);
    let body = buf.cut_to_vec(body_len);
    Parsed::Ok((meta, body))
}

fn frame(meta: &RpcMeta, body: &[u8]) -> Result<ByteStream, RpcError> {
    let meta = meta
        .encode()
        .map_err(|e| RpcError::new(ErrorCode::INTERNAL, format!("encode meta: {}", e)))?;
    let mut out = ByteStream::with_capacity(PREFIX_LEN + meta.len() + body.len());
    out.append(&HEADER);
    out.append(&encode_len(meta.len())?);
    out.append(&encode_len(body.len())?);
    out.append(&meta);
    out.append(body);
    Ok(out)
}

impl Protocol for UrpcProtocol {
    fn name(&self) -> &'static str {
        "urpc"
    }

    fn header(&self) -> [u8; HEADER_LEN] {
        HEADER
    }

    fn parse_request(&self, buf: &mut ByteStream, max_frame: usize) -> Parsed<RequestFrame> {
        let (meta, body) = match cut_frame(buf, max_frame) {
            Parsed::Ok(parts) => parts,
            Parsed::TooSmall => return Parsed::TooSmall,
            Parsed::Mismatch => return Parsed::Mismatch,
            Parsed::Error(e) => return Parsed::Error(e),
        };
        let meta = match RpcMeta::decode(&meta) {
            Ok(meta) => meta,
            Err(e) => {
                return Parsed::Error(RpcError::new(
                    ErrorCode::BAD_REQUEST,
                    format!("request meta: {}", e),
                ))
            }
        };
        let correlation_id = meta.correlation_id();
        let Some(req) = meta.request else {
            return Parsed::Error(RpcError::new(
                ErrorCode::BAD_REQUEST,
                format!("frame {} carries no request meta", correlation_id),
            ));
        };
        Parsed::Ok(RequestFrame {
            correlation_id,
            service: req.service_name,
            method: req.method_name,
            log_id: req.log_id,
            body,
        })
    }

    fn parse_response(&self, buf: &mut ByteStream, max_frame: usize) -> Parsed<ResponseFrame> {
        let (meta, body) = match cut_frame(buf, max_frame) {
            Parsed::Ok(parts) => parts,
            Parsed::TooSmall => return Parsed::TooSmall,
            Parsed::Mismatch => return Parsed::Mismatch,
            Parsed::Error(e) => return Parsed::Error(e),
        };
        let meta = match RpcMeta::decode(&meta) {
            Ok(meta) => meta,
            Err(e) => {
                return Parsed::Error(RpcError::new(
                    ErrorCode::BAD_RESPONSE,
                    format!("response meta: {}", e),
                ))
            }
        };
        let code = meta.error_code();
        let result = if code.is_ok() {
            Ok(body)
        } else {
            let text = meta.response.map(|r| r.error_text).unwrap_or_default();
            Err(RpcError::new(code, text))
        };
        Parsed::Ok(ResponseFrame {
            correlation_id: Some(CorrelationId::new(meta.correlation_id)),
            result,
        })
    }

    fn encode_request(&self, req: &RequestFrame) -> Result<ByteStream, RpcError> {
        let meta = RpcMeta::for_request(req.correlation_id, &req.service, &req.method, req.log_id);
        frame(&meta, &req.body)
    }

    fn encode_response(
        &self,
        correlation_id: CorrelationId,
        result: &Result<Vec<u8>, RpcError>,
    ) -> Result<ByteStream, RpcError> {
        match result {
            Ok(body) => frame(&RpcMeta::for_response(correlation_id, ErrorCode::OK, ""), body),
            Err(e) => frame(&RpcMeta::for_response(correlation_id, e.code, &e.reason), &[]),
        }
    }
}
