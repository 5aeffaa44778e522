//! RPC metadata carried in every URPC frame
//!
//! A request frame carries `request`, a response frame carries `response`;
//! both carry the correlation id the client assigned.

use serde::{Deserialize, Serialize};

use crate::codec::{Codec, PostcardCodec};
use crate::error::ErrorCode;
use crate::id::CorrelationId;

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RequestMeta {
    pub service_name: String,
    pub method_name: String,
    pub log_id: u64,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResponseMeta {
    pub error_code: i32,
    pub error_text: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RpcMeta {
    pub request: Option<RequestMeta>,
    pub response: Option<ResponseMeta>,
    pub attachment_size: u32,
    pub correlation_id: u64,
}

impl RpcMeta {
    pub fn for_request(
        correlation_id: CorrelationId,
        service_name: &str,
        method_name: &str,
        log_id: u64,
    ) -> Self {
        Self {
            request: Some(RequestMeta {
                service_name: service_name.to_owned(),
                method_name: method_name.to_owned(),
                log_id,
            }),
            response: None,
            attachment_size: 0,
            correlation_id: correlation_id.as_u64(),
        }
    }

    pub fn for_response(correlation_id: CorrelationId, code: ErrorCode, text: &str) -> Self {
        Self {
            request: None,
            response: Some(ResponseMeta {
                error_code: code.as_i32(),
                error_text: text.to_owned(),
            }),
            attachment_size: 0,
            correlation_id: correlation_id.as_u64(),
        }
    }

    #[inline]
    pub fn correlation_id(&self) -> CorrelationId {
        CorrelationId::new(self.correlation_id)
    }

    /// Error code of a response; `OK` when the frame carries none.
    pub fn error_code(&self) -> ErrorCode {
        self.response
            .as_ref()
            .map(|r| ErrorCode::new(r.error_code))
            .unwrap_or(ErrorCode::OK)
    }

    pub fn encode(&self) -> Result<Vec<u8>, postcard::Error> {
        PostcardCodec::encode(self)
    }

    pub fn decode(buf: &[u8]) -> Result<Self, postcard::Error> {
        PostcardCodec::decode(buf)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_request_meta() {
        let meta = RpcMeta::for_request(CorrelationId::new(9), "test.EchoService", "Echo", 77);
        let back = RpcMeta::decode(&meta.encode().unwrap()).unwrap();
        assert_eq!(back.correlation_id(), CorrelationId::new(9));
        let req = back.request.unwrap();
        assert_eq!(req.service_name, "test.EchoService");
        assert_eq!(req.method_name, "Echo");
        assert_eq!(req.log_id, 77);
        assert!(back.response.is_none());
    }

    #[test]
    fn test_response_error_code() {
        let meta = RpcMeta::for_response(CorrelationId::new(3), ErrorCode::NO_METHOD, "no such method");
        assert_eq!(meta.error_code(), ErrorCode::NO_METHOD);
        assert_eq!(RpcMeta::default().error_code(), ErrorCode::OK);
    }
}
