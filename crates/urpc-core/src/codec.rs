//! Message codec
//!
//! The runtime never looks inside request or response messages; it only
//! needs to turn a message into bytes and back. Any `serde` type is a
//! [`Message`], and [`PostcardCodec`] is the encoding used for both message
//! bodies and frame metadata.

use serde::{de::DeserializeOwned, Serialize};

/// A value that can travel as a request or response body.
pub trait Message: Serialize + DeserializeOwned + 'static {}

impl<T> Message for T where T: Serialize + DeserializeOwned + 'static {}

/// Serialization format for message bodies and metadata.
pub trait Codec {
    type EncodeError: std::error::Error;
    type DecodeError: std::error::Error;

    fn encode<T: Serialize>(val: &T) -> Result<Vec<u8>, Self::EncodeError>;

    fn decode<T: DeserializeOwned>(buf: &[u8]) -> Result<T, Self::DecodeError>;
}

/// Compact, deterministic binary encoding (postcard).
pub struct PostcardCodec;

impl Codec for PostcardCodec {
    type EncodeError = postcard::Error;
    type DecodeError = postcard::Error;

    fn encode<T: Serialize>(val: &T) -> Result<Vec<u8>, Self::EncodeError> {
        postcard::to_allocvec(val)
    }

    fn decode<T: DeserializeOwned>(buf: &[u8]) -> Result<T, Self::DecodeError> {
        postcard::from_bytes(buf)
    }
}

/// Encode a message body with the default codec.
#[inline]
pub fn encode<M: Message>(msg: &M) -> Result<Vec<u8>, postcard::Error> {
    PostcardCodec::encode(msg)
}

/// Decode a message body with the default codec.
#[inline]
pub fn decode<M: Message>(buf: &[u8]) -> Result<M, postcard::Error> {
    PostcardCodec::decode(buf)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;

    #[derive(Debug, PartialEq, Serialize, Deserialize)]
    struct EchoRequest {
        message: String,
    }

    #[test]
    fn test_message_roundtrip() {
        let req = EchoRequest {
            message: "hello world".into(),
        };
        let bytes = encode(&req).unwrap();
        let back: EchoRequest = decode(&bytes).unwrap();
        assert_eq!(back, req);
    }

    #[test]
    fn test_truncated_body_is_an_error() {
        let bytes = encode(&EchoRequest {
            message: "hello".into(),
        })
        .unwrap();
        let res: Result<EchoRequest, _> = decode(&bytes[..bytes.len() - 2]);
        assert!(res.is_err());
    }
}
