//! Protocol registry and per-connection detection
//!
//! The registry maps a 4-byte header to a protocol. It is filled during
//! setup and read-only once the event loop runs.
//!
//! Each server connection owns a [`Detector`]: it remembers the protocol
//! that parsed the last frame and tries it first. Only a `Mismatch` sends
//! it back to the registry to look the header up again.

use std::collections::HashMap;
use std::rc::Rc;

use urpc_core::{ErrorCode, RpcError};

use super::{
    EchoProtocol, Parsed, Protocol, ProtocolType, RequestFrame, UrpcProtocol, HEADER_LEN,
};
use crate::iobuf::ByteStream;

#[derive(Default)]
pub struct ProtocolRegistry {
    by_header: HashMap<[u8; HEADER_LEN], Rc<dyn Protocol>>,
}

impl ProtocolRegistry {
    /// Empty registry; no frame will be recognised.
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry holding the built-in URPC and ECHO protocols.
    pub fn with_defaults() -> Self {
        let mut reg = Self::new();
        reg.register(Rc::new(UrpcProtocol));
        reg.register(Rc::new(EchoProtocol));
        reg
    }

    /// Register `protocol` under its header, replacing any previous owner.
    pub fn register(&mut self, protocol: Rc<dyn Protocol>) {
        let header = protocol.header();
        if let Some(old) = self.by_header.insert(header, protocol) {
            tracing::debug!(
                header = %String::from_utf8_lossy(&header),
                replaced = old.name(),
                "protocol re-registered"
            );
        }
    }

    pub fn find(&self, header: &[u8]) -> Option<Rc<dyn Protocol>> {
        let header: [u8; HEADER_LEN] = header.try_into().ok()?;
        self.by_header.get(&header).cloned()
    }

    pub fn get(&self, ty: ProtocolType) -> Option<Rc<dyn Protocol>> {
        self.find(&ty.header())
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.by_header.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.by_header.is_empty()
    }
}

/// Protocol detection state of one connection
#[derive(Default)]
pub struct Detector {
    cached: Option<Rc<dyn Protocol>>,
    probes: u64,
}

impl Detector {
    pub fn new() -> Self {
        Self::default()
    }

    /// Protocol that parsed the most recent frame.
    pub fn current(&self) -> Option<&Rc<dyn Protocol>> {
        self.cached.as_ref()
    }

    /// Registry lookups performed so far.
    #[inline]
    pub fn probes(&self) -> u64 {
        self.probes
    }

    /// Parse one request with the cached protocol, re-detecting from the
    /// header on mismatch. Never returns `Mismatch`: a header no protocol
    /// claims is `NOT_SUPPORTED`.
    pub fn parse_request(
        &mut self,
        registry: &ProtocolRegistry,
        buf: &mut ByteStream,
        max_frame: usize,
    ) -> Parsed<(Rc<dyn Protocol>, RequestFrame)> {
        if let Some(proto) = &self.cached {
            match proto.parse_request(buf, max_frame) {
                Parsed::Mismatch => {}
                Parsed::Ok(frame) => return Parsed::Ok((Rc::clone(proto), frame)),
                Parsed::TooSmall => return Parsed::TooSmall,
                Parsed::Error(e) => return Parsed::Error(e),
            }
        }

        let head = buf.peek(HEADER_LEN);
        if head.len() < HEADER_LEN {
            return Parsed::TooSmall;
        }
        self.probes += 1;
        let Some(proto) = registry.find(head) else {
            return Parsed::Error(RpcError::new(
                ErrorCode::NOT_SUPPORTED,
                format!("no protocol for header {:?}", String::from_utf8_lossy(head)),
            ));
        };
        tracing::trace!(protocol = proto.name(), "protocol detected");
        self.cached = Some(Rc::clone(&proto));

        match proto.parse_request(buf, max_frame) {
            Parsed::Ok(frame) => Parsed::Ok((proto, frame)),
            Parsed::TooSmall => Parsed::TooSmall,
            Parsed::Error(e) => Parsed::Error(e),
            Parsed::Mismatch => Parsed::Error(RpcError::new(
                ErrorCode::NOT_SUPPORTED,
                format!("protocol {} rejected its own header", proto.name()),
            )),
        }
    }
}
