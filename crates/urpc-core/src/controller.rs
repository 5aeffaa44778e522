//! Per-call controller
//!
//! A `Controller` travels with one call. The caller sets options on it
//! (timeout override, log id) before issuing the call; the runtime fills in
//! the outcome (error code and text, remote side, latency) before handing it
//! back through the completion.

use std::net::SocketAddr;
use std::time::Duration;

use crate::error::{ErrorCode, RpcError};

#[derive(Debug, Clone, Default)]
pub struct Controller {
    error_code: ErrorCode,
    error_text: String,
    timeout_ms: Option<i32>,
    log_id: u64,
    remote_side: Option<SocketAddr>,
    latency: Option<Duration>,
}

impl Controller {
    pub fn new() -> Self {
        Self::default()
    }

    /// Clear outcome and options so the controller can be reused.
    pub fn reset(&mut self) {
        *self = Self::default();
    }

    // ── Outcome ──

    #[inline]
    pub fn failed(&self) -> bool {
        !self.error_code.is_ok()
    }

    #[inline]
    pub fn error_code(&self) -> ErrorCode {
        self.error_code
    }

    #[inline]
    pub fn error_text(&self) -> &str {
        &self.error_text
    }

    pub fn set_failed(&mut self, code: ErrorCode, text: impl Into<String>) {
        self.error_code = code;
        self.error_text = text.into();
    }

    /// The failure as an `RpcError`, `None` on success.
    pub fn error(&self) -> Option<RpcError> {
        self.failed()
            .then(|| RpcError::new(self.error_code, self.error_text.clone()))
    }

    #[inline]
    pub fn remote_side(&self) -> Option<SocketAddr> {
        self.remote_side
    }

    pub fn set_remote_side(&mut self, addr: SocketAddr) {
        self.remote_side = Some(addr);
    }

    /// Time from issuing the call to its completion.
    #[inline]
    pub fn latency(&self) -> Option<Duration> {
        self.latency
    }

    pub fn set_latency(&mut self, latency: Duration) {
        self.latency = Some(latency);
    }

    // ── Options ──

    /// Per-call timeout in milliseconds; overrides the channel's.
    /// Negative means no deadline.
    #[inline]
    pub fn timeout_ms(&self) -> Option<i32> {
        self.timeout_ms
    }

    pub fn set_timeout_ms(&mut self, ms: i32) {
        self.timeout_ms = Some(ms);
    }

    #[inline]
    pub fn log_id(&self) -> u64 {
        self.log_id
    }

    pub fn set_log_id(&mut self, log_id: u64) {
        self.log_id = log_id;
    }
}
