//! Environment variable overrides
//!
//! Every tunable in the runtime has a compiled-in default that an
//! environment variable may override. Unparseable values fall back to the
//! default rather than failing startup.
//!
//! ```ignore
//! use urpc_core::env::{env_get, env_get_bool, timeout_from_ms};
//!
//! let max_events: usize = env_get("URPC_MAX_EVENTS", 32);
//! let reuse_port = env_get_bool("URPC_REUSE_PORT", false);
//! let call_timeout = timeout_from_ms(env_get("URPC_TIMEOUT_MS", 500));
//! ```

use std::str::FromStr;
use std::time::Duration;

/// Parse `key` as `T`, or return `default` if unset or unparseable.
#[inline]
pub fn env_get<T>(key: &str, default: T) -> T
where
    T: FromStr,
{
    env_get_opt(key).unwrap_or(default)
}

/// Parse `key` as `T`; `None` if unset or unparseable.
#[inline]
pub fn env_get_opt<T>(key: &str) -> Option<T>
where
    T: FromStr,
{
    std::env::var(key).ok().and_then(|v| v.trim().parse().ok())
}

/// Boolean flag: "1", "true", "yes", "on" (any case) are true, anything
/// else set is false, unset is `default`.
#[inline]
pub fn env_get_bool(key: &str, default: bool) -> bool {
    match std::env::var(key) {
        Ok(val) => matches!(
            val.trim().to_ascii_lowercase().as_str(),
            "1" | "true" | "yes" | "on"
        ),
        Err(_) => default,
    }
}

/// Millisecond timeout in the channel-option convention: negative means
/// wait forever (`None`), zero and above is a bounded wait.
#[inline]
pub fn timeout_from_ms(ms: i32) -> Option<Duration> {
    if ms < 0 {
        None
    } else {
        Some(Duration::from_millis(ms as u64))
    }
}

// ============================================================================
// Tests
// ============================================================================
