//! Walletgate - A multi-tenant gateway that spawns one worker per wallet
//!
//! This library provides a gateway that:
//! - Resolves the capability token addressing a wallet, directly or through
//!   an anchor id bound in an httpOnly cookie
//! - Lazily starts an isolated runtime unit per token, at most once at a time
//! - Forwards the HTTP exchange to that unit over loopback with a per-worker
//!   authorization secret
//! - Serves a fixed fallback page when a wallet cannot be readied

pub mod config;
pub mod cookie;
pub mod error;
pub mod forward;
pub mod gateway;
pub mod identity;
pub mod launcher;
pub mod worker;

pub const VERSION: &str = env!("CARGO_PKG_VERSION");
pub const PKG_NAME: &str = env!("CARGO_PKG_NAME");

/// Number of leading characters of a secret that may appear in logs
const REDACTED_PREFIX_LEN: usize = 8;

/// Shorten a token or key for logging
pub fn redact(secret: &str) -> String {
    let mut chars = secret.chars();
    let prefix: String = chars.by_ref().take(REDACTED_PREFIX_LEN).collect();
    if chars.next().is_some() {
        format!("{}...", prefix)
    } else {
        prefix
    }
}
