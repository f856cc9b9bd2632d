//! Shared utilities for the xDS services.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

static NONCE_COUNTER: AtomicU64 = AtomicU64::new(0);

/// Generate a unique nonce for xDS responses.
///
/// Nonces correlate requests and responses in the xDS protocol. The format
/// is `{timestamp_hex}-{counter_hex}`; the atomic counter keeps nonces
/// unique even when two responses land in the same nanosecond.
pub fn generate_nonce() -> String {
    let timestamp = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_nanos() as u64;
    let count = NONCE_COUNTER.fetch_add(1, Ordering::Relaxed);
    format!("{timestamp:x}-{count:x}")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn nonce_unique() {
        assert_ne!(generate_nonce(), generate_nonce());
    }

    #[test]
    fn nonce_format() {
        assert!(generate_nonce().contains('-'));
    }
}
