//! Shared utility functions
//! Timestamps and identifier generation used across the codebase

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

/// Atomic counter that keeps ids generated within the same millisecond ordered
static ID_COUNTER: AtomicU64 = AtomicU64::new(0);

/// Get current Unix timestamp in milliseconds
#[inline]
#[must_use]
pub fn current_timestamp_millis() -> u128 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis()
}

/// Generate a time-ordered unique id: `<prefix>_<millis>_<counter>_<random>`.
///
/// The millisecond and counter parts are zero padded so that lexicographic
/// order of ids (and therefore sled key order) follows creation order.
#[must_use]
pub fn generate_id(prefix: &str) -> String {
    // Relaxed ordering is sufficient for uniqueness
    let counter = ID_COUNTER.fetch_add(1, Ordering::Relaxed) % 1_000_000;
    let random: u32 = rand::random();
    format!(
        "{}_{:015}_{:06}_{:08x}",
        prefix,
        current_timestamp_millis(),
        counter,
        random
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_timestamp() {
        let ts = current_timestamp_millis();
        // Should be after 2024
        assert!(ts > 1_704_067_200_000);
    }

    #[test]
    fn test_generated_ids_are_unique_and_ordered() {
        let first = generate_id("msg");
        let second = generate_id("msg");

        assert!(first.starts_with("msg_"));
        assert_ne!(first, second);
        // Ids created later never sort before earlier ones (ignoring counter wrap)
        assert!(first[..26] <= second[..26]);
    }
}
