use std::time::Duration;

use rand::Rng;

// Exponents beyond this would make the base delay longer than any sane
// unattended retry horizon; clamp instead of overflowing.
const MAX_BACKOFF_EXPONENT: u32 = 10;

/// Delay before re-enqueueing a failed attempt: `2^retry_count` seconds
/// scaled by a jitter factor in [1.0, 1.5) so that several jobs failing at
/// once do not thunder back into the queue together. The base delay is a
/// floor; jitter only ever stretches it.
pub(crate) fn backoff_delay(retry_count: u32) -> Duration {
    let exponent = retry_count.min(MAX_BACKOFF_EXPONENT);
    let base_secs = 1u64 << exponent;
    let jitter: f64 = rand::rng().random_range(1.0..1.5);
    Duration::from_millis(((base_secs * 1_000) as f64 * jitter) as u64)
}
