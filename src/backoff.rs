//! Retry policies. Pure functions only; the loops that sleep live in
//! [`crate::sender`].

use std::time::Duration;

/// Ceiling for the durable outbox schedule.
pub const OUTBOX_BACKOFF_CAP_SECONDS: u64 = 300;

/// Delays between attempts on the best-effort path: at most three retries.
pub const IMMEDIATE_RETRY_DELAYS: [Duration; 3] = [
    Duration::from_secs(1),
    Duration::from_secs(2),
    Duration::from_secs(5),
];

/// Seconds until the next outbox attempt after `attempts` failures:
/// `min(300, 2^min(attempts, 8))`.
pub fn outbox_backoff_seconds(attempts: u32) -> u64 {
    let exp = attempts.min(8);
    (1u64 << exp).min(OUTBOX_BACKOFF_CAP_SECONDS)
}
