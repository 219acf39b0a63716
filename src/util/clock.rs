//! Wall-clock helpers. The engine itself never reads the clock; callers
//! pass `now_ms` in so sweeps and expiry stay deterministic under test.

use std::time::{Duration, SystemTime, UNIX_EPOCH};

/// Milliseconds since the Unix epoch.
#[must_use]
pub fn now_ms() -> u128 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or(Duration::ZERO)
        .as_millis()
}

/// Convert whole seconds to milliseconds.
#[must_use]
pub const fn secs_to_ms(secs: u64) -> u128 {
    secs as u128 * 1000
}
