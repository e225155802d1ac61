//! Wall-clock helpers
//!
//! Cross-process state (leases, invalidation stamps, fetch times) is exchanged
//! as milliseconds since the Unix epoch so every process agrees on its meaning.

use chrono::Utc;

/// Current wall-clock time in milliseconds since the Unix epoch
#[inline]
#[must_use]
pub fn now_ms() -> i64 {
    Utc::now().timestamp_millis()
}
