use std::time::{SystemTime, UNIX_EPOCH};

use ulid::Ulid;

/// Returns current unix epoch milliseconds.
///
/// A clock set before the epoch reads as 0.
pub fn now_ms() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|dur| dur.as_millis() as i64)
        .unwrap_or(0)
}

/// Generates a new ULID.
pub fn new_ulid() -> Ulid {
    Ulid::new()
}
