use std::time::{SystemTime, UNIX_EPOCH};

/// Current time as unix seconds.
///
/// Falls back to 0 if the system clock is before the epoch, which only
/// happens on a badly misconfigured host.
pub(crate) fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}
