use std::time::{Duration, SystemTime, UNIX_EPOCH};

/// A clock before the epoch is treated as the epoch itself.
fn unix_epoch_elapsed() -> Duration {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or(Duration::ZERO)
}

/// Milliseconds since the Unix epoch, saturating at `u64::MAX`.
pub fn current_unix_timestamp_ms() -> u64 {
    u64::try_from(unix_epoch_elapsed().as_millis()).unwrap_or(u64::MAX)
}

/// Whole seconds since the Unix epoch.
pub fn current_unix_timestamp() -> u64 {
    unix_epoch_elapsed().as_secs()
}
