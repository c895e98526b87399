use std::time::Duration;
use std::time::SystemTime;
use std::time::UNIX_EPOCH;

use rand::Rng;

/// return millisecond
pub(crate) fn now_millis() -> u64 {
    let now = SystemTime::now();
    let since_epoch = now.duration_since(UNIX_EPOCH).unwrap_or_default();
    since_epoch.as_millis() as u64
}

/// Adds a uniformly random extra delay in `[0, jitter]` to `base`
pub(crate) fn with_jitter(
    base: Duration,
    jitter: Duration,
) -> Duration {
    if jitter.is_zero() {
        return base;
    }
    let extra = rand::thread_rng().gen_range(0..=jitter.as_millis() as u64);
    base + Duration::from_millis(extra)
}
