//! Time utilities and constants for the coordination engine.

use chrono::{DateTime, Utc};
use std::time::{Duration, Instant};

use crate::error::{CoordinationError, Result};

/// Engine timing constants.
pub mod constants {
    use std::time::Duration;

    /// Default bound on waiting for a participant held elsewhere (30 seconds).
    pub fn default_lock_acquire_timeout() -> Duration {
        Duration::from_secs(30)
    }

    /// Granularity used when polling for termination in tests and tools (10 milliseconds).
    pub fn poll_interval() -> Duration {
        Duration::from_millis(10)
    }
}

/// A wall-clock timestamp (always UTC).
pub type Timestamp = DateTime<Utc>;

/// Get the current timestamp.
pub fn now() -> Timestamp {
    Utc::now()
}

/// Validate a millisecond timeout coming from the API surface.
///
/// Zero means "no timeout"; negative values are rejected.
pub fn validate_timeout_ms(timeout_ms: i64) -> Result<u64> {
    u64::try_from(timeout_ms).map_err(|_| CoordinationError::InvalidTimeout(timeout_ms))
}

/// Compute a deadline `timeout_ms` from now, or `None` for zero.
pub fn deadline_after(timeout_ms: u64) -> Option<Instant> {
    (timeout_ms > 0).then(|| Instant::now() + Duration::from_millis(timeout_ms))
}

/// Remaining time until `deadline`, saturating at zero.
pub fn remaining(deadline: Instant) -> Duration {
    deadline.saturating_duration_since(Instant::now())
}

/// Duration as whole milliseconds, saturating.
pub fn as_millis(duration: Duration) -> u64 {
    u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_validate_timeout() {
        assert_eq!(validate_timeout_ms(0).unwrap(), 0);
        assert_eq!(validate_timeout_ms(50).unwrap(), 50);
        assert!(matches!(
            validate_timeout_ms(-5),
            Err(CoordinationError::InvalidTimeout(-5))
        ));
    }

    #[test]
    fn test_deadline_after() {
        assert!(deadline_after(0).is_none());

        let deadline = deadline_after(10_000).unwrap();
        assert!(remaining(deadline) > Duration::from_secs(9));
    }

    #[test]
    fn test_remaining_saturates() {
        let past = Instant::now();
        std::thread::sleep(Duration::from_millis(2));
        assert_eq!(remaining(past), Duration::ZERO);
    }
}
