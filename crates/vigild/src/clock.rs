//! Time source for the detection loop and batcher.

use chrono::{DateTime, Utc};
use tokio::time::Instant;

pub trait Clock: Send + Sync {
    /// Monotonic time used for debouncing.
    fn now(&self) -> Instant;

    /// Wall-clock time stamped onto event records.
    fn wall(&self) -> DateTime<Utc>;
}

/// Tokio's clock plus the system wall clock. Under paused tokio time the
/// monotonic half follows the test's virtual time.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> Instant {
        Instant::now()
    }

    fn wall(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

#[cfg(test)]
pub use manual::ManualClock;


#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use std::time::Duration;

    #[test]
    fn test_manual_clock_advances_both_halves() {
        let start = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();
        let clock = ManualClock::new(start);
        let t0 = clock.now();

        clock.advance(Duration::from_millis(1500));

        assert_eq!(clock.now() - t0, Duration::from_millis(1500));
        assert_eq!(clock.wall(), start + chrono::Duration::milliseconds(1500));
    }
}
