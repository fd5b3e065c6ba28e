//! Time source for schedule-aware cascade rules.

use std::time::{SystemTime, UNIX_EPOCH};

/// Supplies the current time in Unix epoch milliseconds.
pub trait Clock {
    fn now_ms(&self) -> i64;
}

/// Wall clock.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now_ms(&self) -> i64 {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map_or(0, |elapsed| {
                i64::try_from(elapsed.as_millis()).unwrap_or(i64::MAX)
            })
    }
}

/// Clock pinned to one instant, for deterministic schedules.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FixedClock(pub i64);

impl Clock for FixedClock {
    fn now_ms(&self) -> i64 {
        self.0
    }
}

#[cfg(test)]
mod tests {
    use super::{Clock, FixedClock, SystemClock};

    #[test]
    fn fixed_clock_is_stable_and_system_clock_is_after_2020() {
        let clock = FixedClock(1_700_000_000_000);
        assert_eq!(clock.now_ms(), clock.now_ms());
        assert!(SystemClock.now_ms() > 1_577_836_800_000);
    }
}
