//! Wall-clock source

use chrono::{DateTime, Utc};

/// Source of the current wall-clock time
///
/// The scheduler reads the clock every time it wakes, so a clock that jumps
/// (system suspend, NTP adjustment) is handled like any other late wake-up.
pub trait Clock: Send + Sync + 'static {
    fn now(&self) -> DateTime<Utc>;
}

/// The system clock
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}
