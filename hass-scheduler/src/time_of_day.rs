//! Wall-clock time within a day

use std::fmt;
use std::str::FromStr;

use chrono::{
    DateTime, Datelike, Duration, LocalResult, NaiveDate, NaiveTime, TimeZone, Timelike, Utc,
    Weekday,
};

use crate::error::{Result, SchedulerError};

/// A time of day in `[00:00:00, 24:00:00)`
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct TimeOfDay(NaiveTime);

impl TimeOfDay {
    /// Build from hour, minute, second
    pub fn new(hour: u32, minute: u32, second: u32) -> Result<Self> {
        NaiveTime::from_hms_opt(hour, minute, second)
            .map(TimeOfDay)
            .ok_or_else(|| {
                SchedulerError::InvalidTimeOfDay(format!("{:02}:{:02}:{:02}", hour, minute, second))
            })
    }

    pub fn midnight() -> Self {
        TimeOfDay(NaiveTime::MIN)
    }

    pub fn noon() -> Self {
        TimeOfDay(NaiveTime::MIN + Duration::hours(12))
    }

    pub fn hour(&self) -> u32 {
        self.0.hour()
    }

    pub fn minute(&self) -> u32 {
        self.0.minute()
    }

    pub fn second(&self) -> u32 {
        self.0.second()
    }

    pub fn as_naive(&self) -> NaiveTime {
        self.0
    }

    /// Next instant strictly after `now` at which the wall clock of `now`'s
    /// time zone reads this time
    ///
    /// A time skipped by a DST transition fires at the first valid instant
    /// after the gap; a time that occurs twice fires at the earlier one.
    pub fn next_after<Tz: TimeZone>(&self, now: &DateTime<Tz>) -> DateTime<Utc> {
        let timezone = now.timezone();
        let now_utc = now.with_timezone(&Utc);
        let today = now.date_naive();

        for day_offset in 0..=2 {
            let Some(date) = today.checked_add_signed(Duration::days(day_offset)) else {
                break;
            };
            if let Some(candidate) = self.on_date(&timezone, date) {
                if candidate > now_utc {
                    return candidate;
                }
            }
        }

        // Only reachable at the edge of the representable range
        now_utc + Duration::days(1)
    }

    /// Like [`next_after`](Self::next_after), restricted to one day of the
    /// week in `now`'s time zone
    pub fn next_on_weekday_after<Tz: TimeZone>(
        &self,
        weekday: Weekday,
        now: &DateTime<Tz>,
    ) -> DateTime<Utc> {
        let timezone = now.timezone();
        let now_utc = now.with_timezone(&Utc);
        let today = now.date_naive();

        for day_offset in 0..=7 {
            let Some(date) = today.checked_add_signed(Duration::days(day_offset)) else {
                break;
            };
            if date.weekday() != weekday {
                continue;
            }
            if let Some(candidate) = self.on_date(&timezone, date) {
                if candidate > now_utc {
                    return candidate;
                }
            }
        }

        now_utc + Duration::weeks(1)
    }

    fn on_date<Tz: TimeZone>(&self, timezone: &Tz, date: NaiveDate) -> Option<DateTime<Utc>> {
        let local = date.and_time(self.0);
        match timezone.from_local_datetime(&local) {
            LocalResult::Single(dt) => Some(dt.with_timezone(&Utc)),
            LocalResult::Ambiguous(earliest, _) => Some(earliest.with_timezone(&Utc)),
            LocalResult::None => {
                // Inside a DST gap: walk forward to the first valid minute
                (1..=180).find_map(|minutes| {
                    timezone
                        .from_local_datetime(&(local + Duration::minutes(minutes)))
                        .earliest()
                        .map(|dt| dt.with_timezone(&Utc))
                })
            }
        }
    }
}

impl From<NaiveTime> for TimeOfDay {
    fn from(time: NaiveTime) -> Self {
        TimeOfDay(time)
    }
}

impl fmt::Display for TimeOfDay {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0.format("%H:%M:%S"))
    }
}

impl FromStr for TimeOfDay {
    type Err = SchedulerError;

    /// Parses `HH:MM` or `HH:MM:SS`
    fn from_str(s: &str) -> Result<Self> {
        NaiveTime::parse_from_str(s, "%H:%M:%S")
            .or_else(|_| NaiveTime::parse_from_str(s, "%H:%M"))
            .map(TimeOfDay)
            .map_err(|_| SchedulerError::InvalidTimeOfDay(s.to_string()))
    }
}
