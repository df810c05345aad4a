//! Trigger kinds and next-fire computation

use std::time::Duration as StdDuration;

use chrono::{DateTime, Duration, Local, Utc, Weekday};

use crate::error::{Result, SchedulerError};
use crate::solar::{Location, SolarCalculator, SolarEventKind};
use crate::time_of_day::TimeOfDay;

/// When a task fires
#[derive(Debug, Clone, PartialEq)]
pub enum Trigger {
    /// Every `period`, on the grid `align + k * period`
    ///
    /// Without an explicit alignment the grid starts at registration time.
    Interval {
        period: StdDuration,
        align: Option<DateTime<Utc>>,
    },

    /// Every day at a local wall-clock time
    DailyAt(TimeOfDay),

    /// Every week on one day at a local wall-clock time
    WeeklyAt(Weekday, TimeOfDay),

    /// Every day relative to a solar event; `offset` may be negative
    Solar { kind: SolarEventKind, offset: Duration },

    /// Once, then the task is removed
    Once(DateTime<Utc>),
}

impl Trigger {
    pub fn interval(period: StdDuration) -> Self {
        Trigger::Interval {
            period,
            align: None,
        }
    }

    pub fn interval_aligned(period: StdDuration, align: DateTime<Utc>) -> Self {
        Trigger::Interval {
            period,
            align: Some(align),
        }
    }

    pub fn daily_at(time: TimeOfDay) -> Self {
        Trigger::DailyAt(time)
    }

    pub fn weekly_at(weekday: Weekday, time: TimeOfDay) -> Self {
        Trigger::WeeklyAt(weekday, time)
    }

    pub fn solar(kind: SolarEventKind, offset: Duration) -> Self {
        Trigger::Solar { kind, offset }
    }

    pub fn once(at: DateTime<Utc>) -> Self {
        Trigger::Once(at)
    }

    /// Reject triggers that can never fire sensibly
    pub fn validate(&self) -> Result<()> {
        match self {
            Trigger::Interval { period, .. } if period.is_zero() => {
                Err(SchedulerError::InvalidPeriod(*period))
            }
            _ => Ok(()),
        }
    }

    pub fn is_repeating(&self) -> bool {
        !matches!(self, Trigger::Once(_))
    }
}

/// What next-fire computation needs besides the trigger itself
pub(crate) struct TriggerContext<'a> {
    pub(crate) solar: &'a dyn SolarCalculator,
    pub(crate) location: Option<Location>,
}

impl TriggerContext<'_> {
    /// First instant strictly after `now` at which the trigger fires
    ///
    /// `previous` is the last scheduled instant, `None` at registration.
    /// Returns `None` when a one-shot trigger is spent.
    pub(crate) fn next_fire(
        &self,
        trigger: &Trigger,
        previous: Option<DateTime<Utc>>,
        now: DateTime<Utc>,
    ) -> Result<Option<DateTime<Utc>>> {
        let next = match trigger {
            Trigger::Interval { period, align } => {
                let chrono_period = to_chrono(*period)?;
                let anchor = previous.or(*align).unwrap_or(now);
                advance_interval(anchor, chrono_period, now)
                    .ok_or(SchedulerError::InvalidPeriod(*period))?
            }
            Trigger::DailyAt(time) => time.next_after(&now.with_timezone(&Local)),
            Trigger::WeeklyAt(weekday, time) => {
                time.next_on_weekday_after(*weekday, &now.with_timezone(&Local))
            }
            Trigger::Solar { kind, offset } => self.next_solar(*kind, *offset, now)?,
            Trigger::Once(at) => {
                if previous.is_some() {
                    return Ok(None);
                }
                *at
            }
        };
        Ok(Some(next))
    }

    fn next_solar(
        &self,
        kind: SolarEventKind,
        offset: Duration,
        now: DateTime<Utc>,
    ) -> Result<DateTime<Utc>> {
        let location = self.location.ok_or(SchedulerError::MissingLocation)?;
        let out_of_range = || SchedulerError::InvalidPeriod(magnitude(offset));

        // Want event + offset > now, i.e. event > now - offset
        let mut query = now.checked_sub_signed(offset).ok_or_else(out_of_range)?;
        for _ in 0..4 {
            let event = self.solar.next_occurrence(kind, query, &location)?;
            let fire = event.checked_add_signed(offset).ok_or_else(out_of_range)?;
            if fire > now {
                return Ok(fire);
            }
            query = event + Duration::seconds(1);
        }

        Err(SchedulerError::SolarEventUnavailable {
            kind,
            date: now.date_naive().to_string(),
        })
    }
}

/// Move `previous` forward by whole periods until it lies strictly after `now`
///
/// Missed periods are skipped, not replayed: after a long suspension the
/// task fires once and lands back on its grid. Returns `None` when the next
/// grid point lies beyond the representable range.
pub fn advance_interval(
    previous: DateTime<Utc>,
    period: Duration,
    now: DateTime<Utc>,
) -> Option<DateTime<Utc>> {
    if previous > now || period <= Duration::zero() {
        return Some(previous.max(now));
    }

    let period_ms = period.num_milliseconds().max(1);
    let behind_ms = (now - previous).num_milliseconds();
    let steps = behind_ms / period_ms + 1;
    previous.checked_add_signed(Duration::milliseconds(period_ms.checked_mul(steps)?))
}

fn magnitude(offset: Duration) -> StdDuration {
    let positive = if offset < Duration::zero() { -offset } else { offset };
    positive.to_std().unwrap_or(StdDuration::MAX)
}

fn to_chrono(period: StdDuration) -> Result<Duration> {
    if period.is_zero() {
        return Err(SchedulerError::InvalidPeriod(period));
    }
    Duration::from_std(period).map_err(|_| SchedulerError::InvalidPeriod(period))
}
