//! Solar event computation
//!
//! The scheduler asks a [`SolarCalculator`] for the next occurrence of a
//! solar event every time a solar task fires, so seasonal drift is tracked
//! without any caching on our side.

use std::fmt;

use chrono::{DateTime, Duration, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use sunrise::{Coordinates, DawnType, SolarDay, SolarEvent};

use crate::error::{Result, SchedulerError};

/// Solar events a task can be anchored to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SolarEventKind {
    Sunrise,
    Sunset,
    /// Civil dawn, sun 6° below the horizon in the morning
    Dawn,
    /// Civil dusk, sun 6° below the horizon in the evening
    Dusk,
    /// Sun at its highest point
    SolarNoon,
    /// Sun at its lowest point
    SolarMidnight,
}

impl SolarEventKind {
    pub const ALL: [SolarEventKind; 6] = [
        SolarEventKind::Sunrise,
        SolarEventKind::Sunset,
        SolarEventKind::Dawn,
        SolarEventKind::Dusk,
        SolarEventKind::SolarNoon,
        SolarEventKind::SolarMidnight,
    ];
}

impl fmt::Display for SolarEventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            SolarEventKind::Sunrise => "sunrise",
            SolarEventKind::Sunset => "sunset",
            SolarEventKind::Dawn => "dawn",
            SolarEventKind::Dusk => "dusk",
            SolarEventKind::SolarNoon => "solar noon",
            SolarEventKind::SolarMidnight => "solar midnight",
        };
        f.write_str(name)
    }
}

/// Observer position on Earth
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Location {
    pub latitude: f64,
    pub longitude: f64,
}

impl Location {
    /// Validated constructor
    pub fn new(latitude: f64, longitude: f64) -> Result<Self> {
        let location = Self {
            latitude,
            longitude,
        };
        location.validate()?;
        Ok(location)
    }

    pub fn validate(&self) -> Result<()> {
        let valid = (-90.0..=90.0).contains(&self.latitude)
            && (-180.0..=180.0).contains(&self.longitude);
        if valid {
            Ok(())
        } else {
            Err(SchedulerError::InvalidLocation {
                latitude: self.latitude,
                longitude: self.longitude,
            })
        }
    }

    fn coordinates(&self) -> Result<Coordinates> {
        Coordinates::new(self.latitude, self.longitude).ok_or(SchedulerError::InvalidLocation {
            latitude: self.latitude,
            longitude: self.longitude,
        })
    }
}

/// Source of solar event times
#[cfg_attr(test, mockall::automock)]
pub trait SolarCalculator: Send + Sync {
    /// The first occurrence of `kind` at or after `at_or_after`
    fn next_occurrence(
        &self,
        kind: SolarEventKind,
        at_or_after: DateTime<Utc>,
        location: &Location,
    ) -> Result<DateTime<Utc>>;
}

/// Astronomical computation via the `sunrise` crate
///
/// Solar noon is the midpoint between sunrise and sunset of the same day;
/// solar midnight is the midpoint between a sunset and the following
/// sunrise.
#[derive(Debug, Clone, Copy, Default)]
pub struct SunriseCalculator;

impl SunriseCalculator {
    pub fn new() -> Self {
        Self
    }

    fn event_on(kind: SolarEventKind, date: NaiveDate, coordinates: Coordinates) -> Option<DateTime<Utc>> {
        let day = SolarDay::new(coordinates, date);
        let time = match kind {
            SolarEventKind::Sunrise => day.event_time(SolarEvent::Sunrise),
            SolarEventKind::Sunset => day.event_time(SolarEvent::Sunset),
            SolarEventKind::Dawn => day.event_time(SolarEvent::Dawn(DawnType::Civil)),
            SolarEventKind::Dusk => day.event_time(SolarEvent::Dusk(DawnType::Civil)),
            SolarEventKind::SolarNoon => {
                let rise = day.event_time(SolarEvent::Sunrise);
                let set = day.event_time(SolarEvent::Sunset);
                midpoint(rise, set)?
            }
            SolarEventKind::SolarMidnight => {
                let set = day.event_time(SolarEvent::Sunset);
                let next_day = date.succ_opt()?;
                let rise = SolarDay::new(coordinates, next_day).event_time(SolarEvent::Sunrise);
                midpoint(set, rise)?
            }
        };
        Some(time)
    }
}

fn midpoint(start: DateTime<Utc>, end: DateTime<Utc>) -> Option<DateTime<Utc>> {
    if end <= start {
        return None;
    }
    Some(start + (end - start) / 2)
}

impl SolarCalculator for SunriseCalculator {
    fn next_occurrence(
        &self,
        kind: SolarEventKind,
        at_or_after: DateTime<Utc>,
        location: &Location,
    ) -> Result<DateTime<Utc>> {
        let coordinates = location.coordinates()?;
        let start = at_or_after.date_naive();

        // The event for a UTC date can fall on the previous or next UTC day
        // far from the prime meridian, so look one day either side.
        for offset in -1..=2 {
            let Some(date) = start.checked_add_signed(Duration::days(offset)) else {
                continue;
            };
            if let Some(time) = Self::event_on(kind, date, coordinates) {
                if time >= at_or_after {
                    return Ok(time);
                }
            }
        }

        Err(SchedulerError::SolarEventUnavailable {
            kind,
            date: start.to_string(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Timelike};
    use rstest::rstest;

    fn london() -> Location {
        Location::new(51.5074, -0.1278).unwrap()
    }

    #[test]
    fn test_location_validation() {
        assert!(Location::new(91.0, 0.0).is_err());
        assert!(Location::new(0.0, -181.0).is_err());
        assert!(Location::new(-33.86, 151.2).is_ok());
    }

    #[rstest]
    #[case(SolarEventKind::Dawn)]
    #[case(SolarEventKind::Sunrise)]
    #[case(SolarEventKind::SolarNoon)]
    #[case(SolarEventKind::Sunset)]
    #[case(SolarEventKind::Dusk)]
    #[case(SolarEventKind::SolarMidnight)]
    fn test_next_occurrence_is_not_before_query(#[case] kind: SolarEventKind) {
        let query = Utc.with_ymd_and_hms(2024, 6, 21, 12, 0, 0).unwrap();
        let next = SunriseCalculator.next_occurrence(kind, query, &london()).unwrap();
        assert!(next >= query);
        assert!(next - query < Duration::hours(25));
    }

    #[test]
    fn test_london_midsummer_order() {
        let midnight = Utc.with_ymd_and_hms(2024, 6, 21, 0, 0, 0).unwrap();
        let calc = SunriseCalculator;
        let dawn = calc.next_occurrence(SolarEventKind::Dawn, midnight, &london()).unwrap();
        let rise = calc.next_occurrence(SolarEventKind::Sunrise, midnight, &london()).unwrap();
        let noon = calc.next_occurrence(SolarEventKind::SolarNoon, midnight, &london()).unwrap();
        let set = calc.next_occurrence(SolarEventKind::Sunset, midnight, &london()).unwrap();
        let dusk = calc.next_occurrence(SolarEventKind::Dusk, midnight, &london()).unwrap();

        assert!(dawn < rise && rise < noon && noon < set && set < dusk);
        // Sunrise in London around midsummer is shortly before 04:00 UTC
        assert!((3..=4).contains(&rise.hour()));
        // Solar noon is close to 12:00 UTC at this longitude
        assert!((11..=12).contains(&noon.hour()));
    }
}
