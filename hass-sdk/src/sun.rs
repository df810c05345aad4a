//! The `sun.sun` entity
//!
//! [`Sun`] is a typed view over the server's sun entity, reached through
//! [`HassClient::sun`]. [`SunEntityCalculator`] lets the scheduler take its
//! solar times from that same entity instead of computing them locally.

use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use hass_api::StateRecord;
use hass_scheduler::{
    Location, SchedulerError, SolarCalculator, SolarEventKind, TaskError, TaskHandle,
};
use state_store::StateStore;

use crate::client::HassClient;
use crate::error::{Result, SdkError};

/// Entity id of the sun
pub const SUN_ENTITY: &str = "sun.sun";

/// State of the sun entity
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SunState {
    AboveHorizon,
    BelowHorizon,
}

impl SunState {
    pub fn as_str(&self) -> &'static str {
        match self {
            SunState::AboveHorizon => "above_horizon",
            SunState::BelowHorizon => "below_horizon",
        }
    }
}

impl fmt::Display for SunState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SunState {
    type Err = SdkError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "above_horizon" => Ok(SunState::AboveHorizon),
            "below_horizon" => Ok(SunState::BelowHorizon),
            other => Err(SdkError::UnexpectedState {
                entity_id: SUN_ENTITY.to_string(),
                state: other.to_string(),
            }),
        }
    }
}

/// Attribute of `sun.sun` holding the next occurrence of a solar event
fn attribute_for(kind: SolarEventKind) -> &'static str {
    match kind {
        SolarEventKind::Sunrise => "next_rising",
        SolarEventKind::Sunset => "next_setting",
        SolarEventKind::Dawn => "next_dawn",
        SolarEventKind::Dusk => "next_dusk",
        SolarEventKind::SolarNoon => "next_noon",
        SolarEventKind::SolarMidnight => "next_midnight",
    }
}

/// Typed view of the `sun.sun` entity
///
/// Every accessor reads the current snapshot, so values follow the server
/// as it updates the entity.
#[derive(Clone)]
pub struct Sun {
    client: HassClient,
}

impl Sun {
    pub(crate) fn new(client: HassClient) -> Self {
        Self { client }
    }

    /// The full record as last reported
    pub fn record(&self) -> Result<StateRecord> {
        self.client.get_state(SUN_ENTITY)
    }

    pub fn state(&self) -> Result<SunState> {
        self.record()?.state.parse()
    }

    pub fn is_up(&self) -> Result<bool> {
        Ok(self.state()? == SunState::AboveHorizon)
    }

    fn time(&self, kind: SolarEventKind) -> Result<DateTime<Utc>> {
        Ok(self.record()?.attribute(attribute_for(kind))?)
    }

    pub fn next_rising(&self) -> Result<DateTime<Utc>> {
        self.time(SolarEventKind::Sunrise)
    }

    pub fn next_setting(&self) -> Result<DateTime<Utc>> {
        self.time(SolarEventKind::Sunset)
    }

    pub fn next_dawn(&self) -> Result<DateTime<Utc>> {
        self.time(SolarEventKind::Dawn)
    }

    pub fn next_dusk(&self) -> Result<DateTime<Utc>> {
        self.time(SolarEventKind::Dusk)
    }

    pub fn next_noon(&self) -> Result<DateTime<Utc>> {
        self.time(SolarEventKind::SolarNoon)
    }

    pub fn next_midnight(&self) -> Result<DateTime<Utc>> {
        self.time(SolarEventKind::SolarMidnight)
    }

    /// Degrees above the horizon
    pub fn elevation(&self) -> Result<f64> {
        Ok(self.record()?.attribute("elevation")?)
    }

    /// Compass direction in degrees
    pub fn azimuth(&self) -> Result<f64> {
        Ok(self.record()?.attribute("azimuth")?)
    }

    /// Whether the sun is currently rising (morning half of the day)
    pub fn rising(&self) -> Result<bool> {
        Ok(self.record()?.attribute("rising")?)
    }

    // ========================================================================
    // Scheduling helpers
    // ========================================================================

    /// Run `callback` every day at `kind` shifted by `offset`
    pub fn on_event<F, Fut>(&self, kind: SolarEventKind, offset: Duration, callback: F) -> Result<TaskHandle>
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: std::future::Future<Output = std::result::Result<(), TaskError>> + Send + 'static,
    {
        Ok(self
            .client
            .scheduler()
            .run_every_day_at_solar(kind, offset, callback)?)
    }

    pub fn on_sunrise<F, Fut>(&self, callback: F) -> Result<TaskHandle>
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: std::future::Future<Output = std::result::Result<(), TaskError>> + Send + 'static,
    {
        self.on_event(SolarEventKind::Sunrise, Duration::zero(), callback)
    }

    pub fn on_sunset<F, Fut>(&self, callback: F) -> Result<TaskHandle>
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: std::future::Future<Output = std::result::Result<(), TaskError>> + Send + 'static,
    {
        self.on_event(SolarEventKind::Sunset, Duration::zero(), callback)
    }

    pub fn on_dawn<F, Fut>(&self, callback: F) -> Result<TaskHandle>
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: std::future::Future<Output = std::result::Result<(), TaskError>> + Send + 'static,
    {
        self.on_event(SolarEventKind::Dawn, Duration::zero(), callback)
    }

    pub fn on_dusk<F, Fut>(&self, callback: F) -> Result<TaskHandle>
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: std::future::Future<Output = std::result::Result<(), TaskError>> + Send + 'static,
    {
        self.on_event(SolarEventKind::Dusk, Duration::zero(), callback)
    }

    pub fn on_noon<F, Fut>(&self, callback: F) -> Result<TaskHandle>
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: std::future::Future<Output = std::result::Result<(), TaskError>> + Send + 'static,
    {
        self.on_event(SolarEventKind::SolarNoon, Duration::zero(), callback)
    }

    pub fn on_midnight<F, Fut>(&self, callback: F) -> Result<TaskHandle>
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: std::future::Future<Output = std::result::Result<(), TaskError>> + Send + 'static,
    {
        self.on_event(SolarEventKind::SolarMidnight, Duration::zero(), callback)
    }
}

impl fmt::Debug for Sun {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Sun").field("state", &self.state().ok()).finish()
    }
}

/// Solar times read from the `sun.sun` entity snapshot
///
/// The entity only reports the next occurrence of each event. Queries
/// further ahead than that are answered by stepping the reported time
/// forward in whole days, which drifts by a few minutes per week; the
/// entity is refreshed by the server long before that matters.
#[derive(Debug, Clone)]
pub struct SunEntityCalculator {
    store: Arc<StateStore>,
}

impl SunEntityCalculator {
    pub fn new(store: Arc<StateStore>) -> Self {
        Self { store }
    }
}

impl SolarCalculator for SunEntityCalculator {
    fn next_occurrence(
        &self,
        kind: SolarEventKind,
        at_or_after: DateTime<Utc>,
        _location: &Location,
    ) -> hass_scheduler::Result<DateTime<Utc>> {
        let record = self
            .store
            .get(SUN_ENTITY)
            .ok_or_else(|| SchedulerError::SolarSource(format!("{} is not in the snapshot", SUN_ENTITY)))?;
        let reported: DateTime<Utc> = record
            .attribute(attribute_for(kind))
            .map_err(|e| SchedulerError::SolarSource(e.to_string()))?;

        if reported >= at_or_after {
            return Ok(reported);
        }
        let behind = at_or_after - reported;
        let days = (behind.num_seconds() + 86_399) / 86_400;
        Ok(reported + Duration::days(days))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn store_with_sun() -> Arc<StateStore> {
        let store = Arc::new(StateStore::new());
        store.upsert(
            StateRecord::new(SUN_ENTITY, "below_horizon")
                .with_attribute("next_rising", "2024-04-11T05:02:11+00:00")
                .with_attribute("next_setting", "2024-04-10T18:40:00.123456+00:00")
                .with_attribute("elevation", -12.5),
        );
        store
    }

    fn anywhere() -> Location {
        Location::new(0.0, 0.0).unwrap()
    }

    #[test]
    fn test_sun_state_parse() {
        assert_eq!("above_horizon".parse::<SunState>().unwrap(), SunState::AboveHorizon);
        assert!(matches!(
            "sideways".parse::<SunState>(),
            Err(SdkError::UnexpectedState { .. })
        ));
    }

    #[test]
    fn test_calculator_uses_reported_time() {
        let calc = SunEntityCalculator::new(store_with_sun());
        let query = Utc.with_ymd_and_hms(2024, 4, 10, 20, 0, 0).unwrap();
        let next = calc.next_occurrence(SolarEventKind::Sunrise, query, &anywhere()).unwrap();
        assert_eq!(next, Utc.with_ymd_and_hms(2024, 4, 11, 5, 2, 11).unwrap());
    }

    #[test]
    fn test_calculator_steps_whole_days() {
        let calc = SunEntityCalculator::new(store_with_sun());
        let query = Utc.with_ymd_and_hms(2024, 4, 12, 6, 0, 0).unwrap();
        let next = calc.next_occurrence(SolarEventKind::Sunrise, query, &anywhere()).unwrap();
        assert_eq!(next, Utc.with_ymd_and_hms(2024, 4, 13, 5, 2, 11).unwrap());
    }

    #[test]
    fn test_calculator_missing_attribute() {
        let calc = SunEntityCalculator::new(store_with_sun());
        let result = calc.next_occurrence(SolarEventKind::Dusk, Utc::now(), &anywhere());
        assert!(matches!(result, Err(SchedulerError::SolarSource(_))));
    }

    proptest::proptest! {
        #[test]
        fn prop_stepped_time_is_next_whole_day(behind_secs in 0i64..(60 * 86_400)) {
            let calc = SunEntityCalculator::new(store_with_sun());
            let reported = Utc.with_ymd_and_hms(2024, 4, 11, 5, 2, 11).unwrap();
            let query = reported + Duration::seconds(behind_secs);

            let next = calc.next_occurrence(SolarEventKind::Sunrise, query, &anywhere()).unwrap();
            proptest::prop_assert!(next >= query);
            proptest::prop_assert!(next - query < Duration::days(1));
            proptest::prop_assert_eq!((next - reported).num_seconds() % 86_400, 0);
        }
    }

    #[test]
    fn test_calculator_without_sun_entity() {
        let calc = SunEntityCalculator::new(Arc::new(StateStore::new()));
        let result = calc.next_occurrence(SolarEventKind::Sunset, Utc::now(), &anywhere());
        assert!(matches!(result, Err(SchedulerError::SolarSource(_))));
    }
}
