//! Error types for the scheduler

use std::time::Duration;

use chrono::{DateTime, Utc};

use crate::solar::SolarEventKind;

/// Boxed error returned by task callbacks
pub type TaskError = Box<dyn std::error::Error + Send + Sync>;

/// Errors that can occur while registering or computing triggers
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum SchedulerError {
    /// Interval tasks need a non-zero period
    #[error("Invalid period: {0:?}")]
    InvalidPeriod(Duration),

    /// Hour, minute or second out of range
    #[error("Invalid time of day: {0}")]
    InvalidTimeOfDay(String),

    /// A solar trigger was registered before a location was known
    #[error("No location configured for solar triggers")]
    MissingLocation,

    /// Latitude/longitude out of range
    #[error("Invalid location: latitude {latitude}, longitude {longitude}")]
    InvalidLocation { latitude: f64, longitude: f64 },

    /// The solar event does not occur near the requested date (polar day or night)
    #[error("{kind} does not occur near {date}")]
    SolarEventUnavailable { kind: SolarEventKind, date: String },

    /// One-shot task registered for an instant that already passed
    #[error("Trigger time {0} is in the past")]
    InPast(DateTime<Utc>),

    /// The solar data source could not answer
    #[error("Solar data unavailable: {0}")]
    SolarSource(String),
}

/// Convenience type alias for Results using SchedulerError.
pub type Result<T> = std::result::Result<T, SchedulerError>;
