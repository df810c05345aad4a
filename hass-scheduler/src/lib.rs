//! Task scheduling for hass-sdk
//!
//! Tasks fire at fixed intervals, at daily or weekly wall-clock times, relative to
//! solar events (sunrise, sunset, dawn, dusk, solar noon, solar midnight)
//! or once. A single loop sleeps until the earliest trigger; callbacks run
//! on their own tokio tasks so a slow or failing callback never delays the
//! others.
//!
//! ```rust,no_run
//! use std::time::Duration;
//! use hass_scheduler::{Location, Scheduler, SolarEventKind};
//!
//! # async fn example() -> hass_scheduler::Result<()> {
//! let scheduler = Scheduler::new();
//! scheduler.set_location(Location::new(52.37, 4.89)?)?;
//!
//! scheduler.run_every(Duration::from_secs(60), || async {
//!     println!("tick");
//!     Ok::<_, hass_scheduler::TaskError>(())
//! })?;
//!
//! scheduler.run_every_day_at_solar(SolarEventKind::Sunset, chrono::Duration::minutes(-15), || async {
//!     println!("almost dark");
//!     Ok::<_, hass_scheduler::TaskError>(())
//! })?;
//!
//! scheduler.start();
//! # Ok(())
//! # }
//! ```

pub mod clock;
pub mod error;
pub mod scheduler;
pub mod solar;
pub mod time_of_day;
pub mod trigger;

pub use clock::{Clock, SystemClock};
pub use error::{Result, SchedulerError, TaskError};
pub use scheduler::{ScheduledTask, Scheduler, TaskCallback, TaskHandle, TaskId};
pub use solar::{Location, SolarCalculator, SolarEventKind, SunriseCalculator};
pub use time_of_day::TimeOfDay;
pub use trigger::{advance_interval, Trigger};

pub use chrono::Weekday;
