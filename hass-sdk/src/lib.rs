//! # hass-sdk - Home Assistant automation client
//!
//! Holds one authenticated WebSocket session with a Home Assistant server
//! and builds the pieces an automation needs on top of it:
//!
//! - an entity snapshot that events keep current, readable without a round trip
//! - filtered event subscriptions and "wait until this entity is in that state"
//! - a scheduler for interval, daily, weekly and solar-relative (sunrise, sunset,
//!   dawn, dusk, noon, midnight) tasks
//!
//! ```rust,no_run
//! use hass_sdk::prelude::*;
//!
//! #[tokio::main]
//! async fn main() -> hass_sdk::Result<()> {
//!     hass_sdk::logging::init_logging_from_env()?;
//!     let client = HassClient::connect(ClientConfig::load()?).await?;
//!
//!     let lights = client.clone();
//!     client.sun().on_sunset(move || {
//!         let lights = lights.clone();
//!         async move {
//!             lights.call_service("light", "turn_on", Some("light.porch"), Default::default()).await?;
//!             Ok::<(), TaskError>(())
//!         }
//!     })?;
//!
//!     client.subscribe_state_changes("binary_sensor.front_door", |change| async move {
//!         if let Some(new) = change.new_state {
//!             println!("front door is now {}", new.state);
//!         }
//!         Ok::<(), CallbackError>(())
//!     });
//!
//!     client.closed().await;
//!     Ok(())
//! }
//! ```
//!
//! ## Architecture
//!
//! ```text
//! hass-sdk (HassClient, automations, config)
//!     ↓
//! hass-event-manager (dispatch, condition waits) ── state-store (snapshot)
//!     ↓
//! hass-stream (connection, auth, request correlation)
//!     ↓
//! hass-api (wire records, codec)
//!
//! hass-scheduler (interval, daily, solar triggers)
//! ```

pub mod automation;
pub mod client;
pub mod config;
pub mod error;
pub mod logging;
pub mod sun;

pub use automation::{
    initialize_automations, run_automations, Automation, AutomationError, AutomationReport,
    RunMode,
};
pub use client::HassClient;
pub use config::{ClientConfig, SolarSource};
pub use error::{Result, SdkError};
pub use sun::{Sun, SunEntityCalculator, SunState, SUN_ENTITY};

// Re-export commonly used types from the lower layers
pub use hass_api::{
    AttributeChange, Attributes, Command, Event, FromAttribute, ServerConfig, StateChange,
    StateRecord,
};
pub use hass_event_manager::{CallbackError, EventFilter, SubscriptionId};
pub use hass_scheduler::{
    Location, Scheduler, SolarEventKind, TaskError, TaskHandle, TimeOfDay, Trigger, Weekday,
};
pub use hass_stream::ConnectionPhase;

/// Everything an automation usually needs
pub mod prelude {
    pub use crate::{
        Automation, AutomationError, CallbackError, ClientConfig, EventFilter, HassClient,
        RunMode, SolarEventKind, StateChange, StateRecord, TaskError, TimeOfDay,
    };
    pub use async_trait::async_trait;
}
