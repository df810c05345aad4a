//! # Home Assistant Event Manager
//!
//! Routes the server's unsolicited events to interested code and keeps the
//! entity snapshot in step with them.
//!
//! ## Overview
//!
//! [`EventDispatcher`] plugs into a `hass-stream` connection as its
//! [`hass_stream::FrameHandler`]. Every `state_changed` event is applied to
//! the [`state_store::StateStore`] before any subscriber hears about it, so
//! a callback reading the snapshot always sees the state the event announced.
//!
//! ## Key Features
//!
//! - **Filtered subscriptions**: by event type, entity id and/or predicate
//! - **Isolated callbacks**: each invocation runs on its own task; errors and
//!   panics are logged and never reach the receive loop
//! - **Condition waiting**: [`EventDispatcher::wait_until`] suspends until an
//!   entity satisfies a predicate, with a deadline
//!
//! ## Usage
//!
//! ```rust,ignore
//! use hass_event_manager::{EventDispatcher, EventFilter};
//!
//! let store = Arc::new(StateStore::new());
//! let dispatcher = Arc::new(EventDispatcher::new(store));
//! let connection = Connection::open(config, dispatcher.clone()).await?;
//!
//! connection.call_command(Command::call_service("cover", "open_cover", Some("cover.garage"), Map::new()), None).await?;
//! let open = dispatcher
//!     .wait_for_state("cover.garage", "open", Duration::from_secs(30))
//!     .await?;
//! ```

pub mod dispatcher;
pub mod error;
pub mod subscription;

pub use dispatcher::EventDispatcher;
pub use error::{CallbackError, EventManagerError, Result};
pub use subscription::{EventCallback, EventFilter, EventPredicate, SubscriptionId};
