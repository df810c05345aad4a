//! Entity state snapshot
//!
//! Holds the latest known [`hass_api::StateRecord`] for every entity the
//! server has told us about, so reads never need a round trip.
//!
//! # Quick Start
//!
//! ```rust
//! use hass_api::{StateChange, StateRecord};
//! use state_store::StateStore;
//!
//! let store = StateStore::new();
//! store.apply_change(&StateChange {
//!     entity_id: "light.porch".to_string(),
//!     old_state: None,
//!     new_state: Some(StateRecord::new("light.porch", "on")),
//! });
//!
//! assert_eq!(store.get_state("light.porch").unwrap().state, "on");
//! assert!(store.get_state("light.attic").is_err());
//! ```

pub mod error;
pub mod store;

pub use error::{Result, StoreError};
pub use store::{MergeSummary, SnapshotUpdate, StateStore};
