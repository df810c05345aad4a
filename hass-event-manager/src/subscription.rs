//! Subscription records and filters

use std::fmt;
use std::sync::Arc;

use futures::future::BoxFuture;
use hass_api::{Event, StateRecord, STATE_CHANGED};
use parking_lot::Mutex;
use tokio::sync::oneshot;

use crate::error::CallbackError;

/// Handle identifying a registered subscription
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SubscriptionId(pub u64);

impl SubscriptionId {
    pub fn as_u64(&self) -> u64 {
        self.0
    }
}

impl fmt::Display for SubscriptionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Extra matching logic evaluated on the receive loop
///
/// Must be cheap. It runs without any dispatcher lock held, so it may read
/// the dispatcher or the snapshot.
pub type EventPredicate = Arc<dyn Fn(&Event) -> bool + Send + Sync>;

/// Type-erased subscription callback
pub type EventCallback =
    Arc<dyn Fn(Event) -> BoxFuture<'static, std::result::Result<(), CallbackError>> + Send + Sync>;

/// Which events a subscription wants
///
/// All set criteria must match; an empty filter matches every event.
///
/// ```rust
/// use hass_event_manager::EventFilter;
///
/// let porch = EventFilter::state_changes_of("light.porch");
/// let anything_automation = EventFilter::event_type("automation_triggered");
/// let bright = EventFilter::state_changed()
///     .with_predicate(|event| event.data["new_state"]["attributes"]["brightness"].as_u64() > Some(200));
/// # let _ = (porch, anything_automation, bright);
/// ```
#[derive(Clone, Default)]
pub struct EventFilter {
    event_type: Option<String>,
    entity_id: Option<String>,
    predicate: Option<EventPredicate>,
}

impl EventFilter {
    /// Match every event
    pub fn all() -> Self {
        Self::default()
    }

    /// Match one event type
    pub fn event_type(event_type: impl Into<String>) -> Self {
        Self {
            event_type: Some(event_type.into()),
            ..Self::default()
        }
    }

    /// Match every `state_changed` event
    pub fn state_changed() -> Self {
        Self::event_type(STATE_CHANGED)
    }

    /// Match `state_changed` events of one entity
    pub fn state_changes_of(entity_id: impl Into<String>) -> Self {
        Self::state_changed().for_entity(entity_id)
    }

    /// Restrict to events whose payload names `entity_id`
    pub fn for_entity(mut self, entity_id: impl Into<String>) -> Self {
        self.entity_id = Some(entity_id.into());
        self
    }

    /// Add an arbitrary predicate
    pub fn with_predicate<P>(mut self, predicate: P) -> Self
    where
        P: Fn(&Event) -> bool + Send + Sync + 'static,
    {
        self.predicate = Some(Arc::new(predicate));
        self
    }

    pub fn matches(&self, event: &Event) -> bool {
        if let Some(event_type) = &self.event_type {
            if &event.event_type != event_type {
                return false;
            }
        }
        if let Some(entity_id) = &self.entity_id {
            if event.entity_id() != Some(entity_id.as_str()) {
                return false;
            }
        }
        match &self.predicate {
            Some(predicate) => predicate(event),
            None => true,
        }
    }
}

impl fmt::Debug for EventFilter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EventFilter")
            .field("event_type", &self.event_type)
            .field("entity_id", &self.entity_id)
            .field("has_predicate", &self.predicate.is_some())
            .finish()
    }
}

/// How a matching event reaches the subscriber
pub(crate) enum Delivery {
    /// Run the callback on its own task
    Callback { callback: EventCallback, once: bool },

    /// Complete a condition waiter once the new state satisfies `condition`
    Waiter {
        condition: StateCondition,
        completion: Mutex<Option<oneshot::Sender<StateRecord>>>,
    },
}

/// Predicate over an entity record, shared between a waiter and its caller
pub(crate) type StateCondition = Arc<dyn Fn(&StateRecord) -> bool + Send + Sync>;

pub(crate) struct Subscription {
    pub(crate) filter: EventFilter,
    pub(crate) delivery: Delivery,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn light_event(entity_id: &str, state: &str) -> Event {
        Event::state_changed(entity_id, None, Some(StateRecord::new(entity_id, state)))
    }

    #[test]
    fn test_empty_filter_matches_everything() {
        let filter = EventFilter::all();
        assert!(filter.matches(&light_event("light.a", "on")));
        assert!(filter.matches(&Event::new("homeassistant_start", json!({}))));
    }

    #[test]
    fn test_event_type_and_entity_filters() {
        let filter = EventFilter::state_changes_of("light.a");
        assert!(filter.matches(&light_event("light.a", "on")));
        assert!(!filter.matches(&light_event("light.b", "on")));
        assert!(!filter.matches(&Event::new("call_service", json!({"entity_id": "light.a"}))));

        let by_entity = EventFilter::all().for_entity("light.a");
        assert!(by_entity.matches(&Event::new("call_service", json!({"entity_id": "light.a"}))));
    }

    #[test]
    fn test_predicate_filter() {
        let filter = EventFilter::state_changed()
            .with_predicate(|event| event.data["new_state"]["state"] == json!("on"));
        assert!(filter.matches(&light_event("light.a", "on")));
        assert!(!filter.matches(&light_event("light.a", "off")));
    }

    #[test]
    fn test_subscription_id_display() {
        assert_eq!(SubscriptionId(12).to_string(), "#12");
    }
}
