//! Entity state records
//!
//! A [`StateRecord`] is the server's view of one entity at one point in time.
//! Records arrive in bulk from `get_states` and individually inside
//! `state_changed` events.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::attribute::FromAttribute;
use crate::error::AttributeError;

/// Insertion-ordered attribute map of an entity
pub type Attributes = Map<String, Value>;

/// Provenance of a state change or event
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Context {
    pub id: String,
    #[serde(default)]
    pub parent_id: Option<String>,
    #[serde(default)]
    pub user_id: Option<String>,
}

/// Latest known state of an entity
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StateRecord {
    /// Identifier in `domain.object_id` form, e.g. `light.kitchen`
    pub entity_id: String,

    /// Current state string, e.g. `on`, `off`, `above_horizon`
    pub state: String,

    /// Free-form attributes, in the order the server sent them
    #[serde(default)]
    pub attributes: Attributes,

    /// When `state` last changed
    pub last_changed: DateTime<Utc>,

    /// When the record (state or attributes) last changed
    pub last_updated: DateTime<Utc>,

    #[serde(default)]
    pub context: Context,
}

impl StateRecord {
    /// Create a record with empty attributes, stamped with the current time
    pub fn new(entity_id: impl Into<String>, state: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            entity_id: entity_id.into(),
            state: state.into(),
            attributes: Attributes::new(),
            last_changed: now,
            last_updated: now,
            context: Context::default(),
        }
    }

    /// Builder-style attribute insertion
    pub fn with_attribute(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.attributes.insert(key.into(), value.into());
        self
    }

    /// The domain part of the entity id (`light` for `light.kitchen`)
    pub fn domain(&self) -> &str {
        domain_of(&self.entity_id)
    }

    /// Check the state string
    pub fn is(&self, state: &str) -> bool {
        self.state == state
    }

    /// Raw attribute lookup
    pub fn raw_attribute(&self, key: &str) -> Option<&Value> {
        self.attributes.get(key)
    }

    /// Typed attribute lookup
    ///
    /// ```rust
    /// use hass_api::StateRecord;
    ///
    /// let sun = StateRecord::new("sun.sun", "above_horizon").with_attribute("elevation", 31.5);
    /// let elevation: f64 = sun.attribute("elevation").unwrap();
    /// assert_eq!(elevation, 31.5);
    /// ```
    pub fn attribute<T: FromAttribute>(&self, key: &str) -> Result<T, AttributeError> {
        let value = self.attributes.get(key).ok_or_else(|| AttributeError::Missing {
            entity_id: self.entity_id.clone(),
            key: key.to_string(),
        })?;

        T::from_attribute(value).ok_or_else(|| AttributeError::TypeMismatch {
            entity_id: self.entity_id.clone(),
            key: key.to_string(),
            expected: T::TYPE_NAME,
        })
    }

    /// Typed attribute lookup that treats a missing attribute as `None`
    pub fn optional_attribute<T: FromAttribute>(
        &self,
        key: &str,
    ) -> Result<Option<T>, AttributeError> {
        match self.attribute(key) {
            Ok(value) => Ok(Some(value)),
            Err(AttributeError::Missing { .. }) => Ok(None),
            Err(e) => Err(e),
        }
    }
}

/// Split the domain off an entity id
pub fn domain_of(entity_id: &str) -> &str {
    entity_id.split_once('.').map(|(domain, _)| domain).unwrap_or(entity_id)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn sample() -> Value {
        json!({
            "entity_id": "light.kitchen",
            "state": "on",
            "attributes": {"friendly_name": "Kitchen", "brightness": 180, "color_mode": "brightness"},
            "last_changed": "2024-03-01T10:15:00.123456+00:00",
            "last_updated": "2024-03-01T10:16:00+00:00",
            "context": {"id": "01HQ", "parent_id": null, "user_id": "abc"}
        })
    }

    #[test]
    fn test_deserialize_state_record() {
        let record: StateRecord = serde_json::from_value(sample()).unwrap();
        assert_eq!(record.entity_id, "light.kitchen");
        assert_eq!(record.domain(), "light");
        assert!(record.is("on"));
        assert_eq!(record.context.user_id.as_deref(), Some("abc"));
        assert!(record.last_updated > record.last_changed);
    }

    #[test]
    fn test_attribute_order_is_preserved() {
        let record: StateRecord = serde_json::from_value(sample()).unwrap();
        let keys: Vec<&str> = record.attributes.keys().map(String::as_str).collect();
        assert_eq!(keys, vec!["friendly_name", "brightness", "color_mode"]);
    }

    #[test]
    fn test_typed_attribute_access() {
        let record: StateRecord = serde_json::from_value(sample()).unwrap();
        assert_eq!(record.attribute::<i64>("brightness").unwrap(), 180);
        assert_eq!(record.attribute::<String>("friendly_name").unwrap(), "Kitchen");

        let missing = record.attribute::<f64>("color_temp").unwrap_err();
        assert!(matches!(missing, AttributeError::Missing { .. }));

        let mismatch = record.attribute::<bool>("brightness").unwrap_err();
        assert!(matches!(mismatch, AttributeError::TypeMismatch { expected: "boolean", .. }));

        assert_eq!(record.optional_attribute::<f64>("color_temp").unwrap(), None);
    }

    #[test]
    fn test_missing_context_defaults() {
        let mut value = sample();
        value.as_object_mut().unwrap().remove("context");
        let record: StateRecord = serde_json::from_value(value).unwrap();
        assert_eq!(record.context, Context::default());
    }

    #[test]
    fn test_domain_of() {
        assert_eq!(domain_of("sun.sun"), "sun");
        assert_eq!(domain_of("weird"), "weird");
    }

    proptest::proptest! {
        #[test]
        fn prop_domain_is_text_before_first_dot(
            domain in "[a-z_]{1,12}",
            object_id in "[a-z0-9_.]{1,20}",
        ) {
            let entity_id = format!("{}.{}", domain, object_id);
            proptest::prop_assert_eq!(domain_of(&entity_id), domain.as_str());
        }
    }
}
