//! Wire records exchanged over the WebSocket
//!
//! # Client → server
//!
//! - [`AuthMessage`]: the single `auth` frame sent during the handshake
//! - [`CommandRequest`]: every other frame, an id plus a [`Command`]
//!
//! # Server → client
//!
//! - [`ServerMessage`]: handshake frames, `result`, `event`, `ping`, `pong`

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::state::{Context, StateRecord};

/// Event type carrying entity state transitions
pub const STATE_CHANGED: &str = "state_changed";

/// Authentication frame, sent once in response to `auth_required`
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename = "auth")]
pub struct AuthMessage {
    pub access_token: String,
}

impl AuthMessage {
    pub fn new(access_token: impl Into<String>) -> Self {
        Self {
            access_token: access_token.into(),
        }
    }
}

/// A command the client can issue
///
/// Serialized with its `type` tag, e.g.
/// `{"type":"call_service","domain":"light","service":"turn_on",...}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Command {
    /// Invoke `domain.service` with a payload
    CallService {
        domain: String,
        service: String,
        #[serde(default, skip_serializing_if = "Map::is_empty")]
        service_data: Map<String, Value>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        target: Option<Value>,
    },

    /// Bulk fetch of every entity's state
    GetStates,

    /// Server configuration: location, time zone, version
    GetConfig,

    /// Registered services per domain
    GetServices,

    /// Ask the server to forward events; all types when `event_type` is `None`
    SubscribeEvents {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        event_type: Option<String>,
    },

    /// Cancel a server-side event subscription by the id that created it
    UnsubscribeEvents { subscription: u64 },

    /// Keepalive probe; answered with `pong`
    Ping,

    /// Answer to a server `ping`
    Pong,
}

impl Command {
    /// `call_service` targeting a single entity
    pub fn call_service(
        domain: impl Into<String>,
        service: impl Into<String>,
        entity_id: Option<&str>,
        mut service_data: Map<String, Value>,
    ) -> Self {
        if let Some(entity_id) = entity_id {
            service_data.insert("entity_id".to_string(), Value::String(entity_id.to_string()));
        }
        Command::CallService {
            domain: domain.into(),
            service: service.into(),
            service_data,
            target: None,
        }
    }

    /// Wire `type` tag of this command, used in logs
    pub fn kind(&self) -> &'static str {
        match self {
            Command::CallService { .. } => "call_service",
            Command::GetStates => "get_states",
            Command::GetConfig => "get_config",
            Command::GetServices => "get_services",
            Command::SubscribeEvents { .. } => "subscribe_events",
            Command::UnsubscribeEvents { .. } => "unsubscribe_events",
            Command::Ping => "ping",
            Command::Pong => "pong",
        }
    }
}

/// A command together with its correlation id
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CommandRequest {
    pub id: u64,
    #[serde(flatten)]
    pub command: Command,
}

/// Every frame the server may send
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerMessage {
    AuthRequired {
        #[serde(default)]
        ha_version: Option<String>,
    },
    AuthOk {
        #[serde(default)]
        ha_version: Option<String>,
    },
    AuthInvalid {
        #[serde(default)]
        message: Option<String>,
    },
    Result(ResultMessage),
    Event(EventMessage),
    Ping {
        id: u64,
    },
    Pong {
        id: u64,
    },
    /// Any `type` this client does not understand
    #[serde(other)]
    Unknown,
}

/// Server-side failure details carried by an unsuccessful `result`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorInfo {
    pub code: String,
    #[serde(default)]
    pub message: String,
}

/// Response to a command
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct ResultMessage {
    pub id: u64,
    pub success: bool,
    #[serde(default)]
    pub result: Option<Value>,
    #[serde(default)]
    pub error: Option<ErrorInfo>,
}

impl ResultMessage {
    /// Collapse into the payload or the server error
    pub fn into_outcome(self) -> std::result::Result<Value, ErrorInfo> {
        if self.success {
            Ok(self.result.unwrap_or(Value::Null))
        } else {
            Err(self.error.unwrap_or_else(|| ErrorInfo {
                code: "unknown_error".to_string(),
                message: "server reported failure without details".to_string(),
            }))
        }
    }
}

/// Event frame; `id` is that of the `subscribe_events` command that asked for it
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct EventMessage {
    pub id: u64,
    pub event: Event,
}

/// An unsolicited notification from the server
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Event {
    pub event_type: String,
    #[serde(default)]
    pub data: Value,
    #[serde(default)]
    pub origin: Option<String>,
    #[serde(default)]
    pub time_fired: Option<DateTime<Utc>>,
    #[serde(default)]
    pub context: Option<Context>,
}

impl Event {
    /// Bare event, mostly useful for tests and synthetic dispatch
    pub fn new(event_type: impl Into<String>, data: Value) -> Self {
        Self {
            event_type: event_type.into(),
            data,
            origin: None,
            time_fired: None,
            context: None,
        }
    }

    /// `state_changed` event built from an old/new pair
    pub fn state_changed(
        entity_id: impl Into<String>,
        old_state: Option<StateRecord>,
        new_state: Option<StateRecord>,
    ) -> Self {
        let change = StateChange {
            entity_id: entity_id.into(),
            old_state,
            new_state,
        };
        let data = serde_json::to_value(&change).unwrap_or(Value::Null);
        Self::new(STATE_CHANGED, data)
    }

    /// Entity the event refers to, when its payload names one
    pub fn entity_id(&self) -> Option<&str> {
        self.data.get("entity_id").and_then(Value::as_str)
    }

    pub fn is_state_changed(&self) -> bool {
        self.event_type == STATE_CHANGED
    }

    /// Decode the payload of a `state_changed` event
    ///
    /// Returns `None` for other event types or malformed payloads.
    pub fn state_change(&self) -> Option<StateChange> {
        if !self.is_state_changed() {
            return None;
        }
        serde_json::from_value(self.data.clone()).ok()
    }
}

/// Payload of a `state_changed` event
///
/// `old_state` is `None` for a newly created entity, `new_state` is `None`
/// for a removed one.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StateChange {
    pub entity_id: String,
    #[serde(default)]
    pub old_state: Option<StateRecord>,
    #[serde(default)]
    pub new_state: Option<StateRecord>,
}

impl StateChange {
    /// How attribute `key` moved in this transition, `None` if it did not
    ///
    /// A missing side (created or removed entity, attribute added or
    /// dropped) counts as an absent value.
    pub fn attribute_change(&self, key: &str) -> Option<AttributeChange> {
        let old = self.old_state.as_ref().and_then(|record| record.raw_attribute(key));
        let new = self.new_state.as_ref().and_then(|record| record.raw_attribute(key));
        if old == new {
            return None;
        }
        Some(AttributeChange {
            entity_id: self.entity_id.clone(),
            key: key.to_string(),
            old_value: old.cloned(),
            new_value: new.cloned(),
        })
    }
}

/// One attribute's transition within a `state_changed` event
#[derive(Debug, Clone, PartialEq)]
pub struct AttributeChange {
    pub entity_id: String,
    pub key: String,
    pub old_value: Option<Value>,
    pub new_value: Option<Value>,
}

/// Subset of the `get_config` result the client cares about
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServerConfig {
    #[serde(default)]
    pub latitude: Option<f64>,
    #[serde(default)]
    pub longitude: Option<f64>,
    #[serde(default)]
    pub elevation: Option<f64>,
    #[serde(default)]
    pub time_zone: Option<String>,
    #[serde(default)]
    pub location_name: Option<String>,
    #[serde(default)]
    pub version: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_attribute_change_only_when_value_moves() {
        let dim = StateRecord::new("light.desk", "on").with_attribute("brightness", 40);
        let bright = StateRecord::new("light.desk", "on").with_attribute("brightness", 200);

        let change = StateChange {
            entity_id: "light.desk".to_string(),
            old_state: Some(dim.clone()),
            new_state: Some(bright),
        };
        let moved = change.attribute_change("brightness").unwrap();
        assert_eq!(moved.old_value, Some(json!(40)));
        assert_eq!(moved.new_value, Some(json!(200)));
        assert_eq!(change.attribute_change("color_mode"), None);

        let same = StateChange {
            entity_id: "light.desk".to_string(),
            old_state: Some(dim.clone()),
            new_state: Some(StateRecord::new("light.desk", "off").with_attribute("brightness", 40)),
        };
        assert_eq!(same.attribute_change("brightness"), None);

        let removed = StateChange {
            entity_id: "light.desk".to_string(),
            old_state: Some(dim),
            new_state: None,
        };
        assert_eq!(removed.attribute_change("brightness").unwrap().new_value, None);
    }

    #[test]
    fn test_call_service_injects_entity_id() {
        let command = Command::call_service("light", "turn_on", Some("light.kitchen"), Map::new());
        match command {
            Command::CallService { service_data, .. } => {
                assert_eq!(service_data["entity_id"], json!("light.kitchen"));
            }
            other => panic!("unexpected command {:?}", other),
        }
    }

    #[test]
    fn test_result_outcome() {
        let ok = ResultMessage {
            id: 3,
            success: true,
            result: None,
            error: None,
        };
        assert_eq!(ok.into_outcome(), Ok(Value::Null));

        let failed = ResultMessage {
            id: 4,
            success: false,
            result: None,
            error: Some(ErrorInfo {
                code: "not_found".to_string(),
                message: "Service not found".to_string(),
            }),
        };
        assert_eq!(failed.into_outcome().unwrap_err().code, "not_found");
    }

    #[test]
    fn test_state_change_extraction() {
        let new_state = StateRecord::new("switch.fan", "on");
        let event = Event::state_changed("switch.fan", None, Some(new_state.clone()));

        assert_eq!(event.entity_id(), Some("switch.fan"));
        let change = event.state_change().unwrap();
        assert!(change.old_state.is_none());
        assert_eq!(change.new_state, Some(new_state));

        let other = Event::new("call_service", json!({"domain": "light"}));
        assert!(other.state_change().is_none());
        assert_eq!(other.entity_id(), None);
    }
}
