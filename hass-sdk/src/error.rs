use thiserror::Error;

use crate::logging::LoggingError;

#[derive(Error, Debug)]
pub enum SdkError {
    #[error("Connection error: {0}")]
    Connection(#[from] hass_stream::ConnectionError),

    #[error("Event manager error: {0}")]
    EventManager(#[from] hass_event_manager::EventManagerError),

    #[error("Scheduler error: {0}")]
    Scheduler(#[from] hass_scheduler::SchedulerError),

    #[error("State error: {0}")]
    State(#[from] state_store::StoreError),

    #[error("Attribute error: {0}")]
    Attribute(#[from] hass_api::AttributeError),

    #[error("Codec error: {0}")]
    Codec(#[from] hass_api::CodecError),

    #[error("Logging error: {0}")]
    Logging(#[from] LoggingError),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Entity {entity_id} reported unexpected state '{state}'")]
    UnexpectedState { entity_id: String, state: String },

    #[error("Automation '{name}' failed to initialize: {message}")]
    AutomationFailed { name: String, message: String },
}

pub type Result<T> = std::result::Result<T, SdkError>;
