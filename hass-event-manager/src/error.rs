use std::time::Duration;
use thiserror::Error;

/// Boxed error returned by subscription callbacks
pub type CallbackError = Box<dyn std::error::Error + Send + Sync>;

/// Errors that can occur in the event manager
#[derive(Error, Debug)]
pub enum EventManagerError {
    /// The awaited condition did not become true in time
    #[error("Condition on {entity_id} not met within {timeout:?}")]
    ConditionTimeout { entity_id: String, timeout: Duration },

    /// The connection closed while waiting
    #[error("Connection closed while waiting for {entity_id}")]
    ConnectionClosed { entity_id: String },

    /// A subscription callback failed or panicked
    ///
    /// Never returned to callers; constructed so failures are logged in one
    /// consistent shape.
    #[error("Subscription {subscription} callback failed: {message}")]
    SubscriptionCallback { subscription: u64, message: String },

    /// Snapshot lookup failed
    #[error(transparent)]
    Store(#[from] state_store::StoreError),
}

/// Result type for event manager operations
pub type Result<T> = std::result::Result<T, EventManagerError>;
