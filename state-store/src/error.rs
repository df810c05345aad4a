//! Error types for the state store

/// Errors returned by snapshot lookups
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum StoreError {
    /// No record for this entity has been seen yet, or it was removed
    #[error("Entity not found: {0}")]
    EntityNotFound(String),
}

/// Convenience type alias for Results using StoreError.
pub type Result<T> = std::result::Result<T, StoreError>;
