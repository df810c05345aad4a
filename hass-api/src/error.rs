use thiserror::Error;

/// Errors produced while encoding or decoding wire frames
#[derive(Debug, Error)]
pub enum CodecError {
    /// The frame could not be serialized
    #[error("Encode error: {0}")]
    Encode(String),

    /// The frame is not valid JSON or does not match any known record
    ///
    /// Connections treat this as "unrecognized frame" and ignore it rather
    /// than tearing the session down.
    #[error("Decode error: {0}")]
    Decode(String),

    /// A record decoded fine but its payload has the wrong shape
    #[error("Unexpected payload for {record}: {reason}")]
    UnexpectedPayload { record: &'static str, reason: String },
}

/// Errors returned by typed attribute accessors on [`crate::StateRecord`]
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum AttributeError {
    /// The entity does not carry the requested attribute
    #[error("Entity {entity_id} has no attribute '{key}'")]
    Missing { entity_id: String, key: String },

    /// The attribute exists but cannot be converted to the requested type
    #[error("Attribute '{key}' of {entity_id} is not a valid {expected}")]
    TypeMismatch {
        entity_id: String,
        key: String,
        expected: &'static str,
    },
}

/// Type alias for results that can return a CodecError
pub type Result<T> = std::result::Result<T, CodecError>;

impl From<serde_json::Error> for CodecError {
    fn from(error: serde_json::Error) -> Self {
        if error.is_data() || error.is_syntax() || error.is_eof() {
            CodecError::Decode(error.to_string())
        } else {
            CodecError::Encode(error.to_string())
        }
    }
}
