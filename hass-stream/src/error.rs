//! Error types for the hass-stream crate.

use std::time::Duration;

use crate::phase::ConnectionPhase;

/// Errors that can occur on a connection.
#[derive(Debug, thiserror::Error)]
pub enum ConnectionError {
    /// The server rejected the access token
    #[error("Authentication failed: {0}")]
    AuthFailed(String),

    /// A command was issued while the connection was not `Ready`
    #[error("Connection is not ready (phase: {0})")]
    NotConnected(ConnectionPhase),

    /// No `result` arrived for the request before its deadline
    #[error("Request {id} timed out after {timeout:?}")]
    RequestTimeout {
        /// Correlation id of the abandoned request
        id: u64,
        /// The deadline that elapsed
        timeout: Duration,
    },

    /// The connection closed while the request was outstanding
    #[error("Connection closed")]
    ConnectionClosed,

    /// The server answered with `success: false`
    #[error("Command failed: {code}: {message}")]
    CommandFailed {
        /// Server error code, e.g. `not_found`
        code: String,
        /// Human readable message from the server
        message: String,
    },

    /// Opening the transport took longer than the configured limit
    #[error("Connect timed out after {0:?}")]
    ConnectTimeout(Duration),

    /// The server broke the handshake protocol
    #[error("Protocol error: {0}")]
    Protocol(String),

    /// Invalid configuration provided
    #[error("Configuration error: {0}")]
    Configuration(String),

    /// Frame encoding or decoding failed
    #[error("Codec error: {0}")]
    Codec(#[from] hass_api::CodecError),

    /// The underlying transport failed
    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),
}

/// Errors from transport implementations.
#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    /// Failed to establish the socket
    #[error("Failed to connect to {url}: {reason}")]
    ConnectFailed {
        /// Endpoint that was dialed
        url: String,
        /// Underlying failure
        reason: String,
    },

    /// A WebSocket protocol or I/O error
    #[error("WebSocket error: {0}")]
    WebSocket(String),

    /// The peer closed the socket
    #[error("Transport closed")]
    Closed,
}

/// Convenience type alias for Results using ConnectionError.
pub type Result<T> = std::result::Result<T, ConnectionError>;
