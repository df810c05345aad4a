//! Configuration types for the hass-stream crate
//!
//! [`ConnectionConfig`] describes where the server lives, how to
//! authenticate, and the deadlines applied to connecting and to individual
//! commands.

use std::fmt;
use std::time::Duration;

use url::Url;

use crate::error::{ConnectionError, Result};

/// Configuration for a [`crate::Connection`]
#[derive(Clone)]
pub struct ConnectionConfig {
    /// Server host name or address
    /// Default: "localhost"
    pub host: String,

    /// Server port
    /// Default: 8123
    pub port: u16,

    /// Use TLS (`wss://`)
    /// Default: false
    pub secure: bool,

    /// Path of the WebSocket endpoint
    /// Default: "/api/websocket"
    pub path: String,

    /// Long-lived access token sent in the `auth` frame
    /// Default: empty (invalid until set)
    pub access_token: String,

    /// Log every raw frame at debug level
    /// Default: false
    pub debug: bool,

    /// Deadline applied to commands that do not carry their own
    /// Default: 30 seconds, `None` waits indefinitely
    pub request_timeout: Option<Duration>,

    /// Limit on opening the socket plus the authentication handshake
    /// Default: 10 seconds
    pub connect_timeout: Duration,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            host: "localhost".to_string(),
            port: 8123,
            secure: false,
            path: "/api/websocket".to_string(),
            access_token: String::new(),
            debug: false,
            request_timeout: Some(Duration::from_secs(30)),
            connect_timeout: Duration::from_secs(10),
        }
    }
}

impl ConnectionConfig {
    /// Create a config for `host` authenticated with `access_token`
    pub fn new(host: impl Into<String>, access_token: impl Into<String>) -> Self {
        Self {
            host: host.into(),
            access_token: access_token.into(),
            ..Default::default()
        }
    }

    /// Validate the configuration and return any issues
    pub fn validate(&self) -> Result<()> {
        if self.host.trim().is_empty() {
            return Err(ConnectionError::Configuration(
                "Host must not be empty".to_string(),
            ));
        }

        if self.port == 0 {
            return Err(ConnectionError::Configuration(
                "Port must be greater than 0".to_string(),
            ));
        }

        if self.access_token.trim().is_empty() {
            return Err(ConnectionError::Configuration(
                "Access token must not be empty".to_string(),
            ));
        }

        if !self.path.starts_with('/') {
            return Err(ConnectionError::Configuration(format!(
                "Endpoint path must start with '/': {}",
                self.path
            )));
        }

        if self.request_timeout == Some(Duration::ZERO) {
            return Err(ConnectionError::Configuration(
                "Request timeout must be greater than 0".to_string(),
            ));
        }

        if self.connect_timeout == Duration::ZERO {
            return Err(ConnectionError::Configuration(
                "Connect timeout must be greater than 0".to_string(),
            ));
        }

        self.websocket_url().map(|_| ())
    }

    /// Full endpoint URL, `ws://host:port/api/websocket` or the `wss` variant
    pub fn websocket_url(&self) -> Result<Url> {
        let scheme = if self.secure { "wss" } else { "ws" };
        let raw = format!("{}://{}:{}{}", scheme, self.host, self.port, self.path);
        Url::parse(&raw)
            .map_err(|e| ConnectionError::Configuration(format!("Invalid endpoint {}: {}", raw, e)))
    }

    /// Builder pattern methods for fluent configuration

    pub fn with_port(mut self, port: u16) -> Self {
        self.port = port;
        self
    }

    pub fn with_tls(mut self, secure: bool) -> Self {
        self.secure = secure;
        self
    }

    pub fn with_debug(mut self, debug: bool) -> Self {
        self.debug = debug;
        self
    }

    pub fn with_request_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.request_timeout = timeout;
        self
    }

    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }
}

impl fmt::Debug for ConnectionConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionConfig")
            .field("host", &self.host)
            .field("port", &self.port)
            .field("secure", &self.secure)
            .field("path", &self.path)
            .field("access_token", &"<redacted>")
            .field("debug", &self.debug)
            .field("request_timeout", &self.request_timeout)
            .field("connect_timeout", &self.connect_timeout)
            .finish()
    }
}
