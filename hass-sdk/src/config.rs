//! Client configuration
//!
//! [`ClientConfig`] extends the connection settings with what the client
//! session needs on top: where solar times come from, the heartbeat, and
//! how old the entity snapshot may get before a read refreshes it.
//!
//! Configuration can be built in code or loaded from a TOML file, by
//! default `<config dir>/hass-sdk/config.toml`:
//!
//! ```toml
//! host = "homeassistant.local"
//! port = 8123
//! secure = false
//! access_token = "eyJ0eXAiOi..."
//! request_timeout_secs = 30
//! latitude = 52.37
//! longitude = 4.89
//! solar_source = "sun_entity"
//! heartbeat_interval_secs = 30
//! snapshot_max_age_secs = 900
//! ```
//!
//! `HASS_TOKEN` in the environment overrides `access_token`.

use std::fmt;
use std::path::{Path, PathBuf};
use std::time::Duration;

use hass_scheduler::Location;
use hass_stream::ConnectionConfig;
use serde::{Deserialize, Serialize};

use crate::error::{Result, SdkError};

/// Environment variable overriding the access token
pub const TOKEN_ENV: &str = "HASS_TOKEN";

/// Where solar trigger times come from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SolarSource {
    /// Computed locally from the location
    #[default]
    Calculated,
    /// Read from the server's `sun.sun` entity
    SunEntity,
}

/// Configuration for a [`crate::HassClient`]
#[derive(Clone)]
pub struct ClientConfig {
    /// Host, port, token and request deadlines
    pub connection: ConnectionConfig,

    /// Overrides the location reported by the server
    /// Default: None (use the server's)
    pub location: Option<Location>,

    /// Default: SolarSource::Calculated
    pub solar_source: SolarSource,

    /// How often the client pings the server while running automations
    /// Default: 30 seconds, `None` disables the heartbeat
    pub heartbeat_interval: Option<Duration>,

    /// Snapshot age after which a read triggers a background refresh
    /// Default: 15 minutes
    pub snapshot_max_age: Duration,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            connection: ConnectionConfig::default(),
            location: None,
            solar_source: SolarSource::default(),
            heartbeat_interval: Some(Duration::from_secs(30)),
            snapshot_max_age: Duration::from_secs(15 * 60),
        }
    }
}

/// On-disk shape of the configuration; every key is optional
#[derive(Debug, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
struct FileConfig {
    host: Option<String>,
    port: Option<u16>,
    secure: Option<bool>,
    access_token: Option<String>,
    debug: Option<bool>,
    /// 0 waits indefinitely
    request_timeout_secs: Option<u64>,
    connect_timeout_secs: Option<u64>,
    latitude: Option<f64>,
    longitude: Option<f64>,
    solar_source: Option<SolarSource>,
    /// 0 disables the heartbeat
    heartbeat_interval_secs: Option<u64>,
    snapshot_max_age_secs: Option<u64>,
}

impl ClientConfig {
    /// Create a config for `host` authenticated with `access_token`
    pub fn new(host: impl Into<String>, access_token: impl Into<String>) -> Self {
        Self {
            connection: ConnectionConfig::new(host, access_token),
            ..Default::default()
        }
    }

    /// Validate the configuration and return any issues
    pub fn validate(&self) -> Result<()> {
        self.connection.validate()?;

        if let Some(location) = &self.location {
            location.validate()?;
        }

        if self.heartbeat_interval == Some(Duration::ZERO) {
            return Err(SdkError::Config(
                "Heartbeat interval must be greater than 0".to_string(),
            ));
        }

        if self.snapshot_max_age.is_zero() {
            return Err(SdkError::Config(
                "Snapshot max age must be greater than 0".to_string(),
            ));
        }

        Ok(())
    }

    /// Default config file location, if the platform has a config directory
    pub fn default_path() -> Option<PathBuf> {
        dirs::config_dir().map(|dir| dir.join("hass-sdk").join("config.toml"))
    }

    /// Load from the default location, then apply environment overrides
    ///
    /// A missing file is not an error; defaults are used instead.
    pub fn load() -> Result<Self> {
        let config = match Self::default_path() {
            Some(path) if path.exists() => Self::load_from_path(&path)?,
            _ => Self::default(),
        };
        Ok(config.with_env_overrides())
    }

    /// Load from an explicit TOML file
    pub fn load_from_path(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path).map_err(|e| {
            SdkError::Config(format!("Failed to read config from {}: {}", path.display(), e))
        })?;
        let config = Self::from_toml_str(&content).map_err(|e| match e {
            SdkError::Config(message) => {
                SdkError::Config(format!("{}: {}", path.display(), message))
            }
            other => other,
        })?;
        tracing::debug!(path = %path.display(), "Loaded configuration");
        Ok(config)
    }

    /// Parse TOML text; keys that are absent keep their defaults
    pub fn from_toml_str(content: &str) -> Result<Self> {
        let file: FileConfig =
            toml::from_str(content).map_err(|e| SdkError::Config(e.to_string()))?;

        let mut config = Self::default();
        let connection = &mut config.connection;
        if let Some(host) = file.host {
            connection.host = host;
        }
        if let Some(port) = file.port {
            connection.port = port;
        }
        if let Some(secure) = file.secure {
            connection.secure = secure;
        }
        if let Some(token) = file.access_token {
            connection.access_token = token;
        }
        if let Some(debug) = file.debug {
            connection.debug = debug;
        }
        if let Some(secs) = file.request_timeout_secs {
            connection.request_timeout = (secs > 0).then(|| Duration::from_secs(secs));
        }
        if let Some(secs) = file.connect_timeout_secs {
            connection.connect_timeout = Duration::from_secs(secs);
        }

        config.location = match (file.latitude, file.longitude) {
            (Some(latitude), Some(longitude)) => Some(Location::new(latitude, longitude)?),
            (None, None) => None,
            _ => {
                return Err(SdkError::Config(
                    "latitude and longitude must be set together".to_string(),
                ))
            }
        };
        if let Some(source) = file.solar_source {
            config.solar_source = source;
        }
        if let Some(secs) = file.heartbeat_interval_secs {
            config.heartbeat_interval = (secs > 0).then(|| Duration::from_secs(secs));
        }
        if let Some(secs) = file.snapshot_max_age_secs {
            config.snapshot_max_age = Duration::from_secs(secs);
        }

        Ok(config)
    }

    /// Apply `HASS_TOKEN` if set and non-empty
    pub fn with_env_overrides(mut self) -> Self {
        if let Ok(token) = std::env::var(TOKEN_ENV) {
            if !token.trim().is_empty() {
                tracing::debug!("Using access token from {}", TOKEN_ENV);
                self.connection.access_token = token;
            }
        }
        self
    }

    /// Builder pattern methods for fluent configuration

    pub fn with_port(mut self, port: u16) -> Self {
        self.connection.port = port;
        self
    }

    pub fn with_tls(mut self, secure: bool) -> Self {
        self.connection.secure = secure;
        self
    }

    pub fn with_debug(mut self, debug: bool) -> Self {
        self.connection.debug = debug;
        self
    }

    pub fn with_request_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.connection.request_timeout = timeout;
        self
    }

    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connection.connect_timeout = timeout;
        self
    }

    pub fn with_location(mut self, location: Location) -> Self {
        self.location = Some(location);
        self
    }

    pub fn with_solar_source(mut self, source: SolarSource) -> Self {
        self.solar_source = source;
        self
    }

    pub fn with_heartbeat_interval(mut self, interval: Option<Duration>) -> Self {
        self.heartbeat_interval = interval;
        self
    }

    pub fn with_snapshot_max_age(mut self, max_age: Duration) -> Self {
        self.snapshot_max_age = max_age;
        self
    }
}

impl fmt::Debug for ClientConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ClientConfig")
            .field("connection", &self.connection)
            .field("location", &self.location)
            .field("solar_source", &self.solar_source)
            .field("heartbeat_interval", &self.heartbeat_interval)
            .field("snapshot_max_age", &self.snapshot_max_age)
            .finish()
    }
}
