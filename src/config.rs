//! # Configuration Management
//!
//! Centralized configuration for the M2M client.
//!
//! This module provides structured configuration for the client session,
//! the bencode codec, and logging output.
//!
//! ## Configuration Sources
//! - TOML files via `from_file()`
//! - Direct instantiation with defaults
//! - Environment-specific overrides via `from_env()`
//!
//! ## Security Considerations
//! - The password never appears in `Debug` output
//! - Nesting and cache limits bound the memory a hostile peer can pin

use crate::core::bencode::{DEFAULT_CACHE_CAPACITY, DEFAULT_CACHE_THRESHOLD, DEFAULT_MAX_DEPTH};
use crate::error::{ProtocolError, Result};
use crate::utils::timeout;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::fs::File;
use std::io::Read;
use std::path::Path;
use std::time::Duration;
use tracing::Level;

/// URL schemes the bundled transports understand
pub const SUPPORTED_SCHEMES: &[&str] = &["ws", "wss", "tcp"];

/// Default relay endpoint
pub const DEFAULT_URL: &str = "ws://127.0.0.1:8080/m2m/";

/// Inbound events buffered before new ones are dropped
pub const DEFAULT_INBOUND_CAPACITY: usize = 1024;

/// Main configuration structure that contains all configurable settings
#[derive(Debug, Clone, Deserialize, Serialize, Default)]
pub struct M2mConfig {
    /// Session configuration
    #[serde(default)]
    pub client: ClientConfig,

    /// Codec limits and decode cache
    #[serde(default)]
    pub codec: CodecConfig,

    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,
}

impl M2mConfig {
    /// Load configuration from a TOML file
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let mut file = File::open(path)
            .map_err(|e| ProtocolError::ConfigError(format!("Failed to open config file: {e}")))?;

        let mut contents = String::new();
        file.read_to_string(&mut contents)
            .map_err(|e| ProtocolError::ConfigError(format!("Failed to read config file: {e}")))?;

        Self::from_toml(&contents)
    }

    /// Load configuration from TOML string
    pub fn from_toml(content: &str) -> Result<Self> {
        toml::from_str::<Self>(content)
            .map_err(|e| ProtocolError::ConfigError(format!("Failed to parse TOML: {e}")))
    }

    /// Load configuration from environment variables
    pub fn from_env() -> Result<Self> {
        let mut config = Self::default();

        if let Ok(url) = std::env::var("M2M_URL") {
            config.client.url = url;
        }

        if let Ok(username) = std::env::var("M2M_USERNAME") {
            config.client.username = Some(username);
        }

        if let Ok(password) = std::env::var("M2M_PASSWORD") {
            config.client.password = Some(password);
        }

        if let Ok(timeout) = std::env::var("M2M_COMMAND_TIMEOUT_MS") {
            let val = timeout.parse::<u64>().map_err(|e| {
                ProtocolError::ConfigError(format!("Invalid M2M_COMMAND_TIMEOUT_MS: {e}"))
            })?;
            config.client.command_timeout = Duration::from_millis(val);
        }

        if let Ok(timeout) = std::env::var("M2M_CONNECT_TIMEOUT_MS") {
            let val = timeout.parse::<u64>().map_err(|e| {
                ProtocolError::ConfigError(format!("Invalid M2M_CONNECT_TIMEOUT_MS: {e}"))
            })?;
            config.client.connect_timeout = Duration::from_millis(val);
        }

        Ok(config)
    }

    /// Apply overrides to the default configuration
    pub fn default_with_overrides<F>(mutator: F) -> Self
    where
        F: FnOnce(&mut Self),
    {
        let mut config = Self::default();
        mutator(&mut config);
        config
    }

    /// Generate example configuration file content
    pub fn example_config() -> String {
        toml::to_string_pretty(&Self::default())
            .unwrap_or_else(|_| String::from("# Failed to generate example config"))
    }

    /// Save configuration to a file
    pub fn save_to_file<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let content = toml::to_string_pretty(self)
            .map_err(|e| ProtocolError::ConfigError(format!("Failed to serialize config: {e}")))?;

        std::fs::write(path, content)
            .map_err(|e| ProtocolError::ConfigError(format!("Failed to write config file: {e}")))?;

        Ok(())
    }

    /// Validate the configuration for common issues and misconfigurations
    ///
    /// Returns a list of validation errors. Empty list means configuration is valid.
    pub fn validate(&self) -> Vec<String> {
        let mut errors = Vec::new();
        errors.extend(self.client.validate());
        errors.extend(self.codec.validate());
        errors.extend(self.logging.validate());
        errors
    }

    /// Validate and return Result - convenience method
    pub fn validate_strict(&self) -> Result<()> {
        let errors = self.validate();
        if errors.is_empty() {
            Ok(())
        } else {
            Err(ProtocolError::ConfigError(format!(
                "Configuration validation failed:\n  - {}",
                errors.join("\n  - ")
            )))
        }
    }
}

/// Session configuration
#[derive(Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ClientConfig {
    /// Relay endpoint, e.g. "ws://relay.example.com:2020/m2m/"
    pub url: String,

    /// Login name; sent together with `password` once the session is joined
    pub username: Option<String>,

    pub password: Option<String>,

    /// Time allowed for the transport to open and the session to become ready
    #[serde(with = "duration_serde")]
    pub connect_timeout: Duration,

    /// Default wait for a command response
    #[serde(with = "duration_serde")]
    pub command_timeout: Duration,

    /// Default wait for the server-assigned identity
    #[serde(with = "duration_serde")]
    pub identity_timeout: Duration,

    /// Time allowed for the worker to stop during close
    #[serde(with = "duration_serde")]
    pub shutdown_timeout: Duration,

    /// Inbound events held for the application; excess events are dropped
    pub inbound_capacity: usize,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            url: String::from(DEFAULT_URL),
            username: None,
            password: None,
            connect_timeout: timeout::DEFAULT_TIMEOUT,
            command_timeout: timeout::COMMAND_TIMEOUT,
            identity_timeout: timeout::IDENTITY_TIMEOUT,
            shutdown_timeout: timeout::SHUTDOWN_TIMEOUT,
            inbound_capacity: DEFAULT_INBOUND_CAPACITY,
        }
    }
}

impl fmt::Debug for ClientConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ClientConfig")
            .field("url", &self.url)
            .field("username", &self.username)
            .field("password", &self.password.as_ref().map(|_| "********"))
            .field("connect_timeout", &self.connect_timeout)
            .field("command_timeout", &self.command_timeout)
            .field("identity_timeout", &self.identity_timeout)
            .field("shutdown_timeout", &self.shutdown_timeout)
            .field("inbound_capacity", &self.inbound_capacity)
            .finish()
    }
}

impl ClientConfig {
    /// Credentials, when both halves are configured
    pub fn credentials(&self) -> Option<(&str, &str)> {
        match (&self.username, &self.password) {
            (Some(user), Some(pass)) => Some((user.as_str(), pass.as_str())),
            _ => None,
        }
    }

    /// Scheme of `url`, lowercased
    pub fn scheme(&self) -> Option<String> {
        self.url
            .split_once("://")
            .map(|(scheme, _)| scheme.to_ascii_lowercase())
    }

    /// Validate client configuration
    pub fn validate(&self) -> Vec<String> {
        let mut errors = Vec::new();

        // Validate URL
        if self.url.is_empty() {
            errors.push("Client URL cannot be empty".to_string());
        } else {
            match self.url.split_once("://") {
                Some((scheme, rest)) => {
                    if !SUPPORTED_SCHEMES.contains(&scheme.to_ascii_lowercase().as_str()) {
                        errors.push(format!(
                            "Unsupported URL scheme '{scheme}' (expected one of: {})",
                            SUPPORTED_SCHEMES.join(", ")
                        ));
                    }
                    if rest.is_empty() || rest.starts_with('/') {
                        errors.push(format!("URL has no host: '{}'", self.url));
                    }
                }
                None => errors.push(format!(
                    "Invalid URL format: '{}' (expected format: 'ws://host:port/path')",
                    self.url
                )),
            }
        }

        // Validate credentials
        if self.username.is_some() != self.password.is_some() {
            errors.push("username and password must be given together".to_string());
        }

        // Validate timeouts
        if self.connect_timeout.as_millis() < 100 {
            errors.push("Connect timeout too short (minimum: 100ms)".to_string());
        } else if self.connect_timeout.as_secs() > 300 {
            errors.push("Connect timeout too long (maximum: 300s)".to_string());
        }

        if self.command_timeout.as_millis() < 10 {
            errors.push("Command timeout too short (minimum: 10ms)".to_string());
        }

        if self.identity_timeout.as_millis() < 10 {
            errors.push("Identity timeout too short (minimum: 10ms)".to_string());
        }

        if self.shutdown_timeout.as_millis() < 10 {
            errors.push("Shutdown timeout too short (minimum: 10ms)".to_string());
        } else if self.shutdown_timeout.as_secs() > 60 {
            errors.push("Shutdown timeout too long (maximum: 60s)".to_string());
        }

        if self.inbound_capacity == 0 {
            errors.push("Inbound capacity must be at least 1".to_string());
        }

        errors
    }
}

/// Codec limits and decode cache settings
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct CodecConfig {
    /// Number of cached decodes
    pub decode_cache_capacity: usize,

    /// Inputs shorter than this many bytes use the decode cache
    pub decode_cache_threshold: usize,

    /// Maximum container nesting on encode and decode
    pub max_depth: usize,
}

impl Default for CodecConfig {
    fn default() -> Self {
        Self {
            decode_cache_capacity: DEFAULT_CACHE_CAPACITY,
            decode_cache_threshold: DEFAULT_CACHE_THRESHOLD,
            max_depth: DEFAULT_MAX_DEPTH,
        }
    }
}

impl CodecConfig {
    /// Validate codec configuration
    pub fn validate(&self) -> Vec<String> {
        let mut errors = Vec::new();

        if self.decode_cache_threshold == 0 {
            errors.push("Decode cache threshold must be greater than 0".to_string());
        } else if self.decode_cache_threshold > 64 * 1024 {
            errors.push(format!(
                "Decode cache threshold too large: {} bytes (maximum: 64 KB)",
                self.decode_cache_threshold
            ));
        }

        if self.decode_cache_capacity > 1_000_000 {
            errors.push(format!(
                "Decode cache capacity too large: {} (max recommended: 1,000,000)",
                self.decode_cache_capacity
            ));
        }

        if self.max_depth == 0 {
            errors.push("Max nesting depth must be greater than 0".to_string());
        } else if self.max_depth > 1024 {
            errors.push(format!("Max nesting depth too large: {}", self.max_depth));
        }

        errors
    }
}

/// Logging configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Application name for logs
    pub app_name: String,

    /// Log level
    #[serde(with = "log_level_serde")]
    pub log_level: Level,

    /// Whether to log to console
    pub log_to_console: bool,

    /// Whether to log to file
    pub log_to_file: bool,

    /// Path to log file (if log_to_file is true)
    pub log_file_path: Option<String>,

    /// Whether to use JSON formatting for logs
    pub json_format: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            app_name: String::from("m2m-client"),
            log_level: Level::INFO,
            log_to_console: true,
            log_to_file: false,
            log_file_path: None,
            json_format: false,
        }
    }
}

impl LoggingConfig {
    /// Validate logging configuration
    pub fn validate(&self) -> Vec<String> {
        let mut errors = Vec::new();

        if self.app_name.is_empty() {
            errors.push("Application name cannot be empty".to_string());
        } else if self.app_name.len() > 64 {
            errors.push(format!(
                "Application name too long: {} characters (maximum: 64)",
                self.app_name.len()
            ));
        }

        if self.log_to_file {
            if let Some(ref path) = self.log_file_path {
                if let Some(parent) = Path::new(path).parent() {
                    if !parent.as_os_str().is_empty() && !parent.exists() {
                        errors.push(format!(
                            "Log file directory does not exist: {}",
                            parent.display()
                        ));
                    }
                }
            } else {
                errors.push("log_file_path must be specified when log_to_file is true".to_string());
            }
        }

        if !self.log_to_console && !self.log_to_file {
            errors
                .push("At least one logging output (console or file) must be enabled".to_string());
        }

        errors
    }
}

/// Durations travel as integer milliseconds
mod duration_serde {
    use serde::{Deserialize, Deserializer, Serialize, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        let millis = u64::try_from(duration.as_millis()).unwrap_or(u64::MAX);
        millis.serialize(serializer)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let millis = u64::deserialize(deserializer)?;
        Ok(Duration::from_millis(millis))
    }
}

/// Helper module for tracing::Level serialization/deserialization
mod log_level_serde {
    use serde::{Deserialize, Deserializer, Serialize, Serializer};
    use std::str::FromStr;
    use tracing::Level;

    pub fn serialize<S>(level: &Level, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        let level_str = match *level {
            Level::TRACE => "trace",
            Level::DEBUG => "debug",
            Level::INFO => "info",
            Level::WARN => "warn",
            Level::ERROR => "error",
        };
        level_str.serialize(serializer)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Level, D::Error>
    where
        D: Deserializer<'de>,
    {
        let level_str = String::deserialize(deserializer)?;
        Level::from_str(&level_str)
            .map_err(|_| serde::de::Error::custom(format!("Invalid log level: {level_str}")))
    }
}
