//! Bridge configuration.
//!
//! Loaded from YAML files and environment variables into a single
//! [`Config`] with `connection`, `source` and `destination` sections.

use std::time::Duration;

use serde::Deserialize;

use crate::broker::{AckPolicy, DeliverPolicy};
use crate::destination::WriterParams;
use crate::position::PositionToken;
use crate::source::IteratorParams;

/// Default configuration file name.
pub const DEFAULT_CONFIG_FILE: &str = "jetstream-bridge.yaml";
/// Environment variable for configuration file path.
pub const CONFIG_ENV_VAR: &str = "JETSTREAM_BRIDGE_CONFIG";
/// Prefix for configuration environment variables.
pub const CONFIG_ENV_PREFIX: &str = "JETSTREAM_BRIDGE";
/// Environment variable for logging configuration.
pub const LOG_ENV_VAR: &str = "JETSTREAM_BRIDGE_LOG";

/// Smallest accepted delivery channel capacity.
pub const MIN_BUFFER_SIZE: usize = 64;

const DEFAULT_URL: &str = "nats://127.0.0.1:4222";

/// Configuration errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("load config: {0}")]
    Load(#[from] ::config::ConfigError),

    #[error("invalid config: {0}")]
    Invalid(String),
}

/// Main bridge configuration.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct Config {
    pub connection: ConnectionConfig,
    /// Read side. Required by `jetstream-bridge source`.
    pub source: Option<SourceConfig>,
    /// Write side. Required by `jetstream-bridge destination`.
    pub destination: Option<DestinationConfig>,
}

/// NATS connection settings.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ConnectionConfig {
    /// Server URLs.
    pub urls: Vec<String>,
    /// Client name shown in server monitoring.
    pub connection_name: Option<String>,
    pub max_reconnects: usize,
    /// Wait between reconnect attempts, in seconds.
    pub reconnect_wait_secs: u64,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            urls: vec![DEFAULT_URL.to_string()],
            connection_name: None,
            max_reconnects: 5,
            reconnect_wait_secs: 5,
        }
    }
}

/// Durable consumer settings.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SourceConfig {
    pub subject: String,
    pub stream: String,
    /// Durable consumer name. Generated when not set.
    pub durable: String,
    pub buffer_size: usize,
    pub deliver_policy: DeliverPolicy,
    pub ack_policy: AckPolicy,
    /// Resume token from a previous run.
    pub position: Option<String>,
}

impl Default for SourceConfig {
    fn default() -> Self {
        Self {
            subject: String::new(),
            stream: String::new(),
            durable: format!("jetstream-bridge-{}", uuid::Uuid::new_v4()),
            buffer_size: 1024,
            deliver_policy: DeliverPolicy::All,
            ack_policy: AckPolicy::Explicit,
            position: None,
        }
    }
}

impl SourceConfig {
    pub fn iterator_params(&self) -> IteratorParams {
        IteratorParams {
            buffer_size: self.buffer_size,
            durable: self.durable.clone(),
            stream: self.stream.clone(),
            subject: self.subject.clone(),
            position: self
                .position
                .as_deref()
                .map(PositionToken::from)
                .unwrap_or_default(),
            deliver_policy: self.deliver_policy,
            ack_policy: self.ack_policy,
        }
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.subject.is_empty() {
            return invalid("source.subject must be set");
        }
        if self.stream.is_empty() {
            return invalid("source.stream must be set");
        }
        if self.durable.is_empty() {
            return invalid("source.durable must not be empty");
        }
        if self.buffer_size < MIN_BUFFER_SIZE {
            return invalid(&format!(
                "source.buffer_size must be at least {}, got {}",
                MIN_BUFFER_SIZE, self.buffer_size
            ));
        }
        if self.deliver_policy.start_sequence().is_some() {
            return invalid("source.deliver_policy must be all or new; use position to resume");
        }
        Ok(())
    }
}

/// Publisher settings.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct DestinationConfig {
    pub subject: String,
    pub batch_size: usize,
    /// Wait between publish retries, in milliseconds.
    pub retry_wait_ms: u64,
    pub retry_attempts: u32,
}

impl Default for DestinationConfig {
    fn default() -> Self {
        Self {
            subject: String::new(),
            batch_size: 1,
            retry_wait_ms: 5000,
            retry_attempts: 3,
        }
    }
}

impl DestinationConfig {
    pub fn writer_params(&self) -> WriterParams {
        WriterParams {
            subject: self.subject.clone(),
            batch_size: self.batch_size,
            retry_wait: Duration::from_millis(self.retry_wait_ms),
            retry_attempts: self.retry_attempts,
        }
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.subject.is_empty() {
            return invalid("destination.subject must be set");
        }
        if self.batch_size < 1 {
            return invalid("destination.batch_size must be at least 1");
        }
        Ok(())
    }
}

fn invalid(reason: &str) -> Result<(), ConfigError> {
    Err(ConfigError::Invalid(reason.to_string()))
}

impl Config {
    /// Load configuration from file and environment.
    ///
    /// Configuration sources (in order of priority, later overrides earlier):
    /// 1. `jetstream-bridge.yaml` in current directory (if exists)
    /// 2. File specified by `path` argument (if provided)
    /// 3. File specified by `CONFIG_ENV_VAR` environment variable (if set)
    /// 4. Environment variables with `CONFIG_ENV_PREFIX` prefix
    pub fn load(path: Option<&str>) -> Result<Self, ConfigError> {
        use ::config::{Config as ConfigLib, Environment, File, FileFormat};

        let mut builder = ConfigLib::builder()
            .add_source(File::new(DEFAULT_CONFIG_FILE, FileFormat::Yaml).required(false));

        if let Some(config_path) = path {
            builder = builder.add_source(File::new(config_path, FileFormat::Yaml).required(true));
        }

        if let Ok(config_path) = std::env::var(CONFIG_ENV_VAR) {
            builder = builder.add_source(File::new(&config_path, FileFormat::Yaml).required(true));
        }

        let config = builder
            .add_source(
                Environment::with_prefix(CONFIG_ENV_PREFIX)
                    .prefix_separator("__")
                    .separator("__")
                    .list_separator(",")
                    .with_list_parse_key("connection.urls")
                    .try_parsing(true),
            )
            .build()?;

        let config: Config = config.try_deserialize()?;
        Ok(config)
    }

    /// Check the loaded values for anything the bridge cannot run with.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.connection.urls.is_empty() {
            return invalid("connection.urls must not be empty");
        }
        if let Some(ref source) = self.source {
            source.validate()?;
        }
        if let Some(ref destination) = self.destination {
            destination.validate()?;
        }
        Ok(())
    }
}
