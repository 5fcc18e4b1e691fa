use config::{Config as ConfigBuilder, ConfigError, Environment, File};
use serde::{Deserialize, Serialize};
use std::path::Path;

/// Application configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub server: ServerConfig,
    pub redis: RedisConfig,
    pub hub: HubSettings,
    pub connection: ConnectionSettings,
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    /// Upper bound on hub shutdown after a signal
    pub shutdown_grace_seconds: u64,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 8080,
            shutdown_grace_seconds: 5,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct RedisConfig {
    /// Broker connection URL. No default; `validate` rejects an empty one.
    pub url: String,
}

/// Distributed hub tuning
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HubSettings {
    /// Consecutive broker failures tolerated before the hub shuts down.
    /// Also the attempt budget for relay publishes and directory writes.
    pub max_retries: u32,
    /// Session directory TTL
    pub session_ttl_seconds: u64,
    /// Per-connection outbound queue capacity
    pub buffer_size: usize,
    /// Capacity of the hub's message, relay publish and directory queues.
    /// Work arriving while one is full is dropped with a warning.
    pub queue_capacity: usize,
    /// Shared pub/sub channel name
    pub channel: String,
    pub health_check_interval_seconds: u64,
    /// Timeout applied to every broker and directory call
    pub operation_timeout_seconds: u64,
    /// Linear backoff unit (attempt index x unit)
    pub retry_backoff_millis: u64,
}

impl Default for HubSettings {
    fn default() -> Self {
        Self {
            max_retries: 3,
            session_ttl_seconds: 24 * 60 * 60,
            buffer_size: 256,
            queue_capacity: 10_000,
            channel: "broadcast".to_string(),
            health_check_interval_seconds: 30,
            operation_timeout_seconds: 5,
            retry_backoff_millis: 1000,
        }
    }
}

/// Per-connection limits for the browser-facing stream
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ConnectionSettings {
    pub max_frame_bytes: usize,
    pub read_timeout_seconds: u64,
    pub write_timeout_seconds: u64,
    /// Must be shorter than `read_timeout_seconds`
    pub ping_interval_seconds: u64,
}

impl Default for ConnectionSettings {
    fn default() -> Self {
        Self {
            max_frame_bytes: 512,
            read_timeout_seconds: 60,
            write_timeout_seconds: 10,
            ping_interval_seconds: 54,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    pub level: String,
    pub format: String, // "json" or "pretty"
    pub file_path: Option<String>,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: "pretty".to_string(),
            file_path: None,
        }
    }
}

impl Config {
    /// Load configuration from multiple sources with priority:
    /// 1. Environment variables (highest priority)
    /// 2. Config file (if provided)
    /// 3. Defaults (lowest priority)
    pub fn load(config_file: Option<&str>) -> Result<Self, ConfigError> {
        let mut builder = ConfigBuilder::builder();

        if let Some(path) = config_file {
            if Path::new(path).exists() {
                builder = builder.add_source(File::with_name(path));
            }
        }

        // RELAYHUB_REDIS__URL, RELAYHUB_HUB__MAX_RETRIES, ...
        builder = builder.add_source(
            Environment::with_prefix("RELAYHUB")
                .prefix_separator("_")
                .separator("__")
                .try_parsing(true),
        );

        let config = builder.build()?;
        config.try_deserialize()
    }

    /// Load from environment variables only (for Docker/K8s)
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::load(None)
    }

    /// Load from file path
    pub fn from_file(path: &str) -> Result<Self, ConfigError> {
        Self::load(Some(path))
    }

    /// Check the configuration, collecting every problem instead of stopping
    /// at the first one.
    pub fn validate(&self) -> Result<(), Vec<String>> {
        let mut errors = Vec::new();

        if self.redis.url.trim().is_empty() {
            errors.push("redis.url must not be empty".to_string());
        }
        if self.hub.buffer_size == 0 {
            errors.push("hub.buffer_size must be greater than 0".to_string());
        }
        if self.hub.queue_capacity == 0 {
            errors.push("hub.queue_capacity must be greater than 0".to_string());
        }
        if self.hub.channel.trim().is_empty() {
            errors.push("hub.channel must not be empty".to_string());
        }
        if self.hub.session_ttl_seconds == 0 {
            errors.push("hub.session_ttl_seconds must be greater than 0".to_string());
        }
        if self.hub.health_check_interval_seconds == 0 {
            errors.push("hub.health_check_interval_seconds must be greater than 0".to_string());
        }
        if self.hub.operation_timeout_seconds == 0 {
            errors.push("hub.operation_timeout_seconds must be greater than 0".to_string());
        }
        if self.connection.max_frame_bytes == 0 {
            errors.push("connection.max_frame_bytes must be greater than 0".to_string());
        }
        if self.connection.write_timeout_seconds == 0 {
            errors.push("connection.write_timeout_seconds must be greater than 0".to_string());
        }
        if self.connection.ping_interval_seconds == 0 {
            errors.push("connection.ping_interval_seconds must be greater than 0".to_string());
        }
        if self.connection.ping_interval_seconds >= self.connection.read_timeout_seconds {
            errors.push(format!(
                "connection.ping_interval_seconds ({}) must be shorter than connection.read_timeout_seconds ({})",
                self.connection.ping_interval_seconds, self.connection.read_timeout_seconds
            ));
        }
        if !matches!(self.logging.format.as_str(), "json" | "pretty") {
            errors.push(format!(
                "logging.format must be \"json\" or \"pretty\", got \"{}\"",
                self.logging.format
            ));
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(errors)
        }
    }

    /// Get Redis URL
    #[must_use]
    pub fn redis_url(&self) -> &str {
        &self.redis.url
    }

    /// Get HTTP listen address
    #[must_use]
    pub fn http_address(&self) -> String {
        format!("{}:{}", self.server.host, self.server.port)
    }
}
