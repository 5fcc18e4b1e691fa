//! Error types for the cluster hub

use thiserror::Error;

/// Cluster error types
#[derive(Debug, Error)]
pub enum Error {
    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Redis error: {0}")]
    Redis(#[from] redis::RedisError),

    #[error("Broker error: {0}")]
    Broker(String),

    #[error("Timeout: {0}")]
    Timeout(String),

    #[error("Broker connection closed")]
    Closed,
}

/// Result type for cluster operations
pub type Result<T> = std::result::Result<T, Error>;
