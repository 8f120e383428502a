//! Error types for the funnel dispatcher.

/// Top-level error type.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Database error: {0}")]
    Database(#[from] DatabaseError),

    #[error("Delivery error: {0}")]
    Delivery(#[from] DeliveryError),

    #[error("Funnel error: {0}")]
    Funnel(#[from] FunnelError),
}

/// Configuration-related errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Missing required environment variable: {0}")]
    MissingEnvVar(String),

    #[error("Invalid configuration value for {key}: {message}")]
    InvalidValue { key: String, message: String },

    #[error("Failed to parse configuration: {0}")]
    ParseError(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Database-related errors.
#[derive(Debug, thiserror::Error)]
pub enum DatabaseError {
    #[error("Connection pool error: {0}")]
    Pool(String),

    #[error("Query failed: {0}")]
    Query(String),

    #[error("Migration failed: {0}")]
    Migration(String),

    #[error("Serialization error: {0}")]
    Serialization(String),
}

/// Message gateway failures, classified by whether a retry can help.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum DeliveryError {
    /// Network, timeout, rate limit or upstream 5xx. Worth retrying.
    #[error("Transient failure on {gateway}: {reason}")]
    Transient { gateway: String, reason: String },

    /// Destination blocked the bot, was deleted, or never existed.
    #[error("Permanent failure on {gateway}: {reason}")]
    Permanent { gateway: String, reason: String },
}

impl DeliveryError {
    pub fn transient(gateway: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::Transient {
            gateway: gateway.into(),
            reason: reason.into(),
        }
    }

    pub fn permanent(gateway: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::Permanent {
            gateway: gateway.into(),
            reason: reason.into(),
        }
    }

    pub fn is_permanent(&self) -> bool {
        matches!(self, Self::Permanent { .. })
    }
}

/// Track controller / reclaimer errors.
#[derive(Debug, thiserror::Error)]
pub enum FunnelError {
    #[error("No schedule record for user {user_id}")]
    UnknownUser { user_id: String },

    #[error("No content for message {message_id}")]
    UnknownMessage { message_id: String },

    #[error("Store error: {0}")]
    Store(#[from] DatabaseError),
}

/// Result type alias for the crate.
pub type Result<T> = std::result::Result<T, Error>;
