use thiserror::Error;

use crate::github::error::GraphError;

impl From<serde_json::Error> for SyncError {
    fn from(err: serde_json::Error) -> Self {
        Self::PayloadError(format!("JSON serialization error: {}", err))
    }
}

impl From<sqlx::Error> for SyncError {
    fn from(err: sqlx::Error) -> Self {
        Self::DatabaseError(err.to_string())
    }
}

impl From<config::ConfigError> for SyncError {
    fn from(err: config::ConfigError) -> Self {
        Self::ConfigError(err.to_string())
    }
}

#[derive(Error, Debug, Clone)]
pub enum SyncError {
    #[error("Configuration error: {0}")]
    ConfigError(String),

    #[error("Database error: {0}")]
    DatabaseError(String),

    #[error("GitHub API error: {0}")]
    RemoteError(#[from] GraphError),

    #[error("Payload error: {0}")]
    PayloadError(String),

    #[error("Validation error: {0}")]
    ValidationError(String),

    #[error("Sync task error: {0}")]
    TaskError(String),
}

impl SyncError {
    pub fn missing_field(path: &str) -> Self {
        Self::PayloadError(format!("Missing field in response: {}", path))
    }

    pub fn invalid_timestamp(value: &str, err: chrono::ParseError) -> Self {
        Self::DatabaseError(format!("Invalid timestamp {:?}: {}", value, err))
    }

    /// True when the failure came from remote throttling that outlasted the retry budget.
    pub fn is_rate_limited(&self) -> bool {
        matches!(self, Self::RemoteError(GraphError::RateLimited { .. }))
    }
}
