//! GraphQL transport error types.

use std::time::Duration;

use chrono::{DateTime, Utc};
use thiserror::Error;

/// Errors produced by the remote graph transport.
///
/// Rate-limit metadata travels on [`GraphResponse`](super::client::GraphResponse)
/// rather than inside these variants, except for the retry hint of a throttled call.
#[derive(Debug, Error, Clone, PartialEq)]
pub enum GraphError {
    #[error("Rate limit exceeded (retry after {retry_after:?}, resets at {reset_at:?})")]
    RateLimited {
        retry_after: Option<Duration>,
        reset_at: Option<DateTime<Utc>>,
    },

    #[error("HTTP {status}: {message}")]
    Http { status: u16, message: String },

    #[error("Transport error: {0}")]
    Transport(String),

    #[error("GraphQL errors: {}", .0.join("; "))]
    Query(Vec<String>),

    #[error("Invalid response: {0}")]
    Decode(String),
}

impl From<reqwest::Error> for GraphError {
    fn from(err: reqwest::Error) -> Self {
        Self::Transport(err.to_string())
    }
}

impl GraphError {
    /// Failures that say nothing about a particular node and would hit every
    /// subsequent request the same way.
    pub fn is_transport(&self) -> bool {
        match self {
            Self::Transport(_) => true,
            Self::Http { status, .. } => *status >= 500 || *status == 401,
            _ => false,
        }
    }

    pub fn is_rate_limited(&self) -> bool {
        matches!(self, Self::RateLimited { .. })
    }
}
