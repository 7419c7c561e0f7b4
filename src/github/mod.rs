pub mod client;
pub mod convert;
pub mod error;
pub mod queries;
pub mod retry;
pub mod types;

pub use client::{GraphClient, GraphResponse, HttpGraphClient, RateLimit};
pub use error::GraphError;
pub use retry::{request_with_retry, RateBudget, RetryPolicy};
