//! Rate-limit aware request retries.
//!
//! Throttled requests are re-issued verbatim after the remote's retry hint, or
//! after the next step of an exponential backoff when the remote gives none.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use backon::{ExponentialBuilder, Retryable};
use chrono::{DateTime, Utc};
use serde_json::Value;
use tracing::{debug, warn};

use super::client::{GraphClient, RateLimit};
use super::error::GraphError;

pub const DEFAULT_MAX_RETRIES: usize = 3;
pub const DEFAULT_MIN_BACKOFF_MS: u64 = 1_000;
pub const DEFAULT_MAX_BACKOFF_MS: u64 = 60_000;
pub const DEFAULT_MAX_WAIT_SECS: u64 = 15 * 60;

#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Retries allowed for one request before the throttle becomes fatal.
    pub max_retries: usize,
    pub min_backoff: Duration,
    pub max_backoff: Duration,
    /// Longest single wait the engine accepts before giving up.
    pub max_wait: Duration,
    pub with_jitter: bool,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: DEFAULT_MAX_RETRIES,
            min_backoff: Duration::from_millis(DEFAULT_MIN_BACKOFF_MS),
            max_backoff: Duration::from_millis(DEFAULT_MAX_BACKOFF_MS),
            max_wait: Duration::from_secs(DEFAULT_MAX_WAIT_SECS),
            with_jitter: true,
        }
    }
}

impl RetryPolicy {
    #[must_use]
    pub fn with_jitter(mut self, jitter: bool) -> Self {
        self.with_jitter = jitter;
        self
    }

    /// Fallback delays used when a throttled response carries no hint.
    pub fn backoff(&self) -> ExponentialBuilder {
        let mut builder = ExponentialBuilder::default()
            .with_min_delay(self.min_backoff)
            .with_max_delay(self.max_backoff)
            .with_max_times(self.max_retries);

        if self.with_jitter {
            builder = builder.with_jitter();
        }

        builder
    }
}

/// Most recent rate-limit block seen by a client, shared across callers.
#[derive(Debug, Clone, Default)]
pub struct RateBudget {
    latest: Arc<Mutex<Option<RateLimit>>>,
}

impl RateBudget {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn observe(&self, limit: Option<RateLimit>) {
        if let Some(limit) = limit {
            *self.lock() = Some(limit);
        }
    }

    pub fn latest(&self) -> Option<RateLimit> {
        *self.lock()
    }

    /// Forget the recorded block once its reset has been waited out.
    pub fn mark_waited(&self) {
        *self.lock() = None;
    }

    /// Time to wait before the budget is back above `floor`, if it is currently below it.
    pub fn wait_below(&self, floor: i64, now: DateTime<Utc>) -> Option<Duration> {
        let limit = self.latest()?;
        if limit.remaining >= floor {
            return None;
        }
        Some(wait_until(limit.reset_at, now))
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Option<RateLimit>> {
        self.latest.lock().unwrap_or_else(|e| e.into_inner())
    }
}

/// Whole seconds from `now` until `reset_at`, rounded up; zero if already past.
pub fn wait_until(reset_at: DateTime<Utc>, now: DateTime<Utc>) -> Duration {
    let millis = (reset_at - now).num_milliseconds();
    if millis <= 0 {
        return Duration::ZERO;
    }
    Duration::from_secs((millis as u64).div_ceil(1000))
}

/// Issue `document`, waiting out throttles until the retry budget is spent.
pub async fn request_with_retry(
    client: &dyn GraphClient,
    policy: &RetryPolicy,
    budget: &RateBudget,
    document: &str,
    variables: &Value,
) -> Result<Value, GraphError> {
    let max_wait = policy.max_wait;
    let attempts = &AtomicUsize::new(0);

    let attempt = || async move {
        attempts.fetch_add(1, Ordering::SeqCst);
        send(client, max_wait, budget, document, variables).await
    };

    attempt
        .retry(policy.backoff())
        .when(GraphError::is_rate_limited)
        .adjust(|err, fallback| throttle_wait(err, fallback, max_wait))
        .notify(|err, wait| {
            // The sleep that follows covers whatever block the throttle recorded.
            budget.mark_waited();
            warn!(
                attempt = attempts.load(Ordering::SeqCst),
                ?wait,
                error = %err,
                "Rate limited, retrying request"
            );
        })
        .await
}

/// One request, preceded by a wait when a previous response already said the budget is gone.
async fn send(
    client: &dyn GraphClient,
    max_wait: Duration,
    budget: &RateBudget,
    document: &str,
    variables: &Value,
) -> Result<Value, GraphError> {
    if let Some(wait) = budget.wait_below(1, Utc::now()) {
        if wait > max_wait {
            return Err(GraphError::RateLimited {
                retry_after: Some(wait),
                reset_at: budget.latest().map(|l| l.reset_at),
            });
        }
        if !wait.is_zero() {
            debug!(?wait, "Rate budget exhausted, waiting for reset");
            tokio::time::sleep(wait).await;
        }
        budget.mark_waited();
    }

    let response = client.request(document, variables.clone()).await;
    budget.observe(response.rate_limit);
    response.result
}

/// Delay before re-issuing a throttled request, or `None` to give up.
///
/// The remote's retry-after hint wins, then its reset time, then the next
/// backoff step. `fallback` is `None` once the backoff is spent.
pub fn throttle_wait(
    err: &GraphError,
    fallback: Option<Duration>,
    max_wait: Duration,
) -> Option<Duration> {
    let Some(fallback) = fallback else {
        warn!("Rate limit retries exhausted");
        return None;
    };

    let wait = match err {
        GraphError::RateLimited {
            retry_after,
            reset_at,
        } => retry_after
            .or_else(|| reset_at.map(|reset| wait_until(reset, Utc::now())))
            .unwrap_or(fallback),
        _ => fallback,
    };

    if wait > max_wait {
        warn!(?wait, ?max_wait, "Rate limit wait exceeds ceiling");
        return None;
    }
    Some(wait)
}
