//! GitHub GraphQL transport.
//!
//! Every call yields a [`GraphResponse`] carrying the rate-limit block observed
//! on that response, whether the call produced data or failed.

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use reqwest::header::{HeaderMap, LOCATION, RETRY_AFTER};
use reqwest::{Client, StatusCode, Url};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tracing::{debug, warn};

use super::error::GraphError;

pub const DEFAULT_GRAPHQL_URL: &str = "https://api.github.com/graphql";

/// Remaining request budget as reported by the remote.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RateLimit {
    pub remaining: i64,
    pub reset_at: DateTime<Utc>,
}

/// Outcome of a single graph request.
#[derive(Debug, Clone)]
pub struct GraphResponse {
    pub rate_limit: Option<RateLimit>,
    pub result: Result<Value, GraphError>,
}

impl GraphResponse {
    pub fn data(data: Value, rate_limit: Option<RateLimit>) -> Self {
        Self {
            rate_limit,
            result: Ok(data),
        }
    }

    pub fn error(error: GraphError, rate_limit: Option<RateLimit>) -> Self {
        Self {
            rate_limit,
            result: Err(error),
        }
    }
}

#[async_trait]
pub trait GraphClient: Send + Sync {
    /// Execute a GraphQL document with the given variables.
    async fn request(&self, document: &str, variables: Value) -> GraphResponse;

    /// Follow HTTP redirects from `url`, at most `max_hops` times, returning the final location.
    async fn resolve_redirects(&self, url: &str, max_hops: usize) -> Result<String, GraphError>;
}

#[derive(Debug, Deserialize)]
struct Envelope {
    data: Option<Value>,
    #[serde(default)]
    errors: Vec<ErrorEntry>,
}

#[derive(Debug, Deserialize)]
struct ErrorEntry {
    message: String,
    #[serde(rename = "type")]
    kind: Option<String>,
}

/// reqwest-backed client for the GitHub GraphQL endpoint.
#[derive(Clone)]
pub struct HttpGraphClient {
    http: Client,
    endpoint: String,
    token: String,
}

impl HttpGraphClient {
    pub fn new(endpoint: impl Into<String>, token: impl Into<String>) -> Result<Self, GraphError> {
        let http = Client::builder()
            .user_agent(concat!("activity-sync/", env!("CARGO_PKG_VERSION")))
            .redirect(reqwest::redirect::Policy::none())
            .timeout(Duration::from_secs(60))
            .build()?;

        Ok(Self {
            http,
            endpoint: endpoint.into(),
            token: token.into(),
        })
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }
}

#[async_trait]
impl GraphClient for HttpGraphClient {
    async fn request(&self, document: &str, variables: Value) -> GraphResponse {
        let response = match self
            .http
            .post(&self.endpoint)
            .bearer_auth(&self.token)
            .json(&json!({ "query": document, "variables": variables }))
            .send()
            .await
        {
            Ok(response) => response,
            Err(e) => return GraphResponse::error(e.into(), None),
        };

        let status = response.status();
        let header_limit = rate_limit_from_headers(response.headers());
        let retry_after = retry_after_from_headers(response.headers());

        let body = match response.text().await {
            Ok(body) => body,
            Err(e) => return GraphResponse::error(e.into(), header_limit),
        };

        if is_throttled(status, header_limit.as_ref(), retry_after, &body) {
            warn!(%status, ?retry_after, "GraphQL request throttled");
            return GraphResponse::error(
                GraphError::RateLimited {
                    retry_after,
                    reset_at: header_limit.map(|l| l.reset_at),
                },
                header_limit,
            );
        }

        if !status.is_success() {
            return GraphResponse::error(
                GraphError::Http {
                    status: status.as_u16(),
                    message: truncate(&body, 200),
                },
                header_limit,
            );
        }

        let envelope: Envelope = match serde_json::from_str(&body) {
            Ok(envelope) => envelope,
            Err(e) => {
                return GraphResponse::error(GraphError::Decode(e.to_string()), header_limit)
            }
        };

        let rate_limit = envelope
            .data
            .as_ref()
            .and_then(|d| d.get("rateLimit"))
            .and_then(|v| serde_json::from_value::<RateLimit>(v.clone()).ok())
            .or(header_limit);

        interpret_envelope(envelope, retry_after, rate_limit)
    }

    async fn resolve_redirects(&self, url: &str, max_hops: usize) -> Result<String, GraphError> {
        let mut current =
            Url::parse(url).map_err(|e| GraphError::Decode(format!("invalid url {}: {}", url, e)))?;

        for hop in 0..max_hops {
            let response = self.http.head(current.clone()).send().await?;
            if !response.status().is_redirection() {
                if !response.status().is_success() {
                    return Err(GraphError::Http {
                        status: response.status().as_u16(),
                        message: format!("resolving {}", current),
                    });
                }
                return Ok(current.to_string());
            }

            let location = response
                .headers()
                .get(LOCATION)
                .and_then(|v| v.to_str().ok())
                .ok_or_else(|| GraphError::Decode("redirect without location".to_string()))?;
            let next = current
                .join(location)
                .map_err(|e| GraphError::Decode(format!("invalid location {}: {}", location, e)))?;
            debug!(hop, from = %current, to = %next, "Following redirect");
            current = next;
        }

        Ok(current.to_string())
    }
}

fn interpret_envelope(
    envelope: Envelope,
    retry_after: Option<Duration>,
    rate_limit: Option<RateLimit>,
) -> GraphResponse {
    let Envelope { data, errors } = envelope;

    if errors
        .iter()
        .any(|e| e.kind.as_deref() == Some("RATE_LIMITED"))
    {
        return GraphResponse::error(
            GraphError::RateLimited {
                retry_after,
                reset_at: rate_limit.map(|l| l.reset_at),
            },
            rate_limit,
        );
    }

    let data = data.filter(|d| !d.is_null());

    // NOT_FOUND errors accompany partial data where the missing node is null.
    let only_not_found = errors
        .iter()
        .all(|e| e.kind.as_deref() == Some("NOT_FOUND"));

    match data {
        Some(data) if errors.is_empty() || only_not_found => GraphResponse::data(data, rate_limit),
        _ if !errors.is_empty() => GraphResponse::error(
            GraphError::Query(errors.into_iter().map(|e| e.message).collect()),
            rate_limit,
        ),
        _ => GraphResponse::error(
            GraphError::Decode("response carried no data".to_string()),
            rate_limit,
        ),
    }
}

fn is_throttled(
    status: StatusCode,
    limit: Option<&RateLimit>,
    retry_after: Option<Duration>,
    body: &str,
) -> bool {
    if status == StatusCode::TOO_MANY_REQUESTS {
        return true;
    }
    status == StatusCode::FORBIDDEN
        && (retry_after.is_some()
            || limit.is_some_and(|l| l.remaining == 0)
            || body.to_ascii_lowercase().contains("rate limit"))
}

pub fn rate_limit_from_headers(headers: &HeaderMap) -> Option<RateLimit> {
    let remaining = headers
        .get("x-ratelimit-remaining")?
        .to_str()
        .ok()?
        .parse::<i64>()
        .ok()?;
    let reset = headers
        .get("x-ratelimit-reset")?
        .to_str()
        .ok()?
        .parse::<i64>()
        .ok()?;

    Some(RateLimit {
        remaining,
        reset_at: DateTime::from_timestamp(reset, 0)?,
    })
}

pub fn retry_after_from_headers(headers: &HeaderMap) -> Option<Duration> {
    headers
        .get(RETRY_AFTER)?
        .to_str()
        .ok()?
        .trim()
        .parse::<u64>()
        .ok()
        .map(Duration::from_secs)
}

fn truncate(body: &str, max: usize) -> String {
    match body.char_indices().nth(max) {
        Some((idx, _)) => format!("{}...", &body[..idx]),
        None => body.to_string(),
    }
}
