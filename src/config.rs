use std::time::Duration;

use config::{Config, Environment, File};
use serde::{Deserialize, Serialize};

use crate::collector::CollectorConfig;
use crate::error::SyncError;
use crate::github::client::DEFAULT_GRAPHQL_URL;
use crate::github::retry::{self, RetryPolicy};
use crate::realign::{self, RealignConfig, RealignOptions};
use crate::sync::OrchestratorConfig;

pub const ENV_PREFIX: &str = "ACTIVITY_SYNC";
pub const DEFAULT_CONFIG_FILE: &str = "activity-sync";

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub database_url: String,
    pub github_token: String,
    pub graphql_url: String,
    pub organization: String,
    pub server_host: String,
    pub server_port: u16,
    pub page_size: i64,
    /// How far back the first run reaches; unset collects full history.
    pub initial_lookback_days: Option<i64>,
    pub retry: RetrySettings,
    pub realign: RealignSettings,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RetrySettings {
    pub max_retries: usize,
    pub min_backoff_ms: u64,
    pub max_backoff_ms: u64,
    pub max_wait_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RealignSettings {
    pub freshness_days: i64,
    pub rate_limit_floor: i64,
    pub max_redirect_hops: usize,
    pub chunk_size: usize,
    pub limit: i64,
    /// Run a pass after every successful sync.
    pub after_sync: bool,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            database_url: "sqlite://activity-sync.db".to_string(),
            github_token: String::new(),
            graphql_url: DEFAULT_GRAPHQL_URL.to_string(),
            organization: String::new(),
            server_host: "0.0.0.0".to_string(),
            server_port: 3000,
            page_size: crate::collector::DEFAULT_PAGE_SIZE,
            initial_lookback_days: None,
            retry: RetrySettings::default(),
            realign: RealignSettings::default(),
        }
    }
}

impl Default for RetrySettings {
    fn default() -> Self {
        Self {
            max_retries: retry::DEFAULT_MAX_RETRIES,
            min_backoff_ms: retry::DEFAULT_MIN_BACKOFF_MS,
            max_backoff_ms: retry::DEFAULT_MAX_BACKOFF_MS,
            max_wait_secs: retry::DEFAULT_MAX_WAIT_SECS,
        }
    }
}

impl Default for RealignSettings {
    fn default() -> Self {
        let options = RealignOptions::default();
        Self {
            freshness_days: realign::DEFAULT_FRESHNESS_DAYS,
            rate_limit_floor: realign::DEFAULT_RATE_LIMIT_FLOOR,
            max_redirect_hops: realign::DEFAULT_MAX_REDIRECT_HOPS,
            chunk_size: options.chunk_size,
            limit: options.limit,
            after_sync: true,
        }
    }
}

impl AppConfig {
    /// Defaults, then `activity-sync.toml` if present, then `ACTIVITY_SYNC_*` variables.
    pub fn load() -> Result<Self, SyncError> {
        Self::load_from(DEFAULT_CONFIG_FILE)
    }

    pub fn load_from(path: &str) -> Result<Self, SyncError> {
        let config: AppConfig = Config::builder()
            .add_source(File::with_name(path).required(false))
            .add_source(
                Environment::with_prefix(ENV_PREFIX)
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?
            .try_deserialize()?;

        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), SyncError> {
        if self.organization.trim().is_empty() {
            return Err(SyncError::ConfigError("organization must be set".to_string()));
        }
        if self.github_token.trim().is_empty() {
            return Err(SyncError::ConfigError("github_token must be set".to_string()));
        }
        if !(1..=100).contains(&self.page_size) {
            return Err(SyncError::ConfigError(format!(
                "page_size must be between 1 and 100, got {}",
                self.page_size
            )));
        }
        if self.initial_lookback_days.is_some_and(|days| days <= 0) {
            return Err(SyncError::ConfigError(
                "initial_lookback_days must be positive".to_string(),
            ));
        }
        if self.retry.min_backoff_ms > self.retry.max_backoff_ms {
            return Err(SyncError::ConfigError(
                "retry.min_backoff_ms must not exceed retry.max_backoff_ms".to_string(),
            ));
        }
        if self.realign.chunk_size == 0 {
            return Err(SyncError::ConfigError("realign.chunk_size must be positive".to_string()));
        }
        Ok(())
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_retries: self.retry.max_retries,
            min_backoff: Duration::from_millis(self.retry.min_backoff_ms),
            max_backoff: Duration::from_millis(self.retry.max_backoff_ms),
            max_wait: Duration::from_secs(self.retry.max_wait_secs),
            with_jitter: true,
        }
    }

    pub fn collector_config(&self) -> CollectorConfig {
        CollectorConfig {
            page_size: self.page_size,
            nested_page_size: self.page_size,
            retry: self.retry_policy(),
        }
    }

    pub fn orchestrator_config(&self) -> OrchestratorConfig {
        OrchestratorConfig {
            organization: self.organization.clone(),
            initial_lookback_days: self.initial_lookback_days,
        }
    }

    pub fn realign_config(&self) -> RealignConfig {
        RealignConfig {
            freshness: chrono::Duration::days(self.realign.freshness_days),
            rate_limit_floor: self.realign.rate_limit_floor,
            max_redirect_hops: self.realign.max_redirect_hops,
            retry: self.retry_policy(),
        }
    }

    pub fn realign_options(&self) -> RealignOptions {
        RealignOptions {
            limit: self.realign.limit,
            chunk_size: self.realign.chunk_size,
            ..RealignOptions::default()
        }
    }

    /// Options for the pass that follows a successful sync, if enabled.
    pub fn realign_after_sync(&self) -> Option<RealignOptions> {
        self.realign.after_sync.then(|| self.realign_options())
    }
}
