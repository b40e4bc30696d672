//! A uniform read interface over GitHub-style and GitLab-style REST APIs.
//!
//! Each declared repository gets one client, pooled per
//! `(provider kind, instance)` underneath by reqwest. Clients acquire from
//! the shared rate limiter before every request, feed response rate
//! headers back into it, and classify failures into the taxonomy the
//! change engine and supervisor act on.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use reqwest::StatusCode;
use thiserror::Error;
use tokio_util::sync::CancellationToken;

use crate::config::{Config, RepositoryConfig};
use crate::ratelimit::{AcquireError, LimiterRegistry, RateBudget, RateLimiter};
use crate::repourl::{ProviderKind, RepositoryInfo};

pub mod fallback;
mod github;
mod gitlab;

pub use github::GithubClient;
pub use gitlab::GitlabClient;

/// A branch as observed from a provider.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Branch {
    pub name: String,
    pub commit_sha: String,
    pub protected: bool,
}

/// A file entry from a recursive tree listing.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RemoteFile {
    /// Repository-relative path.
    pub path: String,
    /// Size in bytes, when the listing carries it.
    pub size: Option<u64>,
    /// Whether the entry is a symbolic link (mode `120000`).
    pub symlink: bool,
}

/// Failure taxonomy for provider operations.
#[derive(Debug, Error)]
pub enum ProviderError {
    /// Network errors, timeouts, and 5xx responses. Retried with backoff
    /// inside a cycle.
    #[error("transient provider error{}: {context}", status.map(|s| format!(" (HTTP {s})")).unwrap_or_default())]
    Transient {
        context: String,
        status: Option<u16>,
    },

    /// The provider told us to back off.
    #[error("rate limited by provider{}", reset_at.map(|t| format!(" until {t}")).unwrap_or_default())]
    RateLimited { reset_at: Option<DateTime<Utc>> },

    /// 401/403: the token is missing scopes or invalid.
    #[error("unauthorized by provider")]
    Unauthorized,

    /// The repository, ref, or path doesn't exist (or isn't visible).
    #[error("not found")]
    NotFound,

    /// A file exceeds the configured size cap.
    #[error("file `{path}` is {size} bytes, over the {limit} byte limit")]
    FileTooLarge { path: String, size: u64, limit: u64 },

    /// The provider answered with something we can't interpret.
    #[error("malformed provider response: {context}")]
    Malformed { context: String },

    /// The operation was interrupted by shutdown.
    #[error("provider operation cancelled")]
    Cancelled,
}

impl ProviderError {
    /// Whether a retry within the same cycle can plausibly succeed.
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Transient { .. })
    }

    /// Whether the raw-git fallback is allowed to take over. Only
    /// transient or rate-limited failures qualify.
    pub fn fallback_eligible(&self) -> bool {
        matches!(self, Self::Transient { .. } | Self::RateLimited { .. })
    }

    pub(crate) fn from_status(status: StatusCode, reset_at: Option<DateTime<Utc>>) -> Self {
        match status {
            StatusCode::TOO_MANY_REQUESTS => Self::RateLimited { reset_at },
            StatusCode::UNAUTHORIZED => Self::Unauthorized,
            // Providers use 403 both for missing scopes and for exhausted
            // budgets; a reset timestamp disambiguates.
            StatusCode::FORBIDDEN => match reset_at {
                Some(_) => Self::RateLimited { reset_at },
                None => Self::Unauthorized,
            },
            StatusCode::NOT_FOUND => Self::NotFound,
            s if s.is_server_error() => Self::Transient {
                context: "server error".into(),
                status: Some(s.as_u16()),
            },
            s => Self::Malformed {
                context: format!("unexpected HTTP status {s}"),
            },
        }
    }
}

impl From<reqwest::Error> for ProviderError {
    fn from(e: reqwest::Error) -> Self {
        if e.is_decode() {
            Self::Malformed {
                context: e.to_string(),
            }
        } else {
            Self::Transient {
                context: e.to_string(),
                status: e.status().map(|s| s.as_u16()),
            }
        }
    }
}

impl From<AcquireError> for ProviderError {
    fn from(_: AcquireError) -> Self {
        Self::Cancelled
    }
}

/// The uniform provider capability set.
#[async_trait]
pub trait Provider: Send + Sync {
    fn kind(&self) -> ProviderKind;

    /// Lists branches, reusing the previous listing on a conditional-request
    /// hit (`304 Not Modified`).
    async fn list_branches(&self) -> Result<Vec<Branch>, ProviderError>;

    /// Resolves the current head commit of a branch.
    async fn latest_commit(&self, branch: &str) -> Result<String, ProviderError>;

    /// Verifies the repository is reachable with the configured token.
    async fn check_access(&self) -> Result<(), ProviderError>;

    /// Whether `path` exists as a directory at `commit`.
    async fn directory_exists(&self, commit: &str, path: &str) -> Result<bool, ProviderError>;

    /// Recursively lists files under `path` at `commit`.
    async fn list_files(&self, commit: &str, path: &str) -> Result<Vec<RemoteFile>, ProviderError>;

    /// Fetches one file's raw contents at `commit`, enforcing the size cap.
    async fn get_file(&self, commit: &str, path: &str) -> Result<Vec<u8>, ProviderError>;

    /// The current budget of this client's rate limiter.
    fn rate_status(&self) -> RateBudget;
}

/// Connection and retry shape shared by both client families.
#[derive(Clone, Debug)]
pub struct ProviderOptions {
    pub request_timeout: Duration,
    pub retry_attempts: u32,
    pub retry_backoff: Duration,
    pub max_file_size: u64,
    pub enable_api_fallback: bool,
}

impl ProviderOptions {
    pub fn from_config(config: &Config) -> Self {
        Self {
            request_timeout: config.polling.timeout,
            retry_attempts: config.polling.retry_attempts,
            retry_backoff: config.polling.retry_backoff,
            max_file_size: config.detector.max_file_size,
            enable_api_fallback: config.polling.enable_api_fallback,
        }
    }
}

/// Builds the provider client for one declared repository.
///
/// The declared `provider` hint wins over host classification; the API
/// base honors a per-repository override.
pub fn for_repository(
    repo: &RepositoryConfig,
    info: &RepositoryInfo,
    options: &ProviderOptions,
    limiters: &LimiterRegistry,
    cancel: CancellationToken,
) -> Result<Arc<dyn Provider>, ProviderError> {
    let limiter = limiters.get(repo.provider, &info.instance);
    let api_base = repo
        .api_base_url
        .clone()
        .unwrap_or_else(|| info.api_base_url.clone());

    Ok(match repo.provider {
        ProviderKind::Github => Arc::new(GithubClient::new(
            info.clone(),
            api_base,
            repo.token.clone(),
            options.clone(),
            limiter,
            cancel,
        )?),
        ProviderKind::Gitlab => Arc::new(GitlabClient::new(
            info.clone(),
            api_base,
            repo.token.clone(),
            options.clone(),
            limiter,
            cancel,
        )?),
    })
}

/// Runs `op` with bounded exponential backoff on transient failures.
///
/// Only [`ProviderError::Transient`] is retried here; rate limiting is
/// the limiter's job and everything else is terminal for the cycle.
pub(crate) async fn with_retries<T, F, Fut>(
    attempts: u32,
    backoff: Duration,
    cancel: &CancellationToken,
    mut op: F,
) -> Result<T, ProviderError>
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = Result<T, ProviderError>>,
{
    let attempts = attempts.max(1);
    let mut delay = backoff;

    for attempt in 1..=attempts {
        match op().await {
            Ok(value) => return Ok(value),
            Err(e) if e.is_transient() && attempt < attempts => {
                tracing::debug!(attempt, delay_ms = delay.as_millis() as u64, "retrying provider call: {e}");
                tokio::select! {
                    _ = tokio::time::sleep(delay) => {}
                    _ = cancel.cancelled() => return Err(ProviderError::Cancelled),
                }
                delay = delay.saturating_mul(2);
            }
            Err(e) => return Err(e),
        }
    }

    unreachable!("loop returns on the final attempt")
}

/// Parses epoch-seconds rate-reset headers shared by both provider
/// families.
pub(crate) fn parse_reset_epoch(value: Option<&reqwest::header::HeaderValue>) -> Option<DateTime<Utc>> {
    let secs: i64 = value?.to_str().ok()?.trim().parse().ok()?;
    Utc.timestamp_opt(secs, 0).single()
}

pub(crate) fn parse_remaining(value: Option<&reqwest::header::HeaderValue>) -> Option<u64> {
    value?.to_str().ok()?.trim().parse().ok()
}

/// Feeds a response's rate headers into the limiter and extracts the
/// reset timestamp for error classification.
pub(crate) fn absorb_rate_headers(
    limiter: &RateLimiter,
    headers: &reqwest::header::HeaderMap,
    remaining_header: &str,
    reset_header: &str,
) -> Option<DateTime<Utc>> {
    let remaining = parse_remaining(headers.get(remaining_header));
    let reset_at = parse_reset_epoch(headers.get(reset_header));
    if remaining.is_some() || reset_at.is_some() {
        limiter.record_response(remaining, reset_at);
    }
    reset_at
}
