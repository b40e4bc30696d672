//! The validated configuration snapshot the core runs against.
//!
//! Configuration *loading* (YAML files, environment overlays, the setup
//! wizard) lives outside this crate. The loader deserializes into
//! [`Config`] and must call [`Config::validate`] before handing the
//! snapshot to the [`Supervisor`](crate::supervisor::Supervisor); a reload
//! goes through the same path and is rejected wholesale on any error.

use std::time::Duration;

use camino::Utf8PathBuf;
use indexmap::IndexMap;
use regex::Regex;
use serde::{Deserialize, Serialize, Serializer};
use thiserror::Error;
use url::Url;

use crate::repourl::{self, ProviderKind};

/// Errors rejected at configuration load or reload.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// A repository entry is structurally invalid.
    #[error("repository `{name}`: {reason}")]
    Repository { name: String, reason: String },

    /// Two repository entries share a name.
    #[error("duplicate repository name `{0}`")]
    DuplicateRepository(String),

    /// A repository URL failed provider classification.
    #[error("repository `{name}`: invalid URL")]
    RepositoryUrl {
        name: String,
        #[source]
        source: repourl::ParseError,
    },

    /// A `branch_regex` doesn't compile.
    #[error("repository `{name}`: invalid branch regex `{pattern}`")]
    BranchRegex {
        name: String,
        pattern: String,
        #[source]
        source: regex::Error,
    },

    /// A token is empty after environment expansion.
    #[error("repository `{name}`: token is empty after expansion")]
    EmptyToken { name: String },

    /// A token references an environment variable outside the whitelist.
    #[error("repository `{name}`: environment variable `{var}` is not in security.allowed_env_vars")]
    EnvVarNotAllowed { name: String, var: String },

    /// A token references an environment variable that isn't set.
    #[error("repository `{name}`: environment variable `{var}` is not set")]
    EnvVarMissing { name: String, var: String },

    /// The trigger endpoint URL is invalid.
    #[error("tekton.event_listener_url: {0}")]
    EventListenerUrl(String),

    /// A numeric option is outside its valid range.
    #[error("{option} must be at least {minimum}")]
    OutOfRange { option: &'static str, minimum: u64 },
}

/// The complete, immutable configuration snapshot for one config generation.
#[derive(Clone, Debug, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct Config {
    #[serde(default)]
    pub app: AppConfig,
    #[serde(default)]
    pub polling: PollingConfig,
    #[serde(default)]
    pub storage: StorageConfig,
    pub tekton: TektonConfig,
    #[serde(default)]
    pub detector: DetectorConfig,
    #[serde(default)]
    pub rate_limit: RateLimitConfig,
    #[serde(default)]
    pub security: SecurityConfig,
    #[serde(default)]
    pub repositories: Vec<RepositoryConfig>,
}

impl Config {
    /// Validates the snapshot and expands repository tokens from the
    /// environment, consuming `self` and returning the validated form.
    ///
    /// Every invariant the core depends on is enforced here; components
    /// may assume a [`Config`] that passed validation.
    pub fn validate(mut self) -> Result<Config, ConfigError> {
        if self.polling.max_workers == 0 {
            return Err(ConfigError::OutOfRange {
                option: "polling.max_workers",
                minimum: 1,
            });
        }
        if self.polling.batch_size == 0 {
            return Err(ConfigError::OutOfRange {
                option: "polling.batch_size",
                minimum: 1,
            });
        }
        if self.polling.interval < Duration::from_secs(1) {
            return Err(ConfigError::OutOfRange {
                option: "polling.interval",
                minimum: 1,
            });
        }
        if self.storage.max_connections == 0 {
            return Err(ConfigError::OutOfRange {
                option: "storage.max_connections",
                minimum: 1,
            });
        }

        let listener = Url::parse(&self.tekton.event_listener_url)
            .map_err(|e| ConfigError::EventListenerUrl(e.to_string()))?;
        match listener.scheme() {
            "https" => {}
            "http" if !self.security.require_https => {}
            other => {
                return Err(ConfigError::EventListenerUrl(format!(
                    "scheme `{other}` requires security.require_https=false"
                )));
            }
        }

        let mut seen = std::collections::HashSet::new();
        for repo in &mut self.repositories {
            if repo.name.is_empty() {
                return Err(ConfigError::Repository {
                    name: "<unnamed>".into(),
                    reason: "name must not be empty".into(),
                });
            }
            if !seen.insert(repo.name.clone()) {
                return Err(ConfigError::DuplicateRepository(repo.name.clone()));
            }

            repourl::parse(&repo.url).map_err(|source| ConfigError::RepositoryUrl {
                name: repo.name.clone(),
                source,
            })?;

            Regex::new(&repo.branch_regex).map_err(|source| ConfigError::BranchRegex {
                name: repo.name.clone(),
                pattern: repo.branch_regex.clone(),
                source,
            })?;

            repo.token = repo.token.expand(&repo.name, &self.security)?;
            if repo.token.expose().is_empty() {
                return Err(ConfigError::EmptyToken {
                    name: repo.name.clone(),
                });
            }
        }

        Ok(self)
    }

    /// Returns the effective polling interval for a repository.
    pub fn interval_for(&self, repo: &RepositoryConfig) -> Duration {
        repo.polling_interval.unwrap_or(self.polling.interval)
    }
}

/// Application identity and logging sinks.
#[derive(Clone, Debug, Deserialize, Serialize)]
#[serde(default, deny_unknown_fields)]
pub struct AppConfig {
    pub name: String,
    pub log_level: String,
    pub log_format: LogFormat,
    pub data_dir: Utf8PathBuf,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            name: "reposentry".into(),
            log_level: "info".into(),
            log_format: LogFormat::Text,
            data_dir: "./data".into(),
        }
    }
}

/// Log output format.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Text,
    Json,
}

/// Scheduler and change-engine shape.
#[derive(Clone, Debug, Deserialize, Serialize)]
#[serde(default, deny_unknown_fields)]
pub struct PollingConfig {
    /// Global polling cadence; repositories may override it individually.
    #[serde(with = "humantime_serde")]
    pub interval: Duration,
    /// Hard cap on outbound provider I/O for one repository cycle.
    #[serde(with = "humantime_serde")]
    pub timeout: Duration,
    /// Size of the repository worker pool.
    pub max_workers: usize,
    /// Bound on the cycle submission queue.
    pub batch_size: usize,
    /// Attempts for transient provider errors within a cycle.
    pub retry_attempts: u32,
    /// Base backoff between provider retries.
    #[serde(with = "humantime_serde")]
    pub retry_backoff: Duration,
    /// Permit the raw-git fallback for commit lookups.
    pub enable_api_fallback: bool,
    /// Cycles a vanished branch is retained before its ledger row is pruned.
    pub prune_vanished_after: u32,
}

impl Default for PollingConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(300),
            timeout: Duration::from_secs(30),
            max_workers: 4,
            batch_size: 10,
            retry_attempts: 3,
            retry_backoff: Duration::from_secs(1),
            enable_api_fallback: false,
            prune_vanished_after: 1,
        }
    }
}

/// Ledger backend selection and tuning.
#[derive(Clone, Debug, Deserialize, Serialize)]
#[serde(default, deny_unknown_fields)]
pub struct StorageConfig {
    #[serde(rename = "type")]
    pub kind: StorageKind,
    pub path: Utf8PathBuf,
    pub max_connections: u32,
    #[serde(with = "humantime_serde")]
    pub connection_timeout: Duration,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            kind: StorageKind::Embedded,
            path: "./data/reposentry.db".into(),
            max_connections: 5,
            connection_timeout: Duration::from_secs(5),
        }
    }
}

/// Supported ledger backends.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum StorageKind {
    /// The single-file embedded SQLite store.
    #[default]
    Embedded,
}

/// Dispatcher configuration for the Tekton trigger endpoint.
#[derive(Clone, Debug, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct TektonConfig {
    /// The `EventListener` URL events are POSTed to.
    pub event_listener_url: String,
    /// Per-request timeout.
    #[serde(default = "default_tekton_timeout", with = "humantime_serde")]
    pub timeout: Duration,
    /// Dispatch attempts per cycle.
    #[serde(default = "default_retry_attempts")]
    pub retry_attempts: u32,
    /// Base backoff between dispatch attempts.
    #[serde(default = "default_retry_backoff", with = "humantime_serde")]
    pub retry_backoff: Duration,
    /// Re-drive attempts for `failed` events on later cycles.
    #[serde(default = "default_retry_attempts")]
    pub redrive_attempts: u32,
    /// Extra headers merged over the defaults.
    #[serde(default)]
    pub headers: IndexMap<String, String>,
}

fn default_tekton_timeout() -> Duration {
    Duration::from_secs(10)
}

fn default_retry_attempts() -> u32 {
    3
}

fn default_retry_backoff() -> Duration {
    Duration::from_secs(1)
}

/// Detector shape: where to scan and what to consider.
#[derive(Clone, Debug, Deserialize, Serialize)]
#[serde(default, deny_unknown_fields)]
pub struct DetectorConfig {
    /// The fixed top-level directory scanned for pipeline definitions.
    pub scan_directory: String,
    /// Recursion depth below the scan directory.
    pub max_depth: u32,
    /// File extensions considered by the scan.
    pub extensions: Vec<String>,
    /// Per-file size cap.
    pub max_file_size: u64,
}

impl Default for DetectorConfig {
    fn default() -> Self {
        Self {
            scan_directory: ".tekton".into(),
            max_depth: 5,
            extensions: vec![".yaml".into(), ".yml".into()],
            max_file_size: 1024 * 1024,
        }
    }
}

/// Limiter shapes for both provider families.
#[derive(Clone, Debug, Default, Deserialize, Serialize)]
#[serde(default, deny_unknown_fields)]
pub struct RateLimitConfig {
    pub github: GithubRateLimit,
    pub gitlab: GitlabRateLimit,
}

/// GitHub-kind budget: requests per hour with a burst allowance.
#[derive(Clone, Debug, Deserialize, Serialize)]
#[serde(default, deny_unknown_fields)]
pub struct GithubRateLimit {
    pub requests_per_hour: u32,
    pub burst: u32,
}

impl Default for GithubRateLimit {
    fn default() -> Self {
        Self {
            requests_per_hour: 5000,
            burst: 10,
        }
    }
}

/// GitLab-kind budget: a requests-per-second token bucket.
#[derive(Clone, Debug, Deserialize, Serialize)]
#[serde(default, deny_unknown_fields)]
pub struct GitlabRateLimit {
    pub requests_per_second: u32,
    pub burst: u32,
}

impl Default for GitlabRateLimit {
    fn default() -> Self {
        Self {
            requests_per_second: 10,
            burst: 20,
        }
    }
}

/// Secret-injection and URL policy.
#[derive(Clone, Debug, Deserialize, Serialize)]
#[serde(default, deny_unknown_fields)]
pub struct SecurityConfig {
    /// Environment variable names (with optional `*` prefix/suffix
    /// wildcards) that tokens may be expanded from.
    pub allowed_env_vars: Vec<String>,
    /// Require HTTPS for the trigger endpoint.
    pub require_https: bool,
}

impl Default for SecurityConfig {
    fn default() -> Self {
        Self {
            allowed_env_vars: vec!["GITHUB_*".into(), "GITLAB_*".into(), "*_TOKEN".into()],
            require_https: true,
        }
    }
}

impl SecurityConfig {
    /// Returns whether `var` matches the `allowed_env_vars` whitelist.
    pub fn env_var_allowed(&self, var: &str) -> bool {
        self.allowed_env_vars.iter().any(|pattern| {
            if let Some(suffix) = pattern.strip_prefix('*') {
                var.ends_with(suffix)
            } else if let Some(prefix) = pattern.strip_suffix('*') {
                var.starts_with(prefix)
            } else {
                var == pattern
            }
        })
    }
}

/// One declared repository.
#[derive(Clone, Debug, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct RepositoryConfig {
    /// Stable unique key; also the ledger's repository key.
    pub name: String,
    /// Canonical HTTPS clone URL.
    pub url: String,
    /// Declared provider family.
    pub provider: ProviderKind,
    /// Access token, possibly an `${ENV_VAR}` reference before validation.
    pub token: Token,
    /// Anchored regular expression over branch names.
    pub branch_regex: String,
    #[serde(default = "default_true")]
    pub enabled: bool,
    /// Per-repository polling cadence override.
    #[serde(default, with = "humantime_serde")]
    pub polling_interval: Option<Duration>,
    /// Provider API base override, e.g. for unusual self-hosted layouts.
    #[serde(default)]
    pub api_base_url: Option<String>,
}

fn default_true() -> bool {
    true
}

/// An opaque access token.
///
/// The token's value never appears in `Debug`/`Display` output or in
/// serialized snapshots; only the provider client reads it, at request
/// time, via [`Token::expose`].
#[derive(Clone, Deserialize)]
#[serde(transparent)]
pub struct Token(String);

impl Token {
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    /// Reads the secret value. Callers outside the provider client have
    /// no business calling this.
    pub fn expose(&self) -> &str {
        &self.0
    }

    /// Expands a `${VAR}` or `$VAR` reference against the process
    /// environment, enforcing the security whitelist. Literal tokens pass
    /// through unchanged.
    fn expand(&self, repo: &str, security: &SecurityConfig) -> Result<Token, ConfigError> {
        let raw = self.0.trim();
        let var = match raw.strip_prefix("${").and_then(|rest| rest.strip_suffix('}')) {
            Some(var) => var,
            None => match raw.strip_prefix('$') {
                Some(var) => var,
                None => return Ok(Token(raw.to_string())),
            },
        };

        if !security.env_var_allowed(var) {
            return Err(ConfigError::EnvVarNotAllowed {
                name: repo.into(),
                var: var.into(),
            });
        }

        match std::env::var(var) {
            Ok(value) => Ok(Token(value.trim().to_string())),
            Err(_) => Err(ConfigError::EnvVarMissing {
                name: repo.into(),
                var: var.into(),
            }),
        }
    }
}

impl std::fmt::Debug for Token {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("Token(***)")
    }
}

impl std::fmt::Display for Token {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("***")
    }
}

impl Serialize for Token {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str("***")
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    fn minimal(repos: Vec<RepositoryConfig>) -> Config {
        Config {
            app: AppConfig::default(),
            polling: PollingConfig::default(),
            storage: StorageConfig::default(),
            tekton: TektonConfig {
                event_listener_url: "https://listener.example.com/trigger".into(),
                timeout: default_tekton_timeout(),
                retry_attempts: 3,
                retry_backoff: default_retry_backoff(),
                redrive_attempts: 3,
                headers: IndexMap::new(),
            },
            detector: DetectorConfig::default(),
            rate_limit: RateLimitConfig::default(),
            security: SecurityConfig::default(),
            repositories: repos,
        }
    }

    fn repo(name: &str) -> RepositoryConfig {
        RepositoryConfig {
            name: name.into(),
            url: format!("https://github.com/acme/{name}"),
            provider: ProviderKind::Github,
            token: Token::new("tok-123"),
            branch_regex: "main".into(),
            enabled: true,
            polling_interval: None,
            api_base_url: None,
        }
    }

    #[test]
    fn test_validate_ok() {
        let config = minimal(vec![repo("api"), repo("web")]).validate().unwrap();
        assert_eq!(config.repositories.len(), 2);
    }

    #[test]
    fn test_validate_duplicate_name() {
        let err = minimal(vec![repo("api"), repo("api")]).validate().unwrap_err();
        assert!(matches!(err, ConfigError::DuplicateRepository(name) if name == "api"));
    }

    #[test]
    fn test_validate_bad_regex() {
        let mut bad = repo("api");
        bad.branch_regex = "release/(".into();
        assert!(matches!(
            minimal(vec![bad]).validate().unwrap_err(),
            ConfigError::BranchRegex { .. }
        ));
    }

    #[test]
    fn test_validate_rejects_http_listener() {
        let mut config = minimal(vec![]);
        config.tekton.event_listener_url = "http://listener.internal/trigger".into();
        assert!(matches!(
            config.clone().validate().unwrap_err(),
            ConfigError::EventListenerUrl(_)
        ));

        // Explicit opt-out admits plain HTTP.
        config.security.require_https = false;
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_token_env_expansion() {
        // SAFETY: test-local variable, no concurrent reader cares.
        unsafe { std::env::set_var("REPOSENTRY_TEST_TOKEN", "  secret  ") };
        let mut with_env = repo("api");
        with_env.token = Token::new("${REPOSENTRY_TEST_TOKEN}");
        let config = minimal(vec![with_env]).validate().unwrap();
        assert_eq!(config.repositories[0].token.expose(), "secret");
    }

    #[test]
    fn test_token_env_whitelist() {
        let mut with_env = repo("api");
        with_env.token = Token::new("${HOME}");
        assert!(matches!(
            minimal(vec![with_env]).validate().unwrap_err(),
            ConfigError::EnvVarNotAllowed { var, .. } if var == "HOME"
        ));
    }

    #[test]
    fn test_env_var_patterns() {
        let security = SecurityConfig::default();
        assert!(security.env_var_allowed("GITHUB_TOKEN"));
        assert!(security.env_var_allowed("GITLAB_API_KEY"));
        assert!(security.env_var_allowed("MY_TOKEN"));
        assert!(!security.env_var_allowed("PATH"));
    }

    #[test]
    fn test_token_never_serializes() {
        let token = Token::new("tok-123");
        assert_eq!(serde_json::to_string(&token).unwrap(), "\"***\"");
        assert_eq!(format!("{token:?}"), "Token(***)");
        assert_eq!(token.to_string(), "***");
    }
}
