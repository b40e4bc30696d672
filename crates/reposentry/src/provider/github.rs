//! The GitHub-family REST client (github.com and GitHub Enterprise).

use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use percent_encoding::{AsciiSet, CONTROLS, utf8_percent_encode};
use reqwest::StatusCode;
use reqwest::header::{ACCEPT, AUTHORIZATION, IF_NONE_MATCH};
use serde::Deserialize;
use tokio_util::sync::CancellationToken;
use tracing::instrument;

use crate::config::Token;
use crate::ratelimit::{RateBudget, RateLimiter};
use crate::repourl::{ProviderKind, RepositoryInfo};

use super::fallback::{FallbackPolicy, GitRefLister};
use super::{Branch, Provider, ProviderError, ProviderOptions, RemoteFile, with_retries};

const API_VERSION: &str = "2022-11-28";
const REMAINING_HEADER: &str = "x-ratelimit-remaining";
const RESET_HEADER: &str = "x-ratelimit-reset";

/// Characters to escape within a path segment. `/` is intentionally
/// preserved: the contents API takes repository paths verbatim.
const PATH_ESCAPES: &AsciiSet = &CONTROLS.add(b' ').add(b'"').add(b'#').add(b'<').add(b'>').add(b'?').add(b'%');

struct BranchCache {
    etag: String,
    branches: Vec<Branch>,
}

pub struct GithubClient {
    info: RepositoryInfo,
    api_base: String,
    token: Token,
    http: reqwest::Client,
    limiter: Arc<RateLimiter>,
    options: ProviderOptions,
    cancel: CancellationToken,
    branch_cache: Mutex<Option<BranchCache>>,
    fallback_policy: FallbackPolicy,
    fallback: Option<GitRefLister>,
}

impl GithubClient {
    pub fn new(
        info: RepositoryInfo,
        api_base: String,
        token: Token,
        options: ProviderOptions,
        limiter: Arc<RateLimiter>,
        cancel: CancellationToken,
    ) -> Result<Self, ProviderError> {
        let http = reqwest::Client::builder()
            .user_agent(crate::USER_AGENT)
            .timeout(options.request_timeout)
            .build()
            .map_err(ProviderError::from)?;

        let fallback_policy = FallbackPolicy {
            enabled: options.enable_api_fallback,
        };
        let fallback = options
            .enable_api_fallback
            .then(|| GitRefLister::new(info.clone_url.clone(), token.clone(), options.request_timeout))
            .transpose()?;

        Ok(Self {
            info,
            api_base,
            token,
            http,
            limiter,
            options,
            cancel,
            branch_cache: Mutex::new(None),
            fallback_policy,
            fallback,
        })
    }

    fn repo_url(&self, suffix: &str) -> String {
        format!(
            "{base}/repos/{full_name}{suffix}",
            base = self.api_base,
            full_name = self.info.full_name
        )
    }

    /// A GET against the REST API with the standard JSON media type.
    /// `get_file` builds its own request to ask for raw contents instead.
    fn api_get(&self, url: String) -> reqwest::RequestBuilder {
        self.http
            .get(url)
            .header(ACCEPT, "application/vnd.github+json")
    }

    /// Issues one request: limiter first, token injected at send time,
    /// rate headers folded back into the limiter.
    async fn send(&self, req: reqwest::RequestBuilder) -> Result<reqwest::Response, ProviderError> {
        self.limiter.acquire(&self.cancel, 1).await?;

        let resp = req
            .header(AUTHORIZATION, format!("Bearer {}", self.token.expose()))
            .header("X-GitHub-Api-Version", API_VERSION)
            .send()
            .await?;

        let reset_at = super::absorb_rate_headers(
            &self.limiter,
            resp.headers(),
            REMAINING_HEADER,
            RESET_HEADER,
        );

        let status = resp.status();
        if status.is_success() || status == StatusCode::NOT_MODIFIED {
            Ok(resp)
        } else {
            Err(ProviderError::from_status(status, reset_at))
        }
    }

    async fn list_branches_once(&self) -> Result<Vec<Branch>, ProviderError> {
        let etag = {
            let cache = self.branch_cache.lock().unwrap_or_else(|p| p.into_inner());
            cache.as_ref().map(|c| c.etag.clone())
        };

        let mut req = self
            .api_get(self.repo_url("/branches"))
            .query(&[("per_page", "100"), ("page", "1")]);
        if let Some(etag) = &etag {
            req = req.header(IF_NONE_MATCH, etag);
        }

        let first = self.send(req).await?;
        if first.status() == StatusCode::NOT_MODIFIED {
            let cache = self.branch_cache.lock().unwrap_or_else(|p| p.into_inner());
            if let Some(cache) = cache.as_ref() {
                return Ok(cache.branches.clone());
            }
            // A 304 without a cached listing means our ETag bookkeeping is
            // out of step with the server; treat it as transient.
            return Err(ProviderError::Transient {
                context: "not-modified response without a cached branch list".into(),
                status: Some(304),
            });
        }

        let new_etag = first
            .headers()
            .get(reqwest::header::ETAG)
            .and_then(|v| v.to_str().ok())
            .map(String::from);

        let mut page: Vec<ApiBranch> = first.json().await?;
        let mut branches: Vec<Branch> = Vec::new();
        let mut page_no = 1u32;
        loop {
            let full_page = page.len() == 100;
            branches.extend(page.drain(..).map(ApiBranch::into_branch));
            if !full_page {
                break;
            }
            page_no += 1;
            let req = self.api_get(self.repo_url("/branches")).query(&[
                ("per_page", "100".to_string()),
                ("page", page_no.to_string()),
            ]);
            page = self.send(req).await?.json().await?;
        }

        if let Some(etag) = new_etag {
            let mut cache = self.branch_cache.lock().unwrap_or_else(|p| p.into_inner());
            *cache = Some(BranchCache {
                etag,
                branches: branches.clone(),
            });
        }

        Ok(branches)
    }

    async fn latest_commit_api(&self, branch: &str) -> Result<String, ProviderError> {
        let url = self.repo_url(&format!(
            "/branches/{}",
            utf8_percent_encode(branch, PATH_ESCAPES)
        ));
        let branch: ApiBranch = self.send(self.api_get(url)).await?.json().await?;
        Ok(branch.commit.sha)
    }
}

#[async_trait]
impl Provider for GithubClient {
    fn kind(&self) -> ProviderKind {
        ProviderKind::Github
    }

    #[instrument(skip(self), fields(repo = %self.info.full_name))]
    async fn list_branches(&self) -> Result<Vec<Branch>, ProviderError> {
        with_retries(
            self.options.retry_attempts,
            self.options.retry_backoff,
            &self.cancel,
            || self.list_branches_once(),
        )
        .await
    }

    #[instrument(skip(self), fields(repo = %self.info.full_name))]
    async fn latest_commit(&self, branch: &str) -> Result<String, ProviderError> {
        let api_result = with_retries(
            self.options.retry_attempts,
            self.options.retry_backoff,
            &self.cancel,
            || self.latest_commit_api(branch),
        )
        .await;

        match (api_result, &self.fallback) {
            (Ok(sha), _) => Ok(sha),
            (Err(e), Some(lister)) if self.fallback_policy.permits(&e) => {
                tracing::warn!(host = %self.info.instance, "commit lookup falling back to git transport: {e}");
                match lister.head_for_branch(branch, &self.cancel).await? {
                    Some(sha) => Ok(sha),
                    None => Err(ProviderError::NotFound),
                }
            }
            (Err(e), _) => Err(e),
        }
    }

    #[instrument(skip(self), fields(repo = %self.info.full_name))]
    async fn check_access(&self) -> Result<(), ProviderError> {
        self.send(self.api_get(self.repo_url(""))).await.map(|_| ())
    }

    async fn directory_exists(&self, commit: &str, path: &str) -> Result<bool, ProviderError> {
        let url = self.repo_url(&format!("/contents/{}", utf8_percent_encode(path, PATH_ESCAPES)));
        let result = self
            .send(self.api_get(url).query(&[("ref", commit)]))
            .await;

        match result {
            Ok(resp) => {
                // The contents API returns an array for directories and an
                // object for files.
                let value: serde_json::Value = resp.json().await?;
                Ok(value.is_array())
            }
            Err(ProviderError::NotFound) => Ok(false),
            Err(e) => Err(e),
        }
    }

    async fn list_files(&self, commit: &str, path: &str) -> Result<Vec<RemoteFile>, ProviderError> {
        let url = self.repo_url(&format!(
            "/git/trees/{}",
            utf8_percent_encode(commit, PATH_ESCAPES)
        ));
        let tree: TreeResponse = self
            .send(self.api_get(url).query(&[("recursive", "1")]))
            .await?
            .json()
            .await?;

        if tree.truncated {
            tracing::warn!(
                repo = %self.info.full_name,
                "tree listing truncated by provider; scan may be incomplete"
            );
        }

        let prefix = format!("{path}/");
        Ok(tree
            .tree
            .into_iter()
            .filter(|entry| entry.kind == "blob" && entry.path.starts_with(&prefix))
            .map(|entry| RemoteFile {
                symlink: entry.mode == "120000",
                path: entry.path,
                size: entry.size,
            })
            .collect())
    }

    async fn get_file(&self, commit: &str, path: &str) -> Result<Vec<u8>, ProviderError> {
        let url = self.repo_url(&format!("/contents/{}", utf8_percent_encode(path, PATH_ESCAPES)));
        let resp = self
            .send(
                self.http
                    .get(url)
                    .query(&[("ref", commit)])
                    .header(ACCEPT, "application/vnd.github.raw+json"),
            )
            .await?;

        if let Some(length) = resp.content_length()
            && length > self.options.max_file_size
        {
            return Err(ProviderError::FileTooLarge {
                path: path.into(),
                size: length,
                limit: self.options.max_file_size,
            });
        }

        let bytes = resp.bytes().await?;
        if bytes.len() as u64 > self.options.max_file_size {
            return Err(ProviderError::FileTooLarge {
                path: path.into(),
                size: bytes.len() as u64,
                limit: self.options.max_file_size,
            });
        }

        Ok(bytes.to_vec())
    }

    fn rate_status(&self) -> RateBudget {
        self.limiter.budget()
    }
}

/// A branch as returned by the branches endpoints.
///
/// This model is intentionally incomplete.
#[derive(Deserialize)]
struct ApiBranch {
    name: String,
    commit: ApiCommit,
    #[serde(default)]
    protected: bool,
}

impl ApiBranch {
    fn into_branch(self) -> Branch {
        Branch {
            name: self.name,
            commit_sha: self.commit.sha,
            protected: self.protected,
        }
    }
}

#[derive(Deserialize)]
struct ApiCommit {
    sha: String,
}

#[derive(Deserialize)]
struct TreeResponse {
    #[serde(default)]
    tree: Vec<TreeEntry>,
    #[serde(default)]
    truncated: bool,
}

#[derive(Deserialize)]
struct TreeEntry {
    path: String,
    mode: String,
    #[serde(rename = "type")]
    kind: String,
    size: Option<u64>,
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;
    use serde_json::json;
    use wiremock::matchers::{header, method, path, query_param};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    use crate::repourl;

    use super::*;

    fn client_for(server: &MockServer, max_file_size: u64) -> GithubClient {
        let info = repourl::parse("https://github.com/acme/demo").expect("parse");
        let options = ProviderOptions {
            request_timeout: std::time::Duration::from_secs(5),
            retry_attempts: 1,
            retry_backoff: std::time::Duration::from_millis(5),
            max_file_size,
            enable_api_fallback: false,
        };
        GithubClient::new(
            info,
            server.uri(),
            Token::new("tok"),
            options,
            Arc::new(RateLimiter::hourly(5000, 10)),
            CancellationToken::new(),
        )
        .expect("client")
    }

    #[tokio::test]
    async fn test_list_branches_conditional_request() {
        let server = MockServer::start().await;

        // A revalidation with our ETag gets 304; the first request 200.
        Mock::given(method("GET"))
            .and(path("/repos/acme/demo/branches"))
            .and(header("If-None-Match", "\"etag-1\""))
            .respond_with(ResponseTemplate::new(304))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/repos/acme/demo/branches"))
            .respond_with(
                ResponseTemplate::new(200)
                    .insert_header("ETag", "\"etag-1\"")
                    .set_body_json(json!([
                        {"name": "main", "commit": {"sha": "abc"}, "protected": true}
                    ])),
            )
            .expect(1)
            .mount(&server)
            .await;

        let client = client_for(&server, 1024);

        let first = client.list_branches().await.expect("first listing");
        assert_eq!(first.len(), 1);
        assert_eq!(first[0].name, "main");
        assert_eq!(first[0].commit_sha, "abc");
        assert!(first[0].protected);

        // The not-modified response is served from the cached listing.
        let second = client.list_branches().await.expect("second listing");
        assert_eq!(first, second);
    }

    #[tokio::test]
    async fn test_latest_commit() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/repos/acme/demo/branches/main"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "name": "main", "commit": {"sha": "def456"}
            })))
            .mount(&server)
            .await;

        let client = client_for(&server, 1024);
        assert_eq!(client.latest_commit("main").await.expect("sha"), "def456");
    }

    #[tokio::test]
    async fn test_get_file_size_cap() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/repos/acme/demo/contents/.tekton/big.yaml"))
            .and(query_param("ref", "abc"))
            .respond_with(ResponseTemplate::new(200).set_body_string("x".repeat(64)))
            .mount(&server)
            .await;

        let client = client_for(&server, 16);
        assert!(matches!(
            client.get_file("abc", ".tekton/big.yaml").await,
            Err(ProviderError::FileTooLarge { size: 64, limit: 16, .. })
        ));
    }

    #[tokio::test]
    async fn test_error_taxonomy_from_responses() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/repos/acme/demo"))
            .respond_with(ResponseTemplate::new(401))
            .mount(&server)
            .await;

        let client = client_for(&server, 1024);
        assert!(matches!(
            client.check_access().await,
            Err(ProviderError::Unauthorized)
        ));
    }

    #[tokio::test]
    async fn test_rate_headers_feed_limiter() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/repos/acme/demo"))
            .respond_with(
                ResponseTemplate::new(200)
                    .insert_header("x-ratelimit-remaining", "42")
                    .insert_header("x-ratelimit-reset", "4102444800")
                    .set_body_json(json!({"full_name": "acme/demo"})),
            )
            .mount(&server)
            .await;

        let client = client_for(&server, 1024);
        client.check_access().await.expect("access");

        let budget = client.rate_status();
        assert_eq!(budget.requests_remaining, 42);
        assert!(budget.window_reset_at.is_some());
    }
}
