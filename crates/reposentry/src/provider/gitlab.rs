//! The GitLab-family REST v4 client (gitlab.com and self-hosted).

use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use percent_encoding::{NON_ALPHANUMERIC, utf8_percent_encode};
use reqwest::StatusCode;
use reqwest::header::IF_NONE_MATCH;
use serde::Deserialize;
use tokio_util::sync::CancellationToken;
use tracing::instrument;

use crate::config::Token;
use crate::ratelimit::{RateBudget, RateLimiter};
use crate::repourl::{ProviderKind, RepositoryInfo};

use super::fallback::{FallbackPolicy, GitRefLister};
use super::{Branch, Provider, ProviderError, ProviderOptions, RemoteFile, with_retries};

const REMAINING_HEADER: &str = "ratelimit-remaining";
const RESET_HEADER: &str = "ratelimit-reset";

struct BranchCache {
    etag: String,
    branches: Vec<Branch>,
}

pub struct GitlabClient {
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

impl GitlabClient {
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

    /// The URL-encoded project id (`namespace%2Fproject`).
    fn project_id(&self) -> String {
        utf8_percent_encode(&self.info.full_name, NON_ALPHANUMERIC).to_string()
    }

    fn project_url(&self, suffix: &str) -> String {
        format!(
            "{base}/projects/{id}{suffix}",
            base = self.api_base,
            id = self.project_id()
        )
    }

    async fn send(&self, req: reqwest::RequestBuilder) -> Result<reqwest::Response, ProviderError> {
        self.limiter.acquire(&self.cancel, 1).await?;

        let resp = req
            .header("PRIVATE-TOKEN", self.token.expose())
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

    /// Drains a paginated collection endpoint.
    async fn get_paginated<T: serde::de::DeserializeOwned>(
        &self,
        url: &str,
        query: &[(&str, String)],
    ) -> Result<Vec<T>, ProviderError> {
        let mut items = Vec::new();
        let mut page = 1u32;
        loop {
            let mut query: Vec<(&str, String)> = query.to_vec();
            query.push(("per_page", "100".into()));
            query.push(("page", page.to_string()));

            let batch: Vec<T> = self
                .send(self.http.get(url).query(&query))
                .await?
                .json()
                .await?;
            let full_page = batch.len() == 100;
            items.extend(batch);
            if !full_page {
                return Ok(items);
            }
            page += 1;
        }
    }

    async fn list_branches_once(&self) -> Result<Vec<Branch>, ProviderError> {
        let etag = {
            let cache = self.branch_cache.lock().unwrap_or_else(|p| p.into_inner());
            cache.as_ref().map(|c| c.etag.clone())
        };

        let url = self.project_url("/repository/branches");
        let mut req = self
            .http
            .get(&url)
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

        let first_page: Vec<ApiBranch> = first.json().await?;
        let mut branches: Vec<Branch> =
            first_page.into_iter().map(ApiBranch::into_branch).collect();

        if branches.len() == 100 {
            let rest: Vec<ApiBranch> = {
                let mut items = Vec::new();
                let mut page = 2u32;
                loop {
                    let batch: Vec<ApiBranch> = self
                        .send(self.http.get(&url).query(&[
                            ("per_page", "100".to_string()),
                            ("page", page.to_string()),
                        ]))
                        .await?
                        .json()
                        .await?;
                    let full_page = batch.len() == 100;
                    items.extend(batch);
                    if !full_page {
                        break items;
                    }
                    page += 1;
                }
            };
            branches.extend(rest.into_iter().map(ApiBranch::into_branch));
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
        let url = self.project_url(&format!(
            "/repository/commits/{}",
            utf8_percent_encode(branch, NON_ALPHANUMERIC)
        ));
        let commit: ApiCommit = self.send(self.http.get(url)).await?.json().await?;
        Ok(commit.id)
    }
}

#[async_trait]
impl Provider for GitlabClient {
    fn kind(&self) -> ProviderKind {
        ProviderKind::Gitlab
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
        self.send(self.http.get(self.project_url(""))).await.map(|_| ())
    }

    async fn directory_exists(&self, commit: &str, path: &str) -> Result<bool, ProviderError> {
        let url = self.project_url("/repository/tree");
        let result = self
            .send(self.http.get(url).query(&[
                ("path", path),
                ("ref", commit),
                ("per_page", "1"),
            ]))
            .await;

        match result {
            Ok(resp) => {
                let entries: Vec<serde_json::Value> = resp.json().await?;
                Ok(!entries.is_empty())
            }
            Err(ProviderError::NotFound) => Ok(false),
            Err(e) => Err(e),
        }
    }

    async fn list_files(&self, commit: &str, path: &str) -> Result<Vec<RemoteFile>, ProviderError> {
        let url = self.project_url("/repository/tree");
        let entries: Vec<TreeEntry> = self
            .get_paginated(
                &url,
                &[
                    ("path", path.to_string()),
                    ("ref", commit.to_string()),
                    ("recursive", "true".to_string()),
                ],
            )
            .await?;

        Ok(entries
            .into_iter()
            .filter(|entry| entry.kind == "blob")
            .map(|entry| RemoteFile {
                symlink: entry.mode.as_deref() == Some("120000"),
                path: entry.path,
                // The tree endpoint doesn't report sizes; the cap is
                // enforced at fetch time instead.
                size: None,
            })
            .collect())
    }

    async fn get_file(&self, commit: &str, path: &str) -> Result<Vec<u8>, ProviderError> {
        let url = self.project_url(&format!(
            "/repository/files/{}/raw",
            utf8_percent_encode(path, NON_ALPHANUMERIC)
        ));
        let resp = self
            .send(self.http.get(url).query(&[("ref", commit)]))
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

/// A branch as returned by the repository branches endpoint.
///
/// This model is intentionally incomplete.
#[derive(Deserialize)]
struct ApiBranch {
    name: String,
    commit: BranchCommit,
    #[serde(default)]
    protected: bool,
}

impl ApiBranch {
    fn into_branch(self) -> Branch {
        Branch {
            name: self.name,
            commit_sha: self.commit.id,
            protected: self.protected,
        }
    }
}

#[derive(Deserialize)]
struct BranchCommit {
    id: String,
}

#[derive(Deserialize)]
struct ApiCommit {
    id: String,
}

#[derive(Deserialize)]
struct TreeEntry {
    path: String,
    #[serde(rename = "type")]
    kind: String,
    mode: Option<String>,
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;
    use serde_json::json;
    use wiremock::matchers::{method, path_regex};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    use crate::repourl;

    use super::*;

    fn client_for(server: &MockServer, url: &str) -> GitlabClient {
        let info = repourl::parse(url).expect("parse");
        let options = ProviderOptions {
            request_timeout: std::time::Duration::from_secs(5),
            retry_attempts: 1,
            retry_backoff: std::time::Duration::from_millis(5),
            max_file_size: 1024,
            enable_api_fallback: false,
        };
        GitlabClient::new(
            info,
            server.uri(),
            Token::new("tok"),
            options,
            Arc::new(RateLimiter::bucket(100, 100)),
            CancellationToken::new(),
        )
        .expect("client")
    }

    #[tokio::test]
    async fn test_project_id_encodes_subgroups() {
        let server = MockServer::start().await;
        let client = client_for(&server, "https://gitlab.com/acme/platform/widget");
        assert_eq!(client.project_id(), "acme%2Fplatform%2Fwidget");
    }

    #[tokio::test]
    async fn test_list_branches() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path_regex(r"^/projects/.+/repository/branches$"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!([
                {"name": "main", "commit": {"id": "abc"}, "protected": true},
                {"name": "dev", "commit": {"id": "def"}}
            ])))
            .mount(&server)
            .await;

        let client = client_for(&server, "https://gitlab.com/acme/demo");
        let branches = client.list_branches().await.expect("listing");
        assert_eq!(branches.len(), 2);
        assert_eq!(branches[0].commit_sha, "abc");
        assert!(branches[0].protected);
        assert!(!branches[1].protected);
    }

    #[tokio::test]
    async fn test_latest_commit() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path_regex(r"^/projects/.+/repository/commits/.+$"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({"id": "fed321"})))
            .mount(&server)
            .await;

        let client = client_for(&server, "https://gitlab.com/acme/demo");
        assert_eq!(client.latest_commit("main").await.expect("sha"), "fed321");
    }

    #[tokio::test]
    async fn test_list_files_filters_trees() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path_regex(r"^/projects/.+/repository/tree$"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!([
                {"path": ".tekton/run.yaml", "type": "blob", "mode": "100644"},
                {"path": ".tekton/nested", "type": "tree", "mode": "040000"},
                {"path": ".tekton/link.yaml", "type": "blob", "mode": "120000"}
            ])))
            .mount(&server)
            .await;

        let client = client_for(&server, "https://gitlab.com/acme/demo");
        let files = client.list_files("abc", ".tekton").await.expect("listing");
        assert_eq!(files.len(), 2);
        assert!(!files[0].symlink);
        assert!(files[1].symlink);
    }

    #[tokio::test]
    async fn test_not_found_directory() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path_regex(r"^/projects/.+/repository/tree$"))
            .respond_with(ResponseTemplate::new(404))
            .mount(&server)
            .await;

        let client = client_for(&server, "https://gitlab.com/acme/demo");
        assert!(!client.directory_exists("abc", ".tekton").await.expect("query"));
    }
}
