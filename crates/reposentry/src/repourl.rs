//! Clone-URL parsing and provider classification.
//!
//! Every declared repository URL passes through [`parse`] exactly once per
//! config generation; the resulting [`RepositoryInfo`] is what the rest of
//! the system (provider clients, event payloads) works from.

use serde::Serialize;
use thiserror::Error;
use url::Url;

/// The provider families we speak.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, serde::Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ProviderKind {
    Github,
    Gitlab,
}

impl ProviderKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Github => "github",
            Self::Gitlab => "gitlab",
        }
    }
}

impl std::fmt::Display for ProviderKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Errors produced by [`parse`].
#[derive(Debug, Error)]
pub enum ParseError {
    #[error("invalid repository URL `{url}`: {reason}")]
    InvalidUrl { url: String, reason: String },
}

impl ParseError {
    fn new(url: &str, reason: impl Into<String>) -> Self {
        Self::InvalidUrl {
            url: url.into(),
            reason: reason.into(),
        }
    }
}

/// Everything we can tell about a repository from its clone URL.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct RepositoryInfo {
    /// The classified provider family.
    pub provider: ProviderKind,
    /// The provider host, e.g. `gitlab.example.com`.
    pub instance: String,
    /// Owner/group path, e.g. `acme` or `acme/platform`.
    pub namespace: String,
    /// The project name, with any `.git` suffix stripped.
    pub project: String,
    /// `namespace/project`.
    pub full_name: String,
    /// Normalized HTTPS clone URL (always ends in `.git`).
    pub clone_url: String,
    /// Browser URL for the repository.
    pub html_url: String,
    /// REST API base for this instance.
    pub api_base_url: String,
    /// Whether this is a self-hosted instance rather than the public one.
    pub is_enterprise: bool,
}

/// Parses and classifies a user-supplied repository URL.
///
/// Only HTTPS URLs with at least `namespace/project` in the path are
/// accepted; SSH and `git://` URLs are rejected outright.
pub fn parse(raw: &str) -> Result<RepositoryInfo, ParseError> {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return Err(ParseError::new(raw, "empty URL"));
    }

    // Reject the scp-like SSH shorthand before Url::parse treats it as
    // a scheme-relative path.
    if trimmed.starts_with("git@") || trimmed.contains("ssh://") {
        return Err(ParseError::new(trimmed, "SSH URLs are not supported"));
    }

    let url = Url::parse(trimmed).map_err(|e| ParseError::new(trimmed, e.to_string()))?;

    if url.scheme() != "https" {
        return Err(ParseError::new(
            trimmed,
            format!("scheme `{}` is not supported (HTTPS only)", url.scheme()),
        ));
    }

    let host = url
        .host_str()
        .ok_or_else(|| ParseError::new(trimmed, "missing host"))?
        .to_lowercase();

    let segments: Vec<&str> = url
        .path()
        .split('/')
        .filter(|s| !s.is_empty())
        .collect();
    if segments.len() < 2 {
        return Err(ParseError::new(
            trimmed,
            "path must contain at least a namespace and a project",
        ));
    }

    let project = segments[segments.len() - 1].trim_end_matches(".git");
    if project.is_empty() {
        return Err(ParseError::new(trimmed, "empty project name"));
    }
    let namespace = segments[..segments.len() - 1].join("/");
    let full_name = format!("{namespace}/{project}");

    let provider = classify_host(&host);
    let is_enterprise = host != "github.com" && host != "gitlab.com";
    let api_base_url = match (provider, is_enterprise) {
        (ProviderKind::Github, false) => "https://api.github.com".to_string(),
        (ProviderKind::Github, true) => format!("https://{host}/api/v3"),
        (ProviderKind::Gitlab, _) => format!("https://{host}/api/v4"),
    };

    Ok(RepositoryInfo {
        provider,
        instance: host.clone(),
        namespace,
        project: project.to_string(),
        clone_url: format!("https://{host}/{full_name}.git"),
        html_url: format!("https://{host}/{full_name}"),
        full_name,
        api_base_url,
        is_enterprise,
    })
}

/// Host-based provider classification.
///
/// Unknown hosts lean GitLab: self-hosted GitLab is far more common than
/// self-hosted GitHub under a host name that mentions neither.
fn classify_host(host: &str) -> ProviderKind {
    match host {
        "github.com" => ProviderKind::Github,
        "gitlab.com" => ProviderKind::Gitlab,
        h if h.contains("github") => ProviderKind::Github,
        h if h.contains("gitlab") => ProviderKind::Gitlab,
        _ => ProviderKind::Gitlab,
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    #[test]
    fn test_parse_github_public() {
        let info = parse("https://github.com/acme/widget").unwrap();
        assert_eq!(info.provider, ProviderKind::Github);
        assert_eq!(info.instance, "github.com");
        assert_eq!(info.namespace, "acme");
        assert_eq!(info.project, "widget");
        assert_eq!(info.full_name, "acme/widget");
        assert_eq!(info.clone_url, "https://github.com/acme/widget.git");
        assert_eq!(info.html_url, "https://github.com/acme/widget");
        assert_eq!(info.api_base_url, "https://api.github.com");
        assert!(!info.is_enterprise);
    }

    #[test]
    fn test_parse_strips_dot_git() {
        let info = parse("https://github.com/acme/widget.git").unwrap();
        assert_eq!(info.project, "widget");
        assert_eq!(info.clone_url, "https://github.com/acme/widget.git");
    }

    #[test]
    fn test_parse_gitlab_subgroups() {
        let info = parse("https://gitlab.com/acme/platform/widget.git").unwrap();
        assert_eq!(info.provider, ProviderKind::Gitlab);
        assert_eq!(info.namespace, "acme/platform");
        assert_eq!(info.full_name, "acme/platform/widget");
        assert_eq!(info.api_base_url, "https://gitlab.com/api/v4");
        assert!(!info.is_enterprise);
    }

    #[test]
    fn test_parse_enterprise_hosts() {
        for (url, provider, api_base) in [
            (
                "https://github.example.com/acme/widget",
                ProviderKind::Github,
                "https://github.example.com/api/v3",
            ),
            (
                "https://gitlab.example.com/acme/widget",
                ProviderKind::Gitlab,
                "https://gitlab.example.com/api/v4",
            ),
            (
                "https://git.example.com/acme/widget",
                ProviderKind::Gitlab,
                "https://git.example.com/api/v4",
            ),
            (
                "https://scm.example.com/acme/widget",
                ProviderKind::Gitlab,
                "https://scm.example.com/api/v4",
            ),
        ] {
            let info = parse(url).unwrap();
            assert_eq!(info.provider, provider, "{url}");
            assert_eq!(info.api_base_url, api_base, "{url}");
            assert!(info.is_enterprise, "{url}");
        }
    }

    #[test]
    fn test_parse_trims_whitespace() {
        let info = parse("  https://github.com/acme/widget \n").unwrap();
        assert_eq!(info.full_name, "acme/widget");
    }

    #[test]
    fn test_parse_rejections() {
        for url in [
            "",
            "git@github.com:acme/widget.git",
            "ssh://git@github.com/acme/widget.git",
            "git://github.com/acme/widget.git",
            "http://github.com/acme/widget",
            "https://github.com/acme",
            "https://github.com/",
            "not a url",
        ] {
            assert!(
                matches!(parse(url), Err(ParseError::InvalidUrl { .. })),
                "{url}"
            );
        }
    }

    #[test]
    fn test_parse_idempotent_over_clone_url() {
        for url in [
            "https://github.com/acme/widget",
            "https://gitlab.example.com/acme/platform/widget.git",
        ] {
            let first = parse(url).unwrap();
            let second = parse(&first.clone_url).unwrap();
            assert_eq!(first, second);
        }
    }
}
