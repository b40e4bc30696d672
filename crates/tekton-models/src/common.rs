//! Shared Kubernetes-style metadata models and name validation.

use indexmap::IndexMap;
use serde::Deserialize;

/// Kubernetes-style object metadata.
///
/// This model is intentionally incomplete.
#[derive(Deserialize, Debug, Default)]
pub struct ObjectMeta {
    pub name: Option<String>,
    pub namespace: Option<String>,
    #[serde(default)]
    pub labels: IndexMap<String, String>,
    #[serde(default)]
    pub annotations: IndexMap<String, String>,
}

/// The maximum length of a DNS-1123 subdomain.
const DNS1123_SUBDOMAIN_MAX_LEN: usize = 253;

/// The maximum length of a single DNS-1123 label.
const DNS1123_LABEL_MAX_LEN: usize = 63;

/// Validates a name against the DNS-1123 subdomain shape that Kubernetes
/// requires of resource names: dot-separated labels of lowercase
/// alphanumerics and `-`, each starting and ending with an alphanumeric.
pub fn validate_dns1123_subdomain(name: &str) -> Result<(), NameError> {
    if name.is_empty() {
        return Err(NameError::Empty);
    }

    if name.len() > DNS1123_SUBDOMAIN_MAX_LEN {
        return Err(NameError::TooLong {
            actual: name.len(),
            limit: DNS1123_SUBDOMAIN_MAX_LEN,
        });
    }

    for label in name.split('.') {
        validate_dns1123_label(label)?;
    }

    Ok(())
}

fn validate_dns1123_label(label: &str) -> Result<(), NameError> {
    if label.is_empty() {
        return Err(NameError::EmptyLabel);
    }

    if label.len() > DNS1123_LABEL_MAX_LEN {
        return Err(NameError::TooLong {
            actual: label.len(),
            limit: DNS1123_LABEL_MAX_LEN,
        });
    }

    let alnum = |c: char| c.is_ascii_lowercase() || c.is_ascii_digit();

    // Unwraps are fine: the label is non-empty per the check above.
    #[allow(clippy::unwrap_used)]
    let (first, last) = (label.chars().next().unwrap(), label.chars().last().unwrap());
    if !alnum(first) || !alnum(last) {
        return Err(NameError::BadBoundary { label: label.into() });
    }

    match label.chars().find(|&c| !alnum(c) && c != '-') {
        Some(c) => Err(NameError::BadCharacter {
            label: label.into(),
            character: c,
        }),
        None => Ok(()),
    }
}

/// Errors produced by DNS-1123 name validation.
#[derive(Debug, PartialEq, Eq)]
pub enum NameError {
    Empty,
    EmptyLabel,
    TooLong { actual: usize, limit: usize },
    BadBoundary { label: String },
    BadCharacter { label: String, character: char },
}

impl std::fmt::Display for NameError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Empty => write!(f, "name is empty"),
            Self::EmptyLabel => write!(f, "name contains an empty label"),
            Self::TooLong { actual, limit } => {
                write!(f, "name segment is too long: {actual} > {limit}")
            }
            Self::BadBoundary { label } => {
                write!(f, "label `{label}` must start and end with an alphanumeric")
            }
            Self::BadCharacter { label, character } => {
                write!(f, "label `{label}` contains invalid character `{character}`")
            }
        }
    }
}

impl std::error::Error for NameError {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_valid_subdomains() {
        for name in [
            "build",
            "build-and-push",
            "pipeline.example.com",
            "a",
            "0leading-digit",
            "x1.y2.z3",
        ] {
            assert_eq!(validate_dns1123_subdomain(name), Ok(()), "{name}");
        }
    }

    #[test]
    fn test_invalid_subdomains() {
        for name in [
            "",
            "-leading-dash",
            "trailing-dash-",
            "Upper",
            "under_score",
            "double..dot",
            "space here",
            &"a".repeat(254),
        ] {
            assert!(validate_dns1123_subdomain(name).is_err(), "{name}");
        }
    }
}
