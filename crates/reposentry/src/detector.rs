//! Pipeline-definition detection over remote file listings.
//!
//! Given a repository revision, the detector scans one fixed top-level
//! directory for Tekton resource manifests and classifies how a
//! downstream system should react. The scan is best-effort and pure over
//! `(commit, tree snapshot)`: per-file failures are recorded and the
//! classification is computed from whatever could be read.

use serde::{Deserialize, Serialize};
use tekton_models::common::validate_dns1123_subdomain;
use tracing::instrument;

use crate::config::DetectorConfig;
use crate::provider::{Provider, ProviderError, RemoteFile};

/// The detector's recommendation to the downstream system.
///
/// Ordered by evidence strength; when several rules match, the strongest
/// wins.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EstimatedAction {
    /// Directory absent or nothing valid in it.
    #[default]
    Skip,
    /// Resources present but neither runnable nor definitional.
    Validate,
    /// Definitions (Pipeline/Task) without anything that runs.
    Apply,
    /// At least one run-kind (PipelineRun/TaskRun) resource.
    Trigger,
}

impl EstimatedAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Skip => "skip",
            Self::Validate => "validate",
            Self::Apply => "apply",
            Self::Trigger => "trigger",
        }
    }
}

impl std::fmt::Display for EstimatedAction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One recognized Tekton resource.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct DetectedResource {
    pub api_version: String,
    pub kind: String,
    pub name: String,
    pub namespace: Option<String>,
    pub file_path: String,
    pub index_in_file: u32,
    pub is_valid: bool,
    #[serde(default)]
    pub errors: Vec<String>,
}

/// The outcome of one scan.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct DetectorResult {
    pub has_pipeline_dir: bool,
    pub scan_path: String,
    /// Files the scan considered (extension and depth filters applied).
    pub total_files: u32,
    /// Files that parsed cleanly and yielded at least one valid resource.
    pub valid_files: u32,
    pub resources: Vec<DetectedResource>,
    pub estimated_action: EstimatedAction,
    #[serde(default)]
    pub errors: Vec<String>,
    #[serde(default)]
    pub warnings: Vec<String>,
}

pub struct Detector {
    config: DetectorConfig,
}

impl Detector {
    pub fn new(config: DetectorConfig) -> Self {
        Self { config }
    }

    /// Scans `commit` for pipeline definitions.
    ///
    /// Never fails outright: provider errors during the scan are recorded
    /// in the result and classification proceeds from whatever was read.
    #[instrument(skip(self, provider), fields(scan_path = %self.config.scan_directory))]
    pub async fn scan(&self, provider: &dyn Provider, commit: &str) -> DetectorResult {
        let scan_path = self.config.scan_directory.clone();
        let mut result = DetectorResult {
            scan_path: scan_path.clone(),
            ..DetectorResult::default()
        };

        match provider.directory_exists(commit, &scan_path).await {
            Ok(true) => result.has_pipeline_dir = true,
            Ok(false) => return result,
            Err(e) => {
                result.errors.push(format!("checking {scan_path}: {e}"));
                return result;
            }
        }

        let listing = match provider.list_files(commit, &scan_path).await {
            Ok(listing) => listing,
            Err(e) => {
                result.errors.push(format!("listing {scan_path}: {e}"));
                return result;
            }
        };

        for file in listing {
            if !self.considers(&file, &mut result) {
                continue;
            }
            result.total_files += 1;

            if let Some(size) = file.size
                && size > self.config.max_file_size
            {
                result.errors.push(format!(
                    "{}: {size} bytes exceeds the {} byte limit",
                    file.path, self.config.max_file_size
                ));
                continue;
            }

            let contents = match provider.get_file(commit, &file.path).await {
                Ok(bytes) => bytes,
                Err(e @ ProviderError::FileTooLarge { .. }) => {
                    result.errors.push(e.to_string());
                    continue;
                }
                Err(e) => {
                    result.errors.push(format!("fetching {}: {e}", file.path));
                    continue;
                }
            };
            let contents = match String::from_utf8(contents) {
                Ok(text) => text,
                Err(_) => {
                    result.errors.push(format!("{}: not valid UTF-8", file.path));
                    continue;
                }
            };

            self.scan_file(&file.path, &contents, &mut result);
        }

        result.estimated_action = classify(&result.resources);
        result
    }

    /// Applies the extension, depth, and symlink filters.
    fn considers(&self, file: &RemoteFile, result: &mut DetectorResult) -> bool {
        if file.symlink {
            result
                .warnings
                .push(format!("{}: symlink not followed", file.path));
            return false;
        }

        let matches_extension = self
            .config
            .extensions
            .iter()
            .any(|ext| file.path.ends_with(ext.as_str()));
        if !matches_extension {
            return false;
        }

        // Depth below the scan directory: a file directly inside it has
        // depth one.
        let relative = file
            .path
            .strip_prefix(&self.config.scan_directory)
            .unwrap_or(&file.path)
            .trim_start_matches('/');
        let depth = relative.split('/').count() as u32;
        depth <= self.config.max_depth
    }

    /// Parses one file's documents into resources.
    fn scan_file(&self, path: &str, contents: &str, result: &mut DetectorResult) {
        let mut file_parse_errors = 0u32;
        let mut file_valid_resources = 0u32;

        for (index, manifest) in tekton_models::parse_manifests(contents).into_iter().enumerate() {
            let manifest = match manifest {
                Ok(manifest) => manifest,
                Err(e) => {
                    file_parse_errors += 1;
                    result.errors.push(format!("{path} (document {index}): {e}"));
                    continue;
                }
            };

            if !manifest.is_tekton() {
                continue;
            }

            let mut errors = Vec::new();
            let name = manifest.metadata.name.clone().unwrap_or_default();
            if let Err(e) = validate_dns1123_subdomain(&name) {
                errors.push(format!("metadata.name: {e}"));
            }

            let is_valid = errors.is_empty();
            if is_valid {
                file_valid_resources += 1;
            }

            result.resources.push(DetectedResource {
                api_version: manifest.api_version.clone().unwrap_or_default(),
                kind: manifest.resource_kind().as_str().to_string(),
                name,
                namespace: manifest.metadata.namespace.clone(),
                file_path: path.to_string(),
                index_in_file: index as u32,
                is_valid,
                errors,
            });
        }

        if file_parse_errors == 0 && file_valid_resources > 0 {
            result.valid_files += 1;
        }
    }
}

/// The classification ladder, strongest evidence first.
fn classify(resources: &[DetectedResource]) -> EstimatedAction {
    let valid = resources.iter().filter(|r| r.is_valid).count();
    if valid == 0 {
        return EstimatedAction::Skip;
    }

    let kinds = resources
        .iter()
        .map(|r| tekton_models::ResourceKind::classify(&r.kind))
        .collect::<Vec<_>>();

    if kinds.iter().any(|k| k.is_run_kind()) {
        EstimatedAction::Trigger
    } else if kinds.iter().any(|k| k.is_definition_kind()) {
        EstimatedAction::Apply
    } else {
        EstimatedAction::Validate
    }
}
