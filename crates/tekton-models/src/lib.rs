//! Data models for Tekton resource manifests.
//!
//! These models are intentionally shallow: they capture the identity of a
//! Tekton resource (`apiVersion`, `kind`, `metadata.name`) rather than its
//! full spec, which is all that's needed to classify the contents of a
//! repository's pipeline directory.
//!
//! Resources:
//! * [Tekton Pipelines API](https://tekton.dev/docs/pipelines/)
//! * [Tekton Triggers API](https://tekton.dev/docs/triggers/)

pub mod common;

use serde::Deserialize;

use crate::common::ObjectMeta;

/// The API group for Tekton Pipelines resources.
pub const PIPELINES_GROUP: &str = "tekton.dev";

/// The API group for Tekton Triggers resources.
pub const TRIGGERS_GROUP: &str = "triggers.tekton.dev";

/// A single YAML document's resource envelope.
///
/// Every Kubernetes-style manifest carries these fields; anything else in
/// the document is ignored.
#[derive(Deserialize, Debug)]
pub struct Manifest {
    #[serde(rename = "apiVersion")]
    pub api_version: Option<String>,
    pub kind: Option<String>,
    #[serde(default)]
    pub metadata: ObjectMeta,
}

impl Manifest {
    /// Returns the API group portion of `apiVersion`, if present.
    ///
    /// For example, `tekton.dev/v1beta1` has the group `tekton.dev`.
    /// Core-group manifests (`apiVersion: v1`) have an empty group.
    pub fn api_group(&self) -> Option<&str> {
        self.api_version
            .as_deref()
            .map(|av| av.split_once('/').map(|(group, _)| group).unwrap_or(""))
    }

    /// Returns whether this manifest belongs to the Tekton resource family,
    /// i.e. the `tekton.dev` or `triggers.tekton.dev` API groups.
    pub fn is_tekton(&self) -> bool {
        matches!(self.api_group(), Some(group) if group == PIPELINES_GROUP || group.ends_with(&format!(".{PIPELINES_GROUP}")))
    }

    /// Returns the classified [`ResourceKind`] for this manifest.
    pub fn resource_kind(&self) -> ResourceKind {
        match self.kind.as_deref() {
            Some(kind) => ResourceKind::classify(kind),
            None => ResourceKind::Unknown(String::new()),
        }
    }
}

/// Kinds of Tekton resources, classified by how a downstream system
/// should treat them.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ResourceKind {
    /// An executable pipeline definition.
    Pipeline,
    /// An executable task definition.
    Task,
    /// A cluster-scoped task definition.
    ClusterTask,
    /// A concrete pipeline execution.
    PipelineRun,
    /// A concrete task execution.
    TaskRun,
    /// A Triggers-family event listener.
    EventListener,
    /// A Triggers-family binding.
    TriggerBinding,
    /// A Triggers-family template.
    TriggerTemplate,
    /// A Triggers-family trigger.
    Trigger,
    /// A kind within the Tekton API groups that we don't model.
    Unknown(String),
}

impl ResourceKind {
    /// Classify a manifest `kind` string.
    pub fn classify(kind: &str) -> Self {
        match kind {
            "Pipeline" => Self::Pipeline,
            "Task" => Self::Task,
            "ClusterTask" => Self::ClusterTask,
            "PipelineRun" => Self::PipelineRun,
            "TaskRun" => Self::TaskRun,
            "EventListener" => Self::EventListener,
            "TriggerBinding" => Self::TriggerBinding,
            "TriggerTemplate" => Self::TriggerTemplate,
            "Trigger" => Self::Trigger,
            other => Self::Unknown(other.into()),
        }
    }

    /// Returns whether this kind *executes* something when applied,
    /// e.g. a `PipelineRun`.
    pub fn is_run_kind(&self) -> bool {
        matches!(self, Self::PipelineRun | Self::TaskRun)
    }

    /// Returns whether this kind *defines* an executable unit without
    /// running it, e.g. a `Pipeline`.
    pub fn is_definition_kind(&self) -> bool {
        matches!(self, Self::Pipeline | Self::Task | Self::ClusterTask)
    }

    /// The manifest `kind` string for this resource kind.
    pub fn as_str(&self) -> &str {
        match self {
            Self::Pipeline => "Pipeline",
            Self::Task => "Task",
            Self::ClusterTask => "ClusterTask",
            Self::PipelineRun => "PipelineRun",
            Self::TaskRun => "TaskRun",
            Self::EventListener => "EventListener",
            Self::TriggerBinding => "TriggerBinding",
            Self::TriggerTemplate => "TriggerTemplate",
            Self::Trigger => "Trigger",
            Self::Unknown(other) => other,
        }
    }
}

impl std::fmt::Display for ResourceKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Splits a (potentially multi-document) YAML stream and deserializes each
/// document's resource envelope.
///
/// Each document yields its own `Result`: a syntactically broken document
/// doesn't prevent its siblings from parsing.
pub fn parse_manifests(contents: &str) -> Vec<Result<Manifest, serde_yaml::Error>> {
    serde_yaml::Deserializer::from_str(contents)
        .map(Manifest::deserialize)
        .collect()
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    #[test]
    fn test_parse_multidoc() {
        let contents = r#"
apiVersion: tekton.dev/v1beta1
kind: Pipeline
metadata:
  name: build
---
apiVersion: triggers.tekton.dev/v1beta1
kind: EventListener
metadata:
  name: listener
  namespace: ci
"#;

        let manifests = parse_manifests(contents);
        assert_eq!(manifests.len(), 2);

        let first = manifests[0].as_ref().unwrap();
        assert_eq!(first.api_group(), Some("tekton.dev"));
        assert_eq!(first.resource_kind(), ResourceKind::Pipeline);
        assert_eq!(first.metadata.name.as_deref(), Some("build"));
        assert!(first.is_tekton());

        let second = manifests[1].as_ref().unwrap();
        assert_eq!(second.api_group(), Some("triggers.tekton.dev"));
        assert_eq!(second.resource_kind(), ResourceKind::EventListener);
        assert_eq!(second.metadata.namespace.as_deref(), Some("ci"));
        assert!(second.is_tekton());
    }

    #[test]
    fn test_parse_broken_sibling() {
        let contents = "apiVersion: tekton.dev/v1\nkind: Task\nmetadata:\n  name: ok\n---\n{{ not yaml\n";

        let manifests = parse_manifests(contents);
        assert_eq!(manifests.len(), 2);
        assert!(manifests[0].is_ok());
        assert!(manifests[1].is_err());
    }

    #[test]
    fn test_non_tekton_group() {
        for contents in [
            "apiVersion: v1\nkind: ConfigMap\nmetadata:\n  name: cm\n",
            "apiVersion: apps/v1\nkind: Deployment\nmetadata:\n  name: d\n",
            "kind: Pipeline\nmetadata:\n  name: no-group\n",
        ] {
            let manifests = parse_manifests(contents);
            assert_eq!(manifests.len(), 1);
            assert!(!manifests[0].as_ref().unwrap().is_tekton());
        }
    }

    #[test]
    fn test_kind_classification() {
        for (kind, run, definition) in [
            ("Pipeline", false, true),
            ("Task", false, true),
            ("ClusterTask", false, true),
            ("PipelineRun", true, false),
            ("TaskRun", true, false),
            ("EventListener", false, false),
            ("TriggerTemplate", false, false),
            ("SomethingElse", false, false),
        ] {
            let classified = ResourceKind::classify(kind);
            assert_eq!(classified.is_run_kind(), run, "{kind}");
            assert_eq!(classified.is_definition_kind(), definition, "{kind}");
            assert_eq!(classified.as_str(), kind);
        }
    }
}
