//! The per-repository change engine.
//!
//! One cycle lists a repository's branches, filters them through the
//! declared branch regex, diffs the survivors against the ledger, and
//! hands each change to the dispatcher *before* any branch state is
//! advanced; the ledger's branch row only moves when a delivery commits
//! (at-least-once semantics; downstream deduplicates on event id).

use std::sync::Arc;

use chrono::SecondsFormat;
use regex::Regex;
use thiserror::Error;
use tokio::sync::mpsc;
use tracing::instrument;

use crate::clock::SharedClock;
use crate::config::{Config, RepositoryConfig};
use crate::detector::{Detector, EstimatedAction};
use crate::ledger::{Event, EventStatus, EventType, Ledger, LedgerError, event_id};
use crate::provider::{Provider, ProviderError};
use crate::repourl::{self, RepositoryInfo};

/// Metadata keys the engine writes onto events.
pub mod metadata {
    /// `created` or `updated`: what kind of change produced the event.
    pub const CHANGE_KIND: &str = "change_kind";
    /// Whether the branch was marked protected by the provider.
    pub const BRANCH_PROTECTED: &str = "branch_protected";
    /// The cycle that observed the change, for log correlation.
    pub const CYCLE_ID: &str = "cycle_id";
    /// The serialized detector result.
    pub const DETECTION: &str = "detection";
    /// The commit timestamp as observed, when known.
    pub const OBSERVED_AT: &str = "observed_at";
}

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("provider failure")]
    Provider(#[from] ProviderError),

    #[error("ledger failure")]
    Ledger(#[from] LedgerError),

    #[error("branch regex `{pattern}` failed to compile")]
    Regex {
        pattern: String,
        #[source]
        source: regex::Error,
    },

    #[error("repository URL rejected")]
    Url(#[from] repourl::ParseError),

    #[error("dispatch queue closed")]
    QueueClosed,
}

/// Everything one repository needs for a cycle, assembled once per
/// config generation.
pub struct RepoContext {
    pub config: RepositoryConfig,
    pub info: RepositoryInfo,
    pub provider: Arc<dyn Provider>,
    /// The declared regex, anchored over the full branch name.
    branch_regex: Regex,
}

impl RepoContext {
    pub fn new(
        config: RepositoryConfig,
        info: RepositoryInfo,
        provider: Arc<dyn Provider>,
    ) -> Result<Self, EngineError> {
        let pattern = format!("^(?:{})$", config.branch_regex);
        let branch_regex = Regex::new(&pattern).map_err(|source| EngineError::Regex {
            pattern: config.branch_regex.clone(),
            source,
        })?;

        Ok(Self {
            config,
            info,
            provider,
            branch_regex,
        })
    }

    pub fn branch_matches(&self, name: &str) -> bool {
        self.branch_regex.is_match(name)
    }
}

/// What one cycle did, for status reporting and logs.
#[derive(Clone, Debug, Default)]
pub struct CycleOutcome {
    pub branches_listed: usize,
    pub branches_matched: usize,
    pub events_emitted: usize,
    pub suppressed: usize,
    pub pruned: usize,
    /// Per-branch errors that didn't abort the cycle.
    pub errors: Vec<String>,
}

/// The reloadable parts of the engine, swapped as one unit.
struct EngineShared {
    detector: Detector,
    prune_vanished_after: u32,
}

pub struct ChangeEngine {
    ledger: Arc<dyn Ledger>,
    clock: SharedClock,
    dispatch_tx: mpsc::Sender<String>,
    shared: std::sync::Mutex<Arc<EngineShared>>,
}

impl ChangeEngine {
    pub fn new(
        config: &Config,
        ledger: Arc<dyn Ledger>,
        clock: SharedClock,
        dispatch_tx: mpsc::Sender<String>,
    ) -> Self {
        Self {
            ledger,
            clock,
            dispatch_tx,
            shared: std::sync::Mutex::new(Arc::new(EngineShared {
                detector: Detector::new(config.detector.clone()),
                prune_vanished_after: config.polling.prune_vanished_after,
            })),
        }
    }

    /// Applies a reloaded detector and pruning configuration. In-flight
    /// cycles keep the snapshot they started with.
    pub fn reconfigure(&self, config: &Config) {
        let mut shared = self.shared.lock().unwrap_or_else(|p| p.into_inner());
        *shared = Arc::new(EngineShared {
            detector: Detector::new(config.detector.clone()),
            prune_vanished_after: config.polling.prune_vanished_after,
        });
    }

    fn shared(&self) -> Arc<EngineShared> {
        self.shared
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .clone()
    }

    /// Runs one cycle for one repository.
    ///
    /// Listing or ledger failures abort the cycle (nothing is advanced);
    /// per-branch failures are collected and the cycle continues.
    #[instrument(skip(self, repo), fields(repo = %repo.config.name, cycle = %cycle_id))]
    pub async fn run_cycle(
        &self,
        repo: &RepoContext,
        cycle_id: &str,
    ) -> Result<CycleOutcome, EngineError> {
        let mut outcome = CycleOutcome::default();
        let shared = self.shared();

        let branches = repo.provider.list_branches().await?;
        outcome.branches_listed = branches.len();

        // Vanished-branch bookkeeping happens at the start of the cycle:
        // rows absent from this listing age by one; rows past the grace
        // period are pruned. Comparison is against the *full* listing:
        // a branch hidden only by the regex still exists.
        self.prune_vanished(repo, &branches, shared.prune_vanished_after, &mut outcome)
            .await?;

        for branch in branches {
            if !repo.branch_matches(&branch.name) {
                continue;
            }
            outcome.branches_matched += 1;

            if let Err(e) = self
                .observe_branch(repo, &branch, &shared.detector, cycle_id, &mut outcome)
                .await
            {
                match e {
                    EngineError::Ledger(_) | EngineError::QueueClosed => return Err(e),
                    _ => outcome
                        .errors
                        .push(format!("branch {}: {e}", branch.name)),
                }
            }
        }

        Ok(outcome)
    }

    async fn prune_vanished(
        &self,
        repo: &RepoContext,
        branches: &[crate::provider::Branch],
        prune_after: u32,
        outcome: &mut CycleOutcome,
    ) -> Result<(), LedgerError> {
        let live: std::collections::HashSet<&str> =
            branches.iter().map(|b| b.name.as_str()).collect();

        for state in self.ledger.list_branch_states(&repo.config.name).await? {
            if live.contains(state.branch.as_str()) {
                continue;
            }

            let missing = self
                .ledger
                .bump_branch_missing(&repo.config.name, &state.branch)
                .await?;
            if missing > prune_after {
                tracing::info!(
                    repo = %repo.config.name,
                    branch = %state.branch,
                    missing_cycles = missing,
                    "pruning vanished branch"
                );
                self.ledger
                    .delete_branch_state(&repo.config.name, &state.branch)
                    .await?;
                outcome.pruned += 1;
            }
        }

        Ok(())
    }

    async fn observe_branch(
        &self,
        repo: &RepoContext,
        branch: &crate::provider::Branch,
        detector: &Detector,
        cycle_id: &str,
        outcome: &mut CycleOutcome,
    ) -> Result<(), EngineError> {
        let name = &repo.config.name;
        let now = self.clock.now();

        let observed = if branch.commit_sha.is_empty() {
            repo.provider.latest_commit(&branch.name).await?
        } else {
            branch.commit_sha.clone()
        };

        let prior = self.ledger.get_branch_state(name, &branch.name).await?;
        let change_kind = match &prior {
            None => Some("created"),
            Some(prior) if prior.last_commit_sha != observed => Some("updated"),
            Some(_) => None,
        };

        let Some(change_kind) = change_kind else {
            // No change: refresh the check timestamp without moving the sha.
            let prior = prior.expect("no-change implies a prior row");
            self.ledger
                .upsert_branch_state(name, &branch.name, &prior.last_commit_sha, now)
                .await?;
            return Ok(());
        };

        // At most one event may be active per (repository, branch); a
        // newer commit will be picked up once the active one settles.
        if self.ledger.has_active_event(name, &branch.name).await? {
            tracing::debug!(branch = %branch.name, "change suppressed: event already active");
            outcome.suppressed += 1;
            return Ok(());
        }

        let detection = detector.scan(repo.provider.as_ref(), &observed).await;

        let event_type = if detection.has_pipeline_dir
            && detection.estimated_action != EstimatedAction::Skip
        {
            EventType::TektonDetected
        } else if change_kind == "created" {
            EventType::BranchCreated
        } else {
            EventType::BranchUpdated
        };

        let mut metadata = indexmap::IndexMap::new();
        metadata.insert(metadata::CHANGE_KIND.to_string(), change_kind.to_string());
        metadata.insert(
            metadata::BRANCH_PROTECTED.to_string(),
            branch.protected.to_string(),
        );
        metadata.insert(metadata::CYCLE_ID.to_string(), cycle_id.to_string());
        metadata.insert(
            metadata::OBSERVED_AT.to_string(),
            now.to_rfc3339_opts(SecondsFormat::Secs, true),
        );
        if let Ok(detection_json) = serde_json::to_string(&detection) {
            metadata.insert(metadata::DETECTION.to_string(), detection_json);
        }

        let event = Event {
            id: event_id(name, &branch.name, &observed, now),
            event_type,
            repository: name.clone(),
            branch: branch.name.clone(),
            commit_sha: observed,
            provider: repo.config.provider,
            timestamp: now,
            status: EventStatus::Pending,
            metadata,
            redrive_attempts: 0,
            created_at: now,
            updated_at: now,
        };

        tracing::info!(
            branch = %branch.name,
            event = %event.id,
            r#type = %event.event_type,
            "emitting change event"
        );
        self.ledger.create_event(&event).await?;

        // Hand off before any branch-state write; the dispatcher advances
        // the branch row when (and only when) delivery commits.
        self.dispatch_tx
            .send(event.id)
            .await
            .map_err(|_| EngineError::QueueClosed)?;
        outcome.events_emitted += 1;

        Ok(())
    }
}

/// Builds a [`RepoContext`] straight from a repository's declaration.
pub fn build_context(
    config: &RepositoryConfig,
    provider: Arc<dyn Provider>,
) -> Result<RepoContext, EngineError> {
    let info = repourl::parse(&config.url)?;
    RepoContext::new(config.clone(), info, provider)
}
