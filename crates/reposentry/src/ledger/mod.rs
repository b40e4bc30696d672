//! The durable change-detection ledger.
//!
//! The ledger is the single process-wide source of truth: per-branch
//! last-*delivered* commits and the event log with its guarded status
//! transitions. Everything else in the system works on snapshots read
//! from here. One instance owns the ledger exclusively; there is no
//! cross-process coordination.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use indexmap::IndexMap;
use serde::Serialize;
use sha2::{Digest, Sha256};
use thiserror::Error;

use crate::repourl::ProviderKind;

mod sqlite;

pub use sqlite::SqliteLedger;

/// The kinds of events the system emits.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum EventType {
    BranchCreated,
    BranchUpdated,
    TektonDetected,
}

impl EventType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::BranchCreated => "branch_created",
            Self::BranchUpdated => "branch_updated",
            Self::TektonDetected => "tekton_detected",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "branch_created" => Some(Self::BranchCreated),
            "branch_updated" => Some(Self::BranchUpdated),
            "tekton_detected" => Some(Self::TektonDetected),
            _ => None,
        }
    }
}

impl std::fmt::Display for EventType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Delivery status of an event.
///
/// Transitions form a small DAG; the ledger rejects anything else:
///
/// ```text
/// pending → in_flight → delivered
///     ↑         ↓  ↘
///     └─────────┘   failed → in_flight (re-drive)
/// ```
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum EventStatus {
    Pending,
    InFlight,
    Delivered,
    Failed,
}

impl EventStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::InFlight => "in_flight",
            Self::Delivered => "delivered",
            Self::Failed => "failed",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(Self::Pending),
            "in_flight" => Some(Self::InFlight),
            "delivered" => Some(Self::Delivered),
            "failed" => Some(Self::Failed),
            _ => None,
        }
    }

    /// Whether `self → next` is a legal transition.
    pub fn can_transition_to(&self, next: EventStatus) -> bool {
        matches!(
            (self, next),
            (Self::Pending, Self::InFlight)
                | (Self::InFlight, Self::Delivered)
                | (Self::InFlight, Self::Failed)
                | (Self::InFlight, Self::Pending)
                | (Self::Failed, Self::InFlight)
        )
    }

    /// Whether this status is terminal for delivery purposes.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Delivered | Self::Failed)
    }
}

impl std::fmt::Display for EventStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One `(repository, branch)` row: the commit most recently *delivered*,
/// not merely observed.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct BranchState {
    pub repository: String,
    pub branch: String,
    pub last_commit_sha: String,
    pub last_checked_at: DateTime<Utc>,
    /// Consecutive cycles this branch has been absent from provider
    /// listings; drives the vanished-branch grace period.
    pub missing_cycles: u32,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// One event row.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct Event {
    pub id: String,
    pub event_type: EventType,
    pub repository: String,
    pub branch: String,
    pub commit_sha: String,
    pub provider: ProviderKind,
    pub timestamp: DateTime<Utc>,
    pub status: EventStatus,
    pub metadata: IndexMap<String, String>,
    /// Times this event has re-entered `in_flight` from `failed`.
    pub redrive_attempts: u32,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Aggregate ledger counters for status reporting.
#[derive(Clone, Debug, Default, Serialize)]
pub struct LedgerStats {
    pub repositories: u64,
    pub branches: u64,
    pub events_total: u64,
    pub events_pending: u64,
    pub events_failed: u64,
    pub last_event_at: Option<DateTime<Utc>>,
    pub oldest_pending_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Error)]
pub enum LedgerError {
    /// `create_event` saw an id that already exists.
    #[error("event `{id}` already exists")]
    DuplicateEvent { id: String },

    /// A status update violated the transition DAG.
    #[error("illegal status transition for event `{id}`: {from} → {to}")]
    IllegalTransition {
        id: String,
        from: EventStatus,
        to: EventStatus,
    },

    /// An operation referenced an event that doesn't exist.
    #[error("no such event `{id}`")]
    NoSuchEvent { id: String },

    /// A stored row can't be interpreted.
    #[error("corrupt ledger row: {context}")]
    Corrupt { context: String },

    /// The backing store failed.
    #[error("ledger backend error")]
    Backend(#[from] sqlx::Error),

    /// The data directory couldn't be prepared.
    #[error("ledger I/O error")]
    Io(#[from] std::io::Error),

    /// Metadata (de)serialization failed.
    #[error("ledger metadata encoding error")]
    Encoding(#[from] serde_json::Error),
}

/// Width of the event-id time bucket. Changes to the same branch within
/// one bucket share an id prefix, which is what downstream deduplication
/// keys on.
const EVENT_ID_BUCKET_MS: i64 = 300_000;

/// Derives a sortable, collision-resistant event id.
///
/// Layout: `{bucket:012x}-{digest16}-{millis:013x}`. The leading bucket
/// keeps ids monotonically sortable; `bucket + digest` is a stable prefix
/// for one `(repository, branch, commit, time bucket)` tuple; the
/// trailing milliseconds make re-emissions distinct.
pub fn event_id(repository: &str, branch: &str, commit_sha: &str, at: DateTime<Utc>) -> String {
    let millis = at.timestamp_millis();
    let bucket = millis.div_euclid(EVENT_ID_BUCKET_MS);

    let mut hasher = Sha256::new();
    hasher.update(repository.as_bytes());
    hasher.update(b"|");
    hasher.update(branch.as_bytes());
    hasher.update(b"|");
    hasher.update(commit_sha.as_bytes());
    hasher.update(b"|");
    hasher.update(bucket.to_be_bytes());
    let digest = hasher.finalize();

    let mut prefix = String::with_capacity(16);
    for byte in digest.iter().take(8) {
        prefix.push_str(&format!("{byte:02x}"));
    }

    format!("{bucket:012x}-{prefix}-{millis:013x}")
}

/// The storage contract.
///
/// Writes to the same `(repository, branch)` row or the same event id are
/// serialized by the implementation; reads are consistent snapshots. The
/// reference backend is [`SqliteLedger`]; any other backend must uphold
/// the same semantics.
#[async_trait]
pub trait Ledger: Send + Sync {
    /// Atomically creates or updates a branch row, resetting its
    /// vanished-branch counter.
    async fn upsert_branch_state(
        &self,
        repository: &str,
        branch: &str,
        commit_sha: &str,
        checked_at: DateTime<Utc>,
    ) -> Result<(), LedgerError>;

    async fn get_branch_state(
        &self,
        repository: &str,
        branch: &str,
    ) -> Result<Option<BranchState>, LedgerError>;

    async fn list_branch_states(&self, repository: &str) -> Result<Vec<BranchState>, LedgerError>;

    async fn delete_branch_state(&self, repository: &str, branch: &str) -> Result<(), LedgerError>;

    /// Increments a branch's consecutive-missing counter, returning the
    /// new value.
    async fn bump_branch_missing(&self, repository: &str, branch: &str)
    -> Result<u32, LedgerError>;

    /// Inserts a new event. Rejects duplicates by id.
    async fn create_event(&self, event: &Event) -> Result<(), LedgerError>;

    /// Applies one status transition, rejecting illegal ones.
    async fn update_event_status(&self, id: &str, status: EventStatus) -> Result<(), LedgerError>;

    /// Moves a `failed` event back to `in_flight`, counting the re-drive.
    async fn begin_redrive(&self, id: &str) -> Result<(), LedgerError>;

    /// The delivery commit: marks the event `delivered` *and* advances the
    /// branch row to the event's commit, in one transaction.
    async fn commit_delivery(&self, id: &str) -> Result<(), LedgerError>;

    async fn get_event(&self, id: &str) -> Result<Option<Event>, LedgerError>;

    async fn get_pending_events(&self, limit: u32) -> Result<Vec<Event>, LedgerError>;

    /// Failed events still eligible for re-drive.
    async fn get_failed_events(
        &self,
        limit: u32,
        max_redrives: u32,
    ) -> Result<Vec<Event>, LedgerError>;

    async fn get_events_since(&self, since: DateTime<Utc>) -> Result<Vec<Event>, LedgerError>;

    async fn get_events(&self, limit: u32, offset: u32) -> Result<Vec<Event>, LedgerError>;

    async fn get_events_by_repository(
        &self,
        repository: &str,
        limit: u32,
    ) -> Result<Vec<Event>, LedgerError>;

    /// Whether `(repository, branch)` has an event that is pending or in
    /// flight. Used to suppress duplicate emissions for a key.
    async fn has_active_event(&self, repository: &str, branch: &str) -> Result<bool, LedgerError>;

    /// Boot-time recovery: every `in_flight` event returns to `pending`.
    async fn reset_in_flight(&self) -> Result<u64, LedgerError>;

    /// Retention pruning; returns the number of deleted events.
    async fn delete_events_older_than(&self, cutoff: DateTime<Utc>) -> Result<u64, LedgerError>;

    async fn stats(&self) -> Result<LedgerStats, LedgerError>;

    /// A cheap liveness probe against the backing store.
    async fn health(&self) -> Result<(), LedgerError>;
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    #[test]
    fn test_status_transitions() {
        use EventStatus::*;

        for (from, to, legal) in [
            (Pending, InFlight, true),
            (InFlight, Delivered, true),
            (InFlight, Failed, true),
            (InFlight, Pending, true),
            (Failed, InFlight, true),
            (Pending, Delivered, false),
            (Pending, Failed, false),
            (Delivered, InFlight, false),
            (Delivered, Pending, false),
            (Failed, Pending, false),
            (Failed, Delivered, false),
            (InFlight, InFlight, false),
        ] {
            assert_eq!(from.can_transition_to(to), legal, "{from} → {to}");
        }
    }

    #[test]
    fn test_event_id_stable_prefix_within_bucket() {
        let t0 = "2025-06-01T12:00:01Z".parse().unwrap();
        let t1 = "2025-06-01T12:00:59Z".parse().unwrap();

        let a = event_id("demo", "main", "abc", t0);
        let b = event_id("demo", "main", "abc", t1);

        // Same tuple, same bucket: identical prefix, distinct ids.
        assert_eq!(a[..30], b[..30]);
        assert_ne!(a, b);
    }

    #[test]
    fn test_event_id_distinct_across_inputs() {
        let t = "2025-06-01T12:00:00Z".parse().unwrap();
        let base = event_id("demo", "main", "abc", t);

        assert_ne!(event_id("demo", "main", "def", t)[..30], base[..30]);
        assert_ne!(event_id("demo", "dev", "abc", t)[..30], base[..30]);
        assert_ne!(event_id("other", "main", "abc", t)[..30], base[..30]);
    }

    #[test]
    fn test_event_id_sorts_by_time() {
        let early = event_id("demo", "main", "abc", "2025-06-01T12:00:00Z".parse().unwrap());
        let late = event_id("demo", "main", "abc", "2025-06-01T13:00:00Z".parse().unwrap());
        assert!(early < late);
    }
}
