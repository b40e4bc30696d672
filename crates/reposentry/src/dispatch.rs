//! CloudEvents construction and delivery to the trigger endpoint.
//!
//! The dispatcher consumes event ids (from the change engine, from
//! boot-time recovery, and from failed-event re-drives), builds the
//! CloudEvents envelope from the ledger row, and POSTs it with bounded
//! retries. Terminal success commits the delivery *and* the branch-state
//! advance in one ledger transaction; exhaustion marks the event failed
//! and leaves the branch state alone so the next cycle re-detects.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;

use chrono::SecondsFormat;
use rand::Rng;
use reqwest::StatusCode;
use serde::{Deserialize, Serialize};
use tokio::sync::{Semaphore, mpsc};
use tokio_util::sync::CancellationToken;
use tracing::instrument;

use crate::config::TektonConfig;
use crate::detector::DetectorResult;
use crate::engine::metadata;
use crate::ledger::{Event, EventStatus, EventType, Ledger};
use crate::repourl::RepositoryInfo;
use crate::status::Counters;

/// Hard ceiling on any single backoff delay.
const BACKOFF_CEILING: Duration = Duration::from_secs(30);

/// The CloudEvents 1.0 envelope we put on the wire.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct CloudEvent {
    pub specversion: String,
    #[serde(rename = "type")]
    pub event_type: String,
    pub source: String,
    pub id: String,
    pub time: String,
    pub datacontenttype: String,
    pub data: EventData,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct EventData {
    pub repository: RepositoryData,
    pub branch: BranchData,
    pub commit: CommitData,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub detection: Option<DetectorResult>,
    pub reposentry: SentryData,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct RepositoryData {
    pub name: String,
    pub url: String,
    pub provider: String,
    pub owner: String,
    pub is_enterprise: bool,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct BranchData {
    pub name: String,
    pub protected: bool,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct CommitData {
    pub sha: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<String>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct SentryData {
    pub version: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cycle_id: Option<String>,
}

/// Maps a ledger event type to its CloudEvents `type` attribute.
fn cloud_event_type(event_type: EventType) -> &'static str {
    match event_type {
        EventType::BranchCreated => "com.reposentry.branch.created",
        EventType::BranchUpdated => "com.reposentry.branch.updated",
        EventType::TektonDetected => "com.reposentry.tekton.detected",
    }
}

/// Builds the wire envelope for one ledger event.
///
/// The detector payload travels inside the event's metadata map as JSON;
/// it is re-inflated here, at the wire edge, into its typed form.
pub fn build_cloud_event(event: &Event, info: &RepositoryInfo) -> CloudEvent {
    let detection = event
        .metadata
        .get(metadata::DETECTION)
        .and_then(|raw| serde_json::from_str::<DetectorResult>(raw).ok());

    let protected = event
        .metadata
        .get(metadata::BRANCH_PROTECTED)
        .is_some_and(|v| v == "true");

    CloudEvent {
        specversion: "1.0".into(),
        event_type: cloud_event_type(event.event_type).into(),
        source: info.html_url.clone(),
        id: event.id.clone(),
        time: event
            .timestamp
            .to_rfc3339_opts(SecondsFormat::Secs, true),
        datacontenttype: "application/json".into(),
        data: EventData {
            repository: RepositoryData {
                name: event.repository.clone(),
                url: info.html_url.clone(),
                provider: event.provider.as_str().into(),
                owner: info.namespace.clone(),
                is_enterprise: info.is_enterprise,
            },
            branch: BranchData {
                name: event.branch.clone(),
                protected,
            },
            commit: CommitData {
                sha: event.commit_sha.clone(),
                timestamp: event.metadata.get(metadata::OBSERVED_AT).cloned(),
            },
            detection,
            reposentry: SentryData {
                version: crate::VERSION.into(),
                cycle_id: event.metadata.get(metadata::CYCLE_ID).cloned(),
            },
        },
    }
}

enum Attempt {
    Delivered,
    Retryable(String),
    Terminal(String),
    Cancelled,
}

enum DeliveryOutcome {
    Delivered,
    Failed,
    Cancelled,
}

pub struct Dispatcher {
    http: reqwest::Client,
    /// Trigger configuration; swapped wholesale on reload.
    config: RwLock<TektonConfig>,
    ledger: Arc<dyn Ledger>,
    /// Repository metadata for envelope construction; swapped on reload.
    repos: Arc<RwLock<HashMap<String, RepositoryInfo>>>,
    cancel: CancellationToken,
    /// Caps concurrent deliveries across keys.
    permits: Arc<Semaphore>,
    /// Per-`(repository, branch)` single-flight guard.
    in_flight: Mutex<HashSet<(String, String)>>,
    /// Handle for requeueing and sweeps.
    tx: mpsc::Sender<String>,
    counters: Arc<Counters>,
}

impl Dispatcher {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        config: TektonConfig,
        max_workers: usize,
        ledger: Arc<dyn Ledger>,
        repos: Arc<RwLock<HashMap<String, RepositoryInfo>>>,
        cancel: CancellationToken,
        tx: mpsc::Sender<String>,
        counters: Arc<Counters>,
    ) -> Result<Arc<Self>, reqwest::Error> {
        // The per-request timeout comes from the (reloadable) config at
        // send time, not from the client.
        let http = reqwest::Client::builder()
            .user_agent(crate::USER_AGENT)
            .build()?;

        Ok(Arc::new(Self {
            http,
            config: RwLock::new(config),
            ledger,
            repos,
            cancel,
            permits: Arc::new(Semaphore::new(max_workers.max(1))),
            in_flight: Mutex::new(HashSet::new()),
            tx,
            counters,
        }))
    }

    /// Applies a reloaded trigger configuration. Deliveries already in
    /// their retry loop finish under the snapshot they started with.
    pub fn reconfigure(&self, config: TektonConfig) {
        let mut current = self.config.write().unwrap_or_else(|p| p.into_inner());
        *current = config;
    }

    fn config_snapshot(&self) -> TektonConfig {
        self.config
            .read()
            .unwrap_or_else(|p| p.into_inner())
            .clone()
    }

    /// The dispatch worker loop. Runs until shutdown or channel close.
    pub async fn run(self: Arc<Self>, mut rx: mpsc::Receiver<String>) {
        let mut tasks = tokio::task::JoinSet::new();

        loop {
            // Opportunistically reap finished deliveries.
            while tasks.try_join_next().is_some() {}

            tokio::select! {
                _ = self.cancel.cancelled() => break,
                received = rx.recv() => {
                    let Some(id) = received else { break };
                    let this = Arc::clone(&self);
                    tasks.spawn(async move {
                        let permit = tokio::select! {
                            permit = this.permits.clone().acquire_owned() => permit,
                            _ = this.cancel.cancelled() => return,
                        };
                        let _permit = permit.expect("dispatch semaphore never closes");
                        this.dispatch_one(&id).await;
                    });
                }
            }
        }

        // Let in-flight deliveries notice the cancel and settle.
        while tasks.join_next().await.is_some() {}
    }

    /// Enqueues pending work the channel doesn't know about: events
    /// recovered at boot and failed events eligible for re-drive.
    /// Invoked once per scheduler tick.
    pub async fn sweep(&self, limit: u32) {
        let pending = match self.ledger.get_pending_events(limit).await {
            Ok(events) => events,
            Err(e) => {
                tracing::warn!("pending sweep failed: {e}");
                return;
            }
        };
        let redrive_attempts = self.config_snapshot().redrive_attempts;
        let failed = match self
            .ledger
            .get_failed_events(limit, redrive_attempts)
            .await
        {
            Ok(events) => events,
            Err(e) => {
                tracing::warn!("failed-event sweep failed: {e}");
                return;
            }
        };

        for event in pending.into_iter().chain(failed) {
            // Full queue: the next tick sweeps again.
            if self.tx.try_send(event.id).is_err() {
                return;
            }
        }
    }

    #[instrument(skip(self))]
    async fn dispatch_one(&self, id: &str) {
        let event = match self.ledger.get_event(id).await {
            Ok(Some(event)) => event,
            Ok(None) => {
                tracing::warn!(event = id, "dispatch requested for unknown event");
                return;
            }
            Err(e) => {
                tracing::error!(event = id, "ledger read failed: {e}");
                return;
            }
        };

        let key = (event.repository.clone(), event.branch.clone());
        {
            let mut in_flight = self.in_flight.lock().unwrap_or_else(|p| p.into_inner());
            if !in_flight.insert(key.clone()) {
                // Another delivery for this key is running; the event stays
                // in its current state and the next sweep picks it up.
                return;
            }
        }

        self.deliver(&event).await;

        let mut in_flight = self.in_flight.lock().unwrap_or_else(|p| p.into_inner());
        in_flight.remove(&key);
    }

    async fn deliver(&self, event: &Event) {
        let info = {
            let repos = self.repos.read().unwrap_or_else(|p| p.into_inner());
            repos.get(&event.repository).cloned()
        };
        let Some(info) = info else {
            // The repository left the configuration while this event was
            // queued; there is nothing meaningful to deliver.
            tracing::warn!(
                event = %event.id,
                repo = %event.repository,
                "dropping event for repository no longer configured"
            );
            let _ = self
                .ledger
                .update_event_status(&event.id, EventStatus::InFlight)
                .await;
            let _ = self
                .ledger
                .update_event_status(&event.id, EventStatus::Failed)
                .await;
            return;
        };

        // Move to in_flight: fresh events come from `pending`, re-drives
        // from `failed`.
        let picked_up = match event.status {
            EventStatus::Pending => self
                .ledger
                .update_event_status(&event.id, EventStatus::InFlight)
                .await,
            EventStatus::Failed => {
                self.counters
                    .events_redriven
                    .fetch_add(1, std::sync::atomic::Ordering::Relaxed);
                self.ledger.begin_redrive(&event.id).await
            }
            _ => return,
        };
        if let Err(e) = picked_up {
            tracing::debug!(event = %event.id, "skipping pickup: {e}");
            return;
        }

        let envelope = build_cloud_event(event, &info);

        match self.post_with_retries(&envelope).await {
            DeliveryOutcome::Delivered => {
                match self.ledger.commit_delivery(&event.id).await {
                    Ok(()) => {
                        self.counters
                            .events_delivered
                            .fetch_add(1, std::sync::atomic::Ordering::Relaxed);
                        tracing::info!(event = %event.id, "event delivered");
                    }
                    Err(e) => {
                        // Delivered downstream but not recorded: the next
                        // cycle re-emits with a fresh id and downstream
                        // deduplicates.
                        tracing::error!(event = %event.id, "delivery commit failed: {e}");
                    }
                }
            }
            DeliveryOutcome::Failed => {
                self.counters
                    .events_failed
                    .fetch_add(1, std::sync::atomic::Ordering::Relaxed);
                if let Err(e) = self
                    .ledger
                    .update_event_status(&event.id, EventStatus::Failed)
                    .await
                {
                    tracing::error!(event = %event.id, "failed-state write failed: {e}");
                }
            }
            DeliveryOutcome::Cancelled => {
                // Shutdown mid-delivery: the event returns to pending and
                // the next start picks it up.
                if let Err(e) = self
                    .ledger
                    .update_event_status(&event.id, EventStatus::Pending)
                    .await
                {
                    tracing::error!(event = %event.id, "pending-state write failed: {e}");
                }
            }
        }
    }

    async fn post_with_retries(&self, envelope: &CloudEvent) -> DeliveryOutcome {
        let config = self.config_snapshot();
        let attempts = config.retry_attempts.max(1);
        let cap = BACKOFF_CEILING.min(config.timeout.max(Duration::from_secs(1)));
        let mut delay = config.retry_backoff;

        for attempt in 1..=attempts {
            self.counters
                .dispatch_attempts
                .fetch_add(1, std::sync::atomic::Ordering::Relaxed);

            match self.post_once(&config, envelope).await {
                Attempt::Delivered => return DeliveryOutcome::Delivered,
                Attempt::Cancelled => return DeliveryOutcome::Cancelled,
                Attempt::Terminal(reason) => {
                    tracing::warn!(event = %envelope.id, "terminal dispatch failure: {reason}");
                    return DeliveryOutcome::Failed;
                }
                Attempt::Retryable(reason) => {
                    if attempt == attempts {
                        tracing::warn!(
                            event = %envelope.id,
                            attempts,
                            "dispatch retries exhausted: {reason}"
                        );
                        return DeliveryOutcome::Failed;
                    }

                    let jittered = jitter(delay).min(cap);
                    tracing::debug!(
                        event = %envelope.id,
                        attempt,
                        delay_ms = jittered.as_millis() as u64,
                        "retrying dispatch: {reason}"
                    );
                    tokio::select! {
                        _ = tokio::time::sleep(jittered) => {}
                        _ = self.cancel.cancelled() => return DeliveryOutcome::Cancelled,
                    }
                    delay = delay.saturating_mul(2);
                }
            }
        }

        DeliveryOutcome::Failed
    }

    async fn post_once(&self, config: &TektonConfig, envelope: &CloudEvent) -> Attempt {
        let mut req = self
            .http
            .post(&config.event_listener_url)
            .timeout(config.timeout)
            .header("Content-Type", "application/json")
            .header("X-Source", "reposentry");
        for (name, value) in &config.headers {
            req = req.header(name.as_str(), value.as_str());
        }

        let result = tokio::select! {
            result = req.json(envelope).send() => result,
            _ = self.cancel.cancelled() => return Attempt::Cancelled,
        };

        match result {
            Ok(resp) => {
                let status = resp.status();
                if status.is_success() {
                    Attempt::Delivered
                } else if is_retryable(status) {
                    Attempt::Retryable(format!("HTTP {status}"))
                } else {
                    Attempt::Terminal(format!("HTTP {status}"))
                }
            }
            Err(e) => Attempt::Retryable(e.to_string()),
        }
    }
}

/// 429, 408, and server errors get retried; every other non-2xx is
/// terminal.
fn is_retryable(status: StatusCode) -> bool {
    status == StatusCode::TOO_MANY_REQUESTS
        || status == StatusCode::REQUEST_TIMEOUT
        || status.is_server_error()
}

/// Adds up to 50% random jitter.
fn jitter(delay: Duration) -> Duration {
    let factor = rand::thread_rng().gen_range(1.0..1.5);
    delay.mul_f64(factor)
}

#[cfg(test)]
mod tests {
    use chrono::{DateTime, Utc};
    use indexmap::IndexMap;
    use pretty_assertions::assert_eq;
    use wiremock::matchers::{body_partial_json, header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    use crate::clock::FixedClock;
    use crate::config::StorageConfig;
    use crate::ledger::{SqliteLedger, event_id};
    use crate::repourl::{self, ProviderKind};

    use super::*;

    fn sample_event(status: EventStatus, with_detection: bool) -> Event {
        let now: DateTime<Utc> = "2025-06-01T12:00:00Z".parse().expect("timestamp");
        let mut metadata = IndexMap::new();
        metadata.insert(metadata::CHANGE_KIND.to_string(), "updated".to_string());
        metadata.insert(metadata::BRANCH_PROTECTED.to_string(), "true".to_string());
        metadata.insert(metadata::CYCLE_ID.to_string(), "cycle-7".to_string());
        if with_detection {
            let detection = DetectorResult {
                has_pipeline_dir: true,
                scan_path: ".tekton".into(),
                total_files: 1,
                valid_files: 1,
                estimated_action: crate::detector::EstimatedAction::Trigger,
                ..DetectorResult::default()
            };
            metadata.insert(
                metadata::DETECTION.to_string(),
                serde_json::to_string(&detection).expect("serialize"),
            );
        }

        Event {
            id: event_id("demo", "main", "abc123", now),
            event_type: if with_detection {
                EventType::TektonDetected
            } else {
                EventType::BranchUpdated
            },
            repository: "demo".into(),
            branch: "main".into(),
            commit_sha: "abc123".into(),
            provider: ProviderKind::Github,
            timestamp: now,
            status,
            metadata,
            redrive_attempts: 0,
            created_at: now,
            updated_at: now,
        }
    }

    fn demo_info() -> RepositoryInfo {
        repourl::parse("https://github.com/acme/demo").expect("parse")
    }

    #[test]
    fn test_envelope_shape() {
        let event = sample_event(EventStatus::Pending, true);
        let envelope = build_cloud_event(&event, &demo_info());

        assert_eq!(envelope.specversion, "1.0");
        assert_eq!(envelope.event_type, "com.reposentry.tekton.detected");
        assert_eq!(envelope.source, "https://github.com/acme/demo");
        assert_eq!(envelope.time, "2025-06-01T12:00:00Z");
        assert_eq!(envelope.datacontenttype, "application/json");
        assert_eq!(envelope.data.repository.owner, "acme");
        assert!(!envelope.data.repository.is_enterprise);
        assert!(envelope.data.branch.protected);
        assert_eq!(envelope.data.commit.sha, "abc123");
        assert_eq!(envelope.data.reposentry.cycle_id.as_deref(), Some("cycle-7"));

        let detection = envelope.data.detection.clone().expect("detection");
        assert_eq!(detection.estimated_action, crate::detector::EstimatedAction::Trigger);

        // The wire form uses the CloudEvents attribute names.
        let json = serde_json::to_value(&envelope).expect("serialize");
        assert_eq!(json["type"], "com.reposentry.tekton.detected");
        assert!(json["data"]["detection"]["has_pipeline_dir"].as_bool().expect("bool"));
    }

    #[test]
    fn test_envelope_without_detection() {
        let event = sample_event(EventStatus::Pending, false);
        let envelope = build_cloud_event(&event, &demo_info());
        assert_eq!(envelope.event_type, "com.reposentry.branch.updated");

        let json = serde_json::to_value(&envelope).expect("serialize");
        assert!(json["data"].get("detection").is_none());
    }

    struct Rig {
        dispatcher: Arc<Dispatcher>,
        ledger: Arc<SqliteLedger>,
        _dir: tempfile::TempDir,
    }

    async fn rig(listener_url: &str, retry_backoff: Duration) -> Rig {
        let dir = tempfile::tempdir().expect("tempdir");
        let storage = StorageConfig {
            path: camino::Utf8PathBuf::from_path_buf(dir.path().join("ledger.db"))
                .expect("utf-8 temp path"),
            ..StorageConfig::default()
        };
        let clock = std::sync::Arc::new(FixedClock(
            "2025-06-01T12:00:00Z".parse().expect("timestamp"),
        ));
        let ledger = Arc::new(
            SqliteLedger::open(&storage, clock.clone())
                .await
                .expect("open ledger"),
        );

        let config = TektonConfig {
            event_listener_url: listener_url.into(),
            timeout: Duration::from_secs(5),
            retry_attempts: 3,
            retry_backoff,
            redrive_attempts: 3,
            headers: IndexMap::from([("X-Team".to_string(), "platform".to_string())]),
        };

        let repos = Arc::new(RwLock::new(HashMap::from([("demo".to_string(), demo_info())])));
        let (tx, _rx) = mpsc::channel(16);
        let dispatcher = Dispatcher::new(
            config,
            2,
            ledger.clone(),
            repos,
            CancellationToken::new(),
            tx,
            Arc::new(Counters::default()),
        )
        .expect("dispatcher");

        Rig {
            dispatcher,
            ledger,
            _dir: dir,
        }
    }

    #[tokio::test]
    async fn test_clean_delivery_advances_branch_state() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/"))
            .and(header("X-Source", "reposentry"))
            .and(header("X-Team", "platform"))
            .and(header("Content-Type", "application/json"))
            .and(body_partial_json(serde_json::json!({
                "specversion": "1.0",
                "data": {"commit": {"sha": "abc123"}}
            })))
            .respond_with(ResponseTemplate::new(200))
            .expect(1)
            .mount(&server)
            .await;

        let rig = rig(&server.uri(), Duration::from_millis(5)).await;
        let event = sample_event(EventStatus::Pending, false);
        rig.ledger.create_event(&event).await.expect("create");

        rig.dispatcher.dispatch_one(&event.id).await;

        let stored = rig
            .ledger
            .get_event(&event.id)
            .await
            .expect("get")
            .expect("present");
        assert_eq!(stored.status, EventStatus::Delivered);

        let state = rig
            .ledger
            .get_branch_state("demo", "main")
            .await
            .expect("get")
            .expect("present");
        assert_eq!(state.last_commit_sha, "abc123");
    }

    #[tokio::test]
    async fn test_transient_500s_then_success() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(500))
            .up_to_n_times(2)
            .expect(2)
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(200))
            .expect(1)
            .mount(&server)
            .await;

        let rig = rig(&server.uri(), Duration::from_millis(5)).await;
        let event = sample_event(EventStatus::Pending, false);
        rig.ledger.create_event(&event).await.expect("create");

        rig.dispatcher.dispatch_one(&event.id).await;

        let stored = rig
            .ledger
            .get_event(&event.id)
            .await
            .expect("get")
            .expect("present");
        assert_eq!(stored.status, EventStatus::Delivered);
    }

    #[tokio::test]
    async fn test_terminal_400_leaves_state_unadvanced() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(400))
            .expect(1)
            .mount(&server)
            .await;

        let rig = rig(&server.uri(), Duration::from_millis(5)).await;
        rig.ledger
            .upsert_branch_state("demo", "main", "old-sha", Utc::now())
            .await
            .expect("seed");

        let event = sample_event(EventStatus::Pending, false);
        rig.ledger.create_event(&event).await.expect("create");

        rig.dispatcher.dispatch_one(&event.id).await;

        let stored = rig
            .ledger
            .get_event(&event.id)
            .await
            .expect("get")
            .expect("present");
        assert_eq!(stored.status, EventStatus::Failed);

        let state = rig
            .ledger
            .get_branch_state("demo", "main")
            .await
            .expect("get")
            .expect("present");
        assert_eq!(state.last_commit_sha, "old-sha");
    }

    #[tokio::test]
    async fn test_retries_exhausted_marks_failed() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(503))
            .expect(3)
            .mount(&server)
            .await;

        let rig = rig(&server.uri(), Duration::from_millis(5)).await;
        let event = sample_event(EventStatus::Pending, false);
        rig.ledger.create_event(&event).await.expect("create");

        rig.dispatcher.dispatch_one(&event.id).await;

        let stored = rig
            .ledger
            .get_event(&event.id)
            .await
            .expect("get")
            .expect("present");
        assert_eq!(stored.status, EventStatus::Failed);
        assert_eq!(
            rig.ledger.get_branch_state("demo", "main").await.expect("get"),
            None
        );
    }

    #[tokio::test]
    async fn test_failed_event_redrive() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(200))
            .expect(1)
            .mount(&server)
            .await;

        let rig = rig(&server.uri(), Duration::from_millis(5)).await;
        let event = sample_event(EventStatus::Pending, false);
        rig.ledger.create_event(&event).await.expect("create");
        rig.ledger
            .update_event_status(&event.id, EventStatus::InFlight)
            .await
            .expect("pickup");
        rig.ledger
            .update_event_status(&event.id, EventStatus::Failed)
            .await
            .expect("fail");

        rig.dispatcher.dispatch_one(&event.id).await;

        let stored = rig
            .ledger
            .get_event(&event.id)
            .await
            .expect("get")
            .expect("present");
        assert_eq!(stored.status, EventStatus::Delivered);
        assert_eq!(stored.redrive_attempts, 1);
    }

    #[test]
    fn test_retryable_statuses() {
        assert!(is_retryable(StatusCode::TOO_MANY_REQUESTS));
        assert!(is_retryable(StatusCode::REQUEST_TIMEOUT));
        assert!(is_retryable(StatusCode::INTERNAL_SERVER_ERROR));
        assert!(is_retryable(StatusCode::SERVICE_UNAVAILABLE));
        assert!(!is_retryable(StatusCode::BAD_REQUEST));
        assert!(!is_retryable(StatusCode::UNPROCESSABLE_ENTITY));
        assert!(!is_retryable(StatusCode::NOT_FOUND));
    }
}
