//! End-to-end pipeline tests: a live supervisor polling a mock provider
//! and delivering CloudEvents to a mock trigger endpoint, backed by a
//! temporary SQLite ledger.

use std::time::Duration;

use reposentry::Supervisor;
use reposentry::clock::SystemClock;
use reposentry::config::{
    AppConfig, Config, DetectorConfig, PollingConfig, RateLimitConfig, RepositoryConfig,
    SecurityConfig, StorageConfig, TektonConfig, Token,
};
use reposentry::ledger::{Event, EventStatus, EventType, Ledger, SqliteLedger};
use reposentry::repourl::ProviderKind;
use serde_json::json;
use wiremock::matchers::{method, path, query_param};
use wiremock::{Mock, MockServer, ResponseTemplate};

const PIPELINE_RUN_YAML: &str =
    "apiVersion: tekton.dev/v1beta1\nkind: PipelineRun\nmetadata:\n  name: build-run\n";
const PIPELINE_YAML: &str =
    "apiVersion: tekton.dev/v1beta1\nkind: Pipeline\nmetadata:\n  name: build\n";

struct Fixture {
    provider: MockServer,
    trigger: MockServer,
    config: Config,
    _dir: tempfile::TempDir,
}

impl Fixture {
    async fn new(branch_regex: &str) -> Self {
        let provider = MockServer::start().await;
        let trigger = MockServer::start().await;
        let dir = tempfile::tempdir().expect("tempdir");

        let config = Config {
            app: AppConfig::default(),
            polling: PollingConfig {
                interval: Duration::from_millis(200),
                timeout: Duration::from_secs(5),
                max_workers: 2,
                batch_size: 8,
                retry_attempts: 1,
                retry_backoff: Duration::from_millis(10),
                enable_api_fallback: false,
                prune_vanished_after: 1,
            },
            storage: StorageConfig {
                path: camino::Utf8PathBuf::from_path_buf(dir.path().join("ledger.db"))
                    .expect("utf-8 temp path"),
                ..StorageConfig::default()
            },
            tekton: TektonConfig {
                event_listener_url: trigger.uri(),
                timeout: Duration::from_secs(5),
                retry_attempts: 3,
                retry_backoff: Duration::from_millis(10),
                redrive_attempts: 0,
                headers: Default::default(),
            },
            detector: DetectorConfig::default(),
            rate_limit: RateLimitConfig::default(),
            security: SecurityConfig {
                require_https: false,
                ..SecurityConfig::default()
            },
            repositories: vec![RepositoryConfig {
                name: "demo".into(),
                url: "https://github.com/acme/demo".into(),
                provider: ProviderKind::Github,
                token: Token::new("test-token"),
                branch_regex: branch_regex.into(),
                enabled: true,
                polling_interval: None,
                api_base_url: Some(provider.uri()),
            }],
        };

        Self {
            provider,
            trigger,
            config,
            _dir: dir,
        }
    }

    /// Serves a branch listing and (unless told otherwise) a repository
    /// tree without a pipeline directory.
    async fn mount_branches(&self, branches: &[(&str, &str)]) {
        let body: Vec<_> = branches
            .iter()
            .map(|(name, sha)| json!({"name": name, "commit": {"sha": sha}, "protected": false}))
            .collect();
        Mock::given(method("GET"))
            .and(path("/repos/acme/demo/branches"))
            .respond_with(ResponseTemplate::new(200).set_body_json(body))
            .mount(&self.provider)
            .await;
    }

    async fn mount_no_pipeline_dir(&self) {
        Mock::given(method("GET"))
            .and(path("/repos/acme/demo/contents/.tekton"))
            .respond_with(ResponseTemplate::new(404).set_body_json(json!({"message": "Not Found"})))
            .mount(&self.provider)
            .await;
    }

    /// Seeds a prior delivery so the next observation reads as an update.
    async fn seed_branch_state(&self, branch: &str, sha: &str) {
        let clock = std::sync::Arc::new(SystemClock);
        let ledger = SqliteLedger::open(&self.config.storage, clock)
            .await
            .expect("open ledger");
        ledger
            .upsert_branch_state("demo", branch, sha, chrono::Utc::now())
            .await
            .expect("seed");
    }
}

/// Polls the ledger until an event for `sha` reaches `status`, or panics.
async fn wait_for_event(supervisor: &Supervisor, sha: &str, status: EventStatus) -> Event {
    let ledger = supervisor.ledger();
    for _ in 0..250 {
        if let Ok(events) = ledger.get_events_by_repository("demo", 50).await
            && let Some(event) = events
                .into_iter()
                .find(|e| e.commit_sha == sha && e.status == status)
        {
            return event;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    panic!("timed out waiting for a {status} event at {sha}");
}

async fn delivered_event(supervisor: &Supervisor, sha: &str) -> Event {
    wait_for_event(supervisor, sha, EventStatus::Delivered).await
}

#[tokio::test]
async fn test_first_observation_clean_deliver() {
    let fixture = Fixture::new("^main$").await;
    fixture.mount_branches(&[("main", "aaaaaaaa")]).await;
    fixture.mount_no_pipeline_dir().await;
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(200))
        .mount(&fixture.trigger)
        .await;

    let supervisor = Supervisor::start(fixture.config.clone()).await.expect("start");

    let event = delivered_event(&supervisor, "aaaaaaaa").await;
    assert_eq!(event.event_type, EventType::BranchCreated);
    assert_eq!(event.branch, "main");

    let state = supervisor
        .ledger()
        .get_branch_state("demo", "main")
        .await
        .expect("get")
        .expect("present");
    assert_eq!(state.last_commit_sha, "aaaaaaaa");

    // The wire envelope is CloudEvents 1.0 with our identity headers.
    let requests = fixture.trigger.received_requests().await.expect("requests");
    assert!(!requests.is_empty());
    let body: serde_json::Value = serde_json::from_slice(&requests[0].body).expect("json");
    assert_eq!(body["specversion"], "1.0");
    assert_eq!(body["type"], "com.reposentry.branch.created");
    assert_eq!(body["source"], "https://github.com/acme/demo");
    assert_eq!(body["data"]["commit"]["sha"], "aaaaaaaa");
    assert_eq!(body["data"]["repository"]["owner"], "acme");
    assert_eq!(
        requests[0]
            .headers
            .get("X-Source")
            .map(|v| v.to_str().unwrap_or_default()),
        Some("reposentry")
    );

    supervisor.shutdown().await.expect("shutdown");
}

#[tokio::test]
async fn test_update_with_transient_500s() {
    let fixture = Fixture::new("^main$").await;
    fixture.seed_branch_state("main", "aaaaaaaa").await;
    fixture.mount_branches(&[("main", "bbbbbbbb")]).await;
    fixture.mount_no_pipeline_dir().await;

    // Two 500s, then success.
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(500))
        .up_to_n_times(2)
        .mount(&fixture.trigger)
        .await;
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(200))
        .mount(&fixture.trigger)
        .await;

    let supervisor = Supervisor::start(fixture.config.clone()).await.expect("start");

    let event = delivered_event(&supervisor, "bbbbbbbb").await;
    assert_eq!(event.event_type, EventType::BranchUpdated);

    let state = supervisor
        .ledger()
        .get_branch_state("demo", "main")
        .await
        .expect("get")
        .expect("present");
    assert_eq!(state.last_commit_sha, "bbbbbbbb");

    // All three attempts hit the endpoint.
    let requests = fixture.trigger.received_requests().await.expect("requests");
    assert_eq!(requests.len(), 3);

    supervisor.shutdown().await.expect("shutdown");
}

#[tokio::test]
async fn test_terminal_400_keeps_state_and_reemits() {
    let fixture = Fixture::new("^main$").await;
    fixture.seed_branch_state("main", "aaaaaaaa").await;
    fixture.mount_branches(&[("main", "bbbbbbbb")]).await;
    fixture.mount_no_pipeline_dir().await;
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(400))
        .mount(&fixture.trigger)
        .await;

    let supervisor = Supervisor::start(fixture.config.clone()).await.expect("start");

    // Wait until two cycles have produced two distinct failed events for
    // the same commit.
    let ledger = supervisor.ledger();
    let mut events: Vec<Event> = Vec::new();
    for _ in 0..250 {
        events = ledger
            .get_events_by_repository("demo", 50)
            .await
            .expect("events")
            .into_iter()
            .filter(|e| e.commit_sha == "bbbbbbbb" && e.status == EventStatus::Failed)
            .collect();
        if events.len() >= 2 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    assert!(events.len() >= 2, "expected repeated fresh emissions");

    // Fresh ids each time; the branch state never advanced.
    assert_ne!(events[0].id, events[1].id);
    let state = supervisor
        .ledger()
        .get_branch_state("demo", "main")
        .await
        .expect("get")
        .expect("present");
    assert_eq!(state.last_commit_sha, "aaaaaaaa");

    supervisor.shutdown().await.expect("shutdown");
}

#[tokio::test]
async fn test_branch_filter() {
    let fixture = Fixture::new("^release/.*$").await;
    fixture
        .mount_branches(&[("main", "xxxxxxxx"), ("release/1", "yyyyyyyy")])
        .await;
    fixture.mount_no_pipeline_dir().await;
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(200))
        .mount(&fixture.trigger)
        .await;

    let supervisor = Supervisor::start(fixture.config.clone()).await.expect("start");

    let event = delivered_event(&supervisor, "yyyyyyyy").await;
    assert_eq!(event.branch, "release/1");

    // `main` is invisible: no events, no ledger row.
    let events = supervisor
        .ledger()
        .get_events_by_repository("demo", 50)
        .await
        .expect("events");
    assert!(events.iter().all(|e| e.branch == "release/1"));
    assert_eq!(
        supervisor
            .ledger()
            .get_branch_state("demo", "main")
            .await
            .expect("get"),
        None
    );

    supervisor.shutdown().await.expect("shutdown");
}

#[tokio::test]
async fn test_tekton_detection_trigger_classification() {
    let fixture = Fixture::new("^main$").await;
    fixture.mount_branches(&[("main", "cafecafe")]).await;

    // The pipeline directory exists and holds one Pipeline and one
    // PipelineRun.
    Mock::given(method("GET"))
        .and(path("/repos/acme/demo/contents/.tekton"))
        .and(query_param("ref", "cafecafe"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!([
            {"name": "pipeline.yaml", "path": ".tekton/pipeline.yaml", "type": "file"},
            {"name": "run.yaml", "path": ".tekton/run.yaml", "type": "file"}
        ])))
        .mount(&fixture.provider)
        .await;
    Mock::given(method("GET"))
        .and(path("/repos/acme/demo/git/trees/cafecafe"))
        .and(query_param("recursive", "1"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "tree": [
                {"path": ".tekton/pipeline.yaml", "mode": "100644", "type": "blob", "size": PIPELINE_YAML.len()},
                {"path": ".tekton/run.yaml", "mode": "100644", "type": "blob", "size": PIPELINE_RUN_YAML.len()}
            ],
            "truncated": false
        })))
        .mount(&fixture.provider)
        .await;
    Mock::given(method("GET"))
        .and(path("/repos/acme/demo/contents/.tekton/pipeline.yaml"))
        .respond_with(ResponseTemplate::new(200).set_body_string(PIPELINE_YAML))
        .mount(&fixture.provider)
        .await;
    Mock::given(method("GET"))
        .and(path("/repos/acme/demo/contents/.tekton/run.yaml"))
        .respond_with(ResponseTemplate::new(200).set_body_string(PIPELINE_RUN_YAML))
        .mount(&fixture.provider)
        .await;
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(200))
        .mount(&fixture.trigger)
        .await;

    let supervisor = Supervisor::start(fixture.config.clone()).await.expect("start");

    let event = delivered_event(&supervisor, "cafecafe").await;
    assert_eq!(event.event_type, EventType::TektonDetected);

    // The delivered envelope carries the full detection payload.
    let requests = fixture.trigger.received_requests().await.expect("requests");
    let body: serde_json::Value = serde_json::from_slice(&requests[0].body).expect("json");
    assert_eq!(body["type"], "com.reposentry.tekton.detected");
    let detection = &body["data"]["detection"];
    assert_eq!(detection["estimated_action"], "trigger");
    assert_eq!(detection["valid_files"], 2);
    assert_eq!(
        detection["resources"].as_array().expect("resources").len(),
        2
    );

    supervisor.shutdown().await.expect("shutdown");
}

#[tokio::test]
async fn test_idle_cycles_emit_nothing_new() {
    let fixture = Fixture::new("^main$").await;
    fixture.mount_branches(&[("main", "aaaaaaaa")]).await;
    fixture.mount_no_pipeline_dir().await;
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(200))
        .mount(&fixture.trigger)
        .await;

    let supervisor = Supervisor::start(fixture.config.clone()).await.expect("start");
    delivered_event(&supervisor, "aaaaaaaa").await;

    // Let several more cycles run with unchanged provider state.
    tokio::time::sleep(Duration::from_millis(800)).await;

    let events = supervisor
        .ledger()
        .get_events_by_repository("demo", 50)
        .await
        .expect("events");
    assert_eq!(events.len(), 1);

    supervisor.shutdown().await.expect("shutdown");
}
