//! Runtime lifecycle: ordered start/stop, health rollup, reload.
//!
//! Construction order follows the dependency chain: clock and limiters,
//! then the ledger, then provider clients, detector, engine, dispatcher,
//! and finally the scheduler. Shutdown cancels everything through one
//! root token and waits out a grace period in reverse order.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;

use anyhow::Context as _;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::clock::{Clock, SharedClock, SystemClock};
use crate::config::Config;
use crate::dispatch::Dispatcher;
use crate::engine::{ChangeEngine, RepoContext};
use crate::ledger::{Ledger, SqliteLedger};
use crate::provider::{self, ProviderOptions};
use crate::ratelimit::LimiterRegistry;
use crate::repourl::{self, RepositoryInfo};
use crate::scheduler::{Heartbeat, RepoStatusBoard, Scheduler};
use crate::status::{ComponentHealth, Counters, HealthReport, LimiterStatus, RuntimeStatus};

/// How long shutdown waits for in-flight work to settle.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(30);

pub struct Supervisor {
    config: Mutex<Arc<Config>>,
    clock: SharedClock,
    ledger: Arc<dyn Ledger>,
    limiters: Arc<LimiterRegistry>,
    repos_info: Arc<RwLock<HashMap<String, RepositoryInfo>>>,
    engine: Arc<ChangeEngine>,
    dispatcher: Arc<Dispatcher>,
    scheduler: Arc<Scheduler>,
    counters: Arc<Counters>,
    status_board: RepoStatusBoard,
    heartbeat: Heartbeat,
    cancel: CancellationToken,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl Supervisor {
    /// Starts the runtime against the system clock.
    pub async fn start(config: Config) -> anyhow::Result<Self> {
        Self::start_with_clock(config, Arc::new(SystemClock)).await
    }

    /// Starts the runtime with an injected clock (tests pin time here).
    pub async fn start_with_clock(config: Config, clock: SharedClock) -> anyhow::Result<Self> {
        let cancel = CancellationToken::new();
        let counters = Arc::new(Counters::default());

        // C1: limiter registry.
        let limiters = Arc::new(LimiterRegistry::new(config.rate_limit.clone()));

        // C4: the ledger, with boot-time recovery of interrupted work.
        let ledger: Arc<dyn Ledger> = Arc::new(
            SqliteLedger::open(&config.storage, clock.clone())
                .await
                .context("opening ledger")?,
        );
        let recovered = ledger
            .reset_in_flight()
            .await
            .context("recovering in-flight events")?;
        if recovered > 0 {
            tracing::info!(recovered, "returned interrupted events to pending");
        }

        // C3: one provider client per declared repository.
        let (contexts, infos) = build_repositories(&config, &limiters, cancel.clone())
            .context("building provider clients")?;

        // C5 + C6: detector and change engine, joined to C8 by the
        // dispatch queue.
        let queue_capacity = (config.polling.batch_size * 2).max(16);
        let (dispatch_tx, dispatch_rx) = tokio::sync::mpsc::channel(queue_capacity);
        let engine = Arc::new(ChangeEngine::new(
            &config,
            ledger.clone(),
            clock.clone(),
            dispatch_tx.clone(),
        ));

        // C8: the dispatcher.
        let repos_info = Arc::new(RwLock::new(infos));
        let dispatcher = Dispatcher::new(
            config.tekton.clone(),
            config.polling.max_workers,
            ledger.clone(),
            repos_info.clone(),
            cancel.clone(),
            dispatch_tx,
            counters.clone(),
        )
        .context("building dispatcher")?;

        // C7: the scheduler.
        let status_board: RepoStatusBoard = Arc::new(Mutex::new(BTreeMap::new()));
        let heartbeat: Heartbeat = Arc::new(Mutex::new(None));
        let scheduler = Scheduler::new(
            engine.clone(),
            dispatcher.clone(),
            config.polling.clone(),
            contexts,
            clock.clone(),
            cancel.clone(),
            counters.clone(),
            status_board.clone(),
            heartbeat.clone(),
        );

        let mut tasks = Vec::new();
        tasks.push(tokio::spawn(dispatcher.clone().run(dispatch_rx)));
        tasks.push(tokio::spawn(scheduler.clone().run()));

        tracing::info!(
            repositories = config.repositories.len(),
            interval_s = config.polling.interval.as_secs(),
            "runtime started"
        );

        Ok(Self {
            config: Mutex::new(Arc::new(config)),
            clock,
            ledger,
            limiters,
            repos_info,
            engine,
            dispatcher,
            scheduler,
            counters,
            status_board,
            heartbeat,
            cancel,
            tasks: Mutex::new(tasks),
        })
    }

    /// Stops everything, waiting up to the grace period.
    pub async fn shutdown(&self) -> anyhow::Result<()> {
        tracing::info!("shutting down");
        self.cancel.cancel();

        let handles: Vec<JoinHandle<()>> = {
            let mut tasks = self.tasks.lock().unwrap_or_else(|p| p.into_inner());
            tasks.drain(..).collect()
        };

        // Reverse of start order: the scheduler stops feeding work before
        // the dispatcher drains.
        let deadline = tokio::time::Instant::now() + SHUTDOWN_GRACE;
        for handle in handles.into_iter().rev() {
            let remaining = deadline.saturating_duration_since(tokio::time::Instant::now());
            if tokio::time::timeout(remaining, handle).await.is_err() {
                anyhow::bail!("shutdown grace period exceeded");
            }
        }

        tracing::info!("runtime stopped");
        Ok(())
    }

    /// Applies a new configuration snapshot, atomically.
    ///
    /// Validation and construction happen before anything is swapped: a
    /// rejected snapshot leaves the previous one fully in effect. The
    /// repository swap itself lands at the next tick boundary; cycles in
    /// flight finish under the prior set.
    pub async fn reload(&self, new_config: Config) -> anyhow::Result<()> {
        let new_config = new_config.validate().context("validating reload")?;

        let (contexts, infos) = build_repositories(&new_config, &self.limiters, self.cancel.clone())
            .context("building reloaded provider clients")?;

        // Everything built; now swap.
        self.scheduler.stage(contexts, new_config.polling.clone());
        self.dispatcher.reconfigure(new_config.tekton.clone());
        self.engine.reconfigure(&new_config);
        {
            let mut current = self.repos_info.write().unwrap_or_else(|p| p.into_inner());
            *current = infos;
        }
        {
            let mut current = self.config.lock().unwrap_or_else(|p| p.into_inner());
            *current = Arc::new(new_config);
        }

        tracing::info!("configuration reloaded");
        Ok(())
    }

    /// The current worst-child-wins health rollup.
    pub async fn health(&self) -> HealthReport {
        let mut components = Vec::new();

        components.push(match self.ledger.health().await {
            Ok(()) => ComponentHealth::healthy("ledger"),
            Err(e) => ComponentHealth::unhealthy("ledger", e.to_string()),
        });

        // Scheduler liveness: a heartbeat older than two polling
        // intervals means the loop has stalled.
        let interval = {
            let config = self.config.lock().unwrap_or_else(|p| p.into_inner());
            config.polling.interval
        };
        let heartbeat = {
            let heartbeat = self.heartbeat.lock().unwrap_or_else(|p| p.into_inner());
            *heartbeat
        };
        components.push(match heartbeat {
            None => ComponentHealth::degraded("scheduler", "no tick observed yet"),
            Some(at) => {
                let age = (self.clock.now() - at).to_std().unwrap_or(Duration::ZERO);
                if age > interval * 2 {
                    ComponentHealth::unhealthy(
                        "scheduler",
                        format!("heartbeat stale for {}s", age.as_secs()),
                    )
                } else {
                    ComponentHealth::healthy("scheduler")
                }
            }
        });

        // Repository-level trouble degrades the engine without taking the
        // runtime down.
        let failing: Vec<String> = {
            let board = self.status_board.lock().unwrap_or_else(|p| p.into_inner());
            board
                .values()
                .filter(|s| s.last_cycle_ok == Some(false))
                .map(|s| s.name.clone())
                .collect()
        };
        components.push(if failing.is_empty() {
            ComponentHealth::healthy("engine")
        } else {
            ComponentHealth::degraded("engine", format!("failing repositories: {}", failing.join(", ")))
        });

        components.push(match self.ledger.stats().await {
            Ok(stats) if stats.events_failed > 0 => ComponentHealth::degraded(
                "dispatcher",
                format!("{} failed events", stats.events_failed),
            ),
            Ok(_) => ComponentHealth::healthy("dispatcher"),
            Err(e) => ComponentHealth::unhealthy("dispatcher", e.to_string()),
        });

        HealthReport::rollup(components)
    }

    /// The full status snapshot for the introspection API. Secret-free.
    pub async fn status(&self) -> RuntimeStatus {
        let health = self.health().await;
        let ledger = self.ledger.stats().await.unwrap_or_default();
        let repositories = {
            let board = self.status_board.lock().unwrap_or_else(|p| p.into_inner());
            board.clone()
        };
        let limiters = self
            .limiters
            .budgets()
            .into_iter()
            .map(|(kind, instance, budget)| LimiterStatus {
                provider: kind.as_str().to_string(),
                instance,
                budget,
            })
            .collect();

        RuntimeStatus {
            version: crate::VERSION,
            health,
            counters: self.counters.snapshot(),
            ledger,
            repositories,
            limiters,
        }
    }

    /// Read access to the event log and branch states for the
    /// introspection API.
    pub fn ledger(&self) -> Arc<dyn Ledger> {
        self.ledger.clone()
    }

    /// Whether the runtime has been asked to stop.
    pub fn is_stopping(&self) -> bool {
        self.cancel.is_cancelled()
    }
}

/// Builds provider clients and contexts for every declared repository.
fn build_repositories(
    config: &Config,
    limiters: &LimiterRegistry,
    cancel: CancellationToken,
) -> anyhow::Result<(Vec<Arc<RepoContext>>, HashMap<String, RepositoryInfo>)> {
    let options = ProviderOptions::from_config(config);
    let mut contexts = Vec::with_capacity(config.repositories.len());
    let mut infos = HashMap::with_capacity(config.repositories.len());

    for repo in &config.repositories {
        let info = repourl::parse(&repo.url)
            .with_context(|| format!("repository `{}`", repo.name))?;
        let client = provider::for_repository(repo, &info, &options, limiters, cancel.clone())
            .with_context(|| format!("repository `{}`", repo.name))?;
        let context = RepoContext::new(repo.clone(), info.clone(), client)
            .with_context(|| format!("repository `{}`", repo.name))?;

        infos.insert(repo.name.clone(), info);
        contexts.push(Arc::new(context));
    }

    Ok((contexts, infos))
}
