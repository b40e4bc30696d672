//! The global tick loop and repository worker pool.
//!
//! One scheduler drives every repository: each tick enumerates the
//! enabled repositories whose cadence has elapsed and submits them to a
//! bounded worker pool. A full queue is not an error: the repository's
//! deadline stays in the past and the next tick reconsiders it.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::mpsc;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

use crate::clock::SharedClock;
use crate::config::PollingConfig;
use crate::dispatch::Dispatcher;
use crate::engine::{ChangeEngine, RepoContext};
use crate::status::{Counters, RepositoryStatus};

/// Shared mutable view of per-repository outcomes, read by the status
/// snapshot.
pub type RepoStatusBoard = Arc<Mutex<BTreeMap<String, RepositoryStatus>>>;

/// Shared scheduler liveness signal, read by the supervisor's health
/// rollup.
pub type Heartbeat = Arc<Mutex<Option<DateTime<Utc>>>>;

pub struct Scheduler {
    engine: Arc<ChangeEngine>,
    dispatcher: Arc<Dispatcher>,
    /// Cadence and worker shape; interval changes apply at the next tick.
    /// Pool size and queue capacity are fixed for the process lifetime.
    polling: Mutex<PollingConfig>,
    clock: SharedClock,
    cancel: CancellationToken,
    counters: Arc<Counters>,
    /// The active repository set; replaced wholesale at tick boundaries.
    repos: Mutex<Arc<Vec<Arc<RepoContext>>>>,
    /// A reloaded set waiting for the next tick boundary.
    pending_swap: Mutex<Option<Arc<Vec<Arc<RepoContext>>>>>,
    /// Cycle-start instants per repository name.
    started_at: Mutex<HashMap<String, Instant>>,
    status_board: RepoStatusBoard,
    heartbeat: Heartbeat,
}

impl Scheduler {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        engine: Arc<ChangeEngine>,
        dispatcher: Arc<Dispatcher>,
        polling: PollingConfig,
        repos: Vec<Arc<RepoContext>>,
        clock: SharedClock,
        cancel: CancellationToken,
        counters: Arc<Counters>,
        status_board: RepoStatusBoard,
        heartbeat: Heartbeat,
    ) -> Arc<Self> {
        Arc::new(Self {
            engine,
            dispatcher,
            polling: Mutex::new(polling),
            clock,
            cancel,
            counters,
            repos: Mutex::new(Arc::new(repos)),
            pending_swap: Mutex::new(None),
            started_at: Mutex::new(HashMap::new()),
            status_board,
            heartbeat,
        })
    }

    /// Stages a reloaded repository set and polling shape. Cycles already
    /// in flight finish under the previous configuration; the repository
    /// swap happens atomically at the next tick boundary.
    pub fn stage(&self, repos: Vec<Arc<RepoContext>>, polling: PollingConfig) {
        {
            let mut current = self.polling.lock().unwrap_or_else(|p| p.into_inner());
            *current = polling;
        }
        let mut pending = self.pending_swap.lock().unwrap_or_else(|p| p.into_inner());
        *pending = Some(Arc::new(repos));
    }

    fn polling(&self) -> PollingConfig {
        self.polling
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .clone()
    }

    /// The scheduler loop. Runs until shutdown.
    pub async fn run(self: Arc<Self>) {
        let initial = self.polling();
        let (work_tx, work_rx) = mpsc::channel::<Arc<RepoContext>>(initial.batch_size);
        let work_rx = Arc::new(tokio::sync::Mutex::new(work_rx));

        let mut workers = tokio::task::JoinSet::new();
        for worker in 0..initial.max_workers {
            let this = Arc::clone(&self);
            let work_rx = Arc::clone(&work_rx);
            workers.spawn(async move { this.worker_loop(worker, work_rx).await });
        }

        let mut tick_every = initial.interval;
        let mut ticker = tokio::time::interval(tick_every);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => break,
                _ = ticker.tick() => {
                    self.tick(&work_tx).await;

                    // A reload may have changed the cadence; rebuild the
                    // ticker so the new period starts from this boundary.
                    let wanted = self.polling().interval;
                    if wanted != tick_every {
                        tick_every = wanted;
                        ticker = tokio::time::interval_at(Instant::now() + tick_every, tick_every);
                        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
                    }
                }
            }
        }

        drop(work_tx);
        while workers.join_next().await.is_some() {}
    }

    async fn tick(&self, work_tx: &mpsc::Sender<Arc<RepoContext>>) {
        let polling = self.polling();
        {
            let mut heartbeat = self.heartbeat.lock().unwrap_or_else(|p| p.into_inner());
            *heartbeat = Some(self.clock.now());
        }

        // Apply a staged reload exactly at the tick boundary.
        let repos = {
            let staged = {
                let mut pending = self.pending_swap.lock().unwrap_or_else(|p| p.into_inner());
                pending.take()
            };
            let mut current = self.repos.lock().unwrap_or_else(|p| p.into_inner());
            if let Some(staged) = staged {
                tracing::info!(repos = staged.len(), "applying reloaded repository set");
                *current = staged;
            }
            Arc::clone(&current)
        };

        // Re-drive pending and failed events alongside the poll work.
        self.dispatcher.sweep(polling.batch_size as u32).await;

        let now = Instant::now();
        for repo in repos.iter() {
            if !repo.config.enabled {
                continue;
            }
            if !self.is_due(repo, &polling, now) {
                continue;
            }

            match work_tx.try_send(Arc::clone(repo)) {
                Ok(()) => {
                    let mut started = self.started_at.lock().unwrap_or_else(|p| p.into_inner());
                    started.insert(repo.config.name.clone(), now);
                }
                Err(_) => {
                    // Queue full: the deadline stays in the past, so the
                    // next tick reconsiders this repository.
                    self.counters
                        .skipped_full_queue
                        .fetch_add(1, std::sync::atomic::Ordering::Relaxed);
                    tracing::debug!(repo = %repo.config.name, "cycle skipped: worker queue full");
                }
            }
        }
    }

    fn is_due(&self, repo: &RepoContext, polling: &PollingConfig, now: Instant) -> bool {
        let effective = repo.config.polling_interval.unwrap_or(polling.interval);
        let started = self.started_at.lock().unwrap_or_else(|p| p.into_inner());
        match started.get(&repo.config.name) {
            Some(last) => now.duration_since(*last) >= effective,
            None => true,
        }
    }

    async fn worker_loop(
        &self,
        worker: usize,
        work_rx: Arc<tokio::sync::Mutex<mpsc::Receiver<Arc<RepoContext>>>>,
    ) {
        loop {
            let repo = {
                let mut rx = work_rx.lock().await;
                tokio::select! {
                    received = rx.recv() => received,
                    _ = self.cancel.cancelled() => None,
                }
            };
            let Some(repo) = repo else { break };

            let cycle_id = format!(
                "{}-{:x}",
                repo.config.name,
                self.clock.now().timestamp_millis()
            );
            tracing::debug!(worker, cycle = %cycle_id, "cycle starting");
            self.run_one(&repo, &cycle_id).await;
        }
    }

    async fn run_one(&self, repo: &RepoContext, cycle_id: &str) {
        self.counters
            .cycles_total
            .fetch_add(1, std::sync::atomic::Ordering::Relaxed);

        // The polling timeout is a hard cap on the cycle's provider I/O.
        // Event delivery runs in the dispatcher under its own budget.
        let deadline = self.polling().timeout.max(Duration::from_millis(1));
        let result = tokio::time::timeout(deadline, self.engine.run_cycle(repo, cycle_id)).await;

        let (ok, error) = match result {
            Ok(Ok(outcome)) => {
                self.counters
                    .events_emitted
                    .fetch_add(outcome.events_emitted as u64, std::sync::atomic::Ordering::Relaxed);
                for error in &outcome.errors {
                    tracing::warn!(repo = %repo.config.name, cycle = %cycle_id, "branch error: {error}");
                }
                tracing::debug!(
                    repo = %repo.config.name,
                    cycle = %cycle_id,
                    listed = outcome.branches_listed,
                    matched = outcome.branches_matched,
                    emitted = outcome.events_emitted,
                    suppressed = outcome.suppressed,
                    pruned = outcome.pruned,
                    "cycle finished"
                );
                (true, outcome.errors.first().cloned())
            }
            Ok(Err(e)) => {
                self.counters
                    .cycle_errors
                    .fetch_add(1, std::sync::atomic::Ordering::Relaxed);
                tracing::warn!(repo = %repo.config.name, cycle = %cycle_id, "cycle failed: {e}");
                (false, Some(e.to_string()))
            }
            Err(_) => {
                self.counters
                    .cycle_errors
                    .fetch_add(1, std::sync::atomic::Ordering::Relaxed);
                tracing::warn!(
                    repo = %repo.config.name,
                    cycle = %cycle_id,
                    timeout_s = deadline.as_secs(),
                    "cycle deadline exceeded"
                );
                (false, Some("cycle deadline exceeded".into()))
            }
        };

        let mut board = self.status_board.lock().unwrap_or_else(|p| p.into_inner());
        board.insert(
            repo.config.name.clone(),
            RepositoryStatus {
                name: repo.config.name.clone(),
                instance: repo.info.instance.clone(),
                enabled: repo.config.enabled,
                last_cycle_at: Some(self.clock.now()),
                last_cycle_ok: Some(ok),
                last_error: error,
            },
        );
    }
}
