//! Runtime status for the external read-only introspection API.
//!
//! Everything here is serializable and secret-free: repository entries
//! carry names and hosts, never tokens.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::ledger::LedgerStats;
use crate::ratelimit::RateBudget;

/// Process-local monotonic counters.
#[derive(Debug, Default)]
pub struct Counters {
    pub cycles_total: AtomicU64,
    pub cycle_errors: AtomicU64,
    pub events_emitted: AtomicU64,
    pub events_delivered: AtomicU64,
    pub events_failed: AtomicU64,
    pub events_redriven: AtomicU64,
    pub dispatch_attempts: AtomicU64,
    pub skipped_full_queue: AtomicU64,
}

impl Counters {
    pub fn snapshot(&self) -> CounterSnapshot {
        CounterSnapshot {
            cycles_total: self.cycles_total.load(Ordering::Relaxed),
            cycle_errors: self.cycle_errors.load(Ordering::Relaxed),
            events_emitted: self.events_emitted.load(Ordering::Relaxed),
            events_delivered: self.events_delivered.load(Ordering::Relaxed),
            events_failed: self.events_failed.load(Ordering::Relaxed),
            events_redriven: self.events_redriven.load(Ordering::Relaxed),
            dispatch_attempts: self.dispatch_attempts.load(Ordering::Relaxed),
            skipped_full_queue: self.skipped_full_queue.load(Ordering::Relaxed),
        }
    }
}

#[derive(Clone, Copy, Debug, Default, Serialize)]
pub struct CounterSnapshot {
    pub cycles_total: u64,
    pub cycle_errors: u64,
    pub events_emitted: u64,
    pub events_delivered: u64,
    pub events_failed: u64,
    pub events_redriven: u64,
    pub dispatch_attempts: u64,
    pub skipped_full_queue: u64,
}

/// Component health, worst-child-wins at the rollup.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthState {
    Healthy,
    Degraded,
    Unhealthy,
}

#[derive(Clone, Debug, Serialize)]
pub struct ComponentHealth {
    pub component: &'static str,
    pub state: HealthState,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

impl ComponentHealth {
    pub fn healthy(component: &'static str) -> Self {
        Self {
            component,
            state: HealthState::Healthy,
            message: None,
        }
    }

    pub fn degraded(component: &'static str, message: impl Into<String>) -> Self {
        Self {
            component,
            state: HealthState::Degraded,
            message: Some(message.into()),
        }
    }

    pub fn unhealthy(component: &'static str, message: impl Into<String>) -> Self {
        Self {
            component,
            state: HealthState::Unhealthy,
            message: Some(message.into()),
        }
    }
}

/// The aggregated health report.
#[derive(Clone, Debug, Serialize)]
pub struct HealthReport {
    pub state: HealthState,
    pub components: Vec<ComponentHealth>,
}

impl HealthReport {
    pub fn rollup(components: Vec<ComponentHealth>) -> Self {
        let state = components
            .iter()
            .map(|c| c.state)
            .max()
            .unwrap_or(HealthState::Healthy);
        Self { state, components }
    }
}

/// The last observed outcome for one repository.
#[derive(Clone, Debug, Serialize)]
pub struct RepositoryStatus {
    pub name: String,
    pub instance: String,
    pub enabled: bool,
    pub last_cycle_at: Option<DateTime<Utc>>,
    pub last_cycle_ok: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
}

/// One limiter's budget, keyed for display.
#[derive(Clone, Debug, Serialize)]
pub struct LimiterStatus {
    pub provider: String,
    pub instance: String,
    pub budget: RateBudget,
}

/// The full status snapshot returned to the introspection API.
#[derive(Clone, Debug, Serialize)]
pub struct RuntimeStatus {
    pub version: &'static str,
    pub health: HealthReport,
    pub counters: CounterSnapshot,
    pub ledger: LedgerStats,
    pub repositories: BTreeMap<String, RepositoryStatus>,
    pub limiters: Vec<LimiterStatus>,
}
