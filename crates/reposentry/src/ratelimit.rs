//! Per-provider request budgets.
//!
//! Limiters are keyed by `(provider kind, instance)` so a self-hosted
//! GitLab never contends with gitlab.com. Two shapes exist: an
//! hourly-window budget (the GitHub model) and a per-second token bucket
//! (the GitLab model). Both are fed back from provider response headers
//! when those are present, and both wait cancellably; a limiter never
//! sleeps past shutdown.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use thiserror::Error;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::config::RateLimitConfig;
use crate::repourl::ProviderKind;

/// A snapshot of one limiter's budget.
#[derive(Clone, Debug, Serialize)]
pub struct RateBudget {
    pub requests_remaining: u64,
    pub window_reset_at: Option<DateTime<Utc>>,
    pub burst_tokens: u32,
}

#[derive(Debug, Error)]
pub enum AcquireError {
    /// The wait was interrupted by shutdown.
    #[error("rate limiter wait cancelled")]
    Cancelled,
}

enum Shape {
    /// Fixed budget per rolling one-hour window, plus a burst allowance.
    Hourly { per_hour: u32, burst: u32 },
    /// Continuous refill at `per_second`, capped at `burst` tokens.
    Bucket { per_second: u32, burst: u32 },
}

struct State {
    /// Tokens currently available. Fractional for the bucket shape.
    tokens: f64,
    /// Last refill instant (bucket shape only).
    refilled_at: Instant,
    /// When the current window (or provider-imposed pause) ends.
    reset_at: Option<Instant>,
    /// Wall-clock mirror of `reset_at` for status reporting.
    reset_at_wall: Option<DateTime<Utc>>,
}

/// One limiter instance; shared by every client talking to the same
/// provider instance.
pub struct RateLimiter {
    shape: Shape,
    state: Mutex<State>,
}

impl RateLimiter {
    pub fn hourly(per_hour: u32, burst: u32) -> Self {
        Self {
            shape: Shape::Hourly { per_hour, burst },
            state: Mutex::new(State {
                tokens: f64::from(per_hour.saturating_add(burst)),
                refilled_at: Instant::now(),
                reset_at: None,
                reset_at_wall: None,
            }),
        }
    }

    pub fn bucket(per_second: u32, burst: u32) -> Self {
        let capacity = burst.max(1);
        Self {
            shape: Shape::Bucket { per_second, burst: capacity },
            state: Mutex::new(State {
                tokens: f64::from(capacity),
                refilled_at: Instant::now(),
                reset_at: None,
                reset_at_wall: None,
            }),
        }
    }

    /// Consumes `cost` tokens, waiting (cancellably) for budget if none is
    /// available.
    pub async fn acquire(&self, cancel: &CancellationToken, cost: u32) -> Result<(), AcquireError> {
        loop {
            let wait_until = {
                let mut state = self.state.lock_or_recover();
                self.refill(&mut state);

                if state.tokens >= f64::from(cost) {
                    state.tokens -= f64::from(cost);
                    return Ok(());
                }

                self.next_available(&state, cost)
            };

            tokio::select! {
                _ = tokio::time::sleep_until(wait_until) => {}
                _ = cancel.cancelled() => return Err(AcquireError::Cancelled),
            }
        }
    }

    /// Folds provider response headers back into the budget.
    ///
    /// `remaining` overrides the token count; `reset_at` pins the window
    /// end. Both are optional since not every response carries them.
    pub fn record_response(&self, remaining: Option<u64>, reset_at: Option<DateTime<Utc>>) {
        let mut state = self.state.lock_or_recover();

        if let Some(remaining) = remaining {
            state.tokens = remaining as f64;
        }

        if let Some(reset) = reset_at {
            let delta = (reset - Utc::now()).to_std().unwrap_or(Duration::ZERO);
            state.reset_at = Some(Instant::now() + delta);
            state.reset_at_wall = Some(reset);
        }
    }

    /// The current budget snapshot.
    pub fn budget(&self) -> RateBudget {
        let mut state = self.state.lock_or_recover();
        self.refill(&mut state);
        RateBudget {
            requests_remaining: state.tokens.max(0.0) as u64,
            window_reset_at: state.reset_at_wall,
            burst_tokens: match self.shape {
                Shape::Hourly { burst, .. } | Shape::Bucket { burst, .. } => burst,
            },
        }
    }

    fn refill(&self, state: &mut State) {
        let now = Instant::now();

        // A provider-imposed window reset trumps local refill accounting.
        if let Some(reset) = state.reset_at
            && now >= reset
        {
            state.reset_at = None;
            state.reset_at_wall = None;
            state.tokens = match self.shape {
                Shape::Hourly { per_hour, burst } => f64::from(per_hour.saturating_add(burst)),
                Shape::Bucket { burst, .. } => f64::from(burst),
            };
            state.refilled_at = now;
            return;
        }

        if let Shape::Bucket { per_second, burst } = self.shape
            && state.reset_at.is_none()
        {
            let elapsed = now.duration_since(state.refilled_at).as_secs_f64();
            state.tokens = (state.tokens + elapsed * f64::from(per_second)).min(f64::from(burst));
            state.refilled_at = now;
        }
    }

    fn next_available(&self, state: &State, cost: u32) -> Instant {
        if let Some(reset) = state.reset_at {
            return reset;
        }

        match self.shape {
            // Without a provider-reported reset we don't know where the
            // window boundary is; re-check shortly.
            Shape::Hourly { .. } => Instant::now() + Duration::from_secs(1),
            Shape::Bucket { per_second, .. } => {
                let deficit = (f64::from(cost) - state.tokens).max(0.0);
                let secs = if per_second == 0 {
                    1.0
                } else {
                    deficit / f64::from(per_second)
                };
                Instant::now() + Duration::from_secs_f64(secs.max(0.001))
            }
        }
    }
}

/// All limiters for the process, keyed by `(provider kind, instance)`.
pub struct LimiterRegistry {
    config: RateLimitConfig,
    limiters: Mutex<HashMap<(ProviderKind, String), std::sync::Arc<RateLimiter>>>,
}

impl LimiterRegistry {
    pub fn new(config: RateLimitConfig) -> Self {
        Self {
            config,
            limiters: Mutex::new(HashMap::new()),
        }
    }

    /// Returns (creating on first use) the limiter for an instance.
    pub fn get(&self, kind: ProviderKind, instance: &str) -> std::sync::Arc<RateLimiter> {
        let mut limiters = self.limiters.lock_or_recover();
        limiters
            .entry((kind, instance.to_string()))
            .or_insert_with(|| {
                std::sync::Arc::new(match kind {
                    ProviderKind::Github => RateLimiter::hourly(
                        self.config.github.requests_per_hour,
                        self.config.github.burst,
                    ),
                    ProviderKind::Gitlab => RateLimiter::bucket(
                        self.config.gitlab.requests_per_second,
                        self.config.gitlab.burst,
                    ),
                })
            })
            .clone()
    }

    /// Budget snapshots for every limiter created so far.
    pub fn budgets(&self) -> Vec<(ProviderKind, String, RateBudget)> {
        let limiters = self.limiters.lock_or_recover();
        limiters
            .iter()
            .map(|((kind, instance), limiter)| (*kind, instance.clone(), limiter.budget()))
            .collect()
    }
}

/// Mutex poisoning here only means a panic mid-update in another task;
/// limiter state is always internally consistent, so recover.
trait LockOrRecover<T> {
    fn lock_or_recover(&self) -> std::sync::MutexGuard<'_, T>;
}

impl<T> LockOrRecover<T> for Mutex<T> {
    fn lock_or_recover(&self) -> std::sync::MutexGuard<'_, T> {
        self.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}
