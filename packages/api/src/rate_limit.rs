//! Per-identity admission control for submissions.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use db::{DbError, RateCounterRepository};
use jobs_core::JobEvent;
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

/// How requests are counted against the window.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WindowStrategy {
    /// Counters reset at every multiple of the window length.
    #[default]
    Fixed,
    /// The previous window's count is weighted by how much of it still
    /// overlaps the trailing window.
    Sliding,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RateLimitConfig {
    pub enabled: bool,
    /// Admitted submissions per identity and window.
    pub limit: u64,
    pub window_secs: u64,
    pub strategy: WindowStrategy,
    /// Admit requests when the counter store cannot be reached.
    pub fail_open: bool,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            limit: 1000,
            window_secs: 24 * 60 * 60,
            strategy: WindowStrategy::Fixed,
            fail_open: true,
        }
    }
}

impl RateLimitConfig {
    pub fn disabled() -> Self {
        Self {
            enabled: false,
            ..Self::default()
        }
    }

    pub fn fixed(limit: u64, window_secs: u64) -> Self {
        Self {
            enabled: true,
            limit,
            window_secs,
            ..Self::default()
        }
    }

    pub fn with_strategy(mut self, strategy: WindowStrategy) -> Self {
        self.strategy = strategy;
        self
    }

    pub fn with_fail_open(mut self, fail_open: bool) -> Self {
        self.fail_open = fail_open;
        self
    }
}

/// Future type returned by counter stores.
pub type CounterFuture<'a, T> = Pin<Box<dyn Future<Output = Result<T, DbError>> + Send + 'a>>;

/// Shared counters the limiter keeps per identity and window start.
pub trait CounterStore: Send + Sync + 'static {
    /// Atomically add one and return the new count.
    fn increment<'a>(&'a self, identity: &'a str, window_start: i64) -> CounterFuture<'a, u64>;

    fn count<'a>(&'a self, identity: &'a str, window_start: i64) -> CounterFuture<'a, u64>;

    /// Drop counters of windows that started before `window_start`.
    fn purge_before(&self, window_start: i64) -> CounterFuture<'_, ()>;
}

impl CounterStore for RateCounterRepository {
    fn increment<'a>(&'a self, identity: &'a str, window_start: i64) -> CounterFuture<'a, u64> {
        Box::pin(RateCounterRepository::increment(self, identity, window_start))
    }

    fn count<'a>(&'a self, identity: &'a str, window_start: i64) -> CounterFuture<'a, u64> {
        Box::pin(self.get(identity, window_start))
    }

    fn purge_before(&self, window_start: i64) -> CounterFuture<'_, ()> {
        Box::pin(RateCounterRepository::purge_before(self, window_start))
    }
}

/// Windowed limiter backed by a [`CounterStore`].
pub struct WindowLimiter {
    store: Arc<dyn CounterStore>,
    limit: u64,
    window_secs: i64,
    strategy: WindowStrategy,
    fail_open: bool,
    events: Option<broadcast::Sender<JobEvent>>,
}

impl WindowLimiter {
    fn window_start(&self, now: DateTime<Utc>) -> i64 {
        now.timestamp().div_euclid(self.window_secs) * self.window_secs
    }

    async fn check(&self, identity: &str, now: DateTime<Utc>) -> Result<bool, DbError> {
        let start = self.window_start(now);
        let current = self.store.increment(identity, start).await?;

        match self.strategy {
            WindowStrategy::Fixed => Ok(current <= self.limit),
            WindowStrategy::Sliding => {
                let previous = self.store.count(identity, start - self.window_secs).await?;
                let elapsed = now.timestamp() - start;
                let overlap = (self.window_secs - elapsed) as f64 / self.window_secs as f64;
                let estimate = previous as f64 * overlap + current as f64;
                Ok(estimate <= self.limit as f64)
            }
        }
    }
}

/// Admission control for submissions.
pub enum RateLimiter {
    Disabled,
    Enabled(WindowLimiter),
}

impl RateLimiter {
    /// Build a limiter from config. A disabled config never touches `store`.
    pub fn new(config: &RateLimitConfig, store: Arc<dyn CounterStore>) -> Self {
        if !config.enabled {
            return RateLimiter::Disabled;
        }
        RateLimiter::Enabled(WindowLimiter {
            store,
            limit: config.limit,
            window_secs: i64::try_from(config.window_secs.max(1)).unwrap_or(i64::MAX),
            strategy: config.strategy,
            fail_open: config.fail_open,
            events: None,
        })
    }

    pub fn disabled() -> Self {
        RateLimiter::Disabled
    }

    pub fn with_events(mut self, events: broadcast::Sender<JobEvent>) -> Self {
        if let RateLimiter::Enabled(limiter) = &mut self {
            limiter.events = Some(events);
        }
        self
    }

    pub fn is_enabled(&self) -> bool {
        matches!(self, RateLimiter::Enabled(_))
    }

    /// Count a request for `identity` and decide whether to admit it.
    pub async fn allow(&self, identity: &str) -> bool {
        self.allow_at(identity, Utc::now()).await
    }

    pub async fn allow_at(&self, identity: &str, now: DateTime<Utc>) -> bool {
        let limiter = match self {
            RateLimiter::Disabled => return true,
            RateLimiter::Enabled(limiter) => limiter,
        };

        match limiter.check(identity, now).await {
            Ok(allowed) => {
                if !allowed {
                    tracing::debug!("Rate limit reached for {}", identity);
                }
                allowed
            }
            Err(err) => {
                let admitted = limiter.fail_open;
                tracing::warn!(
                    "Rate limit store unavailable for {}, {}: {}",
                    identity,
                    if admitted { "admitting" } else { "rejecting" },
                    err
                );
                if let Some(events) = &limiter.events {
                    let _ = events.send(JobEvent::RateLimiterUnavailable {
                        identity: identity.to_string(),
                        admitted,
                        error: err.to_string(),
                        timestamp: now,
                    });
                }
                admitted
            }
        }
    }

    /// Remove counters that no longer affect any decision.
    pub async fn purge_expired(&self, now: DateTime<Utc>) -> Result<(), DbError> {
        match self {
            RateLimiter::Disabled => Ok(()),
            RateLimiter::Enabled(limiter) => {
                let keep_from = limiter.window_start(now) - limiter.window_secs;
                limiter.store.purge_before(keep_from).await
            }
        }
    }
}
