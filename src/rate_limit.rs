//! Per-client sliding-window rate limiting.
//!
//! Each client key owns the timestamps of its permitted requests inside
//! the trailing window. A request is allowed while fewer than `limit`
//! timestamps remain; only allowed requests are recorded, so denials never
//! consume quota. Old timestamps are dropped lazily on each check.
//!
//! State lives behind [`RateLimitStore`] so several instances can share a
//! key-value backend; [`InMemoryRateLimitStore`] is the single-process
//! default.

use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, PoisonError};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RateDecision {
    pub allowed: bool,
    /// Requests left in the current window after this decision.
    pub remaining: u32,
    /// Set on denial: how long until the oldest request leaves the window.
    pub retry_after: Option<Duration>,
}

#[async_trait]
pub trait RateLimitStore: Send + Sync {
    /// Evict entries older than `now - window` for `key`, then record `now`
    /// if fewer than `limit` entries remain. Must be atomic per key.
    async fn try_acquire(
        &self,
        key: &str,
        now: DateTime<Utc>,
        window: Duration,
        limit: u32,
    ) -> Result<RateDecision>;

    /// Number of tracked client keys.
    async fn tracked_keys(&self) -> Result<usize>;
}

#[derive(Default)]
pub struct InMemoryRateLimitStore {
    entries: Mutex<HashMap<String, VecDeque<DateTime<Utc>>>>,
}

impl InMemoryRateLimitStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl RateLimitStore for InMemoryRateLimitStore {
    async fn try_acquire(
        &self,
        key: &str,
        now: DateTime<Utc>,
        window: Duration,
        limit: u32,
    ) -> Result<RateDecision> {
        let mut entries = self.entries.lock().unwrap_or_else(PoisonError::into_inner);
        let cutoff = now - window;

        // Drop idle keys so the map does not grow with every client ever seen.
        entries.retain(|k, stamps| {
            if k != key {
                while stamps.front().is_some_and(|t| *t <= cutoff) {
                    stamps.pop_front();
                }
            }
            k == key || !stamps.is_empty()
        });

        let stamps = entries.entry(key.to_string()).or_default();
        while stamps.front().is_some_and(|t| *t <= cutoff) {
            stamps.pop_front();
        }

        let used = stamps.len() as u32;
        if used < limit {
            stamps.push_back(now);
            return Ok(RateDecision {
                allowed: true,
                remaining: limit - used - 1,
                retry_after: None,
            });
        }

        let retry_after = stamps
            .front()
            .map(|oldest| (*oldest + window) - now)
            .filter(|d| *d > Duration::zero())
            .unwrap_or_else(|| Duration::seconds(1));

        Ok(RateDecision {
            allowed: false,
            remaining: 0,
            retry_after: Some(retry_after),
        })
    }

    async fn tracked_keys(&self) -> Result<usize> {
        Ok(self
            .entries
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len())
    }
}

/// Request quota shared by every route behind the rate-limit middleware.
#[derive(Clone)]
pub struct ClientRateLimiter {
    store: Arc<dyn RateLimitStore>,
    limit: u32,
    window: Duration,
}

impl ClientRateLimiter {
    pub fn new(store: Arc<dyn RateLimitStore>, limit: u32, window: std::time::Duration) -> Self {
        Self {
            store,
            limit,
            window: Duration::from_std(window).unwrap_or_else(|_| Duration::hours(1)),
        }
    }

    pub fn limit(&self) -> u32 {
        self.limit
    }

    pub async fn allow(&self, client: &str) -> Result<RateDecision> {
        self.allow_at(client, Utc::now()).await
    }

    pub async fn allow_at(&self, client: &str, now: DateTime<Utc>) -> Result<RateDecision> {
        self.store
            .try_acquire(client, now, self.window, self.limit)
            .await
    }
}
