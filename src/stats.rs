//! Usage statistics for the gateway
//!
//! Counts provider-consuming generations per UTC day and per model. Cached
//! results are not counted: they spend no quota.

use std::sync::atomic::{AtomicU64, Ordering};

use chrono::{DateTime, NaiveDate, Utc};
use dashmap::DashMap;
use parking_lot::Mutex;
use serde::Serialize;

use crate::cache::CacheStatsSnapshot;
use crate::failsafe::CircuitStats;

/// Number of models listed in a snapshot
const TOP_MODELS: usize = 5;

/// Usage statistics for the gateway
pub struct UsageStats {
    /// Provider requests allowed per UTC day
    daily_quota: u64,
    /// Day the daily counter belongs to
    day: Mutex<NaiveDate>,
    /// Provider requests on `day`
    requests_today: AtomicU64,
    /// Tokens consumed since start
    tokens_used: AtomicU64,
    /// Per-model request counts
    model_usage: DashMap<String, AtomicU64>,
}

impl UsageStats {
    /// Create new statistics tracker
    #[must_use]
    pub fn new(daily_quota: u64) -> Self {
        Self {
            daily_quota,
            day: Mutex::new(Utc::now().date_naive()),
            requests_today: AtomicU64::new(0),
            tokens_used: AtomicU64::new(0),
            model_usage: DashMap::new(),
        }
    }

    /// Record a provider-served generation
    pub fn record_generation(&self, model: &str, tokens: u32) {
        self.record_generation_at(model, tokens, Utc::now());
    }

    fn record_generation_at(&self, model: &str, tokens: u32, now: DateTime<Utc>) {
        self.roll_over(now);
        self.requests_today.fetch_add(1, Ordering::Relaxed);
        self.tokens_used
            .fetch_add(u64::from(tokens), Ordering::Relaxed);
        self.model_usage
            .entry(model.to_string())
            .or_insert_with(|| AtomicU64::new(0))
            .fetch_add(1, Ordering::Relaxed);
    }

    /// Reset the daily counter when the UTC date has changed
    fn roll_over(&self, now: DateTime<Utc>) {
        let today = now.date_naive();
        let mut day = self.day.lock();
        if *day != today {
            *day = today;
            self.requests_today.store(0, Ordering::Relaxed);
        }
    }

    /// Provider requests made today
    pub fn requests_today(&self) -> u64 {
        self.roll_over(Utc::now());
        self.requests_today.load(Ordering::Relaxed)
    }

    /// Requests left in today's quota
    pub fn remaining_quota(&self) -> u64 {
        self.daily_quota.saturating_sub(self.requests_today())
    }

    /// Most-used models, busiest first
    pub fn top_models(&self) -> Vec<ModelUsage> {
        let mut models: Vec<ModelUsage> = self
            .model_usage
            .iter()
            .map(|entry| ModelUsage {
                model: entry.key().clone(),
                requests: entry.value().load(Ordering::Relaxed),
            })
            .collect();
        models.sort_by(|a, b| b.requests.cmp(&a.requests).then_with(|| a.model.cmp(&b.model)));
        models.truncate(TOP_MODELS);
        models
    }

    /// Get snapshot combining usage with cache and circuit state
    pub fn snapshot(&self, cache: CacheStatsSnapshot, circuit_breaker: CircuitStats) -> UsageSnapshot {
        let requests_today = self.requests_today();
        UsageSnapshot {
            requests_today,
            tokens_used: self.tokens_used.load(Ordering::Relaxed),
            daily_quota: self.daily_quota,
            remaining_quota: self.daily_quota.saturating_sub(requests_today),
            top_models: self.top_models(),
            cache,
            circuit_breaker,
        }
    }
}

/// Snapshot of usage statistics
#[derive(Debug, Clone, Serialize)]
pub struct UsageSnapshot {
    /// Provider requests made today (UTC)
    pub requests_today: u64,
    /// Tokens consumed since start
    pub tokens_used: u64,
    /// Configured daily quota
    pub daily_quota: u64,
    /// Requests left today
    pub remaining_quota: u64,
    /// Busiest models
    pub top_models: Vec<ModelUsage>,
    /// Result cache statistics
    pub cache: CacheStatsSnapshot,
    /// Circuit breaker state
    pub circuit_breaker: CircuitStats,
}

/// Per-model request count
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ModelUsage {
    /// Model name
    pub model: String,
    /// Provider requests served by this model
    pub requests: u64,
}
