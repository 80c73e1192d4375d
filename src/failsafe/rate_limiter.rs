//! Admission limiting
//!
//! One fixed window per `(policy, identifier)` pair. A window opens on the
//! first call, admits `max_requests + burst_allowance` calls, and is replaced
//! by a fresh one on the first call after it expires.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use serde::Serialize;
use tokio::time::Instant;
use tracing::{debug, warn};

use super::health::HealthMonitor;
use crate::config::{RateLimitConfig, RateLimitPolicy};
use crate::{Error, Result};

/// Outcome of an admission check
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AdmissionDecision {
    /// The call may proceed
    Admitted {
        /// Calls left in this window, burst included
        remaining: u32,
        /// Time until the window resets
        reset_after: Duration,
    },
    /// The call was refused
    Rejected {
        /// Whole seconds until the window resets (rounded up)
        retry_after_secs: u64,
    },
}

impl AdmissionDecision {
    /// Whether the call may proceed
    #[must_use]
    pub fn is_admitted(&self) -> bool {
        matches!(self, Self::Admitted { .. })
    }

    /// Retry hint for a refusal
    #[must_use]
    pub fn retry_after_secs(&self) -> Option<u64> {
        match self {
            Self::Admitted { .. } => None,
            Self::Rejected { retry_after_secs } => Some(*retry_after_secs),
        }
    }
}

#[derive(Debug, Clone, Copy)]
struct Window {
    count: u32,
    reset_at: Instant,
}

/// Per-key fixed-window admission limiter
pub struct AdmissionLimiter {
    enabled: bool,
    policies: HashMap<String, RateLimitPolicy>,
    windows: DashMap<(String, String), Window>,
    rejections: AtomicU64,
    monitor: Option<Arc<HealthMonitor>>,
}

impl AdmissionLimiter {
    /// Create a limiter from configuration
    #[must_use]
    pub fn new(config: &RateLimitConfig) -> Self {
        Self {
            enabled: config.enabled,
            policies: config.policies.clone(),
            windows: DashMap::new(),
            rejections: AtomicU64::new(0),
            monitor: None,
        }
    }

    /// Report rejections to a health monitor
    #[must_use]
    pub fn with_monitor(mut self, monitor: Arc<HealthMonitor>) -> Self {
        self.monitor = Some(monitor);
        self
    }

    /// Look up a policy by name
    pub fn policy(&self, name: &str) -> Option<&RateLimitPolicy> {
        self.policies.get(name)
    }

    /// Check and count one call for `(policy, identifier)`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::UnknownPolicy`] when `policy` is not configured.
    /// A refusal is not an error; it is reported as
    /// [`AdmissionDecision::Rejected`].
    pub fn check_limit(&self, policy: &str, identifier: &str) -> Result<AdmissionDecision> {
        let rules = self
            .policies
            .get(policy)
            .ok_or_else(|| Error::UnknownPolicy(policy.to_string()))?;
        let capacity = rules.capacity();

        if !self.enabled {
            return Ok(AdmissionDecision::Admitted {
                remaining: capacity,
                reset_after: rules.window,
            });
        }

        let now = Instant::now();
        let fresh = Window {
            count: 1,
            reset_at: now + rules.window,
        };
        let mut entry = match self
            .windows
            .entry((policy.to_string(), identifier.to_string()))
        {
            Entry::Vacant(vacant) => {
                vacant.insert(fresh);
                debug!(policy, identifier, "Admission window started");
                return Ok(AdmissionDecision::Admitted {
                    remaining: capacity.saturating_sub(1),
                    reset_after: rules.window,
                });
            }
            Entry::Occupied(occupied) => occupied.into_ref(),
        };
        let window = entry.value_mut();

        if now > window.reset_at {
            *window = fresh;
            debug!(policy, identifier, "Admission window restarted");
            return Ok(AdmissionDecision::Admitted {
                remaining: capacity.saturating_sub(1),
                reset_after: rules.window,
            });
        }

        if window.count < capacity {
            window.count += 1;
            return Ok(AdmissionDecision::Admitted {
                remaining: capacity - window.count,
                reset_after: window.reset_at - now,
            });
        }

        let retry_after_secs =
            u64::try_from((window.reset_at - now).as_millis().div_ceil(1000)).unwrap_or(u64::MAX);
        drop(entry);

        self.rejections.fetch_add(1, Ordering::Relaxed);
        if let Some(monitor) = &self.monitor {
            monitor.record_rate_limited(policy, retry_after_secs);
        }
        warn!(policy, identifier, retry_after_secs, "Admission refused");

        Ok(AdmissionDecision::Rejected { retry_after_secs })
    }

    /// Refund one call for a success that consumed no provider capacity.
    ///
    /// No-op unless the policy has `skip_successful` set and the window is
    /// still current.
    pub fn record_success(&self, policy: &str, identifier: &str) {
        let Some(rules) = self.policies.get(policy) else {
            return;
        };
        if !rules.skip_successful {
            return;
        }
        let now = Instant::now();
        if let Some(mut window) = self
            .windows
            .get_mut(&(policy.to_string(), identifier.to_string()))
        {
            if now <= window.reset_at && window.count > 0 {
                window.count -= 1;
                debug!(policy, identifier, count = window.count, "Admission refunded");
            }
        }
    }

    /// Policies with at least one live window at capacity
    #[must_use]
    pub fn exceeded_policies(&self) -> Vec<String> {
        let now = Instant::now();
        let mut exceeded: Vec<String> = self
            .windows
            .iter()
            .filter(|entry| {
                let (policy, _) = entry.key();
                let window = entry.value();
                now <= window.reset_at
                    && self
                        .policies
                        .get(policy)
                        .is_some_and(|rules| window.count >= rules.capacity())
            })
            .map(|entry| entry.key().0.clone())
            .collect();
        exceeded.sort();
        exceeded.dedup();
        exceeded
    }

    /// Drop expired windows, returning how many were removed
    pub fn cleanup_expired(&self) -> usize {
        let now = Instant::now();
        let before = self.windows.len();
        self.windows.retain(|_, window| now <= window.reset_at);
        before.saturating_sub(self.windows.len())
    }

    /// Snapshot for diagnostics
    #[must_use]
    pub fn stats(&self) -> LimiterStats {
        let mut policies: Vec<String> = self.policies.keys().cloned().collect();
        policies.sort();
        LimiterStats {
            enabled: self.enabled,
            policies,
            active_windows: self.windows.len(),
            rejections: self.rejections.load(Ordering::Relaxed),
        }
    }
}

/// Admission limiter snapshot
#[derive(Debug, Clone, Serialize)]
pub struct LimiterStats {
    /// Whether limits are enforced
    pub enabled: bool,
    /// Configured policy names
    pub policies: Vec<String>,
    /// Windows currently tracked (expired ones included until swept)
    pub active_windows: usize,
    /// Calls refused over the lifetime
    pub rejections: u64,
}
