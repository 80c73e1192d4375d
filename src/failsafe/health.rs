//! Gateway health aggregation
//!
//! The other layers push counters into a shared [`HealthMonitor`]:
//! - admitted requests, their outcome and end-to-end latency
//! - exact / approximate cache hits, misses and tokens saved
//! - provider calls, tokens used and provider latency
//! - admission and circuit refusals
//!
//! [`HealthMonitor::snapshot`] derives rates and a status verdict on demand;
//! nothing here is persisted.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use tracing::{debug, error, warn};

use super::circuit_breaker::CircuitState;
use crate::config::HealthConfig;

/// Default capacity for latency histograms
const DEFAULT_HISTOGRAM_CAPACITY: usize = 1000;

/// Multiplier over a ceiling that counts as badly breached
const CRITICAL_BREACH_FACTOR: f64 = 2.0;

/// Overall health verdict
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthStatus {
    /// All thresholds respected
    Healthy,
    /// At least one threshold exceeded
    Degraded,
    /// A threshold badly breached
    Critical,
}

/// Severity of a recorded alert
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum AlertSeverity {
    /// Noteworthy but self-healing
    Warning,
    /// A failed operation
    Error,
    /// Service-wide impact
    Critical,
}

/// An event raised by one of the layers
#[derive(Debug, Clone, Serialize)]
pub struct Alert {
    /// Severity
    pub severity: AlertSeverity,
    /// Layer that raised it
    pub source: String,
    /// Human-readable description
    pub message: String,
    /// When it was raised
    pub timestamp: DateTime<Utc>,
}

/// State owned by other components that the verdict depends on
#[derive(Debug, Clone)]
pub struct HealthInputs {
    /// Policies with at least one exhausted window right now
    pub exceeded_policies: Vec<String>,
    /// Approximate bytes held by the in-process cache tier
    pub cache_memory_bytes: usize,
    /// Current circuit state
    pub circuit_state: CircuitState,
}

impl Default for HealthInputs {
    fn default() -> Self {
        Self {
            exceeded_policies: Vec::new(),
            cache_memory_bytes: 0,
            circuit_state: CircuitState::Closed,
        }
    }
}

/// Passive observer of all gateway layers
pub struct HealthMonitor {
    /// Verdict thresholds
    thresholds: HealthConfig,
    /// Price per 1000 tokens
    cost_per_1k_tokens: f64,
    /// Admitted generation requests
    requests: AtomicU64,
    /// Requests that ended in an error
    errors: AtomicU64,
    /// Exact cache hits
    exact_hits: AtomicU64,
    /// Approximate cache hits
    similar_hits: AtomicU64,
    /// Cache misses
    misses: AtomicU64,
    /// Calls that reached the provider
    provider_calls: AtomicU64,
    /// Provider calls that failed
    provider_failures: AtomicU64,
    /// Tokens spent on provider calls
    tokens_used: AtomicU64,
    /// Tokens served from cache instead of re-spent
    tokens_saved: AtomicU64,
    /// Admission refusals
    rate_limited: AtomicU64,
    /// Circuit refusals
    circuit_rejections: AtomicU64,
    /// End-to-end request latency
    request_latencies: RwLock<LatencyHistogram>,
    /// Provider call latency
    provider_latencies: RwLock<LatencyHistogram>,
    /// Recent alerts (bounded ring)
    alerts: Mutex<VecDeque<Alert>>,
}

impl HealthMonitor {
    /// Create a monitor with the given thresholds
    #[must_use]
    pub fn new(thresholds: HealthConfig, cost_per_1k_tokens: f64) -> Self {
        Self {
            alerts: Mutex::new(VecDeque::with_capacity(thresholds.max_alerts.min(1024))),
            thresholds,
            cost_per_1k_tokens,
            requests: AtomicU64::new(0),
            errors: AtomicU64::new(0),
            exact_hits: AtomicU64::new(0),
            similar_hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
            provider_calls: AtomicU64::new(0),
            provider_failures: AtomicU64::new(0),
            tokens_used: AtomicU64::new(0),
            tokens_saved: AtomicU64::new(0),
            rate_limited: AtomicU64::new(0),
            circuit_rejections: AtomicU64::new(0),
            request_latencies: RwLock::new(LatencyHistogram::new(DEFAULT_HISTOGRAM_CAPACITY)),
            provider_latencies: RwLock::new(LatencyHistogram::new(DEFAULT_HISTOGRAM_CAPACITY)),
        }
    }

    // ── Recording ────────────────────────────────────────────────────────────

    /// Record a finished (admitted) generation request
    pub fn record_request(&self, latency: Duration, success: bool) {
        self.requests.fetch_add(1, Ordering::Relaxed);
        self.request_latencies.write().record(latency);
        telemetry_metrics::counter!("genai_requests_total").increment(1);
        telemetry_metrics::histogram!("genai_request_duration_seconds")
            .record(latency.as_secs_f64());

        if !success {
            self.errors.fetch_add(1, Ordering::Relaxed);
            telemetry_metrics::counter!("genai_request_errors_total").increment(1);
        }
    }

    /// Record a cache hit that saved `tokens`
    pub fn record_cache_hit(&self, tokens: u32, approximate: bool) {
        if approximate {
            self.similar_hits.fetch_add(1, Ordering::Relaxed);
        } else {
            self.exact_hits.fetch_add(1, Ordering::Relaxed);
        }
        self.tokens_saved
            .fetch_add(u64::from(tokens), Ordering::Relaxed);
        telemetry_metrics::counter!(
            "genai_cache_hits_total",
            "kind" => if approximate { "similar" } else { "exact" }
        )
        .increment(1);
    }

    /// Record a cache miss
    pub fn record_cache_miss(&self) {
        self.misses.fetch_add(1, Ordering::Relaxed);
        telemetry_metrics::counter!("genai_cache_misses_total").increment(1);
    }

    /// Record a call that reached the provider
    pub fn record_provider_call(&self, latency: Duration, tokens: Option<u32>) {
        self.provider_calls.fetch_add(1, Ordering::Relaxed);
        self.provider_latencies.write().record(latency);
        telemetry_metrics::histogram!("genai_provider_duration_seconds")
            .record(latency.as_secs_f64());

        match tokens {
            Some(tokens) => {
                self.tokens_used
                    .fetch_add(u64::from(tokens), Ordering::Relaxed);
                telemetry_metrics::counter!("genai_tokens_used_total")
                    .increment(u64::from(tokens));
            }
            None => {
                self.provider_failures.fetch_add(1, Ordering::Relaxed);
                telemetry_metrics::counter!("genai_provider_failures_total").increment(1);
            }
        }
    }

    /// Record an admission refusal
    pub fn record_rate_limited(&self, policy: &str, retry_after_secs: u64) {
        self.rate_limited.fetch_add(1, Ordering::Relaxed);
        telemetry_metrics::counter!("genai_rate_limited_total", "policy" => policy.to_string())
            .increment(1);
        self.raise_alert(
            AlertSeverity::Warning,
            "rate_limiter",
            format!("Policy '{policy}' exceeded, retry after {retry_after_secs}s"),
        );
    }

    /// Record a call refused by the open circuit
    pub fn record_circuit_rejection(&self) {
        self.circuit_rejections.fetch_add(1, Ordering::Relaxed);
        telemetry_metrics::counter!("genai_circuit_rejections_total").increment(1);
    }

    /// Append an alert, dropping the oldest when the ring is full
    pub fn raise_alert(&self, severity: AlertSeverity, source: &str, message: impl Into<String>) {
        let message = message.into();
        match severity {
            AlertSeverity::Warning => debug!(source, %message, "Alert raised"),
            AlertSeverity::Error => warn!(source, %message, "Alert raised"),
            AlertSeverity::Critical => error!(source, %message, "Alert raised"),
        }

        if self.thresholds.max_alerts == 0 {
            return;
        }

        let mut alerts = self.alerts.lock();
        while alerts.len() >= self.thresholds.max_alerts {
            alerts.pop_front();
        }
        alerts.push_back(Alert {
            severity,
            source: source.to_string(),
            message,
            timestamp: Utc::now(),
        });
    }

    // ── Reading ──────────────────────────────────────────────────────────────

    /// Most recent alerts, newest last
    #[must_use]
    pub fn recent_alerts(&self, limit: usize) -> Vec<Alert> {
        let alerts = self.alerts.lock();
        let skip = alerts.len().saturating_sub(limit);
        alerts.iter().skip(skip).cloned().collect()
    }

    /// Tokens served from cache so far
    #[must_use]
    pub fn tokens_saved(&self) -> u64 {
        self.tokens_saved.load(Ordering::Relaxed)
    }

    /// Tokens spent on provider calls so far
    #[must_use]
    pub fn tokens_used(&self) -> u64 {
        self.tokens_used.load(Ordering::Relaxed)
    }

    /// Derive rates and a verdict from the recorded counters
    #[must_use]
    #[allow(clippy::cast_precision_loss)]
    pub fn snapshot(&self, inputs: &HealthInputs) -> HealthSnapshot {
        let requests = self.requests.load(Ordering::Relaxed);
        let errors = self.errors.load(Ordering::Relaxed);
        let exact_hits = self.exact_hits.load(Ordering::Relaxed);
        let similar_hits = self.similar_hits.load(Ordering::Relaxed);
        let misses = self.misses.load(Ordering::Relaxed);
        let tokens_used = self.tokens_used();

        let lookups = exact_hits + similar_hits + misses;
        let cache_hit_rate = ratio(exact_hits + similar_hits, lookups);
        let error_rate = ratio(errors, requests);

        let (average_response_time_ms, latency_p95_ms) = {
            let latencies = self.request_latencies.read();
            (
                latencies.mean().map_or(0.0, |d| d.as_secs_f64() * 1000.0),
                latencies
                    .percentile(0.95)
                    .map(|d| u64::try_from(d.as_millis()).unwrap_or(u64::MAX)),
            )
        };
        let provider_average_ms = self
            .provider_latencies
            .read()
            .mean()
            .map_or(0.0, |d| d.as_secs_f64() * 1000.0);

        let cost_estimate = tokens_used as f64 / 1000.0 * self.cost_per_1k_tokens;

        let (status, issues) = self.evaluate(error_rate, average_response_time_ms, inputs);

        HealthSnapshot {
            status,
            issues,
            total_requests: requests,
            errors,
            cache_hits: exact_hits + similar_hits,
            exact_hits,
            similar_hits,
            cache_misses: misses,
            cache_hit_rate,
            error_rate,
            average_response_time_ms,
            latency_p95_ms,
            provider_calls: self.provider_calls.load(Ordering::Relaxed),
            provider_failures: self.provider_failures.load(Ordering::Relaxed),
            provider_average_ms,
            tokens_used,
            tokens_saved: self.tokens_saved(),
            cost_estimate,
            rate_limited: self.rate_limited.load(Ordering::Relaxed),
            circuit_rejections: self.circuit_rejections.load(Ordering::Relaxed),
            circuit_state: inputs.circuit_state,
            exceeded_policies: inputs.exceeded_policies.clone(),
            cache_memory_bytes: inputs.cache_memory_bytes,
        }
    }

    #[allow(clippy::cast_precision_loss)]
    fn evaluate(
        &self,
        error_rate: f64,
        average_ms: f64,
        inputs: &HealthInputs,
    ) -> (HealthStatus, Vec<String>) {
        let t = &self.thresholds;
        let mut issues = Vec::new();
        let mut critical = false;
        let mut degraded = false;

        if error_rate > t.critical_error_rate {
            critical = true;
            issues.push(format!("Error rate {:.1}% is critical", error_rate * 100.0));
        } else if error_rate > t.degraded_error_rate {
            degraded = true;
            issues.push(format!("Error rate {:.1}% is elevated", error_rate * 100.0));
        }

        let ceiling_ms = t.max_average_response_time.as_secs_f64() * 1000.0;
        if ceiling_ms > 0.0 && average_ms > ceiling_ms {
            if average_ms > ceiling_ms * CRITICAL_BREACH_FACTOR {
                critical = true;
            } else {
                degraded = true;
            }
            issues.push(format!(
                "Average response time {average_ms:.0}ms exceeds {ceiling_ms:.0}ms"
            ));
        }

        let memory = inputs.cache_memory_bytes as f64;
        let memory_ceiling = t.max_memory_bytes as f64;
        if t.max_memory_bytes > 0 && memory > memory_ceiling {
            if memory > memory_ceiling * CRITICAL_BREACH_FACTOR {
                critical = true;
            } else {
                degraded = true;
            }
            issues.push(format!(
                "Cache memory {} bytes exceeds {} bytes",
                inputs.cache_memory_bytes, t.max_memory_bytes
            ));
        }

        if !inputs.exceeded_policies.is_empty() {
            degraded = true;
            issues.push(format!(
                "Rate limit exceeded for: {}",
                inputs.exceeded_policies.join(", ")
            ));
        }

        match inputs.circuit_state {
            CircuitState::Open => {
                degraded = true;
                issues.push("Circuit breaker is open".to_string());
            }
            CircuitState::HalfOpen => {
                degraded = true;
                issues.push("Circuit breaker is testing recovery".to_string());
            }
            CircuitState::Closed => {}
        }

        let status = if critical {
            HealthStatus::Critical
        } else if degraded {
            HealthStatus::Degraded
        } else {
            HealthStatus::Healthy
        };
        (status, issues)
    }
}

#[allow(clippy::cast_precision_loss)]
fn ratio(numerator: u64, denominator: u64) -> f64 {
    if denominator == 0 {
        0.0
    } else {
        numerator as f64 / denominator as f64
    }
}

/// Derived health view, recomputed on every call
#[derive(Debug, Clone, Serialize)]
pub struct HealthSnapshot {
    /// Overall verdict
    pub status: HealthStatus,
    /// Human-readable reasons for a non-healthy verdict
    pub issues: Vec<String>,
    /// Admitted generation requests
    pub total_requests: u64,
    /// Requests that ended in an error
    pub errors: u64,
    /// Exact + approximate cache hits
    pub cache_hits: u64,
    /// Exact cache hits
    pub exact_hits: u64,
    /// Approximate cache hits
    pub similar_hits: u64,
    /// Cache misses
    pub cache_misses: u64,
    /// Hits over lookups (0.0-1.0)
    pub cache_hit_rate: f64,
    /// Errors over requests (0.0-1.0)
    pub error_rate: f64,
    /// Mean end-to-end latency
    pub average_response_time_ms: f64,
    /// 95th percentile end-to-end latency
    pub latency_p95_ms: Option<u64>,
    /// Calls that reached the provider
    pub provider_calls: u64,
    /// Provider calls that failed
    pub provider_failures: u64,
    /// Mean provider latency
    pub provider_average_ms: f64,
    /// Tokens spent
    pub tokens_used: u64,
    /// Tokens served from cache
    pub tokens_saved: u64,
    /// Tokens spent times unit price
    pub cost_estimate: f64,
    /// Admission refusals
    pub rate_limited: u64,
    /// Circuit refusals
    pub circuit_rejections: u64,
    /// Circuit state at snapshot time
    pub circuit_state: CircuitState,
    /// Policies currently exhausted
    pub exceeded_policies: Vec<String>,
    /// Approximate in-process cache size
    pub cache_memory_bytes: usize,
}

/// Latency histogram for mean and percentile calculation
struct LatencyHistogram {
    /// Recent latency samples (in microseconds), oldest first
    samples: VecDeque<u64>,
    /// Maximum number of samples to keep
    capacity: usize,
}

impl LatencyHistogram {
    fn new(capacity: usize) -> Self {
        Self {
            samples: VecDeque::with_capacity(capacity),
            capacity,
        }
    }

    fn record(&mut self, latency: Duration) {
        let micros = u64::try_from(latency.as_micros()).unwrap_or(u64::MAX);
        if self.samples.len() >= self.capacity {
            self.samples.pop_front();
        }
        self.samples.push_back(micros);
    }

    fn mean(&self) -> Option<Duration> {
        if self.samples.is_empty() {
            return None;
        }
        let total: u128 = self.samples.iter().map(|&s| u128::from(s)).sum();
        let mean = total / self.samples.len() as u128;
        Some(Duration::from_micros(u64::try_from(mean).unwrap_or(u64::MAX)))
    }

    /// Calculate percentile (0.0 to 1.0)
    #[allow(
        clippy::cast_precision_loss,
        clippy::cast_possible_truncation,
        clippy::cast_sign_loss
    )]
    fn percentile(&self, p: f64) -> Option<Duration> {
        if self.samples.is_empty() {
            return None;
        }
        let mut sorted: Vec<u64> = self.samples.iter().copied().collect();
        sorted.sort_unstable();

        let index = ((sorted.len() as f64) * p).floor() as usize;
        let index = index.min(sorted.len() - 1);
        Some(Duration::from_micros(sorted[index]))
    }
}
