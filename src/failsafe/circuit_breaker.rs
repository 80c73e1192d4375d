//! Circuit breaker implementation
//!
//! Failures are kept in a sliding window (`monitoring_window`); the circuit
//! opens once the window holds `failure_threshold` of them. Recovery is
//! detected lazily: the first call after `recovery_timeout` has elapsed since
//! the last failure moves the circuit to half-open and is let through as a
//! probe. No timers are involved.

use std::collections::VecDeque;
use std::future::Future;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use gateway_core::{GenerationRequest, GenerationResult};
use parking_lot::Mutex;
use serde::Serialize;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use super::health::{AlertSeverity, HealthMonitor};
use crate::config::CircuitBreakerConfig;
use crate::provider::GenerationClient;
use crate::stats::UsageStats;
use crate::{Error, Result};

/// Circuit breaker state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CircuitState {
    /// Circuit is closed (allowing requests)
    Closed,
    /// Circuit is open (blocking requests)
    Open,
    /// Circuit is half-open (allowing limited requests to test)
    HalfOpen,
}

impl std::fmt::Display for CircuitState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            Self::Closed => "closed",
            Self::Open => "open",
            Self::HalfOpen => "half-open",
        })
    }
}

/// Mutable breaker state, guarded by one lock
struct Inner {
    state: CircuitState,
    /// Failure timestamps inside the monitoring window, oldest first
    failures: VecDeque<Instant>,
    /// Successes in the current half-open episode
    half_open_successes: u32,
    /// Probes currently running in the current half-open episode
    probes_in_flight: u32,
    /// Incremented on every entry into half-open
    episode: u64,
    last_failure: Option<Instant>,
    last_success: Option<Instant>,
}

impl Inner {
    fn prune(&mut self, now: Instant, window: Duration) {
        while let Some(&oldest) = self.failures.front() {
            if now.duration_since(oldest) > window {
                self.failures.pop_front();
            } else {
                break;
            }
        }
    }
}

/// Circuit breaker guarding the generation provider
pub struct CircuitBreaker {
    /// Provider name
    name: String,
    /// Configuration
    enabled: bool,
    failure_threshold: u32,
    success_threshold: u32,
    recovery_timeout: Duration,
    monitoring_window: Duration,
    half_open_max_probes: u32,
    /// State
    inner: Mutex<Inner>,
    /// Lifetime counters
    total_calls: AtomicU64,
    total_failures: AtomicU64,
    total_rejections: AtomicU64,
    /// Optional health sink
    monitor: Option<Arc<HealthMonitor>>,
}

/// Admission ticket returned by [`CircuitBreaker::admit`].
///
/// Outcomes reported through the ticket are attributed to the half-open
/// episode it was granted in; a call that outlives its episode no longer
/// moves the state machine. The half-open slot is released on drop, so a
/// cancelled call never leaks capacity.
pub struct Admission<'a> {
    breaker: &'a CircuitBreaker,
    /// Half-open episode current at admission
    episode: u64,
    /// Whether this call holds a half-open slot
    holds_slot: bool,
}

impl Admission<'_> {
    /// Report that the admitted call succeeded
    pub fn record_success(&self) {
        self.breaker.on_success(Some(self));
    }

    /// Report that the admitted call failed
    pub fn record_failure(&self) {
        self.breaker.on_failure(Some(self));
    }

    /// Whether this ticket holds a slot in the episode `inner` is in
    fn is_current_trial(&self, inner: &Inner) -> bool {
        self.holds_slot && inner.state == CircuitState::HalfOpen && inner.episode == self.episode
    }
}

impl Drop for Admission<'_> {
    fn drop(&mut self) {
        if self.holds_slot {
            let mut inner = self.breaker.inner.lock();
            if inner.episode == self.episode {
                inner.probes_in_flight = inner.probes_in_flight.saturating_sub(1);
            }
        }
    }
}

impl CircuitBreaker {
    /// Create a new circuit breaker
    #[must_use]
    pub fn new(name: &str, config: &CircuitBreakerConfig) -> Self {
        Self {
            name: name.to_string(),
            enabled: config.enabled,
            failure_threshold: config.failure_threshold.max(1),
            success_threshold: config.success_threshold.max(1),
            recovery_timeout: config.recovery_timeout,
            monitoring_window: config.monitoring_window,
            half_open_max_probes: config.half_open_max_probes.max(1),
            inner: Mutex::new(Inner {
                state: CircuitState::Closed,
                failures: VecDeque::new(),
                half_open_successes: 0,
                probes_in_flight: 0,
                episode: 0,
                last_failure: None,
                last_success: None,
            }),
            total_calls: AtomicU64::new(0),
            total_failures: AtomicU64::new(0),
            total_rejections: AtomicU64::new(0),
            monitor: None,
        }
    }

    /// Report transitions and refusals to a health monitor
    #[must_use]
    pub fn with_monitor(mut self, monitor: Arc<HealthMonitor>) -> Self {
        self.monitor = Some(monitor);
        self
    }

    /// Run `f` under the breaker.
    ///
    /// Only errors for which [`Error::counts_as_provider_failure`] holds are
    /// recorded as failures; other errors pass through without touching the
    /// state machine.
    ///
    /// # Errors
    ///
    /// Returns [`Error::CircuitOpen`] without calling `f` when the circuit
    /// refuses the call, otherwise whatever `f` returns.
    pub async fn execute<F, Fut, T>(&self, f: F) -> Result<T>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let admission = self.admit()?;
        let result = f().await;
        match &result {
            Ok(_) => admission.record_success(),
            Err(e) if e.counts_as_provider_failure() => admission.record_failure(),
            Err(e) => debug!(provider = %self.name, error = %e, "Non-provider error, state unchanged"),
        }
        drop(admission);
        result
    }

    /// Probe the provider through the breaker; the outcome feeds the state machine
    pub async fn is_available<F, Fut>(&self, probe: F) -> bool
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<()>>,
    {
        self.execute(probe).await.is_ok()
    }

    /// Decide whether a call may proceed.
    ///
    /// # Errors
    ///
    /// Returns [`Error::CircuitOpen`] carrying the retry hint when refused.
    #[tracing::instrument(skip(self), fields(provider = %self.name))]
    pub fn admit(&self) -> Result<Admission<'_>> {
        self.total_calls.fetch_add(1, Ordering::Relaxed);
        if !self.enabled {
            return Ok(Admission {
                breaker: self,
                episode: 0,
                holds_slot: false,
            });
        }

        let now = Instant::now();
        let mut inner = self.inner.lock();

        match inner.state {
            CircuitState::Closed => {
                tracing::trace!("Circuit closed, allowing request");
                Ok(Admission {
                    breaker: self,
                    episode: inner.episode,
                    holds_slot: false,
                })
            }
            CircuitState::Open => {
                let elapsed = inner
                    .last_failure
                    .map_or(self.recovery_timeout, |t| now.duration_since(t));
                if elapsed >= self.recovery_timeout {
                    debug!("Recovery timeout elapsed, transitioning to half-open");
                    self.transition(&mut inner, CircuitState::HalfOpen, now);
                    inner.probes_in_flight += 1;
                    Ok(Admission {
                        breaker: self,
                        episode: inner.episode,
                        holds_slot: true,
                    })
                } else {
                    drop(inner);
                    Err(self.reject(self.recovery_timeout - elapsed))
                }
            }
            CircuitState::HalfOpen => {
                if inner.probes_in_flight < self.half_open_max_probes {
                    debug!("Circuit half-open, allowing probe request");
                    inner.probes_in_flight += 1;
                    Ok(Admission {
                        breaker: self,
                        episode: inner.episode,
                        holds_slot: true,
                    })
                } else {
                    drop(inner);
                    Err(self.reject(Duration::ZERO))
                }
            }
        }
    }

    fn reject(&self, retry_after: Duration) -> Error {
        self.total_rejections.fetch_add(1, Ordering::Relaxed);
        if let Some(monitor) = &self.monitor {
            monitor.record_circuit_rejection();
        }
        warn!(
            provider = %self.name,
            retry_after_ms = u64::try_from(retry_after.as_millis()).unwrap_or(u64::MAX),
            "Circuit open, rejecting request"
        );
        Error::CircuitOpen { retry_after }
    }

    /// Record a successful call not tied to an [`Admission`]
    pub fn record_success(&self) {
        self.on_success(None);
    }

    /// Record a failed call not tied to an [`Admission`]
    pub fn record_failure(&self) {
        self.on_failure(None);
    }

    #[tracing::instrument(skip_all, fields(provider = %self.name))]
    fn on_success(&self, admission: Option<&Admission<'_>>) {
        if !self.enabled {
            return;
        }
        let now = Instant::now();
        let mut inner = self.inner.lock();
        inner.last_success = Some(now);

        match inner.state {
            CircuitState::Closed => {
                tracing::trace!("Success in closed state");
            }
            CircuitState::HalfOpen => {
                if admission.is_some_and(|a| !a.is_current_trial(&inner)) {
                    debug!("Success from an earlier episode, ignored");
                    return;
                }
                inner.half_open_successes += 1;
                debug!(
                    successes = inner.half_open_successes,
                    threshold = self.success_threshold,
                    "Success in half-open state"
                );
                if inner.half_open_successes >= self.success_threshold {
                    self.transition(&mut inner, CircuitState::Closed, now);
                }
            }
            CircuitState::Open => {
                tracing::trace!("Success recorded in open state (ignored)");
            }
        }
    }

    #[tracing::instrument(skip_all, fields(provider = %self.name))]
    fn on_failure(&self, admission: Option<&Admission<'_>>) {
        self.total_failures.fetch_add(1, Ordering::Relaxed);
        if !self.enabled {
            return;
        }
        let now = Instant::now();
        let mut inner = self.inner.lock();

        match inner.state {
            CircuitState::Closed => {
                inner.last_failure = Some(now);
                inner.prune(now, self.monitoring_window);
                inner.failures.push_back(now);
                let failures = u32::try_from(inner.failures.len()).unwrap_or(u32::MAX);
                warn!(failures, threshold = self.failure_threshold, "Failure in closed state");
                if failures >= self.failure_threshold {
                    self.transition(&mut inner, CircuitState::Open, now);
                }
            }
            CircuitState::HalfOpen => {
                if admission.is_some_and(|a| !a.is_current_trial(&inner)) {
                    debug!("Failure from an earlier episode, ignored");
                    return;
                }
                inner.last_failure = Some(now);
                warn!("Failure in half-open state, reopening circuit");
                self.transition(&mut inner, CircuitState::Open, now);
            }
            CircuitState::Open => {
                inner.last_failure = Some(now);
                tracing::trace!("Failure recorded in open state");
            }
        }
    }

    /// Get current state
    pub fn state(&self) -> CircuitState {
        self.inner.lock().state
    }

    /// Operator override: open the circuit now
    pub fn force_open(&self) {
        let now = Instant::now();
        let mut inner = self.inner.lock();
        inner.last_failure = Some(now);
        self.transition(&mut inner, CircuitState::Open, now);
        warn!(provider = %self.name, "Circuit breaker forced open");
    }

    /// Operator override: close the circuit and clear failure bookkeeping
    pub fn force_close(&self) {
        let now = Instant::now();
        let mut inner = self.inner.lock();
        self.transition(&mut inner, CircuitState::Closed, now);
        // Transition is a no-op when already closed; clear regardless
        inner.failures.clear();
        inner.last_failure = None;
        info!(provider = %self.name, "Circuit breaker forced closed");
    }

    /// Read-only snapshot
    #[must_use]
    pub fn stats(&self) -> CircuitStats {
        let now = Instant::now();
        let mut inner = self.inner.lock();
        inner.prune(now, self.monitoring_window);

        let ago = |t: Option<Instant>| {
            t.map(|t| u64::try_from(now.duration_since(t).as_millis()).unwrap_or(u64::MAX))
        };
        let retry_after_ms = (inner.state == CircuitState::Open).then(|| {
            let elapsed = inner
                .last_failure
                .map_or(self.recovery_timeout, |t| now.duration_since(t));
            u64::try_from(self.recovery_timeout.saturating_sub(elapsed).as_millis())
                .unwrap_or(u64::MAX)
        });

        CircuitStats {
            name: self.name.clone(),
            state: inner.state,
            failure_count: u32::try_from(inner.failures.len()).unwrap_or(u32::MAX),
            failure_threshold: self.failure_threshold,
            half_open_successes: inner.half_open_successes,
            success_threshold: self.success_threshold,
            last_failure_ms_ago: ago(inner.last_failure),
            last_success_ms_ago: ago(inner.last_success),
            retry_after_ms,
            total_calls: self.total_calls.load(Ordering::Relaxed),
            total_failures: self.total_failures.load(Ordering::Relaxed),
            total_rejections: self.total_rejections.load(Ordering::Relaxed),
        }
    }

    /// Human-readable status line for operators
    #[must_use]
    pub fn status_message(&self) -> String {
        let stats = self.stats();
        match stats.state {
            CircuitState::Closed => format!(
                "Provider '{}': circuit breaker is closed ({} recent failures)",
                self.name, stats.failure_count
            ),
            CircuitState::Open => format!(
                "Provider '{}': circuit breaker is open after {} failures, retry in {} seconds",
                self.name,
                stats.total_failures,
                stats.retry_after_ms.unwrap_or(0).div_ceil(1000)
            ),
            CircuitState::HalfOpen => format!(
                "Provider '{}': circuit breaker is half-open, testing recovery ({}/{} successes)",
                self.name, stats.half_open_successes, self.success_threshold
            ),
        }
    }

    /// Transition to a new state
    fn transition(&self, inner: &mut Inner, new_state: CircuitState, now: Instant) {
        let old_state = inner.state;
        if old_state == new_state {
            return;
        }
        inner.state = new_state;

        match new_state {
            CircuitState::Closed => {
                inner.failures.clear();
                inner.half_open_successes = 0;
                inner.probes_in_flight = 0;
                inner.last_failure = None;
                info!(provider = %self.name, "Circuit breaker closed");
            }
            CircuitState::Open => {
                inner.half_open_successes = 0;
                inner.probes_in_flight = 0;
                inner.last_failure.get_or_insert(now);
                warn!(
                    provider = %self.name,
                    failures = inner.failures.len(),
                    from = %old_state,
                    "Circuit breaker opened"
                );
                if let Some(monitor) = &self.monitor {
                    monitor.raise_alert(
                        AlertSeverity::Critical,
                        "circuit_breaker",
                        format!("Circuit for '{}' opened (was {old_state})", self.name),
                    );
                }
            }
            CircuitState::HalfOpen => {
                inner.half_open_successes = 0;
                inner.probes_in_flight = 0;
                inner.episode += 1;
                debug!(provider = %self.name, "Circuit breaker half-open");
                if let Some(monitor) = &self.monitor {
                    monitor.raise_alert(
                        AlertSeverity::Warning,
                        "circuit_breaker",
                        format!("Circuit for '{}' testing recovery", self.name),
                    );
                }
            }
        }
    }
}

/// Circuit breaker snapshot
#[derive(Debug, Clone, Serialize)]
pub struct CircuitStats {
    /// Provider name
    pub name: String,
    /// Current state
    pub state: CircuitState,
    /// Failures inside the monitoring window
    pub failure_count: u32,
    /// Failures needed to open
    pub failure_threshold: u32,
    /// Successes in the current half-open episode
    pub half_open_successes: u32,
    /// Successes needed to close
    pub success_threshold: u32,
    /// Milliseconds since the last failure
    pub last_failure_ms_ago: Option<u64>,
    /// Milliseconds since the last success
    pub last_success_ms_ago: Option<u64>,
    /// Remaining open time when open
    pub retry_after_ms: Option<u64>,
    /// Calls that asked for admission
    pub total_calls: u64,
    /// Failures recorded over the lifetime
    pub total_failures: u64,
    /// Calls refused
    pub total_rejections: u64,
}

// ============================================================================
// Chain layer
// ============================================================================

/// [`GenerationClient`] layer running every call through a [`CircuitBreaker`].
///
/// This is the last layer before the provider, so it is also where spent
/// tokens are accounted: a result rejected further up the chain still cost
/// a provider request.
pub struct CircuitGuarded<C> {
    inner: C,
    breaker: Arc<CircuitBreaker>,
    monitor: Option<Arc<HealthMonitor>>,
    usage: Option<Arc<UsageStats>>,
}

impl<C: GenerationClient> CircuitGuarded<C> {
    /// Wrap `inner` with `breaker`
    pub fn new(inner: C, breaker: Arc<CircuitBreaker>) -> Self {
        Self {
            inner,
            breaker,
            monitor: None,
            usage: None,
        }
    }

    /// Report provider calls to a health monitor
    #[must_use]
    pub fn with_monitor(mut self, monitor: Arc<HealthMonitor>) -> Self {
        self.monitor = Some(monitor);
        self
    }

    /// Count provider-served generations against the daily quota
    #[must_use]
    pub fn with_usage(mut self, usage: Arc<UsageStats>) -> Self {
        self.usage = Some(usage);
        self
    }

    /// The breaker guarding this layer
    pub fn breaker(&self) -> &Arc<CircuitBreaker> {
        &self.breaker
    }
}

#[async_trait]
impl<C: GenerationClient> GenerationClient for CircuitGuarded<C> {
    async fn generate(&self, request: &GenerationRequest) -> Result<GenerationResult> {
        let started = Instant::now();
        let result = self
            .breaker
            .execute(|| self.inner.generate(request))
            .await;

        if let Some(monitor) = &self.monitor {
            match &result {
                Ok(r) => monitor.record_provider_call(started.elapsed(), Some(r.metadata.tokens)),
                Err(Error::CircuitOpen { .. }) => {}
                Err(_) => monitor.record_provider_call(started.elapsed(), None),
            }
        }
        if let (Ok(r), Some(usage)) = (&result, &self.usage) {
            usage.record_generation(&r.metadata.model, r.metadata.tokens);
        }
        result
    }

    async fn ping(&self) -> Result<()> {
        self.breaker.execute(|| self.inner.ping()).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config(failure_threshold: u32, success_threshold: u32, recovery_ms: u64) -> CircuitBreakerConfig {
        CircuitBreakerConfig {
            enabled: true,
            failure_threshold,
            success_threshold,
            recovery_timeout: Duration::from_millis(recovery_ms),
            monitoring_window: Duration::from_secs(300),
            half_open_max_probes: 3,
        }
    }

    async fn fail(cb: &CircuitBreaker) -> Result<()> {
        cb.execute(|| async { Err::<(), _>(Error::Provider("boom".into())) })
            .await
    }

    async fn succeed(cb: &CircuitBreaker) -> Result<()> {
        cb.execute(|| async { Ok(()) }).await
    }

    #[tokio::test(start_paused = true)]
    async fn test_opens_at_threshold() {
        let cb = CircuitBreaker::new("test", &config(3, 1, 60_000));

        for _ in 0..2 {
            assert!(fail(&cb).await.is_err());
        }
        assert_eq!(cb.state(), CircuitState::Closed);

        assert!(fail(&cb).await.is_err());
        assert_eq!(cb.state(), CircuitState::Open);

        // Fourth call refused without running the closure
        let mut ran = false;
        let err = cb
            .execute(|| {
                ran = true;
                async { Ok(()) }
            })
            .await
            .unwrap_err();
        assert!(!ran);
        match err {
            Error::CircuitOpen { retry_after } => assert!(retry_after > Duration::ZERO),
            other => panic!("expected CircuitOpen, got {other:?}"),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_failures_outside_window_do_not_count() {
        let mut cfg = config(3, 1, 1000);
        cfg.monitoring_window = Duration::from_secs(10);
        let cb = CircuitBreaker::new("test", &cfg);

        fail(&cb).await.unwrap_err();
        fail(&cb).await.unwrap_err();
        tokio::time::advance(Duration::from_secs(11)).await;

        // Two old failures pruned, this is the only one in the window
        fail(&cb).await.unwrap_err();
        assert_eq!(cb.state(), CircuitState::Closed);
        assert_eq!(cb.stats().failure_count, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_successes_do_not_clear_window() {
        let cb = CircuitBreaker::new("test", &config(3, 1, 1000));
        fail(&cb).await.unwrap_err();
        succeed(&cb).await.unwrap();
        fail(&cb).await.unwrap_err();
        succeed(&cb).await.unwrap();
        fail(&cb).await.unwrap_err();
        assert_eq!(cb.state(), CircuitState::Open);
    }

    #[tokio::test(start_paused = true)]
    async fn test_retry_after_counts_down() {
        let cb = CircuitBreaker::new("test", &config(1, 1, 30_000));
        fail(&cb).await.unwrap_err();

        tokio::time::advance(Duration::from_secs(10)).await;
        let err = succeed(&cb).await.unwrap_err();
        assert_eq!(err.retry_after(), Some(Duration::from_secs(20)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_recovery_to_closed() {
        let cb = CircuitBreaker::new("test", &config(2, 1, 30_000));
        fail(&cb).await.unwrap_err();
        fail(&cb).await.unwrap_err();
        assert_eq!(cb.state(), CircuitState::Open);

        tokio::time::advance(Duration::from_millis(31_000)).await;

        // State stays open until the next call arrives
        assert_eq!(cb.state(), CircuitState::Open);
        succeed(&cb).await.unwrap();
        assert_eq!(cb.state(), CircuitState::Closed);
        assert_eq!(cb.stats().failure_count, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_half_open_failure_reopens() {
        let cb = CircuitBreaker::new("test", &config(1, 3, 1000));
        fail(&cb).await.unwrap_err();
        tokio::time::advance(Duration::from_millis(1001)).await;

        succeed(&cb).await.unwrap();
        succeed(&cb).await.unwrap();
        assert_eq!(cb.state(), CircuitState::HalfOpen);
        assert_eq!(cb.stats().half_open_successes, 2);

        fail(&cb).await.unwrap_err();
        assert_eq!(cb.state(), CircuitState::Open);
        assert_eq!(cb.stats().half_open_successes, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_half_open_limits_probes() {
        let mut cfg = config(1, 5, 1000);
        cfg.half_open_max_probes = 1;
        let cb = CircuitBreaker::new("test", &cfg);
        fail(&cb).await.unwrap_err();
        tokio::time::advance(Duration::from_millis(1001)).await;

        let probe = cb.admit().unwrap();
        assert_eq!(cb.state(), CircuitState::HalfOpen);
        assert!(matches!(cb.admit(), Err(Error::CircuitOpen { .. })));

        // Releasing the slot admits the next probe
        drop(probe);
        assert!(cb.admit().is_ok());
    }

    #[tokio::test(start_paused = true)]
    async fn test_late_success_does_not_count_in_next_episode() {
        let cb = CircuitBreaker::new("test", &config(1, 2, 1000));
        fail(&cb).await.unwrap_err();
        tokio::time::advance(Duration::from_millis(1001)).await;

        let first = cb.admit().unwrap();
        let slow = cb.admit().unwrap();
        first.record_failure();
        drop(first);
        assert_eq!(cb.state(), CircuitState::Open);

        tokio::time::advance(Duration::from_millis(1001)).await;
        let fresh = cb.admit().unwrap();
        assert_eq!(cb.state(), CircuitState::HalfOpen);

        slow.record_success();
        drop(slow);
        assert_eq!(cb.stats().half_open_successes, 0);

        fresh.record_success();
        drop(fresh);
        assert_eq!(cb.state(), CircuitState::HalfOpen);
        assert_eq!(cb.stats().half_open_successes, 1);

        succeed(&cb).await.unwrap();
        assert_eq!(cb.state(), CircuitState::Closed);
    }

    #[tokio::test(start_paused = true)]
    async fn test_late_failure_does_not_reopen_next_episode() {
        let cb = CircuitBreaker::new("test", &config(1, 1, 1000));
        fail(&cb).await.unwrap_err();
        tokio::time::advance(Duration::from_millis(1001)).await;

        let first = cb.admit().unwrap();
        let slow = cb.admit().unwrap();
        first.record_failure();
        drop(first);

        tokio::time::advance(Duration::from_millis(1001)).await;
        let fresh = cb.admit().unwrap();
        slow.record_failure();
        drop(slow);
        assert_eq!(cb.state(), CircuitState::HalfOpen);

        fresh.record_success();
        assert_eq!(cb.state(), CircuitState::Closed);
    }

    #[tokio::test(start_paused = true)]
    async fn test_non_provider_errors_ignored() {
        let cb = CircuitBreaker::new("test", &config(1, 1, 1000));
        let err = cb
            .execute(|| async { Err::<(), _>(Error::Internal("local".into())) })
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Internal(_)));
        assert_eq!(cb.state(), CircuitState::Closed);
    }

    #[tokio::test(start_paused = true)]
    async fn test_force_open_and_close() {
        let cb = CircuitBreaker::new("test", &config(5, 1, 60_000));
        cb.force_open();
        assert_eq!(cb.state(), CircuitState::Open);
        assert!(succeed(&cb).await.is_err());

        cb.force_close();
        assert_eq!(cb.state(), CircuitState::Closed);
        assert!(succeed(&cb).await.is_ok());
        assert!(cb.status_message().contains("closed"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_disabled_never_opens() {
        let mut cfg = config(1, 1, 1000);
        cfg.enabled = false;
        let cb = CircuitBreaker::new("test", &cfg);
        for _ in 0..10 {
            fail(&cb).await.unwrap_err();
        }
        assert_eq!(cb.state(), CircuitState::Closed);
        assert_eq!(cb.stats().total_failures, 10);
    }

    #[tokio::test(start_paused = true)]
    async fn test_open_transition_raises_alert() {
        let monitor = Arc::new(HealthMonitor::new(crate::config::HealthConfig::default(), 0.0));
        let cb = CircuitBreaker::new("test", &config(1, 1, 1000)).with_monitor(monitor.clone());
        fail(&cb).await.unwrap_err();
        let _ = succeed(&cb).await;

        let alerts = monitor.recent_alerts(10);
        assert_eq!(alerts.len(), 1);
        assert_eq!(alerts[0].severity, AlertSeverity::Critical);
    }
}
