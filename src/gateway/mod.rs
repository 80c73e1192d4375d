//! Gateway context
//!
//! [`Gateway`] is built once at startup and shared by reference (or behind an
//! `Arc`) with every call site. It owns the composed chain
//!
//! ```text
//! AdmissionLimiter ─▶ ResultCache ─▶ ValidationLayer ─▶ CircuitGuarded ─▶ client
//! ```
//!
//! together with the health monitor and usage statistics the layers report
//! into. There is no global state.

use std::sync::Arc;

use gateway_core::{GenerationRequest, GenerationResult, ValidationResult};
use tokio::time::Instant;
use tracing::{Instrument, info, warn};
use uuid::Uuid;

use crate::cache::{CacheStatsSnapshot, DurableStore, FileStore, ResultCache};
use crate::config::Config;
use crate::failsafe::{
    AdmissionDecision, AdmissionLimiter, Alert, CircuitBreaker, CircuitGuarded, CircuitStats,
    HealthInputs, HealthMonitor, HealthSnapshot, LimiterStats, with_rate_limit,
};
use crate::provider::{GenerationClient, HttpGenerationClient};
use crate::stats::{UsageSnapshot, UsageStats};
use crate::validation::{ValidationLayer, validate_content};
use crate::{Error, Result};

/// Policy used when a caller does not pick one
pub const DEFAULT_POLICY: &str = "generation";

/// The composed generation chain
pub type Chain = ResultCache<ValidationLayer<CircuitGuarded<Arc<dyn GenerationClient>>>>;

/// Per-call admission options
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GenerateOptions {
    /// Admission policy; `None` skips admission entirely
    pub policy: Option<String>,
    /// Caller identity the quota is tracked under
    pub identifier: String,
    /// Back off and retry admission instead of failing at once
    pub wait_for_admission: bool,
}

impl Default for GenerateOptions {
    fn default() -> Self {
        Self {
            policy: Some(DEFAULT_POLICY.to_string()),
            identifier: "default".to_string(),
            wait_for_admission: false,
        }
    }
}

impl GenerateOptions {
    /// Use `policy` for admission
    #[must_use]
    pub fn with_policy(mut self, policy: impl Into<String>) -> Self {
        self.policy = Some(policy.into());
        self
    }

    /// Track the quota under `identifier`
    #[must_use]
    pub fn with_identifier(mut self, identifier: impl Into<String>) -> Self {
        self.identifier = identifier.into();
        self
    }

    /// Skip admission checks
    #[must_use]
    pub fn unlimited(mut self) -> Self {
        self.policy = None;
        self
    }

    /// Wait for admission using the configured retry schedule
    #[must_use]
    pub fn waiting(mut self) -> Self {
        self.wait_for_admission = true;
        self
    }
}

/// Resilient generation gateway
pub struct Gateway {
    config: Config,
    chain: Chain,
    breaker: Arc<CircuitBreaker>,
    limiter: AdmissionLimiter,
    monitor: Arc<HealthMonitor>,
    usage: Arc<UsageStats>,
}

impl Gateway {
    /// Build a gateway talking to the configured HTTP provider.
    ///
    /// A durable tier is attached when `cache.storage_dir` is set; if the
    /// directory cannot be created the cache runs memory-only.
    ///
    /// # Errors
    ///
    /// Returns an error if the provider client cannot be built.
    pub fn new(config: Config) -> Result<Self> {
        let client: Arc<dyn GenerationClient> = Arc::new(HttpGenerationClient::new(&config.provider)?);

        let store: Option<Arc<dyn DurableStore>> = match config.cache.storage_dir.as_deref() {
            Some(dir) => match FileStore::new(dir) {
                Ok(store) => Some(Arc::new(store)),
                Err(e) => {
                    warn!(dir, error = %e, "Durable cache tier unavailable, using memory only");
                    None
                }
            },
            None => None,
        };

        Ok(Self::from_parts(config, client, store))
    }

    /// Build a gateway around any client and optional durable store
    #[must_use]
    pub fn from_parts(
        config: Config,
        client: Arc<dyn GenerationClient>,
        store: Option<Arc<dyn DurableStore>>,
    ) -> Self {
        let monitor = Arc::new(HealthMonitor::new(
            config.health.clone(),
            config.usage.cost_per_1k_tokens,
        ));
        let breaker = Arc::new(
            CircuitBreaker::new(&config.provider.default_model, &config.circuit_breaker)
                .with_monitor(monitor.clone()),
        );

        let usage = Arc::new(UsageStats::new(config.usage.daily_request_quota));

        let guarded = CircuitGuarded::new(client, breaker.clone())
            .with_monitor(monitor.clone())
            .with_usage(usage.clone());
        let mut chain = ResultCache::new(ValidationLayer::new(guarded), &config.cache)
            .with_monitor(monitor.clone());
        if let Some(store) = store {
            info!(backend = store.name(), "Durable cache tier attached");
            chain = chain.with_store(store);
        }

        let limiter = AdmissionLimiter::new(&config.rate_limit).with_monitor(monitor.clone());

        Self {
            config,
            chain,
            breaker,
            limiter,
            monitor,
            usage,
        }
    }

    /// Active configuration
    #[must_use]
    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Generate text for `request`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::RateLimited`] when admission is refused,
    /// [`Error::UnknownPolicy`] for an unconfigured policy, and otherwise
    /// whatever the chain returns.
    pub async fn generate(
        &self,
        request: &GenerationRequest,
        options: &GenerateOptions,
    ) -> Result<GenerationResult> {
        let span = tracing::info_span!(
            "generate",
            request_id = %Uuid::new_v4(),
            policy = options.policy.as_deref().unwrap_or("none"),
            identifier = %options.identifier,
        );
        self.admit_and_generate(request, options)
            .instrument(span)
            .await
    }

    async fn admit_and_generate(
        &self,
        request: &GenerationRequest,
        options: &GenerateOptions,
    ) -> Result<GenerationResult> {
        let Some(policy) = options.policy.as_deref() else {
            return self.run_chain(request).await;
        };
        let identifier = options.identifier.as_str();

        let result = if options.wait_for_admission {
            with_rate_limit(
                &self.limiter,
                policy,
                identifier,
                &self.config.rate_limit.retry,
                || self.run_chain(request),
            )
            .await?
        } else {
            match self.limiter.check_limit(policy, identifier)? {
                AdmissionDecision::Admitted { .. } => self.run_chain(request).await?,
                AdmissionDecision::Rejected { retry_after_secs } => {
                    return Err(Error::RateLimited {
                        policy: policy.to_string(),
                        retry_after_secs,
                    });
                }
            }
        };

        if result.metadata.cached {
            self.limiter.record_success(policy, identifier);
        }
        Ok(result)
    }

    async fn run_chain(&self, request: &GenerationRequest) -> Result<GenerationResult> {
        let started = Instant::now();
        let outcome = self.chain.generate(request).await;
        self.monitor.record_request(started.elapsed(), outcome.is_ok());

        if let Err(e) = &outcome {
            warn!(error = %e, "Generation failed");
        }
        outcome
    }

    /// Probe the provider through the circuit breaker
    pub async fn is_available(&self) -> bool {
        self.chain.ping().await.is_ok()
    }

    /// Usage, cache and circuit statistics
    #[must_use]
    pub fn usage_stats(&self) -> UsageSnapshot {
        self.usage
            .snapshot(self.chain.stats(), self.breaker.stats())
    }

    /// Check arbitrary text with the generation content rules
    #[must_use]
    pub fn validate_content(&self, text: &str) -> ValidationResult {
        validate_content(text)
    }

    /// Current health verdict
    #[must_use]
    pub fn health(&self) -> HealthSnapshot {
        self.monitor.snapshot(&HealthInputs {
            exceeded_policies: self.limiter.exceeded_policies(),
            cache_memory_bytes: self.chain.memory_bytes(),
            circuit_state: self.breaker.state(),
        })
    }

    /// Most recent alerts, newest last
    #[must_use]
    pub fn recent_alerts(&self, limit: usize) -> Vec<Alert> {
        self.monitor.recent_alerts(limit)
    }

    /// Result cache statistics
    #[must_use]
    pub fn cache_stats(&self) -> CacheStatsSnapshot {
        self.chain.stats()
    }

    /// Drop both cache tiers
    pub async fn clear_cache(&self) {
        self.chain.clear().await;
    }

    /// Sweep expired and over-capacity cache entries now
    pub async fn refresh_cache(&self) -> usize {
        self.chain.refresh().await
    }

    /// Circuit breaker snapshot
    #[must_use]
    pub fn circuit_stats(&self) -> CircuitStats {
        self.breaker.stats()
    }

    /// Operator override: open the circuit
    pub fn force_open(&self) {
        self.breaker.force_open();
    }

    /// Operator override: close the circuit
    pub fn force_close(&self) {
        self.breaker.force_close();
    }

    /// Admission limiter snapshot
    #[must_use]
    pub fn limiter_stats(&self) -> LimiterStats {
        self.limiter.stats()
    }

    /// Forget expired admission windows
    pub fn cleanup_rate_limits(&self) -> usize {
        self.limiter.cleanup_expired()
    }
}
