//! Configuration management

use std::{collections::HashMap, env, path::Path, time::Duration};

use figment::{
    Figment,
    providers::{Env, Format, Yaml},
};
use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::{Error, Result};

/// Main configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
#[derive(Default)]
pub struct Config {
    /// Environment files to load before processing config.
    /// Paths support ~ expansion. Loaded in order, later files override earlier.
    #[serde(default)]
    pub env_files: Vec<String>,
    /// Generation provider
    pub provider: ProviderConfig,
    /// Circuit breaker configuration
    pub circuit_breaker: CircuitBreakerConfig,
    /// Result cache configuration
    pub cache: CacheConfig,
    /// Admission limiter configuration
    pub rate_limit: RateLimitConfig,
    /// Health thresholds
    pub health: HealthConfig,
    /// Usage accounting
    pub usage: UsageConfig,
}

/// Generation provider configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ProviderConfig {
    /// Base URL of an OpenAI-compatible API
    pub base_url: String,
    /// API key (supports `env:VAR_NAME`)
    pub api_key: Option<String>,
    /// Model used when a request does not name one
    pub default_model: String,
    /// Default deadline for a provider call
    #[serde(with = "humantime_serde")]
    pub timeout: Duration,
}

impl Default for ProviderConfig {
    fn default() -> Self {
        Self {
            base_url: "https://api.openai.com/v1".to_string(),
            api_key: Some("env:OPENAI_API_KEY".to_string()),
            default_model: "gpt-4o-mini".to_string(),
            timeout: Duration::from_secs(30),
        }
    }
}

impl ProviderConfig {
    /// Resolve the API key (expand `env:` references)
    #[must_use]
    pub fn resolve_api_key(&self) -> Option<String> {
        self.api_key.as_ref().and_then(|key| {
            if let Some(var_name) = key.strip_prefix("env:") {
                env::var(var_name).ok()
            } else {
                Some(key.clone())
            }
        })
    }
}

/// Circuit breaker configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CircuitBreakerConfig {
    /// Enable circuit breaker
    pub enabled: bool,
    /// Failures inside the monitoring window before opening
    pub failure_threshold: u32,
    /// Half-open successes needed to close
    pub success_threshold: u32,
    /// Time after the last failure before a probe is admitted
    #[serde(with = "humantime_serde")]
    pub recovery_timeout: Duration,
    /// Sliding window for counting failures
    #[serde(with = "humantime_serde")]
    pub monitoring_window: Duration,
    /// Concurrent probes admitted while half-open
    pub half_open_max_probes: u32,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            failure_threshold: 5,
            success_threshold: 3,
            recovery_timeout: Duration::from_secs(60),
            monitoring_window: Duration::from_secs(300),
            half_open_max_probes: 3,
        }
    }
}

/// Result cache configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    /// Enable result caching
    pub enabled: bool,
    /// Age after which entries are stale
    #[serde(with = "humantime_serde")]
    pub default_ttl: Duration,
    /// Hard cap on the in-process tier
    pub max_memory_entries: usize,
    /// Cap on the durable tier
    pub max_storage_entries: usize,
    /// Enable approximate (similarity) lookups
    pub similarity_enabled: bool,
    /// Minimum score for an approximate hit (exclusive)
    pub similarity_threshold: f64,
    /// Directory for the durable tier (`None` keeps the cache in memory only)
    pub storage_dir: Option<String>,
    /// Prefix for durable keys
    pub key_prefix: String,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            default_ttl: Duration::from_secs(60 * 60),
            max_memory_entries: 100,
            max_storage_entries: 1000,
            similarity_enabled: true,
            similarity_threshold: 0.8,
            storage_dir: None,
            key_prefix: "genai".to_string(),
        }
    }
}

/// A named admission policy
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RateLimitPolicy {
    /// Nominal quota per window
    pub max_requests: u32,
    /// Window length
    #[serde(with = "humantime_serde")]
    pub window: Duration,
    /// Extra requests permitted above the quota
    #[serde(default)]
    pub burst_allowance: u32,
    /// Cache-served successes are refunded
    #[serde(default)]
    pub skip_successful: bool,
}

impl RateLimitPolicy {
    /// Create a policy with no burst allowance
    #[must_use]
    pub fn new(max_requests: u32, window: Duration) -> Self {
        Self {
            max_requests,
            window,
            burst_allowance: 0,
            skip_successful: false,
        }
    }

    /// Set the burst allowance
    #[must_use]
    pub fn with_burst(mut self, burst_allowance: u32) -> Self {
        self.burst_allowance = burst_allowance;
        self
    }

    /// Refund cache-served successes
    #[must_use]
    pub fn skipping_successful(mut self) -> Self {
        self.skip_successful = true;
        self
    }

    /// Calls admitted per window including burst
    #[must_use]
    pub fn capacity(&self) -> u32 {
        self.max_requests.saturating_add(self.burst_allowance)
    }
}

/// Backoff options for rate-limited retries
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    /// Admission retries after the first refusal
    pub max_retries: u32,
    /// First backoff delay (doubles per attempt)
    #[serde(with = "humantime_serde")]
    pub base_delay: Duration,
    /// Upper bound for a single backoff delay
    #[serde(with = "humantime_serde")]
    pub max_delay: Duration,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(60),
        }
    }
}

/// Admission limiter configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RateLimitConfig {
    /// Enable admission limits
    pub enabled: bool,
    /// Named policies
    pub policies: HashMap<String, RateLimitPolicy>,
    /// Retry options for `with_rate_limit`
    pub retry: RetryConfig,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        let minute = Duration::from_secs(60);
        let policies = HashMap::from([
            (
                "generation".to_string(),
                RateLimitPolicy::new(10, minute)
                    .with_burst(2)
                    .skipping_successful(),
            ),
            (
                "tags".to_string(),
                RateLimitPolicy::new(20, minute)
                    .with_burst(5)
                    .skipping_successful(),
            ),
            (
                "archive".to_string(),
                RateLimitPolicy::new(100, minute).with_burst(20),
            ),
        ]);
        Self {
            enabled: true,
            policies,
            retry: RetryConfig::default(),
        }
    }
}

/// Health verdict thresholds
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HealthConfig {
    /// Error rate above which the service is degraded
    pub degraded_error_rate: f64,
    /// Error rate above which the service is critical
    pub critical_error_rate: f64,
    /// Average response time ceiling
    #[serde(with = "humantime_serde")]
    pub max_average_response_time: Duration,
    /// Approximate cache memory ceiling in bytes
    pub max_memory_bytes: usize,
    /// Number of recent alerts retained
    pub max_alerts: usize,
}

impl Default for HealthConfig {
    fn default() -> Self {
        Self {
            degraded_error_rate: 0.1,
            critical_error_rate: 0.2,
            max_average_response_time: Duration::from_secs(10),
            max_memory_bytes: 50 * 1024 * 1024, // 50MB
            max_alerts: 50,
        }
    }
}

/// Usage accounting configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct UsageConfig {
    /// Provider requests allowed per UTC day
    pub daily_request_quota: u64,
    /// Price per 1000 tokens
    pub cost_per_1k_tokens: f64,
}

impl Default for UsageConfig {
    fn default() -> Self {
        Self {
            daily_request_quota: 1000,
            cost_per_1k_tokens: 0.002,
        }
    }
}

impl Config {
    /// Load configuration from file and environment
    ///
    /// # Errors
    ///
    /// Returns an error if the config file does not exist, cannot be parsed,
    /// or fails validation.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut figment = Figment::new();

        if let Some(p) = path {
            if !p.exists() {
                return Err(Error::Config(format!(
                    "Config file not found: {}",
                    p.display()
                )));
            }
            figment = figment.merge(Yaml::file(p));
        }

        // Merge environment variables (GENAI_GATEWAY_ prefix)
        figment = figment.merge(Env::prefixed("GENAI_GATEWAY_").split("__"));

        let mut config: Self = figment
            .extract()
            .map_err(|e| Error::Config(e.to_string()))?;

        // Env files must be loaded before ${VAR} expansion
        config.load_env_files();
        config.expand_env_vars()?;
        config.validate()?;

        Ok(config)
    }

    /// Check invariants the layers rely on
    ///
    /// # Errors
    ///
    /// Returns [`Error::Config`] describing the first violated constraint.
    pub fn validate(&self) -> Result<()> {
        if self.circuit_breaker.failure_threshold == 0 {
            return Err(Error::Config(
                "circuit_breaker.failure_threshold must be at least 1".into(),
            ));
        }
        if self.circuit_breaker.success_threshold == 0 {
            return Err(Error::Config(
                "circuit_breaker.success_threshold must be at least 1".into(),
            ));
        }
        let threshold = self.cache.similarity_threshold;
        if !(threshold > 0.0 && threshold <= 1.0) {
            return Err(Error::Config(format!(
                "cache.similarity_threshold must be in (0, 1], got {threshold}"
            )));
        }
        if self.cache.max_memory_entries == 0 {
            return Err(Error::Config(
                "cache.max_memory_entries must be at least 1".into(),
            ));
        }
        for (name, policy) in &self.rate_limit.policies {
            if policy.max_requests == 0 {
                return Err(Error::Config(format!(
                    "rate_limit.policies.{name}.max_requests must be at least 1"
                )));
            }
            if policy.window.is_zero() {
                return Err(Error::Config(format!(
                    "rate_limit.policies.{name}.window must be non-zero"
                )));
            }
        }
        Ok(())
    }

    /// Load environment files into the process environment.
    /// Supports ~ expansion. Files that don't exist are silently skipped.
    fn load_env_files(&self) {
        for path_str in &self.env_files {
            let expanded = expand_home(path_str);
            let path = Path::new(&expanded);
            if path.exists() {
                match dotenvy::from_path(path) {
                    Ok(()) => {
                        tracing::info!("Loaded env file: {expanded}");
                    }
                    Err(e) => {
                        tracing::warn!("Failed to load env file {expanded}: {e}");
                    }
                }
            } else {
                tracing::debug!("Env file not found (skipped): {expanded}");
            }
        }
    }

    /// Expand ${VAR} and ${VAR:-default} patterns in config values
    fn expand_env_vars(&mut self) -> Result<()> {
        let re = Regex::new(r"\$\{([A-Z_][A-Z0-9_]*)(?::-([^}]*))?\}")
            .map_err(|e| Error::Internal(e.to_string()))?;

        self.provider.base_url = Self::expand_string(&re, &self.provider.base_url);
        self.provider.default_model = Self::expand_string(&re, &self.provider.default_model);
        if let Some(dir) = self.cache.storage_dir.as_mut() {
            *dir = expand_home(&Self::expand_string(&re, dir));
        }
        Ok(())
    }

    /// Expand environment variables in a string
    fn expand_string(re: &Regex, value: &str) -> String {
        re.replace_all(value, |caps: &regex::Captures| {
            let var_name = &caps[1];
            let default = caps.get(2).map_or("", |m| m.as_str());
            env::var(var_name).unwrap_or_else(|_| default.to_string())
        })
        .into_owned()
    }
}

fn expand_home(path: &str) -> String {
    if path.starts_with('~') {
        if let Some(home) = dirs::home_dir() {
            return path.replacen('~', &home.display().to_string(), 1);
        }
    }
    path.to_string()
}

/// Custom humantime serde module for Duration
pub mod humantime_serde {
    use std::time::Duration;

    use serde::{self, Deserialize, Deserializer, Serializer};

    /// Serialize Duration to human-readable string (e.g., "30s", "250ms")
    ///
    /// # Errors
    ///
    /// Returns a serialization error if the serializer fails.
    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        if duration.subsec_millis() == 0 {
            serializer.serialize_str(&format!("{}s", duration.as_secs()))
        } else {
            serializer.serialize_str(&format!("{}ms", duration.as_millis()))
        }
    }

    /// Deserialize human-readable duration string (e.g., "30s", "5m", "2h", "100ms")
    ///
    /// # Errors
    ///
    /// Returns a deserialization error if the string cannot be parsed as a duration.
    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        parse(&s).map_err(serde::de::Error::custom)
    }

    /// Parse "30s", "5m", "2h", "100ms" or bare seconds
    ///
    /// # Errors
    ///
    /// Returns the integer parse error for malformed input.
    pub fn parse(s: &str) -> Result<Duration, std::num::ParseIntError> {
        let s = s.trim();
        // "ms" before "s" and "m"
        if let Some(ms) = s.strip_suffix("ms") {
            ms.trim().parse::<u64>().map(Duration::from_millis)
        } else if let Some(secs) = s.strip_suffix('s') {
            secs.trim().parse::<u64>().map(Duration::from_secs)
        } else if let Some(mins) = s.strip_suffix('m') {
            mins.trim().parse::<u64>().map(|m| Duration::from_secs(m * 60))
        } else if let Some(hours) = s.strip_suffix('h') {
            hours
                .trim()
                .parse::<u64>()
                .map(|h| Duration::from_secs(h * 60 * 60))
        } else {
            s.parse::<u64>().map(Duration::from_secs)
        }
    }
}
