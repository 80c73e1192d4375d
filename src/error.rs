//! Error types for the generation gateway

use std::io;
use std::time::Duration;

use thiserror::Error;

/// Result type alias for the generation gateway
pub type Result<T> = std::result::Result<T, Error>;

/// Generation gateway errors
#[derive(Error, Debug)]
pub enum Error {
    /// Remote call failed or returned malformed data
    #[error("Provider error: {0}")]
    Provider(String),

    /// Provider call exceeded its deadline
    #[error("Provider timeout after {} ms", .0.as_millis())]
    Timeout(Duration),

    /// Circuit breaker refused the call
    #[error("Generation service degraded, retry after {} ms", .retry_after.as_millis())]
    CircuitOpen {
        /// Time until the circuit may admit a probe
        retry_after: Duration,
    },

    /// Admission refused and retries exhausted
    #[error("Rate limit exceeded for policy '{policy}', try again after {retry_after_secs} seconds")]
    RateLimited {
        /// Policy that refused the call
        policy: String,
        /// Seconds until the window resets
        retry_after_secs: u64,
    },

    /// Generated content failed validation
    #[error("Generated content failed validation: {}", .errors.join("; "))]
    Validation {
        /// Fatal validation findings
        errors: Vec<String>,
    },

    /// Unknown rate-limit policy
    #[error("Unknown rate-limit policy: {0}")]
    UnknownPolicy(String),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// Durable cache tier error
    #[error("Storage error: {0}")]
    Storage(String),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    /// JSON error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// HTTP error
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    /// Internal error
    #[error("Internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Whether the failure should be recorded against the provider's health.
    ///
    /// Only errors produced by the remote call itself count; refusals made
    /// by the gateway's own layers never do.
    #[must_use]
    pub fn counts_as_provider_failure(&self) -> bool {
        matches!(self, Self::Provider(_) | Self::Timeout(_) | Self::Http(_))
    }

    /// Whether retrying the same call later may succeed
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::Provider(_)
                | Self::Timeout(_)
                | Self::Http(_)
                | Self::CircuitOpen { .. }
                | Self::RateLimited { .. }
        )
    }

    /// Numeric retry hint carried by refusal errors
    #[must_use]
    pub fn retry_after(&self) -> Option<Duration> {
        match self {
            Self::CircuitOpen { retry_after } => Some(*retry_after),
            Self::RateLimited {
                retry_after_secs, ..
            } => Some(Duration::from_secs(*retry_after_secs)),
            _ => None,
        }
    }
}
