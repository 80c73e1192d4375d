//! Generation Gateway Library
//!
//! Resilience layer around a text-generation provider.
//!
//! # Features
//!
//! - **Circuit breaker**: sliding-window failure counting with lazy recovery probes
//! - **Result cache**: memory + durable tiers, exact and similarity lookups
//! - **Admission limiter**: per-policy fixed windows with burst allowance
//! - **Health**: rates, latency, cost estimate and a healthy/degraded/critical verdict
//!
//! Everything hangs off one [`gateway::Gateway`] value built at startup.

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod cache;
pub mod cli;
pub mod config;
pub mod error;
pub mod failsafe;
pub mod gateway;
pub mod provider;
pub mod stats;
pub mod validation;

pub use error::{Error, Result};
pub use gateway_core::{
    GenerationMetadata, GenerationOptions, GenerationRequest, GenerationResult, RequestContext,
    ValidationResult,
};

use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

/// Setup tracing/logging
///
/// Logs go to stderr so command output on stdout stays machine-readable.
///
/// # Errors
///
/// Returns [`Error::Internal`] if a global subscriber is already installed.
pub fn setup_tracing(level: &str, format: Option<&str>) -> Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));

    let subscriber = tracing_subscriber::registry().with(filter);

    let installed = match format {
        Some("json") => subscriber
            .with(fmt::layer().json().with_writer(std::io::stderr))
            .try_init(),
        _ => subscriber
            .with(fmt::layer().with_writer(std::io::stderr))
            .try_init(),
    };

    installed.map_err(|e| Error::Internal(format!("Failed to install tracing subscriber: {e}")))
}
