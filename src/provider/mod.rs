//! Generation provider abstraction.
//!
//! Every layer of the gateway speaks the same [`GenerationClient`] trait, so
//! the resilience chain is plain composition:
//!
//! ```text
//! ResultCache ──▶ ValidationLayer ──▶ CircuitGuarded ──▶ HttpGenerationClient
//! ```
//!
//! The leaf client issues exactly one remote call per `generate` and never
//! retries; retry and admission policy belong to the layers above it.

mod http;

pub use http::HttpGenerationClient;

use std::sync::Arc;

use async_trait::async_trait;
use gateway_core::{GenerationRequest, GenerationResult};

use crate::Result;

/// A source of generated text.
///
/// Implementations must be `Send + Sync` so a chain can be shared across
/// tasks behind an `Arc`.
#[async_trait]
pub trait GenerationClient: Send + Sync {
    /// Generate text for `request`.
    ///
    /// # Errors
    ///
    /// Returns [`crate::Error::Provider`] for non-2xx or malformed responses
    /// and [`crate::Error::Timeout`] when the request deadline is exceeded.
    /// Wrapping layers add their own refusal errors.
    async fn generate(&self, request: &GenerationRequest) -> Result<GenerationResult>;

    /// Cheap reachability probe.
    ///
    /// # Errors
    ///
    /// Returns an error when the provider cannot be reached.
    async fn ping(&self) -> Result<()>;
}

#[async_trait]
impl<T: GenerationClient + ?Sized> GenerationClient for Arc<T> {
    async fn generate(&self, request: &GenerationRequest) -> Result<GenerationResult> {
        (**self).generate(request).await
    }

    async fn ping(&self) -> Result<()> {
        (**self).ping().await
    }
}
