//! Core types shared by the generation gateway and its callers.
//!
//! Requests are built once and never mutated afterwards; results are
//! immutable snapshots of what the provider returned plus the validation
//! outcome computed by the gateway.

use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Default provider call deadline
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);

/// Default output size
pub const DEFAULT_MAX_TOKENS: u32 = 1000;

/// Default sampling temperature
pub const DEFAULT_TEMPERATURE: f32 = 0.7;

/// Workload label used when a request does not name one
pub const GENERIC_KIND: &str = "generic";

// ============================================================================
// Request
// ============================================================================

/// Provider options for a single generation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct GenerationOptions {
    /// Model identifier (provider default when `None`)
    pub model: Option<String>,
    /// Maximum output tokens
    pub max_tokens: u32,
    /// Sampling temperature
    pub temperature: f32,
    /// Optional system instructions
    pub system_prompt: Option<String>,
    /// Deadline for the provider call
    pub timeout: Duration,
}

impl Default for GenerationOptions {
    fn default() -> Self {
        Self {
            model: None,
            max_tokens: DEFAULT_MAX_TOKENS,
            temperature: DEFAULT_TEMPERATURE,
            system_prompt: None,
            timeout: DEFAULT_TIMEOUT,
        }
    }
}

impl GenerationOptions {
    /// Set the model identifier
    #[must_use]
    pub fn with_model(mut self, model: impl Into<String>) -> Self {
        self.model = Some(model.into());
        self
    }

    /// Set the maximum output size
    #[must_use]
    pub fn with_max_tokens(mut self, max_tokens: u32) -> Self {
        self.max_tokens = max_tokens;
        self
    }

    /// Set the sampling temperature
    #[must_use]
    pub fn with_temperature(mut self, temperature: f32) -> Self {
        self.temperature = temperature;
        self
    }

    /// Set system instructions
    #[must_use]
    pub fn with_system_prompt(mut self, system_prompt: impl Into<String>) -> Self {
        self.system_prompt = Some(system_prompt.into());
        self
    }

    /// Set the provider deadline
    #[must_use]
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }
}

/// Workload metadata attached to a request.
///
/// `category` and `audience` drive approximate cache matching; requests that
/// leave both unset only ever match exactly.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RequestContext {
    /// Workload label ("post", "tags", ...)
    pub kind: String,
    /// Content category
    pub category: Option<String>,
    /// Target audience
    pub audience: Option<String>,
}

impl Default for RequestContext {
    fn default() -> Self {
        Self {
            kind: GENERIC_KIND.to_string(),
            category: None,
            audience: None,
        }
    }
}

impl RequestContext {
    /// Create a context for the given workload label
    #[must_use]
    pub fn new(kind: impl Into<String>) -> Self {
        Self {
            kind: kind.into(),
            ..Self::default()
        }
    }

    /// Set the content category
    #[must_use]
    pub fn with_category(mut self, category: impl Into<String>) -> Self {
        self.category = Some(category.into());
        self
    }

    /// Set the target audience
    #[must_use]
    pub fn with_audience(mut self, audience: impl Into<String>) -> Self {
        self.audience = Some(audience.into());
        self
    }
}

/// A prompt plus everything needed to generate from it
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GenerationRequest {
    prompt: String,
    #[serde(default)]
    options: GenerationOptions,
    #[serde(default)]
    context: RequestContext,
}

impl GenerationRequest {
    /// Create a request with default options and a generic context
    #[must_use]
    pub fn new(prompt: impl Into<String>) -> Self {
        Self {
            prompt: prompt.into(),
            options: GenerationOptions::default(),
            context: RequestContext::default(),
        }
    }

    /// Replace the generation options
    #[must_use]
    pub fn with_options(mut self, options: GenerationOptions) -> Self {
        self.options = options;
        self
    }

    /// Replace the workload context
    #[must_use]
    pub fn with_context(mut self, context: RequestContext) -> Self {
        self.context = context;
        self
    }

    /// Prompt text
    #[must_use]
    pub fn prompt(&self) -> &str {
        &self.prompt
    }

    /// Generation options
    #[must_use]
    pub fn options(&self) -> &GenerationOptions {
        &self.options
    }

    /// Workload context
    #[must_use]
    pub fn context(&self) -> &RequestContext {
        &self.context
    }
}

// ============================================================================
// Result
// ============================================================================

/// Outcome of post-generation content checks
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ValidationResult {
    /// `true` when `errors` is empty
    pub is_valid: bool,
    /// Non-fatal findings
    pub warnings: Vec<String>,
    /// Fatal findings
    pub errors: Vec<String>,
}

impl Default for ValidationResult {
    fn default() -> Self {
        Self::from_findings(Vec::new(), Vec::new())
    }
}

impl ValidationResult {
    /// Build a result, deriving `is_valid` from `errors`
    #[must_use]
    pub fn from_findings(warnings: Vec<String>, errors: Vec<String>) -> Self {
        Self {
            is_valid: errors.is_empty(),
            warnings,
            errors,
        }
    }
}

/// Provider metadata for a generation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GenerationMetadata {
    /// Model that produced the content
    pub model: String,
    /// Tokens consumed by the original generation
    pub tokens: u32,
    /// Provider confidence (0.0-1.0)
    pub confidence: f64,
    /// When the content was generated
    pub timestamp: DateTime<Utc>,
    /// Served from the result cache
    #[serde(default)]
    pub cached: bool,
    /// Similarity score when served as an approximate match
    #[serde(default)]
    pub similarity: Option<f64>,
}

/// Generated text with metadata and validation outcome
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GenerationResult {
    /// Generated text
    pub content: String,
    /// Provider metadata
    pub metadata: GenerationMetadata,
    /// Validation outcome
    #[serde(default)]
    pub validation: ValidationResult,
}

impl GenerationResult {
    /// Create a fresh (uncached, unvalidated) result stamped with the current time
    #[must_use]
    pub fn new(content: impl Into<String>, model: impl Into<String>, tokens: u32, confidence: f64) -> Self {
        Self {
            content: content.into(),
            metadata: GenerationMetadata {
                model: model.into(),
                tokens,
                confidence,
                timestamp: Utc::now(),
                cached: false,
                similarity: None,
            },
            validation: ValidationResult::default(),
        }
    }

    /// Copy of this result marked as served from cache
    #[must_use]
    pub fn as_cached(&self, similarity: Option<f64>) -> Self {
        let mut result = self.clone();
        result.metadata.cached = true;
        result.metadata.similarity = similarity;
        result
    }

    /// Copy of this result carrying the given validation outcome
    #[must_use]
    pub fn with_validation(mut self, validation: ValidationResult) -> Self {
        self.validation = validation;
        self
    }
}
