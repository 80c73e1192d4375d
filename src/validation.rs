//! Post-generation content checks
//!
//! [`validate_content`] is a pure function usable on any text. The
//! [`ValidationLayer`] applies it to every generated result: findings that
//! are errors turn the result into [`Error::Validation`], warnings ride along
//! on [`GenerationResult::validation`].

use std::sync::LazyLock;

use async_trait::async_trait;
use gateway_core::{GenerationRequest, GenerationResult, ValidationResult};
use regex::Regex;
use tracing::{debug, warn};

use crate::provider::GenerationClient;
use crate::{Error, Result};

/// Below this many characters the text is probably truncated
pub const MIN_RECOMMENDED_CHARS: usize = 20;
/// Above this many characters the text is unusually long
pub const SOFT_MAX_CHARS: usize = 10_000;
/// Above this many characters the text is rejected
pub const HARD_MAX_CHARS: usize = 50_000;

/// Patterns that indicate leftover template or refusal text
static SUSPICIOUS: LazyLock<Vec<(Regex, &'static str)>> = LazyLock::new(|| {
    [
        (r"\[(?i:insert|your|placeholder)[^\]]*\]", "Contains an unfilled placeholder"),
        (r"\{\{[^}]*\}\}", "Contains an unrendered template variable"),
        (r"(?i)lorem ipsum", "Contains filler text"),
        (
            r"(?i)\b(as an ai( language model)?|i('m| am) (sorry|unable)|i cannot (help|assist|comply))\b",
            "Looks like a refusal or assistant boilerplate",
        ),
    ]
    .into_iter()
    .filter_map(|(pattern, message)| Regex::new(pattern).ok().map(|re| (re, message)))
    .collect()
});

/// Check generated text for problems
#[must_use]
pub fn validate_content(text: &str) -> ValidationResult {
    let mut warnings = Vec::new();
    let mut errors = Vec::new();

    let trimmed = text.trim();
    if trimmed.is_empty() {
        errors.push("Content is empty".to_string());
        return ValidationResult::from_findings(warnings, errors);
    }

    let chars = trimmed.chars().count();
    if chars > HARD_MAX_CHARS {
        errors.push(format!(
            "Content is {chars} characters, above the {HARD_MAX_CHARS} limit"
        ));
    } else if chars > SOFT_MAX_CHARS {
        warnings.push(format!(
            "Content is {chars} characters, longer than the recommended {SOFT_MAX_CHARS}"
        ));
    } else if chars < MIN_RECOMMENDED_CHARS {
        warnings.push(format!("Content is very short ({chars} characters)"));
    }

    for (pattern, message) in SUSPICIOUS.iter() {
        if pattern.is_match(trimmed) {
            warnings.push((*message).to_string());
        }
    }

    if trimmed.matches("```").count() % 2 == 1 {
        warnings.push("Unbalanced code fence".to_string());
    }

    ValidationResult::from_findings(warnings, errors)
}

/// [`GenerationClient`] layer validating every generated result
pub struct ValidationLayer<C> {
    inner: C,
}

impl<C: GenerationClient> ValidationLayer<C> {
    /// Validate results produced by `inner`
    pub fn new(inner: C) -> Self {
        Self { inner }
    }
}

#[async_trait]
impl<C: GenerationClient> GenerationClient for ValidationLayer<C> {
    async fn generate(&self, request: &GenerationRequest) -> Result<GenerationResult> {
        let result = self.inner.generate(request).await?;
        let validation = validate_content(&result.content);

        if !validation.is_valid {
            warn!(errors = ?validation.errors, "Generated content rejected");
            return Err(Error::Validation {
                errors: validation.errors,
            });
        }
        if !validation.warnings.is_empty() {
            debug!(warnings = ?validation.warnings, "Generated content has warnings");
        }
        Ok(result.with_validation(validation))
    }

    async fn ping(&self) -> Result<()> {
        self.inner.ping().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_clean_text_passes() {
        let result = validate_content("Join us on Friday for the community picnic in the park.");
        assert!(result.is_valid);
        assert!(result.warnings.is_empty(), "{:?}", result.warnings);
    }

    #[test]
    fn test_empty_is_error() {
        let result = validate_content("   \n\t");
        assert!(!result.is_valid);
        assert_eq!(result.errors, vec!["Content is empty".to_string()]);
    }

    #[test]
    fn test_length_limits() {
        let short = validate_content("Hi there");
        assert!(short.is_valid);
        assert!(short.warnings[0].contains("very short"));

        let long = validate_content(&"a".repeat(SOFT_MAX_CHARS + 1));
        assert!(long.is_valid);
        assert!(long.warnings[0].contains("longer than"));

        let huge = validate_content(&"a".repeat(HARD_MAX_CHARS + 1));
        assert!(!huge.is_valid);
    }

    #[test]
    fn test_placeholders_warn() {
        let result = validate_content("Dear [INSERT NAME], welcome to {{ event }} this weekend!");
        assert!(result.is_valid);
        assert_eq!(result.warnings.len(), 2);
    }

    #[test]
    fn test_refusal_warns() {
        let result = validate_content("I'm sorry, but I cannot help with writing that post.");
        assert!(result.warnings.iter().any(|w| w.contains("refusal")));
    }

    #[test]
    fn test_unbalanced_fence_warns() {
        let result = validate_content("Here is the snippet:\n```rust\nfn main() {}\n");
        assert!(result.warnings.iter().any(|w| w.contains("code fence")));

        let balanced = validate_content("Here is the snippet:\n```rust\nfn main() {}\n```");
        assert!(!balanced.warnings.iter().any(|w| w.contains("code fence")));
    }

    struct FixedClient(&'static str);

    #[async_trait]
    impl GenerationClient for FixedClient {
        async fn generate(&self, _request: &GenerationRequest) -> Result<GenerationResult> {
            Ok(GenerationResult::new(self.0, "fixed", 10, 0.9))
        }

        async fn ping(&self) -> Result<()> {
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_layer_rejects_invalid_content() {
        let layer = ValidationLayer::new(FixedClient("  "));
        let err = layer
            .generate(&GenerationRequest::new("anything"))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Validation { errors } if errors.len() == 1));
    }

    #[tokio::test]
    async fn test_layer_attaches_warnings() {
        let layer = ValidationLayer::new(FixedClient("Short"));
        let result = layer.generate(&GenerationRequest::new("anything")).await.unwrap();
        assert!(result.validation.is_valid);
        assert_eq!(result.validation.warnings.len(), 1);
    }
}
