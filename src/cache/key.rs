//! Cache key derivation and similarity scoring
//!
//! The exact key is `{prefix}:{kind}:{sha256}` where the digest covers the
//! normalized prompt, the request context and every option that can change
//! the generated text. The timeout is deliberately left out.
//!
//! Approximate matching compares [`Characteristics`] instead of keys.

use std::collections::BTreeMap;

use gateway_core::{GenerationOptions, GenerationRequest};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

const CATEGORY_WEIGHT: f64 = 0.3;
const AUDIENCE_WEIGHT: f64 = 0.2;
const OPTIONS_WEIGHT: f64 = 0.3;
const LENGTH_WEIGHT: f64 = 0.2;

/// Prompt length bucket boundaries (characters)
const LENGTH_BUCKETS: [usize; 4] = [100, 500, 1500, 5000];

/// Coarse request shape compared during similarity search
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Characteristics {
    /// Workload label
    pub kind: String,
    /// Content category
    pub category: Option<String>,
    /// Intended audience
    pub audience: Option<String>,
    /// Prompt length bucket (0 = shortest)
    pub length_bucket: u8,
    /// Digest of the generation options
    pub options_fingerprint: String,
}

impl Characteristics {
    /// Extract characteristics from a request
    #[must_use]
    pub fn of(request: &GenerationRequest) -> Self {
        let context = request.context();
        Self {
            kind: context.kind.clone(),
            category: context.category.clone(),
            audience: context.audience.clone(),
            length_bucket: length_bucket(request.prompt().chars().count()),
            options_fingerprint: options_fingerprint(request.options()),
        }
    }

    /// Similarity score in `[0.0, 1.0]`.
    ///
    /// Different kinds never match, and neither does a request missing its
    /// category or audience. Otherwise the score is a weighted sum of
    /// category, audience, option and length agreement; adjacent length
    /// buckets earn half the length weight.
    #[must_use]
    pub fn similarity(&self, other: &Self) -> f64 {
        if self.kind != other.kind {
            return 0.0;
        }
        let (Some(category), Some(other_category)) = (&self.category, &other.category) else {
            return 0.0;
        };
        let (Some(audience), Some(other_audience)) = (&self.audience, &other.audience) else {
            return 0.0;
        };

        let mut score = 0.0;
        if category.eq_ignore_ascii_case(other_category) {
            score += CATEGORY_WEIGHT;
        }
        if audience.eq_ignore_ascii_case(other_audience) {
            score += AUDIENCE_WEIGHT;
        }
        if self.options_fingerprint == other.options_fingerprint {
            score += OPTIONS_WEIGHT;
        }
        match self.length_bucket.abs_diff(other.length_bucket) {
            0 => score += LENGTH_WEIGHT,
            1 => score += LENGTH_WEIGHT / 2.0,
            _ => {}
        }
        score
    }
}

/// Exact-match key plus the characteristics used for approximate lookups
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CacheKey {
    key: String,
    characteristics: Characteristics,
}

impl CacheKey {
    /// Derive the key for `request`
    #[must_use]
    pub fn derive(prefix: &str, request: &GenerationRequest) -> Self {
        let context = request.context();
        let options = request.options();

        let mut parts: BTreeMap<&str, String> = BTreeMap::new();
        parts.insert("prompt", normalize_prompt(request.prompt()));
        parts.insert("options", options_canonical(options));
        if let Some(category) = &context.category {
            parts.insert("category", category.to_lowercase());
        }
        if let Some(audience) = &context.audience {
            parts.insert("audience", audience.to_lowercase());
        }

        let canonical = serde_json::to_string(&parts).unwrap_or_default();
        let digest = hex::encode(Sha256::digest(canonical.as_bytes()));

        Self {
            key: format!("{prefix}:{}:{digest}", context.kind),
            characteristics: Characteristics::of(request),
        }
    }

    /// The key string
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.key
    }

    /// Characteristics for similarity search
    #[must_use]
    pub fn characteristics(&self) -> &Characteristics {
        &self.characteristics
    }
}

impl std::fmt::Display for CacheKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.key)
    }
}

/// Collapse whitespace runs so formatting-only differences share a key
fn normalize_prompt(prompt: &str) -> String {
    prompt.split_whitespace().collect::<Vec<_>>().join(" ")
}

fn options_canonical(options: &GenerationOptions) -> String {
    format!(
        "model={};max_tokens={};temperature={:.2};system={}",
        options.model.as_deref().unwrap_or(""),
        options.max_tokens,
        options.temperature,
        options.system_prompt.as_deref().unwrap_or("")
    )
}

fn options_fingerprint(options: &GenerationOptions) -> String {
    let digest = hex::encode(Sha256::digest(options_canonical(options).as_bytes()));
    digest[..16].to_string()
}

fn length_bucket(chars: usize) -> u8 {
    let bucket = LENGTH_BUCKETS
        .iter()
        .position(|&limit| chars < limit)
        .unwrap_or(LENGTH_BUCKETS.len());
    u8::try_from(bucket).unwrap_or(u8::MAX)
}

#[cfg(test)]
mod tests {
    use super::*;
    use gateway_core::RequestContext;

    fn post(prompt: &str, category: &str, audience: &str) -> GenerationRequest {
        GenerationRequest::new(prompt).with_context(
            RequestContext::new("post")
                .with_category(category)
                .with_audience(audience),
        )
    }

    #[test]
    fn test_key_is_deterministic() {
        let a = CacheKey::derive("genai", &GenerationRequest::new("Write a haiku"));
        let b = CacheKey::derive("genai", &GenerationRequest::new("Write a haiku"));
        assert_eq!(a, b);
        assert!(a.as_str().starts_with("genai:generic:"));
    }

    #[test]
    fn test_whitespace_is_normalized() {
        let a = CacheKey::derive("genai", &GenerationRequest::new("Write  a\nhaiku "));
        let b = CacheKey::derive("genai", &GenerationRequest::new("Write a haiku"));
        assert_eq!(a.as_str(), b.as_str());
    }

    #[test]
    fn test_options_change_key() {
        let base = GenerationRequest::new("Write a haiku");
        let warmer = GenerationRequest::new("Write a haiku")
            .with_options(GenerationOptions::default().with_temperature(1.2));
        assert_ne!(
            CacheKey::derive("genai", &base).as_str(),
            CacheKey::derive("genai", &warmer).as_str()
        );
    }

    #[test]
    fn test_timeout_does_not_change_key() {
        let base = GenerationRequest::new("Write a haiku");
        let patient = GenerationRequest::new("Write a haiku").with_options(
            GenerationOptions::default().with_timeout(std::time::Duration::from_secs(90)),
        );
        assert_eq!(
            CacheKey::derive("genai", &base).as_str(),
            CacheKey::derive("genai", &patient).as_str()
        );
    }

    #[test]
    fn test_similar_posts_score_high() {
        let a = Characteristics::of(&post("Announce the spring meetup", "events", "members"));
        let b = Characteristics::of(&post("Announce the autumn meetup", "events", "members"));
        assert!(a.similarity(&b) > 0.99);
    }

    #[test]
    fn test_adjacent_length_bucket_scores_partial() {
        let short = Characteristics::of(&post("Short prompt", "events", "members"));
        let longer = Characteristics::of(&post(&"word ".repeat(40), "events", "members"));
        let score = short.similarity(&longer);
        assert!((score - 0.9).abs() < 1e-9);
    }

    #[test]
    fn test_missing_context_never_matches() {
        let bare = Characteristics::of(&GenerationRequest::new("Announce the meetup"));
        assert!(bare.similarity(&bare).abs() < f64::EPSILON);

        let no_audience = Characteristics::of(
            &GenerationRequest::new("x").with_context(RequestContext::new("post").with_category("events")),
        );
        assert!(no_audience.similarity(&no_audience).abs() < f64::EPSILON);
    }

    #[test]
    fn test_kind_mismatch_never_matches() {
        let post = Characteristics::of(&post("Announce", "events", "members"));
        let mut tags = post.clone();
        tags.kind = "tags".into();
        assert!(post.similarity(&tags).abs() < f64::EPSILON);
    }

    #[test]
    fn test_length_buckets() {
        assert_eq!(length_bucket(0), 0);
        assert_eq!(length_bucket(99), 0);
        assert_eq!(length_bucket(100), 1);
        assert_eq!(length_bucket(4999), 3);
        assert_eq!(length_bucket(100_000), 4);
    }
}
