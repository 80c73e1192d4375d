//! OpenAI-compatible HTTP generation client
//!
//! Sends one `POST {base_url}/chat/completions` per request with a system +
//! user message pair and maps the response into a [`GenerationResult`].

use std::time::Duration;

use async_trait::async_trait;
use gateway_core::{GenerationRequest, GenerationResult};
use reqwest::Client;
use serde::{Deserialize, Serialize};
use tracing::debug;
use url::Url;

use super::GenerationClient;
use crate::config::ProviderConfig;
use crate::{Error, Result};

/// HTTP client for an OpenAI-compatible chat completions API
pub struct HttpGenerationClient {
    /// HTTP client
    client: Client,
    /// Base URL, always ending in `/`
    base_url: Url,
    /// Bearer token
    api_key: Option<String>,
    /// Model used when the request names none
    default_model: String,
    /// Upper bound for any request deadline
    max_timeout: Duration,
}

#[derive(Debug, Serialize)]
struct ChatRequest<'a> {
    model: &'a str,
    messages: Vec<ChatMessage<'a>>,
    max_tokens: u32,
    temperature: f32,
}

#[derive(Debug, Serialize)]
struct ChatMessage<'a> {
    role: &'static str,
    content: &'a str,
}

#[derive(Debug, Deserialize)]
struct ChatResponse {
    #[serde(default)]
    model: Option<String>,
    #[serde(default)]
    choices: Vec<ChatChoice>,
    #[serde(default)]
    usage: Option<ChatUsage>,
}

#[derive(Debug, Deserialize)]
struct ChatChoice {
    message: ChatChoiceMessage,
    #[serde(default)]
    finish_reason: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ChatChoiceMessage {
    #[serde(default)]
    content: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ChatUsage {
    #[serde(default)]
    total_tokens: u32,
}

impl HttpGenerationClient {
    /// Create a client from provider configuration
    ///
    /// # Errors
    ///
    /// Returns [`Error::Config`] for an unparseable base URL and
    /// [`Error::Http`] if the HTTP client cannot be built.
    pub fn new(config: &ProviderConfig) -> Result<Self> {
        let mut raw = config.base_url.clone();
        if !raw.ends_with('/') {
            raw.push('/');
        }
        let base_url = Url::parse(&raw)
            .map_err(|e| Error::Config(format!("Invalid provider base_url '{raw}': {e}")))?;

        let client = Client::builder()
            .pool_max_idle_per_host(10)
            .pool_idle_timeout(Duration::from_secs(90))
            .tcp_nodelay(true)
            .build()?;

        Ok(Self {
            client,
            base_url,
            api_key: config.resolve_api_key(),
            default_model: config.default_model.clone(),
            max_timeout: config.timeout,
        })
    }

    fn endpoint(&self, path: &str) -> Result<Url> {
        self.base_url
            .join(path)
            .map_err(|e| Error::Internal(format!("Cannot build endpoint '{path}': {e}")))
    }

    fn authorize(&self, builder: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        match &self.api_key {
            Some(key) => builder.bearer_auth(key),
            None => builder,
        }
    }

    async fn send(&self, request: &GenerationRequest) -> Result<GenerationResult> {
        let options = request.options();
        let model = options.model.as_deref().unwrap_or(&self.default_model);

        let mut messages = Vec::with_capacity(2);
        if let Some(system) = options.system_prompt.as_deref() {
            messages.push(ChatMessage {
                role: "system",
                content: system,
            });
        }
        messages.push(ChatMessage {
            role: "user",
            content: request.prompt(),
        });

        let body = ChatRequest {
            model,
            messages,
            max_tokens: options.max_tokens,
            temperature: options.temperature,
        };

        let response = self
            .authorize(self.client.post(self.endpoint("chat/completions")?))
            .json(&body)
            .send()
            .await
            .map_err(|e| Error::Provider(format!("Request failed: {e}")))?;

        let status = response.status();
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            return Err(Error::Provider(format!(
                "Provider returned {status}: {}",
                truncate(&text, 200)
            )));
        }

        let parsed: ChatResponse = response
            .json()
            .await
            .map_err(|e| Error::Provider(format!("Malformed response body: {e}")))?;

        let choice = parsed
            .choices
            .into_iter()
            .next()
            .ok_or_else(|| Error::Provider("Response contained no choices".into()))?;
        let content = choice
            .message
            .content
            .filter(|c| !c.trim().is_empty())
            .ok_or_else(|| Error::Provider("Response contained no content".into()))?;

        let tokens = parsed.usage.map_or(0, |u| u.total_tokens);
        let confidence = confidence_for(choice.finish_reason.as_deref());
        let model_used = parsed.model.unwrap_or_else(|| model.to_string());

        debug!(model = %model_used, tokens, "Provider generation complete");

        Ok(GenerationResult::new(content, model_used, tokens, confidence))
    }
}

#[async_trait]
impl GenerationClient for HttpGenerationClient {
    async fn generate(&self, request: &GenerationRequest) -> Result<GenerationResult> {
        let deadline = request.options().timeout.min(self.max_timeout);
        tokio::time::timeout(deadline, self.send(request))
            .await
            .map_err(|_| Error::Timeout(deadline))?
    }

    async fn ping(&self) -> Result<()> {
        let response = self
            .authorize(self.client.get(self.endpoint("models")?))
            .timeout(Duration::from_secs(10))
            .send()
            .await
            .map_err(|e| Error::Provider(format!("Ping failed: {e}")))?;

        if response.status().is_success() {
            Ok(())
        } else {
            Err(Error::Provider(format!(
                "Ping returned {}",
                response.status()
            )))
        }
    }
}

/// Map the provider's stop reason onto a coarse confidence score
fn confidence_for(finish_reason: Option<&str>) -> f64 {
    match finish_reason {
        Some("stop") => 0.9,
        Some("length") => 0.6,
        _ => 0.5,
    }
}

fn truncate(text: &str, max_chars: usize) -> String {
    text.chars().take(max_chars).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use gateway_core::GenerationOptions;

    fn config_for(url: &str) -> ProviderConfig {
        ProviderConfig {
            base_url: url.to_string(),
            api_key: Some("test-key".into()),
            default_model: "test-model".into(),
            timeout: Duration::from_secs(5),
        }
    }

    #[tokio::test]
    async fn test_generate_parses_completion() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("POST", "/v1/chat/completions")
            .match_header("authorization", "Bearer test-key")
            .with_status(200)
            .with_header("content-type", "application/json")
            .with_body(
                r#"{"model":"test-model","choices":[{"message":{"content":"Hello there"},"finish_reason":"stop"}],"usage":{"total_tokens":17}}"#,
            )
            .create_async()
            .await;

        let client = HttpGenerationClient::new(&config_for(&format!("{}/v1", server.url()))).unwrap();
        let result = client
            .generate(&GenerationRequest::new("Say hello"))
            .await
            .unwrap();

        mock.assert_async().await;
        assert_eq!(result.content, "Hello there");
        assert_eq!(result.metadata.tokens, 17);
        assert_eq!(result.metadata.model, "test-model");
        assert!((result.metadata.confidence - 0.9).abs() < f64::EPSILON);
        assert!(!result.metadata.cached);
    }

    #[tokio::test]
    async fn test_non_success_status_is_provider_error() {
        let mut server = mockito::Server::new_async().await;
        let _mock = server
            .mock("POST", "/chat/completions")
            .with_status(503)
            .with_body("overloaded")
            .create_async()
            .await;

        let client = HttpGenerationClient::new(&config_for(&server.url())).unwrap();
        let err = client
            .generate(&GenerationRequest::new("hi"))
            .await
            .unwrap_err();

        assert!(matches!(err, Error::Provider(ref m) if m.contains("503")));
    }

    #[tokio::test]
    async fn test_malformed_body_is_provider_error() {
        let mut server = mockito::Server::new_async().await;
        let _mock = server
            .mock("POST", "/chat/completions")
            .with_status(200)
            .with_body(r#"{"choices":[]}"#)
            .create_async()
            .await;

        let client = HttpGenerationClient::new(&config_for(&server.url())).unwrap();
        let err = client
            .generate(&GenerationRequest::new("hi"))
            .await
            .unwrap_err();

        assert!(matches!(err, Error::Provider(_)));
    }

    #[tokio::test]
    async fn test_deadline_exceeded_is_timeout() {
        // Accept connections but never answer
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let mut held = Vec::new();
            while let Ok((socket, _)) = listener.accept().await {
                held.push(socket);
            }
        });

        let client = HttpGenerationClient::new(&config_for(&format!("http://{addr}"))).unwrap();
        let request = GenerationRequest::new("hi")
            .with_options(GenerationOptions::default().with_timeout(Duration::from_millis(20)));

        let err = client.generate(&request).await.unwrap_err();
        assert!(matches!(err, Error::Timeout(d) if d == Duration::from_millis(20)));
    }

    #[test]
    fn test_invalid_base_url_rejected() {
        assert!(matches!(
            HttpGenerationClient::new(&config_for("not a url")),
            Err(Error::Config(_))
        ));
    }

    #[test]
    fn test_confidence_mapping() {
        assert!((confidence_for(Some("stop")) - 0.9).abs() < f64::EPSILON);
        assert!((confidence_for(Some("length")) - 0.6).abs() < f64::EPSILON);
        assert!((confidence_for(None) - 0.5).abs() < f64::EPSILON);
    }
}
