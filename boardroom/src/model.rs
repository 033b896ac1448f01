//! External model and embedding call contracts.
//!
//! The engine never implements inference; it talks to collaborators through
//! [`ModelClient`] and [`EmbeddingProvider`]. A bundled OpenAI-style HTTP
//! client and a retrying wrapper cover the common deployment, and tests
//! substitute scripted clients.

use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::config::RetryPolicy;
use crate::error::{EngineError, EngineResult};

/// One chat message in a model request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelMessage {
    pub role: String,
    pub content: String,
}

impl ModelMessage {
    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: "user".to_string(),
            content: content.into(),
        }
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self {
            role: "assistant".to_string(),
            content: content.into(),
        }
    }
}

/// Request for one model completion.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelRequest {
    pub system_prompt: String,
    pub messages: Vec<ModelMessage>,
    pub model: String,
    pub max_tokens: u32,
    pub temperature: f32,
    /// Optional assistant prefill appended as the final message.
    pub prefill: Option<String>,
}

impl ModelRequest {
    pub fn new(system_prompt: &str, user_content: &str, model: &str) -> Self {
        Self {
            system_prompt: system_prompt.to_string(),
            messages: vec![ModelMessage::user(user_content)],
            model: model.to_string(),
            max_tokens: 2048,
            temperature: 0.7,
            prefill: None,
        }
    }

    pub fn max_tokens(mut self, n: u32) -> Self {
        self.max_tokens = n;
        self
    }

    pub fn temperature(mut self, t: f32) -> Self {
        self.temperature = t;
        self
    }

    pub fn prefill(mut self, text: &str) -> Self {
        self.prefill = Some(text.to_string());
        self
    }
}

/// Token and cost accounting for one call.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct ModelUsage {
    pub input_tokens: u64,
    pub output_tokens: u64,
    pub cost: f64,
}

impl ModelUsage {
    pub fn add(&mut self, other: &ModelUsage) {
        self.input_tokens += other.input_tokens;
        self.output_tokens += other.output_tokens;
        self.cost += other.cost;
    }
}

/// Response from one model completion.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelResponse {
    pub success: bool,
    pub content: Option<String>,
    pub usage: ModelUsage,
}

impl ModelResponse {
    /// The response text, or an external-service error for empty/failed calls.
    pub fn text(&self) -> EngineResult<&str> {
        match (&self.content, self.success) {
            (Some(content), true) => Ok(content),
            _ => Err(EngineError::external(
                "model",
                "call reported failure or returned no content",
            )),
        }
    }
}

/// Completion contract implemented by LLM provider clients.
#[async_trait]
pub trait ModelClient: Send + Sync {
    async fn complete(&self, request: &ModelRequest) -> EngineResult<ModelResponse>;

    /// Provider name used for rate-limiter lookup and logging.
    fn provider_name(&self) -> &str;
}

/// Embedding contract for semantic similarity scoring.
#[async_trait]
pub trait EmbeddingProvider: Send + Sync {
    async fn embed(&self, text: &str) -> EngineResult<Vec<f32>>;
}

/// Shared reference to a model client.
pub type SharedModelClient = Arc<dyn ModelClient>;

/// Shared reference to an embedding provider.
pub type SharedEmbeddingProvider = Arc<dyn EmbeddingProvider>;

/// Wraps a client with exponential-backoff retries on retryable failures.
pub struct RetryingClient {
    inner: SharedModelClient,
    policy: RetryPolicy,
}

impl RetryingClient {
    pub fn new(inner: SharedModelClient, policy: RetryPolicy) -> Self {
        Self { inner, policy }
    }
}

#[async_trait]
impl ModelClient for RetryingClient {
    async fn complete(&self, request: &ModelRequest) -> EngineResult<ModelResponse> {
        let mut attempt = 0;
        loop {
            match self.inner.complete(request).await {
                Ok(response) => return Ok(response),
                Err(err) if err.is_retryable() && self.policy.should_retry(attempt) => {
                    attempt += 1;
                    let backoff = self.policy.backoff_duration(attempt);
                    warn!(
                        provider = self.inner.provider_name(),
                        attempt,
                        backoff_ms = backoff.as_millis() as u64,
                        error = %err,
                        "model call failed, retrying"
                    );
                    tokio::time::sleep(backoff).await;
                }
                Err(err) => return Err(err),
            }
        }
    }

    fn provider_name(&self) -> &str {
        self.inner.provider_name()
    }
}

/// OpenAI-compatible chat-completions client.
pub struct HttpModelClient {
    http: reqwest::Client,
    endpoint: String,
    api_key: Option<String>,
    provider: String,
}

impl HttpModelClient {
    pub fn new(endpoint: &str, api_key: Option<String>, timeout_ms: u64) -> EngineResult<Self> {
        let http = reqwest::Client::builder()
            .timeout(std::time::Duration::from_millis(timeout_ms))
            .build()
            .map_err(|e| EngineError::Configuration(format!("http client: {e}")))?;
        Ok(Self {
            http,
            endpoint: endpoint.to_string(),
            api_key,
            provider: "openai_compatible".to_string(),
        })
    }
}

#[async_trait]
impl ModelClient for HttpModelClient {
    async fn complete(&self, request: &ModelRequest) -> EngineResult<ModelResponse> {
        #[derive(Serialize)]
        struct ChatMessage<'a> {
            role: &'a str,
            content: &'a str,
        }

        #[derive(Serialize)]
        struct ChatRequest<'a> {
            model: &'a str,
            messages: Vec<ChatMessage<'a>>,
            max_tokens: u32,
            temperature: f32,
        }

        #[derive(Deserialize)]
        struct ChatResponse {
            choices: Vec<Choice>,
            #[serde(default)]
            usage: Option<WireUsage>,
        }

        #[derive(Deserialize)]
        struct Choice {
            message: ResponseMessage,
        }

        #[derive(Deserialize)]
        struct ResponseMessage {
            content: Option<String>,
        }

        #[derive(Deserialize, Default)]
        struct WireUsage {
            #[serde(default)]
            prompt_tokens: u64,
            #[serde(default)]
            completion_tokens: u64,
        }

        let mut messages = vec![ChatMessage {
            role: "system",
            content: &request.system_prompt,
        }];
        for m in &request.messages {
            messages.push(ChatMessage {
                role: &m.role,
                content: &m.content,
            });
        }
        if let Some(prefill) = &request.prefill {
            messages.push(ChatMessage {
                role: "assistant",
                content: prefill,
            });
        }

        let body = ChatRequest {
            model: &request.model,
            messages,
            max_tokens: request.max_tokens,
            temperature: request.temperature,
        };

        let mut req = self.http.post(&self.endpoint).json(&body);
        if let Some(key) = &self.api_key {
            req = req.bearer_auth(key);
        }

        let response = req
            .send()
            .await
            .map_err(|e| EngineError::external(&self.provider, e.to_string()))?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(EngineError::external(
                &self.provider,
                format!("HTTP {status}: {body}"),
            ));
        }

        let chat: ChatResponse = response
            .json()
            .await
            .map_err(|e| EngineError::external(&self.provider, e.to_string()))?;

        let content = chat
            .choices
            .first()
            .and_then(|c| c.message.content.clone());
        let usage = chat.usage.unwrap_or_default();

        debug!(
            provider = %self.provider,
            model = %request.model,
            input_tokens = usage.prompt_tokens,
            output_tokens = usage.completion_tokens,
            "model call complete"
        );

        Ok(ModelResponse {
            success: content.is_some(),
            content,
            usage: ModelUsage {
                input_tokens: usage.prompt_tokens,
                output_tokens: usage.completion_tokens,
                cost: 0.0,
            },
        })
    }

    fn provider_name(&self) -> &str {
        &self.provider
    }
}
