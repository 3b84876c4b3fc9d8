//! Reasoning service clients.
//!
//! [`ChatCompletionClient`] speaks the OpenAI-compatible chat completions
//! protocol. [`RetryingClient`] wraps any [`DecisionClient`] with bounded
//! retries of transient transport failures.

use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::error::TransportError;

/// Default OpenAI-compatible endpoint
const DEFAULT_LLM_URL: &str = "https://api.siliconflow.cn/v1";

/// Default model
const DEFAULT_MODEL: &str = "Qwen/Qwen2.5-72B-Instruct";

/// Fixed instructions sent as the system message of every request.
pub const SYSTEM_PROMPT: &str = "\
You are a senior SRE with ten years of Kubernetes production experience, operating a cluster \
managed strictly through GitOps (Argo CD + Kustomize). You are running a fully automated \
AIOps self-healing loop. You may change resources only by producing an RFC 6902 JSON Patch \
together with a target selector; no other mechanism is permitted.

Hard requirements (any violation makes the remediation fail):
1. Use RFC 6902 JSON Patch operations only (op is one of replace, add, remove).
2. Locate the resource with target.kind plus target.labelSelector. Never hardcode metadata.name.
3. Only Deployment, StatefulSet and HorizontalPodAutoscaler may be modified.
4. When scaling resources, raise requests and limits together to avoid CPU throttling.
5. All values must be sane production values: replicas <= 100, CPU <= 8 cores, memory <= 16Gi.
6. patch_file must be the current time given in the request plus a short lowercase English \
description, formatted exactly as YYYYMMDD-HHMMSS-short-desc.yaml \
(for example 20251126-204733-cpu-spike.yaml).
7. Output a single valid JSON object and nothing else: no explanation, no Markdown.";

/// Configuration for the reasoning service
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LlmConfig {
    /// Base URL of the OpenAI-compatible API (without `/chat/completions`)
    pub base_url: String,
    pub model: String,
    /// Environment variable holding the API key
    pub api_key_env: String,
    /// Per-attempt timeout in seconds
    pub timeout_secs: u64,
    pub max_attempts: u32,
    /// Delay between attempts in milliseconds
    pub retry_delay_ms: u64,
    pub temperature: Option<f32>,
    /// Ask for `response_format: json_object`
    pub json_mode: bool,
}

impl Default for LlmConfig {
    fn default() -> Self {
        Self {
            base_url: std::env::var("LLM_BASE_URL").unwrap_or_else(|_| DEFAULT_LLM_URL.to_string()),
            model: std::env::var("LLM_MODEL").unwrap_or_else(|_| DEFAULT_MODEL.to_string()),
            api_key_env: "LLM_API_KEY".to_string(),
            timeout_secs: 120,
            max_attempts: 3,
            retry_delay_ms: 2000,
            temperature: Some(0.2),
            json_mode: false,
        }
    }
}

impl LlmConfig {
    /// Upper bound on a full retrying call: every attempt plus every delay.
    #[must_use]
    pub fn total_budget(&self) -> Duration {
        let attempts = self.max_attempts.max(1);
        Duration::from_secs(self.timeout_secs)
            .saturating_mul(attempts)
            .saturating_add(Duration::from_millis(self.retry_delay_ms).saturating_mul(attempts - 1))
    }
}

/// Sends request text to the reasoning service and returns its raw reply.
#[async_trait]
pub trait DecisionClient: Send + Sync {
    async fn send(&self, request_text: &str) -> Result<String, TransportError>;
}

#[derive(Debug, Serialize)]
struct ChatMessage<'a> {
    role: &'static str,
    content: &'a str,
}

#[derive(Debug, Serialize)]
struct ResponseFormat {
    #[serde(rename = "type")]
    format_type: &'static str,
}

#[derive(Debug, Serialize)]
struct ChatRequest<'a> {
    model: &'a str,
    messages: Vec<ChatMessage<'a>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    temperature: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    response_format: Option<ResponseFormat>,
}

#[derive(Debug, Deserialize)]
struct ChatChoiceMessage {
    content: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ChatChoice {
    message: ChatChoiceMessage,
}

#[derive(Debug, Deserialize)]
struct ChatResponse {
    choices: Vec<ChatChoice>,
}

#[derive(Debug, Deserialize)]
struct ApiError {
    message: String,
}

#[derive(Debug, Deserialize)]
struct ApiErrorResponse {
    error: ApiError,
}

/// OpenAI-compatible chat completions client.
pub struct ChatCompletionClient {
    client: Client,
    api_key: Option<String>,
    endpoint: String,
    model: String,
    temperature: Option<f32>,
    json_mode: bool,
}

impl ChatCompletionClient {
    /// Build a client, reading the API key from `config.api_key_env`.
    ///
    /// # Panics
    /// Panics if the HTTP client cannot be created.
    #[must_use]
    pub fn from_config(config: &LlmConfig) -> Self {
        let api_key = std::env::var(&config.api_key_env)
            .ok()
            .filter(|k| !k.is_empty());
        if api_key.is_none() {
            debug!(env = %config.api_key_env, "Reasoning service API key not set");
        }
        Self::build(config, api_key)
    }

    /// Build a client with an explicit API key.
    #[must_use]
    pub fn with_api_key(config: &LlmConfig, api_key: impl Into<String>) -> Self {
        Self::build(config, Some(api_key.into()))
    }

    fn build(config: &LlmConfig, api_key: Option<String>) -> Self {
        let client = Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()
            .expect("Failed to create HTTP client");

        Self {
            client,
            api_key,
            endpoint: format!("{}/chat/completions", config.base_url.trim_end_matches('/')),
            model: config.model.clone(),
            temperature: config.temperature,
            json_mode: config.json_mode,
        }
    }

    #[must_use]
    pub fn is_configured(&self) -> bool {
        self.api_key.is_some()
    }
}

#[async_trait]
impl DecisionClient for ChatCompletionClient {
    async fn send(&self, request_text: &str) -> Result<String, TransportError> {
        let api_key = self
            .api_key
            .as_ref()
            .ok_or_else(|| TransportError::NotConfigured("reasoning service API key".to_string()))?;

        let request = ChatRequest {
            model: &self.model,
            messages: vec![
                ChatMessage {
                    role: "system",
                    content: SYSTEM_PROMPT,
                },
                ChatMessage {
                    role: "user",
                    content: request_text,
                },
            ],
            temperature: self.temperature,
            response_format: self.json_mode.then_some(ResponseFormat {
                format_type: "json_object",
            }),
        };

        debug!(model = %self.model, chars = request_text.len(), "Calling reasoning service");

        let response = self
            .client
            .post(&self.endpoint)
            .bearer_auth(api_key)
            .json(&request)
            .send()
            .await?;

        let status = response.status();
        let body = response.text().await?;

        if !status.is_success() {
            let body = serde_json::from_str::<ApiErrorResponse>(&body)
                .map(|e| e.error.message)
                .unwrap_or(body);
            return Err(TransportError::Status {
                status: status.as_u16(),
                body,
            });
        }

        let chat: ChatResponse = serde_json::from_str(&body)
            .map_err(|e| TransportError::Malformed(format!("chat completion envelope: {e}")))?;

        chat.choices
            .into_iter()
            .next()
            .and_then(|c| c.message.content)
            .ok_or_else(|| TransportError::Malformed("response has no message content".to_string()))
    }
}

/// Retries retryable transport failures with a fixed delay.
pub struct RetryingClient<C> {
    inner: C,
    max_attempts: u32,
    delay: Duration,
    cancel: CancellationToken,
}

impl<C: DecisionClient> RetryingClient<C> {
    #[must_use]
    pub fn new(inner: C, max_attempts: u32, delay: Duration) -> Self {
        Self {
            inner,
            max_attempts: max_attempts.max(1),
            delay,
            cancel: CancellationToken::new(),
        }
    }

    /// Stop retrying once `cancel` fires.
    #[must_use]
    pub fn with_cancellation(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }
}

#[async_trait]
impl<C: DecisionClient> DecisionClient for RetryingClient<C> {
    async fn send(&self, request_text: &str) -> Result<String, TransportError> {
        let mut attempt = 1;
        loop {
            match self.inner.send(request_text).await {
                Ok(text) => return Ok(text),
                Err(e) if e.is_retryable() && attempt < self.max_attempts => {
                    warn!(
                        attempt,
                        max_attempts = self.max_attempts,
                        error = %e,
                        "Reasoning service call failed, retrying"
                    );
                    tokio::select! {
                        () = self.cancel.cancelled() => return Err(e),
                        () = tokio::time::sleep(self.delay) => {}
                    }
                    attempt += 1;
                }
                Err(e) => return Err(e),
            }
        }
    }
}
