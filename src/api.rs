//! LLM inference interface and an OpenAI-compatible HTTP implementation.
//!
//! The pipeline only ever talks to an [`InferenceClient`]: given a prompt, a
//! token budget and a timeout it returns generated text or an
//! [`InferenceError`]. Retries live one level up, in the batch scheduler, so
//! that a batch whose response cannot be mapped back onto its items is retried
//! the same way as a transport failure.
//!
//! # Architecture
//!
//! - [`InferenceClient`]: the trait the filter and summarizer depend on
//! - [`complete_with_timeout`]: enforces the per-call deadline for any client
//! - [`OpenAiClient`]: chat-completions client for OpenAI-compatible servers

use crate::config::InferenceConfig;
use crate::error::InferenceError;
use crate::models::Operation;
use crate::utils::truncate_for_log;
use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::{Duration, Instant};
use tracing::{debug, instrument, warn};

/// A single prompt sent to the model.
#[derive(Debug, Clone)]
pub struct CompletionRequest {
    /// Which pipeline stage issued the request. Clients may pick a model per
    /// operation.
    pub operation: Operation,
    /// System instructions.
    pub system: String,
    /// User prompt, already truncated to its budget.
    pub prompt: String,
    pub max_tokens: u32,
    /// Per-call deadline.
    pub timeout: Duration,
}

/// Text generated by the model.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Completion {
    pub text: String,
}

impl Completion {
    pub fn new(text: impl Into<String>) -> Self {
        Self { text: text.into() }
    }
}

/// Opaque text-generation capability.
#[async_trait]
pub trait InferenceClient: Send + Sync {
    /// Generate a response for one prompt.
    async fn complete(&self, request: &CompletionRequest) -> Result<Completion, InferenceError>;

    /// Whether the client copes with prompts that carry several articles and
    /// expect one answer per article. Clients that do not are driven one
    /// article per call.
    fn supports_multi_item(&self) -> bool {
        true
    }
}

/// Call `client` and fail with [`InferenceError::Timeout`] once
/// `request.timeout` elapses.
#[instrument(level = "debug", skip_all, fields(operation = %request.operation))]
pub async fn complete_with_timeout(
    client: &dyn InferenceClient,
    request: &CompletionRequest,
) -> Result<Completion, InferenceError> {
    let t0 = Instant::now();
    let res = match tokio::time::timeout(request.timeout, client.complete(request)).await {
        Ok(res) => res,
        Err(_) => Err(InferenceError::Timeout {
            after: request.timeout,
        }),
    };
    let dt = t0.elapsed();

    match &res {
        Ok(c) => debug!(
            elapsed_ms = dt.as_millis() as u64,
            bytes = c.text.len(),
            "Inference call succeeded"
        ),
        Err(e) => warn!(elapsed_ms = dt.as_millis() as u64, error = %e, "Inference call failed"),
    }
    res
}

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
}

#[derive(Deserialize)]
struct Choice {
    message: Message,
}

#[derive(Deserialize)]
struct Message {
    content: Option<String>,
}

/// Chat-completions client for OpenAI and compatible servers.
pub struct OpenAiClient {
    client: Client,
    api_key: String,
    base_url: String,
    filter_model: String,
    summarize_model: String,
    temperature: f32,
}

impl OpenAiClient {
    pub fn new(config: &InferenceConfig) -> Self {
        Self {
            client: Client::new(),
            api_key: config.resolved_api_key().unwrap_or_default(),
            base_url: config.api_base.trim_end_matches('/').to_string(),
            filter_model: config.filter_model.clone(),
            summarize_model: config.summarize_model.clone(),
            temperature: config.temperature,
        }
    }

    fn model_for(&self, operation: Operation) -> &str {
        match operation {
            Operation::Filter => &self.filter_model,
            Operation::Summarize => &self.summarize_model,
        }
    }
}

impl fmt::Debug for OpenAiClient {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("OpenAiClient")
            .field("api_key", &"<redacted>")
            .field("base_url", &self.base_url)
            .field("filter_model", &self.filter_model)
            .field("summarize_model", &self.summarize_model)
            .finish()
    }
}

#[async_trait]
impl InferenceClient for OpenAiClient {
    #[instrument(level = "info", skip_all, fields(operation = %request.operation))]
    async fn complete(&self, request: &CompletionRequest) -> Result<Completion, InferenceError> {
        let body = ChatRequest {
            model: self.model_for(request.operation),
            messages: vec![
                ChatMessage {
                    role: "system",
                    content: &request.system,
                },
                ChatMessage {
                    role: "user",
                    content: &request.prompt,
                },
            ],
            max_tokens: request.max_tokens,
            temperature: self.temperature,
        };

        let response = self
            .client
            .post(format!("{}/chat/completions", self.base_url))
            .bearer_auth(&self.api_key)
            .timeout(request.timeout)
            .json(&body)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            return Err(InferenceError::Status {
                status: status.as_u16(),
                body: truncate_for_log(&text, 300),
            });
        }

        let parsed: ChatResponse = response.json().await?;
        let text = parsed
            .choices
            .into_iter()
            .next()
            .and_then(|c| c.message.content)
            .filter(|t| !t.trim().is_empty())
            .ok_or(InferenceError::EmptyResponse)?;

        Ok(Completion { text })
    }
}
