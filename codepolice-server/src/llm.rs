//! LLM access for analysis and fix generation.
//!
//! The pipeline only ever needs one operation: send a prompt, get text
//! back. [`LlmService`] keeps that seam narrow so tests can script
//! responses; [`OpenAiClient`] is the real chat-completions implementation.

use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::debug;

use crate::retry::ApiError;

#[async_trait]
pub trait LlmService: Send + Sync {
    /// Run one completion. The system prompt frames the task, the user
    /// prompt carries the code.
    async fn complete(&self, system: &str, user: &str) -> Result<String, ApiError>;
}

/// OpenAI-compatible chat completions client.
#[derive(Clone)]
pub struct OpenAiClient {
    client: Client,
    api_base: String,
    api_key: String,
    model: String,
}

#[derive(Debug, Serialize)]
struct ChatMessage {
    role: String,
    content: String,
}

#[derive(Debug, Serialize)]
struct ChatCompletionRequest {
    model: String,
    messages: Vec<ChatMessage>,
    temperature: f32,
}

#[derive(Debug, Deserialize)]
struct ChatCompletionResponse {
    choices: Vec<ChatChoice>,
}

#[derive(Debug, Deserialize)]
struct ChatChoice {
    message: ChatResponseMessage,
}

#[derive(Debug, Deserialize)]
struct ChatResponseMessage {
    content: Option<String>,
}

impl OpenAiClient {
    pub fn new(
        api_key: String,
        api_base: String,
        model: String,
        request_timeout: Duration,
    ) -> Result<Self, ApiError> {
        let client = Client::builder()
            .timeout(request_timeout)
            .build()
            .map_err(|e| ApiError::Fatal(format!("Failed to build HTTP client: {e}")))?;

        Ok(Self {
            client,
            api_base,
            api_key,
            model,
        })
    }
}

#[async_trait]
impl LlmService for OpenAiClient {
    async fn complete(&self, system: &str, user: &str) -> Result<String, ApiError> {
        let url = format!("{}/chat/completions", self.api_base);
        let request = ChatCompletionRequest {
            model: self.model.clone(),
            messages: vec![
                ChatMessage {
                    role: "system".to_string(),
                    content: system.to_string(),
                },
                ChatMessage {
                    role: "user".to_string(),
                    content: user.to_string(),
                },
            ],
            // Analysis output is parsed mechanically; keep it deterministic.
            temperature: 0.0,
        };

        debug!(model = %self.model, prompt_bytes = user.len(), "sending completion request");

        let response = self
            .client
            .post(&url)
            .header("Authorization", format!("Bearer {}", self.api_key))
            .json(&request)
            .send()
            .await
            .map_err(|e| ApiError::from_reqwest(e, "chat completion"))?;

        let status = response.status();
        if !status.is_success() {
            let error_text = response.text().await.unwrap_or_default();
            return Err(ApiError::from_status(status, "chat completion", &error_text));
        }

        let completion: ChatCompletionResponse = response
            .json()
            .await
            .map_err(|e| ApiError::Validation(format!("Failed to parse completion response: {e}")))?;

        completion
            .choices
            .into_iter()
            .next()
            .and_then(|choice| choice.message.content)
            .ok_or_else(|| ApiError::Validation("Completion response had no content".to_string()))
    }
}
