//! OpenAI-compatible chat completions (`POST {api_base}/chat/completions`).

use super::{GenerationRequest, ReplyGenerator};
use crate::config::LlmConfig;
use crate::error::{PipelineError, PipelineResult};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::debug;

pub struct OpenAiGenerator {
    client: reqwest::Client,
    endpoint: String,
    api_key: String,
    model: String,
    temperature: f32,
    max_tokens: u32,
}

#[derive(Debug, Serialize, PartialEq)]
struct ChatMessage<'a> {
    role: &'static str,
    content: &'a str,
}

#[derive(Serialize)]
struct ChatRequest<'a> {
    model: &'a str,
    messages: Vec<ChatMessage<'a>>,
    temperature: f32,
    max_tokens: u32,
    stream: bool,
}

#[derive(Deserialize)]
struct ChatResponse {
    choices: Vec<Choice>,
}

#[derive(Deserialize)]
struct Choice {
    message: ResponseMessage,
}

#[derive(Deserialize)]
struct ResponseMessage {
    #[serde(default)]
    content: Option<String>,
}

impl OpenAiGenerator {
    pub fn new(client: reqwest::Client, llm: &LlmConfig) -> Self {
        Self {
            client,
            endpoint: format!("{}/chat/completions", llm.api_base.trim_end_matches('/')),
            api_key: llm.api_key.clone(),
            model: llm.model.clone(),
            temperature: llm.temperature,
            max_tokens: llm.max_tokens,
        }
    }
}

/// System prompt, prior exchanges, then the new user message.
fn build_messages<'a>(request: &GenerationRequest<'a>) -> Vec<ChatMessage<'a>> {
    let mut messages = Vec::with_capacity(2 + request.history.len() * 2);
    messages.push(ChatMessage {
        role: "system",
        content: &request.persona.system_prompt,
    });
    for exchange in request.history {
        messages.push(ChatMessage {
            role: "user",
            content: &exchange.user,
        });
        messages.push(ChatMessage {
            role: "assistant",
            content: &exchange.assistant,
        });
    }
    messages.push(ChatMessage {
        role: "user",
        content: request.text,
    });
    messages
}

#[async_trait]
impl ReplyGenerator for OpenAiGenerator {
    async fn generate(&self, request: GenerationRequest<'_>) -> PipelineResult<String> {
        let body = ChatRequest {
            model: &self.model,
            messages: build_messages(&request),
            temperature: self.temperature,
            max_tokens: self.max_tokens,
            stream: false,
        };
        debug!(persona = %request.persona.id, history = request.history.len(), "Requesting chat completion");

        let mut http = self.client.post(&self.endpoint).json(&body);
        if !self.api_key.is_empty() {
            http = http.bearer_auth(&self.api_key);
        }

        let response = http
            .send()
            .await
            .map_err(|e| PipelineError::Generation(format!("backend unavailable: {}", e)))?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(PipelineError::Generation(format!("backend returned {}: {}", status, body)));
        }

        let parsed: ChatResponse = response
            .json()
            .await
            .map_err(|e| PipelineError::Generation(format!("unexpected response: {}", e)))?;

        parsed
            .choices
            .into_iter()
            .next()
            .and_then(|c| c.message.content)
            .map(|text| text.trim().to_string())
            .filter(|text| !text.is_empty())
            .ok_or_else(|| PipelineError::Generation("backend returned an empty reply".to_string()))
    }

    fn name(&self) -> &str {
        "openai"
    }
}
