//! # Reply Generation
//!
//! Conversational backends behind the [`ReplyGenerator`] trait. The caller
//! resolves the persona first (unknown roles already fell back to the default),
//! so generators only deal with prompt construction and transport.
//!
//! ## Backends (`llm.backend`):
//! - **openai**: any OpenAI-compatible `/chat/completions` API (Qwen on DashScope, Ollama, ...)
//! - **template**: offline canned replies from the persona's template

pub mod openai;
pub mod template;

pub use openai::OpenAiGenerator;
pub use template::TemplateGenerator;

use crate::config::{AppConfig, LlmBackendKind};
use crate::error::PipelineResult;
use crate::pipeline::{Exchange, Persona};
use async_trait::async_trait;
use std::sync::Arc;

/// Everything a backend needs to answer one user utterance.
#[derive(Debug, Clone, Copy)]
pub struct GenerationRequest<'a> {
    pub text: &'a str,
    pub persona: &'a Persona,
    /// Earlier exchanges of the session, oldest first
    pub history: &'a [Exchange],
}

#[async_trait]
pub trait ReplyGenerator: Send + Sync {
    async fn generate(&self, request: GenerationRequest<'_>) -> PipelineResult<String>;

    fn name(&self) -> &str;
}

pub fn from_config(config: &AppConfig, http: reqwest::Client) -> Arc<dyn ReplyGenerator> {
    let generator: Arc<dyn ReplyGenerator> = match config.llm.backend {
        LlmBackendKind::Openai => Arc::new(OpenAiGenerator::new(http, &config.llm)),
        LlmBackendKind::Template => Arc::new(TemplateGenerator),
    };
    if config.llm.backend == LlmBackendKind::Openai && config.llm.api_key.is_empty() {
        tracing::warn!(api_base = %config.llm.api_base, "llm.api_key is empty, the chat API may refuse every request");
    }
    tracing::info!(backend = generator.name(), "Reply generator ready");
    generator
}
