//! # Speech Synthesis
//!
//! Text-to-speech behind the [`SpeechSynthesizer`] trait. Synthesizers write the
//! audio into a path owned by the turn (a staged artifact) rather than returning
//! bytes, so a large reply streams straight to disk and is cleaned up with the
//! turn's other artifacts.

pub mod openai;

pub use openai::OpenAiSynthesizer;

use crate::config::AppConfig;
use crate::error::PipelineResult;
use async_trait::async_trait;
use std::path::Path;
use std::sync::Arc;

#[async_trait]
pub trait SpeechSynthesizer: Send + Sync {
    /// Synthesize `text` with `voice` into the file at `out`.
    async fn synthesize(&self, text: &str, voice: &str, out: &Path) -> PipelineResult<()>;

    fn name(&self) -> &str;
}

pub fn from_config(config: &AppConfig, http: reqwest::Client) -> Arc<dyn SpeechSynthesizer> {
    let synthesizer = Arc::new(OpenAiSynthesizer::new(http, &config.tts));
    tracing::info!(voice = %config.tts.voice, format = %config.tts.format, "Speech synthesizer ready");
    synthesizer
}
