//! OpenAI-compatible speech endpoint (`POST {api_base}/audio/speech`).
//!
//! Works with OpenAI itself and with edge-tts proxies that expose the same API,
//! which is how Azure neural voices such as `zh-CN-XiaoxiaoNeural` are reached.

use super::SpeechSynthesizer;
use crate::config::TtsConfig;
use crate::error::{PipelineError, PipelineResult};
use async_trait::async_trait;
use futures_util::StreamExt;
use serde::Serialize;
use std::path::Path;
use tokio::io::AsyncWriteExt;
use tracing::debug;

pub struct OpenAiSynthesizer {
    client: reqwest::Client,
    endpoint: String,
    api_key: String,
    model: String,
    format: String,
}

#[derive(Serialize)]
struct SpeechRequest<'a> {
    model: &'a str,
    input: &'a str,
    voice: &'a str,
    response_format: &'a str,
}

impl OpenAiSynthesizer {
    pub fn new(client: reqwest::Client, tts: &TtsConfig) -> Self {
        Self {
            client,
            endpoint: format!("{}/audio/speech", tts.api_base.trim_end_matches('/')),
            api_key: tts.api_key.clone(),
            model: tts.model.clone(),
            format: tts.format.clone(),
        }
    }
}

fn synthesis_error(context: &str, e: impl std::fmt::Display) -> PipelineError {
    PipelineError::Synthesis(format!("{}: {}", context, e))
}

#[async_trait]
impl SpeechSynthesizer for OpenAiSynthesizer {
    async fn synthesize(&self, text: &str, voice: &str, out: &Path) -> PipelineResult<()> {
        let text = text.trim();
        if text.is_empty() {
            return Err(PipelineError::Synthesis("nothing to synthesize".to_string()));
        }

        let body = SpeechRequest {
            model: &self.model,
            input: text,
            voice,
            response_format: &self.format,
        };
        let mut request = self.client.post(&self.endpoint).json(&body);
        if !self.api_key.is_empty() {
            request = request.bearer_auth(&self.api_key);
        }

        let response = request
            .send()
            .await
            .map_err(|e| synthesis_error("backend unavailable", e))?;
        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(PipelineError::Synthesis(format!("backend returned {}: {}", status, body)));
        }

        let mut file = tokio::fs::File::create(out)
            .await
            .map_err(|e| synthesis_error("cannot create audio artifact", e))?;
        let mut stream = response.bytes_stream();
        let mut written = 0usize;
        while let Some(chunk) = stream.next().await {
            let chunk = chunk.map_err(|e| synthesis_error("audio stream interrupted", e))?;
            file.write_all(&chunk)
                .await
                .map_err(|e| synthesis_error("cannot write audio artifact", e))?;
            written += chunk.len();
        }
        file.flush()
            .await
            .map_err(|e| synthesis_error("cannot write audio artifact", e))?;

        if written == 0 {
            return Err(PipelineError::Synthesis("backend returned no audio".to_string()));
        }
        debug!(bytes = written, voice, "Synthesized reply audio");
        Ok(())
    }

    fn name(&self) -> &str {
        "openai"
    }
}
