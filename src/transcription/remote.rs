//! OpenAI-compatible remote transcription (`POST {api_base}/audio/transcriptions`).

use super::Transcriber;
use crate::audio::normalize;
use crate::config::{AudioInputConfig, InputFormat, SttConfig};
use crate::error::{PipelineError, PipelineResult};
use async_trait::async_trait;
use serde::Deserialize;
use std::path::Path;
use tracing::debug;

pub struct RemoteTranscriber {
    client: reqwest::Client,
    endpoint: String,
    api_key: String,
    model: String,
    language: String,
    input_format: InputFormat,
    pcm_sample_rate: u32,
}

#[derive(Deserialize)]
struct TranscriptionResponse {
    text: String,
}

/// Bytes to upload, with the filename and MIME type the server should see.
struct Upload {
    bytes: Vec<u8>,
    file_name: String,
    mime: &'static str,
}

impl RemoteTranscriber {
    pub fn new(client: reqwest::Client, stt: &SttConfig, audio: &AudioInputConfig) -> Self {
        Self {
            client,
            endpoint: format!("{}/audio/transcriptions", stt.api_base.trim_end_matches('/')),
            api_key: stt.api_key.clone(),
            model: stt.model.clone(),
            language: stt.language.clone(),
            input_format: audio.input_format,
            pcm_sample_rate: audio.pcm_sample_rate,
        }
    }

    /// Normalize WAV/PCM input to 16 kHz mono WAV; anything else, or anything
    /// that fails to decode, is uploaded as recorded.
    async fn prepare_upload(&self, path: &Path, original: Vec<u8>) -> Upload {
        let original_name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| format!("audio.{}", self.input_format.extension()));

        let passthrough = |bytes: Vec<u8>| Upload {
            bytes,
            file_name: original_name.clone(),
            mime: match self.input_format {
                InputFormat::Webm => "audio/webm",
                InputFormat::Wav => "audio/wav",
                InputFormat::PcmS16le => "application/octet-stream",
            },
        };

        if self.input_format == InputFormat::Webm {
            return passthrough(original);
        }

        let format = self.input_format;
        let rate = self.pcm_sample_rate;
        let input = original.clone();
        let normalized = tokio::task::spawn_blocking(move || normalize::normalize_to_wav(&input, format, rate))
            .await
            .map_err(anyhow::Error::from)
            .and_then(|r| r);

        match normalized {
            Ok(wav) => Upload {
                bytes: wav,
                file_name: "audio.wav".to_string(),
                mime: "audio/wav",
            },
            Err(e) => {
                debug!(error = %e, "Audio normalization failed, uploading original bytes");
                passthrough(original)
            }
        }
    }
}

#[async_trait]
impl Transcriber for RemoteTranscriber {
    async fn transcribe(&self, audio: &Path) -> PipelineResult<String> {
        let original = tokio::fs::read(audio)
            .await
            .map_err(|e| PipelineError::Transcription(format!("cannot read recorded audio: {}", e)))?;
        if original.is_empty() {
            return Err(PipelineError::Transcription("recorded audio is empty".to_string()));
        }

        let upload = self.prepare_upload(audio, original).await;
        debug!(bytes = upload.bytes.len(), file = %upload.file_name, "Uploading audio for transcription");

        let part = reqwest::multipart::Part::bytes(upload.bytes)
            .file_name(upload.file_name)
            .mime_str(upload.mime)
            .map_err(|e| PipelineError::Transcription(e.to_string()))?;
        let form = reqwest::multipart::Form::new()
            .part("file", part)
            .text("model", self.model.clone())
            .text("language", self.language.clone())
            .text("response_format", "json");

        let mut request = self.client.post(&self.endpoint).multipart(form);
        if !self.api_key.is_empty() {
            request = request.bearer_auth(&self.api_key);
        }

        let response = request
            .send()
            .await
            .map_err(|e| PipelineError::Transcription(format!("backend unavailable: {}", e)))?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(PipelineError::Transcription(format!("backend returned {}: {}", status, body)));
        }

        let parsed: TranscriptionResponse = response
            .json()
            .await
            .map_err(|e| PipelineError::Transcription(format!("unexpected response: {}", e)))?;

        Ok(parsed.text.trim().to_string())
    }

    fn name(&self) -> &str {
        "remote"
    }
}
