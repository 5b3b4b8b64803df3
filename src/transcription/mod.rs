//! # Transcription
//!
//! Speech-to-text adapters. The pipeline only sees the [`Transcriber`] trait:
//! given the path of a staged audio artifact, return the recognized text or a
//! [`PipelineError::Transcription`](crate::error::PipelineError::Transcription).
//!
//! ## Backends (`stt.backend`):
//! - **remote**: OpenAI-compatible `/audio/transcriptions` endpoint (multipart upload)
//! - **whisper**: local Whisper model run with Candle-rs, weights fetched from HuggingFace
//!
//! Both normalize the input (WAV decode, mono mixdown, 16 kHz resampling) before
//! recognition. If normalization fails the remote backend uploads the original
//! bytes unchanged; the local backend has nothing to fall back to and reports an error.

pub mod remote;
pub mod whisper;

pub use remote::RemoteTranscriber;
pub use whisper::WhisperTranscriber;

use crate::config::{AppConfig, SttBackendKind};
use crate::error::PipelineResult;
use anyhow::Result;
use async_trait::async_trait;
use std::path::Path;
use std::sync::Arc;

/// Converts one recorded utterance into text.
#[async_trait]
pub trait Transcriber: Send + Sync {
    async fn transcribe(&self, audio: &Path) -> PipelineResult<String>;

    /// Backend label for logs and health output.
    fn name(&self) -> &str;
}

/// Build the configured transcription backend.
pub fn from_config(config: &AppConfig, http: reqwest::Client) -> Result<Arc<dyn Transcriber>> {
    let transcriber: Arc<dyn Transcriber> = match config.stt.backend {
        SttBackendKind::Remote => Arc::new(RemoteTranscriber::new(http, &config.stt, &config.audio)),
        SttBackendKind::Whisper => Arc::new(WhisperTranscriber::new(&config.stt, &config.audio)?),
    };
    tracing::info!(backend = transcriber.name(), "Transcription backend ready");
    Ok(transcriber)
}
