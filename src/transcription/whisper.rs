//! # Local Whisper Transcription
//!
//! Runs OpenAI Whisper on-device with Candle-rs. Model files are fetched from
//! HuggingFace on first use (and cached by `hf-hub`), so startup stays fast and
//! a misconfigured model only fails the turns that need it.
//!
//! ## Inference Process:
//! 1. Decode the staged audio to 16 kHz mono samples
//! 2. Compute the log-mel spectrogram (slaney mel filterbank)
//! 3. Encode each 30 second window and greedily decode tokens until end-of-text
//! 4. Join the decoded windows
//!
//! ## Memory Management:
//! The model lives behind an async mutex. Turns from different sessions queue on
//! it; inference itself runs on the blocking thread pool.

use super::Transcriber;
use crate::audio::normalize;
use crate::config::{AudioInputConfig, InputFormat, SttConfig};
use crate::device::{create_device_from_string, DeviceManager};
use crate::error::{PipelineError, PipelineResult};
use anyhow::{anyhow, Result};
use async_trait::async_trait;
use candle_core::{Device, IndexOp, Tensor};
use candle_nn::VarBuilder;
use candle_transformers::models::whisper::{self as m, Config};
use std::path::Path;
use std::sync::Arc;
use tokenizers::Tokenizer;
use tokio::sync::Mutex;

/// Available Whisper model sizes.
///
/// ## Trade-offs:
/// - **tiny/base**: fast on CPU, adequate for short conversational turns
/// - **small/medium**: noticeably better on Mandarin, want a GPU
/// - **large**: best accuracy, slow
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ModelSize {
    Tiny,
    Base,
    Small,
    Medium,
    Large,
}

impl ModelSize {
    /// HuggingFace repository holding the safetensors weights.
    pub fn repo_name(&self) -> &'static str {
        match self {
            ModelSize::Tiny => "openai/whisper-tiny",
            ModelSize::Base => "openai/whisper-base",
            ModelSize::Small => "openai/whisper-small",
            ModelSize::Medium => "openai/whisper-medium",
            ModelSize::Large => "openai/whisper-large-v3",
        }
    }
}

impl std::str::FromStr for ModelSize {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_lowercase().as_str() {
            "tiny" => Ok(ModelSize::Tiny),
            "base" => Ok(ModelSize::Base),
            "small" => Ok(ModelSize::Small),
            "medium" => Ok(ModelSize::Medium),
            "large" => Ok(ModelSize::Large),
            _ => Err(anyhow!("Unknown model size: {}", s)),
        }
    }
}

impl std::fmt::Display for ModelSize {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            ModelSize::Tiny => "tiny",
            ModelSize::Base => "base",
            ModelSize::Small => "small",
            ModelSize::Medium => "medium",
            ModelSize::Large => "large",
        };
        write!(f, "{}", name)
    }
}

/// Special token ids resolved from the tokenizer.
struct SpecialTokens {
    sot: u32,
    eot: u32,
    transcribe: u32,
    no_timestamps: u32,
    language: Option<u32>,
}

/// A loaded Whisper model ready for inference.
pub struct WhisperModel {
    model: m::model::Whisper,
    config: Config,
    device: Device,
    tokenizer: Tokenizer,
    mel_filters: Vec<f32>,
    tokens: SpecialTokens,
    suppress: Vec<u32>,
}

impl WhisperModel {
    /// Download (or reuse cached) model files and load them onto `device`.
    pub async fn load(size: ModelSize, device: Device, language: &str) -> Result<Self> {
        tracing::info!(model = %size, device = %DeviceManager::get_device_info(&device), "Loading Whisper model");
        let start_time = std::time::Instant::now();

        let mut builder = hf_hub::api::tokio::ApiBuilder::new().with_progress(false);
        if let Ok(token) = std::env::var("HF_TOKEN") {
            builder = builder.with_token(Some(token));
        }
        if let Ok(cache_dir) = std::env::var("HF_HUB_CACHE") {
            builder = builder.with_cache_dir(cache_dir.into());
        }
        let api = builder.build()?;
        let repo = api.model(size.repo_name().to_string());

        let config_file = repo
            .get("config.json")
            .await
            .map_err(|e| anyhow!("Failed to download config.json from {}: {}", size.repo_name(), e))?;
        let tokenizer_file = repo
            .get("tokenizer.json")
            .await
            .map_err(|e| anyhow!("Failed to download tokenizer.json from {}: {}", size.repo_name(), e))?;
        let weights_file = repo
            .get("model.safetensors")
            .await
            .map_err(|e| anyhow!("Failed to download model weights from {}: {}", size.repo_name(), e))?;

        let config: Config = serde_json::from_reader(std::fs::File::open(config_file)?)?;
        let tokenizer = Tokenizer::from_file(tokenizer_file).map_err(|e| anyhow!("Failed to load tokenizer: {}", e))?;

        // SAFETY: the safetensors file is owned by the hf-hub cache and not
        // modified while mapped.
        let vb = unsafe { VarBuilder::from_mmaped_safetensors(&[weights_file], m::DTYPE, &device)? };
        let model = m::model::Whisper::load(&vb, config.clone())?;

        let tokens = SpecialTokens {
            sot: token_id(&tokenizer, m::SOT_TOKEN)?,
            eot: token_id(&tokenizer, m::EOT_TOKEN)?,
            transcribe: token_id(&tokenizer, m::TRANSCRIBE_TOKEN)?,
            no_timestamps: token_id(&tokenizer, m::NO_TIMESTAMPS_TOKEN)?,
            language: tokenizer.token_to_id(&format!("<|{}|>", language)),
        };
        if tokens.language.is_none() {
            tracing::warn!(language, "Whisper has no token for this language, letting the model detect it");
        }

        let mel_filters = mel_filter_bank(config.num_mel_bins);
        let suppress = config.suppress_tokens.clone();

        tracing::info!(
            model = %size,
            elapsed_ms = start_time.elapsed().as_millis() as u64,
            "Whisper model loaded"
        );

        Ok(Self {
            model,
            config,
            device,
            tokenizer,
            mel_filters,
            tokens,
            suppress,
        })
    }

    /// Transcribe 16 kHz mono samples.
    pub fn transcribe(&mut self, samples: &[f32]) -> Result<String> {
        let mel = m::audio::pcm_to_mel(&self.config, samples, &self.mel_filters);
        let n_mels = self.config.num_mel_bins;
        let mel_len = mel.len();
        let mel = Tensor::from_vec(mel, (1, n_mels, mel_len / n_mels), &self.device)?;

        let (_, _, content_frames) = mel.dims3()?;
        let mut seek = 0;
        let mut segments = Vec::new();
        while seek < content_frames {
            let segment_size = usize::min(content_frames - seek, m::N_FRAMES);
            let mel_segment = mel.narrow(2, seek, segment_size)?;
            let text = self.decode_segment(&mel_segment)?;
            if !text.is_empty() {
                segments.push(text);
            }
            seek += segment_size;
        }

        Ok(segments.join(""))
    }

    /// Greedy decoding of one mel window.
    fn decode_segment(&mut self, mel: &Tensor) -> Result<String> {
        let audio_features = self.model.encoder.forward(mel, true)?;

        let mut tokens = vec![self.tokens.sot];
        if let Some(language) = self.tokens.language {
            tokens.push(language);
        }
        tokens.push(self.tokens.transcribe);
        tokens.push(self.tokens.no_timestamps);
        let prompt_len = tokens.len();

        let sample_len = self.config.max_target_positions / 2;
        for i in 0..sample_len {
            let tokens_t = Tensor::new(tokens.as_slice(), &self.device)?.unsqueeze(0)?;
            let ys = self.model.decoder.forward(&tokens_t, &audio_features, i == 0)?;
            let (_, seq_len, _) = ys.dims3()?;
            let logits = self
                .model
                .decoder
                .final_linear(&ys.i((..1, seq_len - 1..))?)?
                .i(0)?
                .i(0)?;

            let mut logits = logits.to_vec1::<f32>()?;
            for &id in &self.suppress {
                if let Some(l) = logits.get_mut(id as usize) {
                    *l = f32::NEG_INFINITY;
                }
            }
            let next = logits
                .iter()
                .enumerate()
                .max_by(|a, b| a.1.total_cmp(b.1))
                .map(|(id, _)| id as u32)
                .unwrap_or(self.tokens.eot);

            if next == self.tokens.eot || tokens.len() > self.config.max_target_positions {
                break;
            }
            tokens.push(next);
        }

        let text = self
            .tokenizer
            .decode(&tokens[prompt_len..], true)
            .map_err(|e| anyhow!("Tokenizer decode error: {}", e))?;
        Ok(text.trim().to_string())
    }
}

fn token_id(tokenizer: &Tokenizer, token: &str) -> Result<u32> {
    tokenizer
        .token_to_id(token)
        .ok_or_else(|| anyhow!("no token id for {}", token))
}

/// Slaney-style mel filterbank, `n_mels` rows of `N_FFT / 2 + 1` frequency bins.
pub fn mel_filter_bank(n_mels: usize) -> Vec<f32> {
    fn hz_to_mel(hz: f64) -> f64 {
        let f_sp = 200.0 / 3.0;
        let min_log_hz = 1000.0;
        let min_log_mel = min_log_hz / f_sp;
        let log_step = (6.4f64).ln() / 27.0;
        if hz >= min_log_hz {
            min_log_mel + (hz / min_log_hz).ln() / log_step
        } else {
            hz / f_sp
        }
    }

    fn mel_to_hz(mel: f64) -> f64 {
        let f_sp = 200.0 / 3.0;
        let min_log_hz = 1000.0;
        let min_log_mel = min_log_hz / f_sp;
        let log_step = (6.4f64).ln() / 27.0;
        if mel >= min_log_mel {
            min_log_hz * (log_step * (mel - min_log_mel)).exp()
        } else {
            mel * f_sp
        }
    }

    let n_freqs = m::N_FFT / 2 + 1;
    let sample_rate = m::SAMPLE_RATE as f64;
    let fft_freqs: Vec<f64> = (0..n_freqs)
        .map(|k| k as f64 * sample_rate / m::N_FFT as f64)
        .collect();

    let mel_min = hz_to_mel(0.0);
    let mel_max = hz_to_mel(sample_rate / 2.0);
    let points: Vec<f64> = (0..n_mels + 2)
        .map(|i| mel_to_hz(mel_min + (mel_max - mel_min) * i as f64 / (n_mels + 1) as f64))
        .collect();

    let mut filters = vec![0f32; n_mels * n_freqs];
    for band in 0..n_mels {
        let (lower, center, upper) = (points[band], points[band + 1], points[band + 2]);
        let norm = 2.0 / (upper - lower);
        for (k, &freq) in fft_freqs.iter().enumerate() {
            let rising = (freq - lower) / (center - lower);
            let falling = (upper - freq) / (upper - center);
            let weight = rising.min(falling).max(0.0);
            filters[band * n_freqs + k] = (weight * norm) as f32;
        }
    }
    filters
}

/// [`Transcriber`] backed by a lazily loaded local Whisper model.
pub struct WhisperTranscriber {
    size: ModelSize,
    device: Device,
    language: String,
    input_format: InputFormat,
    pcm_sample_rate: u32,
    model: Arc<Mutex<Option<WhisperModel>>>,
}

impl WhisperTranscriber {
    pub fn new(stt: &SttConfig, audio: &AudioInputConfig) -> Result<Self> {
        Ok(Self {
            size: stt.whisper_model.parse()?,
            device: create_device_from_string(&stt.device),
            language: stt.language.clone(),
            input_format: audio.input_format,
            pcm_sample_rate: audio.pcm_sample_rate,
            model: Arc::new(Mutex::new(None)),
        })
    }
}

#[async_trait]
impl Transcriber for WhisperTranscriber {
    async fn transcribe(&self, audio: &Path) -> PipelineResult<String> {
        let bytes = tokio::fs::read(audio)
            .await
            .map_err(|e| PipelineError::Transcription(format!("cannot read recorded audio: {}", e)))?;

        let format = self.input_format;
        let rate = self.pcm_sample_rate;
        let samples = tokio::task::spawn_blocking(move || normalize::decode_to_mono_16k(&bytes, format, rate))
            .await
            .map_err(|e| PipelineError::Transcription(e.to_string()))?
            .map_err(|e| PipelineError::Transcription(format!("unreadable audio: {}", e)))?;

        let mut guard = self.model.clone().lock_owned().await;
        if guard.is_none() {
            let model = WhisperModel::load(self.size, self.device.clone(), &self.language)
                .await
                .map_err(|e| PipelineError::Transcription(format!("model unavailable: {}", e)))?;
            *guard = Some(model);
        }

        tokio::task::spawn_blocking(move || match guard.as_mut() {
            Some(model) => model.transcribe(&samples),
            None => Err(anyhow!("model not loaded")),
        })
        .await
        .map_err(|e| PipelineError::Transcription(e.to_string()))?
        .map_err(|e| PipelineError::Transcription(e.to_string()))
    }

    fn name(&self) -> &str {
        "whisper"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::AppConfig;

    #[test]
    fn test_model_size_parsing() {
        assert_eq!("base".parse::<ModelSize>().unwrap(), ModelSize::Base);
        assert_eq!("LARGE".parse::<ModelSize>().unwrap(), ModelSize::Large);
        assert!("huge".parse::<ModelSize>().is_err());
    }

    #[test]
    fn test_mel_filter_bank_shape() {
        let filters = mel_filter_bank(80);
        let n_freqs = m::N_FFT / 2 + 1;
        assert_eq!(filters.len(), 80 * n_freqs);
        assert!(filters.iter().all(|w| *w >= 0.0));
        // Every band covers at least one frequency bin.
        for band in filters.chunks(n_freqs) {
            assert!(band.iter().any(|w| *w > 0.0));
        }
    }

    #[tokio::test]
    async fn test_undecodable_audio_fails_before_model_load() {
        let mut config = AppConfig::default();
        config.audio.input_format = InputFormat::Wav;
        config.stt.device = "cpu".to_string();
        let transcriber = WhisperTranscriber::new(&config.stt, &config.audio).unwrap();

        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("input.wav");
        std::fs::write(&path, b"garbage").unwrap();

        let err = transcriber.transcribe(&path).await.unwrap_err();
        assert!(matches!(err, PipelineError::Transcription(ref m) if m.contains("unreadable")));
        assert!(transcriber.model.lock().await.is_none());
    }
}
