//! # Configuration Management
//!
//! Loads application configuration from multiple sources:
//! - Default values (built into the code)
//! - TOML configuration file (`config.toml`, optional)
//! - Environment variables (`APP__SECTION__KEY`, e.g. `APP__LLM__MODEL=qwen-plus`)
//!
//! ## Configuration Priority (highest to lowest):
//! 1. Deployment-platform variables (`HOST`, `PORT`) and well-known API key variables
//!    (`OPENAI_API_KEY`, `AMAP_API_KEY`) when the corresponding key is still empty
//! 2. `APP__*` environment variables
//! 3. `config.toml`
//! 4. Default values (the `Default` impl below)
//!
//! ## Sections:
//! - **server / performance**: bind address, session admission, WebSocket limits
//! - **audio / pipeline**: input format, artifact staging, per-stage timeouts
//! - **stt / llm / tts / avatar**: the external collaborators of a chat turn
//! - **weather**: the upstream weather API used by `/api/weather`
//! - **session / personas**: conversation history and the persona table

use crate::device::DevicePreference;
use anyhow::Result;
use serde::{Deserialize, Serialize};
use std::env;
use std::path::PathBuf;
use std::time::Duration;

/// Main application configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppConfig {
    pub server: ServerConfig,
    pub performance: PerformanceConfig,
    pub audio: AudioInputConfig,
    pub pipeline: PipelineConfig,
    pub stt: SttConfig,
    pub llm: LlmConfig,
    pub tts: TtsConfig,
    pub avatar: AvatarConfig,
    pub weather: WeatherConfig,
    pub session: SessionConfig,
    pub personas: Vec<PersonaConfig>,
}

/// Server-specific configuration settings.
///
/// ## Common values:
/// - `host = "127.0.0.1"`: Only accept connections from localhost (development)
/// - `host = "0.0.0.0"`: Accept connections from any IP address (production)
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
}

/// Connection admission and WebSocket transport limits.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PerformanceConfig {
    /// Maximum number of live `/ws/chat` sessions; further upgrades get 503
    pub max_concurrent_sessions: usize,
    /// Seconds between server heartbeat pings
    pub heartbeat_interval_secs: u64,
    /// Seconds of client silence after which the connection is dropped
    pub client_timeout_secs: u64,
    /// Largest single WebSocket frame accepted, in bytes
    pub max_frame_bytes: usize,
    /// Turns a session may have waiting behind the running one; extra requests get an `error`
    pub max_queued_turns: usize,
}

/// Container format of the audio the client streams.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InputFormat {
    /// MediaRecorder output from browsers (opaque to us, passed through to STT)
    Webm,
    /// RIFF/WAVE, any channel count and sample rate
    Wav,
    /// Headerless 16-bit little-endian mono PCM at `pcm_sample_rate`
    PcmS16le,
}

impl InputFormat {
    /// File extension used for the staged input artifact.
    pub fn extension(&self) -> &'static str {
        match self {
            InputFormat::Webm => "webm",
            InputFormat::Wav => "wav",
            InputFormat::PcmS16le => "pcm",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AudioInputConfig {
    pub input_format: InputFormat,
    pub pcm_sample_rate: u32,
}

/// Turn pipeline settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineConfig {
    /// Directory where per-turn artifacts are staged (created at startup)
    pub staging_dir: PathBuf,
    pub transcription_timeout_secs: u64,
    pub generation_timeout_secs: u64,
    pub synthesis_timeout_secs: u64,
    /// Send an empty audio frame instead of an error when synthesis fails
    pub degrade_to_silence: bool,
}

impl PipelineConfig {
    pub fn transcription_timeout(&self) -> Duration {
        Duration::from_secs(self.transcription_timeout_secs)
    }

    pub fn generation_timeout(&self) -> Duration {
        Duration::from_secs(self.generation_timeout_secs)
    }

    pub fn synthesis_timeout(&self) -> Duration {
        Duration::from_secs(self.synthesis_timeout_secs)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SttBackendKind {
    /// OpenAI-compatible `/audio/transcriptions` endpoint
    Remote,
    /// Local Whisper model run with candle
    Whisper,
}

/// Speech-to-text settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SttConfig {
    pub backend: SttBackendKind,
    /// ISO 639-1 language hint ("zh", "en", ...)
    pub language: String,
    pub api_base: String,
    pub api_key: String,
    /// Remote model name ("whisper-1", ...)
    pub model: String,
    /// Local Whisper size ("tiny", "base", "small", "medium", "large")
    pub whisper_model: String,
    /// Compute device for local Whisper ("auto", "cpu", "cuda", "metal")
    pub device: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LlmBackendKind {
    /// OpenAI-compatible `/chat/completions` (Qwen via DashScope, Ollama, ...)
    Openai,
    /// Offline persona templates, no network access
    Template,
}

/// Reply generation settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LlmConfig {
    pub backend: LlmBackendKind,
    pub api_base: String,
    pub api_key: String,
    pub model: String,
    pub temperature: f32,
    pub max_tokens: u32,
}

/// Speech synthesis settings (OpenAI-compatible `/audio/speech`).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TtsConfig {
    pub api_base: String,
    pub api_key: String,
    pub model: String,
    /// Voice used when the persona does not name one
    pub voice: String,
    /// Response format requested from the backend; also the artifact extension
    pub format: String,
}

/// Optional talking-head video stage.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AvatarConfig {
    pub enabled: bool,
    pub endpoint: String,
    #[serde(default)]
    pub image: Option<String>,
    pub timeout_secs: u64,
}

/// Upstream weather API (AMap `weatherInfo`).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WeatherConfig {
    pub api_base: String,
    pub api_key: String,
    /// City code used when the request carries none (410100 = Zhengzhou)
    pub default_city: String,
    /// "base" for live conditions, "all" for forecasts
    pub extensions: String,
    pub timeout_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionConfig {
    /// Completed exchanges kept per session as generation context (0 disables)
    pub max_history_turns: usize,
    /// Persona used when a control frame names none or an unknown one
    pub default_persona: String,
}

/// One row of the persona table.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PersonaConfig {
    pub id: String,
    pub name: String,
    /// System prompt sent to the chat backend
    pub prompt: String,
    /// Offline reply; `{text}` is replaced by the user's words
    pub template: String,
    /// Optional per-persona synthesis voice
    #[serde(default)]
    pub voice: Option<String>,
}

impl PersonaConfig {
    fn new(id: &str, name: &str, prompt: &str, template: &str) -> Self {
        Self {
            id: id.to_string(),
            name: name.to_string(),
            prompt: prompt.to_string(),
            template: template.to_string(),
            voice: None,
        }
    }
}

fn default_personas() -> Vec<PersonaConfig> {
    vec![
        PersonaConfig::new(
            "socrates",
            "苏格拉底",
            "你是苏格拉底。不要直接给出答案，而是用简短而深刻的追问引导对方自己思考。",
            "好问题。不过先让我反问你：当你说「{text}」时，你真正想弄明白的是什么？",
        ),
        PersonaConfig::new(
            "storyteller",
            "故事大师",
            "你是一位想象力丰富的讲故事的人，善于把任何话题编织成引人入胜的小故事。",
            "那我给你讲个故事吧。很久以前，有位旅人听到了「{text}」，于是他收拾行囊去寻找答案……",
        ),
        PersonaConfig::new(
            "interviewer",
            "面试官",
            "你是一位专业的面试官，针对对方的回答提出有深度的追问。",
            "谢谢你的分享。关于「{text}」，能再具体说说你当时是怎么考虑的吗？",
        ),
        PersonaConfig::new(
            "harry_potter",
            "哈利·波特",
            "你是哈利·波特，来自霍格沃茨的年轻巫师，从魔法世界的角度回答问题。",
            "哇，「{text}」让我想起在霍格沃茨的日子，魔法世界里可有不少类似的奇事！",
        ),
        PersonaConfig::new(
            "sherlock",
            "夏洛克·福尔摩斯",
            "你是夏洛克·福尔摩斯，擅长观察细节和逻辑推理，回答时展示你的推理过程。",
            "从「{text}」这句话里，我注意到几个关键细节。让我们一条一条推理……",
        ),
        PersonaConfig::new(
            "einstein",
            "爱因斯坦",
            "你是阿尔伯特·爱因斯坦，用科学思维和一点哲学幽默来回答问题。",
            "关于「{text}」，这让我想到相对论：时间和空间的关系远比直觉告诉我们的更奇妙。",
        ),
    ]
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            server: ServerConfig {
                host: "127.0.0.1".to_string(),
                port: 8000,
            },
            performance: PerformanceConfig {
                max_concurrent_sessions: 32,
                heartbeat_interval_secs: 30,
                client_timeout_secs: 90,
                max_frame_bytes: 1024 * 1024,
                max_queued_turns: 4,
            },
            audio: AudioInputConfig {
                input_format: InputFormat::Webm,
                pcm_sample_rate: 16000,
            },
            pipeline: PipelineConfig {
                staging_dir: PathBuf::from("tmp"),
                transcription_timeout_secs: 60,
                generation_timeout_secs: 30,
                synthesis_timeout_secs: 60,
                degrade_to_silence: false,
            },
            stt: SttConfig {
                backend: SttBackendKind::Remote,
                language: "zh".to_string(),
                api_base: "https://api.openai.com/v1".to_string(),
                api_key: String::new(),
                model: "whisper-1".to_string(),
                whisper_model: "base".to_string(),
                device: "auto".to_string(),
            },
            llm: LlmConfig {
                backend: LlmBackendKind::Template,
                api_base: "https://dashscope.aliyuncs.com/compatible-mode/v1".to_string(),
                api_key: String::new(),
                model: "qwen-turbo".to_string(),
                temperature: 0.8,
                max_tokens: 512,
            },
            tts: TtsConfig {
                api_base: "http://127.0.0.1:5050/v1".to_string(),
                api_key: String::new(),
                model: "tts-1".to_string(),
                voice: "zh-CN-XiaoxiaoNeural".to_string(),
                format: "mp3".to_string(),
            },
            avatar: AvatarConfig {
                enabled: false,
                endpoint: "http://127.0.0.1:8010/generate".to_string(),
                image: None,
                timeout_secs: 120,
            },
            weather: WeatherConfig {
                api_base: "https://restapi.amap.com/v3/weather/weatherInfo".to_string(),
                api_key: String::new(),
                default_city: "410100".to_string(),
                extensions: "base".to_string(),
                timeout_secs: 10,
            },
            session: SessionConfig {
                max_history_turns: 8,
                default_persona: "socrates".to_string(),
            },
            personas: default_personas(),
        }
    }
}

impl AppConfig {
    /// Load configuration from defaults, `config.toml` and the environment.
    ///
    /// ## Environment Variable Examples:
    /// - `APP__SERVER__PORT=3000`
    /// - `APP__STT__BACKEND=whisper`
    /// - `APP__PIPELINE__STAGING_DIR=/var/tmp/voice-chat`
    /// - `HOST=0.0.0.0`, `PORT=3000`: deployment platforms
    pub fn load() -> Result<Self> {
        let builder = config::Config::builder()
            .add_source(config::File::with_name("config").required(false));
        Self::from_builder(builder)
    }

    /// Layer `builder`'s sources on top of the defaults and the environment.
    fn from_builder(
        builder: config::ConfigBuilder<config::builder::DefaultState>,
    ) -> Result<Self> {
        let mut settings = config::Config::builder()
            .add_source(config::Config::try_from(&AppConfig::default())?)
            .add_source(builder.build()?)
            .add_source(
                config::Environment::with_prefix("APP")
                    .prefix_separator("__")
                    .separator("__"),
            );

        if let Ok(host) = env::var("HOST") {
            settings = settings.set_override("server.host", host)?;
        }

        if let Ok(port) = env::var("PORT") {
            settings = settings.set_override("server.port", port)?;
        }

        let mut config: AppConfig = settings.build()?.try_deserialize()?;
        config.apply_key_fallbacks(|name| env::var(name).ok());
        Ok(config)
    }

    /// Fill empty API keys from the conventional provider variables.
    fn apply_key_fallbacks(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        if let Some(key) = lookup("OPENAI_API_KEY") {
            for slot in [&mut self.stt.api_key, &mut self.llm.api_key, &mut self.tts.api_key] {
                if slot.is_empty() {
                    *slot = key.clone();
                }
            }
        }
        if self.weather.api_key.is_empty() {
            if let Some(key) = lookup("AMAP_API_KEY") {
                self.weather.api_key = key;
            }
        }
    }

    /// Validate that the configuration values make sense.
    pub fn validate(&self) -> Result<()> {
        if self.server.port == 0 {
            return Err(anyhow::anyhow!("Server port cannot be 0"));
        }

        if self.performance.max_concurrent_sessions == 0 {
            return Err(anyhow::anyhow!("Max concurrent sessions must be greater than 0"));
        }

        if self.performance.max_frame_bytes == 0 {
            return Err(anyhow::anyhow!("Max frame size must be greater than 0"));
        }

        if self.performance.client_timeout_secs <= self.performance.heartbeat_interval_secs {
            return Err(anyhow::anyhow!(
                "Client timeout ({}s) must exceed the heartbeat interval ({}s)",
                self.performance.client_timeout_secs,
                self.performance.heartbeat_interval_secs
            ));
        }

        if self.audio.pcm_sample_rate == 0 {
            return Err(anyhow::anyhow!("PCM sample rate must be greater than 0"));
        }

        let timeouts = [
            ("transcription", self.pipeline.transcription_timeout_secs),
            ("generation", self.pipeline.generation_timeout_secs),
            ("synthesis", self.pipeline.synthesis_timeout_secs),
            ("avatar", self.avatar.timeout_secs),
            ("weather", self.weather.timeout_secs),
        ];
        if let Some((stage, _)) = timeouts.iter().find(|(_, secs)| *secs == 0) {
            return Err(anyhow::anyhow!("The {} timeout must be greater than 0", stage));
        }

        if self.stt.backend == SttBackendKind::Whisper && self.audio.input_format == InputFormat::Webm {
            return Err(anyhow::anyhow!(
                "The local whisper backend needs wav or pcm_s16le input, not webm"
            ));
        }

        if let Err(e) = self.stt.device.parse::<DevicePreference>() {
            return Err(anyhow::anyhow!(e));
        }

        if self.tts.voice.trim().is_empty() {
            return Err(anyhow::anyhow!("A default synthesis voice is required"));
        }

        if self.personas.is_empty() {
            return Err(anyhow::anyhow!("At least one persona must be configured"));
        }

        if !self.personas.iter().any(|p| p.id == self.session.default_persona) {
            return Err(anyhow::anyhow!(
                "Default persona '{}' is not in the persona table",
                self.session.default_persona
            ));
        }

        Ok(())
    }

    /// Copy of the configuration safe to expose over HTTP.
    pub fn redacted(&self) -> AppConfig {
        fn mask(key: &mut String) {
            if !key.is_empty() {
                *key = "***".to_string();
            }
        }

        let mut copy = self.clone();
        mask(&mut copy.stt.api_key);
        mask(&mut copy.llm.api_key);
        mask(&mut copy.tts.api_key);
        mask(&mut copy.weather.api_key);
        copy
    }
}
