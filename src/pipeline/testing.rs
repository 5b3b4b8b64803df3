//! Scripted backends and helpers shared by the pipeline, session and adapter tests.

use super::{Backends, OrchestratorSettings, OutgoingEvent, PersonaCatalog, Turn, TurnId, TurnInput, TurnOrchestrator};
use crate::audio::StagingArea;
use crate::avatar::AvatarRenderer;
use crate::config::AppConfig;
use crate::error::{PipelineError, PipelineResult};
use crate::generation::{GenerationRequest, ReplyGenerator};
use crate::synthesis::SpeechSynthesizer;
use crate::transcription::Transcriber;
use actix_web::{web, App, HttpServer};
use async_trait::async_trait;
use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio_stream::StreamExt;
use uuid::Uuid;

/// What a scripted backend does when called.
#[derive(Debug, Clone)]
enum Script {
    Succeed,
    Fail(String),
    Stall(Duration),
}

impl Script {
    async fn play(&self) -> Result<(), String> {
        match self {
            Script::Succeed => Ok(()),
            Script::Fail(message) => Err(message.clone()),
            Script::Stall(duration) => {
                tokio::time::sleep(*duration).await;
                Err("stalled backend woke up".to_string())
            }
        }
    }
}

/// Returns a fixed transcript and records every staged payload it was given.
pub struct ScriptedTranscriber {
    script: Script,
    transcript: String,
    payloads: Mutex<Vec<Vec<u8>>>,
}

impl ScriptedTranscriber {
    pub fn returning(transcript: &str) -> Self {
        Self {
            script: Script::Succeed,
            transcript: transcript.to_string(),
            payloads: Mutex::new(Vec::new()),
        }
    }

    pub fn failing(message: &str) -> Self {
        Self {
            script: Script::Fail(message.to_string()),
            ..Self::returning("")
        }
    }

    pub fn stalled(duration: Duration) -> Self {
        Self {
            script: Script::Stall(duration),
            ..Self::returning("")
        }
    }

    pub fn payloads(&self) -> Vec<Vec<u8>> {
        self.payloads.lock().unwrap().clone()
    }
}

impl Default for ScriptedTranscriber {
    fn default() -> Self {
        Self::returning("你好")
    }
}

#[async_trait]
impl Transcriber for ScriptedTranscriber {
    async fn transcribe(&self, audio: &Path) -> PipelineResult<String> {
        let payload = std::fs::read(audio).map_err(|e| PipelineError::Transcription(e.to_string()))?;
        self.payloads.lock().unwrap().push(payload);
        self.script.play().await.map_err(PipelineError::Transcription)?;
        Ok(self.transcript.clone())
    }

    fn name(&self) -> &str {
        "scripted"
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecordedRequest {
    pub persona: String,
    pub text: String,
    pub history_len: usize,
}

/// Replies `[<persona id>] <text>` and records each request.
#[derive(Default)]
pub struct ScriptedGenerator {
    script: Option<Script>,
    requests: Mutex<Vec<RecordedRequest>>,
}

impl ScriptedGenerator {
    pub fn failing(message: &str) -> Self {
        Self {
            script: Some(Script::Fail(message.to_string())),
            ..Self::default()
        }
    }

    pub fn stalled(duration: Duration) -> Self {
        Self {
            script: Some(Script::Stall(duration)),
            ..Self::default()
        }
    }

    pub fn requests(&self) -> Vec<RecordedRequest> {
        self.requests.lock().unwrap().clone()
    }
}

#[async_trait]
impl ReplyGenerator for ScriptedGenerator {
    async fn generate(&self, request: GenerationRequest<'_>) -> PipelineResult<String> {
        self.requests.lock().unwrap().push(RecordedRequest {
            persona: request.persona.id.clone(),
            text: request.text.to_string(),
            history_len: request.history.len(),
        });
        if let Some(script) = &self.script {
            script.play().await.map_err(PipelineError::Generation)?;
        }
        Ok(format!("[{}] {}", request.persona.id, request.text))
    }

    fn name(&self) -> &str {
        "scripted"
    }
}

/// Writes `audio:<text>` into the output artifact.
#[derive(Default)]
pub struct ScriptedSynthesizer {
    script: Option<Script>,
}

impl ScriptedSynthesizer {
    pub fn failing(message: &str) -> Self {
        Self {
            script: Some(Script::Fail(message.to_string())),
        }
    }
}

#[async_trait]
impl SpeechSynthesizer for ScriptedSynthesizer {
    async fn synthesize(&self, text: &str, _voice: &str, out: &Path) -> PipelineResult<()> {
        if let Some(script) = &self.script {
            script.play().await.map_err(PipelineError::Synthesis)?;
        }
        tokio::fs::write(out, format!("audio:{}", text))
            .await
            .map_err(|e| PipelineError::Synthesis(e.to_string()))
    }

    fn name(&self) -> &str {
        "scripted"
    }
}

/// Answers with a fixed video URL and records the reply audio it was shown.
pub struct ScriptedAvatar {
    script: Script,
    url: String,
    rendered: Mutex<Vec<Vec<u8>>>,
}

impl ScriptedAvatar {
    pub fn returning(url: &str) -> Self {
        Self {
            script: Script::Succeed,
            url: url.to_string(),
            rendered: Mutex::new(Vec::new()),
        }
    }

    pub fn failing(message: &str) -> Self {
        Self {
            script: Script::Fail(message.to_string()),
            ..Self::returning("")
        }
    }

    pub fn rendered(&self) -> Vec<Vec<u8>> {
        self.rendered.lock().unwrap().clone()
    }
}

#[async_trait]
impl AvatarRenderer for ScriptedAvatar {
    async fn render(&self, audio: &Path) -> PipelineResult<String> {
        let bytes = std::fs::read(audio).map_err(|e| PipelineError::Avatar(e.to_string()))?;
        self.rendered.lock().unwrap().push(bytes);
        self.script.play().await.map_err(PipelineError::Avatar)?;
        Ok(self.url.clone())
    }
}

/// Handles to the fakes, kept so tests can inspect them after a turn.
#[derive(Clone)]
pub struct FakeBackends {
    pub transcriber: Arc<ScriptedTranscriber>,
    pub generator: Arc<ScriptedGenerator>,
    pub synthesizer: Arc<ScriptedSynthesizer>,
    /// `None` leaves the avatar stage disabled
    pub avatar: Option<Arc<ScriptedAvatar>>,
}

impl Default for FakeBackends {
    fn default() -> Self {
        Self {
            transcriber: Arc::new(ScriptedTranscriber::default()),
            generator: Arc::new(ScriptedGenerator::default()),
            synthesizer: Arc::new(ScriptedSynthesizer::default()),
            avatar: None,
        }
    }
}

impl FakeBackends {
    pub fn backends(&self) -> Backends {
        Backends {
            transcriber: self.transcriber.clone(),
            generator: self.generator.clone(),
            synthesizer: self.synthesizer.clone(),
            avatar: self
                .avatar
                .clone()
                .map(|avatar| avatar as Arc<dyn AvatarRenderer>),
        }
    }
}

/// Orchestrator over the fakes, staging into `dir`, with default settings
/// adjusted by `tweak`.
pub fn test_orchestrator(
    dir: &Path,
    fakes: &FakeBackends,
    tweak: impl FnOnce(&mut OrchestratorSettings),
) -> Arc<TurnOrchestrator> {
    let config = AppConfig::default();
    let personas = PersonaCatalog::from_config(&config.personas, &config.session.default_persona).unwrap();
    let mut settings = OrchestratorSettings::from_config(&config);
    tweak(&mut settings);
    Arc::new(TurnOrchestrator::new(
        fakes.backends(),
        Arc::new(personas),
        StagingArea::new(dir).unwrap(),
        settings,
    ))
}

fn turn(seq: u64, input: TurnInput, role: Option<&str>) -> Turn {
    Turn {
        id: TurnId {
            session_id: Uuid::new_v4(),
            seq,
        },
        input,
        persona: role.map(str::to_string),
        history: Vec::new(),
    }
}

pub fn audio_turn(seq: u64, bytes: &[u8], role: Option<&str>) -> Turn {
    turn(seq, TurnInput::Audio(bytes.to_vec()), role)
}

pub fn text_turn(seq: u64, text: &str, role: Option<&str>) -> Turn {
    turn(seq, TurnInput::Text(text.to_string()), role)
}

pub async fn collect(stream: impl tokio_stream::Stream<Item = OutgoingEvent>) -> Vec<OutgoingEvent> {
    stream.collect().await
}

/// Start an in-process HTTP server standing in for a third-party API and
/// return its base URL. Must run inside an actix system (`#[actix_web::test]`).
pub fn spawn_http_server<F>(routes: F) -> String
where
    F: Fn(&mut web::ServiceConfig) + Clone + Send + 'static,
{
    let server = HttpServer::new(move || App::new().configure(routes.clone()))
        .workers(1)
        .bind(("127.0.0.1", 0))
        .unwrap();
    let addr = server.addrs()[0];
    actix_web::rt::spawn(server.run());
    format!("http://{}", addr)
}
