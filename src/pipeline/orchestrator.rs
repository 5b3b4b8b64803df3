//! # Turn Orchestrator
//!
//! Drives one turn through its stages and reports results as a stream of
//! [`OutgoingEvent`]s:
//!
//! ```text
//! stage input ─► transcribe ─► generate ─► synthesize ─► [render avatar]
//!                   │             │            │               │
//!               Transcript      Reply        Audio           Video
//! ```
//!
//! ## Guarantees:
//! - Events of a turn are emitted in stage order; nothing emitted is retracted
//! - Any stage failure (including a timeout) becomes exactly one `Error` event
//!   and ends the turn; there are no retries
//! - Every staged artifact is a [`TempArtifact`](crate::audio::artifact::TempArtifact), so it
//!   is removed on every exit path, and before the turn's `Error` event is sent
//! - If the receiving side goes away the remaining stages are abandoned
//!
//! The orchestrator is shared by all sessions and holds no per-session state.

use super::{OutgoingEvent, Persona, PersonaCatalog, Turn, TurnId, TurnInput};
use crate::audio::StagingArea;
use crate::avatar::AvatarRenderer;
use crate::config::AppConfig;
use crate::error::{PipelineError, PipelineResult, Stage};
use crate::generation::{GenerationRequest, ReplyGenerator};
use crate::synthesis::SpeechSynthesizer;
use crate::transcription::Transcriber;
use serde::Serialize;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tracing::{debug, info, warn, Instrument};

/// The external collaborators of a turn.
#[derive(Clone)]
pub struct Backends {
    pub transcriber: Arc<dyn Transcriber>,
    pub generator: Arc<dyn ReplyGenerator>,
    pub synthesizer: Arc<dyn SpeechSynthesizer>,
    pub avatar: Option<Arc<dyn AvatarRenderer>>,
}

/// Per-turn knobs taken from configuration.
#[derive(Debug, Clone)]
pub struct OrchestratorSettings {
    /// Extension of the staged input artifact
    pub input_extension: String,
    /// Extension of the synthesized audio artifact
    pub output_extension: String,
    /// Voice for personas that do not name one
    pub default_voice: String,
    pub transcription_timeout: Duration,
    pub generation_timeout: Duration,
    pub synthesis_timeout: Duration,
    pub avatar_timeout: Duration,
    pub degrade_to_silence: bool,
}

impl OrchestratorSettings {
    pub fn from_config(config: &AppConfig) -> Self {
        Self {
            input_extension: config.audio.input_format.extension().to_string(),
            output_extension: config.tts.format.clone(),
            default_voice: config.tts.voice.clone(),
            transcription_timeout: config.pipeline.transcription_timeout(),
            generation_timeout: config.pipeline.generation_timeout(),
            synthesis_timeout: config.pipeline.synthesis_timeout(),
            avatar_timeout: Duration::from_secs(config.avatar.timeout_secs),
            degrade_to_silence: config.pipeline.degrade_to_silence,
        }
    }
}

/// How a turn ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TurnOutcome {
    Completed,
    Failed(Stage),
    /// The client disconnected before the turn finished
    Abandoned,
}

/// Process-wide turn counters.
#[derive(Debug, Default)]
pub struct PipelineMetrics {
    turns_started: AtomicU64,
    turns_completed: AtomicU64,
    turns_abandoned: AtomicU64,
    transcription_failures: AtomicU64,
    generation_failures: AtomicU64,
    synthesis_failures: AtomicU64,
    avatar_failures: AtomicU64,
    silence_substitutions: AtomicU64,
}

#[derive(Debug, Clone, Serialize)]
pub struct PipelineMetricsSnapshot {
    pub turns_started: u64,
    pub turns_completed: u64,
    pub turns_abandoned: u64,
    pub turns_failed: u64,
    pub failures_by_stage: FailuresByStage,
    pub silence_substitutions: u64,
}

#[derive(Debug, Clone, Serialize)]
pub struct FailuresByStage {
    pub transcription: u64,
    pub generation: u64,
    pub synthesis: u64,
    pub avatar: u64,
}

impl PipelineMetrics {
    fn record_failure(&self, stage: Stage) {
        let counter = match stage {
            Stage::Transcription => &self.transcription_failures,
            Stage::Generation => &self.generation_failures,
            Stage::Synthesis => &self.synthesis_failures,
            Stage::Avatar => &self.avatar_failures,
            Stage::Protocol | Stage::Weather => return,
        };
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> PipelineMetricsSnapshot {
        let failures = FailuresByStage {
            transcription: self.transcription_failures.load(Ordering::Relaxed),
            generation: self.generation_failures.load(Ordering::Relaxed),
            synthesis: self.synthesis_failures.load(Ordering::Relaxed),
            avatar: self.avatar_failures.load(Ordering::Relaxed),
        };
        PipelineMetricsSnapshot {
            turns_started: self.turns_started.load(Ordering::Relaxed),
            turns_completed: self.turns_completed.load(Ordering::Relaxed),
            turns_abandoned: self.turns_abandoned.load(Ordering::Relaxed),
            turns_failed: failures.transcription + failures.generation + failures.synthesis + failures.avatar,
            failures_by_stage: failures,
            silence_substitutions: self.silence_substitutions.load(Ordering::Relaxed),
        }
    }
}

/// Why a turn stopped early.
enum TurnAbort {
    Failed(PipelineError),
    Abandoned,
}

impl From<PipelineError> for TurnAbort {
    fn from(err: PipelineError) -> Self {
        TurnAbort::Failed(err)
    }
}

/// Sending half of a turn's event stream.
pub struct EventSink {
    tx: mpsc::Sender<OutgoingEvent>,
}

impl EventSink {
    pub fn new(tx: mpsc::Sender<OutgoingEvent>) -> Self {
        Self { tx }
    }

    async fn emit(&self, event: OutgoingEvent) -> Result<(), TurnAbort> {
        self.tx.send(event).await.map_err(|_| TurnAbort::Abandoned)
    }
}

pub struct TurnOrchestrator {
    backends: Backends,
    personas: Arc<PersonaCatalog>,
    staging: StagingArea,
    settings: OrchestratorSettings,
    metrics: PipelineMetrics,
}

impl TurnOrchestrator {
    pub fn new(
        backends: Backends,
        personas: Arc<PersonaCatalog>,
        staging: StagingArea,
        settings: OrchestratorSettings,
    ) -> Self {
        Self {
            backends,
            personas,
            staging,
            settings,
            metrics: PipelineMetrics::default(),
        }
    }

    pub fn metrics(&self) -> &PipelineMetrics {
        &self.metrics
    }

    pub fn personas(&self) -> &PersonaCatalog {
        &self.personas
    }

    pub fn backends(&self) -> &Backends {
        &self.backends
    }

    /// Run `turn` on a background task and return its event stream.
    ///
    /// The stream ends once the turn has finished and cleaned up after itself.
    /// Dropping the stream abandons the turn.
    pub fn spawn(self: &Arc<Self>, turn: Turn) -> ReceiverStream<OutgoingEvent> {
        let (tx, rx) = mpsc::channel(8);
        let orchestrator = Arc::clone(self);
        let span = tracing::info_span!(
            "turn",
            session_id = %turn.id.session_id,
            turn_seq = turn.id.seq,
            kind = turn.input.kind()
        );
        tokio::spawn(
            async move {
                orchestrator.process_turn(turn, EventSink::new(tx)).await;
            }
            .instrument(span),
        );
        ReceiverStream::new(rx)
    }

    /// Drive `turn` to completion, sending its events to `sink`.
    pub async fn process_turn(&self, turn: Turn, sink: EventSink) -> TurnOutcome {
        let started = Instant::now();
        self.metrics.turns_started.fetch_add(1, Ordering::Relaxed);

        // Artifacts live inside `run`, so they are gone before the error is sent.
        let result = self.run(turn, &sink).await;

        let outcome = match result {
            Ok(()) => {
                self.metrics.turns_completed.fetch_add(1, Ordering::Relaxed);
                TurnOutcome::Completed
            }
            Err(TurnAbort::Failed(err)) => {
                let stage = err.stage();
                self.metrics.record_failure(stage);
                warn!(stage = %stage, error = %err, "Turn failed");
                let _ = sink.emit(OutgoingEvent::Error(err)).await;
                TurnOutcome::Failed(stage)
            }
            Err(TurnAbort::Abandoned) => {
                self.metrics.turns_abandoned.fetch_add(1, Ordering::Relaxed);
                info!("Client went away, turn abandoned");
                TurnOutcome::Abandoned
            }
        };

        debug!(?outcome, elapsed_ms = started.elapsed().as_millis() as u64, "Turn finished");
        outcome
    }

    async fn run(&self, turn: Turn, sink: &EventSink) -> Result<(), TurnAbort> {
        let persona = self.personas.resolve(turn.persona.as_deref());
        let id = turn.id;

        let user_text = match turn.input {
            TurnInput::Audio(bytes) => {
                if bytes.is_empty() {
                    return Err(PipelineError::Transcription("no audio received".to_string()).into());
                }
                let input = self
                    .staging
                    .artifact(id.session_id, id.seq, "input", &self.settings.input_extension);
                input
                    .write(&bytes)
                    .await
                    .map_err(|e| PipelineError::Transcription(format!("cannot stage audio: {}", e)))?;
                drop(bytes);

                let transcript = self
                    .stage(
                        sink,
                        Stage::Transcription,
                        self.settings.transcription_timeout,
                        self.backends.transcriber.transcribe(input.path()),
                    )
                    .await?;
                drop(input);

                let transcript = transcript.trim().to_string();
                if transcript.is_empty() {
                    return Err(PipelineError::Transcription("no speech recognized".to_string()).into());
                }
                sink.emit(OutgoingEvent::Transcript(transcript.clone())).await?;
                transcript
            }
            TurnInput::Text(text) => text,
        };

        let reply = self
            .stage(
                sink,
                Stage::Generation,
                self.settings.generation_timeout,
                self.backends.generator.generate(GenerationRequest {
                    text: &user_text,
                    persona: &persona,
                    history: &turn.history,
                }),
            )
            .await?;
        sink.emit(OutgoingEvent::Reply(reply.clone())).await?;

        self.speak(&reply, &persona, id, sink).await
    }

    /// Synthesis plus the optional avatar stage.
    async fn speak(&self, reply: &str, persona: &Persona, id: TurnId, sink: &EventSink) -> Result<(), TurnAbort> {
        let voice = persona.voice.as_deref().unwrap_or(&self.settings.default_voice);
        let output = self
            .staging
            .artifact(id.session_id, id.seq, "reply", &self.settings.output_extension);

        let synthesized = self
            .stage(
                sink,
                Stage::Synthesis,
                self.settings.synthesis_timeout,
                self.backends.synthesizer.synthesize(reply, voice, output.path()),
            )
            .await;

        let audio = match synthesized {
            Ok(()) => output
                .read()
                .await
                .map_err(|e| PipelineError::Synthesis(format!("cannot read synthesized audio: {}", e)))?,
            Err(TurnAbort::Failed(err)) if self.settings.degrade_to_silence => {
                self.metrics.silence_substitutions.fetch_add(1, Ordering::Relaxed);
                warn!(error = %err, "Synthesis failed, sending silence instead");
                sink.emit(OutgoingEvent::Audio(Vec::new())).await?;
                return Ok(());
            }
            Err(abort) => return Err(abort),
        };
        sink.emit(OutgoingEvent::Audio(audio)).await?;

        if let Some(avatar) = &self.backends.avatar {
            let url = self
                .stage(sink, Stage::Avatar, self.settings.avatar_timeout, avatar.render(output.path()))
                .await?;
            drop(output);
            sink.emit(OutgoingEvent::Video(url)).await?;
        }
        Ok(())
    }

    /// Await one external call, bounded by `limit` and by the client staying connected.
    async fn stage<T>(
        &self,
        sink: &EventSink,
        stage: Stage,
        limit: Duration,
        call: impl Future<Output = PipelineResult<T>>,
    ) -> Result<T, TurnAbort> {
        let started = Instant::now();
        let result = tokio::select! {
            _ = sink.tx.closed() => return Err(TurnAbort::Abandoned),
            result = tokio::time::timeout(limit, call) => result,
        };
        debug!(stage = %stage, elapsed_ms = started.elapsed().as_millis() as u64, "Stage finished");

        match result {
            Ok(Ok(value)) => Ok(value),
            Ok(Err(err)) => Err(TurnAbort::Failed(err)),
            Err(_) => Err(TurnAbort::Failed(PipelineError::for_stage(
                stage,
                format!("timed out after {}s", limit.as_secs_f32()),
            ))),
        }
    }
}
