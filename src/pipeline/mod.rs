//! # Turn Pipeline
//!
//! A *turn* is one request/response exchange inside a chat session: either a
//! finished audio recording or a literal text message, answered with a spoken
//! reply. The [`orchestrator`] drives the stages of a turn; this module holds the
//! data that flows between the session and the orchestrator.
//!
//! ## Event order within a turn:
//! ```text
//! AudioTurn:  Transcript → Reply → Audio [→ Video]
//! TextTurn:               Reply → Audio [→ Video]
//! ```
//! Any stage failure ends the turn with exactly one `Error` event.

pub mod orchestrator;
pub mod persona;

#[cfg(test)]
pub mod testing;

pub use orchestrator::{Backends, OrchestratorSettings, TurnOrchestrator};
pub use persona::{Persona, PersonaCatalog};

use crate::error::PipelineError;
use serde::Serialize;
use uuid::Uuid;

/// Identifies a turn: the owning session plus its sequence number.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TurnId {
    pub session_id: Uuid,
    pub seq: u64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TurnInput {
    /// Concatenated audio chunks received since the previous turn boundary
    Audio(Vec<u8>),
    /// Literal user text, skipping transcription
    Text(String),
}

impl TurnInput {
    pub fn kind(&self) -> &'static str {
        match self {
            TurnInput::Audio(_) => "audio",
            TurnInput::Text(_) => "text",
        }
    }
}

/// One completed user/assistant exchange kept as generation context.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Exchange {
    pub user: String,
    pub assistant: String,
}

#[derive(Debug, Clone)]
pub struct Turn {
    pub id: TurnId,
    pub input: TurnInput,
    /// Requested persona role; `None` or unknown ids use the default persona
    pub persona: Option<String>,
    /// Earlier exchanges of the same session, oldest first
    pub history: Vec<Exchange>,
}

/// Results a turn produces, in the order it produces them.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OutgoingEvent {
    Transcript(String),
    Reply(String),
    /// Synthesized speech; empty when synthesis failed and silence was substituted
    Audio(Vec<u8>),
    /// Location of the rendered talking-head video
    Video(String),
    Error(PipelineError),
}
