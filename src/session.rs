//! # Chat Session State
//!
//! Per-connection state machine of `/ws/chat`. A [`Session`] is owned by exactly
//! one WebSocket actor and never shared, so it needs no locking.
//!
//! ## Frame handling:
//! - **Binary frame**: appended to the audio buffer
//! - **`{"type":"END","role":...}`**: the buffered audio becomes an audio turn
//!   and the buffer is emptied, whatever the turn's outcome
//! - **`{"type":"TEXT","role":...,"text":...}`**: a text turn; buffered audio is
//!   left untouched
//! - **Any other `type`**: ignored
//! - **Not JSON / no `type`**: rejected with a protocol error, session continues
//!
//! The buffer therefore always holds exactly the bytes received since the later
//! of connection start and the last `END`.

use crate::audio::AudioBuffer;
use crate::error::PipelineError;
use crate::pipeline::{Exchange, OutgoingEvent, Turn, TurnId, TurnInput};
use serde::Deserialize;
use std::collections::VecDeque;
use tracing::debug;
use uuid::Uuid;

/// Incoming control message.
#[derive(Debug, Deserialize)]
pub struct ControlFrame {
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default)]
    pub role: Option<String>,
    #[serde(default)]
    pub text: Option<String>,
}

/// What the connection should do after a control frame.
#[derive(Debug)]
pub enum FrameOutcome {
    StartTurn(Turn),
    Ignored,
    Rejected(PipelineError),
}

#[derive(Debug)]
pub struct Session {
    id: Uuid,
    buffer: AudioBuffer,
    turn_seq: u64,
    history: VecDeque<Exchange>,
    max_history: usize,
    /// User side of the exchange the running turn is building
    pending_user_text: Option<String>,
}

impl Session {
    pub fn new(max_history: usize) -> Self {
        Self {
            id: Uuid::new_v4(),
            buffer: AudioBuffer::new(),
            turn_seq: 0,
            history: VecDeque::with_capacity(max_history),
            max_history,
            pending_user_text: None,
        }
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn turn_count(&self) -> u64 {
        self.turn_seq
    }

    pub fn buffered_bytes(&self) -> usize {
        self.buffer.len()
    }

    #[cfg(test)]
    pub fn history(&self) -> impl Iterator<Item = &Exchange> {
        self.history.iter()
    }

    pub fn on_binary(&mut self, chunk: &[u8]) {
        self.buffer.append(chunk);
    }

    pub fn on_control(&mut self, raw: &str) -> FrameOutcome {
        let frame: ControlFrame = match serde_json::from_str(raw) {
            Ok(frame) => frame,
            Err(e) => {
                return FrameOutcome::Rejected(PipelineError::ConnectionProtocol(format!(
                    "invalid control frame: {}",
                    e
                )))
            }
        };

        match frame.kind.as_str() {
            "END" => {
                let chunks = self.buffer.chunk_count();
                let audio = self.buffer.take();
                debug!(session_id = %self.id, chunks, bytes = audio.len(), "Audio turn finalized");
                FrameOutcome::StartTurn(self.next_turn(TurnInput::Audio(audio), frame.role))
            }
            "TEXT" => match frame.text.filter(|t| !t.trim().is_empty()) {
                Some(text) => FrameOutcome::StartTurn(self.next_turn(TurnInput::Text(text), frame.role)),
                None => FrameOutcome::Rejected(PipelineError::ConnectionProtocol(
                    "TEXT frame requires non-empty text".to_string(),
                )),
            },
            other => {
                debug!(session_id = %self.id, kind = other, "Ignoring unknown control frame");
                FrameOutcome::Ignored
            }
        }
    }

    /// Mark `turn` as the running turn, giving it the history as it stands now.
    ///
    /// Turns that queued behind a running one are built before that turn's
    /// exchange is recorded, so the history is refreshed here.
    pub fn begin_turn(&mut self, turn: &mut Turn) {
        turn.history = self.history.iter().cloned().collect();
        self.pending_user_text = match &turn.input {
            TurnInput::Text(text) => Some(text.clone()),
            TurnInput::Audio(_) => None,
        };
    }

    /// Update conversation history from an event of the running turn.
    pub fn record_event(&mut self, event: &OutgoingEvent) {
        match event {
            OutgoingEvent::Transcript(text) => self.pending_user_text = Some(text.clone()),
            OutgoingEvent::Reply(reply) => {
                if let Some(user) = self.pending_user_text.take() {
                    self.push_exchange(Exchange {
                        user,
                        assistant: reply.clone(),
                    });
                }
            }
            OutgoingEvent::Error(_) => self.pending_user_text = None,
            OutgoingEvent::Audio(_) | OutgoingEvent::Video(_) => {}
        }
    }

    fn push_exchange(&mut self, exchange: Exchange) {
        if self.max_history == 0 {
            return;
        }
        while self.history.len() >= self.max_history {
            self.history.pop_front();
        }
        self.history.push_back(exchange);
    }

    fn next_turn(&mut self, input: TurnInput, role: Option<String>) -> Turn {
        self.turn_seq += 1;
        Turn {
            id: TurnId {
                session_id: self.id,
                seq: self.turn_seq,
            },
            input,
            persona: role,
            history: self.history.iter().cloned().collect(),
        }
    }
}
