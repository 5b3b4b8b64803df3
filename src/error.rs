//! # Error Handling
//!
//! Two families of errors live here:
//!
//! - [`AppError`]: failures on the plain HTTP surface, such as refusing a chat
//!   connection at capacity. They convert into JSON HTTP responses through actix's
//!   `ResponseError`.
//! - [`PipelineError`]: failures inside a voice-chat turn or the weather proxy. These
//!   never become HTTP error statuses; the session actor turns them into a single
//!   `{"type":"error"}` frame and the weather proxy into an `{"error": ...}` field.
//!
//! ## Error Categories (pipeline):
//! - **ConnectionProtocol**: the client sent a control frame we cannot interpret
//! - **Transcription / Generation / Synthesis**: one of the three external stages failed
//! - **UpstreamWeather**: the third-party weather API could not be used
//!
//! All pipeline errors are local to one turn (or one weather request). None of them
//! terminates a connection or the process.

use actix_web::{HttpResponse, ResponseError};
use serde_json::json;
use thiserror::Error;

/// Errors surfaced by HTTP handlers.
#[derive(Debug, Error)]
pub enum AppError {
    /// The server is at capacity (e.g. too many live chat sessions) → 503
    #[error("Service unavailable: {0}")]
    Unavailable(String),
}

/// Converts errors into the JSON body every endpoint shares:
///
/// ```json
/// {
///   "error": {
///     "type": "unavailable",
///     "message": "too many active chat sessions",
///     "timestamp": "2025-01-01T12:00:00Z"
///   }
/// }
/// ```
impl ResponseError for AppError {
    fn status_code(&self) -> actix_web::http::StatusCode {
        match self {
            AppError::Unavailable(_) => actix_web::http::StatusCode::SERVICE_UNAVAILABLE,
        }
    }

    fn error_response(&self) -> HttpResponse {
        let (error_type, message) = match self {
            AppError::Unavailable(msg) => ("unavailable", msg),
        };

        HttpResponse::build(self.status_code()).json(json!({
            "error": {
                "type": error_type,
                "message": message,
                "timestamp": chrono::Utc::now().to_rfc3339()
            }
        }))
    }
}

/// The stage of the turn pipeline an error belongs to.
///
/// Used for metrics labels and log fields; `Display` gives the snake_case name.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Stage {
    Protocol,
    Transcription,
    Generation,
    Synthesis,
    Avatar,
    Weather,
}

impl Stage {
    pub fn as_str(&self) -> &'static str {
        match self {
            Stage::Protocol => "protocol",
            Stage::Transcription => "transcription",
            Stage::Generation => "generation",
            Stage::Synthesis => "synthesis",
            Stage::Avatar => "avatar",
            Stage::Weather => "weather",
        }
    }
}

impl std::fmt::Display for Stage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Typed failures of the voice pipeline and the weather proxy.
///
/// Each variant carries a human-readable message; the message (prefixed by the
/// variant's label) is exactly what the client sees in the `error` frame.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum PipelineError {
    #[error("protocol error: {0}")]
    ConnectionProtocol(String),

    #[error("transcription failed: {0}")]
    Transcription(String),

    #[error("reply generation failed: {0}")]
    Generation(String),

    #[error("speech synthesis failed: {0}")]
    Synthesis(String),

    #[error("avatar rendering failed: {0}")]
    Avatar(String),

    #[error("weather lookup failed: {0}")]
    UpstreamWeather(String),
}

impl PipelineError {
    /// Pipeline stage this error originated from.
    pub fn stage(&self) -> Stage {
        match self {
            PipelineError::ConnectionProtocol(_) => Stage::Protocol,
            PipelineError::Transcription(_) => Stage::Transcription,
            PipelineError::Generation(_) => Stage::Generation,
            PipelineError::Synthesis(_) => Stage::Synthesis,
            PipelineError::Avatar(_) => Stage::Avatar,
            PipelineError::UpstreamWeather(_) => Stage::Weather,
        }
    }

    /// Build an error of the given stage's kind. Used by the orchestrator when a
    /// stage times out and the adapter never got to produce its own error.
    pub fn for_stage(stage: Stage, message: impl Into<String>) -> Self {
        let message = message.into();
        match stage {
            Stage::Protocol => PipelineError::ConnectionProtocol(message),
            Stage::Transcription => PipelineError::Transcription(message),
            Stage::Generation => PipelineError::Generation(message),
            Stage::Synthesis => PipelineError::Synthesis(message),
            Stage::Avatar => PipelineError::Avatar(message),
            Stage::Weather => PipelineError::UpstreamWeather(message),
        }
    }
}

pub type PipelineResult<T> = Result<T, PipelineError>;
