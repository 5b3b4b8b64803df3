//! # Chat WebSocket
//!
//! `GET /ws/chat`: one [`ChatWebSocket`] actor per connection, owning one
//! [`Session`]. Incoming frames:
//!
//! - **Binary**: raw audio chunk, appended to the session buffer
//! - **Text**: control frame (`END` / `TEXT`), see [`crate::session`]
//!
//! Outgoing frames:
//!
//! ```text
//! {"type":"stt","text":...}       transcript of an audio turn
//! {"type":"reply","text":...}     persona reply
//! <binary>                        synthesized reply audio, no envelope
//! {"type":"video","url":...}      rendered avatar video (optional stage)
//! {"type":"error","message":...}  the turn (or a control frame) failed
//! ```
//!
//! Turns run one at a time in arrival order. A turn requested while another is
//! running waits in a bounded queue (`performance.max_queued_turns`); audio chunks
//! keep accumulating meanwhile. A request that finds the queue full gets an `error`
//! frame and is dropped. Pipeline errors never close the connection.
//!
//! When the actor stops, its in-flight turn stream is dropped and the
//! orchestrator abandons the turn.

use crate::error::{AppError, PipelineError};
use crate::pipeline::{OutgoingEvent, Turn, TurnOrchestrator};
use crate::session::{FrameOutcome, Session};
use crate::state::{AppState, SessionSlot};
use actix::prelude::*;
use actix_web::{web, HttpRequest, HttpResponse};
use actix_web_actors::ws;
use serde::Serialize;
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, error, info, warn};

/// Structured server-to-client frame.
#[derive(Debug, Serialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum ServerMessage {
    Stt { text: String },
    Reply { text: String },
    Video { url: String },
    Error { message: String },
}

pub struct ChatWebSocket {
    session: Session,
    orchestrator: Arc<TurnOrchestrator>,
    heartbeat_interval: Duration,
    client_timeout: Duration,
    last_heartbeat: Instant,
    turn_running: bool,
    queued_turns: VecDeque<Turn>,
    max_queued_turns: usize,
    /// Held for the lifetime of the connection
    _slot: SessionSlot,
}

impl ChatWebSocket {
    pub fn new(state: &AppState, slot: SessionSlot) -> Self {
        let config = state.get_config();
        Self {
            session: Session::new(config.session.max_history_turns),
            orchestrator: Arc::clone(&state.orchestrator),
            heartbeat_interval: Duration::from_secs(config.performance.heartbeat_interval_secs),
            client_timeout: Duration::from_secs(config.performance.client_timeout_secs),
            last_heartbeat: Instant::now(),
            turn_running: false,
            queued_turns: VecDeque::new(),
            max_queued_turns: config.performance.max_queued_turns,
            _slot: slot,
        }
    }

    fn send(&self, message: &ServerMessage, ctx: &mut ws::WebsocketContext<Self>) {
        match serde_json::to_string(message) {
            Ok(json) => ctx.text(json),
            Err(e) => error!(session_id = %self.session.id(), "Failed to encode frame: {}", e),
        }
    }

    fn send_error(&self, err: &PipelineError, ctx: &mut ws::WebsocketContext<Self>) {
        self.send(
            &ServerMessage::Error {
                message: err.to_string(),
            },
            ctx,
        );
    }

    fn request_turn(&mut self, turn: Turn, ctx: &mut ws::WebsocketContext<Self>) {
        if self.turn_running && self.queued_turns.len() >= self.max_queued_turns {
            warn!(
                session_id = %self.session.id(),
                turn_seq = turn.id.seq,
                limit = self.max_queued_turns,
                "Turn queue full, dropping turn"
            );
            let err = PipelineError::ConnectionProtocol(format!(
                "too many pending turns (limit {}), wait for the current reply",
                self.max_queued_turns
            ));
            self.send_error(&err, ctx);
        } else if self.turn_running {
            debug!(
                session_id = %self.session.id(),
                turn_seq = turn.id.seq,
                queued = self.queued_turns.len() + 1,
                "Turn queued behind running turn"
            );
            self.queued_turns.push_back(turn);
        } else {
            self.start_turn(turn, ctx);
        }
    }

    fn start_turn(&mut self, mut turn: Turn, ctx: &mut ws::WebsocketContext<Self>) {
        self.session.begin_turn(&mut turn);
        self.turn_running = true;

        let events = self.orchestrator.spawn(turn);
        ctx.spawn(
            actix::fut::wrap_stream(events)
                .map(|event, act: &mut Self, ctx: &mut ws::WebsocketContext<Self>| act.deliver(event, ctx))
                .finish()
                .map(|_, act: &mut Self, ctx: &mut ws::WebsocketContext<Self>| {
                    act.turn_running = false;
                    if let Some(next) = act.queued_turns.pop_front() {
                        act.start_turn(next, ctx);
                    }
                }),
        );
    }

    fn deliver(&mut self, event: OutgoingEvent, ctx: &mut ws::WebsocketContext<Self>) {
        self.session.record_event(&event);
        match event {
            OutgoingEvent::Transcript(text) => self.send(&ServerMessage::Stt { text }, ctx),
            OutgoingEvent::Reply(text) => self.send(&ServerMessage::Reply { text }, ctx),
            OutgoingEvent::Audio(audio) => ctx.binary(audio),
            OutgoingEvent::Video(url) => self.send(&ServerMessage::Video { url }, ctx),
            OutgoingEvent::Error(err) => self.send_error(&err, ctx),
        }
    }
}

impl Actor for ChatWebSocket {
    type Context = ws::WebsocketContext<Self>;

    fn started(&mut self, ctx: &mut Self::Context) {
        info!(session_id = %self.session.id(), "Chat session opened");

        ctx.run_interval(self.heartbeat_interval, |act, ctx| {
            if Instant::now().duration_since(act.last_heartbeat) > act.client_timeout {
                warn!(session_id = %act.session.id(), "Client heartbeat timed out, closing session");
                ctx.stop();
                return;
            }
            ctx.ping(b"");
        });
    }

    fn stopped(&mut self, _ctx: &mut Self::Context) {
        info!(
            session_id = %self.session.id(),
            turns = self.session.turn_count(),
            discarded_bytes = self.session.buffered_bytes(),
            discarded_turns = self.queued_turns.len(),
            "Chat session closed"
        );
    }
}

impl StreamHandler<Result<ws::Message, ws::ProtocolError>> for ChatWebSocket {
    fn handle(&mut self, msg: Result<ws::Message, ws::ProtocolError>, ctx: &mut Self::Context) {
        match msg {
            Ok(ws::Message::Binary(data)) => {
                self.last_heartbeat = Instant::now();
                self.session.on_binary(&data);
            }
            Ok(ws::Message::Text(text)) => {
                self.last_heartbeat = Instant::now();
                match self.session.on_control(&text) {
                    FrameOutcome::StartTurn(turn) => self.request_turn(turn, ctx),
                    FrameOutcome::Ignored => {}
                    FrameOutcome::Rejected(err) => {
                        warn!(session_id = %self.session.id(), error = %err, "Rejected control frame");
                        self.send_error(&err, ctx);
                    }
                }
            }
            Ok(ws::Message::Ping(data)) => {
                self.last_heartbeat = Instant::now();
                ctx.pong(&data);
            }
            Ok(ws::Message::Pong(_)) => {
                self.last_heartbeat = Instant::now();
            }
            Ok(ws::Message::Close(reason)) => {
                debug!(session_id = %self.session.id(), ?reason, "Client closed the connection");
                ctx.close(reason);
                ctx.stop();
            }
            Ok(ws::Message::Continuation(_)) => {
                warn!(session_id = %self.session.id(), "Unexpected continuation frame");
            }
            Ok(ws::Message::Nop) => {}
            Err(err) => {
                error!(session_id = %self.session.id(), "WebSocket protocol error: {}", err);
                ctx.stop();
            }
        }
    }
}

pub async fn chat_websocket(
    req: HttpRequest,
    stream: web::Payload,
    state: web::Data<AppState>,
) -> Result<HttpResponse, actix_web::Error> {
    let slot = state.try_open_session().ok_or_else(|| {
        warn!(
            limit = state.get_config().performance.max_concurrent_sessions,
            "Rejecting chat session, server is at capacity"
        );
        AppError::Unavailable("too many active chat sessions".to_string())
    })?;

    let actor = ChatWebSocket::new(&state, slot);
    ws::WsResponseBuilder::new(actor, &req, stream)
        .frame_size(state.get_config().performance.max_frame_bytes)
        .start()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::AppConfig;
    use crate::pipeline::testing::{spawn_http_server, FakeBackends, ScriptedGenerator, ScriptedTranscriber};
    use crate::state::tests::test_state;
    use futures_util::{SinkExt, StreamExt};
    use serde_json::{json, Value};
    use tokio_tungstenite::tungstenite::Message;

    type Client = tokio_tungstenite::WebSocketStream<tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>>;

    #[derive(Debug, PartialEq)]
    enum Received {
        Json(Value),
        Binary(Vec<u8>),
    }

    fn chat_server(state: AppState) -> String {
        let base = spawn_http_server(move |cfg| {
            cfg.app_data(web::Data::new(state.clone()))
                .route("/ws/chat", web::get().to(chat_websocket));
        });
        format!("{}/ws/chat", base.replacen("http", "ws", 1))
    }

    async fn connect(url: &str) -> Client {
        let (client, _) = tokio_tungstenite::connect_async(url).await.unwrap();
        client
    }

    async fn next_frame(client: &mut Client) -> Received {
        loop {
            let message = tokio::time::timeout(Duration::from_secs(5), client.next())
                .await
                .expect("timed out waiting for a frame")
                .expect("connection closed")
                .unwrap();
            match message {
                Message::Text(text) => return Received::Json(serde_json::from_str(&text).unwrap()),
                Message::Binary(data) => return Received::Binary(data),
                _ => continue,
            }
        }
    }

    async fn send_json(client: &mut Client, value: Value) {
        client.send(Message::Text(value.to_string())).await.unwrap();
    }

    async fn wait_until_empty(dir: &std::path::Path) -> usize {
        for _ in 0..50 {
            let count = std::fs::read_dir(dir).unwrap().count();
            if count == 0 {
                return 0;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        std::fs::read_dir(dir).unwrap().count()
    }

    #[test]
    fn test_server_message_wire_format() {
        let stt = serde_json::to_value(ServerMessage::Stt { text: "hi".to_string() }).unwrap();
        assert_eq!(stt, json!({"type": "stt", "text": "hi"}));
        let err = serde_json::to_value(ServerMessage::Error {
            message: "boom".to_string(),
        })
        .unwrap();
        assert_eq!(err, json!({"type": "error", "message": "boom"}));
    }

    #[actix_web::test]
    async fn test_audio_chunks_then_end_produce_stt_reply_audio() {
        let dir = tempfile::tempdir().unwrap();
        let fakes = FakeBackends::default();
        let url = chat_server(test_state(dir.path(), &fakes, AppConfig::default()));
        let mut client = connect(&url).await;

        for chunk in [&b"b1"[..], b"b2", b"b3"] {
            client.send(Message::Binary(chunk.to_vec())).await.unwrap();
        }
        send_json(&mut client, json!({"type": "END", "role": "socrates"})).await;

        assert_eq!(next_frame(&mut client).await, Received::Json(json!({"type": "stt", "text": "你好"})));
        assert_eq!(
            next_frame(&mut client).await,
            Received::Json(json!({"type": "reply", "text": "[socrates] 你好"}))
        );
        assert_eq!(
            next_frame(&mut client).await,
            Received::Binary("audio:[socrates] 你好".as_bytes().to_vec())
        );

        assert_eq!(fakes.transcriber.payloads(), vec![b"b1b2b3".to_vec()]);
        assert_eq!(wait_until_empty(dir.path()).await, 0);

        // A second END sees an empty buffer.
        send_json(&mut client, json!({"type": "END"})).await;
        match next_frame(&mut client).await {
            Received::Json(frame) => {
                assert_eq!(frame["type"], "error");
                assert!(frame["message"].as_str().unwrap().contains("no audio received"));
            }
            other => panic!("expected an error frame, got {:?}", other),
        }
    }

    #[actix_web::test]
    async fn test_text_turn_skips_stt_and_keeps_history() {
        let dir = tempfile::tempdir().unwrap();
        let fakes = FakeBackends::default();
        let url = chat_server(test_state(dir.path(), &fakes, AppConfig::default()));
        let mut client = connect(&url).await;

        send_json(&mut client, json!({"type": "TEXT", "role": "einstein", "text": "What is time?"})).await;
        assert_eq!(
            next_frame(&mut client).await,
            Received::Json(json!({"type": "reply", "text": "[einstein] What is time?"}))
        );
        assert!(matches!(next_frame(&mut client).await, Received::Binary(_)));

        send_json(&mut client, json!({"type": "TEXT", "role": "einstein", "text": "And space?"})).await;
        let _ = next_frame(&mut client).await;
        let _ = next_frame(&mut client).await;

        let requests = fakes.generator.requests();
        assert_eq!(requests.len(), 2);
        assert_eq!(requests[0].history_len, 0);
        assert_eq!(requests[1].history_len, 1);
        assert!(fakes.transcriber.payloads().is_empty());
    }

    #[actix_web::test]
    async fn test_failed_turn_and_bad_frames_keep_the_connection_open() {
        let dir = tempfile::tempdir().unwrap();
        let fakes = FakeBackends {
            transcriber: Arc::new(ScriptedTranscriber::failing("stt offline")),
            ..FakeBackends::default()
        };
        let url = chat_server(test_state(dir.path(), &fakes, AppConfig::default()));
        let mut client = connect(&url).await;

        client.send(Message::Binary(b"audio".to_vec())).await.unwrap();
        send_json(&mut client, json!({"type": "END"})).await;
        assert_eq!(
            next_frame(&mut client).await,
            Received::Json(json!({"type": "error", "message": "transcription failed: stt offline"}))
        );

        client.send(Message::Text("not json".to_string())).await.unwrap();
        match next_frame(&mut client).await {
            Received::Json(frame) => assert_eq!(frame["type"], "error"),
            other => panic!("expected an error frame, got {:?}", other),
        }

        send_json(&mut client, json!({"type": "UNKNOWN"})).await;
        send_json(&mut client, json!({"type": "TEXT", "text": "still there?"})).await;
        assert_eq!(
            next_frame(&mut client).await,
            Received::Json(json!({"type": "reply", "text": "[socrates] still there?"}))
        );
        assert!(matches!(next_frame(&mut client).await, Received::Binary(_)));
        assert_eq!(wait_until_empty(dir.path()).await, 0);
    }

    #[actix_web::test]
    async fn test_turns_beyond_the_queue_limit_are_refused() {
        let dir = tempfile::tempdir().unwrap();
        let fakes = FakeBackends {
            generator: Arc::new(ScriptedGenerator::stalled(Duration::from_millis(300))),
            ..FakeBackends::default()
        };
        let mut config = AppConfig::default();
        config.performance.max_queued_turns = 1;
        let url = chat_server(test_state(dir.path(), &fakes, config));
        let mut client = connect(&url).await;

        for text in ["one", "two", "three"] {
            send_json(&mut client, json!({"type": "TEXT", "text": text})).await;
        }

        // The third request is refused while the first still runs.
        match next_frame(&mut client).await {
            Received::Json(frame) => {
                assert_eq!(frame["type"], "error");
                assert!(frame["message"].as_str().unwrap().contains("too many pending turns"));
            }
            other => panic!("expected an error frame, got {:?}", other),
        }
        for _ in 0..2 {
            match next_frame(&mut client).await {
                Received::Json(frame) => {
                    assert!(frame["message"].as_str().unwrap().starts_with("reply generation failed"))
                }
                other => panic!("expected a generation error, got {:?}", other),
            }
        }

        let texts: Vec<String> = fakes.generator.requests().into_iter().map(|r| r.text).collect();
        assert_eq!(texts, vec!["one".to_string(), "two".to_string()]);
    }

    #[actix_web::test]
    async fn test_sessions_beyond_capacity_are_refused() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = AppConfig::default();
        config.performance.max_concurrent_sessions = 1;
        let state = test_state(dir.path(), &FakeBackends::default(), config);
        let url = chat_server(state.clone());

        let _first = connect(&url).await;
        match tokio_tungstenite::connect_async(url.as_str()).await {
            Err(tokio_tungstenite::tungstenite::Error::Http(response)) => {
                assert_eq!(response.status().as_u16(), 503)
            }
            other => panic!("expected a 503 refusal, got {:?}", other.map(|(_, r)| r.status())),
        }
        assert_eq!(state.get_metrics_snapshot().rejected_sessions, 1);
    }
}
