//! # Voice Chat Backend
//!
//! Real-time spoken conversation with role-play personas. A browser streams
//! microphone audio over `/ws/chat`; each finished utterance is transcribed,
//! answered in character by an LLM and spoken back as synthesized audio.
//!
//! ## Modules:
//! - **session / websocket**: per-connection state machine and its actor
//! - **pipeline**: turn orchestration across the external backends
//! - **transcription / generation / synthesis / avatar**: the backends
//! - **audio**: chunk buffering, staging artifacts, format normalization
//! - **weather**: AMap weather proxy behind `/api/weather`
//! - **config / state / health / middleware / handlers / error**: service plumbing

mod audio;
mod avatar;
mod config;
mod device;
mod error;
mod generation;
mod handlers;
mod health;
mod middleware;
mod pipeline;
mod session;
mod state;
mod synthesis;
mod transcription;
mod weather;
mod websocket;

use actix_cors::Cors;
use actix_web::{web, App, HttpServer};
use anyhow::{Context, Result};
use audio::StagingArea;
use crate::config::AppConfig;
use pipeline::{Backends, OrchestratorSettings, PersonaCatalog, TurnOrchestrator};
use state::AppState;
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info};
use tracing_actix_web::TracingLogger;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};
use weather::WeatherClient;

#[actix_web::main]
async fn main() -> Result<()> {
    dotenv::dotenv().ok();
    init_tracing();

    let config = AppConfig::load()?;
    config.validate()?;
    let config = Arc::new(config);

    info!("Starting voice-chat-backend v{}", env!("CARGO_PKG_VERSION"));
    info!(
        stt = ?config.stt.backend,
        llm = ?config.llm.backend,
        input_format = ?config.audio.input_format,
        "Configuration loaded: {}:{}",
        config.server.host,
        config.server.port
    );

    let state = build_state(Arc::clone(&config))?;
    let bind_addr = format!("{}:{}", config.server.host, config.server.port);
    info!("Starting HTTP server on {}", bind_addr);

    let server = HttpServer::new(move || {
        let cors = Cors::default()
            .allow_any_origin()
            .allow_any_method()
            .allow_any_header()
            .max_age(3600);

        App::new()
            .app_data(web::Data::new(state.clone()))
            .wrap(cors)
            .wrap(middleware::RequestTelemetry)
            .wrap(TracingLogger::default())
            .route("/ws/chat", web::get().to(websocket::chat_websocket))
            .route("/api/weather", web::get().to(handlers::get_weather))
            .service(
                web::scope("/api/v1")
                    .route("/health", web::get().to(health::health_check))
                    .route("/metrics", web::get().to(health::detailed_metrics))
                    .route("/config", web::get().to(handlers::get_config)),
            )
            .route("/health", web::get().to(health::health_check))
    })
    .bind(&bind_addr)
    .with_context(|| format!("cannot bind {}", bind_addr))?
    .disable_signals()
    .run();

    let server_handle = server.handle();
    let server_task = tokio::spawn(server);

    tokio::select! {
        result = server_task => {
            match result {
                Ok(Err(e)) => error!("Server error: {}", e),
                Err(e) => error!("Server task error: {}", e),
                Ok(Ok(())) => {}
            }
        }
        signal = shutdown_signal() => {
            info!("Received {}, stopping server...", signal);
            server_handle.stop(true).await;
        }
    }

    info!("Server stopped gracefully");
    Ok(())
}

/// `RUST_LOG` controls verbosity; defaults to debug for this crate.
fn init_tracing() {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "voice_chat_backend=debug,actix_web=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();
}

/// Wire the backends, personas and staging area into the shared state.
fn build_state(config: Arc<AppConfig>) -> Result<AppState> {
    // One connection pool for every upstream; per-call timeouts are set by the pipeline.
    let http = reqwest::Client::builder()
        .connect_timeout(Duration::from_secs(10))
        .build()
        .context("cannot build HTTP client")?;

    let backends = Backends {
        transcriber: transcription::from_config(&config, http.clone())?,
        generator: generation::from_config(&config, http.clone()),
        synthesizer: synthesis::from_config(&config, http.clone()),
        avatar: avatar::from_config(&config.avatar, http.clone()),
    };
    info!(
        transcriber = backends.transcriber.name(),
        generator = backends.generator.name(),
        synthesizer = backends.synthesizer.name(),
        avatar = backends.avatar.is_some(),
        "Pipeline backends ready"
    );

    let personas = PersonaCatalog::from_config(&config.personas, &config.session.default_persona)?;
    info!(personas = ?personas.ids(), "Personas loaded");

    let staging = StagingArea::new(&config.pipeline.staging_dir).with_context(|| {
        format!("cannot create staging directory {}", config.pipeline.staging_dir.display())
    })?;

    let orchestrator = Arc::new(TurnOrchestrator::new(
        backends,
        Arc::new(personas),
        staging,
        OrchestratorSettings::from_config(&config),
    ));
    let weather = Arc::new(WeatherClient::new(http, &config.weather));

    Ok(AppState::new(config, orchestrator, weather))
}

/// Resolves on SIGINT or SIGTERM with the signal's name.
async fn shutdown_signal() -> &'static str {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        match (signal(SignalKind::terminate()), signal(SignalKind::interrupt())) {
            (Ok(mut sigterm), Ok(mut sigint)) => {
                tokio::select! {
                    _ = sigterm.recv() => "SIGTERM",
                    _ = sigint.recv() => "SIGINT",
                }
            }
            _ => {
                error!("Failed to install signal handlers, falling back to Ctrl-C");
                let _ = tokio::signal::ctrl_c().await;
                "Ctrl-C"
            }
        }
    }
    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
        "Ctrl-C"
    }
}
