//! # Voice Pipeline Backend - Main Application Entry Point
//!
//! Real-time voice server for small IoT devices. A device streams Opus audio
//! over a WebSocket; the server detects speech, transcribes it, asks a
//! language model for a reply and streams synthesized speech back.
//!
//! ## Key Rust Concepts Used:
//! - **async/await**: every connection, turn and playback runs as a task
//! - **modules**: one module per pipeline stage
//! - **Result<T, E>**: startup failures bubble up to `main` with `?`
//! - **static**: the shutdown flag lives for the whole program
//!
//! ## Application Architecture:
//! - **config**: TOML file + environment variables
//! - **audio**: Opus codec bridge, noise gate and PCM helpers
//! - **vad**: voice activity detection with pre-roll
//! - **pipeline**: STT orchestration, sentence segmentation, TTS ordering, playback
//! - **dialogue**: wires the pipeline together per session
//! - **session**: the session registry and inactivity sweep
//! - **websocket**: the device-facing actor
//! - **handlers** / **health**: the HTTP API
//! - **providers**: OpenAI-compatible speech and chat clients

mod audio; // Opus codec, noise gate, PCM helpers (audio/ directory)
mod config; // Configuration management (config.rs)
mod device; // Device to conversation directory (device.rs)
mod dialogue; // Per-session turn orchestration (dialogue.rs)
mod error; // Error handling types (error.rs)
mod handlers; // HTTP request handlers (handlers/ directory)
mod health; // Health check endpoint (health.rs)
mod pipeline; // STT, segmentation, TTS and playback (pipeline/ directory)
mod protocol; // Device wire messages (protocol.rs)
mod providers; // External speech and language services (providers/ directory)
mod session; // Session registry (session.rs)
mod state; // Application state management (state.rs)
mod vad; // Voice activity detection (vad/ directory)
mod websocket; // Device WebSocket actor (websocket.rs)

use actix_cors::Cors;
use actix_web::{web, App, HttpServer};
use anyhow::Result;
use crate::config::AppConfig;
use crate::state::AppState;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tracing::{error, info};
use tracing_actix_web::TracingLogger;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// Set by the signal handler; polled by `wait_for_shutdown`.
static SHUTDOWN_SIGNAL: AtomicBool = AtomicBool::new(false);

/// The main application entry point.
///
/// ## What this function does:
/// 1. **Loads configuration** from files and environment variables
/// 2. **Sets up logging**
/// 3. **Builds the pipeline** and the shared application state
/// 4. **Starts the inactivity sweeper** for idle sessions
/// 5. **Serves HTTP and WebSocket** until a shutdown signal arrives
#[actix_web::main]
async fn main() -> Result<()> {
    dotenv::dotenv().ok();

    init_tracing()?;

    let config = AppConfig::load()?;
    config.validate()?;

    info!("Starting voice-pipeline-backend v{}", env!("CARGO_PKG_VERSION"));
    info!(
        "Configuration loaded: {}:{} (audio {} Hz, {} ch, {} ms frames)",
        config.server.host,
        config.server.port,
        config.audio.sample_rate,
        config.audio.channels,
        config.audio.frame_duration_ms
    );

    let app_state = AppState::new(config.clone())?;
    let bind_addr = format!("{}:{}", config.server.host, config.server.port);
    let ws_path = config.server.ws_path.clone();

    let sweeper = app_state.registry.spawn_sweeper(
        Duration::from_secs(config.session.sweep_interval_secs),
        Duration::from_secs(config.session.inactivity_timeout_secs),
    );

    setup_signal_handlers();

    info!("Starting HTTP server on {} (devices connect to {})", bind_addr, ws_path);

    let server = HttpServer::new(move || {
        let cors = Cors::default()
            .allow_any_origin()
            .allow_any_method()
            .allow_any_header()
            .max_age(3600);

        App::new()
            .app_data(web::Data::new(app_state.clone()))
            .wrap(cors)
            .wrap(TracingLogger::default())
            .service(
                web::scope("/api/v1")
                    .route("/health", web::get().to(health::health_check))
                    .route("/config", web::get().to(handlers::get_config))
                    .route("/config", web::put().to(handlers::update_config))
                    .route("/sessions", web::get().to(handlers::list_sessions))
                    .route("/sessions/{id}", web::delete().to(handlers::close_session)),
            )
            .route("/health", web::get().to(health::health_check))
            .route(&ws_path, web::get().to(websocket::voice_websocket))
    })
    .bind(&bind_addr)?
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
        _ = wait_for_shutdown() => {
            info!("Shutdown signal received, stopping server...");
            server_handle.stop(true).await;
        }
    }

    sweeper.abort();
    info!("Server stopped gracefully");
    Ok(())
}

/// Initialize tracing.
///
/// `RUST_LOG` overrides the default filter, e.g.
/// `RUST_LOG=voice_pipeline_backend=trace` to see every ignored frame.
fn init_tracing() -> Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "voice_pipeline_backend=debug,actix_web=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    Ok(())
}

/// Set the shutdown flag on SIGTERM or SIGINT.
fn setup_signal_handlers() {
    use tokio::signal::unix::{signal, SignalKind};

    tokio::spawn(async {
        let (mut sigterm, mut sigint) =
            match (signal(SignalKind::terminate()), signal(SignalKind::interrupt())) {
                (Ok(term), Ok(int)) => (term, int),
                (Err(e), _) | (_, Err(e)) => {
                    error!("Failed to install signal handlers: {}", e);
                    return;
                }
            };

        tokio::select! {
            _ = sigterm.recv() => info!("Received SIGTERM"),
            _ = sigint.recv() => info!("Received SIGINT"),
        }

        SHUTDOWN_SIGNAL.store(true, Ordering::SeqCst);
    });
}

/// Resolve once the shutdown flag is set.
async fn wait_for_shutdown() {
    while !SHUTDOWN_SIGNAL.load(Ordering::SeqCst) {
        tokio::time::sleep(Duration::from_millis(100)).await;
    }
}
