//! # Noise Detection Backend - Main Application Entry Point
//!
//! This is the main entry point for the noise-detection-backend web server.
//! Clients stream 16kHz mono PCM over WebSocket and receive a per-frame speech/noise
//! classification, smoothed over a short window and gated by hysteresis for display.
//!
//! ## Key Rust Concepts Used:
//! - **async/await**: The entire application is asynchronous for better performance
//! - **modules**: Code is organized into separate modules (mod statements)
//! - **Result<T, E>**: Error handling using Rust's Result type
//! - **Arc**: Thread-safe shared ownership of the session table and engine
//! - **static**: Global variables that live for the entire program duration
//!
//! ## Application Architecture:
//! - **config**: Handles application configuration (TOML files + environment variables)
//! - **state**: Manages shared application state and metrics
//! - **audio**: Frame decoding/adaptation and the session manager
//! - **detection**: Inference engine contract, smoothing and hysteresis
//! - **websocket**: The streaming protocol, one actor per connection
//! - **health / handlers**: HTTP endpoints
//! - **error**: Custom error types and HTTP error responses

// Module declarations - These tell Rust about our other source files
mod audio;       // Frame adaptation and session management (audio/ directory)
mod config;      // Configuration management (config.rs)
mod detection;   // Inference, smoothing and hysteresis (detection/ directory)
mod error;       // Error handling types (error.rs)
mod handlers;    // HTTP request handlers (handlers/ directory)
mod health;      // Health check endpoints (health.rs)
mod state;       // Application state management (state.rs)
mod websocket;   // WebSocket streaming actor (websocket.rs)

// External crate imports - These are dependencies from Cargo.toml
use actix_cors::Cors;  // Cross-Origin Resource Sharing support
use actix_web::{web, App, HttpServer};  // Web framework
use anyhow::Result;    // Better error handling with context
use crate::config::AppConfig; // Our custom configuration struct
use detection::{EnergyEngine, InferenceEngine};
use state::AppState;   // Our custom application state
use std::sync::atomic::{AtomicBool, Ordering};  // Thread-safe boolean for shutdown
use std::sync::Arc;
use tracing::{error, info};  // Structured logging
use tracing_actix_web::TracingLogger;  // Per-request spans
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};  // Logging setup

/// Global shutdown signal, set by the signal handler task.
static SHUTDOWN_SIGNAL: AtomicBool = AtomicBool::new(false);

/// The main application entry point.
///
/// ## What this function does:
/// 1. **Loads configuration** from files and environment variables
/// 2. **Sets up logging** for debugging and monitoring
/// 3. **Creates the inference engine and session manager** shared by all connections
/// 4. **Starts the idle-session sweeper**
/// 5. **Configures the HTTP server** with middleware and routes
/// 6. **Handles graceful shutdown** when receiving system signals
///
/// ## Error Handling:
/// If any step fails (config loading, server binding, etc.), the function returns an error
/// and the program exits with an error message.
#[actix_web::main]
async fn main() -> Result<()> {
    // Load environment variables from .env file (if it exists)
    dotenv::dotenv().ok();

    init_tracing()?;

    // Load application configuration from config.toml and environment variables
    let config = AppConfig::load()?;
    config.validate()?;

    info!("Starting noise-detection-backend v{}", env!("CARGO_PKG_VERSION"));
    info!("Configuration loaded: {}:{}", config.server.host, config.server.port);

    let engine: Arc<dyn InferenceEngine> = Arc::new(EnergyEngine::from_config(&config.detection));
    info!(
        engine = engine.name(),
        sample_rate = config.detection.sample_rate,
        frame_length = config.detection.frame_length,
        window = config.detection.smoothing_window_size,
        hysteresis = config.detection.hysteresis_threshold,
        "Detection pipeline ready"
    );

    // Shared by every worker, connection and background task
    let app_state = AppState::new(config.clone(), engine);
    let bind_addr = format!("{}:{}", config.server.host, config.server.port);

    setup_signal_handlers();
    spawn_idle_sweeper(app_state.clone());

    info!("Starting HTTP server on {}", bind_addr);

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
                    .route("/metrics", web::get().to(health::detailed_metrics))
                    .route("/config", web::get().to(handlers::get_config))
                    .route("/sessions", web::get().to(handlers::list_sessions))
                    .route("/sessions/{connection_id}", web::get().to(handlers::get_session))
                    .route("/debug/probe", web::post().to(handlers::probe_frame)),
            )
            // Streaming endpoints
            .route("/ws", web::get().to(websocket::detection_websocket))
            .route("/ws/audio", web::get().to(websocket::detection_websocket))
            // Also provide health check at root level for convenience
            .route("/health", web::get().to(health::health_check))
    })
    .bind(&bind_addr)?
    .run();

    let server_handle = server.handle();
    let server_task = tokio::spawn(server);

    // Wait for either the server to finish OR a shutdown signal
    tokio::select! {
        result = server_task => {
            match result {
                Ok(server_result) => {
                    if let Err(e) = server_result {
                        error!("Server error: {}", e);
                    }
                }
                Err(e) => {
                    error!("Server task error: {}", e);
                }
            }
        }
        _ = wait_for_shutdown() => {
            info!("Shutdown signal received, stopping server...");
            server_handle.stop(true).await;
        }
    }

    info!("Server stopped gracefully");
    Ok(())
}

/// Initialize the tracing (logging) system for the application.
///
/// ## Environment Variables:
/// - `RUST_LOG`: Controls what gets logged (e.g., "debug", "noise_detection_backend=trace")
/// - If not set, defaults to "noise_detection_backend=debug,actix_web=info"
fn init_tracing() -> Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "noise_detection_backend=debug,actix_web=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    Ok(())
}

/// Periodically evict sessions whose clients stopped sending without closing.
///
/// Runs every `sweep_interval_secs`; a session counts as expired once it has been
/// idle for longer than `idle_timeout_secs`.
fn spawn_idle_sweeper(state: AppState) {
    let sweep_interval = state.config.session.sweep_interval();
    let idle_timeout = state.config.session.idle_timeout();

    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(sweep_interval);
        // The first tick completes immediately
        ticker.tick().await;

        loop {
            ticker.tick().await;
            let evicted = state.sessions.sweep_expired(chrono::Utc::now(), idle_timeout);
            state.record_sessions_evicted(evicted);
            if evicted > 0 {
                info!(
                    evicted,
                    active_sessions = state.sessions.session_count(),
                    "Idle session sweep finished"
                );
            }
        }
    });
}

/// Set up signal handlers for graceful shutdown.
///
/// ## What this does:
/// - Listens for SIGTERM (termination signal from system)
/// - Listens for SIGINT (interrupt signal, usually Ctrl+C)
/// - When either signal is received, sets the global shutdown flag
fn setup_signal_handlers() {
    use tokio::signal::unix::{signal, SignalKind};

    tokio::spawn(async {
        let (mut sigterm, mut sigint) =
            match (signal(SignalKind::terminate()), signal(SignalKind::interrupt())) {
                (Ok(sigterm), Ok(sigint)) => (sigterm, sigint),
                (Err(e), _) | (_, Err(e)) => {
                    error!("Failed to install signal handlers: {}", e);
                    return;
                }
            };

        tokio::select! {
            _ = sigterm.recv() => {
                info!("Received SIGTERM");
            }
            _ = sigint.recv() => {
                info!("Received SIGINT");
            }
        }

        SHUTDOWN_SIGNAL.store(true, Ordering::SeqCst);
    });
}

/// Wait for the shutdown signal to be set.
///
/// Polls every 100ms; `tokio::time::sleep` doesn't block other tasks.
async fn wait_for_shutdown() {
    while !SHUTDOWN_SIGNAL.load(Ordering::SeqCst) {
        tokio::time::sleep(tokio::time::Duration::from_millis(100)).await;
    }
}
