//! # Voice Relay - Main Application Entry Point
//!
//! HTTP + WebSocket server that collects browser recordings chunk by chunk,
//! runs each finished recording through a voice pipeline, and streams the
//! pipeline's text and audio back to the client that recorded it.
//!
//! ## Application Architecture:
//! - **config**: layered configuration (defaults, `config.toml`, environment)
//! - **state**: shared application state and request metrics
//! - **audio**: chunk storage, decoding, session registry and lifecycle manager
//! - **pipeline**: the voice pipeline boundary and its bindings
//! - **transport** / **websocket**: the per-client push channel
//! - **handlers**: HTTP endpoints for recordings and configuration
//! - **health** / **middleware**: monitoring endpoints and metrics collection
//! - **error**: the error taxonomy and its HTTP mapping

mod audio; // Recording lifecycle (audio/ directory)
mod config; // Configuration management (config.rs)
mod error; // Error handling types (error.rs)
mod handlers; // HTTP request handlers (handlers/ directory)
mod health; // Health check endpoints (health.rs)
mod middleware; // Custom middleware (middleware/ directory)
mod pipeline; // Voice pipeline bindings (pipeline/ directory)
mod state; // Application state management (state.rs)
mod transport; // Push channel abstraction (transport.rs)
mod websocket; // WebSocket push channel (websocket.rs)

use actix_cors::Cors;
use actix_web::{web, App, HttpServer};
use anyhow::Result;
use crate::config::AppConfig;
use crate::state::AppState;
use std::sync::atomic::{AtomicBool, Ordering};
use tracing::{error, info};
use tracing_actix_web::TracingLogger;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// Set once SIGTERM or SIGINT arrives.
static SHUTDOWN_SIGNAL: AtomicBool = AtomicBool::new(false);

/// The main application entry point.
///
/// ## What this function does:
/// 1. **Loads configuration** from files and environment variables
/// 2. **Sets up logging**
/// 3. **Creates shared application state**, including the session manager
/// 4. **Configures the HTTP server** with middleware and routes
/// 5. **Handles graceful shutdown**, releasing any sessions still live
#[actix_web::main]
async fn main() -> Result<()> {
    dotenv::dotenv().ok();

    init_tracing()?;

    let config = AppConfig::load()?;
    config.validate()?;

    info!("Starting {} v{}", env!("CARGO_PKG_NAME"), env!("CARGO_PKG_VERSION"));
    info!(
        host = %config.server.host,
        port = config.server.port,
        pipeline = ?config.pipeline.mode,
        scratch_dir = %config.storage.scratch_dir.display(),
        output_dir = %config.storage.output_dir.display(),
        "Configuration loaded"
    );

    std::fs::create_dir_all(&config.storage.scratch_dir)?;
    std::fs::create_dir_all(&config.storage.output_dir)?;

    let bind_addr = format!("{}:{}", config.server.host, config.server.port);
    let app_state = AppState::from_config(config)?;
    let manager = app_state.manager.clone();

    setup_signal_handlers();

    info!("Starting HTTP server on {}", bind_addr);

    let server = HttpServer::new(move || {
        let cors = Cors::default()
            .allow_any_origin()
            .allow_any_method()
            .allow_any_header()
            .max_age(3600);

        App::new()
            .app_data(web::Data::new(app_state.clone()))
            // Middleware runs in reverse order of registration for requests
            .wrap(cors)
            .wrap(middleware::MetricsMiddleware)
            .wrap(TracingLogger::default())
            .service(
                web::scope("/audio")
                    .route("/start", web::post().to(handlers::start_recording))
                    .route("/chunk", web::post().to(handlers::upload_chunk))
                    .route("/stop", web::post().to(handlers::stop_recording))
                    .route("/sessions", web::get().to(handlers::list_sessions)),
            )
            .route("/ws/{client_id}", web::get().to(websocket::client_socket))
            .service(
                web::scope("/api/v1")
                    .route("/health", web::get().to(health::health_check))
                    .route("/metrics", web::get().to(health::detailed_metrics))
                    .route("/config", web::get().to(handlers::get_config)),
            )
            // Also provide health check at root level for convenience
            .route("/health", web::get().to(health::health_check))
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

    manager.shutdown().await;

    info!("Server stopped gracefully");
    Ok(())
}

/// Initialize structured logging.
///
/// ## Environment Variables:
/// - `RUST_LOG`: log filter, defaults to `voice_relay=debug,actix_web=info`
fn init_tracing() -> Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "voice_relay=debug,actix_web=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .try_init()?;

    Ok(())
}

/// Listen for SIGTERM and SIGINT and raise [`SHUTDOWN_SIGNAL`].
fn setup_signal_handlers() {
    use tokio::signal::unix::{signal, SignalKind};

    tokio::spawn(async {
        let (mut sigterm, mut sigint) = match (
            signal(SignalKind::terminate()),
            signal(SignalKind::interrupt()),
        ) {
            (Ok(sigterm), Ok(sigint)) => (sigterm, sigint),
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

/// Poll [`SHUTDOWN_SIGNAL`] every 100ms.
async fn wait_for_shutdown() {
    while !SHUTDOWN_SIGNAL.load(Ordering::SeqCst) {
        tokio::time::sleep(tokio::time::Duration::from_millis(100)).await;
    }
}
