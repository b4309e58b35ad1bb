//! # Transcribe Gateway - Main Application Entry Point
//!
//! WebSocket front door of a real-time transcription service. Clients open a
//! socket, send one JSON handshake describing their meeting session, and then
//! stream audio. This binary owns the admission of those sessions; the
//! transcription pipeline and the discovery store are collaborators.
//!
//! ## Application Architecture:
//! - **admission**: Handshake normalization, validation and per-connection phases
//! - **websocket**: The actor that drives admission for each connection
//! - **pipeline**: Seam to the transcription engine
//! - **discovery**: Publishes active sessions to a key/value registrar
//! - **config**: Application configuration (TOML files + environment variables)
//! - **state**: Shared application state and metrics
//! - **health**: Health and metrics endpoints
//! - **middleware**: Request logging and request counters
//! - **handlers**: Runtime configuration endpoints
//! - **error**: HTTP error responses

mod admission;   // Session admission protocol (admission/ directory)
mod config;      // Configuration management (config.rs)
mod discovery;   // Service discovery publication (discovery.rs)
mod error;       // Error handling types (error.rs)
mod handlers;    // HTTP request handlers (handlers/ directory)
mod health;      // Health check endpoints (health.rs)
mod middleware;  // Custom middleware (middleware/ directory)
mod pipeline;    // Transcription pipeline boundary (pipeline.rs)
mod state;       // Application state management (state.rs)
mod websocket;   // WebSocket actor (websocket.rs)

use actix_cors::Cors;
use actix_web::{web, App, HttpServer};
use anyhow::Result;
use config::AppConfig;
use discovery::{Discovery, KvRegistrar};
use parking_lot::RwLock;
use pipeline::TracingPipeline;
use state::{AppMetrics, AppState};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::{error, info, warn};
use tracing_actix_web::TracingLogger;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// Global shutdown signal, set by the signal handler task.
static SHUTDOWN_SIGNAL: AtomicBool = AtomicBool::new(false);

/// The main application entry point.
///
/// ## What this function does:
/// 1. **Loads configuration** from files and environment variables
/// 2. **Sets up logging**
/// 3. **Builds the collaborators** (pipeline, optional discovery registrar)
/// 4. **Configures the HTTP server** with middleware, WebSocket and REST routes
/// 5. **Handles graceful shutdown** when receiving system signals
#[actix_web::main]
async fn main() -> Result<()> {
    dotenv::dotenv().ok();

    init_tracing()?;

    let config = AppConfig::load()?;
    config.validate()?;

    info!("Starting transcribe-gateway v{}", env!("CARGO_PKG_VERSION"));
    info!(
        host = %config.server.host,
        port = config.server.port,
        handshake_timeout_ms = config.admission.handshake_timeout_ms,
        max_concurrent_sessions = config.admission.max_concurrent_sessions,
        "Configuration loaded"
    );

    let metrics = Arc::new(RwLock::new(AppMetrics::default()));
    let discovery = build_discovery(&config, metrics.clone())?;
    let app_state = AppState::new(
        config.clone(),
        Arc::new(TracingPipeline::new()),
        discovery,
        metrics,
    );
    let bind_addr = format!("{}:{}", config.server.host, config.server.port);

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
            // Middleware executes in reverse order for responses
            .wrap(cors)
            .wrap(TracingLogger::default())
            .wrap(middleware::RequestMetrics)
            .wrap(middleware::RequestLogging)
            .service(
                web::scope("/api/v1")
                    .route("/health", web::get().to(health::health_check))
                    .route("/metrics", web::get().to(health::detailed_metrics))
                    .route("/config", web::get().to(handlers::get_config))
                    .route("/config", web::put().to(handlers::update_config)),
            )
            .route("/health", web::get().to(health::health_check))
            // Proxies commonly forward the socket at the root path
            .route("/ws", web::get().to(websocket::audio_websocket))
            .route("/", web::get().to(websocket::audio_websocket))
    })
    .bind(&bind_addr)?
    .run();

    let server_handle = server.handle();
    let server_task = tokio::spawn(server);

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

/// Build the discovery publisher when it is enabled.
fn build_discovery(
    config: &AppConfig,
    metrics: Arc<RwLock<AppMetrics>>,
) -> Result<Option<Discovery>> {
    if !config.discovery.enabled {
        info!("Service discovery publication disabled");
        return Ok(None);
    }

    let registrar = KvRegistrar::new(&config.discovery)?;
    let address = discovery::resolve_address(
        &config.discovery,
        &config.server.host,
        config.server.port,
    );
    info!(
        kv_url = %config.discovery.kv_url,
        key_prefix = %config.discovery.key_prefix,
        address = %address,
        "Service discovery publication enabled"
    );

    Ok(Some(Discovery::new(Arc::new(registrar), address, metrics)))
}

/// Initialize the tracing (logging) system.
///
/// ## Environment Variables:
/// - `RUST_LOG`: Controls what gets logged (e.g., "debug", "transcribe_gateway=trace")
/// - If not set, defaults to "transcribe_gateway=debug,actix_web=info"
fn init_tracing() -> Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "transcribe_gateway=debug,actix_web=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    Ok(())
}

/// Set up signal handlers for graceful shutdown (SIGTERM, SIGINT).
///
/// If a handler cannot be installed the server keeps running; it simply
/// cannot be stopped gracefully through that signal.
fn setup_signal_handlers() {
    use tokio::signal::unix::{signal, SignalKind};

    tokio::spawn(async {
        let mut sigterm = match signal(SignalKind::terminate()) {
            Ok(sigterm) => sigterm,
            Err(e) => {
                warn!("Failed to install SIGTERM handler: {}", e);
                return;
            }
        };
        let mut sigint = match signal(SignalKind::interrupt()) {
            Ok(sigint) => sigint,
            Err(e) => {
                warn!("Failed to install SIGINT handler: {}", e);
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

/// Wait for the shutdown signal to be set, polling every 100ms.
async fn wait_for_shutdown() {
    while !SHUTDOWN_SIGNAL.load(Ordering::SeqCst) {
        tokio::time::sleep(tokio::time::Duration::from_millis(100)).await;
    }
}
