//! # Speech Gateway - Main Application Entry Point
//!
//! HTTP service for text-to-speech (piper voices) and speech-to-text
//! (Whisper on Candle) with on-demand model downloads.
//!
//! ## Application Architecture:
//! - **config**: configuration (defaults, config.toml, environment)
//! - **registry**: model resolution and the on-disk model cache
//! - **download**: atomic artifact downloads
//! - **process**: external process execution (piper, ffmpeg)
//! - **synthesis / transcode**: text → WAV → requested format
//! - **transcription**: Whisper engine and transcription executor
//! - **service**: request validation and orchestration
//! - **state / handlers / health / middleware / error**: the HTTP layer
//!
//! ## Commands:
//! - `speech-gateway` or `speech-gateway serve`: prewarm models, then serve
//! - `speech-gateway prewarm`: download/load all configured models and exit

mod config;
mod device;
mod download;
mod error;
mod handlers;
mod health;
mod middleware;
mod process;
mod registry;
mod service;
mod state;
mod synthesis;
mod transcode;
mod transcription;

use actix_cors::Cors;
use actix_web::{middleware::Logger, web, App, HttpServer};
use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use config::AppConfig;
use process::SystemProcessRunner;
use service::SpeechService;
use state::AppState;
use std::convert::Infallible;
use std::sync::Arc;
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// Speech synthesis and transcription gateway
#[derive(Parser)]
#[command(name = "speech-gateway", version)]
struct Cli {
    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand, Clone, Copy, PartialEq, Eq)]
enum Command {
    /// Prewarm the configured models and start the HTTP server (default)
    Serve,
    /// Download and load every configured model, then exit
    Prewarm,
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    // It's fine if there's no .env file
    dotenv::dotenv().ok();
    init_tracing();

    let config = AppConfig::load().context("failed to load configuration")?;
    config.validate()?;

    // The service does blocking network and process I/O, so it is created
    // and driven outside the async runtime; the server only borrows it.
    let service = Arc::new(SpeechService::from_config(&config, Arc::new(SystemProcessRunner))?);

    match cli.command.unwrap_or(Command::Serve) {
        Command::Serve => actix_web::rt::System::new().block_on(serve(config, Arc::clone(&service))),
        Command::Prewarm => prewarm(&service),
    }
}

fn prewarm(service: &SpeechService) -> Result<()> {
    let failures = service.prewarm();
    if failures.is_empty() {
        info!("All configured models are ready");
        return Ok(());
    }
    for failure in &failures {
        error!(kind = %failure.kind, model = %failure.identifier, error = %failure.error, "Model unavailable");
    }
    anyhow::bail!("{} configured model(s) could not be prepared", failures.len())
}

async fn serve(config: AppConfig, service: Arc<SpeechService>) -> Result<()> {
    info!("Starting speech-gateway v{}", env!("CARGO_PKG_VERSION"));
    info!(
        cache_dir = %config.storage.cache_dir.display(),
        synthesis_models = ?config.synthesis.default_models,
        transcription_model = %config.transcription.default_model,
        device = %config.transcription.device,
        max_concurrent_jobs = config.performance.max_concurrent_jobs,
        "Configuration loaded"
    );

    service
        .registry()
        .ensure_dirs()
        .with_context(|| format!("failed to create model cache under {}", config.storage.cache_dir.display()))?;

    let bind_addr = format!("{}:{}", config.server.host, config.server.port);
    let max_body_bytes = config.server.max_body_bytes;
    let app_state = AppState::new(config, service);

    // Best effort: failures are logged and the models are retried on demand.
    let failures = app_state
        .run_job(|service| Ok::<_, Infallible>(service.prewarm()))
        .await
        .map_err(|e| anyhow::anyhow!("prewarm job failed: {}", e))?;
    if !failures.is_empty() {
        warn!(failed = failures.len(), "Some models could not be prewarmed");
    }

    info!("Starting HTTP server on {}", bind_addr);

    let server = HttpServer::new(move || {
        let cors = Cors::default()
            .allow_any_origin()
            .allow_any_method()
            .allow_any_header()
            .expose_headers(["x-model-id", middleware::logging::REQUEST_ID_HEADER])
            .max_age(3600);

        App::new()
            .app_data(web::Data::new(app_state.clone()))
            .wrap(cors)
            .wrap(Logger::default())
            .wrap(middleware::MetricsMiddleware)
            .wrap(middleware::RequestLogging)
            .configure(|cfg| handlers::routes(cfg, max_body_bytes))
    })
    .disable_signals()
    .bind(&bind_addr)
    .with_context(|| format!("failed to bind {}", bind_addr))?
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
        _ = shutdown_signal() => {
            info!("Shutdown signal received, stopping server...");
            server_handle.stop(true).await;
        }
    }

    info!("Server stopped gracefully");
    Ok(())
}

/// Logs go to stdout; `RUST_LOG` overrides the default filter.
fn init_tracing() {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "speech_gateway=debug,actix_web=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();
}

/// Resolves on SIGINT (Ctrl+C) or, on Unix, SIGTERM.
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!("Failed to listen for Ctrl+C: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
                info!("Received SIGTERM");
            }
            Err(e) => {
                error!("Failed to install SIGTERM handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("Received SIGINT"),
        _ = terminate => {}
    }
}
