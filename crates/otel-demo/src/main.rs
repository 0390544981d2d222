//! Demo service binary.
//!
//! Serves `GET /` and `GET /parent` on `server.host:server.port` and exports
//! traces, metrics and logs over OTLP/HTTP.
//!
//! # Configuration
//!
//! Configuration is loaded from (in order of priority):
//! 1. Default values
//! 2. Config file: `otel-demo.toml` in the working directory
//! 3. Standard `OTEL_EXPORTER_OTLP_*` and `OTEL_SERVICE_NAME` variables
//! 4. Environment variables with `OTEL_DEMO_` prefix
//!
//! # Environment Variables
//!
//! - `OTEL_DEMO_TELEMETRY__EXPORTER__ENDPOINT` - OTLP base URL
//! - `OTEL_DEMO_TELEMETRY__EXPORTER__API_TOKEN` - Token sent as `Authorization: Api-Token <token>`
//! - `OTEL_DEMO_SERVER__PORT` - Listening port
//! - `RUST_LOG` - Console log filter (default `info`)

use anyhow::{Context, Result};
use otel_demo::{AppConfig, AppState, router};
use otel_pipeline::{LogBridge, TelemetryPipeline};
use tokio::net::TcpListener;
use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> Result<()> {
    let config = AppConfig::load().context("failed to load configuration")?;

    let pipeline = TelemetryPipeline::builder(config.telemetry.clone())
        .build()
        .context("failed to build telemetry pipeline")?;

    init_tracing(pipeline.log_bridge()).context("failed to initialise tracing subscriber")?;
    tracing::debug!(?config, "Configuration loaded");

    if config.telemetry.exporter.endpoint.is_none() {
        tracing::warn!("No OTLP endpoint configured, telemetry will not be exported");
    }

    let addr = config.server.addr();
    let listener = TcpListener::bind(addr)
        .await
        .with_context(|| format!("failed to bind {addr}"))?;
    tracing::info!(%addr, "Listening");

    let app = router(AppState::new(&pipeline, config.latency));
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("server error")?;

    pipeline
        .shutdown()
        .await
        .context("telemetry pipeline did not shut down cleanly")?;

    Ok(())
}

fn init_tracing(bridge: LogBridge) -> Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_target(true))
        .with(bridge)
        .try_init()
        .context("failed to initialise tracing registry")?;

    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!(error = %e, "Failed to install Ctrl+C handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                tracing::error!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }

    tracing::info!("Shutdown signal received");
}
