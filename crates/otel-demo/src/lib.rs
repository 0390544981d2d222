//! Small HTTP service emitting traces, metrics and logs.
//!
//! Two endpoints generate telemetry:
//!
//! - `GET /` opens a server span `Call to /`, counts the request, logs at
//!   info, warning and error, simulates work and answers `Index`.
//! - `GET /parent` does the same under `Call to /parent`, then calls a nested
//!   operation that opens a `child` span with its own log lines and work, and
//!   answers `Parent child span`.
//!
//! `GET /health` answers `ok` without producing telemetry.
//!
//! ```no_run
//! use otel_demo::{AppConfig, AppState, router};
//! use otel_pipeline::TelemetryPipeline;
//!
//! # async fn run() -> anyhow::Result<()> {
//! let config = AppConfig::load()?;
//! let pipeline = TelemetryPipeline::builder(config.telemetry.clone()).build()?;
//! let app = router(AppState::new(&pipeline, config.latency));
//!
//! let listener = tokio::net::TcpListener::bind(config.server.addr()).await?;
//! axum::serve(listener, app).await?;
//! pipeline.shutdown().await?;
//! # Ok(())
//! # }
//! ```

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod config;

pub use config::{AppConfig, LatencyConfig, ServerConfig};

use axum::{Router, extract::State, routing::get};
use otel_pipeline::{Context, Counter, KeyValue, Span, SpanKind, TelemetryPipeline, Tracer};
use std::sync::Arc;

/// Instrumentation scope for every span and metric the service creates.
pub const INSTRUMENTATION_SCOPE: &str = "otel_demo";

/// Name of the request counter.
pub const REQUEST_COUNTER: &str = "requests";

/// Handles shared by every request.
#[derive(Clone)]
pub struct AppState {
    tracer: Tracer,
    requests: Counter,
    latency: LatencyConfig,
}

impl AppState {
    /// Creates the tracer and instruments the handlers use.
    pub fn new(pipeline: &TelemetryPipeline, latency: LatencyConfig) -> Self {
        let requests = pipeline
            .meter(INSTRUMENTATION_SCOPE)
            .create_counter(REQUEST_COUNTER, "The number of requests received");

        Self {
            tracer: pipeline.tracer(INSTRUMENTATION_SCOPE),
            requests,
            latency,
        }
    }

    fn start_server_span(&self, name: &'static str, path: &'static str) -> Span {
        let mut span = self.tracer.start(name, SpanKind::Server, &Context::new());
        span.set_attribute("http.method", "GET");
        span.set_attribute("span.kind", "server");
        self.requests.add(1, &[KeyValue::new("endpoint", path)]);
        span
    }
}

/// Builds the service router.
pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/", get(index))
        .route("/parent", get(parent))
        .route("/health", get(health))
        .with_state(Arc::new(state))
}

async fn index(State(state): State<Arc<AppState>>) -> &'static str {
    let span = state.start_server_span("Call to /", "/");
    let (trace_id, span_id) = (span.trace_id(), span.span_id());

    tracing::info!(%trace_id, %span_id, "Index endpoint called");
    tracing::warn!(%trace_id, %span_id, "Index endpoint called");
    tracing::error!(%trace_id, %span_id, "Index endpoint called");
    tokio::time::sleep(state.latency.index).await;

    span.end();
    "Index"
}

async fn parent(State(state): State<Arc<AppState>>) -> &'static str {
    let span = state.start_server_span("Call to /parent", "/parent");
    let (trace_id, span_id) = (span.trace_id(), span.span_id());

    tracing::info!(%trace_id, %span_id, "Parent endpoint called");
    tracing::warn!(%trace_id, %span_id, "Parent endpoint called");
    tracing::error!(%trace_id, %span_id, "Parent endpoint called");
    tokio::time::sleep(state.latency.parent).await;

    child(&state, &Context::new().with_span(&span)).await;

    span.end();
    "Parent child span"
}

async fn child(state: &AppState, cx: &Context) -> &'static str {
    let span = state.tracer.start("child", SpanKind::Internal, cx);
    let (trace_id, span_id) = (span.trace_id(), span.span_id());

    tracing::info!(%trace_id, %span_id, "Child method called");
    tracing::warn!(%trace_id, %span_id, "Child method called");
    tracing::error!(%trace_id, %span_id, "Child method called");
    tokio::time::sleep(state.latency.child).await;

    span.end();
    "child"
}

async fn health() -> &'static str {
    "ok"
}
