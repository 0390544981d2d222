//! In-process OTLP/HTTP collector for exporter integration tests.
//!
//! Accepts protobuf or JSON bodies, optionally gzip-compressed, on the
//! standard `/v1/{traces,metrics,logs}` paths and records every request
//! together with its headers.

#![allow(dead_code)]

use axum::{
    Router,
    body::Bytes,
    extract::State,
    http::{
        HeaderMap, StatusCode,
        header::{CONTENT_ENCODING, CONTENT_TYPE},
    },
    routing::post,
};
use flate2::read::GzDecoder;
use opentelemetry_proto::tonic::collector::{
    logs::v1::ExportLogsServiceRequest, metrics::v1::ExportMetricsServiceRequest,
    trace::v1::ExportTraceServiceRequest,
};
use opentelemetry_proto::tonic::logs::v1::LogRecord;
use opentelemetry_proto::tonic::metrics::v1::Metric;
use opentelemetry_proto::tonic::trace::v1::Span;
use parking_lot::Mutex;
use prost::Message;
use std::io::Read;
use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicU16, Ordering};
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;

/// A decoded export request.
#[derive(Debug, Clone)]
pub enum Received {
    Traces(ExportTraceServiceRequest),
    Metrics(ExportMetricsServiceRequest),
    Logs(ExportLogsServiceRequest),
}

/// One request as seen by the collector.
#[derive(Debug, Clone)]
pub struct Captured {
    pub headers: HeaderMap,
    pub request: Received,
}

impl Captured {
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(name).and_then(|v| v.to_str().ok())
    }
}

#[derive(Default)]
struct CollectorState {
    captured: Mutex<Vec<Captured>>,
    status: AtomicU16,
}

/// Running collector; stops when dropped.
pub struct TestCollector {
    state: Arc<CollectorState>,
    addr: SocketAddr,
    cancel: CancellationToken,
}

impl TestCollector {
    pub async fn start() -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let state = Arc::new(CollectorState::default());
        state.status.store(200, Ordering::Relaxed);

        let app = Router::new()
            .route("/v1/traces", post(handle_traces))
            .route("/v1/metrics", post(handle_metrics))
            .route("/v1/logs", post(handle_logs))
            .with_state(Arc::clone(&state));

        let cancel = CancellationToken::new();
        let shutdown = cancel.clone().cancelled_owned();
        tokio::spawn(async move {
            let _ = axum::serve(listener, app)
                .with_graceful_shutdown(shutdown)
                .await;
        });

        Self {
            state,
            addr,
            cancel,
        }
    }

    /// Base URL to use as the exporter endpoint.
    pub fn endpoint(&self) -> String {
        format!("http://{}", self.addr)
    }

    /// Makes every subsequent request answer with `status`.
    pub fn respond_with(&self, status: u16) {
        self.state.status.store(status, Ordering::Relaxed);
    }

    pub fn requests(&self) -> Vec<Captured> {
        self.state.captured.lock().clone()
    }

    pub fn spans(&self) -> Vec<Span> {
        self.requests()
            .into_iter()
            .filter_map(|c| match c.request {
                Received::Traces(req) => Some(req),
                _ => None,
            })
            .flat_map(|req| req.resource_spans)
            .flat_map(|rs| rs.scope_spans)
            .flat_map(|ss| ss.spans)
            .collect()
    }

    pub fn metrics(&self) -> Vec<Metric> {
        self.requests()
            .into_iter()
            .filter_map(|c| match c.request {
                Received::Metrics(req) => Some(req),
                _ => None,
            })
            .flat_map(|req| req.resource_metrics)
            .flat_map(|rm| rm.scope_metrics)
            .flat_map(|sm| sm.metrics)
            .collect()
    }

    pub fn logs(&self) -> Vec<LogRecord> {
        self.requests()
            .into_iter()
            .filter_map(|c| match c.request {
                Received::Logs(req) => Some(req),
                _ => None,
            })
            .flat_map(|req| req.resource_logs)
            .flat_map(|rl| rl.scope_logs)
            .flat_map(|sl| sl.log_records)
            .collect()
    }
}

impl Drop for TestCollector {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

async fn handle_traces(
    State(state): State<Arc<CollectorState>>,
    headers: HeaderMap,
    body: Bytes,
) -> StatusCode {
    record(&state, headers, &body, Received::Traces)
}

async fn handle_metrics(
    State(state): State<Arc<CollectorState>>,
    headers: HeaderMap,
    body: Bytes,
) -> StatusCode {
    record(&state, headers, &body, Received::Metrics)
}

async fn handle_logs(
    State(state): State<Arc<CollectorState>>,
    headers: HeaderMap,
    body: Bytes,
) -> StatusCode {
    record(&state, headers, &body, Received::Logs)
}

fn record<T>(
    state: &CollectorState,
    headers: HeaderMap,
    body: &Bytes,
    wrap: fn(T) -> Received,
) -> StatusCode
where
    T: Message + Default + serde::de::DeserializeOwned,
{
    let request = match parse_request::<T>(&headers, body) {
        Ok(request) => request,
        Err(status) => return status,
    };

    state.captured.lock().push(Captured {
        headers,
        request: wrap(request),
    });

    StatusCode::from_u16(state.status.load(Ordering::Relaxed))
        .unwrap_or(StatusCode::INTERNAL_SERVER_ERROR)
}

fn parse_request<T>(headers: &HeaderMap, body: &Bytes) -> Result<T, StatusCode>
where
    T: Message + Default + serde::de::DeserializeOwned,
{
    let is_gzip = headers
        .get(CONTENT_ENCODING)
        .and_then(|ce| ce.to_str().ok())
        .is_some_and(|ce| ce.contains("gzip"));

    let decompressed: Vec<u8>;
    let body_bytes: &[u8] = if is_gzip {
        let mut decoder = GzDecoder::new(body.as_ref());
        let mut out = Vec::new();
        decoder
            .read_to_end(&mut out)
            .map_err(|_| StatusCode::BAD_REQUEST)?;
        decompressed = out;
        &decompressed
    } else {
        body.as_ref()
    };

    let is_json = headers
        .get(CONTENT_TYPE)
        .and_then(|ct| ct.to_str().ok())
        .is_some_and(|ct| ct.contains("application/json"));

    if is_json {
        serde_json::from_slice(body_bytes).map_err(|_| StatusCode::BAD_REQUEST)
    } else {
        T::decode(body_bytes).map_err(|_| StatusCode::BAD_REQUEST)
    }
}
