//! OTLP/HTTP signal export.
//!
//! Exporters never raise past their own boundary: every call resolves to an
//! [`ExportResult`]. Callers treat anything but [`ExportResult::Success`] as
//! a dropped batch; there are no retries.

use crate::config::{Compression, ExporterConfig, Protocol};
use opentelemetry_proto::tonic::collector::{
    logs::v1::ExportLogsServiceRequest, metrics::v1::ExportMetricsServiceRequest,
    trace::v1::ExportTraceServiceRequest,
};
use opentelemetry_proto::tonic::logs::v1::LogRecord as ProtoLogRecord;
use opentelemetry_proto::tonic::metrics::v1::Metric as ProtoMetric;
use opentelemetry_proto::tonic::trace::v1::Span as ProtoSpan;
use parking_lot::Mutex;
use prost::Message;
use reqwest::Client;
use reqwest::header::{AUTHORIZATION, CONTENT_ENCODING, CONTENT_TYPE};
use serde::Serialize;
use std::fmt;
use std::future::Future;
use std::io::Write;
use std::pin::Pin;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

/// An export request for one signal type.
#[non_exhaustive]
#[derive(Debug, Clone)]
pub enum BatchedSignal {
    /// Batched trace spans.
    Traces(ExportTraceServiceRequest),
    /// Batched metrics.
    Metrics(ExportMetricsServiceRequest),
    /// Batched log records.
    Logs(ExportLogsServiceRequest),
}

impl BatchedSignal {
    /// Returns the encoded size of this batch in bytes.
    pub fn size_bytes(&self) -> usize {
        match self {
            BatchedSignal::Traces(req) => req.encoded_len(),
            BatchedSignal::Metrics(req) => req.encoded_len(),
            BatchedSignal::Logs(req) => req.encoded_len(),
        }
    }

    /// Returns the signal name used in the request path.
    pub fn signal_type(&self) -> &'static str {
        match self {
            BatchedSignal::Traces(_) => "traces",
            BatchedSignal::Metrics(_) => "metrics",
            BatchedSignal::Logs(_) => "logs",
        }
    }

    /// Returns the number of spans, data points or log records.
    pub fn item_count(&self) -> usize {
        match self {
            BatchedSignal::Traces(req) => req
                .resource_spans
                .iter()
                .flat_map(|rs| &rs.scope_spans)
                .map(|ss| ss.spans.len())
                .sum(),
            BatchedSignal::Metrics(req) => req
                .resource_metrics
                .iter()
                .flat_map(|rm| &rm.scope_metrics)
                .map(|sm| sm.metrics.len())
                .sum(),
            BatchedSignal::Logs(req) => req
                .resource_logs
                .iter()
                .flat_map(|rl| &rl.scope_logs)
                .map(|sl| sl.log_records.len())
                .sum(),
        }
    }
}

/// Outcome of an export call.
#[non_exhaustive]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExportResult {
    /// The collector accepted the batch.
    Success,
    /// The batch was dropped after a transport, status or encoding failure.
    Failed,
    /// Nothing was sent because no endpoint is configured.
    Skipped,
}

/// Error during export.
#[non_exhaustive]
#[derive(Debug, thiserror::Error)]
pub enum ExportError {
    /// HTTP request failed.
    #[error("HTTP request failed")]
    Http(#[from] reqwest::Error),

    /// Server returned an error status.
    #[error("server returned {status}: {body}")]
    Status {
        /// HTTP status code returned by server.
        status: u16,
        /// Response body from server.
        body: String,
    },

    /// Encoding failed.
    #[error("failed to encode request")]
    Encode(#[source] Box<dyn std::error::Error + Send + Sync>),

    /// No endpoint configured.
    #[error("no endpoint configured")]
    NoEndpoint,
}

impl ExportError {
    pub(crate) fn encode<E: std::error::Error + Send + Sync + 'static>(error: E) -> Self {
        Self::Encode(Box::new(error))
    }

    pub(crate) fn status(status: u16, body: impl Into<String>) -> Self {
        Self::Status {
            status,
            body: body.into(),
        }
    }
}

/// Sends batches of one or more signal types to a backend.
///
/// Uses native async fn in traits. For dynamic dispatch, use
/// [`SignalExporterBoxed`], which every `SignalExporter` implements.
pub trait SignalExporter: Send + Sync {
    /// Exports a batch.
    fn export(&self, batch: BatchedSignal) -> impl Future<Output = ExportResult> + Send;

    /// Returns the exporter name for diagnostics.
    fn name(&self) -> &str;
}

/// Object-safe form of [`SignalExporter`].
pub trait SignalExporterBoxed: Send + Sync {
    /// Exports a batch (boxed future for object safety).
    fn export_boxed(
        &self,
        batch: BatchedSignal,
    ) -> Pin<Box<dyn Future<Output = ExportResult> + Send + '_>>;

    /// Returns the exporter name for diagnostics.
    fn name(&self) -> &str;
}

impl<T: SignalExporter> SignalExporterBoxed for T {
    fn export_boxed(
        &self,
        batch: BatchedSignal,
    ) -> Pin<Box<dyn Future<Output = ExportResult> + Send + '_>> {
        Box::pin(self.export(batch))
    }

    fn name(&self) -> &str {
        SignalExporter::name(self)
    }
}

/// Shared, dynamically dispatched exporter handle.
pub type SharedExporter = Arc<dyn SignalExporterBoxed>;

/// OTLP/HTTP exporter.
///
/// Posts each batch to `{endpoint}/v1/{traces,metrics,logs}` with the
/// configured encoding, compression and headers.
pub struct OtlpExporter {
    config: ExporterConfig,
    client: Client,
    authorization: Option<String>,
}

impl OtlpExporter {
    /// Creates a new OTLP exporter with the given configuration.
    ///
    /// # Errors
    ///
    /// Returns an error if the HTTP client cannot be created.
    pub fn new(config: ExporterConfig) -> Result<Self, ExportError> {
        let client = Client::builder()
            .timeout(config.timeout)
            .build()
            .map_err(ExportError::Http)?;

        let authorization = config.api_token.as_ref().map(|token| {
            if config.auth_scheme.is_empty() {
                token.clone()
            } else {
                format!("{} {}", config.auth_scheme, token)
            }
        });

        Ok(Self {
            config,
            client,
            authorization,
        })
    }

    /// Creates a new exporter with default configuration.
    ///
    /// # Errors
    ///
    /// Returns an error if the HTTP client cannot be created.
    pub fn with_defaults() -> Result<Self, ExportError> {
        Self::new(ExporterConfig::default())
    }

    async fn try_export(&self, batch: &BatchedSignal) -> Result<(), ExportError> {
        let url = self.signal_url(batch).ok_or(ExportError::NoEndpoint)?;

        let body = match batch {
            BatchedSignal::Traces(req) => self.encode_request(req)?,
            BatchedSignal::Metrics(req) => self.encode_request(req)?,
            BatchedSignal::Logs(req) => self.encode_request(req)?,
        };

        let mut request = self
            .client
            .post(&url)
            .header(CONTENT_TYPE, self.content_type())
            .body(body);

        if let Some(authorization) = &self.authorization {
            request = request.header(AUTHORIZATION, authorization);
        }

        for (key, value) in &self.config.headers {
            request = request.header(key, value);
        }

        if self.config.compression == Compression::Gzip {
            request = request.header(CONTENT_ENCODING, "gzip");
        }

        let response = request.send().await.map_err(ExportError::Http)?;

        let status = response.status();
        if status.is_success() {
            Ok(())
        } else {
            let body = response.text().await.unwrap_or_default();
            Err(ExportError::status(status.as_u16(), body))
        }
    }

    fn signal_url(&self, batch: &BatchedSignal) -> Option<String> {
        let endpoint = self.config.endpoint.as_deref()?;
        Some(format!(
            "{}/v1/{}",
            endpoint.trim_end_matches('/'),
            batch.signal_type()
        ))
    }

    fn encode_request<T: Message + Serialize>(&self, request: &T) -> Result<Vec<u8>, ExportError> {
        let buf = match self.config.protocol {
            Protocol::HttpBinary => {
                let mut buf = Vec::with_capacity(request.encoded_len());
                request.encode(&mut buf).map_err(ExportError::encode)?;
                buf
            }
            Protocol::HttpJson => serde_json::to_vec(request).map_err(ExportError::encode)?,
        };

        if self.config.compression == Compression::Gzip {
            use flate2::Compression as GzCompression;
            use flate2::write::GzEncoder;

            let mut encoder = GzEncoder::new(Vec::new(), GzCompression::default());
            encoder.write_all(&buf).map_err(ExportError::encode)?;
            encoder.finish().map_err(ExportError::encode)
        } else {
            Ok(buf)
        }
    }

    fn content_type(&self) -> &'static str {
        match self.config.protocol {
            Protocol::HttpBinary => "application/x-protobuf",
            Protocol::HttpJson => "application/json",
        }
    }

    /// Returns whether an endpoint is configured.
    pub fn has_endpoint(&self) -> bool {
        self.config.endpoint.is_some()
    }

    /// Returns the configured endpoint URL.
    pub fn endpoint(&self) -> Option<&str> {
        self.config.endpoint.as_deref()
    }
}

impl fmt::Debug for OtlpExporter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("OtlpExporter")
            .field("endpoint", &self.config.endpoint)
            .field("protocol", &self.config.protocol)
            .field("compression", &self.config.compression)
            .field("authorization", &self.authorization.as_ref().map(|_| "<redacted>"))
            .finish()
    }
}

impl SignalExporter for OtlpExporter {
    async fn export(&self, batch: BatchedSignal) -> ExportResult {
        if !self.has_endpoint() {
            tracing::debug!(
                target: "otel_pipeline",
                signal = batch.signal_type(),
                "No endpoint configured, skipping export"
            );
            return ExportResult::Skipped;
        }

        match self.try_export(&batch).await {
            Ok(()) => {
                tracing::trace!(
                    target: "otel_pipeline",
                    signal = batch.signal_type(),
                    items = batch.item_count(),
                    "Export succeeded"
                );
                ExportResult::Success
            }
            Err(e) => {
                tracing::warn!(
                    target: "otel_pipeline",
                    signal = batch.signal_type(),
                    items = batch.item_count(),
                    error = %e,
                    "Export failed, dropping batch"
                );
                ExportResult::Failed
            }
        }
    }

    fn name(&self) -> &str {
        "otlp-http"
    }
}

/// Exporter that keeps every batch in memory.
///
/// Clones share the same storage, so a test can hand one clone to the
/// pipeline and inspect the other.
#[derive(Debug, Clone, Default)]
pub struct InMemoryExporter {
    batches: Arc<Mutex<Vec<BatchedSignal>>>,
    failing: Arc<AtomicBool>,
    attempts: Arc<AtomicU64>,
}

impl InMemoryExporter {
    /// Creates an empty exporter.
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes subsequent exports fail (and record nothing) while `failing`.
    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    /// Returns the number of export calls, successful or not.
    pub fn attempts(&self) -> u64 {
        self.attempts.load(Ordering::SeqCst)
    }

    /// Returns every accepted batch, in export order.
    pub fn batches(&self) -> Vec<BatchedSignal> {
        self.batches.lock().clone()
    }

    /// Returns every exported span.
    pub fn spans(&self) -> Vec<ProtoSpan> {
        self.batches
            .lock()
            .iter()
            .filter_map(|batch| match batch {
                BatchedSignal::Traces(req) => Some(req),
                _ => None,
            })
            .flat_map(|req| &req.resource_spans)
            .flat_map(|rs| &rs.scope_spans)
            .flat_map(|ss| ss.spans.iter().cloned())
            .collect()
    }

    /// Returns every exported metric.
    pub fn metrics(&self) -> Vec<ProtoMetric> {
        self.batches
            .lock()
            .iter()
            .filter_map(|batch| match batch {
                BatchedSignal::Metrics(req) => Some(req),
                _ => None,
            })
            .flat_map(|req| &req.resource_metrics)
            .flat_map(|rm| &rm.scope_metrics)
            .flat_map(|sm| sm.metrics.iter().cloned())
            .collect()
    }

    /// Returns every exported log record.
    pub fn logs(&self) -> Vec<ProtoLogRecord> {
        self.batches
            .lock()
            .iter()
            .filter_map(|batch| match batch {
                BatchedSignal::Logs(req) => Some(req),
                _ => None,
            })
            .flat_map(|req| &req.resource_logs)
            .flat_map(|rl| &rl.scope_logs)
            .flat_map(|sl| sl.log_records.iter().cloned())
            .collect()
    }

    /// Discards everything recorded so far.
    pub fn reset(&self) {
        self.batches.lock().clear();
    }
}

impl SignalExporter for InMemoryExporter {
    async fn export(&self, batch: BatchedSignal) -> ExportResult {
        self.attempts.fetch_add(1, Ordering::SeqCst);
        if self.failing.load(Ordering::SeqCst) {
            return ExportResult::Failed;
        }
        self.batches.lock().push(batch);
        ExportResult::Success
    }

    fn name(&self) -> &str {
        "in-memory"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use flate2::read::GzDecoder;
    use opentelemetry_proto::tonic::trace::v1::{ResourceSpans, ScopeSpans, Span};
    use std::error::Error;
    use std::io::Read;

    fn make_trace_batch() -> BatchedSignal {
        BatchedSignal::Traces(ExportTraceServiceRequest {
            resource_spans: vec![ResourceSpans {
                scope_spans: vec![ScopeSpans {
                    spans: vec![Span {
                        name: "test-span".to_string(),
                        trace_id: vec![1; 16],
                        span_id: vec![1; 8],
                        ..Default::default()
                    }],
                    ..Default::default()
                }],
                ..Default::default()
            }],
        })
    }

    fn exporter_with(config: ExporterConfig) -> OtlpExporter {
        OtlpExporter::new(config).unwrap()
    }

    #[tokio::test]
    async fn test_export_no_endpoint_skips() {
        let exporter = OtlpExporter::with_defaults().unwrap();

        let result = exporter.export(make_trace_batch()).await;
        assert_eq!(result, ExportResult::Skipped);
    }

    #[tokio::test]
    async fn test_export_unreachable_endpoint_fails() {
        let exporter = exporter_with(ExporterConfig {
            endpoint: Some("http://127.0.0.1:1".to_string()),
            timeout: std::time::Duration::from_millis(500),
            ..Default::default()
        });

        let result = exporter.export(make_trace_batch()).await;
        assert_eq!(result, ExportResult::Failed);
    }

    #[test]
    fn test_signal_url_trims_trailing_slash() {
        let exporter = exporter_with(ExporterConfig {
            endpoint: Some("https://abc.live.example.com/api/v2/otlp/".to_string()),
            ..Default::default()
        });
        let metrics = BatchedSignal::Metrics(ExportMetricsServiceRequest::default());
        let logs = BatchedSignal::Logs(ExportLogsServiceRequest::default());

        assert_eq!(
            exporter.signal_url(&make_trace_batch()).as_deref(),
            Some("https://abc.live.example.com/api/v2/otlp/v1/traces")
        );
        assert_eq!(
            exporter.signal_url(&metrics).as_deref(),
            Some("https://abc.live.example.com/api/v2/otlp/v1/metrics")
        );
        assert_eq!(
            exporter.signal_url(&logs).as_deref(),
            Some("https://abc.live.example.com/api/v2/otlp/v1/logs")
        );
    }

    #[test]
    fn test_authorization_value() {
        let exporter = exporter_with(ExporterConfig {
            api_token: Some("dt0c01.secret".to_string()),
            ..Default::default()
        });
        assert_eq!(
            exporter.authorization.as_deref(),
            Some("Api-Token dt0c01.secret")
        );

        let exporter = exporter_with(ExporterConfig {
            api_token: Some("abc".to_string()),
            auth_scheme: "Bearer".to_string(),
            ..Default::default()
        });
        assert_eq!(exporter.authorization.as_deref(), Some("Bearer abc"));

        let exporter = OtlpExporter::with_defaults().unwrap();
        assert!(exporter.authorization.is_none());
    }

    #[test]
    fn test_debug_redacts_token() {
        let exporter = exporter_with(ExporterConfig {
            api_token: Some("dt0c01.secret".to_string()),
            ..Default::default()
        });
        let debug = format!("{exporter:?}");
        assert!(!debug.contains("dt0c01.secret"));
        assert!(debug.contains("<redacted>"));
    }

    #[test]
    fn test_encode_protobuf_request() {
        let exporter = OtlpExporter::with_defaults().unwrap();
        let BatchedSignal::Traces(request) = make_trace_batch() else {
            unreachable!()
        };

        let encoded = exporter.encode_request(&request).unwrap();
        let decoded = ExportTraceServiceRequest::decode(encoded.as_slice()).unwrap();
        assert_eq!(decoded, request);
    }

    #[test]
    fn test_encode_json_request() {
        let exporter = exporter_with(ExporterConfig {
            protocol: Protocol::HttpJson,
            ..Default::default()
        });
        let BatchedSignal::Traces(request) = make_trace_batch() else {
            unreachable!()
        };

        let encoded = exporter.encode_request(&request).unwrap();
        let json: serde_json::Value = serde_json::from_slice(&encoded).unwrap();
        assert_eq!(
            json["resourceSpans"][0]["scopeSpans"][0]["spans"][0]["name"],
            "test-span"
        );
    }

    #[test]
    fn test_encode_request_with_gzip() {
        let exporter = exporter_with(ExporterConfig {
            compression: Compression::Gzip,
            ..Default::default()
        });
        let BatchedSignal::Traces(request) = make_trace_batch() else {
            unreachable!()
        };

        let encoded = exporter.encode_request(&request).unwrap();
        let mut decoder = GzDecoder::new(encoded.as_slice());
        let mut decompressed = Vec::new();
        decoder.read_to_end(&mut decompressed).unwrap();

        let decoded = ExportTraceServiceRequest::decode(decompressed.as_slice()).unwrap();
        assert_eq!(decoded, request);
    }

    #[test]
    fn test_content_type() {
        let exporter = OtlpExporter::with_defaults().unwrap();
        assert_eq!(exporter.content_type(), "application/x-protobuf");

        let exporter = exporter_with(ExporterConfig {
            protocol: Protocol::HttpJson,
            ..Default::default()
        });
        assert_eq!(exporter.content_type(), "application/json");
    }

    #[test]
    fn test_batched_signal_counts() {
        let batch = make_trace_batch();
        assert_eq!(batch.signal_type(), "traces");
        assert_eq!(batch.item_count(), 1);
        assert!(batch.size_bytes() > 0);

        let empty = BatchedSignal::Logs(ExportLogsServiceRequest::default());
        assert_eq!(empty.item_count(), 0);
    }

    #[test]
    fn test_export_error_display() {
        let err = ExportError::NoEndpoint;
        assert_eq!(format!("{}", err), "no endpoint configured");

        let err = ExportError::status(401, "Unauthorized");
        assert!(format!("{}", err).contains("401"));
        assert!(matches!(err, ExportError::Status { status: 401, .. }));
    }

    #[test]
    fn test_export_error_chain() {
        let io_err = std::io::Error::other("test error");
        let err = ExportError::encode(io_err);

        assert!(err.source().is_some());
        assert!(format!("{}", err).contains("encode"));
    }

    #[tokio::test]
    async fn test_in_memory_exporter_records_batches() {
        let exporter = InMemoryExporter::new();
        let shared: SharedExporter = Arc::new(exporter.clone());

        assert_eq!(
            shared.export_boxed(make_trace_batch()).await,
            ExportResult::Success
        );
        assert_eq!(shared.name(), "in-memory");
        assert_eq!(exporter.spans().len(), 1);
        assert_eq!(exporter.spans()[0].name, "test-span");

        exporter.set_failing(true);
        assert_eq!(
            shared.export_boxed(make_trace_batch()).await,
            ExportResult::Failed
        );
        assert_eq!(exporter.batches().len(), 1);
        assert_eq!(exporter.attempts(), 2);

        exporter.reset();
        assert!(exporter.spans().is_empty());
    }
}
