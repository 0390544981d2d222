//! Log records and the logger provider.

use crate::attributes::KeyValue;
use crate::batch::BatchProcessor;
use crate::context::{Context, SpanId, TraceFlags, TraceId};
use crate::error::PipelineError;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use std::time::{Duration, SystemTime};

/// Log severity, ordered from least to most severe.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize,
)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    /// Fine-grained tracing.
    Trace,
    /// Debugging detail.
    Debug,
    /// Informational.
    Info,
    /// Something unexpected that the service recovered from.
    #[default]
    Warn,
    /// An operation failed.
    Error,
    /// The service cannot continue.
    Fatal,
}

impl Severity {
    /// Returns the OTLP severity number.
    pub fn number(self) -> i32 {
        match self {
            Severity::Trace => 1,
            Severity::Debug => 5,
            Severity::Info => 9,
            Severity::Warn => 13,
            Severity::Error => 17,
            Severity::Fatal => 21,
        }
    }

    /// Returns the OTLP severity text.
    pub fn text(self) -> &'static str {
        match self {
            Severity::Trace => "TRACE",
            Severity::Debug => "DEBUG",
            Severity::Info => "INFO",
            Severity::Warn => "WARN",
            Severity::Error => "ERROR",
            Severity::Fatal => "FATAL",
        }
    }
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.text())
    }
}

impl From<tracing::Level> for Severity {
    fn from(level: tracing::Level) -> Self {
        match level {
            tracing::Level::TRACE => Severity::Trace,
            tracing::Level::DEBUG => Severity::Debug,
            tracing::Level::INFO => Severity::Info,
            tracing::Level::WARN => Severity::Warn,
            tracing::Level::ERROR => Severity::Error,
        }
    }
}

/// A log record waiting for export.
#[derive(Debug, Clone, PartialEq)]
pub struct LogRecord {
    /// When the event happened.
    pub timestamp: SystemTime,
    /// When the pipeline observed the event.
    pub observed_timestamp: SystemTime,
    /// Severity.
    pub severity: Severity,
    /// Message body.
    pub body: String,
    /// Logger name or module path that produced the record.
    pub target: String,
    /// Extra attributes.
    pub attributes: Vec<KeyValue>,
    /// Trace of the span active when the record was produced.
    pub trace_id: Option<TraceId>,
    /// Span active when the record was produced.
    pub span_id: Option<SpanId>,
    /// Flags of that span; `None` when the producer did not know them.
    pub trace_flags: Option<TraceFlags>,
}

impl LogRecord {
    /// Creates a record timestamped now with no trace context.
    pub fn new(severity: Severity, body: impl Into<String>) -> Self {
        let now = SystemTime::now();
        Self {
            timestamp: now,
            observed_timestamp: now,
            severity,
            body: body.into(),
            target: String::new(),
            attributes: Vec::new(),
            trace_id: None,
            span_id: None,
            trace_flags: None,
        }
    }

    /// Stamps the record with the active span in `cx`, if any.
    pub fn with_context(mut self, cx: &Context) -> Self {
        if let Some(sc) = cx.span_context() {
            self.trace_id = Some(sc.trace_id());
            self.span_id = Some(sc.span_id());
            self.trace_flags = Some(sc.trace_flags());
        }
        self
    }

    /// Sets the target.
    pub fn with_target(mut self, target: impl Into<String>) -> Self {
        self.target = target.into();
        self
    }

    /// Appends an attribute.
    pub fn with_attribute(mut self, attribute: KeyValue) -> Self {
        self.attributes.push(attribute);
        self
    }
}

struct ProviderInner {
    min_severity: Severity,
    processor: Option<BatchProcessor<LogRecord>>,
}

/// Filters log records by severity and queues the rest for export.
///
/// Cloning is cheap; clones share the same processor.
#[derive(Clone)]
pub struct LoggerProvider {
    inner: Arc<ProviderInner>,
}

impl fmt::Debug for LoggerProvider {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LoggerProvider")
            .field("min_severity", &self.inner.min_severity)
            .field("processor", &self.inner.processor)
            .finish()
    }
}

impl LoggerProvider {
    /// Creates a provider. Without a processor every record is discarded
    /// after filtering.
    pub fn new(min_severity: Severity, processor: Option<BatchProcessor<LogRecord>>) -> Self {
        Self {
            inner: Arc::new(ProviderInner {
                min_severity,
                processor,
            }),
        }
    }

    /// Returns the minimum severity forwarded to the exporter.
    pub fn min_severity(&self) -> Severity {
        self.inner.min_severity
    }

    /// Returns whether a record at `severity` would be exported.
    pub fn enabled(&self, severity: Severity) -> bool {
        severity >= self.inner.min_severity
    }

    /// Returns the batch processor, if one is attached.
    pub fn processor(&self) -> Option<&BatchProcessor<LogRecord>> {
        self.inner.processor.as_ref()
    }

    /// Queues `record` for export.
    ///
    /// Returns `false` if the record was filtered out by severity or
    /// dropped by a full queue. Never fails.
    pub fn emit(&self, record: LogRecord) -> bool {
        if !self.enabled(record.severity) {
            return false;
        }
        match &self.inner.processor {
            Some(processor) => processor.enqueue(record),
            None => false,
        }
    }

    /// Emits `body` at `severity`, stamped with the active span in `cx`.
    pub fn log(&self, cx: &Context, severity: Severity, body: impl Into<String>) -> bool {
        if !self.enabled(severity) {
            return false;
        }
        self.emit(LogRecord::new(severity, body).with_context(cx))
    }

    /// Exports all queued records now.
    pub async fn force_flush(&self) {
        if let Some(processor) = &self.inner.processor {
            processor.force_flush().await;
        }
    }

    /// Stops the log processor after a final drain.
    ///
    /// # Errors
    ///
    /// Returns an error if the final drain exceeds `timeout`.
    pub async fn shutdown(&self, timeout: Duration) -> Result<(), PipelineError> {
        match &self.inner.processor {
            Some(processor) => processor.shutdown(timeout).await,
            None => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::BatchConfig;
    use crate::context::{SpanContext, TraceState};
    use opentelemetry_sdk::trace::{IdGenerator, RandomIdGenerator};
    use crate::exporter::InMemoryExporter;
    use crate::resource::ResourceDescriptor;

    fn provider(min_severity: Severity, exporter: &InMemoryExporter) -> LoggerProvider {
        let processor = BatchProcessor::new(
            "logs",
            &BatchConfig::default(),
            Arc::new(exporter.clone()),
            ResourceDescriptor::default(),
        );
        LoggerProvider::new(min_severity, Some(processor))
    }

    #[test]
    fn test_severity_ordering_and_numbers() {
        assert!(Severity::Trace < Severity::Debug);
        assert!(Severity::Info < Severity::Warn);
        assert!(Severity::Error < Severity::Fatal);
        assert_eq!(Severity::default(), Severity::Warn);

        let numbers: Vec<i32> = [
            Severity::Trace,
            Severity::Debug,
            Severity::Info,
            Severity::Warn,
            Severity::Error,
            Severity::Fatal,
        ]
        .into_iter()
        .map(Severity::number)
        .collect();
        assert_eq!(numbers, vec![1, 5, 9, 13, 17, 21]);
        assert_eq!(Severity::Warn.text(), "WARN");
    }

    #[test]
    fn test_severity_from_tracing_level() {
        assert_eq!(Severity::from(tracing::Level::INFO), Severity::Info);
        assert_eq!(Severity::from(tracing::Level::WARN), Severity::Warn);
        assert_eq!(Severity::from(tracing::Level::ERROR), Severity::Error);
    }

    #[test]
    fn test_severity_deserialization() {
        let severity: Severity = serde_json::from_str("\"error\"").unwrap();
        assert_eq!(severity, Severity::Error);
    }

    #[tokio::test]
    async fn test_records_below_minimum_are_dropped() {
        let exporter = InMemoryExporter::new();
        let provider = provider(Severity::Warn, &exporter);
        let cx = Context::new();

        assert!(!provider.log(&cx, Severity::Info, "Index endpoint called"));
        assert!(provider.log(&cx, Severity::Warn, "warning"));
        assert!(provider.log(&cx, Severity::Error, "error"));

        provider.force_flush().await;
        let logs = exporter.logs();
        assert_eq!(logs.len(), 2);
        assert_eq!(logs[0].severity_number, 13);
        assert_eq!(logs[1].severity_number, 17);
    }

    #[tokio::test]
    async fn test_log_stamps_active_span() {
        let exporter = InMemoryExporter::new();
        let provider = provider(Severity::Info, &exporter);
        let ids = RandomIdGenerator::default();
        let sampled = SpanContext::new(
            ids.new_trace_id(),
            ids.new_span_id(),
            TraceFlags::SAMPLED,
            false,
            TraceState::NONE,
        );
        let unsampled = SpanContext::new(
            ids.new_trace_id(),
            ids.new_span_id(),
            TraceFlags::NOT_SAMPLED,
            false,
            TraceState::NONE,
        );

        provider.log(&Context::new().with_span_context(sampled.clone()), Severity::Error, "in span");
        provider.log(&Context::new(), Severity::Error, "outside span");
        provider.log(&Context::new().with_span_context(unsampled.clone()), Severity::Error, "unsampled span");
        provider.force_flush().await;

        let logs = exporter.logs();
        assert_eq!(logs[0].trace_id, sampled.trace_id().to_bytes().to_vec());
        assert_eq!(logs[0].span_id, sampled.span_id().to_bytes().to_vec());
        assert_eq!(logs[0].flags, 1);
        assert!(logs[1].trace_id.is_empty());
        assert_eq!(logs[1].flags, 0);
        assert_eq!(logs[2].trace_id, unsampled.trace_id().to_bytes().to_vec());
        assert_eq!(logs[2].flags, 0);
    }

    #[test]
    fn test_provider_without_processor_accepts_nothing() {
        let provider = LoggerProvider::new(Severity::Trace, None);
        assert!(!provider.emit(LogRecord::new(Severity::Fatal, "lost")));
    }
}
