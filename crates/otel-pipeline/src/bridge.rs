//! Bridge from `tracing` events to the log pipeline.
//!
//! [`LogBridge`] is a [`tracing_subscriber::Layer`]. Installed next to a
//! console layer, it forwards events at or above the provider's minimum
//! severity while everything else is still printed locally.
//!
//! Fields named `trace_id` and `span_id` holding hex ids stamp the record
//! with that trace context. A `span_id` without a usable `trace_id` stays an
//! attribute. `message` becomes the body and any other field becomes an
//! attribute. Bridged records carry no trace flags.

use crate::attributes::KeyValue;
use crate::context::{SpanId, TraceId};
use crate::logs::{LogRecord, LoggerProvider, Severity};
use std::fmt;
use tracing::field::{Field, Visit};
use tracing::{Event, Subscriber};
use tracing_subscriber::Layer;
use tracing_subscriber::layer::Context as LayerContext;

/// Target prefixes that are never forwarded, so that export diagnostics
/// cannot feed back into the exporter.
const SUPPRESSED_TARGETS: [&str; 4] = ["otel_pipeline", "reqwest", "hyper", "h2"];

/// `tracing` layer forwarding events to a [`LoggerProvider`].
#[derive(Debug, Clone)]
pub struct LogBridge {
    provider: LoggerProvider,
}

impl LogBridge {
    /// Creates a bridge feeding `provider`.
    pub fn new(provider: LoggerProvider) -> Self {
        Self { provider }
    }
}

fn is_suppressed(target: &str) -> bool {
    SUPPRESSED_TARGETS.iter().any(|prefix| {
        target
            .strip_prefix(prefix)
            .is_some_and(|rest| rest.is_empty() || rest.starts_with("::"))
    })
}

impl<S: Subscriber> Layer<S> for LogBridge {
    fn on_event(&self, event: &Event<'_>, _ctx: LayerContext<'_, S>) {
        let metadata = event.metadata();
        if is_suppressed(metadata.target()) {
            return;
        }

        let severity = Severity::from(*metadata.level());
        if !self.provider.enabled(severity) {
            return;
        }

        let mut visitor = RecordVisitor::default();
        event.record(&mut visitor);

        let mut record = LogRecord::new(severity, visitor.message).with_target(metadata.target());
        record.attributes = visitor.attributes;
        match (visitor.trace_id, visitor.span_id) {
            (Some(trace_id), span_id) => {
                record.trace_id = Some(trace_id);
                record.span_id = span_id;
            }
            (None, Some(span_id)) => {
                record
                    .attributes
                    .push(KeyValue::new("span_id", span_id.to_string()));
            }
            (None, None) => {}
        }

        self.provider.emit(record);
    }
}

#[derive(Default)]
struct RecordVisitor {
    message: String,
    attributes: Vec<KeyValue>,
    trace_id: Option<TraceId>,
    span_id: Option<SpanId>,
}

impl RecordVisitor {
    fn record_text(&mut self, field: &Field, value: String) {
        match field.name() {
            "message" => self.message = value,
            "trace_id" => match parse_trace_id(&value) {
                Some(id) => self.trace_id = Some(id),
                None => self.attributes.push(KeyValue::new("trace_id", value)),
            },
            "span_id" => match parse_span_id(&value) {
                Some(id) => self.span_id = Some(id),
                None => self.attributes.push(KeyValue::new("span_id", value)),
            },
            name => self.attributes.push(KeyValue::new(name, value)),
        }
    }
}

fn is_hex_of_len(value: &str, len: usize) -> bool {
    value.len() == len && value.bytes().all(|b| b.is_ascii_hexdigit())
}

/// Parses a 32-digit hex trace id, rejecting the all-zero id.
fn parse_trace_id(value: &str) -> Option<TraceId> {
    if !is_hex_of_len(value, 32) {
        return None;
    }
    TraceId::from_hex(value)
        .ok()
        .filter(|id| *id != TraceId::INVALID)
}

/// Parses a 16-digit hex span id, rejecting the all-zero id.
fn parse_span_id(value: &str) -> Option<SpanId> {
    if !is_hex_of_len(value, 16) {
        return None;
    }
    SpanId::from_hex(value).ok().filter(|id| *id != SpanId::INVALID)
}

impl Visit for RecordVisitor {
    fn record_str(&mut self, field: &Field, value: &str) {
        self.record_text(field, value.to_owned());
    }

    fn record_debug(&mut self, field: &Field, value: &dyn fmt::Debug) {
        self.record_text(field, format!("{value:?}"));
    }

    fn record_i64(&mut self, field: &Field, value: i64) {
        self.attributes.push(KeyValue::new(field.name(), value));
    }

    fn record_u64(&mut self, field: &Field, value: u64) {
        let value = i64::try_from(value).unwrap_or(i64::MAX);
        self.attributes.push(KeyValue::new(field.name(), value));
    }

    fn record_f64(&mut self, field: &Field, value: f64) {
        self.attributes.push(KeyValue::new(field.name(), value));
    }

    fn record_bool(&mut self, field: &Field, value: bool) {
        self.attributes.push(KeyValue::new(field.name(), value));
    }
}
