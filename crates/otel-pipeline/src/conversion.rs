//! Conversion of finished spans, log records and metric snapshots into OTLP
//! export requests.
//!
//! Every request carries the process resource. Records are grouped by
//! instrumentation scope in first-seen order.

use crate::attributes::KeyValue;
use crate::batch::Exportable;
use crate::exporter::BatchedSignal;
use crate::logs::LogRecord;
use crate::metrics::{HistogramPoint, MetricData, MetricPoints, SumPoint, Temporality};
use crate::resource::ResourceDescriptor;
use crate::trace::{SpanData, Status};
use opentelemetry_proto::tonic::collector::logs::v1::ExportLogsServiceRequest;
use opentelemetry_proto::tonic::collector::metrics::v1::ExportMetricsServiceRequest;
use opentelemetry_proto::tonic::collector::trace::v1::ExportTraceServiceRequest;
use opentelemetry_proto::tonic::common::v1::{
    AnyValue, InstrumentationScope, KeyValue as ProtoKeyValue, any_value,
};
use opentelemetry_proto::tonic::logs::v1::{
    LogRecord as ProtoLogRecord, ResourceLogs, ScopeLogs,
};
use opentelemetry_proto::tonic::metrics::v1::{
    AggregationTemporality, Histogram, HistogramDataPoint, Metric, NumberDataPoint,
    ResourceMetrics, ScopeMetrics, Sum, metric::Data, number_data_point,
};
use opentelemetry_proto::tonic::trace::v1::{
    ResourceSpans, ScopeSpans, Span as ProtoSpan, Status as ProtoStatus, span, status,
};
use opentelemetry_proto::transform::common::tonic::Attributes;
use opentelemetry_semantic_conventions::SCHEMA_URL;
use std::time::{SystemTime, UNIX_EPOCH};

/// Scope used for log records that carry no target.
const DEFAULT_LOG_SCOPE: &str = "otel-pipeline";

impl Exportable for SpanData {
    fn into_signal(records: Vec<Self>, resource: &ResourceDescriptor) -> BatchedSignal {
        BatchedSignal::Traces(spans_to_request(records, resource))
    }
}

impl Exportable for LogRecord {
    fn into_signal(records: Vec<Self>, resource: &ResourceDescriptor) -> BatchedSignal {
        BatchedSignal::Logs(logs_to_request(records, resource))
    }
}

/// Builds a trace export request.
pub fn spans_to_request(spans: Vec<SpanData>, resource: &ResourceDescriptor) -> ExportTraceServiceRequest {
    let scope_spans = group_by_scope(spans, |s| s.scope.as_ref())
        .into_iter()
        .map(|(scope, spans)| ScopeSpans {
            scope: Some(instrumentation_scope(scope)),
            spans: spans.into_iter().map(span_to_proto).collect(),
            ..Default::default()
        })
        .collect();

    ExportTraceServiceRequest {
        resource_spans: vec![ResourceSpans {
            resource: Some(resource.proto().clone()),
            scope_spans,
            schema_url: SCHEMA_URL.to_string(),
        }],
    }
}

fn span_to_proto(span: SpanData) -> ProtoSpan {
    let flags = u32::from(span.span_context.trace_flags().to_u8());

    ProtoSpan {
        trace_id: span.span_context.trace_id().to_bytes().to_vec(),
        span_id: span.span_context.span_id().to_bytes().to_vec(),
        parent_span_id: span
            .parent_span_id
            .map(|id| id.to_bytes().to_vec())
            .unwrap_or_default(),
        flags,
        name: span.name,
        kind: span::SpanKind::from(span.kind) as i32,
        start_time_unix_nano: to_nanos(span.start_time),
        end_time_unix_nano: to_nanos(span.end_time),
        attributes: to_proto_attributes(&span.attributes),
        events: span
            .events
            .into_iter()
            .map(|event| span::Event {
                time_unix_nano: to_nanos(event.timestamp),
                name: event.name,
                attributes: to_proto_attributes(&event.attributes),
                dropped_attributes_count: 0,
            })
            .collect(),
        status: Some(span_status(span.status)),
        ..Default::default()
    }
}

fn span_status(status: Status) -> ProtoStatus {
    match status {
        Status::Unset => ProtoStatus {
            code: status::StatusCode::Unset as i32,
            message: String::new(),
        },
        Status::Ok => ProtoStatus {
            code: status::StatusCode::Ok as i32,
            message: String::new(),
        },
        Status::Error { description } => ProtoStatus {
            code: status::StatusCode::Error as i32,
            message: description.into_owned(),
        },
    }
}

/// Builds a log export request.
pub fn logs_to_request(records: Vec<LogRecord>, resource: &ResourceDescriptor) -> ExportLogsServiceRequest {
    let scope_logs = group_by_scope(records, |r| {
        if r.target.is_empty() {
            DEFAULT_LOG_SCOPE
        } else {
            r.target.as_str()
        }
    })
    .into_iter()
    .map(|(scope, records)| ScopeLogs {
        scope: Some(instrumentation_scope(scope)),
        log_records: records.into_iter().map(log_to_proto).collect(),
        ..Default::default()
    })
    .collect();

    ExportLogsServiceRequest {
        resource_logs: vec![ResourceLogs {
            resource: Some(resource.proto().clone()),
            scope_logs,
            schema_url: SCHEMA_URL.to_string(),
        }],
    }
}

fn log_to_proto(record: LogRecord) -> ProtoLogRecord {
    let flags = record
        .trace_flags
        .map_or(0, |trace_flags| u32::from(trace_flags.to_u8()));

    ProtoLogRecord {
        time_unix_nano: to_nanos(record.timestamp),
        observed_time_unix_nano: to_nanos(record.observed_timestamp),
        severity_number: record.severity.number(),
        severity_text: record.severity.text().to_string(),
        body: Some(AnyValue {
            value: Some(any_value::Value::StringValue(record.body)),
        }),
        attributes: to_proto_attributes(&record.attributes),
        flags,
        trace_id: record
            .trace_id
            .map(|id| id.to_bytes().to_vec())
            .unwrap_or_default(),
        span_id: record
            .span_id
            .map(|id| id.to_bytes().to_vec())
            .unwrap_or_default(),
        ..Default::default()
    }
}

/// Builds a metric export request.
pub fn metrics_to_request(
    metrics: Vec<MetricData>,
    resource: &ResourceDescriptor,
) -> ExportMetricsServiceRequest {
    let scope_metrics = group_by_scope(metrics, |m| m.scope.as_ref())
        .into_iter()
        .map(|(scope, metrics)| ScopeMetrics {
            scope: Some(instrumentation_scope(scope)),
            metrics: metrics.into_iter().map(metric_to_proto).collect(),
            ..Default::default()
        })
        .collect();

    ExportMetricsServiceRequest {
        resource_metrics: vec![ResourceMetrics {
            resource: Some(resource.proto().clone()),
            scope_metrics,
            schema_url: SCHEMA_URL.to_string(),
        }],
    }
}

fn metric_to_proto(metric: MetricData) -> Metric {
    let temporality = aggregation_temporality(metric.temporality) as i32;
    let start = to_nanos(metric.start_time);
    let time = to_nanos(metric.time);

    let data = match metric.points {
        MetricPoints::Sum { monotonic, points } => Data::Sum(Sum {
            data_points: points
                .into_iter()
                .map(|p| number_point(p, start, time))
                .collect(),
            aggregation_temporality: temporality,
            is_monotonic: monotonic,
        }),
        MetricPoints::Histogram(points) => Data::Histogram(Histogram {
            data_points: points
                .into_iter()
                .map(|p| histogram_point(p, start, time))
                .collect(),
            aggregation_temporality: temporality,
        }),
    };

    Metric {
        name: metric.name,
        description: metric.description,
        data: Some(data),
        ..Default::default()
    }
}

fn number_point(point: SumPoint, start: u64, time: u64) -> NumberDataPoint {
    let attributes: Vec<KeyValue> = point.attributes.iter().cloned().collect();
    NumberDataPoint {
        attributes: to_proto_attributes(&attributes),
        start_time_unix_nano: start,
        time_unix_nano: time,
        value: Some(number_data_point::Value::AsInt(point.value)),
        ..Default::default()
    }
}

fn histogram_point(point: HistogramPoint, start: u64, time: u64) -> HistogramDataPoint {
    let attributes: Vec<KeyValue> = point.attributes.iter().cloned().collect();
    HistogramDataPoint {
        attributes: to_proto_attributes(&attributes),
        start_time_unix_nano: start,
        time_unix_nano: time,
        count: point.count,
        sum: Some(point.sum),
        bucket_counts: point.bucket_counts,
        explicit_bounds: point.bounds.to_vec(),
        min: Some(point.min),
        max: Some(point.max),
        ..Default::default()
    }
}

fn aggregation_temporality(temporality: Temporality) -> AggregationTemporality {
    match temporality {
        Temporality::Delta => AggregationTemporality::Delta,
        Temporality::Cumulative => AggregationTemporality::Cumulative,
    }
}

/// Converts attributes to their OTLP form.
pub fn to_proto_attributes(attributes: &[KeyValue]) -> Vec<ProtoKeyValue> {
    Attributes::from(attributes.iter().cloned()).0
}

fn instrumentation_scope(name: String) -> InstrumentationScope {
    InstrumentationScope {
        name,
        ..Default::default()
    }
}

fn group_by_scope<T>(items: Vec<T>, scope_of: impl Fn(&T) -> &str) -> Vec<(String, Vec<T>)> {
    let mut groups: Vec<(String, Vec<T>)> = Vec::new();
    for item in items {
        let scope = scope_of(&item);
        match groups.iter_mut().find(|(name, _)| name == scope) {
            Some((_, members)) => members.push(item),
            None => groups.push((scope.to_string(), vec![item])),
        }
    }
    groups
}

fn to_nanos(time: SystemTime) -> u64 {
    time.duration_since(UNIX_EPOCH)
        .map(|d| d.as_nanos() as u64)
        .unwrap_or(0)
}
