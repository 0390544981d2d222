//! Traces, metrics and logs for a single service, exported over OTLP/HTTP.
//!
//! This crate builds one telemetry pipeline per process. Every signal shares
//! a [`ResourceDescriptor`] describing the service and is handed to the same
//! exporter:
//!
//! - **Traces** - [`Tracer`]s create [`Span`]s; ended, sampled spans are
//!   queued in a [`BatchProcessor`] and exported in batches.
//! - **Metrics** - [`Meter`]s create counters, up-down counters, histograms
//!   and observable instruments. A [`PeriodicReader`] collects them on an
//!   interval using a fixed temporality per instrument kind.
//! - **Logs** - [`LogBridge`] forwards `tracing` events at or above a
//!   minimum [`Severity`] to the log pipeline.
//!
//! Batching never blocks the caller. When a queue is full the newest record
//! is dropped and counted. A failed export is logged and discarded; the next
//! cycle proceeds as usual.
//!
//! # Configuration
//!
//! [`Config`] is layered with [figment](https://docs.rs/figment): compiled
//! defaults, an optional TOML file, the standard `OTEL_*` variables and
//! finally `OTEL_PIPELINE_*` variables.
//!
//! # Example
//!
//! ```no_run
//! use otel_pipeline::{Config, Context, KeyValue, SpanKind, TelemetryPipeline};
//! use tracing_subscriber::prelude::*;
//!
//! # async fn run() -> Result<(), Box<dyn std::error::Error>> {
//! let config = Config::builder()
//!     .endpoint("https://collector.example.com/api/v2/otlp")
//!     .api_token("secret")
//!     .service("checkout", "1.0.0")
//!     .build();
//! let pipeline = TelemetryPipeline::builder(config).build()?;
//!
//! tracing_subscriber::registry()
//!     .with(tracing_subscriber::fmt::layer())
//!     .with(pipeline.log_bridge())
//!     .init();
//!
//! let requests = pipeline.meter("checkout").create_counter("requests", "Requests served");
//! let mut span = pipeline
//!     .tracer("checkout")
//!     .start("Call to /", SpanKind::Server, &Context::new());
//! span.set_attribute("http.method", "GET");
//! requests.add(1, &[KeyValue::new("endpoint", "/")]);
//! tracing::warn!(trace_id = %span.trace_id(), span_id = %span.span_id(), "Index endpoint called");
//! span.end();
//!
//! pipeline.shutdown().await?;
//! # Ok(())
//! # }
//! ```

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod attributes;
pub mod batch;
pub mod bridge;
pub mod config;
pub mod context;
pub mod conversion;
pub mod error;
pub mod exporter;
pub mod logs;
pub mod metrics;
pub mod pipeline;
pub mod reader;
pub mod resource;
pub mod sampler;
pub mod trace;

pub use attributes::{AttributeSet, Key, KeyValue, Value};
pub use batch::{BatchProcessor, Exportable, ProcessorStatsSnapshot};
pub use bridge::LogBridge;
pub use config::{
    BatchConfig, Compression, Config, ConfigBuilder, ExporterConfig, LogsConfig, MetadataSource,
    MetricsConfig, Protocol, ResourceConfig, standard_env_overrides,
};
pub use context::{Context, SpanContext, SpanId, TraceFlags, TraceId, TraceState};
pub use error::{PipelineError, Result};
pub use exporter::{
    BatchedSignal, ExportError, ExportResult, InMemoryExporter, OtlpExporter, SharedExporter,
    SignalExporter, SignalExporterBoxed,
};
pub use logs::{LogRecord, LoggerProvider, Severity};
pub use metrics::{
    Counter, Histogram, InstrumentKind, Meter, MeterProvider, ObservableCounter,
    ObservableUpDownCounter, Observer, Temporality, TemporalitySelector, UpDownCounter,
};
pub use pipeline::{PipelineStats, TelemetryPipeline, TelemetryPipelineBuilder};
pub use reader::{PeriodicReader, ReaderStatsSnapshot};
pub use resource::ResourceDescriptor;
pub use sampler::Sampler;
pub use trace::{Span, SpanData, SpanKind, Status, Tracer, TracerProvider};

pub use figment;
