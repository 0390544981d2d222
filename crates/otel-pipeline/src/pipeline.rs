//! Telemetry pipeline lifecycle.
//!
//! [`TelemetryPipeline`] owns one tracer, meter and logger provider for the
//! process, all sharing a single resource and exporter. Handles obtained from
//! it ([`Tracer`], [`Meter`], [`LogBridge`]) are passed explicitly to the code
//! that needs them; nothing is registered globally.
//!
//! Shut the pipeline down with [`TelemetryPipeline::shutdown`] to export
//! everything still queued. Dropping it instead signals the background tasks
//! to stop; they still attempt a final export but nothing waits for it.

use crate::batch::{BatchProcessor, ProcessorStatsSnapshot};
use crate::bridge::LogBridge;
use crate::config::Config;
use crate::error::Result;
use crate::exporter::{OtlpExporter, SharedExporter};
use crate::logs::{LogRecord, LoggerProvider};
use crate::metrics::{Meter, MeterProvider, TemporalitySelector};
use crate::reader::{PeriodicReader, ReaderStatsSnapshot};
use crate::resource::ResourceDescriptor;
use crate::trace::{SpanData, Tracer, TracerProvider};
use std::borrow::Cow;
use std::sync::Arc;

/// Counters for every background component.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PipelineStats {
    /// Span processor counters.
    pub spans: ProcessorStatsSnapshot,
    /// Log processor counters.
    pub logs: ProcessorStatsSnapshot,
    /// Metric reader counters.
    pub metrics: ReaderStatsSnapshot,
}

/// Process-wide trace, metric and log providers with a shared lifecycle.
///
/// # Example
///
/// ```no_run
/// use otel_pipeline::{Config, Context, SpanKind, TelemetryPipeline};
///
/// # async fn run() -> otel_pipeline::Result<()> {
/// let pipeline = TelemetryPipeline::builder(Config::default()).build()?;
///
/// let tracer = pipeline.tracer("my-service");
/// let span = tracer.start("work", SpanKind::Internal, &Context::new());
/// span.end();
///
/// pipeline.shutdown().await
/// # }
/// ```
pub struct TelemetryPipeline {
    config: Config,
    resource: ResourceDescriptor,
    tracer_provider: TracerProvider,
    meter_provider: MeterProvider,
    logger_provider: LoggerProvider,
    reader: PeriodicReader,
}

impl std::fmt::Debug for TelemetryPipeline {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TelemetryPipeline")
            .field("resource", &self.resource)
            .field("stats", &self.stats())
            .finish_non_exhaustive()
    }
}

impl TelemetryPipeline {
    /// Starts building a pipeline from `config`.
    pub fn builder(config: Config) -> TelemetryPipelineBuilder {
        TelemetryPipelineBuilder {
            config,
            exporter: None,
            resource: None,
        }
    }

    /// Returns a tracer for the given instrumentation scope.
    pub fn tracer(&self, scope: impl Into<Cow<'static, str>>) -> Tracer {
        self.tracer_provider.tracer(scope)
    }

    /// Returns a meter for the given instrumentation scope.
    pub fn meter(&self, scope: impl Into<Cow<'static, str>>) -> Meter {
        self.meter_provider.meter(scope)
    }

    /// Returns the tracer provider.
    pub fn tracer_provider(&self) -> &TracerProvider {
        &self.tracer_provider
    }

    /// Returns the meter provider.
    pub fn meter_provider(&self) -> &MeterProvider {
        &self.meter_provider
    }

    /// Returns the logger provider.
    pub fn logger_provider(&self) -> &LoggerProvider {
        &self.logger_provider
    }

    /// Returns a `tracing` layer that forwards events to the log pipeline.
    pub fn log_bridge(&self) -> LogBridge {
        LogBridge::new(self.logger_provider.clone())
    }

    /// Returns the resource attached to every exported signal.
    pub fn resource(&self) -> &ResourceDescriptor {
        &self.resource
    }

    /// Returns the configuration the pipeline was built with.
    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Returns counters for every background component.
    pub fn stats(&self) -> PipelineStats {
        PipelineStats {
            spans: self
                .tracer_provider
                .processor()
                .map(BatchProcessor::stats)
                .unwrap_or_default(),
            logs: self
                .logger_provider
                .processor()
                .map(BatchProcessor::stats)
                .unwrap_or_default(),
            metrics: self.reader.stats(),
        }
    }

    /// Exports every queued span and log record and collects metrics now.
    pub async fn force_flush(&self) {
        tokio::join!(
            self.tracer_provider.force_flush(),
            self.logger_provider.force_flush(),
            self.reader.force_flush(),
        );
    }

    /// Stops every background task after a final export.
    ///
    /// Each component is given `shutdown_timeout` to finish.
    ///
    /// # Errors
    ///
    /// Returns the first component error, typically
    /// [`PipelineError::ShutdownTimeout`](crate::PipelineError::ShutdownTimeout).
    pub async fn shutdown(self) -> Result<()> {
        let timeout = self.config.shutdown_timeout;
        tracing::debug!(target: "otel_pipeline", ?timeout, "Shutting down telemetry pipeline");

        let (spans, logs, metrics) = tokio::join!(
            self.tracer_provider.shutdown(timeout),
            self.logger_provider.shutdown(timeout),
            self.reader.shutdown(timeout),
        );

        spans.and(logs).and(metrics)
    }
}

impl Drop for TelemetryPipeline {
    fn drop(&mut self) {
        if let Some(processor) = self.tracer_provider.processor() {
            processor.stop();
        }
        if let Some(processor) = self.logger_provider.processor() {
            processor.stop();
        }
        self.reader.stop();
    }
}

/// Builder for [`TelemetryPipeline`].
#[must_use = "builders do nothing unless .build() is called"]
pub struct TelemetryPipelineBuilder {
    config: Config,
    exporter: Option<SharedExporter>,
    resource: Option<ResourceDescriptor>,
}

impl TelemetryPipelineBuilder {
    /// Uses `exporter` for every signal instead of an [`OtlpExporter`]
    /// built from the configuration.
    pub fn with_exporter(mut self, exporter: SharedExporter) -> Self {
        self.exporter = Some(exporter);
        self
    }

    /// Uses `resource` instead of one built from the configuration.
    pub fn with_resource(mut self, resource: ResourceDescriptor) -> Self {
        self.resource = Some(resource);
        self
    }

    /// Builds the providers and spawns their background tasks.
    ///
    /// # Errors
    ///
    /// Returns an error if the HTTP client for the OTLP exporter cannot be
    /// created.
    ///
    /// # Panics
    ///
    /// Panics if called outside a Tokio runtime.
    pub fn build(self) -> Result<TelemetryPipeline> {
        let config = self.config;

        let resource = self
            .resource
            .unwrap_or_else(|| ResourceDescriptor::from_config(&config.resource));

        let exporter: SharedExporter = match self.exporter {
            Some(exporter) => exporter,
            None => Arc::new(OtlpExporter::new(config.exporter.clone())?),
        };

        let span_processor: BatchProcessor<SpanData> = BatchProcessor::new(
            "spans",
            &config.batch,
            Arc::clone(&exporter),
            resource.clone(),
        );
        let tracer_provider = TracerProvider::builder()
            .with_sampler(config.sampler.clone())
            .with_batch_processor(span_processor)
            .build();

        let log_processor: BatchProcessor<LogRecord> = BatchProcessor::new(
            "logs",
            &config.batch,
            Arc::clone(&exporter),
            resource.clone(),
        );
        let logger_provider = LoggerProvider::new(config.logs.min_severity, Some(log_processor));

        let meter_provider = MeterProvider::new(TemporalitySelector::new(
            config.metrics.temporality_overrides.clone(),
        ));
        let reader = PeriodicReader::new(
            meter_provider.clone(),
            Arc::clone(&exporter),
            resource.clone(),
            config.metrics.export_interval,
        );

        tracing::debug!(
            target: "otel_pipeline",
            exporter = exporter.name(),
            endpoint = config.exporter.endpoint.as_deref().unwrap_or("<none>"),
            "Telemetry pipeline started"
        );

        Ok(TelemetryPipeline {
            config,
            resource,
            tracer_provider,
            meter_provider,
            logger_provider,
            reader,
        })
    }
}
