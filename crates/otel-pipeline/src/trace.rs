//! Spans, tracers and the tracer provider.
//!
//! Spans are owned by the task that started them. Ending a span (or
//! dropping it) freezes its data and hands it to the provider's batch
//! processor; unsampled spans carry valid ids for propagation but are never
//! recorded.

use crate::attributes::{Key, KeyValue, Value};
use crate::batch::BatchProcessor;
use crate::context::{self, Context, SpanContext, SpanId, TraceFlags, TraceId, TraceState};
use crate::error::PipelineError;
use crate::sampler::{Sampler, SamplingDecision};
use opentelemetry_sdk::trace::RandomIdGenerator;
use std::borrow::Cow;
use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime};

pub use opentelemetry::trace::{SpanKind, Status};

/// A timestamped annotation on a span.
#[derive(Debug, Clone, PartialEq)]
pub struct SpanEvent {
    /// Event name.
    pub name: String,
    /// When the event happened.
    pub timestamp: SystemTime,
    /// Event attributes.
    pub attributes: Vec<KeyValue>,
}

/// Immutable record of an ended span.
#[derive(Debug, Clone, PartialEq)]
pub struct SpanData {
    /// Identity of the span.
    pub span_context: SpanContext,
    /// The span that was active when this one started.
    pub parent_span_id: Option<SpanId>,
    /// Instrumentation scope of the tracer that created the span.
    pub scope: Arc<str>,
    /// Span name.
    pub name: String,
    /// Span kind.
    pub kind: SpanKind,
    /// Start time.
    pub start_time: SystemTime,
    /// End time; never earlier than `start_time`.
    pub end_time: SystemTime,
    /// Attributes in insertion order, unique by key.
    pub attributes: Vec<KeyValue>,
    /// Events in insertion order.
    pub events: Vec<SpanEvent>,
    /// Final status.
    pub status: Status,
}

impl SpanData {
    /// Returns the span duration.
    pub fn duration(&self) -> Duration {
        self.end_time
            .duration_since(self.start_time)
            .unwrap_or_default()
    }

    /// Looks up an attribute by key.
    pub fn attribute(&self, key: &str) -> Option<&Value> {
        self.attributes
            .iter()
            .find(|kv| kv.key.as_str() == key)
            .map(|kv| &kv.value)
    }
}

struct ProviderInner {
    sampler: Sampler,
    ids: RandomIdGenerator,
    processor: Option<BatchProcessor<SpanData>>,
}

/// Creates tracers and routes their ended spans to a batch processor.
///
/// Cloning is cheap; clones share the sampler and processor.
#[derive(Clone)]
pub struct TracerProvider {
    inner: Arc<ProviderInner>,
}

impl std::fmt::Debug for TracerProvider {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TracerProvider")
            .field("sampler", &self.inner.sampler)
            .field("processor", &self.inner.processor)
            .finish()
    }
}

impl TracerProvider {
    /// Starts building a provider.
    pub fn builder() -> TracerProviderBuilder {
        TracerProviderBuilder::default()
    }

    /// Returns a tracer for the given instrumentation scope.
    pub fn tracer(&self, scope: impl Into<Cow<'static, str>>) -> Tracer {
        let scope: Cow<'static, str> = scope.into();
        Tracer {
            provider: self.clone(),
            scope: Arc::from(scope.as_ref()),
        }
    }

    /// Returns the batch processor, if one is attached.
    pub fn processor(&self) -> Option<&BatchProcessor<SpanData>> {
        self.inner.processor.as_ref()
    }

    /// Exports all ended spans now.
    pub async fn force_flush(&self) {
        if let Some(processor) = &self.inner.processor {
            processor.force_flush().await;
        }
    }

    /// Stops the span processor after a final drain.
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

/// Builder for [`TracerProvider`].
#[derive(Default)]
#[must_use = "builders do nothing unless .build() is called"]
pub struct TracerProviderBuilder {
    sampler: Sampler,
    processor: Option<BatchProcessor<SpanData>>,
}

impl TracerProviderBuilder {
    /// Sets the sampling policy. Defaults to [`Sampler::AlwaysOn`].
    pub fn with_sampler(mut self, sampler: Sampler) -> Self {
        self.sampler = sampler;
        self
    }

    /// Routes ended spans to `processor`. Without one, spans are discarded.
    pub fn with_batch_processor(mut self, processor: BatchProcessor<SpanData>) -> Self {
        self.processor = Some(processor);
        self
    }

    /// Builds the provider.
    pub fn build(self) -> TracerProvider {
        TracerProvider {
            inner: Arc::new(ProviderInner {
                sampler: self.sampler,
                ids: RandomIdGenerator::default(),
                processor: self.processor,
            }),
        }
    }
}

/// Starts spans for one instrumentation scope.
#[derive(Clone, Debug)]
pub struct Tracer {
    provider: TracerProvider,
    scope: Arc<str>,
}

impl Tracer {
    /// Returns the instrumentation scope name.
    pub fn scope(&self) -> &str {
        &self.scope
    }

    /// Starts a span whose parent is the active span in `cx`, if any.
    pub fn start(&self, name: impl Into<String>, kind: SpanKind, cx: &Context) -> Span {
        let inner = &self.provider.inner;
        let parent = cx.span_context();
        let trace_id = parent.map_or_else(|| context::new_trace_id(&inner.ids), |p| p.trace_id());
        let span_id = context::new_span_id(&inner.ids);
        let trace_state = parent.map_or(TraceState::NONE, |p| p.trace_state().clone());

        let decision = inner.sampler.should_sample(parent, trace_id);
        if decision == SamplingDecision::Drop {
            return Span {
                span_context: SpanContext::new(
                    trace_id,
                    span_id,
                    TraceFlags::NOT_SAMPLED,
                    false,
                    trace_state,
                ),
                data: None,
                started: Instant::now(),
                processor: None,
            };
        }

        let span_context =
            SpanContext::new(trace_id, span_id, TraceFlags::SAMPLED, false, trace_state);
        Span {
            span_context: span_context.clone(),
            data: Some(SpanData {
                span_context,
                parent_span_id: parent.map(|p| p.span_id()),
                scope: Arc::clone(&self.scope),
                name: name.into(),
                kind,
                start_time: SystemTime::now(),
                end_time: SystemTime::UNIX_EPOCH,
                attributes: Vec::new(),
                events: Vec::new(),
                status: Status::Unset,
            }),
            started: Instant::now(),
            processor: inner.processor.clone(),
        }
    }
}

/// A span in progress.
///
/// Mutable until [`end`](Self::end) consumes it. Dropping a span that was
/// never ended ends it.
#[derive(Debug)]
pub struct Span {
    span_context: SpanContext,
    data: Option<SpanData>,
    started: Instant,
    processor: Option<BatchProcessor<SpanData>>,
}

impl Span {
    /// Returns the span's identity.
    pub fn span_context(&self) -> &SpanContext {
        &self.span_context
    }

    /// Returns the trace id.
    pub fn trace_id(&self) -> TraceId {
        self.span_context.trace_id()
    }

    /// Returns the span id.
    pub fn span_id(&self) -> SpanId {
        self.span_context.span_id()
    }

    /// Returns whether the span records data (it was sampled).
    pub fn is_recording(&self) -> bool {
        self.data.is_some()
    }

    /// Sets an attribute, replacing any previous value for the key.
    pub fn set_attribute(&mut self, key: impl Into<Key>, value: impl Into<Value>) {
        let Some(data) = self.data.as_mut() else {
            return;
        };
        let kv = KeyValue::new(key, value);
        match data.attributes.iter_mut().find(|existing| existing.key == kv.key) {
            Some(existing) => existing.value = kv.value,
            None => data.attributes.push(kv),
        }
    }

    /// Records an event at the current time.
    pub fn add_event(&mut self, name: impl Into<String>, attributes: Vec<KeyValue>) {
        if let Some(data) = self.data.as_mut() {
            data.events.push(SpanEvent {
                name: name.into(),
                timestamp: SystemTime::now(),
                attributes,
            });
        }
    }

    /// Sets the status. `Unset` is ignored and `Ok` is final.
    pub fn set_status(&mut self, status: Status) {
        let Some(data) = self.data.as_mut() else {
            return;
        };
        if status == Status::Unset || data.status == Status::Ok {
            return;
        }
        data.status = status;
    }

    /// Records `error` as an `exception` event and marks the span failed.
    pub fn record_error(&mut self, error: &dyn std::error::Error) {
        let message = error.to_string();
        self.add_event(
            "exception",
            vec![KeyValue::new("exception.message", message.clone())],
        );
        self.set_status(Status::error(message));
    }

    /// Ends the span and queues it for export.
    pub fn end(mut self) {
        self.finish();
    }

    fn finish(&mut self) {
        let Some(mut data) = self.data.take() else {
            return;
        };
        data.end_time = data.start_time + self.started.elapsed();

        if let Some(processor) = self.processor.take() {
            processor.enqueue(data);
        }
    }
}

impl Drop for Span {
    fn drop(&mut self) {
        self.finish();
    }
}
