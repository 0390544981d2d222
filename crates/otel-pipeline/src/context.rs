//! Trace identifiers and the explicit execution context.
//!
//! The active span is never looked up from thread-local or global state.
//! Callers carry a [`Context`] down the call chain and derive child contexts
//! from it with [`Context::with_span`], which keeps parent/child linkage
//! visible at every call site.

use crate::trace::Span;
use opentelemetry_sdk::trace::{IdGenerator, RandomIdGenerator};

pub use opentelemetry::trace::{SpanContext, SpanId, TraceFlags, TraceId, TraceState};

/// Returns a fresh trace id that is never [`TraceId::INVALID`].
pub(crate) fn new_trace_id(ids: &RandomIdGenerator) -> TraceId {
    loop {
        let id = ids.new_trace_id();
        if id != TraceId::INVALID {
            return id;
        }
    }
}

/// Returns a fresh span id that is never [`SpanId::INVALID`].
pub(crate) fn new_span_id(ids: &RandomIdGenerator) -> SpanId {
    loop {
        let id = ids.new_span_id();
        if id != SpanId::INVALID {
            return id;
        }
    }
}

/// Execution-context handle carrying the currently active span, if any.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Context {
    span: Option<SpanContext>,
}

impl Context {
    /// Creates a context with no active span.
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns a new context whose active span is `span`.
    pub fn with_span(&self, span: &Span) -> Self {
        self.with_span_context(span.span_context().clone())
    }

    /// Returns a new context whose active span is identified by `span_context`.
    ///
    /// An invalid span context leaves the new context without an active span.
    pub fn with_span_context(&self, span_context: SpanContext) -> Self {
        Self {
            span: span_context.is_valid().then_some(span_context),
        }
    }

    /// Returns the active span's context.
    pub fn span_context(&self) -> Option<&SpanContext> {
        self.span.as_ref()
    }

    /// Returns whether a span is active.
    pub fn has_active_span(&self) -> bool {
        self.span.is_some()
    }
}
