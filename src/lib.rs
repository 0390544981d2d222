//! OTel demo workspace - scenario tests for the instrumented demo service.
//!
//! This is a virtual package that provides workspace-level integration tests.
//! The actual functionality is provided by the workspace member crates:
//!
//! - `otel-pipeline`: trace, metric and log providers with batched OTLP/HTTP export
//! - `otel-demo`: HTTP service instrumented with the pipeline
