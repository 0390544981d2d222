//! Error types for the telemetry pipeline.

use crate::exporter::ExportError;
use std::time::Duration;
use thiserror::Error;

/// A specialised Result type for pipeline operations.
pub type Result<T> = std::result::Result<T, PipelineError>;

/// Errors surfaced while building or shutting down the pipeline.
///
/// Export failures during normal operation are not errors; they are logged
/// and counted by the component that observed them.
#[non_exhaustive]
#[derive(Debug, Error)]
pub enum PipelineError {
    /// Configuration error.
    #[error("configuration error")]
    Config(#[source] Box<figment::Error>),

    /// Exporter construction failed.
    #[error(transparent)]
    Export(#[from] ExportError),

    /// Background tasks did not finish their final flush in time.
    #[error("shutdown did not complete within {0:?}")]
    ShutdownTimeout(Duration),

    /// A background task panicked or was aborted.
    #[error("background task failed: {0}")]
    Task(#[from] tokio::task::JoinError),
}

impl From<figment::Error> for PipelineError {
    fn from(err: figment::Error) -> Self {
        PipelineError::Config(Box::new(err))
    }
}
