//! Periodic metric collection and export.
//!
//! A background task collects every instrument of a [`MeterProvider`] on a
//! fixed interval and exports the snapshot. Each cycle is independent: a
//! failed export is logged and counted, and the next tick proceeds as usual.

use crate::conversion::metrics_to_request;
use crate::error::PipelineError;
use crate::exporter::{BatchedSignal, ExportResult, SharedExporter};
use crate::metrics::MeterProvider;
use crate::resource::ResourceDescriptor;
use parking_lot::Mutex;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

const MIN_INTERVAL: Duration = Duration::from_millis(1);

#[derive(Debug, Default)]
struct ReaderStats {
    exports: AtomicU64,
    export_failures: AtomicU64,
}

/// Point-in-time copy of a reader's counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReaderStatsSnapshot {
    /// Snapshots accepted by the exporter.
    pub exports: u64,
    /// Snapshots the exporter failed to deliver.
    pub export_failures: u64,
}

struct Handle {
    stats: Arc<ReaderStats>,
    cancel: CancellationToken,
    flush_tx: mpsc::Sender<oneshot::Sender<()>>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl Drop for Handle {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

/// Collects and exports metrics on a fixed interval.
#[derive(Clone)]
pub struct PeriodicReader {
    handle: Arc<Handle>,
}

impl std::fmt::Debug for PeriodicReader {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PeriodicReader")
            .field("stats", &self.stats())
            .finish()
    }
}

impl PeriodicReader {
    /// Spawns the collection task. The first collection happens one
    /// `interval` after creation.
    ///
    /// # Panics
    ///
    /// Panics if called outside a Tokio runtime.
    pub fn new(
        provider: MeterProvider,
        exporter: SharedExporter,
        resource: ResourceDescriptor,
        interval: Duration,
    ) -> Self {
        let stats = Arc::new(ReaderStats::default());
        let cancel = CancellationToken::new();
        let (flush_tx, flush_rx) = mpsc::channel(16);

        let worker = Worker {
            provider,
            exporter,
            resource,
            stats: Arc::clone(&stats),
            cancel: cancel.clone(),
            flush_rx,
            interval: interval.max(MIN_INTERVAL),
        };
        let join = tokio::spawn(worker.run());

        Self {
            handle: Arc::new(Handle {
                stats,
                cancel,
                flush_tx,
                worker: Mutex::new(Some(join)),
            }),
        }
    }

    /// Returns the reader's counters.
    pub fn stats(&self) -> ReaderStatsSnapshot {
        ReaderStatsSnapshot {
            exports: self.handle.stats.exports.load(Ordering::Relaxed),
            export_failures: self.handle.stats.export_failures.load(Ordering::Relaxed),
        }
    }

    /// Collects and exports now, waiting for the export to finish.
    pub async fn force_flush(&self) {
        let (ack_tx, ack_rx) = oneshot::channel();
        if self.handle.flush_tx.send(ack_tx).await.is_err() {
            return;
        }
        let _ = ack_rx.await;
    }

    /// Signals the task to stop after a final collection, without waiting.
    pub fn stop(&self) {
        self.handle.cancel.cancel();
    }

    /// Stops the task after a final collection, waiting at most `timeout`.
    ///
    /// # Errors
    ///
    /// Returns [`PipelineError::ShutdownTimeout`] if the final export did
    /// not finish in time.
    pub async fn shutdown(&self, timeout: Duration) -> Result<(), PipelineError> {
        self.handle.cancel.cancel();

        let Some(join) = self.handle.worker.lock().take() else {
            return Ok(());
        };

        match tokio::time::timeout(timeout, join).await {
            Ok(result) => result.map_err(PipelineError::from),
            Err(_) => {
                tracing::warn!(
                    target: "otel_pipeline",
                    ?timeout,
                    "Final metric export did not complete in time"
                );
                Err(PipelineError::ShutdownTimeout(timeout))
            }
        }
    }
}

struct Worker {
    provider: MeterProvider,
    exporter: SharedExporter,
    resource: ResourceDescriptor,
    stats: Arc<ReaderStats>,
    cancel: CancellationToken,
    flush_rx: mpsc::Receiver<oneshot::Sender<()>>,
    interval: Duration,
}

impl Worker {
    async fn run(mut self) {
        let mut ticker = tokio::time::interval_at(Instant::now() + self.interval, self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                biased;

                _ = self.cancel.cancelled() => {
                    self.collect_and_export().await;
                    tracing::debug!(target: "otel_pipeline", "Metric reader stopped");
                    break;
                }
                Some(ack) = self.flush_rx.recv() => {
                    self.collect_and_export().await;
                    let _ = ack.send(());
                }
                _ = ticker.tick() => {
                    self.collect_and_export().await;
                }
            }
        }
    }

    async fn collect_and_export(&self) {
        let metrics = self.provider.collect();
        if metrics.is_empty() {
            return;
        }

        let count = metrics.len();
        let request = metrics_to_request(metrics, &self.resource);

        match self
            .exporter
            .export_boxed(BatchedSignal::Metrics(request))
            .await
        {
            ExportResult::Success => {
                self.stats.exports.fetch_add(1, Ordering::Relaxed);
            }
            ExportResult::Failed => {
                self.stats.export_failures.fetch_add(1, Ordering::Relaxed);
                tracing::warn!(
                    target: "otel_pipeline",
                    exporter = self.exporter.name(),
                    metrics = count,
                    "Metric export failed, snapshot discarded"
                );
            }
            ExportResult::Skipped => {}
        }
    }
}
