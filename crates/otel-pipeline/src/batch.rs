//! Bounded batching between record producers and an exporter.
//!
//! Producers call [`BatchProcessor::enqueue`], which never blocks beyond a
//! short mutex hold and never awaits. A background worker drains the queue
//! when the scheduled delay elapses or when the queue reaches the export
//! batch size, whichever comes first.
//!
//! When the queue is full the *incoming* record is dropped; records already
//! queued are kept. Once the worker has made its final drain the queue is
//! closed and every later record is dropped.

use crate::config::BatchConfig;
use crate::error::PipelineError;
use crate::exporter::{BatchedSignal, ExportResult, SharedExporter};
use crate::resource::ResourceDescriptor;
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;
use tokio::sync::{Notify, mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

const FLUSH_CHANNEL_CAPACITY: usize = 16;
const MIN_SCHEDULED_DELAY: Duration = Duration::from_millis(1);

/// A record type that can be batched and turned into an export request.
pub trait Exportable: Send + Sync + Sized + 'static {
    /// Builds one export request carrying `records` under `resource`.
    fn into_signal(records: Vec<Self>, resource: &ResourceDescriptor) -> BatchedSignal;
}

/// FIFO queue with a fixed capacity that rejects pushes when full or closed.
#[derive(Debug)]
pub(crate) struct BoundedQueue<T> {
    items: VecDeque<T>,
    capacity: usize,
    closed: bool,
}

impl<T> BoundedQueue<T> {
    pub(crate) fn new(capacity: usize) -> Self {
        Self {
            items: VecDeque::with_capacity(capacity.min(1024)),
            capacity,
            closed: false,
        }
    }

    /// Appends `item`, or hands it back if the queue is full or closed.
    pub(crate) fn push(&mut self, item: T) -> Result<(), T> {
        if self.closed || self.items.len() >= self.capacity {
            return Err(item);
        }
        self.items.push_back(item);
        Ok(())
    }

    /// Closes the queue if nothing is left in it. Returns whether it is
    /// closed.
    pub(crate) fn close_if_empty(&mut self) -> bool {
        if self.items.is_empty() {
            self.closed = true;
        }
        self.closed
    }

    pub(crate) fn is_closed(&self) -> bool {
        self.closed
    }

    /// Removes up to `max` records from the front.
    pub(crate) fn drain_batch(&mut self, max: usize) -> Vec<T> {
        let n = self.items.len().min(max);
        self.items.drain(..n).collect()
    }

    pub(crate) fn len(&self) -> usize {
        self.items.len()
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.items.is_empty()
    }
}

/// Counters maintained by a processor.
#[derive(Debug, Default)]
struct ProcessorStats {
    records_exported: AtomicU64,
    batches_exported: AtomicU64,
    export_failures: AtomicU64,
    records_dropped: AtomicU64,
}

/// Point-in-time copy of a processor's counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ProcessorStatsSnapshot {
    /// Records accepted by the exporter.
    pub records_exported: u64,
    /// Export requests accepted by the exporter.
    pub batches_exported: u64,
    /// Export requests that failed; their records are lost.
    pub export_failures: u64,
    /// Records rejected at enqueue because the queue was full or the
    /// processor was shut down.
    pub records_dropped: u64,
}

impl ProcessorStats {
    fn snapshot(&self) -> ProcessorStatsSnapshot {
        ProcessorStatsSnapshot {
            records_exported: self.records_exported.load(Ordering::Relaxed),
            batches_exported: self.batches_exported.load(Ordering::Relaxed),
            export_failures: self.export_failures.load(Ordering::Relaxed),
            records_dropped: self.records_dropped.load(Ordering::Relaxed),
        }
    }
}

/// State shared between producers and the worker.
struct Core<T> {
    name: &'static str,
    queue: Mutex<BoundedQueue<T>>,
    notify: Notify,
    stats: ProcessorStats,
    overflowing: AtomicBool,
    max_export_batch_size: usize,
}

/// Owner of the worker; dropping the last handle cancels it.
struct Handle<T> {
    core: Arc<Core<T>>,
    cancel: CancellationToken,
    flush_tx: mpsc::Sender<oneshot::Sender<()>>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl<T> Drop for Handle<T> {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

/// Batches records of type `T` and exports them in the background.
///
/// Cloning is cheap and every clone feeds the same queue. The worker stops,
/// after a final drain, when [`shutdown`](Self::shutdown) is called or the
/// last clone is dropped.
pub struct BatchProcessor<T: Exportable> {
    handle: Arc<Handle<T>>,
}

impl<T: Exportable> Clone for BatchProcessor<T> {
    fn clone(&self) -> Self {
        Self {
            handle: Arc::clone(&self.handle),
        }
    }
}

impl<T: Exportable> std::fmt::Debug for BatchProcessor<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BatchProcessor")
            .field("name", &self.handle.core.name)
            .field("pending", &self.pending())
            .finish()
    }
}

impl<T: Exportable> BatchProcessor<T> {
    /// Creates a processor and spawns its worker.
    ///
    /// # Panics
    ///
    /// Panics if called outside a Tokio runtime.
    pub fn new(
        name: &'static str,
        config: &BatchConfig,
        exporter: SharedExporter,
        resource: ResourceDescriptor,
    ) -> Self {
        let max_queue_size = config.max_queue_size.max(1);
        let max_export_batch_size = config.max_export_batch_size.clamp(1, max_queue_size);
        let scheduled_delay = config.scheduled_delay.max(MIN_SCHEDULED_DELAY);

        let core = Arc::new(Core {
            name,
            queue: Mutex::new(BoundedQueue::new(max_queue_size)),
            notify: Notify::new(),
            stats: ProcessorStats::default(),
            overflowing: AtomicBool::new(false),
            max_export_batch_size,
        });
        let cancel = CancellationToken::new();
        let (flush_tx, flush_rx) = mpsc::channel(FLUSH_CHANNEL_CAPACITY);

        let worker = Worker {
            core: Arc::clone(&core),
            exporter,
            resource,
            cancel: cancel.clone(),
            flush_rx,
            scheduled_delay,
        };
        let join = tokio::spawn(worker.run());

        Self {
            handle: Arc::new(Handle {
                core,
                cancel,
                flush_tx,
                worker: Mutex::new(Some(join)),
            }),
        }
    }

    /// Queues a record for export without waiting.
    ///
    /// Returns `false` if the record was dropped because the queue is full
    /// or the processor has been shut down.
    pub fn enqueue(&self, record: T) -> bool {
        let core = &self.handle.core;

        if self.handle.cancel.is_cancelled() {
            core.stats.records_dropped.fetch_add(1, Ordering::Relaxed);
            return false;
        }

        let pushed = {
            let mut queue = core.queue.lock();
            match queue.push(record) {
                Ok(()) => Ok(queue.len()),
                Err(_dropped) => Err(queue.is_closed()),
            }
        };

        match pushed {
            Ok(len) => {
                if len >= core.max_export_batch_size {
                    core.notify.notify_one();
                }
                true
            }
            Err(true) => {
                core.stats.records_dropped.fetch_add(1, Ordering::Relaxed);
                false
            }
            Err(false) => {
                core.stats.records_dropped.fetch_add(1, Ordering::Relaxed);
                if !core.overflowing.swap(true, Ordering::Relaxed) {
                    tracing::warn!(
                        target: "otel_pipeline",
                        processor = core.name,
                        "Queue full, dropping new records until it drains"
                    );
                }
                false
            }
        }
    }

    /// Returns the number of records waiting for export.
    pub fn pending(&self) -> usize {
        self.handle.core.queue.lock().len()
    }

    /// Returns the processor's counters.
    pub fn stats(&self) -> ProcessorStatsSnapshot {
        self.handle.core.stats.snapshot()
    }

    /// Returns the processor name used in diagnostics.
    pub fn name(&self) -> &'static str {
        self.handle.core.name
    }

    /// Exports everything queued and waits for the exports to complete.
    ///
    /// Returns immediately if the worker has already stopped.
    pub async fn force_flush(&self) {
        let (ack_tx, ack_rx) = oneshot::channel();
        if self.handle.flush_tx.send(ack_tx).await.is_err() {
            return;
        }
        let _ = ack_rx.await;
    }

    /// Signals the worker to stop after a final drain, without waiting.
    pub fn stop(&self) {
        self.handle.cancel.cancel();
    }

    /// Stops the worker after a final drain, waiting at most `timeout`.
    ///
    /// Records enqueued after this call are dropped. Calling it again is a
    /// no-op.
    ///
    /// # Errors
    ///
    /// Returns [`PipelineError::ShutdownTimeout`] if the final drain did not
    /// finish in time, or [`PipelineError::Task`] if the worker panicked.
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
                    processor = self.handle.core.name,
                    ?timeout,
                    "Final flush did not complete in time"
                );
                Err(PipelineError::ShutdownTimeout(timeout))
            }
        }
    }
}

struct Worker<T> {
    core: Arc<Core<T>>,
    exporter: SharedExporter,
    resource: ResourceDescriptor,
    cancel: CancellationToken,
    flush_rx: mpsc::Receiver<oneshot::Sender<()>>,
    scheduled_delay: Duration,
}

impl<T: Exportable> Worker<T> {
    async fn run(mut self) {
        let mut ticker =
            tokio::time::interval_at(Instant::now() + self.scheduled_delay, self.scheduled_delay);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                biased;

                _ = self.cancel.cancelled() => {
                    // Producers that passed the cancellation check may still
                    // push; drain until the queue can be closed empty.
                    loop {
                        self.export_all().await;
                        if self.core.queue.lock().close_if_empty() {
                            break;
                        }
                    }
                    tracing::debug!(
                        target: "otel_pipeline",
                        processor = self.core.name,
                        "Processor stopped"
                    );
                    break;
                }
                Some(ack) = self.flush_rx.recv() => {
                    self.export_all().await;
                    let _ = ack.send(());
                }
                _ = self.core.notify.notified() => {
                    self.export_full_batches().await;
                }
                _ = ticker.tick() => {
                    self.export_all().await;
                }
            }
        }
    }

    async fn export_full_batches(&self) {
        loop {
            let batch = {
                let mut queue = self.core.queue.lock();
                if queue.len() < self.core.max_export_batch_size {
                    break;
                }
                queue.drain_batch(self.core.max_export_batch_size)
            };
            self.export(batch).await;
        }
    }

    async fn export_all(&self) {
        loop {
            let batch = {
                let mut queue = self.core.queue.lock();
                if queue.is_empty() {
                    self.core.overflowing.store(false, Ordering::Relaxed);
                    break;
                }
                queue.drain_batch(self.core.max_export_batch_size)
            };
            self.export(batch).await;
        }
    }

    async fn export(&self, records: Vec<T>) {
        let count = records.len() as u64;
        let signal = T::into_signal(records, &self.resource);

        match self.exporter.export_boxed(signal).await {
            ExportResult::Success => {
                let stats = &self.core.stats;
                stats.records_exported.fetch_add(count, Ordering::Relaxed);
                stats.batches_exported.fetch_add(1, Ordering::Relaxed);
            }
            ExportResult::Failed => {
                self.core.stats.export_failures.fetch_add(1, Ordering::Relaxed);
                tracing::warn!(
                    target: "otel_pipeline",
                    processor = self.core.name,
                    exporter = self.exporter.name(),
                    records = count,
                    "Export failed, batch discarded"
                );
            }
            ExportResult::Skipped => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::exporter::{InMemoryExporter, SignalExporter};
    use opentelemetry_proto::tonic::collector::logs::v1::ExportLogsServiceRequest;
    use opentelemetry_proto::tonic::common::v1::{AnyValue, any_value};
    use opentelemetry_proto::tonic::logs::v1::{LogRecord, ResourceLogs, ScopeLogs};

    #[derive(Debug)]
    struct Record(u32);

    impl Exportable for Record {
        fn into_signal(records: Vec<Self>, resource: &ResourceDescriptor) -> BatchedSignal {
            let log_records = records
                .into_iter()
                .map(|r| LogRecord {
                    body: Some(AnyValue {
                        value: Some(any_value::Value::IntValue(i64::from(r.0))),
                    }),
                    ..Default::default()
                })
                .collect();
            BatchedSignal::Logs(ExportLogsServiceRequest {
                resource_logs: vec![ResourceLogs {
                    resource: Some(resource.proto().clone()),
                    scope_logs: vec![ScopeLogs {
                        log_records,
                        ..Default::default()
                    }],
                    ..Default::default()
                }],
            })
        }
    }

    fn exported_values(exporter: &InMemoryExporter) -> Vec<i64> {
        exporter
            .logs()
            .iter()
            .filter_map(|r| match r.body.as_ref()?.value.as_ref()? {
                any_value::Value::IntValue(v) => Some(*v),
                _ => None,
            })
            .collect()
    }

    fn config(queue: usize, batch: usize, delay: Duration) -> BatchConfig {
        BatchConfig {
            max_queue_size: queue,
            max_export_batch_size: batch,
            scheduled_delay: delay,
        }
    }

    fn processor(config: &BatchConfig, exporter: &InMemoryExporter) -> BatchProcessor<Record> {
        BatchProcessor::new(
            "test",
            config,
            Arc::new(exporter.clone()),
            ResourceDescriptor::default(),
        )
    }

    const LONG: Duration = Duration::from_secs(3600);

    #[test]
    fn test_bounded_queue_rejects_when_full() {
        let mut queue = BoundedQueue::new(2);
        assert!(queue.push(1).is_ok());
        assert!(queue.push(2).is_ok());
        assert_eq!(queue.push(3), Err(3));
        assert_eq!(queue.drain_batch(5), vec![1, 2]);
        assert!(queue.is_empty());
    }

    #[test]
    fn test_bounded_queue_closes_only_when_empty() {
        let mut queue = BoundedQueue::new(4);
        queue.push(1).unwrap();
        assert!(!queue.close_if_empty());
        assert!(queue.push(2).is_ok());

        queue.drain_batch(4);
        assert!(queue.close_if_empty());
        assert_eq!(queue.push(3), Err(3));
        assert!(queue.is_empty());
    }

    #[tokio::test]
    async fn test_overflow_keeps_oldest_records() {
        let exporter = InMemoryExporter::new();
        let processor = processor(&config(5, 100, LONG), &exporter);

        let accepted = (0..8).filter(|i| processor.enqueue(Record(*i))).count();

        assert_eq!(accepted, 5);
        assert_eq!(processor.pending(), 5);
        assert_eq!(processor.stats().records_dropped, 3);

        processor.force_flush().await;
        assert_eq!(exported_values(&exporter), vec![0, 1, 2, 3, 4]);
    }

    #[tokio::test]
    async fn test_size_threshold_triggers_export() {
        let exporter = InMemoryExporter::new();
        let processor = processor(&config(100, 3, LONG), &exporter);

        for i in 0..3 {
            processor.enqueue(Record(i));
        }

        tokio::time::timeout(Duration::from_secs(5), async {
            while exporter.batches().is_empty() {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap();

        assert_eq!(exported_values(&exporter), vec![0, 1, 2]);
        assert_eq!(processor.pending(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_scheduled_delay_triggers_export() {
        let exporter = InMemoryExporter::new();
        let processor = processor(&config(100, 50, Duration::from_secs(5)), &exporter);

        processor.enqueue(Record(7));
        tokio::time::sleep(Duration::from_secs(1)).await;
        assert!(exporter.batches().is_empty());

        tokio::time::sleep(Duration::from_secs(5)).await;
        assert_eq!(exported_values(&exporter), vec![7]);
    }

    #[tokio::test]
    async fn test_force_flush_splits_into_batches() {
        let exporter = InMemoryExporter::new();
        let processor = processor(&config(100, 4, LONG), &exporter);

        {
            let mut queue = processor.handle.core.queue.lock();
            for i in 0..10 {
                queue.push(Record(i)).unwrap();
            }
        }
        processor.force_flush().await;

        let sizes: Vec<usize> = exporter.batches().iter().map(|b| b.item_count()).collect();
        assert_eq!(sizes, vec![4, 4, 2]);
        assert_eq!(processor.stats().records_exported, 10);
        assert_eq!(processor.stats().batches_exported, 3);
    }

    #[tokio::test]
    async fn test_export_failure_is_counted_and_processing_continues() {
        let exporter = InMemoryExporter::new();
        let processor = processor(&config(100, 50, LONG), &exporter);

        exporter.set_failing(true);
        processor.enqueue(Record(1));
        processor.force_flush().await;
        assert_eq!(processor.stats().export_failures, 1);
        assert_eq!(processor.pending(), 0);

        exporter.set_failing(false);
        processor.enqueue(Record(2));
        processor.force_flush().await;
        assert_eq!(exported_values(&exporter), vec![2]);
        assert_eq!(processor.stats().records_exported, 1);
    }

    #[tokio::test]
    async fn test_shutdown_drains_and_rejects_new_records() {
        let exporter = InMemoryExporter::new();
        let processor = processor(&config(100, 50, LONG), &exporter);

        processor.enqueue(Record(1));
        processor.enqueue(Record(2));
        processor.shutdown(Duration::from_secs(5)).await.unwrap();

        assert_eq!(exported_values(&exporter), vec![1, 2]);
        assert!(!processor.enqueue(Record(3)));
        assert_eq!(processor.stats().records_dropped, 1);

        processor.shutdown(Duration::from_secs(5)).await.unwrap();
        processor.force_flush().await;
    }

    #[tokio::test]
    async fn test_push_after_final_drain_is_rejected() {
        let exporter = InMemoryExporter::new();
        let processor = processor(&config(100, 50, LONG), &exporter);

        processor.shutdown(Duration::from_secs(5)).await.unwrap();
        assert!(processor.handle.core.queue.lock().is_closed());

        // A producer that checked the cancellation token before shutdown.
        let late = processor.handle.core.queue.lock().push(Record(1));
        assert!(late.is_err());
        assert_eq!(processor.pending(), 0);
    }

    #[tokio::test]
    async fn test_enqueue_into_closed_queue_counts_drop() {
        let exporter = InMemoryExporter::new();
        let processor = processor(&config(100, 50, LONG), &exporter);

        assert!(processor.handle.core.queue.lock().close_if_empty());
        assert!(!processor.handle.cancel.is_cancelled());

        assert!(!processor.enqueue(Record(1)));
        assert_eq!(processor.stats().records_dropped, 1);
        assert_eq!(processor.pending(), 0);
    }

    struct StalledExporter;

    impl SignalExporter for StalledExporter {
        async fn export(&self, _batch: BatchedSignal) -> ExportResult {
            std::future::pending().await
        }

        fn name(&self) -> &str {
            "stalled"
        }
    }

    #[tokio::test]
    async fn test_shutdown_is_bounded_by_timeout() {
        let processor: BatchProcessor<Record> = BatchProcessor::new(
            "test",
            &config(100, 50, LONG),
            Arc::new(StalledExporter),
            ResourceDescriptor::default(),
        );
        processor.enqueue(Record(1));

        let timeout = Duration::from_millis(200);
        let started = std::time::Instant::now();
        let result = processor.shutdown(timeout).await;
        let elapsed = started.elapsed();

        assert!(
            matches!(result, Err(PipelineError::ShutdownTimeout(t)) if t == timeout),
            "unexpected result {result:?}"
        );
        assert!(elapsed >= timeout);
        assert!(elapsed < Duration::from_secs(2), "took {elapsed:?}");

        assert!(!processor.enqueue(Record(2)));
        processor.shutdown(timeout).await.unwrap();
    }

    #[tokio::test]
    async fn test_drop_triggers_final_export() {
        let exporter = InMemoryExporter::new();
        let processor = processor(&config(100, 50, LONG), &exporter);

        processor.enqueue(Record(9));
        drop(processor);

        tokio::time::timeout(Duration::from_secs(5), async {
            while exporter.batches().is_empty() {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap();

        assert_eq!(exported_values(&exporter), vec![9]);
    }
}
