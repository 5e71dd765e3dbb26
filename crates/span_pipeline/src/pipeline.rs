//! Pipeline controller: record spans, flush on size or delay, shut down with a
//! deadline.
//!
//! ```text
//!  producers ──record──► SpanBuffer ──drain──► worker task ──batches──► exporter
//!      │                      ▲                  │  ▲
//!      └──── wake (Notify) ───┼──────────────────┘  │ control (flush / shutdown)
//!                             │                     │
//!                      SpanPipeline ────────────────┘
//! ```
//!
//! Producers never wait on export: `record` is one short critical section in
//! the buffer plus an optional wake-up. One worker task owns the [`Batcher`]
//! and the exporter; it is the only code that awaits I/O.

use crate::batcher::{Batcher, FlushTrigger, instant_after};
use crate::buffer::{PushOutcome, SpanBuffer};
use crate::config::{ConfigError, ExporterKind, PipelineConfig};
use crate::exporter::{ConsoleExporter, ExporterShutdown, NullExporter, SpanExporter, SpanExporterBoxed};
use crate::metrics::{MetricsSnapshot, PipelineMetrics};
use crate::otlp_http::OtlpHttpExporter;
use crate::resource::Resource;
use crate::retry::{ExportOutcome, RetryPolicy, export_with_retry};
use crate::span::Span;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{Notify, mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::Instant;

/// Returned by [`SpanPipeline::record`] once shutdown has begun.
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum RecordError {
    #[error("pipeline is shut down; span rejected")]
    ShutDown,
}

/// Errors from constructing or driving a pipeline.
#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("invalid configuration: {0}")]
    Config(#[from] ConfigError),
    #[error("no tokio runtime available to run the export worker")]
    NoRuntime,
    #[error("export worker is no longer running")]
    WorkerGone,
    #[error("pipeline already shut down")]
    AlreadyShutDown,
    #[error("failed to build exporter client: {0}")]
    Client(String),
}

/// Result of a forced flush.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FlushReport {
    pub spans_exported: u64,
    pub spans_failed: u64,
}

/// How a shutdown ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShutdownOutcome {
    /// Every accepted span was exported, dropped by policy, or failed.
    Flushed,
    /// The deadline passed first; `unflushed_spans` were abandoned.
    TimedOut { unflushed_spans: u64 },
}

enum Control {
    Flush(oneshot::Sender<FlushReport>),
    Shutdown { deadline: Instant },
}

struct Shared {
    buffer: SpanBuffer,
    metrics: PipelineMetrics,
    wake: Notify,
    max_batch_size: usize,
    warned_drop: AtomicBool,
}

impl Shared {
    fn snapshot(&self) -> MetricsSnapshot {
        self.metrics
            .snapshot(self.buffer.accepted_count(), self.buffer.dropped_count())
    }
}

/// Cheap, clonable handle for recording spans from any thread.
#[derive(Clone)]
pub struct SpanRecorder {
    shared: Arc<Shared>,
}

impl SpanRecorder {
    /// Hands a finished span to the pipeline without waiting on export.
    ///
    /// A full buffer evicts its oldest span to make room; that is counted in
    /// `spans_dropped`, not reported as an error.
    pub fn record(&self, span: Span) -> Result<(), RecordError> {
        let shared = &*self.shared;
        let outcome = shared.buffer.push(span);
        let buffered = match outcome {
            PushOutcome::Accepted { buffered } => buffered,
            PushOutcome::Evicted { buffered } => {
                if !shared.warned_drop.swap(true, Ordering::Relaxed) {
                    tracing::warn!(
                        capacity = shared.buffer.capacity(),
                        "span buffer full, dropping oldest spans"
                    );
                }
                buffered
            }
            PushOutcome::Closed(_) => {
                shared.metrics.record_rejected();
                return Err(RecordError::ShutDown);
            }
        };

        // Wake the worker when a window opens or the size trigger is reached.
        if buffered == 1 || buffered >= shared.max_batch_size {
            shared.wake.notify_one();
        }
        Ok(())
    }
}

impl std::fmt::Debug for SpanRecorder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SpanRecorder")
            .field("buffered", &self.shared.buffer.len())
            .finish()
    }
}

/// Builds the exporter named by `config.exporter`.
pub fn build_exporter(config: &PipelineConfig) -> Result<Arc<dyn SpanExporterBoxed>, PipelineError> {
    Ok(match config.exporter {
        ExporterKind::Otlp => {
            let exporter = OtlpHttpExporter::new(&config.exporter_endpoint, config.export_timeout)
                .map_err(|e| PipelineError::Client(e.to_string()))?;
            Arc::new(exporter)
        }
        ExporterKind::Console => Arc::new(ConsoleExporter::new()),
        ExporterKind::Null => Arc::new(NullExporter::new()),
    })
}

/// Span-processing pipeline.
///
/// Must be created inside a tokio runtime; the export worker is spawned on it.
pub struct SpanPipeline {
    recorder: SpanRecorder,
    resource: Arc<Resource>,
    /// Shared with the worker; used directly only when a shutdown times out.
    exporter: Arc<dyn SpanExporterBoxed>,
    control: mpsc::UnboundedSender<Control>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl SpanPipeline {
    /// Validates `config`, then starts the worker with the exporter it names.
    pub fn from_config(config: PipelineConfig) -> Result<Self, PipelineError> {
        let config = config.validate()?;
        let exporter = build_exporter(&config)?;
        Self::new(config, exporter)
    }

    /// Starts a pipeline exporting through a concrete exporter.
    pub fn with_exporter<E: SpanExporter + 'static>(config: PipelineConfig, exporter: E) -> Result<Self, PipelineError> {
        Self::new(config, Arc::new(exporter))
    }

    /// Starts a pipeline exporting through `exporter`.
    pub fn new(config: PipelineConfig, exporter: Arc<dyn SpanExporterBoxed>) -> Result<Self, PipelineError> {
        let config = config.validate()?;
        let runtime = tokio::runtime::Handle::try_current().map_err(|_| PipelineError::NoRuntime)?;

        let shared = Arc::new(Shared {
            buffer: SpanBuffer::new(config.buffer_capacity),
            metrics: PipelineMetrics::new(),
            wake: Notify::new(),
            max_batch_size: config.max_batch_size,
            warned_drop: AtomicBool::new(false),
        });
        let resource = Arc::new(config.resource());
        let (control_tx, control_rx) = mpsc::unbounded_channel();

        let worker = Worker {
            shared: Arc::clone(&shared),
            batcher: Batcher::new(config.batch_config()),
            exporter: Arc::clone(&exporter),
            resource: Arc::clone(&resource),
            policy: config.retry_policy(),
            control: control_rx,
        };

        tracing::debug!(
            service = %config.service_name,
            exporter = worker.exporter.name(),
            max_batch_size = config.max_batch_size,
            max_batch_delay_ms = config.max_batch_delay.as_millis() as u64,
            buffer_capacity = config.buffer_capacity,
            "starting span pipeline"
        );
        let handle = runtime.spawn(worker.run());

        Ok(Self {
            recorder: SpanRecorder { shared },
            resource,
            exporter,
            control: control_tx,
            worker: Mutex::new(Some(handle)),
        })
    }

    /// Records a finished span. Never blocks on export.
    pub fn record(&self, span: Span) -> Result<(), RecordError> {
        self.recorder.record(span)
    }

    /// A clonable handle producers can own.
    pub fn recorder(&self) -> SpanRecorder {
        self.recorder.clone()
    }

    pub fn resource(&self) -> &Resource {
        &self.resource
    }

    pub fn metrics(&self) -> MetricsSnapshot {
        self.recorder.shared.snapshot()
    }

    /// Exports everything buffered now, regardless of size or delay.
    pub async fn force_flush(&self) -> Result<FlushReport, PipelineError> {
        if self.recorder.shared.buffer.is_closed() {
            return Err(PipelineError::AlreadyShutDown);
        }
        let (tx, rx) = oneshot::channel();
        self.control
            .send(Control::Flush(tx))
            .map_err(|_| PipelineError::WorkerGone)?;
        rx.await.map_err(|_| PipelineError::WorkerGone)
    }

    /// Stops accepting spans and flushes what was accepted, giving up after
    /// `timeout`. `Duration::MAX` waits for the flush however long it takes.
    ///
    /// Spans recorded after this call starts are rejected. On timeout the
    /// worker is aborted, the abandoned spans are counted in
    /// `spans_unflushed`, and the exporter gets a zero-budget shutdown.
    pub async fn shutdown(&self, timeout: Duration) -> Result<ShutdownOutcome, PipelineError> {
        let handle = self
            .worker
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        let Some(mut handle) = handle else {
            return Err(PipelineError::AlreadyShutDown);
        };

        let shared = &self.recorder.shared;
        let deadline = instant_after(Instant::now(), timeout);
        shared.buffer.close();
        if self.control.send(Control::Shutdown { deadline }).is_err() {
            return Err(PipelineError::WorkerGone);
        }

        match tokio::time::timeout_at(deadline, &mut handle).await {
            Ok(Ok(())) => {
                let snapshot = shared.snapshot();
                tracing::debug!(
                    exported = snapshot.spans_exported,
                    dropped = snapshot.spans_dropped,
                    failed = snapshot.spans_failed,
                    "span pipeline shut down"
                );
                Ok(ShutdownOutcome::Flushed)
            }
            Ok(Err(e)) => {
                tracing::error!(error = %e, "export worker panicked");
                Err(PipelineError::WorkerGone)
            }
            Err(_) => {
                handle.abort();
                let _ = handle.await;
                // Release whatever the worker never drained.
                drop(shared.buffer.drain_all());

                // The aborted worker never reached the exporter's shutdown.
                // Poll it once; an exporter that cannot stop at once is left.
                let exporter_outcome =
                    tokio::time::timeout(Duration::ZERO, self.exporter.shutdown_boxed(Duration::ZERO))
                        .await
                        .unwrap_or(ExporterShutdown::TimedOut);

                let snapshot = shared.snapshot();
                let unflushed = snapshot.spans_pending();
                shared.metrics.record_unflushed(unflushed);
                tracing::warn!(
                    timeout_ms = timeout.as_millis() as u64,
                    unflushed_spans = unflushed,
                    exporter = self.exporter.name(),
                    ?exporter_outcome,
                    "span pipeline shutdown timed out"
                );
                Ok(ShutdownOutcome::TimedOut {
                    unflushed_spans: unflushed,
                })
            }
        }
    }
}

impl Drop for SpanPipeline {
    fn drop(&mut self) {
        let handle = self
            .worker
            .get_mut()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(handle) = handle {
            let pending = self.recorder.shared.buffer.len();
            if pending > 0 {
                tracing::warn!(pending_spans = pending, "span pipeline dropped without shutdown");
            }
            self.recorder.shared.buffer.close();
            handle.abort();
        }
    }
}

impl std::fmt::Debug for SpanPipeline {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SpanPipeline")
            .field("buffer", &self.recorder.shared.buffer)
            .field("resource", &self.resource)
            .finish_non_exhaustive()
    }
}

struct Worker {
    shared: Arc<Shared>,
    batcher: Batcher,
    exporter: Arc<dyn SpanExporterBoxed>,
    resource: Arc<Resource>,
    policy: RetryPolicy,
    control: mpsc::UnboundedReceiver<Control>,
}

async fn sleep_until_deadline(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}

impl Worker {
    async fn run(mut self) {
        loop {
            self.flush_due().await;

            let deadline = self.batcher.deadline();
            tokio::select! {
                biased;

                msg = self.control.recv() => match msg {
                    Some(Control::Flush(reply)) => {
                        let report = self.flush(FlushTrigger::Forced).await;
                        let _ = reply.send(report);
                    }
                    Some(Control::Shutdown { deadline }) => {
                        self.finish(deadline).await;
                        return;
                    }
                    None => return,
                },
                () = self.shared.wake.notified() => {}
                () = sleep_until_deadline(deadline) => {}
            }
        }
    }

    /// Flushes while the size or delay trigger is due.
    async fn flush_due(&mut self) {
        loop {
            let buffered = self.shared.buffer.len();
            let window_start = self.shared.buffer.window_start();
            match self.batcher.poll(buffered, window_start, Instant::now()) {
                Some(trigger) => {
                    self.flush(trigger).await;
                }
                None => return,
            }
        }
    }

    async fn flush(&mut self, trigger: FlushTrigger) -> FlushReport {
        self.batcher.begin_flush();
        let drained = self.shared.buffer.drain_all();
        let mut report = FlushReport::default();

        if !drained.spans.is_empty() {
            self.shared.metrics.record_flush();
            let span_count = drained.spans.len();
            for batch in self.batcher.split(drained.spans) {
                let len = batch.len() as u64;
                match export_with_retry(&*self.exporter, &batch, &self.resource, &self.policy).await {
                    ExportOutcome::Exported { attempt } => {
                        self.shared.metrics.record_export_success(len, attempt);
                        report.spans_exported += len;
                    }
                    ExportOutcome::Failed { attempts, last_error } => {
                        self.shared
                            .metrics
                            .record_export_failure(len, attempts.saturating_sub(1));
                        report.spans_failed += len;
                        tracing::warn!(
                            exporter = self.exporter.name(),
                            spans = len,
                            attempts,
                            error = %last_error,
                            "dropping batch after failed export"
                        );
                    }
                }
            }
            tracing::debug!(
                trigger = trigger.as_str(),
                spans = span_count,
                exported = report.spans_exported,
                failed = report.spans_failed,
                "flush complete"
            );
        }

        self.batcher.finish_flush();
        report
    }

    async fn finish(&mut self, deadline: Instant) {
        self.flush(FlushTrigger::Shutdown).await;

        let remaining = deadline.saturating_duration_since(Instant::now());
        let outcome = self.exporter.shutdown_boxed(remaining).await;
        tracing::debug!(exporter = self.exporter.name(), ?outcome, "exporter shut down");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::exporter::{ExportError, InMemoryExporter};
    use crate::span::{AttributeValue, SpanBatch, SpanId};
    use std::sync::atomic::AtomicU32;

    fn config(max_batch_size: usize, delay_ms: u64, capacity: usize) -> PipelineConfig {
        PipelineConfig::builder()
            .with_service_name("pipeline-test")
            .with_max_batch_size(max_batch_size)
            .with_max_batch_delay(Duration::from_millis(delay_ms))
            .with_buffer_capacity(capacity)
            .with_retry_base_delay(Duration::from_millis(10))
            .with_retry_max_delay(Duration::from_millis(100))
            .with_export_timeout(Duration::from_secs(1))
            .build()
            .unwrap()
    }

    fn span(id: u64) -> Span {
        Span::builder(format!("op-{id}"))
            .with_span_id(SpanId::from_u64(id))
            .end()
    }

    fn ids(spans: &[Span]) -> Vec<u64> {
        spans.iter().map(|s| s.span_id().to_u64()).collect()
    }

    /// Fails the first `failures` calls with a transport error.
    struct FlakyExporter {
        inner: InMemoryExporter,
        failures: AtomicU32,
        calls: Arc<AtomicU32>,
    }

    impl SpanExporter for FlakyExporter {
        async fn export(&self, batch: &SpanBatch, resource: &Resource) -> Result<(), ExportError> {
            self.calls.fetch_add(1, Ordering::Relaxed);
            if self
                .failures
                .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |n| n.checked_sub(1))
                .is_ok()
            {
                return Err(ExportError::Transport("connection reset".into()));
            }
            self.inner.export(batch, resource).await
        }

        fn name(&self) -> &str {
            "flaky"
        }
    }

    /// Takes `delay` per export.
    struct SlowExporter {
        delay: Duration,
    }

    impl SpanExporter for SlowExporter {
        async fn export(&self, _batch: &SpanBatch, _resource: &Resource) -> Result<(), ExportError> {
            tokio::time::sleep(self.delay).await;
            Ok(())
        }

        fn name(&self) -> &str {
            "slow"
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_size_then_delay_trigger() {
        let exporter = InMemoryExporter::new();
        let pipeline = SpanPipeline::with_exporter(config(2, 100, 16), exporter.clone()).unwrap();

        pipeline.record(span(1)).unwrap();
        pipeline.record(span(2)).unwrap();
        tokio::time::sleep(Duration::from_millis(1)).await;
        assert_eq!(exporter.batch_sizes(), vec![2]);

        pipeline.record(span(3)).unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(exporter.batch_sizes(), vec![2], "delay trigger fired early");

        tokio::time::sleep(Duration::from_millis(60)).await;
        assert_eq!(exporter.batch_sizes(), vec![2, 1]);
        assert_eq!(ids(&exporter.spans()), vec![1, 2, 3]);

        let resource = exporter.last_resource().unwrap();
        assert_eq!(resource.service_name(), Some("pipeline-test"));

        assert_eq!(
            pipeline.shutdown(Duration::from_secs(1)).await.unwrap(),
            ShutdownOutcome::Flushed
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_overflow_drops_oldest() {
        let exporter = InMemoryExporter::new();
        let pipeline = SpanPipeline::with_exporter(config(3, 1_000, 3), exporter.clone()).unwrap();

        // The worker has not run yet, so all four pushes land before any drain.
        for id in 1..=4 {
            pipeline.record(span(id)).unwrap();
        }
        assert_eq!(pipeline.metrics().spans_dropped, 1);

        pipeline.shutdown(Duration::from_secs(1)).await.unwrap();
        assert_eq!(ids(&exporter.spans()), vec![2, 3, 4]);

        let metrics = pipeline.metrics();
        assert_eq!(metrics.spans_recorded, 4);
        assert_eq!(metrics.spans_exported, 3);
        assert_eq!(metrics.spans_pending(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_retry_then_success_exports_once() {
        let store = InMemoryExporter::new();
        let calls = Arc::new(AtomicU32::new(0));
        let exporter = FlakyExporter {
            inner: store.clone(),
            failures: AtomicU32::new(3),
            calls: Arc::clone(&calls),
        };
        let pipeline = SpanPipeline::with_exporter(config(1, 100, 16), exporter).unwrap();

        pipeline.record(span(7)).unwrap();
        tokio::time::sleep(Duration::from_secs(1)).await;

        assert_eq!(calls.load(Ordering::Relaxed), 4);
        assert_eq!(store.batch_sizes(), vec![1]);
        let metrics = pipeline.metrics();
        assert_eq!(metrics.spans_exported, 1);
        assert_eq!(metrics.export_retries, 3);
        assert_eq!(metrics.spans_failed, 0);
        pipeline.shutdown(Duration::from_secs(1)).await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_exhausted_retries_drop_batch_and_continue() {
        let store = InMemoryExporter::new();
        let exporter = FlakyExporter {
            inner: store.clone(),
            failures: AtomicU32::new(4),
            calls: Arc::new(AtomicU32::new(0)),
        };
        let pipeline = SpanPipeline::with_exporter(config(1, 100, 16), exporter).unwrap();

        pipeline.record(span(1)).unwrap();
        tokio::time::sleep(Duration::from_secs(1)).await;
        pipeline.record(span(2)).unwrap();
        tokio::time::sleep(Duration::from_secs(1)).await;

        assert_eq!(ids(&store.spans()), vec![2]);
        let metrics = pipeline.metrics();
        assert_eq!(metrics.spans_failed, 1);
        assert_eq!(metrics.batches_failed, 1);
        assert_eq!(metrics.spans_exported, 1);
        pipeline.shutdown(Duration::from_secs(1)).await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_force_flush_exports_partial_window() {
        let exporter = InMemoryExporter::new();
        let pipeline = SpanPipeline::with_exporter(config(100, 60_000, 256), exporter.clone()).unwrap();

        for id in 1..=5 {
            pipeline.record(span(id)).unwrap();
        }
        let report = pipeline.force_flush().await.unwrap();
        assert_eq!(
            report,
            FlushReport {
                spans_exported: 5,
                spans_failed: 0
            }
        );
        assert_eq!(exporter.batch_sizes(), vec![5]);
        pipeline.shutdown(Duration::from_secs(1)).await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_shutdown_flushes_and_rejects_later_records() {
        let exporter = InMemoryExporter::new();
        let pipeline = SpanPipeline::with_exporter(config(100, 60_000, 256), exporter.clone()).unwrap();
        let recorder = pipeline.recorder();

        for id in 1..=10 {
            recorder.record(span(id)).unwrap();
        }
        let outcome = pipeline.shutdown(Duration::from_secs(5)).await.unwrap();
        assert_eq!(outcome, ShutdownOutcome::Flushed);
        assert_eq!(exporter.exported_count(), 10);
        assert!(exporter.is_shut_down());

        assert_eq!(recorder.record(span(11)), Err(RecordError::ShutDown));
        assert_eq!(pipeline.record(span(12)), Err(RecordError::ShutDown));
        assert_eq!(pipeline.metrics().spans_rejected, 2);

        assert!(matches!(
            pipeline.shutdown(Duration::from_secs(1)).await,
            Err(PipelineError::AlreadyShutDown)
        ));
        assert!(matches!(pipeline.force_flush().await, Err(PipelineError::AlreadyShutDown)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_shutdown_timeout_reports_unflushed() {
        let exporter = SlowExporter {
            delay: Duration::from_secs(10),
        };
        let mut cfg = config(100, 60_000, 256);
        cfg.export_timeout = Duration::from_secs(60);
        let pipeline = SpanPipeline::with_exporter(cfg, exporter).unwrap();

        for id in 1..=7 {
            pipeline.record(span(id)).unwrap();
        }
        let started = Instant::now();
        let outcome = pipeline.shutdown(Duration::from_millis(200)).await.unwrap();
        assert!(started.elapsed() < Duration::from_secs(1));
        assert_eq!(outcome, ShutdownOutcome::TimedOut { unflushed_spans: 7 });

        let metrics = pipeline.metrics();
        assert_eq!(metrics.spans_unflushed, 7);
        assert_eq!(metrics.spans_pending(), 0);
    }

    /// Never completes an export; shutdown is forwarded to `inner`.
    struct StuckExporter {
        inner: InMemoryExporter,
    }

    impl SpanExporter for StuckExporter {
        async fn export(&self, _batch: &SpanBatch, _resource: &Resource) -> Result<(), ExportError> {
            std::future::pending().await
        }

        async fn shutdown(&self, timeout: Duration) -> ExporterShutdown {
            self.inner.shutdown(timeout).await
        }

        fn name(&self) -> &str {
            "stuck"
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_shutdown_timeout_still_shuts_exporter_down() {
        let store = InMemoryExporter::new();
        let exporter = StuckExporter { inner: store.clone() };
        let pipeline = SpanPipeline::with_exporter(config(2, 60_000, 16), exporter).unwrap();

        pipeline.record(span(1)).unwrap();
        pipeline.record(span(2)).unwrap();
        let outcome = pipeline.shutdown(Duration::from_millis(200)).await.unwrap();

        assert_eq!(outcome, ShutdownOutcome::TimedOut { unflushed_spans: 2 });
        assert!(store.is_shut_down());
    }

    #[tokio::test(start_paused = true)]
    async fn test_shutdown_without_time_limit() {
        let exporter = InMemoryExporter::new();
        let pipeline = SpanPipeline::with_exporter(config(100, 60_000, 256), exporter.clone()).unwrap();

        pipeline.record(span(1)).unwrap();
        let outcome = pipeline.shutdown(Duration::MAX).await.unwrap();

        assert_eq!(outcome, ShutdownOutcome::Flushed);
        assert_eq!(ids(&exporter.spans()), vec![1]);
        assert!(exporter.is_shut_down());
    }

    #[tokio::test(start_paused = true)]
    async fn test_unbounded_batch_delay_keeps_worker_alive() {
        let exporter = InMemoryExporter::new();
        let mut cfg = config(100, 60_000, 256);
        cfg.max_batch_delay = Duration::MAX;
        let pipeline = SpanPipeline::with_exporter(cfg, exporter.clone()).unwrap();

        pipeline.record(span(1)).unwrap();
        tokio::time::sleep(Duration::from_secs(3_600)).await;
        assert_eq!(exporter.exported_count(), 0, "delay trigger fired");

        let outcome = pipeline.shutdown(Duration::from_secs(1)).await.unwrap();
        assert_eq!(outcome, ShutdownOutcome::Flushed);
        let metrics = pipeline.metrics();
        assert_eq!(metrics.spans_recorded, 1);
        assert_eq!(metrics.spans_exported, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_extra_resource_attributes_reach_exporter() {
        let exporter = InMemoryExporter::new();
        let cfg = PipelineConfig::builder()
            .with_service_name("checkout")
            .with_resource_attribute("deployment.environment", "staging")
            .with_resource_attribute("host.cores", 8_i64)
            .with_max_batch_size(1)
            .build()
            .unwrap();
        let pipeline = SpanPipeline::with_exporter(cfg, exporter.clone()).unwrap();
        assert_eq!(
            pipeline.resource().get("deployment.environment"),
            Some(&AttributeValue::from("staging"))
        );

        pipeline.record(span(1)).unwrap();
        pipeline.shutdown(Duration::from_secs(1)).await.unwrap();

        let resource = exporter.last_resource().unwrap();
        assert_eq!(resource.service_name(), Some("checkout"));
        assert_eq!(
            resource.get("deployment.environment"),
            Some(&AttributeValue::from("staging"))
        );
        assert_eq!(resource.get("host.cores"), Some(&AttributeValue::Int(8)));
        assert_eq!(
            resource.get("telemetry.sdk.language"),
            Some(&AttributeValue::from("rust"))
        );
    }

    #[test]
    fn test_new_outside_runtime_fails() {
        let result = SpanPipeline::with_exporter(config(2, 100, 16), InMemoryExporter::new());
        assert!(matches!(result, Err(PipelineError::NoRuntime)));
    }

    #[test]
    fn test_invalid_config_rejected_before_spawn() {
        let mut cfg = config(2, 100, 16);
        cfg.service_name = String::new();
        let result = SpanPipeline::with_exporter(cfg, InMemoryExporter::new());
        assert!(matches!(
            result,
            Err(PipelineError::Config(ConfigError::EmptyServiceName))
        ));
    }

    #[tokio::test]
    async fn test_from_config_builds_named_exporter() {
        let cfg = PipelineConfig::builder()
            .with_exporter(ExporterKind::Null)
            .with_max_batch_size(4)
            .with_buffer_capacity(8)
            .build()
            .unwrap();
        let pipeline = SpanPipeline::from_config(cfg).unwrap();
        for id in 1..=4 {
            pipeline.record(span(id)).unwrap();
        }
        pipeline.shutdown(Duration::from_secs(1)).await.unwrap();
        assert_eq!(pipeline.metrics().spans_exported, 4);
    }
}
