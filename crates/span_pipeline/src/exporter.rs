use crate::resource::Resource;
use crate::span::{Span, SpanBatch, SpanStatus};
use std::fmt::Write as _;
use std::future::Future;
use std::io::Write;
use std::pin::Pin;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use thiserror::Error;

/// Error types for span export operations
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ExportError {
    /// Transport-layer error (connection refused, reset, DNS)
    #[error("transport error: {0}")]
    Transport(String),
    /// Backend answered with a non-success HTTP status
    #[error("backend returned HTTP {status}")]
    Http { status: u16 },
    /// Serialization error
    #[error("serialization error: {0}")]
    Serialization(String),
    /// Export operation timed out
    #[error("export operation timed out")]
    Timeout,
    /// The exporter was already shut down
    #[error("exporter is shut down")]
    ShutDown,
}

impl ExportError {
    /// Whether another attempt could succeed.
    ///
    /// Client errors other than 408 (timeout) and 429 (throttled) will fail the
    /// same way again, as will a batch that cannot be serialized.
    pub fn is_retryable(&self) -> bool {
        match self {
            ExportError::Transport(_) | ExportError::Timeout => true,
            ExportError::Http { status } => !(400..500).contains(status) || matches!(status, 408 | 429),
            ExportError::Serialization(_) | ExportError::ShutDown => false,
        }
    }
}

/// Outcome of an exporter shutdown.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExporterShutdown {
    Flushed,
    TimedOut,
}

/// Trait for exporting span batches to various backends.
///
/// Uses native async fn in traits instead of `#[async_trait]`. The batch is
/// lent for the duration of the call so a failed attempt can be retried
/// without cloning it.
///
/// # Note on Object Safety
///
/// This trait uses `impl Future` return types which are not object-safe.
/// For dynamic dispatch, use `Arc<dyn SpanExporterBoxed>`.
pub trait SpanExporter: Send + Sync {
    /// Exports a batch of spans tagged with `resource`.
    fn export(
        &self,
        batch: &SpanBatch,
        resource: &Resource,
    ) -> impl Future<Output = Result<(), ExportError>> + Send;

    /// Releases the exporter's resources. Called once, after the final flush.
    fn shutdown(&self, _timeout: Duration) -> impl Future<Output = ExporterShutdown> + Send {
        std::future::ready(ExporterShutdown::Flushed)
    }

    /// Returns the exporter name for debugging.
    fn name(&self) -> &str;
}

/// Object-safe version of SpanExporter for dynamic dispatch.
pub trait SpanExporterBoxed: Send + Sync {
    /// Exports a batch of spans (boxed future for object safety).
    fn export_boxed<'a>(
        &'a self,
        batch: &'a SpanBatch,
        resource: &'a Resource,
    ) -> Pin<Box<dyn Future<Output = Result<(), ExportError>> + Send + 'a>>;

    /// Shuts the exporter down (boxed future for object safety).
    fn shutdown_boxed(&self, timeout: Duration) -> Pin<Box<dyn Future<Output = ExporterShutdown> + Send + '_>>;

    /// Returns the exporter name for debugging.
    fn name(&self) -> &str;
}

/// Blanket implementation: any SpanExporter can be used as SpanExporterBoxed
impl<T: SpanExporter> SpanExporterBoxed for T {
    fn export_boxed<'a>(
        &'a self,
        batch: &'a SpanBatch,
        resource: &'a Resource,
    ) -> Pin<Box<dyn Future<Output = Result<(), ExportError>> + Send + 'a>> {
        Box::pin(self.export(batch, resource))
    }

    fn shutdown_boxed(&self, timeout: Duration) -> Pin<Box<dyn Future<Output = ExporterShutdown> + Send + '_>> {
        Box::pin(self.shutdown(timeout))
    }

    fn name(&self) -> &str {
        SpanExporter::name(self)
    }
}

/// Console sink: writes a human-readable line per span. Always succeeds.
///
/// Writes run on tokio's blocking pool; the writer lock keeps each batch's
/// lines together.
pub struct ConsoleExporter {
    writer: Arc<Mutex<Box<dyn Write + Send>>>,
}

impl ConsoleExporter {
    /// Creates a console exporter writing to stdout
    pub fn new() -> Self {
        Self::with_writer(std::io::stdout())
    }

    /// Creates a console exporter writing to `writer`
    pub fn with_writer<W: Write + Send + 'static>(writer: W) -> Self {
        Self {
            writer: Arc::new(Mutex::new(Box::new(writer))),
        }
    }

    fn render(batch: &SpanBatch, resource: &Resource) -> String {
        let mut out = String::new();
        let _ = write!(out, "resource");
        for (key, value) in resource.iter() {
            let _ = write!(out, " {}={}", key, value);
        }
        let _ = writeln!(out, " spans={}", batch.len());

        for span in batch.iter() {
            Self::render_span(&mut out, span);
        }
        out
    }

    fn render_span(out: &mut String, span: &Span) {
        let parent = span
            .parent_id()
            .map_or_else(|| "-".to_owned(), |p| p.to_string());
        let status = match span.status() {
            SpanStatus::Unset => "Unset".to_owned(),
            SpanStatus::Ok => "Ok".to_owned(),
            SpanStatus::Error { description } => format!("Error({:?})", description),
        };
        let _ = write!(
            out,
            "  span trace_id={} span_id={} parent_id={} name={:?} kind={:?} duration_ns={} status={}",
            span.trace_id(),
            span.span_id(),
            parent,
            span.name(),
            span.kind(),
            span.duration_nanos(),
            status
        );
        if !span.attributes().is_empty() {
            let _ = write!(out, " attributes={{");
            for (i, (key, value)) in span.attributes().iter().enumerate() {
                if i > 0 {
                    out.push_str(", ");
                }
                let _ = write!(out, "{}={}", key, value);
            }
            out.push('}');
        }
        out.push('\n');
    }
}

impl Default for ConsoleExporter {
    fn default() -> Self {
        Self::new()
    }
}

impl SpanExporter for ConsoleExporter {
    async fn export(&self, batch: &SpanBatch, resource: &Resource) -> Result<(), ExportError> {
        let text = Self::render(batch, resource);
        let writer = Arc::clone(&self.writer);
        let written = tokio::task::spawn_blocking(move || {
            let mut writer = writer.lock().unwrap_or_else(PoisonError::into_inner);
            writer.write_all(text.as_bytes()).and_then(|()| writer.flush())
        })
        .await;

        match written {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                tracing::warn!(error = %e, spans = batch.len(), "console exporter failed to write batch");
            }
            Err(e) => {
                tracing::warn!(error = %e, spans = batch.len(), "console write task failed");
            }
        }
        Ok(())
    }

    fn name(&self) -> &str {
        "console"
    }
}

/// Null exporter that discards all spans (for benchmarking)
pub struct NullExporter;

impl NullExporter {
    pub fn new() -> Self {
        Self
    }
}

impl Default for NullExporter {
    fn default() -> Self {
        Self::new()
    }
}

impl SpanExporter for NullExporter {
    async fn export(&self, _batch: &SpanBatch, _resource: &Resource) -> Result<(), ExportError> {
        Ok(())
    }

    fn name(&self) -> &str {
        "null"
    }
}

#[derive(Debug, Default)]
struct InMemoryState {
    batches: Vec<Vec<Span>>,
    resource: Option<Resource>,
    shut_down: bool,
}

/// Exporter that records every exported batch in memory.
///
/// Clones share storage, so a test can keep one handle and give the other to
/// the pipeline.
#[derive(Debug, Clone, Default)]
pub struct InMemoryExporter {
    state: Arc<Mutex<InMemoryState>>,
}

impl InMemoryExporter {
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> std::sync::MutexGuard<'_, InMemoryState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// All exported spans, in export order.
    pub fn spans(&self) -> Vec<Span> {
        self.state().batches.iter().flatten().cloned().collect()
    }

    /// Exported batches, in export order.
    pub fn batches(&self) -> Vec<Vec<Span>> {
        self.state().batches.clone()
    }

    pub fn batch_sizes(&self) -> Vec<usize> {
        self.state().batches.iter().map(Vec::len).collect()
    }

    pub fn exported_count(&self) -> usize {
        self.state().batches.iter().map(Vec::len).sum()
    }

    /// Resource attached to the most recent export.
    pub fn last_resource(&self) -> Option<Resource> {
        self.state().resource.clone()
    }

    pub fn is_shut_down(&self) -> bool {
        self.state().shut_down
    }

    pub fn reset(&self) {
        let mut state = self.state();
        state.batches.clear();
        state.resource = None;
    }
}

impl SpanExporter for InMemoryExporter {
    async fn export(&self, batch: &SpanBatch, resource: &Resource) -> Result<(), ExportError> {
        let mut state = self.state();
        if state.shut_down {
            return Err(ExportError::ShutDown);
        }
        state.batches.push(batch.spans.clone());
        state.resource = Some(resource.clone());
        Ok(())
    }

    async fn shutdown(&self, _timeout: Duration) -> ExporterShutdown {
        self.state().shut_down = true;
        ExporterShutdown::Flushed
    }

    fn name(&self) -> &str {
        "in_memory"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::span::{SpanId, SpanKind, TraceId};
    use std::sync::atomic::{AtomicBool, Ordering};

    #[derive(Clone, Default)]
    struct SharedBuf(Arc<Mutex<Vec<u8>>>);

    impl Write for SharedBuf {
        fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
            self.0.lock().unwrap().write(buf)
        }

        fn flush(&mut self) -> std::io::Result<()> {
            Ok(())
        }
    }

    struct BrokenPipe;

    impl Write for BrokenPipe {
        fn write(&mut self, _buf: &[u8]) -> std::io::Result<usize> {
            Err(std::io::Error::new(std::io::ErrorKind::BrokenPipe, "closed"))
        }

        fn flush(&mut self) -> std::io::Result<()> {
            Ok(())
        }
    }

    /// Blocks for `delay` on every write, then marks itself finished on flush.
    struct SlowWriter {
        delay: Duration,
        finished: Arc<AtomicBool>,
    }

    impl Write for SlowWriter {
        fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
            std::thread::sleep(self.delay);
            Ok(buf.len())
        }

        fn flush(&mut self) -> std::io::Result<()> {
            self.finished.store(true, Ordering::SeqCst);
            Ok(())
        }
    }

    fn make_test_batch(count: u64) -> SpanBatch {
        let mut batch = SpanBatch::new();
        for i in 1..=count {
            batch.add(
                Span::builder(format!("op-{}", i))
                    .with_trace_id(TraceId::from_u128(0xfeed))
                    .with_span_id(SpanId::from_u64(i))
                    .end(),
            );
        }
        batch
    }

    #[tokio::test]
    async fn test_console_exporter_renders_resource_and_spans() {
        let buf = SharedBuf::default();
        let exporter = ConsoleExporter::with_writer(buf.clone());

        let mut builder = Span::builder("GET /users")
            .with_parent(TraceId::from_u128(0xabc), SpanId::from_u64(0x1))
            .with_span_id(SpanId::from_u64(0x2))
            .with_kind(SpanKind::Server)
            .with_start_time(1_000)
            .with_attribute("http.status_code", 500_i64);
        builder.set_status(SpanStatus::error("boom"));
        let batch = SpanBatch::with_spans(vec![builder.end_at(4_000)]);

        exporter
            .export(&batch, &Resource::new("users-api"))
            .await
            .unwrap();

        let text = String::from_utf8(buf.0.lock().unwrap().clone()).unwrap();
        let mut lines = text.lines();
        let header = lines.next().unwrap();
        assert!(header.starts_with("resource"));
        assert!(header.contains("service.name=\"users-api\""));
        assert!(header.ends_with("spans=1"));

        let line = lines.next().unwrap();
        assert!(line.contains("trace_id=00000000000000000000000000000abc"));
        assert!(line.contains("parent_id=0000000000000001"));
        assert!(line.contains("name=\"GET /users\""));
        assert!(line.contains("kind=Server"));
        assert!(line.contains("duration_ns=3000"));
        assert!(line.contains("status=Error(\"boom\")"));
        assert!(line.contains("attributes={http.status_code=500}"));
    }

    #[tokio::test]
    async fn test_console_exporter_succeeds_on_write_failure() {
        let exporter = ConsoleExporter::with_writer(BrokenPipe);
        let result = exporter.export(&make_test_batch(3), &Resource::new("svc")).await;
        assert!(result.is_ok());
    }

    #[tokio::test]
    async fn test_console_write_does_not_stall_runtime() {
        let finished = Arc::new(AtomicBool::new(false));
        let exporter = ConsoleExporter::with_writer(SlowWriter {
            delay: Duration::from_millis(300),
            finished: Arc::clone(&finished),
        });
        let batch = make_test_batch(2);
        let resource = Resource::new("svc");

        // Single-threaded runtime: the timer only fires if the write is off it.
        let (result, finished_before_timer) = tokio::join!(exporter.export(&batch, &resource), async {
            tokio::time::sleep(Duration::from_millis(20)).await;
            finished.load(Ordering::SeqCst)
        });

        assert!(result.is_ok());
        assert!(!finished_before_timer);
        assert!(finished.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn test_null_exporter() {
        let exporter = NullExporter::new();
        let result = exporter.export(&make_test_batch(1000), &Resource::empty()).await;
        assert!(result.is_ok());
        assert_eq!(exporter.shutdown(Duration::ZERO).await, ExporterShutdown::Flushed);
    }

    #[tokio::test]
    async fn test_in_memory_exporter_records_and_refuses_after_shutdown() {
        let exporter = InMemoryExporter::new();
        let handle = exporter.clone();
        let resource = Resource::new("svc");

        exporter.export(&make_test_batch(3), &resource).await.unwrap();
        exporter.export(&make_test_batch(2), &resource).await.unwrap();
        assert_eq!(handle.batch_sizes(), vec![3, 2]);
        assert_eq!(handle.exported_count(), 5);
        assert_eq!(handle.last_resource(), Some(resource.clone()));

        exporter.shutdown(Duration::from_secs(1)).await;
        assert!(handle.is_shut_down());
        assert_eq!(
            exporter.export(&make_test_batch(1), &resource).await,
            Err(ExportError::ShutDown)
        );
    }

    #[tokio::test]
    async fn test_boxed_dispatch() {
        let exporter: Arc<dyn SpanExporterBoxed> = Arc::new(NullExporter::new());
        assert_eq!(exporter.name(), "null");
        let batch = make_test_batch(2);
        let resource = Resource::empty();
        assert!(exporter.export_boxed(&batch, &resource).await.is_ok());
    }

    #[test]
    fn test_retryable_classification() {
        assert!(ExportError::Transport("refused".into()).is_retryable());
        assert!(ExportError::Timeout.is_retryable());
        assert!(ExportError::Http { status: 503 }.is_retryable());
        assert!(ExportError::Http { status: 429 }.is_retryable());
        assert!(ExportError::Http { status: 408 }.is_retryable());
        assert!(!ExportError::Http { status: 400 }.is_retryable());
        assert!(!ExportError::Serialization("bad".into()).is_retryable());
        assert!(!ExportError::ShutDown.is_retryable());
    }
}
