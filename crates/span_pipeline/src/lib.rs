//! Span Pipeline
//!
//! An embeddable span-processing pipeline: services record finished spans
//! without waiting on I/O, a background worker batches them by size or age and
//! exports each batch with bounded retries, and shutdown flushes what is left
//! within a deadline.
//!
//! ```rust,ignore
//! use span_pipeline::{PipelineConfigBuilder, Span, SpanPipeline};
//! use std::time::Duration;
//!
//! let config = PipelineConfigBuilder::from_env()
//!     .with_service_name("checkout")
//!     .build()?;
//! let pipeline = SpanPipeline::from_config(config)?;
//!
//! pipeline.record(Span::builder("GET /cart").end())?;
//!
//! pipeline.shutdown(Duration::from_secs(5)).await?;
//! ```
//!
//! Overflow never blocks a producer: a full buffer evicts its oldest span and
//! counts it in [`MetricsSnapshot::spans_dropped`].
//!
//! # Rust 2024 Edition Features
//!
//! Exporters use native async fn in traits (no `#[async_trait]` macro);
//! [`SpanExporterBoxed`] is the object-safe form the pipeline stores.

pub mod batcher;
pub mod buffer;
pub mod config;
pub mod exporter;
pub mod metrics;
pub mod otlp_http;
pub mod pipeline;
pub mod resource;
pub mod retry;
pub mod span;

// Re-export main types
pub use batcher::{BatchConfig, Batcher, BatcherState, FlushTrigger};
pub use buffer::{PushOutcome, SpanBuffer};
pub use config::{ConfigError, ExporterKind, PipelineConfig, PipelineConfigBuilder};
pub use exporter::{
    ConsoleExporter, ExportError, ExporterShutdown, InMemoryExporter, NullExporter, SpanExporter,
    SpanExporterBoxed,
};
pub use metrics::MetricsSnapshot;
pub use otlp_http::OtlpHttpExporter;
pub use pipeline::{
    FlushReport, PipelineError, RecordError, ShutdownOutcome, SpanPipeline, SpanRecorder, build_exporter,
};
pub use resource::Resource;
pub use retry::{ExportOutcome, RetryPolicy, export_with_retry};
pub use span::{AttributeValue, Span, SpanBatch, SpanBuilder, SpanId, SpanKind, SpanStatus, TraceId};
