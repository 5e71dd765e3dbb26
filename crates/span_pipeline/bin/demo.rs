//! # Span Pipeline Demo
//!
//! Runs several producer tasks that record synthetic spans into one pipeline,
//! then shuts down with a deadline and prints the pipeline counters.
//!
//! Configuration comes from the standard `OTEL_*` environment variables,
//! overridden by command-line flags.
//!
//! ```bash
//! # Print batches to stdout
//! cargo run -p span_pipeline --bin demo -- --exporter console --producers 2 --spans 10
//!
//! # Export to a local collector
//! cargo run -p span_pipeline --bin demo -- --exporter otlp --endpoint http://localhost:4318
//!
//! # Unreliable backend: watch retries and dropped batches
//! cargo run -p span_pipeline --bin demo -- --simulate-failure-rate 0.3
//! ```

use anyhow::{Context, Result};
use clap::Parser;
use span_pipeline::{
    ExportError, ExporterKind, PipelineConfigBuilder, Resource, ShutdownOutcome, Span, SpanBatch, SpanExporter,
    SpanId, SpanKind, SpanPipeline, SpanRecorder, SpanStatus, TraceId,
};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "span-pipeline-demo")]
#[command(about = "Record synthetic spans through a span pipeline", long_about = None)]
struct Cli {
    /// Exporter: otlp, console or none
    #[arg(short, long)]
    exporter: Option<ExporterKind>,

    /// Collector endpoint for the otlp exporter
    #[arg(long)]
    endpoint: Option<String>,

    /// service.name resource attribute
    #[arg(long)]
    service_name: Option<String>,

    /// Concurrent producer tasks
    #[arg(short, long, default_value_t = 4)]
    producers: usize,

    /// Spans recorded by each producer
    #[arg(short, long, default_value_t = 100)]
    spans: usize,

    /// Pause between spans of one producer, in microseconds
    #[arg(long, default_value_t = 500)]
    interval_us: u64,

    #[arg(long)]
    max_batch_size: Option<usize>,

    /// Delay trigger in milliseconds
    #[arg(long)]
    max_batch_delay_ms: Option<u64>,

    #[arg(long)]
    buffer_capacity: Option<usize>,

    /// Deadline for the final flush in milliseconds
    #[arg(long, default_value_t = 5_000)]
    shutdown_timeout_ms: u64,

    /// Replace the configured exporter with a simulated backend failing this
    /// fraction of exports
    #[arg(long)]
    simulate_failure_rate: Option<f64>,
}

/// Backend stand-in with random failures and a fixed latency.
struct SimulatedBackendExporter {
    failure_rate: f64,
    latency: Duration,
    export_attempts: AtomicU64,
    failed_exports: AtomicU64,
}

impl SimulatedBackendExporter {
    fn new(failure_rate: f64, latency: Duration) -> Self {
        Self {
            failure_rate: failure_rate.clamp(0.0, 1.0),
            latency,
            export_attempts: AtomicU64::new(0),
            failed_exports: AtomicU64::new(0),
        }
    }
}

impl SpanExporter for SimulatedBackendExporter {
    async fn export(&self, batch: &SpanBatch, _resource: &Resource) -> Result<(), ExportError> {
        self.export_attempts.fetch_add(1, Ordering::Relaxed);
        tokio::time::sleep(self.latency).await;

        if rand::random::<f64>() < self.failure_rate {
            self.failed_exports.fetch_add(1, Ordering::Relaxed);
            return Err(ExportError::Transport(format!(
                "simulated backend failure (batch of {} spans)",
                batch.len()
            )));
        }
        Ok(())
    }

    fn name(&self) -> &str {
        "simulated"
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_target(false)
        .init();

    let cli = Cli::parse();

    let mut builder = PipelineConfigBuilder::from_env();
    if let Some(exporter) = cli.exporter {
        builder = builder.with_exporter(exporter);
    }
    if let Some(endpoint) = cli.endpoint.clone() {
        builder = builder.with_exporter_endpoint(endpoint);
    }
    if let Some(name) = cli.service_name.clone() {
        builder = builder.with_service_name(name);
    }
    if let Some(size) = cli.max_batch_size {
        builder = builder.with_max_batch_size(size);
    }
    if let Some(delay) = cli.max_batch_delay_ms {
        builder = builder.with_max_batch_delay(Duration::from_millis(delay));
    }
    if let Some(capacity) = cli.buffer_capacity {
        builder = builder.with_buffer_capacity(capacity);
    }
    let config = builder.build().context("invalid pipeline configuration")?;

    tracing::info!(
        service = %config.service_name,
        exporter = %config.exporter,
        endpoint = %config.exporter_endpoint,
        producers = cli.producers,
        spans_per_producer = cli.spans,
        "starting demo"
    );

    let simulated = cli
        .simulate_failure_rate
        .map(|rate| Arc::new(SimulatedBackendExporter::new(rate, Duration::from_millis(5))));
    let pipeline = match &simulated {
        Some(exporter) => SpanPipeline::new(config, Arc::clone(exporter) as _)?,
        None => SpanPipeline::from_config(config)?,
    };

    let started = Instant::now();
    let mut producers = tokio::task::JoinSet::new();
    for producer_id in 0..cli.producers {
        let recorder = pipeline.recorder();
        let interval = Duration::from_micros(cli.interval_us);
        producers.spawn(run_producer(producer_id, cli.spans, interval, recorder));
    }

    let interrupted = tokio::select! {
        () = async { while producers.join_next().await.is_some() {} } => false,
        res = tokio::signal::ctrl_c() => {
            res.context("failed to listen for ctrl-c")?;
            tracing::info!("interrupted, shutting down");
            producers.abort_all();
            true
        }
    };
    let generation_time = started.elapsed();

    let outcome = pipeline
        .shutdown(Duration::from_millis(cli.shutdown_timeout_ms))
        .await
        .context("pipeline shutdown failed")?;
    if let ShutdownOutcome::TimedOut { unflushed_spans } = outcome {
        tracing::warn!(unflushed_spans, "final flush did not finish in time");
    }

    let metrics = pipeline.metrics();
    println!();
    println!("Span pipeline demo results{}", if interrupted { " (interrupted)" } else { "" });
    println!("  generation time:   {generation_time:>12.2?}");
    println!("  total time:        {:>12.2?}", started.elapsed());
    println!("  spans recorded:    {:>12}", metrics.spans_recorded);
    println!("  spans exported:    {:>12}", metrics.spans_exported);
    println!("  spans dropped:     {:>12}", metrics.spans_dropped);
    println!("  spans failed:      {:>12}", metrics.spans_failed);
    println!("  spans unflushed:   {:>12}", metrics.spans_unflushed);
    println!("  batches exported:  {:>12}", metrics.batches_exported);
    println!("  batches failed:    {:>12}", metrics.batches_failed);
    println!("  export retries:    {:>12}", metrics.export_retries);
    if let Some(exporter) = simulated {
        println!(
            "  backend attempts:  {:>12} ({} failed)",
            exporter.export_attempts.load(Ordering::Relaxed),
            exporter.failed_exports.load(Ordering::Relaxed)
        );
    }

    Ok(())
}

async fn run_producer(producer_id: usize, span_count: usize, interval: Duration, recorder: SpanRecorder) {
    let operations = [
        ("http.request", SpanKind::Server),
        ("db.query", SpanKind::Client),
        ("cache.get", SpanKind::Client),
        ("queue.publish", SpanKind::Producer),
        ("process.data", SpanKind::Internal),
    ];

    let mut trace_id = TraceId::random();
    let mut parent: Option<SpanId> = None;

    for i in 0..span_count {
        // Five spans per trace: one root and a chain of children.
        if i % 5 == 0 {
            trace_id = TraceId::random();
            parent = None;
        }
        let (operation, kind) = operations[i % operations.len()];

        let mut builder = Span::builder(operation)
            .with_trace_id(trace_id)
            .with_kind(kind)
            .with_attribute("producer.id", producer_id as i64);
        if let Some(parent_id) = parent {
            builder = builder.with_parent(trace_id, parent_id);
        }

        match operation {
            "http.request" => {
                let status = if i % 10 == 9 { 500 } else { 200 };
                builder.set_attribute("http.method", "GET");
                builder.set_attribute("http.route", format!("/api/v1/resource/{i}"));
                builder.set_attribute("http.status_code", status as i64);
                if status >= 500 {
                    builder.set_status(SpanStatus::error("internal server error"));
                }
            }
            "db.query" => {
                builder.set_attribute("db.system", "postgresql");
                builder.set_attribute("db.statement", "SELECT * FROM users WHERE id = $1");
            }
            "cache.get" => {
                builder.set_attribute("cache.hit", i % 3 != 0);
            }
            _ => {}
        }

        tokio::time::sleep(interval).await;
        let span_id = builder.span_id();
        if recorder.record(builder.end()).is_err() {
            tracing::debug!(producer_id, "pipeline closed, producer stopping");
            return;
        }
        parent = Some(span_id);
    }
}
