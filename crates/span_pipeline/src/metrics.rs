use std::sync::atomic::{AtomicU64, Ordering};

/// Lock-free pipeline counters, shared by producers and the flush worker.
///
/// All counters use `Ordering::Relaxed`: they guard no other data and stale
/// reads are fine for observability. Accepted and dropped spans are counted by
/// the [`SpanBuffer`](crate::SpanBuffer) itself, under its lock.
#[derive(Debug, Default)]
pub struct PipelineMetrics {
    spans_rejected: AtomicU64,
    spans_exported: AtomicU64,
    batches_exported: AtomicU64,
    spans_failed: AtomicU64,
    batches_failed: AtomicU64,
    export_retries: AtomicU64,
    spans_unflushed: AtomicU64,
    flushes: AtomicU64,
}

impl PipelineMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub(crate) fn record_rejected(&self) {
        self.spans_rejected.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_export_success(&self, span_count: u64, retries: u32) {
        self.spans_exported.fetch_add(span_count, Ordering::Relaxed);
        self.batches_exported.fetch_add(1, Ordering::Relaxed);
        self.export_retries.fetch_add(retries as u64, Ordering::Relaxed);
    }

    pub(crate) fn record_export_failure(&self, span_count: u64, retries: u32) {
        self.spans_failed.fetch_add(span_count, Ordering::Relaxed);
        self.batches_failed.fetch_add(1, Ordering::Relaxed);
        self.export_retries.fetch_add(retries as u64, Ordering::Relaxed);
    }

    pub(crate) fn record_unflushed(&self, span_count: u64) {
        self.spans_unflushed.fetch_add(span_count, Ordering::Relaxed);
    }

    pub(crate) fn record_flush(&self) {
        self.flushes.fetch_add(1, Ordering::Relaxed);
    }

    pub fn spans_exported(&self) -> u64 {
        self.spans_exported.load(Ordering::Relaxed)
    }

    pub fn spans_failed(&self) -> u64 {
        self.spans_failed.load(Ordering::Relaxed)
    }

    /// Point-in-time copy of every counter. `spans_recorded` and
    /// `spans_dropped` come from the buffer.
    pub fn snapshot(&self, spans_recorded: u64, spans_dropped: u64) -> MetricsSnapshot {
        MetricsSnapshot {
            spans_recorded,
            spans_rejected: self.spans_rejected.load(Ordering::Relaxed),
            spans_dropped,
            spans_exported: self.spans_exported.load(Ordering::Relaxed),
            batches_exported: self.batches_exported.load(Ordering::Relaxed),
            spans_failed: self.spans_failed.load(Ordering::Relaxed),
            batches_failed: self.batches_failed.load(Ordering::Relaxed),
            export_retries: self.export_retries.load(Ordering::Relaxed),
            spans_unflushed: self.spans_unflushed.load(Ordering::Relaxed),
            flushes: self.flushes.load(Ordering::Relaxed),
        }
    }
}

/// Copy of the pipeline counters at one instant.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MetricsSnapshot {
    /// Spans accepted by `record` (including ones later evicted).
    pub spans_recorded: u64,
    /// Spans refused because the pipeline was shutting down.
    pub spans_rejected: u64,
    /// Spans evicted by the buffer's drop-oldest policy.
    pub spans_dropped: u64,
    pub spans_exported: u64,
    pub batches_exported: u64,
    /// Spans in batches dropped after exhausting retries.
    pub spans_failed: u64,
    pub batches_failed: u64,
    pub export_retries: u64,
    /// Spans still pending when a shutdown timed out.
    pub spans_unflushed: u64,
    pub flushes: u64,
}

impl MetricsSnapshot {
    /// Recorded spans not yet exported, dropped, failed or written off.
    pub fn spans_pending(&self) -> u64 {
        self.spans_recorded.saturating_sub(
            self.spans_exported + self.spans_dropped + self.spans_failed + self.spans_unflushed,
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_snapshot_and_pending() {
        let metrics = PipelineMetrics::new();
        metrics.record_rejected();
        metrics.record_export_success(4, 1);
        metrics.record_export_failure(2, 3);
        metrics.record_flush();

        let snap = metrics.snapshot(10, 1);
        assert_eq!(snap.spans_recorded, 10);
        assert_eq!(snap.spans_rejected, 1);
        assert_eq!(snap.spans_exported, 4);
        assert_eq!(snap.batches_exported, 1);
        assert_eq!(snap.spans_failed, 2);
        assert_eq!(snap.batches_failed, 1);
        assert_eq!(snap.export_retries, 4);
        assert_eq!(snap.flushes, 1);
        assert_eq!(snap.spans_pending(), 3);

        metrics.record_unflushed(3);
        assert_eq!(metrics.snapshot(10, 1).spans_pending(), 0);
    }
}
