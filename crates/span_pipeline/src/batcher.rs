//! Batcher - pure flush-decision state machine
//!
//! The batcher owns no buffer, exporter or task. It is told how many spans are
//! buffered and when the current accumulation window opened, and answers
//! whether a flush is due and when to look again. The worker in
//! [`pipeline`](crate::pipeline) supplies the concurrency around it.
//!
//! ```text
//!        first span            count >= max_batch_size
//!  Idle ───────────► Accumulating ──────────────────────► Flushing
//!   ▲                    │        or max_batch_delay elapsed   │
//!   │                    │                                     │
//!   └────────────────────┴───── buffer empty / flush done ◄────┘
//! ```

use crate::span::{Span, SpanBatch};
use std::time::Duration;
use tokio::time::Instant;

/// Roughly 30 years, the same horizon tokio uses for a timer that never fires.
const FAR_FUTURE: Duration = Duration::from_secs(86_400 * 365 * 30);

/// `start + delay`, saturating to a far-future instant instead of overflowing.
pub(crate) fn instant_after(start: Instant, delay: Duration) -> Instant {
    start
        .checked_add(delay)
        .unwrap_or_else(|| start + FAR_FUTURE)
}

/// Flush-relevant settings, taken from [`PipelineConfig`](crate::PipelineConfig).
#[derive(Debug, Clone, Copy)]
pub struct BatchConfig {
    /// Maximum number of spans per batch; reaching it triggers a flush.
    pub max_batch_size: usize,
    /// Maximum time a span waits in an accumulation window.
    pub max_batch_delay: Duration,
}

impl Default for BatchConfig {
    fn default() -> Self {
        Self {
            max_batch_size: 512,
            max_batch_delay: Duration::from_secs(5),
        }
    }
}

/// Batcher lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BatcherState {
    /// Nothing buffered, no window open.
    Idle,
    /// Spans are buffered; the window opened at `since`.
    Accumulating { since: Instant },
    /// A flush is in progress.
    Flushing,
}

/// Why a flush started.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlushTrigger {
    /// Buffered count reached `max_batch_size`.
    Size,
    /// `max_batch_delay` elapsed since the window opened.
    Delay,
    /// Explicit `force_flush`.
    Forced,
    /// Final flush during shutdown.
    Shutdown,
}

impl FlushTrigger {
    pub fn as_str(self) -> &'static str {
        match self {
            FlushTrigger::Size => "size",
            FlushTrigger::Delay => "delay",
            FlushTrigger::Forced => "forced",
            FlushTrigger::Shutdown => "shutdown",
        }
    }
}

/// Pure batching state machine.
#[derive(Debug)]
pub struct Batcher {
    config: BatchConfig,
    state: BatcherState,
}

impl Batcher {
    pub fn new(config: BatchConfig) -> Self {
        Self {
            config: BatchConfig {
                max_batch_size: config.max_batch_size.max(1),
                ..config
            },
            state: BatcherState::Idle,
        }
    }

    pub fn state(&self) -> BatcherState {
        self.state
    }

    pub fn config(&self) -> &BatchConfig {
        &self.config
    }

    /// Observes the buffer and decides whether a flush is due.
    ///
    /// `window_start` is the instant the buffer's current accumulation window
    /// opened. Returns the trigger and moves to `Flushing` when a flush is due.
    pub fn poll(&mut self, buffered: usize, window_start: Option<Instant>, now: Instant) -> Option<FlushTrigger> {
        if self.state == BatcherState::Flushing {
            return None;
        }
        if buffered == 0 {
            self.state = BatcherState::Idle;
            return None;
        }

        let since = match self.state {
            BatcherState::Accumulating { since } => since,
            _ => window_start.unwrap_or(now),
        };
        self.state = BatcherState::Accumulating { since };

        let trigger = if buffered >= self.config.max_batch_size {
            Some(FlushTrigger::Size)
        } else if now.saturating_duration_since(since) >= self.config.max_batch_delay {
            Some(FlushTrigger::Delay)
        } else {
            None
        };

        if trigger.is_some() {
            self.state = BatcherState::Flushing;
        }
        trigger
    }

    /// Enters `Flushing` regardless of thresholds (forced or shutdown flush).
    pub fn begin_flush(&mut self) {
        self.state = BatcherState::Flushing;
    }

    /// Leaves `Flushing`. The next window starts with the next observed span.
    pub fn finish_flush(&mut self) {
        self.state = BatcherState::Idle;
    }

    /// When the delay trigger fires for the current window, if one is open.
    pub fn deadline(&self) -> Option<Instant> {
        match self.state {
            BatcherState::Accumulating { since } => Some(instant_after(since, self.config.max_batch_delay)),
            _ => None,
        }
    }

    /// Splits drained spans into batches of at most `max_batch_size`, keeping order.
    pub fn split(&self, spans: Vec<Span>) -> Vec<SpanBatch> {
        let max = self.config.max_batch_size;
        let mut batches = Vec::with_capacity(spans.len().div_ceil(max));
        let mut current = Vec::with_capacity(max.min(spans.len()));

        for span in spans {
            current.push(span);
            if current.len() == max {
                batches.push(SpanBatch::with_spans(std::mem::take(&mut current)));
            }
        }
        if !current.is_empty() {
            batches.push(SpanBatch::with_spans(current));
        }

        debug_assert!(batches.iter().all(|b| !b.is_empty() && b.len() <= max));
        batches
    }
}
