//! Fixed-capacity span buffer with a drop-oldest overflow policy.
//!
//! Many producers push, a single worker drains. The only critical section is
//! the push/drain itself: one mutex around a `VecDeque`, never held across I/O.
//! The accepted and dropped counters are bumped while the lock is held, so once
//! a caller has seen the buffer closed and drained, both are final. They are
//! atomics so metrics reads never contend with producers.

use crate::span::Span;
use crossbeam_utils::CachePadded;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};
use tokio::time::Instant;

/// Result of [`SpanBuffer::push`].
#[derive(Debug)]
pub enum PushOutcome {
    /// The span was buffered; `buffered` is the length after the push.
    Accepted { buffered: usize },
    /// The buffer was full: the oldest span was dropped to make room.
    Evicted { buffered: usize },
    /// The buffer is closed; the span is handed back untouched.
    Closed(Span),
}

impl PushOutcome {
    /// Buffer length after the push, or `None` if the push was refused.
    pub fn buffered(&self) -> Option<usize> {
        match self {
            PushOutcome::Accepted { buffered } | PushOutcome::Evicted { buffered } => Some(*buffered),
            PushOutcome::Closed(_) => None,
        }
    }
}

/// Everything removed by one [`SpanBuffer::drain_all`].
#[derive(Debug, Default)]
pub struct Drained {
    /// Spans in insertion order.
    pub spans: Vec<Span>,
    /// When the first of the drained spans' accumulation window opened.
    pub window_start: Option<Instant>,
}

struct Inner {
    spans: VecDeque<Span>,
    window_start: Option<Instant>,
    closed: bool,
}

/// Bounded MPSC span buffer.
pub struct SpanBuffer {
    inner: Mutex<Inner>,
    capacity: usize,
    accepted: CachePadded<AtomicU64>,
    dropped: CachePadded<AtomicU64>,
    closed: AtomicBool,
}

impl SpanBuffer {
    /// Creates a buffer holding at most `capacity` spans (minimum 1).
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            inner: Mutex::new(Inner {
                spans: VecDeque::with_capacity(capacity),
                window_start: None,
                closed: false,
            }),
            capacity,
            accepted: CachePadded::new(AtomicU64::new(0)),
            dropped: CachePadded::new(AtomicU64::new(0)),
            closed: AtomicBool::new(false),
        }
    }

    // The buffer is consistent after every statement that touches it, so a
    // panic elsewhere while the lock was held leaves nothing half-written.
    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Pushes a finished span. Never blocks beyond the critical section.
    pub fn push(&self, span: Span) -> PushOutcome {
        let evicted;
        let outcome = {
            let mut inner = self.lock();
            if inner.closed {
                return PushOutcome::Closed(span);
            }
            if inner.spans.is_empty() {
                inner.window_start = Some(Instant::now());
            }
            evicted = if inner.spans.len() >= self.capacity {
                inner.spans.pop_front()
            } else {
                None
            };
            inner.spans.push_back(span);
            self.accepted.fetch_add(1, Ordering::Relaxed);
            if evicted.is_some() {
                self.dropped.fetch_add(1, Ordering::Relaxed);
            }

            debug_assert!(
                inner.spans.len() <= self.capacity,
                "buffer holds {} spans, capacity {}",
                inner.spans.len(),
                self.capacity
            );

            let buffered = inner.spans.len();
            if evicted.is_some() {
                PushOutcome::Evicted { buffered }
            } else {
                PushOutcome::Accepted { buffered }
            }
        };

        // Drop the evicted span outside the lock.
        drop(evicted);
        outcome
    }

    /// Atomically removes and returns all buffered spans, resetting the buffer.
    pub fn drain_all(&self) -> Drained {
        let mut inner = self.lock();
        let window_start = inner.window_start.take();
        let spans: Vec<Span> = inner.spans.drain(..).collect();
        Drained { spans, window_start }
    }

    /// Stops accepting spans. Everything already accepted stays drainable.
    pub fn close(&self) {
        let mut inner = self.lock();
        inner.closed = true;
        self.closed.store(true, Ordering::Release);
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Number of spans currently buffered.
    pub fn len(&self) -> usize {
        self.lock().spans.len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().spans.is_empty()
    }

    /// Start of the current accumulation window, if any span is buffered.
    pub fn window_start(&self) -> Option<Instant> {
        self.lock().window_start
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Spans accepted by `push` since creation, including ones later evicted.
    pub fn accepted_count(&self) -> u64 {
        self.accepted.load(Ordering::Relaxed)
    }

    /// Spans evicted by the drop-oldest policy since creation.
    pub fn dropped_count(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }
}

impl std::fmt::Debug for SpanBuffer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SpanBuffer")
            .field("capacity", &self.capacity)
            .field("len", &self.len())
            .field("accepted", &self.accepted_count())
            .field("dropped", &self.dropped_count())
            .field("closed", &self.is_closed())
            .finish()
    }
}
