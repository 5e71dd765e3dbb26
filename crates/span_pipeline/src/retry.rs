//! Export retry with capped exponential backoff.

use crate::exporter::{ExportError, SpanExporterBoxed};
use crate::resource::Resource;
use crate::span::SpanBatch;
use std::time::Duration;
use tokio::time::{sleep, timeout};

/// Configuration for retry behavior.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Maximum number of retry attempts (0 = no retries, just the initial attempt).
    pub max_retries: u32,
    /// Delay before the first retry; doubles on each further retry.
    pub base_delay: Duration,
    /// Maximum delay between retries (caps exponential growth).
    pub max_delay: Duration,
    /// Upper bound on a single export attempt.
    pub attempt_timeout: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(10),
            attempt_timeout: Duration::from_secs(30),
        }
    }
}

impl RetryPolicy {
    /// Delay before the given attempt (0-indexed). Attempt 0 is immediate;
    /// attempt `k` waits `base_delay * 2^(k-1)`, capped at `max_delay`.
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        if attempt == 0 {
            return Duration::ZERO;
        }
        let factor = 1u32.checked_shl(attempt - 1).unwrap_or(u32::MAX);
        self.base_delay
            .checked_mul(factor)
            .unwrap_or(self.max_delay)
            .min(self.max_delay)
    }

    pub fn max_attempts(&self) -> u32 {
        self.max_retries.saturating_add(1)
    }
}

/// Result of exporting one batch through [`export_with_retry`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExportOutcome {
    /// Exported on the given attempt (0-indexed).
    Exported { attempt: u32 },
    /// Every permitted attempt failed; `last_error` is the final failure.
    Failed { attempts: u32, last_error: ExportError },
}

impl ExportOutcome {
    pub fn is_exported(&self) -> bool {
        matches!(self, ExportOutcome::Exported { .. })
    }

    /// Number of retries performed (attempts beyond the first).
    pub fn retries(&self) -> u32 {
        match self {
            ExportOutcome::Exported { attempt } => *attempt,
            ExportOutcome::Failed { attempts, .. } => attempts.saturating_sub(1),
        }
    }
}

/// Exports `batch`, retrying retryable failures per `policy`.
///
/// The batch is only lent to the exporter, so a batch is exported at most
/// once: the loop stops at the first success.
pub async fn export_with_retry(
    exporter: &dyn SpanExporterBoxed,
    batch: &SpanBatch,
    resource: &Resource,
    policy: &RetryPolicy,
) -> ExportOutcome {
    let max_attempts = policy.max_attempts();
    let mut attempt = 0;

    loop {
        let delay = policy.delay_for_attempt(attempt);
        if !delay.is_zero() {
            debug_assert!(delay <= policy.max_delay);
            sleep(delay).await;
        }

        let result = match timeout(policy.attempt_timeout, exporter.export_boxed(batch, resource)).await {
            Ok(result) => result,
            Err(_) => Err(ExportError::Timeout),
        };

        match result {
            Ok(()) => {
                if attempt > 0 {
                    tracing::debug!(
                        exporter = exporter.name(),
                        attempt,
                        spans = batch.len(),
                        "export recovered after retry"
                    );
                }
                return ExportOutcome::Exported { attempt };
            }
            Err(error) => {
                attempt += 1;
                if !error.is_retryable() || attempt >= max_attempts {
                    return ExportOutcome::Failed {
                        attempts: attempt,
                        last_error: error,
                    };
                }
                tracing::debug!(
                    exporter = exporter.name(),
                    attempt,
                    error = %error,
                    "export attempt failed, retrying"
                );
            }
        }
    }
}
