//! Batch scheduler: ordered, bounded-concurrency dispatch with retries.
//!
//! Work items are partitioned into `ceil(len / batch_size)` ordered batches.
//! Batches run concurrently, never more than `max_concurrency` at once, and
//! complete in any order; results are reassembled by batch index so that
//! `outcomes[i]` always belongs to `items[i]`.
//!
//! # Failure policy
//!
//! A batch whose work function fails (or returns the wrong number of results)
//! is retried with exponential backoff and jitter:
//!
//! ```text
//! delay = min(base_delay * 2^(attempt-1), max_delay) + random_jitter(0..=max_jitter)
//! ```
//!
//! Once retries are exhausted, every item of that batch gets an
//! [`ItemOutcome::Failed`]; other batches are unaffected.
//!
//! # Cancellation
//!
//! When the cancellation token fires, batches that have not started are not
//! dispatched and their items are reported as [`ItemOutcome::Cancelled`].
//! Batches already in flight run to completion (or to their per-call timeout).
//! A batch waiting out a retry backoff gives up and reports its items as
//! cancelled.

use crate::config::PipelineConfig;
use crate::error::InferenceError;
use futures::stream::{self, StreamExt};
use rand::{Rng, rng};
use std::future::Future;
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, instrument, warn};

/// Exponential backoff settings for failed batches.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Maximum number of retry attempts before giving up.
    pub max_retries: usize,
    /// Initial delay between retries (doubles with each attempt).
    pub base_delay: Duration,
    /// Maximum delay cap to prevent excessive waiting.
    pub max_delay: Duration,
    /// Upper bound of the random jitter added to every delay.
    pub max_jitter: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 2,
            base_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(30),
            max_jitter: Duration::from_millis(250),
        }
    }
}

impl RetryPolicy {
    /// Delay before retry number `attempt` (1-based).
    pub fn backoff(&self, attempt: usize) -> Duration {
        let exp = attempt.saturating_sub(1).min(31) as u32;
        let mut delay = self.base_delay.saturating_mul(1u32 << exp);
        if delay > self.max_delay {
            delay = self.max_delay;
        }
        let jitter_ms = self.max_jitter.as_millis() as u64;
        if jitter_ms == 0 {
            return delay;
        }
        delay + Duration::from_millis(rng().random_range(0..=jitter_ms))
    }
}

/// How items are grouped and how many groups run at once.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BatchConfig {
    pub batch_size: usize,
    pub max_concurrency: usize,
    pub retry: RetryPolicy,
}

impl BatchConfig {
    pub fn from_pipeline(config: &PipelineConfig) -> Self {
        Self {
            batch_size: config.batch_size.max(1),
            max_concurrency: config.max_concurrency.max(1),
            retry: RetryPolicy {
                max_retries: config.max_retries,
                base_delay: Duration::from_millis(config.base_delay_ms),
                max_delay: Duration::from_millis(config.max_delay_ms),
                ..RetryPolicy::default()
            },
        }
    }

    /// The same settings with one item per batch.
    pub fn per_item(self) -> Self {
        Self {
            batch_size: 1,
            ..self
        }
    }
}

/// Result for a single work item.
#[derive(Debug, Clone, PartialEq)]
pub enum ItemOutcome<R> {
    Done(R),
    /// The item's batch failed after all retries.
    Failed(InferenceError),
    /// The item's batch was never dispatched, or gave up because of cancellation.
    Cancelled,
}

impl<R> ItemOutcome<R> {
    pub fn is_done(&self) -> bool {
        matches!(self, ItemOutcome::Done(_))
    }
}

/// Everything the scheduler observed while running one list of items.
#[derive(Debug, Clone)]
pub struct BatchReport<R> {
    /// One outcome per input item, in input order.
    pub outcomes: Vec<ItemOutcome<R>>,
    pub batches: usize,
    /// Work function invocations, including retries.
    pub attempts: usize,
    pub failed_batches: usize,
    pub cancelled_batches: usize,
}

impl<R> BatchReport<R> {
    pub fn succeeded(&self) -> usize {
        self.outcomes.iter().filter(|o| o.is_done()).count()
    }

    pub fn failed(&self) -> usize {
        self.outcomes
            .iter()
            .filter(|o| matches!(o, ItemOutcome::Failed(_)))
            .count()
    }

    pub fn cancelled(&self) -> usize {
        self.outcomes
            .iter()
            .filter(|o| matches!(o, ItemOutcome::Cancelled))
            .count()
    }
}

enum BatchOutcome<R> {
    Done(Vec<R>, usize),
    Failed(InferenceError, usize, usize),
    Cancelled(usize, usize),
}

/// Number of batches `len` items split into.
pub fn batch_count(len: usize, batch_size: usize) -> usize {
    len.div_ceil(batch_size.max(1))
}

/// Run `work_fn` over `items` in batches. See the module docs for the
/// ordering, failure, and cancellation contract.
///
/// `on_settled` is called with the number of items of every batch as soon as
/// that batch settles, which lets callers publish progress.
#[instrument(level = "info", skip_all, fields(items = items.len(), batch_size = config.batch_size, max_concurrency = config.max_concurrency))]
pub async fn run_batches<T, R, F, Fut>(
    items: Vec<T>,
    config: &BatchConfig,
    cancel: &CancellationToken,
    work_fn: F,
    on_settled: impl Fn(usize),
) -> BatchReport<R>
where
    T: Clone,
    F: Fn(Vec<T>) -> Fut,
    Fut: Future<Output = Result<Vec<R>, InferenceError>>,
{
    let batch_size = config.batch_size.max(1);
    let batches: Vec<Vec<T>> = items.chunks(batch_size).map(|c| c.to_vec()).collect();
    let batch_total = batches.len();
    let work_fn = &work_fn;

    let mut in_flight = stream::iter(batches.into_iter().enumerate())
        .map(|(idx, batch)| async move {
            let len = batch.len();
            if cancel.is_cancelled() {
                debug!(batch = idx, "Cancelled before dispatch");
                return (idx, BatchOutcome::Cancelled(len, 0));
            }
            (idx, run_with_retry(idx, batch, &config.retry, cancel, work_fn).await)
        })
        .buffer_unordered(config.max_concurrency.max(1));

    let mut slots: Vec<Option<BatchOutcome<R>>> = (0..batch_total).map(|_| None).collect();
    while let Some((idx, outcome)) = in_flight.next().await {
        let settled = match &outcome {
            BatchOutcome::Done(results, _) => results.len(),
            BatchOutcome::Failed(_, len, _) | BatchOutcome::Cancelled(len, _) => *len,
        };
        on_settled(settled);
        slots[idx] = Some(outcome);
    }

    let mut report = BatchReport {
        outcomes: Vec::with_capacity(items.len()),
        batches: batch_total,
        attempts: 0,
        failed_batches: 0,
        cancelled_batches: 0,
    };
    for slot in slots.into_iter().flatten() {
        match slot {
            BatchOutcome::Done(results, attempts) => {
                report.attempts += attempts;
                report.outcomes.extend(results.into_iter().map(ItemOutcome::Done));
            }
            BatchOutcome::Failed(e, len, attempts) => {
                report.attempts += attempts;
                report.failed_batches += 1;
                report
                    .outcomes
                    .extend((0..len).map(|_| ItemOutcome::Failed(e.clone())));
            }
            BatchOutcome::Cancelled(len, attempts) => {
                report.attempts += attempts;
                report.cancelled_batches += 1;
                report.outcomes.extend((0..len).map(|_| ItemOutcome::Cancelled));
            }
        }
    }
    report
}

async fn run_with_retry<T, R, F, Fut>(
    idx: usize,
    batch: Vec<T>,
    retry: &RetryPolicy,
    cancel: &CancellationToken,
    work_fn: &F,
) -> BatchOutcome<R>
where
    T: Clone,
    F: Fn(Vec<T>) -> Fut,
    Fut: Future<Output = Result<Vec<R>, InferenceError>>,
{
    let len = batch.len();
    let total_t0 = Instant::now();
    let mut attempt = 0usize;

    loop {
        let err = match work_fn(batch.clone()).await {
            Ok(results) if results.len() == len => {
                return BatchOutcome::Done(results, attempt + 1);
            }
            Ok(results) => InferenceError::BatchShape {
                expected: len,
                got: results.len(),
            },
            Err(e) => e,
        };
        attempt += 1;

        if err == InferenceError::Cancelled {
            return BatchOutcome::Cancelled(len, attempt);
        }
        if attempt > retry.max_retries {
            error!(
                batch = idx,
                attempt,
                max = retry.max_retries,
                elapsed_ms_total = total_t0.elapsed().as_millis() as u64,
                error = %err,
                "Batch exhausted retries"
            );
            return BatchOutcome::Failed(err, len, attempt);
        }

        let delay = retry.backoff(attempt);
        warn!(
            batch = idx,
            attempt,
            max = retry.max_retries,
            ?delay,
            error = %err,
            "Batch attempt failed; backing off"
        );
        tokio::select! {
            _ = cancel.cancelled() => {
                debug!(batch = idx, "Cancelled during backoff");
                return BatchOutcome::Cancelled(len, attempt);
            }
            _ = tokio::time::sleep(delay) => {}
        }
    }
}
