//! Bounded batch processing with per-item deadlines.
//!
//! # Overview
//!
//! [`process_in_batches`] runs a worker over a list of items in consecutive
//! windows of at most `max_concurrent` items. Every item of a window runs
//! concurrently; the next window starts only after the whole window settled.
//! Exactly one [`BatchOutcome`] is returned per item, in input order.
//!
//! # Example
//!
//! ```
//! use imgsync_core::batch::{BatchConfig, process_in_batches};
//!
//! # async fn example() {
//! let config = BatchConfig::<u32>::new(2).with_label("squares");
//! let outcomes = process_in_batches(
//!     vec![1_u32, 2, 3],
//!     |n, _index| async move { Ok::<_, std::io::Error>(n * n) },
//!     &config,
//! )
//! .await
//! .unwrap();
//! assert_eq!(outcomes.len(), 3);
//! # }
//! ```

use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use futures_util::future::join_all;
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::timeout::{DeadlineError, with_deadline};

/// Receives per-item lifecycle notifications from a batch run.
pub trait ProgressSink: Send + Sync {
    /// Called before the item's work begins.
    fn start(&self, index: usize);

    /// Called exactly once when the item settles.
    fn complete(&self, index: usize, success: bool);
}

/// Predicate deciding whether a fulfilled value counts as a success.
pub type SuccessCheck<T> = Arc<dyn Fn(&T) -> bool + Send + Sync>;

/// Configuration for [`process_in_batches`].
pub struct BatchConfig<T> {
    max_concurrent: usize,
    timeout: Option<Duration>,
    label: String,
    progress: Option<Arc<dyn ProgressSink>>,
    success_check: Option<SuccessCheck<T>>,
}

impl<T> BatchConfig<T> {
    /// Creates a config with the given window size and no per-item deadline.
    #[must_use]
    pub fn new(max_concurrent: usize) -> Self {
        Self {
            max_concurrent,
            timeout: None,
            label: "batch".to_string(),
            progress: None,
            success_check: None,
        }
    }

    /// Wraps every worker call in a deadline.
    #[must_use]
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// Sets the label used in logs and deadline errors.
    #[must_use]
    pub fn with_label(mut self, label: impl Into<String>) -> Self {
        self.label = label.into();
        self
    }

    /// Attaches a progress sink.
    #[must_use]
    pub fn with_progress(mut self, progress: Arc<dyn ProgressSink>) -> Self {
        self.progress = Some(progress);
        self
    }

    /// Attaches a predicate that decides whether a fulfilled value is reported
    /// to the progress sink as a success.
    #[must_use]
    pub fn with_success_check(mut self, check: SuccessCheck<T>) -> Self {
        self.success_check = Some(check);
        self
    }

    /// Returns the window size.
    #[must_use]
    pub fn max_concurrent(&self) -> usize {
        self.max_concurrent
    }

    /// Returns the per-item deadline, if any.
    #[must_use]
    pub fn timeout(&self) -> Option<Duration> {
        self.timeout
    }

    /// Returns the batch label.
    #[must_use]
    pub fn label(&self) -> &str {
        &self.label
    }
}

impl<T> fmt::Debug for BatchConfig<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BatchConfig")
            .field("max_concurrent", &self.max_concurrent)
            .field("timeout", &self.timeout)
            .field("label", &self.label)
            .field("progress", &self.progress.is_some())
            .field("success_check", &self.success_check.is_some())
            .finish()
    }
}

/// Invalid batch input, reported before any item runs.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum BatchError {
    /// No items were supplied.
    #[error("batch '{label}' received no items")]
    EmptyInput {
        /// Batch label.
        label: String,
    },

    /// The window size was below 1.
    #[error("invalid concurrency {value} for batch '{label}': must be at least 1")]
    InvalidConcurrency {
        /// Batch label.
        label: String,
        /// The rejected value.
        value: usize,
    },
}

/// Why an item was rejected.
#[derive(Debug, Error)]
pub enum BatchRejection<E> {
    /// The worker returned an error.
    #[error("{0}")]
    Worker(E),

    /// The per-item deadline fired, or the worker panicked.
    #[error("{0}")]
    Deadline(DeadlineError),
}

/// Settled outcome of one item.
#[derive(Debug)]
pub enum BatchOutcome<T, E> {
    /// The worker produced a value.
    Fulfilled(T),
    /// The worker failed or timed out.
    Rejected(BatchRejection<E>),
}

impl<T, E> BatchOutcome<T, E> {
    /// Returns true for [`BatchOutcome::Fulfilled`].
    #[must_use]
    pub fn is_fulfilled(&self) -> bool {
        matches!(self, Self::Fulfilled(_))
    }

    /// Converts the outcome into a `Result`.
    ///
    /// # Errors
    ///
    /// Returns the rejection for [`BatchOutcome::Rejected`].
    pub fn into_result(self) -> Result<T, BatchRejection<E>> {
        match self {
            Self::Fulfilled(value) => Ok(value),
            Self::Rejected(rejection) => Err(rejection),
        }
    }
}

/// Runs `worker` over `items` in windows of at most `max_concurrent`.
///
/// The worker receives each item together with its index in `items`.
///
/// # Errors
///
/// Returns [`BatchError`] for empty input or a window size below 1. Worker
/// failures never fail the batch; they become [`BatchOutcome::Rejected`].
pub async fn process_in_batches<I, T, E, W, Fut>(
    items: Vec<I>,
    worker: W,
    config: &BatchConfig<T>,
) -> Result<Vec<BatchOutcome<T, E>>, BatchError>
where
    W: Fn(I, usize) -> Fut,
    Fut: Future<Output = Result<T, E>> + Send + 'static,
    T: Send + 'static,
    E: Send + 'static,
{
    if items.is_empty() {
        return Err(BatchError::EmptyInput {
            label: config.label.clone(),
        });
    }
    if config.max_concurrent < 1 {
        return Err(BatchError::InvalidConcurrency {
            label: config.label.clone(),
            value: config.max_concurrent,
        });
    }

    let total = items.len();
    let mut outcomes = Vec::with_capacity(total);
    let mut pending = items.into_iter().enumerate().peekable();
    let mut window_number = 0_usize;

    while pending.peek().is_some() {
        let window: Vec<(usize, I)> = pending.by_ref().take(config.max_concurrent).collect();
        window_number += 1;
        debug!(
            label = %config.label,
            window = window_number,
            size = window.len(),
            "starting batch window"
        );

        let runs = window
            .into_iter()
            .map(|(index, item)| run_item(index, item, &worker, config));
        outcomes.extend(join_all(runs).await);
    }

    let fulfilled = outcomes.iter().filter(|outcome| outcome.is_fulfilled()).count();
    info!(
        label = %config.label,
        total,
        fulfilled,
        rejected = total - fulfilled,
        "batch complete"
    );

    Ok(outcomes)
}

async fn run_item<I, T, E, W, Fut>(
    index: usize,
    item: I,
    worker: &W,
    config: &BatchConfig<T>,
) -> BatchOutcome<T, E>
where
    W: Fn(I, usize) -> Fut,
    Fut: Future<Output = Result<T, E>> + Send + 'static,
    T: Send + 'static,
    E: Send + 'static,
{
    if let Some(progress) = &config.progress {
        progress.start(index);
    }

    let work = worker(item, index);
    let outcome = match config.timeout {
        Some(limit) => {
            let label = format!("{} item {index}", config.label);
            match with_deadline(work, limit, &label).await {
                Ok(Ok(value)) => BatchOutcome::Fulfilled(value),
                Ok(Err(error)) => BatchOutcome::Rejected(BatchRejection::Worker(error)),
                Err(deadline) => BatchOutcome::Rejected(BatchRejection::Deadline(deadline)),
            }
        }
        None => match tokio::spawn(work).await {
            Ok(Ok(value)) => BatchOutcome::Fulfilled(value),
            Ok(Err(error)) => BatchOutcome::Rejected(BatchRejection::Worker(error)),
            Err(join_error) => {
                warn!(label = %config.label, index, error = %join_error, "batch item aborted");
                BatchOutcome::Rejected(BatchRejection::Deadline(DeadlineError::Aborted {
                    label: format!("{} item {index}", config.label),
                }))
            }
        },
    };

    if let Some(progress) = &config.progress {
        let success = match &outcome {
            BatchOutcome::Fulfilled(value) => config
                .success_check
                .as_ref()
                .is_none_or(|check| check(value)),
            BatchOutcome::Rejected(_) => false,
        };
        progress.complete(index, success);
    }

    outcome
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use tokio::time::sleep;

    use super::*;

    #[derive(Default)]
    struct RecordingSink {
        events: Mutex<Vec<(usize, Option<bool>)>>,
    }

    impl ProgressSink for RecordingSink {
        fn start(&self, index: usize) {
            self.events.lock().unwrap().push((index, None));
        }

        fn complete(&self, index: usize, success: bool) {
            self.events.lock().unwrap().push((index, Some(success)));
        }
    }

    // ==================== Input Validation Tests ====================

    #[tokio::test]
    async fn test_empty_input_rejected() {
        let config = BatchConfig::<u32>::new(2).with_label("empty");
        let result = process_in_batches(
            Vec::<u32>::new(),
            |n, _| async move { Ok::<_, String>(n) },
            &config,
        )
        .await;

        assert_eq!(
            result.unwrap_err(),
            BatchError::EmptyInput {
                label: "empty".to_string()
            }
        );
    }

    #[tokio::test]
    async fn test_zero_concurrency_rejected() {
        let config = BatchConfig::<u32>::new(0);
        let result =
            process_in_batches(vec![1_u32], |n, _| async move { Ok::<_, String>(n) }, &config)
                .await;

        assert!(matches!(
            result.unwrap_err(),
            BatchError::InvalidConcurrency { value: 0, .. }
        ));
    }

    // ==================== Window Tests ====================

    #[tokio::test]
    async fn test_never_exceeds_window_and_preserves_order() {
        tokio::time::pause();

        let in_flight = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));
        let config = BatchConfig::<usize>::new(2);

        let outcomes = process_in_batches(
            vec![50_u64, 10, 40, 20, 30],
            |delay_ms, index| {
                let in_flight = Arc::clone(&in_flight);
                let peak = Arc::clone(&peak);
                async move {
                    let now = in_flight.fetch_add(1, Ordering::SeqCst) + 1;
                    peak.fetch_max(now, Ordering::SeqCst);
                    sleep(Duration::from_millis(delay_ms)).await;
                    in_flight.fetch_sub(1, Ordering::SeqCst);
                    Ok::<_, String>(index)
                }
            },
            &config,
        )
        .await
        .unwrap();

        assert!(peak.load(Ordering::SeqCst) <= 2);
        let indices: Vec<usize> = outcomes
            .into_iter()
            .map(|outcome| outcome.into_result().unwrap())
            .collect();
        assert_eq!(indices, vec![0, 1, 2, 3, 4]);
    }

    #[tokio::test]
    async fn test_next_window_waits_for_slowest_item() {
        tokio::time::pause();

        let start = tokio::time::Instant::now();
        let started_at = Arc::new(Mutex::new(Vec::new()));
        let config = BatchConfig::<()>::new(2);

        process_in_batches(
            vec![100_u64, 10, 10],
            |delay_ms, index| {
                let started_at = Arc::clone(&started_at);
                async move {
                    started_at.lock().unwrap().push((index, start.elapsed()));
                    sleep(Duration::from_millis(delay_ms)).await;
                    Ok::<_, String>(())
                }
            },
            &config,
        )
        .await
        .unwrap();

        let started_at = started_at.lock().unwrap();
        let (_, third_start) = started_at.iter().find(|(index, _)| *index == 2).unwrap();
        assert!(*third_start >= Duration::from_millis(100));
    }

    // ==================== Rejection Tests ====================

    #[tokio::test]
    async fn test_worker_error_and_deadline_are_distinct() {
        tokio::time::pause();

        let config = BatchConfig::<u32>::new(3)
            .with_timeout(Duration::from_millis(100))
            .with_label("mixed");

        let outcomes = process_in_batches(
            vec![0_u32, 1, 2],
            |n, _| async move {
                match n {
                    0 => Ok(n),
                    1 => Err("bad item".to_string()),
                    _ => {
                        sleep(Duration::from_secs(10)).await;
                        Ok(n)
                    }
                }
            },
            &config,
        )
        .await
        .unwrap();

        let mut outcomes = outcomes.into_iter();
        assert!(matches!(outcomes.next(), Some(BatchOutcome::Fulfilled(0))));
        match outcomes.next() {
            Some(BatchOutcome::Rejected(BatchRejection::Worker(message))) => {
                assert_eq!(message, "bad item");
            }
            other => panic!("expected worker rejection, got {other:?}"),
        }
        match outcomes.next() {
            Some(BatchOutcome::Rejected(BatchRejection::Deadline(error))) => {
                assert!(error.is_elapsed());
                assert_eq!(error.label(), "mixed item 2");
            }
            other => panic!("expected deadline rejection, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_panicking_worker_without_timeout_is_rejected() {
        let sink = Arc::new(RecordingSink::default());
        let config = BatchConfig::<u32>::new(2)
            .with_label("fragile")
            .with_progress(sink.clone());

        let outcomes = process_in_batches(
            vec![0_u32, 1, 2],
            |n, _| async move {
                if n == 1 {
                    panic!("worker exploded");
                }
                Ok::<_, String>(n)
            },
            &config,
        )
        .await
        .unwrap();

        assert_eq!(outcomes.len(), 3);
        assert!(matches!(outcomes[0], BatchOutcome::Fulfilled(0)));
        match &outcomes[1] {
            BatchOutcome::Rejected(BatchRejection::Deadline(error)) => {
                assert!(!error.is_elapsed());
                assert_eq!(error.label(), "fragile item 1");
            }
            other => panic!("expected aborted rejection, got {other:?}"),
        }
        assert!(matches!(outcomes[2], BatchOutcome::Fulfilled(2)));

        let completions = sink
            .events
            .lock()
            .unwrap()
            .iter()
            .filter(|(_, success)| success.is_some())
            .count();
        assert_eq!(completions, 3);
    }

    // ==================== Progress Tests ====================

    #[tokio::test]
    async fn test_progress_reports_start_then_complete_once() {
        let sink = Arc::new(RecordingSink::default());
        let config = BatchConfig::<u32>::new(1).with_progress(sink.clone());

        process_in_batches(
            vec![1_u32, 2],
            |n, _| async move { if n == 1 { Ok(n) } else { Err("no") } },
            &config,
        )
        .await
        .unwrap();

        let events = sink.events.lock().unwrap().clone();
        assert_eq!(
            events,
            vec![(0, None), (0, Some(true)), (1, None), (1, Some(false))]
        );
    }

    #[tokio::test]
    async fn test_success_check_downgrades_progress_only() {
        let sink = Arc::new(RecordingSink::default());
        let config = BatchConfig::<Option<u32>>::new(2)
            .with_progress(sink.clone())
            .with_success_check(Arc::new(|value: &Option<u32>| value.is_some()));

        let outcomes = process_in_batches(
            vec![Some(1_u32), None],
            |value, _| async move { Ok::<_, String>(value) },
            &config,
        )
        .await
        .unwrap();

        assert!(outcomes.iter().all(BatchOutcome::is_fulfilled));
        let events = sink.events.lock().unwrap();
        assert!(events.contains(&(0, Some(true))));
        assert!(events.contains(&(1, Some(false))));
    }
}
