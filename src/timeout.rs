//! Deadline wrappers for async operations that cannot be cancelled.
//!
//! `tokio::time::timeout` drops the wrapped future when the timer fires, which
//! cancels it. The helpers here run the operation as its own task instead, so a
//! deadline only stops *waiting*: the task keeps running and may still perform
//! side effects (disk writes) after the caller has moved on.
//!
//! Callers that retry against the same resource use [`spawn_with_deadline`] and
//! keep the returned [`InFlight`] handle, then [`InFlight::settle`] it before the
//! next attempt starts.
//!
//! # Example
//!
//! ```
//! use std::time::Duration;
//! use imgsync_core::timeout::{DeadlineError, with_deadline};
//!
//! # async fn example() {
//! let result = with_deadline(
//!     async { tokio::time::sleep(Duration::from_secs(5)).await },
//!     Duration::from_millis(10),
//!     "slow operation",
//! )
//! .await;
//! assert!(matches!(result, Err(DeadlineError::Elapsed { .. })));
//! # }
//! ```

use std::future::Future;
use std::time::Duration;

use thiserror::Error;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

/// Failure of an operation run under a deadline.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum DeadlineError {
    /// The deadline fired before the operation settled.
    #[error("{label} timed out after {}ms", after.as_millis())]
    Elapsed {
        /// Label supplied by the caller.
        label: String,
        /// The deadline that was exceeded.
        after: Duration,
    },

    /// The operation panicked or was aborted before producing a value.
    #[error("{label} aborted before completing")]
    Aborted {
        /// Label supplied by the caller.
        label: String,
    },
}

impl DeadlineError {
    /// Returns true for [`DeadlineError::Elapsed`].
    #[must_use]
    pub fn is_elapsed(&self) -> bool {
        matches!(self, Self::Elapsed { .. })
    }

    /// Returns the caller-supplied label.
    #[must_use]
    pub fn label(&self) -> &str {
        match self {
            Self::Elapsed { label, .. } | Self::Aborted { label } => label,
        }
    }
}

/// Result of [`spawn_with_deadline`].
#[derive(Debug)]
pub enum Deadline<T> {
    /// The operation finished (or panicked) before the deadline.
    Settled(Result<T, DeadlineError>),
    /// The deadline fired; the operation is still running.
    Expired(InFlight<T>),
}

/// Handle to an operation that outlived its deadline.
///
/// Dropping the handle detaches the task; it still runs to completion.
#[derive(Debug)]
pub struct InFlight<T> {
    handle: JoinHandle<T>,
    label: String,
    after: Duration,
}

impl<T> InFlight<T> {
    /// Returns the timeout error this handle stands for.
    #[must_use]
    pub fn error(&self) -> DeadlineError {
        DeadlineError::Elapsed {
            label: self.label.clone(),
            after: self.after,
        }
    }

    /// Returns true once the underlying task has finished.
    #[must_use]
    pub fn is_finished(&self) -> bool {
        self.handle.is_finished()
    }

    /// Waits up to `grace` for the operation to finish.
    ///
    /// Returns `true` if it settled (successfully or not) within the grace
    /// period. On `false` the task is left running detached.
    pub async fn settle(mut self, grace: Duration) -> bool {
        match tokio::time::timeout(grace, &mut self.handle).await {
            Ok(_) => {
                debug!(label = %self.label, "in-flight operation settled");
                true
            }
            Err(_) => {
                warn!(
                    label = %self.label,
                    grace_ms = grace.as_millis(),
                    "in-flight operation still running after grace period"
                );
                false
            }
        }
    }
}

/// Spawns `operation` and waits for it up to `duration`.
///
/// Unlike [`with_deadline`], an expired operation is handed back as an
/// [`InFlight`] handle so the caller can wait for it to settle later.
///
/// Must be called from within a Tokio runtime.
pub async fn spawn_with_deadline<F, T>(operation: F, duration: Duration, label: &str) -> Deadline<T>
where
    F: Future<Output = T> + Send + 'static,
    T: Send + 'static,
{
    let mut handle = tokio::spawn(operation);

    match tokio::time::timeout(duration, &mut handle).await {
        Ok(Ok(value)) => Deadline::Settled(Ok(value)),
        Ok(Err(join_error)) => {
            warn!(label, error = %join_error, "operation aborted");
            Deadline::Settled(Err(DeadlineError::Aborted {
                label: label.to_string(),
            }))
        }
        Err(_) => {
            debug!(label, deadline_ms = duration.as_millis(), "deadline elapsed");
            Deadline::Expired(InFlight {
                handle,
                label: label.to_string(),
                after: duration,
            })
        }
    }
}

/// Runs `operation` with a deadline, returning a distinguishable timeout error.
///
/// The operation is not cancelled when the deadline fires.
///
/// # Errors
///
/// Returns [`DeadlineError::Elapsed`] when the deadline fires first and
/// [`DeadlineError::Aborted`] when the operation panics.
pub async fn with_deadline<F, T>(
    operation: F,
    duration: Duration,
    label: &str,
) -> Result<T, DeadlineError>
where
    F: Future<Output = T> + Send + 'static,
    T: Send + 'static,
{
    match spawn_with_deadline(operation, duration, label).await {
        Deadline::Settled(result) => result,
        Deadline::Expired(in_flight) => Err(in_flight.error()),
    }
}

/// Runs `operation` with a deadline, yielding `fallback` if it does not settle.
pub async fn with_deadline_or<F, T>(operation: F, duration: Duration, fallback: T, label: &str) -> T
where
    F: Future<Output = T> + Send + 'static,
    T: Send + 'static,
{
    match with_deadline(operation, duration, label).await {
        Ok(value) => value,
        Err(error) => {
            warn!(label, error = %error, "using fallback value");
            fallback
        }
    }
}
