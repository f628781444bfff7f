//! Rate- and concurrency-limited task scheduler for calls to an external API.
//!
//! # Overview
//!
//! [`RequestScheduler`] combines three guards:
//!
//! - a concurrency ceiling (`max_concurrent` tasks running at once),
//! - a token bucket refilled to `max_per_interval` on every `interval` tick,
//! - an optional circuit-breaker predicate evaluated before a task is queued.
//!
//! Tasks are dispatched FIFO whenever both a token and concurrency headroom
//! are available. Draining happens on submission, on task completion, and on
//! every tick. Each scheduler owns its own tick task; there is no global
//! instance.
//!
//! # Example
//!
//! ```
//! use imgsync_core::scheduler::{RequestScheduler, SchedulerConfig};
//!
//! # async fn example() {
//! let scheduler = RequestScheduler::new(SchedulerConfig::default(), None);
//! let value = scheduler.submit(async { 1 + 1 }, "sum").await.unwrap();
//! assert_eq!(value, 2);
//! scheduler.shutdown();
//! # }
//! ```

mod breaker;

use std::collections::VecDeque;
use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::time::Duration;

use futures_util::future::BoxFuture;
use thiserror::Error;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, instrument, warn};

pub use breaker::ConsecutiveFailureBreaker;

/// Default concurrency ceiling.
pub const DEFAULT_MAX_CONCURRENT: usize = 3;

/// Default number of dispatches per interval.
pub const DEFAULT_MAX_PER_INTERVAL: usize = 3;

/// Default token refill interval.
pub const DEFAULT_INTERVAL: Duration = Duration::from_secs(1);

/// Predicate returning `true` while the circuit is open.
pub type CircuitBreakerCheck = Arc<dyn Fn() -> bool + Send + Sync>;

/// Scheduler limits.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SchedulerConfig {
    /// Maximum tasks running at once (clamped to at least 1).
    pub max_concurrent: usize,
    /// Tokens available per interval (clamped to at least 1).
    pub max_per_interval: usize,
    /// Token refill period (clamped to at least 1ms).
    pub interval: Duration,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            max_concurrent: DEFAULT_MAX_CONCURRENT,
            max_per_interval: DEFAULT_MAX_PER_INTERVAL,
            interval: DEFAULT_INTERVAL,
        }
    }
}

/// Why a submitted task did not produce a value.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum SchedulerError {
    /// The circuit breaker was open at submission time.
    #[error("circuit open: rejected {label}")]
    CircuitOpen {
        /// Task label.
        label: String,
    },

    /// The scheduler was shut down before the task was dispatched.
    #[error("scheduler shut down before {label} was dispatched")]
    Destroyed {
        /// Task label.
        label: String,
    },

    /// The task panicked while running.
    #[error("{label} aborted while running")]
    Aborted {
        /// Task label.
        label: String,
    },
}

/// Pending result of a queued task.
#[derive(Debug)]
pub struct Ticket<T> {
    receiver: oneshot::Receiver<Result<T, SchedulerError>>,
    label: String,
}

impl<T> Ticket<T> {
    /// Waits for the task to settle.
    ///
    /// # Errors
    ///
    /// Returns [`SchedulerError::Destroyed`] if the scheduler shut down first,
    /// or [`SchedulerError::Aborted`] if the task panicked.
    pub async fn wait(self) -> Result<T, SchedulerError> {
        match self.receiver.await {
            Ok(result) => result,
            Err(_) => Err(SchedulerError::Aborted { label: self.label }),
        }
    }
}

trait Dispatch: Send {
    fn run(self: Box<Self>) -> BoxFuture<'static, ()>;
    fn reject(self: Box<Self>, error: SchedulerError);
    fn label(&self) -> &str;
}

struct PendingTask<F: Future> {
    label: String,
    task: F,
    reply: oneshot::Sender<Result<F::Output, SchedulerError>>,
}

impl<F> Dispatch for PendingTask<F>
where
    F: Future + Send + 'static,
    F::Output: Send + 'static,
{
    fn run(self: Box<Self>) -> BoxFuture<'static, ()> {
        let Self { task, reply, .. } = *self;
        Box::pin(async move {
            let output = task.await;
            // Receiver may have been dropped by a caller that stopped waiting.
            let _ = reply.send(Ok(output));
        })
    }

    fn reject(self: Box<Self>, error: SchedulerError) {
        let _ = self.reply.send(Err(error));
    }

    fn label(&self) -> &str {
        &self.label
    }
}

struct State {
    queue: VecDeque<Box<dyn Dispatch>>,
    tokens: usize,
    running: usize,
    destroyed: bool,
    dispatched_total: u64,
}

struct Inner {
    config: SchedulerConfig,
    state: Mutex<State>,
    circuit_breaker: Option<CircuitBreakerCheck>,
}

impl Inner {
    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn refill(&self) {
        let mut state = self.lock();
        state.tokens = self.config.max_per_interval;
    }

    fn drain(inner: &Arc<Self>) {
        if tokio::runtime::Handle::try_current().is_err() {
            return;
        }

        let ready: Vec<Box<dyn Dispatch>> = {
            let mut state = inner.lock();
            let mut ready = Vec::new();
            while !state.destroyed
                && state.running < inner.config.max_concurrent
                && state.tokens > 0
            {
                let Some(task) = state.queue.pop_front() else {
                    break;
                };
                state.tokens -= 1;
                state.running += 1;
                state.dispatched_total += 1;
                ready.push(task);
            }
            ready
        };

        for task in ready {
            debug!(label = %task.label(), "dispatching task");
            let guard = RunningGuard {
                inner: Arc::clone(inner),
            };
            let job = task.run();
            tokio::spawn(async move {
                let _guard = guard;
                job.await;
            });
        }
    }
}

/// Releases a concurrency slot when a dispatched task finishes or panics.
struct RunningGuard {
    inner: Arc<Inner>,
}

impl Drop for RunningGuard {
    fn drop(&mut self) {
        {
            let mut state = self.inner.lock();
            state.running = state.running.saturating_sub(1);
        }
        Inner::drain(&self.inner);
    }
}

async fn run_ticker(inner: Weak<Inner>, interval: Duration) {
    let mut ticker = tokio::time::interval_at(Instant::now() + interval, interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

    loop {
        ticker.tick().await;
        let Some(inner) = inner.upgrade() else {
            break;
        };
        inner.refill();
        Inner::drain(&inner);
    }
}

/// Token-bucket and concurrency-limited FIFO scheduler.
///
/// Dropping the scheduler shuts it down.
pub struct RequestScheduler {
    inner: Arc<Inner>,
    ticker: JoinHandle<()>,
}

impl RequestScheduler {
    /// Creates a scheduler and starts its refill timer.
    ///
    /// # Panics
    ///
    /// Panics when called outside a Tokio runtime.
    #[must_use]
    pub fn new(config: SchedulerConfig, circuit_breaker: Option<CircuitBreakerCheck>) -> Self {
        let config = SchedulerConfig {
            max_concurrent: config.max_concurrent.max(1),
            max_per_interval: config.max_per_interval.max(1),
            interval: config.interval.max(Duration::from_millis(1)),
        };
        let inner = Arc::new(Inner {
            config,
            state: Mutex::new(State {
                queue: VecDeque::new(),
                tokens: config.max_per_interval,
                running: 0,
                destroyed: false,
                dispatched_total: 0,
            }),
            circuit_breaker,
        });
        let ticker = tokio::spawn(run_ticker(Arc::downgrade(&inner), config.interval));

        Self { inner, ticker }
    }

    /// Returns the effective (clamped) configuration.
    #[must_use]
    pub fn config(&self) -> SchedulerConfig {
        self.inner.config
    }

    /// Queues `task` and waits for its output.
    ///
    /// # Errors
    ///
    /// Returns [`SchedulerError::CircuitOpen`] without queueing when the
    /// circuit breaker is open, [`SchedulerError::Destroyed`] after shutdown,
    /// and [`SchedulerError::Aborted`] if the task panicked.
    #[instrument(skip(self, task))]
    pub async fn submit<F>(&self, task: F, label: &str) -> Result<F::Output, SchedulerError>
    where
        F: Future + Send + 'static,
        F::Output: Send + 'static,
    {
        self.enqueue(task, label)?.wait().await
    }

    /// Queues `task` and returns a [`Ticket`] for its output.
    ///
    /// Admission is decided synchronously: a rejected task never enters the
    /// queue and never consumes a token.
    ///
    /// # Errors
    ///
    /// Returns [`SchedulerError::CircuitOpen`] when the circuit breaker is open
    /// and [`SchedulerError::Destroyed`] after shutdown.
    pub fn enqueue<F>(&self, task: F, label: &str) -> Result<Ticket<F::Output>, SchedulerError>
    where
        F: Future + Send + 'static,
        F::Output: Send + 'static,
    {
        if let Some(check) = &self.inner.circuit_breaker
            && check()
        {
            debug!(label, "circuit open, rejecting task");
            return Err(SchedulerError::CircuitOpen {
                label: label.to_string(),
            });
        }

        let (reply, receiver) = oneshot::channel();
        {
            let mut state = self.inner.lock();
            if state.destroyed {
                return Err(SchedulerError::Destroyed {
                    label: label.to_string(),
                });
            }
            state.queue.push_back(Box::new(PendingTask {
                label: label.to_string(),
                task,
                reply,
            }));
        }

        Inner::drain(&self.inner);

        Ok(Ticket {
            receiver,
            label: label.to_string(),
        })
    }

    /// Rejects every queued task with [`SchedulerError::Destroyed`], stops the
    /// refill timer, and refuses new submissions. Running tasks finish.
    pub fn shutdown(&self) {
        let rejected: Vec<Box<dyn Dispatch>> = {
            let mut state = self.inner.lock();
            if state.destroyed {
                return;
            }
            state.destroyed = true;
            state.queue.drain(..).collect()
        };
        self.ticker.abort();

        if !rejected.is_empty() {
            warn!(count = rejected.len(), "scheduler shut down with queued tasks");
        }
        for task in rejected {
            let label = task.label().to_string();
            task.reject(SchedulerError::Destroyed { label });
        }
    }

    /// Number of tasks waiting for dispatch.
    #[must_use]
    pub fn queued_len(&self) -> usize {
        self.inner.lock().queue.len()
    }

    /// Number of dispatched tasks that have not settled yet.
    #[must_use]
    pub fn in_flight(&self) -> usize {
        self.inner.lock().running
    }

    /// Tokens left in the current interval.
    #[must_use]
    pub fn available_tokens(&self) -> usize {
        self.inner.lock().tokens
    }

    /// Total number of tasks dispatched since creation.
    #[must_use]
    pub fn dispatched_total(&self) -> u64 {
        self.inner.lock().dispatched_total
    }
}

impl Drop for RequestScheduler {
    fn drop(&mut self) {
        self.shutdown();
    }
}

impl std::fmt::Debug for RequestScheduler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.inner.lock();
        f.debug_struct("RequestScheduler")
            .field("config", &self.inner.config)
            .field("queued", &state.queue.len())
            .field("running", &state.running)
            .field("tokens", &state.tokens)
            .field("destroyed", &state.destroyed)
            .finish_non_exhaustive()
    }
}
