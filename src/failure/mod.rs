//! Failure categories and the best-effort failure log.
//!
//! [`FailureLog`] is a side channel: recording never blocks and never fails the
//! caller. Records travel through a bounded channel to a background task that
//! keeps the newest `max_entries` in a JSON array file. When the channel is
//! full the record is dropped and counted.

use std::collections::VecDeque;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::sync::PoisonError;
use std::sync::atomic::{AtomicUsize, Ordering};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::asset::AssetError;
use crate::config::FailureLogConfig;

/// Coarse grouping of a failed reference.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureCategory {
    /// The reference was malformed, overlong, or not http(s).
    Validation,
    /// Transport errors and non-success HTTP statuses.
    Network,
    /// The bytes could not be recognized, decoded, or re-encoded.
    Processing,
    /// An attempt or the whole reference ran out of time.
    Timeout,
    /// Oversized bodies and local IO errors.
    Other,
}

impl FailureCategory {
    /// Human-readable name used in log lines.
    #[must_use]
    pub fn label(self) -> &'static str {
        match self {
            Self::Validation => "Validation",
            Self::Network => "Network",
            Self::Processing => "Processing",
            Self::Timeout => "Timeout",
            Self::Other => "Other",
        }
    }

    /// Categorizes an acquisition error.
    #[must_use]
    pub fn of(error: &AssetError) -> Self {
        match error {
            AssetError::Validation { .. } => Self::Validation,
            AssetError::Network { .. } | AssetError::HttpStatus { .. } => Self::Network,
            AssetError::Timeout { .. } => Self::Timeout,
            AssetError::UnsupportedFormat { .. }
            | AssetError::Processing { .. }
            | AssetError::Quality { .. } => Self::Processing,
            AssetError::TooLarge { .. } | AssetError::Io { .. } => Self::Other,
        }
    }
}

/// One entry of the failure log file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FailureRecord {
    /// When the failure was recorded.
    pub timestamp: DateTime<Utc>,
    /// Label of the document holding the reference.
    pub label: String,
    /// Position of the reference within its document.
    pub index: usize,
    /// The reference target as written in the document.
    pub original_url: String,
    /// Display form of the error.
    pub error: String,
    /// Coarse grouping of the error.
    pub category: FailureCategory,
    /// Whether the placeholder replaced the reference.
    pub fallback_used: bool,
    /// `Some(true)` when the reference failed validation and was never fetched.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub validation_failed: Option<bool>,
}

impl FailureRecord {
    /// Builds a record stamped with the current time.
    #[must_use]
    pub fn new(
        label: impl Into<String>,
        index: usize,
        original_url: impl Into<String>,
        error: impl Into<String>,
        category: FailureCategory,
    ) -> Self {
        Self {
            timestamp: Utc::now(),
            label: label.into(),
            index,
            original_url: original_url.into(),
            error: error.into(),
            category,
            fallback_used: true,
            validation_failed: None,
        }
    }

    /// Marks the record as a validation rejection.
    #[must_use]
    pub fn with_validation_failed(mut self) -> Self {
        self.validation_failed = Some(true);
        self
    }
}

/// Bounded, lossy, background-written failure log.
#[derive(Debug)]
pub struct FailureLog {
    sender: Mutex<Option<mpsc::Sender<FailureRecord>>>,
    writer: Mutex<Option<JoinHandle<()>>>,
    dropped: AtomicUsize,
}

impl FailureLog {
    /// A log that discards everything.
    #[must_use]
    pub fn disabled() -> Self {
        Self {
            sender: Mutex::new(None),
            writer: Mutex::new(None),
            dropped: AtomicUsize::new(0),
        }
    }

    /// Starts the writer task. Must be called inside a Tokio runtime.
    #[must_use]
    pub fn spawn(config: FailureLogConfig) -> Self {
        let (sender, receiver) = mpsc::channel(config.buffer.max(1));
        let writer = tokio::spawn(run_writer(
            config.path,
            config.max_entries.max(1),
            receiver,
        ));
        Self {
            sender: Mutex::new(Some(sender)),
            writer: Mutex::new(Some(writer)),
            dropped: AtomicUsize::new(0),
        }
    }

    /// Queues `record` without waiting. Dropped when disabled, closed, or full.
    pub fn record(&self, record: FailureRecord) {
        let guard = self.sender.lock().unwrap_or_else(PoisonError::into_inner);
        let Some(sender) = guard.as_ref() else {
            return;
        };
        if let Err(error) = sender.try_send(record) {
            self.dropped.fetch_add(1, Ordering::Relaxed);
            debug!(error = %error, "failure record dropped");
        }
    }

    #[must_use]
    pub fn is_enabled(&self) -> bool {
        self.sender
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .is_some()
    }

    /// Records lost to a full buffer.
    #[must_use]
    pub fn dropped(&self) -> usize {
        self.dropped.load(Ordering::Relaxed)
    }

    /// Stops accepting records and waits for the writer to flush.
    pub async fn close(&self) {
        drop(
            self.sender
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .take(),
        );
        let writer = self
            .writer
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(writer) = writer
            && let Err(error) = writer.await
        {
            warn!(error = %error, "failure log writer panicked");
        }
    }
}

async fn run_writer(path: PathBuf, max_entries: usize, mut receiver: mpsc::Receiver<FailureRecord>) {
    let mut entries = load_existing(&path).await;

    while let Some(record) = receiver.recv().await {
        entries.push_back(record);
        while let Ok(more) = receiver.try_recv() {
            entries.push_back(more);
        }
        while entries.len() > max_entries {
            entries.pop_front();
        }
        if let Err(error) = persist(&path, &entries).await {
            warn!(path = %path.display(), error = %error, "failed to write failure log");
        }
    }
}

async fn load_existing(path: &Path) -> VecDeque<FailureRecord> {
    match tokio::fs::read(path).await {
        Ok(raw) => match serde_json::from_slice::<Vec<FailureRecord>>(&raw) {
            Ok(records) => records.into(),
            Err(error) => {
                warn!(path = %path.display(), error = %error, "unreadable failure log, starting fresh");
                VecDeque::new()
            }
        },
        Err(_) => VecDeque::new(),
    }
}

async fn persist(path: &Path, entries: &VecDeque<FailureRecord>) -> std::io::Result<()> {
    if let Some(parent) = path.parent()
        && !parent.as_os_str().is_empty()
    {
        tokio::fs::create_dir_all(parent).await?;
    }
    let json = serde_json::to_vec_pretty(entries)?;
    let mut temp = path.as_os_str().to_owned();
    temp.push(".tmp");
    tokio::fs::write(&temp, json).await?;
    tokio::fs::rename(&temp, path).await
}
