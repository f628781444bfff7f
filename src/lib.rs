//! imgsync core library
//!
//! Localizes images referenced by Markdown documents: every remote image is
//! downloaded once, optimized, stored under a content-addressed name, and the
//! document is rewritten to point at the local copy.
//!
//! # Architecture
//!
//! The library is organized into the following modules:
//! - [`scheduler`] - Token-bucket request scheduler with a circuit breaker
//! - [`batch`] - Windowed concurrent processing with per-item deadlines
//! - [`timeout`] - Deadline primitives that keep timed-out work observable
//! - [`asset`] - Download, format detection, resize, compression, persistence
//! - [`cache`] - Persistent per-URL asset records and an in-memory LRU
//! - [`rewrite`] - Markdown reference extraction and splicing
//! - [`document`] - Document sources feeding the rewriter
//! - [`failure`] - Failure categories and the background failure log
//! - [`config`] - Typed configuration with documented defaults

// Clippy lints - strict for library code
#![deny(clippy::unwrap_used)]
#![deny(clippy::expect_used)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

pub mod asset;
pub mod batch;
pub mod cache;
pub mod config;
pub mod document;
pub mod failure;
pub mod rewrite;
pub mod scheduler;
pub mod timeout;

#[cfg(test)]
mod test_support;
mod user_agent;

// Re-export commonly used types
pub use asset::{AcquiredAsset, AssetError, AssetPipeline, HttpClient, ProcessingMetrics};
pub use batch::{BatchConfig, BatchOutcome, ProgressSink, process_in_batches};
pub use cache::{AssetCache, LruCache};
pub use config::{PipelineConfig, RewriterConfig};
pub use document::{Document, DocumentSource, MarkdownDirSource};
pub use failure::FailureLog;
pub use rewrite::{RewriteResult, Rewriter};
pub use scheduler::{ConsecutiveFailureBreaker, RequestScheduler, SchedulerConfig, SchedulerError};
pub use timeout::{Deadline, DeadlineError, InFlight, spawn_with_deadline, with_deadline};
