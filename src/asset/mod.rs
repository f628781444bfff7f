//! Asset acquisition: fetching remote images and materializing them locally.
//!
//! This module provides:
//! - [`HttpClient`] for size-capped HTTP fetches
//! - [`detect_format`] and [`ImageFormat`] for format sniffing
//! - [`optimize`] and the [`Compressor`] seam for resize and compression
//! - [`RetryPolicy`] and [`classify_error`] for retry decisions
//! - [`AssetPipeline`] tying it together with the asset cache

pub mod client;
mod error;
pub mod format;
pub mod metrics;
mod pipeline;
pub mod process;
pub mod retry;
mod validate;

pub use client::{FetchedAsset, HttpClient};
pub use error::AssetError;
pub use format::{ImageFormat, detect_format};
pub use metrics::{MetricsSnapshot, ProcessingMetrics, ProcessingOutcome};
pub use pipeline::{AcquiredAsset, AssetPipeline};
pub use process::{CompressError, Compressor, ImageCompressor, ProcessingLimits, optimize};
pub use retry::{FailureType, RetryDecision, RetryPolicy, classify_error};
pub use validate::{MAX_URL_LENGTH, validate_url};
