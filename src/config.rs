//! Typed configuration for the pipeline, rewriter, and failure log.
//!
//! Every tunable threshold has a named default; `Default` impls assemble them.
//! Scheduler and batch configuration live next to their modules
//! ([`SchedulerConfig`], [`BatchConfig`](crate::batch::BatchConfig)).

use std::path::PathBuf;
use std::time::Duration;

use crate::asset::client::{DEFAULT_CONNECT_TIMEOUT, DEFAULT_MAX_DOWNLOAD_BYTES, DEFAULT_READ_TIMEOUT};
use crate::asset::process::{DEFAULT_JPEG_QUALITY, ProcessingLimits};
use crate::asset::RetryPolicy;
use crate::cache::{DEFAULT_CACHE_TTL, DEFAULT_LRU_CAPACITY};

pub use crate::scheduler::SchedulerConfig;

/// Default per-attempt deadline.
pub const DEFAULT_ATTEMPT_TIMEOUT: Duration = Duration::from_secs(30);

/// Default wait for a timed-out attempt to settle before the next one starts.
pub const DEFAULT_SETTLE_GRACE: Duration = Duration::from_secs(5);

/// Default number of references acquired concurrently per rewrite.
pub const DEFAULT_REWRITE_CONCURRENCY: usize = 5;

/// Default deadline for one reference, retries included.
pub const DEFAULT_ITEM_TIMEOUT: Duration = Duration::from_secs(120);

/// Default cap on extracted references per document.
pub const DEFAULT_MAX_MATCHES: usize = 1000;

/// Inputs at least this large also get the linear-scan extraction pass.
pub const DEFAULT_LINEAR_SCAN_THRESHOLD: usize = 100_000;

/// Default link prefix for rewritten references.
pub const DEFAULT_LINK_PREFIX: &str = "assets/";

/// Default failure log capacity.
pub const DEFAULT_FAILURE_LOG_ENTRIES: usize = 1000;

/// Default failure log channel buffer.
pub const DEFAULT_FAILURE_LOG_BUFFER: usize = 256;

/// Configuration for [`AssetPipeline`](crate::asset::AssetPipeline).
#[derive(Debug, Clone)]
pub struct PipelineConfig {
    /// Where processed assets are written.
    pub asset_dir: PathBuf,
    /// Where cache records are written.
    pub cache_dir: PathBuf,
    /// Cache record time-to-live when no freshness marker is supplied.
    pub cache_ttl: Duration,
    /// Attempt count and backoff.
    pub retry: RetryPolicy,
    /// Deadline for a single attempt.
    pub attempt_timeout: Duration,
    /// How long a timed-out attempt may keep running before the next starts anyway.
    pub settle_grace: Duration,
    /// Skip and resize thresholds.
    pub limits: ProcessingLimits,
    /// Quality for the bundled JPEG compressor.
    pub jpeg_quality: u8,
    /// Response size cap.
    pub max_download_bytes: u64,
    /// HTTP connect timeout.
    pub connect_timeout: Duration,
    /// HTTP whole-request timeout.
    pub read_timeout: Duration,
    /// Capacity of the URL validation memo.
    pub validation_memo_size: usize,
}

impl PipelineConfig {
    /// Creates a config with default thresholds.
    #[must_use]
    pub fn new(asset_dir: impl Into<PathBuf>, cache_dir: impl Into<PathBuf>) -> Self {
        Self {
            asset_dir: asset_dir.into(),
            cache_dir: cache_dir.into(),
            cache_ttl: DEFAULT_CACHE_TTL,
            retry: RetryPolicy::default(),
            attempt_timeout: DEFAULT_ATTEMPT_TIMEOUT,
            settle_grace: DEFAULT_SETTLE_GRACE,
            limits: ProcessingLimits::default(),
            jpeg_quality: DEFAULT_JPEG_QUALITY,
            max_download_bytes: DEFAULT_MAX_DOWNLOAD_BYTES,
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
            read_timeout: DEFAULT_READ_TIMEOUT,
            validation_memo_size: DEFAULT_LRU_CAPACITY,
        }
    }
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self::new("assets", ".imgsync-cache")
    }
}

/// Configuration for [`Rewriter`](crate::rewrite::Rewriter).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RewriterConfig {
    /// References acquired concurrently.
    pub max_concurrent: usize,
    /// Deadline per reference, retries included.
    pub item_timeout: Duration,
    /// Hard cap on extracted references.
    pub max_matches: usize,
    /// Input size (bytes) from which the linear-scan pass also runs.
    pub linear_scan_threshold: usize,
    /// Prepended to the asset file name in rewritten references.
    pub link_prefix: String,
}

impl Default for RewriterConfig {
    fn default() -> Self {
        Self {
            max_concurrent: DEFAULT_REWRITE_CONCURRENCY,
            item_timeout: DEFAULT_ITEM_TIMEOUT,
            max_matches: DEFAULT_MAX_MATCHES,
            linear_scan_threshold: DEFAULT_LINEAR_SCAN_THRESHOLD,
            link_prefix: DEFAULT_LINK_PREFIX.to_string(),
        }
    }
}

/// Configuration for [`FailureLog::spawn`](crate::failure::FailureLog::spawn).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FailureLogConfig {
    /// JSON file the log is written to.
    pub path: PathBuf,
    /// Oldest records are dropped beyond this count.
    pub max_entries: usize,
    /// Channel capacity; records are dropped when it is full.
    pub buffer: usize,
}

impl FailureLogConfig {
    /// Creates a config for `path` with default limits.
    #[must_use]
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            max_entries: DEFAULT_FAILURE_LOG_ENTRIES,
            buffer: DEFAULT_FAILURE_LOG_BUFFER,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pipeline_defaults() {
        let config = PipelineConfig::default();
        assert_eq!(config.retry.max_attempts(), 3);
        assert_eq!(config.attempt_timeout, Duration::from_secs(30));
        assert_eq!(config.settle_grace, Duration::from_secs(5));
        assert_eq!(config.limits.min_process_bytes, 10 * 1024);
        assert_eq!(config.limits.png_skip_bit_depth, 4);
        assert_eq!(config.limits.max_width, 1920);
        assert_eq!(config.cache_ttl, Duration::from_secs(30 * 24 * 60 * 60));
        assert_eq!(config.validation_memo_size, 512);
    }

    #[test]
    fn test_rewriter_defaults() {
        let config = RewriterConfig::default();
        assert_eq!(config.max_concurrent, 5);
        assert_eq!(config.max_matches, 1000);
        assert_eq!(config.linear_scan_threshold, 100_000);
        assert_eq!(config.link_prefix, "assets/");
    }

    #[test]
    fn test_failure_log_defaults() {
        let config = FailureLogConfig::new("failures.json");
        assert_eq!(config.max_entries, 1000);
        assert_eq!(config.buffer, 256);
    }
}
