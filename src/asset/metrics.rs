//! Per-rewrite processing counters.

use std::sync::atomic::{AtomicUsize, Ordering};

use serde::Serialize;

/// Which processing path an acquired asset took.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessingOutcome {
    /// Below the minimum size; persisted unmodified.
    SkippedTooSmall,
    /// Already optimized (marker or low PNG bit depth); persisted unmodified.
    SkippedAlreadyOptimized,
    /// Non-resizable format (GIF, SVG); persisted unmodified.
    Passthrough,
    /// Within the width bound; compressed without resizing.
    ResizeSkipped,
    /// Resized and compressed.
    Processed,
}

/// Counters shared by the concurrent acquisitions of one rewrite call.
///
/// Uses atomic counters for thread-safe updates from concurrent tasks.
#[derive(Debug, Default)]
pub struct ProcessingMetrics {
    skipped_too_small: AtomicUsize,
    skipped_already_optimized: AtomicUsize,
    resize_skipped: AtomicUsize,
    passthrough: AtomicUsize,
    processed: AtomicUsize,
    compression_fallbacks: AtomicUsize,
    cache_hits: AtomicUsize,
}

impl ProcessingMetrics {
    /// Creates a tracker with zero counts.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Counts one asset under its processing path.
    pub fn record(&self, outcome: ProcessingOutcome) {
        let counter = match outcome {
            ProcessingOutcome::SkippedTooSmall => &self.skipped_too_small,
            ProcessingOutcome::SkippedAlreadyOptimized => &self.skipped_already_optimized,
            ProcessingOutcome::Passthrough => &self.passthrough,
            ProcessingOutcome::ResizeSkipped => &self.resize_skipped,
            ProcessingOutcome::Processed => &self.processed,
        };
        counter.fetch_add(1, Ordering::SeqCst);
    }

    /// Counts a compressor failure that fell back to the original bytes.
    pub fn record_compression_fallback(&self) {
        self.compression_fallbacks.fetch_add(1, Ordering::SeqCst);
    }

    /// Counts a reference served from the cache.
    pub fn record_cache_hit(&self) {
        self.cache_hits.fetch_add(1, Ordering::SeqCst);
    }

    /// Returns the number of compression fallbacks.
    #[must_use]
    pub fn compression_fallbacks(&self) -> usize {
        self.compression_fallbacks.load(Ordering::SeqCst)
    }

    /// Returns the number of cache hits.
    #[must_use]
    pub fn cache_hits(&self) -> usize {
        self.cache_hits.load(Ordering::SeqCst)
    }

    /// Returns a point-in-time copy of every counter.
    #[must_use]
    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            skipped_too_small: self.skipped_too_small.load(Ordering::SeqCst),
            skipped_already_optimized: self.skipped_already_optimized.load(Ordering::SeqCst),
            resize_skipped: self.resize_skipped.load(Ordering::SeqCst),
            passthrough: self.passthrough.load(Ordering::SeqCst),
            processed: self.processed.load(Ordering::SeqCst),
            compression_fallbacks: self.compression_fallbacks(),
            cache_hits: self.cache_hits(),
        }
    }
}

/// Plain copy of [`ProcessingMetrics`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MetricsSnapshot {
    /// Persisted unmodified because they were below the processing size.
    pub skipped_too_small: usize,
    /// Persisted unmodified because optimizer markers or a low bit depth were found.
    pub skipped_already_optimized: usize,
    /// Already within `max_width`; compressed only.
    pub resize_skipped: usize,
    /// Non-resizable formats (GIF, SVG), persisted unmodified.
    pub passthrough: usize,
    /// Resized and compressed.
    pub processed: usize,
    /// Compressor errors that fell back to the uncompressed bytes.
    pub compression_fallbacks: usize,
    /// Acquisitions served from the cache.
    pub cache_hits: usize,
}

impl MetricsSnapshot {
    /// Number of assets that went through the processing pipeline (cache hits excluded).
    #[must_use]
    pub fn total_processed(&self) -> usize {
        self.skipped_too_small
            + self.skipped_already_optimized
            + self.resize_skipped
            + self.passthrough
            + self.processed
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_record_routes_to_counter() {
        let metrics = ProcessingMetrics::new();
        metrics.record(ProcessingOutcome::SkippedTooSmall);
        metrics.record(ProcessingOutcome::Processed);
        metrics.record(ProcessingOutcome::Processed);
        metrics.record_cache_hit();
        metrics.record_compression_fallback();

        let snapshot = metrics.snapshot();
        assert_eq!(snapshot.skipped_too_small, 1);
        assert_eq!(snapshot.processed, 2);
        assert_eq!(snapshot.cache_hits, 1);
        assert_eq!(snapshot.compression_fallbacks, 1);
        assert_eq!(snapshot.total_processed(), 3);
    }

    #[test]
    fn test_snapshot_serializes_camel_case() {
        let json = serde_json::to_value(MetricsSnapshot::default()).unwrap_or_default();
        assert!(json.get("skippedAlreadyOptimized").is_some());
        assert!(json.get("compressionFallbacks").is_some());
    }
}
