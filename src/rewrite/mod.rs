//! Markdown image localization.
//!
//! [`Rewriter`] extracts image references from a document, acquires every
//! distinct valid URL once through the [`AssetPipeline`], and splices local
//! references (or placeholders for failures) back into the text. Text outside
//! the replaced spans is left byte-identical.
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//!
//! use imgsync_core::asset::AssetPipeline;
//! use imgsync_core::config::{PipelineConfig, RewriterConfig};
//! use imgsync_core::rewrite::Rewriter;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let pipeline = Arc::new(AssetPipeline::new(PipelineConfig::default())?);
//! let rewriter = Rewriter::new(pipeline, RewriterConfig::default());
//! let result = rewriter.rewrite("![logo](https://example.com/logo.png)", "README").await;
//! println!("{}", result.text);
//! # Ok(())
//! # }
//! ```

mod extract;
mod sanitize;

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::{debug, info, instrument, warn};

pub use extract::{AssetReference, ExtractionLimits, extract_references};
pub use sanitize::sanitize;

use crate::asset::{AcquiredAsset, AssetError, AssetPipeline, MetricsSnapshot, ProcessingMetrics};
use crate::batch::{BatchConfig, BatchOutcome, BatchRejection, ProgressSink, process_in_batches};
use crate::config::RewriterConfig;
use crate::failure::{FailureCategory, FailureLog, FailureRecord};

/// Aggregate counts of one rewrite.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RewriteStats {
    /// References replaced with a local asset.
    pub successful_assets: usize,
    /// References replaced with a placeholder.
    pub total_failures: usize,
    /// Bytes saved across distinct newly processed assets.
    pub total_bytes_saved: u64,
}

/// Output of [`Rewriter::rewrite`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RewriteResult {
    /// The rewritten document.
    pub text: String,
    /// Per-reference counts.
    pub stats: RewriteStats,
    /// Processing paths taken by the assets of this rewrite.
    pub metrics: MetricsSnapshot,
}

/// Full set of inputs for one rewrite.
#[derive(Clone)]
pub struct RewriteRequest<'a> {
    /// Markdown source to rewrite.
    pub text: &'a str,
    /// Document label used in logs, cache records, and failure records.
    pub label: &'a str,
    /// Cache records older than this are refetched.
    pub freshness_marker: Option<DateTime<Utc>>,
    /// Per-URL acquisition progress.
    pub progress: Option<Arc<dyn ProgressSink>>,
}

impl<'a> RewriteRequest<'a> {
    /// A request with no freshness marker and no progress sink.
    #[must_use]
    pub fn new(text: &'a str, label: &'a str) -> Self {
        Self {
            text,
            label,
            freshness_marker: None,
            progress: None,
        }
    }

    #[must_use]
    pub fn with_freshness_marker(mut self, marker: Option<DateTime<Utc>>) -> Self {
        self.freshness_marker = marker;
        self
    }

    #[must_use]
    pub fn with_progress(mut self, progress: Arc<dyn ProgressSink>) -> Self {
        self.progress = Some(progress);
        self
    }
}

enum Resolution {
    Local(AcquiredAsset),
    Failed {
        error: String,
        category: FailureCategory,
        validation_failed: bool,
    },
}

/// Rewrites image references in Markdown text to local assets.
#[derive(Debug)]
pub struct Rewriter {
    pipeline: Arc<AssetPipeline>,
    config: RewriterConfig,
    failure_log: Arc<FailureLog>,
}

impl Rewriter {
    /// Creates a rewriter without a failure log.
    #[must_use]
    pub fn new(pipeline: Arc<AssetPipeline>, config: RewriterConfig) -> Self {
        Self {
            pipeline,
            config,
            failure_log: Arc::new(FailureLog::disabled()),
        }
    }

    /// Sends failure records to `failure_log`.
    #[must_use]
    pub fn with_failure_log(mut self, failure_log: Arc<FailureLog>) -> Self {
        self.failure_log = failure_log;
        self
    }

    #[must_use]
    pub fn config(&self) -> &RewriterConfig {
        &self.config
    }

    /// Rewrites `text`, using TTL-based cache freshness.
    pub async fn rewrite(&self, text: &str, label: &str) -> RewriteResult {
        self.rewrite_request(RewriteRequest::new(text, label)).await
    }

    /// Rewrites `text`, refetching assets cached before `marker`.
    pub async fn rewrite_with_marker(
        &self,
        text: &str,
        label: &str,
        marker: Option<DateTime<Utc>>,
    ) -> RewriteResult {
        self.rewrite_request(RewriteRequest::new(text, label).with_freshness_marker(marker))
            .await
    }

    /// Rewrites `request.text`. Never fails: unresolvable references become
    /// `[image unavailable: <alt>](<url>)` placeholders.
    #[instrument(skip(self, request), fields(label = %request.label, text_len = request.text.len()))]
    pub async fn rewrite_request(&self, request: RewriteRequest<'_>) -> RewriteResult {
        let limits = ExtractionLimits {
            max_matches: self.config.max_matches,
            linear_scan_threshold: self.config.linear_scan_threshold,
        };
        let references = extract_references(request.text, &limits);
        let metrics = Arc::new(ProcessingMetrics::new());

        if references.is_empty() {
            debug!("no image references");
            return RewriteResult {
                text: request.text.to_string(),
                stats: RewriteStats::default(),
                metrics: metrics.snapshot(),
            };
        }

        let mut resolutions: HashMap<String, Resolution> = HashMap::new();
        let mut unique_urls: Vec<String> = Vec::new();
        for reference in &references {
            if resolutions.contains_key(&reference.url) || unique_urls.contains(&reference.url) {
                continue;
            }
            match self.pipeline.validate(&reference.url) {
                Ok(_) => unique_urls.push(reference.url.clone()),
                Err(error) => {
                    debug!(url = %reference.url, error = %error, "invalid reference");
                    resolutions.insert(
                        reference.url.clone(),
                        Resolution::Failed {
                            error: error.to_string(),
                            category: FailureCategory::Validation,
                            validation_failed: true,
                        },
                    );
                }
            }
        }

        let mut stats = RewriteStats::default();
        if !unique_urls.is_empty() {
            let outcomes = self
                .acquire_all(unique_urls.clone(), &request, &metrics)
                .await;
            for (url, outcome) in unique_urls.into_iter().zip(outcomes) {
                let resolution = match outcome {
                    BatchOutcome::Fulfilled(asset) => {
                        stats.total_bytes_saved += asset.bytes_saved;
                        Resolution::Local(asset)
                    }
                    BatchOutcome::Rejected(BatchRejection::Worker(error)) => Resolution::Failed {
                        category: FailureCategory::of(&error),
                        error: error.to_string(),
                        validation_failed: false,
                    },
                    BatchOutcome::Rejected(BatchRejection::Deadline(error)) => Resolution::Failed {
                        error: error.to_string(),
                        category: FailureCategory::Timeout,
                        validation_failed: false,
                    },
                };
                resolutions.insert(url, resolution);
            }
        }

        let mut replacements: Vec<(usize, usize, String)> = Vec::with_capacity(references.len());
        for reference in &references {
            let replacement = match resolutions.get(&reference.url) {
                Some(Resolution::Local(asset)) => {
                    stats.successful_assets += 1;
                    self.local_reference(reference, asset)
                }
                Some(Resolution::Failed {
                    error,
                    category,
                    validation_failed,
                }) => {
                    stats.total_failures += 1;
                    let mut record = FailureRecord::new(
                        request.label,
                        reference.index,
                        &reference.url,
                        error.as_str(),
                        *category,
                    );
                    if *validation_failed {
                        record = record.with_validation_failed();
                    }
                    self.failure_log.record(record);
                    placeholder(reference)
                }
                None => {
                    stats.total_failures += 1;
                    placeholder(reference)
                }
            };
            replacements.push((
                reference.start,
                reference.end,
                sanitize(&replacement).into_owned(),
            ));
        }

        let text = splice(request.text, replacements);

        info!(
            references = references.len(),
            successful = stats.successful_assets,
            failed = stats.total_failures,
            bytes_saved = stats.total_bytes_saved,
            "rewrite complete"
        );
        RewriteResult {
            text,
            stats,
            metrics: metrics.snapshot(),
        }
    }

    async fn acquire_all(
        &self,
        urls: Vec<String>,
        request: &RewriteRequest<'_>,
        metrics: &Arc<ProcessingMetrics>,
    ) -> Vec<BatchOutcome<AcquiredAsset, AssetError>> {
        let mut config = BatchConfig::new(self.config.max_concurrent)
            .with_timeout(self.config.item_timeout)
            .with_label(request.label);
        if let Some(progress) = &request.progress {
            config = config.with_progress(Arc::clone(progress));
        }

        let label = request.label.to_string();
        let marker = request.freshness_marker;
        let worker = |url: String, index: usize| {
            let pipeline = Arc::clone(&self.pipeline);
            let metrics = Arc::clone(metrics);
            let label = label.clone();
            async move {
                pipeline
                    .acquire_with_marker(&url, &label, index, &metrics, marker)
                    .await
            }
        };

        match process_in_batches(urls, worker, &config).await {
            Ok(outcomes) => outcomes,
            Err(error) => {
                // Unreachable with a non-empty list and a clamped ceiling.
                warn!(error = %error, "batch rejected input");
                Vec::new()
            }
        }
    }

    fn local_reference(&self, reference: &AssetReference, asset: &AcquiredAsset) -> String {
        let image = format!(
            "![{}]({}{})",
            reference.alt_text,
            self.config.link_prefix,
            asset.file_name()
        );
        match &reference.link_url {
            Some(link) => format!("[{image}]({link})"),
            None => image,
        }
    }
}

fn placeholder(reference: &AssetReference) -> String {
    let alt = if reference.alt_text.trim().is_empty() {
        "image"
    } else {
        reference.alt_text.as_str()
    };
    format!("[image unavailable: {alt}]({})", reference.url)
}

/// Applies `(start, end, replacement)` edits in descending start order.
///
/// Only the replaced spans change; every other byte of `text` is kept.
fn splice(text: &str, mut replacements: Vec<(usize, usize, String)>) -> String {
    replacements.sort_by(|a, b| b.0.cmp(&a.0));
    let mut output = text.to_string();
    for (start, end, replacement) in replacements {
        output.replace_range(start..end, &replacement);
    }
    output
}
