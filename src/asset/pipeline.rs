//! Asset acquisition: validate, consult cache, fetch with retries, process, persist.
//!
//! # Overview
//!
//! [`AssetPipeline::acquire`] turns a remote image reference into a local file:
//!
//! 1. The reference is validated (memoized in an LRU).
//! 2. A fresh cache record short-circuits everything else.
//! 3. Otherwise up to `max_attempts` attempts run, each as its own task under a
//!    deadline. A timed-out attempt keeps running; before the next attempt
//!    starts, it is given `settle_grace` to finish so two attempts never race
//!    on the same destination file.
//! 4. Each attempt fetches, detects the format, optimizes on the blocking pool,
//!    and writes `asset_dir/<key>.<ext>` through a temp file and rename.
//!
//! Concurrent acquisitions of one URL in this process are serialized by a
//! per-destination mutex, so the second caller finds the first caller's cache
//! record.

use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, PoisonError};

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use tracing::{debug, info, instrument, warn};
use url::Url;

use super::client::HttpClient;
use super::format::detect_format;
use super::metrics::{ProcessingMetrics, ProcessingOutcome};
use super::process::{Compressor, ImageCompressor, ProcessingLimits, optimize};
use super::retry::{FailureType, RetryDecision, classify_error, retry_after_delay};
use super::validate::validate_url;
use super::AssetError;
use crate::cache::{AssetCache, LruCache, cache_key};
use crate::config::PipelineConfig;
use crate::timeout::{Deadline, InFlight, spawn_with_deadline};

/// Length of the key prefix used for asset file names.
const FILE_STEM_LEN: usize = 16;

/// A locally materialized asset.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AcquiredAsset {
    /// Where the asset lives on disk.
    pub local_path: PathBuf,
    /// Original size minus persisted size (0 for cache hits).
    pub bytes_saved: u64,
    /// True when served from the cache without network access.
    pub from_cache: bool,
}

impl AcquiredAsset {
    /// File name component of [`AcquiredAsset::local_path`].
    #[must_use]
    pub fn file_name(&self) -> String {
        self.local_path
            .file_name()
            .map(|name| name.to_string_lossy().into_owned())
            .unwrap_or_default()
    }
}

#[derive(Debug)]
struct StoredAsset {
    path: PathBuf,
    bytes_saved: u64,
    outcome: ProcessingOutcome,
    compression_fallback: bool,
}

/// Owned inputs of one attempt; attempts run as detached tasks.
struct AttemptContext {
    client: HttpClient,
    compressor: Arc<dyn Compressor>,
    limits: ProcessingLimits,
    url: String,
    asset_dir: PathBuf,
    file_stem: String,
    attempt: u32,
}

/// Downloads, optimizes, and caches remote assets.
pub struct AssetPipeline {
    client: HttpClient,
    cache: AssetCache,
    compressor: Arc<dyn Compressor>,
    config: PipelineConfig,
    destination_locks: DashMap<String, Arc<tokio::sync::Mutex<()>>>,
    validated: Mutex<LruCache<String, Result<Url, String>>>,
}

impl AssetPipeline {
    /// Creates a pipeline with an HTTP client and compressor built from `config`.
    ///
    /// # Errors
    ///
    /// Returns the builder error if the HTTP client cannot be created.
    pub fn new(config: PipelineConfig) -> Result<Self, reqwest::Error> {
        let client = HttpClient::with_limits(
            config.connect_timeout,
            config.read_timeout,
            config.max_download_bytes,
        )?;
        Ok(Self::with_client(config, client))
    }

    /// Creates a pipeline around an existing client.
    #[must_use]
    pub fn with_client(config: PipelineConfig, client: HttpClient) -> Self {
        let cache = AssetCache::new(config.cache_dir.clone(), config.cache_ttl);
        let compressor: Arc<dyn Compressor> = Arc::new(ImageCompressor::new(config.jpeg_quality));
        let validated = Mutex::new(LruCache::new(config.validation_memo_size));
        Self {
            client,
            cache,
            compressor,
            config,
            destination_locks: DashMap::new(),
            validated,
        }
    }

    /// Replaces the compressor.
    #[must_use]
    pub fn with_compressor(mut self, compressor: Arc<dyn Compressor>) -> Self {
        self.compressor = compressor;
        self
    }

    /// Returns the cache this pipeline reads and writes.
    #[must_use]
    pub fn cache(&self) -> &AssetCache {
        &self.cache
    }

    /// Returns the configuration.
    #[must_use]
    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    /// Returns the path an asset from `url` would be written to, minus extension.
    #[must_use]
    pub fn destination_stem(&self, url: &str) -> PathBuf {
        self.config.asset_dir.join(file_stem(url))
    }

    /// Validates `url`, memoizing the verdict.
    ///
    /// # Errors
    ///
    /// Returns [`AssetError::Validation`] for malformed, overlong, or
    /// non-http(s) references.
    pub fn validate(&self, url: &str) -> Result<Url, AssetError> {
        let key = url.to_string();
        let memo = self
            .validated
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&key)
            .cloned();
        match memo {
            Some(Ok(parsed)) => return Ok(parsed),
            Some(Err(reason)) => return Err(AssetError::validation(url, reason)),
            None => {}
        }

        let verdict = validate_url(url);
        let entry = match &verdict {
            Ok(parsed) => Ok(parsed.clone()),
            Err(AssetError::Validation { reason, .. }) => Err(reason.clone()),
            Err(other) => Err(other.to_string()),
        };
        self.validated
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(key, entry);
        verdict
    }

    /// Acquires `url` without a freshness marker (TTL-based cache validity).
    ///
    /// # Errors
    ///
    /// See [`AssetPipeline::acquire_with_marker`].
    pub async fn acquire(
        &self,
        url: &str,
        label: &str,
        index: usize,
        metrics: &ProcessingMetrics,
    ) -> Result<AcquiredAsset, AssetError> {
        self.acquire_with_marker(url, label, index, metrics, None)
            .await
    }

    /// Acquires `url`, treating cache records older than `freshness_marker` as stale.
    ///
    /// On success the processing path is counted in `metrics` exactly once.
    ///
    /// # Errors
    ///
    /// Returns [`AssetError::Validation`] for bad references (never retried),
    /// or the last attempt's error once retries are exhausted or a permanent
    /// failure is hit.
    #[instrument(skip(self, metrics, freshness_marker), fields(url = %url))]
    pub async fn acquire_with_marker(
        &self,
        url: &str,
        label: &str,
        index: usize,
        metrics: &ProcessingMetrics,
        freshness_marker: Option<DateTime<Utc>>,
    ) -> Result<AcquiredAsset, AssetError> {
        self.validate(url)?;

        let stem = file_stem(url);
        let lock = Arc::clone(
            self.destination_locks
                .entry(stem.clone())
                .or_insert_with(|| Arc::new(tokio::sync::Mutex::new(())))
                .value(),
        );
        let result = {
            let _destination = lock.lock().await;
            self.acquire_locked(url, label, index, metrics, freshness_marker, &stem)
                .await
        };

        drop(lock);
        self.destination_locks
            .remove_if(&stem, |_, lock| Arc::strong_count(lock) == 1);
        result
    }

    /// Number of destinations with an acquisition in progress or queued.
    #[must_use]
    pub fn active_destinations(&self) -> usize {
        self.destination_locks.len()
    }

    async fn acquire_locked(
        &self,
        url: &str,
        label: &str,
        index: usize,
        metrics: &ProcessingMetrics,
        freshness_marker: Option<DateTime<Utc>>,
        stem: &str,
    ) -> Result<AcquiredAsset, AssetError> {
        if let Some(entry) = self.cache.get(url, freshness_marker).await {
            metrics.record_cache_hit();
            debug!(local_path = %entry.local_path.display(), "cache hit");
            return Ok(AcquiredAsset {
                local_path: entry.local_path,
                bytes_saved: 0,
                from_cache: true,
            });
        }

        let stored = self.fetch_with_retry(url, label, index, stem).await?;

        metrics.record(stored.outcome);
        if stored.compression_fallback {
            metrics.record_compression_fallback();
        }
        if let Err(error) = self
            .cache
            .set(url, &stored.path, label, freshness_marker)
            .await
        {
            warn!(error = %error, "failed to write cache record");
        }

        info!(
            local_path = %stored.path.display(),
            bytes_saved = stored.bytes_saved,
            "asset acquired"
        );
        Ok(AcquiredAsset {
            local_path: stored.path,
            bytes_saved: stored.bytes_saved,
            from_cache: false,
        })
    }

    async fn fetch_with_retry(
        &self,
        url: &str,
        label: &str,
        index: usize,
        stem: &str,
    ) -> Result<StoredAsset, AssetError> {
        let mut attempt = 0_u32;
        let mut previous: Option<InFlight<Result<StoredAsset, AssetError>>> = None;

        loop {
            attempt += 1;

            if let Some(in_flight) = previous.take() {
                in_flight.settle(self.config.settle_grace).await;
            }

            let context = AttemptContext {
                client: self.client.clone(),
                compressor: Arc::clone(&self.compressor),
                limits: self.config.limits,
                url: url.to_string(),
                asset_dir: self.config.asset_dir.clone(),
                file_stem: stem.to_string(),
                attempt,
            };
            let attempt_label = format!("{label} #{index} attempt {attempt}");
            let result = match spawn_with_deadline(
                run_attempt(context),
                self.config.attempt_timeout,
                &attempt_label,
            )
            .await
            {
                Deadline::Settled(Ok(result)) => result,
                Deadline::Settled(Err(aborted)) => {
                    Err(AssetError::processing(url, aborted.to_string()))
                }
                Deadline::Expired(in_flight) => {
                    previous = Some(in_flight);
                    Err(AssetError::timeout(url))
                }
            };

            let error = match result {
                Ok(stored) => return Ok(stored),
                Err(error) => error,
            };

            let failure_type = classify_error(&error);
            match self.config.retry.should_retry(failure_type, attempt) {
                RetryDecision::Retry {
                    delay,
                    attempt: next_attempt,
                } => {
                    let delay = if failure_type == FailureType::RateLimited {
                        retry_after_delay(&error).unwrap_or(delay)
                    } else {
                        delay
                    };
                    info!(
                        attempt,
                        next_attempt,
                        delay_ms = delay.as_millis(),
                        error = %error,
                        "retrying asset"
                    );
                    tokio::time::sleep(delay).await;
                }
                RetryDecision::DoNotRetry { reason } => {
                    if let Some(in_flight) = previous.take() {
                        in_flight.settle(self.config.settle_grace).await;
                    }
                    warn!(attempt, reason = %reason, error = %error, "asset acquisition failed");
                    return Err(error);
                }
            }
        }
    }
}

impl std::fmt::Debug for AssetPipeline {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AssetPipeline")
            .field("client", &self.client)
            .field("cache", &self.cache)
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

async fn run_attempt(context: AttemptContext) -> Result<StoredAsset, AssetError> {
    let AttemptContext {
        client,
        compressor,
        limits,
        url,
        asset_dir,
        file_stem,
        attempt,
    } = context;

    let fetched = client.fetch(&url).await?;
    let format = detect_format(&fetched.bytes, fetched.content_type.as_deref(), &url)
        .ok_or_else(|| AssetError::unsupported_format(&url, fetched.content_type.clone()))?;
    let original_len = fetched.bytes.len() as u64;

    let task_url = url.clone();
    let optimized = tokio::task::spawn_blocking(move || {
        optimize(
            &task_url,
            fetched.bytes,
            format,
            &limits,
            compressor.as_ref(),
        )
    })
    .await
    .map_err(|e| AssetError::processing(&url, format!("processing task failed: {e}")))??;

    let path = asset_dir.join(format!("{file_stem}.{}", format.extension()));
    tokio::fs::create_dir_all(&asset_dir)
        .await
        .map_err(|e| AssetError::io(&asset_dir, e))?;
    write_atomically(&path, &optimized.bytes, attempt).await?;

    Ok(StoredAsset {
        path,
        bytes_saved: original_len.saturating_sub(optimized.bytes.len() as u64),
        outcome: optimized.outcome,
        compression_fallback: optimized.compression_fallback,
    })
}

async fn write_atomically(path: &Path, bytes: &[u8], attempt: u32) -> Result<(), AssetError> {
    let mut temp = path.as_os_str().to_owned();
    temp.push(format!(".{attempt}.part"));
    let temp = PathBuf::from(temp);

    tokio::fs::write(&temp, bytes)
        .await
        .map_err(|e| AssetError::io(&temp, e))?;
    if let Err(error) = tokio::fs::rename(&temp, path).await {
        let _ = tokio::fs::remove_file(&temp).await;
        return Err(AssetError::io(path, error));
    }
    Ok(())
}

fn file_stem(url: &str) -> String {
    let mut key = cache_key(url);
    key.truncate(FILE_STEM_LEN);
    key
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use std::io::Cursor;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    use image::{DynamicImage, Rgb, RgbImage};
    use tempfile::TempDir;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, Request, Respond, ResponseTemplate};

    use super::*;
    use crate::asset::RetryPolicy;
    use crate::asset::process::CompressError;
    use crate::asset::format::ImageFormat;
    use crate::test_support::socket_guard::start_mock_server_or_skip;

    fn png_bytes(width: u32, height: u32, seed: u8) -> Vec<u8> {
        let image = RgbImage::from_fn(width, height, |x, y| {
            Rgb([seed, (x % 256) as u8, (y % 256) as u8])
        });
        let mut bytes = Vec::new();
        DynamicImage::ImageRgb8(image)
            .write_to(&mut Cursor::new(&mut bytes), image::ImageFormat::Png)
            .unwrap();
        bytes
    }

    fn test_config(temp: &TempDir) -> PipelineConfig {
        let mut config = PipelineConfig::new(temp.path().join("assets"), temp.path().join("cache"));
        config.retry = RetryPolicy::new(3, Duration::from_millis(10), Duration::from_millis(50), 2.0)
            .with_max_jitter(Duration::ZERO);
        config.attempt_timeout = Duration::from_secs(5);
        config.settle_grace = Duration::from_secs(5);
        config
    }

    struct RefusingCompressor;

    impl Compressor for RefusingCompressor {
        fn compress(&self, _bytes: &[u8], _format: ImageFormat) -> Result<Vec<u8>, CompressError> {
            Err(CompressError::QualityTooLow("refused".to_string()))
        }
    }

    /// Fails with 500 for the first `failures` requests, then serves `body`.
    struct FlakyResponder {
        failures: usize,
        calls: AtomicUsize,
        body: Vec<u8>,
    }

    impl Respond for FlakyResponder {
        fn respond(&self, _request: &Request) -> ResponseTemplate {
            let call = self.calls.fetch_add(1, Ordering::SeqCst);
            if call < self.failures {
                ResponseTemplate::new(500)
            } else {
                ResponseTemplate::new(200)
                    .insert_header("Content-Type", "image/png")
                    .set_body_bytes(self.body.clone())
            }
        }
    }

    // ==================== Validation Tests ====================

    #[tokio::test]
    async fn test_invalid_reference_never_hits_network() {
        let temp = TempDir::new().unwrap();
        let pipeline = AssetPipeline::new(test_config(&temp)).unwrap();
        let metrics = ProcessingMetrics::new();

        let result = pipeline
            .acquire("javascript:alert(1)", "Doc", 0, &metrics)
            .await;
        assert!(matches!(result, Err(AssetError::Validation { .. })));

        // Memoized verdict gives the same answer.
        assert!(pipeline.validate("javascript:alert(1)").is_err());
        assert_eq!(metrics.snapshot().total_processed(), 0);
    }

    #[test]
    fn test_validation_memo_serves_parsed_url() {
        let temp = TempDir::new().unwrap();
        let pipeline = AssetPipeline::new(test_config(&temp)).unwrap();

        let first = pipeline.validate("https://example.com/a.png").unwrap();
        let second = pipeline.validate("https://example.com/a.png").unwrap();
        assert_eq!(first, second);
        assert_eq!(second.host_str(), Some("example.com"));

        let memo = pipeline.validated.lock().unwrap();
        assert_eq!(memo.len(), 1);
        assert!(matches!(
            memo.peek(&"https://example.com/a.png".to_string()),
            Some(Ok(_))
        ));
    }

    // ==================== Acquisition Tests ====================

    #[tokio::test]
    async fn test_acquire_writes_asset_and_cache_record() {
        let Some(mock_server) = start_mock_server_or_skip().await else {
            return;
        };
        let temp = TempDir::new().unwrap();
        let body = png_bytes(8, 8, 1);

        Mock::given(method("GET"))
            .and(path("/a.png"))
            .respond_with(ResponseTemplate::new(200).set_body_bytes(body.clone()))
            .mount(&mock_server)
            .await;

        let pipeline = AssetPipeline::new(test_config(&temp)).unwrap();
        let metrics = ProcessingMetrics::new();
        let url = format!("{}/a.png", mock_server.uri());

        let acquired = pipeline.acquire(&url, "Doc", 0, &metrics).await.unwrap();

        assert!(!acquired.from_cache);
        assert_eq!(acquired.local_path.extension().unwrap(), "png");
        assert_eq!(std::fs::read(&acquired.local_path).unwrap(), body);
        assert!(pipeline.cache().has(&url, None).await);
        assert_eq!(metrics.snapshot().skipped_too_small, 1);
    }

    #[tokio::test]
    async fn test_retries_transient_failure() {
        let Some(mock_server) = start_mock_server_or_skip().await else {
            return;
        };
        let temp = TempDir::new().unwrap();
        let body = png_bytes(8, 8, 2);

        Mock::given(method("GET"))
            .and(path("/flaky.png"))
            .respond_with(FlakyResponder {
                failures: 2,
                calls: AtomicUsize::new(0),
                body: body.clone(),
            })
            .expect(3)
            .mount(&mock_server)
            .await;

        let pipeline = AssetPipeline::new(test_config(&temp)).unwrap();
        let metrics = ProcessingMetrics::new();
        let url = format!("{}/flaky.png", mock_server.uri());

        let acquired = pipeline.acquire(&url, "Doc", 0, &metrics).await.unwrap();
        assert_eq!(std::fs::read(&acquired.local_path).unwrap(), body);
    }

    #[tokio::test]
    async fn test_permanent_failure_not_retried() {
        let Some(mock_server) = start_mock_server_or_skip().await else {
            return;
        };
        let temp = TempDir::new().unwrap();

        Mock::given(method("GET"))
            .and(path("/missing.png"))
            .respond_with(ResponseTemplate::new(404))
            .expect(1)
            .mount(&mock_server)
            .await;

        let pipeline = AssetPipeline::new(test_config(&temp)).unwrap();
        let metrics = ProcessingMetrics::new();
        let url = format!("{}/missing.png", mock_server.uri());

        let result = pipeline.acquire(&url, "Doc", 0, &metrics).await;
        assert!(matches!(
            result,
            Err(AssetError::HttpStatus { status: 404, .. })
        ));
    }

    #[tokio::test]
    async fn test_unrecognized_bytes_are_unsupported() {
        let Some(mock_server) = start_mock_server_or_skip().await else {
            return;
        };
        let temp = TempDir::new().unwrap();

        Mock::given(method("GET"))
            .and(path("/page"))
            .respond_with(
                ResponseTemplate::new(200)
                    .insert_header("Content-Type", "text/html")
                    .set_body_string("<html>login</html>"),
            )
            .expect(1)
            .mount(&mock_server)
            .await;

        let pipeline = AssetPipeline::new(test_config(&temp)).unwrap();
        let metrics = ProcessingMetrics::new();
        let url = format!("{}/page", mock_server.uri());

        let result = pipeline.acquire(&url, "Doc", 0, &metrics).await;
        assert!(matches!(result, Err(AssetError::UnsupportedFormat { .. })));
    }

    #[tokio::test]
    async fn test_quality_too_low_leaves_original_bytes() {
        let Some(mock_server) = start_mock_server_or_skip().await else {
            return;
        };
        let temp = TempDir::new().unwrap();
        let body = png_bytes(32, 32, 3);

        Mock::given(method("GET"))
            .and(path("/big.png"))
            .respond_with(ResponseTemplate::new(200).set_body_bytes(body.clone()))
            .mount(&mock_server)
            .await;

        let mut config = test_config(&temp);
        config.limits.min_process_bytes = 0;
        let pipeline = AssetPipeline::new(config)
            .unwrap()
            .with_compressor(Arc::new(RefusingCompressor));
        let metrics = ProcessingMetrics::new();
        let url = format!("{}/big.png", mock_server.uri());

        let acquired = pipeline.acquire(&url, "Doc", 0, &metrics).await.unwrap();

        assert_eq!(std::fs::read(&acquired.local_path).unwrap(), body);
        assert_eq!(acquired.bytes_saved, 0);
        assert_eq!(metrics.compression_fallbacks(), 1);
    }

    // ==================== Cache Tests ====================

    #[tokio::test]
    async fn test_cached_reacquire_makes_no_network_call() {
        let Some(mock_server) = start_mock_server_or_skip().await else {
            return;
        };
        let temp = TempDir::new().unwrap();

        Mock::given(method("GET"))
            .and(path("/once.png"))
            .respond_with(ResponseTemplate::new(200).set_body_bytes(png_bytes(4, 4, 4)))
            .expect(1)
            .mount(&mock_server)
            .await;

        let pipeline = AssetPipeline::new(test_config(&temp)).unwrap();
        let metrics = ProcessingMetrics::new();
        let url = format!("{}/once.png", mock_server.uri());

        let first = pipeline.acquire(&url, "Doc", 0, &metrics).await.unwrap();
        let second = pipeline.acquire(&url, "Doc", 1, &metrics).await.unwrap();

        assert!(!first.from_cache);
        assert!(second.from_cache);
        assert_eq!(second.bytes_saved, 0);
        assert_eq!(first.local_path, second.local_path);
        assert_eq!(metrics.cache_hits(), 1);
    }

    #[tokio::test]
    async fn test_concurrent_same_url_fetched_once() {
        let Some(mock_server) = start_mock_server_or_skip().await else {
            return;
        };
        let temp = TempDir::new().unwrap();

        Mock::given(method("GET"))
            .and(path("/shared.png"))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_bytes(png_bytes(4, 4, 5))
                    .set_delay(Duration::from_millis(100)),
            )
            .expect(1)
            .mount(&mock_server)
            .await;

        let pipeline = AssetPipeline::new(test_config(&temp)).unwrap();
        let metrics = ProcessingMetrics::new();
        let url = format!("{}/shared.png", mock_server.uri());

        let (a, b) = tokio::join!(
            pipeline.acquire(&url, "Doc", 0, &metrics),
            pipeline.acquire(&url, "Doc", 1, &metrics)
        );
        let (a, b) = (a.unwrap(), b.unwrap());
        assert_eq!(a.local_path, b.local_path);
        assert!(a.from_cache ^ b.from_cache);
        assert_eq!(pipeline.active_destinations(), 0);
    }

    #[tokio::test]
    async fn test_destination_locks_released_after_success_and_failure() {
        let Some(mock_server) = start_mock_server_or_skip().await else {
            return;
        };
        let temp = TempDir::new().unwrap();

        Mock::given(method("GET"))
            .and(path("/kept.png"))
            .respond_with(ResponseTemplate::new(200).set_body_bytes(png_bytes(4, 4, 6)))
            .mount(&mock_server)
            .await;
        Mock::given(method("GET"))
            .and(path("/gone.png"))
            .respond_with(ResponseTemplate::new(404))
            .mount(&mock_server)
            .await;

        let pipeline = AssetPipeline::new(test_config(&temp)).unwrap();
        let metrics = ProcessingMetrics::new();

        for route in ["kept.png", "gone.png", "kept.png"] {
            let url = format!("{}/{route}", mock_server.uri());
            let _ = pipeline.acquire(&url, "Doc", 0, &metrics).await;
            assert_eq!(pipeline.active_destinations(), 0, "lock left behind for {route}");
        }
    }

    // ==================== Settle Barrier Tests ====================

    #[tokio::test]
    async fn test_timed_out_attempt_settles_before_retry() {
        let Some(mock_server) = start_mock_server_or_skip().await else {
            return;
        };
        let temp = TempDir::new().unwrap();
        let slow_body = png_bytes(4, 4, 10);
        let fast_body = png_bytes(4, 4, 20);

        struct SlowThenFast {
            calls: AtomicUsize,
            slow: Vec<u8>,
            fast: Vec<u8>,
        }

        impl Respond for SlowThenFast {
            fn respond(&self, _request: &Request) -> ResponseTemplate {
                if self.calls.fetch_add(1, Ordering::SeqCst) == 0 {
                    ResponseTemplate::new(200)
                        .set_body_bytes(self.slow.clone())
                        .set_delay(Duration::from_millis(600))
                } else {
                    ResponseTemplate::new(200).set_body_bytes(self.fast.clone())
                }
            }
        }

        Mock::given(method("GET"))
            .and(path("/race.png"))
            .respond_with(SlowThenFast {
                calls: AtomicUsize::new(0),
                slow: slow_body,
                fast: fast_body.clone(),
            })
            .mount(&mock_server)
            .await;

        let mut config = test_config(&temp);
        config.attempt_timeout = Duration::from_millis(200);
        let pipeline = AssetPipeline::new(config).unwrap();
        let metrics = ProcessingMetrics::new();
        let url = format!("{}/race.png", mock_server.uri());

        let acquired = pipeline.acquire(&url, "Doc", 0, &metrics).await.unwrap();

        // The slow first attempt finished writing before the second began,
        // so the second attempt's bytes are what remains.
        tokio::time::sleep(Duration::from_millis(700)).await;
        assert_eq!(std::fs::read(&acquired.local_path).unwrap(), fast_body);
    }

    #[test]
    fn test_file_stem_is_key_prefix() {
        let stem = file_stem("https://example.com/a.png");
        assert_eq!(stem.len(), FILE_STEM_LEN);
        assert!(cache_key("https://example.com/a.png").starts_with(&stem));
    }
}
