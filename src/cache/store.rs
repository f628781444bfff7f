//! File-backed cache records for acquired assets.
//!
//! Each record is one JSON file under the cache directory, named by the hex
//! SHA-256 of the source URL. Reads self-heal: a record that fails to parse,
//! points at a missing file, or is stale is deleted and reported as a miss.

use std::io;
use std::path::{Path, PathBuf};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use thiserror::Error;
use tracing::{debug, info, instrument, warn};

/// Default record time-to-live (30 days).
pub const DEFAULT_CACHE_TTL: Duration = Duration::from_secs(30 * 24 * 60 * 60);

const RECORD_EXTENSION: &str = "json";

/// Persisted cache record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CacheEntry {
    /// Source URL.
    pub url: String,
    /// Where the processed asset was written.
    pub local_path: PathBuf,
    /// When the record was written.
    pub timestamp: DateTime<Utc>,
    /// Label of the document that first acquired the asset.
    pub label: String,
    /// Last-edited marker of the source document, if known.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub freshness_marker: Option<DateTime<Utc>>,
}

/// Cache write failure. Reads never fail; they degrade to misses.
#[derive(Debug, Error)]
pub enum CacheError {
    /// Filesystem error while writing or removing a record.
    #[error("IO error on cache record {path}: {source}")]
    Io {
        /// Record path.
        path: PathBuf,
        /// Underlying error.
        #[source]
        source: io::Error,
    },

    /// The record could not be serialized.
    #[error("failed to serialize cache record for {url}: {source}")]
    Serialize {
        /// Source URL.
        url: String,
        /// Underlying error.
        #[source]
        source: serde_json::Error,
    },
}

impl CacheError {
    fn io(path: impl Into<PathBuf>, source: io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }
}

/// Returns the hex SHA-256 of `url`, used as the record key.
#[must_use]
pub fn cache_key(url: &str) -> String {
    hex::encode(Sha256::digest(url.as_bytes()))
}

/// Persistent per-URL record store.
#[derive(Debug, Clone)]
pub struct AssetCache {
    dir: PathBuf,
    ttl: Duration,
}

impl AssetCache {
    /// Creates a store rooted at `dir`. The directory is created on first write.
    #[must_use]
    pub fn new(dir: impl Into<PathBuf>, ttl: Duration) -> Self {
        Self {
            dir: dir.into(),
            ttl,
        }
    }

    /// Returns the cache directory.
    #[must_use]
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Returns the record time-to-live.
    #[must_use]
    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    /// Returns the record file path for `url`.
    #[must_use]
    pub fn record_path(&self, url: &str) -> PathBuf {
        self.dir
            .join(format!("{}.{RECORD_EXTENSION}", cache_key(url)))
    }

    /// Returns true if a valid, fresh record exists for `url`.
    pub async fn has(&self, url: &str, freshness_marker: Option<DateTime<Utc>>) -> bool {
        self.get(url, freshness_marker).await.is_some()
    }

    /// Returns the record for `url` if it passes every validity check.
    ///
    /// With a `freshness_marker`, the record is fresh when the marker is not
    /// newer than the stored one; a record without a stored marker is stale.
    /// Without a marker, the record is fresh while younger than the TTL.
    /// Records failing any check are deleted.
    #[instrument(skip(self, freshness_marker), fields(dir = %self.dir.display()))]
    pub async fn get(
        &self,
        url: &str,
        freshness_marker: Option<DateTime<Utc>>,
    ) -> Option<CacheEntry> {
        let path = self.record_path(url);
        let raw = match tokio::fs::read(&path).await {
            Ok(raw) => raw,
            Err(error) if error.kind() == io::ErrorKind::NotFound => return None,
            Err(error) => {
                warn!(path = %path.display(), error = %error, "unreadable cache record");
                self.discard(&path).await;
                return None;
            }
        };

        let entry: CacheEntry = match serde_json::from_slice(&raw) {
            Ok(entry) => entry,
            Err(error) => {
                warn!(path = %path.display(), error = %error, "corrupt cache record, discarding");
                self.discard(&path).await;
                return None;
            }
        };

        if entry.url != url {
            warn!(path = %path.display(), stored_url = %entry.url, "cache record key mismatch");
            self.discard(&path).await;
            return None;
        }

        if !tokio::fs::try_exists(&entry.local_path)
            .await
            .unwrap_or(false)
        {
            debug!(local_path = %entry.local_path.display(), "cached file missing, discarding record");
            self.discard(&path).await;
            return None;
        }

        if !self.is_fresh(&entry, freshness_marker) {
            debug!("stale cache record, discarding");
            self.discard(&path).await;
            return None;
        }

        Some(entry)
    }

    /// Writes (or overwrites) the record for `url`.
    ///
    /// # Errors
    ///
    /// Returns [`CacheError`] if the directory or record cannot be written.
    #[instrument(skip(self, local_path, freshness_marker))]
    pub async fn set(
        &self,
        url: &str,
        local_path: &Path,
        label: &str,
        freshness_marker: Option<DateTime<Utc>>,
    ) -> Result<CacheEntry, CacheError> {
        let entry = CacheEntry {
            url: url.to_string(),
            local_path: local_path.to_path_buf(),
            timestamp: Utc::now(),
            label: label.to_string(),
            freshness_marker,
        };
        self.write_entry(&entry).await?;
        Ok(entry)
    }

    /// Writes `entry` as-is. Writes go through a temp file and a rename so a
    /// reader never observes a partial record.
    ///
    /// # Errors
    ///
    /// Returns [`CacheError`] if the directory or record cannot be written.
    pub async fn write_entry(&self, entry: &CacheEntry) -> Result<(), CacheError> {
        tokio::fs::create_dir_all(&self.dir)
            .await
            .map_err(|e| CacheError::io(&self.dir, e))?;

        let json = serde_json::to_vec_pretty(entry).map_err(|source| CacheError::Serialize {
            url: entry.url.clone(),
            source,
        })?;

        let path = self.record_path(&entry.url);
        let temp = path.with_extension(format!("{RECORD_EXTENSION}.{}.tmp", rand::random::<u32>()));
        tokio::fs::write(&temp, json)
            .await
            .map_err(|e| CacheError::io(&temp, e))?;
        if let Err(error) = tokio::fs::rename(&temp, &path).await {
            let _ = tokio::fs::remove_file(&temp).await;
            return Err(CacheError::io(&path, error));
        }

        debug!(path = %path.display(), "cache record written");
        Ok(())
    }

    /// Deletes the record for `url`. Returns true if one existed.
    ///
    /// # Errors
    ///
    /// Returns [`CacheError`] for filesystem errors other than not-found.
    pub async fn remove(&self, url: &str) -> Result<bool, CacheError> {
        let path = self.record_path(url);
        match tokio::fs::remove_file(&path).await {
            Ok(()) => Ok(true),
            Err(error) if error.kind() == io::ErrorKind::NotFound => Ok(false),
            Err(error) => Err(CacheError::io(path, error)),
        }
    }

    /// Deletes every record that is corrupt or whose asset file is gone.
    /// Returns the number of records removed.
    ///
    /// # Errors
    ///
    /// Returns [`CacheError`] if the cache directory cannot be listed.
    pub async fn prune_orphans(&self) -> Result<usize, CacheError> {
        let mut dir = match tokio::fs::read_dir(&self.dir).await {
            Ok(dir) => dir,
            Err(error) if error.kind() == io::ErrorKind::NotFound => return Ok(0),
            Err(error) => return Err(CacheError::io(&self.dir, error)),
        };

        let mut removed = 0;
        while let Some(item) = dir
            .next_entry()
            .await
            .map_err(|e| CacheError::io(&self.dir, e))?
        {
            let path = item.path();
            if path.extension().and_then(|ext| ext.to_str()) != Some(RECORD_EXTENSION) {
                continue;
            }

            let keep = match tokio::fs::read(&path).await {
                Ok(raw) => match serde_json::from_slice::<CacheEntry>(&raw) {
                    Ok(entry) => tokio::fs::try_exists(&entry.local_path)
                        .await
                        .unwrap_or(false),
                    Err(_) => false,
                },
                Err(_) => false,
            };

            if !keep {
                self.discard(&path).await;
                removed += 1;
            }
        }

        if removed > 0 {
            info!(removed, dir = %self.dir.display(), "pruned orphaned cache records");
        }
        Ok(removed)
    }

    fn is_fresh(&self, entry: &CacheEntry, marker: Option<DateTime<Utc>>) -> bool {
        match marker {
            Some(marker) => entry
                .freshness_marker
                .is_some_and(|stored| marker <= stored),
            None => match Utc::now().signed_duration_since(entry.timestamp).to_std() {
                Ok(age) => age < self.ttl,
                // Timestamp in the future (clock skew).
                Err(_) => true,
            },
        }
    }

    async fn discard(&self, path: &Path) {
        if let Err(error) = tokio::fs::remove_file(path).await
            && error.kind() != io::ErrorKind::NotFound
        {
            warn!(path = %path.display(), error = %error, "failed to remove cache record");
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use chrono::TimeDelta;
    use tempfile::TempDir;

    use super::*;

    const URL: &str = "https://cdn.example.com/img/photo.png";

    async fn setup() -> (TempDir, AssetCache, PathBuf) {
        let temp = TempDir::new().unwrap();
        let cache = AssetCache::new(temp.path().join("cache"), DEFAULT_CACHE_TTL);
        let asset = temp.path().join("photo.png");
        tokio::fs::write(&asset, b"png bytes").await.unwrap();
        (temp, cache, asset)
    }

    // ==================== Hit / Miss Tests ====================

    #[tokio::test]
    async fn test_set_then_get_hits() {
        let (_temp, cache, asset) = setup().await;
        cache.set(URL, &asset, "Doc", None).await.unwrap();

        let entry = cache.get(URL, None).await.unwrap();
        assert_eq!(entry.url, URL);
        assert_eq!(entry.local_path, asset);
        assert_eq!(entry.label, "Doc");
        assert!(cache.has(URL, None).await);
    }

    #[tokio::test]
    async fn test_missing_record_is_miss() {
        let (_temp, cache, _asset) = setup().await;
        assert!(!cache.has(URL, None).await);
    }

    #[tokio::test]
    async fn test_missing_asset_file_deletes_record() {
        let (_temp, cache, asset) = setup().await;
        cache.set(URL, &asset, "Doc", None).await.unwrap();
        tokio::fs::remove_file(&asset).await.unwrap();

        assert!(!cache.has(URL, None).await);
        assert!(!cache.record_path(URL).exists());
    }

    #[tokio::test]
    async fn test_expired_record_is_miss() {
        let (_temp, cache, asset) = setup().await;
        let old = CacheEntry {
            url: URL.to_string(),
            local_path: asset,
            timestamp: Utc::now() - TimeDelta::days(31),
            label: "Doc".to_string(),
            freshness_marker: None,
        };
        cache.write_entry(&old).await.unwrap();

        assert!(!cache.has(URL, None).await);
        assert!(!cache.record_path(URL).exists());
    }

    #[tokio::test]
    async fn test_corrupt_record_is_miss_and_deleted() {
        let (_temp, cache, _asset) = setup().await;
        tokio::fs::create_dir_all(cache.dir()).await.unwrap();
        tokio::fs::write(cache.record_path(URL), b"{not json")
            .await
            .unwrap();

        assert!(cache.get(URL, None).await.is_none());
        assert!(!cache.record_path(URL).exists());
    }

    // ==================== Freshness Marker Tests ====================

    #[tokio::test]
    async fn test_marker_not_newer_hits() {
        let (_temp, cache, asset) = setup().await;
        let edited = Utc::now() - TimeDelta::hours(2);
        cache.set(URL, &asset, "Doc", Some(edited)).await.unwrap();

        assert!(cache.has(URL, Some(edited)).await);
        assert!(cache.has(URL, Some(edited - TimeDelta::hours(1))).await);
    }

    #[tokio::test]
    async fn test_newer_marker_invalidates() {
        let (_temp, cache, asset) = setup().await;
        let edited = Utc::now() - TimeDelta::hours(2);
        cache.set(URL, &asset, "Doc", Some(edited)).await.unwrap();

        assert!(!cache.has(URL, Some(Utc::now())).await);
        assert!(!cache.record_path(URL).exists());
    }

    #[tokio::test]
    async fn test_marker_against_record_without_marker_is_stale() {
        let (_temp, cache, asset) = setup().await;
        cache.set(URL, &asset, "Doc", None).await.unwrap();

        assert!(!cache.has(URL, Some(Utc::now())).await);
    }

    // ==================== Record Format Tests ====================

    #[tokio::test]
    async fn test_record_uses_camel_case_keys() {
        let (_temp, cache, asset) = setup().await;
        cache
            .set(URL, &asset, "Doc", Some(Utc::now()))
            .await
            .unwrap();

        let raw = tokio::fs::read_to_string(cache.record_path(URL))
            .await
            .unwrap();
        let value: serde_json::Value = serde_json::from_str(&raw).unwrap();
        assert_eq!(value["url"], URL);
        assert!(value["localPath"].is_string());
        assert!(value["timestamp"].is_string());
        assert_eq!(value["label"], "Doc");
        assert!(value["freshnessMarker"].is_string());
    }

    #[test]
    fn test_cache_key_is_hex_sha256() {
        let key = cache_key(URL);
        assert_eq!(key.len(), 64);
        assert!(key.chars().all(|c| c.is_ascii_hexdigit()));
        assert_eq!(key, cache_key(URL));
        assert_ne!(key, cache_key("https://cdn.example.com/img/other.png"));
    }

    // ==================== Maintenance Tests ====================

    #[tokio::test]
    async fn test_remove_reports_existence() {
        let (_temp, cache, asset) = setup().await;
        cache.set(URL, &asset, "Doc", None).await.unwrap();

        assert!(cache.remove(URL).await.unwrap());
        assert!(!cache.remove(URL).await.unwrap());
    }

    #[tokio::test]
    async fn test_prune_orphans_removes_dangling_records() {
        let (temp, cache, asset) = setup().await;
        let other = temp.path().join("other.png");
        tokio::fs::write(&other, b"x").await.unwrap();

        cache.set(URL, &asset, "Doc", None).await.unwrap();
        cache
            .set("https://cdn.example.com/other.png", &other, "Doc", None)
            .await
            .unwrap();
        tokio::fs::remove_file(&other).await.unwrap();

        assert_eq!(cache.prune_orphans().await.unwrap(), 1);
        assert!(cache.record_path(URL).exists());
    }

    #[tokio::test]
    async fn test_prune_orphans_without_dir_is_noop() {
        let (_temp, cache, _asset) = setup().await;
        assert_eq!(cache.prune_orphans().await.unwrap(), 0);
    }
}
