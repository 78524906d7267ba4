//! Fetch-through asset cache.
//!
//! [`AssetFetchCache`] keys entries by URL and never expires them; only
//! [`AssetFetchCache::invalidate`] and [`AssetFetchCache::clear_cache`]
//! remove entries. Concurrent requests for the same URL share one fetch, and
//! failed fetches are never stored.
//!
//! With a cache directory configured, every entry is also written to
//! `<cache_dir>/assets/` as `<sha256>.bin` plus `<sha256>.meta.json`, and a
//! new cache over the same directory serves those entries without touching
//! the network. Nothing outside `assets/` is ever written or removed.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use bytes::Bytes;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use tokio::sync::OnceCell;
use tokio::task::JoinSet;
use tracing::{debug, info, instrument, warn};

use crate::fetch::Fetcher;
use scad_wasm_common::FetchError;
use scad_wasm_core::module::compute_hash;

/// A fetched asset.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CachedAsset {
    /// The URL the asset was fetched from.
    pub url: String,
    /// Status the fetch completed with.
    pub status: u16,
    /// Response body.
    pub body: Bytes,
    /// When the asset was fetched.
    pub fetched_at: SystemTime,
}

impl CachedAsset {
    /// Body size in bytes.
    pub fn size(&self) -> usize {
        self.body.len()
    }
}

/// Cache counters.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CacheStats {
    pub entry_count: usize,
    pub total_bytes: u64,
    pub hits: u64,
    pub misses: u64,
    pub network_fetches: u64,
    pub persistent: bool,
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct EntryMeta {
    url: String,
    size: u64,
    status: u16,
    fetched_at_ms: u64,
}

const ASSET_SUBDIR: &str = "assets";

/// On-disk entry store.
#[derive(Debug)]
struct DiskStore {
    root: PathBuf,
    dir: PathBuf,
}

impl DiskStore {
    fn new(root: PathBuf) -> Self {
        let dir = root.join(ASSET_SUBDIR);
        Self { root, dir }
    }

    /// Whether `name` is a file this store writes.
    fn owns(name: &str) -> bool {
        let key = name
            .strip_suffix(".meta.json")
            .or_else(|| name.strip_suffix(".bin"));
        key.is_some_and(|key| key.len() == 64 && key.bytes().all(|b| b.is_ascii_hexdigit()))
    }

    /// `(url, size)` of every complete entry on disk.
    fn scan(&self) -> Vec<(String, u64)> {
        let Ok(entries) = std::fs::read_dir(&self.dir) else {
            return Vec::new();
        };

        entries
            .filter_map(Result::ok)
            .filter(|entry| {
                let name = entry.file_name();
                let name = name.to_string_lossy();
                name.ends_with(".meta.json") && Self::owns(&name)
            })
            .filter_map(|entry| {
                let meta = std::fs::read(entry.path()).ok()?;
                let meta: EntryMeta = serde_json::from_slice(&meta).ok()?;
                Some((meta.url, meta.size))
            })
            .collect()
    }

    fn paths(&self, url: &str) -> (PathBuf, PathBuf) {
        let key = compute_hash(url.as_bytes());
        (
            self.dir.join(format!("{key}.bin")),
            self.dir.join(format!("{key}.meta.json")),
        )
    }

    async fn load(&self, url: &str) -> Option<CachedAsset> {
        let (body_path, meta_path) = self.paths(url);
        let meta = tokio::fs::read(&meta_path).await.ok()?;
        let meta: EntryMeta = serde_json::from_slice(&meta).ok()?;
        if meta.url != url {
            return None;
        }

        let body = tokio::fs::read(&body_path).await.ok()?;
        if body.len() as u64 != meta.size {
            warn!(url = %url, expected = meta.size, actual = body.len(), "Discarding truncated cache entry");
            return None;
        }

        Some(CachedAsset {
            url: meta.url,
            status: meta.status,
            body: Bytes::from(body),
            fetched_at: UNIX_EPOCH + Duration::from_millis(meta.fetched_at_ms),
        })
    }

    async fn store(&self, asset: &CachedAsset) -> std::io::Result<()> {
        let (body_path, meta_path) = self.paths(&asset.url);
        let meta = EntryMeta {
            url: asset.url.clone(),
            size: asset.size() as u64,
            status: asset.status,
            fetched_at_ms: asset
                .fetched_at
                .duration_since(UNIX_EPOCH)
                .map(|d| u64::try_from(d.as_millis()).unwrap_or(u64::MAX))
                .unwrap_or_default(),
        };

        tokio::fs::create_dir_all(&self.dir).await?;
        tokio::fs::write(&body_path, &asset.body).await?;
        // Metadata last: an entry without metadata is never served.
        tokio::fs::write(&meta_path, serde_json::to_vec(&meta)?).await
    }

    async fn remove(&self, url: &str) {
        let (body_path, meta_path) = self.paths(url);
        let _ = tokio::fs::remove_file(meta_path).await;
        let _ = tokio::fs::remove_file(body_path).await;
    }

    async fn clear(&self) -> std::io::Result<usize> {
        let mut entries = match tokio::fs::read_dir(&self.dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(0),
            Err(e) => return Err(e),
        };

        let mut removed = 0;
        while let Some(entry) = entries.next_entry().await? {
            let name = entry.file_name();
            let name = name.to_string_lossy();
            if Self::owns(&name) {
                tokio::fs::remove_file(entry.path()).await?;
                removed += 1;
            }
        }
        Ok(removed)
    }
}

struct CacheInner {
    fetcher: Arc<dyn Fetcher>,
    entries: DashMap<String, Arc<OnceCell<CachedAsset>>>,
    disk: Option<DiskStore>,
    hits: AtomicU64,
    misses: AtomicU64,
    network_fetches: AtomicU64,
}

/// URL-keyed asset cache over a [`Fetcher`].
///
/// Cloning is cheap; clones share entries and counters.
#[derive(Clone)]
pub struct AssetFetchCache {
    inner: Arc<CacheInner>,
}

impl AssetFetchCache {
    /// Create an in-memory cache.
    pub fn new(fetcher: Arc<dyn Fetcher>) -> Self {
        Self::build(fetcher, None)
    }

    /// Create a cache that also persists entries under `dir`.
    pub fn persistent(fetcher: Arc<dyn Fetcher>, dir: impl Into<PathBuf>) -> Self {
        Self::build(fetcher, Some(DiskStore::new(dir.into())))
    }

    fn build(fetcher: Arc<dyn Fetcher>, disk: Option<DiskStore>) -> Self {
        Self {
            inner: Arc::new(CacheInner {
                fetcher,
                entries: DashMap::new(),
                disk,
                hits: AtomicU64::new(0),
                misses: AtomicU64::new(0),
                network_fetches: AtomicU64::new(0),
            }),
        }
    }

    /// The persistent cache directory, if any.
    pub fn cache_dir(&self) -> Option<&Path> {
        self.inner.disk.as_ref().map(|d| d.root.as_path())
    }

    /// Return the cached asset for `url`, fetching it on a miss.
    ///
    /// # Errors
    ///
    /// Returns the fetch failure; nothing is cached in that case.
    #[instrument(skip(self))]
    pub async fn fetch_with_cache(&self, url: &str) -> Result<CachedAsset, FetchError> {
        let cell = Arc::clone(&*self.inner.entries.entry(url.to_string()).or_default());

        if let Some(asset) = cell.get() {
            self.inner.hits.fetch_add(1, Ordering::Relaxed);
            debug!("Cache hit");
            return Ok(asset.clone());
        }

        let initialized_here = AtomicBool::new(false);
        let result = cell
            .get_or_try_init(|| async {
                initialized_here.store(true, Ordering::Relaxed);
                self.inner.misses.fetch_add(1, Ordering::Relaxed);
                self.load(url).await
            })
            .await;

        match result {
            Ok(asset) => {
                if !initialized_here.load(Ordering::Relaxed) {
                    self.inner.hits.fetch_add(1, Ordering::Relaxed);
                }
                Ok(asset.clone())
            }
            Err(e) => {
                self.inner
                    .entries
                    .remove_if(url, |_, current| Arc::ptr_eq(current, &cell) && current.get().is_none());
                Err(e)
            }
        }
    }

    async fn load(&self, url: &str) -> Result<CachedAsset, FetchError> {
        if let Some(disk) = &self.inner.disk {
            if let Some(asset) = disk.load(url).await {
                debug!(url = %url, size = asset.size(), "Served from persistent cache");
                return Ok(asset);
            }
        }

        self.inner.network_fetches.fetch_add(1, Ordering::Relaxed);
        let body = self.inner.fetcher.fetch(url).await?;
        let asset = CachedAsset {
            url: url.to_string(),
            status: 200,
            body,
            fetched_at: SystemTime::now(),
        };

        if let Some(disk) = &self.inner.disk {
            if let Err(e) = disk.store(&asset).await {
                warn!(url = %url, error = %e, "Failed to persist cache entry");
            }
        }

        Ok(asset)
    }

    /// Warm the cache with `urls` in parallel. Failures are logged, not raised.
    ///
    /// Returns the number of URLs now cached.
    pub async fn preload_resources<I, S>(&self, urls: I) -> usize
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let mut tasks = JoinSet::new();
        for url in urls {
            let url = url.into();
            let cache = self.clone();
            tasks.spawn(async move {
                let result = cache.fetch_with_cache(&url).await;
                (url, result)
            });
        }

        let mut loaded = 0;
        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok((_, Ok(_))) => loaded += 1,
                Ok((url, Err(e))) => warn!(url = %url, error = %e, "Preload failed"),
                Err(e) => warn!(error = %e, "Preload task failed"),
            }
        }

        info!(loaded, "Preload finished");
        loaded
    }

    /// Remove the entry for `url`. Returns `true` if one was cached.
    pub async fn invalidate(&self, url: &str) -> bool {
        let removed = self
            .inner
            .entries
            .remove(url)
            .is_some_and(|(_, cell)| cell.initialized());
        if let Some(disk) = &self.inner.disk {
            disk.remove(url).await;
        }
        removed
    }

    /// Remove every entry, in memory and on disk.
    pub async fn clear_cache(&self) {
        self.inner.entries.clear();
        if let Some(disk) = &self.inner.disk {
            match disk.clear().await {
                Ok(removed) => debug!(removed, "Persistent cache cleared"),
                Err(e) => warn!(error = %e, "Failed to clear persistent cache"),
            }
        }
        info!("Asset cache cleared");
    }

    /// Whether `url` is cached in memory.
    pub fn contains(&self, url: &str) -> bool {
        self.inner
            .entries
            .get(url)
            .is_some_and(|cell| cell.initialized())
    }

    /// Current counters.
    ///
    /// For a persistent cache, entries on disk that have not been loaded
    /// into memory yet are counted too. This reads the entry metadata from
    /// disk.
    pub fn get_cache_stats(&self) -> CacheStats {
        let mut sizes: HashMap<String, u64> = self
            .inner
            .entries
            .iter()
            .filter_map(|entry| {
                let size = entry.value().get()?.size() as u64;
                Some((entry.key().clone(), size))
            })
            .collect();

        if let Some(disk) = &self.inner.disk {
            for (url, size) in disk.scan() {
                sizes.entry(url).or_insert(size);
            }
        }

        let entry_count = sizes.len();
        let total_bytes = sizes.values().sum();

        CacheStats {
            entry_count,
            total_bytes,
            hits: self.inner.hits.load(Ordering::Relaxed),
            misses: self.inner.misses.load(Ordering::Relaxed),
            network_fetches: self.inner.network_fetches.load(Ordering::Relaxed),
            persistent: self.inner.disk.is_some(),
        }
    }
}

impl std::fmt::Debug for AssetFetchCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AssetFetchCache")
            .field("entries", &self.inner.entries.len())
            .field("disk", &self.inner.disk)
            .finish_non_exhaustive()
    }
}
