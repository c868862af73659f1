//! Content-addressed package cache.
//!
//! Maps a function's active version to a verified on-disk extraction under
//! `CACHE_ROOT/{function_id}/`. Population is serialized per function id:
//! concurrent callers observing a miss collapse onto a single populator and
//! borrow its result. Entries are evicted least-recently-used once the cache
//! grows past its high-water mark, but never while an invocation holds a
//! handle and never mid-population.
//!
//! The cache is cold on boot: leftover entry directories from a previous
//! process are swept, since their metadata (sizes, fingerprints) died with
//! that process and the populator re-creates them on first use.

pub mod extract;

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;

use dashmap::DashMap;
use parking_lot::Mutex;
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::blob::BlobFetcher;
use crate::error::{Error, Result};
use crate::store::FunctionDescriptor;

pub use extract::ENTRY_FILE;

/// Population state of one cache entry.
#[derive(Debug, Clone, PartialEq, Eq)]
enum EntryState {
    Populating,
    Ready,
    Failed(String),
}

#[derive(Debug)]
struct Entry {
    state: EntryState,
    version: i64,
    package_hash: String,
    size_bytes: u64,
    last_access: Instant,
    access_count: u64,
    handles: usize,
}

#[derive(Default)]
struct Inner {
    entries: HashMap<String, Entry>,
    total_bytes: u64,
}

/// Cache configuration.
#[derive(Debug, Clone)]
pub struct CacheConfig {
    /// Directory entry trees extract into
    pub root: PathBuf,
    /// High-water mark in bytes; eviction starts above this
    pub max_bytes: u64,
}

/// Point-in-time cache statistics.
#[derive(Debug, Clone, Serialize)]
pub struct CacheStats {
    /// Number of entries in any state
    pub entry_count: usize,
    /// Ready entries only
    pub ready_count: usize,
    /// Total extracted bytes across Ready entries
    pub total_bytes: u64,
    /// Configured high-water mark
    pub max_bytes: u64,
    /// Lifetime hit counter
    pub hits: u64,
    /// Lifetime miss (population) counter
    pub misses: u64,
}

/// Per-entry view for introspection endpoints.
#[derive(Debug, Clone, Serialize)]
pub struct EntryStats {
    pub function_id: String,
    pub version: i64,
    pub state: String,
    pub size_bytes: u64,
    pub access_count: u64,
    pub active_handles: usize,
    pub idle_secs: u64,
}

/// Outcome of an eviction pass.
#[derive(Debug, Clone, Serialize, Default)]
pub struct EvictionReport {
    pub evicted: Vec<String>,
    pub freed_bytes: u64,
}

/// Borrowed Ready entry. Holding the handle pins the entry: eviction skips
/// it until the last handle drops.
pub struct CacheHandle {
    cache: Arc<PackageCache>,
    function_id: String,
    root: PathBuf,
}

impl std::fmt::Debug for CacheHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CacheHandle")
            .field("function_id", &self.function_id)
            .field("root", &self.root)
            .finish()
    }
}

impl CacheHandle {
    /// Directory containing the extracted package, `index.js` at top level.
    pub fn root_path(&self) -> &Path {
        &self.root
    }

    /// Which function this handle pins.
    pub fn function_id(&self) -> &str {
        &self.function_id
    }
}

impl Drop for CacheHandle {
    fn drop(&mut self) {
        let mut inner = self.cache.inner.lock();
        if let Some(entry) = inner.entries.get_mut(&self.function_id) {
            entry.handles = entry.handles.saturating_sub(1);
        }
    }
}

/// The package cache. See module docs for the concurrency contract.
pub struct PackageCache {
    config: CacheConfig,
    fetcher: Arc<dyn BlobFetcher>,
    inner: Mutex<Inner>,
    populators: DashMap<String, Arc<tokio::sync::Mutex<()>>>,
    eviction_lock: tokio::sync::Mutex<()>,
    hits: AtomicU64,
    misses: AtomicU64,
}

impl PackageCache {
    /// Create the cache, sweeping any directories left by a previous process.
    pub fn new(config: CacheConfig, fetcher: Arc<dyn BlobFetcher>) -> Result<Arc<Self>> {
        std::fs::create_dir_all(&config.root)?;
        for entry in std::fs::read_dir(&config.root)? {
            let entry = entry?;
            let path = entry.path();
            if path.is_dir() {
                debug!(path = %path.display(), "sweeping stale cache directory");
                let _ = std::fs::remove_dir_all(&path);
            } else {
                let _ = std::fs::remove_file(&path);
            }
        }
        info!(root = %config.root.display(), max_bytes = config.max_bytes, "package cache ready");
        Ok(Arc::new(Self {
            config,
            fetcher,
            inner: Mutex::new(Inner::default()),
            populators: DashMap::new(),
            eviction_lock: tokio::sync::Mutex::new(()),
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
        }))
    }

    /// Directory where temp spool files belong (same filesystem as entries).
    pub fn spool_dir(&self) -> PathBuf {
        self.config.root.join(".spool")
    }

    fn entry_dir(&self, function_id: &str) -> PathBuf {
        self.config.root.join(function_id)
    }

    /// Resolve `descriptor` to a Ready entry, populating on miss. The
    /// returned flag is true on a hit (no population ran for this call).
    ///
    /// The fingerprint is `(function_id, package_hash)`: an entry cached for
    /// a stale hash is invalidated and rebuilt. A Failed entry for the same
    /// fingerprint returns its recorded error without retrying; operators
    /// clear it with [`PackageCache::evict_entry`].
    pub async fn ensure(
        self: &Arc<Self>,
        descriptor: &FunctionDescriptor,
    ) -> Result<(CacheHandle, bool)> {
        let function_id = &descriptor.function_id;

        // Fast path: borrow an existing Ready entry.
        if let Some(handle) = self.try_borrow(descriptor)? {
            self.hits.fetch_add(1, Ordering::Relaxed);
            return Ok((handle, true));
        }

        // Acquire the per-key populator right. Whoever wins populates; the
        // rest block here and re-check when the winner finishes.
        let populator = self
            .populators
            .entry(function_id.clone())
            .or_insert_with(|| Arc::new(tokio::sync::Mutex::new(())))
            .clone();
        let _right = populator.lock().await;

        if let Some(handle) = self.try_borrow(descriptor)? {
            self.hits.fetch_add(1, Ordering::Relaxed);
            return Ok((handle, true));
        }

        self.misses.fetch_add(1, Ordering::Relaxed);
        let handle = self.populate(descriptor).await?;
        Ok((handle, false))
    }

    /// Try to borrow the entry without populating. `Ok(None)` means absent or
    /// stale; a Failed entry for the current fingerprint is an error.
    fn try_borrow(self: &Arc<Self>, descriptor: &FunctionDescriptor) -> Result<Option<CacheHandle>> {
        let mut inner = self.inner.lock();
        let Some(entry) = inner.entries.get_mut(&descriptor.function_id) else {
            return Ok(None);
        };
        if entry.package_hash != descriptor.package_hash {
            return Ok(None);
        }
        match &entry.state {
            EntryState::Ready => {
                entry.last_access = Instant::now();
                entry.access_count += 1;
                entry.handles += 1;
                Ok(Some(CacheHandle {
                    cache: Arc::clone(self),
                    function_id: descriptor.function_id.clone(),
                    root: self.entry_dir(&descriptor.function_id),
                }))
            }
            EntryState::Failed(message) => Err(Error::bad_package(
                &descriptor.function_id,
                format!("previous population failed: {}", message),
            )),
            EntryState::Populating => Ok(None),
        }
    }

    /// Run the population algorithm. Caller holds the populator right.
    async fn populate(self: &Arc<Self>, descriptor: &FunctionDescriptor) -> Result<CacheHandle> {
        let function_id = descriptor.function_id.clone();
        debug!(
            function_id = %function_id,
            version = descriptor.version,
            hash = %descriptor.package_hash,
            "populating package cache entry"
        );

        // Invalidate any stale-fingerprint remains and mark Populating.
        {
            let mut inner = self.inner.lock();
            if let Some(old) = inner.entries.remove(&function_id) {
                if old.handles > 0 {
                    // A stale-hash entry is still pinned by running
                    // invocations; those finish against the old tree. Put it
                    // back and refuse to clobber it underneath them.
                    inner.entries.insert(function_id.clone(), old);
                    return Err(Error::CacheBusy(function_id));
                }
                inner.total_bytes = inner.total_bytes.saturating_sub(old.size_bytes);
            }
            inner.entries.insert(
                function_id.clone(),
                Entry {
                    state: EntryState::Populating,
                    version: descriptor.version,
                    package_hash: descriptor.package_hash.clone(),
                    size_bytes: 0,
                    last_access: Instant::now(),
                    access_count: 0,
                    handles: 0,
                },
            );
        }

        match self.populate_on_disk(descriptor).await {
            Ok(size_bytes) => {
                let mut inner = self.inner.lock();
                let entry = inner
                    .entries
                    .get_mut(&function_id)
                    .expect("populating entry vanished");
                entry.state = EntryState::Ready;
                entry.size_bytes = size_bytes;
                entry.last_access = Instant::now();
                entry.access_count = 1;
                entry.handles = 1;
                inner.total_bytes += size_bytes;
                drop(inner);

                info!(function_id = %function_id, bytes = size_bytes, "package cache entry ready");
                Ok(CacheHandle {
                    cache: self.clone(),
                    function_id: function_id.clone(),
                    root: self.entry_dir(&function_id),
                })
            }
            Err(e) => {
                let stale_dir = self.entry_dir(&function_id);
                let _ = std::fs::remove_dir_all(&stale_dir);
                let mut inner = self.inner.lock();
                if let Some(entry) = inner.entries.get_mut(&function_id) {
                    entry.state = EntryState::Failed(e.to_string());
                    entry.size_bytes = 0;
                }
                drop(inner);
                warn!(function_id = %function_id, error = %e, "package cache population failed");
                Err(e)
            }
        }
    }

    /// Fetch, verify, extract into staging, atomically rename into place.
    async fn populate_on_disk(self: &Arc<Self>, descriptor: &FunctionDescriptor) -> Result<u64> {
        let blob = self
            .fetcher
            .fetch(
                &descriptor.package_path,
                &descriptor.package_hash,
                descriptor.file_size,
            )
            .await
            .map_err(|e| match e {
                // Fingerprint violations become BadPackage at this boundary.
                Error::HashMismatch { .. } | Error::SizeMismatch { .. } => {
                    Error::bad_package(&descriptor.function_id, e.to_string())
                }
                other => other,
            })?;

        let staging = self
            .config
            .root
            .join(format!(".staging-{}", uuid::Uuid::new_v4()));
        let function_id = descriptor.function_id.clone();
        let staging_clone = staging.clone();

        let extracted = tokio::task::spawn_blocking(move || {
            let result = extract::extract_archive(&function_id, blob.file.path(), &staging_clone);
            drop(blob);
            result
        })
        .await
        .map_err(|e| Error::Internal(format!("extraction task panicked: {}", e)))?;

        let size = match extracted {
            Ok(size) => size,
            Err(e) => {
                let _ = std::fs::remove_dir_all(&staging);
                return Err(map_disk_error(e));
            }
        };

        let final_dir = self.entry_dir(&descriptor.function_id);
        if final_dir.exists() {
            std::fs::remove_dir_all(&final_dir)?;
        }
        std::fs::rename(&staging, &final_dir).map_err(|e| {
            let _ = std::fs::remove_dir_all(&staging);
            map_disk_error(Error::Io(e))
        })?;
        Ok(size)
    }

    /// Evict Ready, unpinned entries until the cache fits the high-water
    /// mark. Candidates leave in ascending `(last_access, access_count)`.
    pub async fn evict_to_watermark(&self) -> EvictionReport {
        let _pass = self.eviction_lock.lock().await;
        let mut report = EvictionReport::default();

        loop {
            let victim = {
                let inner = self.inner.lock();
                if inner.total_bytes <= self.config.max_bytes {
                    None
                } else {
                    inner
                        .entries
                        .iter()
                        .filter(|(_, e)| e.state == EntryState::Ready && e.handles == 0)
                        .min_by_key(|(_, e)| (e.last_access, e.access_count))
                        .map(|(id, _)| id.clone())
                }
            };
            let Some(function_id) = victim else { break };
            match self.remove_entry(&function_id) {
                Ok(freed) => {
                    report.evicted.push(function_id);
                    report.freed_bytes += freed;
                }
                Err(_) => break,
            }
        }

        if !report.evicted.is_empty() {
            info!(
                evicted = report.evicted.len(),
                freed_bytes = report.freed_bytes,
                "cache eviction pass complete"
            );
        }
        report
    }

    /// Evict one entry now. Fails with `CacheBusy` while handles are
    /// outstanding or a populator owns the entry.
    pub async fn evict_entry(&self, function_id: &str) -> Result<u64> {
        let _pass = self.eviction_lock.lock().await;
        self.remove_entry(function_id)
    }

    /// Drop metadata first (so nobody can borrow), then delete the tree.
    fn remove_entry(&self, function_id: &str) -> Result<u64> {
        let freed = {
            let mut inner = self.inner.lock();
            match inner.entries.get(function_id) {
                None => return Err(Error::FunctionNotFound(function_id.to_string())),
                Some(entry) if entry.handles > 0 => {
                    return Err(Error::CacheBusy(function_id.to_string()))
                }
                Some(entry) if entry.state == EntryState::Populating => {
                    return Err(Error::CacheBusy(function_id.to_string()))
                }
                Some(_) => {}
            }
            let entry = inner.entries.remove(function_id).expect("checked above");
            inner.total_bytes = inner.total_bytes.saturating_sub(entry.size_bytes);
            entry.size_bytes
        };
        let _ = std::fs::remove_dir_all(self.entry_dir(function_id));
        debug!(function_id, freed_bytes = freed, "cache entry evicted");
        Ok(freed)
    }

    /// Lifetime counters plus current totals.
    pub fn stats(&self) -> CacheStats {
        let inner = self.inner.lock();
        CacheStats {
            entry_count: inner.entries.len(),
            ready_count: inner
                .entries
                .values()
                .filter(|e| e.state == EntryState::Ready)
                .count(),
            total_bytes: inner.total_bytes,
            max_bytes: self.config.max_bytes,
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
        }
    }

    /// Per-entry snapshot for the introspection surface.
    pub fn entry_stats(&self) -> Vec<EntryStats> {
        let inner = self.inner.lock();
        let mut entries: Vec<EntryStats> = inner
            .entries
            .iter()
            .map(|(id, e)| EntryStats {
                function_id: id.clone(),
                version: e.version,
                state: match &e.state {
                    EntryState::Populating => "populating".into(),
                    EntryState::Ready => "ready".into(),
                    EntryState::Failed(_) => "failed".into(),
                },
                size_bytes: e.size_bytes,
                access_count: e.access_count,
                active_handles: e.handles,
                idle_secs: e.last_access.elapsed().as_secs(),
            })
            .collect();
        entries.sort_by(|a, b| a.function_id.cmp(&b.function_id));
        entries
    }
}

/// ENOSPC becomes `CacheFull` so the dispatcher can evict and retry once.
fn map_disk_error(e: Error) -> Error {
    if let Error::Io(ref io) = e {
        if io.raw_os_error() == Some(28) {
            return Error::CacheFull("disk full while extracting package".into());
        }
    }
    e
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::blob::{sha256_hex, DirBlobFetcher};
    use std::io::Write;

    /// Build a tar.gz package archive in `dir` and return (path, hash, size).
    fn make_package(dir: &Path, name: &str, body: &str) -> (String, String, u64) {
        let archive_path = dir.join(name);
        if let Some(parent) = archive_path.parent() {
            std::fs::create_dir_all(parent).unwrap();
        }
        let file = std::fs::File::create(&archive_path).unwrap();
        let gz = flate2::write::GzEncoder::new(file, flate2::Compression::default());
        let mut builder = tar::Builder::new(gz);
        let data = body.as_bytes();
        let mut header = tar::Header::new_gnu();
        header.set_size(data.len() as u64);
        header.set_mode(0o644);
        header.set_cksum();
        builder.append_data(&mut header, "index.js", data).unwrap();
        builder.into_inner().unwrap().finish().unwrap().flush().unwrap();

        let bytes = std::fs::read(&archive_path).unwrap();
        (name.to_string(), sha256_hex(&bytes), bytes.len() as u64)
    }

    fn descriptor(id: &str, path: &str, hash: &str, size: u64) -> FunctionDescriptor {
        FunctionDescriptor {
            function_id: id.into(),
            name: id.into(),
            is_active: true,
            requires_api_key: false,
            api_key: None,
            version: 1,
            package_path: path.into(),
            package_hash: hash.into(),
            file_size: size,
            env: vec![],
            cron_expression: None,
            next_execution: None,
        }
    }

    fn cache_with(blobs: &Path, root: &Path, max_bytes: u64) -> Arc<PackageCache> {
        let fetcher = Arc::new(DirBlobFetcher::new(blobs, root.join(".spool")));
        PackageCache::new(
            CacheConfig {
                root: root.to_path_buf(),
                max_bytes,
            },
            fetcher,
        )
        .unwrap()
    }

    #[tokio::test]
    async fn test_ensure_populates_then_hits() {
        let blobs = tempfile::tempdir().unwrap();
        let root = tempfile::tempdir().unwrap();
        let (path, hash, size) = make_package(blobs.path(), "fn-a.tar.gz", "module.exports=1;");
        let cache = cache_with(blobs.path(), root.path(), u64::MAX);
        let d = descriptor("fn-a", &path, &hash, size);

        let (first, hit) = cache.ensure(&d).await.unwrap();
        assert!(!hit);
        assert!(first.root_path().join("index.js").is_file());
        drop(first);

        let (_second, hit) = cache.ensure(&d).await.unwrap();
        assert!(hit);
        let stats = cache.stats();
        assert_eq!(stats.misses, 1);
        assert_eq!(stats.hits, 1);
        assert_eq!(stats.ready_count, 1);
    }

    #[tokio::test]
    async fn test_concurrent_ensure_single_populator() {
        let blobs = tempfile::tempdir().unwrap();
        let root = tempfile::tempdir().unwrap();
        let (path, hash, size) = make_package(blobs.path(), "fn-b.tar.gz", "module.exports=2;");
        let cache = cache_with(blobs.path(), root.path(), u64::MAX);
        let d = descriptor("fn-b", &path, &hash, size);

        let tasks: Vec<_> = (0..16)
            .map(|_| {
                let cache = cache.clone();
                let d = d.clone();
                tokio::spawn(async move {
                    cache.ensure(&d).await.map(|(h, _)| h.root_path().to_path_buf())
                })
            })
            .collect();
        for task in tasks {
            task.await.unwrap().unwrap();
        }

        // Exactly one population happened while contended.
        assert_eq!(cache.stats().misses, 1);
    }

    #[tokio::test]
    async fn test_bad_hash_never_ready_and_no_auto_retry() {
        let blobs = tempfile::tempdir().unwrap();
        let root = tempfile::tempdir().unwrap();
        let (path, _hash, size) = make_package(blobs.path(), "fn-c.tar.gz", "module.exports=3;");
        let cache = cache_with(blobs.path(), root.path(), u64::MAX);
        let d = descriptor("fn-c", &path, &"00".repeat(32), size);

        let err = cache.ensure(&d).await.unwrap_err();
        assert!(matches!(err, Error::BadPackage { .. }));
        assert_eq!(cache.stats().ready_count, 0);
        assert!(!root.path().join("fn-c/index.js").exists());

        // Same fingerprint: the recorded failure returns without refetching.
        let err = cache.ensure(&d).await.unwrap_err();
        assert!(matches!(err, Error::BadPackage { .. }));
        assert_eq!(cache.stats().misses, 1);
    }

    #[tokio::test]
    async fn test_stale_hash_invalidated_and_repopulated() {
        let blobs = tempfile::tempdir().unwrap();
        let root = tempfile::tempdir().unwrap();
        let (path1, hash1, size1) = make_package(blobs.path(), "fn-d-1.tar.gz", "module.exports='v1';");
        let (path2, hash2, size2) = make_package(blobs.path(), "fn-d-2.tar.gz", "module.exports='v2';");
        let cache = cache_with(blobs.path(), root.path(), u64::MAX);

        let v1 = descriptor("fn-d", &path1, &hash1, size1);
        drop(cache.ensure(&v1).await.unwrap());

        let mut v2 = descriptor("fn-d", &path2, &hash2, size2);
        v2.version = 2;
        let (handle, hit) = cache.ensure(&v2).await.unwrap();
        assert!(!hit);
        let contents = std::fs::read_to_string(handle.root_path().join("index.js")).unwrap();
        assert!(contents.contains("v2"));
        assert_eq!(cache.stats().misses, 2);
    }

    #[tokio::test]
    async fn test_eviction_skips_held_entries() {
        let blobs = tempfile::tempdir().unwrap();
        let root = tempfile::tempdir().unwrap();
        let (pa, ha, sa) = make_package(blobs.path(), "fn-e.tar.gz", "module.exports='e';");
        let (pb, hb, sb) = make_package(blobs.path(), "fn-f.tar.gz", "module.exports='f';");
        // Watermark of zero: every unpinned Ready entry is an eviction candidate.
        let cache = cache_with(blobs.path(), root.path(), 0);

        let (held, _) = cache.ensure(&descriptor("fn-e", &pa, &ha, sa)).await.unwrap();
        drop(cache.ensure(&descriptor("fn-f", &pb, &hb, sb)).await.unwrap());

        let report = cache.evict_to_watermark().await;
        assert_eq!(report.evicted, vec!["fn-f".to_string()]);
        assert!(held.root_path().join("index.js").is_file());
        drop(held);

        let report = cache.evict_to_watermark().await;
        assert_eq!(report.evicted, vec!["fn-e".to_string()]);
    }

    #[tokio::test]
    async fn test_evict_entry_busy_while_held() {
        let blobs = tempfile::tempdir().unwrap();
        let root = tempfile::tempdir().unwrap();
        let (p, h, s) = make_package(blobs.path(), "fn-g.tar.gz", "module.exports='g';");
        let cache = cache_with(blobs.path(), root.path(), u64::MAX);

        let (handle, _) = cache.ensure(&descriptor("fn-g", &p, &h, s)).await.unwrap();
        assert!(matches!(
            cache.evict_entry("fn-g").await,
            Err(Error::CacheBusy(_))
        ));
        drop(handle);
        assert!(cache.evict_entry("fn-g").await.is_ok());
        assert_eq!(cache.stats().entry_count, 0);
    }
}
