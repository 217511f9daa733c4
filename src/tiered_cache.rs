//! Two-tier chunk cache with L1 (memory) and L2 (disk) storage
//!
//! Chunks are keyed by the virtual path of the file they belong to and their
//! aligned byte range:
//! - L1: in-memory map bounded by total bytes, evicting the least recently
//!   used chunk
//! - L2: one file per chunk at `<base>/<virtual path>/<start>-<end>`, written
//!   behind by a single writer task and optionally bounded in total size by
//!   evicting the oldest files first
//!
//! Every L2 file starts with an 8-byte little-endian expiry timestamp
//! (seconds since the epoch). Expired files are removed on read.

use crate::error::{ProxyError, Result};
use crate::models::ByteRange;
use bytes::Bytes;
use std::collections::{HashMap, VecDeque};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

const EXPIRY_PREFIX_LEN: usize = 8;
const TEMP_SUFFIX: &str = "partial";

/// Message for the disk writer task
#[derive(Debug)]
enum DiskWriteMessage {
    Write {
        path: PathBuf,
        data: Bytes,
        expires_at: SystemTime,
    },
    Shutdown,
}

/// L1 cache entry with access tracking
struct L1Entry {
    data: Bytes,
    expires_at: SystemTime,
    last_used: u64,
}

#[derive(Default)]
struct L1State {
    entries: HashMap<String, L1Entry>,
    current_size: usize,
    clock: u64,
}

impl L1State {
    fn remove(&mut self, key: &str) {
        if let Some(entry) = self.entries.remove(key) {
            self.current_size = self.current_size.saturating_sub(entry.data.len());
        }
    }
}

/// Cache statistics
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TieredCacheStats {
    pub l1_entries: usize,
    pub l1_bytes: usize,
    pub l1_hits: u64,
    pub l2_hits: u64,
    pub misses: u64,
    pub disk_writes: u64,
    pub disk_errors: u64,
    pub disk_evictions: u64,
}

#[derive(Default)]
struct Counters {
    l1_hits: AtomicU64,
    l2_hits: AtomicU64,
    misses: AtomicU64,
    disk_writes: AtomicU64,
    disk_errors: AtomicU64,
    disk_evictions: AtomicU64,
}

/// Two-tier cache with memory (L1) and disk (L2) storage
pub struct TieredCache {
    l1: Mutex<L1State>,
    l1_max_size_bytes: usize,

    l2_base_path: PathBuf,
    l2_enabled: bool,

    ttl: Duration,
    counters: Arc<Counters>,

    disk_writer_tx: Option<mpsc::UnboundedSender<DiskWriteMessage>>,
    disk_writer: Mutex<Option<JoinHandle<()>>>,
}

impl TieredCache {
    /// Create a new two-tier cache
    ///
    /// # Arguments
    /// * `ttl` - Time-to-live for cached chunks
    /// * `l1_max_size_bytes` - Maximum L1 (memory) cache size
    /// * `l2_base_path` - Base directory for L2 (disk) cache
    /// * `l2_max_size_bytes` - Bound on L2 bytes on disk, `None` for unbounded
    pub async fn new(
        ttl: Duration,
        l1_max_size_bytes: usize,
        l2_base_path: impl AsRef<Path>,
        l2_max_size_bytes: Option<u64>,
    ) -> Result<Self> {
        let l2_base_path = l2_base_path.as_ref().to_path_buf();

        fs::create_dir_all(&l2_base_path).await.map_err(|e| {
            ProxyError::CacheError(format!(
                "Failed to create cache directory {}: {}",
                l2_base_path.display(),
                e
            ))
        })?;

        let existing = scan_existing(&l2_base_path).await;
        info!(
            "Initializing two-tier cache: L1={}MB, L2={:?} ({} files present, bound={:?})",
            l1_max_size_bytes / 1024 / 1024,
            l2_base_path,
            existing.len(),
            l2_max_size_bytes
        );

        let counters = Arc::new(Counters::default());
        let (tx, rx) = mpsc::unbounded_channel();
        let writer = DiskWriter {
            rx,
            max_size: l2_max_size_bytes,
            order: VecDeque::new(),
            sizes: HashMap::new(),
            total: 0,
            counters: counters.clone(),
        };
        let handle = tokio::spawn(writer.run(existing));

        Ok(TieredCache {
            l1: Mutex::new(L1State::default()),
            l1_max_size_bytes,
            l2_base_path,
            l2_enabled: true,
            ttl,
            counters,
            disk_writer_tx: Some(tx),
            disk_writer: Mutex::new(Some(handle)),
        })
    }

    /// Create a memory-only cache (L2 disabled)
    pub fn memory_only(ttl: Duration, l1_max_size_bytes: usize) -> Self {
        TieredCache {
            l1: Mutex::new(L1State::default()),
            l1_max_size_bytes,
            l2_base_path: PathBuf::new(),
            l2_enabled: false,
            ttl,
            counters: Arc::new(Counters::default()),
            disk_writer_tx: None,
            disk_writer: Mutex::new(None),
        }
    }

    /// Cache key of one chunk of the file at `remote`
    pub fn cache_key(remote: &str, range: &ByteRange) -> String {
        format!("{}/{}-{}", remote.trim_matches('/'), range.start, range.end)
    }

    /// Path of the L2 file holding one chunk
    ///
    /// Only plain path segments of `remote` are kept, so the file always lands
    /// under the base directory.
    pub fn l2_file_path(&self, remote: &str, range: &ByteRange) -> PathBuf {
        let mut path = self.l2_base_path.clone();
        for segment in remote.split('/') {
            if segment.is_empty() || segment == "." || segment == ".." {
                continue;
            }
            path.push(segment);
        }
        path.push(format!("{}-{}", range.start, range.end));
        path
    }

    /// Lookup a chunk in the cache (checks L1 then L2)
    pub async fn lookup(&self, remote: &str, range: &ByteRange) -> Result<Option<Bytes>> {
        let key = Self::cache_key(remote, range);
        let now = SystemTime::now();

        {
            let mut l1 = self.lock_l1();
            l1.clock += 1;
            let tick = l1.clock;
            let mut expired = false;
            if let Some(entry) = l1.entries.get_mut(&key) {
                if entry.expires_at > now {
                    entry.last_used = tick;
                    self.counters.l1_hits.fetch_add(1, Ordering::Relaxed);
                    debug!("L1 cache hit: {}", key);
                    return Ok(Some(entry.data.clone()));
                }
                expired = true;
            }
            if expired {
                l1.remove(&key);
            }
        }

        if self.l2_enabled {
            if let Some((data, expires_at)) = self.lookup_l2(remote, range).await? {
                self.store_l1(&key, data.clone(), expires_at);
                self.counters.l2_hits.fetch_add(1, Ordering::Relaxed);
                debug!("L2 cache hit (promoted to L1): {}", key);
                return Ok(Some(data));
            }
        }

        self.counters.misses.fetch_add(1, Ordering::Relaxed);
        debug!("Cache miss: {}", key);
        Ok(None)
    }

    /// Store a chunk in the cache (L1 + async L2)
    pub fn store(&self, remote: &str, range: &ByteRange, data: Bytes) -> Result<()> {
        let key = Self::cache_key(remote, range);
        let expires_at = SystemTime::now() + self.ttl;

        self.store_l1(&key, data.clone(), expires_at);

        if let Some(tx) = &self.disk_writer_tx {
            tx.send(DiskWriteMessage::Write {
                path: self.l2_file_path(remote, range),
                data,
                expires_at,
            })
            .map_err(|_| ProxyError::CacheError("disk writer has stopped".to_string()))?;
        }

        Ok(())
    }

    fn store_l1(&self, key: &str, data: Bytes, expires_at: SystemTime) {
        let data_size = data.len();
        if data_size > self.l1_max_size_bytes {
            debug!("Chunk {} ({} bytes) exceeds L1 capacity, not kept in memory", key, data_size);
            return;
        }

        let mut l1 = self.lock_l1();
        l1.remove(key);

        while l1.current_size + data_size > self.l1_max_size_bytes {
            let lru_key = l1
                .entries
                .iter()
                .min_by_key(|(_, entry)| entry.last_used)
                .map(|(k, _)| k.clone());
            match lru_key {
                Some(lru_key) => {
                    l1.remove(&lru_key);
                    debug!("Evicted LRU entry from L1: {}", lru_key);
                }
                None => break,
            }
        }

        l1.clock += 1;
        let last_used = l1.clock;
        l1.entries.insert(
            key.to_string(),
            L1Entry {
                data,
                expires_at,
                last_used,
            },
        );
        l1.current_size += data_size;
    }

    async fn lookup_l2(
        &self,
        remote: &str,
        range: &ByteRange,
    ) -> Result<Option<(Bytes, SystemTime)>> {
        let file_path = self.l2_file_path(remote, range);

        let data = match fs::read(&file_path).await {
            Ok(data) => data,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => {
                warn!("Failed to read L2 cache file {}: {}", file_path.display(), e);
                return Ok(None);
            }
        };

        let expected = range.size() as usize + EXPIRY_PREFIX_LEN;
        if data.len() != expected {
            warn!(
                "Discarding L2 cache file {} with unexpected length {} (want {})",
                file_path.display(),
                data.len(),
                expected
            );
            let _ = fs::remove_file(&file_path).await;
            return Ok(None);
        }

        let mut prefix = [0u8; EXPIRY_PREFIX_LEN];
        prefix.copy_from_slice(&data[..EXPIRY_PREFIX_LEN]);
        let expires_at = UNIX_EPOCH + Duration::from_secs(u64::from_le_bytes(prefix));

        if expires_at <= SystemTime::now() {
            debug!("L2 cache file expired: {}", file_path.display());
            let _ = fs::remove_file(&file_path).await;
            return Ok(None);
        }

        Ok(Some((Bytes::from(data).slice(EXPIRY_PREFIX_LEN..), expires_at)))
    }

    /// Get cache statistics
    pub fn get_stats(&self) -> TieredCacheStats {
        let (l1_entries, l1_bytes) = {
            let l1 = self.lock_l1();
            (l1.entries.len(), l1.current_size)
        };

        TieredCacheStats {
            l1_entries,
            l1_bytes,
            l1_hits: self.counters.l1_hits.load(Ordering::Relaxed),
            l2_hits: self.counters.l2_hits.load(Ordering::Relaxed),
            misses: self.counters.misses.load(Ordering::Relaxed),
            disk_writes: self.counters.disk_writes.load(Ordering::Relaxed),
            disk_errors: self.counters.disk_errors.load(Ordering::Relaxed),
            disk_evictions: self.counters.disk_evictions.load(Ordering::Relaxed),
        }
    }

    /// Stop the disk writer after it has flushed every queued write
    pub async fn shutdown(&self) {
        if let Some(tx) = &self.disk_writer_tx {
            let _ = tx.send(DiskWriteMessage::Shutdown);
        }

        let handle = self
            .disk_writer
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(handle) = handle {
            if let Err(e) = handle.await {
                error!("Disk writer task failed: {}", e);
            }
        }
    }

    fn lock_l1(&self) -> MutexGuard<'_, L1State> {
        self.l1.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl Drop for TieredCache {
    fn drop(&mut self) {
        if let Some(tx) = &self.disk_writer_tx {
            let _ = tx.send(DiskWriteMessage::Shutdown);
        }
    }
}

/// Owns the L2 directory: writes chunks and keeps the total size bounded
struct DiskWriter {
    rx: mpsc::UnboundedReceiver<DiskWriteMessage>,
    max_size: Option<u64>,
    order: VecDeque<PathBuf>,
    sizes: HashMap<PathBuf, u64>,
    total: u64,
    counters: Arc<Counters>,
}

impl DiskWriter {
    async fn run(mut self, existing: Vec<(PathBuf, u64)>) {
        for (path, size) in existing {
            self.track(path, size);
        }
        self.evict().await;

        debug!("Disk writer task started");

        while let Some(msg) = self.rx.recv().await {
            match msg {
                DiskWriteMessage::Write {
                    path,
                    data,
                    expires_at,
                } => match write_to_disk(&path, &data, expires_at).await {
                    Ok(()) => {
                        self.counters.disk_writes.fetch_add(1, Ordering::Relaxed);
                        self.track(path, (data.len() + EXPIRY_PREFIX_LEN) as u64);
                        self.evict().await;
                    }
                    Err(e) => {
                        error!("Failed to write to L2 cache: {}", e);
                        self.counters.disk_errors.fetch_add(1, Ordering::Relaxed);
                    }
                },
                DiskWriteMessage::Shutdown => {
                    info!("Disk writer task shutting down");
                    break;
                }
            }
        }
    }

    fn track(&mut self, path: PathBuf, size: u64) {
        if let Some(old) = self.sizes.insert(path.clone(), size) {
            self.total = self.total.saturating_sub(old);
            self.order.retain(|p| p != &path);
        }
        self.total += size;
        self.order.push_back(path);
    }

    async fn evict(&mut self) {
        let Some(max_size) = self.max_size else {
            return;
        };

        while self.total > max_size {
            let Some(oldest) = self.order.pop_front() else {
                break;
            };
            let size = self.sizes.remove(&oldest).unwrap_or(0);
            self.total = self.total.saturating_sub(size);

            match fs::remove_file(&oldest).await {
                Ok(()) => {
                    self.counters.disk_evictions.fetch_add(1, Ordering::Relaxed);
                    debug!("Evicted from L2: {}", oldest.display());
                }
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => warn!("Failed to evict L2 cache file {}: {}", oldest.display(), e),
            }
        }
    }
}

async fn write_to_disk(file_path: &Path, data: &Bytes, expires_at: SystemTime) -> Result<()> {
    if let Some(parent) = file_path.parent() {
        fs::create_dir_all(parent).await.map_err(|e| {
            ProxyError::CacheError(format!("Failed to create cache directory: {}", e))
        })?;
    }

    let expires_at_secs = expires_at
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs();

    // Readers never see a half-written chunk: write aside, then rename.
    let temp_path = file_path.with_extension(TEMP_SUFFIX);
    let mut file = fs::File::create(&temp_path)
        .await
        .map_err(|e| ProxyError::CacheError(format!("Failed to create cache file: {}", e)))?;

    file.write_all(&expires_at_secs.to_le_bytes())
        .await
        .map_err(|e| ProxyError::CacheError(format!("Failed to write timestamp: {}", e)))?;
    file.write_all(data)
        .await
        .map_err(|e| ProxyError::CacheError(format!("Failed to write data: {}", e)))?;
    file.sync_all()
        .await
        .map_err(|e| ProxyError::CacheError(format!("Failed to sync file: {}", e)))?;
    drop(file);

    fs::rename(&temp_path, file_path)
        .await
        .map_err(|e| ProxyError::CacheError(format!("Failed to commit cache file: {}", e)))?;

    debug!("Wrote to L2: {} ({} bytes)", file_path.display(), data.len());
    Ok(())
}

/// Chunk files already under `base`, oldest first. Leftover partial writes
/// are removed.
async fn scan_existing(base: &Path) -> Vec<(PathBuf, u64)> {
    let mut found = Vec::new();
    let mut pending = vec![base.to_path_buf()];

    while let Some(dir) = pending.pop() {
        let mut entries = match fs::read_dir(&dir).await {
            Ok(entries) => entries,
            Err(e) => {
                warn!("Failed to scan cache directory {}: {}", dir.display(), e);
                continue;
            }
        };

        while let Ok(Some(entry)) = entries.next_entry().await {
            let path = entry.path();
            let Ok(metadata) = entry.metadata().await else {
                continue;
            };
            if metadata.is_dir() {
                pending.push(path);
            } else if path.extension().is_some_and(|ext| ext == TEMP_SUFFIX) {
                let _ = fs::remove_file(&path).await;
            } else {
                let modified = metadata.modified().unwrap_or(UNIX_EPOCH);
                found.push((path, metadata.len(), modified));
            }
        }
    }

    found.sort_by_key(|(_, _, modified)| *modified);
    found.into_iter().map(|(path, size, _)| (path, size)).collect()
}
