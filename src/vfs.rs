//! Caching layer between the HTTP handler and a [`RemoteFs`]
//!
//! Reads of files with a known size are split into aligned chunks. Each chunk
//! is served from the [`TieredCache`] when present, otherwise fetched with a
//! ranged open and stored. Up to `chunk_streams` chunks are in flight per
//! read and they are always emitted in file order. Files of unknown size
//! cannot be chunked and stream straight from upstream.

use crate::chunk_calculator::{ChunkCalculator, ChunkSpec};
use crate::config::{CacheConfig, CacheMode};
use crate::error::{ProxyError, Result};
use crate::metrics::ProxyMetrics;
use crate::models::{clean_dir, ByteRange, FileInfo, Node};
use crate::remote_fs::{ByteStream, RemoteFs};
use crate::tiered_cache::{TieredCache, TieredCacheStats};
use bytes::{Bytes, BytesMut};
use dashmap::DashMap;
use futures_util::{stream, StreamExt};
use http::header::{HeaderMap, HeaderValue, RANGE};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime};
use tracing::{debug, info, warn};

/// Stat memoization inserts between sweeps of expired entries
const STAT_SWEEP_INTERVAL: u64 = 256;

/// Caching view over a remote filesystem
pub struct Vfs {
    fs: Arc<dyn RemoteFs>,
    cache: Option<Arc<TieredCache>>,
    calculator: ChunkCalculator,
    chunk_streams: usize,
    dir_cache_time: Duration,
    stat_cache: DashMap<String, (Instant, Node)>,
    stat_inserts: AtomicU64,
    metrics: Option<Arc<ProxyMetrics>>,
}

impl Vfs {
    /// Create the caching layer, opening the chunk cache when enabled
    pub async fn new(
        fs: Arc<dyn RemoteFs>,
        config: &CacheConfig,
        metrics: Option<Arc<ProxyMetrics>>,
    ) -> Result<Self> {
        let cache = match config.cache_mode {
            CacheMode::Full => Some(Arc::new(
                TieredCache::new(
                    config.max_age(),
                    config.memory_size_bytes,
                    &config.cache_dir,
                    config.max_size_bytes,
                )
                .await?,
            )),
            CacheMode::Off => None,
        };

        info!(
            "VFS ready for {}: cache_mode={:?}, chunk_size={}, chunk_streams={}",
            fs.name(),
            config.cache_mode,
            config.chunk_size,
            config.chunk_streams
        );

        Ok(Vfs {
            fs,
            cache,
            calculator: ChunkCalculator::new(config.chunk_size),
            chunk_streams: config.chunk_streams.max(1),
            dir_cache_time: config.dir_cache_time(),
            stat_cache: DashMap::new(),
            stat_inserts: AtomicU64::new(0),
            metrics,
        })
    }

    pub fn fs(&self) -> &Arc<dyn RemoteFs> {
        &self.fs
    }

    /// Stat `path` as a file, or as a directory when no file lives there
    pub async fn stat(&self, path: &str) -> Result<Node> {
        let path = clean_dir(path);

        if !self.dir_cache_time.is_zero() {
            let cached = self
                .stat_cache
                .get(&path)
                .map(|entry| (entry.0.elapsed() < self.dir_cache_time, entry.1.clone()));
            match cached {
                Some((true, node)) => {
                    debug!("Stat cache hit: {}", path);
                    return Ok(node);
                }
                Some((false, _)) => {
                    self.stat_cache.remove(&path);
                }
                None => {}
            }
        }

        let node = match self.fs.stat(&path).await {
            Ok(info) => Node::File(info),
            Err(e) if e.is_not_found() => {
                if !self.fs.dir_exists(&path).await? {
                    return Err(e);
                }
                Node::Dir {
                    path: path.clone(),
                    mod_time: SystemTime::now(),
                }
            }
            Err(e) => return Err(e),
        };

        if !self.dir_cache_time.is_zero() {
            self.stat_cache.insert(path, (Instant::now(), node.clone()));
            if self.stat_inserts.fetch_add(1, Ordering::Relaxed) % STAT_SWEEP_INTERVAL == 0 {
                self.purge_expired_stats();
            }
        }
        Ok(node)
    }

    /// Drop memoized stats older than `dir_cache_time`
    pub fn purge_expired_stats(&self) {
        let ttl = self.dir_cache_time;
        let before = self.stat_cache.len();
        self.stat_cache.retain(|_, entry| entry.0.elapsed() < ttl);
        let purged = before.saturating_sub(self.stat_cache.len());
        if purged > 0 {
            debug!("Purged {} expired stat entries", purged);
        }
    }

    /// Number of memoized stats, expired or not
    pub fn stat_cache_len(&self) -> usize {
        self.stat_cache.len()
    }

    pub async fn list(&self, dir: &str) -> Result<Vec<Node>> {
        self.fs.list(dir).await
    }

    /// Read `range` of `file`, or the whole file when `range` is `None`
    ///
    /// A file of unknown size cannot be read by range.
    pub async fn open(&self, file: &FileInfo, range: Option<ByteRange>) -> Result<ByteStream> {
        let Some(size) = file.size else {
            if range.is_some() {
                return Err(ProxyError::InvalidRange(format!(
                    "{} has no known size",
                    file.remote
                )));
            }
            debug!("Streaming {} of unknown size straight through", file.remote);
            let object = self.fs.open(&file.remote, &HeaderMap::new()).await?;
            return Ok(self.count_upstream(object.stream));
        };

        let chunks = self.calculator.calculate_chunks(size, range)?;
        debug!(
            "Reading {} ({} bytes) as {} chunks",
            file.remote,
            size,
            chunks.remaining()
        );

        let fetcher = ChunkFetcher {
            fs: self.fs.clone(),
            cache: self.cache.clone(),
            metrics: self.metrics.clone(),
            remote: Arc::from(file.remote.as_str()),
            cache_path: Arc::from(chunk_cache_path(&file.remote, size).as_str()),
        };

        let chunks = stream::iter(chunks)
            .map(move |chunk| {
                let fetcher = fetcher.clone();
                async move { fetcher.fetch(chunk).await }
            })
            .buffered(self.chunk_streams);

        Ok(Box::pin(chunks))
    }

    pub fn cache_stats(&self) -> Option<TieredCacheStats> {
        self.cache.as_ref().map(|cache| cache.get_stats())
    }

    /// Flush pending cache writes
    pub async fn shutdown(&self) {
        if let Some(cache) = &self.cache {
            cache.shutdown().await;
        }
        info!("VFS for {} shut down", self.fs.name());
    }

    fn count_upstream(&self, body: ByteStream) -> ByteStream {
        match self.metrics.clone() {
            Some(metrics) => Box::pin(body.inspect(move |piece| {
                if let Ok(bytes) = piece {
                    metrics.record_upstream_bytes(bytes.len() as u64);
                }
            })),
            None => body,
        }
    }
}

/// Everything one chunk read needs, detached from the `Vfs` borrow
#[derive(Clone)]
struct ChunkFetcher {
    fs: Arc<dyn RemoteFs>,
    cache: Option<Arc<TieredCache>>,
    metrics: Option<Arc<ProxyMetrics>>,
    remote: Arc<str>,
    /// Where this version of the file's chunks live in the cache
    cache_path: Arc<str>,
}

impl ChunkFetcher {
    async fn fetch(&self, chunk: ChunkSpec) -> Result<Bytes> {
        if let Some(cache) = &self.cache {
            match cache.lookup(&self.cache_path, &chunk.range).await {
                Ok(Some(data)) => {
                    if let Some(metrics) = &self.metrics {
                        metrics.record_chunk_hit();
                    }
                    return Ok(wanted_part(&chunk, data));
                }
                Ok(None) => {}
                Err(e) => warn!("Chunk cache lookup failed for {}: {}", self.remote, e),
            }
        }

        if let Some(metrics) = &self.metrics {
            metrics.record_chunk_miss();
        }

        let data = self.download(&chunk.range).await?;

        if let Some(cache) = &self.cache {
            if let Err(e) = cache.store(&self.cache_path, &chunk.range, data.clone()) {
                warn!("Failed to cache chunk {} of {}: {}", chunk.index, self.remote, e);
            }
        }

        Ok(wanted_part(&chunk, data))
    }

    /// Fetch exactly `range` from upstream
    async fn download(&self, range: &ByteRange) -> Result<Bytes> {
        let mut headers = HeaderMap::new();
        let value = HeaderValue::from_str(&range.to_header())
            .map_err(|e| ProxyError::InternalError(format!("invalid range header: {}", e)))?;
        headers.insert(RANGE, value);

        let object = self.fs.open(&self.remote, &headers).await?;
        let skip = if object.is_partial() {
            0
        } else {
            debug!(
                "Upstream ignored Range for {}, reading {} from the full body",
                self.remote,
                range.to_header()
            );
            range.start
        };

        self.read_exact(object.stream, skip, range.size()).await
    }

    /// Collect `len` bytes of `body` after discarding the first `skip`
    async fn read_exact(&self, mut body: ByteStream, mut skip: u64, len: u64) -> Result<Bytes> {
        let len = len as usize;
        let mut buf = BytesMut::with_capacity(len);

        while let Some(piece) = body.next().await {
            let mut piece = piece?;
            if let Some(metrics) = &self.metrics {
                metrics.record_upstream_bytes(piece.len() as u64);
            }

            if skip > 0 {
                if piece.len() as u64 <= skip {
                    skip -= piece.len() as u64;
                    continue;
                }
                piece = piece.slice(skip as usize..);
                skip = 0;
            }

            let take = (len - buf.len()).min(piece.len());
            buf.extend_from_slice(&piece[..take]);
            if buf.len() == len {
                return Ok(buf.freeze());
            }
        }

        Err(ProxyError::HttpError(format!(
            "upstream body for {} ended after {} of {} bytes",
            self.remote,
            buf.len(),
            len
        )))
    }
}

/// Cache location of the chunks of `remote` at `size` bytes
///
/// Chunks are filed under the size they were read at, so a file whose size
/// changes never serves chunks of its previous version. Modification times
/// are not part of it: they may be synthesized at registration.
pub fn chunk_cache_path(remote: &str, size: u64) -> String {
    format!("{}/{}", remote.trim_end_matches('/'), size)
}

fn wanted_part(chunk: &ChunkSpec, data: Bytes) -> Bytes {
    if chunk.is_whole() {
        return data;
    }
    let (start, end) = chunk.wanted_offsets();
    data.slice(start..end.min(data.len()))
}
