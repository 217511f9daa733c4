//! Virtual filesystem over registered URLs
//!
//! [`RemoteFs`] is the capability set the caching engine needs from a
//! backend. [`UrlFs`] implements it on top of the [`UrlRegistry`]: every
//! registered identifier is a read-only file living at its sharded path.

use crate::cache_key::sharded_path;
use crate::config::ProxyConfig;
use crate::error::{ProxyError, Result};
use crate::models::{clean_dir, leaf_name, FileInfo, Node};
use crate::pacer::Pacer;
use crate::registry::UrlRegistry;
use crate::resolver::{retryable_outcome, MetadataResolver};
use async_trait::async_trait;
use bytes::Bytes;
use futures_util::{Stream, StreamExt};
use http::HeaderMap;
use reqwest::{Client, Response, StatusCode};
use std::collections::BTreeSet;
use std::pin::Pin;
use std::sync::Arc;
use std::time::{Duration, SystemTime};
use tracing::{debug, warn};

/// Body of a remote object, read incrementally
pub type ByteStream = Pin<Box<dyn Stream<Item = Result<Bytes>> + Send>>;

/// An opened remote object
pub struct RemoteObject {
    /// Upstream status, 200 or 206
    pub status: u16,
    pub stream: ByteStream,
}

impl RemoteObject {
    /// Whether upstream honoured the requested range
    pub fn is_partial(&self) -> bool {
        self.status == StatusCode::PARTIAL_CONTENT.as_u16()
    }
}

impl std::fmt::Debug for RemoteObject {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RemoteObject")
            .field("status", &self.status)
            .finish_non_exhaustive()
    }
}

/// Backend operations used by the caching engine
///
/// Mutating operations default to [`ProxyError::ReadOnly`].
#[async_trait]
pub trait RemoteFs: Send + Sync {
    fn name(&self) -> &str;

    /// Stat the file at `path`
    async fn stat(&self, path: &str) -> Result<FileInfo>;

    /// Open the file at `path`; `overrides` replace same-named stored headers
    async fn open(&self, path: &str, overrides: &HeaderMap) -> Result<RemoteObject>;

    /// Entries directly under `dir`
    async fn list(&self, dir: &str) -> Result<Vec<Node>>;

    /// Whether `dir` is a directory
    async fn dir_exists(&self, dir: &str) -> Result<bool> {
        let dir = clean_dir(dir);
        if dir.is_empty() {
            return Ok(true);
        }
        let parent = dir.rsplit_once('/').map_or("", |(parent, _)| parent);
        let entries = self.list(parent).await?;
        Ok(entries
            .iter()
            .any(|node| matches!(node, Node::Dir { path, .. } if *path == dir)))
    }

    async fn put(&self, _path: &str, _data: Bytes) -> Result<FileInfo> {
        Err(ProxyError::ReadOnly)
    }

    async fn remove(&self, _path: &str) -> Result<()> {
        Err(ProxyError::ReadOnly)
    }

    async fn set_mod_time(&self, _path: &str, _mod_time: SystemTime) -> Result<()> {
        Err(ProxyError::ReadOnly)
    }

    async fn mkdir(&self, _dir: &str) -> Result<()> {
        Err(ProxyError::ReadOnly)
    }

    async fn rmdir(&self, _dir: &str) -> Result<()> {
        Err(ProxyError::ReadOnly)
    }

    async fn rename(&self, _from: &str, _to: &str) -> Result<()> {
        Err(ProxyError::ReadOnly)
    }

    async fn truncate(&self, _path: &str, _size: u64) -> Result<()> {
        Err(ProxyError::ReadOnly)
    }
}

/// Read-only filesystem of registered URLs
pub struct UrlFs {
    name: String,
    registry: Arc<UrlRegistry>,
    resolver: MetadataResolver,
    client: Client,
    shard_level: usize,
}

impl UrlFs {
    pub fn new(
        name: impl Into<String>,
        registry: Arc<UrlRegistry>,
        client: Client,
        pacer: Arc<Pacer>,
        shard_level: usize,
    ) -> Self {
        UrlFs {
            name: name.into(),
            registry,
            resolver: MetadataResolver::new(client.clone(), pacer),
            client,
            shard_level,
        }
    }

    /// Build the filesystem with the client and pacer described by `config`
    pub fn from_config(
        name: impl Into<String>,
        registry: Arc<UrlRegistry>,
        config: &ProxyConfig,
    ) -> Result<Self> {
        let client = Client::builder()
            .connect_timeout(Duration::from_secs(config.connect_timeout_secs))
            .build()
            .map_err(|e| ProxyError::HttpError(format!("Failed to create HTTP client: {}", e)))?;
        let pacer = Arc::new(Pacer::new(config.retry_policy()));

        Ok(UrlFs::new(name, registry, client, pacer, config.shard_level))
    }

    pub fn registry(&self) -> &Arc<UrlRegistry> {
        &self.registry
    }

    pub fn shard_level(&self) -> usize {
        self.shard_level
    }

    /// Virtual path of a registered identifier
    pub fn path_of(&self, remote: &str) -> String {
        sharded_path(remote, self.shard_level)
    }

    fn into_stream(response: Response) -> ByteStream {
        Box::pin(
            response
                .bytes_stream()
                .map(|chunk| chunk.map_err(ProxyError::from)),
        )
    }
}

#[async_trait]
impl RemoteFs for UrlFs {
    fn name(&self) -> &str {
        &self.name
    }

    /// Only the leaf segment identifies the file; shard prefixes are ignored
    async fn stat(&self, path: &str) -> Result<FileInfo> {
        let remote = leaf_name(path);
        let entry = self
            .registry
            .lookup(remote)
            .ok_or_else(|| ProxyError::NotFound(remote.to_string()))?;

        if let Some((size, mod_time)) = entry.known() {
            debug!("Stat {} from registered size {}", remote, size);
            return Ok(FileInfo {
                remote: path.to_string(),
                size: Some(size),
                mod_time,
                mime_type: None,
            });
        }

        let metadata = self.resolver.resolve(&entry).await?;
        Ok(FileInfo {
            remote: path.to_string(),
            size: Some(metadata.content_length),
            mod_time: metadata.modified,
            mime_type: metadata.content_type,
        })
    }

    async fn open(&self, path: &str, overrides: &HeaderMap) -> Result<RemoteObject> {
        let remote = leaf_name(path);
        let entry = self
            .registry
            .lookup(remote)
            .ok_or_else(|| ProxyError::NotFound(remote.to_string()))?;

        let mut headers = entry.headers.clone();
        for (name, value) in overrides {
            headers.insert(name.clone(), value.clone());
        }

        debug!("Opening {} -> {}", remote, entry.url);
        let response = self
            .resolver
            .pacer()
            .call(
                || self.client.get(&entry.url).headers(headers.clone()).send(),
                retryable_outcome,
            )
            .await?;

        let status = response.status();
        if status != StatusCode::OK && status != StatusCode::PARTIAL_CONTENT {
            warn!("GET {} failed with status {}", entry.url, status);
            return Err(ProxyError::from_http_status(
                status.as_u16(),
                format!("GET failed: {}", status),
            ));
        }

        Ok(RemoteObject {
            status: status.as_u16(),
            stream: Self::into_stream(response),
        })
    }

    /// Linear scan of the registry grouped by sharded path
    async fn list(&self, dir: &str) -> Result<Vec<Node>> {
        let dir = clean_dir(dir);
        let mut files = Vec::new();
        let mut dirs = BTreeSet::new();

        for remote in self.registry.identifiers() {
            let sharded = self.path_of(&remote);
            let relative = if dir.is_empty() {
                sharded.as_str()
            } else {
                match sharded
                    .strip_prefix(dir.as_str())
                    .and_then(|rest| rest.strip_prefix('/'))
                {
                    Some(rest) => rest,
                    None => continue,
                }
            };

            match relative.split_once('/') {
                None => files.push(sharded.clone()),
                Some((sub, _)) if dir.is_empty() => {
                    dirs.insert(sub.to_string());
                }
                Some((sub, _)) => {
                    dirs.insert(format!("{}/{}", dir, sub));
                }
            }
        }

        let now = SystemTime::now();
        let mut entries: Vec<Node> = dirs
            .into_iter()
            .map(|path| Node::Dir { path, mod_time: now })
            .collect();

        files.sort();
        for path in files {
            match self.stat(&path).await {
                Ok(info) => entries.push(Node::File(info)),
                Err(e) => debug!("Skipping {} in listing: {}", path, e),
            }
        }

        Ok(entries)
    }

    /// A directory exists while some registered path lies beneath it
    async fn dir_exists(&self, dir: &str) -> Result<bool> {
        let dir = clean_dir(dir);
        if dir.is_empty() {
            return Ok(true);
        }
        let prefix = format!("{}/", dir);
        Ok(self
            .registry
            .identifiers()
            .iter()
            .any(|remote| self.path_of(remote).starts_with(&prefix)))
    }
}
