//! Registry of remote identifiers and the URLs they resolve to
//!
//! The registry is the durable source of truth for the virtual filesystem:
//! every virtual file is an identifier registered here. It lives for the life
//! of the process and is handed by `Arc` to both the HTTP handler and the
//! filesystem adapter. Entries are never evicted.
//!
//! `register` is insert-if-absent and safe to call on every request.
//! `register_with_size` is a full overwrite and the only way to correct an
//! entry.

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use http::header::{self, HeaderMap, HeaderName};
use std::sync::Arc;
use std::time::SystemTime;
use tracing::debug;

/// One registered remote resource
#[derive(Debug, Clone)]
pub struct RegistryEntry {
    pub url: String,
    /// Headers replayed on every upstream fetch of this resource
    pub headers: HeaderMap,
    known_size: Option<u64>,
    known_mod_time: Option<SystemTime>,
}

impl RegistryEntry {
    /// An entry whose size must be resolved upstream
    pub fn new(url: impl Into<String>, headers: HeaderMap) -> Self {
        RegistryEntry {
            url: url.into(),
            headers,
            known_size: None,
            known_mod_time: None,
        }
    }

    /// An entry with an authoritative size, modified "now"
    pub fn with_size(url: impl Into<String>, headers: HeaderMap, size: u64) -> Self {
        RegistryEntry {
            url: url.into(),
            headers,
            known_size: Some(size),
            known_mod_time: Some(SystemTime::now()),
        }
    }

    /// Pre-known size and modification time, if registered with a size
    pub fn known(&self) -> Option<(u64, SystemTime)> {
        match (self.known_size, self.known_mod_time) {
            (Some(size), Some(mod_time)) => Some((size, mod_time)),
            _ => None,
        }
    }

    pub fn known_size(&self) -> Option<u64> {
        self.known_size
    }
}

/// Process-wide table of remote identifier -> [`RegistryEntry`]
#[derive(Debug, Default)]
pub struct UrlRegistry {
    entries: DashMap<String, Arc<RegistryEntry>>,
}

impl UrlRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `remote` if it is not already known
    ///
    /// Returns `true` only when this call created the entry. An existing
    /// entry is left untouched.
    pub fn register(&self, remote: &str, url: &str, headers: HeaderMap) -> bool {
        match self.entries.entry(remote.to_string()) {
            Entry::Occupied(_) => false,
            Entry::Vacant(vacant) => {
                debug!("Registered remote={} url={}", remote, url);
                vacant.insert(Arc::new(RegistryEntry::new(url, headers)));
                true
            }
        }
    }

    /// Register `remote` with a known size, replacing any existing entry
    ///
    /// Returns `true` when no entry existed before.
    pub fn register_with_size(
        &self,
        remote: &str,
        url: &str,
        headers: HeaderMap,
        size: u64,
    ) -> bool {
        debug!("Registered remote={} url={} size={}", remote, url, size);
        self.entries
            .insert(
                remote.to_string(),
                Arc::new(RegistryEntry::with_size(url, headers, size)),
            )
            .is_none()
    }

    pub fn lookup(&self, remote: &str) -> Option<Arc<RegistryEntry>> {
        self.entries.get(remote).map(|entry| Arc::clone(entry.value()))
    }

    /// URL registered for `remote`
    pub fn load(&self, remote: &str) -> Option<String> {
        self.entries.get(remote).map(|entry| entry.url.clone())
    }

    /// Snapshot of all registered identifiers
    pub fn identifiers(&self) -> Vec<String> {
        self.entries.iter().map(|entry| entry.key().clone()).collect()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Headers from the client request that describe the client's exchange with
/// this proxy rather than the upstream object.
const NON_REPLAYABLE: [HeaderName; 16] = [
    header::HOST,
    header::CONNECTION,
    header::PROXY_AUTHENTICATE,
    header::PROXY_AUTHORIZATION,
    header::TE,
    header::TRAILER,
    header::TRANSFER_ENCODING,
    header::UPGRADE,
    header::CONTENT_LENGTH,
    header::ACCEPT_ENCODING,
    header::RANGE,
    header::IF_RANGE,
    header::IF_MATCH,
    header::IF_NONE_MATCH,
    header::IF_MODIFIED_SINCE,
    header::IF_UNMODIFIED_SINCE,
];

/// Request header carrying a caller-supplied object size; it steers the
/// proxy only and is never sent upstream
pub const SIZE_HINT_HEADER: &str = "x-file-size";

/// Copy the request headers that may be replayed upstream
pub fn replayable_headers(headers: &HeaderMap) -> HeaderMap {
    let mut replay = HeaderMap::with_capacity(headers.len());
    for (name, value) in headers {
        if NON_REPLAYABLE.contains(name)
            || name.as_str() == "keep-alive"
            || name.as_str() == SIZE_HINT_HEADER
        {
            continue;
        }
        replay.append(name.clone(), value.clone());
    }
    replay
}
