//! Cache key computation for remote URLs
//!
//! A target URL is normalized (optionally dropping the query string and/or the
//! scheme, host, user-info and fragment), digested with MD5 and rendered as
//! lowercase hex. The hex key doubles as the virtual filename; [`sharded_path`]
//! expands it into nested two-character directories to bound per-directory
//! fan-out in the cache directory.
//!
//! The normalized form is used only as digest input. The URL actually fetched
//! upstream is always the one the client supplied.

use dashmap::DashMap;
use md5::{Digest, Md5};
use std::sync::atomic::{AtomicU64, Ordering};
use tracing::debug;
use url::Url;

/// Strip URL components that should not influence the cache key
///
/// * `strip_query` - drop the query string (the fragment is kept)
/// * `strip_domain` - drop scheme, host, port, user-info and fragment
///
/// With both switches off the input is returned untouched without parsing.
/// A relative reference keeps its relative form, so `/a?x=1` strips to `/a`.
/// A URL that fails to parse is returned untouched: a degraded key is
/// better than a failed request.
pub fn strip_url(u: &str, strip_query: bool, strip_domain: bool) -> String {
    if !strip_query && !strip_domain {
        return u.to_string();
    }

    let (mut parsed, relative) = match Url::parse(u) {
        Ok(parsed) => (parsed, false),
        Err(url::ParseError::RelativeUrlWithoutBase) => {
            match Url::parse(RELATIVE_BASE).and_then(|base| base.join(u)) {
                Ok(parsed) => (parsed, true),
                Err(e) => {
                    debug!("Using raw URL as cache key input, parse failed: {}", e);
                    return u.to_string();
                }
            }
        }
        Err(e) => {
            debug!("Using raw URL as cache key input, parse failed: {}", e);
            return u.to_string();
        }
    };

    if strip_query {
        parsed.set_query(None);
    }

    if strip_domain || relative {
        let mut stripped = parsed.path().to_string();
        if relative && !u.starts_with('/') {
            stripped.remove(0);
        }
        if let Some(query) = parsed.query() {
            stripped.push('?');
            stripped.push_str(query);
        }
        if !strip_domain {
            if let Some(fragment) = parsed.fragment() {
                stripped.push('#');
                stripped.push_str(fragment);
            }
        }
        return stripped;
    }

    parsed.to_string()
}

/// Base that relative references are parsed against; it never reaches a key
const RELATIVE_BASE: &str = "http://relative.invalid/";

/// Digest a normalization key into a 32-character lowercase hex cache key
pub fn digest_key(normalized: &str) -> String {
    let mut hasher = Md5::new();
    hasher.update(normalized.as_bytes());
    hex::encode(hasher.finalize())
}

/// Normalize and digest a raw target URL
pub fn compute_key(raw_url: &str, strip_query: bool, strip_domain: bool) -> String {
    digest_key(&strip_url(raw_url, strip_query, strip_domain))
}

/// Expand a cache key into a sharded path
///
/// `sharded_path("ab12cd34", 2)` yields `"ab/12/ab12cd34"`. A depth of zero,
/// or a key shorter than `2 * depth`, yields the bare key.
pub fn sharded_path(key: &str, depth: usize) -> String {
    if depth == 0 || key.len() < depth * 2 {
        return key.to_string();
    }

    let mut parts = Vec::with_capacity(depth + 1);
    for level in 0..depth {
        match key.get(level * 2..level * 2 + 2) {
            Some(prefix) => parts.push(prefix),
            None => return key.to_string(),
        }
    }
    parts.push(key);
    parts.join("/")
}

/// Memo of raw target URL -> cache key
///
/// Lookups take a shared shard lock. A miss takes the exclusive lock for that
/// shard only and re-checks before digesting, so each distinct raw URL is
/// digested at most once. Entries are never evicted.
#[derive(Debug)]
pub struct HashCache {
    entries: DashMap<String, String>,
    strip_query: bool,
    strip_domain: bool,
    digests: AtomicU64,
}

impl HashCache {
    /// Create an empty cache with the given normalization switches
    pub fn new(strip_query: bool, strip_domain: bool) -> Self {
        HashCache {
            entries: DashMap::new(),
            strip_query,
            strip_domain,
            digests: AtomicU64::new(0),
        }
    }

    /// Return the cache key for `target_url`, computing it on first use
    pub fn file_hash(&self, target_url: &str) -> String {
        let cached = self
            .entries
            .get(target_url)
            .map(|hash| hash.value().clone());
        if let Some(hash) = cached {
            return hash;
        }

        self.entries
            .entry(target_url.to_string())
            .or_insert_with(|| {
                self.digests.fetch_add(1, Ordering::Relaxed);
                compute_key(target_url, self.strip_query, self.strip_domain)
            })
            .value()
            .clone()
    }

    /// Number of digests computed so far
    pub fn digest_count(&self) -> u64 {
        self.digests.load(Ordering::Relaxed)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
