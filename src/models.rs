//! Core data models for the VFS cache proxy

use crate::error::{Result, ProxyError};
use serde::{Deserialize, Serialize};
use std::time::SystemTime;

/// Represents a byte range for HTTP Range requests
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ByteRange {
    /// Starting byte position (inclusive)
    pub start: u64,
    /// Ending byte position (inclusive)
    pub end: u64,
}

impl ByteRange {
    /// Create a new ByteRange
    ///
    /// # Arguments
    /// * `start` - Starting byte position (inclusive)
    /// * `end` - Ending byte position (inclusive)
    ///
    /// # Returns
    /// * `Ok(ByteRange)` if the range is valid
    /// * `Err(ProxyError)` if start > end
    pub fn new(start: u64, end: u64) -> Result<Self> {
        if start > end {
            return Err(ProxyError::InvalidRange(format!(
                "start ({}) must be <= end ({})",
                start, end
            )));
        }
        Ok(ByteRange { start, end })
    }

    /// Get the size of this byte range in bytes
    pub fn size(&self) -> u64 {
        self.end - self.start + 1
    }

    /// Whether `other` lies entirely within this range
    pub fn contains(&self, other: &ByteRange) -> bool {
        other.start >= self.start && other.end <= self.end
    }

    /// Parse a client Range header against a resource of `size` bytes
    ///
    /// Accepts `bytes=a-b`, `bytes=a-` and `bytes=-n` specs, comma separated.
    /// Ends past the resource are clamped; specs starting past the end are
    /// dropped. Returns `InvalidRange` when the header is malformed or when
    /// no spec overlaps the resource.
    pub fn parse_ranges(header: &str, size: u64) -> Result<Vec<ByteRange>> {
        let header = header.trim();
        let specs = header.strip_prefix("bytes=").ok_or_else(|| {
            ProxyError::InvalidRange(format!(
                "Range header must start with 'bytes=', got: {}",
                header
            ))
        })?;

        let mut ranges = Vec::new();
        let mut no_overlap = false;

        for spec in specs.split(',') {
            let spec = spec.trim();
            if spec.is_empty() {
                continue;
            }

            let (start, end) = spec.split_once('-').ok_or_else(|| {
                ProxyError::InvalidRange(format!("Invalid range spec: {}", spec))
            })?;
            let (start, end) = (start.trim(), end.trim());

            if start.is_empty() {
                // Suffix form: the last `n` bytes
                let suffix = end.parse::<u64>().map_err(|e| {
                    ProxyError::InvalidRange(format!("Invalid suffix length '{}': {}", end, e))
                })?;
                if suffix == 0 || size == 0 {
                    no_overlap = true;
                    continue;
                }
                let suffix = suffix.min(size);
                ranges.push(ByteRange {
                    start: size - suffix,
                    end: size - 1,
                });
                continue;
            }

            let first = start.parse::<u64>().map_err(|e| {
                ProxyError::InvalidRange(format!("Invalid start value '{}': {}", start, e))
            })?;

            let last = if end.is_empty() {
                None
            } else {
                let last = end.parse::<u64>().map_err(|e| {
                    ProxyError::InvalidRange(format!("Invalid end value '{}': {}", end, e))
                })?;
                if first > last {
                    return Err(ProxyError::InvalidRange(format!(
                        "start ({}) must be <= end ({})",
                        first, last
                    )));
                }
                Some(last)
            };

            if first >= size {
                no_overlap = true;
                continue;
            }

            let last = last.map_or(size - 1, |last| last.min(size - 1));
            ranges.push(ByteRange {
                start: first,
                end: last,
            });
        }

        if ranges.is_empty() {
            let reason = if no_overlap {
                format!("no range overlaps a resource of {} bytes", size)
            } else {
                format!("empty range set: {}", header)
            };
            return Err(ProxyError::InvalidRange(reason));
        }

        Ok(ranges)
    }

    /// Convert this ByteRange to an HTTP Range header value
    ///
    /// # Returns
    /// A string in the format "bytes=start-end"
    pub fn to_header(&self) -> String {
        format!("bytes={}-{}", self.start, self.end)
    }

    /// Render a Content-Range header value for a resource of `total` bytes
    pub fn content_range(&self, total: u64) -> String {
        format!("bytes {}-{}/{}", self.start, self.end, total)
    }
}

/// Metadata learned about a remote object from the upstream server
#[derive(Debug, Clone, PartialEq)]
pub struct FileMetadata {
    /// Total size of the object in bytes
    pub content_length: u64,
    /// Last-Modified from upstream, or the resolution time
    pub modified: SystemTime,
    /// Content type reported by upstream
    pub content_type: Option<String>,
}

/// A stat-able view of a registered remote object at a virtual path
#[derive(Debug, Clone, PartialEq)]
pub struct FileInfo {
    /// Virtual path, including shard prefixes
    pub remote: String,
    /// Size in bytes, `None` when it is not known
    pub size: Option<u64>,
    pub mod_time: SystemTime,
    pub mime_type: Option<String>,
}

impl FileInfo {
    /// Final path segment, the remote identifier
    pub fn name(&self) -> &str {
        leaf_name(&self.remote)
    }
}

/// A node of the virtual directory tree
#[derive(Debug, Clone, PartialEq)]
pub enum Node {
    File(FileInfo),
    Dir { path: String, mod_time: SystemTime },
}

impl Node {
    pub fn is_file(&self) -> bool {
        matches!(self, Node::File(_))
    }

    pub fn path(&self) -> &str {
        match self {
            Node::File(info) => &info.remote,
            Node::Dir { path, .. } => path,
        }
    }

    pub fn into_file(self) -> Option<FileInfo> {
        match self {
            Node::File(info) => Some(info),
            Node::Dir { .. } => None,
        }
    }
}

/// Last segment of a slash separated path
pub fn leaf_name(path: &str) -> &str {
    let trimmed = path.trim_end_matches('/');
    match trimmed.rfind('/') {
        Some(idx) => &trimmed[idx + 1..],
        None => trimmed,
    }
}

/// Clean a virtual directory path: no leading, trailing or doubled slashes
/// and no `.` segments. The root is the empty string.
pub fn clean_dir(dir: &str) -> String {
    dir.split('/')
        .filter(|segment| !segment.is_empty() && *segment != ".")
        .collect::<Vec<_>>()
        .join("/")
}
