//! Metadata resolver for registered remote objects
//!
//! Learns the size and modification time of an upstream object with a
//! one-byte ranged GET. HEAD is deliberately not used: plenty of file hosts
//! answer it wrongly or not at all.

use crate::error::{is_retry_status, ProxyError, Result};
use crate::models::FileMetadata;
use crate::pacer::Pacer;
use crate::registry::RegistryEntry;
use http::header::{self, HeaderMap, HeaderValue};
use reqwest::{Client, Response, StatusCode};
use std::sync::Arc;
use std::time::{Duration, SystemTime};
use tracing::{debug, warn};

/// Range requested to learn object metadata
const PROBE_RANGE: &str = "bytes=0-0";

/// MetadataResolver fetches size and modification time for registry entries
/// whose size is not known up front
pub struct MetadataResolver {
    client: Client,
    pacer: Arc<Pacer>,
}

impl MetadataResolver {
    /// Create a resolver on an existing client and a shared pacer
    pub fn new(client: Client, pacer: Arc<Pacer>) -> Self {
        MetadataResolver { client, pacer }
    }

    /// Create a resolver with its own client using the given connect timeout
    pub fn with_timeout(connect_timeout: Duration, pacer: Arc<Pacer>) -> Result<Self> {
        let client = Client::builder()
            .connect_timeout(connect_timeout)
            .build()
            .map_err(|e| ProxyError::HttpError(format!("Failed to create HTTP client: {}", e)))?;

        Ok(MetadataResolver { client, pacer })
    }

    pub fn pacer(&self) -> &Arc<Pacer> {
        &self.pacer
    }

    /// Resolve metadata for `entry`
    ///
    /// Sends `GET` with `Range: bytes=0-0` and the entry's captured headers.
    /// Transport errors and the retryable statuses go through the pacer;
    /// any final status other than 200/206 fails the resolution.
    ///
    /// # Returns
    /// * `Ok(FileMetadata)` with the total size, Last-Modified (or now) and
    ///   Content-Type
    /// * `Err(ProxyError::UnknownSize)` when no usable length is reported
    /// * `Err(ProxyError::MetadataFetchError)` for every other failure
    pub async fn resolve(&self, entry: &RegistryEntry) -> Result<FileMetadata> {
        debug!("Resolving metadata for url={}", entry.url);

        let mut headers = entry.headers.clone();
        headers.insert(header::RANGE, HeaderValue::from_static(PROBE_RANGE));

        let outcome = self
            .pacer
            .call(
                || self.client.get(&entry.url).headers(headers.clone()).send(),
                retryable_outcome,
            )
            .await;

        let response = outcome.map_err(|e| {
            warn!("Metadata request failed for url={}: {}", entry.url, e);
            ProxyError::MetadataFetchError(format!("GET {} failed: {}", entry.url, e))
        })?;

        let metadata = metadata_from_response(&response)?;
        debug!(
            "Resolved url={}: size={}, content_type={:?}",
            entry.url, metadata.content_length, metadata.content_type
        );
        Ok(metadata)
    }
}

/// Whether an upstream exchange is worth another attempt: transport errors
/// and the retryable statuses
pub fn retryable_outcome(outcome: &reqwest::Result<Response>) -> bool {
    match outcome {
        Ok(response) => is_retry_status(response.status().as_u16()),
        Err(e) => !e.is_builder(),
    }
}

fn metadata_from_response(response: &Response) -> Result<FileMetadata> {
    let status = response.status();
    if status != StatusCode::OK && status != StatusCode::PARTIAL_CONTENT {
        return Err(ProxyError::MetadataFetchError(format!(
            "metadata fetch failed: status {}",
            status.as_u16()
        )));
    }

    let headers = response.headers();
    let size = if status == StatusCode::PARTIAL_CONTENT {
        header_str(headers, header::CONTENT_RANGE).and_then(parse_content_range_total)
    } else {
        header_str(headers, header::CONTENT_LENGTH).and_then(|v| v.trim().parse::<u64>().ok())
    };
    let content_length = size.ok_or(ProxyError::UnknownSize)?;

    Ok(FileMetadata {
        content_length,
        modified: parse_last_modified(headers).unwrap_or_else(SystemTime::now),
        content_type: header_str(headers, header::CONTENT_TYPE).map(str::to_string),
    })
}

fn header_str(headers: &HeaderMap, name: header::HeaderName) -> Option<&str> {
    headers.get(name).and_then(|v| v.to_str().ok())
}

/// Parse Last-Modified as an HTTP date
pub fn parse_last_modified(headers: &HeaderMap) -> Option<SystemTime> {
    header_str(headers, header::LAST_MODIFIED).and_then(|v| httpdate::parse_http_date(v).ok())
}

/// Total length from a `bytes <start>-<end>/<total>` Content-Range value
///
/// Returns `None` for the `*` total and for anything malformed.
pub fn parse_content_range_total(value: &str) -> Option<u64> {
    let spec = value.trim().strip_prefix("bytes ")?;
    let (range, total) = spec.split_once('/')?;
    let (start, end) = range.split_once('-')?;
    let start = start.trim().parse::<u64>().ok()?;
    let end = end.trim().parse::<u64>().ok()?;
    let total = total.trim().parse::<u64>().ok()?;

    if start > end || end >= total {
        return None;
    }
    Some(total)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_content_range_total() {
        assert_eq!(parse_content_range_total("bytes 0-0/12345"), Some(12345));
        assert_eq!(parse_content_range_total("bytes 0-0/1"), Some(1));
        assert_eq!(parse_content_range_total(" bytes 10-19/20 "), Some(20));
    }

    #[test]
    fn test_parse_content_range_total_rejects_unknown_or_malformed() {
        assert_eq!(parse_content_range_total("bytes 0-0/*"), None);
        assert_eq!(parse_content_range_total("bytes */100"), None);
        assert_eq!(parse_content_range_total("items 0-0/100"), None);
        assert_eq!(parse_content_range_total("bytes 0-0"), None);
        assert_eq!(parse_content_range_total("bytes 5-1/100"), None);
        assert_eq!(parse_content_range_total("bytes 0-100/100"), None);
    }

    #[test]
    fn test_parse_last_modified() {
        let mut headers = HeaderMap::new();
        headers.insert(
            header::LAST_MODIFIED,
            HeaderValue::from_static("Wed, 21 Oct 2015 07:28:00 GMT"),
        );
        let parsed = parse_last_modified(&headers).unwrap();
        assert_eq!(
            parsed,
            SystemTime::UNIX_EPOCH + Duration::from_secs(1_445_412_480)
        );

        headers.insert(header::LAST_MODIFIED, HeaderValue::from_static("yesterday"));
        assert!(parse_last_modified(&headers).is_none());
    }
}
