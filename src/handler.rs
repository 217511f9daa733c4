//! HTTP façade over the virtual filesystem
//!
//! Each request names its upstream target either in the `url` query
//! parameter (`<mount>?url=...`) or as base64 in the path
//! (`<mount>/<base64>`). The target is digested into a cache key, registered,
//! stat'd through the [`Vfs`] at its sharded path and then served with range
//! and conditional semantics.

use crate::cache_key::{sharded_path, HashCache};
use crate::config::ProxyConfig;
use crate::error::{ProxyError, Result};
use crate::metrics::{ProxyMetrics, StatResult};
use crate::models::{ByteRange, FileInfo, Node};
use crate::registry::{replayable_headers, UrlRegistry, SIZE_HINT_HEADER};
use crate::remote_fs::ByteStream;
use crate::response_builder::{
    empty_body, error_response, file_headers, plan_content, stream_body, unsatisfiable_response,
    ContentPlan, ProxyBody,
};
use crate::vfs::Vfs;
use base64::engine::general_purpose::{STANDARD, STANDARD_NO_PAD, URL_SAFE, URL_SAFE_NO_PAD};
use base64::Engine;
use futures_util::StreamExt;
use http::header::{self, HeaderMap, HeaderName, HeaderValue};
use http::request::Parts;
use http::{Method, Request, Response, StatusCode, Uri};
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, error, info};

/// Request header carrying a caller-supplied object size
pub const SIZE_HEADER: &str = SIZE_HINT_HEADER;

/// Query parameter carrying a caller-supplied object size
pub const SIZE_PARAM: &str = "size";

const MISSING_TARGET: &str = "Missing 'url' parameter or base64 path";

/// Serves registered URLs as virtual files
pub struct ProxyHandler {
    vfs: Arc<Vfs>,
    registry: Arc<UrlRegistry>,
    hash_cache: HashCache,
    shard_level: usize,
    mount_path: String,
    metrics: Option<Arc<ProxyMetrics>>,
}

impl ProxyHandler {
    /// Create a handler
    ///
    /// `registry` must be the same registry the filesystem behind `vfs`
    /// resolves identifiers from.
    pub fn new(
        vfs: Arc<Vfs>,
        registry: Arc<UrlRegistry>,
        config: &ProxyConfig,
        metrics: Option<Arc<ProxyMetrics>>,
    ) -> Self {
        ProxyHandler {
            vfs,
            registry,
            hash_cache: HashCache::new(config.strip_query, config.strip_domain),
            shard_level: config.shard_level,
            mount_path: config.normalized_mount_path(),
            metrics,
        }
    }

    pub fn vfs(&self) -> &Arc<Vfs> {
        &self.vfs
    }

    pub fn registry(&self) -> &Arc<UrlRegistry> {
        &self.registry
    }

    pub fn hash_cache(&self) -> &HashCache {
        &self.hash_cache
    }

    /// Whether `path` lies under the mount path
    pub fn matches(&self, path: &str) -> bool {
        match path.strip_prefix(self.mount_path.as_str()) {
            Some(rest) => rest.is_empty() || rest.starts_with('/'),
            None => false,
        }
    }

    /// Serve one request
    pub async fn handle<B>(&self, req: Request<B>) -> Response<ProxyBody> {
        let start = Instant::now();
        let (parts, _body) = req.into_parts();

        let response = self.serve(&parts).await;

        debug!(
            "{} {} -> {} in {:?}",
            parts.method,
            parts.uri.path(),
            response.status(),
            start.elapsed()
        );
        if let Some(metrics) = &self.metrics {
            metrics.record_request(response.status().as_u16(), start.elapsed());
        }
        response
    }

    async fn serve(&self, parts: &Parts) -> Response<ProxyBody> {
        if parts.method != Method::GET && parts.method != Method::HEAD {
            let mut response =
                error_response(StatusCode::METHOD_NOT_ALLOWED, "Method not allowed");
            response
                .headers_mut()
                .insert(header::ALLOW, HeaderValue::from_static("GET, HEAD"));
            return response;
        }

        let target = match self.target_url(&parts.uri) {
            Ok(target) => target,
            Err(e) => {
                debug!("Rejecting {}: {}", parts.uri, e);
                let message = match e {
                    ProxyError::BadRequest(message) => message,
                    other => other.to_string(),
                };
                return error_response(StatusCode::BAD_REQUEST, &message);
            }
        };

        let key = self.hash_cache.file_hash(&target);
        let headers = replayable_headers(&parts.headers);
        match size_hint(parts) {
            Some(size) => {
                self.registry
                    .register_with_size(&key, &target, headers, size);
            }
            None => {
                self.registry.register(&key, &target, headers);
            }
        }
        if let Some(metrics) = &self.metrics {
            metrics.set_registry_entries(self.registry.len());
        }

        let path = sharded_path(&key, self.shard_level);
        let info = match self.vfs.stat(&path).await {
            Ok(Node::File(info)) => info,
            Ok(Node::Dir { .. }) => {
                self.record_stat(StatResult::NotAFile);
                return error_response(StatusCode::NOT_FOUND, "Not a file");
            }
            Err(e) if e.is_not_found() => {
                info!("File not found: {} ({})", path, target);
                self.record_stat(StatResult::NotRegistered);
                return error_response(StatusCode::NOT_FOUND, "File not found");
            }
            Err(e) if e.to_http_status() == 404 => {
                error!("Failed to resolve {} ({}): {}", path, target, e);
                self.record_stat(StatResult::ResolveFailed);
                return error_response(StatusCode::NOT_FOUND, "File not found");
            }
            Err(e) => {
                error!("Failed to stat {} ({}): {}", path, target, e);
                self.record_stat(StatResult::ResolveFailed);
                return error_response(StatusCode::INTERNAL_SERVER_ERROR, "Internal server error");
            }
        };
        self.record_stat(StatResult::Found);

        let headers = file_headers(&info);
        if parts.method == Method::HEAD {
            return build_response(StatusCode::OK, headers, empty_body());
        }

        match info.size {
            Some(size) => self.serve_known(parts, &info, size, headers).await,
            None => self.serve_unknown(parts, &info, headers).await,
        }
    }

    async fn serve_known(
        &self,
        parts: &Parts,
        info: &FileInfo,
        size: u64,
        mut headers: HeaderMap,
    ) -> Response<ProxyBody> {
        let range = match plan_content(&parts.headers, size, info.mod_time) {
            ContentPlan::Full => None,
            ContentPlan::Partial(range) => Some(range),
            ContentPlan::NotModified => {
                headers.remove(header::CONTENT_TYPE);
                headers.remove(header::CONTENT_LENGTH);
                return build_response(StatusCode::NOT_MODIFIED, headers, empty_body());
            }
            ContentPlan::PreconditionFailed => {
                return error_response(StatusCode::PRECONDITION_FAILED, "Precondition failed");
            }
            ContentPlan::Unsatisfiable => {
                debug!(
                    "Unsatisfiable range {:?} for {} ({} bytes)",
                    parts.headers.get(header::RANGE),
                    info.remote,
                    size
                );
                return unsatisfiable_response(size);
            }
        };

        let stream = match self.vfs.open(info, range).await {
            Ok(stream) => stream,
            Err(e) => {
                error!("Failed to open {}: {}", info.remote, e);
                return error_response(StatusCode::INTERNAL_SERVER_ERROR, "Failed to open file");
            }
        };

        let body = stream_body(log_interrupted(info.remote.clone(), range_len(range, size), stream));
        match range {
            Some(range) => {
                insert_header(&mut headers, header::CONTENT_RANGE, &range.content_range(size));
                headers.insert(header::CONTENT_LENGTH, HeaderValue::from(range.size()));
                build_response(StatusCode::PARTIAL_CONTENT, headers, body)
            }
            None => build_response(StatusCode::OK, headers, body),
        }
    }

    async fn serve_unknown(
        &self,
        parts: &Parts,
        info: &FileInfo,
        headers: HeaderMap,
    ) -> Response<ProxyBody> {
        if parts.headers.contains_key(header::RANGE) {
            debug!("Range requested for {} of unknown size", info.remote);
            return error_response(
                StatusCode::RANGE_NOT_SATISFIABLE,
                "Can't use Range: on file with unknown length",
            );
        }

        match self.vfs.open(info, None).await {
            Ok(stream) => build_response(
                StatusCode::OK,
                headers,
                stream_body(log_interrupted(info.remote.clone(), None, stream)),
            ),
            Err(e) => {
                error!("Failed to open {}: {}", info.remote, e);
                error_response(StatusCode::INTERNAL_SERVER_ERROR, "Failed to open file")
            }
        }
    }

    /// Upstream URL named by the request
    ///
    /// A non-empty `url` query parameter names the target. Without one, the
    /// path below the mount is a base64-encoded URL, URL-safe or standard,
    /// padded or not.
    pub fn target_url(&self, uri: &Uri) -> Result<String> {
        let path = uri.path();
        let rest = path
            .strip_prefix(self.mount_path.as_str())
            .unwrap_or(path)
            .trim_start_matches('/');

        // The query parameter wins; the path is only decoded without one
        let target = match query_param(uri, "url").filter(|url| !url.is_empty()) {
            Some(url) => url,
            None if rest.is_empty() => String::new(),
            None => decode_base64_target(rest)?,
        };

        if target.trim().is_empty() {
            return Err(ProxyError::BadRequest(MISSING_TARGET.to_string()));
        }
        Ok(target)
    }

    fn record_stat(&self, result: StatResult) {
        if let Some(metrics) = &self.metrics {
            metrics.record_stat(result);
        }
    }
}

/// Decode a base64 path segment into a URL
pub fn decode_base64_target(encoded: &str) -> Result<String> {
    let decoded = [URL_SAFE_NO_PAD, URL_SAFE, STANDARD, STANDARD_NO_PAD]
        .iter()
        .find_map(|engine| engine.decode(encoded).ok())
        .ok_or_else(|| ProxyError::BadRequest("Invalid base64 path".to_string()))?;

    String::from_utf8(decoded)
        .map_err(|_| ProxyError::BadRequest("Invalid base64 path".to_string()))
}

/// Caller-supplied size from the `size` query parameter or `X-File-Size`
///
/// Values that are not non-negative integers are ignored.
pub fn size_hint(parts: &Parts) -> Option<u64> {
    let from_query = query_param(&parts.uri, SIZE_PARAM);
    let from_header = parts
        .headers
        .get(SIZE_HEADER)
        .and_then(|value| value.to_str().ok())
        .map(str::to_string);

    let raw = from_query.or(from_header)?;
    match raw.trim().parse::<u64>() {
        Ok(size) => Some(size),
        Err(e) => {
            debug!("Ignoring size hint {:?}: {}", raw, e);
            None
        }
    }
}

fn query_param(uri: &Uri, name: &str) -> Option<String> {
    let query = uri.query()?;
    url::form_urlencoded::parse(query.as_bytes())
        .find(|(key, _)| key == name)
        .map(|(_, value)| value.into_owned())
}

fn range_len(range: Option<ByteRange>, size: u64) -> Option<u64> {
    Some(range.map_or(size, |range| range.size()))
}

/// Log a body that fails after the response has been committed
fn log_interrupted(remote: String, total: Option<u64>, stream: ByteStream) -> ByteStream {
    let mut written: u64 = 0;
    Box::pin(stream.inspect(move |piece| match piece {
        Ok(bytes) => written += bytes.len() as u64,
        Err(e) => {
            let total = total.map_or_else(|| "unknown".to_string(), |t| t.to_string());
            error!(
                "Didn't finish writing GET request for {} (wrote {}/{} bytes): {}",
                remote, written, total, e
            );
        }
    }))
}

fn insert_header(headers: &mut HeaderMap, name: HeaderName, value: &str) {
    if let Ok(value) = HeaderValue::from_str(value) {
        headers.insert(name, value);
    }
}

fn build_response(status: StatusCode, headers: HeaderMap, body: ProxyBody) -> Response<ProxyBody> {
    let mut response = Response::new(body);
    *response.status_mut() = status;
    *response.headers_mut() = headers;
    response
}
