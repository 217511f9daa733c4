//! Response construction for virtual files
//!
//! Evaluates conditional and range headers against a file's size and
//! modification time, and builds the bodies and headers the handler sends.

use crate::error::ProxyError;
use crate::models::{ByteRange, FileInfo};
use crate::remote_fs::ByteStream;
use bytes::Bytes;
use futures_util::TryStreamExt;
use http::header::{self, HeaderMap, HeaderValue};
use http::{Response, StatusCode};
use http_body_util::combinators::UnsyncBoxBody;
use http_body_util::{BodyExt, Empty, Full, StreamBody};
use hyper::body::Frame;
use std::path::Path;
use std::time::{SystemTime, UNIX_EPOCH};

/// Response body type used throughout the proxy
pub type ProxyBody = UnsyncBoxBody<Bytes, ProxyError>;

const OCTET_STREAM: &str = "application/octet-stream";

/// What to send for a GET of a file with a known size
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContentPlan {
    /// 200 with the whole file
    Full,
    /// 206 with one range
    Partial(ByteRange),
    /// 304, the client copy is current
    NotModified,
    /// 412, If-Unmodified-Since failed
    PreconditionFailed,
    /// 416, the Range header cannot be served
    Unsatisfiable,
}

/// Decide how to answer a GET for a file of `size` bytes last modified at
/// `mod_time`
///
/// Multiple ranges are not served as multipart; the whole file is sent
/// instead. An `If-Range` that is not a matching date also yields the whole
/// file.
pub fn plan_content(headers: &HeaderMap, size: u64, mod_time: SystemTime) -> ContentPlan {
    let modified = unix_secs(mod_time);

    if let Some(since) = header_date(headers, header::IF_UNMODIFIED_SINCE) {
        if modified.is_some_and(|m| m > since) {
            return ContentPlan::PreconditionFailed;
        }
    }

    if !headers.contains_key(header::IF_NONE_MATCH) {
        if let Some(since) = header_date(headers, header::IF_MODIFIED_SINCE) {
            if modified.is_some_and(|m| m <= since) {
                return ContentPlan::NotModified;
            }
        }
    }

    let Some(range) = headers.get(header::RANGE) else {
        return ContentPlan::Full;
    };

    if let Some(if_range) = headers.get(header::IF_RANGE) {
        let matches = if_range
            .to_str()
            .ok()
            .and_then(|v| httpdate::parse_http_date(v).ok())
            .and_then(unix_secs)
            .is_some_and(|date| Some(date) == modified);
        if !matches {
            return ContentPlan::Full;
        }
    }

    let Ok(range) = range.to_str() else {
        return ContentPlan::Unsatisfiable;
    };

    match ByteRange::parse_ranges(range, size) {
        Ok(ranges) if ranges.len() == 1 => ContentPlan::Partial(ranges[0]),
        Ok(_) => ContentPlan::Full,
        Err(_) => ContentPlan::Unsatisfiable,
    }
}

/// Content type to advertise, or `None` to leave the header out
///
/// Upstream's type wins; otherwise the type is guessed from the path's
/// extension. The generic binary type is not sent for extension-less paths.
pub fn content_type(info: &FileInfo) -> Option<String> {
    if let Some(mime) = info.mime_type.as_deref().filter(|m| !m.is_empty()) {
        return Some(mime.to_string());
    }

    let mime = mime_guess::from_path(&info.remote)
        .first_raw()
        .unwrap_or(OCTET_STREAM);
    let has_extension = Path::new(&info.remote).extension().is_some();
    if mime == OCTET_STREAM && !has_extension {
        return None;
    }
    Some(mime.to_string())
}

/// Format a time as an IMF-fixdate HTTP date
pub fn http_date(time: SystemTime) -> String {
    httpdate::fmt_http_date(time)
}

/// Headers describing `info`, shared by every successful response
pub fn file_headers(info: &FileInfo) -> HeaderMap {
    let mut headers = HeaderMap::new();

    if let Some(size) = info.size {
        headers.insert(header::CONTENT_LENGTH, HeaderValue::from(size));
        headers.insert(header::ACCEPT_RANGES, HeaderValue::from_static("bytes"));
    }

    if let Some(mime) = content_type(info) {
        if let Ok(value) = HeaderValue::from_str(&mime) {
            headers.insert(header::CONTENT_TYPE, value);
        }
    }

    if let Ok(value) = HeaderValue::from_str(&http_date(info.mod_time)) {
        headers.insert(header::LAST_MODIFIED, value);
    }

    headers
}

pub fn empty_body() -> ProxyBody {
    Empty::<Bytes>::new()
        .map_err(|never| match never {})
        .boxed_unsync()
}

pub fn full_body(data: impl Into<Bytes>) -> ProxyBody {
    Full::new(data.into())
        .map_err(|never| match never {})
        .boxed_unsync()
}

pub fn stream_body(stream: ByteStream) -> ProxyBody {
    StreamBody::new(stream.map_ok(Frame::data)).boxed_unsync()
}

/// Plain-text error response
pub fn error_response(status: StatusCode, message: &str) -> Response<ProxyBody> {
    let mut response = Response::new(full_body(format!("{}\n", message)));
    *response.status_mut() = status;
    let headers = response.headers_mut();
    headers.insert(
        header::CONTENT_TYPE,
        HeaderValue::from_static("text/plain; charset=utf-8"),
    );
    headers.insert(
        header::X_CONTENT_TYPE_OPTIONS,
        HeaderValue::from_static("nosniff"),
    );
    response
}

/// 416 response advertising the actual size
pub fn unsatisfiable_response(size: u64) -> Response<ProxyBody> {
    let mut response = error_response(
        StatusCode::RANGE_NOT_SATISFIABLE,
        "invalid range: failed to overlap",
    );
    if let Ok(value) = HeaderValue::from_str(&format!("bytes */{}", size)) {
        response.headers_mut().insert(header::CONTENT_RANGE, value);
    }
    response
}

fn header_date(headers: &HeaderMap, name: header::HeaderName) -> Option<u64> {
    headers
        .get(name)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| httpdate::parse_http_date(v).ok())
        .and_then(unix_secs)
}

/// Whole seconds since the epoch; HTTP dates carry no finer precision
fn unix_secs(time: SystemTime) -> Option<u64> {
    time.duration_since(UNIX_EPOCH).ok().map(|d| d.as_secs())
}
