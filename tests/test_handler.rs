//! Tests for the HTTP façade contract

use async_trait::async_trait;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use bytes::Bytes;
use futures_util::stream;
use http::header::{self, HeaderMap};
use http::{Method, Request, Response, StatusCode};
use http_body_util::BodyExt;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use vfscache_proxy::response_builder::ProxyBody;
use vfscache_proxy::{
    ByteRange, CacheConfig, CacheMode, FileInfo, Node, ProxyConfig, ProxyError, ProxyHandler,
    ProxyMetrics, RemoteFs, RemoteObject, Result, UrlRegistry, Vfs,
};

const CONTENT: &[u8] = b"0123456789abcdef";

fn mod_time() -> SystemTime {
    UNIX_EPOCH + Duration::from_secs(1_445_412_480)
}

/// Filesystem serving the same bytes at every path
struct StubFs {
    size: Option<u64>,
    exists: bool,
    directory: bool,
    opens: AtomicUsize,
    stats: Mutex<Vec<String>>,
}

impl StubFs {
    fn new(size: Option<u64>) -> Self {
        StubFs {
            size,
            exists: true,
            directory: false,
            opens: AtomicUsize::new(0),
            stats: Mutex::new(Vec::new()),
        }
    }

    fn missing() -> Self {
        StubFs {
            exists: false,
            ..StubFs::new(None)
        }
    }

    fn directory() -> Self {
        StubFs {
            exists: false,
            directory: true,
            ..StubFs::new(None)
        }
    }
}

#[async_trait]
impl RemoteFs for StubFs {
    fn name(&self) -> &str {
        "stub"
    }

    async fn stat(&self, path: &str) -> Result<FileInfo> {
        self.stats.lock().unwrap().push(path.to_string());
        if !self.exists {
            return Err(ProxyError::NotFound(path.to_string()));
        }
        Ok(FileInfo {
            remote: path.to_string(),
            size: self.size,
            mod_time: mod_time(),
            mime_type: None,
        })
    }

    async fn open(&self, _path: &str, overrides: &HeaderMap) -> Result<RemoteObject> {
        self.opens.fetch_add(1, Ordering::SeqCst);

        let range = overrides
            .get(header::RANGE)
            .and_then(|v| v.to_str().ok())
            .map(|v| ByteRange::parse_ranges(v, CONTENT.len() as u64))
            .transpose()?
            .map(|ranges| ranges[0]);

        let (status, body) = match range {
            Some(r) => (206, &CONTENT[r.start as usize..=r.end as usize]),
            None => (200, CONTENT),
        };
        let pieces: Vec<Result<Bytes>> = body
            .chunks(3)
            .map(|piece| Ok(Bytes::copy_from_slice(piece)))
            .collect();

        Ok(RemoteObject {
            status,
            stream: Box::pin(stream::iter(pieces)),
        })
    }

    async fn list(&self, _dir: &str) -> Result<Vec<Node>> {
        Ok(Vec::new())
    }

    async fn dir_exists(&self, _dir: &str) -> Result<bool> {
        Ok(self.directory)
    }
}

async fn handler_with(fs: Arc<StubFs>) -> (ProxyHandler, Arc<ProxyMetrics>) {
    let cache = CacheConfig {
        cache_mode: CacheMode::Off,
        chunk_size: 4,
        ..CacheConfig::default()
    };
    let metrics = Arc::new(ProxyMetrics::new().unwrap());
    let vfs = Vfs::new(fs, &cache, Some(metrics.clone())).await.unwrap();
    let handler = ProxyHandler::new(
        Arc::new(vfs),
        Arc::new(UrlRegistry::new()),
        &ProxyConfig::default(),
        Some(metrics.clone()),
    );
    (handler, metrics)
}

fn get(uri: &str) -> http::request::Builder {
    Request::builder().method(Method::GET).uri(uri)
}

async fn body_bytes(response: Response<ProxyBody>) -> Vec<u8> {
    response
        .into_body()
        .collect()
        .await
        .unwrap()
        .to_bytes()
        .to_vec()
}

const TARGET: &str = "/stream?url=https%3A%2F%2Fexample.com%2Fvideo";

#[tokio::test]
async fn test_missing_target_is_bad_request() {
    let fs = Arc::new(StubFs::new(Some(16)));
    let (handler, _) = handler_with(fs.clone()).await;

    for uri in ["/stream", "/stream?url=", "/stream/"] {
        let response = handler.handle(get(uri).body(()).unwrap()).await;
        assert_eq!(response.status(), StatusCode::BAD_REQUEST, "{}", uri);
        assert_eq!(
            body_bytes(response).await,
            b"Missing 'url' parameter or base64 path\n"
        );
    }
    assert!(fs.stats.lock().unwrap().is_empty());
}

#[tokio::test]
async fn test_invalid_base64_is_bad_request() {
    let (handler, _) = handler_with(Arc::new(StubFs::new(Some(16)))).await;
    let response = handler
        .handle(get("/stream/!!!!").body(()).unwrap())
        .await;
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn test_other_methods_not_allowed() {
    let (handler, _) = handler_with(Arc::new(StubFs::new(Some(16)))).await;
    let request = Request::builder()
        .method(Method::POST)
        .uri(TARGET)
        .body(())
        .unwrap();
    let response = handler.handle(request).await;
    assert_eq!(response.status(), StatusCode::METHOD_NOT_ALLOWED);
    assert_eq!(response.headers().get(header::ALLOW).unwrap(), "GET, HEAD");
}

#[tokio::test]
async fn test_not_found() {
    let (handler, metrics) = handler_with(Arc::new(StubFs::missing())).await;
    let response = handler.handle(get(TARGET).body(()).unwrap()).await;
    assert_eq!(response.status(), StatusCode::NOT_FOUND);

    let text = metrics.export_text().unwrap();
    assert!(text.contains("vfscache_requests_total{status=\"404\"} 1"));
    assert!(text.contains("vfscache_stat_results_total{result=\"not_registered\"} 1"));
}

#[tokio::test]
async fn test_directory_is_not_a_file() {
    let (handler, _) = handler_with(Arc::new(StubFs::directory())).await;
    let response = handler.handle(get(TARGET).body(()).unwrap()).await;
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
    assert_eq!(body_bytes(response).await, b"Not a file\n");
}

#[tokio::test]
async fn test_head_does_not_open() {
    let fs = Arc::new(StubFs::new(Some(16)));
    let (handler, _) = handler_with(fs.clone()).await;

    let request = Request::builder()
        .method(Method::HEAD)
        .uri(TARGET)
        .body(())
        .unwrap();
    let response = handler.handle(request).await;

    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(response.headers().get(header::CONTENT_LENGTH).unwrap(), "16");
    assert_eq!(
        response.headers().get(header::LAST_MODIFIED).unwrap(),
        "Wed, 21 Oct 2015 07:28:00 GMT"
    );
    assert!(response.headers().get(header::CONTENT_TYPE).is_none());
    assert!(body_bytes(response).await.is_empty());
    assert_eq!(fs.opens.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn test_full_get() {
    let fs = Arc::new(StubFs::new(Some(16)));
    let (handler, _) = handler_with(fs.clone()).await;

    let response = handler.handle(get(TARGET).body(()).unwrap()).await;
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(response.headers().get(header::ACCEPT_RANGES).unwrap(), "bytes");
    assert_eq!(body_bytes(response).await, CONTENT);
    // chunk_size 4 over 16 bytes
    assert_eq!(fs.opens.load(Ordering::SeqCst), 4);
}

#[tokio::test]
async fn test_range_get() {
    let (handler, _) = handler_with(Arc::new(StubFs::new(Some(16)))).await;

    let request = get(TARGET)
        .header(header::RANGE, "bytes=3-9")
        .body(())
        .unwrap();
    let response = handler.handle(request).await;

    assert_eq!(response.status(), StatusCode::PARTIAL_CONTENT);
    assert_eq!(
        response.headers().get(header::CONTENT_RANGE).unwrap(),
        "bytes 3-9/16"
    );
    assert_eq!(response.headers().get(header::CONTENT_LENGTH).unwrap(), "7");
    assert_eq!(body_bytes(response).await, b"3456789");
}

#[tokio::test]
async fn test_suffix_range_get() {
    let (handler, _) = handler_with(Arc::new(StubFs::new(Some(16)))).await;

    let request = get(TARGET)
        .header(header::RANGE, "bytes=-5")
        .body(())
        .unwrap();
    let response = handler.handle(request).await;

    assert_eq!(response.status(), StatusCode::PARTIAL_CONTENT);
    assert_eq!(
        response.headers().get(header::CONTENT_RANGE).unwrap(),
        "bytes 11-15/16"
    );
    assert_eq!(body_bytes(response).await, b"bcdef");
}

#[tokio::test]
async fn test_unsatisfiable_range() {
    let fs = Arc::new(StubFs::new(Some(16)));
    let (handler, _) = handler_with(fs.clone()).await;

    let request = get(TARGET)
        .header(header::RANGE, "bytes=100-200")
        .body(())
        .unwrap();
    let response = handler.handle(request).await;

    assert_eq!(response.status(), StatusCode::RANGE_NOT_SATISFIABLE);
    assert_eq!(
        response.headers().get(header::CONTENT_RANGE).unwrap(),
        "bytes */16"
    );
    assert_eq!(fs.opens.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn test_not_modified() {
    let fs = Arc::new(StubFs::new(Some(16)));
    let (handler, _) = handler_with(fs.clone()).await;

    let request = get(TARGET)
        .header(header::IF_MODIFIED_SINCE, "Wed, 21 Oct 2015 07:28:00 GMT")
        .body(())
        .unwrap();
    let response = handler.handle(request).await;

    assert_eq!(response.status(), StatusCode::NOT_MODIFIED);
    assert!(response.headers().get(header::CONTENT_LENGTH).is_none());
    assert!(response.headers().get(header::LAST_MODIFIED).is_some());
    assert_eq!(fs.opens.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn test_unknown_size_rejects_range() {
    let fs = Arc::new(StubFs::new(None));
    let (handler, _) = handler_with(fs.clone()).await;

    let request = get(TARGET)
        .header(header::RANGE, "bytes=0-3")
        .body(())
        .unwrap();
    let response = handler.handle(request).await;

    assert_eq!(response.status(), StatusCode::RANGE_NOT_SATISFIABLE);
    assert_eq!(fs.opens.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn test_unknown_size_streams_whole_body() {
    let fs = Arc::new(StubFs::new(None));
    let (handler, _) = handler_with(fs.clone()).await;

    let response = handler.handle(get(TARGET).body(()).unwrap()).await;

    assert_eq!(response.status(), StatusCode::OK);
    assert!(response.headers().get(header::CONTENT_LENGTH).is_none());
    assert!(response.headers().get(header::ACCEPT_RANGES).is_none());
    assert_eq!(body_bytes(response).await, CONTENT);
    assert_eq!(fs.opens.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_base64_and_query_targets_share_a_key() {
    let fs = Arc::new(StubFs::new(Some(16)));
    let (handler, _) = handler_with(fs.clone()).await;

    let encoded = URL_SAFE_NO_PAD.encode("https://example.com/video");
    let response = handler
        .handle(get(&format!("/stream/{}", encoded)).body(()).unwrap())
        .await;
    assert_eq!(response.status(), StatusCode::OK);
    let response = handler.handle(get(TARGET).body(()).unwrap()).await;
    assert_eq!(response.status(), StatusCode::OK);

    let stats = fs.stats.lock().unwrap().clone();
    assert_eq!(stats.len(), 2);
    assert_eq!(stats[0], stats[1]);
    assert_eq!(handler.registry().len(), 1);
    assert_eq!(handler.hash_cache().digest_count(), 1);
}

#[tokio::test]
async fn test_registration_uses_size_hint() {
    let (handler, _) = handler_with(Arc::new(StubFs::new(Some(16)))).await;

    let request = get(&format!("{}&size=4096", TARGET))
        .header("Authorization", "Bearer t")
        .header(header::RANGE, "bytes=0-1")
        .body(())
        .unwrap();
    handler.handle(request).await;

    let key = handler.hash_cache().file_hash("https://example.com/video");
    let entry = handler.registry().lookup(&key).unwrap();
    assert_eq!(entry.url, "https://example.com/video");
    assert_eq!(entry.known_size(), Some(4096));
    assert_eq!(entry.headers.get(header::AUTHORIZATION).unwrap(), "Bearer t");
    assert!(entry.headers.get(header::RANGE).is_none());
}

#[tokio::test]
async fn test_mount_matching() {
    let (handler, _) = handler_with(Arc::new(StubFs::new(Some(16)))).await;
    assert!(handler.matches("/stream"));
    assert!(handler.matches("/stream/abc"));
    assert!(!handler.matches("/streams"));
    assert!(!handler.matches("/other"));
}

#[tokio::test]
async fn test_query_parameter_wins_over_path() {
    let fs = Arc::new(StubFs::new(Some(16)));
    let (handler, _) = handler_with(fs.clone()).await;

    let encoded = URL_SAFE_NO_PAD.encode("https://example.com/other");
    let uri = format!(
        "/stream/{}?url=https%3A%2F%2Fexample.com%2Fvideo",
        encoded
    );
    let response = handler.handle(get(&uri).body(()).unwrap()).await;
    assert_eq!(response.status(), StatusCode::OK);

    let key = handler.hash_cache().file_hash("https://example.com/video");
    assert!(handler.registry().lookup(&key).is_some());
    assert_eq!(handler.registry().len(), 1);

    // An undecodable path is not an error when the query names the target
    let response = handler
        .handle(get("/stream/!!!!?url=https%3A%2F%2Fexample.com%2Fvideo").body(()).unwrap())
        .await;
    assert_eq!(response.status(), StatusCode::OK);
}

#[tokio::test]
async fn test_size_hint_header_is_not_replayed() {
    let (handler, _) = handler_with(Arc::new(StubFs::new(Some(16)))).await;

    let request = get(TARGET)
        .header("X-File-Size", "4096")
        .header(header::USER_AGENT, "player/1")
        .body(())
        .unwrap();
    handler.handle(request).await;

    let key = handler.hash_cache().file_hash("https://example.com/video");
    let entry = handler.registry().lookup(&key).unwrap();
    assert_eq!(entry.known_size(), Some(4096));
    assert!(entry.headers.get("x-file-size").is_none());
    assert_eq!(entry.headers.get(header::USER_AGENT).unwrap(), "player/1");
}

#[tokio::test]
async fn test_largest_size_hint_streams_lazily() {
    let fs = Arc::new(StubFs::new(Some(u64::MAX)));
    let (handler, _) = handler_with(fs.clone()).await;

    let request = get(TARGET)
        .header("X-File-Size", u64::MAX.to_string())
        .body(())
        .unwrap();
    let response = handler.handle(request).await;

    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(
        response.headers().get(header::CONTENT_LENGTH).unwrap(),
        u64::MAX.to_string().as_str()
    );

    // Only the first chunk is fetched before the body is dropped
    let mut body = response.into_body();
    let frame = body.frame().await.unwrap().unwrap();
    assert_eq!(frame.into_data().unwrap().as_ref(), b"0123");
    drop(body);
    assert!(fs.opens.load(Ordering::SeqCst) <= 2);
}
