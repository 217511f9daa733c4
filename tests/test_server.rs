//! End-to-end tests: client -> server -> handler -> vfs -> upstream

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;
use tokio::net::TcpListener;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use vfscache_proxy::{
    server, CacheConfig, CacheMode, ProxyConfig, ProxyHandler, ProxyMetrics, UrlFs, UrlRegistry,
    Vfs,
};
use wiremock::matchers::{header, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

const DATA: &[u8] = b"The quick brown fox jumps over the lazy dog";

struct TestProxy {
    base: String,
    stop: Option<oneshot::Sender<()>>,
    task: JoinHandle<()>,
    vfs: Arc<Vfs>,
    _cache_dir: TempDir,
}

impl TestProxy {
    async fn start() -> Self {
        let cache_dir = TempDir::new().unwrap();
        let config = ProxyConfig {
            min_sleep_ms: 1,
            max_sleep_ms: 10,
            max_retries: 2,
            cache: CacheConfig {
                cache_mode: CacheMode::Full,
                cache_dir: cache_dir.path().to_path_buf(),
                chunk_size: 16,
                chunk_streams: 2,
                ..CacheConfig::default()
            },
            ..ProxyConfig::default()
        };

        let metrics = Arc::new(ProxyMetrics::new().unwrap());
        let registry = Arc::new(UrlRegistry::new());
        let fs = UrlFs::from_config("link", registry.clone(), &config).unwrap();
        let vfs = Arc::new(
            Vfs::new(Arc::new(fs), &config.cache, Some(metrics.clone()))
                .await
                .unwrap(),
        );
        let handler = Arc::new(ProxyHandler::new(
            vfs.clone(),
            registry,
            &config,
            Some(metrics),
        ));

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let base = format!("http://{}", listener.local_addr().unwrap());
        let (stop, stopped) = oneshot::channel::<()>();
        let task = tokio::spawn(server::serve(listener, handler, async {
            let _ = stopped.await;
        }));

        TestProxy {
            base,
            stop: Some(stop),
            task,
            vfs,
            _cache_dir: cache_dir,
        }
    }

    async fn stop(mut self) {
        if let Some(stop) = self.stop.take() {
            let _ = stop.send(());
        }
        tokio::time::timeout(Duration::from_secs(5), &mut self.task)
            .await
            .unwrap()
            .unwrap();
        self.vfs.shutdown().await;
    }
}

async fn mount_upstream(server: &MockServer) {
    Mock::given(method("GET"))
        .and(path("/fox.txt"))
        .and(header("range", "bytes=0-0"))
        .respond_with(
            ResponseTemplate::new(206)
                .insert_header("Content-Range", format!("bytes 0-0/{}", DATA.len()).as_str())
                .insert_header("Content-Type", "text/plain")
                .insert_header("Last-Modified", "Wed, 21 Oct 2015 07:28:00 GMT")
                .set_body_bytes(DATA[..1].to_vec()),
        )
        .with_priority(1)
        .mount(server)
        .await;

    // Every other request ignores Range and returns the whole object
    Mock::given(method("GET"))
        .and(path("/fox.txt"))
        .respond_with(ResponseTemplate::new(200).set_body_bytes(DATA.to_vec()))
        .with_priority(2)
        .mount(server)
        .await;
}

#[tokio::test]
async fn test_get_by_query_parameter() {
    let upstream = MockServer::start().await;
    mount_upstream(&upstream).await;
    let proxy = TestProxy::start().await;

    let target = format!("{}/fox.txt", upstream.uri());
    let client = reqwest::Client::new();
    let response = client
        .get(format!("{}/stream", proxy.base))
        .query(&[("url", target.as_str())])
        .send()
        .await
        .unwrap();

    assert_eq!(response.status(), 200);
    assert_eq!(
        response.headers()["content-length"],
        DATA.len().to_string().as_str()
    );
    assert_eq!(response.headers()["content-type"], "text/plain");
    assert_eq!(
        response.headers()["last-modified"],
        "Wed, 21 Oct 2015 07:28:00 GMT"
    );
    assert_eq!(response.bytes().await.unwrap().as_ref(), DATA);

    proxy.stop().await;
}

#[tokio::test]
async fn test_range_by_base64_path() {
    let upstream = MockServer::start().await;
    mount_upstream(&upstream).await;
    let proxy = TestProxy::start().await;

    let encoded = URL_SAFE_NO_PAD.encode(format!("{}/fox.txt", upstream.uri()));
    let client = reqwest::Client::new();
    let response = client
        .get(format!("{}/stream/{}", proxy.base, encoded))
        .header("Range", "bytes=4-18")
        .send()
        .await
        .unwrap();

    assert_eq!(response.status(), 206);
    assert_eq!(
        response.headers()["content-range"],
        format!("bytes 4-18/{}", DATA.len()).as_str()
    );
    assert_eq!(response.bytes().await.unwrap().as_ref(), &DATA[4..=18]);

    proxy.stop().await;
}

#[tokio::test]
async fn test_unresolvable_target_is_not_found() {
    let upstream = MockServer::start().await;
    Mock::given(method("GET"))
        .respond_with(ResponseTemplate::new(404))
        .mount(&upstream)
        .await;
    let proxy = TestProxy::start().await;

    let client = reqwest::Client::new();
    let response = client
        .get(format!("{}/stream", proxy.base))
        .query(&[("url", format!("{}/nothing", upstream.uri()))])
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 404);

    proxy.stop().await;
}

#[tokio::test]
async fn test_outside_mount_is_not_found() {
    let proxy = TestProxy::start().await;

    let client = reqwest::Client::new();
    let response = client
        .get(format!("{}/elsewhere", proxy.base))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 404);

    let response = client
        .get(format!("{}/stream", proxy.base))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 400);

    proxy.stop().await;
}
