//! Integration tests for the read-only URL filesystem

use bytes::Bytes;
use futures_util::StreamExt;
use http::header::{HeaderMap, HeaderName, HeaderValue};
use reqwest::Client;
use std::sync::Arc;
use std::time::{Duration, SystemTime};
use vfscache_proxy::{
    compute_key, sharded_path, Node, Pacer, ProxyError, RemoteFs, RetryPolicy, UrlFs, UrlRegistry,
};
use wiremock::matchers::{header, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

fn url_fs(registry: Arc<UrlRegistry>, shard_level: usize) -> UrlFs {
    let policy = RetryPolicy::with_sleep(1, Duration::from_millis(1), Duration::from_millis(5));
    UrlFs::new(
        "link",
        registry,
        Client::new(),
        Arc::new(Pacer::new(policy)),
        shard_level,
    )
}

#[tokio::test]
async fn test_stat_known_size_makes_no_network_call() {
    let registry = Arc::new(UrlRegistry::new());
    // Unroutable port: any request would fail
    registry.register_with_size("h1", "http://127.0.0.1:1/a.bin", HeaderMap::new(), 1024);
    let fs = url_fs(registry, 0);

    let info = fs.stat("sh/h1").await.unwrap();
    assert_eq!(info.size, Some(1024));
    assert_eq!(info.name(), "h1");
    assert!(info.mime_type.is_none());

    let node = Node::File(info);
    assert!(node.is_file());
}

#[tokio::test]
async fn test_stat_unregistered_is_not_found() {
    let fs = url_fs(Arc::new(UrlRegistry::new()), 1);
    let err = fs.stat("ab/abcdef").await.unwrap_err();
    assert!(err.is_not_found());
    assert_eq!(err.to_http_status(), 404);
}

#[tokio::test]
async fn test_stat_resolves_unknown_size() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/movie.mkv"))
        .respond_with(
            ResponseTemplate::new(206)
                .insert_header("Content-Range", "bytes 0-0/5000")
                .insert_header("Content-Type", "video/x-matroska")
                .set_body_bytes(vec![0u8]),
        )
        .expect(1)
        .mount(&server)
        .await;

    let registry = Arc::new(UrlRegistry::new());
    let url = format!("{}/movie.mkv", server.uri());
    let key = compute_key(&url, false, false);
    registry.register(&key, &url, HeaderMap::new());

    let fs = url_fs(registry, 1);
    let info = fs.stat(&sharded_path(&key, 1)).await.unwrap();
    assert_eq!(info.size, Some(5000));
    assert_eq!(info.mime_type.as_deref(), Some("video/x-matroska"));
}

#[tokio::test]
async fn test_mutations_are_read_only() {
    let registry = Arc::new(UrlRegistry::new());
    registry.register_with_size("h1", "http://127.0.0.1:1/a.bin", HeaderMap::new(), 1);
    let fs = url_fs(registry, 0);

    assert!(matches!(
        fs.put("h2", Bytes::from_static(b"data")).await,
        Err(ProxyError::ReadOnly)
    ));
    assert!(matches!(fs.remove("h1").await, Err(ProxyError::ReadOnly)));
    assert!(matches!(
        fs.set_mod_time("h1", SystemTime::now()).await,
        Err(ProxyError::ReadOnly)
    ));
    assert!(matches!(fs.mkdir("dir").await, Err(ProxyError::ReadOnly)));
    assert!(matches!(fs.rmdir("dir").await, Err(ProxyError::ReadOnly)));
    assert!(matches!(fs.rename("h1", "h3").await, Err(ProxyError::ReadOnly)));
    assert!(matches!(fs.truncate("h1", 0).await, Err(ProxyError::ReadOnly)));

    // The entry is untouched
    assert_eq!(fs.stat("h1").await.unwrap().size, Some(1));
}

#[tokio::test]
async fn test_list_groups_by_shard() {
    let registry = Arc::new(UrlRegistry::new());
    for (key, size) in [("ab12", 1), ("ab34", 2), ("cd56", 3)] {
        registry.register_with_size(key, "http://127.0.0.1:1/x", HeaderMap::new(), size);
    }
    let fs = url_fs(registry, 1);

    let root = fs.list("").await.unwrap();
    let dirs: Vec<&str> = root.iter().map(|node| node.path()).collect();
    assert_eq!(dirs, vec!["ab", "cd"]);
    assert!(root.iter().all(|node| !node.is_file()));

    let shard = fs.list("/ab/").await.unwrap();
    let files: Vec<(String, Option<u64>)> = shard
        .into_iter()
        .filter_map(Node::into_file)
        .map(|info| (info.remote, info.size))
        .collect();
    assert_eq!(
        files,
        vec![
            ("ab/ab12".to_string(), Some(1)),
            ("ab/ab34".to_string(), Some(2)),
        ]
    );

    assert!(fs.list("zz").await.unwrap().is_empty());
}

#[tokio::test]
async fn test_dir_exists() {
    let registry = Arc::new(UrlRegistry::new());
    registry.register_with_size("ab12cd", "http://127.0.0.1:1/x", HeaderMap::new(), 1);
    let fs = url_fs(registry, 2);

    assert!(fs.dir_exists("").await.unwrap());
    assert!(fs.dir_exists("ab").await.unwrap());
    assert!(fs.dir_exists("ab/12").await.unwrap());
    assert!(!fs.dir_exists("ab/12/ab12cd").await.unwrap());
    assert!(!fs.dir_exists("cd").await.unwrap());
}

#[tokio::test]
async fn test_open_overrides_stored_headers() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/data.bin"))
        .and(header("x-token", "override"))
        .and(header("range", "bytes=2-4"))
        .respond_with(
            ResponseTemplate::new(206)
                .insert_header("Content-Range", "bytes 2-4/10")
                .set_body_bytes(b"cde".to_vec()),
        )
        .expect(1)
        .mount(&server)
        .await;

    let token = HeaderName::from_static("x-token");
    let mut stored = HeaderMap::new();
    stored.insert(token.clone(), HeaderValue::from_static("stored"));

    let registry = Arc::new(UrlRegistry::new());
    registry.register("k1", &format!("{}/data.bin", server.uri()), stored);
    let fs = url_fs(registry, 0);

    let mut overrides = HeaderMap::new();
    overrides.insert(token, HeaderValue::from_static("override"));
    overrides.insert(http::header::RANGE, HeaderValue::from_static("bytes=2-4"));

    let object = fs.open("k1", &overrides).await.unwrap();
    assert!(object.is_partial());

    let mut body = Vec::new();
    let mut stream = object.stream;
    while let Some(piece) = stream.next().await {
        body.extend_from_slice(&piece.unwrap());
    }
    assert_eq!(body, b"cde");
}

#[tokio::test]
async fn test_open_upstream_error() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/gone.bin"))
        .respond_with(ResponseTemplate::new(410))
        .expect(1)
        .mount(&server)
        .await;

    let registry = Arc::new(UrlRegistry::new());
    registry.register("k1", &format!("{}/gone.bin", server.uri()), HeaderMap::new());
    let fs = url_fs(registry, 0);

    let err = fs.open("k1", &HeaderMap::new()).await.unwrap_err();
    assert!(matches!(
        err,
        ProxyError::OriginClientError { status: 410, .. }
    ));
}
