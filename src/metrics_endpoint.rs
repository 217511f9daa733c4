//! Metrics HTTP Endpoint
//!
//! Serves the proxy's Prometheus metrics and a health probe on a separate
//! address from the file-serving listener.

use crate::metrics::ProxyMetrics;
use http_body_util::Full;
use hyper::body::Bytes;
use hyper::header::{HeaderValue, CONTENT_TYPE};
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tracing::{error, info};

/// Metrics endpoint server
pub struct MetricsEndpoint {
    metrics: Arc<ProxyMetrics>,
    addr: SocketAddr,
}

impl MetricsEndpoint {
    /// Create a new metrics endpoint
    ///
    /// # Example
    /// ```no_run
    /// use vfscache_proxy::metrics::ProxyMetrics;
    /// use vfscache_proxy::metrics_endpoint::MetricsEndpoint;
    /// use std::sync::Arc;
    ///
    /// let metrics = Arc::new(ProxyMetrics::new().unwrap());
    /// let endpoint = MetricsEndpoint::new(metrics, "127.0.0.1:9090".parse().unwrap());
    /// ```
    pub fn new(metrics: Arc<ProxyMetrics>, addr: SocketAddr) -> Self {
        Self { metrics, addr }
    }

    /// Bind the configured address and serve until the task is dropped
    pub async fn start(self) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
        let listener = TcpListener::bind(self.addr).await?;
        info!("Metrics endpoint listening on http://{}", self.addr);
        self.run(listener).await
    }

    /// Serve on an already bound listener
    pub async fn run(
        self,
        listener: TcpListener,
    ) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
        loop {
            let (stream, _) = listener.accept().await?;
            let io = TokioIo::new(stream);
            let metrics = Arc::clone(&self.metrics);

            tokio::task::spawn(async move {
                let service = service_fn(move |req| {
                    let metrics = Arc::clone(&metrics);
                    async move { handle_request(req, metrics).await }
                });

                if let Err(err) = http1::Builder::new().serve_connection(io, service).await {
                    error!("Error serving metrics connection: {:?}", err);
                }
            });
        }
    }
}

async fn handle_request(
    req: Request<hyper::body::Incoming>,
    metrics: Arc<ProxyMetrics>,
) -> Result<Response<Full<Bytes>>, hyper::Error> {
    match req.uri().path() {
        "/metrics" => Ok(metrics_response(&metrics)),
        "/health" => Ok(health_response()),
        "/" => Ok(text_response(
            StatusCode::OK,
            "text/plain; charset=utf-8",
            "vfscache-proxy metrics\n\n/metrics  Prometheus metrics\n/health   health check\n"
                .to_string(),
        )),
        _ => Ok(text_response(
            StatusCode::NOT_FOUND,
            "text/plain",
            "404 Not Found".to_string(),
        )),
    }
}

fn metrics_response(metrics: &ProxyMetrics) -> Response<Full<Bytes>> {
    match metrics.export_text() {
        Ok(body) => text_response(
            StatusCode::OK,
            "text/plain; version=0.0.4; charset=utf-8",
            body,
        ),
        Err(e) => {
            error!("Failed to encode metrics: {}", e);
            text_response(
                StatusCode::INTERNAL_SERVER_ERROR,
                "text/plain",
                format!("failed to encode metrics: {}", e),
            )
        }
    }
}

fn health_response() -> Response<Full<Bytes>> {
    text_response(
        StatusCode::OK,
        "application/json",
        serde_json::json!({ "status": "healthy" }).to_string(),
    )
}

fn text_response(status: StatusCode, content_type: &'static str, body: String) -> Response<Full<Bytes>> {
    let mut response = Response::new(Full::new(Bytes::from(body)));
    *response.status_mut() = status;
    response
        .headers_mut()
        .insert(CONTENT_TYPE, HeaderValue::from_static(content_type));
    response
}
