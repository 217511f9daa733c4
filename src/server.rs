//! HTTP/1 listener for the file-serving façade
//!
//! One task per connection. Requests under the mount path go to the
//! [`ProxyHandler`]; everything else is 404. When the shutdown future
//! resolves the listener closes, open connections are asked to finish their
//! in-flight request and are given [`SHUTDOWN_TIMEOUT`] to do so.

use crate::handler::ProxyHandler;
use crate::response_builder::{error_response, ProxyBody};
use hyper::body::Incoming;
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use std::convert::Infallible;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::sync::watch;
use tokio::task::JoinSet;
use tracing::{debug, info, warn};

/// Grace period for open connections after shutdown is requested
pub const SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(10);

/// Accept connections on `listener` until `shutdown` resolves
pub async fn serve<F>(listener: TcpListener, handler: Arc<ProxyHandler>, shutdown: F)
where
    F: Future<Output = ()>,
{
    let (stop_tx, stop_rx) = watch::channel(false);
    let mut connections = JoinSet::new();
    tokio::pin!(shutdown);

    if let Ok(addr) = listener.local_addr() {
        info!("Serving on http://{}", addr);
    }

    loop {
        tokio::select! {
            accepted = listener.accept() => {
                let (stream, peer) = match accepted {
                    Ok(accepted) => accepted,
                    Err(e) => {
                        warn!("Failed to accept connection: {}", e);
                        continue;
                    }
                };

                let io = TokioIo::new(stream);
                let handler = Arc::clone(&handler);
                let mut stop_rx = stop_rx.clone();

                connections.spawn(async move {
                    let service = service_fn(move |req: Request<Incoming>| {
                        let handler = Arc::clone(&handler);
                        async move { Ok::<_, Infallible>(route(&handler, req).await) }
                    });

                    let conn = http1::Builder::new().serve_connection(io, service);
                    tokio::pin!(conn);

                    tokio::select! {
                        result = conn.as_mut() => {
                            if let Err(e) = result {
                                debug!("Connection from {} closed with error: {:?}", peer, e);
                            }
                        }
                        _ = stop_rx.changed() => {
                            conn.as_mut().graceful_shutdown();
                            if let Err(e) = conn.await {
                                debug!("Connection from {} closed during shutdown: {:?}", peer, e);
                            }
                        }
                    }
                });
            }
            _ = &mut shutdown => break,
        }

        while connections.try_join_next().is_some() {}
    }

    drop(listener);
    let _ = stop_tx.send(true);

    let open = connections.len();
    if open > 0 {
        info!("Waiting for {} open connections", open);
    }
    let drained = tokio::time::timeout(SHUTDOWN_TIMEOUT, async {
        while connections.join_next().await.is_some() {}
    })
    .await;
    if drained.is_err() {
        warn!(
            "Connections still open after {:?}, aborting them",
            SHUTDOWN_TIMEOUT
        );
        connections.abort_all();
    }
    info!("Server stopped");
}

async fn route(handler: &ProxyHandler, req: Request<Incoming>) -> Response<ProxyBody> {
    if handler.matches(req.uri().path()) {
        handler.handle(req).await
    } else {
        error_response(StatusCode::NOT_FOUND, "Not found")
    }
}
