//! Prometheus metrics HTTP server.
//!
//! Serves metrics and a pool status endpoint on a separate listener.

use crate::backend::BackendPool;
use crate::metrics::MetricsCollector;
use bytes::Bytes;
use http_body_util::Full;
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Method, Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use prometheus_client::encoding::text::encode;
use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::sync::broadcast;
use tracing::{debug, error, info};

/// Prometheus metrics HTTP server.
pub struct MetricsServer {
    listener: TcpListener,
    /// Path for metrics endpoint.
    path: String,
    collector: MetricsCollector,
    /// Pool whose liveness is reported on `/health`.
    pool: Arc<BackendPool>,
}

impl MetricsServer {
    /// Bind the metrics listener.
    pub async fn bind(
        address: SocketAddr,
        path: String,
        collector: MetricsCollector,
        pool: Arc<BackendPool>,
    ) -> std::io::Result<Self> {
        let listener = TcpListener::bind(address).await?;
        Ok(Self {
            listener,
            path,
            collector,
            pool,
        })
    }

    pub fn local_addr(&self) -> std::io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    /// Run the metrics server until shutdown.
    pub async fn run(self, mut shutdown: broadcast::Receiver<()>) {
        let address = self
            .listener
            .local_addr()
            .map(|a| a.to_string())
            .unwrap_or_default();
        info!(address = %address, path = %self.path, "metrics server started");

        let state = Arc::new(EndpointState {
            collector: self.collector,
            pool: self.pool,
            path: self.path,
        });

        loop {
            tokio::select! {
                accept_result = self.listener.accept() => {
                    match accept_result {
                        Ok((stream, _addr)) => {
                            let state = Arc::clone(&state);

                            tokio::spawn(async move {
                                let io = TokioIo::new(stream);
                                let service = service_fn(move |req| {
                                    let state = Arc::clone(&state);
                                    async move { handle_request(req, &state) }
                                });

                                if let Err(e) = http1::Builder::new()
                                    .serve_connection(io, service)
                                    .await
                                {
                                    debug!(error = %e, "metrics connection error");
                                }
                            });
                        }
                        Err(e) => {
                            error!(error = %e, "failed to accept metrics connection");
                        }
                    }
                }

                _ = shutdown.recv() => {
                    info!("metrics server shutting down");
                    break;
                }
            }
        }
    }
}

struct EndpointState {
    collector: MetricsCollector,
    pool: Arc<BackendPool>,
    path: String,
}

fn handle_request<B>(
    req: Request<B>,
    state: &EndpointState,
) -> Result<Response<Full<Bytes>>, Infallible> {
    let path = req.uri().path();
    let method = req.method();

    debug!(path = %path, method = %method, "metrics request");

    if method != Method::GET {
        return Ok(text_response(
            StatusCode::METHOD_NOT_ALLOWED,
            "Method not allowed\n".to_string(),
        ));
    }

    if path == state.path {
        let mut buffer = String::new();
        if let Err(e) = encode(&mut buffer, state.collector.registry()) {
            error!(error = %e, "failed to encode metrics");
            return Ok(text_response(
                StatusCode::INTERNAL_SERVER_ERROR,
                "Failed to encode metrics\n".to_string(),
            ));
        }

        let mut response = text_response(StatusCode::OK, buffer);
        response.headers_mut().insert(
            hyper::header::CONTENT_TYPE,
            hyper::header::HeaderValue::from_static("text/plain; version=0.0.4; charset=utf-8"),
        );
        Ok(response)
    } else if path == "/health" || path == "/healthz" {
        let alive = state.pool.alive_count();
        let total = state.pool.len();
        let status = if alive > 0 {
            StatusCode::OK
        } else {
            StatusCode::SERVICE_UNAVAILABLE
        };
        Ok(text_response(
            status,
            format!("{} of {} backends alive\n", alive, total),
        ))
    } else {
        Ok(text_response(StatusCode::NOT_FOUND, "Not found\n".to_string()))
    }
}

fn text_response(status: StatusCode, body: String) -> Response<Full<Bytes>> {
    let mut response = Response::new(Full::new(Bytes::from(body)));
    *response.status_mut() = status;
    response.headers_mut().insert(
        hyper::header::CONTENT_TYPE,
        hyper::header::HeaderValue::from_static("text/plain"),
    );
    response
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::Backend;
    use http_body_util::BodyExt;

    fn test_state() -> EndpointState {
        let pool = BackendPool::new(vec![
            Backend::parse("http://127.0.0.1:9001").unwrap(),
            Backend::parse("http://127.0.0.1:9002").unwrap(),
        ])
        .unwrap();

        EndpointState {
            collector: MetricsCollector::new(),
            pool: Arc::new(pool),
            path: "/metrics".to_string(),
        }
    }

    fn get(path: &str) -> Request<()> {
        Request::builder().uri(path).body(()).unwrap()
    }

    async fn body_string(response: Response<Full<Bytes>>) -> String {
        let bytes = response.into_body().collect().await.unwrap().to_bytes();
        String::from_utf8(bytes.to_vec()).unwrap()
    }

    #[tokio::test]
    async fn test_metrics_endpoint() {
        let state = test_state();
        state
            .collector
            .record_request("GET", 200, std::time::Duration::from_millis(10));

        let response = handle_request(get("/metrics"), &state).unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert!(body_string(response).await.contains("simplelb_requests"));
    }

    #[tokio::test]
    async fn test_health_endpoint_reports_pool() {
        let state = test_state();

        let response = handle_request(get("/health"), &state).unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(body_string(response).await, "2 of 2 backends alive\n");

        for backend in state.pool.backends() {
            backend.set_alive(false);
        }
        let response = handle_request(get("/healthz"), &state).unwrap();
        assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
    }

    #[test]
    fn test_unknown_path_and_method() {
        let state = test_state();

        let response = handle_request(get("/nope"), &state).unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);

        let post = Request::builder()
            .method(Method::POST)
            .uri("/metrics")
            .body(())
            .unwrap();
        let response = handle_request(post, &state).unwrap();
        assert_eq!(response.status(), StatusCode::METHOD_NOT_ALLOWED);
    }

    #[tokio::test]
    async fn test_bind_ephemeral_port() {
        let state = test_state();
        let server = MetricsServer::bind(
            "127.0.0.1:0".parse().unwrap(),
            "/metrics".to_string(),
            state.collector,
            state.pool,
        )
        .await
        .unwrap();
        assert_ne!(server.local_addr().unwrap().port(), 0);
    }
}
