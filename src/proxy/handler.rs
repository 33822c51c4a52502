//! Request entry point: backend selection and failover across backends.

use crate::backend::BackendPool;
use crate::config::DEFAULT_MAX_BODY_SIZE;
use crate::health::PassiveHealthTracker;
use crate::metrics::MetricsCollector;
use crate::proxy::forwarder::{BufferedRequest, ForwardOutcome, RequestForwarder};
use crate::proxy::retry::{RetryPolicy, RetryState};
use crate::proxy::transport::{full_body, ProxyBody, Transport};
use crate::util::{RequestId, REQUEST_ID_HEADER};
use bytes::Bytes;
use http::header::{HeaderValue, CONTENT_TYPE};
use http::{Request, Response, StatusCode};
use http_body_util::{BodyExt, LengthLimitError, Limited};
use hyper::body::Body;
use std::error::Error as StdError;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, field, info, instrument, warn, Span};

type BoxError = Box<dyn StdError + Send + Sync>;

/// Failures that end a client request without a backend response.
#[derive(Debug, thiserror::Error)]
pub enum ProxyError {
    /// Every backend in the pool is marked dead.
    #[error("No backend available")]
    NoBackendAvailable,

    /// The request already went through the maximum number of backends.
    #[error("Service not available")]
    AttemptsExhausted,

    #[error("Failed to read request body")]
    BodyRead(#[source] BoxError),

    #[error("Request body too large (limit {limit} bytes)")]
    BodyTooLarge { limit: usize },
}

impl ProxyError {
    pub fn status(&self) -> StatusCode {
        match self {
            ProxyError::NoBackendAvailable | ProxyError::AttemptsExhausted => {
                StatusCode::SERVICE_UNAVAILABLE
            }
            ProxyError::BodyRead(_) => StatusCode::BAD_REQUEST,
            ProxyError::BodyTooLarge { .. } => StatusCode::PAYLOAD_TOO_LARGE,
        }
    }

    /// Plain-text response for the client. Never names a backend.
    pub fn into_response(self) -> Response<ProxyBody> {
        error_response(self.status(), &self.to_string())
    }
}

/// Selects backends and drives the failover loop for each client request.
pub struct LoadBalanceHandler<T> {
    pool: Arc<BackendPool>,
    transport: T,
    policy: RetryPolicy,
    passive: PassiveHealthTracker,
    metrics: MetricsCollector,
    /// Bodies larger than this are refused before any backend is picked.
    max_body_size: usize,
}

impl<T: Transport> LoadBalanceHandler<T> {
    pub fn new(
        pool: Arc<BackendPool>,
        transport: T,
        policy: RetryPolicy,
        metrics: MetricsCollector,
    ) -> Self {
        Self {
            pool,
            transport,
            policy,
            passive: PassiveHealthTracker::new(metrics.clone()),
            metrics,
            max_body_size: DEFAULT_MAX_BODY_SIZE,
        }
    }

    /// Set the request body limit.
    pub fn with_max_body_size(mut self, max_body_size: usize) -> Self {
        self.max_body_size = max_body_size;
        self
    }

    pub fn pool(&self) -> &Arc<BackendPool> {
        &self.pool
    }

    /// Serve one client request.
    ///
    /// Always produces a response: the backend's, or a plain-text error.
    #[instrument(skip_all, fields(
        method = %req.method(),
        uri = %req.uri(),
        client = ?client_addr,
        request_id = field::Empty,
    ))]
    pub async fn handle<B>(&self, req: Request<B>, client_addr: Option<SocketAddr>) -> Response<ProxyBody>
    where
        B: Body<Data = Bytes>,
        B::Error: Into<BoxError>,
    {
        let start_time = Instant::now();
        let method = req.method().to_string();

        let request_id = RequestId::from_headers(req.headers());
        Span::current().record("request_id", request_id.as_str());

        let result = match buffer_request(req, client_addr, &request_id, self.max_body_size).await {
            Ok(buffered) => self.dispatch(&buffered).await,
            Err(e) => Err(e),
        };

        let mut response = match result {
            Ok(response) => response,
            Err(e) => {
                warn!(error = %e, "request failed");
                e.into_response()
            }
        };

        if !response.headers().contains_key(REQUEST_ID_HEADER) {
            if let Ok(value) = HeaderValue::from_str(request_id.as_str()) {
                response.headers_mut().insert(REQUEST_ID_HEADER, value);
            }
        }

        let duration = start_time.elapsed();
        let status = response.status().as_u16();
        self.metrics.record_request(&method, status, duration);

        info!(
            status = status,
            duration_ms = duration.as_millis(),
            "request completed"
        );

        response
    }

    /// Run the failover loop for an already-buffered request.
    ///
    /// Before each selection the attempt ceiling is checked; an empty pool
    /// ends the loop immediately regardless of remaining attempts.
    pub async fn dispatch(&self, req: &BufferedRequest) -> Result<Response<ProxyBody>, ProxyError> {
        let mut state = RetryState::new();

        loop {
            if state.attempts_exhausted(&self.policy) {
                return Err(ProxyError::AttemptsExhausted);
            }

            let backend = self
                .pool
                .get_next_backend()
                .ok_or(ProxyError::NoBackendAvailable)?;

            debug!(backend = %backend, attempt = state.attempts, "selected backend");

            let forwarder = RequestForwarder::new(
                backend,
                &self.transport,
                self.policy,
                &self.passive,
                &self.metrics,
            );

            match forwarder.forward(req, &mut state).await {
                ForwardOutcome::Succeeded(response) => return Ok(response),
                ForwardOutcome::FailedOver => continue,
            }
        }
    }
}

/// Read the whole body, up to `limit` bytes, so the request can be replayed
/// on retries.
async fn buffer_request<B>(
    req: Request<B>,
    client_addr: Option<SocketAddr>,
    request_id: &RequestId,
    limit: usize,
) -> Result<BufferedRequest, ProxyError>
where
    B: Body<Data = Bytes>,
    B::Error: Into<BoxError>,
{
    let (parts, body) = req.into_parts();
    let body = Limited::new(body, limit)
        .collect()
        .await
        .map_err(|e| {
            if e.downcast_ref::<LengthLimitError>().is_some() {
                ProxyError::BodyTooLarge { limit }
            } else {
                ProxyError::BodyRead(e)
            }
        })?
        .to_bytes();

    let mut headers = parts.headers;
    if let Ok(value) = HeaderValue::from_str(request_id.as_str()) {
        headers.insert(REQUEST_ID_HEADER, value);
    }

    Ok(BufferedRequest {
        method: parts.method,
        uri: parts.uri,
        headers,
        body,
        client_addr,
    })
}

/// Create an error response.
fn error_response(status: StatusCode, message: &str) -> Response<ProxyBody> {
    let mut response = Response::new(full_body(format!("{}\n", message)));
    *response.status_mut() = status;
    response
        .headers_mut()
        .insert(CONTENT_TYPE, HeaderValue::from_static("text/plain; charset=utf-8"));
    response
}
