//! Upstream transport.
//!
//! The forwarding logic only needs "send this request to its upstream and
//! report success or failure"; [`Transport`] is that seam.

use bytes::Bytes;
use http_body_util::{combinators::BoxBody, BodyExt, Full};
use hyper::{Request, Response};
use hyper_util::client::legacy::connect::HttpConnector;
use hyper_util::client::legacy::Client;
use hyper_util::rt::TokioExecutor;
use std::future::Future;
use std::time::Duration;
use tokio::time::timeout;

/// Body type of responses relayed to clients.
pub type ProxyBody = BoxBody<Bytes, hyper::Error>;

/// A failed attempt to get a response from an upstream.
#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("upstream request failed: {0}")]
    Request(#[from] hyper_util::client::legacy::Error),

    #[error("upstream did not respond within {0:?}")]
    Timeout(Duration),

    #[error("failed to build upstream request: {0}")]
    Build(#[from] http::Error),
}

/// Sends a fully-built request to the upstream named in its URI.
///
/// Any HTTP response, whatever its status, is a success. Only failing to get
/// a response at all is an error.
pub trait Transport: Send + Sync + 'static {
    fn send(
        &self,
        req: Request<Full<Bytes>>,
    ) -> impl Future<Output = Result<Response<ProxyBody>, TransportError>> + Send;
}

/// HTTP/1.1 transport backed by hyper's pooled client.
#[derive(Clone)]
pub struct HttpTransport {
    client: Client<HttpConnector, Full<Bytes>>,
    request_timeout: Duration,
}

impl HttpTransport {
    /// Create a transport with the given connect and response timeouts.
    pub fn new(connect_timeout: Duration, request_timeout: Duration) -> Self {
        let mut connector = HttpConnector::new();
        connector.set_connect_timeout(Some(connect_timeout));
        connector.set_nodelay(true);

        let client = Client::builder(TokioExecutor::new()).build(connector);

        Self {
            client,
            request_timeout,
        }
    }
}

impl Transport for HttpTransport {
    async fn send(&self, req: Request<Full<Bytes>>) -> Result<Response<ProxyBody>, TransportError> {
        let response = timeout(self.request_timeout, self.client.request(req))
            .await
            .map_err(|_| TransportError::Timeout(self.request_timeout))??;

        Ok(response.map(|body| body.boxed()))
    }
}

/// Wrap in-memory bytes as a [`ProxyBody`].
pub fn full_body(data: impl Into<Bytes>) -> ProxyBody {
    Full::new(data.into())
        .map_err(|never| match never {})
        .boxed()
}
