//! Forwarding to a single backend with bounded same-backend retries.

use crate::backend::Backend;
use crate::health::PassiveHealthTracker;
use crate::metrics::MetricsCollector;
use crate::proxy::retry::{RetryPolicy, RetryState};
use crate::proxy::transport::{ProxyBody, Transport, TransportError};
use bytes::Bytes;
use http::header::{HeaderName, HeaderValue, CONNECTION, HOST};
use http::{HeaderMap, Method, Request, Response, Uri};
use http_body_util::Full;
use std::net::SocketAddr;
use std::sync::Arc;
use tracing::{debug, warn};

const X_FORWARDED_FOR: HeaderName = HeaderName::from_static("x-forwarded-for");

/// Headers that describe a single hop and must not be forwarded.
const HOP_BY_HOP_HEADERS: [&str; 9] = [
    "connection",
    "keep-alive",
    "proxy-connection",
    "proxy-authenticate",
    "proxy-authorization",
    "te",
    "trailer",
    "transfer-encoding",
    "upgrade",
];

/// An inbound request with its body read into memory so it can be replayed.
#[derive(Debug, Clone)]
pub struct BufferedRequest {
    pub method: Method,
    pub uri: Uri,
    pub headers: HeaderMap,
    pub body: Bytes,
    pub client_addr: Option<SocketAddr>,
}

/// How forwarding to one backend ended.
pub enum ForwardOutcome {
    /// The backend answered; relay this response.
    Succeeded(Response<ProxyBody>),
    /// The backend used up its retries and was marked dead.
    FailedOver,
}

/// Forwards requests to one bound backend.
pub struct RequestForwarder<'a, T> {
    backend: Arc<Backend>,
    transport: &'a T,
    policy: RetryPolicy,
    passive: &'a PassiveHealthTracker,
    metrics: &'a MetricsCollector,
}

impl<'a, T: Transport> RequestForwarder<'a, T> {
    pub fn new(
        backend: Arc<Backend>,
        transport: &'a T,
        policy: RetryPolicy,
        passive: &'a PassiveHealthTracker,
        metrics: &'a MetricsCollector,
    ) -> Self {
        Self {
            backend,
            transport,
            policy,
            passive,
            metrics,
        }
    }

    /// Forward `req`, retrying the same backend on transport failure.
    ///
    /// Each failure waits `policy.backoff` and bumps `state.retries` until
    /// the retry ceiling is hit. Then the backend is marked dead, `state` is
    /// moved to the next attempt, and [`ForwardOutcome::FailedOver`] hands
    /// control back to the caller.
    pub async fn forward(&self, req: &BufferedRequest, state: &mut RetryState) -> ForwardOutcome {
        let name = self.backend.to_string();

        loop {
            let result = match build_upstream_request(req, &self.backend) {
                Ok(upstream) => self.transport.send(upstream).await,
                Err(e) => Err(TransportError::Build(e)),
            };

            let error = match result {
                Ok(mut response) => {
                    strip_hop_by_hop(response.headers_mut());
                    debug!(
                        backend = %name,
                        status = response.status().as_u16(),
                        retries = state.retries,
                        "backend responded"
                    );
                    return ForwardOutcome::Succeeded(response);
                }
                Err(e) => e,
            };

            if state.can_retry(&self.policy) {
                debug!(
                    backend = %name,
                    retries = state.retries,
                    error = %error,
                    "forwarding failed, retrying same backend"
                );
                self.metrics.record_retry(&name);
                tokio::time::sleep(self.policy.backoff).await;
                state.record_retry();
                continue;
            }

            warn!(
                backend = %name,
                attempts = state.attempts,
                error = %error,
                "backend failed after all retries, failing over"
            );
            self.passive.mark_dead(&self.backend);
            self.metrics.record_failover(&name);
            state.fail_over();
            return ForwardOutcome::FailedOver;
        }
    }
}

/// Build the request sent to `backend`.
///
/// The target is rewritten to the backend root (the query string is kept),
/// `Host` is set to the backend authority, hop-by-hop headers are removed,
/// and the client address is appended to `X-Forwarded-For`.
fn build_upstream_request(
    req: &BufferedRequest,
    backend: &Backend,
) -> Result<Request<Full<Bytes>>, http::Error> {
    let path_and_query = match req.uri.query() {
        Some(query) => format!("/?{}", query),
        None => "/".to_string(),
    };

    let uri = Uri::builder()
        .scheme(backend.scheme().clone())
        .authority(backend.authority().clone())
        .path_and_query(path_and_query)
        .build()?;

    let mut headers = req.headers.clone();
    strip_hop_by_hop(&mut headers);
    headers.insert(HOST, HeaderValue::from_str(backend.authority().as_str())?);

    if let Some(client_addr) = req.client_addr {
        append_forwarded_for(&mut headers, client_addr)?;
    }

    let mut upstream = Request::builder()
        .method(req.method.clone())
        .uri(uri)
        .body(Full::new(req.body.clone()))?;
    *upstream.headers_mut() = headers;

    Ok(upstream)
}

/// Append the client IP to the `X-Forwarded-For` chain.
///
/// Earlier values are carried over as raw bytes, so entries that are not
/// visible ASCII survive unchanged.
fn append_forwarded_for(headers: &mut HeaderMap, client_addr: SocketAddr) -> Result<(), http::Error> {
    let mut value: Vec<u8> = Vec::new();

    for prior in headers.get_all(X_FORWARDED_FOR) {
        if !value.is_empty() {
            value.extend_from_slice(b", ");
        }
        value.extend_from_slice(prior.as_bytes());
    }

    if !value.is_empty() {
        value.extend_from_slice(b", ");
    }
    value.extend_from_slice(client_addr.ip().to_string().as_bytes());

    headers.insert(X_FORWARDED_FOR, HeaderValue::from_bytes(&value)?);
    Ok(())
}

/// Remove hop-by-hop headers, including any named in `Connection`.
pub(crate) fn strip_hop_by_hop(headers: &mut HeaderMap) {
    let listed: Vec<HeaderName> = headers
        .get_all(CONNECTION)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .flat_map(|v| v.split(','))
        .filter_map(|name| HeaderName::from_bytes(name.trim().as_bytes()).ok())
        .collect();

    for name in listed {
        headers.remove(name);
    }
    for name in HOP_BY_HOP_HEADERS {
        headers.remove(name);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::proxy::transport::full_body;
    use http_body_util::BodyExt;
    use parking_lot::Mutex;
    use std::time::{Duration, Instant};

    /// Transport that fails a fixed number of times, then answers 200.
    struct FlakyTransport {
        failures_left: Mutex<u32>,
        calls: Mutex<Vec<Request<Full<Bytes>>>>,
    }

    impl FlakyTransport {
        fn new(failures: u32) -> Self {
            Self {
                failures_left: Mutex::new(failures),
                calls: Mutex::new(Vec::new()),
            }
        }

        fn call_count(&self) -> usize {
            self.calls.lock().len()
        }
    }

    impl Transport for FlakyTransport {
        async fn send(
            &self,
            req: Request<Full<Bytes>>,
        ) -> Result<Response<ProxyBody>, TransportError> {
            self.calls.lock().push(req);

            let mut left = self.failures_left.lock();
            if *left > 0 {
                *left -= 1;
                return Err(TransportError::Timeout(Duration::from_millis(1)));
            }
            Ok(Response::new(full_body("ok")))
        }
    }

    fn test_request(uri: &str) -> BufferedRequest {
        let mut headers = HeaderMap::new();
        headers.insert(HOST, HeaderValue::from_static("lb.example.com"));
        headers.insert(CONNECTION, HeaderValue::from_static("keep-alive, x-custom-hop"));
        headers.insert("keep-alive", HeaderValue::from_static("timeout=5"));
        headers.insert("x-custom-hop", HeaderValue::from_static("1"));
        headers.insert("x-app", HeaderValue::from_static("kept"));

        BufferedRequest {
            method: Method::POST,
            uri: uri.parse().unwrap(),
            headers,
            body: Bytes::from_static(b"payload"),
            client_addr: Some("192.168.1.100:12345".parse().unwrap()),
        }
    }

    fn backend() -> Arc<Backend> {
        Arc::new(Backend::parse("http://10.0.0.1:8080").unwrap())
    }

    fn fast_policy() -> RetryPolicy {
        RetryPolicy {
            backoff: Duration::from_millis(1),
            ..RetryPolicy::default()
        }
    }

    #[test]
    fn test_build_upstream_request_rewrites_target() {
        let req = test_request("/some/path?q=1&r=2");
        let upstream = build_upstream_request(&req, &backend()).unwrap();

        assert_eq!(upstream.method(), Method::POST);
        assert_eq!(upstream.uri().to_string(), "http://10.0.0.1:8080/?q=1&r=2");
        assert_eq!(upstream.headers()[HOST], "10.0.0.1:8080");
        assert_eq!(upstream.headers()["x-forwarded-for"], "192.168.1.100");
        assert_eq!(upstream.headers()["x-app"], "kept");
        assert!(upstream.headers().get(CONNECTION).is_none());
        assert!(upstream.headers().get("keep-alive").is_none());
        assert!(upstream.headers().get("x-custom-hop").is_none());
    }

    #[test]
    fn test_build_upstream_request_root_path() {
        let req = test_request("/deep/path");
        let upstream = build_upstream_request(&req, &backend()).unwrap();
        assert_eq!(upstream.uri().path(), "/");
        assert!(upstream.uri().query().is_none());
    }

    #[test]
    fn test_forwarded_for_appends() {
        let mut headers = HeaderMap::new();
        headers.insert("x-forwarded-for", HeaderValue::from_static("10.1.1.1"));
        append_forwarded_for(&mut headers, "192.168.1.100:1".parse().unwrap()).unwrap();
        assert_eq!(headers["x-forwarded-for"], "10.1.1.1, 192.168.1.100");
    }

    #[test]
    fn test_forwarded_for_keeps_opaque_values() {
        let mut headers = HeaderMap::new();
        headers.append(
            "x-forwarded-for",
            HeaderValue::from_bytes(b"10.1.1.1, caf\xe9").unwrap(),
        );
        headers.append("x-forwarded-for", HeaderValue::from_static("10.2.2.2"));

        append_forwarded_for(&mut headers, "192.168.1.100:1".parse().unwrap()).unwrap();

        let values: Vec<&HeaderValue> = headers.get_all("x-forwarded-for").iter().collect();
        assert_eq!(values.len(), 1);
        assert_eq!(
            values[0].as_bytes(),
            b"10.1.1.1, caf\xe9, 10.2.2.2, 192.168.1.100"
        );
    }

    #[tokio::test]
    async fn test_forward_success_first_try() {
        let transport = FlakyTransport::new(0);
        let passive = PassiveHealthTracker::new(MetricsCollector::new());
        let metrics = MetricsCollector::new();
        let forwarder = RequestForwarder::new(backend(), &transport, fast_policy(), &passive, &metrics);

        let mut state = RetryState::new();
        let outcome = forwarder.forward(&test_request("/"), &mut state).await;

        assert!(matches!(outcome, ForwardOutcome::Succeeded(_)));
        assert_eq!(transport.call_count(), 1);
        assert_eq!(state, RetryState::new());
    }

    #[tokio::test]
    async fn test_forward_recovers_within_retry_budget() {
        let transport = FlakyTransport::new(3);
        let passive = PassiveHealthTracker::new(MetricsCollector::new());
        let metrics = MetricsCollector::new();
        let backend = backend();
        let forwarder =
            RequestForwarder::new(Arc::clone(&backend), &transport, fast_policy(), &passive, &metrics);

        let mut state = RetryState::new();
        let outcome = forwarder.forward(&test_request("/"), &mut state).await;

        assert!(matches!(outcome, ForwardOutcome::Succeeded(_)));
        assert_eq!(transport.call_count(), 4);
        assert_eq!(state.retries, 3);
        assert!(backend.is_alive());
    }

    #[tokio::test]
    async fn test_forward_exhausts_retries_and_marks_dead() {
        let transport = FlakyTransport::new(u32::MAX);
        let passive = PassiveHealthTracker::new(MetricsCollector::new());
        let metrics = MetricsCollector::new();
        let backend = backend();
        let policy = RetryPolicy {
            backoff: Duration::from_millis(10),
            ..RetryPolicy::default()
        };
        let forwarder = RequestForwarder::new(Arc::clone(&backend), &transport, policy, &passive, &metrics);

        let mut state = RetryState::new();
        let started = Instant::now();
        let outcome = forwarder.forward(&test_request("/"), &mut state).await;

        assert!(matches!(outcome, ForwardOutcome::FailedOver));
        // 1 initial try + 3 retries
        assert_eq!(transport.call_count(), 4);
        // Three backoff pauses between the four tries
        assert!(started.elapsed() >= Duration::from_millis(30));
        assert!(!backend.is_alive());
        assert_eq!(state, RetryState { retries: 0, attempts: 2 });
    }

    #[tokio::test]
    async fn test_every_retry_replays_the_body() {
        let transport = FlakyTransport::new(2);
        let passive = PassiveHealthTracker::new(MetricsCollector::new());
        let metrics = MetricsCollector::new();
        let forwarder = RequestForwarder::new(backend(), &transport, fast_policy(), &passive, &metrics);

        let mut state = RetryState::new();
        forwarder.forward(&test_request("/"), &mut state).await;

        let calls = std::mem::take(&mut *transport.calls.lock());
        assert_eq!(calls.len(), 3);
        for call in calls {
            let body = call.into_body().collect().await.unwrap().to_bytes();
            assert_eq!(&body[..], b"payload");
        }
    }

    #[test]
    fn test_strip_hop_by_hop() {
        let mut headers = HeaderMap::new();
        headers.insert(CONNECTION, HeaderValue::from_static("close"));
        headers.insert("transfer-encoding", HeaderValue::from_static("chunked"));
        headers.insert("upgrade", HeaderValue::from_static("websocket"));
        headers.insert("content-type", HeaderValue::from_static("text/plain"));

        strip_hop_by_hop(&mut headers);

        assert_eq!(headers.len(), 1);
        assert!(headers.contains_key("content-type"));
    }
}
