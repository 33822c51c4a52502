//! Frontend listener implementation.
//!
//! Accepts client connections, serves HTTP/1.1 on each, and hands every
//! request to the load-balance handler.

use crate::config::ProxyConfig;
use crate::proxy::{LoadBalanceHandler, Transport};
use crate::util::drain_with_grace;
use hyper::body::Incoming;
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::Request;
use hyper_util::rt::{TokioIo, TokioTimer};
use hyper_util::server::graceful::GracefulShutdown;
use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::broadcast;
use tracing::{debug, error, info, instrument, warn};

/// Frontend listener that accepts and handles connections.
pub struct FrontendListener<T> {
    listener: TcpListener,
    handler: Arc<LoadBalanceHandler<T>>,
    /// Time a client has to send request headers.
    header_read_timeout: Duration,
    /// How long open connections may keep working after shutdown starts.
    shutdown_grace: Duration,
}

impl<T: Transport> FrontendListener<T> {
    /// Bind the listening socket.
    pub async fn bind(
        address: SocketAddr,
        handler: Arc<LoadBalanceHandler<T>>,
        proxy: &ProxyConfig,
    ) -> std::io::Result<Self> {
        let listener = TcpListener::bind(address).await?;

        info!(
            listen = %listener.local_addr()?,
            backends = handler.pool().len(),
            "frontend listener bound"
        );

        Ok(Self {
            listener,
            handler,
            header_read_timeout: proxy.header_read_timeout,
            shutdown_grace: proxy.shutdown_grace,
        })
    }

    pub fn local_addr(&self) -> std::io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    /// Accept connections until shutdown, then drain open connections.
    ///
    /// Once shutdown is signalled the socket is closed, so new connections
    /// are refused. Open connections finish their current request and close;
    /// any still running after the grace period are abandoned.
    #[instrument(skip_all)]
    pub async fn run(self, mut shutdown: broadcast::Receiver<()>) {
        info!("frontend listener starting");

        let graceful = GracefulShutdown::new();

        loop {
            tokio::select! {
                accept_result = self.listener.accept() => {
                    match accept_result {
                        Ok((stream, addr)) => {
                            self.handle_connection(stream, addr, &graceful);
                        }
                        Err(e) => {
                            error!(error = %e, "failed to accept connection");
                        }
                    }
                }

                _ = shutdown.recv() => {
                    info!("frontend listener shutting down");
                    break;
                }
            }
        }

        drop(self.listener);

        info!(
            grace = %humantime::format_duration(self.shutdown_grace),
            "waiting for in-flight requests"
        );
        if drain_with_grace(graceful.shutdown(), self.shutdown_grace).await {
            info!("all connections closed");
        }
    }

    /// Serve one client connection on its own task.
    fn handle_connection(&self, stream: TcpStream, client_addr: SocketAddr, graceful: &GracefulShutdown) {
        if let Err(e) = stream.set_nodelay(true) {
            warn!(error = %e, "failed to set TCP_NODELAY on client connection");
        }

        let handler = Arc::clone(&self.handler);
        let service = service_fn(move |req: Request<Incoming>| {
            let handler = Arc::clone(&handler);
            async move { Ok::<_, Infallible>(handler.handle(req, Some(client_addr)).await) }
        });

        let conn = http1::Builder::new()
            .timer(TokioTimer::new())
            .header_read_timeout(self.header_read_timeout)
            .keep_alive(true)
            .serve_connection(TokioIo::new(stream), service);
        let conn = graceful.watch(conn);

        tokio::spawn(async move {
            match conn.await {
                Ok(()) => debug!(client = %client_addr, "connection closed"),
                Err(e) => debug!(client = %client_addr, error = %e, "connection error"),
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::{Backend, BackendPool};
    use crate::metrics::MetricsCollector;
    use crate::proxy::{HttpTransport, RetryPolicy};
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    fn test_handler() -> Arc<LoadBalanceHandler<HttpTransport>> {
        let pool = BackendPool::new(vec![Backend::parse("http://127.0.0.1:9").unwrap()]).unwrap();
        // Nothing is alive, so every request is answered locally
        pool.backends()[0].set_alive(false);

        Arc::new(LoadBalanceHandler::new(
            Arc::new(pool),
            HttpTransport::new(Duration::from_millis(100), Duration::from_millis(100)),
            RetryPolicy::default(),
            MetricsCollector::new(),
        ))
    }

    #[tokio::test]
    async fn test_frontend_listener_bind() {
        let listener = FrontendListener::bind(
            "127.0.0.1:0".parse().unwrap(),
            test_handler(),
            &ProxyConfig::default(),
        )
        .await
        .unwrap();

        assert_ne!(listener.local_addr().unwrap().port(), 0);
    }

    #[tokio::test]
    async fn test_serves_and_shuts_down() {
        let listener = FrontendListener::bind(
            "127.0.0.1:0".parse().unwrap(),
            test_handler(),
            &ProxyConfig::default(),
        )
        .await
        .unwrap();
        let addr = listener.local_addr().unwrap();

        let (tx, rx) = broadcast::channel(1);
        let handle = tokio::spawn(listener.run(rx));

        let mut client = TcpStream::connect(addr).await.unwrap();
        client
            .write_all(b"GET / HTTP/1.1\r\nHost: lb\r\nConnection: close\r\n\r\n")
            .await
            .unwrap();
        let mut response = String::new();
        client.read_to_string(&mut response).await.unwrap();

        assert!(response.starts_with("HTTP/1.1 503"));
        assert!(response.contains("No backend available"));

        tx.send(()).unwrap();
        tokio::time::timeout(Duration::from_secs(2), handle)
            .await
            .expect("listener did not stop")
            .unwrap();

        // Socket is closed after shutdown
        assert!(TcpStream::connect(addr).await.is_err());
    }
}
