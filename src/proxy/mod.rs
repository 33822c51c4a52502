//! Request forwarding, retries, and failover.
//!
//! [`LoadBalanceHandler`] picks a backend from the pool and hands the
//! request to a [`RequestForwarder`], which retries the same backend a
//! bounded number of times before marking it dead and failing over.

mod forwarder;
mod handler;
mod retry;
mod transport;

pub use forwarder::{BufferedRequest, ForwardOutcome, RequestForwarder};
pub use handler::{LoadBalanceHandler, ProxyError};
pub use retry::{RetryPolicy, RetryState};
pub use transport::{full_body, HttpTransport, ProxyBody, Transport, TransportError};
