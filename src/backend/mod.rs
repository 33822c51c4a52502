//! Upstream backends and the round-robin pool that selects between them.

mod pool;
mod upstream;

pub use pool::{BackendPool, PoolError};
pub use upstream::{Backend, BackendAddrError};
