//! simplelb - a round-robin HTTP load balancer
//!
//! This crate provides:
//! - Health-aware round-robin selection over a fixed backend pool
//! - Active (periodic TCP probe) and passive (failure-triggered) health checking
//! - Bounded same-backend retries and failover across backends
//! - Graceful shutdown
//! - Prometheus metrics

pub mod backend;
pub mod config;
pub mod frontend;
pub mod health;
pub mod metrics;
pub mod proxy;
pub mod util;

pub use config::Config;
