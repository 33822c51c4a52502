//! Health checking for backend servers.
//!
//! Two paths write backend liveness: the periodic active sweep and the
//! passive downgrade applied by the request path. Last write wins.

mod checker;
mod passive;

pub use checker::{HealthChecker, SweepSummary};
pub use passive::PassiveHealthTracker;
