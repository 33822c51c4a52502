//! Round-robin backend pool with live-skip.

use crate::backend::Backend;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, warn};

/// Errors from pool construction.
#[derive(Debug, Error)]
pub enum PoolError {
    #[error("backend pool requires at least one backend")]
    Empty,
}

/// Ordered, fixed set of backends plus the shared rotation cursor.
///
/// The cursor is a lock-free counter independent of the per-backend liveness
/// locks. Only `cursor % len` is meaningful, so wraparound is harmless.
pub struct BackendPool {
    backends: Vec<Arc<Backend>>,
    cursor: AtomicU64,
}

impl BackendPool {
    /// Create a pool. Refuses an empty backend list.
    pub fn new(backends: Vec<Backend>) -> Result<Self, PoolError> {
        if backends.is_empty() {
            return Err(PoolError::Empty);
        }

        Ok(Self {
            backends: backends.into_iter().map(Arc::new).collect(),
            cursor: AtomicU64::new(0),
        })
    }

    /// Advance the cursor and return the new position modulo the pool size.
    pub fn next_index(&self) -> usize {
        let next = self.cursor.fetch_add(1, Ordering::Relaxed).wrapping_add(1);
        (next % self.backends.len() as u64) as usize
    }

    /// Pick the next alive backend in rotation order.
    ///
    /// Scans every slot once starting at [`next_index`](Self::next_index).
    /// When the first candidate is dead, the cursor is moved to the backend
    /// actually chosen so later calls do not re-skip the same dead entries.
    /// Concurrent moves race; the last store wins.
    pub fn get_next_backend(&self) -> Option<Arc<Backend>> {
        let len = self.backends.len();
        let start = self.next_index();

        for offset in 0..len {
            let idx = (start + offset) % len;
            let backend = &self.backends[idx];

            if backend.is_alive() {
                if offset != 0 {
                    self.cursor.store(idx as u64, Ordering::Relaxed);
                    debug!(
                        skipped = offset,
                        backend = %backend,
                        "skipped dead backends during selection"
                    );
                }
                return Some(Arc::clone(backend));
            }
        }

        warn!(backends = len, "no alive backend in pool");
        None
    }

    /// All backends in configuration order.
    pub fn backends(&self) -> &[Arc<Backend>] {
        &self.backends
    }

    pub fn len(&self) -> usize {
        self.backends.len()
    }

    /// Always false for a constructed pool; present for API symmetry with `len`.
    pub fn is_empty(&self) -> bool {
        self.backends.is_empty()
    }

    /// Number of backends currently marked alive.
    pub fn alive_count(&self) -> usize {
        self.backends.iter().filter(|b| b.is_alive()).count()
    }
}
