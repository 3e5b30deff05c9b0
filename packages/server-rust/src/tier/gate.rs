//! Per-bucket ordering for tier work.
//!
//! Bucket work takes the global lock shared, then its stripe's mutex. Global
//! work takes the global lock exclusively, which orders it against all
//! bucket work. Both tokio locks queue waiters FIFO, so work entering the
//! same stripe runs in arrival order.

use tiercache_core::hash::stripe_for;
use tokio::sync::{Mutex, MutexGuard, RwLock, RwLockReadGuard, RwLockWriteGuard};

use crate::replication::ConcurrencyKey;

/// Held for the duration of one ordered unit of work.
#[must_use = "ordering is released when the guard is dropped"]
pub enum GateGuard<'a> {
    Bucket {
        _global: RwLockReadGuard<'a, ()>,
        _stripe: MutexGuard<'a, ()>,
    },
    Global(RwLockWriteGuard<'a, ()>),
}

/// Striped async ordering gate.
pub struct OrderingGate {
    global: RwLock<()>,
    stripes: Vec<Mutex<()>>,
}

impl OrderingGate {
    /// Creates a gate with `stripes` bucket lanes (at least one).
    #[must_use]
    pub fn new(stripes: usize) -> Self {
        Self {
            global: RwLock::new(()),
            stripes: (0..stripes.max(1)).map(|_| Mutex::new(())).collect(),
        }
    }

    #[must_use]
    pub fn stripe_count(&self) -> usize {
        self.stripes.len()
    }

    /// Waits for the ordering slot of `key`.
    pub async fn enter(&self, key: ConcurrencyKey) -> GateGuard<'_> {
        match key {
            ConcurrencyKey::Bucket(bucket) => {
                let global = self.global.read().await;
                let stripe = self.stripes[stripe_for(bucket, self.stripes.len())]
                    .lock()
                    .await;
                GateGuard::Bucket {
                    _global: global,
                    _stripe: stripe,
                }
            }
            ConcurrencyKey::Global => GateGuard::Global(self.global.write().await),
        }
    }
}
