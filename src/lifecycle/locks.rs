//! Per-instance mutual exclusion.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};

use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};

use crate::model::InstanceId;

/// Hands out one async lock per instance id. Entries nobody holds are
/// pruned on the next acquisition.
#[derive(Clone, Debug, Default)]
pub struct InstanceLocks {
    locks: Arc<Mutex<HashMap<InstanceId, Arc<AsyncMutex<()>>>>>,
}

impl InstanceLocks {
    /// Waits until no other holder operates on `instance_id`.
    pub async fn acquire(&self, instance_id: &InstanceId) -> OwnedMutexGuard<()> {
        let lock = {
            let mut locks = self.locks.lock().unwrap_or_else(PoisonError::into_inner);
            locks.retain(|_, lock| Arc::strong_count(lock) > 1);
            Arc::clone(locks.entry(instance_id.clone()).or_default())
        };
        lock.lock_owned().await
    }

    #[cfg(test)]
    fn tracked(&self) -> usize {
        self.locks
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }
}
