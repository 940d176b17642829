use std::sync::Arc;

use parking_lot::Mutex;
use rustc_hash::FxHashMap;
use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};

use crate::model::SliceId;

/// One async mutex per slice id. Holding the guard serialises every lifecycle transition of
/// that slice.
#[derive(Debug, Default)]
pub(crate) struct SliceLocks {
    locks: Mutex<FxHashMap<SliceId, Arc<AsyncMutex<()>>>>,
}

impl SliceLocks {
    pub(crate) async fn lock(&self, id: SliceId) -> OwnedMutexGuard<()> {
        let lock = Arc::clone(self.locks.lock().entry(id).or_default());
        lock.lock_owned().await
    }

    /// Drops the lock of a slice that no longer exists. Tasks already waiting on it keep their
    /// handle and still get it in order.
    pub(crate) fn forget(&self, id: &SliceId) {
        self.locks.lock().remove(id);
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;

    #[tokio::test]
    async fn serialises_per_slice() {
        let locks = Arc::new(SliceLocks::default());
        let (a, b) = (SliceId::new(), SliceId::new());

        let guard = locks.lock(a).await;

        // Another slice is independent.
        let other = tokio::time::timeout(Duration::from_millis(50), locks.lock(b)).await;
        assert!(other.is_ok());

        let waiter = {
            let locks = Arc::clone(&locks);
            tokio::spawn(async move { drop(locks.lock(a).await) })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!waiter.is_finished());

        drop(guard);
        waiter.await.unwrap();
    }
}
