use std::sync::Arc;

use dashmap::DashMap;
use tokio::sync::{Mutex, OwnedMutexGuard};
use ulid::Ulid;

/// One async mutex per key, created on first use.
///
/// Serializes work on records that have no lock of their own. A resident
/// move pins the student first: the room they leave is only known after
/// reading their account, and room locks come after.
#[derive(Default)]
pub struct KeyedLocks {
    locks: DashMap<Ulid, Arc<Mutex<()>>>,
}

impl KeyedLocks {
    pub async fn lock(&self, key: Ulid) -> OwnedMutexGuard<()> {
        // Clone the Arc out so the shard guard is dropped before awaiting.
        let mutex = self.locks.entry(key).or_default().clone();
        mutex.lock_owned().await
    }

    pub fn forget(&self, key: &Ulid) {
        self.locks.remove(key);
    }

    #[cfg(test)]
    pub fn len(&self) -> usize {
        self.locks.len()
    }
}
