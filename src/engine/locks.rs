use std::hash::Hash;
use std::sync::Arc;

use dashmap::DashMap;
use tokio::sync::{Mutex, OwnedMutexGuard};

/// Per-key exclusive locks, the in-process stand-in for row locks.
/// Guards are owned so they can be held across `.await` and dropped in any order.
pub struct RowLocks<K: Eq + Hash + Clone> {
    rows: DashMap<K, Arc<Mutex<()>>>,
}

impl<K: Eq + Hash + Clone> Default for RowLocks<K> {
    fn default() -> Self {
        Self {
            rows: DashMap::new(),
        }
    }
}

impl<K: Eq + Hash + Clone> RowLocks<K> {
    fn row(&self, key: &K) -> Arc<Mutex<()>> {
        self.rows
            .entry(key.clone())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .value()
            .clone()
    }

    /// Wait until the row is free.
    pub async fn lock(&self, key: &K) -> OwnedMutexGuard<()> {
        self.row(key).lock_owned().await
    }

    /// Claim the row or fail immediately.
    pub fn try_lock(&self, key: &K) -> Option<OwnedMutexGuard<()>> {
        self.row(key).try_lock_owned().ok()
    }

    /// Drop rows nobody holds or waits on.
    pub fn prune(&self) -> usize {
        let before = self.rows.len();
        self.rows.retain(|_, m| Arc::strong_count(m) > 1);
        before - self.rows.len()
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }
}
