use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};
use tokio::sync::{Mutex as RowMutex, OwnedMutexGuard};
use uuid::Uuid;

const PRUNE_THRESHOLD: usize = 1024;

/// Per-row pessimistic locks shared by the storage adapters.
///
/// `acquire` waits until no other task holds the row; the returned guard keeps
/// it until dropped.
#[derive(Default, Clone)]
pub struct RowLocks {
    rows: Arc<Mutex<HashMap<Uuid, Arc<RowMutex<()>>>>>,
}

impl RowLocks {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn acquire(&self, id: Uuid) -> OwnedMutexGuard<()> {
        let row = {
            let mut rows = self.rows.lock().unwrap_or_else(PoisonError::into_inner);
            if rows.len() > PRUNE_THRESHOLD {
                // Nobody holds or waits on a lock whose only reference is the map's.
                rows.retain(|_, row| Arc::strong_count(row) > 1);
            }
            rows.entry(id).or_default().clone()
        };
        row.lock_owned().await
    }
}
