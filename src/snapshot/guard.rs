//! Pending rowset guards
//!
//! A rowset id is "pending" while its files sit on disk but the tablet meta
//! does not reference it yet. The orphan sweeper skips pending ids.

use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;

use crate::tablet::RowsetId;

/// Set of rowset ids whose files must not be swept
#[derive(Debug, Default)]
pub struct PendingRowsetSet {
    ids: Mutex<HashMap<RowsetId, usize>>,
}

impl PendingRowsetSet {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Mark `rowset_id` pending until the returned guard drops
    pub fn add(self: &Arc<Self>, rowset_id: RowsetId) -> PendingRowsetGuard {
        *self.ids.lock().entry(rowset_id).or_insert(0) += 1;
        PendingRowsetGuard {
            set: Arc::clone(self),
            rowset_id,
        }
    }

    pub fn contains(&self, rowset_id: &RowsetId) -> bool {
        self.ids.lock().contains_key(rowset_id)
    }

    pub fn len(&self) -> usize {
        self.ids.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn remove(&self, rowset_id: &RowsetId) {
        let mut ids = self.ids.lock();
        if let Some(count) = ids.get_mut(rowset_id) {
            *count -= 1;
            if *count == 0 {
                ids.remove(rowset_id);
            }
        }
    }
}

/// Keeps one rowset id pending while alive
#[derive(Debug)]
pub struct PendingRowsetGuard {
    set: Arc<PendingRowsetSet>,
    rowset_id: RowsetId,
}

impl PendingRowsetGuard {
    pub fn rowset_id(&self) -> RowsetId {
        self.rowset_id
    }
}

impl Drop for PendingRowsetGuard {
    fn drop(&mut self) {
        self.set.remove(&self.rowset_id);
    }
}
