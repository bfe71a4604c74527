use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};

use sha2::{Digest, Sha256};

use crate::{SnapStore, StoreError, StoreResult};

/// In-memory snapshot store. Ids are content hashes, so re-saving an
/// identical heap image yields the same id, mirroring the dedup behavior
/// the consumer accounting relies on.
#[derive(Debug, Default, Clone)]
pub struct MemSnapStore {
    inner: Arc<Mutex<SnapState>>,
}

#[derive(Debug, Default)]
struct SnapState {
    snapshots: BTreeMap<String, Vec<u8>>,
    deleted: Vec<String>,
}

impl MemSnapStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Snapshot ids passed to `prepare_to_delete`, in order. Test hook.
    pub fn deleted(&self) -> Vec<String> {
        self.inner.lock().unwrap().deleted.clone()
    }
}

impl SnapStore for MemSnapStore {
    fn save(&self, bytes: &[u8]) -> StoreResult<String> {
        let id = hex::encode(Sha256::digest(bytes));
        self.inner
            .lock()
            .unwrap()
            .snapshots
            .insert(id.clone(), bytes.to_vec());
        Ok(id)
    }

    fn has(&self, snapshot_id: &str) -> StoreResult<bool> {
        Ok(self.inner.lock().unwrap().snapshots.contains_key(snapshot_id))
    }

    fn load(&self, snapshot_id: &str) -> StoreResult<Vec<u8>> {
        self.inner
            .lock()
            .unwrap()
            .snapshots
            .get(snapshot_id)
            .cloned()
            .ok_or_else(|| StoreError::UnknownSnapshot(snapshot_id.to_string()))
    }

    fn prepare_to_delete(&self, snapshot_id: &str) -> StoreResult<()> {
        let mut inner = self.inner.lock().unwrap();
        if inner.snapshots.remove(snapshot_id).is_none() {
            return Err(StoreError::UnknownSnapshot(snapshot_id.to_string()));
        }
        inner.deleted.push(snapshot_id.to_string());
        Ok(())
    }
}
