use std::sync::{Arc, Mutex};

use crate::{KvStore, StoreResult, StoreState, StreamPosition, StreamStore};

/// In-memory store used by unit tests and single-process harnesses.
/// Cloning yields another handle on the same state; `fork` deep-copies.
#[derive(Debug, Default, Clone)]
pub struct MemStore {
    state: Arc<Mutex<StoreState>>,
}

impl MemStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Deep copy of the current state, as an independent store. Used to
    /// capture "persisted state S" for replay-determinism checks.
    pub fn fork(&self) -> Self {
        let state = self.state.lock().unwrap().clone();
        Self {
            state: Arc::new(Mutex::new(state)),
        }
    }

    /// Full kv dump in key order, for state-equality assertions.
    pub fn dump(&self) -> Vec<(String, String)> {
        let state = self.state.lock().unwrap();
        state
            .get_keys("")
            .into_iter()
            .map(|k| {
                let v = state.get(&k).unwrap_or_default();
                (k, v)
            })
            .collect()
    }
}

impl KvStore for MemStore {
    fn get(&self, key: &str) -> StoreResult<Option<String>> {
        Ok(self.state.lock().unwrap().get(key))
    }

    fn set(&self, key: &str, value: &str) -> StoreResult<()> {
        self.state.lock().unwrap().set(key, value);
        Ok(())
    }

    fn delete(&self, key: &str) -> StoreResult<()> {
        self.state.lock().unwrap().delete(key);
        Ok(())
    }

    fn get_keys(&self, prefix: &str) -> StoreResult<Vec<String>> {
        Ok(self.state.lock().unwrap().get_keys(prefix))
    }
}

impl StreamStore for MemStore {
    fn write_stream_item(
        &self,
        stream: &str,
        item: &[u8],
        position: StreamPosition,
    ) -> StoreResult<StreamPosition> {
        self.state
            .lock()
            .unwrap()
            .write_stream_item(stream, item, position)
    }

    fn read_stream_item(&self, stream: &str, position: StreamPosition) -> StoreResult<Vec<u8>> {
        self.state.lock().unwrap().read_stream_item(stream, position)
    }

    fn stream_end(&self, stream: &str) -> StoreResult<StreamPosition> {
        Ok(self.state.lock().unwrap().stream_end(stream))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kv_round_trip_and_prefix_scan() {
        let store = MemStore::new();
        store.set("v1.o.nextID", "50").unwrap();
        store.set("v1.p.nextID", "60").unwrap();
        store.set("v2.o.nextID", "50").unwrap();

        assert_eq!(store.get("v1.o.nextID").unwrap().as_deref(), Some("50"));
        assert!(store.has("v1.p.nextID").unwrap());

        let keys = store.get_keys("v1.").unwrap();
        assert_eq!(keys, vec!["v1.o.nextID".to_string(), "v1.p.nextID".to_string()]);

        store.delete("v1.o.nextID").unwrap();
        assert!(!store.has("v1.o.nextID").unwrap());
    }

    #[test]
    fn stream_positions_are_item_counts() {
        let store = MemStore::new();
        let p0 = StreamPosition::START;
        let p1 = store.write_stream_item("t-v1", b"one", p0).unwrap();
        let p2 = store.write_stream_item("t-v1", b"two", p1).unwrap();
        assert_eq!(p2, StreamPosition::new(2));
        assert_eq!(store.stream_end("t-v1").unwrap(), p2);
        assert_eq!(store.read_stream_item("t-v1", p0).unwrap(), b"one");
        assert_eq!(store.read_stream_item("t-v1", p1).unwrap(), b"two");
    }

    #[test]
    fn writing_before_end_truncates_abandoned_tail() {
        let store = MemStore::new();
        let p0 = StreamPosition::START;
        let p1 = store.write_stream_item("t", b"a", p0).unwrap();
        store.write_stream_item("t", b"b", p1).unwrap();

        let end = store.write_stream_item("t", b"c", p1).unwrap();
        assert_eq!(end, StreamPosition::new(2));
        assert_eq!(store.read_stream_item("t", p1).unwrap(), b"c");
    }

    #[test]
    fn write_past_end_is_rejected() {
        let store = MemStore::new();
        let err = store
            .write_stream_item("t", b"x", StreamPosition::new(3))
            .unwrap_err();
        assert!(matches!(err, crate::StoreError::BadStreamPosition { .. }));
    }

    #[test]
    fn fork_is_independent() {
        let store = MemStore::new();
        store.set("k", "v").unwrap();
        let forked = store.fork();
        store.set("k", "changed").unwrap();
        assert_eq!(forked.get("k").unwrap().as_deref(), Some("v"));
    }
}
