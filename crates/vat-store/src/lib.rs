//! Durable-store abstractions for the vat kernel: an ordered key-value
//! store, append-only streams with stable read positions, and a heap
//! snapshot store, plus in-memory and filesystem backends.

mod fs;
mod mem;
mod snap;

pub use fs::FsStore;
pub use mem::MemStore;
pub use snap::MemSnapStore;

use std::collections::BTreeMap;
use std::io;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};

pub type StoreResult<T> = Result<T, StoreError>;

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("I/O error at {path:?}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("CBOR serialization error: {0}")]
    Cbor(#[from] serde_cbor::Error),
    #[error("corrupt store: {0}")]
    Corrupt(String),
    #[error("unknown stream '{0}'")]
    UnknownStream(String),
    #[error("stream '{stream}' has no item at position {position}")]
    BadStreamPosition { stream: String, position: u64 },
    #[error("unknown snapshot '{0}'")]
    UnknownSnapshot(String),
}

pub(crate) fn io_error(path: impl Into<PathBuf>, err: io::Error) -> StoreError {
    StoreError::Io {
        path: path.into(),
        source: err,
    }
}

/// Position of an item within an append-only stream. Positions are item
/// counts, so they stay valid across process restarts.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Default, Serialize, Deserialize,
)]
pub struct StreamPosition {
    #[serde(rename = "itemCount")]
    pub item_count: u64,
}

impl StreamPosition {
    pub const START: StreamPosition = StreamPosition { item_count: 0 };

    pub fn new(item_count: u64) -> Self {
        Self { item_count }
    }

    pub fn next(self) -> Self {
        Self {
            item_count: self.item_count + 1,
        }
    }
}

/// Ordered key-value store. Every mutation is a synchronous write to the
/// backing medium; backends use interior mutability so handles can be
/// shared among the per-vat keepers.
pub trait KvStore: Send + Sync {
    fn get(&self, key: &str) -> StoreResult<Option<String>>;
    fn set(&self, key: &str, value: &str) -> StoreResult<()>;
    fn delete(&self, key: &str) -> StoreResult<()>;
    fn has(&self, key: &str) -> StoreResult<bool> {
        Ok(self.get(key)?.is_some())
    }
    /// All keys beginning with `prefix`, in sorted order.
    fn get_keys(&self, prefix: &str) -> StoreResult<Vec<String>>;
}

/// Append-only per-stream log with stable read positions.
pub trait StreamStore: Send + Sync {
    /// Writes `item` at `position`. The position must not be past the
    /// current end of the stream; writing before the end truncates the
    /// abandoned tail first (used when replay history is discarded).
    fn write_stream_item(
        &self,
        stream: &str,
        item: &[u8],
        position: StreamPosition,
    ) -> StoreResult<StreamPosition>;

    fn read_stream_item(&self, stream: &str, position: StreamPosition) -> StoreResult<Vec<u8>>;

    /// Position one past the last written item.
    fn stream_end(&self, stream: &str) -> StoreResult<StreamPosition>;
}

/// Store for serialized vat heap snapshots, addressed by content hash.
pub trait SnapStore: Send + Sync {
    /// Saves a snapshot and returns its id. Saving identical bytes twice
    /// returns the same id.
    fn save(&self, bytes: &[u8]) -> StoreResult<String>;
    fn has(&self, snapshot_id: &str) -> StoreResult<bool>;
    fn load(&self, snapshot_id: &str) -> StoreResult<Vec<u8>>;
    /// Marks a snapshot with no remaining consumers for deletion.
    fn prepare_to_delete(&self, snapshot_id: &str) -> StoreResult<()>;
}

/// Shared kv + stream state used by both backends.
#[derive(Debug, Default, Clone)]
pub(crate) struct StoreState {
    kv: BTreeMap<String, String>,
    streams: BTreeMap<String, Vec<Vec<u8>>>,
}

impl StoreState {
    pub(crate) fn get(&self, key: &str) -> Option<String> {
        self.kv.get(key).cloned()
    }

    pub(crate) fn set(&mut self, key: &str, value: &str) {
        self.kv.insert(key.to_string(), value.to_string());
    }

    pub(crate) fn delete(&mut self, key: &str) {
        self.kv.remove(key);
    }

    pub(crate) fn get_keys(&self, prefix: &str) -> Vec<String> {
        self.kv
            .range(prefix.to_string()..)
            .take_while(|(k, _)| k.starts_with(prefix))
            .map(|(k, _)| k.clone())
            .collect()
    }

    pub(crate) fn write_stream_item(
        &mut self,
        stream: &str,
        item: &[u8],
        position: StreamPosition,
    ) -> StoreResult<StreamPosition> {
        let items = self.streams.entry(stream.to_string()).or_default();
        let at = position.item_count as usize;
        if at > items.len() {
            return Err(StoreError::BadStreamPosition {
                stream: stream.to_string(),
                position: position.item_count,
            });
        }
        items.truncate(at);
        items.push(item.to_vec());
        Ok(position.next())
    }

    pub(crate) fn read_stream_item(
        &self,
        stream: &str,
        position: StreamPosition,
    ) -> StoreResult<Vec<u8>> {
        let items = self
            .streams
            .get(stream)
            .ok_or_else(|| StoreError::UnknownStream(stream.to_string()))?;
        items
            .get(position.item_count as usize)
            .cloned()
            .ok_or_else(|| StoreError::BadStreamPosition {
                stream: stream.to_string(),
                position: position.item_count,
            })
    }

    pub(crate) fn truncate_stream(&mut self, stream: &str, len: u64) -> StoreResult<()> {
        let items = self.streams.entry(stream.to_string()).or_default();
        if len as usize > items.len() {
            return Err(StoreError::BadStreamPosition {
                stream: stream.to_string(),
                position: len,
            });
        }
        items.truncate(len as usize);
        Ok(())
    }

    pub(crate) fn stream_end(&self, stream: &str) -> StreamPosition {
        let count = self.streams.get(stream).map(Vec::len).unwrap_or(0);
        StreamPosition::new(count as u64)
    }
}
