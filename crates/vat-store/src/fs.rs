use std::fs::{self, File, OpenOptions};
use std::io::{ErrorKind, Read, Write};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use serde::{Deserialize, Serialize};

use crate::{io_error, KvStore, StoreError, StoreResult, StoreState, StreamPosition, StreamStore};

const STORE_DIR: &str = "store";
const STORE_FILE: &str = "store.log";

/// Filesystem-backed store. Every mutation is appended to a length-prefixed
/// CBOR op-log and synced before the call returns; opening replays the log
/// to rebuild the full state. A truncated or garbled tail is a hard error,
/// never silently skipped.
#[derive(Debug, Clone)]
pub struct FsStore {
    inner: Arc<Mutex<FsInner>>,
}

#[derive(Debug)]
struct FsInner {
    path: PathBuf,
    file: File,
    state: StoreState,
}

#[derive(Debug, Serialize, Deserialize)]
enum OpRecord {
    Set { key: String, value: String },
    Delete { key: String },
    Append { stream: String, item: Vec<u8> },
    Truncate { stream: String, len: u64 },
}

impl FsStore {
    pub fn open(root: impl AsRef<Path>) -> StoreResult<Self> {
        let dir = root.as_ref().join(STORE_DIR);
        fs::create_dir_all(&dir).map_err(|e| io_error(&dir, e))?;
        let path = dir.join(STORE_FILE);
        if !path.exists() {
            File::create(&path).map_err(|e| io_error(&path, e))?;
        }

        let mut state = StoreState::default();
        for record in read_all_records(&path)? {
            apply_record(&mut state, record)?;
        }

        let file = OpenOptions::new()
            .append(true)
            .open(&path)
            .map_err(|e| io_error(&path, e))?;
        Ok(Self {
            inner: Arc::new(Mutex::new(FsInner { path, file, state })),
        })
    }

    pub fn path(&self) -> PathBuf {
        self.inner.lock().unwrap().path.clone()
    }
}

impl FsInner {
    fn append_record(&mut self, record: &OpRecord) -> StoreResult<()> {
        let bytes = serde_cbor::to_vec(record)?;
        let len = bytes.len();
        if len > u32::MAX as usize {
            return Err(StoreError::Corrupt("record larger than 4GiB".into()));
        }
        self.file
            .write_all(&(len as u32).to_le_bytes())
            .and_then(|()| self.file.write_all(&bytes))
            .and_then(|()| self.file.sync_all())
            .map_err(|e| io_error(&self.path, e))
    }
}

fn apply_record(state: &mut StoreState, record: OpRecord) -> StoreResult<()> {
    match record {
        OpRecord::Set { key, value } => state.set(&key, &value),
        OpRecord::Delete { key } => state.delete(&key),
        OpRecord::Append { stream, item } => {
            let end = state.stream_end(&stream);
            state.write_stream_item(&stream, &item, end)?;
        }
        OpRecord::Truncate { stream, len } => {
            state
                .truncate_stream(&stream, len)
                .map_err(|_| StoreError::Corrupt(format!("truncate of '{stream}' past end")))?;
        }
    }
    Ok(())
}

fn read_all_records(path: &Path) -> StoreResult<Vec<OpRecord>> {
    let mut file = File::open(path).map_err(|e| io_error(path, e))?;
    let mut records = Vec::new();
    loop {
        let mut len_buf = [0u8; 4];
        let read = file.read(&mut len_buf).map_err(|e| io_error(path, e))?;
        if read == 0 {
            break;
        }
        if read < len_buf.len() {
            return Err(StoreError::Corrupt(format!(
                "truncated length header (read {read} bytes)"
            )));
        }
        let len = u32::from_le_bytes(len_buf) as usize;
        let mut buf = vec![0u8; len];
        if let Err(err) = file.read_exact(&mut buf) {
            if err.kind() == ErrorKind::UnexpectedEof {
                return Err(StoreError::Corrupt("truncated record payload".into()));
            }
            return Err(io_error(path, err));
        }
        records.push(serde_cbor::from_slice(&buf)?);
    }
    Ok(records)
}

impl KvStore for FsStore {
    fn get(&self, key: &str) -> StoreResult<Option<String>> {
        Ok(self.inner.lock().unwrap().state.get(key))
    }

    fn set(&self, key: &str, value: &str) -> StoreResult<()> {
        let mut inner = self.inner.lock().unwrap();
        inner.append_record(&OpRecord::Set {
            key: key.to_string(),
            value: value.to_string(),
        })?;
        inner.state.set(key, value);
        Ok(())
    }

    fn delete(&self, key: &str) -> StoreResult<()> {
        let mut inner = self.inner.lock().unwrap();
        inner.append_record(&OpRecord::Delete {
            key: key.to_string(),
        })?;
        inner.state.delete(key);
        Ok(())
    }

    fn get_keys(&self, prefix: &str) -> StoreResult<Vec<String>> {
        Ok(self.inner.lock().unwrap().state.get_keys(prefix))
    }
}

impl StreamStore for FsStore {
    fn write_stream_item(
        &self,
        stream: &str,
        item: &[u8],
        position: StreamPosition,
    ) -> StoreResult<StreamPosition> {
        let mut inner = self.inner.lock().unwrap();
        let end = inner.state.stream_end(stream);
        if position > end {
            return Err(StoreError::BadStreamPosition {
                stream: stream.to_string(),
                position: position.item_count,
            });
        }
        if position < end {
            inner.append_record(&OpRecord::Truncate {
                stream: stream.to_string(),
                len: position.item_count,
            })?;
        }
        inner.append_record(&OpRecord::Append {
            stream: stream.to_string(),
            item: item.to_vec(),
        })?;
        inner.state.write_stream_item(stream, item, position)
    }

    fn read_stream_item(&self, stream: &str, position: StreamPosition) -> StoreResult<Vec<u8>> {
        self.inner
            .lock()
            .unwrap()
            .state
            .read_stream_item(stream, position)
    }

    fn stream_end(&self, stream: &str) -> StoreResult<StreamPosition> {
        Ok(self.inner.lock().unwrap().state.stream_end(stream))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn writes_and_recovers_state() {
        let tmp = TempDir::new().unwrap();
        {
            let store = FsStore::open(tmp.path()).unwrap();
            store.set("v1.o.nextID", "50").unwrap();
            store.set("v1.o.nextID", "51").unwrap();
            store.set("v1.doomed", "x").unwrap();
            store.delete("v1.doomed").unwrap();
            store
                .write_stream_item("transcript-v1", b"entry-0", StreamPosition::START)
                .unwrap();
        }

        let again = FsStore::open(tmp.path()).unwrap();
        assert_eq!(again.get("v1.o.nextID").unwrap().as_deref(), Some("51"));
        assert!(!again.has("v1.doomed").unwrap());
        assert_eq!(again.stream_end("transcript-v1").unwrap(), StreamPosition::new(1));
        assert_eq!(
            again
                .read_stream_item("transcript-v1", StreamPosition::START)
                .unwrap(),
            b"entry-0"
        );
    }

    #[test]
    fn detects_truncated_record() {
        let tmp = TempDir::new().unwrap();
        {
            let store = FsStore::open(tmp.path()).unwrap();
            store.set("key", "value").unwrap();
        }

        let log_path = tmp.path().join(STORE_DIR).join(STORE_FILE);
        let len = std::fs::metadata(&log_path).unwrap().len();
        let file = OpenOptions::new().write(true).open(&log_path).unwrap();
        file.set_len(len - 1).unwrap();

        let err = FsStore::open(tmp.path()).unwrap_err();
        assert!(matches!(err, StoreError::Corrupt(_)));
    }
}
