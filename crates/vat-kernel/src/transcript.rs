//! Durable, replayable history of a vat's inputs, plus heap-snapshot
//! bookkeeping and the reap countdown that triggers periodic GC cranks.
//!
//! The transcript is an append-only stream of `(delivery, syscalls)`
//! records bounded by persisted start/end positions. Replaying it from the
//! start position against a fresh ledger reproduces the vat's c-list and
//! counters exactly, which is what makes crash recovery deterministic.

use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use vat_store::{KvStore, SnapStore, StreamPosition, StreamStore};

use crate::error::KernelError;
use crate::message::{SyscallResult, VatDelivery, VatSyscall};
use crate::slots::VatId;

/// One syscall a vat issued during a delivery, with the result it saw.
/// Replay feeds the recorded result back instead of re-executing.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyscallRecord {
    pub syscall: VatSyscall,
    pub result: SyscallResult,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TranscriptEntry {
    pub delivery: VatDelivery,
    #[serde(default = "Vec::new")]
    pub syscalls: Vec<SyscallRecord>,
}

/// Most recent heap snapshot for a vat and the transcript position replay
/// resumes from when loading it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SnapshotRecord {
    pub snapshot_id: String,
    pub start_position: StreamPosition,
}

/// How often a vat should receive a GC-inducing delivery.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReapInterval {
    Never,
    Every(u64),
}

impl fmt::Display for ReapInterval {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ReapInterval::Never => f.write_str("never"),
            ReapInterval::Every(n) => write!(f, "{n}"),
        }
    }
}

impl FromStr for ReapInterval {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, String> {
        if s == "never" {
            return Ok(ReapInterval::Never);
        }
        match s.parse::<u64>() {
            Ok(n) if n > 0 => Ok(ReapInterval::Every(n)),
            _ => Err(format!("bad reap interval '{s}'")),
        }
    }
}

/// Something that can serialize a vat's heap on demand (the worker bridge,
/// in production).
pub trait SnapshotProducer {
    fn make_snapshot(&mut self) -> Result<Vec<u8>, KernelError>;
}

/// Keeper of one vat's transcript stream and snapshot records. Shares the
/// kv namespace with the ledger; holds only handles.
pub struct Transcript {
    vat_id: VatId,
    kv: Arc<dyn KvStore>,
    streams: Arc<dyn StreamStore>,
    snap_store: Option<Arc<dyn SnapStore>>,
}

impl Transcript {
    pub fn new(
        vat_id: VatId,
        kv: Arc<dyn KvStore>,
        streams: Arc<dyn StreamStore>,
        snap_store: Option<Arc<dyn SnapStore>>,
    ) -> Self {
        Self { vat_id, kv, streams, snap_store }
    }

    fn stream_name(&self) -> String {
        format!("transcript-{}", self.vat_id)
    }

    fn get_required(&self, key: &str) -> Result<String, KernelError> {
        self.kv
            .get(key)?
            .ok_or_else(|| KernelError::MissingKey(key.to_string()))
    }

    fn position(&self, which: &str) -> Result<StreamPosition, KernelError> {
        let raw = self.get_required(&format!("{}.t.{which}", self.vat_id))?;
        Ok(serde_json::from_str(&raw)?)
    }

    pub fn start_position(&self) -> Result<StreamPosition, KernelError> {
        self.position("startPosition")
    }

    pub fn end_position(&self) -> Result<StreamPosition, KernelError> {
        self.position("endPosition")
    }

    fn set_position(&self, which: &str, pos: StreamPosition) -> Result<(), KernelError> {
        let key = format!("{}.t.{which}", self.vat_id);
        self.kv.set(&key, &serde_json::to_string(&pos)?)?;
        Ok(())
    }

    /// Appends an entry at the persisted end position and advances it.
    /// Entries are never mutated or reordered afterwards.
    pub fn add_to_transcript(&self, entry: &TranscriptEntry) -> Result<(), KernelError> {
        let old_end = self.end_position()?;
        let bytes = serde_json::to_vec(entry)?;
        let new_end = self
            .streams
            .write_stream_item(&self.stream_name(), &bytes, old_end)?;
        self.set_position("endPosition", new_end)
    }

    /// Lazy reader over `[start, end)`. Defaults to the persisted start
    /// position; pass an explicit position to resume mid-replay (e.g.
    /// from a snapshot's start position).
    pub fn read_transcript(
        &self,
        start: Option<StreamPosition>,
    ) -> Result<TranscriptIter, KernelError> {
        let position = match start {
            Some(pos) => pos,
            None => self.start_position()?,
        };
        Ok(TranscriptIter {
            streams: self.streams.clone(),
            stream: self.stream_name(),
            position,
            end: self.end_position()?,
        })
    }

    /// `(total entries, entries already covered by the last snapshot)`.
    pub fn transcript_snapshot_stats(&self) -> Result<(u64, u64), KernelError> {
        let total = self.end_position()?.item_count;
        let snapshotted = self
            .last_snapshot()?
            .map(|s| s.start_position.item_count)
            .unwrap_or(0);
        Ok((total, snapshotted))
    }

    fn last_snapshot_key(&self) -> String {
        format!("local.{}.lastSnapshot", self.vat_id)
    }

    pub fn last_snapshot(&self) -> Result<Option<SnapshotRecord>, KernelError> {
        match self.kv.get(&self.last_snapshot_key())? {
            Some(raw) => Ok(Some(serde_json::from_str(&raw)?)),
            None => Ok(None),
        }
    }

    fn consumers_key(snapshot_id: &str) -> String {
        format!("local.snapshot.{snapshot_id}")
    }

    /// Registers this vat as a consumer of a snapshot. Idempotent: a vat
    /// re-saving an identical heap image must not double-count itself.
    /// Consumer lists are assumed short (usually length one).
    pub fn add_to_snapshot(&self, snapshot_id: &str) -> Result<(), KernelError> {
        let key = Self::consumers_key(snapshot_id);
        let mut consumers: Vec<String> = match self.kv.get(&key)? {
            Some(raw) => serde_json::from_str(&raw)?,
            None => Vec::new(),
        };
        let vat = self.vat_id.to_string();
        if !consumers.contains(&vat) {
            consumers.push(vat);
            self.kv.set(&key, &serde_json::to_string(&consumers)?)?;
        }
        Ok(())
    }

    /// Removes this vat from a snapshot's consumer list, returning the
    /// remaining consumer count. A missing list or a vat that was never
    /// registered means the bookkeeping is corrupt.
    pub fn remove_from_snapshot(&self, snapshot_id: &str) -> Result<usize, KernelError> {
        let key = Self::consumers_key(snapshot_id);
        let raw = self.kv.get(&key)?.ok_or_else(|| {
            KernelError::Inconsistent(format!(
                "cannot remove {}: no consumer list for snapshot {snapshot_id}",
                self.vat_id
            ))
        })?;
        let mut consumers: Vec<String> = serde_json::from_str(&raw)?;
        let vat = self.vat_id.to_string();
        let ix = consumers.iter().position(|c| *c == vat).ok_or_else(|| {
            KernelError::Inconsistent(format!(
                "{} is not a consumer of snapshot {snapshot_id}",
                self.vat_id
            ))
        })?;
        consumers.remove(ix);
        self.kv.set(&key, &serde_json::to_string(&consumers)?)?;
        Ok(consumers.len())
    }

    /// Asks the worker for a heap image and records it as the vat's latest
    /// snapshot. The superseded snapshot loses this vat's consumer slot
    /// and is scheduled for deletion when nobody else holds one. Returns
    /// false when snapshotting is disabled.
    pub fn save_snapshot(
        &self,
        producer: &mut dyn SnapshotProducer,
    ) -> Result<bool, KernelError> {
        let Some(snap_store) = &self.snap_store else {
            return Ok(false);
        };
        let bytes = producer.make_snapshot()?;
        let snapshot_id = snap_store.save(&bytes)?;

        if let Some(old) = self.last_snapshot()? {
            if old.snapshot_id != snapshot_id
                && self.remove_from_snapshot(&old.snapshot_id)? == 0
            {
                snap_store.prepare_to_delete(&old.snapshot_id)?;
            }
        }
        let record = SnapshotRecord {
            snapshot_id: snapshot_id.clone(),
            start_position: self.end_position()?,
        };
        self.kv
            .set(&self.last_snapshot_key(), &serde_json::to_string(&record)?)?;
        self.add_to_snapshot(&snapshot_id)?;
        log::debug!(
            "{}: heap snapshot {snapshot_id} at {:?}",
            self.vat_id,
            record.start_position
        );
        Ok(true)
    }

    /// On vat termination or rollback: releases the current snapshot's
    /// consumer slot and abandons the replay history for the discarded
    /// state by advancing the start position to the end position.
    pub fn remove_snapshot_and_transcript(&self) -> Result<(), KernelError> {
        if let Some(snap_store) = &self.snap_store {
            if let Some(record) = self.last_snapshot()? {
                if self.remove_from_snapshot(&record.snapshot_id)? == 0 {
                    snap_store.prepare_to_delete(&record.snapshot_id)?;
                }
                self.kv.delete(&self.last_snapshot_key())?;
            }
        }
        let end = self.end_position()?;
        self.set_position("startPosition", end)
    }

    pub fn init_reap_countdown(&self, interval: ReapInterval) -> Result<(), KernelError> {
        self.kv
            .set(&format!("{}.reapInterval", self.vat_id), &interval.to_string())?;
        self.kv
            .set(&format!("{}.reapCountdown", self.vat_id), &interval.to_string())?;
        Ok(())
    }

    pub fn update_reap_interval(&self, interval: ReapInterval) -> Result<(), KernelError> {
        self.kv
            .set(&format!("{}.reapInterval", self.vat_id), &interval.to_string())?;
        if interval == ReapInterval::Never {
            self.kv
                .set(&format!("{}.reapCountdown", self.vat_id), "never")?;
        }
        Ok(())
    }

    /// Decrements the persisted countdown. Returns true and resets to the
    /// configured interval when it reaches zero; always false for `never`.
    pub fn countdown_to_reap(&self) -> Result<bool, KernelError> {
        let countdown_key = format!("{}.reapCountdown", self.vat_id);
        let raw = self.get_required(&countdown_key)?;
        if raw == "never" {
            return Ok(false);
        }
        let count: u64 = raw
            .parse()
            .map_err(|_| KernelError::Inconsistent(format!("bad reap countdown '{raw}'")))?;
        if count <= 1 {
            let interval = self.get_required(&format!("{}.reapInterval", self.vat_id))?;
            self.kv.set(&countdown_key, &interval)?;
            Ok(true)
        } else {
            self.kv.set(&countdown_key, &(count - 1).to_string())?;
            Ok(false)
        }
    }

    pub fn incarnation_number(&self) -> Result<u64, KernelError> {
        let raw = self.get_required(&format!("{}.incarnationNumber", self.vat_id))?;
        raw.parse()
            .map_err(|_| KernelError::Inconsistent(format!("bad incarnation number '{raw}'")))
    }

    /// Bumped on vat upgrade so otherwise-identical replayed deliveries
    /// from different incarnations stay distinguishable.
    pub fn inc_incarnation_number(&self) -> Result<u64, KernelError> {
        let next = self.incarnation_number()? + 1;
        self.kv
            .set(&format!("{}.incarnationNumber", self.vat_id), &next.to_string())?;
        Ok(next)
    }
}

/// Lazy, finite, restartable reader over a transcript's persisted range.
pub struct TranscriptIter {
    streams: Arc<dyn StreamStore>,
    stream: String,
    position: StreamPosition,
    end: StreamPosition,
}

impl TranscriptIter {
    /// Position of the next entry; feed back into `read_transcript` to
    /// resume without re-reading.
    pub fn position(&self) -> StreamPosition {
        self.position
    }
}

impl Iterator for TranscriptIter {
    type Item = Result<TranscriptEntry, KernelError>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.position >= self.end {
            return None;
        }
        let item = match self.streams.read_stream_item(&self.stream, self.position) {
            Ok(bytes) => bytes,
            Err(err) => return Some(Err(err.into())),
        };
        self.position = self.position.next();
        Some(serde_json::from_slice(&item).map_err(KernelError::from))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ledger::initialize_vat_state;
    use crate::message::Delivery;
    use vat_store::{MemSnapStore, MemStore};

    struct FixedHeap(Vec<u8>);

    impl SnapshotProducer for FixedHeap {
        fn make_snapshot(&mut self) -> Result<Vec<u8>, KernelError> {
            Ok(self.0.clone())
        }
    }

    fn setup(snaps: Option<Arc<MemSnapStore>>) -> (Transcript, MemStore) {
        let store = MemStore::new();
        let vat_id = VatId::new("v1");
        initialize_vat_state(&store, &vat_id).unwrap();
        let transcript = Transcript::new(
            vat_id,
            Arc::new(store.clone()),
            Arc::new(store.clone()),
            snaps.map(|s| s as Arc<dyn SnapStore>),
        );
        (transcript, store)
    }

    fn entry(n: u64) -> TranscriptEntry {
        TranscriptEntry {
            delivery: Delivery::Message {
                target: crate::slots::VatSlot::import(crate::slots::SlotKind::Object, 50 + n),
                message: crate::message::Msg {
                    method: format!("m{n}"),
                    args: crate::message::CapData::new("[]", vec![]),
                    result: None,
                },
            },
            syscalls: vec![],
        }
    }

    #[test]
    fn append_advances_the_end_position() {
        let (transcript, _) = setup(None);
        transcript.add_to_transcript(&entry(0)).unwrap();
        transcript.add_to_transcript(&entry(1)).unwrap();
        assert_eq!(transcript.start_position().unwrap(), StreamPosition::START);
        assert_eq!(transcript.end_position().unwrap(), StreamPosition::new(2));
    }

    #[test]
    fn reader_is_lazy_finite_and_restartable() {
        let (transcript, _) = setup(None);
        for n in 0..4 {
            transcript.add_to_transcript(&entry(n)).unwrap();
        }

        let mut iter = transcript.read_transcript(None).unwrap();
        assert_eq!(iter.next().unwrap().unwrap(), entry(0));
        assert_eq!(iter.next().unwrap().unwrap(), entry(1));
        let resume_at = iter.position();
        drop(iter);

        let rest: Vec<_> = transcript
            .read_transcript(Some(resume_at))
            .unwrap()
            .map(|e| e.unwrap())
            .collect();
        assert_eq!(rest, vec![entry(2), entry(3)]);
    }

    #[test]
    fn snapshot_supersession_decrements_exactly_once() {
        let snaps = Arc::new(MemSnapStore::new());
        let (transcript, _) = setup(Some(snaps.clone()));
        transcript.add_to_transcript(&entry(0)).unwrap();

        assert!(transcript.save_snapshot(&mut FixedHeap(b"heap-a".to_vec())).unwrap());
        let a = transcript.last_snapshot().unwrap().unwrap();
        assert_eq!(a.start_position, StreamPosition::new(1));

        // same image again: idempotent, no deletion
        assert!(transcript.save_snapshot(&mut FixedHeap(b"heap-a".to_vec())).unwrap());
        assert!(snaps.deleted().is_empty());

        transcript.add_to_transcript(&entry(1)).unwrap();
        assert!(transcript.save_snapshot(&mut FixedHeap(b"heap-b".to_vec())).unwrap());
        let b = transcript.last_snapshot().unwrap().unwrap();
        assert_ne!(a.snapshot_id, b.snapshot_id);
        assert_eq!(b.start_position, StreamPosition::new(2));
        assert_eq!(snaps.deleted(), vec![a.snapshot_id]);
    }

    #[test]
    fn save_snapshot_without_store_is_a_no_op() {
        let (transcript, _) = setup(None);
        assert!(!transcript.save_snapshot(&mut FixedHeap(vec![1])).unwrap());
        assert!(transcript.last_snapshot().unwrap().is_none());
    }

    #[test]
    fn remove_snapshot_and_transcript_abandons_history() {
        let snaps = Arc::new(MemSnapStore::new());
        let (transcript, store) = setup(Some(snaps.clone()));
        transcript.add_to_transcript(&entry(0)).unwrap();
        transcript.save_snapshot(&mut FixedHeap(b"heap".to_vec())).unwrap();
        let id = transcript.last_snapshot().unwrap().unwrap().snapshot_id;

        transcript.remove_snapshot_and_transcript().unwrap();
        assert_eq!(snaps.deleted(), vec![id]);
        assert!(transcript.last_snapshot().unwrap().is_none());
        assert_eq!(
            transcript.start_position().unwrap(),
            transcript.end_position().unwrap()
        );
        assert!(store.get("local.v1.lastSnapshot").unwrap().is_none());
        assert_eq!(transcript.read_transcript(None).unwrap().count(), 0);
    }

    #[test]
    fn reap_countdown_fires_and_resets() {
        let (transcript, _) = setup(None);
        transcript.init_reap_countdown(ReapInterval::Every(3)).unwrap();
        assert!(!transcript.countdown_to_reap().unwrap());
        assert!(!transcript.countdown_to_reap().unwrap());
        assert!(transcript.countdown_to_reap().unwrap());
        // reset to the full interval
        assert!(!transcript.countdown_to_reap().unwrap());
    }

    #[test]
    fn reap_never_never_fires() {
        let (transcript, _) = setup(None);
        transcript.init_reap_countdown(ReapInterval::Never).unwrap();
        for _ in 0..5 {
            assert!(!transcript.countdown_to_reap().unwrap());
        }
        transcript.update_reap_interval(ReapInterval::Every(2)).unwrap();
        // countdown stays 'never' until re-initialized
        assert!(!transcript.countdown_to_reap().unwrap());
    }

    #[test]
    fn incarnation_number_bumps() {
        let (transcript, _) = setup(None);
        assert_eq!(transcript.incarnation_number().unwrap(), 1);
        assert_eq!(transcript.inc_incarnation_number().unwrap(), 2);
        assert_eq!(transcript.incarnation_number().unwrap(), 2);
    }

    #[test]
    fn stats_track_snapshotted_entries() {
        let snaps = Arc::new(MemSnapStore::new());
        let (transcript, _) = setup(Some(snaps));
        transcript.add_to_transcript(&entry(0)).unwrap();
        transcript.add_to_transcript(&entry(1)).unwrap();
        assert_eq!(transcript.transcript_snapshot_stats().unwrap(), (2, 0));
        transcript.save_snapshot(&mut FixedHeap(b"h".to_vec())).unwrap();
        assert_eq!(transcript.transcript_snapshot_stats().unwrap(), (2, 2));
    }

    #[test]
    fn missing_positions_are_fatal() {
        let store = MemStore::new();
        let transcript = Transcript::new(
            VatId::new("v9"),
            Arc::new(store.clone()),
            Arc::new(store),
            None,
        );
        let err = transcript.end_position().unwrap_err();
        assert!(matches!(err, KernelError::MissingKey(_)));
    }

    #[test]
    fn reap_countdown_interval_change_applies_after_trigger() {
        let (transcript, _) = setup(None);
        transcript.init_reap_countdown(ReapInterval::Every(1)).unwrap();
        assert!(transcript.countdown_to_reap().unwrap());
        transcript.update_reap_interval(ReapInterval::Every(2)).unwrap();
        // countdown was reset to 1 before the update, fires once more,
        // then adopts the new interval
        assert!(transcript.countdown_to_reap().unwrap());
        assert!(!transcript.countdown_to_reap().unwrap());
        assert!(transcript.countdown_to_reap().unwrap());
    }
}
