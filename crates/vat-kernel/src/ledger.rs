//! Per-vat capability ledger: identifier allocators and the bidirectional
//! c-list translating kernel slots to vat slots, with the
//! reachable/recognizable refcount discipline that drives cross-vat GC.
//!
//! The c-list is persisted as two key families under `<vat>.c.`:
//! `<vat>.c.<kref>` holds the reachability flag plus the vat slot
//! (`"R o+12"` / `"_ o+12"`), and `<vat>.c.<vref>` holds the kref. Deleting
//! an entry always clears reachability before dropping the recognizable
//! share, so a crash between the two writes leaves the conservative
//! invariant (never under-count a live reference) intact.

use std::sync::Arc;

use vat_store::{KvStore, StreamPosition};

use crate::error::KernelError;
use crate::registry::{ObjectRegistry, RefCountFlags};
use crate::slots::{KernelSlot, SlotKind, VatId, VatSlot};

// Allocator seeds, chosen so vat-local ids can never be confused with any
// collateral numbering scheme.
const FIRST_OBJECT_ID: u64 = 50;
const FIRST_PROMISE_ID: u64 = 60;
const FIRST_DEVICE_ID: u64 = 70;

/// Options for the two mapping operations.
#[derive(Debug, Clone, Copy)]
pub struct MapOptions {
    /// Mark the entry reachable after resolution (exports), or insist it
    /// already is (imports).
    pub set_reachable: bool,
    /// Refuse to allocate a missing entry.
    pub required: bool,
    /// Insist the entry is newly allocated (exports only).
    pub require_new: bool,
}

impl Default for MapOptions {
    fn default() -> Self {
        Self { set_reachable: true, required: false, require_new: false }
    }
}

impl MapOptions {
    /// Entry must already exist; do not touch reachability.
    pub fn required() -> Self {
        Self { set_reachable: false, required: true, require_new: false }
    }
}

fn build_reachable_and_vat_slot(reachable: bool, vslot: VatSlot) -> String {
    format!("{} {vslot}", if reachable { "R" } else { "_" })
}

fn parse_reachable_and_vat_slot(raw: &str) -> Result<(bool, VatSlot), KernelError> {
    let (flag, slot) = raw
        .split_once(' ')
        .ok_or_else(|| KernelError::Inconsistent(format!("malformed c-list value '{raw}'")))?;
    let reachable = match flag {
        "R" => true,
        "_" => false,
        _ => {
            return Err(KernelError::Inconsistent(format!(
                "malformed reachability flag in '{raw}'"
            )));
        }
    };
    Ok((reachable, slot.parse()?))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VatStats {
    pub object_count: u64,
    pub promise_count: u64,
    pub device_count: u64,
    pub transcript_count: u64,
}

/// Keeper of one vat's persistent capability state. All state lives in the
/// injected store; the ledger itself holds nothing but handles, so it can
/// be rebuilt cheaply from persisted state at any time.
pub struct VatLedger {
    vat_id: VatId,
    kv: Arc<dyn KvStore>,
    registry: Arc<dyn ObjectRegistry>,
}

/// Seeds a newly created vat's counters and transcript positions. Called
/// exactly once, at vat instantiation.
pub fn initialize_vat_state(kv: &dyn KvStore, vat_id: &VatId) -> Result<(), KernelError> {
    kv.set(&format!("{vat_id}.o.nextID"), &FIRST_OBJECT_ID.to_string())?;
    kv.set(&format!("{vat_id}.p.nextID"), &FIRST_PROMISE_ID.to_string())?;
    kv.set(&format!("{vat_id}.d.nextID"), &FIRST_DEVICE_ID.to_string())?;
    kv.set(&format!("{vat_id}.nextDeliveryNum"), "0")?;
    kv.set(&format!("{vat_id}.incarnationNumber"), "1")?;
    let start = serde_json::to_string(&StreamPosition::START)?;
    kv.set(&format!("{vat_id}.t.startPosition"), &start)?;
    kv.set(&format!("{vat_id}.t.endPosition"), &start)?;
    Ok(())
}

impl VatLedger {
    pub fn new(vat_id: VatId, kv: Arc<dyn KvStore>, registry: Arc<dyn ObjectRegistry>) -> Self {
        Self { vat_id, kv, registry }
    }

    pub fn vat_id(&self) -> &VatId {
        &self.vat_id
    }

    fn get_required(&self, key: &str) -> Result<String, KernelError> {
        self.kv
            .get(key)?
            .ok_or_else(|| KernelError::MissingKey(key.to_string()))
    }

    fn clist_key(&self, slot: impl ToString) -> String {
        format!("{}.c.{}", self.vat_id, slot.to_string())
    }

    fn reachable_and_vat_slot(&self, kslot: KernelSlot) -> Result<(bool, VatSlot), KernelError> {
        let raw = self.get_required(&self.clist_key(kslot))?;
        parse_reachable_and_vat_slot(&raw)
    }

    fn allocate_vat_slot_id(&self, kind: SlotKind) -> Result<u64, KernelError> {
        let key = format!("{}.{}.nextID", self.vat_id, kind.tag());
        let raw = self.get_required(&key)?;
        let id: u64 = raw
            .parse()
            .map_err(|_| KernelError::Inconsistent(format!("bad counter '{raw}' at '{key}'")))?;
        self.kv.set(&key, &(id + 1).to_string())?;
        Ok(id)
    }

    /// Kernel slot for a given vat slot, allocating a new kernel object or
    /// promise when the vat exports something for the first time. Exports
    /// are recorded recognizable-but-unreachable and then marked reachable
    /// via `set_reachable_flag`, which keeps every counter transition on
    /// the one code path. Imports must already be reachable: the kernel
    /// never lets a vat address an import it has not been granted.
    pub fn map_vat_slot_to_kernel_slot(
        &self,
        vslot: VatSlot,
        opts: MapOptions,
    ) -> Result<KernelSlot, KernelError> {
        if opts.required && opts.require_new {
            return Err(KernelError::OptionConflict);
        }
        let vat_key = self.clist_key(vslot);
        let kslot = match self.kv.get(&vat_key)? {
            Some(raw) => {
                if opts.require_new {
                    return Err(KernelError::AlreadyAllocated(vslot));
                }
                raw.parse::<KernelSlot>()?
            }
            None => {
                if opts.required {
                    return Err(KernelError::NotFound(vslot.to_string()));
                }
                if !vslot.allocated_by_vat {
                    // the vat didn't allocate it and the kernel didn't
                    // either (else it would be in the c-list), so it's bogus
                    return Err(KernelError::UnknownVatSlot(vslot));
                }
                let kslot = match vslot.kind {
                    SlotKind::Object => self.registry.add_kernel_object(&self.vat_id)?,
                    SlotKind::Promise => self.registry.add_kernel_promise(&self.vat_id)?,
                    SlotKind::Device => return Err(KernelError::InvalidExport(vslot)),
                };
                // count the exporting vat's recognizable share only; the
                // reachable count stays at zero until set_reachable_flag
                self.registry.increment_ref_count(
                    kslot,
                    &format!("{}|vk|clist", self.vat_id),
                    RefCountFlags { is_export: true, only_recognizable: true },
                )?;
                let kernel_key = self.clist_key(kslot);
                self.kv
                    .set(&kernel_key, &build_reachable_and_vat_slot(false, vslot))?;
                self.kv.set(&vat_key, &kslot.to_string())?;
                log::debug!("{}: add mapping v->k {kernel_key} <=> {vat_key}", self.vat_id);
                kslot
            }
        };

        if opts.set_reachable {
            if vslot.allocated_by_vat {
                self.set_reachable_flag(kslot)?;
            } else {
                let (is_reachable, _) = self.reachable_and_vat_slot(kslot)?;
                if !is_reachable {
                    return Err(KernelError::UnreachableImport(vslot));
                }
            }
        }
        Ok(kslot)
    }

    /// Vat slot for a given kernel slot, allocating the next vat-local id
    /// of the matching kind when the kernel imports the kref into this vat
    /// for the first time. Sending a non-reachable export back into its own
    /// exporting vat is a kernel bug: that direction must never require
    /// fresh allocation.
    pub fn map_kernel_slot_to_vat_slot(
        &self,
        kslot: KernelSlot,
        opts: MapOptions,
    ) -> Result<VatSlot, KernelError> {
        let kernel_key = self.clist_key(kslot);
        if !self.kv.has(&kernel_key)? {
            if opts.required {
                return Err(KernelError::NotFound(kslot.to_string()));
            }
            let id = self.allocate_vat_slot_id(kslot.kind)?;
            let vslot = VatSlot::import(kslot.kind, id);
            // import: count recognizable now, defer reachable to the
            // set_reachable_flag below
            self.registry.increment_ref_count(
                kslot,
                &format!("{}|kv|clist", self.vat_id),
                RefCountFlags { is_export: false, only_recognizable: true },
            )?;
            let vat_key = self.clist_key(vslot);
            self.kv.set(&vat_key, &kslot.to_string())?;
            self.kv
                .set(&kernel_key, &build_reachable_and_vat_slot(false, vslot))?;
            log::debug!("{}: add mapping k->v {kernel_key} <=> {vat_key}", self.vat_id);
        }

        let (is_reachable, vslot) = self.reachable_and_vat_slot(kslot)?;
        if opts.set_reachable {
            if !vslot.allocated_by_vat {
                self.set_reachable_flag(kslot)?;
            } else if !is_reachable {
                return Err(KernelError::KernelBug(format!(
                    "kernel sent unreachable export {kslot}"
                )));
            }
        }
        Ok(vslot)
    }

    /// Idempotent. Only object imports move the registry's reachable
    /// counter, and only on the false-to-true transition.
    pub fn set_reachable_flag(&self, kslot: KernelSlot) -> Result<(), KernelError> {
        let (was_reachable, vslot) = self.reachable_and_vat_slot(kslot)?;
        self.kv
            .set(&self.clist_key(kslot), &build_reachable_and_vat_slot(true, vslot))?;
        if !was_reachable && kslot.kind == SlotKind::Object && !vslot.allocated_by_vat {
            let mut counts = self.registry.object_ref_count(kslot)?;
            counts.reachable += 1;
            self.registry.set_object_ref_count(kslot, counts)?;
        }
        Ok(())
    }

    /// Idempotent. Clearing the last reachable import reference enqueues
    /// the kref as a GC candidate, exactly once per transition to zero.
    pub fn clear_reachable_flag(&self, kslot: KernelSlot) -> Result<(), KernelError> {
        let (was_reachable, vslot) = self.reachable_and_vat_slot(kslot)?;
        self.kv
            .set(&self.clist_key(kslot), &build_reachable_and_vat_slot(false, vslot))?;
        if was_reachable
            && kslot.kind == SlotKind::Object
            && !vslot.allocated_by_vat
            && self.registry.kernel_object_exists(kslot)
        {
            let mut counts = self.registry.object_ref_count(kslot)?;
            if counts.reachable == 0 {
                return Err(KernelError::Inconsistent(format!(
                    "reachable underflow clearing {kslot}"
                )));
            }
            counts.reachable -= 1;
            self.registry.set_object_ref_count(kslot, counts)?;
            if counts.reachable == 0 {
                self.registry.add_maybe_free_kref(kslot)?;
            }
        }
        Ok(())
    }

    pub fn reachable_flag(&self, kslot: KernelSlot) -> Result<bool, KernelError> {
        Ok(self.reachable_and_vat_slot(kslot)?.0)
    }

    /// True iff this vat holds `kslot` as an import.
    pub fn imports_kernel_slot(&self, kslot: KernelSlot) -> Result<bool, KernelError> {
        match self.kv.get(&self.clist_key(kslot))? {
            Some(raw) => {
                let (_, vslot) = parse_reachable_and_vat_slot(&raw)?;
                Ok(!vslot.allocated_by_vat)
            }
            None => Ok(false),
        }
    }

    pub fn has_kernel_mapping(&self, kslot: KernelSlot) -> Result<bool, KernelError> {
        Ok(self.kv.has(&self.clist_key(kslot))?)
    }

    pub fn has_vat_mapping(&self, vslot: VatSlot) -> Result<bool, KernelError> {
        Ok(self.kv.has(&self.clist_key(vslot))?)
    }

    /// Removes both halves of a c-list mapping. Reachability is cleared
    /// first so the counters stay consistent at every intermediate step,
    /// then the recognizable share is dropped. The kref may already be
    /// gone from the registry (the two sides of a drop can race); that is
    /// tolerated but logged, since silently swallowing a genuine
    /// accounting bug is the alternative risk.
    pub fn delete_clist_entry(
        &self,
        kslot: KernelSlot,
        vslot: VatSlot,
    ) -> Result<(), KernelError> {
        let kernel_key = self.clist_key(kslot);
        let vat_key = self.clist_key(vslot);
        if !self.kv.has(&kernel_key)? {
            return Err(KernelError::Inconsistent(format!(
                "delete of unmapped c-list entry {kslot}"
            )));
        }
        log::debug!("{}: delete mapping {kernel_key} <=> {vat_key}", self.vat_id);
        self.clear_reachable_flag(kslot)?;
        let fired = self.registry.decrement_ref_count(
            kslot,
            &format!("{}|del|clist", self.vat_id),
            RefCountFlags { is_export: vslot.allocated_by_vat, only_recognizable: true },
        )?;
        if !fired {
            log::warn!(
                "{}: recognizable decrement found {kslot} already gone (drop/retire race)",
                self.vat_id
            );
        }
        self.kv.delete(&kernel_key)?;
        self.kv.delete(&vat_key)?;
        Ok(())
    }

    pub fn delete_clist_entries_for_kernel_slots(
        &self,
        kslots: &[KernelSlot],
    ) -> Result<(), KernelError> {
        for &kslot in kslots {
            let vslot = self.map_kernel_slot_to_vat_slot(kslot, MapOptions::required())?;
            self.delete_clist_entry(kslot, vslot)?;
        }
        Ok(())
    }

    /// Monotonic per-vat delivery number, persisted across restarts.
    pub fn next_delivery_num(&self) -> Result<u64, KernelError> {
        let key = format!("{}.nextDeliveryNum", self.vat_id);
        let raw = self.get_required(&key)?;
        let num: u64 = raw
            .parse()
            .map_err(|_| KernelError::Inconsistent(format!("bad delivery number '{raw}'")))?;
        self.kv.set(&key, &(num + 1).to_string())?;
        Ok(num)
    }

    pub fn vat_stats(&self) -> Result<VatStats, KernelError> {
        let count = |key: &str, first: u64| -> Result<u64, KernelError> {
            let raw = self.get_required(key)?;
            let next: u64 = raw
                .parse()
                .map_err(|_| KernelError::Inconsistent(format!("bad counter '{raw}'")))?;
            next.checked_sub(first).ok_or_else(|| {
                KernelError::Inconsistent(format!("counter '{raw}' at '{key}' below its seed"))
            })
        };
        let start: StreamPosition =
            serde_json::from_str(&self.get_required(&format!("{}.t.startPosition", self.vat_id))?)?;
        let end: StreamPosition =
            serde_json::from_str(&self.get_required(&format!("{}.t.endPosition", self.vat_id))?)?;
        Ok(VatStats {
            object_count: count(&format!("{}.o.nextID", self.vat_id), FIRST_OBJECT_ID)?,
            promise_count: count(&format!("{}.p.nextID", self.vat_id), FIRST_PROMISE_ID)?,
            device_count: count(&format!("{}.d.nextID", self.vat_id), FIRST_DEVICE_ID)?,
            transcript_count: end.item_count - start.item_count,
        })
    }

    /// Debug dump of the c-list as `(kref, vref, reachable)` triples.
    pub fn dump_clist(&self) -> Result<Vec<(KernelSlot, VatSlot, bool)>, KernelError> {
        let prefix = format!("{}.c.k", self.vat_id);
        let mut entries = Vec::new();
        for key in self.kv.get_keys(&prefix)? {
            let kslot: KernelSlot = key[format!("{}.c.", self.vat_id).len()..].parse()?;
            let raw = self.get_required(&key)?;
            let (reachable, vslot) = parse_reachable_and_vat_slot(&raw)?;
            entries.push((kslot, vslot, reachable));
        }
        Ok(entries)
    }
}
