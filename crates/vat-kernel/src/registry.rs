//! Kernel Object Registry interface: allocation of kernel-wide slots and
//! the canonical reachable/recognizable counters per object kref.
//!
//! The registry is global mutable state shared by every vat's ledger, so it
//! is always an injected collaborator, serialized by the one-crank-at-a-time
//! discipline rather than by locks of its own.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::{Arc, Mutex};

use serde::{Deserialize, Serialize};

use crate::error::KernelError;
use crate::slots::{KernelSlot, SlotKind, VatId};

/// Reference counts for an object kref. `recognizable` counts every vat
/// holding any c-list entry for the kref; `reachable` counts only vats that
/// can currently address it. `recognizable >= reachable` at all times.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ObjectRefCount {
    pub reachable: u64,
    pub recognizable: u64,
}

/// Options for refcount mutations. Object exports never contribute to the
/// `reachable` counter; `only_recognizable` updates skip it for imports too.
#[derive(Debug, Clone, Copy, Default)]
pub struct RefCountFlags {
    pub is_export: bool,
    pub only_recognizable: bool,
}

pub trait ObjectRegistry: Send + Sync {
    /// Allocates a fresh object kref owned by `owner`, with counts at zero.
    fn add_kernel_object(&self, owner: &VatId) -> Result<KernelSlot, KernelError>;

    /// Allocates a fresh promise kref decided by `decider`.
    fn add_kernel_promise(&self, decider: &VatId) -> Result<KernelSlot, KernelError>;

    fn kernel_object_exists(&self, kslot: KernelSlot) -> bool;

    fn increment_ref_count(
        &self,
        kslot: KernelSlot,
        tag: &str,
        flags: RefCountFlags,
    ) -> Result<(), KernelError>;

    /// Returns false when the kref was already gone, a benign race between
    /// the two sides of a drop, tolerated but worth auditing.
    fn decrement_ref_count(
        &self,
        kslot: KernelSlot,
        tag: &str,
        flags: RefCountFlags,
    ) -> Result<bool, KernelError>;

    fn object_ref_count(&self, kslot: KernelSlot) -> Result<ObjectRefCount, KernelError>;

    fn set_object_ref_count(
        &self,
        kslot: KernelSlot,
        counts: ObjectRefCount,
    ) -> Result<(), KernelError>;

    /// Enqueues a kref whose reachable count hit zero as a GC candidate.
    fn add_maybe_free_kref(&self, kslot: KernelSlot) -> Result<(), KernelError>;
}

pub type SharedRegistry = Arc<dyn ObjectRegistry>;

/// In-process registry backing single-node kernels and every test in this
/// workspace.
#[derive(Debug, Default)]
pub struct MemRegistry {
    state: Mutex<RegistryState>,
}

#[derive(Debug, Clone)]
struct RegistryState {
    next_object_id: u64,
    next_promise_id: u64,
    objects: BTreeMap<KernelSlot, ObjectRefCount>,
    promises: BTreeMap<KernelSlot, u64>,
    owners: BTreeMap<KernelSlot, VatId>,
    maybe_free: BTreeSet<KernelSlot>,
    missed_decrements: u64,
}

impl Default for RegistryState {
    fn default() -> Self {
        Self {
            next_object_id: 20,
            next_promise_id: 40,
            objects: BTreeMap::new(),
            promises: BTreeMap::new(),
            owners: BTreeMap::new(),
            maybe_free: BTreeSet::new(),
            missed_decrements: 0,
        }
    }
}

impl MemRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Deep copy of the current counters and queues, as an independent
    /// registry. Pairs with a forked store to capture a full kernel state
    /// for determinism checks.
    pub fn fork(&self) -> Self {
        let state = self.state.lock().unwrap().clone();
        Self { state: Mutex::new(state) }
    }

    /// How often a decrement found its kref already gone. Audit hook for
    /// the tolerated drop/retire race.
    pub fn missed_decrements(&self) -> u64 {
        self.state.lock().unwrap().missed_decrements
    }

    /// Drains the GC-candidate queue, in kref order.
    pub fn take_maybe_free_krefs(&self) -> Vec<KernelSlot> {
        let mut state = self.state.lock().unwrap();
        std::mem::take(&mut state.maybe_free).into_iter().collect()
    }

    /// Removes an object from the registry entirely, as kernel-side GC
    /// would. Lets tests exercise the decrement-after-removal tolerance.
    pub fn forget_object(&self, kslot: KernelSlot) {
        let mut state = self.state.lock().unwrap();
        state.objects.remove(&kslot);
        state.owners.remove(&kslot);
        state.maybe_free.remove(&kslot);
    }
}

fn check_counts(kslot: KernelSlot, counts: ObjectRefCount) -> Result<(), KernelError> {
    if counts.recognizable < counts.reachable {
        return Err(KernelError::Inconsistent(format!(
            "refcount invariant broken for {kslot}: reachable {} > recognizable {}",
            counts.reachable, counts.recognizable
        )));
    }
    Ok(())
}

impl ObjectRegistry for MemRegistry {
    fn add_kernel_object(&self, owner: &VatId) -> Result<KernelSlot, KernelError> {
        let mut state = self.state.lock().unwrap();
        let kslot = KernelSlot::object(state.next_object_id);
        state.next_object_id += 1;
        state.objects.insert(kslot, ObjectRefCount::default());
        state.owners.insert(kslot, owner.clone());
        Ok(kslot)
    }

    fn add_kernel_promise(&self, decider: &VatId) -> Result<KernelSlot, KernelError> {
        let mut state = self.state.lock().unwrap();
        let kslot = KernelSlot::promise(state.next_promise_id);
        state.next_promise_id += 1;
        state.promises.insert(kslot, 0);
        state.owners.insert(kslot, decider.clone());
        Ok(kslot)
    }

    fn kernel_object_exists(&self, kslot: KernelSlot) -> bool {
        self.state.lock().unwrap().objects.contains_key(&kslot)
    }

    fn increment_ref_count(
        &self,
        kslot: KernelSlot,
        tag: &str,
        flags: RefCountFlags,
    ) -> Result<(), KernelError> {
        let mut state = self.state.lock().unwrap();
        match kslot.kind {
            SlotKind::Promise => {
                let count = state.promises.entry(kslot).or_insert(0);
                *count += 1;
            }
            SlotKind::Object => {
                let counts = state.objects.get_mut(&kslot).ok_or_else(|| {
                    KernelError::Inconsistent(format!("increment of unknown kref {kslot} ({tag})"))
                })?;
                counts.recognizable += 1;
                if !flags.is_export && !flags.only_recognizable {
                    counts.reachable += 1;
                }
                check_counts(kslot, *counts)?;
            }
            SlotKind::Device => {}
        }
        Ok(())
    }

    fn decrement_ref_count(
        &self,
        kslot: KernelSlot,
        tag: &str,
        flags: RefCountFlags,
    ) -> Result<bool, KernelError> {
        let mut state = self.state.lock().unwrap();
        match kslot.kind {
            SlotKind::Promise => {
                let Some(count) = state.promises.get_mut(&kslot) else {
                    state.missed_decrements += 1;
                    return Ok(false);
                };
                if *count == 0 {
                    return Err(KernelError::Inconsistent(format!(
                        "promise refcount underflow for {kslot} ({tag})"
                    )));
                }
                *count -= 1;
            }
            SlotKind::Object => {
                let Some(counts) = state.objects.get_mut(&kslot) else {
                    state.missed_decrements += 1;
                    return Ok(false);
                };
                if counts.recognizable == 0 {
                    return Err(KernelError::Inconsistent(format!(
                        "recognizable underflow for {kslot} ({tag})"
                    )));
                }
                counts.recognizable -= 1;
                if !flags.is_export && !flags.only_recognizable {
                    if counts.reachable == 0 {
                        return Err(KernelError::Inconsistent(format!(
                            "reachable underflow for {kslot} ({tag})"
                        )));
                    }
                    counts.reachable -= 1;
                }
                check_counts(kslot, *counts)?;
            }
            SlotKind::Device => {}
        }
        Ok(true)
    }

    fn object_ref_count(&self, kslot: KernelSlot) -> Result<ObjectRefCount, KernelError> {
        self.state
            .lock()
            .unwrap()
            .objects
            .get(&kslot)
            .copied()
            .ok_or_else(|| KernelError::Inconsistent(format!("refcount of unknown kref {kslot}")))
    }

    fn set_object_ref_count(
        &self,
        kslot: KernelSlot,
        counts: ObjectRefCount,
    ) -> Result<(), KernelError> {
        check_counts(kslot, counts)?;
        let mut state = self.state.lock().unwrap();
        let entry = state.objects.get_mut(&kslot).ok_or_else(|| {
            KernelError::Inconsistent(format!("set refcount of unknown kref {kslot}"))
        })?;
        *entry = counts;
        Ok(())
    }

    fn add_maybe_free_kref(&self, kslot: KernelSlot) -> Result<(), KernelError> {
        self.state.lock().unwrap().maybe_free.insert(kslot);
        Ok(())
    }
}
