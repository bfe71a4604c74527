use thiserror::Error;

use crate::slots::{SlotError, VatSlot};

/// Failure taxonomy of the ledger and transcript layers.
///
/// `MissingKey`, `Inconsistent`, `KernelBug` and `UnreachableImport` are
/// fatal: they mean persisted invariants are already broken and the affected
/// vat (or the kernel) must halt rather than continue on corrupt
/// bookkeeping. `OptionConflict`, `Slot` and the allocation errors are
/// caller-input validation, surfaced synchronously and never retried here.
#[derive(Debug, Error)]
pub enum KernelError {
    #[error("store error: {0}")]
    Store(#[from] vat_store::StoreError),
    #[error("bad slot: {0}")]
    Slot(#[from] SlotError),
    #[error("transcript decode error: {0}")]
    Decode(#[from] serde_json::Error),
    #[error("missing required key '{0}'")]
    MissingKey(String),
    #[error("'required' and 'require_new' are mutually exclusive")]
    OptionConflict,
    #[error("slot {0} not in c-list")]
    NotFound(String),
    #[error("vats may not export device nodes ({0})")]
    InvalidExport(VatSlot),
    #[error("unknown vat slot {0}")]
    UnknownVatSlot(VatSlot),
    #[error("vat slot {0} is already allocated")]
    AlreadyAllocated(VatSlot),
    #[error("vat tried to access unreachable import {0}")]
    UnreachableImport(VatSlot),
    #[error("vat sent invalid syscall: {0}")]
    InvalidSyscall(String),
    #[error("kernel bug: {0}")]
    KernelBug(String),
    #[error("inconsistent persisted state: {0}")]
    Inconsistent(String),
    #[error("snapshot error: {0}")]
    Snapshot(String),
}
