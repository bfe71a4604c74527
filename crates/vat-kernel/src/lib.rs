//! Per-vat capability bookkeeping for an actor-style execution kernel:
//! c-list translation between kernel and vat slot spaces, reachability
//! refcounting, and the replayable transcript / heap-snapshot records
//! that make vat restarts deterministic.

pub mod error;
pub mod ledger;
pub mod message;
pub mod registry;
pub mod slots;
pub mod transcript;
pub mod translate;

pub use error::KernelError;
pub use ledger::{initialize_vat_state, MapOptions, VatLedger, VatStats};
pub use message::{
    CapData, Delivery, DeliveryResult, DeliveryStatus, KernelDelivery, KernelSyscall, MeterUsage,
    Msg, Resolution, Syscall, SyscallResult, VatDelivery, VatSyscall,
};
pub use registry::{MemRegistry, ObjectRefCount, ObjectRegistry, RefCountFlags, SharedRegistry};
pub use slots::{KernelSlot, SlotKind, VatId, VatSlot};
pub use transcript::{
    ReapInterval, SnapshotProducer, SnapshotRecord, SyscallRecord, Transcript, TranscriptEntry,
    TranscriptIter,
};
pub use translate::{delivery_to_vat, syscall_to_kernel};
