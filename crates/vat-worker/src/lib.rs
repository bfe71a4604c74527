//! Kernel-side bridge to isolated vat workers: ships deliveries, services
//! syscall/console/test-log upcalls, and classifies worker faults into
//! recoverable metering errors versus fatal transport failures.

pub mod bridge;
pub mod error;
pub mod transport;

pub use bridge::{SyscallHandler, WorkerBridge};
pub use error::WorkerError;
pub use transport::{
    BundleReply, Command, CommandReply, DeliverReply, TransportFault, Upcall, WorkerEvent,
    WorkerTransport,
};
