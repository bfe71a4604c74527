//! Transport layer between the kernel and an isolated worker process.
//!
//! Everything on the wire is a JSON tagged object. Commands flow down,
//! events flow up: a command eventually produces a `Reply`, but the worker
//! may interleave any number of `Upcall` events before it, each of which
//! blocks the worker until the kernel sends an upcall reply.

use serde::{Deserialize, Serialize};
use thiserror::Error;
use vat_kernel::{DeliveryStatus, MeterUsage, VatDelivery, VatId, VatSyscall};

/// Faults raised by the transport itself. The three metering variants are
/// per-delivery resource-budget violations; everything else means the
/// worker is gone and the vat must be restarted from persisted state.
#[derive(Debug, Error)]
pub enum TransportFault {
    #[error("worker exceeded its compute meter")]
    ComputeMeter,
    #[error("worker exceeded its stack meter")]
    StackMeter,
    #[error("worker exceeded its allocate meter")]
    AllocateMeter,
    #[error("worker terminated: {0}")]
    Terminated(String),
    #[error("worker transport I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl TransportFault {
    /// Metering faults are recoverable per delivery; the rest are not.
    pub fn is_metering(&self) -> bool {
        matches!(
            self,
            TransportFault::ComputeMeter
                | TransportFault::StackMeter
                | TransportFault::AllocateMeter
        )
    }
}

/// Terminal response to a command, with the meter reading the worker
/// attached to it (absent for unmetered workers and non-delivery commands).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandReply {
    pub reply: Vec<u8>,
    pub meter_usage: Option<MeterUsage>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WorkerEvent {
    /// The worker wants something from the kernel and is blocked on it.
    Upcall(Vec<u8>),
    /// The command is done.
    Reply(CommandReply),
}

/// Connection to one worker process. Implementations own process startup:
/// a worker launched against a saved heap snapshot comes up ready for
/// deliveries, one launched cold expects `setBundle` first.
pub trait WorkerTransport {
    fn send_command(&mut self, command: &[u8]) -> Result<(), TransportFault>;

    /// Blocks until the worker produces the next event for the command in
    /// flight.
    fn next_event(&mut self) -> Result<WorkerEvent, TransportFault>;

    /// Unblocks a worker waiting on the upcall it last issued.
    fn send_upcall_reply(&mut self, reply: &[u8]) -> Result<(), TransportFault>;

    /// Asks the worker to serialize its heap.
    fn make_snapshot(&mut self) -> Result<Vec<u8>, TransportFault>;
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase", rename_all_fields = "camelCase")]
pub enum Command {
    SetBundle {
        vat_id: VatId,
        bundle: String,
        options: serde_json::Value,
    },
    Deliver {
        delivery: VatDelivery,
    },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase", rename_all_fields = "camelCase")]
pub enum BundleReply {
    DispatchReady,
    Failure { name: String, message: String },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeliverReply {
    pub status: DeliveryStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub problem: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase", rename_all_fields = "camelCase")]
pub enum Upcall {
    Syscall {
        syscall: VatSyscall,
    },
    SourcedConsole {
        source: String,
        level: String,
        args: Vec<serde_json::Value>,
    },
    TestLog {
        args: Vec<serde_json::Value>,
    },
}

#[cfg(test)]
mod tests {
    use super::*;
    use vat_kernel::{SlotKind, Syscall, VatSlot};

    #[test]
    fn command_tags_are_camel_case() {
        let cmd = Command::SetBundle {
            vat_id: VatId::new("v1"),
            bundle: "code".into(),
            options: serde_json::json!({}),
        };
        let json = serde_json::to_value(&cmd).unwrap();
        assert_eq!(json["type"], "setBundle");
        assert_eq!(json["vatId"], "v1");
    }

    #[test]
    fn upcall_round_trip() {
        let up = Upcall::Syscall {
            syscall: Syscall::Subscribe {
                subject: VatSlot::import(SlotKind::Promise, 60),
            },
        };
        let json = serde_json::to_string(&up).unwrap();
        assert!(json.contains("\"syscall\""));
        let back: Upcall = serde_json::from_str(&json).unwrap();
        assert_eq!(back, up);
    }

    #[test]
    fn bundle_replies_decode() {
        let ready: BundleReply = serde_json::from_str(r#"{"type":"dispatchReady"}"#).unwrap();
        assert_eq!(ready, BundleReply::DispatchReady);
        let fail: BundleReply = serde_json::from_str(
            r#"{"type":"failure","name":"SyntaxError","message":"bad bundle"}"#,
        )
        .unwrap();
        assert!(matches!(fail, BundleReply::Failure { .. }));
    }

    #[test]
    fn metering_faults_are_classified() {
        assert!(TransportFault::ComputeMeter.is_metering());
        assert!(TransportFault::StackMeter.is_metering());
        assert!(TransportFault::AllocateMeter.is_metering());
        assert!(!TransportFault::Terminated("gone".into()).is_metering());
    }
}
