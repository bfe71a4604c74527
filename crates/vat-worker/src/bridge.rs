//! Kernel-side end of the worker protocol.
//!
//! The bridge turns the event-structured transport into plain call/response
//! pairs: `deliver` sends one command and services every upcall the worker
//! issues before replying, so from the caller's side a whole crank is a
//! single synchronous call.

use log::Level;
use vat_kernel::{DeliveryResult, KernelError, SnapshotProducer, SyscallResult, VatDelivery, VatId};

use crate::error::WorkerError;
use crate::transport::{
    BundleReply, Command, CommandReply, DeliverReply, TransportFault, Upcall, WorkerEvent,
    WorkerTransport,
};

/// Services syscall upcalls during a delivery. In production this is the
/// scheduler's handler, which translates through the vat's ledger and runs
/// the kernel-side effect; the worker blocks until it returns.
pub trait SyscallHandler {
    fn syscall(&mut self, syscall: vat_kernel::VatSyscall) -> SyscallResult;
}

pub struct WorkerBridge<T, H> {
    vat_id: VatId,
    transport: T,
    handler: H,
    test_log: Vec<String>,
}

impl<T: WorkerTransport, H: SyscallHandler> WorkerBridge<T, H> {
    pub fn new(vat_id: VatId, transport: T, handler: H) -> Self {
        Self { vat_id, transport, handler, test_log: Vec::new() }
    }

    /// One-time bundle load for a cold-started worker. Workers resumed
    /// from a heap snapshot skip this and accept deliveries immediately.
    pub fn load_bundle(
        &mut self,
        bundle: &str,
        options: serde_json::Value,
    ) -> Result<(), WorkerError> {
        let command = Command::SetBundle {
            vat_id: self.vat_id.clone(),
            bundle: bundle.to_string(),
            options,
        };
        let reply = self.command_round_trip(&command)?;
        match serde_json::from_slice::<BundleReply>(&reply.reply)? {
            BundleReply::DispatchReady => Ok(()),
            BundleReply::Failure { name, message } => {
                Err(WorkerError::BundleLoadFailed { name, message })
            }
        }
    }

    /// Ships one delivery and services its syscalls. Metering faults come
    /// back as an `error` result so the crank loop continues; any other
    /// transport fault propagates, meaning the worker must be restarted.
    pub fn deliver(&mut self, delivery: VatDelivery) -> Result<DeliveryResult, WorkerError> {
        let command = Command::Deliver { delivery };
        let reply = match self.command_round_trip(&command) {
            Ok(reply) => reply,
            Err(WorkerError::Transport(fault)) if fault.is_metering() => {
                log::warn!("{}: delivery hit meter: {fault}", self.vat_id);
                return Ok(DeliveryResult::error(metering_problem(&fault), None));
            }
            Err(err) => return Err(err),
        };
        let deliver_reply: DeliverReply = serde_json::from_slice(&reply.reply)?;
        Ok(DeliveryResult {
            status: deliver_reply.status,
            problem: deliver_reply.problem,
            meter_usage: reply.meter_usage,
        })
    }

    fn command_round_trip(&mut self, command: &Command) -> Result<CommandReply, WorkerError> {
        self.transport.send_command(&serde_json::to_vec(command)?)?;
        self.round_trip()
    }

    fn round_trip(&mut self) -> Result<CommandReply, WorkerError> {
        loop {
            match self.transport.next_event()? {
                WorkerEvent::Upcall(bytes) => {
                    let reply = self.handle_upcall(&bytes)?;
                    self.transport.send_upcall_reply(&reply)?;
                }
                WorkerEvent::Reply(reply) => return Ok(reply),
            }
        }
    }

    fn handle_upcall(&mut self, bytes: &[u8]) -> Result<Vec<u8>, WorkerError> {
        let upcall = match serde_json::from_slice::<Upcall>(bytes) {
            Ok(upcall) => upcall,
            Err(err) => return Err(unrecognized_or_decode(bytes, err)),
        };
        let result = match upcall {
            Upcall::Syscall { syscall } => self.handler.syscall(syscall),
            Upcall::SourcedConsole { source, level, args } => {
                log::log!(
                    console_level(&level),
                    "{} [{source}] {}",
                    self.vat_id,
                    render_args(&args)
                );
                SyscallResult::ok()
            }
            Upcall::TestLog { args } => {
                self.test_log.push(render_args(&args));
                SyscallResult::ok()
            }
        };
        Ok(serde_json::to_vec(&result)?)
    }

    /// Lines the vat emitted via the test-log upcall, in order.
    pub fn test_log(&self) -> &[String] {
        &self.test_log
    }

    pub fn handler(&self) -> &H {
        &self.handler
    }

    pub fn handler_mut(&mut self) -> &mut H {
        &mut self.handler
    }
}

impl<T: WorkerTransport, H: SyscallHandler> SnapshotProducer for WorkerBridge<T, H> {
    fn make_snapshot(&mut self) -> Result<Vec<u8>, KernelError> {
        self.transport
            .make_snapshot()
            .map_err(|fault| KernelError::Snapshot(fault.to_string()))
    }
}

fn metering_problem(fault: &TransportFault) -> &'static str {
    match fault {
        TransportFault::ComputeMeter => "Compute meter exceeded",
        TransportFault::StackMeter => "Stack meter exceeded",
        TransportFault::AllocateMeter => "Allocate meter exceeded",
        _ => "meter exceeded",
    }
}

const UPCALL_TAGS: [&str; 3] = ["syscall", "sourcedConsole", "testLog"];

/// A tagged object with an unknown tag is a protocol violation, distinct
/// from plain garbage on the wire. A known tag with a body that fails to
/// decode stays a decode error.
fn unrecognized_or_decode(bytes: &[u8], err: serde_json::Error) -> WorkerError {
    match serde_json::from_slice::<serde_json::Value>(bytes) {
        Ok(value) => match value.get("type").and_then(|t| t.as_str()) {
            Some(tag) if !UPCALL_TAGS.contains(&tag) => {
                WorkerError::UnrecognizedUpcall(tag.to_string())
            }
            _ => WorkerError::Decode(err),
        },
        Err(_) => WorkerError::Decode(err),
    }
}

fn console_level(level: &str) -> Level {
    match level {
        "debug" => Level::Debug,
        "warn" => Level::Warn,
        "error" => Level::Error,
        _ => Level::Info,
    }
}

fn render_args(args: &[serde_json::Value]) -> String {
    args.iter()
        .map(|a| match a {
            serde_json::Value::String(s) => s.clone(),
            other => other.to_string(),
        })
        .collect::<Vec<_>>()
        .join(" ")
}
