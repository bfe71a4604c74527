use std::collections::VecDeque;

use serde_json::json;
use vat_kernel::{
    CapData, Delivery, DeliveryStatus, MeterUsage, Msg, SlotKind, SnapshotProducer, Syscall,
    SyscallResult, VatDelivery, VatId, VatSlot, VatSyscall,
};
use vat_worker::{
    CommandReply, SyscallHandler, TransportFault, WorkerBridge, WorkerError, WorkerEvent,
    WorkerTransport,
};

/// Scripted stand-in for a worker process. Each step either checks what
/// the bridge sent or supplies the next event the worker would produce.
enum Step {
    ExpectCommand(serde_json::Value),
    Upcall(serde_json::Value),
    ExpectUpcallReply(serde_json::Value),
    Reply {
        body: serde_json::Value,
        meter_usage: Option<MeterUsage>,
    },
    Fault(TransportFault),
}

struct MockWorker {
    script: VecDeque<Step>,
    heap: Vec<u8>,
}

impl MockWorker {
    fn new(script: Vec<Step>) -> Self {
        Self { script: script.into(), heap: b"serialized heap".to_vec() }
    }

    fn next_step(&mut self, wanted: &str) -> Step {
        match self.script.pop_front() {
            Some(step) => step,
            None => panic!("script exhausted, bridge wanted {wanted}"),
        }
    }
}

impl WorkerTransport for MockWorker {
    fn send_command(&mut self, command: &[u8]) -> Result<(), TransportFault> {
        match self.next_step("send_command") {
            Step::ExpectCommand(expected) => {
                let got: serde_json::Value = serde_json::from_slice(command).unwrap();
                assert_eq!(got, expected);
                Ok(())
            }
            _ => panic!("unexpected send_command"),
        }
    }

    fn next_event(&mut self) -> Result<WorkerEvent, TransportFault> {
        match self.next_step("next_event") {
            Step::Upcall(value) => Ok(WorkerEvent::Upcall(serde_json::to_vec(&value).unwrap())),
            Step::Reply { body, meter_usage } => Ok(WorkerEvent::Reply(CommandReply {
                reply: serde_json::to_vec(&body).unwrap(),
                meter_usage,
            })),
            Step::Fault(fault) => Err(fault),
            _ => panic!("unexpected next_event"),
        }
    }

    fn send_upcall_reply(&mut self, reply: &[u8]) -> Result<(), TransportFault> {
        match self.next_step("send_upcall_reply") {
            Step::ExpectUpcallReply(expected) => {
                let got: serde_json::Value = serde_json::from_slice(reply).unwrap();
                assert_eq!(got, expected);
                Ok(())
            }
            _ => panic!("unexpected send_upcall_reply"),
        }
    }

    fn make_snapshot(&mut self) -> Result<Vec<u8>, TransportFault> {
        Ok(self.heap.clone())
    }
}

#[derive(Default)]
struct RecordingHandler {
    seen: Vec<VatSyscall>,
    results: VecDeque<SyscallResult>,
}

impl SyscallHandler for RecordingHandler {
    fn syscall(&mut self, syscall: VatSyscall) -> SyscallResult {
        self.seen.push(syscall);
        self.results.pop_front().unwrap_or_else(SyscallResult::ok)
    }
}

fn bridge(script: Vec<Step>) -> WorkerBridge<MockWorker, RecordingHandler> {
    WorkerBridge::new(VatId::new("v1"), MockWorker::new(script), RecordingHandler::default())
}

fn ping_delivery() -> VatDelivery {
    Delivery::Message {
        target: VatSlot::import(SlotKind::Object, 50),
        message: Msg {
            method: "ping".into(),
            args: CapData::new("[]", vec![]),
            result: None,
        },
    }
}

#[test]
fn bundle_load_handshake() {
    let mut bridge = bridge(vec![
        Step::ExpectCommand(json!({
            "type": "setBundle",
            "vatId": "v1",
            "bundle": "vat code",
            "options": {"enableSetup": false},
        })),
        Step::Reply { body: json!({"type": "dispatchReady"}), meter_usage: None },
    ]);
    bridge
        .load_bundle("vat code", json!({"enableSetup": false}))
        .unwrap();
}

#[test]
fn bundle_load_rejection_is_fatal() {
    let mut bridge = bridge(vec![
        Step::ExpectCommand(json!({
            "type": "setBundle",
            "vatId": "v1",
            "bundle": "broken",
            "options": {},
        })),
        Step::Reply {
            body: json!({"type": "failure", "name": "SyntaxError", "message": "bad bundle"}),
            meter_usage: None,
        },
    ]);
    let err = bridge.load_bundle("broken", json!({})).unwrap_err();
    match err {
        WorkerError::BundleLoadFailed { name, message } => {
            assert_eq!(name, "SyntaxError");
            assert_eq!(message, "bad bundle");
        }
        other => panic!("unexpected error {other:?}"),
    }
}

#[test]
fn deliver_services_upcalls_until_the_reply() {
    let delivery = ping_delivery();
    let mut bridge = bridge(vec![
        Step::ExpectCommand(json!({
            "type": "deliver",
            "delivery": serde_json::to_value(&delivery).unwrap(),
        })),
        Step::Upcall(json!({
            "type": "syscall",
            "syscall": {"type": "vatstoreGet", "key": "counter"},
        })),
        Step::ExpectUpcallReply(json!({"status": "ok", "data": "7"})),
        Step::Upcall(json!({
            "type": "sourcedConsole",
            "source": "liveslots",
            "level": "warn",
            "args": ["low", "memory"],
        })),
        Step::ExpectUpcallReply(json!({"status": "ok"})),
        Step::Upcall(json!({"type": "testLog", "args": ["got ping", 1]})),
        Step::ExpectUpcallReply(json!({"status": "ok"})),
        Step::Reply {
            body: json!({"status": "ok"}),
            meter_usage: Some(MeterUsage { compute: 12000, allocate: 4096 }),
        },
    ]);
    bridge
        .handler_mut()
        .results
        .push_back(SyscallResult::ok_with(json!("7")));

    let result = bridge.deliver(delivery).unwrap();
    assert!(result.is_ok());
    assert_eq!(
        result.meter_usage,
        Some(MeterUsage { compute: 12000, allocate: 4096 })
    );
    assert_eq!(
        bridge.handler().seen,
        vec![Syscall::VatstoreGet { key: "counter".into() }]
    );
    assert_eq!(bridge.test_log(), ["got ping 1"]);
}

#[test]
fn metering_faults_become_error_results() {
    for (fault, problem) in [
        (TransportFault::ComputeMeter, "Compute meter exceeded"),
        (TransportFault::StackMeter, "Stack meter exceeded"),
        (TransportFault::AllocateMeter, "Allocate meter exceeded"),
    ] {
        let delivery = ping_delivery();
        let mut bridge = bridge(vec![
            Step::ExpectCommand(json!({
                "type": "deliver",
                "delivery": serde_json::to_value(&delivery).unwrap(),
            })),
            Step::Fault(fault),
        ]);
        let result = bridge.deliver(delivery).unwrap();
        assert_eq!(result.status, DeliveryStatus::Error);
        assert_eq!(result.problem.as_deref(), Some(problem));
        assert_eq!(result.meter_usage, None);
    }
}

#[test]
fn non_metering_faults_propagate() {
    let delivery = ping_delivery();
    let mut bridge = bridge(vec![
        Step::ExpectCommand(json!({
            "type": "deliver",
            "delivery": serde_json::to_value(&delivery).unwrap(),
        })),
        Step::Fault(TransportFault::Terminated("worker crashed".into())),
    ]);
    let err = bridge.deliver(delivery).unwrap_err();
    assert!(matches!(
        err,
        WorkerError::Transport(TransportFault::Terminated(_))
    ));
}

#[test]
fn unknown_upcall_tags_are_fatal() {
    let delivery = ping_delivery();
    let mut bridge = bridge(vec![
        Step::ExpectCommand(json!({
            "type": "deliver",
            "delivery": serde_json::to_value(&delivery).unwrap(),
        })),
        Step::Upcall(json!({"type": "mystery", "payload": 3})),
    ]);
    let err = bridge.deliver(delivery).unwrap_err();
    match err {
        WorkerError::UnrecognizedUpcall(tag) => assert_eq!(tag, "mystery"),
        other => panic!("unexpected error {other:?}"),
    }
}

#[test]
fn malformed_body_under_known_tag_is_a_decode_error() {
    let delivery = ping_delivery();
    let mut bridge = bridge(vec![
        Step::ExpectCommand(json!({
            "type": "deliver",
            "delivery": serde_json::to_value(&delivery).unwrap(),
        })),
        Step::Upcall(json!({
            "type": "syscall",
            "syscall": {"type": "bogus"},
        })),
    ]);
    let err = bridge.deliver(delivery).unwrap_err();
    assert!(matches!(err, WorkerError::Decode(_)));
}

#[test]
fn bridge_produces_heap_snapshots() {
    let mut bridge = bridge(vec![]);
    let heap = SnapshotProducer::make_snapshot(&mut bridge).unwrap();
    assert_eq!(heap, b"serialized heap");
}

#[test]
fn syscall_error_results_are_relayed() {
    let delivery = ping_delivery();
    let mut bridge = bridge(vec![
        Step::ExpectCommand(json!({
            "type": "deliver",
            "delivery": serde_json::to_value(&delivery).unwrap(),
        })),
        Step::Upcall(json!({
            "type": "syscall",
            "syscall": {"type": "dropImports", "slots": ["o+1"]},
        })),
        Step::ExpectUpcallReply(json!({
            "status": "error",
            "message": "vat sent invalid syscall: dropImports of non-import o+1",
        })),
        Step::Reply {
            body: json!({"status": "error", "problem": "vat was terminated"}),
            meter_usage: None,
        },
    ]);
    bridge.handler_mut().results.push_back(SyscallResult::error(
        "vat sent invalid syscall: dropImports of non-import o+1",
    ));

    let result = bridge.deliver(delivery).unwrap();
    assert_eq!(result.status, DeliveryStatus::Error);
    assert_eq!(result.problem.as_deref(), Some("vat was terminated"));
}
