//! Delivery and syscall wire types.
//!
//! Both directions are closed tagged unions, generic over the slot type:
//! the kernel side speaks `Delivery<KernelSlot>` / `Syscall<KernelSlot>`
//! and the vat side the `VatSlot` instantiations, so the translators in
//! [`crate::translate`] are plain slot rewrites over one shape. Unknown
//! tags fail to decode, which the bridge treats as fatal.

use serde::{Deserialize, Serialize};

use crate::slots::{KernelSlot, VatSlot};

/// Serialized capability data: an opaque body plus the slots it references.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CapData<S> {
    pub body: String,
    #[serde(default = "Vec::new")]
    pub slots: Vec<S>,
}

impl<S> CapData<S> {
    pub fn new(body: impl Into<String>, slots: Vec<S>) -> Self {
        Self { body: body.into(), slots }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Msg<S> {
    pub method: String,
    pub args: CapData<S>,
    #[serde(default = "Option::default", skip_serializing_if = "Option::is_none")]
    pub result: Option<S>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Resolution<S> {
    pub subject: S,
    pub rejected: bool,
    pub data: CapData<S>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase", rename_all_fields = "camelCase")]
pub enum Delivery<S> {
    Message { target: S, message: Msg<S> },
    Notify { resolutions: Vec<Resolution<S>> },
    DropExports { slots: Vec<S> },
    RetireExports { slots: Vec<S> },
    RetireImports { slots: Vec<S> },
    ChangeVatOptions { options: serde_json::Value },
    StartVat { vat_parameters: CapData<S> },
    StopVat,
    BringOutYourDead,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase", rename_all_fields = "camelCase")]
pub enum Syscall<S> {
    Send { target: S, message: Msg<S> },
    CallNow { target: S, method: String, args: CapData<S> },
    Subscribe { subject: S },
    Resolve { resolutions: Vec<Resolution<S>> },
    Exit { is_failure: bool, info: CapData<S> },
    VatstoreGet { key: String },
    VatstoreGetAfter { prior_key: String, lower_bound: String },
    VatstoreSet { key: String, value: String },
    VatstoreDelete { key: String },
    DropImports { slots: Vec<S> },
    RetireImports { slots: Vec<S> },
    RetireExports { slots: Vec<S> },
    AbandonExports { slots: Vec<S> },
}

pub type KernelDelivery = Delivery<KernelSlot>;
pub type VatDelivery = Delivery<VatSlot>;
pub type KernelSyscall = Syscall<KernelSlot>;
pub type VatSyscall = Syscall<VatSlot>;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "lowercase")]
pub enum SyscallResult {
    Ok {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        data: Option<serde_json::Value>,
    },
    Error {
        message: String,
    },
}

impl SyscallResult {
    pub fn ok() -> Self {
        SyscallResult::Ok { data: None }
    }

    pub fn ok_with(data: serde_json::Value) -> Self {
        SyscallResult::Ok { data: Some(data) }
    }

    pub fn error(message: impl Into<String>) -> Self {
        SyscallResult::Error { message: message.into() }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeliveryStatus {
    Ok,
    Error,
}

/// Resource consumption reported by a metered worker for one delivery.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct MeterUsage {
    pub compute: u64,
    pub allocate: u64,
}

/// Outcome of one delivery: `(status, problem, meter_usage)`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeliveryResult {
    pub status: DeliveryStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub problem: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub meter_usage: Option<MeterUsage>,
}

impl DeliveryResult {
    pub fn ok(meter_usage: Option<MeterUsage>) -> Self {
        Self { status: DeliveryStatus::Ok, problem: None, meter_usage }
    }

    pub fn error(problem: impl Into<String>, meter_usage: Option<MeterUsage>) -> Self {
        Self {
            status: DeliveryStatus::Error,
            problem: Some(problem.into()),
            meter_usage,
        }
    }

    pub fn is_ok(&self) -> bool {
        self.status == DeliveryStatus::Ok
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::slots::SlotKind;

    #[test]
    fn delivery_tags_are_camel_case() {
        let d: VatDelivery = Delivery::DropExports {
            slots: vec![VatSlot::export(SlotKind::Object, 1)],
        };
        let json = serde_json::to_value(&d).unwrap();
        assert_eq!(json["type"], "dropExports");
        assert_eq!(json["slots"][0], "o+1");

        let back: VatDelivery = serde_json::from_value(json).unwrap();
        assert_eq!(back, d);
    }

    #[test]
    fn message_delivery_round_trip() {
        let d: KernelDelivery = Delivery::Message {
            target: KernelSlot::object(20),
            message: Msg {
                method: "transfer".into(),
                args: CapData::new("[1]", vec![KernelSlot::object(21)]),
                result: Some(KernelSlot::promise(40)),
            },
        };
        let json = serde_json::to_string(&d).unwrap();
        let back: KernelDelivery = serde_json::from_str(&json).unwrap();
        assert_eq!(back, d);
    }

    #[test]
    fn unknown_tag_is_a_decode_error() {
        let err = serde_json::from_str::<VatDelivery>(r#"{"type":"mystery"}"#).unwrap_err();
        assert!(err.to_string().contains("mystery"));
    }

    #[test]
    fn syscall_field_names_are_camel_case() {
        let s: VatSyscall = Syscall::VatstoreGetAfter {
            prior_key: "a".into(),
            lower_bound: "b".into(),
        };
        let json = serde_json::to_value(&s).unwrap();
        assert_eq!(json["type"], "vatstoreGetAfter");
        assert_eq!(json["priorKey"], "a");
        assert_eq!(json["lowerBound"], "b");
    }

    #[test]
    fn syscall_results_are_status_tagged() {
        let ok = serde_json::to_value(SyscallResult::ok()).unwrap();
        assert_eq!(ok["status"], "ok");
        let err = serde_json::to_value(SyscallResult::error("boom")).unwrap();
        assert_eq!(err["status"], "error");
        assert_eq!(err["message"], "boom");
    }
}
