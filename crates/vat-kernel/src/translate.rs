//! Slot translation at the kernel/vat boundary.
//!
//! Each crank rewrites the delivery's kernel slots into vat slots on the
//! way in, and every syscall's vat slots into kernel slots on the way out.
//! The GC-flavored operations carry their bookkeeping side effects here:
//! `dropExports`/`dropImports` clear reachability, the `retire*` pairs
//! delete the c-list entry outright.

use crate::error::KernelError;
use crate::ledger::{MapOptions, VatLedger};
use crate::message::{CapData, Delivery, KernelDelivery, KernelSyscall, Msg, Resolution,
    Syscall, VatDelivery, VatSyscall};
use crate::slots::{KernelSlot, VatSlot};

fn capdata_to_vat(
    ledger: &VatLedger,
    data: &CapData<KernelSlot>,
    opts: MapOptions,
) -> Result<CapData<VatSlot>, KernelError> {
    let slots = data
        .slots
        .iter()
        .map(|&k| ledger.map_kernel_slot_to_vat_slot(k, opts))
        .collect::<Result<Vec<_>, _>>()?;
    Ok(CapData { body: data.body.clone(), slots })
}

fn capdata_to_kernel(
    ledger: &VatLedger,
    data: &CapData<VatSlot>,
    opts: MapOptions,
) -> Result<CapData<KernelSlot>, KernelError> {
    let slots = data
        .slots
        .iter()
        .map(|&v| ledger.map_vat_slot_to_kernel_slot(v, opts))
        .collect::<Result<Vec<_>, _>>()?;
    Ok(CapData { body: data.body.clone(), slots })
}

/// Translates a kernel-space delivery into the receiving vat's namespace,
/// allocating import entries as needed.
pub fn delivery_to_vat(
    ledger: &VatLedger,
    delivery: &KernelDelivery,
) -> Result<VatDelivery, KernelError> {
    let defaults = MapOptions::default();
    match delivery {
        Delivery::Message { target, message } => Ok(Delivery::Message {
            target: ledger.map_kernel_slot_to_vat_slot(*target, defaults)?,
            message: Msg {
                method: message.method.clone(),
                args: capdata_to_vat(ledger, &message.args, defaults)?,
                result: message
                    .result
                    .map(|r| ledger.map_kernel_slot_to_vat_slot(r, defaults))
                    .transpose()?,
            },
        }),
        Delivery::Notify { resolutions } => {
            let translated = resolutions
                .iter()
                .map(|r| {
                    Ok(Resolution {
                        subject: ledger.map_kernel_slot_to_vat_slot(r.subject, defaults)?,
                        rejected: r.rejected,
                        data: capdata_to_vat(ledger, &r.data, defaults)?,
                    })
                })
                .collect::<Result<Vec<_>, KernelError>>()?;
            Ok(Delivery::Notify { resolutions: translated })
        }
        Delivery::DropExports { slots } => {
            let mut vslots = Vec::with_capacity(slots.len());
            for &kslot in slots {
                vslots.push(ledger.map_kernel_slot_to_vat_slot(kslot, MapOptions::required())?);
                ledger.clear_reachable_flag(kslot)?;
            }
            Ok(Delivery::DropExports { slots: vslots })
        }
        Delivery::RetireExports { slots } => Ok(Delivery::RetireExports {
            slots: retire(ledger, slots)?,
        }),
        Delivery::RetireImports { slots } => Ok(Delivery::RetireImports {
            slots: retire(ledger, slots)?,
        }),
        Delivery::ChangeVatOptions { options } => Ok(Delivery::ChangeVatOptions {
            options: options.clone(),
        }),
        Delivery::StartVat { vat_parameters } => Ok(Delivery::StartVat {
            vat_parameters: capdata_to_vat(ledger, vat_parameters, defaults)?,
        }),
        Delivery::StopVat => Ok(Delivery::StopVat),
        Delivery::BringOutYourDead => Ok(Delivery::BringOutYourDead),
    }
}

fn retire(ledger: &VatLedger, slots: &[KernelSlot]) -> Result<Vec<VatSlot>, KernelError> {
    let mut vslots = Vec::with_capacity(slots.len());
    for &kslot in slots {
        let vslot = ledger.map_kernel_slot_to_vat_slot(kslot, MapOptions::required())?;
        ledger.delete_clist_entry(kslot, vslot)?;
        vslots.push(vslot);
    }
    Ok(vslots)
}

/// Translates a vat-issued syscall into kernel space, performing the
/// reachability/retirement side effects the GC syscalls imply.
pub fn syscall_to_kernel(
    ledger: &VatLedger,
    syscall: &VatSyscall,
) -> Result<KernelSyscall, KernelError> {
    let defaults = MapOptions::default();
    match syscall {
        Syscall::Send { target, message } => Ok(Syscall::Send {
            target: ledger.map_vat_slot_to_kernel_slot(*target, defaults)?,
            message: Msg {
                method: message.method.clone(),
                args: capdata_to_kernel(ledger, &message.args, defaults)?,
                result: message
                    .result
                    .map(|r| ledger.map_vat_slot_to_kernel_slot(r, defaults))
                    .transpose()?,
            },
        }),
        Syscall::CallNow { target, method, args } => Ok(Syscall::CallNow {
            target: ledger.map_vat_slot_to_kernel_slot(*target, defaults)?,
            method: method.clone(),
            args: capdata_to_kernel(ledger, args, defaults)?,
        }),
        Syscall::Subscribe { subject } => Ok(Syscall::Subscribe {
            subject: ledger.map_vat_slot_to_kernel_slot(*subject, defaults)?,
        }),
        Syscall::Resolve { resolutions } => {
            let translated = resolutions
                .iter()
                .map(|r| {
                    Ok(Resolution {
                        subject: ledger.map_vat_slot_to_kernel_slot(r.subject, defaults)?,
                        rejected: r.rejected,
                        data: capdata_to_kernel(ledger, &r.data, defaults)?,
                    })
                })
                .collect::<Result<Vec<_>, KernelError>>()?;
            Ok(Syscall::Resolve { resolutions: translated })
        }
        Syscall::Exit { is_failure, info } => Ok(Syscall::Exit {
            is_failure: *is_failure,
            info: capdata_to_kernel(ledger, info, defaults)?,
        }),
        Syscall::VatstoreGet { key } => Ok(Syscall::VatstoreGet {
            key: vatstore_key(ledger, key),
        }),
        Syscall::VatstoreGetAfter { prior_key, lower_bound } => Ok(Syscall::VatstoreGetAfter {
            prior_key: vatstore_key(ledger, prior_key),
            lower_bound: vatstore_key(ledger, lower_bound),
        }),
        Syscall::VatstoreSet { key, value } => Ok(Syscall::VatstoreSet {
            key: vatstore_key(ledger, key),
            value: value.clone(),
        }),
        Syscall::VatstoreDelete { key } => Ok(Syscall::VatstoreDelete {
            key: vatstore_key(ledger, key),
        }),
        Syscall::DropImports { slots } => {
            let mut kslots = Vec::with_capacity(slots.len());
            for &vslot in slots {
                if vslot.allocated_by_vat {
                    return Err(KernelError::InvalidSyscall(format!(
                        "dropImports of non-import {vslot}"
                    )));
                }
                let kslot = ledger.map_vat_slot_to_kernel_slot(vslot, MapOptions::required())?;
                ledger.clear_reachable_flag(kslot)?;
                kslots.push(kslot);
            }
            Ok(Syscall::DropImports { slots: kslots })
        }
        Syscall::RetireImports { slots } => Ok(Syscall::RetireImports {
            slots: retire_from_vat(ledger, slots, false)?,
        }),
        Syscall::RetireExports { slots } => Ok(Syscall::RetireExports {
            slots: retire_from_vat(ledger, slots, true)?,
        }),
        Syscall::AbandonExports { slots } => {
            let mut kslots = Vec::with_capacity(slots.len());
            for &vslot in slots {
                if !vslot.allocated_by_vat {
                    return Err(KernelError::InvalidSyscall(format!(
                        "abandonExports of non-export {vslot}"
                    )));
                }
                // translation only: orphaning the kernel object is the
                // registry owner's job
                kslots.push(ledger.map_vat_slot_to_kernel_slot(vslot, MapOptions::required())?);
            }
            Ok(Syscall::AbandonExports { slots: kslots })
        }
    }
}

fn retire_from_vat(
    ledger: &VatLedger,
    slots: &[VatSlot],
    want_export: bool,
) -> Result<Vec<KernelSlot>, KernelError> {
    let mut kslots = Vec::with_capacity(slots.len());
    for &vslot in slots {
        if vslot.allocated_by_vat != want_export {
            let kind = if want_export { "retireExports" } else { "retireImports" };
            return Err(KernelError::InvalidSyscall(format!("{kind} of {vslot}")));
        }
        let kslot = ledger.map_vat_slot_to_kernel_slot(vslot, MapOptions::required())?;
        ledger.delete_clist_entry(kslot, vslot)?;
        kslots.push(kslot);
    }
    Ok(kslots)
}

fn vatstore_key(ledger: &VatLedger, key: &str) -> String {
    if key.is_empty() {
        String::new()
    } else {
        format!("{}.vs.{key}", ledger.vat_id())
    }
}
