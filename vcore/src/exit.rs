// Copyright © 2026 The Cloud Hypervisor Authors
//
// SPDX-License-Identifier: Apache-2.0
//

use std::sync::atomic::Ordering;
use std::sync::Arc;

use vm_device::RealMode;

use crate::ipi::IpiRouter;
use crate::vcore::{entry_bits, exit_bit, is_exiting, VirtualCore, VCORE_EXIT_REQ};

/// Sub-cores a physical core can be split into.
pub const MAX_SUBCORES: usize = 4;

const TRAP_EXTERNAL: u32 = 0x500;
const TRAP_HV_DECREMENTER: u32 = 0x980;
const TRAP_SYSCALL: u32 = 0xc00;

/// Why a thread is leaving the guest.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ExitReason {
    ExternalInterrupt,
    /// Every thread of the core takes this one at the same time.
    HvDecrementer,
    Hypercall,
    Other(u32),
}

impl ExitReason {
    pub fn from_trap(trap: u32) -> Self {
        match trap {
            TRAP_EXTERNAL => ExitReason::ExternalInterrupt,
            TRAP_HV_DECREMENTER => ExitReason::HvDecrementer,
            TRAP_SYSCALL => ExitReason::Hypercall,
            other => ExitReason::Other(other),
        }
    }
}

/// The virtual cores sharing a physical core split into sub-cores.
#[derive(Debug)]
pub struct SplitMode {
    master_vcs: Vec<Arc<VirtualCore>>,
}

impl SplitMode {
    /// `None` when more sub-cores are given than a core can hold.
    pub fn new(master_vcs: Vec<Arc<VirtualCore>>) -> Option<Self> {
        if master_vcs.len() > MAX_SUBCORES {
            return None;
        }
        Some(SplitMode { master_vcs })
    }

    pub fn master_vcs(&self) -> &[Arc<VirtualCore>] {
        &self.master_vcs
    }
}

/// Record that thread `ptid` of `vc` is leaving the guest.
///
/// The first thread to exit pulls the other threads of the core out of
/// the guest, and asks every other sub-core to exit as well. Returns
/// whether the caller was that first thread.
pub fn commence_exit(
    rm: &RealMode,
    vc: &VirtualCore,
    ptid: u32,
    reason: ExitReason,
    split: Option<&SplitMode>,
    ipi: &IpiRouter,
) -> bool {
    let me = exit_bit(ptid);
    let mut ee = vc.entry_exit_map().load(Ordering::Acquire);
    loop {
        match vc.entry_exit_map().compare_exchange_weak(
            ee,
            ee | me,
            Ordering::AcqRel,
            Ordering::Acquire,
        ) {
            Ok(_) => break,
            Err(current) => ee = current,
        }
    }

    if is_exiting(ee) {
        return false;
    }

    // On a decrementer interrupt the siblings are already on their way out.
    if reason != ExitReason::HvDecrementer {
        ipi.interrupt_vcore(rm, vc, entry_bits(ee).without(ptid));
    }

    let Some(split) = split else {
        return true;
    };

    for sub in split.master_vcs() {
        let map = sub.entry_exit_map();
        let requested = map.fetch_update(Ordering::AcqRel, Ordering::Acquire, |ee| {
            if is_exiting(ee) {
                None
            } else {
                Some(ee | VCORE_EXIT_REQ)
            }
        });
        if let Ok(ee) = requested {
            ipi.interrupt_vcore(rm, sub, entry_bits(ee));
        }
    }

    true
}
