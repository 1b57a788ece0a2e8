// Copyright © 2026 The Cloud Hypervisor Authors
//
// SPDX-License-Identifier: Apache-2.0
//

//! External interrupt classification on guest exit.
//!
//! When a hardware thread leaves the guest because of an external
//! interrupt, the interrupt is read from the thread's presenter and sorted
//! out here: wakeup IPIs are consumed, interrupts of passthrough devices are
//! delivered straight to the guest when possible, and everything else is
//! left to the host.

use std::sync::atomic::{fence, AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;

use vm_device::{RcuList, RealMode, VirtualMode};

use crate::{Error, Result};

/// Interrupt source number of IPIs.
pub const XICS_IPI: u32 = 2;
/// Presenter priority used to raise an IPI.
pub const IPI_PRIORITY: u8 = 4;
/// Least favoured priority, clears a pending IPI.
pub const MFRR_CLEAR: u8 = 0xff;

const XISR_MASK: u32 = 0x00ff_ffff;

/// Interrupt presenter of one hardware thread.
pub trait Icp: Send + Sync {
    /// Accept the most favoured pending interrupt.
    fn read_xirr(&self, rm: &RealMode) -> u32;
    /// Signal end of interrupt.
    fn write_xirr(&self, rm: &RealMode, xirr: u32);
    fn write_mfrr(&self, rm: &RealMode, priority: u8);
}

/// Per hardware thread host state read on the exit path.
pub struct HostThreadState {
    icp: Option<Arc<dyn Icp>>,
    host_ipi: AtomicBool,
    saved_xirr: AtomicU32,
}

impl HostThreadState {
    pub fn new(icp: Option<Arc<dyn Icp>>) -> Self {
        HostThreadState {
            icp,
            host_ipi: AtomicBool::new(false),
            saved_xirr: AtomicU32::new(0),
        }
    }

    /// Set by the host when it sends this thread an IPI of its own.
    pub fn set_host_ipi(&self, pending: bool) {
        self.host_ipi.store(pending, Ordering::SeqCst);
    }

    fn host_ipi(&self) -> bool {
        self.host_ipi.load(Ordering::SeqCst)
    }

    /// Interrupt accepted on the last exit, for the host handler to pick up.
    pub fn saved_xirr(&self) -> u32 {
        self.saved_xirr.load(Ordering::Acquire)
    }
}

/// A host interrupt routed straight to a guest interrupt.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct IrqMapEntry {
    /// Hardware interrupt number as found in the XIRR source field.
    pub hwirq: u32,
    /// Guest global interrupt number.
    pub gsi: u32,
    /// Guest interrupt server the interrupt is affine to.
    pub server: u32,
}

/// Passthrough interrupts of one partition.
///
/// Entries are published whole, so a reader that finds a matching `hwirq`
/// also sees the matching `gsi` and `server`. A missed entry is harmless,
/// the interrupt then simply takes the host path.
#[derive(Default)]
pub struct PassthroughMap {
    entries: RcuList<IrqMapEntry>,
}

impl PassthroughMap {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&self, vm: &VirtualMode, entry: IrqMapEntry) -> Result<()> {
        let added = self.entries.update(vm, |entries| {
            if entries.iter().any(|e| e.hwirq == entry.hwirq) {
                return false;
            }
            entries.push(Arc::new(entry));
            true
        });
        if !added {
            return Err(Error::DuplicatePassthroughIrq(entry.hwirq));
        }

        info!(
            "Passthrough interrupt {:#x} mapped to GSI {} on server {}",
            entry.hwirq, entry.gsi, entry.server
        );
        Ok(())
    }

    /// Unmap `hwirq`. Returns once no exit path can still be delivering
    /// through the removed entry.
    pub fn remove(&self, vm: &VirtualMode, hwirq: u32) -> bool {
        let removed = self.entries.remove(vm, |e| e.hwirq == hwirq);
        if removed.is_empty() {
            return false;
        }
        info!("Passthrough interrupt {:#x} unmapped", hwirq);
        true
    }

    pub fn lookup(&self, _rm: &RealMode, hwirq: u32) -> Option<IrqMapEntry> {
        self.entries
            .read(|entries| entries.iter().find(|e| e.hwirq == hwirq).map(|e| **e))
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Result of delivering a passthrough interrupt to the guest.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Delivery {
    /// Delivered and completed.
    Delivered,
    /// Delivered, the host still has to complete it.
    CompleteInHost,
    /// Not delivered, the host handles it.
    Failed,
}

/// Delivery of passthrough interrupts to the guest interrupt controller.
pub trait PassthroughDelivery {
    fn deliver(&self, rm: &RealMode, xirr: u32, entry: &IrqMapEntry) -> Delivery;
}

/// What kind of external event a hardware thread exited for.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PendingInterrupt {
    None,
    HostHandle,
    PassthroughDelivered,
    PassthroughCompleteInHost,
    /// A guest wakeup IPI, already cleared.
    IpiConsumed,
}

/// Find out what external interrupt is pending on this thread.
pub fn read_intr(
    rm: &RealMode,
    host: &HostThreadState,
    passthrough: Option<&PassthroughMap>,
    delivery: &dyn PassthroughDelivery,
) -> PendingInterrupt {
    if host.host_ipi() {
        return PendingInterrupt::HostHandle;
    }

    let Some(icp) = host.icp.as_deref() else {
        return PendingInterrupt::HostHandle;
    };

    let xirr = icp.read_xirr(rm);
    host.saved_xirr.store(xirr, Ordering::Release);
    let xisr = xirr & XISR_MASK;
    // Side effects of accepting the interrupt must be complete.
    fence(Ordering::SeqCst);

    if xisr == 0 {
        return PendingInterrupt::None;
    }

    if xisr == XICS_IPI {
        icp.write_mfrr(rm, MFRR_CLEAR);
        icp.write_xirr(rm, xirr);
        fence(Ordering::SeqCst);

        // The host may have raised its own IPI in the meantime.
        if host.host_ipi() {
            icp.write_mfrr(rm, IPI_PRIORITY);
            fence(Ordering::SeqCst);
            return PendingInterrupt::HostHandle;
        }

        host.saved_xirr.store(0, Ordering::Release);
        return PendingInterrupt::IpiConsumed;
    }

    match passthrough.and_then(|map| map.lookup(rm, xisr)) {
        Some(entry) => match delivery.deliver(rm, xirr, &entry) {
            Delivery::Delivered => PendingInterrupt::PassthroughDelivered,
            Delivery::CompleteInHost => PendingInterrupt::PassthroughCompleteInHost,
            Delivery::Failed => PendingInterrupt::HostHandle,
        },
        None => PendingInterrupt::HostHandle,
    }
}
