// Copyright © 2026 The Cloud Hypervisor Authors
//
// SPDX-License-Identifier: Apache-2.0
//

use std::sync::atomic::{fence, Ordering};

use vm_device::{IpiSender, RealMode};

use crate::bitmap::ThreadSet;
use crate::vcore::VirtualCore;

/// Shape of the host CPUs as far as signalling is concerned.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct IpiTopology {
    threads_per_core: u32,
    /// The CPU can send doorbell messages between threads of one core.
    has_doorbell: bool,
}

impl IpiTopology {
    /// `None` if a core has no threads.
    pub const fn new(threads_per_core: u32, has_doorbell: bool) -> Option<Self> {
        if threads_per_core == 0 {
            return None;
        }
        Some(IpiTopology {
            threads_per_core,
            has_doorbell,
        })
    }

    pub fn threads_per_core(&self) -> u32 {
        self.threads_per_core
    }

    pub fn has_doorbell(&self) -> bool {
        self.has_doorbell
    }

    fn first_thread_sibling(&self, cpu: u32) -> u32 {
        cpu - cpu % self.threads_per_core
    }

    fn thread_in_core(&self, cpu: u32) -> u32 {
        cpu % self.threads_per_core
    }
}

/// Sends IPIs on behalf of the hardware thread `self_cpu`.
#[derive(Clone, Copy)]
pub struct IpiRouter<'a> {
    topology: IpiTopology,
    self_cpu: u32,
    sender: &'a dyn IpiSender,
}

impl<'a> IpiRouter<'a> {
    pub fn new(topology: IpiTopology, self_cpu: u32, sender: &'a dyn IpiSender) -> Self {
        IpiRouter {
            topology,
            self_cpu,
            sender,
        }
    }

    /// Interrupt `cpu`, with a doorbell if it shares our core.
    ///
    /// Memory ordering against the signal is up to the caller.
    pub fn send_ipi(&self, rm: &RealMode, cpu: u32) {
        let topo = &self.topology;
        if topo.has_doorbell
            && topo.first_thread_sibling(cpu) == topo.first_thread_sibling(self.self_cpu)
        {
            self.sender.doorbell(rm, topo.thread_in_core(cpu));
            return;
        }

        self.sender.interrupt(rm, cpu);
    }

    /// Interrupt every thread of `vc` in `active`.
    pub fn interrupt_vcore(&self, rm: &RealMode, vc: &VirtualCore, active: ThreadSet) {
        // Exit map updates must be visible before the targets wake up.
        fence(Ordering::SeqCst);
        for ptid in active.iter() {
            self.send_ipi(rm, vc.pcpu() + ptid);
        }
    }
}
