// Copyright © 2026 The Cloud Hypervisor Authors
//
// SPDX-License-Identifier: Apache-2.0
//

use std::sync::atomic::{AtomicU32, Ordering};

use vm_device::{RealMode, VirtualMode};

use crate::bitmap::{AtomicThreadSet, ThreadSet};

const ENTRY_MASK: u32 = 0xff;
const EXIT_SHIFT: u32 = 8;

/// Exit requested from outside the core. Only ever tested as part of the
/// exiting check, it names no thread.
pub const VCORE_EXIT_REQ: u32 = 0x10000;

/// Shared state of the hardware threads running one virtual core.
///
/// `entry_exit_map` packs the threads that entered the guest in bits 0-7
/// and the threads that started exiting in bits 8-15. Once any exit bit is
/// set no thread may enter any more.
#[derive(Debug)]
pub struct VirtualCore {
    pcpu: u32,
    entry_exit_map: AtomicU32,
    napping: AtomicThreadSet,
    conferring: AtomicThreadSet,
}

impl VirtualCore {
    /// `pcpu` is the first hardware thread of the physical core.
    pub fn new(pcpu: u32) -> Self {
        VirtualCore {
            pcpu,
            entry_exit_map: AtomicU32::new(0),
            napping: AtomicThreadSet::new(),
            conferring: AtomicThreadSet::new(),
        }
    }

    pub fn pcpu(&self) -> u32 {
        self.pcpu
    }

    pub(crate) fn entry_exit_map(&self) -> &AtomicU32 {
        &self.entry_exit_map
    }

    /// Mark `ptid` as running guest code. Refused once the core is exiting.
    pub fn enter(&self, _rm: &RealMode, ptid: u32) -> bool {
        let me = ThreadSet::single(ptid).bits();
        self.entry_exit_map
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |ee| {
                if is_exiting(ee) {
                    None
                } else {
                    Some(ee | me)
                }
            })
            .is_ok()
    }

    pub fn entry_map(&self) -> ThreadSet {
        ThreadSet::from_bits(self.entry_exit_map.load(Ordering::Acquire) & ENTRY_MASK)
    }

    pub fn exit_map(&self) -> ThreadSet {
        ThreadSet::from_bits(self.entry_exit_map.load(Ordering::Acquire) >> EXIT_SHIFT)
    }

    pub fn is_exiting(&self) -> bool {
        is_exiting(self.entry_exit_map.load(Ordering::Acquire))
    }

    pub fn napping(&self) -> &AtomicThreadSet {
        &self.napping
    }

    pub fn conferring(&self) -> &AtomicThreadSet {
        &self.conferring
    }

    /// Start a new guest quantum.
    pub fn reset(&self, _vm: &VirtualMode) {
        let ee = self.entry_exit_map.swap(0, Ordering::AcqRel);
        self.napping.clear();
        self.conferring.clear();
        debug!(
            "Virtual core on CPU {} reset, entry/exit map was {:#x}",
            self.pcpu, ee
        );
    }
}

pub(crate) fn is_exiting(ee: u32) -> bool {
    ee >> EXIT_SHIFT != 0
}

pub(crate) fn exit_bit(ptid: u32) -> u32 {
    ThreadSet::single(ptid).bits() << EXIT_SHIFT
}

pub(crate) fn entry_bits(ee: u32) -> ThreadSet {
    ThreadSet::from_bits(ee & ENTRY_MASK)
}
