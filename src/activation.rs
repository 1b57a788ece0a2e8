// Copyright © 2026 The Cloud Hypervisor Authors
//
// SPDX-License-Identifier: Apache-2.0
//

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, RwLock};

use vm_device::VirtualMode;

use crate::{Error, Result};

/// Counts the partitions using the real-mode services, so that host-wide
/// operations they cannot cope with (bringing hardware threads online) are
/// refused while any of them exists.
///
/// Changes of the count and those operations are serialized by the hotplug
/// lock: partitions take it shared, CPU onlining exclusive.
#[derive(Debug, Default)]
pub struct HostGate {
    vm_count: AtomicUsize,
    hotplug: RwLock<()>,
}

impl HostGate {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Count one more active partition until the token is dropped.
    pub fn activate(self: &Arc<Self>, _vm: &VirtualMode) -> Activation {
        let _hotplug = self.hotplug.read().unwrap();
        let count = self.vm_count.fetch_add(1, Ordering::AcqRel) + 1;
        debug!("Partition activated, {} active", count);
        Activation {
            gate: self.clone(),
        }
    }

    /// Whether any partition is active. Safe from real mode.
    pub fn mode_active(&self) -> bool {
        self.vm_count.load(Ordering::Acquire) != 0
    }

    pub fn active_count(&self) -> usize {
        self.vm_count.load(Ordering::Acquire)
    }

    /// Run `online` to bring `cpu` up, unless partitions are active.
    pub fn try_online_cpu<R>(
        &self,
        _vm: &VirtualMode,
        cpu: u32,
        online: impl FnOnce(u32) -> R,
    ) -> Result<R> {
        let _hotplug = self.hotplug.write().unwrap();
        let count = self.vm_count.load(Ordering::Acquire);
        if count != 0 {
            warn!(
                "Refusing to online CPU {} while {} partitions are active",
                cpu, count
            );
            return Err(Error::PartitionsActive(count));
        }

        info!("Onlining CPU {}", cpu);
        Ok(online(cpu))
    }
}

/// Keeps a partition counted as active. Dropping it deactivates.
#[derive(Debug)]
pub struct Activation {
    gate: Arc<HostGate>,
}

impl Drop for Activation {
    fn drop(&mut self) {
        let _hotplug = self.gate.hotplug.read().unwrap();
        let count = self.gate.vm_count.fetch_sub(1, Ordering::AcqRel) - 1;
        debug!("Partition deactivated, {} active", count);
    }
}
