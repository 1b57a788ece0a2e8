// Copyright © 2026 The Cloud Hypervisor Authors
//
// SPDX-License-Identifier: Apache-2.0
//

use std::sync::Arc;

use tce::{
    HostPageTable, MemorySlot, MemorySlots, PinnedMemory, PinnedRegion, TceContext, TceTable,
    TceTables, Translator,
};
use vm_allocator::{ContiguousPool, HptReservoir};
use vm_device::{IommuTable, VirtualMode};
use vm_memory::GuestMemoryMmap;

use crate::activation::{Activation, HostGate};
use crate::interrupt::PassthroughMap;
use crate::{Error, Result};

/// Where the hashed page table of a partition was carved from.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum HptSource {
    Reservoir,
    Pool,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Hpt {
    pub addr: u64,
    pub order: u32,
    pub source: HptSource,
}

/// Allocate a hashed page table of `2^order` bytes, from the boot-time
/// reservoir first and the contiguous pool otherwise.
pub fn alloc_hpt(
    vm: &VirtualMode,
    order: u32,
    reservoir: Option<&HptReservoir>,
    pool: Option<&ContiguousPool>,
) -> Result<Hpt> {
    if let Some(addr) = reservoir.and_then(|r| r.alloc(vm, order)) {
        return Ok(Hpt {
            addr,
            order,
            source: HptSource::Reservoir,
        });
    }
    if let Some(addr) = pool.and_then(|p| p.alloc(vm, order)) {
        return Ok(Hpt {
            addr,
            order,
            source: HptSource::Pool,
        });
    }

    error!("Cannot allocate a hashed page table of order {}", order);
    Err(Error::HptAllocation(order))
}

pub fn free_hpt(
    vm: &VirtualMode,
    hpt: Hpt,
    reservoir: Option<&HptReservoir>,
    pool: Option<&ContiguousPool>,
) {
    match hpt.source {
        HptSource::Reservoir => {
            if let Some(reservoir) = reservoir {
                reservoir.free(vm, hpt.addr, hpt.order);
            }
        }
        HptSource::Pool => {
            if !pool.is_some_and(|p| p.release(vm, hpt.addr, hpt.order)) {
                warn!("Hashed page table at {:#x} was not from the pool", hpt.addr);
            }
        }
    }
}

/// Per guest state reached from the real-mode paths.
///
/// A partition counts as active on its [`HostGate`] for as long as it
/// exists.
pub struct Partition {
    tables: TceTables,
    slots: MemorySlots,
    pinned: PinnedMemory,
    passthrough: PassthroughMap,
    _activation: Activation,
}

impl Partition {
    pub fn new(vm: &VirtualMode, gate: &Arc<HostGate>) -> Self {
        Partition {
            tables: TceTables::new(),
            slots: MemorySlots::new(),
            pinned: PinnedMemory::new(),
            passthrough: PassthroughMap::new(),
            _activation: gate.activate(vm),
        }
    }

    /// Memory slots are set up before any vCPU runs.
    pub fn add_memory_slot(
        &mut self,
        base_gfn: u64,
        npages: u64,
        userspace_addr: u64,
    ) -> Result<()> {
        if !self
            .slots
            .insert(MemorySlot::new(base_gfn, npages, userspace_addr))
        {
            return Err(Error::MemorySlotOverlap(base_gfn));
        }
        Ok(())
    }

    pub fn create_tce_table(
        &self,
        vm: &VirtualMode,
        liobn: u64,
        page_shift: u32,
        offset: u64,
        size: u64,
    ) -> Result<()> {
        let table = TceTable::new(liobn, page_shift, offset, size).map_err(Error::TceTable)?;
        if !self.tables.create(vm, table) {
            return Err(Error::DuplicateLiobn(liobn));
        }
        Ok(())
    }

    pub fn remove_tce_table(&self, vm: &VirtualMode, liobn: u64) -> Result<()> {
        if !self.tables.remove(vm, liobn) {
            return Err(Error::UnknownLiobn(liobn));
        }
        Ok(())
    }

    pub fn attach_iommu_group(
        &self,
        vm: &VirtualMode,
        liobn: u64,
        group: u32,
        table: Arc<dyn IommuTable>,
    ) -> Result<()> {
        self.tables
            .find(liobn)
            .ok_or(Error::UnknownLiobn(liobn))?
            .attach_group(vm, group, table)
            .map_err(|e| Error::AttachGroup(group, e))
    }

    pub fn detach_iommu_group(&self, vm: &VirtualMode, liobn: u64, group: u32) -> Result<bool> {
        let table = self.tables.find(liobn).ok_or(Error::UnknownLiobn(liobn))?;
        Ok(table.detach_group(vm, group))
    }

    pub fn preregister(&self, vm: &VirtualMode, ua: u64, hpas: Vec<u64>) -> Result<()> {
        self.pinned
            .register(vm, PinnedRegion::new(ua, hpas))
            .map(|_| ())
            .map_err(Error::Pinned)
    }

    pub fn unregister(&self, vm: &VirtualMode, ua: u64) -> Result<()> {
        self.pinned.deregister(vm, ua).map_err(Error::Pinned)
    }

    pub fn tables(&self) -> &TceTables {
        &self.tables
    }

    pub fn memory_slots(&self) -> &MemorySlots {
        &self.slots
    }

    pub fn pinned(&self) -> &PinnedMemory {
        &self.pinned
    }

    pub fn passthrough(&self) -> &PassthroughMap {
        &self.passthrough
    }

    /// TCE hypercall context of a vCPU. `has_mm` is false when the vCPU
    /// task has no memory context, pre-registered memory is not looked at
    /// then.
    pub fn tce_context<'a>(
        &'a self,
        pgdir: &'a dyn HostPageTable,
        host_mem: &'a GuestMemoryMmap,
        has_mm: bool,
    ) -> TceContext<'a> {
        let pinned = has_mm.then_some(&self.pinned);
        TceContext::new(
            &self.tables,
            Translator::new(&self.slots, pinned, pgdir),
            host_mem,
        )
    }
}
