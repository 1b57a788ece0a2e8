// Copyright © 2026 The Cloud Hypervisor Authors
//
// SPDX-License-Identifier: Apache-2.0
//

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use vm_device::{IommuTable, RcuList, TcePerm, VirtualMode};

use crate::{Error, Result, TCES_PER_PAGE};

/// One hardware IOMMU group attached to a TCE table.
pub struct TceGroup {
    id: u32,
    table: Arc<dyn IommuTable>,
}

impl TceGroup {
    pub fn id(&self) -> u32 {
        self.id
    }

    pub fn table(&self) -> &Arc<dyn IommuTable> {
        &self.table
    }
}

type TcePage = [AtomicU64; TCES_PER_PAGE];

/// Guest-visible DMA window of one virtual I/O device.
pub struct TceTable {
    liobn: u64,
    page_shift: u32,
    offset: u64,
    size: u64,
    pages: Box<[Box<TcePage>]>,
    groups: RcuList<TceGroup>,
}

impl TceTable {
    /// Window of `size` entries of `2^page_shift` bytes, starting at entry
    /// `offset` of the bus address space.
    pub fn new(liobn: u64, page_shift: u32, offset: u64, size: u64) -> Result<Self> {
        if !(12..64).contains(&page_shift) || size == 0 || offset.checked_add(size).is_none() {
            return Err(Error::Parameter);
        }

        let npages = size.div_ceil(TCES_PER_PAGE as u64) as usize;
        let pages = (0..npages)
            .map(|_| Box::new(std::array::from_fn(|_| AtomicU64::new(0))))
            .collect();

        Ok(TceTable {
            liobn,
            page_shift,
            offset,
            size,
            pages,
            groups: RcuList::new(),
        })
    }

    pub fn liobn(&self) -> u64 {
        self.liobn
    }

    pub fn page_shift(&self) -> u32 {
        self.page_shift
    }

    pub fn offset(&self) -> u64 {
        self.offset
    }

    pub fn size(&self) -> u64 {
        self.size
    }

    fn page_mask(&self) -> u64 {
        (1u64 << self.page_shift) - 1
    }

    /// Check that `npages` entries starting at `ioba` lie inside the window.
    pub fn validate_ioba(&self, ioba: u64, npages: u64) -> Result<()> {
        let idx = ioba >> self.page_shift;
        if ioba & self.page_mask() != 0 || idx < self.offset {
            return Err(Error::Parameter);
        }
        match idx.checked_add(npages) {
            Some(end) if end <= self.offset + self.size => Ok(()),
            _ => Err(Error::Parameter),
        }
    }

    /// Only the permission bits may be set below the page boundary.
    pub fn validate_tce(&self, tce: u64) -> Result<()> {
        if tce & self.page_mask() & !TcePerm::all().bits() != 0 {
            return Err(Error::Parameter);
        }
        Ok(())
    }

    /// Store `tce` at absolute entry `idx`. Both must have been validated.
    pub fn put(&self, idx: u64, tce: u64) {
        let idx = (idx - self.offset) as usize;
        self.pages[idx / TCES_PER_PAGE][idx % TCES_PER_PAGE].store(tce, Ordering::Release);
    }

    pub fn get(&self, ioba: u64) -> Result<u64> {
        self.validate_ioba(ioba, 1)?;
        let idx = ((ioba >> self.page_shift) - self.offset) as usize;
        Ok(self.pages[idx / TCES_PER_PAGE][idx % TCES_PER_PAGE].load(Ordering::Acquire))
    }

    pub fn has_groups(&self) -> bool {
        !self.groups.is_empty()
    }

    /// Attach hardware IOMMU group `id`. Attaching the same group twice is
    /// a no-op. The hardware pages must not be larger than the window's.
    pub fn attach_group(
        &self,
        vm: &VirtualMode,
        id: u32,
        table: Arc<dyn IommuTable>,
    ) -> Result<()> {
        if table.page_shift() > self.page_shift {
            warn!(
                "IOMMU group {} page shift {} exceeds {} of LIOBN {:#x}",
                id,
                table.page_shift(),
                self.page_shift,
                self.liobn
            );
            return Err(Error::Parameter);
        }

        let attached = self.groups.update(vm, |groups| {
            if groups.iter().any(|g| g.id == id) {
                return false;
            }
            groups.push(Arc::new(TceGroup { id, table }));
            true
        });

        if attached {
            info!("Attached IOMMU group {} to LIOBN {:#x}", id, self.liobn);
        }
        Ok(())
    }

    /// Detach group `id`, returning once no real-mode reader can still be
    /// using it.
    pub fn detach_group(&self, vm: &VirtualMode, id: u32) -> bool {
        let removed = self.groups.remove(vm, |g| g.id == id);
        if removed.is_empty() {
            return false;
        }
        info!("Detached IOMMU group {} from LIOBN {:#x}", id, self.liobn);
        true
    }

    /// Run `f` over the hardware tables of the attached groups, in
    /// attachment order. Consecutive groups sharing one hardware table only
    /// see it once. Stops at the first error.
    pub(crate) fn try_for_each_group(
        &self,
        mut f: impl FnMut(&dyn IommuTable) -> Result<()>,
    ) -> Result<()> {
        self.groups.read(|groups| {
            let mut last: Option<*const ()> = None;
            for group in groups {
                let ptr = Arc::as_ptr(&group.table) as *const ();
                if last == Some(ptr) {
                    continue;
                }
                last = Some(ptr);
                f(&*group.table)?;
            }
            Ok(())
        })
    }
}

/// TCE tables of one partition, looked up by LIOBN.
#[derive(Default)]
pub struct TceTables {
    tables: RcuList<TceTable>,
}

impl TceTables {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn find(&self, liobn: u64) -> Option<Arc<TceTable>> {
        self.tables.find(|t| t.liobn == liobn)
    }

    /// Register `table`. Returns false if its LIOBN is already taken.
    pub fn create(&self, vm: &VirtualMode, table: TceTable) -> bool {
        let liobn = table.liobn;
        let (window, size) = (table.offset << table.page_shift, table.size);
        let created = self.tables.update(vm, |tables| {
            if tables.iter().any(|t| t.liobn == liobn) {
                return false;
            }
            tables.push(Arc::new(table));
            true
        });

        if created {
            info!(
                "Created TCE table LIOBN {:#x}: {} entries at {:#x}",
                liobn, size, window
            );
        } else {
            warn!("TCE table LIOBN {:#x} already exists", liobn);
        }
        created
    }

    /// Drop the table `liobn`. Returns once no lookup can find it any more;
    /// handles returned by [`TceTables::find`] earlier keep it alive.
    pub fn remove(&self, vm: &VirtualMode, liobn: u64) -> bool {
        let removed = self.tables.remove(vm, |t| t.liobn == liobn);
        if removed.is_empty() {
            return false;
        }
        info!("Removed TCE table LIOBN {:#x}", liobn);
        true
    }

    pub fn len(&self) -> usize {
        self.tables.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tables.is_empty()
    }
}
