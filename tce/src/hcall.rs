// Copyright © 2026 The Cloud Hypervisor Authors
//
// SPDX-License-Identifier: Apache-2.0
//

use vm_device::{RealMode, TcePerm};
use vm_memory::{Be64, Bytes, GuestAddress, GuestMemoryMmap};

use crate::table::{TceTable, TceTables};
use crate::translate::Translator;
use crate::{iommu, Error, Result, IOMMU_PAGE_SIZE_4K, MAX_INDIRECT_TCES};

/// Everything a vCPU needs to serve TCE hypercalls of its partition.
///
/// `host_mem` is the host physical memory the indirect TCE lists are read
/// from once their guest address has been translated.
pub struct TceContext<'a> {
    tables: &'a TceTables,
    translator: Translator<'a>,
    host_mem: &'a GuestMemoryMmap,
}

impl<'a> TceContext<'a> {
    pub fn new(
        tables: &'a TceTables,
        translator: Translator<'a>,
        host_mem: &'a GuestMemoryMmap,
    ) -> Self {
        TceContext {
            tables,
            translator,
            host_mem,
        }
    }

    fn table(&self, liobn: u64) -> Result<std::sync::Arc<TceTable>> {
        self.tables.find(liobn).ok_or(Error::TooHard)
    }

    /// H_PUT_TCE: map or clear a single entry.
    pub fn h_put_tce(&self, rm: &RealMode, liobn: u64, ioba: u64, tce: u64) -> Result<()> {
        let table = self.table(liobn)?;
        table.validate_ioba(ioba, 1)?;
        table.validate_tce(tce)?;

        table.try_for_each_group(|tbl| iommu::put_tce(&self.translator, rm, tbl, ioba, tce))?;

        table.put(ioba >> table.page_shift(), tce);
        Ok(())
    }

    /// H_PUT_TCE_INDIRECT: apply a guest page holding up to 512 TCEs.
    pub fn h_put_tce_indirect(
        &self,
        rm: &RealMode,
        liobn: u64,
        ioba: u64,
        tce_list: u64,
        npages: u64,
    ) -> Result<()> {
        let table = self.table(liobn)?;
        let entry = ioba >> table.page_shift();

        if npages > MAX_INDIRECT_TCES as u64 {
            return Err(Error::Parameter);
        }
        if tce_list & (IOMMU_PAGE_SIZE_4K - 1) != 0 {
            return Err(Error::Parameter);
        }
        table.validate_ioba(ioba, npages)?;

        let mut buf = [0u64; MAX_INDIRECT_TCES];
        let tces = &mut buf[..npages as usize];

        // Held until every entry has been stored.
        let _rmap;
        if self.translator.preregistered() {
            let (hpa, _, _) = self
                .translator
                .gpa_to_hpa_pinned(rm, tce_list, IOMMU_PAGE_SIZE_4K)
                .map_err(|_| Error::TooHard)?;
            self.read_tces(hpa, tces)?;

            let tces = &*tces;
            table.try_for_each_group(|tbl| {
                iommu::put_tce_indirect(&self.translator, rm, tbl, ioba, tces)
            })?;
        } else {
            // Hardware groups can only map pinned memory.
            if table.has_groups() {
                return Err(Error::TooHard);
            }

            let (hpa, guard) = self
                .translator
                .gpa_to_hpa_walk(rm, tce_list)
                .map_err(|_| Error::TooHard)?;
            _rmap = guard;
            self.read_tces(hpa, tces)?;
        }

        for (i, tce) in tces.iter().enumerate() {
            table.validate_tce(*tce)?;
            table.put(entry + i as u64, *tce);
        }

        Ok(())
    }

    /// H_STUFF_TCE: set `npages` entries to one value, which can only ever
    /// be a clear.
    pub fn h_stuff_tce(
        &self,
        rm: &RealMode,
        liobn: u64,
        ioba: u64,
        value: u64,
        npages: u64,
    ) -> Result<()> {
        let table = self.table(liobn)?;
        table.validate_ioba(ioba, npages)?;
        table.validate_tce(value)?;
        if value & TcePerm::all().bits() != 0 {
            return Err(Error::Parameter);
        }

        table.try_for_each_group(|tbl| {
            iommu::stuff_tce(&self.translator, rm, tbl, ioba, value, npages)
        })?;

        let entry = ioba >> table.page_shift();
        for i in 0..npages {
            table.put(entry + i, value);
        }

        Ok(())
    }

    /// H_GET_TCE: read back one emulated entry.
    pub fn h_get_tce(&self, _rm: &RealMode, liobn: u64, ioba: u64) -> Result<u64> {
        self.table(liobn)?.get(ioba)
    }

    // The list is copied out once so later guest writes to it cannot change
    // what has been validated.
    fn read_tces(&self, hpa: u64, tces: &mut [u64]) -> Result<()> {
        for (i, tce) in tces.iter_mut().enumerate() {
            let addr = GuestAddress(hpa + (i * std::mem::size_of::<u64>()) as u64);
            let raw: Be64 = self
                .host_mem
                .read_obj(addr)
                .map_err(|_| Error::TooHard)?;
            *tce = u64::from(raw);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use vm_device::{AtomicIommuTable, DmaDirection, IommuTable, VirtualMode};

    use super::*;
    use crate::pinned::{PinnedMemory, PinnedRegion};
    use crate::translate::tests::{rm, TestPageTable};
    use crate::translate::{MemorySlot, MemorySlots};

    const LIOBN: u64 = 0x8000_0001;
    const UA: u64 = 0x7000_0000;
    // Host physical address backing guest page 0.
    const HPA: u64 = 0x4_0000;

    struct Fixture {
        tables: TceTables,
        slots: MemorySlots,
        pinned: PinnedMemory,
        pgdir: TestPageTable,
        host_mem: GuestMemoryMmap,
    }

    impl Fixture {
        fn new() -> Self {
            let vm = vm();
            let tables = TceTables::new();
            tables.create(&vm, TceTable::new(LIOBN, 12, 0, 4).unwrap());

            let mut slots = MemorySlots::new();
            slots.insert(MemorySlot::new(0, 16, UA));

            let mut pgdir = TestPageTable::default();
            for i in 0..16 {
                pgdir.map(UA + (i << 12), (HPA >> 12) + i);
            }

            Fixture {
                tables,
                slots,
                pinned: PinnedMemory::new(),
                pgdir,
                host_mem: GuestMemoryMmap::from_ranges(&[(GuestAddress(0), 0x10_0000)]).unwrap(),
            }
        }

        fn pin(&self) {
            let hpas = (0..16).map(|i| HPA + (i << 12)).collect();
            self.pinned
                .register(&vm(), PinnedRegion::new(UA, hpas))
                .unwrap();
        }

        fn ctx(&self) -> TceContext<'_> {
            TceContext::new(
                &self.tables,
                Translator::new(&self.slots, Some(&self.pinned), &self.pgdir),
                &self.host_mem,
            )
        }

        fn write_list(&self, gpa: u64, tces: &[u64]) {
            for (i, tce) in tces.iter().enumerate() {
                self.host_mem
                    .write_obj(Be64::from(*tce), GuestAddress(HPA + gpa + (i as u64) * 8))
                    .unwrap();
            }
        }
    }

    fn vm() -> VirtualMode {
        // SAFETY: unit tests run on ordinary host threads.
        unsafe { VirtualMode::assume() }
    }

    #[test]
    fn test_put_get() {
        let rm = rm();
        let f = Fixture::new();
        let ctx = f.ctx();

        ctx.h_put_tce(&rm, LIOBN, 0x1000, 0xabcd_0000).unwrap();
        assert_eq!(ctx.h_get_tce(&rm, LIOBN, 0x1000), Ok(0xabcd_0000));
        assert_eq!(ctx.h_put_tce(&rm, LIOBN, 0x1004, 0xabcd_0000), Err(Error::Parameter));
        assert_eq!(ctx.h_put_tce(&rm, LIOBN, 0x1000, 0xabcd_0010), Err(Error::Parameter));
        assert_eq!(ctx.h_put_tce(&rm, 0x42, 0x1000, 0), Err(Error::TooHard));
        assert_eq!(ctx.h_get_tce(&rm, 0x42, 0x1000), Err(Error::TooHard));
        assert_eq!(ctx.h_get_tce(&rm, LIOBN, 0x4000), Err(Error::Parameter));
    }

    #[test]
    fn test_indirect_emulated() {
        let rm = rm();
        let f = Fixture::new();
        let ctx = f.ctx();
        f.write_list(0x3000, &[0x1_0001, 0x2_0002, 0x3_0003]);

        ctx.h_put_tce_indirect(&rm, LIOBN, 0x1000, 0x3000, 3).unwrap();
        assert_eq!(ctx.h_get_tce(&rm, LIOBN, 0x0), Ok(0));
        assert_eq!(ctx.h_get_tce(&rm, LIOBN, 0x1000), Ok(0x1_0001));
        assert_eq!(ctx.h_get_tce(&rm, LIOBN, 0x2000), Ok(0x2_0002));
        assert_eq!(ctx.h_get_tce(&rm, LIOBN, 0x3000), Ok(0x3_0003));

        // The rmap lock of the list page was released.
        assert!(!f.slots.search(3).unwrap().rmap(3).unwrap().is_locked());

        assert_eq!(
            ctx.h_put_tce_indirect(&rm, LIOBN, 0x0, 0x3000, 513),
            Err(Error::Parameter)
        );
        assert_eq!(
            ctx.h_put_tce_indirect(&rm, LIOBN, 0x0, 0x3008, 1),
            Err(Error::Parameter)
        );
        assert_eq!(
            ctx.h_put_tce_indirect(&rm, LIOBN, 0x2000, 0x3000, 3),
            Err(Error::Parameter)
        );
        // List outside guest memory.
        assert_eq!(
            ctx.h_put_tce_indirect(&rm, LIOBN, 0x0, 0x10_0000, 1),
            Err(Error::TooHard)
        );
    }

    #[test]
    fn test_indirect_stops_at_bad_entry() {
        let rm = rm();
        let f = Fixture::new();
        let ctx = f.ctx();
        f.write_list(0x3000, &[0x1_0001, 0x2_0ff2, 0x3_0003]);

        assert_eq!(
            ctx.h_put_tce_indirect(&rm, LIOBN, 0x0, 0x3000, 3),
            Err(Error::Parameter)
        );
        assert_eq!(ctx.h_get_tce(&rm, LIOBN, 0x0), Ok(0x1_0001));
        assert_eq!(ctx.h_get_tce(&rm, LIOBN, 0x1000), Ok(0));
        assert!(!f.slots.search(3).unwrap().rmap(3).unwrap().is_locked());
    }

    #[test]
    fn test_indirect_with_group() {
        let rm = rm();
        let f = Fixture::new();
        f.pin();
        let hw = Arc::new(AtomicIommuTable::new(12, 0, 4));
        f.tables
            .find(LIOBN)
            .unwrap()
            .attach_group(&vm(), 1, hw.clone())
            .unwrap();
        let ctx = f.ctx();

        f.write_list(0x5000, &[0x1003, 0x2001]);
        ctx.h_put_tce_indirect(&rm, LIOBN, 0x2000, 0x5000, 2).unwrap();
        assert_eq!(hw.get(2), Some((HPA + 0x1000, DmaDirection::Bidirectional)));
        assert_eq!(hw.get(3), Some((HPA + 0x2000, DmaDirection::ToDevice)));
        assert_eq!(ctx.h_get_tce(&rm, LIOBN, 0x3000), Ok(0x2001));
    }

    #[test]
    fn test_group_failure_leaves_emulated_store() {
        let rm = rm();
        let f = Fixture::new();
        f.pin();
        let hw = Arc::new(AtomicIommuTable::new(12, 0, 2));
        f.tables
            .find(LIOBN)
            .unwrap()
            .attach_group(&vm(), 1, hw.clone())
            .unwrap();
        let ctx = f.ctx();

        ctx.h_put_tce(&rm, LIOBN, 0x1000, 0x4003).unwrap();
        assert_eq!(hw.get(1), Some((HPA + 0x4000, DmaDirection::Bidirectional)));
        assert_eq!(ctx.h_get_tce(&rm, LIOBN, 0x1000), Ok(0x4003));

        // Entry 3 is inside the TCE window but not the hardware one.
        assert_eq!(ctx.h_put_tce(&rm, LIOBN, 0x3000, 0x4003), Err(Error::Parameter));
        assert_eq!(ctx.h_get_tce(&rm, LIOBN, 0x3000), Ok(0));

        // Unpinned guest page.
        assert_eq!(ctx.h_put_tce(&rm, LIOBN, 0x0, 0x20_0001), Err(Error::Hardware));
        assert_eq!(ctx.h_get_tce(&rm, LIOBN, 0x0), Ok(0));
    }

    #[test]
    fn test_second_group_failure_keeps_first_group() {
        let rm = rm();
        let f = Fixture::new();
        f.pin();
        let wide = Arc::new(AtomicIommuTable::new(12, 0, 4));
        let narrow = Arc::new(AtomicIommuTable::new(12, 0, 2));
        let table = f.tables.find(LIOBN).unwrap();
        table.attach_group(&vm(), 1, wide.clone()).unwrap();
        table.attach_group(&vm(), 2, narrow.clone()).unwrap();
        let ctx = f.ctx();

        assert_eq!(ctx.h_put_tce(&rm, LIOBN, 0x3000, 0x4003), Err(Error::Parameter));
        // No rollback of the groups already updated.
        assert_eq!(wide.get(3), Some((HPA + 0x4000, DmaDirection::Bidirectional)));
        assert_eq!(f.pinned.lookup(&rm, UA, 1).unwrap().mapped(), 1);
        assert_eq!(ctx.h_get_tce(&rm, LIOBN, 0x3000), Ok(0));

        ctx.h_put_tce(&rm, LIOBN, 0x1000, 0x5001).unwrap();
        assert_eq!(wide.get(1), Some((HPA + 0x5000, DmaDirection::ToDevice)));
        assert_eq!(narrow.get(1), Some((HPA + 0x5000, DmaDirection::ToDevice)));
        assert_eq!(ctx.h_get_tce(&rm, LIOBN, 0x1000), Ok(0x5001));
    }

    #[test]
    fn test_stuff() {
        let rm = rm();
        let f = Fixture::new();
        f.pin();
        let hw = Arc::new(AtomicIommuTable::new(12, 0, 4));
        f.tables
            .find(LIOBN)
            .unwrap()
            .attach_group(&vm(), 1, hw.clone())
            .unwrap();
        let ctx = f.ctx();

        for i in 0..4 {
            ctx.h_put_tce(&rm, LIOBN, i << 12, (i << 12) | 0x3).unwrap();
        }
        let region = f.pinned.lookup(&rm, UA, 1).unwrap();
        assert_eq!(region.mapped(), 4);

        assert_eq!(ctx.h_stuff_tce(&rm, LIOBN, 0, 0x1, 4), Err(Error::Parameter));
        assert_eq!(ctx.h_stuff_tce(&rm, LIOBN, 0, 0x10, 4), Err(Error::Parameter));
        assert_eq!(ctx.h_stuff_tce(&rm, LIOBN, 0, 0, 5), Err(Error::Parameter));

        ctx.h_stuff_tce(&rm, LIOBN, 0, 0, 4).unwrap();
        for i in 0..4 {
            assert_eq!(hw.get(i), Some((0, DmaDirection::None)));
            assert_eq!(ctx.h_get_tce(&rm, LIOBN, i << 12), Ok(0));
        }
        assert_eq!(region.mapped(), 0);
        assert_eq!(hw.userspace_entry(0).unwrap().load(std::sync::atomic::Ordering::Relaxed), 0);
    }
}
