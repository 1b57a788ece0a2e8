// Copyright © 2026 The Cloud Hypervisor Authors
//
// SPDX-License-Identifier: Apache-2.0
//

//! Guest physical to host physical address resolution from real mode.
//!
//! Two routes exist. When the guest memory has been pre-registered for
//! DMA the pinned region gives the host physical address by arithmetic.
//! Otherwise a single lookup in the host page table is attempted, which
//! only succeeds for base-size pages that are already marked accessed:
//! anything else would need a fault or a multi-level walk of a huge page
//! and is left to virtual mode.

use std::hint;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use vm_device::{RealMode, TcePerm};

use crate::pinned::{PinnedMemory, PinnedRegion};
use crate::{Error, Result, PAGE_MASK, PAGE_SHIFT, PAGE_SIZE};

const RMAP_LOCK_BIT: u64 = 1 << 63;

/// Reverse-map word of one guest page. The top bit serializes everyone
/// resolving or tearing down the host mapping of that page.
#[derive(Debug, Default)]
pub struct Rmap(AtomicU64);

impl Rmap {
    /// Spin until the lock bit is ours. Never sleeps.
    pub fn lock(&self, _rm: &RealMode) -> RmapGuard<'_> {
        while self.0.fetch_or(RMAP_LOCK_BIT, Ordering::Acquire) & RMAP_LOCK_BIT != 0 {
            while self.is_locked() {
                hint::spin_loop();
            }
        }
        RmapGuard { rmap: self }
    }

    pub fn is_locked(&self) -> bool {
        self.0.load(Ordering::Relaxed) & RMAP_LOCK_BIT != 0
    }
}

/// Holds the rmap lock bit, released on drop.
#[derive(Debug)]
pub struct RmapGuard<'a> {
    rmap: &'a Rmap,
}

impl Drop for RmapGuard<'_> {
    fn drop(&mut self) {
        self.rmap.0.fetch_and(!RMAP_LOCK_BIT, Ordering::Release);
    }
}

/// A range of guest frames backed by a range of host userspace memory.
#[derive(Debug)]
pub struct MemorySlot {
    base_gfn: u64,
    npages: u64,
    userspace_addr: u64,
    rmap: Box<[Rmap]>,
}

impl MemorySlot {
    pub fn new(base_gfn: u64, npages: u64, userspace_addr: u64) -> Self {
        MemorySlot {
            base_gfn,
            npages,
            userspace_addr,
            rmap: (0..npages).map(|_| Rmap::default()).collect(),
        }
    }

    pub fn base_gfn(&self) -> u64 {
        self.base_gfn
    }

    pub fn npages(&self) -> u64 {
        self.npages
    }

    fn end_gfn(&self) -> u64 {
        self.base_gfn + self.npages
    }

    fn contains(&self, gfn: u64) -> bool {
        gfn >= self.base_gfn && gfn < self.end_gfn()
    }

    fn gfn_to_hva(&self, gfn: u64) -> u64 {
        self.userspace_addr + ((gfn - self.base_gfn) << PAGE_SHIFT)
    }

    pub fn rmap(&self, gfn: u64) -> Option<&Rmap> {
        if !self.contains(gfn) {
            return None;
        }
        self.rmap.get((gfn - self.base_gfn) as usize)
    }
}

/// The partition's memory slots, sorted by guest frame number.
///
/// Built before the guest runs; real mode only ever reads it.
#[derive(Debug, Default)]
pub struct MemorySlots {
    slots: Vec<MemorySlot>,
}

impl MemorySlots {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert `slot`, returning false if it overlaps an existing slot.
    pub fn insert(&mut self, slot: MemorySlot) -> bool {
        let pos = self
            .slots
            .partition_point(|s| s.base_gfn < slot.base_gfn);
        if pos > 0 && self.slots[pos - 1].end_gfn() > slot.base_gfn {
            return false;
        }
        if pos < self.slots.len() && slot.end_gfn() > self.slots[pos].base_gfn {
            return false;
        }
        self.slots.insert(pos, slot);
        true
    }

    pub fn search(&self, gfn: u64) -> Option<&MemorySlot> {
        let pos = self.slots.partition_point(|s| s.end_gfn() <= gfn);
        self.slots.get(pos).filter(|s| s.contains(gfn))
    }

    /// Guest physical address to host userspace address, along with the
    /// reverse-map word of the page.
    ///
    /// Permission bits in the low bits of `gpa` are ignored.
    pub fn gpa_to_ua(&self, gpa: u64) -> Result<(u64, &Rmap)> {
        let gfn = gpa >> PAGE_SHIFT;
        let slot = self.search(gfn).ok_or(Error::InvalidAddress(gpa))?;
        let rmap = slot.rmap(gfn).ok_or(Error::InvalidAddress(gpa))?;
        let ua = slot.gfn_to_hva(gfn) | (gpa & !(PAGE_MASK | TcePerm::all().bits()));
        Ok((ua, rmap))
    }
}

/// Host page table entry as seen by the restricted walker.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct HostPte {
    pub pfn: u64,
    /// Log2 of the page size, 0 meaning the base page size.
    pub shift: u32,
    pub present: bool,
    /// Accessed bit. Setting it requires a fault.
    pub young: bool,
}

/// The host's single-lookup page table walk primitive.
pub trait HostPageTable: Send + Sync {
    fn find_pte(&self, rm: &RealMode, ua: u64) -> Option<HostPte>;
}

/// Resolves guest addresses of one partition on behalf of a vCPU.
#[derive(Clone, Copy)]
pub struct Translator<'a> {
    slots: &'a MemorySlots,
    pinned: Option<&'a PinnedMemory>,
    pgdir: &'a dyn HostPageTable,
}

impl<'a> Translator<'a> {
    /// `pinned` is `None` when the vCPU task has no memory context to look
    /// pre-registered regions up in.
    pub fn new(
        slots: &'a MemorySlots,
        pinned: Option<&'a PinnedMemory>,
        pgdir: &'a dyn HostPageTable,
    ) -> Self {
        Translator {
            slots,
            pinned,
            pgdir,
        }
    }

    pub fn slots(&self) -> &'a MemorySlots {
        self.slots
    }

    /// Whether any guest memory has been pre-registered for DMA.
    pub fn preregistered(&self) -> bool {
        self.pinned.is_some_and(|p| p.preregistered())
    }

    /// Pinned region covering `[ua, ua + size)`.
    pub fn lookup_pinned(&self, rm: &RealMode, ua: u64, size: u64) -> Option<Arc<PinnedRegion>> {
        self.pinned?.lookup(rm, ua, size)
    }

    /// Resolve through pre-registered memory. Fails with
    /// [`Error::Hardware`] when no registered region covers the page.
    pub fn gpa_to_hpa_pinned(
        &self,
        rm: &RealMode,
        gpa: u64,
        size: u64,
    ) -> Result<(u64, u64, Arc<PinnedRegion>)> {
        let (ua, _) = self.slots.gpa_to_ua(gpa)?;
        let region = self.lookup_pinned(rm, ua, size).ok_or(Error::Hardware)?;
        let hpa = region.ua_to_hpa(rm, ua).ok_or(Error::Hardware)?;
        Ok((hpa, ua, region))
    }

    /// Resolve through the host page table while holding the rmap lock of
    /// the page. The lock is released when the returned guard is dropped,
    /// or right away on failure.
    pub fn gpa_to_hpa_walk(&self, rm: &RealMode, gpa: u64) -> Result<(u64, RmapGuard<'a>)> {
        let (ua, rmap) = self.slots.gpa_to_ua(gpa)?;
        let guard = rmap.lock(rm);
        let hpa = self.ua_to_hpa_walk(rm, ua)?;
        Ok((hpa, guard))
    }

    fn ua_to_hpa_walk(&self, rm: &RealMode, ua: u64) -> Result<u64> {
        let pte = match self.pgdir.find_pte(rm, ua) {
            Some(pte) if pte.present => pte,
            _ => return Err(Error::TooHard),
        };

        let shift = if pte.shift == 0 { PAGE_SHIFT } else { pte.shift };
        if shift > PAGE_SHIFT || !pte.young {
            return Err(Error::Retry);
        }

        Ok((pte.pfn << PAGE_SHIFT) | (ua & (PAGE_SIZE - 1)))
    }
}
