// Copyright © 2026 The Cloud Hypervisor Authors
//
// SPDX-License-Identifier: Apache-2.0
//

use std::sync::atomic::{AtomicU64, Ordering};

use bitflags::bitflags;
use thiserror::Error;

use crate::context::RealMode;

bitflags! {
    /// Permission bits carried in the low bits of a TCE.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct TcePerm: u64 {
        /// The device may read the page.
        const READ = 0x1;
        /// The device may write the page.
        const WRITE = 0x2;
    }
}

/// Direction of DMA allowed by a translation entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DmaDirection {
    /// Entry is not mapped.
    None,
    /// Device reads from memory.
    ToDevice,
    /// Device writes to memory.
    FromDevice,
    Bidirectional,
}

impl DmaDirection {
    /// Decode the direction from the permission bits of a TCE.
    pub fn from_tce(tce: u64) -> Self {
        let perm = TcePerm::from_bits_truncate(tce);
        if perm.contains(TcePerm::READ | TcePerm::WRITE) {
            DmaDirection::Bidirectional
        } else if perm.contains(TcePerm::READ) {
            DmaDirection::ToDevice
        } else if perm.contains(TcePerm::WRITE) {
            DmaDirection::FromDevice
        } else {
            DmaDirection::None
        }
    }

    pub fn perm(self) -> TcePerm {
        match self {
            DmaDirection::None => TcePerm::empty(),
            DmaDirection::ToDevice => TcePerm::READ,
            DmaDirection::FromDevice => TcePerm::WRITE,
            DmaDirection::Bidirectional => TcePerm::READ | TcePerm::WRITE,
        }
    }
}

/// Strip the permission bits from a TCE, leaving the page address.
pub fn tce_to_address(tce: u64) -> u64 {
    tce & !TcePerm::all().bits()
}

#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum IommuError {
    #[error("I/O bus address {0:#x} is not aligned to the IOMMU page size")]
    MisalignedIoba(u64),
    #[error("Address {0:#x} is not aligned to the IOMMU page size")]
    MisalignedAddress(u64),
    #[error("Entry {0:#x} is outside the IOMMU window")]
    OutOfRange(u64),
    #[error("Clearing with a non-zero value {0:#x}")]
    NonZeroClear(u64),
    #[error("Hardware refused to update entry {0:#x}")]
    Exchange(u64),
}

/// A hardware DMA translation table attached to a passthrough device.
///
/// Implementations may be shared between several guest-visible TCE tables.
pub trait IommuTable: Send + Sync {
    /// Log2 of the IOMMU page size.
    fn page_shift(&self) -> u32;

    /// First entry number of the window.
    fn offset(&self) -> u64;

    /// Number of entries in the window.
    fn size(&self) -> u64;

    /// Atomically install `(hpa, dir)` at `entry` and return the mapping
    /// that was there before.
    fn xchg(
        &self,
        rm: &RealMode,
        entry: u64,
        hpa: u64,
        dir: DmaDirection,
    ) -> Result<(u64, DmaDirection), IommuError>;

    /// Owner record of `entry`: the userspace address the entry was mapped
    /// from, or 0 when the entry does not reference pinned memory.
    fn userspace_entry(&self, entry: u64) -> Option<&AtomicU64>;

    fn page_mask(&self) -> u64 {
        !((1u64 << self.page_shift()) - 1)
    }

    /// Check a single-entry map request against the hardware window.
    fn put_param_check(&self, ioba: u64, gpa: u64) -> Result<(), IommuError> {
        if gpa & !self.page_mask() != 0 {
            return Err(IommuError::MisalignedAddress(gpa));
        }
        self.window_check(ioba, 1)
    }

    /// Check a clear request of `npages` entries against the hardware window.
    fn clear_param_check(&self, ioba: u64, value: u64, npages: u64) -> Result<(), IommuError> {
        if value != 0 {
            return Err(IommuError::NonZeroClear(value));
        }
        self.window_check(ioba, npages)
    }

    fn window_check(&self, ioba: u64, npages: u64) -> Result<(), IommuError> {
        if ioba & !self.page_mask() != 0 {
            return Err(IommuError::MisalignedIoba(ioba));
        }
        let entry = ioba >> self.page_shift();
        let end = self.offset().saturating_add(self.size());
        if entry < self.offset() || entry.saturating_add(npages) > end {
            return Err(IommuError::OutOfRange(entry));
        }
        Ok(())
    }
}

/// An IOMMU table kept in ordinary memory, one atomic word per entry.
///
/// Each word holds the host physical page address with the permission bits
/// in the low bits, the same layout the hardware uses, so an exchange is a
/// single atomic swap.
pub struct AtomicIommuTable {
    page_shift: u32,
    offset: u64,
    entries: Vec<AtomicU64>,
    userspace: Vec<AtomicU64>,
}

impl AtomicIommuTable {
    pub fn new(page_shift: u32, offset: u64, size: u64) -> Self {
        let entries = (0..size).map(|_| AtomicU64::new(0)).collect();
        let userspace = (0..size).map(|_| AtomicU64::new(0)).collect();
        AtomicIommuTable {
            page_shift,
            offset,
            entries,
            userspace,
        }
    }

    fn slot(&self, entry: u64) -> Option<usize> {
        let idx = entry.checked_sub(self.offset)?;
        if idx < self.entries.len() as u64 {
            Some(idx as usize)
        } else {
            None
        }
    }

    /// Current mapping of `entry`, if the entry is inside the window.
    pub fn get(&self, entry: u64) -> Option<(u64, DmaDirection)> {
        let raw = self.entries[self.slot(entry)?].load(Ordering::Acquire);
        Some((tce_to_address(raw), DmaDirection::from_tce(raw)))
    }
}

impl IommuTable for AtomicIommuTable {
    fn page_shift(&self) -> u32 {
        self.page_shift
    }

    fn offset(&self) -> u64 {
        self.offset
    }

    fn size(&self) -> u64 {
        self.entries.len() as u64
    }

    fn xchg(
        &self,
        _rm: &RealMode,
        entry: u64,
        hpa: u64,
        dir: DmaDirection,
    ) -> Result<(u64, DmaDirection), IommuError> {
        let idx = self.slot(entry).ok_or(IommuError::Exchange(entry))?;
        let new = if dir == DmaDirection::None {
            0
        } else {
            tce_to_address(hpa) | dir.perm().bits()
        };
        let old = self.entries[idx].swap(new, Ordering::AcqRel);
        Ok((tce_to_address(old), DmaDirection::from_tce(old)))
    }

    fn userspace_entry(&self, entry: u64) -> Option<&AtomicU64> {
        self.slot(entry).map(|idx| &self.userspace[idx])
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_direction_from_tce() {
        assert_eq!(DmaDirection::from_tce(0x1000), DmaDirection::None);
        assert_eq!(DmaDirection::from_tce(0x1001), DmaDirection::ToDevice);
        assert_eq!(DmaDirection::from_tce(0x1002), DmaDirection::FromDevice);
        assert_eq!(DmaDirection::from_tce(0x1003), DmaDirection::Bidirectional);
    }

    #[test]
    fn test_param_checks() {
        let tbl = AtomicIommuTable::new(12, 2, 4);

        assert!(tbl.put_param_check(0x2000, 0x10000).is_ok());
        assert!(tbl.put_param_check(0x5000, 0x10000).is_ok());
        assert_eq!(
            tbl.put_param_check(0x1000, 0x10000),
            Err(IommuError::OutOfRange(1))
        );
        assert_eq!(
            tbl.put_param_check(0x6000, 0x10000),
            Err(IommuError::OutOfRange(6))
        );
        assert_eq!(
            tbl.put_param_check(0x2000, 0x10010),
            Err(IommuError::MisalignedAddress(0x10010))
        );
        assert_eq!(
            tbl.put_param_check(0x2008, 0x10000),
            Err(IommuError::MisalignedIoba(0x2008))
        );

        assert!(tbl.clear_param_check(0x2000, 0, 4).is_ok());
        assert_eq!(
            tbl.clear_param_check(0x2000, 0, 5),
            Err(IommuError::OutOfRange(2))
        );
        assert_eq!(
            tbl.clear_param_check(0x2000, 0x1000, 1),
            Err(IommuError::NonZeroClear(0x1000))
        );
    }

    #[test]
    fn test_xchg_returns_previous_mapping() {
        // SAFETY: unit test, nothing blocks while the token is alive.
        let rm = unsafe { RealMode::assume() };
        let tbl = AtomicIommuTable::new(12, 0, 2);

        let old = tbl.xchg(&rm, 1, 0xabc000, DmaDirection::FromDevice).unwrap();
        assert_eq!(old, (0, DmaDirection::None));
        assert_eq!(tbl.get(1), Some((0xabc000, DmaDirection::FromDevice)));

        let old = tbl.xchg(&rm, 1, 0, DmaDirection::None).unwrap();
        assert_eq!(old, (0xabc000, DmaDirection::FromDevice));
        assert_eq!(tbl.get(1), Some((0, DmaDirection::None)));

        assert_eq!(
            tbl.xchg(&rm, 2, 0x1000, DmaDirection::ToDevice),
            Err(IommuError::Exchange(2))
        );
        assert!(tbl.userspace_entry(2).is_none());
    }
}
