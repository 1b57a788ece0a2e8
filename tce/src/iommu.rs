// Copyright © 2026 The Cloud Hypervisor Authors
//
// SPDX-License-Identifier: Apache-2.0
//

//! Updates of the hardware IOMMU tables attached to a TCE table.
//!
//! Every hardware entry that maps guest memory holds a reference on the
//! pinned region it points into, and remembers the userspace address it was
//! mapped from in its owner record so the reference can be dropped again
//! when the entry is replaced or cleared.

use std::sync::atomic::Ordering;

use vm_device::iommu::tce_to_address;
use vm_device::{DmaDirection, IommuTable, RealMode};

use crate::translate::Translator;
use crate::{Error, Result};

fn mapped_dec(tr: &Translator, rm: &RealMode, tbl: &dyn IommuTable, entry: u64) -> Result<()> {
    // Tables without owner records never took a reference.
    let Some(owner) = tbl.userspace_entry(entry) else {
        return Ok(());
    };

    let ua = owner.load(Ordering::Acquire);
    let region = tr
        .lookup_pinned(rm, ua, 1 << tbl.page_shift())
        .ok_or(Error::Hardware)?;
    region.mapped_dec();
    owner.store(0, Ordering::Release);

    Ok(())
}

fn unmap(tr: &Translator, rm: &RealMode, tbl: &dyn IommuTable, entry: u64) -> Result<()> {
    let (_, dir) = tbl
        .xchg(rm, entry, 0, DmaDirection::None)
        .map_err(|_| Error::Hardware)?;
    if dir == DmaDirection::None {
        return Ok(());
    }

    mapped_dec(tr, rm, tbl, entry)
}

fn map(
    tr: &Translator,
    rm: &RealMode,
    tbl: &dyn IommuTable,
    entry: u64,
    gpa: u64,
    dir: DmaDirection,
) -> Result<()> {
    let (hpa, ua, region) = tr
        .gpa_to_hpa_pinned(rm, gpa, 1 << tbl.page_shift())
        .map_err(|_| Error::Hardware)?;
    let owner = tbl.userspace_entry(entry).ok_or(Error::Hardware)?;

    region.mapped_inc()?;
    let (_, old_dir) = match tbl.xchg(rm, entry, hpa, dir) {
        Ok(old) => old,
        Err(_) => {
            region.mapped_dec();
            return Err(Error::TooHard);
        }
    };

    if old_dir != DmaDirection::None {
        // The previous owner may already be gone, the new mapping stands.
        let _ = mapped_dec(tr, rm, tbl, entry);
    }
    owner.store(ua, Ordering::Release);

    Ok(())
}

/// Apply one guest TCE to a hardware table.
pub(crate) fn put_tce(
    tr: &Translator,
    rm: &RealMode,
    tbl: &dyn IommuTable,
    ioba: u64,
    tce: u64,
) -> Result<()> {
    let entry = ioba >> tbl.page_shift();
    let gpa = tce_to_address(tce);
    let dir = DmaDirection::from_tce(tce);

    if dir == DmaDirection::None {
        tbl.clear_param_check(ioba, 0, 1)
            .map_err(|_| Error::Parameter)?;
        return unmap(tr, rm, tbl, entry);
    }

    tbl.put_param_check(ioba, gpa)
        .map_err(|_| Error::Parameter)?;
    map(tr, rm, tbl, entry, gpa, dir)
}

/// Apply a list of guest TCEs to a hardware table.
///
/// Every entry is checked before the first one is applied. Once applying
/// has started a failure stops at the failing entry, leaving the earlier
/// ones in place.
pub(crate) fn put_tce_indirect(
    tr: &Translator,
    rm: &RealMode,
    tbl: &dyn IommuTable,
    ioba: u64,
    tces: &[u64],
) -> Result<()> {
    let shift = tbl.page_shift();
    let entry = ioba >> shift;

    for (i, tce) in tces.iter().enumerate() {
        tbl.put_param_check(ioba + ((i as u64) << shift), tce_to_address(*tce))
            .map_err(|_| Error::Parameter)?;
    }

    for (i, tce) in tces.iter().enumerate() {
        let entry = entry + i as u64;
        match DmaDirection::from_tce(*tce) {
            DmaDirection::None => unmap(tr, rm, tbl, entry)?,
            dir => map(tr, rm, tbl, entry, tce_to_address(*tce), dir)?,
        }
    }

    Ok(())
}

/// Clear `npages` hardware entries from `ioba` on.
///
/// Entries whose owner cannot be resolved are still cleared, the failure
/// is not reported.
pub(crate) fn stuff_tce(
    tr: &Translator,
    rm: &RealMode,
    tbl: &dyn IommuTable,
    ioba: u64,
    value: u64,
    npages: u64,
) -> Result<()> {
    let entry = ioba >> tbl.page_shift();
    tbl.clear_param_check(ioba, value, npages)
        .map_err(|_| Error::Parameter)?;

    for i in 0..npages {
        let _ = unmap(tr, rm, tbl, entry + i);
    }

    Ok(())
}
