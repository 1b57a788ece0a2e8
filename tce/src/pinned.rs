// Copyright © 2026 The Cloud Hypervisor Authors
//
// SPDX-License-Identifier: Apache-2.0
//

//! Guest memory pre-registered for DMA.
//!
//! A userspace range is pinned once by the memory pre-registration service
//! and stays at fixed host physical pages until it is deregistered. Every
//! hardware IOMMU entry pointing into a region holds one count on it, so a
//! region is only released when no device can reach it any more.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use vm_device::{RcuList, RealMode, VirtualMode};

use crate::{Error, Result, PAGE_SHIFT, PAGE_SIZE};

#[derive(thiserror::Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum PinnedError {
    #[error("Region at {0:#x} overlaps a registered region")]
    Overlap(u64),
    #[error("No region registered at {0:#x}")]
    NotFound(u64),
    #[error("Region at {0:#x} still has {1} mappings")]
    Busy(u64, u64),
}

/// A pinned userspace range and the host pages backing it.
#[derive(Debug)]
pub struct PinnedRegion {
    ua: u64,
    hpas: Box<[u64]>,
    // Number of IOMMU entries mapping this region, plus one while the
    // region is registered. Zero means the region is being torn down.
    mapped: AtomicU64,
}

impl PinnedRegion {
    /// `hpas` holds the host physical address of every base page, in order.
    pub fn new(ua: u64, hpas: Vec<u64>) -> Self {
        PinnedRegion {
            ua,
            hpas: hpas.into_boxed_slice(),
            mapped: AtomicU64::new(1),
        }
    }

    pub fn ua(&self) -> u64 {
        self.ua
    }

    pub fn entries(&self) -> u64 {
        self.hpas.len() as u64
    }

    fn end(&self) -> u64 {
        self.ua + (self.entries() << PAGE_SHIFT)
    }

    /// Whether `[ua, ua + size)` lies entirely inside the region.
    pub fn contains(&self, ua: u64, size: u64) -> bool {
        match ua.checked_add(size) {
            Some(end) => ua >= self.ua && end <= self.end(),
            None => false,
        }
    }

    fn overlaps(&self, other: &PinnedRegion) -> bool {
        self.ua < other.end() && other.ua < self.end()
    }

    /// Host physical address of `ua`.
    pub fn ua_to_hpa(&self, _rm: &RealMode, ua: u64) -> Option<u64> {
        if !self.contains(ua, 1) {
            return None;
        }
        let idx = ((ua - self.ua) >> PAGE_SHIFT) as usize;
        Some(self.hpas[idx] | (ua & (PAGE_SIZE - 1)))
    }

    /// Take a mapping reference. Fails once the region is being retired.
    pub fn mapped_inc(&self) -> Result<()> {
        self.mapped
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |count| {
                if count == 0 {
                    None
                } else {
                    count.checked_add(1)
                }
            })
            .map(|_| ())
            .map_err(|_| Error::Hardware)
    }

    /// Drop a mapping reference. The registration reference is never taken.
    pub fn mapped_dec(&self) {
        let _ = self
            .mapped
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |count| {
                if count > 1 {
                    Some(count - 1)
                } else {
                    None
                }
            });
    }

    /// Number of live IOMMU mappings into the region.
    pub fn mapped(&self) -> u64 {
        self.mapped.load(Ordering::Acquire).saturating_sub(1)
    }

    // Drop the registration reference, only if nothing maps the region.
    fn try_retire(&self) -> std::result::Result<(), u64> {
        self.mapped
            .compare_exchange(1, 0, Ordering::AcqRel, Ordering::Acquire)
            .map(|_| ())
            .map_err(|count| count.saturating_sub(1))
    }
}

/// Pre-registered regions of one partition's memory context.
#[derive(Default)]
pub struct PinnedMemory {
    regions: RcuList<PinnedRegion>,
}

impl PinnedMemory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Whether anything has been pre-registered at all.
    pub fn preregistered(&self) -> bool {
        !self.regions.is_empty()
    }

    pub fn register(
        &self,
        vm: &VirtualMode,
        region: PinnedRegion,
    ) -> std::result::Result<Arc<PinnedRegion>, PinnedError> {
        let region = Arc::new(region);
        self.regions.update(vm, |regions| {
            if regions.iter().any(|r| r.overlaps(&region)) {
                return Err(PinnedError::Overlap(region.ua()));
            }
            regions.push(region.clone());
            Ok(())
        })?;

        info!(
            "Pre-registered {} pages at {:#x}",
            region.entries(),
            region.ua()
        );
        Ok(region)
    }

    /// Unregister the region starting at `ua`. Refused while any IOMMU
    /// entry still maps it.
    pub fn deregister(
        &self,
        vm: &VirtualMode,
        ua: u64,
    ) -> std::result::Result<(), PinnedError> {
        let region = self
            .regions
            .find(|r| r.ua() == ua)
            .ok_or(PinnedError::NotFound(ua))?;

        if let Err(mapped) = region.try_retire() {
            warn!("Pinned region at {:#x} is still mapped {} times", ua, mapped);
            return Err(PinnedError::Busy(ua, mapped));
        }

        // Readers still holding the region only see a dead mapped count.
        self.regions
            .update(vm, |regions| regions.retain(|r| !Arc::ptr_eq(r, &region)));
        info!("Deregistered pinned region at {:#x}", ua);
        Ok(())
    }

    /// Region covering `[ua, ua + size)`.
    pub fn lookup(&self, _rm: &RealMode, ua: u64, size: u64) -> Option<Arc<PinnedRegion>> {
        self.regions.find(|r| r.contains(ua, size))
    }
}
