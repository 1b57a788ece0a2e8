// Copyright © 2026 The Cloud Hypervisor Authors
//
// SPDX-License-Identifier: Apache-2.0
//

//! Guest-visible DMA translation (TCE) tables.
//!
//! A guest programs DMA windows of its virtual I/O devices through
//! hypercalls. Each window is described by a TCE table identified by a
//! logical I/O bus number (LIOBN). Emulated devices only need the guest
//! values to be stored for later inspection by the device model; tables
//! with hardware IOMMU groups attached also have every update pushed to
//! the real IOMMU, backed by pinned guest memory.
//!
//! Everything reachable from [`TceContext`] runs in real mode and either
//! completes with atomic operations only or bails out with
//! [`Error::TooHard`] so the request is replayed in virtual mode.

#[macro_use]
extern crate log;

mod hcall;
mod iommu;
pub mod pinned;
pub mod table;
pub mod translate;

use thiserror::Error;

pub use hcall::TceContext;
pub use pinned::{PinnedError, PinnedMemory, PinnedRegion};
pub use table::{TceGroup, TceTable, TceTables};
pub use translate::{HostPageTable, HostPte, MemorySlot, MemorySlots, Rmap, RmapGuard, Translator};

/// Host base page size used by memory slots and pinned regions.
pub const PAGE_SHIFT: u32 = 12;
pub const PAGE_SIZE: u64 = 1 << PAGE_SHIFT;
pub const PAGE_MASK: u64 = !(PAGE_SIZE - 1);

/// Emulated TCEs held by one backing page.
pub const TCES_PER_PAGE: usize = (PAGE_SIZE as usize) / std::mem::size_of::<u64>();

/// An indirect TCE list must fit in a single 4 KiB page.
pub const MAX_INDIRECT_TCES: usize = 512;
pub const IOMMU_PAGE_SHIFT_4K: u32 = 12;
pub const IOMMU_PAGE_SIZE_4K: u64 = 1 << IOMMU_PAGE_SHIFT_4K;

#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum Error {
    #[error("Invalid hypercall parameter")]
    Parameter,
    #[error("Request must be retried outside real mode")]
    TooHard,
    #[error("IOMMU hardware rejected the update")]
    Hardware,
    #[error("Host mapping cannot be resolved in real mode yet")]
    Retry,
    #[error("No memory slot covers guest address {0:#x}")]
    InvalidAddress(u64),
}

pub type Result<T> = std::result::Result<T, Error>;
