// Copyright © 2026 The Cloud Hypervisor Authors
//
// SPDX-License-Identifier: Apache-2.0
//

//! Real-mode services of a hardware-partitioning hypervisor.
//!
//! This crate ties the building blocks together: a [`partition::Partition`]
//! owns the TCE tables, memory slots, pre-registered memory and interrupt
//! passthrough map of one guest, [`hcall`] serves the hypercalls that can be
//! completed without leaving real mode, [`interrupt`] classifies pending
//! external interrupts and [`activation`] keeps host-wide operations away
//! while partitions exist.

#[macro_use]
extern crate log;

pub mod activation;
pub mod hcall;
pub mod interrupt;
pub mod partition;

use thiserror::Error;

pub use activation::{Activation, HostGate};
pub use partition::Partition;

#[derive(Error, Debug)]
pub enum Error {
    #[error("TCE table LIOBN {0:#x} already exists")]
    DuplicateLiobn(u64),
    #[error("No TCE table with LIOBN {0:#x}")]
    UnknownLiobn(u64),
    #[error("Invalid TCE table configuration: {0}")]
    TceTable(#[source] tce::Error),
    #[error("Cannot attach IOMMU group {0}: {1}")]
    AttachGroup(u32, #[source] tce::Error),
    #[error("Memory slot at guest frame {0:#x} overlaps an existing slot")]
    MemorySlotOverlap(u64),
    #[error("Pre-registered memory error: {0}")]
    Pinned(#[source] tce::PinnedError),
    #[error("Passthrough interrupt {0:#x} is already mapped")]
    DuplicatePassthroughIrq(u32),
    #[error("No hashed page table of order {0} available")]
    HptAllocation(u32),
    #[error("Host operation refused while {0} partitions are active")]
    PartitionsActive(usize),
}

pub type Result<T> = std::result::Result<T, Error>;
