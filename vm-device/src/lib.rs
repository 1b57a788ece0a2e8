// Copyright © 2026 The Cloud Hypervisor Authors
//
// SPDX-License-Identifier: Apache-2.0
//

//! Contracts between the real-mode hypervisor core and its collaborators.
//!
//! Everything the core consumes from outside (hardware IOMMU tables,
//! inter-processor signalling, the hardware random number source) is
//! expressed as a trait here, next to the execution-mode capability tokens
//! that decide which of those primitives a code path may use.

pub mod context;
pub mod iommu;
pub mod ipi;
pub mod rcu;
pub mod rng;

pub use context::{RealMode, VirtualMode};
pub use iommu::{AtomicIommuTable, DmaDirection, IommuError, IommuTable, TcePerm};
pub use ipi::IpiSender;
pub use rcu::RcuList;
pub use rng::HwRng;
