// Copyright © 2026 The Cloud Hypervisor Authors
//
// SPDX-License-Identifier: Apache-2.0
//

use crate::context::RealMode;

/// Hardware random number source reachable with the MMU off.
pub trait HwRng: Send + Sync {
    /// Whether the platform has a usable source at all.
    fn present(&self) -> bool;

    /// Read one 64-bit random value, `None` if the source failed.
    fn read(&self, rm: &RealMode) -> Option<u64>;
}
