// Copyright 2018 The Chromium OS Authors. All rights reserved.
// Copyright © 2019 Intel Corporation
// Copyright © 2026 The Cloud Hypervisor Authors
//
// Portions Copyright 2017 The Chromium OS Authors. All rights reserved.
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE-BSD-3-Clause file.
//
// SPDX-License-Identifier: Apache-2.0 AND BSD-3-Clause

use std::collections::btree_map::BTreeMap;
use std::sync::Mutex;

use vm_device::VirtualMode;

use crate::config::ReservoirConfig;
use crate::HPT_ALIGN_ORDER;

/// Contiguous-memory pool seeded at boot, used for HPTs when the reserved
/// region is exhausted and for movable allocations otherwise.
///
/// Allocations are at least one chunk big and always chunk aligned.
///
/// # Examples
///
/// ```
/// # use vm_allocator::ContiguousPool;
/// # use vm_device::VirtualMode;
///   let vm = unsafe { VirtualMode::assume() };
///   let pool = ContiguousPool::new(0x1000_0000, 0x10_0000).unwrap();
///   assert_eq!(pool.alloc(&vm, 18), Some(0x1000_0000));
///   assert_eq!(pool.alloc(&vm, 19), Some(0x1004_0000));
/// ```
#[derive(Debug)]
pub struct ContiguousPool {
    base: u64,
    end: u64,
    ranges: Mutex<BTreeMap<u64, u64>>,
}

fn align_up(address: u64, alignment: u64) -> Option<u64> {
    let rem = address % alignment;
    if rem == 0 {
        Some(address)
    } else {
        address.checked_add(alignment - rem)
    }
}

impl ContiguousPool {
    const ALIGNMENT: u64 = 1 << HPT_ALIGN_ORDER;

    /// Creates a pool over `[base, base + size)`. Returns `None` if the range
    /// is empty or overflows.
    pub fn new(base: u64, size: u64) -> Option<Self> {
        if size == 0 {
            return None;
        }
        let end = base.checked_add(size)?;

        Some(ContiguousPool {
            base,
            end,
            ranges: Mutex::new(BTreeMap::new()),
        })
    }

    /// Size the pool from `config` and declare it with `declare(size, align)`.
    pub fn reserve(
        mem_size: u64,
        config: &ReservoirConfig,
        declare: impl FnOnce(u64, u64) -> Option<u64>,
    ) -> Option<Self> {
        let size = config.cma_reserve_size(mem_size);
        if size == 0 {
            return None;
        }

        debug!("Reserving {} MiB for the contiguous HPT pool", size >> 20);
        let base = declare(size, Self::ALIGNMENT)?;
        Self::new(base, size)
    }

    fn first_available_range(
        ranges: &BTreeMap<u64, u64>,
        base: u64,
        end: u64,
        size: u64,
    ) -> Option<u64> {
        let mut candidate = align_up(base, Self::ALIGNMENT)?;

        for (address, len) in ranges.iter() {
            if candidate.checked_add(size)? <= *address {
                return Some(candidate);
            }
            candidate = align_up(candidate.max(address + len), Self::ALIGNMENT)?;
        }

        if candidate.checked_add(size)? <= end {
            Some(candidate)
        } else {
            None
        }
    }

    /// Allocates `2^order` contiguous bytes. Orders below the chunk order are
    /// refused.
    pub fn alloc(&self, _vm: &VirtualMode, order: u32) -> Option<u64> {
        if order < HPT_ALIGN_ORDER || order >= u64::BITS {
            warn!("Contiguous pool allocation of order {} refused", order);
            return None;
        }
        let size = 1u64 << order;

        let mut ranges = self.ranges.lock().unwrap();
        let address = Self::first_available_range(&ranges, self.base, self.end, size)?;
        ranges.insert(address, size);

        Some(address)
    }

    /// Only release a range if it matches exactly an allocated one.
    pub fn release(&self, _vm: &VirtualMode, address: u64, order: u32) -> bool {
        let mut ranges = self.ranges.lock().unwrap();
        match ranges.get(&address) {
            Some(size) if order < u64::BITS && *size == 1u64 << order => {
                ranges.remove(&address);
                true
            }
            _ => false,
        }
    }
}
