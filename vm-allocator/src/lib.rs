// Copyright 2018 The Chromium OS Authors. All rights reserved.
// Copyright © 2019 Intel Corporation
// SPDX-License-Identifier: Apache-2.0 OR MIT
//
// Portions Copyright 2017 The Chromium OS Authors. All rights reserved.
// Use of this source code is governed by a BSD-style license that can be
// found in the THIRD-PARTY file.

//! Manages the physical memory set aside for guest hashed page tables.

#[macro_use]
extern crate log;

pub mod config;
mod pool;
mod reservoir;

pub use crate::config::ReservoirConfig;
pub use crate::pool::ContiguousPool;
pub use crate::reservoir::HptReservoir;

/// Hashed page tables only need 256 KiB alignment.
pub const HPT_ALIGN_ORDER: u32 = 18;

/// Granularity of the reserved region bitmap.
pub const RESV_CHUNK_ORDER: u32 = HPT_ALIGN_ORDER;
