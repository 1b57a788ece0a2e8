// Copyright © 2026 The Cloud Hypervisor Authors
//
// SPDX-License-Identifier: Apache-2.0
//

//! Coordination between the hardware threads backing one guest core.
//!
//! A virtual core runs its vCPUs on several hardware threads of one
//! physical core at once. When any of them has to leave the guest, all of
//! them have to, since the core can only be switched back to the host as a
//! whole. The state driving this lives in [`VirtualCore`]; [`commence_exit`]
//! elects the thread that pulls its siblings out and [`h_confer`] decides
//! whether giving the core away is worth it.

#[macro_use]
extern crate log;

mod bitmap;
mod confer;
mod exit;
mod ipi;
mod vcore;

pub use bitmap::{AtomicThreadSet, ThreadSet};
pub use confer::{h_confer, ConferDecision, MonotonicTimebase, Timebase, CONFER_BUDGET_USEC};
pub use exit::{commence_exit, ExitReason, SplitMode, MAX_SUBCORES};
pub use ipi::{IpiRouter, IpiTopology};
pub use vcore::{VirtualCore, VCORE_EXIT_REQ};

/// Hardware threads per virtual core.
pub const MAX_SMT_THREADS: u32 = 8;
