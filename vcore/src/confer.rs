// Copyright © 2026 The Cloud Hypervisor Authors
//
// SPDX-License-Identifier: Apache-2.0
//

use std::hint;
use std::time::Instant;

use vm_device::RealMode;

use crate::vcore::VirtualCore;

/// How long a conferring thread waits for its siblings to go idle.
pub const CONFER_BUDGET_USEC: u64 = 10;

/// A free-running tick counter readable from real mode.
pub trait Timebase {
    fn now(&self) -> u64;
    fn ticks_per_usec(&self) -> u64;
}

/// Timebase backed by the host monotonic clock, one tick per nanosecond.
#[derive(Debug)]
pub struct MonotonicTimebase {
    start: Instant,
}

impl MonotonicTimebase {
    pub fn new() -> Self {
        MonotonicTimebase {
            start: Instant::now(),
        }
    }
}

impl Default for MonotonicTimebase {
    fn default() -> Self {
        Self::new()
    }
}

impl Timebase for MonotonicTimebase {
    fn now(&self) -> u64 {
        self.start.elapsed().as_nanos() as u64
    }

    fn ticks_per_usec(&self) -> u64 {
        1000
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ConferDecision {
    /// Stay in the guest.
    Continue,
    /// Every other running thread is idle, give the core up.
    Yield,
}

/// H_CONFER on behalf of thread `ptid` of `vc`.
///
/// Yielding only pays off if none of the threads still in the guest has
/// useful work, so wait a little for all of them to be napping or
/// conferring too.
pub fn h_confer(_rm: &RealMode, vc: &VirtualCore, ptid: u32, tb: &dyn Timebase) -> ConferDecision {
    let stop = tb.now() + CONFER_BUDGET_USEC * tb.ticks_per_usec();
    let mut decision = ConferDecision::Continue;

    vc.conferring().insert(ptid);
    while tb.now() < stop && !vc.is_exiting() {
        let running = vc.entry_map();
        let idle = vc.napping().load().union(vc.conferring().load());
        if idle == running {
            decision = ConferDecision::Yield;
            break;
        }
        hint::spin_loop();
    }
    vc.conferring().remove(ptid);

    decision
}
