// Copyright © 2026 The Cloud Hypervisor Authors
//
// SPDX-License-Identifier: Apache-2.0
//

//! Execution-mode capability tokens.
//!
//! Code running on the guest entry/exit path executes with translation off
//! and interrupts disabled: it may not sleep, block on a lock or take a page
//! fault. Functions on that path take a `&RealMode`. Anything that may block
//! (mutexes, waiting for readers to drain, allocation from the reservoir)
//! takes a `&VirtualMode` instead. Neither token can be derived from the
//! other, so a real-mode function holding only a `RealMode` has no way to
//! call a blocking primitive.

use std::marker::PhantomData;

/// Proof that the holder runs in the restricted (no blocking, no faults)
/// context.
///
/// Not `Send`: the token describes the state of the CPU it was minted on.
#[derive(Debug)]
pub struct RealMode {
    _not_send: PhantomData<*const ()>,
}

impl RealMode {
    /// Mint a real-mode token.
    ///
    /// # Safety
    ///
    /// Only the guest exit trampoline may call this. The caller must not
    /// perform any blocking or faulting operation for as long as the token
    /// is alive.
    pub unsafe fn assume() -> Self {
        RealMode {
            _not_send: PhantomData,
        }
    }
}

/// Proof that the holder runs in an ordinary host thread that may sleep.
#[derive(Debug)]
pub struct VirtualMode {
    _not_send: PhantomData<*const ()>,
}

impl VirtualMode {
    /// Mint a virtual-mode token.
    ///
    /// # Safety
    ///
    /// The caller must be a host thread with interrupts enabled and the MMU
    /// on, i.e. a context where blocking is allowed. Minting one from the
    /// real-mode path defeats the separation between the two modes.
    pub unsafe fn assume() -> Self {
        VirtualMode {
            _not_send: PhantomData,
        }
    }
}
