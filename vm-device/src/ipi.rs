// Copyright © 2026 The Cloud Hypervisor Authors
//
// SPDX-License-Identifier: Apache-2.0
//

use crate::context::RealMode;

/// Inter-processor signalling primitives usable from real mode.
///
/// The caller is responsible for ordering its memory writes before the
/// signal is sent.
pub trait IpiSender: Send + Sync {
    /// Send a server doorbell to thread `thread` of the caller's own core.
    fn doorbell(&self, rm: &RealMode, thread: u32);

    /// Raise an IPI on `cpu` through its interrupt presenter.
    fn interrupt(&self, rm: &RealMode, cpu: u32);
}
