// Copyright © 2026 The Cloud Hypervisor Authors
//
// SPDX-License-Identifier: Apache-2.0
//

use std::fmt;
use std::sync::atomic::{AtomicU32, Ordering};

use crate::MAX_SMT_THREADS;

/// A set of thread slots of one virtual core, one bit per slot.
#[derive(Clone, Copy, Default, PartialEq, Eq)]
pub struct ThreadSet(u32);

impl ThreadSet {
    pub const fn empty() -> Self {
        ThreadSet(0)
    }

    /// Build a set from a raw mask. Bits beyond the last slot are dropped.
    pub const fn from_bits(bits: u32) -> Self {
        ThreadSet(bits & ((1 << MAX_SMT_THREADS) - 1))
    }

    pub const fn bits(self) -> u32 {
        self.0
    }

    /// The set holding only `ptid`, empty if there is no such slot.
    pub fn single(ptid: u32) -> Self {
        Self::from_bits(1u32.checked_shl(ptid).unwrap_or(0))
    }

    pub fn contains(self, ptid: u32) -> bool {
        ptid < MAX_SMT_THREADS && self.0 & (1 << ptid) != 0
    }

    pub fn is_empty(self) -> bool {
        self.0 == 0
    }

    pub fn union(self, other: ThreadSet) -> Self {
        ThreadSet(self.0 | other.0)
    }

    pub fn without(self, ptid: u32) -> Self {
        ThreadSet(self.0 & !Self::single(ptid).0)
    }

    /// Slots in the set, lowest first.
    pub fn iter(self) -> impl Iterator<Item = u32> {
        (0..MAX_SMT_THREADS).filter(move |ptid| self.contains(*ptid))
    }
}

impl fmt::Debug for ThreadSet {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "ThreadSet({:#04x})", self.0)
    }
}

/// A [`ThreadSet`] updated concurrently by the threads it describes.
#[derive(Debug, Default)]
pub struct AtomicThreadSet(AtomicU32);

impl AtomicThreadSet {
    pub const fn new() -> Self {
        AtomicThreadSet(AtomicU32::new(0))
    }

    pub fn load(&self) -> ThreadSet {
        ThreadSet(self.0.load(Ordering::Acquire))
    }

    pub fn insert(&self, ptid: u32) {
        self.0.fetch_or(ThreadSet::single(ptid).bits(), Ordering::AcqRel);
    }

    pub fn remove(&self, ptid: u32) {
        self.0.fetch_and(!ThreadSet::single(ptid).bits(), Ordering::AcqRel);
    }

    pub fn clear(&self) {
        self.0.store(0, Ordering::Release);
    }
}
