// Copyright © 2026 The Cloud Hypervisor Authors
//
// SPDX-License-Identifier: Apache-2.0
//

//! Read-mostly list with deferred reclamation.
//!
//! Readers on the real-mode path walk the list without taking any lock. A
//! writer never edits the published array in place: it copies it, applies
//! its change and publishes the copy, so a reader either sees the old array
//! or the new one, never a half-written entry.
//!
//! Reclamation is done by the writer. Readers announce themselves on one of
//! two counters selected by the current phase; after publishing, the writer
//! flips the phase twice and waits each time for the counter readers can no
//! longer enter to drain. Once both have drained no reader can still hold
//! the old array, and the writer frees it. Readers only ever touch the two
//! counters, so no destructor runs on the real-mode path.

use std::marker::PhantomData;
use std::ptr;
use std::sync::atomic::{AtomicPtr, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use crossbeam::utils::{Backoff, CachePadded};

use crate::context::VirtualMode;

pub struct RcuList<T> {
    head: AtomicPtr<Vec<Arc<T>>>,
    phase: AtomicUsize,
    readers: [CachePadded<AtomicUsize>; 2],
    writer: Mutex<()>,
    _entries: PhantomData<Vec<Arc<T>>>,
}

struct ReadSection<'a> {
    counter: &'a AtomicUsize,
}

impl Drop for ReadSection<'_> {
    fn drop(&mut self) {
        self.counter.fetch_sub(1, Ordering::Release);
    }
}

impl<T: Send + Sync> Default for RcuList<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: Send + Sync> RcuList<T> {
    pub fn new() -> Self {
        RcuList {
            head: AtomicPtr::new(Box::into_raw(Box::default())),
            phase: AtomicUsize::new(0),
            readers: [
                CachePadded::new(AtomicUsize::new(0)),
                CachePadded::new(AtomicUsize::new(0)),
            ],
            writer: Mutex::new(()),
            _entries: PhantomData,
        }
    }

    fn enter(&self) -> ReadSection<'_> {
        let phase = self.phase.load(Ordering::SeqCst) & 1;
        let counter = &*self.readers[phase];
        counter.fetch_add(1, Ordering::SeqCst);
        ReadSection { counter }
    }

    /// Run `f` over the currently published entries, in insertion order.
    ///
    /// Never blocks, safe to call from real mode.
    pub fn read<R>(&self, f: impl FnOnce(&[Arc<T>]) -> R) -> R {
        let _section = self.enter();
        // SAFETY: head is never null, and a published array is only freed
        // after both reader counters drained following its replacement. Our
        // counter was raised before this load.
        let entries = unsafe { &*self.head.load(Ordering::SeqCst) };
        f(entries)
    }

    /// First entry matching `pred`.
    pub fn find(&self, pred: impl Fn(&T) -> bool) -> Option<Arc<T>> {
        self.read(|entries| entries.iter().find(|e| pred(e)).cloned())
    }

    pub fn len(&self) -> usize {
        self.read(|entries| entries.len())
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    // Wait until every reader that may have loaded the previous head is gone.
    fn synchronize(&self) {
        for _ in 0..2 {
            let drained = self.phase.fetch_xor(1, Ordering::SeqCst) & 1;
            let backoff = Backoff::new();
            while self.readers[drained].load(Ordering::SeqCst) != 0 {
                backoff.snooze();
            }
        }
    }

    /// Apply `f` to a private copy of the list, publish the result and wait
    /// for the grace period of the replaced array.
    ///
    /// Writers are serialized against each other, never against readers.
    /// Must not be called from inside [`RcuList::read`].
    pub fn update<R>(&self, _vm: &VirtualMode, f: impl FnOnce(&mut Vec<Arc<T>>) -> R) -> R {
        let _writer = self.writer.lock().unwrap();
        // SAFETY: only writers free arrays and we hold the writer lock.
        let mut next = unsafe { &*self.head.load(Ordering::Acquire) }.clone();
        let ret = f(&mut next);
        let old = self
            .head
            .swap(Box::into_raw(Box::new(next)), Ordering::SeqCst);

        self.synchronize();
        // SAFETY: `old` came from `Box::into_raw`, is unreachable from head
        // and no reader is left that loaded it.
        drop(unsafe { Box::from_raw(old) });
        ret
    }

    pub fn push(&self, vm: &VirtualMode, entry: Arc<T>) {
        self.update(vm, |entries| entries.push(entry));
    }

    /// Unlink every entry matching `pred`.
    ///
    /// Returns once no reader can observe any of the removed entries through
    /// the list any more. Clones handed out earlier keep their entry alive.
    pub fn remove(&self, vm: &VirtualMode, pred: impl Fn(&T) -> bool) -> Vec<Arc<T>> {
        self.update(vm, |entries| {
            let mut removed = Vec::new();
            entries.retain(|e| {
                if pred(e) {
                    removed.push(e.clone());
                    false
                } else {
                    true
                }
            });
            removed
        })
    }
}

impl<T> Drop for RcuList<T> {
    fn drop(&mut self) {
        let head = std::mem::replace(self.head.get_mut(), ptr::null_mut());
        if !head.is_null() {
            // SAFETY: we have exclusive access and head came from
            // `Box::into_raw`.
            drop(unsafe { Box::from_raw(head) });
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicBool, AtomicU32};
    use std::sync::{mpsc, Barrier};
    use std::thread;
    use std::time::Duration;

    use super::*;

    fn vm() -> VirtualMode {
        // SAFETY: unit tests run on ordinary host threads.
        unsafe { VirtualMode::assume() }
    }

    #[test]
    fn test_push_find_remove() {
        let vm = vm();
        let list = RcuList::new();
        list.push(&vm, Arc::new(1u32));
        list.push(&vm, Arc::new(2u32));
        list.push(&vm, Arc::new(3u32));

        assert_eq!(list.len(), 3);
        assert_eq!(list.find(|v| *v == 2).map(|v| *v), Some(2));

        let removed = list.remove(&vm, |v| *v % 2 == 1);
        assert_eq!(removed.iter().map(|v| **v).collect::<Vec<_>>(), vec![1, 3]);
        assert_eq!(list.read(|e| e.iter().map(|v| **v).collect::<Vec<_>>()), vec![2]);
    }

    #[test]
    fn test_readers_never_see_torn_entries() {
        struct Pair {
            a: AtomicU32,
            b: AtomicU32,
        }

        let vm = vm();
        let list = Arc::new(RcuList::<Pair>::new());
        let stop = Arc::new(AtomicBool::new(false));
        let barrier = Arc::new(Barrier::new(3));

        let readers: Vec<_> = (0..2)
            .map(|_| {
                let list = list.clone();
                let stop = stop.clone();
                let barrier = barrier.clone();
                thread::spawn(move || {
                    barrier.wait();
                    while !stop.load(Ordering::Relaxed) {
                        list.read(|entries| {
                            for p in entries {
                                assert_eq!(
                                    p.a.load(Ordering::Relaxed) * 2,
                                    p.b.load(Ordering::Relaxed)
                                );
                            }
                        });
                    }
                })
            })
            .collect();

        barrier.wait();
        for i in 0..200u32 {
            list.push(
                &vm,
                Arc::new(Pair {
                    a: AtomicU32::new(i),
                    b: AtomicU32::new(i * 2),
                }),
            );
            if i % 3 == 0 {
                list.remove(&vm, |p| p.a.load(Ordering::Relaxed) == i);
            }
        }
        stop.store(true, Ordering::Relaxed);

        for r in readers {
            r.join().unwrap();
        }
        assert_eq!(list.len(), 200 - 67);
    }

    #[test]
    fn test_remove_after_write_from_idle_thread() {
        let list = Arc::new(RcuList::new());
        let (written_tx, written_rx) = mpsc::channel();
        let (exit_tx, exit_rx) = mpsc::channel::<()>();

        let writer = {
            let list = list.clone();
            thread::spawn(move || {
                let vm = vm();
                list.push(&vm, Arc::new(1u32));
                list.push(&vm, Arc::new(2u32));
                written_tx.send(()).unwrap();
                // Stay alive and idle while the other thread removes.
                exit_rx.recv().unwrap();
            })
        };

        written_rx.recv().unwrap();
        let removed = list.remove(&vm(), |v| *v == 1);
        assert_eq!(removed.len(), 1);
        assert_eq!(Arc::strong_count(&removed[0]), 1);
        assert_eq!(list.find(|v| *v == 2).map(|v| *v), Some(2));

        exit_tx.send(()).unwrap();
        writer.join().unwrap();
    }

    #[test]
    fn test_remove_waits_for_readers() {
        let list = Arc::new(RcuList::new());
        list.push(&vm(), Arc::new(7u32));

        let reading = Arc::new(Barrier::new(2));
        let left = Arc::new(AtomicBool::new(false));
        let reader = {
            let list = list.clone();
            let reading = reading.clone();
            let left = left.clone();
            thread::spawn(move || {
                list.read(|entries| {
                    assert_eq!(*entries[0], 7);
                    reading.wait();
                    thread::sleep(Duration::from_millis(50));
                    left.store(true, Ordering::SeqCst);
                });
            })
        };

        reading.wait();
        let removed = list.remove(&vm(), |v| *v == 7);
        assert!(left.load(Ordering::SeqCst));
        assert_eq!(removed.len(), 1);
        assert!(list.is_empty());
        reader.join().unwrap();
    }
}
