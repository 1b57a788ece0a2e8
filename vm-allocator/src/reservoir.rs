// Copyright © 2026 The Cloud Hypervisor Authors
//
// SPDX-License-Identifier: Apache-2.0
//

use std::sync::Mutex;

use vm_device::VirtualMode;

use crate::config::ReservoirConfig;
use crate::RESV_CHUNK_ORDER;

const BITS_PER_WORD: usize = u64::BITS as usize;

/// Fixed-size bitmap, one bit per reservoir chunk.
#[derive(Debug)]
struct ChunkBitmap {
    words: Vec<u64>,
    bits: usize,
}

impl ChunkBitmap {
    fn new(bits: usize) -> Self {
        ChunkBitmap {
            words: vec![0; bits.div_ceil(BITS_PER_WORD)],
            bits,
        }
    }

    fn test(&self, bit: usize) -> bool {
        self.words[bit / BITS_PER_WORD] & (1 << (bit % BITS_PER_WORD)) != 0
    }

    fn assign(&mut self, start: usize, len: usize, set: bool) {
        for bit in start..start + len {
            let mask = 1 << (bit % BITS_PER_WORD);
            if set {
                self.words[bit / BITS_PER_WORD] |= mask;
            } else {
                self.words[bit / BITS_PER_WORD] &= !mask;
            }
        }
    }

    /// First index of a run of `len` clear bits.
    fn find_zero_area(&self, len: usize) -> Option<usize> {
        let mut run_start = 0;
        let mut run_len = 0;
        for bit in 0..self.bits {
            if self.test(bit) {
                run_start = bit + 1;
                run_len = 0;
                continue;
            }
            run_len += 1;
            if run_len == len {
                return Some(run_start);
            }
        }
        None
    }

    fn count_zeros(&self) -> usize {
        (0..self.bits).filter(|bit| !self.test(*bit)).count()
    }
}

/// Chunked allocator over the region reserved at boot for guest hashed
/// page tables.
///
/// The bitmap is the only record of which chunks are in use; it is always
/// updated under the mutex, so two callers can never be handed the same
/// chunk.
#[derive(Debug)]
pub struct HptReservoir {
    base: u64,
    chunks: usize,
    bitmap: Mutex<ChunkBitmap>,
}

impl HptReservoir {
    /// Manage `[base, base + size)`. Both must be chunk aligned.
    pub fn new(base: u64, size: u64) -> Option<Self> {
        let chunk_mask = (1u64 << RESV_CHUNK_ORDER) - 1;
        if size == 0 || base & chunk_mask != 0 || size & chunk_mask != 0 {
            return None;
        }
        base.checked_add(size)?;

        let chunks = (size >> RESV_CHUNK_ORDER) as usize;
        Some(HptReservoir {
            base,
            chunks,
            bitmap: Mutex::new(ChunkBitmap::new(chunks)),
        })
    }

    /// Size the reservoir from `config` and carve it out of boot memory
    /// with `alloc(size, align)`.
    pub fn reserve(
        mem_size: u64,
        config: &ReservoirConfig,
        alloc: impl FnOnce(u64, u64) -> Option<u64>,
    ) -> Option<Self> {
        let size = config.hpt_reserve_size(mem_size);
        if size == 0 {
            return None;
        }

        info!("Allocating {} MiB for hashed page tables", size >> 20);
        let base = match alloc(size, 1 << RESV_CHUNK_ORDER) {
            Some(base) => base,
            None => {
                error!("Allocation of reserved memory for HPTs failed");
                return None;
            }
        };
        info!("{} MiB reserved for HPTs at {:#x}", size >> 20, base);

        Self::new(base, size)
    }

    fn nr_chunks(order: u32) -> Option<usize> {
        1usize.checked_shl(order.saturating_sub(RESV_CHUNK_ORDER))
    }

    pub fn base(&self) -> u64 {
        self.base
    }

    pub fn size(&self) -> u64 {
        (self.chunks as u64) << RESV_CHUNK_ORDER
    }

    /// Chunks not currently handed out.
    pub fn free_chunks(&self) -> usize {
        self.bitmap.lock().unwrap().count_zeros()
    }

    /// Claim the first run of free chunks covering `2^order` bytes.
    pub fn alloc(&self, _vm: &VirtualMode, order: u32) -> Option<u64> {
        let Some(nr_chunks) = Self::nr_chunks(order) else {
            warn!("HPT of order {} cannot come from the reservoir", order);
            return None;
        };
        let chunk = {
            let mut bitmap = self.bitmap.lock().unwrap();
            let chunk = bitmap.find_zero_area(nr_chunks)?;
            bitmap.assign(chunk, nr_chunks, true);
            chunk
        };

        debug!("Reserved HPT of order {} at chunk {}", order, chunk);
        Some(self.base + ((chunk as u64) << RESV_CHUNK_ORDER))
    }

    /// Return `2^order` bytes at `addr` to the reservoir.
    ///
    /// Whatever part of the range falls outside the reservoir is ignored.
    pub fn free(&self, _vm: &VirtualMode, addr: u64, order: u32) {
        if addr < self.base {
            warn!("Freeing {:#x} below the HPT reservoir", addr);
            return;
        }

        let chunk = ((addr - self.base) >> RESV_CHUNK_ORDER) as usize;
        if chunk >= self.chunks {
            warn!("Freeing {:#x} beyond the HPT reservoir", addr);
            return;
        }
        let Some(nr_chunks) = Self::nr_chunks(order) else {
            warn!("Freeing an HPT of order {} from the reservoir", order);
            return;
        };
        let end = chunk.saturating_add(nr_chunks).min(self.chunks);

        self.bitmap
            .lock()
            .unwrap()
            .assign(chunk, end - chunk, false);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const CHUNK: u64 = 1 << RESV_CHUNK_ORDER;

    fn vm() -> VirtualMode {
        // SAFETY: unit tests run on ordinary host threads.
        unsafe { VirtualMode::assume() }
    }

    #[test]
    fn test_new_fails() {
        assert!(HptReservoir::new(0x1000_0000, 0).is_none());
        assert!(HptReservoir::new(0x1000_0100, 4 * CHUNK).is_none());
        assert!(HptReservoir::new(0x1000_0000, CHUNK + 1).is_none());
        assert!(HptReservoir::new(u64::MAX - CHUNK + 1, 2 * CHUNK).is_none());
    }

    #[test]
    fn test_alloc_first_fit() {
        let vm = vm();
        let base = 0x1000_0000;
        let resv = HptReservoir::new(base, 8 * CHUNK).unwrap();

        // One chunk, then a four-chunk area, then two chunks again.
        assert_eq!(resv.alloc(&vm, 18), Some(base));
        assert_eq!(resv.alloc(&vm, 20), Some(base + CHUNK));
        assert_eq!(resv.alloc(&vm, 19), Some(base + 5 * CHUNK));
        assert_eq!(resv.free_chunks(), 1);
        assert_eq!(resv.alloc(&vm, 19), None);

        resv.free(&vm, base + CHUNK, 20);
        assert_eq!(resv.free_chunks(), 5);
        assert_eq!(resv.alloc(&vm, 21), None);
        assert_eq!(resv.alloc(&vm, 19), Some(base + CHUNK));
    }

    #[test]
    fn test_small_orders_round_up_to_a_chunk() {
        let vm = vm();
        let resv = HptReservoir::new(0, 2 * CHUNK).unwrap();
        assert_eq!(resv.alloc(&vm, 12), Some(0));
        assert_eq!(resv.alloc(&vm, 12), Some(CHUNK));
        assert_eq!(resv.alloc(&vm, 12), None);
    }

    #[test]
    fn test_free_truncates_to_reservoir() {
        let vm = vm();
        let base = 0x4000_0000;
        let resv = HptReservoir::new(base, 4 * CHUNK).unwrap();
        for _ in 0..4 {
            resv.alloc(&vm, 18).unwrap();
        }

        // Order 20 spans four chunks, only two of which are in the reservoir.
        resv.free(&vm, base + 2 * CHUNK, 20);
        assert_eq!(resv.free_chunks(), 2);
        assert_eq!(resv.alloc(&vm, 19), Some(base + 2 * CHUNK));

        resv.free(&vm, base - CHUNK, 18);
        resv.free(&vm, base + 4 * CHUNK, 18);
        assert_eq!(resv.free_chunks(), 0);
    }

    #[test]
    fn test_oversized_orders_are_refused() {
        let vm = vm();
        let resv = HptReservoir::new(0, 4 * CHUNK).unwrap();
        assert_eq!(resv.alloc(&vm, 90), None);
        assert_eq!(resv.alloc(&vm, u32::MAX), None);

        let addr = resv.alloc(&vm, 18).unwrap();
        resv.free(&vm, addr, 90);
        assert_eq!(resv.free_chunks(), 3);
        resv.free(&vm, addr, 18);
        assert_eq!(resv.free_chunks(), 4);
    }

    #[test]
    fn test_reserve_from_config() {
        let config = ReservoirConfig::default();
        let resv = HptReservoir::reserve(1 << 30, &config, |size, align| {
            assert_eq!(align, CHUNK);
            assert_eq!(size, 0x148_0000);
            Some(0x2000_0000)
        })
        .unwrap();
        assert_eq!(resv.base(), 0x2000_0000);
        assert_eq!(resv.size(), 0x148_0000);
        assert_eq!(resv.free_chunks(), 82);

        assert!(HptReservoir::reserve(1 << 30, &config, |_, _| None).is_none());
    }

    #[test]
    fn test_concurrent_allocations_are_disjoint() {
        use std::collections::HashSet;
        use std::sync::Arc;
        use std::thread;

        let resv = Arc::new(HptReservoir::new(0, 64 * CHUNK).unwrap());
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let resv = resv.clone();
                thread::spawn(move || {
                    let vm = vm();
                    (0..8)
                        .map(|_| resv.alloc(&vm, 18).unwrap())
                        .collect::<Vec<_>>()
                })
            })
            .collect();

        let mut seen = HashSet::new();
        for h in handles {
            for addr in h.join().unwrap() {
                assert!(seen.insert(addr));
            }
        }
        assert_eq!(seen.len(), 64);
        assert_eq!(resv.free_chunks(), 0);
    }
}
