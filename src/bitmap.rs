//! Concurrent hierarchical bitmap: a lock-light occupancy map that
//! allocates and frees contiguous runs of 1..=64 bits, backed by a
//! 4-level max-free-run index so a scan for a run of length `n` skips
//! whole 64-bit windows at a time instead of walking every word.
//!
//! L0 is the raw occupancy bits. L1 holds, per L0 word, the length of
//! that word's longest contiguous zero (free) run. L2 holds the max of
//! 64 L1 bytes, and L3 the max of 64 L2 bytes; L2/L3 only exist once
//! they would hold at least 4 entries, since a handful of bytes isn't
//! worth an extra indirection.

use std::sync::atomic::{AtomicU64, AtomicU8, Ordering};
use std::sync::Arc;

use crate::lock::{thread_lock_id, ExclusiveAccessControl};
use crate::process::ProcessLivenessProvider;

const WAITER_CAPACITY: usize = 16;

/// Exact length of the longest contiguous run of zero bits in `word`,
/// scanning left to right (bit 0 first). A run never wraps past bit 63.
pub(crate) fn max_free_run(word: u64) -> u8 {
    let free = !word;
    let mut idx: u32 = 0;
    let mut best: u32 = 0;
    while idx < 64 {
        let shifted = free >> idx;
        if shifted == 0 {
            break;
        }
        let start = idx + shifted.trailing_zeros();
        if start >= 64 {
            break;
        }
        let run_len = (free >> start).trailing_ones();
        if run_len > best {
            best = run_len;
        }
        idx = start + run_len.max(1);
    }
    best.min(64) as u8
}

/// Find the first contiguous zero run of length `>= n` in `word`;
/// returns its starting bit position.
pub(crate) fn find_free_run(word: u64, n: u32) -> Option<u32> {
    if n == 0 {
        return Some(0);
    }
    let free = !word;
    let mut idx: u32 = 0;
    while idx < 64 {
        let shifted = free >> idx;
        if shifted == 0 {
            return None;
        }
        let start = idx + shifted.trailing_zeros();
        if start >= 64 {
            return None;
        }
        let run_len = (free >> start).trailing_ones();
        if run_len >= n {
            return Some(start);
        }
        idx = start + run_len.max(1);
    }
    None
}

pub(crate) fn run_mask(start: u32, n: u32) -> u64 {
    if n == 64 {
        u64::MAX << start
    } else {
        ((1u64 << n) - 1) << start
    }
}

pub struct ConcurrentBitmap {
    l0: Vec<AtomicU64>,
    l1: Vec<AtomicU8>,
    l2: Option<Vec<AtomicU8>>,
    l3: Option<Vec<AtomicU8>>,
    capacity: usize,
    /// Bits beyond `capacity` in the last L0 word, permanently marked
    /// occupied so they can never be handed out.
    tail_reserved: u32,
    total_set: AtomicU64,
    lock: ExclusiveAccessControl<WAITER_CAPACITY>,
    liveness: Arc<dyn ProcessLivenessProvider>,
    spin_budget: u32,
}

impl ConcurrentBitmap {
    pub fn new(capacity: usize, liveness: Arc<dyn ProcessLivenessProvider>, spin_budget: u32) -> Self {
        let word_count = capacity.div_ceil(64);
        let l0: Vec<AtomicU64> = (0..word_count).map(|_| AtomicU64::new(0)).collect();

        let tail_reserved = if capacity % 64 != 0 {
            let tail_bits = (capacity % 64) as u32;
            let mask = u64::MAX << tail_bits;
            l0[word_count - 1].store(mask, Ordering::Relaxed);
            64 - tail_bits
        } else {
            0
        };

        let l1: Vec<AtomicU8> = l0
            .iter()
            .map(|w| AtomicU8::new(max_free_run(w.load(Ordering::Relaxed))))
            .collect();

        let l2 = if l1.len().div_ceil(64) >= 4 {
            let l2_len = l1.len().div_ceil(64);
            Some(
                (0..l2_len)
                    .map(|j| {
                        let start = j * 64;
                        let end = (start + 64).min(l1.len());
                        AtomicU8::new((start..end).map(|i| l1[i].load(Ordering::Relaxed)).max().unwrap_or(0))
                    })
                    .collect(),
            )
        } else {
            None
        };

        let l3 = if let Some(l2) = &l2 {
            if l2.len().div_ceil(64) >= 4 {
                let l3_len = l2.len().div_ceil(64);
                Some(
                    (0..l3_len)
                        .map(|j| {
                            let start = j * 64;
                            let end = (start + 64).min(l2.len());
                            AtomicU8::new((start..end).map(|i| l2[i].load(Ordering::Relaxed)).max().unwrap_or(0))
                        })
                        .collect(),
                )
            } else {
                None
            }
        } else {
            None
        };

        ConcurrentBitmap {
            l0,
            l1,
            l2,
            l3,
            capacity,
            tail_reserved,
            total_set: AtomicU64::new(0),
            lock: ExclusiveAccessControl::new(),
            liveness,
            spin_budget,
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn total_set(&self) -> u64 {
        self.total_set.load(Ordering::Acquire)
    }

    fn find_candidate_word(&self, n: u32) -> Option<usize> {
        let l1_len = self.l1.len();
        if let Some(l3) = &self.l3 {
            let l2 = self.l2.as_ref().expect("L3 implies L2");
            for (l3_idx, entry) in l3.iter().enumerate() {
                if (entry.load(Ordering::Acquire) as u32) < n {
                    continue;
                }
                let l2_start = l3_idx * 64;
                let l2_end = (l2_start + 64).min(l2.len());
                for l2_idx in l2_start..l2_end {
                    if (l2[l2_idx].load(Ordering::Acquire) as u32) < n {
                        continue;
                    }
                    if let Some(found) = self.scan_l1_window(l2_idx, l1_len, n) {
                        return Some(found);
                    }
                }
            }
            return None;
        }
        if let Some(l2) = &self.l2 {
            for (l2_idx, entry) in l2.iter().enumerate() {
                if (entry.load(Ordering::Acquire) as u32) < n {
                    continue;
                }
                if let Some(found) = self.scan_l1_window(l2_idx, l1_len, n) {
                    return Some(found);
                }
            }
            return None;
        }
        (0..l1_len).find(|&i| (self.l1[i].load(Ordering::Acquire) as u32) >= n)
    }

    fn scan_l1_window(&self, l2_idx: usize, l1_len: usize, n: u32) -> Option<usize> {
        let start = l2_idx * 64;
        let end = (start + 64).min(l1_len);
        (start..end).find(|&i| (self.l1[i].load(Ordering::Acquire) as u32) >= n)
    }

    fn rebuild_from(&self, word_idx: usize) {
        let new_l1 = max_free_run(self.l0[word_idx].load(Ordering::Acquire));
        let old_l1 = self.l1[word_idx].swap(new_l1, Ordering::AcqRel);
        if old_l1 == new_l1 {
            return;
        }
        let Some(l2) = &self.l2 else { return };
        let l2_idx = word_idx / 64;
        let l1_start = l2_idx * 64;
        let l1_end = (l1_start + 64).min(self.l1.len());
        let new_l2 = (l1_start..l1_end).map(|i| self.l1[i].load(Ordering::Acquire)).max().unwrap_or(0);
        let old_l2 = l2[l2_idx].swap(new_l2, Ordering::AcqRel);
        if old_l2 == new_l2 {
            return;
        }
        let Some(l3) = &self.l3 else { return };
        let l3_idx = l2_idx / 64;
        let l2_start = l3_idx * 64;
        let l2_end = (l2_start + 64).min(l2.len());
        let new_l3 = (l2_start..l2_end).map(|i| l2[i].load(Ordering::Acquire)).max().unwrap_or(0);
        l3[l3_idx].store(new_l3, Ordering::Release);
    }

    /// Allocate a contiguous run of `n` (1..=64) bits. Returns the bit
    /// index of the run's start, or `-1` if no run of that length is
    /// available (or `n` is out of range, or the map is already full).
    pub fn allocate_bits(&self, n: u32) -> i32 {
        if n == 0 || n > 64 {
            return -1;
        }
        loop {
            if self.total_set.load(Ordering::Acquire) + n as u64 > self.capacity as u64 {
                return -1;
            }
            let Some(word_idx) = self.find_candidate_word(n) else {
                return -1;
            };

            let lock_id = thread_lock_id();
            let pid = std::process::id() as i32;
            if self.lock.try_enter(lock_id, pid, None, &*self.liveness, self.spin_budget) != Ok(true) {
                continue;
            }

            let word = self.l0[word_idx].load(Ordering::Acquire);
            let result = find_free_run(word, n).map(|start| {
                let mask = run_mask(start, n);
                self.l0[word_idx].store(word | mask, Ordering::Release);
                self.total_set.fetch_add(n as u64, Ordering::AcqRel);
                self.rebuild_from(word_idx);
                (word_idx * 64 + start as usize) as i32
            });
            let _ = self.lock.exit(lock_id);

            if let Some(idx) = result {
                return idx;
            }
            // Another allocator won the race for this word; retry from scratch.
        }
    }

    /// Clear a run of `n` bits starting at `index`. No validation of
    /// prior state: freeing bits that were already clear silently
    /// corrupts `total_set` bookkeeping, the same way the source
    /// design leaves double-free detection to the caller.
    pub fn free_bits(&self, index: i32, n: u32) {
        debug_assert!(n >= 1 && n <= 64);
        let word_idx = index as usize / 64;
        let bit_off = index as usize % 64;
        debug_assert!(bit_off as u32 + n <= 64, "free_bits run must not cross a word boundary");

        let lock_id = thread_lock_id();
        let pid = std::process::id() as i32;
        while self.lock.try_enter(lock_id, pid, None, &*self.liveness, self.spin_budget) != Ok(true) {}

        let mask = run_mask(bit_off as u32, n);
        let word = self.l0[word_idx].load(Ordering::Acquire);
        self.l0[word_idx].store(word & !mask, Ordering::Release);
        self.total_set.fetch_sub(n as u64, Ordering::AcqRel);
        self.rebuild_from(word_idx);

        let _ = self.lock.exit(lock_id);
    }

    /// Recompute every level from L0 and compare against the live
    /// state. Returns `Err` describing the first mismatch found.
    pub fn sanity_check(&self) -> Result<(), String> {
        let mut real_set: u64 = 0;
        for (i, word) in self.l0.iter().enumerate() {
            let w = word.load(Ordering::Acquire);
            real_set += w.count_ones() as u64;
            let expected_l1 = max_free_run(w);
            let actual_l1 = self.l1[i].load(Ordering::Acquire);
            if expected_l1 != actual_l1 {
                return Err(format!("L1[{i}] = {actual_l1}, expected {expected_l1}"));
            }
        }
        real_set -= self.tail_reserved as u64;
        if real_set != self.total_set.load(Ordering::Acquire) {
            return Err(format!(
                "total_set = {}, expected {}",
                self.total_set.load(Ordering::Acquire),
                real_set
            ));
        }
        if let Some(l2) = &self.l2 {
            for (j, entry) in l2.iter().enumerate() {
                let start = j * 64;
                let end = (start + 64).min(self.l1.len());
                let expected = (start..end).map(|i| self.l1[i].load(Ordering::Acquire)).max().unwrap_or(0);
                let actual = entry.load(Ordering::Acquire);
                if expected != actual {
                    return Err(format!("L2[{j}] = {actual}, expected {expected}"));
                }
            }
        }
        if let (Some(l2), Some(l3)) = (&self.l2, &self.l3) {
            for (j, entry) in l3.iter().enumerate() {
                let start = j * 64;
                let end = (start + 64).min(l2.len());
                let expected = (start..end).map(|i| l2[i].load(Ordering::Acquire)).max().unwrap_or(0);
                let actual = entry.load(Ordering::Acquire);
                if expected != actual {
                    return Err(format!("L3[{j}] = {actual}, expected {expected}"));
                }
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::process::DefaultProcessProvider;

    fn bitmap(capacity: usize) -> ConcurrentBitmap {
        ConcurrentBitmap::new(capacity, Arc::new(DefaultProcessProvider), 64)
    }

    #[test]
    fn max_free_run_cases() {
        assert_eq!(max_free_run(0), 64);
        assert_eq!(max_free_run(u64::MAX), 0);
        assert_eq!(max_free_run(0b1), 63);
        assert_eq!(max_free_run(0b1000_0000), 56);
        assert_eq!(max_free_run(0b0101), 61);
    }

    #[test]
    fn allocate_and_free_roundtrip() {
        let bm = bitmap(128);
        let a = bm.allocate_bits(10);
        assert!(a >= 0);
        assert_eq!(bm.total_set(), 10);
        bm.free_bits(a, 10);
        assert_eq!(bm.total_set(), 0);
        bm.sanity_check().unwrap();
    }

    #[test]
    fn rejects_out_of_range_lengths() {
        let bm = bitmap(128);
        assert_eq!(bm.allocate_bits(0), -1);
        assert_eq!(bm.allocate_bits(65), -1);
    }

    #[test]
    fn exhausts_capacity() {
        let bm = bitmap(64);
        let a = bm.allocate_bits(64);
        assert_eq!(a, 0);
        assert_eq!(bm.allocate_bits(1), -1);
        bm.free_bits(a, 64);
        assert_eq!(bm.allocate_bits(64), 0);
    }

    #[test]
    fn tail_bits_are_unaddressable() {
        let bm = bitmap(100); // 2 words, last word has 36 reserved tail bits
        assert_eq!(bm.tail_reserved, 28);
        // only 100 bits should ever be allocatable
        let mut allocated = 0u64;
        loop {
            let idx = bm.allocate_bits(4);
            if idx < 0 {
                break;
            }
            allocated += 4;
        }
        assert_eq!(allocated, 100);
        bm.sanity_check().unwrap();
    }

    #[test]
    fn hierarchy_activates_for_large_capacity() {
        let bm = bitmap(1_048_576);
        assert!(bm.l2.is_some());
        assert!(bm.l3.is_some());
        for i in 0..2000u32 {
            let n = (i % 4) + 1;
            let idx = bm.allocate_bits(n);
            assert!(idx >= 0);
        }
        bm.sanity_check().unwrap();
    }

    #[test]
    fn stress_allocate_free_sanity() {
        let bm = bitmap(1_048_576);
        let mut allocations = Vec::new();
        for i in 0..10_000u32 {
            let n = (i % 4) + 1;
            let idx = bm.allocate_bits(n);
            assert!(idx >= 0, "allocation {i} of size {n} failed");
            allocations.push((idx, n));
        }
        for (i, (idx, n)) in allocations.iter().enumerate() {
            if i % 3 == 0 {
                bm.free_bits(*idx, *n);
            }
        }
        bm.sanity_check().unwrap();
    }
}
