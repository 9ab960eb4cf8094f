//! Allocation statistics, threaded through every OS call and every
//! allocate/free the way a `*mut Stats` parameter threads through
//! `os_mem_alloc`/`os_mem_free` in hand-rolled allocators. Covers the
//! whole core (GPA, MMFA, CBM) instead of just the OS layer, using safe
//! references instead of raw pointers.

use core::sync::atomic::{AtomicI64, Ordering};

#[derive(Default)]
pub struct StatCount {
    pub allocated: AtomicI64,
    pub freed: AtomicI64,
    pub peak: AtomicI64,
    pub current: AtomicI64,
}

impl StatCount {
    pub fn update(&self, amount: i64) {
        if amount == 0 {
            return;
        }
        let current = self.current.fetch_add(amount, Ordering::Relaxed) + amount;
        let mut old_peak = self.peak.load(Ordering::Relaxed);
        while current > old_peak {
            match self.peak.compare_exchange_weak(
                old_peak,
                current,
                Ordering::Relaxed,
                Ordering::Relaxed,
            ) {
                Ok(_) => break,
                Err(actual) => old_peak = actual,
            }
        }
        if amount > 0 {
            self.allocated.fetch_add(amount, Ordering::Relaxed);
        } else {
            self.freed.fetch_add(-amount, Ordering::Relaxed);
        }
    }

    pub fn increase(&self, amount: i64) {
        self.update(amount);
    }

    pub fn decrease(&self, amount: i64) {
        self.update(-amount);
    }

    pub fn snapshot(&self) -> StatSnapshot {
        StatSnapshot {
            allocated: self.allocated.load(Ordering::Relaxed),
            freed: self.freed.load(Ordering::Relaxed),
            peak: self.peak.load(Ordering::Relaxed),
            current: self.current.load(Ordering::Relaxed),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StatSnapshot {
    pub allocated: i64,
    pub freed: i64,
    pub peak: i64,
    pub current: i64,
}

#[derive(Default)]
pub struct StatCounter {
    pub total: AtomicI64,
    pub count: AtomicI64,
}

impl StatCounter {
    pub fn record(&self, amount: i64) {
        self.total.fetch_add(amount, Ordering::Relaxed);
        self.count.fetch_add(1, Ordering::Relaxed);
    }
}

/// Process-wide counters. One `Stats` is shared (by reference) across
/// every arena/sequence/allocator instance, a single tally rather than
/// a fresh `Stats` forked per thread-local-data block.
#[derive(Default)]
pub struct Stats {
    pub arenas: StatCount,
    pub segments: StatCount,
    pub blocks: StatCount,
    pub reserved: StatCount,
    pub committed: StatCount,
    pub mmap_calls: StatCount,
    pub commit_calls: StatCount,
    pub threads: StatCount,
    pub huge: StatCount,
    pub malloc: StatCount,
    pub searches: StatCounter,
    pub mmf_pages: StatCount,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn peak_tracks_the_high_water_mark() {
        let stat = StatCount::default();
        stat.increase(100);
        stat.increase(50);
        stat.decrease(120);
        let snap = stat.snapshot();
        assert_eq!(snap.current, 30);
        assert_eq!(snap.peak, 150);
        assert_eq!(snap.allocated, 150);
        assert_eq!(snap.freed, 120);
    }
}
