//! General allocator: dispatches `Allocate`/`Free`/`Resize`/`AddRef` to a
//! per-thread arena sequence's small- or large-block chain depending on
//! request size.

use std::cell::RefCell;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

use crate::block::Block;
use crate::error::{Error, Result};
use crate::lba::LargeBlockAllocator;
use crate::options::Options;
use crate::process::ProcessLivenessProvider;
use crate::referential::BlockReferential;
use crate::sba::SmallBlockAllocator;
use crate::stats::Stats;

struct AllocatorSequence {
    sba: SmallBlockAllocator,
    lba: LargeBlockAllocator,
}

thread_local! {
    /// Maps a `GeneralAllocator`'s address to the sequence index this
    /// thread was assigned on its first allocation through it. Keyed by
    /// address rather than a single global slot since more than one
    /// `GeneralAllocator` may coexist (tests commonly build several).
    static SEQUENCE_ASSIGNMENTS: RefCell<HashMap<usize, usize>> = RefCell::new(HashMap::new());
}

pub struct GeneralAllocator {
    sequences: Vec<AllocatorSequence>,
    next_sequence: AtomicUsize,
    referential: Arc<BlockReferential>,
    options: Options,
    disposed: AtomicBool,
    stats: Arc<Stats>,
}

impl GeneralAllocator {
    pub fn new(options: Options, liveness: Arc<dyn ProcessLivenessProvider>) -> Result<Self> {
        let referential = Arc::new(BlockReferential::new());
        let stats = Arc::new(Stats::default());
        let count = options.sequence_count();
        let mut sequences = Vec::with_capacity(count);
        for _ in 0..count {
            let sba = SmallBlockAllocator::new(
                referential.clone(),
                liveness.clone(),
                options.lock_spin_budget,
                stats.clone(),
            )?;
            let lba = LargeBlockAllocator::new(
                referential.clone(),
                liveness.clone(),
                options.lock_spin_budget,
                stats.clone(),
            );
            sequences.push(AllocatorSequence { sba, lba });
        }
        Ok(GeneralAllocator {
            sequences,
            next_sequence: AtomicUsize::new(0),
            referential,
            options,
            disposed: AtomicBool::new(false),
            stats,
        })
    }

    pub fn stats(&self) -> &Stats {
        &self.stats
    }

    fn sequence_for_thread(&self) -> &AllocatorSequence {
        let key = self as *const _ as usize;
        let idx = SEQUENCE_ASSIGNMENTS.with(|map| {
            *map.borrow_mut().entry(key).or_insert_with(|| {
                self.next_sequence.fetch_add(1, Ordering::Relaxed) % self.sequences.len()
            })
        });
        &self.sequences[idx]
    }

    fn check_disposed(&self) -> Result<()> {
        if self.disposed.load(Ordering::Acquire) {
            Err(Error::Disposed)
        } else {
            Ok(())
        }
    }

    /// `size == 0` returns the sentinel; `size <= max_small_segment_size`
    /// routes through the thread's SBA chain, otherwise its LBA chain.
    /// The configured threshold is clamped to what a single SBA segment
    /// can actually carve (`sba::MAX_SEGMENT_SIZE`, a few bytes under the
    /// nominal 32 KiB default once the segment header is accounted for),
    /// so a request right at the boundary never gets routed to the SBA
    /// chain only to bounce off its hard per-segment cap.
    pub fn allocate(&self, size: usize) -> Result<Block> {
        self.check_disposed()?;
        if size == 0 {
            return Ok(Block::EMPTY);
        }
        let seq = self.sequence_for_thread();
        let small_threshold = self.options.max_small_segment_size.min(crate::sba::MAX_SEGMENT_SIZE);
        if size <= small_threshold {
            seq.sba.allocate(size)
        } else {
            seq.lba.allocate(size)
        }
    }

    pub fn allocate_typed<T>(&self, count: usize) -> Result<Block> {
        self.allocate(count * std::mem::size_of::<T>())
    }

    /// Returns `false` for an already-freed or unknown-sentinel block;
    /// `Err(UnknownBlock)` only if the header is corrupted.
    pub fn free(&self, block: Block) -> Result<bool> {
        self.check_disposed()?;
        self.referential.free(block)
    }

    pub fn add_ref(&self, block: Block) -> i32 {
        if block.is_empty() {
            return 1;
        }
        unsafe { block.header() }.map(|h| h.add_ref()).unwrap_or(1)
    }

    /// Allocates a new block of `new_size`, copies `min(old_len,
    /// new_size)` bytes over, frees the old block, and updates `*block`
    /// in place.
    pub fn resize(&self, block: &mut Block, new_size: usize, zero_extra: bool) -> Result<bool> {
        self.check_disposed()?;
        if new_size == 0 {
            self.free(*block)?;
            *block = Block::EMPTY;
            return Ok(true);
        }
        let new_block = self.allocate(new_size)?;
        let old_len = block.len();
        if old_len > 0 {
            let copy_len = old_len.min(new_size);
            unsafe {
                new_block.as_mut_slice()[..copy_len].copy_from_slice(&block.as_slice()[..copy_len]);
            }
        }
        if zero_extra && new_size > old_len {
            unsafe {
                new_block.as_mut_slice()[old_len..].fill(0);
            }
        }
        if !block.is_empty() {
            self.free(*block)?;
        }
        *block = new_block;
        Ok(true)
    }

    /// Opportunistically defragment every arena across every sequence.
    /// Not called automatically; callers schedule it (e.g. on an idle
    /// timer) since it takes each affected arena's lock.
    pub fn defragment(&self) {
        for seq in &self.sequences {
            seq.sba.defragment_all();
            seq.lba.defragment_all();
        }
    }

    /// Disable further `Allocate`/`Free`/`Resize` calls. Arenas are
    /// released when this allocator is dropped; disposing while any
    /// live block remains outstanding is undefined behavior per the
    /// allocator contract, not something this call detects.
    pub fn dispose(&self) {
        self.disposed.store(true, Ordering::Release);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::process::DefaultProcessProvider;

    fn gpa() -> GeneralAllocator {
        GeneralAllocator::new(Options::default(), Arc::new(DefaultProcessProvider)).unwrap()
    }

    #[test]
    fn allocate_zero_is_sentinel() {
        let gpa = gpa();
        let b = gpa.allocate(0).unwrap();
        assert!(b.is_empty());
        assert_eq!(gpa.free(b), Ok(false));
    }

    #[test]
    fn small_and_large_requests_both_round_trip() {
        let gpa = gpa();
        let small = gpa.allocate(64).unwrap();
        let large = gpa.allocate(1 << 20).unwrap();
        assert!(small.len() >= 64);
        assert!(large.len() >= 1 << 20);
        assert_eq!(gpa.free(small), Ok(true));
        assert_eq!(gpa.free(large), Ok(true));
    }

    #[test]
    fn resize_preserves_prefix_bytes() {
        let gpa = gpa();
        let mut b = gpa.allocate(32).unwrap();
        unsafe {
            b.as_mut_slice()[..4].copy_from_slice(b"abcd");
        }
        gpa.resize(&mut b, 256, true).unwrap();
        assert!(b.len() >= 256);
        unsafe {
            assert_eq!(&b.as_slice()[..4], b"abcd");
        }
        gpa.free(b).unwrap();
    }

    #[test]
    fn resize_to_zero_frees_and_returns_sentinel() {
        let gpa = gpa();
        let mut b = gpa.allocate(32).unwrap();
        gpa.resize(&mut b, 0, false).unwrap();
        assert!(b.is_empty());
    }

    #[test]
    fn add_ref_then_k_plus_one_frees_yields_one_dealloc() {
        let gpa = gpa();
        let b = gpa.allocate(16).unwrap();
        gpa.add_ref(b);
        gpa.add_ref(b);
        assert_eq!(gpa.free(b), Ok(false));
        assert_eq!(gpa.free(b), Ok(false));
        assert_eq!(gpa.free(b), Ok(true));
    }

    #[test]
    fn dispose_rejects_further_allocations() {
        let gpa = gpa();
        gpa.dispose();
        assert_eq!(gpa.allocate(16), Err(Error::Disposed));
    }

    #[test]
    fn linear_then_interleaved_scenario() {
        let gpa = gpa();
        let mut blocks = Vec::new();
        loop {
            match gpa.allocate(16) {
                Ok(b) => blocks.push(b),
                Err(_) => break,
            }
            if blocks.len() > 70_000 {
                break;
            }
        }
        let total = blocks.len();
        assert!(total > 1000);
        for (i, b) in blocks.iter().enumerate() {
            if i % 2 == 1 {
                gpa.free(*b).unwrap();
            }
        }
        let freed = total / 2;
        let mut realloc_count = 0;
        for _ in 0..freed {
            if gpa.allocate(16).is_ok() {
                realloc_count += 1;
            }
        }
        assert_eq!(realloc_count, freed);
    }
}
