//! Small-block allocator: a chain of 1 MiB arenas serving requests up to
//! a few tens of kilobytes, 16-byte aligned.

use std::sync::atomic::{AtomicPtr, Ordering};
use std::sync::{Arc, Mutex};

use crate::arena::Arena;
use crate::block::{Block, GEN_BLOCK_HEADER_SIZE};
use crate::error::{Error, Result};
use crate::options::{ALLOC_UNIT, SBA_ARENA_SIZE};
use crate::os::{os_alloc_aligned, os_free};
use crate::process::ProcessLivenessProvider;
use crate::referential::BlockReferential;
use crate::segment::MemorySegment;
use crate::stats::Stats;

/// The largest payload a single SBA segment can carve, leaving room for
/// the fixed one-`ALLOC_UNIT` header region and the boundary-tag
/// trailer on every segment within a 1 MiB arena.
pub const MAX_SEGMENT_SIZE: usize = 0x8000 - GEN_BLOCK_HEADER_SIZE;

struct ArenaNode {
    arena: Arc<Arena>,
    raw: std::ptr::NonNull<u8>,
    len: usize,
    next_ptr: AtomicPtr<ArenaNode>,
}

/// One thread-assigned sequence of arenas. Appending a new arena only
/// happens under `append_lock`; scanning the existing chain for a fit
/// is lock-free at this level (each `Arena` has its own internal lock).
pub struct SmallBlockAllocator {
    head: AtomicPtr<ArenaNode>,
    append_lock: Mutex<()>,
    referential: Arc<BlockReferential>,
    liveness: Arc<dyn ProcessLivenessProvider>,
    spin_budget: u32,
    stats: Arc<Stats>,
}

// Safety: `ArenaNode` chain nodes are only ever appended, never removed
// or mutated in place, and are leaked for the allocator's lifetime.
unsafe impl Send for SmallBlockAllocator {}
unsafe impl Sync for SmallBlockAllocator {}

impl SmallBlockAllocator {
    pub fn new(
        referential: Arc<BlockReferential>,
        liveness: Arc<dyn ProcessLivenessProvider>,
        spin_budget: u32,
        stats: Arc<Stats>,
    ) -> Result<Self> {
        let sba = SmallBlockAllocator {
            head: AtomicPtr::new(std::ptr::null_mut()),
            append_lock: Mutex::new(()),
            referential,
            liveness,
            spin_budget,
            stats,
        };
        sba.append_arena()?;
        Ok(sba)
    }

    fn append_arena(&self) -> Result<Arc<Arena>> {
        let _guard = self.append_lock.lock().unwrap();
        let raw = os_alloc_aligned(SBA_ARENA_SIZE, ALLOC_UNIT, &self.stats)?;
        let segment = MemorySegment::local(raw, SBA_ARENA_SIZE);
        let arena = Arc::new(Arena::new(
            segment,
            ALLOC_UNIT,
            MAX_SEGMENT_SIZE,
            self.liveness.clone(),
            self.spin_budget,
        ));
        let block_index = self.referential.register(arena.clone());
        arena.set_block_index(block_index);

        let node = Box::into_raw(Box::new(ArenaNode {
            arena: arena.clone(),
            raw,
            len: SBA_ARENA_SIZE,
            next_ptr: AtomicPtr::new(std::ptr::null_mut()),
        }));
        // Link the new node at the tail so older arenas (more likely to
        // have free space from prior frees) are tried first.
        loop {
            let mut cursor = self.head.load(Ordering::Acquire);
            if cursor.is_null() {
                match self
                    .head
                    .compare_exchange(std::ptr::null_mut(), node, Ordering::AcqRel, Ordering::Acquire)
                {
                    Ok(_) => break,
                    Err(_) => continue,
                }
            }
            loop {
                let next = unsafe { (*cursor).next() };
                if next.is_null() {
                    if unsafe { (*cursor).cas_next(std::ptr::null_mut(), node) } {
                        return Ok(arena);
                    }
                    break;
                }
                cursor = next;
            }
        }
        Ok(arena)
    }

    pub fn allocate(&self, size: usize) -> Result<Block> {
        if size == 0 {
            return Ok(Block::EMPTY);
        }
        if size > MAX_SEGMENT_SIZE {
            return Err(Error::CapacityTooBig {
                requested: size,
                capacity: MAX_SEGMENT_SIZE,
            });
        }
        let mut cursor = self.head.load(Ordering::Acquire);
        while !cursor.is_null() {
            let arena = unsafe { &(*cursor).arena };
            if let Some(block) = arena.allocate(size)? {
                return Ok(block);
            }
            cursor = unsafe { (*cursor).next() };
        }
        let arena = self.append_arena()?;
        Ok(arena.allocate(size)?.expect("a freshly appended arena must fit any in-range request"))
    }

    /// Opportunistically defragment every arena whose fragmentation
    /// heuristic trips. Intended to be called periodically, not inline
    /// with every free.
    pub fn defragment_all(&self) {
        let mut cursor = self.head.load(Ordering::Acquire);
        while !cursor.is_null() {
            let arena = unsafe { &(*cursor).arena };
            if arena.should_defragment() {
                arena.defragment();
            }
            cursor = unsafe { (*cursor).next() };
        }
    }
}

impl ArenaNode {
    fn next(&self) -> *mut ArenaNode {
        self.next_ptr.load(Ordering::Acquire)
    }
    fn cas_next(&self, expected: *mut ArenaNode, new: *mut ArenaNode) -> bool {
        self.next_ptr.compare_exchange(expected, new, Ordering::AcqRel, Ordering::Acquire).is_ok()
    }
}

impl Drop for SmallBlockAllocator {
    fn drop(&mut self) {
        let mut cursor = self.head.load(Ordering::Acquire);
        while !cursor.is_null() {
            let node = unsafe { Box::from_raw(cursor) };
            let next = node.next();
            os_free(node.raw, node.len, &self.stats);
            cursor = next;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::process::DefaultProcessProvider;

    fn sba() -> SmallBlockAllocator {
        SmallBlockAllocator::new(
            Arc::new(BlockReferential::new()),
            Arc::new(DefaultProcessProvider),
            64,
            Arc::new(Stats::default()),
        )
        .unwrap()
    }

    #[test]
    fn allocate_zero_returns_sentinel() {
        let sba = sba();
        assert!(sba.allocate(0).unwrap().is_empty());
    }

    #[test]
    fn rejects_oversized_request() {
        let sba = sba();
        assert!(matches!(sba.allocate(MAX_SEGMENT_SIZE + 1), Err(Error::CapacityTooBig { .. })));
    }

    #[test]
    fn allocate_and_free_roundtrip() {
        let sba = sba();
        let b = sba.allocate(128).unwrap();
        assert!(b.len() >= 128);
        assert_eq!(sba.referential.free(b), Ok(true));
    }

    #[test]
    fn appends_new_arena_when_full() {
        let sba = sba();
        let mut blocks = Vec::new();
        loop {
            match sba.allocate(4096) {
                Ok(b) => blocks.push(b),
                Err(_) => break,
            }
            if blocks.len() > 1000 {
                break;
            }
        }
        assert!(blocks.len() > 200);
        // A second arena must have been appended by now.
        let first = unsafe { &*sba.head.load(Ordering::Acquire) };
        assert!(!first.next().is_null());
    }
}
