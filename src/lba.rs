//! Large-block allocator: one arena per request-sized (or larger) chunk,
//! 64-byte aligned, for allocations above the small-block threshold.
//!
//! Unlike `SmallBlockAllocator`'s fixed 1 MiB arenas, an LBA arena's size
//! is `max(LBA_ARENA_MIN_SIZE, next_power_of_two(requested payload +
//! header overhead))`, so a single oversized request doesn't starve
//! smaller ones sharing the same chain — it just gets its own
//! appropriately-sized arena, which later large requests may also land
//! in if they fit its leftover free space.

use std::sync::atomic::{AtomicPtr, Ordering};
use std::sync::{Arc, Mutex};

use crate::arena::Arena;
use crate::block::Block;
use crate::error::{Error, Result};
use crate::options::{LBA_ALLOC_UNIT, LBA_ARENA_MIN_SIZE};
use crate::os::{os_alloc_aligned, os_free};
use crate::process::ProcessLivenessProvider;
use crate::referential::BlockReferential;
use crate::segment::MemorySegment;
use crate::stats::Stats;

/// The largest payload a single LBA segment can carve. Bounded well
/// below `u32::MAX` so `GenBlockHeader.extra` (a `u32`) never overflows.
pub const MAX_SEGMENT_SIZE: usize = 0x7FFF_FFFF;

struct ArenaNode {
    arena: Arc<Arena>,
    raw: std::ptr::NonNull<u8>,
    len: usize,
    next_ptr: AtomicPtr<ArenaNode>,
}

impl ArenaNode {
    fn next(&self) -> *mut ArenaNode {
        self.next_ptr.load(Ordering::Acquire)
    }
    fn cas_next(&self, expected: *mut ArenaNode, new: *mut ArenaNode) -> bool {
        self.next_ptr.compare_exchange(expected, new, Ordering::AcqRel, Ordering::Acquire).is_ok()
    }
}

pub struct LargeBlockAllocator {
    head: AtomicPtr<ArenaNode>,
    append_lock: Mutex<()>,
    referential: Arc<BlockReferential>,
    liveness: Arc<dyn ProcessLivenessProvider>,
    spin_budget: u32,
    stats: Arc<Stats>,
}

unsafe impl Send for LargeBlockAllocator {}
unsafe impl Sync for LargeBlockAllocator {}

fn arena_size_for(payload: usize) -> usize {
    let needed = (payload + LBA_ALLOC_UNIT * 2).next_power_of_two();
    needed.max(LBA_ARENA_MIN_SIZE)
}

impl LargeBlockAllocator {
    pub fn new(
        referential: Arc<BlockReferential>,
        liveness: Arc<dyn ProcessLivenessProvider>,
        spin_budget: u32,
        stats: Arc<Stats>,
    ) -> Self {
        LargeBlockAllocator {
            head: AtomicPtr::new(std::ptr::null_mut()),
            append_lock: Mutex::new(()),
            referential,
            liveness,
            spin_budget,
            stats,
        }
    }

    fn append_arena(&self, at_least_payload: usize) -> Result<Arc<Arena>> {
        let _guard = self.append_lock.lock().unwrap();
        let size = arena_size_for(at_least_payload);
        let raw = os_alloc_aligned(size, LBA_ALLOC_UNIT, &self.stats)?;
        let segment = MemorySegment::local(raw, size);
        let arena = Arc::new(Arena::new(
            segment,
            LBA_ALLOC_UNIT,
            MAX_SEGMENT_SIZE,
            self.liveness.clone(),
            self.spin_budget,
        ));
        let block_index = self.referential.register(arena.clone());
        arena.set_block_index(block_index);

        let node = Box::into_raw(Box::new(ArenaNode {
            arena: arena.clone(),
            raw,
            len: size,
            next_ptr: AtomicPtr::new(std::ptr::null_mut()),
        }));
        loop {
            let cursor = self.head.load(Ordering::Acquire);
            if cursor.is_null() {
                match self
                    .head
                    .compare_exchange(std::ptr::null_mut(), node, Ordering::AcqRel, Ordering::Acquire)
                {
                    Ok(_) => return Ok(arena),
                    Err(_) => continue,
                }
            }
            let mut c = cursor;
            loop {
                let next = unsafe { (*c).next() };
                if next.is_null() {
                    if unsafe { (*c).cas_next(std::ptr::null_mut(), node) } {
                        return Ok(arena);
                    }
                    break;
                }
                c = next;
            }
        }
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
        let arena = self.append_arena(size)?;
        Ok(arena.allocate(size)?.expect("a freshly appended arena must fit the request it was sized for"))
    }

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

impl Drop for LargeBlockAllocator {
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

    fn lba() -> LargeBlockAllocator {
        LargeBlockAllocator::new(
            Arc::new(BlockReferential::new()),
            Arc::new(DefaultProcessProvider),
            64,
            Arc::new(Stats::default()),
        )
    }

    #[test]
    fn arena_size_grows_with_request() {
        assert_eq!(arena_size_for(1), LBA_ARENA_MIN_SIZE);
        assert!(arena_size_for(LBA_ARENA_MIN_SIZE * 3) >= LBA_ARENA_MIN_SIZE * 3);
    }

    #[test]
    fn allocate_zero_returns_sentinel() {
        assert!(lba().allocate(0).unwrap().is_empty());
    }

    #[test]
    fn allocate_and_free_large_block() {
        let lba = lba();
        let b = lba.allocate(1 << 20).unwrap();
        assert!(b.len() >= 1 << 20);
        assert_eq!(lba.referential.free(b), Ok(true));
    }

    #[test]
    fn second_request_reuses_leftover_space_in_first_arena() {
        let lba = lba();
        let a = lba.allocate(4096).unwrap();
        let first = unsafe { &*lba.head.load(Ordering::Acquire) };
        assert!(first.next().is_null());
        let b = lba.allocate(4096).unwrap();
        let first_again = unsafe { &*lba.head.load(Ordering::Acquire) };
        assert!(first_again.next().is_null());
        lba.referential.free(a).unwrap();
        lba.referential.free(b).unwrap();
    }
}
