//! Shared segment-list engine behind both the small-block allocator
//! (`sba.rs`) and the large-block allocator (`lba.rs`): a pinned byte
//! range carved into segments via an address-ordered free list and
//! first-fit allocation, with forward/backward coalescing on free.
//!
//! SBA and LBA differ only in their `alloc_unit` (16 vs 64 bytes) and
//! `max_segment_size`; everything else — the layout, the locking, the
//! coalescing — is this one engine, generalized by those two numbers
//! instead of duplicated.
//!
//! **Layout.** Every segment reserves one `alloc_unit`-sized region
//! immediately before its user bytes (the last `GEN_BLOCK_HEADER_SIZE`
//! bytes of which are the `GenBlockHeader`; anything before that in the
//! region is unused padding, or for a wider header the second field a
//! particular allocator wants there) and one more `alloc_unit`-sized
//! region immediately after its payload holding a 4-byte boundary tag:
//! this segment's own id, letting `free` find its backward neighbor by
//! reading the tag immediately before its header region without
//! scanning the free list. `GenBlockHeader.extra` always holds this
//! segment's payload length, whether the segment is free or occupied;
//! the free list's prev/next links live in the segment's own payload
//! bytes, since a free segment has no live user data to protect.
//! Segment ids are `alloc_unit`-unit offsets from the arena base; id 0
//! is reserved to mean "no link" (the arena's leading `alloc_unit` is
//! unused padding, so the first real segment is id 1).

use std::ptr::NonNull;
use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering};
use std::sync::Arc;

use crate::block::{Block, GenBlockHeader, GEN_BLOCK_HEADER_SIZE};
use crate::error::{Error, Result};
use crate::lock::{thread_lock_id, ExclusiveAccessControl};
use crate::options::MIN_SEGMENT_SIZE;
use crate::os::align_up;
use crate::process::ProcessLivenessProvider;
use crate::referential::BlockOwner;
use crate::segment::MemorySegment;

const WAITER_CAPACITY: usize = 16;
const NO_ID: u32 = 0;
const UNREGISTERED: u32 = u32::MAX;

pub struct Arena {
    base: MemorySegment,
    alloc_unit: usize,
    max_segment_size: usize,
    free_head: AtomicU32,
    free_count: AtomicU32,
    occupied_count: AtomicU32,
    occupied_bytes: AtomicUsize,
    block_index: AtomicU32,
    lock: ExclusiveAccessControl<WAITER_CAPACITY>,
    liveness: Arc<dyn ProcessLivenessProvider>,
    spin_budget: u32,
}

impl Arena {
    /// Reserve a new arena of `arena_len` bytes, laid out as one free
    /// segment spanning the whole range minus the leading padding unit.
    pub fn new(
        base: MemorySegment,
        alloc_unit: usize,
        max_segment_size: usize,
        liveness: Arc<dyn ProcessLivenessProvider>,
        spin_budget: u32,
    ) -> Self {
        debug_assert!(base.len() > 3 * alloc_unit, "arena too small to hold even one segment");
        let arena = Arena {
            base,
            alloc_unit,
            max_segment_size,
            free_head: AtomicU32::new(1),
            free_count: AtomicU32::new(1),
            occupied_count: AtomicU32::new(0),
            occupied_bytes: AtomicUsize::new(0),
            block_index: AtomicU32::new(UNREGISTERED),
            lock: ExclusiveAccessControl::new(),
            liveness,
            spin_budget,
        };
        let initial_payload = arena.base.len() - 3 * alloc_unit;
        arena.write_footer(1, initial_payload);
        arena.write_free_links(1, NO_ID, NO_ID);
        let header = arena.header_mut(1);
        header.flags_and_index.store(crate::block::pack_flags(0, false, true), Ordering::Relaxed);
        header.ref_count.store(0, Ordering::Relaxed);
        header.extra.store(initial_payload as u32, Ordering::Relaxed);
        arena
    }

    /// Called once, right after this arena is registered with a
    /// `BlockReferential`, so every header it stamps carries the id
    /// `Free` needs to dispatch back here.
    pub fn set_block_index(&self, id: u32) {
        self.block_index.store(id, Ordering::Release);
    }

    fn block_index(&self) -> u32 {
        self.block_index.load(Ordering::Acquire)
    }

    pub fn arena_len(&self) -> usize {
        self.base.len()
    }

    pub fn free_segment_count(&self) -> u32 {
        self.free_count.load(Ordering::Acquire)
    }

    pub fn occupied_count(&self) -> u32 {
        self.occupied_count.load(Ordering::Acquire)
    }

    pub fn occupied_bytes(&self) -> usize {
        self.occupied_bytes.load(Ordering::Acquire)
    }

    pub fn is_empty_of_blocks(&self) -> bool {
        self.occupied_count.load(Ordering::Acquire) == 0
    }

    fn base_ptr(&self) -> *mut u8 {
        self.base.resolve().expect("arena base must always be resolvable").as_ptr()
    }

    fn header_region_offset(&self, id: u32) -> usize {
        id as usize * self.alloc_unit
    }

    fn offset_ptr(&self, offset: usize) -> *mut u8 {
        unsafe { self.base_ptr().add(offset) }
    }

    fn header_mut(&self, id: u32) -> &GenBlockHeader {
        let header_off = self.header_region_offset(id) + self.alloc_unit - GEN_BLOCK_HEADER_SIZE;
        unsafe { &*(self.offset_ptr(header_off) as *const GenBlockHeader) }
    }

    fn user_ptr(&self, id: u32) -> NonNull<u8> {
        NonNull::new(self.offset_ptr(self.header_region_offset(id) + self.alloc_unit)).unwrap()
    }

    fn segment_payload(&self, id: u32) -> usize {
        self.header_mut(id).extra.load(Ordering::Acquire) as usize
    }

    fn footprint(&self, payload: usize) -> usize {
        2 * self.alloc_unit + payload
    }

    fn footer_ptr(&self, id: u32, payload: usize) -> *mut u32 {
        let off = self.header_region_offset(id) + self.alloc_unit + payload;
        self.offset_ptr(off) as *mut u32
    }

    fn write_footer(&self, id: u32, payload: usize) {
        unsafe { *self.footer_ptr(id, payload) = id };
    }

    fn free_links_ptr(&self, id: u32) -> *mut u32 {
        self.user_ptr(id).as_ptr() as *mut u32
    }

    fn read_free_links(&self, id: u32) -> (u32, u32) {
        unsafe {
            let p = self.free_links_ptr(id);
            (*p, *p.add(1))
        }
    }

    fn write_free_links(&self, id: u32, prev: u32, next: u32) {
        unsafe {
            let p = self.free_links_ptr(id);
            *p = prev;
            *p.add(1) = next;
        }
    }

    fn backward_neighbor(&self, id: u32) -> Option<u32> {
        if id <= 1 {
            return None;
        }
        let off = self.header_region_offset(id) - self.alloc_unit;
        let pid = unsafe { *(self.offset_ptr(off) as *const u32) };
        if pid == 0 {
            None
        } else {
            Some(pid)
        }
    }

    fn forward_neighbor(&self, id: u32, payload: usize) -> Option<u32> {
        let next_off = self.header_region_offset(id) + self.footprint(payload);
        if next_off + self.alloc_unit > self.base.len() {
            return None;
        }
        Some((next_off / self.alloc_unit) as u32)
    }

    /// Remove `id` from the free list, given the neighbors it was
    /// linked between.
    fn unlink_free(&self, id: u32, prev: u32, next: u32) {
        if prev == NO_ID {
            self.free_head.store(next, Ordering::Release);
        } else {
            let (pp, _) = self.read_free_links(prev);
            self.write_free_links(prev, pp, next);
        }
        if next != NO_ID {
            let (_, nn) = self.read_free_links(next);
            self.write_free_links(next, prev, nn);
        }
        self.free_count.fetch_sub(1, Ordering::AcqRel);
    }

    /// Insert `id` into the free list immediately after `prev` (or at
    /// the head if `prev == NO_ID`), preserving address order.
    fn link_free_after(&self, prev: u32, id: u32) {
        let next = if prev == NO_ID {
            let head = self.free_head.load(Ordering::Acquire);
            self.free_head.store(id, Ordering::Release);
            head
        } else {
            let (pp, pn) = self.read_free_links(prev);
            self.write_free_links(prev, pp, id);
            pn
        };
        if next != NO_ID {
            let (_, nn) = self.read_free_links(next);
            self.write_free_links(next, id, nn);
        }
        self.write_free_links(id, prev, next);
        self.free_count.fetch_add(1, Ordering::AcqRel);
    }

    fn round_payload(&self, size: usize) -> usize {
        align_up(size.max(1), self.alloc_unit)
    }

    fn acquire(&self) {
        let lock_id = thread_lock_id();
        let pid = std::process::id() as i32;
        while self.lock.try_enter(lock_id, pid, None, &*self.liveness, self.spin_budget) != Ok(true) {}
    }

    fn release(&self) {
        let _ = self.lock.exit(thread_lock_id());
    }

    /// Attempt to satisfy `size` bytes from this arena's free list.
    /// `Ok(None)` means this arena has no segment large enough; the
    /// caller should try the next arena in the sequence or append a new
    /// one.
    pub fn allocate(&self, size: usize) -> Result<Option<Block>> {
        let payload = self.round_payload(size);
        if payload > self.max_segment_size {
            return Err(Error::OutOfMemory);
        }
        let required_total = self.alloc_unit + payload;

        self.acquire();

        let mut list_prev = NO_ID;
        let mut cur = self.free_head.load(Ordering::Acquire);
        while cur != NO_ID {
            let seg_payload = self.segment_payload(cur);
            if self.alloc_unit + seg_payload >= required_total {
                break;
            }
            list_prev = cur;
            cur = self.read_free_links(cur).1;
        }

        if cur == NO_ID {
            self.release();
            return Ok(None);
        }

        let (_, list_next) = self.read_free_links(cur);
        let seg_payload = self.segment_payload(cur);
        let seg_total = self.alloc_unit + seg_payload;
        let leftover = seg_total - required_total;

        let occupied_id;
        let final_payload;
        if leftover < self.alloc_unit + MIN_SEGMENT_SIZE {
            // Whole-take: the entire free segment becomes the occupied one.
            self.unlink_free(cur, list_prev, list_next);
            occupied_id = cur;
            final_payload = seg_payload;
        } else {
            // Tail-take: shrink the free segment in place (low address
            // stays free), synthesize a new occupied segment at its tail.
            let new_free_payload = leftover - self.alloc_unit;
            self.header_mut(cur).extra.store(new_free_payload as u32, Ordering::Release);
            self.write_footer(cur, new_free_payload);
            occupied_id = cur + (self.footprint(new_free_payload) / self.alloc_unit) as u32;
            final_payload = payload;
            self.write_footer(occupied_id, final_payload);
        }

        let header = self.header_mut(occupied_id);
        header.extra.store(final_payload as u32, Ordering::Release);
        header
            .flags_and_index
            .store(crate::block::pack_flags(self.block_index(), false, false), Ordering::Release);
        header.ref_count.store(1, Ordering::Release);

        self.occupied_count.fetch_add(1, Ordering::AcqRel);
        self.occupied_bytes.fetch_add(final_payload, Ordering::AcqRel);

        self.release();

        let user_ptr = self.user_ptr(occupied_id);
        Ok(Some(Block::new(MemorySegment::local(user_ptr, final_payload))))
    }

    fn id_from_user_ptr(&self, ptr: NonNull<u8>) -> u32 {
        let offset = ptr.as_ptr() as usize - self.base_ptr() as usize;
        (offset / self.alloc_unit - 1) as u32
    }

    /// Release `block`. The caller (`BlockOwner::free_block`) has
    /// already confirmed the refcount reached zero.
    fn free_segment(&self, ptr: NonNull<u8>) {
        let id = self.id_from_user_ptr(ptr);
        let mut payload = self.segment_payload(id);

        self.acquire();

        self.header_mut(id).set_free(true);
        self.occupied_count.fetch_sub(1, Ordering::AcqRel);
        self.occupied_bytes.fetch_sub(payload, Ordering::AcqRel);

        let mut merged_id = id;

        // Forward coalesce: if the neighbor immediately after us is
        // free, absorb it and drop it from the free list.
        if let Some(fwd) = self.forward_neighbor(merged_id, payload) {
            if self.header_mut(fwd).is_free() {
                let (fp, fn_) = self.read_free_links(fwd);
                self.unlink_free(fwd, fp, fn_);
                let fwd_payload = self.segment_payload(fwd);
                payload += self.footprint(fwd_payload);
            }
        }

        // Backward coalesce: if the neighbor immediately before us is
        // free, let it absorb us instead, and continue as that segment.
        if let Some(back) = self.backward_neighbor(merged_id) {
            if self.header_mut(back).is_free() {
                let (bp, bn) = self.read_free_links(back);
                self.unlink_free(back, bp, bn);
                let back_payload = self.segment_payload(back);
                payload += self.footprint(back_payload);
                merged_id = back;
            }
        }

        self.header_mut(merged_id).extra.store(payload as u32, Ordering::Release);
        self.write_footer(merged_id, payload);

        // Re-insert in address order.
        let mut prev = NO_ID;
        let mut cursor = self.free_head.load(Ordering::Acquire);
        while cursor != NO_ID && cursor < merged_id {
            prev = cursor;
            cursor = self.read_free_links(cursor).1;
        }
        self.link_free_after(prev, merged_id);

        self.release();
    }

    /// Sort the free list by address and fuse runs of adjacent entries
    /// (they shouldn't exist after `free`'s coalescing, but a backlog
    /// of defrag-eligible fragmentation can still accumulate from many
    /// small whole-takes carving up what was once one bigger segment).
    pub fn defragment(&self) {
        self.acquire();
        let mut cur = self.free_head.load(Ordering::Acquire);
        while cur != NO_ID {
            let payload = self.segment_payload(cur);
            match self.forward_neighbor(cur, payload) {
                Some(fwd) if self.header_mut(fwd).is_free() => {
                    let (fp, fnext) = self.read_free_links(fwd);
                    self.unlink_free(fwd, fp, fnext);
                    let fwd_payload = self.segment_payload(fwd);
                    let new_payload = payload + self.footprint(fwd_payload);
                    if new_payload <= self.max_segment_size {
                        self.header_mut(cur).extra.store(new_payload as u32, Ordering::Release);
                        self.write_footer(cur, new_payload);
                        // Re-examine the same node; it may now reach
                        // further forward neighbors.
                    } else {
                        // Would exceed the size a single segment may
                        // claim; leave the neighbor's slot vacated but
                        // re-link it unchanged.
                        self.link_free_after(cur, fwd);
                        cur = self.read_free_links(cur).1;
                    }
                }
                _ => {
                    cur = self.read_free_links(cur).1;
                }
            }
        }
        self.release();
    }

    pub fn should_defragment(&self) -> bool {
        let free = self.free_count.load(Ordering::Acquire);
        if free <= crate::options::DEFRAG_MIN_FREE_SEGMENTS as u32 {
            return false;
        }
        let occupied = self.occupied_count.load(Ordering::Acquire).max(1);
        (free as f64) / (occupied as f64) > 1.0 / crate::options::DEFRAG_MAX_OCCUPANCY_RATIO - 1.0
    }

    /// Walk every segment by address, recomputing occupied/free byte
    /// totals and asserting the free list has no address-adjacent pair.
    #[cfg(debug_assertions)]
    pub fn debug_validate(&self) -> std::result::Result<(), String> {
        let mut id = 1u32;
        let mut total = 0usize;
        let mut last_was_free = false;
        while (self.header_region_offset(id) + self.alloc_unit) < self.base.len() {
            let payload = self.segment_payload(id);
            let is_free = self.header_mut(id).is_free();
            if is_free && last_was_free {
                return Err(format!("address-adjacent free segments at id {id}"));
            }
            last_was_free = is_free;
            total += self.footprint(payload);
            let next = self.header_region_offset(id) + self.footprint(payload);
            if next >= self.base.len() {
                break;
            }
            id = (next / self.alloc_unit) as u32;
        }
        let expected = self.base.len() - self.alloc_unit;
        if total != expected {
            return Err(format!("segments cover {total} bytes, expected {expected}"));
        }
        Ok(())
    }
}

impl BlockOwner for Arena {
    fn free_block(&self, block: Block) -> Result<bool> {
        if block.is_empty() {
            return Ok(false);
        }
        let header = unsafe { block.header() }.ok_or(Error::UnknownBlock)?;
        if header.release() > 0 {
            return Ok(false);
        }
        let ptr = block.segment().resolve().ok_or(Error::UnknownBlock)?;
        self.free_segment(ptr);
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::process::DefaultProcessProvider;
    use std::alloc::{alloc_zeroed, Layout};

    fn test_arena(len: usize, alloc_unit: usize, max_segment_size: usize) -> (Arena, Layout) {
        let layout = Layout::from_size_align(len, alloc_unit.max(16)).unwrap();
        let ptr = unsafe { alloc_zeroed(layout) };
        let base = MemorySegment::local(NonNull::new(ptr).unwrap(), len);
        let arena = Arena::new(base, alloc_unit, max_segment_size, Arc::new(DefaultProcessProvider), 16);
        arena.set_block_index(7);
        (arena, layout)
    }

    #[test]
    fn allocate_and_free_single_block() {
        let (arena, _layout) = test_arena(4096, 16, 2048);
        let block = arena.allocate(32).unwrap().unwrap();
        assert!(block.len() >= 32);
        assert_eq!(arena.occupied_count(), 1);
        arena.free_block(block).unwrap();
        assert_eq!(arena.occupied_count(), 0);
        arena.debug_validate().unwrap();
    }

    #[test]
    fn linear_allocation_fills_and_refills() {
        let (arena, _layout) = test_arena(1 << 16, 16, 2048);
        let mut blocks = Vec::new();
        loop {
            match arena.allocate(16).unwrap() {
                Some(b) => blocks.push(b),
                None => break,
            }
        }
        let count = blocks.len();
        assert!(count > 100);
        for (i, b) in blocks.iter().enumerate() {
            if i % 2 == 1 {
                arena.free_block(*b).unwrap();
            }
        }
        let freed = count / 2;
        for _ in 0..freed {
            assert!(arena.allocate(16).unwrap().is_some());
        }
        arena.debug_validate().unwrap();
    }

    #[test]
    fn defrag_scenario() {
        let (arena, _layout) = test_arena(4096, 16, 2048);
        let a = arena.allocate(16).unwrap().unwrap();
        let b = arena.allocate(16).unwrap().unwrap();
        let c = arena.allocate(16).unwrap().unwrap();
        let free_before = arena.free_segment_count();
        arena.free_block(a).unwrap();
        arena.free_block(c).unwrap();
        arena.free_block(b).unwrap();
        arena.defragment();
        assert_eq!(arena.free_segment_count(), free_before);
        arena.debug_validate().unwrap();
    }

    #[test]
    fn backward_and_forward_coalescing() {
        let (arena, _layout) = test_arena(4096, 16, 2048);
        let a = arena.allocate(16).unwrap().unwrap();
        let b = arena.allocate(16).unwrap().unwrap();
        let c = arena.allocate(16).unwrap().unwrap();
        arena.free_block(a).unwrap();
        arena.free_block(c).unwrap();
        // only a and c are free, not adjacent to each other (b sits between)
        arena.debug_validate().unwrap();
        arena.free_block(b).unwrap();
        // now a, b, c have all coalesced into one run
        arena.debug_validate().unwrap();
    }
}
