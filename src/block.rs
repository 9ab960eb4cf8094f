//! `GenBlockHeader` packing and the user-visible `Block` handle.
//!
//! The header is always the 12 bytes immediately preceding the block's
//! user-visible start address, regardless of whether the owning
//! allocator is SBA, LBA, or MMFA — this is what lets
//! `BlockReferential::free` dispatch purely by reading the header
//! instead of scanning every allocator for it. SBA's 12-byte segment
//! header *is* the `GenBlockHeader`: while a segment is free, the same
//! three words double as `{prev_id, next_id, segment_size}`; once
//! allocated they are reinterpreted as `{ref_count, flags_and_index,
//! segment_size}`. LBA prepends a wider size field before this same
//! 12-byte tail, so the `GenBlockHeader` offset from the user pointer
//! never changes.

use std::mem::size_of;
use std::ptr::NonNull;
use std::sync::atomic::{AtomicI32, AtomicU32, Ordering};

use crate::segment::MemorySegment;

pub const GEN_BLOCK_HEADER_SIZE: usize = 12;

const BLOCK_INDEX_BITS: u32 = 30;
const BLOCK_INDEX_MASK: u32 = (1 << BLOCK_INDEX_BITS) - 1;
const IS_FROM_MMF_BIT: u32 = 1 << 30;
const IS_FREE_BIT: u32 = 1 << 31;

pub const MAX_BLOCK_INDEX: u32 = BLOCK_INDEX_MASK;

#[inline]
pub fn pack_flags(block_index: u32, is_from_mmf: bool, is_free: bool) -> u32 {
    debug_assert!(block_index <= BLOCK_INDEX_MASK);
    (block_index & BLOCK_INDEX_MASK)
        | if is_from_mmf { IS_FROM_MMF_BIT } else { 0 }
        | if is_free { IS_FREE_BIT } else { 0 }
}

#[inline]
pub fn unpack_flags(word: u32) -> (u32, bool, bool) {
    (
        word & BLOCK_INDEX_MASK,
        word & IS_FROM_MMF_BIT != 0,
        word & IS_FREE_BIT != 0,
    )
}

/// The 12-byte header preceding every live block's user bytes.
#[repr(C)]
pub struct GenBlockHeader {
    pub ref_count: AtomicI32,
    pub flags_and_index: AtomicU32,
    /// Reused by the owning allocator: SBA's segment size (low bit =
    /// is_free), or the low word of LBA's wider size field.
    pub extra: AtomicU32,
}

const _: () = assert!(size_of::<GenBlockHeader>() == GEN_BLOCK_HEADER_SIZE);

impl GenBlockHeader {
    pub fn block_index(&self) -> u32 {
        unpack_flags(self.flags_and_index.load(Ordering::Acquire)).0
    }

    pub fn is_from_mmf(&self) -> bool {
        unpack_flags(self.flags_and_index.load(Ordering::Acquire)).1
    }

    pub fn is_free(&self) -> bool {
        unpack_flags(self.flags_and_index.load(Ordering::Acquire)).2
    }

    pub fn set_free(&self, is_free: bool) {
        let mut word = self.flags_and_index.load(Ordering::Acquire);
        loop {
            let (idx, mmf, _) = unpack_flags(word);
            let new_word = pack_flags(idx, mmf, is_free);
            match self.flags_and_index.compare_exchange_weak(
                word,
                new_word,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => return,
                Err(actual) => word = actual,
            }
        }
    }

    /// Atomically bump the reference count.
    pub fn add_ref(&self) -> i32 {
        self.ref_count.fetch_add(1, Ordering::AcqRel) + 1
    }

    /// Atomically drop the reference count. Returns the new value; the
    /// caller frees the block's storage when this reaches zero.
    pub fn release(&self) -> i32 {
        self.ref_count.fetch_sub(1, Ordering::AcqRel) - 1
    }

    pub fn ref_count(&self) -> i32 {
        self.ref_count.load(Ordering::Acquire)
    }

    /// # Safety
    /// `user_ptr` must point `GEN_BLOCK_HEADER_SIZE` bytes past a valid,
    /// live `GenBlockHeader`.
    pub unsafe fn from_user_ptr<'a>(user_ptr: NonNull<u8>) -> &'a GenBlockHeader {
        let header_ptr = user_ptr.as_ptr().sub(GEN_BLOCK_HEADER_SIZE) as *const GenBlockHeader;
        &*header_ptr
    }
}

/// The user-visible handle returned by `Allocate`.
///
/// `Block` is a plain value type, not an RAII guard: `AddRef`/`Dispose`
/// are the only sanctioned ways to share or release a block, so this
/// type deliberately has no `Drop` impl. Letting a `Block` go out of
/// scope without disposing it is a caller bug (`debug_guards` mode in
/// `gpa.rs` can catch it via its allocation-site map).
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Block {
    /// The user-visible bytes only; the header lives
    /// `GEN_BLOCK_HEADER_SIZE` bytes before `segment`'s resolved address.
    segment: MemorySegment,
}

impl Block {
    pub(crate) fn new(segment: MemorySegment) -> Self {
        Block { segment }
    }

    /// The canonical zero-length block returned for `Allocate(0)`.
    /// Never actually allocated; `Free`/`Dispose` on it is a no-op.
    pub const EMPTY: Block = Block {
        segment: MemorySegment::EMPTY,
    };

    pub fn is_empty(&self) -> bool {
        self.segment.is_empty()
    }

    pub fn len(&self) -> usize {
        self.segment.len()
    }

    pub fn segment(&self) -> MemorySegment {
        self.segment
    }

    /// # Safety
    /// The block must be live (not freed) for the duration of use.
    pub unsafe fn as_slice(&self) -> &[u8] {
        if self.is_empty() {
            return &[];
        }
        self.segment.as_slice()
    }

    /// # Safety
    /// The block must be live and the caller must have exclusive access.
    pub unsafe fn as_mut_slice(&self) -> &mut [u8] {
        if self.is_empty() {
            return &mut [];
        }
        self.segment.as_mut_slice()
    }

    /// # Safety
    /// The block must be live and at least `GEN_BLOCK_HEADER_SIZE` bytes
    /// of header must precede its resolved address.
    pub unsafe fn header(&self) -> Option<&GenBlockHeader> {
        if self.is_empty() {
            return None;
        }
        let user_ptr = self.segment.resolve()?;
        Some(GenBlockHeader::from_user_ptr(user_ptr))
    }

    pub fn ref_count(&self) -> i32 {
        if self.is_empty() {
            return 1;
        }
        unsafe { self.header().map(|h| h.ref_count()).unwrap_or(0) }
    }
}
