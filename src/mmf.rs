//! Memory-mapped-file-backed allocator: the same external contract as
//! `GeneralAllocator` (`allocate`/`free`/`resize`/`add_ref`/`dispose`),
//! sitting on a page-granular directory inside a shared file instead of
//! process-local arenas, so blocks survive and are shareable across
//! process boundaries.
//!
//! **File layout** (bytes, little-endian):
//! ```text
//! [0 .. 32)                  RootHeader (8 packed i32 fields)
//! [32 .. 40)                 magic + version (corruption check)
//! [40 .. 512)                reserved; holds the directory's
//!                             structural ExclusiveAccessControl at a
//!                             fixed offset, zero elsewhere
//! [512 .. 512+bf_size)       page occupancy bitfield (u64 words)
//! [… .. … + dir_size)        page directory (u32 per page,
//!                             {run_length:u16, ref_count:i16})
//! [offset_user_data .. EOF)  user pages
//! ```
//! Page 0 (the first page of `offset_user_data`) is always reserved for
//! the directory's own bookkeeping and is marked occupied at creation,
//! matching §4.9 "Create" in the allocator's governing design note.
//!
//! The occupancy bitfield reuses the same exact-max-free-run scan as
//! `ConcurrentBitmap` (`bitmap.rs`), just without that type's L1..L3
//! aggregation tree: the directory only ever describes a flat
//! bit-per-page field, so a linear word scan is what the format
//! actually specifies, and MMF page counts are small enough (mapped
//! files sized in pages, not in individual allocation units) that a
//! hierarchical index isn't needed to keep the scan cheap.

use std::fs::{File, OpenOptions};
use std::path::Path;
use std::ptr::NonNull;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;

use memmap2::MmapMut;

use crate::block::{Block, GenBlockHeader, GEN_BLOCK_HEADER_SIZE};
use crate::bitmap::{find_free_run, max_free_run, run_mask};
use crate::error::{Error, Result};
use crate::lock::{thread_lock_id, ExclusiveAccessControl};
use crate::process::ProcessLivenessProvider;
use crate::referential::{register_mmf_owner, unregister_mmf_owner, BlockOwner};
use crate::segment::{register_mmf_base, unregister_mmf_base, MemorySegment, MmfId};
use crate::stats::Stats;

const ROOT_HEADER_SIZE: usize = 32;
const MAGIC_OFFSET: usize = 32;
const LOCK_OFFSET: usize = 40;
const RESERVED_END: usize = 512;
const MAGIC: u32 = 0x544F_4D41; // "TOMA"
const FORMAT_VERSION: u32 = 1;

const LOCK_WAITERS: usize = 8;

/// Assigns a process-local small integer to each mapped file so the
/// segment/owner tables (shared with `segment.rs` / `referential.rs`)
/// can resolve a cross-process `MemorySegment` back to its mapping.
fn next_mmf_id() -> MmfId {
    use std::sync::atomic::AtomicU32 as Counter;
    static NEXT: Counter = Counter::new(0);
    NEXT.fetch_add(1, Ordering::Relaxed)
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
struct RootHeader {
    page_size: u32,
    page_capacity: u32,
    offset_page_bitfield: u32,
    page_bitfield_size: u32,
    offset_page_directory: u32,
    page_directory_size: u32,
    offset_user_data: u32,
    user_data_size: u32,
}

impl RootHeader {
    fn read(bytes: &[u8]) -> Self {
        let f = |off: usize| u32::from_le_bytes(bytes[off..off + 4].try_into().unwrap());
        RootHeader {
            page_size: f(0),
            page_capacity: f(4),
            offset_page_bitfield: f(8),
            page_bitfield_size: f(12),
            offset_page_directory: f(16),
            page_directory_size: f(20),
            offset_user_data: f(24),
            user_data_size: f(28),
        }
    }

    fn write(&self, bytes: &mut [u8]) {
        let mut put = |off: usize, v: u32| bytes[off..off + 4].copy_from_slice(&v.to_le_bytes());
        put(0, self.page_size);
        put(4, self.page_capacity);
        put(8, self.offset_page_bitfield);
        put(12, self.page_bitfield_size);
        put(16, self.offset_page_directory);
        put(20, self.page_directory_size);
        put(24, self.offset_user_data);
        put(28, self.user_data_size);
    }
}

/// A memory-mapped-file-backed, page-granular allocator with
/// cross-process reference counting via the file's own page directory.
pub struct MmfAllocator {
    // Kept only to hold the mapping open; every access goes through
    // `base` directly so concurrent readers/writers never contend on a
    // lock that has nothing to do with the file's own structural lock.
    _mmap: MmapMut,
    base: NonNull<u8>,
    _file: File,
    mmf_id: MmfId,
    header: RootHeader,
    liveness: Arc<dyn ProcessLivenessProvider>,
    spin_budget: u32,
    stats: Arc<Stats>,
    disposed: std::sync::atomic::AtomicBool,
}

// SAFETY: all mutable state lives in the mapped bytes, accessed only
// through atomics and the structural lock embedded in the mapping
// itself; `base` aliases `_mmap`'s storage but is never invalidated
// before `_mmap` is dropped, since both live exactly as long as `self`.
unsafe impl Send for MmfAllocator {}
unsafe impl Sync for MmfAllocator {}

impl MmfAllocator {
    fn layout_for(capacity_bytes: u64, page_size: u32) -> (u32, usize, usize, usize, usize, usize) {
        let page_size = page_size as usize;
        let page_capacity = (capacity_bytes as usize / page_size).max(1) as u32;
        let bf_words = (page_capacity as usize).div_ceil(64);
        let bf_size = bf_words * 8;
        let offset_page_bitfield = RESERVED_END;
        let offset_page_directory = offset_page_bitfield + bf_size;
        let dir_size = page_capacity as usize * 4;
        let offset_user_data = crate::os::align_up(offset_page_directory + dir_size, page_size);
        let user_data_size = page_capacity as usize * page_size;
        (page_capacity, bf_size, offset_page_directory, dir_size, offset_user_data, user_data_size)
    }

    /// Create a new MMF-backed allocator at `path`. If the file already
    /// exists and was already initialized, this behaves like `open` but
    /// fails with `Error::Corrupted` if `capacity_bytes`/`page_size`
    /// don't match what's on disk — "fails if another process already
    /// created with different parameters" (spec for `Create`).
    pub fn create(
        path: &Path,
        capacity_bytes: u64,
        page_size: u32,
        liveness: Arc<dyn ProcessLivenessProvider>,
        spin_budget: u32,
        stats: Arc<Stats>,
    ) -> Result<Arc<Self>> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .open(path)
            .map_err(|e| Error::Os(e.raw_os_error().unwrap_or(-1)))?;

        let existing_len = file.metadata().map(|m| m.len()).unwrap_or(0);
        let already_initialized = existing_len >= ROOT_HEADER_SIZE as u64;

        if already_initialized {
            let mut probe = vec![0u8; ROOT_HEADER_SIZE];
            use std::io::Read;
            let mut f2 = file.try_clone().map_err(|e| Error::Os(e.raw_os_error().unwrap_or(-1)))?;
            f2.read_exact(&mut probe).ok();
            let header = RootHeader::read(&probe);
            if header.page_size != 0 {
                let (page_capacity, ..) = Self::layout_for(capacity_bytes, page_size);
                if header.page_size != page_size || header.page_capacity != page_capacity {
                    return Err(Error::Corrupted);
                }
                return Self::open(path, liveness, spin_budget, stats);
            }
        }

        let (page_capacity, bf_size, offset_page_directory, dir_size, offset_user_data, user_data_size) =
            Self::layout_for(capacity_bytes, page_size);
        let total_len = (offset_user_data + user_data_size) as u64;
        file.set_len(total_len).map_err(|e| Error::Os(e.raw_os_error().unwrap_or(-1)))?;

        let mut mmap = unsafe { MmapMut::map_mut(&file) }.map_err(|e| Error::Os(e.raw_os_error().unwrap_or(-1)))?;

        let header = RootHeader {
            page_size,
            page_capacity,
            offset_page_bitfield: RESERVED_END as u32,
            page_bitfield_size: bf_size as u32,
            offset_page_directory: offset_page_directory as u32,
            page_directory_size: dir_size as u32,
            offset_user_data: offset_user_data as u32,
            user_data_size: user_data_size as u32,
        };
        header.write(&mut mmap[0..ROOT_HEADER_SIZE]);
        mmap[MAGIC_OFFSET..MAGIC_OFFSET + 4].copy_from_slice(&MAGIC.to_le_bytes());
        mmap[MAGIC_OFFSET + 4..MAGIC_OFFSET + 8].copy_from_slice(&FORMAT_VERSION.to_le_bytes());
        // bitfield/directory/lock region are already zero from `set_len`.

        let base = NonNull::new(mmap.as_mut_ptr()).expect("mmap base is never null");

        let allocator = MmfAllocator {
            _mmap: mmap,
            base,
            _file: file,
            mmf_id: next_mmf_id(),
            header,
            liveness,
            spin_budget,
            stats,
            disposed: std::sync::atomic::AtomicBool::new(false),
        };

        // Reserve page 0 (directory bookkeeping) and any unreachable
        // tail bits past `page_capacity` in the last bitfield word.
        allocator.reserve_bit(0);
        if page_capacity % 64 != 0 {
            let word_count = (page_capacity as usize).div_ceil(64);
            let tail_bits = page_capacity % 64;
            for bit in tail_bits..64 {
                allocator.reserve_bit((word_count - 1) * 64 + bit as usize);
            }
        }

        Self::register(allocator)
    }

    /// Open an already-created MMF-backed allocator.
    pub fn open(
        path: &Path,
        liveness: Arc<dyn ProcessLivenessProvider>,
        spin_budget: u32,
        stats: Arc<Stats>,
    ) -> Result<Arc<Self>> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .open(path)
            .map_err(|e| Error::Os(e.raw_os_error().unwrap_or(-1)))?;

        let mut mmap = unsafe { MmapMut::map_mut(&file) }.map_err(|e| Error::Os(e.raw_os_error().unwrap_or(-1)))?;
        if mmap.len() < RESERVED_END {
            return Err(Error::Corrupted);
        }
        let header = RootHeader::read(&mmap[0..ROOT_HEADER_SIZE]);
        if header.page_size == 0 {
            // Per spec: an uninitialized file must be created, not opened.
            return Err(Error::Corrupted);
        }
        let magic = u32::from_le_bytes(mmap[MAGIC_OFFSET..MAGIC_OFFSET + 4].try_into().unwrap());
        let version = u32::from_le_bytes(mmap[MAGIC_OFFSET + 4..MAGIC_OFFSET + 8].try_into().unwrap());
        if magic != MAGIC || version != FORMAT_VERSION {
            return Err(Error::Corrupted);
        }

        let base = NonNull::new(mmap.as_mut_ptr()).expect("mmap base is never null");
        let allocator = MmfAllocator {
            _mmap: mmap,
            base,
            _file: file,
            mmf_id: next_mmf_id(),
            header,
            liveness,
            spin_budget,
            stats,
            disposed: std::sync::atomic::AtomicBool::new(false),
        };
        Self::register(allocator)
    }

    fn register(allocator: MmfAllocator) -> Result<Arc<Self>> {
        let base = allocator.base;
        let id = allocator.mmf_id;
        let arc = Arc::new(allocator);
        register_mmf_base(id, base);
        register_mmf_owner(id, arc.clone() as Arc<dyn BlockOwner>);
        Ok(arc)
    }

    pub fn mmf_id(&self) -> MmfId {
        self.mmf_id
    }

    pub fn page_size(&self) -> usize {
        self.header.page_size as usize
    }

    pub fn page_capacity(&self) -> usize {
        self.header.page_capacity as usize
    }

    fn base_ptr(&self) -> *mut u8 {
        self.base.as_ptr()
    }

    fn lock(&self) -> &ExclusiveAccessControl<LOCK_WAITERS> {
        unsafe { ExclusiveAccessControl::at(self.base_ptr().add(LOCK_OFFSET)) }
    }

    fn bitfield_word(&self, idx: usize) -> &AtomicU64 {
        let off = self.header.offset_page_bitfield as usize + idx * 8;
        unsafe { &*(self.base_ptr().add(off) as *const AtomicU64) }
    }

    fn directory_slot(&self, page_index: usize) -> &AtomicU32 {
        let off = self.header.offset_page_directory as usize + page_index * 4;
        unsafe { &*(self.base_ptr().add(off) as *const AtomicU32) }
    }

    fn segment_for(&self, page_index: usize, page_count: usize) -> MemorySegment {
        let off = self.header.offset_user_data as usize + page_index * self.page_size();
        MemorySegment::mmf(self.mmf_id, off, page_count * self.page_size())
    }

    fn page_range_of(&self, segment: MemorySegment) -> Option<(usize, usize)> {
        if segment.mmf_id() != Some(self.mmf_id) {
            return None;
        }
        let rel = segment.raw_offset().checked_sub(self.header.offset_user_data as usize)?;
        let page_size = self.page_size();
        if rel % page_size != 0 || segment.len() % page_size != 0 {
            return None;
        }
        let index = rel / page_size;
        let count = segment.len() / page_size;
        if count == 0 || index + count > self.page_capacity() {
            return None;
        }
        Some((index, count))
    }

    fn reserve_bit(&self, bit: usize) {
        let word_idx = bit / 64;
        let off = bit % 64;
        let word = self.bitfield_word(word_idx);
        word.fetch_or(1u64 << off, Ordering::AcqRel);
    }

    fn word_count(&self) -> usize {
        self.page_capacity().div_ceil(64)
    }

    fn check_disposed(&self) -> Result<()> {
        if self.disposed.load(Ordering::Acquire) {
            Err(Error::Disposed)
        } else {
            Ok(())
        }
    }

    /// Allocate `n` (1..=64) contiguous pages. Low-level contract (§6.2):
    /// returns a raw `MemorySegment`, not a `Block`; the directory
    /// slot's `ref_count` starts at 1 and is the sole source of truth
    /// for this range's lifetime across every process with the file
    /// mapped.
    pub fn allocate_pages(&self, n: u32) -> Result<MemorySegment> {
        self.check_disposed()?;
        if n == 0 || n > 64 {
            return Ok(MemorySegment::EMPTY);
        }
        let words = self.word_count();
        loop {
            let mut found = None;
            'scan: for word_idx in 0..words {
                let word = self.bitfield_word(word_idx).load(Ordering::Acquire);
                if (max_free_run(word) as u32) < n {
                    continue;
                }
                if let Some(start) = find_free_run(word, n) {
                    found = Some((word_idx, start));
                    break 'scan;
                }
            }
            let Some((word_idx, start)) = found else {
                return Err(Error::OutOfMemory);
            };

            let lock_id = thread_lock_id();
            let pid = std::process::id() as i32;
            if self.lock().try_enter(lock_id, pid, None, &*self.liveness, self.spin_budget) != Ok(true) {
                continue;
            }

            let word = self.bitfield_word(word_idx).load(Ordering::Acquire);
            let result = find_free_run(word, n).filter(|&s| s == start).map(|_| {
                let mask = run_mask(start, n);
                self.bitfield_word(word_idx).fetch_or(mask, Ordering::AcqRel);
                let page_index = word_idx * 64 + start as usize;
                let slot = pack_directory(n as u16, 1);
                self.directory_slot(page_index).store(slot, Ordering::Release);
                page_index
            });
            let _ = self.lock().exit(lock_id);

            if let Some(page_index) = result {
                self.stats.mmf_pages.increase(n as i64);
                return Ok(self.segment_for(page_index, n as usize));
            }
            // Lost the race for this exact word/run; retry the scan.
        }
    }

    /// Release a page range previously returned by `allocate_pages`, or
    /// decrement its directory ref count if other `add_ref_pages` calls
    /// are outstanding.
    pub fn free_pages(&self, segment: MemorySegment) -> Result<bool> {
        self.check_disposed()?;
        if segment.is_empty() {
            return Ok(false);
        }
        let Some((index, _count)) = self.page_range_of(segment) else {
            return Ok(false);
        };
        let slot = self.directory_slot(index);
        let mut word = slot.load(Ordering::Acquire);
        loop {
            let (run_length, ref_count) = unpack_directory(word);
            if ref_count <= 0 {
                return Ok(false);
            }
            let new_count = ref_count - 1;
            let new_word = pack_directory(run_length, new_count);
            match slot.compare_exchange_weak(word, new_word, Ordering::AcqRel, Ordering::Acquire) {
                Ok(_) => {
                    if new_count > 0 {
                        return Ok(false);
                    }
                    break;
                }
                Err(actual) => word = actual,
            }
        }

        let (run_length, _) = unpack_directory(word);
        let lock_id = thread_lock_id();
        let pid = std::process::id() as i32;
        while self.lock().try_enter(lock_id, pid, None, &*self.liveness, self.spin_budget) != Ok(true) {}
        let word_idx = index / 64;
        let bit_off = index % 64;
        let mask = run_mask(bit_off as u32, run_length as u32);
        self.bitfield_word(word_idx).fetch_and(!mask, Ordering::AcqRel);
        slot.store(0, Ordering::Release);
        let _ = self.lock().exit(lock_id);

        self.stats.mmf_pages.decrease(run_length as i64);
        Ok(true)
    }

    /// Atomically bump a page range's directory ref count. Any process
    /// with this file mapped may call this on a range it learned about
    /// out of band (e.g. via `ToBlockId`/`FromBlockId`).
    pub fn add_ref_pages(&self, segment: MemorySegment) -> Result<i16> {
        self.check_disposed()?;
        let Some((index, _count)) = self.page_range_of(segment) else {
            return Err(Error::UnknownBlock);
        };
        let slot = self.directory_slot(index);
        let mut word = slot.load(Ordering::Acquire);
        loop {
            let (run_length, ref_count) = unpack_directory(word);
            let new_word = pack_directory(run_length, ref_count + 1);
            match slot.compare_exchange_weak(word, new_word, Ordering::AcqRel, Ordering::Acquire) {
                Ok(_) => return Ok(ref_count + 1),
                Err(actual) => word = actual,
            }
        }
    }

    pub fn to_block_id(&self, segment: MemorySegment) -> i32 {
        match self.page_range_of(segment) {
            Some((index, count)) if index <= u16::MAX as usize && count <= u16::MAX as usize => {
                ((index as u32) | ((count as u32) << 16)) as i32
            }
            _ => -1,
        }
    }

    pub fn from_block_id(&self, id: i32) -> MemorySegment {
        if id < 0 {
            return MemorySegment::EMPTY;
        }
        let word = id as u32;
        let page_index = (word & 0xFFFF) as usize;
        let page_count = (word >> 16) as usize;
        if page_count == 0 || page_index + page_count > self.page_capacity() {
            return MemorySegment::EMPTY;
        }
        self.segment_for(page_index, page_count)
    }

    /// High-level contract (§6.1), mirroring `GeneralAllocator`: carves
    /// enough whole pages to fit `size` bytes plus a `GenBlockHeader`,
    /// stamps the header at the start of the first page, and returns a
    /// `Block` whose user bytes start right after it.
    pub fn allocate(&self, size: usize) -> Result<Block> {
        self.check_disposed()?;
        if size == 0 {
            return Ok(Block::EMPTY);
        }
        let page_size = self.page_size();
        let needed = size + GEN_BLOCK_HEADER_SIZE;
        let n_pages = needed.div_ceil(page_size);
        if n_pages == 0 || n_pages > 64 {
            return Err(Error::CapacityTooBig {
                requested: size,
                capacity: 64 * page_size - GEN_BLOCK_HEADER_SIZE,
            });
        }
        let segment = self.allocate_pages(n_pages as u32)?;
        let base = segment.resolve().ok_or(Error::OutOfMemory)?;
        let payload = segment.len() - GEN_BLOCK_HEADER_SIZE;

        let header = unsafe { &*(base.as_ptr() as *const GenBlockHeader) };
        header.ref_count.store(1, Ordering::Release);
        header
            .flags_and_index
            .store(crate::block::pack_flags(0, true, false), Ordering::Release);
        header.extra.store(payload as u32, Ordering::Release);

        let user_segment = MemorySegment::mmf(self.mmf_id, segment.raw_offset() + GEN_BLOCK_HEADER_SIZE, payload);
        Ok(Block::new(user_segment))
    }

    pub fn add_ref(&self, block: Block) -> i32 {
        if block.is_empty() {
            return 1;
        }
        unsafe { block.header() }.map(|h| h.add_ref()).unwrap_or(1)
    }

    /// Allocates a new (possibly larger) block, copies the overlap,
    /// frees the old one. No in-place page extension, matching §4.9.
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

    pub fn free(&self, block: Block) -> Result<bool> {
        self.check_disposed()?;
        BlockOwner::free_block(self, block)
    }

    /// Disable further `allocate`/`free`/`resize` calls. Does not unmap
    /// the file; other processes (or other `Arc<MmfAllocator>` handles
    /// in this one) may still be live against it.
    pub fn dispose(&self) {
        self.disposed.store(true, Ordering::Release);
    }

    /// Recompute the bitfield's set-bit count from scratch and compare
    /// it against the sum of directory run-lengths for occupied slots.
    #[cfg(debug_assertions)]
    pub fn debug_validate(&self) -> std::result::Result<(), String> {
        let mut bits_set = 0u64;
        for i in 0..self.word_count() {
            bits_set += self.bitfield_word(i).load(Ordering::Acquire).count_ones() as u64;
        }
        let mut dir_pages = 0u64;
        for idx in 0..self.page_capacity() {
            let (run_length, ref_count) = unpack_directory(self.directory_slot(idx).load(Ordering::Acquire));
            if ref_count > 0 {
                dir_pages += run_length as u64;
            }
        }
        // Bits reserved by page 0 and the capacity-rounding tail aren't
        // reflected in the directory (they have no owning allocation).
        let reserved = 1 + if self.page_capacity() % 64 != 0 { 64 - self.page_capacity() % 64 } else { 0 };
        if bits_set != dir_pages + reserved as u64 {
            return Err(format!(
                "bitfield has {bits_set} set bits, directory accounts for {dir_pages} + {reserved} reserved"
            ));
        }
        Ok(())
    }
}

impl BlockOwner for MmfAllocator {
    fn free_block(&self, block: Block) -> Result<bool> {
        if block.is_empty() {
            return Ok(false);
        }
        let header = unsafe { block.header() }.ok_or(Error::UnknownBlock)?;
        if header.release() > 0 {
            return Ok(false);
        }
        let payload = header.extra.load(Ordering::Acquire) as usize;
        let full_offset = block.segment().raw_offset() - GEN_BLOCK_HEADER_SIZE;
        let full_len = payload + GEN_BLOCK_HEADER_SIZE;
        let full_segment = MemorySegment::mmf(self.mmf_id, full_offset, full_len);
        self.free_pages(full_segment)
    }
}

impl Drop for MmfAllocator {
    fn drop(&mut self) {
        unregister_mmf_base(self.mmf_id);
        unregister_mmf_owner(self.mmf_id);
    }
}

fn pack_directory(run_length: u16, ref_count: i16) -> u32 {
    (run_length as u32) | ((ref_count as u16 as u32) << 16)
}

fn unpack_directory(word: u32) -> (u16, i16) {
    ((word & 0xFFFF) as u16, (word >> 16) as u16 as i16)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::process::DefaultProcessProvider;
    use tempfile::NamedTempFile;

    fn new_file() -> Arc<MmfAllocator> {
        let tmp = NamedTempFile::new().unwrap();
        let path = tmp.path().to_path_buf();
        std::mem::forget(tmp); // keep the backing file around for the test
        MmfAllocator::create(&path, 16 * 1024 * 1024, 4096, Arc::new(DefaultProcessProvider), 64, Arc::new(Stats::default())).unwrap()
    }

    #[test]
    fn page_0_is_reserved_at_creation() {
        let mmf = new_file();
        let seg = mmf.segment_for(0, 1);
        assert!(!mmf.free_pages(seg).unwrap());
    }

    #[test]
    fn allocate_pages_then_free_clears_directory_and_bitfield() {
        let mmf = new_file();
        let seg = mmf.allocate_pages(10).unwrap();
        assert_eq!(seg.len(), 10 * mmf.page_size());
        assert!(mmf.free_pages(seg).unwrap());
        mmf.debug_validate().unwrap();
    }

    #[test]
    fn add_ref_requires_extra_free() {
        let mmf = new_file();
        let seg = mmf.allocate_pages(2).unwrap();
        mmf.add_ref_pages(seg).unwrap();
        assert!(!mmf.free_pages(seg).unwrap());
        assert!(mmf.free_pages(seg).unwrap());
    }

    #[test]
    fn block_id_round_trips() {
        let mmf = new_file();
        let seg = mmf.allocate_pages(3).unwrap();
        let id = mmf.to_block_id(seg);
        assert!(id >= 0);
        assert_eq!(mmf.from_block_id(id), seg);
        mmf.free_pages(seg).unwrap();
    }

    #[test]
    fn block_allocate_and_free_roundtrip() {
        let mmf = new_file();
        let mut block = mmf.allocate(128).unwrap();
        assert!(block.len() >= 128);
        unsafe {
            block.as_mut_slice()[..5].copy_from_slice(b"hello");
        }
        assert_eq!(mmf.free(block), Ok(true));
    }

    #[test]
    fn cross_handle_open_sees_same_pages() {
        let tmp = NamedTempFile::new().unwrap();
        let path = tmp.path().to_path_buf();
        std::mem::forget(tmp);
        let writer = MmfAllocator::create(&path, 4 * 1024 * 1024, 65536, Arc::new(DefaultProcessProvider), 64, Arc::new(Stats::default())).unwrap();
        // `to_block_id`/`from_block_id` are the page-granular contract
        // (§6.2); they operate on whatever `allocate_pages` returned, not
        // on a `Block`'s user-visible (header-offset, non-page-aligned)
        // segment from the higher-level `allocate` (§6.1).
        let segment = writer.allocate_pages(1).unwrap();
        unsafe {
            segment.as_mut_slice()[..11].copy_from_slice(b"hello world");
        }
        let id = writer.to_block_id(segment);

        let reader = MmfAllocator::open(&path, Arc::new(DefaultProcessProvider), 64, Arc::new(Stats::default())).unwrap();
        let seg = reader.from_block_id(id);
        assert_eq!(unsafe { &seg.as_slice()[..11] }, b"hello world");
        reader.add_ref_pages(seg).unwrap();

        // `reader`'s `add_ref_pages` bumped the shared directory slot to
        // 2, so the first free only drops it to 1.
        assert!(!writer.free_pages(segment).unwrap());
        assert!(reader.free_pages(seg).unwrap());
    }
}
