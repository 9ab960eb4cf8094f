//! Primitive OS memory mapping: reserve/commit/decommit/protect whole
//! arenas. Same mmap/VirtualAlloc split, page-size probing and stats
//! hooks as a typical hand-rolled allocator's OS layer, wrapped in
//! `Result<NonNull<u8>, Error>` instead of raw nullable pointers so
//! every caller can propagate failure through `?` rather than checking
//! for null.

use std::ptr::NonNull;
use std::sync::OnceLock;

use log::warn;

use crate::error::{Error, Result};
use crate::stats::Stats;

#[cfg(not(windows))]
use libc::{madvise, mmap, mprotect, munmap, MADV_DONTNEED, MAP_ANONYMOUS, MAP_PRIVATE, PROT_NONE, PROT_READ, PROT_WRITE};

#[cfg(windows)]
use winapi::{
    shared::minwindef::LPVOID,
    um::{
        memoryapi::{VirtualAlloc, VirtualFree, VirtualProtect},
        sysinfoapi::{GetSystemInfo, SYSTEM_INFO},
        winnt::{MEM_COMMIT, MEM_DECOMMIT, MEM_RELEASE, MEM_RESERVE, PAGE_NOACCESS, PAGE_READWRITE},
    },
};

fn os_page_size_raw() -> usize {
    #[cfg(windows)]
    {
        unsafe {
            let mut si: SYSTEM_INFO = std::mem::zeroed();
            GetSystemInfo(&mut si);
            si.dwPageSize.max(4096) as usize
        }
    }
    #[cfg(not(windows))]
    {
        let n = unsafe { libc::sysconf(libc::_SC_PAGESIZE) };
        if n > 0 {
            n as usize
        } else {
            4096
        }
    }
}

/// OS (small) page size, probed once and cached.
pub fn os_page_size() -> usize {
    static PAGE_SIZE: OnceLock<usize> = OnceLock::new();
    *PAGE_SIZE.get_or_init(os_page_size_raw)
}

pub fn align_up(size: usize, align: usize) -> usize {
    debug_assert!(align.is_power_of_two());
    (size + align - 1) & !(align - 1)
}

pub fn align_down(size: usize, align: usize) -> usize {
    debug_assert!(align.is_power_of_two());
    size & !(align - 1)
}

fn good_alloc_size(size: usize) -> usize {
    align_up(size, os_page_size())
}

/// Reserve and commit `size` bytes from the OS, aligned to `align`
/// (which must be a power of two, and is rounded up to at least the OS
/// page size). Tries a direct aligned request first, and if the
/// platform handed back a misaligned pointer, over-allocates and trims
/// (unix) or retries (windows).
pub fn os_alloc_aligned(size: usize, align: usize, stats: &Stats) -> Result<NonNull<u8>> {
    if size == 0 {
        return Err(Error::OutOfMemory);
    }
    let size = good_alloc_size(size);
    let align = align_up(align, os_page_size());

    #[cfg(not(windows))]
    {
        os_alloc_aligned_unix(size, align, stats)
    }
    #[cfg(windows)]
    {
        os_alloc_aligned_windows(size, align, stats)
    }
}

#[cfg(not(windows))]
fn raw_mmap(size: usize) -> *mut u8 {
    unsafe {
        let p = mmap(
            std::ptr::null_mut(),
            size,
            PROT_READ | PROT_WRITE,
            MAP_PRIVATE | MAP_ANONYMOUS,
            -1,
            0,
        );
        if p == libc::MAP_FAILED {
            std::ptr::null_mut()
        } else {
            p as *mut u8
        }
    }
}

#[cfg(not(windows))]
fn os_alloc_aligned_unix(size: usize, align: usize, stats: &Stats) -> Result<NonNull<u8>> {
    stats.mmap_calls.increase(1);
    let p = raw_mmap(size);
    if p.is_null() {
        warn!("mmap failed: {}", errno::errno());
        return Err(Error::Os(errno::errno().0));
    }
    if (p as usize) % align == 0 {
        stats.reserved.increase(size as i64);
        stats.committed.increase(size as i64);
        return Ok(unsafe { NonNull::new_unchecked(p) });
    }

    // misaligned: over-allocate and trim the slack on both sides.
    unsafe {
        munmap(p as *mut _, size);
    }
    let over_size = size + align;
    let over = raw_mmap(over_size);
    if over.is_null() {
        warn!("mmap (over-allocate) failed: {}", errno::errno());
        return Err(Error::Os(errno::errno().0));
    }
    let aligned = align_up(over as usize, align) as *mut u8;
    let pre = aligned as usize - over as usize;
    let post = over_size - pre - size;
    unsafe {
        if pre > 0 {
            munmap(over as *mut _, pre);
        }
        if post > 0 {
            munmap(aligned.add(size) as *mut _, post);
        }
    }
    stats.reserved.increase(size as i64);
    stats.committed.increase(size as i64);
    Ok(unsafe { NonNull::new_unchecked(aligned) })
}

#[cfg(windows)]
fn os_alloc_aligned_windows(size: usize, align: usize, stats: &Stats) -> Result<NonNull<u8>> {
    stats.mmap_calls.increase(1);
    // Over-allocate, find an aligned sub-range, free, then commit exactly
    // there. Retried a few times since another thread may race us for
    // the freed range on platforms without VirtualAlloc2.
    for _ in 0..8 {
        let over_size = size + align;
        let probe = unsafe {
            VirtualAlloc(std::ptr::null_mut(), over_size, MEM_RESERVE, PAGE_READWRITE)
        };
        if probe.is_null() {
            continue;
        }
        let aligned = align_up(probe as usize, align);
        unsafe {
            VirtualFree(probe, 0, MEM_RELEASE);
        }
        let p = unsafe {
            VirtualAlloc(
                aligned as LPVOID,
                size,
                MEM_RESERVE | MEM_COMMIT,
                PAGE_READWRITE,
            )
        };
        if !p.is_null() && p as usize == aligned {
            stats.reserved.increase(size as i64);
            stats.committed.increase(size as i64);
            return Ok(unsafe { NonNull::new_unchecked(p as *mut u8) });
        }
        if !p.is_null() {
            unsafe {
                VirtualFree(p, 0, MEM_RELEASE);
            }
        }
    }
    Err(Error::OutOfMemory)
}

/// Release a previously reserved arena back to the OS.
pub fn os_free(addr: NonNull<u8>, size: usize, stats: &Stats) {
    if size == 0 {
        return;
    }
    #[cfg(not(windows))]
    {
        let ok = unsafe { munmap(addr.as_ptr() as *mut _, size) } == 0;
        if !ok {
            warn!("munmap failed: {}, addr {:p}, size {}", errno::errno(), addr.as_ptr(), size);
        }
    }
    #[cfg(windows)]
    {
        let ok = unsafe { VirtualFree(addr.as_ptr() as LPVOID, 0, MEM_RELEASE) } != 0;
        if !ok {
            warn!("VirtualFree failed, addr {:p}, size {}", addr.as_ptr(), size);
        }
    }
    stats.committed.decrease(size as i64);
    stats.reserved.decrease(size as i64);
}

/// Signal to the OS that `[addr, addr+size)` is no longer needed but
/// may be touched again later (decommit-equivalent reset). Used when an
/// arena is cached rather than freed outright.
pub fn os_reset(addr: NonNull<u8>, size: usize) -> bool {
    if size == 0 {
        return true;
    }
    #[cfg(not(windows))]
    {
        let err = unsafe { madvise(addr.as_ptr() as *mut _, size, MADV_DONTNEED) };
        if err != 0 {
            warn!("madvise(MADV_DONTNEED) failed: {}", errno::errno());
        }
        err == 0
    }
    #[cfg(windows)]
    {
        // Windows has no direct MADV_DONTNEED equivalent that keeps the
        // mapping usable without re-commit; decommit-then-recommit is
        // the safe analogue.
        let decommitted = unsafe { VirtualFree(addr.as_ptr() as LPVOID, size, MEM_DECOMMIT) } != 0;
        if decommitted {
            let p = unsafe {
                VirtualAlloc(addr.as_ptr() as LPVOID, size, MEM_COMMIT, PAGE_READWRITE)
            };
            !p.is_null()
        } else {
            false
        }
    }
}

/// Make `[addr, addr+size)` inaccessible (debug guard pages).
pub fn os_protect(addr: NonNull<u8>, size: usize) -> bool {
    os_protectx(addr, size, true)
}

/// Undo `os_protect`.
pub fn os_unprotect(addr: NonNull<u8>, size: usize) -> bool {
    os_protectx(addr, size, false)
}

fn os_protectx(addr: NonNull<u8>, size: usize, protect: bool) -> bool {
    #[cfg(not(windows))]
    {
        let prot = if protect { PROT_NONE } else { PROT_READ | PROT_WRITE };
        let err = unsafe { mprotect(addr.as_ptr() as *mut _, size, prot) };
        if err != 0 {
            warn!("mprotect failed: {}", errno::errno());
        }
        err == 0
    }
    #[cfg(windows)]
    {
        let mut old = 0u32;
        let prot = if protect { PAGE_NOACCESS } else { PAGE_READWRITE };
        let ok = unsafe { VirtualProtect(addr.as_ptr() as LPVOID, size, prot, &mut old) } != 0;
        if !ok {
            warn!("VirtualProtect failed, addr {:p}, size {}", addr.as_ptr(), size);
        }
        ok
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn align_helpers() {
        assert_eq!(align_up(1, 16), 16);
        assert_eq!(align_up(16, 16), 16);
        assert_eq!(align_up(17, 16), 32);
        assert_eq!(align_down(31, 16), 16);
    }

    #[test]
    fn alloc_and_free_roundtrip() {
        let stats = Stats::default();
        let size = os_page_size() * 4;
        let p = os_alloc_aligned(size, os_page_size(), &stats).expect("alloc");
        assert_eq!(p.as_ptr() as usize % os_page_size(), 0);
        unsafe {
            std::ptr::write_bytes(p.as_ptr(), 0xAB, size);
            assert_eq!(*p.as_ptr(), 0xAB);
        }
        os_free(p, size, &stats);
    }
}
