//! Thin wrapper over the platform's virtual memory primitives: reserve,
//! commit, decommit, reset, and protect. Everything above this layer
//! (`meta`, `arena`) goes through `os_alloc`/`os_free`; nothing else in
//! the crate calls `mmap`/`VirtualAlloc` directly.

#[cfg(not(windows))]
use libc::{madvise, mprotect, mmap, munmap, MAP_ANONYMOUS, MAP_FAILED, MAP_PRIVATE, MADV_DONTNEED, PROT_NONE, PROT_READ, PROT_WRITE};
#[cfg(windows)]
use winapi::{
    shared::minwindef::DWORD,
    um::{
        memoryapi::{VirtualAlloc, VirtualFree, VirtualProtect},
        sysinfoapi::{GetSystemInfo, SYSTEM_INFO},
        winnt::{MEM_COMMIT, MEM_DECOMMIT, MEM_RELEASE, MEM_RESERVE, MEM_RESET, PAGE_NOACCESS, PAGE_READWRITE},
    },
};

use core::ptr::null_mut;
use core::sync::atomic::{AtomicUsize, Ordering};

use log::warn;

use crate::memid::Memid;
use crate::stats::{stat_decrease, stat_increase, Stats};

static OS_PAGE_SIZE: AtomicUsize = AtomicUsize::new(4096);
static OS_ALLOC_GRANULARITY: AtomicUsize = AtomicUsize::new(4096);

pub fn os_page_size() -> usize {
    OS_PAGE_SIZE.load(Ordering::Relaxed)
}

fn os_alloc_granularity() -> usize {
    OS_ALLOC_GRANULARITY.load(Ordering::Relaxed)
}

/// Query the platform page size once at process start (see `init::process_init`).
pub fn os_init() {
    #[cfg(windows)]
    {
        unsafe {
            let mut si: SYSTEM_INFO = core::mem::zeroed();
            GetSystemInfo(&mut si);
            if si.dwPageSize > 0 {
                OS_PAGE_SIZE.store(si.dwPageSize as usize, Ordering::Relaxed);
            }
            if si.dwAllocationGranularity > 0 {
                OS_ALLOC_GRANULARITY.store(si.dwAllocationGranularity as usize, Ordering::Relaxed);
            }
        }
    }
    #[cfg(not(windows))]
    {
        let result = unsafe { libc::sysconf(libc::_SC_PAGESIZE) };
        if result > 0 {
            OS_PAGE_SIZE.store(result as usize, Ordering::Relaxed);
            OS_ALLOC_GRANULARITY.store(result as usize, Ordering::Relaxed);
        }
    }
}

/// A non-zero, process-unique-enough identifier for the calling thread,
/// used as the sentinel in `Page::owner` (`0` means "unowned") and to
/// decide whether a free is local or cross-thread.
#[cfg(not(windows))]
pub fn thread_id() -> usize {
    unsafe { libc::pthread_self() as usize }
}

#[cfg(windows)]
pub fn thread_id() -> usize {
    use winapi::um::processthreadsapi::GetCurrentThreadId;
    unsafe { GetCurrentThreadId() as usize }
}

fn align_up(size: usize, align: usize) -> usize {
    if align == 0 {
        return size;
    }
    let mask = align - 1;
    size.wrapping_add(mask) & !mask
}

fn align_down(size: usize, align: usize) -> usize {
    if align == 0 {
        return size;
    }
    size & !(align - 1)
}

fn align_up_ptr(ptr: *mut u8, align: usize) -> *mut u8 {
    align_up(ptr as usize, align) as *mut u8
}

fn os_good_alloc_size(size: usize) -> usize {
    if size >= usize::max_value() - os_alloc_granularity() {
        return size;
    }
    align_up(size, os_alloc_granularity())
}

#[cfg(not(windows))]
fn unix_mmap(size: usize, protect_flags: i32) -> *mut u8 {
    let flags = MAP_PRIVATE | MAP_ANONYMOUS;
    let p = unsafe { mmap(null_mut(), size, protect_flags, flags, -1, 0) };
    if p == MAP_FAILED {
        null_mut()
    } else {
        p as *mut u8
    }
}

#[cfg(windows)]
fn win_alloc(size: usize, flags: DWORD) -> *mut u8 {
    unsafe { VirtualAlloc(null_mut(), size, flags, PAGE_READWRITE) as *mut u8 }
}

fn os_mem_alloc(size: usize, commit: bool, stats: &Stats) -> *mut u8 {
    debug_assert!(size > 0 && size % os_page_size() == 0);
    if size == 0 {
        return null_mut();
    }
    let p;
    #[cfg(windows)]
    {
        let mut flags = MEM_RESERVE;
        if commit {
            flags |= MEM_COMMIT;
        }
        p = win_alloc(size, flags);
    }
    #[cfg(not(windows))]
    {
        let protect_flags = if commit { PROT_WRITE | PROT_READ } else { PROT_NONE };
        p = unix_mmap(size, protect_flags);
    }
    stat_increase(&stats.mmap_calls, 1);
    if !p.is_null() {
        stat_increase(&stats.reserved, size as i64);
        if commit {
            stat_increase(&stats.committed, size as i64);
        }
    }
    p
}

fn os_mem_free(p: *mut u8, size: usize, stats: &Stats) -> bool {
    if p.is_null() || size == 0 {
        return true;
    }
    let ok;
    #[cfg(windows)]
    {
        ok = unsafe { VirtualFree(p as *mut _, 0, MEM_RELEASE) } != 0;
    }
    #[cfg(not(windows))]
    {
        ok = unsafe { munmap(p as *mut _, size) } == 0;
    }
    stat_decrease(&stats.committed, size as i64);
    stat_decrease(&stats.reserved, size as i64);
    if !ok {
        warn!(
            "munmap/VirtualFree failed: {}, addr {:p}, size {}",
            errno::errno(),
            p,
            size
        );
    }
    ok
}

/// Reserve (and optionally commit) `size` bytes, rounded up to the
/// allocation granularity, directly from the OS. Returns the pointer
/// plus a `Memid` describing whether it arrived pre-zeroed/committed.
pub fn os_alloc(size: usize, stats: &Stats) -> Option<(*mut u8, Memid)> {
    if size == 0 {
        return None;
    }
    let size = os_good_alloc_size(size);
    let p = os_mem_alloc(size, true, stats);
    if p.is_null() {
        None
    } else {
        // Fresh mmap/VirtualAlloc pages always read as zero.
        Some((p, Memid::for_os(true, true)))
    }
}

/// Free a region obtained from `os_alloc` (any `Memid::for_os`/`for_meta`
/// allocation; `memid` is accepted for symmetry with `arena::free` even
/// though the OS layer only ever frees whole mmap/VirtualAlloc regions).
pub fn os_free(p: *mut u8, size: usize, memid: Memid, stats: &Stats) {
    let _ = memid;
    os_mem_free(p, size, stats);
}

/// Reserve `size` bytes aligned to `align` (a power of two, at least the
/// page size). Used by the arena layer when carving out a fresh arena:
/// slices must land on predictable boundaries for the bitmap math to
/// stay simple.
pub fn os_alloc_aligned(size: usize, align: usize, stats: &Stats) -> Option<(*mut u8, Memid)> {
    debug_assert!(align >= os_page_size() && (align & (align - 1)) == 0);
    if size == 0 {
        return None;
    }
    let size = align_up(os_good_alloc_size(size), os_page_size());
    let align = align_up(align, os_page_size());

    let p = os_mem_alloc(size, true, stats);
    if p.is_null() {
        return None;
    }
    if (p as usize) % align == 0 {
        return Some((p, Memid::for_os(true, true)));
    }

    // Not aligned: release it and over-allocate, then trim the excess on
    // either side (unix) or retry at a computed address (Windows, which
    // cannot partially free a VirtualAlloc region).
    os_mem_free(p, size, stats);
    if size >= usize::max_value() - align {
        return None;
    }
    let over_size = size + align;

    #[cfg(not(windows))]
    {
        let p = os_mem_alloc(over_size, true, stats);
        if p.is_null() {
            return None;
        }
        let aligned = align_up_ptr(p, align);
        let pre_size = aligned as usize - p as usize;
        let mid_size = align_up(size, os_page_size());
        let post_size = over_size - pre_size - mid_size;
        if pre_size > 0 {
            os_mem_free(p, pre_size, stats);
        }
        if post_size > 0 {
            os_mem_free((aligned as usize + mid_size) as *mut u8, post_size, stats);
        }
        Some((aligned, Memid::for_os(true, true)))
    }
    #[cfg(windows)]
    {
        // VirtualFree can only release an entire prior reservation, so we
        // retry a bounded number of times hoping the aligned address
        // happens to be free; if not we fall back to keeping the
        // over-sized mapping and returning its aligned interior pointer
        // unreleased outside of it (Windows cannot trim around a mapping).
        for _ in 0..3 {
            let p = win_alloc(over_size, MEM_RESERVE | MEM_COMMIT);
            if p.is_null() {
                return None;
            }
            if (p as usize) % align == 0 {
                return Some((p, Memid::for_os(true, true)));
            }
            let aligned = align_up_ptr(p, align);
            os_mem_free(p, over_size, stats);
            let retried = win_alloc(size, MEM_RESERVE | MEM_COMMIT);
            if retried == aligned {
                return Some((retried, Memid::for_os(true, true)));
            }
            if !retried.is_null() {
                os_mem_free(retried, size, stats);
            }
        }
        None
    }
}

fn os_page_align_conservative(addr: *mut u8, size: usize) -> Option<(*mut u8, usize)> {
    if addr.is_null() || size == 0 {
        return None;
    }
    let page = os_page_size();
    let start = align_up(addr as usize, page);
    let end = align_down(addr as usize + size, page);
    if end <= start {
        None
    } else {
        Some((start as *mut u8, end - start))
    }
}

/// Advise the OS that `[addr, addr+size)` can be reclaimed lazily; the
/// range stays committed (backing pages are dropped, not decommitted).
pub fn os_reset(addr: *mut u8, size: usize, stats: &Stats) -> bool {
    let (start, csize) = match os_page_align_conservative(addr, size) {
        Some(v) => v,
        None => return true,
    };
    stat_increase(&stats.reset, csize as i64);
    #[cfg(windows)]
    {
        let p = unsafe { VirtualAlloc(start as *mut _, csize, MEM_RESET, PAGE_READWRITE) };
        p as *mut u8 == start
    }
    #[cfg(not(windows))]
    {
        let err = unsafe { madvise(start as *mut _, csize, MADV_DONTNEED) };
        if err != 0 {
            warn!(
                "madvise(MADV_DONTNEED) failed: {}, addr {:p}, size {}",
                errno::errno(),
                start,
                csize
            );
        }
        err == 0
    }
}

/// Commit (make readable/writable, backed by RAM) a previously reserved
/// range.
pub fn os_commit(addr: *mut u8, size: usize, stats: &Stats) -> bool {
    os_commitx(addr, size, true, stats)
}

/// Decommit a previously committed range; the address space remains
/// reserved but future access will fault until re-committed.
pub fn os_decommit(addr: *mut u8, size: usize, stats: &Stats) -> bool {
    os_commitx(addr, size, false, stats)
}

fn os_commitx(addr: *mut u8, size: usize, commit: bool, stats: &Stats) -> bool {
    let page = os_page_size();
    let (start, csize) = if commit {
        // Commit liberally: round outward so we never leave a caller's
        // byte uncommitted.
        let start = align_down(addr as usize, page) as *mut u8;
        let end = align_up(addr as usize + size, page);
        (start, end - start as usize)
    } else {
        match os_page_align_conservative(addr, size) {
            Some(v) => v,
            None => return true,
        }
    };
    if csize == 0 {
        return true;
    }
    if commit {
        stat_increase(&stats.committed, csize as i64);
        stat_increase(&stats.commit_calls, 1);
    } else {
        stat_decrease(&stats.committed, csize as i64);
    }

    let ok;
    #[cfg(windows)]
    {
        if commit {
            let p = unsafe { VirtualAlloc(start as *mut _, csize, MEM_COMMIT, PAGE_READWRITE) };
            ok = p as *mut u8 == start;
        } else {
            ok = unsafe { VirtualFree(start as *mut _, csize, MEM_DECOMMIT) } != 0;
        }
    }
    #[cfg(not(windows))]
    {
        let prot = if commit { PROT_READ | PROT_WRITE } else { PROT_NONE };
        ok = unsafe { mprotect(start as *mut _, csize, prot) } == 0;
    }
    if !ok {
        warn!("commit/decommit failed for {:p} size {} commit={}", start, csize, commit);
    }
    ok
}

/// Mark a region inaccessible (debug/guard-page use) or restore
/// read/write access.
pub fn os_protect(addr: *mut u8, size: usize, protect: bool) -> bool {
    let (start, csize) = match os_page_align_conservative(addr, size) {
        Some(v) => v,
        None => return false,
    };
    let ok;
    #[cfg(windows)]
    {
        let mut old = 0;
        let prot = if protect { PAGE_NOACCESS } else { PAGE_READWRITE };
        ok = unsafe { VirtualProtect(start as *mut _, csize, prot, &mut old) } != 0;
    }
    #[cfg(not(windows))]
    {
        let prot = if protect { PROT_NONE } else { PROT_READ | PROT_WRITE };
        ok = unsafe { mprotect(start as *mut _, csize, prot) } == 0;
    }
    if !ok {
        warn!("mprotect failed for {:p} size {}", start, csize);
    }
    ok
}
