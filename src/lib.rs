//! A thread-safe, general-purpose memory allocator core: the
//! free-list-sharded page, the concurrent-bitmap arena, the
//! size-classed thread-local heap, and the abandon/reclaim protocol
//! that moves pages between heaps without leaks or double-adoption
//! races.
//!
//! This crate is `#![no_std]`: the only heap this allocator may itself
//! depend on is the OS (`os.rs`) and a small internal meta-allocator
//! (`meta.rs`) used strictly for the crate's own bookkeeping structures,
//! never for user allocations. See `DESIGN.md` at the repository root
//! for the grounding ledger mapping each module to the original source
//! it was built from.

#![no_std]

#[cfg(test)]
extern crate std;

use core::alloc::{GlobalAlloc, Layout};
use core::ffi::c_void;
use core::ptr::null_mut;

pub mod abandon;
pub mod arena;
pub mod bitmap;
pub mod error;
pub mod heap;
pub mod init;
pub mod memid;
pub mod meta;
pub mod options;
pub mod os;
pub mod page;
pub mod pagemap;
pub mod sizeclass;
pub mod stats;
pub mod types;

use heap::ThreadHeap;

/// Installable as `#[global_allocator]`: routes every `alloc`/`dealloc`
/// through the calling thread's default [`ThreadHeap`] (spec §6 "the
/// API the core exposes to the C-compat layer").
pub struct Mimalloc;

unsafe impl GlobalAlloc for Mimalloc {
    unsafe fn alloc(&self, layout: Layout) -> *mut u8 {
        heap_alloc_aligned(null_mut(), layout.size(), layout.align(), 0)
    }

    unsafe fn alloc_zeroed(&self, layout: Layout) -> *mut u8 {
        let heap = init::get_default_heap();
        if layout.align() <= types::MAX_ALIGN_SIZE {
            heap.zalloc(layout.size())
        } else {
            heap.zalloc_aligned(layout.size(), layout.align())
        }
    }

    unsafe fn dealloc(&self, ptr: *mut u8, _layout: Layout) {
        heap_free(ptr);
    }

    unsafe fn realloc(&self, ptr: *mut u8, _layout: Layout, new_size: usize) -> *mut u8 {
        heap_realloc(null_mut(), ptr, new_size)
    }
}

// ---------------------------------------------------------------
// C-compatible API surface (spec §6): thin functions a POSIX/C++
// adapter crate can bind `malloc`/`free`/`operator new`/etc. to without
// reaching into any module internals. Every function taking a `heap`
// pointer treats `NULL` as "the calling thread's default heap" (lazily
// created via `init::get_default_heap` on first use), the same
// convenience the original's `mi_malloc`/`mi_free` wrappers give the
// plain C API over the explicit-heap one.
// ---------------------------------------------------------------

fn resolve_heap(heap: *mut ThreadHeap) -> &'static ThreadHeap {
    if heap.is_null() {
        init::get_default_heap()
    } else {
        unsafe { &*heap }
    }
}

/// Allocate `size` bytes from `heap` (or the calling thread's default
/// heap if `heap` is `NULL`).
pub fn heap_alloc(heap: *mut ThreadHeap, size: usize) -> *mut u8 {
    resolve_heap(heap).malloc(size)
}

/// Allocate `size` zeroed bytes from `heap` (or the default heap).
pub fn heap_zalloc(heap: *mut ThreadHeap, size: usize) -> *mut u8 {
    resolve_heap(heap).zalloc(size)
}

/// Allocate `size` bytes such that `(ptr + offset) % align == 0` (spec
/// §6 `heap_alloc_aligned(heap, size, align, offset)`); `offset == 0` is
/// the common "just align the returned pointer" case.
pub fn heap_alloc_aligned(heap: *mut ThreadHeap, size: usize, align: usize, offset: usize) -> *mut u8 {
    if !align.is_power_of_two() {
        error::out_of_memory("heap_alloc_aligned: alignment is not a power of two");
        return null_mut();
    }
    let heap = resolve_heap(heap);
    if offset == 0 && align <= types::MAX_ALIGN_SIZE {
        heap.malloc(size)
    } else {
        heap.malloc_aligned_offset(size, align, offset)
    }
}

/// Free `ptr`, which must be `NULL` or a pointer previously returned by
/// one of this module's `heap_*` allocation functions and not yet freed.
pub fn heap_free(ptr: *mut u8) {
    ThreadHeap::free_ptr(ptr);
}

/// Resize the allocation at `ptr` (spec §4.4 Realloc): reused in place
/// when it still fits within the existing block's retained half,
/// otherwise a fresh block is allocated from `heap` (or the default
/// heap), the overlapping prefix copied, and the old block freed.
pub fn heap_realloc(heap: *mut ThreadHeap, ptr: *mut u8, new_size: usize) -> *mut u8 {
    resolve_heap(heap).realloc(ptr, new_size)
}

/// Number of bytes actually usable through `ptr` (at least as many as
/// were requested when it was allocated, typically more due to
/// size-class rounding).
pub fn heap_usable_size(ptr: *mut u8) -> usize {
    ThreadHeap::usable_size(ptr)
}

/// Create an additional heap for the calling thread beyond its default
/// one (spec §3 "multiple allowed per thread"); useful for a caller that
/// wants to `heap_destroy` a whole batch of allocations at once without
/// walking them individually.
pub fn heap_new() -> *mut ThreadHeap {
    match ThreadHeap::new_boxed(os::thread_id(), types::HEAP_TAG_DEFAULT) {
        Some(p) => p,
        None => {
            error::out_of_memory("heap_new: meta allocation failed");
            null_mut()
        }
    }
}

/// Merge `heap`'s pages back to the general pool: every non-empty page
/// is abandoned (adoptable by any heap's `generic` path, including the
/// caller's own default heap), every empty one is freed to its arena,
/// and `heap`'s own storage is released. Unlike `heap_destroy`, no block
/// is assumed lost — live blocks remain valid and simply become
/// reachable only through `free`/`realloc`, not through `heap` anymore.
///
/// # Safety
/// `heap` must have been returned by `heap_new` and not already passed
/// to `heap_delete`/`heap_destroy`.
pub unsafe fn heap_delete(heap: *mut ThreadHeap) {
    if heap.is_null() {
        return;
    }
    let h = &*heap;
    h.collect(heap::CollectMode::Abandon);
    h.stats.merge_into(stats::global());
    meta::free(heap as *mut u8, core::mem::size_of::<ThreadHeap>());
}

/// Free every page `heap` owns straight back to its arena without
/// walking blocks first. Legal only when the caller guarantees no block
/// allocated through `heap` is still live (spec §6): unlike
/// `heap_delete`, outstanding blocks become dangling.
///
/// # Safety
/// `heap` must have been returned by `heap_new`, must not be in use by
/// any other thread, and every block ever allocated through it must
/// already be unreachable by the caller.
pub unsafe fn heap_destroy(heap: *mut ThreadHeap) {
    if heap.is_null() {
        return;
    }
    let h = &*heap;
    h.destroy();
    meta::free(heap as *mut u8, core::mem::size_of::<ThreadHeap>());
}

/// Walk every block currently reachable through `heap` (or the default
/// heap), calling `visit(block, block_size, arg)` for each one; skips
/// free slots unless `visit_all` is set. Stops early and returns `false`
/// the moment `visit` itself returns `false`, otherwise returns `true`
/// once every page has been walked.
///
/// Best-effort and not point-in-time consistent with a concurrently
/// mutating heap — a block observed "free" may already be reallocated
/// by the time `visit` runs, and vice versa (spec §6
/// `heap_visit_blocks`); intended for single-threaded debug/diagnostic
/// use, mirroring the original's documented caveats for the same call.
pub fn heap_visit_blocks(
    heap: *mut ThreadHeap,
    visit_all: bool,
    visit: unsafe extern "C" fn(block: *mut u8, block_size: usize, arg: *mut c_void) -> bool,
    arg: *mut c_void,
) -> bool {
    let heap = resolve_heap(heap);
    let mut keep_going = true;
    heap.for_each_page(|page| {
        if !keep_going {
            return;
        }
        for i in 0..page.capacity() {
            let block = unsafe { (page.page_start as *mut u8).add(i as usize * page.block_size) };
            if !visit_all && page.is_block_free(block) {
                continue;
            }
            if !unsafe { visit(block, page.block_size, arg) } {
                keep_going = false;
                break;
            }
        }
    });
    keep_going
}

/// Opportunistic (or forced) sweep of the calling thread's default
/// heap's page queues (spec §4.4 Collect modes).
pub fn collect(force: bool) {
    let heap = init::get_default_heap();
    heap.collect(if force {
        heap::CollectMode::Force
    } else {
        heap::CollectMode::Normal
    });
}

/// Explicit process-start hook (also runs lazily on first allocation);
/// exposed so an embedding C-compat layer can wire it to a constructor
/// attribute / DllMain `DLL_PROCESS_ATTACH`.
pub fn process_init() {
    init::process_init();
}

/// Explicit process-exit hook; wire to `atexit`/DllMain
/// `DLL_PROCESS_DETACH`.
pub fn process_done() {
    init::process_done();
}

/// Explicit per-thread init hook; the TLS destructor installed by
/// `init::process_init` already calls `thread_done` automatically on
/// thread exit, so most callers never need this directly.
pub fn thread_init() {
    let _ = init::thread_init();
}

/// Explicit per-thread teardown hook (the pthread key destructor on
/// unix / FLS callback on Windows installed by `process_init` already
/// runs this automatically on thread exit; exposed for callers that
/// tear a thread down through a mechanism those callbacks can't
/// observe).
pub fn thread_done() {
    init::thread_done();
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::vec::Vec;

    #[test]
    fn global_alloc_round_trip() {
        let alloc = Mimalloc;
        unsafe {
            let layout = Layout::from_size_align(64, 8).unwrap();
            let p = alloc.alloc(layout);
            assert!(!p.is_null());
            core::ptr::write_bytes(p, 0xAB, 64);
            alloc.dealloc(p, layout);
        }
    }

    #[test]
    fn global_alloc_zeroed_is_actually_zero() {
        let alloc = Mimalloc;
        unsafe {
            let layout = Layout::from_size_align(128, 8).unwrap();
            let p = alloc.alloc_zeroed(layout);
            assert!(!p.is_null());
            let slice = core::slice::from_raw_parts(p, 128);
            assert!(slice.iter().all(|&b| b == 0));
            alloc.dealloc(p, layout);
        }
    }

    #[test]
    fn heap_alloc_aligned_contract() {
        for &(size, align) in &[(1usize, 4096usize), (300, 64), (8, 32)] {
            let p = heap_alloc_aligned(null_mut(), size, align, 0);
            assert!(!p.is_null());
            assert_eq!(p as usize % align, 0);
            assert!(heap_usable_size(p) >= size);
            heap_free(p);
        }
    }

    #[test]
    fn heap_alloc_aligned_with_offset_aligns_interior_pointer() {
        let size = 256usize;
        let align = 64usize;
        let offset = 24usize;
        let p = heap_alloc_aligned(null_mut(), size, align, offset);
        assert!(!p.is_null());
        assert_eq!((p as usize + offset) % align, 0);
        heap_free(p);
    }

    #[test]
    fn heap_visit_blocks_sees_every_live_allocation() {
        let heap = heap_new();
        assert!(!heap.is_null());
        let h = unsafe { &*heap };
        let mut ptrs: Vec<usize> = Vec::new();
        for _ in 0..4 {
            ptrs.push(h.malloc(40) as usize);
        }

        use core::cell::Cell;
        let seen = Cell::new(0usize);
        unsafe extern "C" fn count(_block: *mut u8, _size: usize, arg: *mut c_void) -> bool {
            let cell = &*(arg as *const Cell<usize>);
            cell.set(cell.get() + 1);
            true
        }
        let finished = heap_visit_blocks(heap, false, count, &seen as *const Cell<usize> as *mut c_void);
        assert!(finished);
        assert!(seen.get() >= ptrs.len());

        for p in ptrs {
            heap_free(p as *mut u8);
        }
        unsafe { heap_destroy(heap) };
    }

    #[test]
    fn heap_new_delete_does_not_leak_live_blocks() {
        let extra = heap_new();
        assert!(!extra.is_null());
        let heap = unsafe { &*extra };
        let mut ptrs: Vec<*mut u8> = Vec::new();
        for _ in 0..8 {
            ptrs.push(heap.malloc(48));
        }
        assert!(ptrs.iter().all(|p| !p.is_null()));
        unsafe { heap_delete(extra) };
        // Every block handed out by the deleted heap is still a valid,
        // freeable allocation: `heap_delete` abandons pages, it doesn't
        // invalidate their blocks.
        for p in ptrs {
            heap_free(p);
        }
    }
}
