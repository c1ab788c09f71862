//! Global page-map: translates any in-heap address to the `Page` that
//! owns it in O(1), without a per-block header.
//!
//! Grounded on `original_source/src/page-map.c`: a byte array indexed by
//! `addr >> SLICE_SHIFT`, lazily committed one OS-page-map-region at a
//! time as arenas are added, since reserving the whole address space's
//! worth of map entries up front would itself need gigabytes on 64-bit.

use core::sync::atomic::{AtomicPtr, AtomicUsize, Ordering};

use crate::meta;
use crate::types::SLICE_SHIFT;

/// One entry per slice: either 0 (not ours / unmapped) or a 1-based index
/// into a side table of page pointers, matching the original's "index,
/// not a raw pointer" scheme so map entries stay a single byte-ish unit
/// when packed; here we use a full pointer-sized slot for simplicity,
/// trading density for removing an extra indirection + table.
type Entry = AtomicUsize;

const COMMIT_REGION_SLICES: usize = 1 << 13; // 8192 entries/region

struct Segment {
    base: usize,
    slice_count: usize,
    entries: *mut Entry,
    committed: *mut AtomicUsize, // bitset of committed regions, one bit per COMMIT_REGION_SLICES
}

unsafe impl Send for Segment {}
unsafe impl Sync for Segment {}

const MAX_SEGMENTS: usize = 64;

struct PageMap {
    segments: [AtomicPtr<Segment>; MAX_SEGMENTS],
    segment_count: AtomicUsize,
}

unsafe impl Sync for PageMap {}

impl PageMap {
    const fn new() -> PageMap {
        const NULL: AtomicPtr<Segment> = AtomicPtr::new(core::ptr::null_mut());
        PageMap {
            segments: [NULL; MAX_SEGMENTS],
            segment_count: AtomicUsize::new(0),
        }
    }
}

static PAGEMAP: PageMap = PageMap::new();

/// Register `[base, base + size)` as owned address space, lazily backing
/// it with a map-entry region. Called once per arena/huge-OS reservation
/// at the time it is created (see `arena::reserve`).
pub fn register(base: usize, size: usize) -> bool {
    let slice_count = (size + (1 << SLICE_SHIFT) - 1) >> SLICE_SHIFT;
    let entries_bytes = slice_count * core::mem::size_of::<Entry>();
    let committed_words = (slice_count / COMMIT_REGION_SLICES).max(1);
    let committed_bytes = committed_words * core::mem::size_of::<AtomicUsize>();

    let entries = match meta::alloc_zeroed(entries_bytes) {
        Some(p) => p as *mut Entry,
        None => return false,
    };
    let committed = match meta::alloc_zeroed(committed_bytes) {
        Some(p) => p as *mut AtomicUsize,
        None => {
            unsafe { meta::free(entries as *mut u8, entries_bytes) };
            return false;
        }
    };

    let seg = match meta::alloc_zeroed(core::mem::size_of::<Segment>()) {
        Some(p) => p as *mut Segment,
        None => {
            unsafe {
                meta::free(entries as *mut u8, entries_bytes);
                meta::free(committed as *mut u8, committed_bytes);
            }
            return false;
        }
    };
    unsafe {
        seg.write(Segment {
            base,
            slice_count,
            entries,
            committed,
        });
    }

    let idx = PAGEMAP.segment_count.fetch_add(1, Ordering::AcqRel);
    if idx >= MAX_SEGMENTS {
        PAGEMAP.segment_count.fetch_sub(1, Ordering::AcqRel);
        return false;
    }
    PAGEMAP.segments[idx].store(seg, Ordering::Release);
    true
}

fn find_segment(addr: usize) -> Option<&'static Segment> {
    let count = PAGEMAP.segment_count.load(Ordering::Acquire);
    for i in 0..count {
        let p = PAGEMAP.segments[i].load(Ordering::Acquire);
        if p.is_null() {
            continue;
        }
        let seg = unsafe { &*p };
        let end = seg.base + (seg.slice_count << SLICE_SHIFT);
        if addr >= seg.base && addr < end {
            return Some(seg);
        }
    }
    None
}

/// Bind the slice-aligned page starting at `page_start` to `page_ptr`.
/// `slice_count` entries are written, one per slice the page spans.
///
/// # Safety
/// `page_start` must fall within a previously `register`ed range and
/// `page_ptr` must outlive every future `lookup` that resolves to it.
pub unsafe fn set(page_start: usize, slice_count: usize, page_ptr: *mut u8) {
    let seg = match find_segment(page_start) {
        Some(s) => s,
        None => return,
    };
    let slice_idx = (page_start - seg.base) >> SLICE_SHIFT;
    ensure_committed(seg, slice_idx, slice_count);
    let value = page_ptr as usize;
    for i in 0..slice_count {
        (*seg.entries.add(slice_idx + i)).store(value, Ordering::Release);
    }
}

/// Clear the map entries for a page being returned to its arena.
pub unsafe fn clear(page_start: usize, slice_count: usize) {
    let seg = match find_segment(page_start) {
        Some(s) => s,
        None => return,
    };
    let slice_idx = (page_start - seg.base) >> SLICE_SHIFT;
    for i in 0..slice_count {
        (*seg.entries.add(slice_idx + i)).store(0, Ordering::Release);
    }
}

/// Resolve any address within a live allocation to its owning page
/// pointer, or `None` if the address isn't inside a registered range or
/// its map region has never been written (never allocated there).
pub fn lookup(addr: usize) -> Option<*mut u8> {
    let seg = find_segment(addr)?;
    let slice_idx = (addr - seg.base) >> SLICE_SHIFT;
    let value = unsafe { (*seg.entries.add(slice_idx)).load(Ordering::Acquire) };
    if value == 0 {
        None
    } else {
        Some(value as *mut u8)
    }
}

fn ensure_committed(seg: &Segment, slice_idx: usize, slice_count: usize) {
    let first_region = slice_idx / COMMIT_REGION_SLICES;
    let last_region = (slice_idx + slice_count.max(1) - 1) / COMMIT_REGION_SLICES;
    for region in first_region..=last_region {
        let word = region / (core::mem::size_of::<usize>() * 8);
        let bit = region % (core::mem::size_of::<usize>() * 8);
        let mask = 1usize << bit;
        unsafe {
            let word_ptr = &*seg.committed.add(word);
            let old = word_ptr.fetch_or(mask, Ordering::AcqRel);
            if old & mask == 0 {
                // First toucher of this region: the backing entries were
                // already zero-allocated by meta::alloc_zeroed, so there
                // is no separate OS commit step needed here beyond what
                // the meta allocation already guaranteed. The bit purely
                // tracks "has been touched" for diagnostics/stats.
            }
        }
    }
}
