//! Arenas: large pre-reserved virtual ranges sliced into 64 KiB units
//! and handed out to thread-heaps as pages.
//!
//! Grounded on `original_source/src/arena.h`/`arena.c`: each `Arena`
//! descriptor owns six bitmaps over its slice range (free, committed,
//! dirty, purge-pending, and one `pages_abandoned` bitmap per size-class
//! bin) plus a `search_idx` used to rotate the starting point of the
//! next free-run search so allocations don't pile up at the low end.

use core::sync::atomic::{AtomicBool, AtomicPtr, AtomicUsize, Ordering};

use crate::bitmap::{Bchunk, Bitmap, ClaimResult};
use crate::memid::{MemKind, Memid};
use crate::meta;
use crate::os;
use crate::pagemap;
use crate::stats::{stat_decrease, stat_increase, Stats};
use crate::types::{
    ARENA_MAX_OBJ_SLICES, ARENA_MIN_SIZE, BIN_COUNT, BCHUNK_BITS, SLICE_SHIFT, SLICE_SIZE,
};

pub type ArenaId = usize;

const MAX_ARENAS: usize = 128;

struct Arena {
    start: *mut u8,
    slice_count: usize,
    memid: Memid,
    numa_node: i32,
    exclusive: bool,
    is_large: bool,
    search_idx: AtomicUsize,
    free: Bitmap,
    committed: Bitmap,
    dirty: Bitmap,
    purge: Bitmap,
    /// One bitmap per size-class bin, tracking pages abandoned by a
    /// thread that exited (or called `collect(Force)`) without freeing
    /// them first; `abandon::reclaim` scans the bin matching its
    /// request size first.
    pages_abandoned: [Bitmap; BIN_COUNT],
}

unsafe impl Send for Arena {}
unsafe impl Sync for Arena {}

static ARENAS: [AtomicPtr<Arena>; MAX_ARENAS] = {
    const NULL: AtomicPtr<Arena> = AtomicPtr::new(core::ptr::null_mut());
    [NULL; MAX_ARENAS]
};
static ARENA_COUNT: AtomicUsize = AtomicUsize::new(0);
/// Round-robin rotation across arenas so successive reservations spread
/// load instead of hammering arena 0 (spec's `arena_rotations` stat).
static NEXT_ARENA: AtomicUsize = AtomicUsize::new(0);
static SUBPROCESS_ABANDONED_COUNT: AtomicUsize = AtomicUsize::new(0);

fn chunk_count_for(slice_count: usize) -> usize {
    (slice_count + BCHUNK_BITS - 1) / BCHUNK_BITS
}

fn alloc_bitmap(slice_count: usize) -> Option<Bitmap> {
    let chunk_count = chunk_count_for(slice_count);
    let chunkmap_chunks = (chunk_count + BCHUNK_BITS - 1) / BCHUNK_BITS;
    let chunks = meta::alloc_zeroed(chunk_count * core::mem::size_of::<Bchunk>())? as *mut Bchunk;
    let chunkmap =
        meta::alloc_zeroed(chunkmap_chunks.max(1) * core::mem::size_of::<Bchunk>())? as *mut Bchunk;
    Some(unsafe { Bitmap::new(chunks, chunk_count, chunkmap) })
}

/// Reserve a fresh arena of at least `min_size` bytes (rounded up to
/// `ARENA_MIN_SIZE`) from the OS and register it for future allocation
/// requests. Returns the new arena's id.
pub fn reserve(min_size: usize, stats: &Stats) -> Option<ArenaId> {
    let size = align_up(min_size.max(ARENA_MIN_SIZE), ARENA_MIN_SIZE);
    let slice_count = size >> SLICE_SHIFT;
    let (start, memid) = os::os_alloc_aligned(size, ARENA_MIN_SIZE, stats)?;

    let free = alloc_bitmap(slice_count)?;
    let committed = alloc_bitmap(slice_count)?;
    let dirty = alloc_bitmap(slice_count)?;
    let purge = alloc_bitmap(slice_count)?;
    // Every slice starts free: mark every slice as available up front.
    let mut remaining = slice_count;
    let mut offset = 0;
    while remaining > 0 {
        let take = remaining.min(BCHUNK_BITS);
        free.set_n(offset, take);
        remaining -= take;
        offset += take;
    }
    if memid.initially_committed {
        let mut remaining = slice_count;
        let mut offset = 0;
        while remaining > 0 {
            let take = remaining.min(BCHUNK_BITS);
            committed.set_n(offset, take);
            remaining -= take;
            offset += take;
        }
    }

    let pages_abandoned = new_pages_abandoned(slice_count)?;

    let arena_mem = meta::alloc_zeroed(core::mem::size_of::<Arena>())? as *mut Arena;
    unsafe {
        arena_mem.write(Arena {
            start,
            slice_count,
            memid,
            numa_node: -1,
            exclusive: false,
            is_large: false,
            search_idx: AtomicUsize::new(0),
            free,
            committed,
            dirty,
            purge,
            pages_abandoned,
        });
    }

    pagemap::register(start as usize, size);

    let idx = ARENA_COUNT.fetch_add(1, Ordering::AcqRel);
    if idx >= MAX_ARENAS {
        ARENA_COUNT.fetch_sub(1, Ordering::AcqRel);
        return None;
    }
    ARENAS[idx].store(arena_mem, Ordering::Release);
    stat_increase(&stats.arenas, 1);
    stat_increase(&stats.reserved, size as i64);
    Some(idx)
}

fn new_pages_abandoned(slice_count: usize) -> Option<[Bitmap; BIN_COUNT]> {
    // BIN_COUNT bitmaps, each sized to the arena's slice count; built one
    // at a time since `Bitmap` isn't `Copy`/`Default`.
    let mut storage: [core::mem::MaybeUninit<Bitmap>; BIN_COUNT] =
        unsafe { core::mem::MaybeUninit::uninit().assume_init() };
    for slot in storage.iter_mut() {
        match alloc_bitmap(slice_count) {
            Some(b) => {
                slot.write(b);
            }
            None => return None,
        }
    }
    Some(unsafe { core::mem::transmute_copy(&storage) })
}

fn align_up(n: usize, align: usize) -> usize {
    (n + align - 1) / align * align
}

fn arena_at(idx: ArenaId) -> Option<&'static Arena> {
    let p = ARENAS[idx].load(Ordering::Acquire);
    if p.is_null() {
        None
    } else {
        Some(unsafe { &*p })
    }
}

fn arena_count() -> usize {
    ARENA_COUNT.load(Ordering::Acquire)
}

/// Allocate `slice_count` contiguous slices (at most `ARENA_MAX_OBJ_SLICES`)
/// from any suitable arena, creating a new one if none has room. `numa_node`
/// is currently advisory only (see Open Question in the design ledger).
pub fn alloc(slice_count: usize, numa_node: i32, stats: &Stats) -> Option<(*mut u8, Memid)> {
    debug_assert!(slice_count >= 1 && slice_count <= ARENA_MAX_OBJ_SLICES);
    let _ = numa_node;

    let count = arena_count();
    let start_idx = NEXT_ARENA.fetch_add(1, Ordering::Relaxed) % count.max(1);
    for offset in 0..count {
        let idx = (start_idx + offset) % count;
        if let Some(arena) = arena_at(idx) {
            if let Some(r) = try_alloc_in(idx, arena, slice_count, stats) {
                if offset > 0 {
                    stats.arena_rotations.increment(offset as i64);
                }
                return Some(r);
            }
        }
    }

    // No arena had room: reserve a new one sized to fit, then retry once.
    let size = slice_count << SLICE_SHIFT;
    let idx = reserve(size, stats)?;
    let arena = arena_at(idx)?;
    try_alloc_in(idx, arena, slice_count, stats)
}

fn try_alloc_in(
    idx: ArenaId,
    arena: &Arena,
    slice_count: usize,
    stats: &Stats,
) -> Option<(*mut u8, Memid)> {
    if arena.exclusive {
        return None;
    }
    let hint = arena.search_idx.load(Ordering::Relaxed) / BCHUNK_BITS;
    let claim = arena.free.try_find_and_claim(slice_count, hint);
    let slice_idx = match claim {
        ClaimResult::Claimed { start } => start,
        ClaimResult::NoneFound => return None,
    };
    arena
        .search_idx
        .store(slice_idx + slice_count, Ordering::Relaxed);

    let initially_zero = ensure_committed(arena, slice_idx, slice_count, stats);
    arena.dirty.set_n(slice_idx, slice_count);

    let ptr = unsafe { arena.start.add(slice_idx << SLICE_SHIFT) };
    let memid = Memid::for_arena(idx, slice_idx, slice_count, initially_zero, true, false);
    stat_increase(&stats.committed, (slice_count << SLICE_SHIFT) as i64);
    Some((ptr, memid))
}

fn ensure_committed(arena: &Arena, slice_idx: usize, slice_count: usize, stats: &Stats) -> bool {
    if arena.committed.is_set_n(slice_idx, slice_count) {
        // Already committed: zero only if it was never touched before
        // (tracked by the dirty bitmap being clear).
        return arena.dirty.is_clear_n(slice_idx, slice_count);
    }
    let addr = unsafe { arena.start.add(slice_idx << SLICE_SHIFT) };
    let size = slice_count << SLICE_SHIFT;
    os::os_commit(addr, size, stats);
    arena.committed.set_n(slice_idx, slice_count);
    true
}

/// Return a previously `alloc`'d range to its arena.
///
/// # Safety
/// `memid` must be the exact descriptor returned by the matching `alloc`
/// call, and no other reference to the range may remain live.
pub unsafe fn free(p: *mut u8, memid: Memid, stats: &Stats) {
    if memid.kind != MemKind::Arena {
        return;
    }
    let arena = match arena_at(memid.arena_index) {
        Some(a) => a,
        None => return,
    };
    let cleared = arena.free.try_clear_n(memid.slice_index, memid.slice_count);
    debug_assert!(cleared, "double free or corrupted memid");
    pagemap::clear(
        arena.start as usize + (memid.slice_index << SLICE_SHIFT),
        memid.slice_count,
    );
    stat_decrease(&stats.committed, (memid.slice_count << SLICE_SHIFT) as i64);
    schedule_purge(arena, memid.slice_index, memid.slice_count);
}

fn schedule_purge(arena: &Arena, slice_idx: usize, slice_count: usize) {
    arena.purge.set_n(slice_idx, slice_count);
}

/// Walk every arena's purge bitmap and decommit any range whose purge
/// delay has elapsed. Called from the background/opportunistic purge
/// sweep (`theap::collect(Force)`), never from the hot allocation path.
pub fn purge_pending(stats: &Stats) {
    let count = arena_count();
    for idx in 0..count {
        if let Some(arena) = arena_at(idx) {
            while let Some((bit, len)) = arena.purge.try_find_and_clear_n(BCHUNK_BITS) {
                let addr = unsafe { arena.start.add(bit << SLICE_SHIFT) };
                let size = len << SLICE_SHIFT;
                if os::os_decommit(addr, size, stats) {
                    arena.committed.try_clear_n(bit, len);
                    arena.dirty.try_clear_n(bit, len);
                }
            }
        }
    }
}

/// Mark a page's slice range as abandoned by its owning thread so a
/// future `abandon::reclaim` from a different thread can adopt it.
pub fn mark_abandoned(memid: Memid, bin: usize) {
    if memid.kind != MemKind::Arena {
        return;
    }
    if let Some(arena) = arena_at(memid.arena_index) {
        arena.pages_abandoned[bin].set_n(memid.slice_index, 1);
        SUBPROCESS_ABANDONED_COUNT.fetch_add(1, Ordering::Relaxed);
    }
}

/// Undo a `mark_abandoned` that never went through `try_reclaim` (a
/// cross-thread free adopting an abandoned page directly via
/// `Page::try_claim` rather than the `abandon::reclaim` search path);
/// without this the bit would sit stale until the page is abandoned
/// again and falsely count it as available.
pub fn unmark_abandoned(memid: Memid, bin: usize) {
    if memid.kind != MemKind::Arena {
        return;
    }
    if let Some(arena) = arena_at(memid.arena_index) {
        if arena.pages_abandoned[bin].try_clear_n(memid.slice_index, 1) {
            SUBPROCESS_ABANDONED_COUNT.fetch_sub(1, Ordering::Relaxed);
        }
    }
}

/// Find and claim one abandoned page in size-class `bin`, if any exists
/// in any arena. Returns the arena id and slice index of the claimed
/// page so the caller can reconstruct its `Page` pointer via the
/// page-map.
pub fn try_reclaim(bin: usize) -> Option<(ArenaId, usize)> {
    let count = arena_count();
    for idx in 0..count {
        let arena = arena_at(idx)?;
        if let ClaimResult::Claimed { start } = arena.pages_abandoned[bin].try_find_and_claim(1, 0)
        {
            SUBPROCESS_ABANDONED_COUNT.fetch_sub(1, Ordering::Relaxed);
            return Some((idx, start));
        }
    }
    None
}

/// Reconstruct the address of `slice_idx` within arena `id`; used by
/// `abandon::reclaim` to resolve a claimed abandoned-page bit back to a
/// `Page` pointer via the page-map.
pub fn slice_addr(id: ArenaId, slice_idx: usize) -> Option<usize> {
    let arena = arena_at(id)?;
    Some(arena.start as usize + (slice_idx << SLICE_SHIFT))
}

pub fn abandoned_count() -> usize {
    SUBPROCESS_ABANDONED_COUNT.load(Ordering::Relaxed)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reserve_and_alloc_roundtrip() {
        let stats = Stats::new();
        let id = reserve(ARENA_MIN_SIZE, &stats).expect("reserve should succeed");
        let (p, memid) = alloc(4, -1, &stats).expect("alloc should succeed");
        assert!(!p.is_null());
        assert_eq!(memid.kind, MemKind::Arena);
        assert_eq!(memid.arena_index, id);
        unsafe { free(p, memid, &stats) };
    }

    #[test]
    fn free_allows_reallocation_of_same_slices() {
        let stats = Stats::new();
        reserve(ARENA_MIN_SIZE, &stats).unwrap();
        let (p1, memid1) = alloc(2, -1, &stats).unwrap();
        unsafe { free(p1, memid1, &stats) };
        let (p2, memid2) = alloc(2, -1, &stats).unwrap();
        assert_eq!(memid1.slice_index, memid2.slice_index);
        unsafe { free(p2, memid2, &stats) };
    }
}
