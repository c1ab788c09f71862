//! Abandon/reclaim protocol (spec §4.5): lets a terminating thread release
//! its partially-used pages for another thread to adopt, and lets a
//! heap that is short of a size-class scavenge pages nobody owns before
//! asking the arena for a brand new one.
//!
//! Grounded on `original_source/src/arena.c`'s `mi_arena_page_abandon`/
//! `mi_arenas_page_try_reclaim`: ownership itself is decided by a single
//! compare-exchange on `Page::owner` (this crate's equivalent of the
//! original's packed `xthread_free` ownership bit, kept as a separate
//! field per the design ledger's Open Question resolution), while the
//! per-arena `pages_abandoned` bitmap is only ever an *advertisement* —
//! losing the race to publish or claim it is always safe to retry.

use crate::arena;
use crate::memid::MemKind;
use crate::page::Page;
use crate::pagemap;

/// Release ownership of `page` and, for arena-backed pages, advertise it
/// on the arena's `pages_abandoned[bin]` bitmap so a future `reclaim`
/// call can find it. Called from `heap::collect(Abandon)` during
/// thread-exit, and from `heap::free` when a page empties after its
/// owner already began tearing down.
///
/// OS-backed singleton pages (huge allocations) are deliberately not
/// bitmap-advertised (spec: "never abandoned-mapped"); they simply sit
/// ownerless until freed directly by whichever thread holds the pointer.
pub fn abandon(page: &Page) {
    page.release_ownership();
    if page.memid.kind == MemKind::Arena && page.reserved > 1 {
        arena::mark_abandoned(page.memid, page.bin);
    }
}

/// Find and adopt one abandoned page of size-class `bin`, returning a
/// reference to it already owned by `thread_id`, or `None` if the
/// subprocess currently has nothing abandoned in that bin.
///
/// Pages tagged for a different `heap_tag` are re-published and skipped:
/// this models the spec's `try_find_and_claim` "claim_fn returned false,
/// put the bit back" contract without needing the bitmap itself to carry
/// a predicate.
pub fn reclaim(bin: usize, thread_id: usize, heap_tag: u8) -> Option<&'static Page> {
    if arena::abandoned_count() == 0 {
        return None;
    }
    // Bounded, not unbounded: a pathological mix of many heap tags could
    // otherwise spin forever re-publishing pages that are never ours.
    for _ in 0..64 {
        let (arena_id, slice_idx) = arena::try_reclaim(bin)?;
        let addr = match arena::slice_addr(arena_id, slice_idx) {
            Some(a) => a,
            None => continue,
        };
        let page = match pagemap::lookup(addr) {
            Some(p) => unsafe { &*(p as *const Page) },
            None => continue,
        };
        if page.heap_tag != heap_tag {
            arena::mark_abandoned(page.memid, bin);
            continue;
        }
        if page.try_claim(thread_id) {
            page.mark_reclaimed();
            return Some(page);
        }
        // Lost the race: a concurrent reclaim-on-free already took
        // ownership. The bit is already cleared (we claimed it out of
        // the bitmap above) and must stay that way — the new owner is
        // responsible for this page now.
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::page::Page;
    use crate::stats::Stats;
    use crate::types::ARENA_MIN_SIZE;
    use std::boxed::Box;

    #[test]
    fn abandon_then_reclaim_round_trips_ownership() {
        let stats = Stats::new();
        arena::reserve(ARENA_MIN_SIZE, &stats).unwrap();
        let (p, memid) = arena::alloc(1, -1, &stats).unwrap();
        let bin = 5;
        let page = Box::leak(Box::new(Page::new_for_heap(
            memid, 64, bin, 16, 0xabc, p as usize, 1, 0,
        )));
        unsafe { pagemap::set(p as usize, 1, page as *const Page as *mut u8) };

        assert!(page.try_claim(111));
        abandon(page);
        assert_eq!(page.owner(), 0);

        let reclaimed = reclaim(bin, 222, 0).expect("page should be reclaimable");
        assert_eq!(reclaimed as *const Page, page as *const Page);
        assert_eq!(reclaimed.owner(), 222);
    }
}
