//! The `memid` descriptor: the sole mechanism for freeing an allocation
//! back to the right layer, since in-use memory carries no header.
//!
//! Grounded on `original_source/include/mimalloc.h`'s `mi_memid_t` and the
//! `mi_memid_t` fields referenced throughout `arena.c`/`os.c`.

/// Where a chunk of memory handed out by the core ultimately came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MemKind {
    /// A run of slices inside one of our arenas.
    Arena,
    /// Allocated straight from the OS (huge allocations, or arena
    /// reservations that are themselves OS-backed).
    Os,
    /// Backing store for an internal bookkeeping structure (arena
    /// descriptors, bitmap storage, page-map regions): never touched by
    /// the arena/page machinery it helps implement, to avoid a
    /// bootstrapping cycle.
    Meta,
    /// Memory the caller handed us from outside (e.g. a static buffer
    /// registered as an arena); never returned to the OS on free.
    External,
    /// No memory at all, used for the empty/sentinel placeholders.
    None,
}

/// Small POD descriptor carried by every allocation returned by the
/// arena or OS layers. There is no equivalent in-memory header: this is
/// reconstructed from a page's own bookkeeping (for arena memory) or
/// tracked at the call site (for direct OS/huge allocations), and exists
/// here purely as the argument/return shape `arena.rs` and `os.rs` pass
/// between each other.
#[derive(Debug, Clone, Copy)]
pub struct Memid {
    pub kind: MemKind,
    /// Index of the owning arena in the global arena table; meaningless
    /// unless `kind == Arena`.
    pub arena_index: usize,
    /// First slice index within the arena.
    pub slice_index: usize,
    pub slice_count: usize,
    /// True if the OS/arena guarantees the memory reads as all-zero on
    /// first touch (skips an explicit zero-fill on `zalloc`).
    pub initially_zero: bool,
    /// True if the memory is already committed (backed by RAM) when
    /// handed out.
    pub initially_committed: bool,
    /// True if this memory must never be handed back to a different
    /// caller than the one that reserved it (huge-OS-page reservations
    /// pinned to one heap).
    pub pinned: bool,
}

impl Memid {
    pub const NONE: Memid = Memid {
        kind: MemKind::None,
        arena_index: 0,
        slice_index: 0,
        slice_count: 0,
        initially_zero: false,
        initially_committed: false,
        pinned: false,
    };

    #[inline]
    pub fn for_arena(
        arena_index: usize,
        slice_index: usize,
        slice_count: usize,
        initially_zero: bool,
        initially_committed: bool,
        pinned: bool,
    ) -> Memid {
        Memid {
            kind: MemKind::Arena,
            arena_index,
            slice_index,
            slice_count,
            initially_zero,
            initially_committed,
            pinned,
        }
    }

    #[inline]
    pub fn for_os(initially_zero: bool, initially_committed: bool) -> Memid {
        Memid {
            kind: MemKind::Os,
            arena_index: 0,
            slice_index: 0,
            slice_count: 0,
            initially_zero,
            initially_committed,
            pinned: false,
        }
    }

    #[inline]
    pub fn for_meta() -> Memid {
        Memid {
            kind: MemKind::Meta,
            initially_zero: true,
            initially_committed: true,
            ..Memid::NONE
        }
    }
}
