//! Tuning constants and the smallest shared types.
//!
//! Everything that more than one layer (bitmap / arena / page / heap) needs
//! to agree on lives here, mirroring how the original C sources keep these
//! numbers in a single header rather than letting each source file invent
//! its own.

use core::mem::size_of;

#[cfg(target_pointer_width = "64")]
pub const INTPTR_SHIFT: usize = 3;
#[cfg(target_pointer_width = "32")]
pub const INTPTR_SHIFT: usize = 2;

pub const INTPTR_SIZE: usize = 1 << INTPTR_SHIFT;

// ------------------------------------------------------
// Slices, the granularity of arena bookkeeping
// ------------------------------------------------------

/// `2^SLICE_SHIFT` bytes per slice (64 KiB).
pub const SLICE_SHIFT: usize = 16;
pub const SLICE_SIZE: usize = 1 << SLICE_SHIFT;
pub const SLICE_MASK: usize = SLICE_SIZE - 1;

/// A bitmap chunk is 512 bits; one chunk thus covers this many bytes of
/// arena address space.
pub const BCHUNK_BITS: usize = 512;
pub const BCHUNK_BYTES: usize = BCHUNK_BITS * SLICE_SIZE;

/// Maximum number of slices (and thus chunks) a single arena can span:
/// 512 chunks * 512 bits/chunk * 64 KiB/slice == 16 GiB.
pub const ARENA_MAX_SLICES: usize = BCHUNK_BITS * BCHUNK_BITS;
pub const ARENA_MAX_SIZE: usize = ARENA_MAX_SLICES * SLICE_SIZE;
pub const ARENA_MIN_SIZE: usize = BCHUNK_BITS * SLICE_SIZE; // one full chunk, 32 MiB

/// A single object can never span more than one chunk's worth of slices.
pub const ARENA_MAX_OBJ_SLICES: usize = BCHUNK_BITS;
pub const ARENA_MAX_OBJ_SIZE: usize = ARENA_MAX_OBJ_SLICES * SLICE_SIZE;

// ------------------------------------------------------
// Block size classes
// ------------------------------------------------------

/// Above this size, sizes are no longer looked up through the dense
/// `pages_free_direct` array.
pub const SMALL_WSIZE_MAX: usize = 128;
pub const SMALL_SIZE_MAX: usize = SMALL_WSIZE_MAX * size_of::<*mut ()>();

pub const MEDIUM_OBJ_SIZE_MAX: usize = 8 * SLICE_SIZE; // 512 KiB
pub const LARGE_OBJ_SIZE_MAX: usize = ARENA_MAX_OBJ_SIZE / 2; // 16 MiB, still bitmap-backed

/// Beyond this a request is satisfied by a dedicated, singleton ("huge")
/// page whose `reserved == 1`.
pub const LARGE_SIZE_MAX: usize = LARGE_OBJ_SIZE_MAX;

/// Number of size-class bins, spaced in ~16.7% increments as in the
/// original source (word-exact bins for the smallest sizes, then 4
/// sub-bins per power-of-two octave up to `LARGE_OBJ_SIZE_MAX`).
pub const BIN_HUGE: usize = 72;
pub const BIN_FULL: usize = BIN_HUGE + 1;
pub const BIN_COUNT: usize = BIN_FULL + 1;

/// Minimal alignment the allocator guarantees for every allocation; most
/// platforms need 16 bytes for SSE-sized values.
pub const MAX_ALIGN_SIZE: usize = 16;

/// Size (in words) of the dense direct-lookup table; one extra slot past
/// `SMALL_WSIZE_MAX` absorbs the "just over the edge" rounding case.
pub const SMALL_WSIZE_MAX_DIRECT: usize = SMALL_WSIZE_MAX + 1;

/// Number of scans a retired small/medium page survives before it is
/// actually returned to the arena, scaled by how small (and thus how
/// likely to be reused soon) its blocks are.
pub const RETIRE_CYCLES_SMALL: u16 = 16;
pub const RETIRE_CYCLES_LARGE: u16 = 4;

/// Number of allocations through the generic (slow) path between
/// opportunistic `collect(Normal)` sweeps of a heap's queues.
pub const GENERIC_COLLECT_INTERVAL: u32 = 8;

/// Blocks carved into a page's free list the first time it is touched.
pub const PAGE_EXTEND_MIN: usize = 4;
/// Upper bound on how many blocks a single `extend()` call carves,
/// regardless of how large `reserved` is; keeps a huge bin's first touch
/// bounded.
pub const PAGE_EXTEND_MAX: usize = 1024;

/// Pages with `page_full_retain` pages already sitting on the full queue
/// are abandoned straight to the OS-abandoned list on the next free
/// instead of retained (spec §4.2/§9 "page retain full" open question).
pub const PAGE_FULL_RETAIN_DEFAULT: i32 = 4;

/// Distinguishes "kinds" of thread-heaps for abandon/reclaim eligibility;
/// a reclaiming heap only adopts abandoned pages tagged with its own (or
/// the default) tag, see `abandon.rs`.
pub type HeapTag = u8;
pub const HEAP_TAG_DEFAULT: HeapTag = 0;

/// A free block, when not in use, is just storage for the (encoded) next
/// pointer of whichever intrusive list currently owns it. In-use blocks
/// carry no header at all: the containing page is recovered through the
/// global page-map (`pagemap.rs`), never through bytes stored in the
/// block.
#[repr(transparent)]
pub struct Block {
    pub next: usize,
}

/// Result of deciding what should happen to an emptied page (see
/// `page::retire_decision`); the exact numeric thresholds are tunable
/// (distilled spec's Open Question #1) but the three-way shape is not.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetireDecision {
    /// Keep it on the bin queue, counting down `retire_expire`.
    Retire,
    /// Hand it to the arena immediately (huge/singleton pages, or a
    /// retired page whose countdown reached zero).
    FreeToArena,
}
