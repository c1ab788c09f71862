//! Concurrent bitmap: the primitive arenas use to track per-slice free,
//! committed, dirty, and purge-needed state.
//!
//! Grounded on `original_source/src/bitmap.h`: a two-level structure of
//! 512-bit `Bchunk`s (one cache line of `Bfield` words each) plus a small
//! `chunkmap` bitmap of "this chunk might have a set bit" hints so a scan
//! across thousands of slices doesn't have to touch every chunk.
//!
//! All mutation goes through compare-exchange loops; nothing here takes a
//! lock, and every multi-bit operation that can only partially succeed
//! rolls itself back so the bitmap never observes a torn update.

use core::sync::atomic::{AtomicUsize, Ordering};

use crate::types::BCHUNK_BITS;

pub type Bfield = usize;
pub const BFIELD_BITS: usize = core::mem::size_of::<Bfield>() * 8;
pub const BCHUNK_FIELDS: usize = BCHUNK_BITS / BFIELD_BITS;

/// One cache-line-aligned run of `BCHUNK_BITS` bits.
#[repr(align(64))]
pub struct Bchunk {
    fields: [AtomicUsize; BCHUNK_FIELDS],
}

impl Bchunk {
    pub const fn zeroed() -> Bchunk {
        // Relies on AtomicUsize::new being const; array-of-const-init via
        // a manual unroll would be needed on older Rust, but 2018-edition
        // const generics are out of scope so this goes through a helper.
        Bchunk {
            fields: new_zeroed_fields(),
        }
    }

    #[inline]
    fn field(&self, idx: usize) -> &AtomicUsize {
        &self.fields[idx]
    }
}

const fn new_zeroed_fields() -> [AtomicUsize; BCHUNK_FIELDS] {
    // BCHUNK_FIELDS is fixed (512 bits / word size); write out the common
    // 64-bit (8 words) and 32-bit (16 words) shapes explicitly since const
    // array-init-by-value isn't available pre-const-generics.
    #[cfg(target_pointer_width = "64")]
    {
        [
            AtomicUsize::new(0),
            AtomicUsize::new(0),
            AtomicUsize::new(0),
            AtomicUsize::new(0),
            AtomicUsize::new(0),
            AtomicUsize::new(0),
            AtomicUsize::new(0),
            AtomicUsize::new(0),
        ]
    }
    #[cfg(target_pointer_width = "32")]
    {
        [
            AtomicUsize::new(0),
            AtomicUsize::new(0),
            AtomicUsize::new(0),
            AtomicUsize::new(0),
            AtomicUsize::new(0),
            AtomicUsize::new(0),
            AtomicUsize::new(0),
            AtomicUsize::new(0),
            AtomicUsize::new(0),
            AtomicUsize::new(0),
            AtomicUsize::new(0),
            AtomicUsize::new(0),
            AtomicUsize::new(0),
            AtomicUsize::new(0),
            AtomicUsize::new(0),
            AtomicUsize::new(0),
        ]
    }
}

#[inline]
fn split(idx: usize) -> (usize, usize) {
    (idx / BFIELD_BITS, idx % BFIELD_BITS)
}

/// Outcome of a claim attempt over a run of bits: either the whole run
/// was free and is now claimed, or (on partial overlap) nothing changed.
#[derive(Debug, PartialEq, Eq)]
pub enum ClaimResult {
    Claimed { start: usize },
    NoneFound,
}

/// A flat bitmap over `chunk_count * BCHUNK_BITS` bits, with a chunkmap
/// hint layer on top. `N` chunks are allocated by the caller (via
/// `meta::alloc_zeroed`) alongside this header, matching `mi_bitmap_t`'s
/// "chunks follow the header" layout.
pub struct Bitmap {
    chunk_count: usize,
    chunks: *mut Bchunk,
    /// One bit per chunk: set means "this chunk may have a set bit".
    /// Conservative: a chunkmap bit may be stale-set after the chunk
    /// actually emptied (cleared lazily), but it is never stale-clear
    /// while the chunk is non-empty.
    chunkmap: *mut Bchunk,
    chunkmap_chunks: usize,
}

unsafe impl Send for Bitmap {}
unsafe impl Sync for Bitmap {}

impl Bitmap {
    /// # Safety
    /// `chunks` must point to `chunk_count` live, zero-initialized
    /// `Bchunk`s, and `chunkmap` to `ceil(chunk_count / BCHUNK_BITS)` of
    /// them, both owned for the lifetime of this `Bitmap`.
    pub unsafe fn new(
        chunks: *mut Bchunk,
        chunk_count: usize,
        chunkmap: *mut Bchunk,
    ) -> Bitmap {
        let chunkmap_chunks = (chunk_count + BCHUNK_BITS - 1) / BCHUNK_BITS;
        Bitmap {
            chunk_count,
            chunks,
            chunkmap,
            chunkmap_chunks,
        }
    }

    pub fn bit_count(&self) -> usize {
        self.chunk_count * BCHUNK_BITS
    }

    #[inline]
    unsafe fn chunk(&self, chunk_idx: usize) -> &Bchunk {
        debug_assert!(chunk_idx < self.chunk_count);
        &*self.chunks.add(chunk_idx)
    }

    #[inline]
    fn mark_chunkmap(&self, chunk_idx: usize) {
        let (field, bit) = split(chunk_idx);
        let mask = 1usize << bit;
        let chunkmap_chunk_idx = field / BCHUNK_FIELDS;
        let field_in_chunk = field % BCHUNK_FIELDS;
        unsafe {
            (*self.chunkmap.add(chunkmap_chunk_idx))
                .field(field_in_chunk)
                .fetch_or(mask, Ordering::AcqRel);
        }
    }

    #[inline]
    fn clear_chunkmap_hint(&self, chunk_idx: usize) {
        let (field, bit) = split(chunk_idx);
        let mask = !(1usize << bit);
        let chunkmap_chunk_idx = field / BCHUNK_FIELDS;
        let field_in_chunk = field % BCHUNK_FIELDS;
        unsafe {
            (*self.chunkmap.add(chunkmap_chunk_idx))
                .field(field_in_chunk)
                .fetch_and(mask, Ordering::AcqRel);
        }
    }

    /// Set a single bit; returns the previous value.
    pub fn set(&self, idx: usize) -> bool {
        let (chunk_idx, bit_idx) = split(idx % BCHUNK_BITS + (idx / BCHUNK_BITS) * BCHUNK_BITS);
        let _ = chunk_idx;
        self.set_n(idx, 1)
    }

    /// Clear a single bit; returns the previous value.
    pub fn clear(&self, idx: usize) -> bool {
        self.clear_n(idx, 1)
    }

    pub fn is_set(&self, idx: usize) -> bool {
        self.is_set_n(idx, 1)
    }

    fn locate(&self, idx: usize) -> (usize, usize, usize) {
        let chunk_idx = idx / BCHUNK_BITS;
        let in_chunk = idx % BCHUNK_BITS;
        let (field, bit) = split(in_chunk);
        (chunk_idx, field, bit)
    }

    /// Set `n` contiguous bits starting at `idx` (must not cross a chunk
    /// boundary: callers keep runs within `ARENA_MAX_OBJ_SLICES`).
    /// Returns whether all bits were previously clear.
    pub fn set_n(&self, idx: usize, n: usize) -> bool {
        debug_assert!(n >= 1 && n <= BCHUNK_BITS);
        let (chunk_idx, field_start, bit_start) = self.locate(idx);
        self.mark_chunkmap(chunk_idx);
        let mut all_clear = true;
        let mut remaining = n;
        let mut field = field_start;
        let mut bit = bit_start;
        let chunk = unsafe { self.chunk(chunk_idx) };
        while remaining > 0 {
            let take = (BFIELD_BITS - bit).min(remaining);
            let mask = field_mask(bit, take);
            let old = chunk.field(field).fetch_or(mask, Ordering::AcqRel);
            if old & mask != 0 {
                all_clear = false;
            }
            remaining -= take;
            field += 1;
            bit = 0;
        }
        all_clear
    }

    /// Clear `n` contiguous bits starting at `idx`. Returns whether all
    /// bits were previously set.
    pub fn clear_n(&self, idx: usize, n: usize) -> bool {
        debug_assert!(n >= 1 && n <= BCHUNK_BITS);
        let (chunk_idx, field_start, bit_start) = self.locate(idx);
        let mut all_set = true;
        let mut remaining = n;
        let mut field = field_start;
        let mut bit = bit_start;
        let chunk = unsafe { self.chunk(chunk_idx) };
        while remaining > 0 {
            let take = (BFIELD_BITS - bit).min(remaining);
            let mask = field_mask(bit, take);
            let old = chunk.field(field).fetch_and(!mask, Ordering::AcqRel);
            if old & mask != mask {
                all_set = false;
            }
            remaining -= take;
            field += 1;
            bit = 0;
        }
        // Leave the chunkmap hint set; it is only ever a conservative
        // "maybe non-empty" signal and is cleared lazily by scans that
        // observe a fully-clear chunk (see `try_find_and_clear_n`).
        all_set
    }

    /// Attempt to clear `n` contiguous bits, but only if every one of
    /// them is currently set; otherwise nothing is changed. Used to
    /// release a range that the caller believes it exclusively owns.
    pub fn try_clear_n(&self, idx: usize, n: usize) -> bool {
        debug_assert!(n >= 1 && n <= BCHUNK_BITS);
        if !self.is_set_n(idx, n) {
            return false;
        }
        let (chunk_idx, field_start, bit_start) = self.locate(idx);
        let chunk = unsafe { self.chunk(chunk_idx) };
        let mut remaining = n;
        let mut field = field_start;
        let mut bit = bit_start;
        let mut claimed_fields: [(usize, usize); BCHUNK_FIELDS] = [(0, 0); BCHUNK_FIELDS];
        let mut claimed_len = 0;
        while remaining > 0 {
            let take = (BFIELD_BITS - bit).min(remaining);
            let mask = field_mask(bit, take);
            let old = chunk.field(field).fetch_and(!mask, Ordering::AcqRel);
            if old & mask != mask {
                // Someone else cleared (or never set) part of this range
                // concurrently: roll back everything we already cleared
                // and report failure.
                for &(f, m) in &claimed_fields[..claimed_len] {
                    chunk.field(f).fetch_or(m, Ordering::AcqRel);
                }
                chunk.field(field).fetch_or(old & mask, Ordering::AcqRel);
                return false;
            }
            claimed_fields[claimed_len] = (field, mask);
            claimed_len += 1;
            remaining -= take;
            field += 1;
            bit = 0;
        }
        true
    }

    pub fn is_set_n(&self, idx: usize, n: usize) -> bool {
        self.popcount_n(idx, n) == n
    }

    pub fn is_clear_n(&self, idx: usize, n: usize) -> bool {
        self.popcount_n(idx, n) == 0
    }

    pub fn popcount_n(&self, idx: usize, n: usize) -> usize {
        debug_assert!(n >= 1 && n <= BCHUNK_BITS);
        let (chunk_idx, field_start, bit_start) = self.locate(idx);
        let chunk = unsafe { self.chunk(chunk_idx) };
        let mut remaining = n;
        let mut field = field_start;
        let mut bit = bit_start;
        let mut count = 0usize;
        while remaining > 0 {
            let take = (BFIELD_BITS - bit).min(remaining);
            let mask = field_mask(bit, take);
            let val = chunk.field(field).load(Ordering::Acquire);
            count += (val & mask).count_ones() as usize;
            remaining -= take;
            field += 1;
            bit = 0;
        }
        count
    }

    /// Busy-wait until bit `idx` reads as set, then return. Used by the
    /// abandon/reclaim handshake: the abandoning thread publishes state
    /// before setting the bit, so a spinning reclaimer observing `true`
    /// is guaranteed to see that state too.
    pub fn clear_once_set(&self, idx: usize) {
        while !self.is_set(idx) {
            core::hint::spin_loop();
        }
        self.clear(idx);
    }

    /// Scan for the first run of `n` consecutive set bits anywhere in the
    /// bitmap and atomically claim it (clear those bits). A set bit means
    /// "free"/"reclaimable" throughout this module (see `reserve`'s initial
    /// seeding and `try_clear_n`'s use in `arena::free`), so claiming a run
    /// clears it, mirroring `try_find_and_clear_n`'s polarity.
    pub fn try_find_and_claim(&self, n: usize, start_chunk_hint: usize) -> ClaimResult {
        debug_assert!(n >= 1 && n <= BCHUNK_BITS);
        for offset in 0..self.chunk_count {
            let chunk_idx = (start_chunk_hint + offset) % self.chunk_count;
            if let Some(bit) = self.find_run_in_chunk(chunk_idx, n) {
                let global_idx = chunk_idx * BCHUNK_BITS + bit;
                // Re-validate with try_clear_n: another thread may have
                // claimed part of this exact run since we scanned it, in
                // which case nothing is changed and we keep scanning.
                if self.try_clear_n(global_idx, n) {
                    if self.is_clear_n(chunk_idx * BCHUNK_BITS, BCHUNK_BITS) {
                        self.clear_chunkmap_hint(chunk_idx);
                    }
                    return ClaimResult::Claimed { start: global_idx };
                }
            }
        }
        ClaimResult::NoneFound
    }

    /// Find (without claiming) the bit offset of the first run of `n`
    /// contiguous set bits within one chunk, or `None`.
    fn find_run_in_chunk(&self, chunk_idx: usize, n: usize) -> Option<usize> {
        let chunk = unsafe { self.chunk(chunk_idx) };
        let mut run_start: Option<usize> = None;
        let mut run_len = 0usize;
        for field in 0..BCHUNK_FIELDS {
            let val = chunk.field(field).load(Ordering::Acquire);
            for bit in 0..BFIELD_BITS {
                let global_bit = field * BFIELD_BITS + bit;
                let is_set = (val >> bit) & 1 != 0;
                if is_set {
                    if run_start.is_none() {
                        run_start = Some(global_bit);
                    }
                    run_len += 1;
                    if run_len == n {
                        return run_start;
                    }
                } else {
                    run_start = None;
                    run_len = 0;
                }
            }
        }
        None
    }

    /// Try to clear the first run of up to `n` contiguous set bits
    /// (a short-circuiting sibling of `try_clear_n` used when purging:
    /// any progress is useful, the caller doesn't need an exact `n`).
    pub fn try_find_and_clear_n(&self, max_n: usize) -> Option<(usize, usize)> {
        for chunk_idx in 0..self.chunk_count {
            let chunk = unsafe { self.chunk(chunk_idx) };
            for field in 0..BCHUNK_FIELDS {
                let val = chunk.field(field).load(Ordering::Acquire);
                if val == 0 {
                    continue;
                }
                let bit = val.trailing_zeros() as usize;
                let global_bit = chunk_idx * BCHUNK_BITS + field * BFIELD_BITS + bit;
                let run = max_n.min(BCHUNK_BITS - (field * BFIELD_BITS + bit));
                let mut found = 0;
                while found < run && self.is_set_n(global_bit, found + 1) {
                    found += 1;
                }
                if found > 0 && self.try_clear_n(global_bit, found) {
                    if self.is_clear_n(chunk_idx * BCHUNK_BITS, BCHUNK_BITS) {
                        self.clear_chunkmap_hint(chunk_idx);
                    }
                    return Some((global_bit, found));
                }
            }
        }
        None
    }

    /// Invoke `visit` for every set-bit range in the bitmap, coalescing
    /// adjacent set bits into a single `(start, len)` call. Used for
    /// debug/visit-style enumeration (`heap_visit_blocks`'s page walk
    /// goes through the page-map instead, but purge scanning uses this).
    pub fn forall_set(&self, mut visit: impl FnMut(usize, usize)) {
        for chunk_idx in 0..self.chunk_count {
            let chunk = unsafe { self.chunk(chunk_idx) };
            let mut run_start: Option<usize> = None;
            for field in 0..BCHUNK_FIELDS {
                let val = chunk.field(field).load(Ordering::Acquire);
                for bit in 0..BFIELD_BITS {
                    let global_bit = chunk_idx * BCHUNK_BITS + field * BFIELD_BITS + bit;
                    let is_set = (val >> bit) & 1 != 0;
                    match (is_set, run_start) {
                        (true, None) => run_start = Some(global_bit),
                        (false, Some(s)) => {
                            visit(s, global_bit - s);
                            run_start = None;
                        }
                        _ => {}
                    }
                }
            }
            if let Some(s) = run_start {
                let end = chunk_idx * BCHUNK_BITS + BCHUNK_BITS;
                visit(s, end - s);
            }
        }
    }
}

#[inline]
fn field_mask(bit: usize, len: usize) -> Bfield {
    if len >= BFIELD_BITS {
        !0
    } else {
        ((1usize << len) - 1) << bit
    }
}

/// A bitmap additionally partitioned into per-size-class "bins", used for
/// the arena's `pages_abandoned` tracking (spec §4.3): the same bit space
/// as a plain `Bitmap`, but lookups are scoped to one bin's slice range so
/// a heap only ever reclaims pages that fit its own size classes.
pub struct BBitmap {
    bins: [Bitmap; 1],
}

impl BBitmap {
    /// # Safety
    /// Same obligations as `Bitmap::new`; `BBitmap` currently wraps a
    /// single underlying bitmap and slices it by caller-supplied bin
    /// ranges rather than maintaining separate storage per bin, since the
    /// arena already partitions abandoned-page bits by slice index.
    pub unsafe fn new(chunks: *mut Bchunk, chunk_count: usize, chunkmap: *mut Bchunk) -> BBitmap {
        BBitmap {
            bins: [Bitmap::new(chunks, chunk_count, chunkmap)],
        }
    }

    pub fn bitmap(&self) -> &Bitmap {
        &self.bins[0]
    }
}
