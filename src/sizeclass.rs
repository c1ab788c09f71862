//! Size-class bin computation.
//!
//! Grounded on `original_source/src/page-queue.c`'s `mi_bin`: word-exact
//! bins for the first 8 words, then four sub-bins per power-of-two
//! octave above that (a cheap `bit_length`-based computation, not a
//! table lookup, since this sits on the allocation fast path). `good_size`
//! inverts the same ladder to return a bin's upper-bound representative,
//! the size at which `realloc` can claim "still fits, no copy needed".

use crate::types::{
    INTPTR_SIZE, LARGE_OBJ_SIZE_MAX, SLICE_SIZE, BIN_FULL, BIN_HUGE,
};

const LARGE_WSIZE_MAX: usize = LARGE_OBJ_SIZE_MAX / INTPTR_SIZE;

#[inline]
pub fn wsize_from_size(size: usize) -> usize {
    (size + INTPTR_SIZE - 1) / INTPTR_SIZE
}

/// Smallest word count that still maps to `bin` (inverse of `bin_of_wsize`
/// for `bin > 8`); used both to compute `bin_of_wsize` itself conceptually
/// and to derive `good_size`'s upper bound for a bin.
fn bin_wsize_min(bin: usize) -> usize {
    if bin <= 8 {
        return bin.max(1);
    }
    let b3 = bin + 3;
    let b = b3 >> 2;
    let q = b3 & 3;
    let w = (1usize << b) + (q << (b - 2));
    w + 1
}

/// Map a word count to its size-class bin (`1..=BIN_HUGE`). Branch-cheap:
/// a short ladder for tiny requests, then a `leading_zeros`-based
/// computation for the rest — no table lookup on the fast path.
#[inline]
pub fn bin_of_wsize(wsize: usize) -> usize {
    if wsize <= 1 {
        1
    } else if wsize <= 8 {
        wsize
    } else if wsize > LARGE_WSIZE_MAX {
        BIN_HUGE
    } else {
        let w = wsize - 1;
        let b = (usize::BITS as usize - 1) - (w.leading_zeros() as usize);
        (((b << 2) | ((w >> (b - 2)) & 0x03)) as usize).saturating_sub(3)
    }
}

#[inline]
pub fn bin_of(size: usize) -> usize {
    bin_of_wsize(wsize_from_size(size))
}

/// Canonical block size for `bin`: the largest size that still maps to
/// it, rounded to a whole number of words. Huge requests (`bin ==
/// BIN_HUGE`) are rounded up to a whole slice instead, since huge pages
/// are singleton arena allocations rather than part of a shared bin.
pub fn good_size(size: usize) -> usize {
    let bin = bin_of(size);
    if bin >= BIN_HUGE {
        return align_up(size, SLICE_SIZE);
    }
    let wsize_max = bin_wsize_min(bin + 1) - 1;
    wsize_max * INTPTR_SIZE
}

/// Canonical block size in bytes for a bin index (`1..=BIN_HUGE`), used
/// when a heap first creates a page for that bin so every block in it is
/// exactly `good_size`-sized.
pub fn block_size_for_bin(bin: usize) -> usize {
    if bin >= BIN_HUGE {
        return 0; // huge pages are sized to the exact request, see heap::page_fresh
    }
    let wsize_max = bin_wsize_min(bin + 1) - 1;
    wsize_max * INTPTR_SIZE
}

fn align_up(n: usize, align: usize) -> usize {
    (n + align - 1) / align * align
}

#[inline]
pub fn is_large_or_huge_bin(bin: usize) -> bool {
    bin >= BIN_HUGE || bin == BIN_FULL
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn word_exact_bins_for_tiny_sizes() {
        for w in 1..=8 {
            assert_eq!(bin_of_wsize(w), w.max(1));
        }
    }

    #[test]
    fn bin_is_monotonic() {
        let mut last = 0;
        for wsize in 1..4096 {
            let b = bin_of_wsize(wsize);
            assert!(b >= last);
            last = b;
        }
    }

    #[test]
    fn good_size_covers_the_request() {
        for size in [1usize, 7, 8, 9, 24, 100, 1000, 65536, 1_000_000] {
            let gs = good_size(size);
            assert!(gs >= size, "good_size({}) = {} too small", size, gs);
            assert_eq!(bin_of(gs).min(BIN_HUGE), bin_of(size).min(BIN_HUGE));
        }
    }

    #[test]
    fn huge_bin_past_large_max() {
        assert_eq!(bin_of(LARGE_OBJ_SIZE_MAX + 1), BIN_HUGE);
    }
}
