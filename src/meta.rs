//! Meta-data allocation: backing store for arena descriptors, bitmap
//! chunk arrays, and page-map regions.
//!
//! These bookkeeping structures must never be served by the arena/page
//! machinery they themselves implement (that would be a bootstrapping
//! cycle), so they go straight to the OS, mirroring `arena-meta.c` in the
//! original source.

use crate::memid::Memid;
use crate::os;
use crate::stats;

/// Allocate `size` bytes of zero-initialized, OS-backed meta storage.
/// Returns `None` on OS allocation failure.
pub fn alloc_zeroed(size: usize) -> Option<*mut u8> {
    if size == 0 {
        return None;
    }
    let stats = stats::global();
    let (p, memid) = os::os_alloc(size, stats)?;
    if !memid.initially_zero {
        unsafe { core::ptr::write_bytes(p, 0, size) };
    }
    Some(p)
}

/// Free a region previously returned by `alloc_zeroed`.
///
/// # Safety
/// `p`/`size` must match a prior `alloc_zeroed` call exactly, and no
/// other reference to the region may remain live.
pub unsafe fn free(p: *mut u8, size: usize) {
    if p.is_null() || size == 0 {
        return;
    }
    os::os_free(p, size, Memid::for_meta(), stats::global());
}
