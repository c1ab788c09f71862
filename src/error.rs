//! Centralized error reporting (spec §7). Every failure path that isn't
//! a normal `None`/`null` return funnels through here instead of
//! scattering ad-hoc `log` calls, so the message format stays
//! consistent and there is one place to extend with a caller-supplied
//! error hook later.
//!
//! Grounded on `original_source/src/options.c`'s `_mi_error_message`/
//! `_mi_warning_message` plumbing, simplified to the `log` crate since
//! this core doesn't expose a custom error-handler registration API.

use core::sync::atomic::{AtomicUsize, Ordering};

/// Bumped on every reported error; lets tests assert "nothing went
/// wrong" without scraping log output.
static ERROR_COUNT: AtomicUsize = AtomicUsize::new(0);

pub fn error_count() -> usize {
    ERROR_COUNT.load(Ordering::Relaxed)
}

fn bump() {
    ERROR_COUNT.fetch_add(1, Ordering::Relaxed);
}

/// The arena or OS layer could not satisfy a reservation/commit request.
/// Every allocation path that returns `null`/`None` because of this
/// should report it here rather than failing silently.
pub fn out_of_memory(context: &str) {
    bump();
    log::warn!("out of memory: {}", context);
}

/// `free`/`realloc` was handed a pointer that doesn't resolve to any
/// live page through the page-map.
pub fn invalid_free(ptr: *mut u8) {
    bump();
    log::warn!("free: {:p} is not a live allocation", ptr);
}

/// The pointer resolves to a live page but isn't aligned to one of its
/// block boundaries (a corrupted pointer, or one that was never
/// returned by this allocator).
pub fn invalid_free_alignment(ptr: *mut u8) {
    bump();
    log::error!("free: {:p} does not land on a block boundary of its page", ptr);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reports_increment_the_counter() {
        let before = error_count();
        out_of_memory("test");
        assert_eq!(error_count(), before + 1);
    }
}
