//! Allocation statistics.
//!
//! Counters are plain relaxed atomics per §5 of the specification
//! ("Statistics use relaxed atomics on 64-bit counters"); nothing here
//! participates in synchronizing allocator state, it only observes it.

use core::sync::atomic::{AtomicI64, AtomicU64, Ordering};

#[derive(Default)]
pub struct StatCount {
    pub allocated: AtomicI64,
    pub freed: AtomicI64,
    pub peak: AtomicI64,
    pub current: AtomicI64,
}

impl StatCount {
    pub const fn new() -> StatCount {
        StatCount {
            allocated: AtomicI64::new(0),
            freed: AtomicI64::new(0),
            peak: AtomicI64::new(0),
            current: AtomicI64::new(0),
        }
    }
}

#[derive(Default)]
pub struct StatCounter {
    pub total: AtomicI64,
    pub count: AtomicI64,
}

impl StatCounter {
    pub const fn new() -> StatCounter {
        StatCounter {
            total: AtomicI64::new(0),
            count: AtomicI64::new(0),
        }
    }

    pub fn increment(&self, amount: i64) {
        self.total.fetch_add(amount, Ordering::Relaxed);
        self.count.fetch_add(1, Ordering::Relaxed);
    }
}

pub struct Stats {
    pub arenas: StatCount,
    pub pages: StatCount,
    pub reserved: StatCount,
    pub committed: StatCount,
    pub reset: StatCount,
    pub page_committed: StatCount,
    pub pages_abandoned: StatCount,
    pub pages_extended: StatCount,
    pub pages_retired: StatCount,
    pub mmap_calls: StatCount,
    pub commit_calls: StatCount,
    pub purges: StatCount,
    pub threads: StatCount,
    pub huge: StatCount,
    pub malloc: StatCount,
    pub malloc_requested: AtomicU64,
    pub searches: StatCounter,
    pub arena_rotations: StatCounter,
}

impl Stats {
    pub const fn new() -> Stats {
        Stats {
            arenas: StatCount::new(),
            pages: StatCount::new(),
            reserved: StatCount::new(),
            committed: StatCount::new(),
            reset: StatCount::new(),
            page_committed: StatCount::new(),
            pages_abandoned: StatCount::new(),
            pages_extended: StatCount::new(),
            pages_retired: StatCount::new(),
            mmap_calls: StatCount::new(),
            commit_calls: StatCount::new(),
            purges: StatCount::new(),
            threads: StatCount::new(),
            huge: StatCount::new(),
            malloc: StatCount::new(),
            malloc_requested: AtomicU64::new(0),
            searches: StatCounter::new(),
            arena_rotations: StatCounter::new(),
        }
    }

    /// Merge a thread's local counters into the global totals when the
    /// thread exits (`heap_done` / `thread_done`).
    pub fn merge_into(&self, global: &Stats) {
        macro_rules! merge_count {
            ($field:ident) => {
                let allocated = self.$field.allocated.load(Ordering::Relaxed);
                let freed = self.$field.freed.load(Ordering::Relaxed);
                if allocated != 0 {
                    global.$field.allocated.fetch_add(allocated, Ordering::Relaxed);
                }
                if freed != 0 {
                    global.$field.freed.fetch_add(freed, Ordering::Relaxed);
                }
            };
        }
        merge_count!(arenas);
        merge_count!(pages);
        merge_count!(reserved);
        merge_count!(committed);
        merge_count!(reset);
        merge_count!(page_committed);
        merge_count!(pages_abandoned);
        merge_count!(pages_extended);
        merge_count!(pages_retired);
        merge_count!(mmap_calls);
        merge_count!(commit_calls);
        merge_count!(purges);
        merge_count!(threads);
        merge_count!(huge);
        merge_count!(malloc);
    }
}

#[inline]
pub fn stat_increase(stat: &StatCount, amount: i64) {
    stat_update(stat, amount);
}

#[inline]
pub fn stat_decrease(stat: &StatCount, amount: i64) {
    stat_update(stat, -amount);
}

fn stat_update(stat: &StatCount, amount: i64) {
    if amount == 0 {
        return;
    }
    let current = stat.current.fetch_add(amount, Ordering::Relaxed) + amount;
    // Ordering::Relaxed: peak is an approximate high-water mark, not a
    // synchronization point, so a racy read-then-CAS is acceptable.
    let mut old_peak = stat.peak.load(Ordering::Relaxed);
    while current > old_peak {
        match stat.peak.compare_exchange_weak(
            old_peak,
            current,
            Ordering::Relaxed,
            Ordering::Relaxed,
        ) {
            Ok(_) => break,
            Err(observed) => old_peak = observed,
        }
    }
    if amount > 0 {
        stat.allocated.fetch_add(amount, Ordering::Relaxed);
    } else {
        stat.freed.fetch_add(-amount, Ordering::Relaxed);
    }
}

static GLOBAL_STATS: Stats = Stats::new();

/// The process-wide aggregate stats instance. Per-thread `Tld::stats`
/// (see `init.rs`) are merged into this one when a thread exits.
pub fn global() -> &'static Stats {
    &GLOBAL_STATS
}

/// Render a short human-readable dump, used by the `show_stats`/`verbose`
/// options at `process_done` and available to the C-compat layer.
pub fn print(stats: &Stats) {
    log::info!(
        "stats: arenas={} pages={} reserved={}B committed={}B malloc_requested={}B",
        stats.arenas.current.load(Ordering::Relaxed),
        stats.pages.current.load(Ordering::Relaxed),
        stats.reserved.current.load(Ordering::Relaxed),
        stats.committed.current.load(Ordering::Relaxed),
        stats.malloc_requested.load(Ordering::Relaxed),
    );
}
