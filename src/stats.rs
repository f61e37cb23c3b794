//! Process-wide (but per-`Engine`-instance) statistics counters.
//!
//! Each [`crate::engine::Engine`] instance owns one `Stats` struct so a
//! single process can host more than one independent cache. Ordering stays
//! `Relaxed` throughout: these counters are observational, never used to
//! synchronize access to other state.

use std::sync::atomic::{AtomicU64, Ordering};

#[derive(Default)]
pub struct Stats {
    pub current_bytes: AtomicU64,
    pub current_items: AtomicU64,
    pub total_items: AtomicU64,
    pub total_evictions: AtomicU64,
    pub get_hits: AtomicU64,
    pub get_misses: AtomicU64,
    pub expired_unlinked: AtomicU64,
    pub cas_hits: AtomicU64,
    pub cas_misses: AtomicU64,
}

#[derive(Debug, Default, Clone, Copy)]
pub struct Snapshot {
    pub current_bytes: u64,
    pub current_items: u64,
    pub total_items: u64,
    pub total_evictions: u64,
    pub get_hits: u64,
    pub get_misses: u64,
    pub expired_unlinked: u64,
    pub cas_hits: u64,
    pub cas_misses: u64,
}

impl Stats {
    pub fn snapshot(&self) -> Snapshot {
        Snapshot {
            current_bytes: self.current_bytes.load(Ordering::Relaxed),
            current_items: self.current_items.load(Ordering::Relaxed),
            total_items: self.total_items.load(Ordering::Relaxed),
            total_evictions: self.total_evictions.load(Ordering::Relaxed),
            get_hits: self.get_hits.load(Ordering::Relaxed),
            get_misses: self.get_misses.load(Ordering::Relaxed),
            expired_unlinked: self.expired_unlinked.load(Ordering::Relaxed),
            cas_hits: self.cas_hits.load(Ordering::Relaxed),
            cas_misses: self.cas_misses.load(Ordering::Relaxed),
        }
    }

    pub fn reset(&self) {
        self.current_items.store(0, Ordering::Relaxed);
        self.total_items.store(0, Ordering::Relaxed);
        self.total_evictions.store(0, Ordering::Relaxed);
        self.get_hits.store(0, Ordering::Relaxed);
        self.get_misses.store(0, Ordering::Relaxed);
        self.expired_unlinked.store(0, Ordering::Relaxed);
        self.cas_hits.store(0, Ordering::Relaxed);
        self.cas_misses.store(0, Ordering::Relaxed);
        // current_bytes is a structural invariant, not a reset-able counter.
    }

    #[inline]
    pub fn inc(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn add(counter: &AtomicU64, val: u64) {
        counter.fetch_add(val, Ordering::Relaxed);
    }

    #[inline]
    pub fn sub(counter: &AtomicU64, val: u64) {
        counter.fetch_sub(val, Ordering::Relaxed);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn snapshot_reflects_increments() {
        let stats = Stats::default();
        Stats::inc(&stats.get_hits);
        Stats::inc(&stats.get_hits);
        Stats::inc(&stats.get_misses);
        let snap = stats.snapshot();
        assert_eq!(snap.get_hits, 2);
        assert_eq!(snap.get_misses, 1);
    }

    #[test]
    fn reset_clears_counters_but_not_bytes() {
        let stats = Stats::default();
        Stats::add(&stats.current_bytes, 100);
        Stats::inc(&stats.get_hits);
        stats.reset();
        let snap = stats.snapshot();
        assert_eq!(snap.get_hits, 0);
        assert_eq!(snap.current_bytes, 100);
    }
}
