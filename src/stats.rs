//! Lightweight atomic counters for the subsystems this allocator actually
//! maintains: allocated/freed/peak/current per subsystem, updated via
//! `fetch_add` with a peak chase on top of `fetch_max`.

use std::sync::atomic::{AtomicI64, Ordering};

#[derive(Default)]
pub struct StatCount {
    pub allocated: AtomicI64,
    pub freed: AtomicI64,
    pub peak: AtomicI64,
    pub current: AtomicI64,
}

impl StatCount {
    pub const fn new() -> Self {
        StatCount {
            allocated: AtomicI64::new(0),
            freed: AtomicI64::new(0),
            peak: AtomicI64::new(0),
            current: AtomicI64::new(0),
        }
    }

    pub fn increase(&self, amount: i64) {
        self.update(amount);
    }

    pub fn decrease(&self, amount: i64) {
        self.update(-amount);
    }

    fn update(&self, amount: i64) {
        if amount == 0 {
            return;
        }
        let current = self.current.fetch_add(amount, Ordering::Relaxed) + amount;
        self.peak.fetch_max(current, Ordering::Relaxed);
        if amount > 0 {
            self.allocated.fetch_add(amount, Ordering::Relaxed);
        } else {
            self.freed.fetch_add(-amount, Ordering::Relaxed);
        }
    }
}

/// Process-wide allocator statistics. Every counter is in bytes except
/// `pageref_pages`, which counts 4 KiB metadata pages.
#[derive(Default)]
pub struct Stats {
    /// Bytes handed to callers via the subpage path.
    pub subpage: StatCount,
    /// Bytes handed to callers via the large-object path.
    pub large: StatCount,
    /// Substrate bytes (sbrk'd) currently committed to subpage data pages.
    pub subpage_pages: StatCount,
    /// Substrate bytes (sbrk'd) currently committed to large spans.
    pub large_spans: StatCount,
    /// Page-ref metadata pages sbrk'd from the substrate.
    pub pageref_pages: StatCount,
    /// Page-refs recycled through the reusable pool (as opposed to carved
    /// fresh from a metadata page).
    pub pageref_reused: StatCount,
}

pub static STATS: Stats = Stats {
    subpage: StatCount::new(),
    large: StatCount::new(),
    subpage_pages: StatCount::new(),
    large_spans: StatCount::new(),
    pageref_pages: StatCount::new(),
    pageref_reused: StatCount::new(),
};

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::Ordering;

    #[test]
    fn tracks_current_and_peak() {
        let c = StatCount::new();
        c.increase(100);
        c.increase(50);
        c.decrease(30);
        assert_eq!(c.current.load(Ordering::Relaxed), 120);
        assert_eq!(c.peak.load(Ordering::Relaxed), 150);
        assert_eq!(c.allocated.load(Ordering::Relaxed), 150);
        assert_eq!(c.freed.load(Ordering::Relaxed), 30);
    }
}
