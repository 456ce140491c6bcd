// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

// Copyright 2025 Nicflow Contributors

//! Named counters.
//!
//! Counters are bumped from every worker of a port concurrently, so
//! each one is a relaxed atomic. A snapshot reads every counter
//! individually: the values are each uncorrupted, but taken as a group
//! they may show a process that is only partially completed.

use core::sync::atomic::AtomicU64;
use core::sync::atomic::Ordering::Relaxed;

/// A provider of named counters.
///
/// Rather than implementing this trait manually, derive it with the
/// stat-macro.
///
/// ```ignore
/// #[derive(StatProvider)]
/// struct SomeStats {
///     bytes_out: StatU64,
///     bytes_in: StatU64,
/// }
/// ```
pub trait StatProvider {
    const NUM_FIELDS: u32;
    type Snap;

    fn new() -> Self;

    /// The counter names, in declaration order.
    fn names() -> &'static [&'static str];

    fn num_fields(&self) -> u32 {
        Self::NUM_FIELDS
    }

    /// Return a snapshot of the stats. This is how you obtain a copy,
    /// as opposed to the traditional clone().
    fn snapshot(&self) -> Self::Snap;
}

#[derive(Debug, Default)]
pub struct StatU64(AtomicU64);

impl StatU64 {
    pub const fn new() -> Self {
        Self(AtomicU64::new(0))
    }

    pub fn incr(&self, val: u64) {
        self.0.fetch_add(val, Relaxed);
    }

    /// Decrement, stopping at zero.
    pub fn decr(&self, val: u64) {
        let _ = self
            .0
            .fetch_update(Relaxed, Relaxed, |v| Some(v.saturating_sub(val)));
    }

    pub fn set(&self, val: u64) {
        self.0.store(val, Relaxed);
    }

    pub fn val(&self) -> u64 {
        self.0.load(Relaxed)
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use stat_macro::StatProvider;

    #[derive(StatProvider)]
    struct TestStats {
        hits: StatU64,
        misses: StatU64,
    }

    #[test]
    fn derive_and_snapshot() {
        let stats = TestStats::new();
        stats.hits.incr(3);
        stats.misses.incr(1);
        stats.misses.decr(5);

        let snap = stats.snapshot();
        assert_eq!(snap, TestStatsSnap { hits: 3, misses: 0 });
        assert_eq!(TestStats::names(), &["hits", "misses"]);
        assert_eq!(stats.num_fields(), 2);
    }
}
