// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

// Copyright 2025 Nicflow Contributors

//! Moments in monotonic time.

use core::ops::Add;
use core::time::Duration;
use std::time::Instant;

/// The number of milliseconds in a second.
pub const MILLIS: u64 = 1_000;
/// The number of nanoseconds in a second.
pub const NANOS: u64 = 1_000_000_000;
/// The conversion from nanoseconds to milliseconds.
pub const NANOS_TO_MILLIS: u64 = NANOS / MILLIS;

/// A moment in time.
#[derive(Clone, Copy, Debug, Eq, Ord, PartialEq, PartialOrd)]
pub struct Moment {
    inner: Instant,
}

impl Add<Duration> for Moment {
    type Output = Self;

    fn add(self, rhs: Duration) -> Self {
        Self { inner: self.inner + rhs }
    }
}

impl Moment {
    /// Compute the delta between `now - earlier` in milliseconds.
    ///
    /// If `earlier` is actually later than `self`, the delta is zero.
    pub fn delta_as_millis(&self, earlier: Moment) -> u64 {
        let delta = self.inner.saturating_duration_since(earlier.inner);
        delta.as_secs() * MILLIS
            + u64::from(delta.subsec_nanos()) / NANOS_TO_MILLIS
    }

    pub fn now() -> Self {
        Self { inner: Instant::now() }
    }

    pub fn elapsed_millis(&self) -> u64 {
        Self::now().delta_as_millis(*self)
    }
}
