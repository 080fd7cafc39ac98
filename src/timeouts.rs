// Simulator UDP circuits for virtual-world clients driven by a poll reactor.
//
// SPDX-License-Identifier: Apache-2.0
//
// Written in 2021-2025 by
//     Dr. Maxim Orlovsky <orlovsky@ubideco.org>
//     Alexis Sellier <alexis@cloudhead.io>
//
// Copyright 2022-2025 UBIDECO Labs, InDCS, Lugano, Switzerland. All Rights reserved.
// Copyright 2021-2023 Alexis Sellier <alexis@cloudhead.io>. All Rights reserved.
//
// Licensed under the Apache License, Version 2.0 (the "License"); you may not use this file except
// in compliance with the License. You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software distributed under the License
// is distributed on an "AS IS" BASIS, WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express
// or implied. See the License for the specific language governing permissions and limitations under
// the License.

use std::collections::BTreeSet;
use std::ops::{Add, AddAssign, Sub, SubAssign};
use std::time::{Duration, SystemTime};

/// UNIX timestamp with millisecond resolution which helps working with absolute time.
#[derive(Wrapper, WrapperMut, Copy, Clone, Ord, PartialOrd, Eq, PartialEq, Hash, Debug, From)]
#[wrapper(Display, LowerHex, UpperHex, Octal, Add, Sub)]
#[wrapper_mut(AddAssign, SubAssign)]
pub struct Timestamp(u64);

impl Timestamp {
    /// Creates timestamp matching the current moment.
    pub fn now() -> Self {
        let duration = SystemTime::now()
            .duration_since(SystemTime::UNIX_EPOCH)
            .unwrap_or(Duration::ZERO);
        Self(duration.as_millis() as u64)
    }

    /// Constructs timestamp from the number of milliseconds since UNIX epoch.
    pub const fn from_millis(millis: u64) -> Self { Self(millis) }

    /// Converts into number of milliseconds since UNIX epoch.
    pub fn into_millis(self) -> u64 { self.0 }

    /// Time passed since `earlier`, saturating to zero if `earlier` is in the future.
    pub fn duration_since(self, earlier: Timestamp) -> Duration {
        Duration::from_millis(self.0.saturating_sub(earlier.0))
    }
}

impl Add<Duration> for Timestamp {
    type Output = Timestamp;

    fn add(self, rhs: Duration) -> Self::Output { Timestamp(self.0 + rhs.as_millis() as u64) }
}

impl Sub<Duration> for Timestamp {
    type Output = Timestamp;

    fn sub(self, rhs: Duration) -> Self::Output {
        Timestamp(self.0.saturating_sub(rhs.as_millis() as u64))
    }
}

impl AddAssign<Duration> for Timestamp {
    fn add_assign(&mut self, rhs: Duration) { self.0 += rhs.as_millis() as u64 }
}

impl SubAssign<Duration> for Timestamp {
    fn sub_assign(&mut self, rhs: Duration) { self.0 = self.0.saturating_sub(rhs.as_millis() as u64) }
}

/// Manages timers and triggers timeouts.
#[derive(Debug, Default)]
pub struct Timer {
    /// Timeouts are durations since the UNIX epoch.
    timeouts: BTreeSet<Timestamp>,
}

impl Timer {
    /// Create a new timer.
    pub fn new() -> Self { Self { timeouts: bset! {} } }

    /// Return the number of timeouts being tracked.
    pub fn len(&self) -> usize { self.timeouts.len() }

    /// Check whether there are timeouts being tracked.
    pub fn is_empty(&self) -> bool { self.timeouts.is_empty() }

    /// Register a new timeout firing `span` after the provided moment.
    pub fn set_timeout(&mut self, span: Duration, after: Timestamp) {
        self.timeouts.insert(after + span);
    }

    /// Get the minimum time duration we should wait for at least one timeout
    /// to be reached. Returns `None` if there are no timeouts; returns zero
    /// duration if some timeout is already overdue.
    ///
    /// ```
    /// # use std::time::Duration;
    /// use simconn::{Timer, Timestamp};
    ///
    /// let mut tm = Timer::new();
    ///
    /// let now = Timestamp::from_millis(1_000_000);
    /// tm.set_timeout(Duration::from_millis(1600), now);
    /// tm.set_timeout(Duration::from_millis(800), now);
    /// tm.set_timeout(Duration::from_millis(6400), now);
    ///
    /// // We need to wait 800 ms to trigger the next timeout.
    /// assert_eq!(tm.next_expiring_from(now), Some(Duration::from_millis(800)));
    ///
    /// // ... sleep for 100 ms ...
    /// let now = now + Duration::from_millis(100);
    ///
    /// // Now we don't need to wait as long!
    /// assert_eq!(tm.next_expiring_from(now), Some(Duration::from_millis(700)));
    /// ```
    pub fn next_expiring_from(&self, after: impl Into<Timestamp>) -> Option<Duration> {
        let after = after.into();
        self.timeouts.iter().next().map(|t| t.duration_since(after))
    }

    /// Removes timers which has fired before or at a certain time, returning their count.
    pub fn remove_expired_by(&mut self, time: Timestamp) -> usize {
        // `split_off` keeps the key itself in the returned part; shifting by one
        // millisecond makes a timer set for exactly `time` expire.
        let at = Timestamp(time.0 + 1);
        let unexpired = self.timeouts.split_off(&at);
        let fired = self.timeouts.len();
        self.timeouts = unexpired;
        fired
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_wake_exact() {
        let mut tm = Timer::new();

        let now = Timestamp::now();
        tm.set_timeout(Duration::from_millis(8), now);
        tm.set_timeout(Duration::from_millis(9), now);
        tm.set_timeout(Duration::from_millis(10), now);

        assert_eq!(tm.remove_expired_by(now + Duration::from_millis(9)), 2);
        assert_eq!(tm.len(), 1);
    }

    #[test]
    fn test_wake() {
        let mut tm = Timer::new();

        let now = Timestamp::now();
        tm.set_timeout(Duration::from_secs(8), now);
        tm.set_timeout(Duration::from_secs(16), now);
        tm.set_timeout(Duration::from_secs(64), now);
        tm.set_timeout(Duration::from_secs(72), now);

        assert_eq!(tm.remove_expired_by(now), 0);
        assert_eq!(tm.len(), 4);

        assert_eq!(tm.remove_expired_by(now + Duration::from_secs(9)), 1);
        assert_eq!(tm.len(), 3, "one timeout has expired");

        assert_eq!(tm.remove_expired_by(now + Duration::from_secs(66)), 2);
        assert_eq!(tm.len(), 1, "another two timeouts have expired");

        assert_eq!(tm.remove_expired_by(now + Duration::from_secs(96)), 1);
        assert!(tm.is_empty(), "all timeouts have expired");
    }

    #[test]
    fn overdue_timer_needs_no_wait() {
        let mut tm = Timer::new();
        let now = Timestamp::from_millis(10_000);
        tm.set_timeout(Duration::from_millis(50), now);

        assert_eq!(tm.next_expiring_from(now + Duration::from_secs(1)), Some(Duration::ZERO));
        assert_eq!(Timer::new().next_expiring_from(now), None);
    }

    #[test]
    fn millisecond_arithmetics() {
        let mut ts = Timestamp::from_millis(1_500);
        ts += Duration::from_millis(250);
        assert_eq!(ts.into_millis(), 1_750);
        ts -= Duration::from_secs(1);
        assert_eq!(ts, Timestamp::from_millis(750));
        assert_eq!((ts - Duration::from_secs(5)).into_millis(), 0);
        assert_eq!(Timestamp::from_millis(900).duration_since(ts), Duration::from_millis(150));
        assert_eq!(ts.duration_since(Timestamp::from_millis(900)), Duration::ZERO);
    }
}
