//! Time and timestamp utilities

use std::time::{SystemTime, UNIX_EPOCH};

use parking_lot::Mutex;

use crate::types::Timestamp;

/// Get current Unix time in milliseconds
///
/// A clock set before the epoch reads as zero; the monotonic clock below
/// keeps ordering intact regardless.
pub fn current_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

/// Source of collision-free, strictly increasing change timestamps
///
/// Each reading is the wall clock in milliseconds scaled by
/// [`Timestamp::TICKS_PER_MILLI`]. When the clock has not advanced past the
/// last issued value (same millisecond, or the clock stepped backwards) the
/// last value plus one is issued instead. All readings go through one mutex.
pub struct MonotonicClock {
    last: Mutex<Timestamp>,
    now_millis: fn() -> u64,
}

impl MonotonicClock {
    pub fn new() -> Self {
        Self::starting_after(Timestamp::ZERO)
    }

    /// Clock that never issues a value at or below `floor`
    pub fn starting_after(floor: Timestamp) -> Self {
        Self {
            last: Mutex::new(floor),
            now_millis: current_millis,
        }
    }

    /// Clock reading time from a custom source (frozen clocks in tests)
    pub fn with_source(floor: Timestamp, now_millis: fn() -> u64) -> Self {
        Self {
            last: Mutex::new(floor),
            now_millis,
        }
    }

    /// Issue the next timestamp
    pub fn next(&self) -> Timestamp {
        let mut last = self.last.lock();
        let candidate = Timestamp::from_millis((self.now_millis)());
        let issued = if candidate > *last {
            candidate
        } else {
            last.successor()
        };
        *last = issued;
        issued
    }

    /// Raise the floor (after loading persisted records)
    pub fn observe(&self, seen: Timestamp) {
        let mut last = self.last.lock();
        if seen > *last {
            *last = seen;
        }
    }

    /// Last issued (or observed) timestamp
    pub fn last(&self) -> Timestamp {
        *self.last.lock()
    }
}

impl Default for MonotonicClock {
    fn default() -> Self {
        Self::new()
    }
}
