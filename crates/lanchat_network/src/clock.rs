//! Timestamps for locally authored messages.

use std::fmt;
use std::sync::atomic::{AtomicI64, Ordering};

/// Hands out Unix timestamps (whole seconds) that never go backwards within
/// a session, even if the wall clock is stepped back.
pub struct ClockStamp {
    source: Box<dyn Fn() -> i64 + Send + Sync>,
    last: AtomicI64,
}

impl ClockStamp {
    /// A clock backed by the system wall clock.
    pub fn system() -> Self {
        Self::from_fn(|| chrono::Utc::now().timestamp())
    }

    /// A clock backed by an arbitrary time source.
    pub fn from_fn(source: impl Fn() -> i64 + Send + Sync + 'static) -> Self {
        Self {
            source: Box::new(source),
            last: AtomicI64::new(i64::MIN),
        }
    }

    /// A clock that always reads `timestamp`.
    pub fn fixed(timestamp: i64) -> Self {
        Self::from_fn(move || timestamp)
    }

    /// Current timestamp, clamped to be no earlier than any previous stamp.
    pub fn stamp(&self) -> i64 {
        let now = (self.source)();
        let previous = self.last.fetch_max(now, Ordering::AcqRel);
        previous.max(now)
    }
}

impl Default for ClockStamp {
    fn default() -> Self {
        Self::system()
    }
}

impl fmt::Debug for ClockStamp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ClockStamp")
            .field("last", &self.last.load(Ordering::Acquire))
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn test_system_clock_is_close_to_now() {
        let clock = ClockStamp::system();
        let now = chrono::Utc::now().timestamp();
        let stamp = clock.stamp();
        assert!((stamp - now).abs() <= 1);
    }

    #[test]
    fn test_fixed_clock() {
        let clock = ClockStamp::fixed(42);
        assert_eq!(clock.stamp(), 42);
        assert_eq!(clock.stamp(), 42);
    }

    #[test]
    fn test_stamp_never_goes_backwards() {
        let readings = Arc::new(parking_lot::Mutex::new(vec![100, 90, 120, 110]));
        let source = Arc::clone(&readings);
        let clock = ClockStamp::from_fn(move || source.lock().remove(0));

        assert_eq!(clock.stamp(), 100);
        assert_eq!(clock.stamp(), 100);
        assert_eq!(clock.stamp(), 120);
        assert_eq!(clock.stamp(), 120);
    }
}
