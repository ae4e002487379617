//! Time source for the rolling-window policies.
//!
//! The breaker and the retry budget only ever compare instants against each
//! other, so a process-local millisecond counter from an arbitrary epoch is
//! enough. Keeping it an enum (rather than a trait object) means the
//! policies stay `Clone` without an extra allocation, and tests get a
//! hand-cranked variant with no trait plumbing.

use std::time::Instant;

#[derive(Debug, Clone)]
pub enum TimeSource {
    /// Milliseconds elapsed since the source was created.
    Monotonic(Instant),
    /// Advances only when a test turns the hand.
    #[cfg(test)]
    Manual(std::sync::Arc<std::sync::atomic::AtomicU64>),
}

impl TimeSource {
    pub fn monotonic() -> Self {
        Self::Monotonic(Instant::now())
    }

    pub fn now_millis(&self) -> u64 {
        match self {
            Self::Monotonic(epoch) => epoch.elapsed().as_millis() as u64,
            #[cfg(test)]
            Self::Manual(now) => now.load(std::sync::atomic::Ordering::SeqCst),
        }
    }
}

#[cfg(test)]
pub mod testing {
    use super::TimeSource;
    use std::sync::atomic::{AtomicU64, Ordering};
    use std::sync::Arc;

    /// Hand-cranked time for deterministic window tests. Clones share the
    /// same hand, so a test can keep one and give sources to each policy.
    #[derive(Debug, Clone, Default)]
    pub struct ManualTime {
        now: Arc<AtomicU64>,
    }

    impl ManualTime {
        pub fn new() -> Self {
            Self::default()
        }

        pub fn advance(&self, millis: u64) {
            self.now.fetch_add(millis, Ordering::SeqCst);
        }

        pub fn source(&self) -> TimeSource {
            TimeSource::Manual(self.now.clone())
        }
    }

    #[test]
    fn manual_time_stands_still_until_advanced() {
        let time = ManualTime::new();
        let source = time.source();
        assert_eq!(source.now_millis(), 0);
        time.advance(250);
        assert_eq!(source.now_millis(), 250);
        // A second source from the same hand sees the same instant.
        assert_eq!(time.source().now_millis(), 250);
    }
}
