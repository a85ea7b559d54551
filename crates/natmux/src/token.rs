//! Monotonic id allocation for tunnels and sessions

use std::sync::atomic::{AtomicU64, Ordering};

/// Thread-safe counter handing out strictly increasing ids starting at 1.
///
/// A server owns one for tunnel ids; every tunnel session owns its own for
/// session ids. Wraparound is not handled.
#[derive(Debug, Default)]
pub struct TokenProducer {
    last: AtomicU64,
}

impl TokenProducer {
    /// Create a producer whose first id is 1
    #[must_use]
    pub const fn new() -> Self {
        Self {
            last: AtomicU64::new(0),
        }
    }

    /// Allocate the next id
    pub fn next(&self) -> u64 {
        self.last.fetch_add(1, Ordering::Relaxed) + 1
    }

    /// The most recently issued id, or 0 if none yet
    #[must_use]
    pub fn current(&self) -> u64 {
        self.last.load(Ordering::Relaxed)
    }
}
