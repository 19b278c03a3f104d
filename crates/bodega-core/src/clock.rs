//! Lamport logical clock for distributed event ordering

use std::sync::atomic::{AtomicU64, Ordering};

/// A monotonically non-decreasing logical clock
///
/// Every outgoing message carries `tick()`; every incoming message triggers
/// `update(timestamp)` before its payload is interpreted.
#[derive(Debug, Default)]
pub struct LamportClock {
    time: AtomicU64,
}

impl LamportClock {
    pub fn new() -> Self {
        Self {
            time: AtomicU64::new(0),
        }
    }

    /// Increment the clock for a local event and return the new value
    pub fn tick(&self) -> u64 {
        self.time.fetch_add(1, Ordering::SeqCst) + 1
    }

    /// Merge a received timestamp: the clock becomes `max(local, received) + 1`
    pub fn update(&self, received: u64) -> u64 {
        self.time
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |current| {
                Some(current.max(received) + 1)
            })
            .map(|previous| previous.max(received) + 1)
            .unwrap_or_else(|previous| previous)
    }

    /// Read without mutation (diagnostics only)
    pub fn peek(&self) -> u64 {
        self.time.load(Ordering::SeqCst)
    }
}

impl std::fmt::Display for LamportClock {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "LamportClock{{time={}}}", self.peek())
    }
}
