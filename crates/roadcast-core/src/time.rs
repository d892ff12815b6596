//! Injected clock abstraction
//!
//! All time-dependent components take an `Arc<dyn Clock>` so tests can drive
//! time deterministically. The system clock is the only implementation used
//! in production.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Instant, SystemTime, UNIX_EPOCH};

/// Milliseconds since some epoch. System timestamps are since the Unix
/// epoch; monotonic timestamps are since an arbitrary process-local origin.
pub type Timestamp = u64;

/// Source of system and monotonic time in milliseconds.
pub trait Clock: Send + Sync {
    /// Wall-clock time since the Unix epoch.
    fn system_time_since_epoch_ms(&self) -> Timestamp;

    /// Monotonic time, unaffected by wall-clock adjustments.
    fn monotonic_time_since_epoch_ms(&self) -> Timestamp;
}

/// Production clock backed by `SystemTime` and `Instant`.
pub struct SystemClock {
    origin: Instant,
}

impl SystemClock {
    pub fn new() -> Self {
        Self {
            origin: Instant::now(),
        }
    }
}

impl Default for SystemClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for SystemClock {
    fn system_time_since_epoch_ms(&self) -> Timestamp {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_millis() as Timestamp)
            .unwrap_or(0)
    }

    fn monotonic_time_since_epoch_ms(&self) -> Timestamp {
        self.origin.elapsed().as_millis() as Timestamp
    }
}

/// Manually advanced clock for tests. Both time bases move together.
pub struct TestClock {
    system_ms: AtomicU64,
    monotonic_ms: AtomicU64,
}

impl TestClock {
    pub fn new(start_ms: Timestamp) -> Self {
        Self {
            system_ms: AtomicU64::new(start_ms),
            monotonic_ms: AtomicU64::new(start_ms),
        }
    }

    pub fn advance_ms(&self, delta: u64) {
        self.system_ms.fetch_add(delta, Ordering::SeqCst);
        self.monotonic_ms.fetch_add(delta, Ordering::SeqCst);
    }
}

impl Clock for TestClock {
    fn system_time_since_epoch_ms(&self) -> Timestamp {
        self.system_ms.load(Ordering::SeqCst)
    }

    fn monotonic_time_since_epoch_ms(&self) -> Timestamp {
        self.monotonic_ms.load(Ordering::SeqCst)
    }
}
