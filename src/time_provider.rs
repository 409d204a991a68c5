//! Time abstraction for testable time-dependent behaviour
//!
//! Envelope timestamps, event timestamps, and the hybrid snapshot policy all
//! read the clock through this trait so tests can pin time without waiting.

use std::sync::{Arc, Mutex};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

/// Source of wall-clock time.
pub trait TimeProvider: Send + Sync + std::fmt::Debug {
    /// Current system time.
    fn now(&self) -> SystemTime;

    /// Current time as milliseconds since the Unix epoch.
    fn now_millis(&self) -> i64 {
        self.now()
            .duration_since(UNIX_EPOCH)
            .map_or(0, |elapsed| i64::try_from(elapsed.as_millis()).unwrap_or(i64::MAX))
    }
}

/// Shared handle to a time provider.
pub type SharedTimeProvider = Arc<dyn TimeProvider>;

/// Real wall-clock time for production use.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemTimeProvider;

impl SystemTimeProvider {
    /// Creates a new system time provider
    #[must_use]
    pub fn new() -> Self {
        Self
    }
}

impl TimeProvider for SystemTimeProvider {
    fn now(&self) -> SystemTime {
        SystemTime::now()
    }
}

/// Manually advanced clock for tests.
#[derive(Debug)]
pub struct ManualTimeProvider {
    now: Mutex<SystemTime>,
}

impl ManualTimeProvider {
    /// Creates a clock pinned at the Unix epoch.
    #[must_use]
    pub fn new() -> Self {
        Self::starting_at(UNIX_EPOCH)
    }

    /// Creates a clock pinned at the given instant.
    #[must_use]
    pub fn starting_at(now: SystemTime) -> Self {
        Self {
            now: Mutex::new(now),
        }
    }

    /// Moves the clock forward.
    pub fn advance(&self, by: Duration) {
        if let Ok(mut now) = self.now.lock() {
            *now += by;
        }
    }
}

impl Default for ManualTimeProvider {
    fn default() -> Self {
        Self::new()
    }
}

impl TimeProvider for ManualTimeProvider {
    fn now(&self) -> SystemTime {
        self.now.lock().map_or(UNIX_EPOCH, |now| *now)
    }
}

/// Creates the production time provider.
#[must_use]
pub fn system_time_provider() -> SharedTimeProvider {
    Arc::new(SystemTimeProvider::new())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn manual_clock_advances_on_demand() {
        let clock = ManualTimeProvider::new();
        assert_eq!(clock.now_millis(), 0);
        clock.advance(Duration::from_millis(1500));
        assert_eq!(clock.now_millis(), 1500);
    }

    #[test]
    fn system_clock_reports_epoch_millis() {
        let clock = SystemTimeProvider::new();
        assert!(clock.now_millis() > 0);
    }
}
