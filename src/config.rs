//! Scheduler configuration.
//!
//! The recognized options set. Values are fixed at scheduler construction.
//!
//! # Defaults
//!
//! | Field | Default |
//! |-------|---------|
//! | `record_backtraces` | false |
//! | `check_invariants` | false |
//! | `detect_invalid_access_from_thread` | false |
//! | `max_num_jobs_per_priority_per_cycle` | 500 |
//! | `timing_wheel` | 4 levels x 256 slots, 1us base resolution |

use crate::time::wheel::TimingWheelConfig;

/// Configuration for a [`Scheduler`](crate::runtime::Scheduler).
#[derive(Debug, Clone)]
pub struct Config {
    /// Capture logical call-site history in execution contexts.
    pub record_backtraces: bool,
    /// Run consistency checks over queues and wheel at the end of each cycle.
    pub check_invariants: bool,
    /// Panic when a scheduler handle is used from a foreign thread.
    ///
    /// The kernel's handles are not `Send`, so the compiler rules out most
    /// cross-thread misuse statically; this adds a runtime owner-thread
    /// check for the entry points that remain reachable through raw
    /// embeddings.
    pub detect_invalid_access_from_thread: bool,
    /// Fairness cap: jobs run per priority band per cycle.
    pub max_num_jobs_per_priority_per_cycle: usize,
    /// Timing-wheel level widths, base resolution, and horizon.
    pub timing_wheel: TimingWheelConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            record_backtraces: false,
            check_invariants: false,
            detect_invalid_access_from_thread: false,
            max_num_jobs_per_priority_per_cycle: 500,
            timing_wheel: TimingWheelConfig::default(),
        }
    }
}

impl Config {
    /// Creates a configuration with default values.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Enables logical call-site capture in contexts.
    #[must_use]
    pub fn record_backtraces(mut self, enabled: bool) -> Self {
        self.record_backtraces = enabled;
        self
    }

    /// Enables expensive per-cycle consistency checks.
    #[must_use]
    pub fn check_invariants(mut self, enabled: bool) -> Self {
        self.check_invariants = enabled;
        self
    }

    /// Enables the runtime owner-thread check.
    #[must_use]
    pub fn detect_invalid_access_from_thread(mut self, enabled: bool) -> Self {
        self.detect_invalid_access_from_thread = enabled;
        self
    }

    /// Sets the per-band fairness cap. A cap of zero is treated as 1.
    #[must_use]
    pub fn max_num_jobs_per_priority_per_cycle(mut self, cap: usize) -> Self {
        self.max_num_jobs_per_priority_per_cycle = cap.max(1);
        self
    }

    /// Sets the timing-wheel configuration.
    #[must_use]
    pub fn timing_wheel(mut self, wheel: TimingWheelConfig) -> Self {
        self.timing_wheel = wheel;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults() {
        let config = Config::default();
        assert!(!config.record_backtraces);
        assert!(!config.check_invariants);
        assert_eq!(config.max_num_jobs_per_priority_per_cycle, 500);
    }

    #[test]
    fn builder_chain() {
        let config = Config::new()
            .record_backtraces(true)
            .check_invariants(true)
            .max_num_jobs_per_priority_per_cycle(0);
        assert!(config.record_backtraces);
        assert!(config.check_invariants);
        assert_eq!(config.max_num_jobs_per_priority_per_cycle, 1);
    }
}
