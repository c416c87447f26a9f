//! Scheduling priority bands.

use core::fmt;

/// The scheduling band a job runs in.
///
/// There are exactly two bands. Within a band, jobs run in strict FIFO
/// order; across bands, the normal band is drained (up to the per-cycle
/// fairness cap) before the low band is considered.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum Priority {
    /// The default band.
    #[default]
    Normal,
    /// Runs only when the normal band is empty or capped out.
    Low,
}

impl Priority {
    /// Returns true for the low band.
    #[must_use]
    pub const fn is_low(self) -> bool {
        matches!(self, Self::Low)
    }
}

impl fmt::Display for Priority {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Normal => write!(f, "normal"),
            Self::Low => write!(f, "low"),
        }
    }
}
