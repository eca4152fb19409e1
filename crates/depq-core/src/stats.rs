//! Queue statistics.

use serde::{Deserialize, Serialize};

/// Counts exposed by every queue implementation.
///
/// `running` counts jobs that are in progress and not completed;
/// `completed` is always `total - pending`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueStats {
    pub running: usize,
    pub completed: usize,
    pub pending: usize,
    pub total: usize,
}

impl QueueStats {
    /// Build stats from the three counts a store can compute directly.
    pub fn from_counts(total: usize, pending: usize, in_progress: usize) -> Self {
        Self {
            running: in_progress,
            completed: total.saturating_sub(pending),
            pending,
            total,
        }
    }

    pub fn is_drained(&self) -> bool {
        self.pending == 0
    }
}

impl std::fmt::Display for QueueStats {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "total={} pending={} running={} completed={}",
            self.total, self.pending, self.running, self.completed
        )
    }
}
