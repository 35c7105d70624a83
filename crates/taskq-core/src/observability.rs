use serde::{Deserialize, Serialize};

use crate::queue::QueueState;

/// Consistent snapshot of a queue's bookkeeping, taken under a single lock.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueCounts {
    pub state: QueueState,
    pub total: usize,
    pub processed: usize,
    pub pending: usize,
    pub running: usize,
    pub failed: usize,
}

impl QueueCounts {
    /// Pending plus running.
    pub fn unprocessed(&self) -> usize {
        self.pending + self.running
    }
}
