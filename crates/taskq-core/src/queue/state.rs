//! Queue lifecycle state machine.

use serde::{Deserialize, Serialize};

/// Lifecycle state of a [`TaskQueue`](super::TaskQueue).
///
/// State transitions:
/// - Pending -> Running (start)
/// - Running -> Paused (pause) -> Running (resume)
/// - Running -> Finished (everything settled)
/// - Running | Paused -> Aborted (abort, or a fatal task error)
/// - Running | Paused -> Finished (clear)
/// - Finished | Aborted -> Running (start, retry, or push onto a finished queue)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QueueState {
    /// Constructed, never started.
    Pending,

    /// Dispatching work.
    Running,

    /// Dispatch suspended; in-flight handlers keep running but their results are held back.
    Paused,

    /// Everything settled.
    Finished,

    /// Stopped by `abort()` or a fatal task error.
    Aborted,
}

impl QueueState {
    /// Can `start()` move the queue into `Running` from here?
    pub fn is_startable(self) -> bool {
        matches!(
            self,
            QueueState::Pending | QueueState::Finished | QueueState::Aborted
        )
    }

    /// Is the queue currently between `start()` and a terminal state?
    pub fn is_active(self) -> bool {
        matches!(self, QueueState::Running | QueueState::Paused)
    }
}
