use thiserror::Error;

/// Classification of a per-task failure.
///
/// - Failed: the handler reported an error (or its future resolved to one).
/// - Panicked: the handler panicked, either while being called or while its future was polled.
/// - Aborted: the attempt was interrupted by `abort()` before it settled.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TaskErrorKind {
    Failed,
    Panicked,
    Aborted,
}

/// Error produced by a single task attempt.
///
/// Cheap to clone: the same error is stored on the failed record and handed to listeners.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{message}")]
pub struct TaskError {
    kind: TaskErrorKind,
    message: String,
}

impl TaskError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            kind: TaskErrorKind::Failed,
            message: message.into(),
        }
    }

    pub fn panicked(message: impl Into<String>) -> Self {
        Self {
            kind: TaskErrorKind::Panicked,
            message: message.into(),
        }
    }

    pub fn aborted(message: impl Into<String>) -> Self {
        Self {
            kind: TaskErrorKind::Aborted,
            message: message.into(),
        }
    }

    pub fn kind(&self) -> TaskErrorKind {
        self.kind
    }

    pub fn message(&self) -> &str {
        &self.message
    }
}

impl From<String> for TaskError {
    fn from(message: String) -> Self {
        Self::new(message)
    }
}

impl From<&str> for TaskError {
    fn from(message: &str) -> Self {
        Self::new(message)
    }
}

/// Errors surfaced by the queue itself (construction and the one-shot helpers).
#[derive(Debug, Error)]
pub enum QueueError {
    #[error("concurrency must be at least 1 (got {0})")]
    InvalidConcurrency(usize),

    #[error("invalid queue options: {0}")]
    InvalidOptions(#[from] serde_json::Error),

    #[error("task failed: {0}")]
    TaskFailed(TaskError),

    #[error("queue aborted")]
    Aborted,
}

impl QueueError {
    /// Map the reason carried by an `abort` event to the error reported to callers.
    pub(crate) fn from_abort(reason: Option<&TaskError>) -> Self {
        match reason {
            Some(err) => QueueError::TaskFailed(err.clone()),
            None => QueueError::Aborted,
        }
    }
}
