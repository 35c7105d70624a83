//! Task record: one dispatched attempt of a task.

use std::fmt;

use crate::error::TaskError;

/// Callback that asks an in-flight attempt to stop early. Invoked at most once.
pub type CancelFn = Box<dyn FnOnce() + Send + 'static>;

/// Identity of a single attempt.
///
/// Allocated from a per-queue counter at dispatch time and never reused, so a late
/// settlement can always be told apart from the attempt that replaced it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub(crate) struct RecordId(u64);

impl fmt::Display for RecordId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "record-{}", self.0)
    }
}

/// Monotonic id source owned by one queue.
#[derive(Debug)]
pub(crate) struct IdAllocator {
    next: u64,
}

impl IdAllocator {
    pub(crate) fn new() -> Self {
        Self { next: 1 }
    }

    pub(crate) fn allocate(&mut self) -> RecordId {
        let id = RecordId(self.next);
        self.next += 1;
        id
    }
}

/// An attempt that is either running or sitting in the failed set.
///
/// Design:
/// - A record lives in exactly one of {running, failed}; success discards it.
/// - Automatic retry replaces the record with a fresh one (new id, same task).
pub(crate) struct TaskRecord<T> {
    pub(crate) id: RecordId,
    pub(crate) task: T,

    /// Automatic redispatches after failure so far.
    pub(crate) retried_times: u32,

    /// Present only when the handler returned a cancellable execution.
    pub(crate) cancel: Option<CancelFn>,

    /// Error of the latest attempt (set once the record moves to failed).
    pub(crate) last_error: Option<TaskError>,
}

impl<T> TaskRecord<T> {
    pub(crate) fn new(id: RecordId, task: T, retried_times: u32) -> Self {
        Self {
            id,
            task,
            retried_times,
            cancel: None,
            last_error: None,
        }
    }

    /// Fresh attempt for the same task, counting as one more automatic retry.
    pub(crate) fn redispatch(self, id: RecordId) -> Self {
        Self::new(id, self.task, self.retried_times + 1)
    }

    /// Move to the failed set with the given error.
    pub(crate) fn mark_failed(&mut self, error: TaskError) {
        self.cancel = None;
        self.last_error = Some(error);
    }

    pub(crate) fn take_cancel(&mut self) -> Option<CancelFn> {
        self.cancel.take()
    }
}

impl<T: fmt::Debug> fmt::Debug for TaskRecord<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TaskRecord")
            .field("id", &self.id)
            .field("task", &self.task)
            .field("retried_times", &self.retried_times)
            .field("cancellable", &self.cancel.is_some())
            .field("last_error", &self.last_error)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ids_are_monotonic_and_unique() {
        let mut ids = IdAllocator::new();
        let a = ids.allocate();
        let b = ids.allocate();
        assert!(a < b);
        assert_eq!(a.to_string(), "record-1");
    }

    #[test]
    fn redispatch_keeps_task_and_counts_retry() {
        let mut ids = IdAllocator::new();
        let mut record = TaskRecord::new(ids.allocate(), "job", 0);
        record.mark_failed(TaskError::new("boom"));

        let next = ids.allocate();
        let retried = record.redispatch(next);
        assert_eq!(retried.task, "job");
        assert_eq!(retried.retried_times, 1);
        assert_eq!(retried.id, next);
        assert!(retried.last_error.is_none());
    }
}
