//! TaskQueueBuilder: wiring and fail-fast validation of a queue.

use crate::config::QueueOptions;
use crate::error::QueueError;
use crate::handler::Handler;
use crate::queue::{AbortHandler, TaskQueue};

/// Builds a [`TaskQueue`].
///
/// # Example
/// ```ignore
/// let queue = TaskQueue::builder(handler)
///     .concurrency(4)
///     .data(tasks)
///     .max_retry_times(2)
///     .abort_handler(|task| tracing::info!(?task, "aborted"))
///     .build()?;
/// ```
///
/// `build()` rejects invalid options (e.g. zero concurrency) instead of producing a
/// queue that can never make progress.
pub struct TaskQueueBuilder<T, R> {
    options: QueueOptions,
    data: Vec<T>,
    handler: Box<dyn Handler<T, R>>,
    abort_handler: Option<AbortHandler<T>>,
}

impl<T, R> TaskQueueBuilder<T, R>
where
    T: Clone + PartialEq + Send + 'static,
    R: Send + 'static,
{
    pub fn new<H: Handler<T, R>>(handler: H) -> Self {
        Self {
            options: QueueOptions::default(),
            data: Vec::new(),
            handler: Box::new(handler),
            abort_handler: None,
        }
    }

    /// Replace all tunables at once (e.g. options loaded from JSON).
    pub fn options(mut self, options: QueueOptions) -> Self {
        self.options = options;
        self
    }

    pub fn concurrency(mut self, concurrency: usize) -> Self {
        self.options.concurrency = concurrency;
        self
    }

    /// Initial pending tasks.
    pub fn data(mut self, data: impl IntoIterator<Item = T>) -> Self {
        self.data = data.into_iter().collect();
        self
    }

    pub fn fifo(mut self, fifo: bool) -> Self {
        self.options.fifo = fifo;
        self
    }

    pub fn continue_on_error(mut self, continue_on_error: bool) -> Self {
        self.options.continue_on_error = continue_on_error;
        self
    }

    pub fn max_retry_times(mut self, max_retry_times: u32) -> Self {
        self.options.max_retry_times = max_retry_times;
        self
    }

    /// Called for every running task cancelled by abort, clear or remove,
    /// after the task's own cancel callback.
    pub fn abort_handler<F>(mut self, abort_handler: F) -> Self
    where
        F: Fn(&T) + Send + Sync + 'static,
    {
        self.abort_handler = Some(Box::new(abort_handler));
        self
    }

    pub fn build(self) -> Result<TaskQueue<T, R>, QueueError> {
        self.options.validate()?;
        Ok(TaskQueue::from_parts(
            self.options,
            self.data,
            self.handler,
            self.abort_handler,
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::handler::from_fn;
    use crate::queue::QueueState;

    #[test]
    fn build_rejects_zero_concurrency() {
        let result = TaskQueue::builder(from_fn(|n: u32| Ok::<_, String>(n)))
            .concurrency(0)
            .build();
        assert!(matches!(result, Err(QueueError::InvalidConcurrency(0))));
    }

    #[test]
    fn built_queue_starts_pending_with_data() {
        let queue = TaskQueue::builder(from_fn(|n: u32| Ok::<_, String>(n)))
            .options(QueueOptions::with_concurrency(3))
            .data([1, 2, 3])
            .build()
            .unwrap();

        assert_eq!(queue.state(), QueueState::Pending);
        assert_eq!(queue.concurrency(), 3);
        assert_eq!(queue.pending_task_data(), vec![1, 2, 3]);
        assert_eq!(queue.total_count(), 3);
    }
}
