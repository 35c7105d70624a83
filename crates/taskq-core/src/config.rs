//! Queue options.

use serde::{Deserialize, Serialize};

use crate::error::QueueError;

/// Tunables of a [`TaskQueue`](crate::TaskQueue).
///
/// Every field has a default, so a partial JSON document is enough:
///
/// ```ignore
/// let options = QueueOptions::from_json(r#"{ "concurrency": 4, "max_retry_times": 2 }"#)?;
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct QueueOptions {
    /// Maximum number of handler invocations in flight.
    pub concurrency: usize,

    /// Dispatch from the head of pending (`true`) or from the tail (`false`).
    pub fifo: bool,

    /// Keep going after a task error instead of aborting the queue.
    pub continue_on_error: bool,

    /// Automatic redispatches allowed per failed task.
    pub max_retry_times: u32,
}

impl Default for QueueOptions {
    fn default() -> Self {
        Self {
            concurrency: 1,
            fifo: true,
            continue_on_error: false,
            max_retry_times: 0,
        }
    }
}

impl QueueOptions {
    pub fn with_concurrency(concurrency: usize) -> Self {
        Self {
            concurrency,
            ..Default::default()
        }
    }

    /// Parse and validate options from JSON.
    pub fn from_json(json: &str) -> Result<Self, QueueError> {
        let options: QueueOptions = serde_json::from_str(json)?;
        options.validate()?;
        Ok(options)
    }

    pub fn validate(&self) -> Result<(), QueueError> {
        if self.concurrency < 1 {
            return Err(QueueError::InvalidConcurrency(self.concurrency));
        }
        Ok(())
    }
}
