//! # Lifecycle events and the listener registry.
//!
//! The queue records what happened while holding its bookkeeping lock (as owned
//! [`Signal`]s) and publishes them only after the lock is released, so listeners are
//! free to call back into the queue (`clear()`, `push()`, counts, ...).
//!
//! ## Rules
//! - Listeners run synchronously, in subscription order, on whichever thread is
//!   draining the queue's effects.
//! - Events of one queue are delivered in the order they were produced, one at a time.
//! - Queue calls made from a listener take effect immediately; their own events are
//!   delivered after the current listener returns.
//! - A panicking listener is isolated: the panic is logged and the remaining listeners still run.
//! - Listeners see borrowed payloads, so neither `T` nor `R` has to be `Clone`.

use std::fmt;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use tracing::warn;

use crate::error::TaskError;
use crate::handler::panic_message;

/// Event published by a [`TaskQueue`](crate::TaskQueue).
#[derive(Debug)]
pub enum QueueEvent<'a, T, R> {
    /// A task attempt succeeded.
    TaskFinished { task: &'a T, value: &'a R },

    /// A task attempt failed; the task is now in the failed set.
    Error { task: &'a T, error: &'a TaskError },

    /// A running task was cancelled by `abort()`, `clear()` or `remove()`.
    TaskAborted { task: &'a T },

    Finish,
    Pause,
    Resume,

    /// The queue stopped; `reason` is set for fatal task errors and `abort_with`.
    Abort { reason: Option<&'a TaskError> },
}

impl<T, R> QueueEvent<'_, T, R> {
    pub fn name(&self) -> &'static str {
        match self {
            QueueEvent::TaskFinished { .. } => "task-finished",
            QueueEvent::Error { .. } => "error",
            QueueEvent::TaskAborted { .. } => "task-aborted",
            QueueEvent::Finish => "finish",
            QueueEvent::Pause => "pause",
            QueueEvent::Resume => "resume",
            QueueEvent::Abort { .. } => "abort",
        }
    }
}

/// Owned form of an event, buffered until the bookkeeping lock is released.
pub(crate) enum Signal<T, R> {
    TaskFinished(T, R),
    Error(T, TaskError),
    TaskAborted(T),
    Finish,
    Pause,
    Resume,
    Abort(Option<TaskError>),
}

impl<T, R> Signal<T, R> {
    pub(crate) fn as_event(&self) -> QueueEvent<'_, T, R> {
        match self {
            Signal::TaskFinished(task, value) => QueueEvent::TaskFinished { task, value },
            Signal::Error(task, error) => QueueEvent::Error { task, error },
            Signal::TaskAborted(task) => QueueEvent::TaskAborted { task },
            Signal::Finish => QueueEvent::Finish,
            Signal::Pause => QueueEvent::Pause,
            Signal::Resume => QueueEvent::Resume,
            Signal::Abort(reason) => QueueEvent::Abort {
                reason: reason.as_ref(),
            },
        }
    }
}

/// Handle returned by `subscribe`, used to unsubscribe.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ListenerId(u64);

impl fmt::Display for ListenerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "listener-{}", self.0)
    }
}

type Listener<T, R> = Arc<dyn Fn(&QueueEvent<'_, T, R>) + Send + Sync>;

/// Fan-out of queue events to subscribed listeners.
pub(crate) struct Notifier<T, R> {
    listeners: Mutex<Vec<(ListenerId, Listener<T, R>)>>,
    next_id: AtomicU64,
}

impl<T, R> Notifier<T, R> {
    pub(crate) fn new() -> Self {
        Self {
            listeners: Mutex::new(Vec::new()),
            next_id: AtomicU64::new(1),
        }
    }

    pub(crate) fn subscribe<F>(&self, listener: F) -> ListenerId
    where
        F: Fn(&QueueEvent<'_, T, R>) + Send + Sync + 'static,
    {
        let id = ListenerId(self.next_id.fetch_add(1, Ordering::Relaxed));
        self.listeners
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push((id, Arc::new(listener)));
        id
    }

    pub(crate) fn unsubscribe(&self, id: ListenerId) -> bool {
        let mut listeners = self
            .listeners
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        let before = listeners.len();
        listeners.retain(|(existing, _)| *existing != id);
        listeners.len() != before
    }

    /// Deliver one event to every listener registered at the time of the call.
    pub(crate) fn emit(&self, signal: &Signal<T, R>) {
        // Snapshot so listeners can (un)subscribe while being notified.
        let snapshot: Vec<(ListenerId, Listener<T, R>)> = self
            .listeners
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();

        let event = signal.as_event();
        for (id, listener) in snapshot {
            if let Err(panic) = std::panic::catch_unwind(AssertUnwindSafe(|| listener(&event))) {
                warn!(
                    listener = %id,
                    event = event.name(),
                    "listener panicked: {}",
                    panic_message(panic.as_ref())
                );
            }
        }
    }
}
