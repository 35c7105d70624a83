//! Queue module: the `TaskQueue` facade, bookkeeping, records, and lifecycle state.
//!
//! # Execution model
//! - All bookkeeping lives behind one mutex. It is never held across an `.await`
//!   or while user code runs (handler, cancel callback, abort handler, listeners).
//! - Each dispatched attempt is a spawned tokio task that awaits the handler's future
//!   and then settles the record. A settlement whose record has left `running`
//!   (abort, clear, remove) is dropped.
//! - A settlement's bookkeeping, its event and the follow-up (abort on a fatal error,
//!   otherwise the next dispatch) form one locked turn.
//! - Side effects of every turn (events, cancellations, handler launches) are queued
//!   in commit order and applied outside the lock by one drainer at a time.
//! - While paused, settlements wait on a resume gate so no bookkeeping changes
//!   are observable until `resume()`.
//!
//! `start()` and every operation that may dispatch must be called from within a
//! tokio runtime.

mod dispatch;
mod record;
mod state;

pub use record::CancelFn;
use record::RecordId;
pub use state::QueueState;

use std::fmt;
use std::panic::AssertUnwindSafe;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};

use futures::FutureExt;
use futures::future::BoxFuture;
use tokio::sync::watch;
use tracing::{debug, warn};

use self::dispatch::{Backlog, Effect, Outbox, Scheduler, Sizes};
use crate::builder::TaskQueueBuilder;
use crate::config::QueueOptions;
use crate::error::TaskError;
use crate::handler::{Execution, Handler, TaskResult, panic_message};
use crate::notifier::{ListenerId, Notifier, QueueEvent, Signal};
use crate::observability::QueueCounts;

pub(crate) type AbortHandler<T> = Box<dyn Fn(&T) + Send + Sync>;

/// Concurrency-bounded task queue.
///
/// Cloning is cheap and yields another handle to the same queue.
///
/// # Example
/// ```ignore
/// let queue = TaskQueue::builder(from_async(|n: u64| async move { fetch(n).await }))
///     .concurrency(4)
///     .data(0..100)
///     .build()?;
/// queue.subscribe(|event| println!("{}", event.name()));
/// queue.start();
/// ```
pub struct TaskQueue<T, R> {
    inner: Arc<Inner<T, R>>,
}

/// Non-owning handle, for listeners that need to act on their own queue.
pub struct WeakTaskQueue<T, R> {
    inner: Weak<Inner<T, R>>,
}

struct Inner<T, R> {
    scheduler: Mutex<Scheduler<T>>,
    gate: watch::Receiver<bool>,
    handler: Box<dyn Handler<T, R>>,
    abort_handler: Option<AbortHandler<T>>,
    notifier: Notifier<T, R>,
    backlog: Backlog<T, R>,
}

impl<T, R> Clone for TaskQueue<T, R> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<T, R> Clone for WeakTaskQueue<T, R> {
    fn clone(&self) -> Self {
        Self {
            inner: Weak::clone(&self.inner),
        }
    }
}

impl<T, R> WeakTaskQueue<T, R> {
    pub fn upgrade(&self) -> Option<TaskQueue<T, R>> {
        self.inner.upgrade().map(|inner| TaskQueue { inner })
    }
}

impl<T, R> TaskQueue<T, R>
where
    T: Clone + PartialEq + Send + 'static,
    R: Send + 'static,
{
    pub fn builder<H: Handler<T, R>>(handler: H) -> TaskQueueBuilder<T, R> {
        TaskQueueBuilder::new(handler)
    }

    pub(crate) fn from_parts(
        options: QueueOptions,
        data: Vec<T>,
        handler: Box<dyn Handler<T, R>>,
        abort_handler: Option<AbortHandler<T>>,
    ) -> Self {
        let (scheduler, gate) = Scheduler::new(options, data);
        Self {
            inner: Arc::new(Inner {
                scheduler: Mutex::new(scheduler),
                gate,
                handler,
                abort_handler,
                notifier: Notifier::new(),
                backlog: Backlog::new(),
            }),
        }
    }

    pub fn downgrade(&self) -> WeakTaskQueue<T, R> {
        WeakTaskQueue {
            inner: Arc::downgrade(&self.inner),
        }
    }

    /// Start (or restart) dispatching. Resumes a paused queue.
    ///
    /// With nothing to run, the queue reports `Finish` on the next scheduler tick, so
    /// listeners attached right after this call still observe it.
    /// Returns whether the queue is now running.
    pub fn start(&self) -> bool {
        self.inner.start()
    }

    /// Withhold new dispatch. Running handlers continue; their results wait for `resume()`.
    pub fn pause(&self) -> bool {
        self.inner.transition(|s, out| s.pause(out))
    }

    pub fn resume(&self) -> bool {
        self.inner.transition(|s, out| s.resume(out))
    }

    /// Cancel running work and stop. Pending tasks are kept for `retry()`/`start()`.
    pub fn abort(&self) -> bool {
        self.inner.transition(|s, out| s.abort(None, out))
    }

    pub fn abort_with(&self, reason: TaskError) -> bool {
        self.inner.transition(|s, out| s.abort(Some(reason), out))
    }

    /// Move every failed task back to pending (regardless of retry limits) and start.
    pub fn retry(&self) -> bool {
        self.inner.retry()
    }

    /// Cancel running work and discard everything, ending in `Finished`.
    /// Only legal while running or paused.
    pub fn clear(&self) -> bool {
        self.inner.transition(|s, out| s.clear(out))
    }

    pub fn push(&self, tasks: impl IntoIterator<Item = T>) {
        let tasks: Vec<T> = tasks.into_iter().collect();
        self.inner.enqueue(|s| s.push(tasks));
    }

    pub fn unshift(&self, tasks: impl IntoIterator<Item = T>) {
        let tasks: Vec<T> = tasks.into_iter().collect();
        self.inner.enqueue(|s| s.unshift(tasks));
    }

    /// First task matching `predicate`, searching running, failed, then pending.
    pub fn find<P>(&self, predicate: P) -> Option<T>
    where
        P: FnMut(&T) -> bool,
    {
        self.inner.lock().find(predicate)
    }

    /// Remove the given tasks wherever they are. Running ones are cancelled.
    ///
    /// Returns the tasks that were actually found.
    pub fn remove(&self, tasks: impl IntoIterator<Item = T>) -> Vec<T> {
        let tasks: Vec<T> = tasks.into_iter().collect();
        self.inner.removal(|s, out| s.remove(tasks, out))
    }

    pub fn remove_where<P>(&self, predicate: P) -> Vec<T>
    where
        P: FnMut(&T) -> bool,
    {
        self.inner.removal(|s, out| s.remove_where(predicate, out))
    }

    pub fn subscribe<F>(&self, listener: F) -> ListenerId
    where
        F: Fn(&QueueEvent<'_, T, R>) + Send + Sync + 'static,
    {
        self.inner.notifier.subscribe(listener)
    }

    pub fn unsubscribe(&self, id: ListenerId) -> bool {
        self.inner.notifier.unsubscribe(id)
    }

    pub fn state(&self) -> QueueState {
        self.inner.lock().state()
    }

    pub fn concurrency(&self) -> usize {
        self.inner.lock().options().concurrency
    }

    fn sizes(&self) -> Sizes {
        self.inner.lock().sizes()
    }

    pub fn total_count(&self) -> usize {
        let s = self.sizes();
        s.handled + s.pending + s.running + s.failed
    }

    pub fn processed_count(&self) -> usize {
        self.sizes().handled
    }

    pub fn unprocessed_count(&self) -> usize {
        let s = self.sizes();
        s.pending + s.running
    }

    pub fn pending_count(&self) -> usize {
        self.sizes().pending
    }

    pub fn running_count(&self) -> usize {
        self.sizes().running
    }

    pub fn failed_count(&self) -> usize {
        self.sizes().failed
    }

    pub fn running_task_data(&self) -> Vec<T> {
        self.inner.lock().running_tasks()
    }

    /// Running tasks (in dispatch order) followed by pending ones.
    pub fn unprocessed_task_data(&self) -> Vec<T> {
        let s = self.inner.lock();
        let mut tasks = s.running_tasks();
        tasks.extend(s.pending_tasks());
        tasks
    }

    pub fn pending_task_data(&self) -> Vec<T> {
        self.inner.lock().pending_tasks()
    }

    pub fn failed_task_data(&self) -> Vec<T> {
        self.inner.lock().failed_tasks()
    }

    pub fn counts(&self) -> QueueCounts {
        let s = self.inner.lock();
        let sizes = s.sizes();
        QueueCounts {
            state: s.state(),
            total: sizes.handled + sizes.pending + sizes.running + sizes.failed,
            processed: sizes.handled,
            pending: sizes.pending,
            running: sizes.running,
            failed: sizes.failed,
        }
    }
}

impl<T, R> fmt::Debug for TaskQueue<T, R>
where
    T: Clone + PartialEq + Send + 'static,
    R: Send + 'static,
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TaskQueue")
            .field("counts", &self.counts())
            .finish()
    }
}

impl<T, R> Inner<T, R>
where
    T: Clone + PartialEq + Send + 'static,
    R: Send + 'static,
{
    fn lock(&self) -> MutexGuard<'_, Scheduler<T>> {
        self.scheduler.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Run one locked turn, commit its effects in order, then drain unlocked.
    fn transition<V, F>(self: &Arc<Self>, f: F) -> V
    where
        F: FnOnce(&mut Scheduler<T>, &mut Outbox<T, R>) -> V,
    {
        let value = {
            let mut s = self.lock();
            let mut out = Outbox::new();
            let value = f(&mut s, &mut out);
            self.backlog.commit(out);
            value
        };
        self.drain();
        value
    }

    /// Apply committed effects unless another caller is already doing so.
    fn drain(self: &Arc<Self>) {
        if !self.backlog.claim() {
            return;
        }
        while let Some(effect) = self.backlog.next() {
            self.apply(effect);
        }
    }

    /// `start()` as a step of a larger turn.
    fn start_turn(self: &Arc<Self>, s: &mut Scheduler<T>, out: &mut Outbox<T, R>) -> bool {
        match s.state() {
            QueueState::Paused => s.resume(out),
            QueueState::Running => {
                s.dispatch(out);
                true
            }
            state if state.is_startable() => {
                if s.begin(out) {
                    self.schedule_idle_check();
                }
                true
            }
            _ => false,
        }
    }

    fn start(self: &Arc<Self>) -> bool {
        self.transition(|s, out| self.start_turn(s, out))
    }

    fn retry(self: &Arc<Self>) -> bool {
        self.transition(|s, out| {
            let moved = s.requeue_failed();
            if moved {
                self.start_turn(s, out);
            }
            moved
        })
    }

    /// Add work; a finished queue restarts, otherwise free capacity is filled.
    fn enqueue<F>(self: &Arc<Self>, add: F)
    where
        F: FnOnce(&mut Scheduler<T>),
    {
        self.transition(|s, out| {
            add(s);
            if s.state() == QueueState::Finished {
                if s.begin(out) {
                    self.schedule_idle_check();
                }
            } else {
                s.dispatch(out);
            }
        });
    }

    fn removal<F>(self: &Arc<Self>, remove: F) -> Vec<T>
    where
        F: FnOnce(&mut Scheduler<T>, &mut Outbox<T, R>) -> Vec<T>,
    {
        self.transition(|s, out| {
            let removed = remove(s, out);
            s.dispatch(out);
            removed
        })
    }

    /// Finish an empty run on the next tick rather than inside `start()`.
    fn schedule_idle_check(self: &Arc<Self>) {
        let inner = Arc::clone(self);
        tokio::spawn(async move {
            inner.transition(|s, out| s.finish_if_idle(out));
        });
    }

    fn apply(self: &Arc<Self>, effect: Effect<T, R>) {
        match effect {
            Effect::Emit(signal) => self.notifier.emit(&signal),
            Effect::Cancel { task, cancel } => {
                if let Some(cancel) = cancel {
                    guarded("cancel callback", cancel);
                }
                if let Some(abort_handler) = &self.abort_handler {
                    guarded("abort handler", || abort_handler(&task));
                }
            }
            Effect::Launch { id, task } => self.launch(id, task),
        }
    }

    fn launch(self: &Arc<Self>, id: RecordId, task: T) {
        if !self.lock().is_running(id) {
            debug!(record_id = %id, "record left running before launch");
            return;
        }

        let execution =
            match std::panic::catch_unwind(AssertUnwindSafe(|| self.handler.call(task))) {
                Ok(execution) => execution,
                Err(panic) => {
                    let message = panic_message(panic.as_ref());
                    warn!(record_id = %id, "handler panicked: {message}");
                    Execution::Immediate(Err(TaskError::panicked(message)))
                }
            };

        let (future, cancel) = execution.into_parts();
        if let Some(cancel) = cancel {
            let orphan = self.lock().attach_cancel(id, cancel);
            if let Some(cancel) = orphan {
                // Removed while the handler was being called.
                guarded("cancel callback", cancel);
                return;
            }
        }

        let inner = Arc::clone(self);
        tokio::spawn(async move {
            inner.run_attempt(id, future).await;
        });
    }

    async fn run_attempt(self: Arc<Self>, id: RecordId, future: BoxFuture<'static, TaskResult<R>>) {
        let result = match AssertUnwindSafe(future).catch_unwind().await {
            Ok(result) => result,
            Err(panic) => {
                let message = panic_message(panic.as_ref());
                warn!(record_id = %id, "handler panicked: {message}");
                Err(TaskError::panicked(message))
            }
        };
        self.settle(id, result).await;
    }

    async fn settle(self: &Arc<Self>, id: RecordId, result: TaskResult<R>) {
        let mut gate = self.gate.clone();
        let mut slot = Some(result);
        loop {
            if gate.wait_for(|open| *open).await.is_err() {
                return;
            }
            if self.transition(|s, out| Self::try_settle(s, out, id, &mut slot)) {
                return;
            }
        }
    }

    /// Apply a settlement: bookkeeping, its event, and the follow-up abort or
    /// dispatch all happen in one turn. Returns `false` if the queue got paused
    /// in the meantime.
    fn try_settle(
        s: &mut Scheduler<T>,
        out: &mut Outbox<T, R>,
        id: RecordId,
        slot: &mut Option<TaskResult<R>>,
    ) -> bool {
        if s.state() == QueueState::Paused {
            return false;
        }
        let Some(result) = slot.take() else {
            return true;
        };
        let Some(record) = s.take_running(id) else {
            debug!(record_id = %id, "dropping stale settlement");
            return true;
        };

        match result {
            Ok(value) => {
                s.record_success();
                debug!(record_id = %id, "task finished");
                out.emit(Signal::TaskFinished(record.task, value));
                s.dispatch(out);
            }
            Err(error) => {
                warn!(
                    record_id = %id,
                    retried_times = record.retried_times,
                    error = %error,
                    "task failed"
                );
                let task = record.task.clone();
                s.record_failure(record, error.clone());
                out.emit(Signal::Error(task, error.clone()));
                if s.is_fatal() {
                    s.abort(Some(error), out);
                } else {
                    s.dispatch(out);
                }
            }
        }
        true
    }
}

/// Run user-supplied callback code, logging instead of unwinding through the queue.
fn guarded(what: &str, f: impl FnOnce()) {
    if let Err(panic) = std::panic::catch_unwind(AssertUnwindSafe(f)) {
        warn!("{what} panicked: {}", panic_message(panic.as_ref()));
    }
}
