//! Bookkeeping and the dispatch pass.
//!
//! `Scheduler` owns pending/running/failed and the lifecycle state. Every method is
//! a short synchronous turn executed under the queue lock; side effects that involve
//! user code (handlers, cancel callbacks, listeners) are not performed here but
//! appended to an [`Outbox`] and carried out by the queue once the lock is released.

use std::collections::{BTreeMap, VecDeque};
use std::sync::{Mutex, MutexGuard, PoisonError};

use tokio::sync::watch;
use tracing::{debug, info, warn};

use super::record::{CancelFn, IdAllocator, RecordId, TaskRecord};
use super::state::QueueState;
use crate::config::QueueOptions;
use crate::error::TaskError;
use crate::notifier::Signal;

/// Deferred side effect, executed in order after the lock is released.
pub(crate) enum Effect<T, R> {
    Emit(Signal<T, R>),

    /// Fire the record's cancel callback (if any) and the queue's abort handler.
    Cancel { task: T, cancel: Option<CancelFn> },

    /// Invoke the handler for a record that was just put into running.
    Launch { id: RecordId, task: T },
}

pub(crate) struct Outbox<T, R> {
    effects: Vec<Effect<T, R>>,
}

impl<T, R> Outbox<T, R> {
    pub(crate) fn new() -> Self {
        Self {
            effects: Vec::new(),
        }
    }

    pub(crate) fn emit(&mut self, signal: Signal<T, R>) {
        self.effects.push(Effect::Emit(signal));
    }

    fn cancel(&mut self, task: T, cancel: Option<CancelFn>) {
        self.effects.push(Effect::Cancel { task, cancel });
    }

    fn launch(&mut self, id: RecordId, task: T) {
        self.effects.push(Effect::Launch { id, task });
    }

}

/// Effects of every turn, in the order the turns committed them.
///
/// Only one caller drains at a time, so listeners observe a single ordered stream
/// even when attempts settle on different worker threads. A caller that finds a
/// drain in progress leaves its effects to the current drainer.
pub(crate) struct Backlog<T, R> {
    state: Mutex<BacklogState<T, R>>,
}

struct BacklogState<T, R> {
    effects: VecDeque<Effect<T, R>>,
    draining: bool,
}

impl<T, R> Backlog<T, R> {
    pub(crate) fn new() -> Self {
        Self {
            state: Mutex::new(BacklogState {
                effects: VecDeque::new(),
                draining: false,
            }),
        }
    }

    fn state(&self) -> MutexGuard<'_, BacklogState<T, R>> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Must be called while the scheduler lock is still held.
    pub(crate) fn commit(&self, out: Outbox<T, R>) {
        self.state().effects.extend(out.effects);
    }

    /// Become the drainer. `false` if someone else already is.
    pub(crate) fn claim(&self) -> bool {
        let mut state = self.state();
        if state.draining {
            return false;
        }
        state.draining = true;
        true
    }

    /// Next effect for the drainer; releases the claim once the backlog is empty.
    pub(crate) fn next(&self) -> Option<Effect<T, R>> {
        let mut state = self.state();
        let effect = state.effects.pop_front();
        if effect.is_none() {
            state.draining = false;
        }
        effect
    }
}

/// Snapshot of collection sizes.
#[derive(Debug, Clone, Copy)]
pub(crate) struct Sizes {
    pub handled: usize,
    pub pending: usize,
    pub running: usize,
    pub failed: usize,
}

pub(crate) struct Scheduler<T> {
    options: QueueOptions,
    state: QueueState,

    /// Not yet dispatched, in submission order.
    pending: VecDeque<T>,

    /// In flight, ordered by record id (= dispatch order).
    running: BTreeMap<RecordId, TaskRecord<T>>,

    /// Latest attempt errored and no retry is in flight, ordered by failure time.
    failed: VecDeque<TaskRecord<T>>,

    /// Successes since the last `clear()`.
    handled: usize,

    ids: IdAllocator,

    /// Resume gate: `true` unless paused. Settlements wait on it.
    gate: watch::Sender<bool>,
}

impl<T: Clone + PartialEq> Scheduler<T> {
    pub(crate) fn new(options: QueueOptions, data: Vec<T>) -> (Self, watch::Receiver<bool>) {
        let (gate, gate_rx) = watch::channel(true);
        let scheduler = Self {
            options,
            state: QueueState::Pending,
            pending: data.into(),
            running: BTreeMap::new(),
            failed: VecDeque::new(),
            handled: 0,
            ids: IdAllocator::new(),
            gate,
        };
        (scheduler, gate_rx)
    }

    pub(crate) fn options(&self) -> &QueueOptions {
        &self.options
    }

    pub(crate) fn state(&self) -> QueueState {
        self.state
    }

    fn set_state(&mut self, state: QueueState) {
        if self.state != state {
            debug!(from = ?self.state, to = ?state, "queue state changed");
        }
        self.state = state;
        self.gate.send_replace(state != QueueState::Paused);
    }

    pub(crate) fn sizes(&self) -> Sizes {
        Sizes {
            handled: self.handled,
            pending: self.pending.len(),
            running: self.running.len(),
            failed: self.failed.len(),
        }
    }

    pub(crate) fn is_running(&self, id: RecordId) -> bool {
        self.running.contains_key(&id)
    }

    pub(crate) fn running_tasks(&self) -> Vec<T> {
        self.running.values().map(|r| r.task.clone()).collect()
    }

    pub(crate) fn pending_tasks(&self) -> Vec<T> {
        self.pending.iter().cloned().collect()
    }

    pub(crate) fn failed_tasks(&self) -> Vec<T> {
        self.failed.iter().map(|r| r.task.clone()).collect()
    }

    /// Attach the cancel callback returned by the handler.
    ///
    /// Gives the callback back when the record is gone already, so the caller can fire it.
    pub(crate) fn attach_cancel(&mut self, id: RecordId, cancel: CancelFn) -> Option<CancelFn> {
        match self.running.get_mut(&id) {
            Some(record) => {
                record.cancel = Some(cancel);
                None
            }
            None => Some(cancel),
        }
    }

    fn has_retryable(&self) -> bool {
        let max = self.options.max_retry_times;
        max > 0 && self.failed.iter().any(|r| r.retried_times < max)
    }

    /// Enter `Running` from an idle state.
    ///
    /// Returns `true` when there is nothing to dispatch; the caller then schedules
    /// [`Scheduler::finish_if_idle`] on the next tick instead of finishing inline.
    pub(crate) fn begin<R>(&mut self, out: &mut Outbox<T, R>) -> bool {
        self.set_state(QueueState::Running);
        info!(pending = self.pending.len(), "queue started");
        if self.pending.is_empty() && !self.has_retryable() {
            return true;
        }
        self.dispatch(out);
        false
    }

    pub(crate) fn pause<R>(&mut self, out: &mut Outbox<T, R>) -> bool {
        if self.state != QueueState::Running {
            return false;
        }
        self.set_state(QueueState::Paused);
        out.emit(Signal::Pause);
        true
    }

    pub(crate) fn resume<R>(&mut self, out: &mut Outbox<T, R>) -> bool {
        if self.state != QueueState::Paused {
            return false;
        }
        self.set_state(QueueState::Running);
        out.emit(Signal::Resume);
        self.dispatch(out);
        true
    }

    /// Fill free capacity from pending, then from retryable failed records.
    pub(crate) fn dispatch<R>(&mut self, out: &mut Outbox<T, R>) {
        if self.state != QueueState::Running {
            return;
        }
        let concurrency = self.options.concurrency;

        while self.running.len() < concurrency {
            let next = if self.options.fifo {
                self.pending.pop_front()
            } else {
                self.pending.pop_back()
            };
            let Some(task) = next else { break };
            let record = TaskRecord::new(self.ids.allocate(), task, 0);
            self.start_record(record, out);
        }

        let max = self.options.max_retry_times;
        if max > 0 {
            let mut i = 0;
            while self.running.len() < concurrency && i < self.failed.len() {
                if self.failed[i].retried_times >= max {
                    i += 1;
                    continue;
                }
                let Some(failed) = self.failed.remove(i) else { break };
                let record = failed.redispatch(self.ids.allocate());
                debug!(
                    record_id = %record.id,
                    retried_times = record.retried_times,
                    "retrying failed task"
                );
                self.start_record(record, out);
            }
        }

        self.finish_if_idle(out);
    }

    fn start_record<R>(&mut self, record: TaskRecord<T>, out: &mut Outbox<T, R>) {
        out.launch(record.id, record.task.clone());
        self.running.insert(record.id, record);
    }

    /// Close out a running queue with nothing left in flight.
    ///
    /// Finishes when failures are tolerated or there are none; otherwise the remaining
    /// failures have exhausted their retries and the queue aborts with the last error.
    pub(crate) fn finish_if_idle<R>(&mut self, out: &mut Outbox<T, R>) {
        if self.state != QueueState::Running
            || !self.running.is_empty()
            || !self.pending.is_empty()
        {
            return;
        }
        if self.options.continue_on_error || self.failed.is_empty() {
            self.set_state(QueueState::Finished);
            info!(
                handled = self.handled,
                failed = self.failed.len(),
                "queue finished"
            );
            out.emit(Signal::Finish);
        } else {
            let reason = self.failed.back().and_then(|r| r.last_error.clone());
            warn!(failed = self.failed.len(), "retries exhausted; aborting queue");
            self.abort(reason, out);
        }
    }

    /// Take a settled record out of running. `None` means the settlement is stale.
    pub(crate) fn take_running(&mut self, id: RecordId) -> Option<TaskRecord<T>> {
        self.running.remove(&id)
    }

    pub(crate) fn record_success(&mut self) {
        self.handled += 1;
    }

    pub(crate) fn record_failure(&mut self, mut record: TaskRecord<T>, error: TaskError) {
        record.mark_failed(error);
        self.failed.push_back(record);
    }

    /// Is a task error fatal under the current options?
    pub(crate) fn is_fatal(&self) -> bool {
        !self.options.continue_on_error && self.options.max_retry_times == 0
    }

    /// Move every running record to failed and ask it to cancel.
    pub(crate) fn abort<R>(&mut self, reason: Option<TaskError>, out: &mut Outbox<T, R>) -> bool {
        if !self.state.is_active() {
            return false;
        }
        let aborted = std::mem::take(&mut self.running);
        for (_, mut record) in aborted {
            let task = record.task.clone();
            out.cancel(task.clone(), record.take_cancel());
            let error = reason
                .clone()
                .unwrap_or_else(|| TaskError::aborted("queue aborted"));
            record.mark_failed(error);
            self.failed.push_back(record);
            out.emit(Signal::TaskAborted(task));
        }
        self.set_state(QueueState::Aborted);
        match &reason {
            Some(err) => warn!(failed = self.failed.len(), error = %err, "queue aborted"),
            None => info!(failed = self.failed.len(), "queue aborted"),
        }
        out.emit(Signal::Abort(reason));
        true
    }

    /// Cancel running work, drop everything else, and land in `Finished`.
    pub(crate) fn clear<R>(&mut self, out: &mut Outbox<T, R>) -> bool {
        if !self.state.is_active() {
            return false;
        }
        let cancelled = std::mem::take(&mut self.running);
        for (_, mut record) in cancelled {
            let task = record.task.clone();
            out.cancel(task.clone(), record.take_cancel());
            out.emit(Signal::TaskAborted(task));
        }
        self.pending.clear();
        self.failed.clear();
        self.handled = 0;
        self.set_state(QueueState::Finished);
        info!("queue cleared");
        out.emit(Signal::Finish);
        true
    }

    /// Put every failed task back into pending so it is dispatched next.
    ///
    /// Ignores `max_retry_times` and does not touch retry counters of other records.
    pub(crate) fn requeue_failed(&mut self) -> bool {
        if self.failed.is_empty() {
            return false;
        }
        let tasks: Vec<T> = self.failed.drain(..).map(|r| r.task).collect();
        debug!(count = tasks.len(), "requeueing failed tasks");
        if self.options.fifo {
            for task in tasks.into_iter().rev() {
                self.pending.push_front(task);
            }
        } else {
            for task in tasks.into_iter().rev() {
                self.pending.push_back(task);
            }
        }
        true
    }

    pub(crate) fn push(&mut self, tasks: Vec<T>) {
        self.pending.extend(tasks);
    }

    pub(crate) fn unshift(&mut self, tasks: Vec<T>) {
        for task in tasks.into_iter().rev() {
            self.pending.push_front(task);
        }
    }

    pub(crate) fn find<P>(&self, mut predicate: P) -> Option<T>
    where
        P: FnMut(&T) -> bool,
    {
        self.running
            .values()
            .map(|r| &r.task)
            .chain(self.failed.iter().map(|r| &r.task))
            .chain(self.pending.iter())
            .find(|task| predicate(task))
            .cloned()
    }

    /// Remove the first occurrence of each task, searching running, failed, pending.
    pub(crate) fn remove<R>(&mut self, tasks: Vec<T>, out: &mut Outbox<T, R>) -> Vec<T> {
        let mut removed = Vec::new();
        for target in tasks {
            let running_id = self
                .running
                .iter()
                .find(|(_, r)| r.task == target)
                .map(|(id, _)| *id);
            if let Some(id) = running_id {
                if let Some(record) = self.running.remove(&id) {
                    removed.push(self.cancel_removed(record, out));
                }
                continue;
            }
            if let Some(pos) = self.failed.iter().position(|r| r.task == target) {
                if let Some(record) = self.failed.remove(pos) {
                    removed.push(record.task);
                }
                continue;
            }
            if let Some(pos) = self.pending.iter().position(|t| *t == target) {
                if let Some(task) = self.pending.remove(pos) {
                    removed.push(task);
                }
            }
        }
        removed
    }

    pub(crate) fn remove_where<R, P>(&mut self, mut predicate: P, out: &mut Outbox<T, R>) -> Vec<T>
    where
        P: FnMut(&T) -> bool,
    {
        let mut removed = Vec::new();

        let ids: Vec<RecordId> = self
            .running
            .iter()
            .filter(|(_, r)| predicate(&r.task))
            .map(|(id, _)| *id)
            .collect();
        for id in ids {
            if let Some(record) = self.running.remove(&id) {
                removed.push(self.cancel_removed(record, out));
            }
        }

        let (dropped, kept): (VecDeque<_>, VecDeque<_>) =
            std::mem::take(&mut self.failed)
                .into_iter()
                .partition(|r| predicate(&r.task));
        self.failed = kept;
        removed.extend(dropped.into_iter().map(|r| r.task));

        let (dropped, kept): (VecDeque<_>, VecDeque<_>) =
            std::mem::take(&mut self.pending)
                .into_iter()
                .partition(|t| predicate(t));
        self.pending = kept;
        removed.extend(dropped);

        removed
    }

    fn cancel_removed<R>(&mut self, mut record: TaskRecord<T>, out: &mut Outbox<T, R>) -> T {
        debug!(record_id = %record.id, "removing running task");
        let task = record.task.clone();
        out.cancel(task.clone(), record.take_cancel());
        out.emit(Signal::TaskAborted(task.clone()));
        task
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn scheduler(options: QueueOptions, data: Vec<u32>) -> Scheduler<u32> {
        Scheduler::new(options, data).0
    }

    fn launched(out: Outbox<u32, ()>) -> Vec<u32> {
        out.effects
            .into_iter()
            .filter_map(|effect| match effect {
                Effect::Launch { task, .. } => Some(task),
                _ => None,
            })
            .collect()
    }

    #[test]
    fn dispatch_respects_concurrency_and_order() {
        let options = QueueOptions {
            concurrency: 2,
            ..QueueOptions::default()
        };
        let mut s = scheduler(options, vec![1, 2, 3]);
        let mut out = Outbox::new();
        assert!(!s.begin(&mut out));

        assert_eq!(launched(out), vec![1, 2]);
        assert_eq!(s.running_tasks(), vec![1, 2]);
        assert_eq!(s.pending_tasks(), vec![3]);
    }

    #[test]
    fn lifo_pops_from_the_tail() {
        let options = QueueOptions {
            concurrency: 2,
            fifo: false,
            ..QueueOptions::default()
        };
        let mut s = scheduler(options, vec![1, 2, 3]);
        let mut out = Outbox::new();
        s.begin(&mut out);

        assert_eq!(launched(out), vec![3, 2]);
    }

    #[test]
    fn retries_come_after_fresh_work() {
        let options = QueueOptions {
            concurrency: 2,
            max_retry_times: 1,
            ..QueueOptions::default()
        };
        let mut s = scheduler(options, vec![1, 2, 3]);
        let mut out: Outbox<u32, ()> = Outbox::new();
        s.begin(&mut out);

        let first = *s.running.keys().next().unwrap();
        let record = s.take_running(first).unwrap();
        s.record_failure(record, TaskError::new("boom"));

        let mut out = Outbox::new();
        s.dispatch(&mut out);
        assert_eq!(launched(out), vec![3]);
        assert_eq!(s.failed_tasks(), vec![1]);

        let second = *s.running.keys().next().unwrap();
        s.take_running(second).unwrap();
        s.record_success();

        let mut out = Outbox::new();
        s.dispatch(&mut out);
        assert_eq!(launched(out), vec![1]);
        assert!(s.failed_tasks().is_empty());
        assert!(s.running.values().any(|r| r.retried_times == 1));
    }

    #[test]
    fn abort_moves_running_to_failed_and_keeps_pending() {
        let options = QueueOptions {
            concurrency: 2,
            ..QueueOptions::default()
        };
        let mut s = scheduler(options, (0..10).collect());
        let mut out: Outbox<u32, ()> = Outbox::new();
        s.begin(&mut out);

        let mut out: Outbox<u32, ()> = Outbox::new();
        assert!(s.abort(None, &mut out));
        assert_eq!(s.state(), QueueState::Aborted);

        let sizes = s.sizes();
        assert_eq!((sizes.running, sizes.failed, sizes.pending), (0, 2, 8));
        assert!(!s.abort(None, &mut Outbox::<u32, ()>::new()));
    }

    #[test]
    fn requeue_failed_puts_tasks_first() {
        let options = QueueOptions {
            concurrency: 2,
            ..QueueOptions::default()
        };
        let mut s = scheduler(options, vec![1, 2, 3, 4]);
        s.begin(&mut Outbox::<u32, ()>::new());
        s.abort(None, &mut Outbox::<u32, ()>::new());

        assert!(s.requeue_failed());
        assert_eq!(s.pending_tasks(), vec![1, 2, 3, 4]);
        assert!(!s.requeue_failed());
    }

    #[test]
    fn remove_searches_all_collections() {
        let options = QueueOptions {
            concurrency: 1,
            ..QueueOptions::default()
        };
        let mut s = scheduler(options, vec![1, 2, 3]);
        s.begin(&mut Outbox::<u32, ()>::new());

        let mut out: Outbox<u32, ()> = Outbox::new();
        let removed = s.remove(vec![3, 1, 9], &mut out);
        assert_eq!(removed, vec![3, 1]);
        assert!(s.running_tasks().is_empty());
        assert_eq!(s.pending_tasks(), vec![2]);

        let cancels = out
            .effects
            .into_iter()
            .filter(|e| matches!(e, Effect::Cancel { .. }))
            .count();
        assert_eq!(cancels, 1);
    }

    #[test]
    fn unshift_preserves_argument_order() {
        let mut s = scheduler(QueueOptions::default(), vec![3]);
        s.unshift(vec![1, 2]);
        s.push(vec![4]);
        assert_eq!(s.pending_tasks(), vec![1, 2, 3, 4]);
        assert_eq!(s.find(|t| *t > 2), Some(3));
    }

    #[test]
    fn clear_is_rejected_outside_running_or_paused() {
        let mut s = scheduler(QueueOptions::default(), vec![1, 2]);
        assert!(!s.clear(&mut Outbox::<u32, ()>::new()));

        s.begin(&mut Outbox::<u32, ()>::new());
        s.abort(None, &mut Outbox::<u32, ()>::new());
        assert!(!s.clear(&mut Outbox::<u32, ()>::new()));
        assert_eq!(s.state(), QueueState::Aborted);
        assert_eq!(s.sizes().failed, 1);
    }

    #[test]
    fn backlog_has_a_single_drainer() {
        let backlog: Backlog<u32, ()> = Backlog::new();
        let mut out = Outbox::new();
        out.emit(Signal::Pause);
        out.emit(Signal::Resume);
        backlog.commit(out);

        assert!(backlog.claim());
        assert!(!backlog.claim());
        assert!(matches!(backlog.next(), Some(Effect::Emit(Signal::Pause))));

        // committed mid-drain, picked up by the current drainer
        let mut out = Outbox::new();
        out.emit(Signal::Finish);
        backlog.commit(out);

        assert!(matches!(backlog.next(), Some(Effect::Emit(Signal::Resume))));
        assert!(matches!(backlog.next(), Some(Effect::Emit(Signal::Finish))));
        assert!(backlog.next().is_none());
        assert!(backlog.claim());
    }
}
