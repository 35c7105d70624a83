//! One-shot helpers over a temporary [`TaskQueue`].
//!
//! Each helper builds a queue with default options (stop on the first error, no
//! automatic retry), starts it, and resolves once it finishes, aborts, or
//! short-circuits. Tasks are dispatched by index, so the item type needs neither
//! `Clone` nor `PartialEq`.

use std::sync::{Arc, Mutex, PoisonError};

use tokio::sync::oneshot;

use crate::error::QueueError;
use crate::handler::{Execution, Handler};
use crate::notifier::QueueEvent;
use crate::queue::TaskQueue;

type Reply<V> = Mutex<Option<oneshot::Sender<Result<V, QueueError>>>>;

/// Deliver the first outcome; later ones are ignored.
fn reply<V>(slot: &Reply<V>, outcome: Result<V, QueueError>) {
    let sender = slot.lock().unwrap_or_else(PoisonError::into_inner).take();
    if let Some(sender) = sender {
        let _ = sender.send(outcome);
    }
}

/// Handler over item indices that hands each item to `handler` exactly once.
fn indexed<T, R, H>(data: Vec<T>, handler: H) -> impl Handler<usize, R>
where
    T: Send + 'static,
    R: Send + 'static,
    H: Handler<T, R>,
{
    let slots: Mutex<Vec<Option<T>>> = Mutex::new(data.into_iter().map(Some).collect());
    move |index: usize| -> Execution<R> {
        let item = slots
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get_mut(index)
            .and_then(Option::take);
        match item {
            Some(item) => handler.call(item),
            None => Execution::failed(format!("item {index} was already handed out")),
        }
    }
}

/// What a helper makes of one queue event.
enum Verdict<V> {
    Continue,
    Resolve(Result<V, QueueError>),
    /// Resolve, then clear the queue so nothing else gets dispatched.
    ResolveAndClear(Result<V, QueueError>),
}

/// Resolve on `Finish` with `value`, reject on `Abort`.
fn until_settled<T, R, V>(event: &QueueEvent<'_, T, R>, value: impl FnOnce() -> V) -> Verdict<V> {
    match event {
        QueueEvent::Finish => Verdict::Resolve(Ok(value())),
        QueueEvent::Abort { reason } => Verdict::Resolve(Err(QueueError::from_abort(*reason))),
        _ => Verdict::Continue,
    }
}

async fn run<R, V, L>(
    len: usize,
    handler: impl Handler<usize, R>,
    concurrency: usize,
    on_event: L,
) -> Result<V, QueueError>
where
    R: Send + 'static,
    V: Send + 'static,
    L: Fn(&QueueEvent<'_, usize, R>) -> Verdict<V> + Send + Sync + 'static,
{
    let queue = TaskQueue::builder(handler)
        .concurrency(concurrency)
        .data(0..len)
        .build()?;

    let (tx, rx) = oneshot::channel();
    let slot: Reply<V> = Mutex::new(Some(tx));
    let weak = queue.downgrade();
    queue.subscribe(move |event| match on_event(event) {
        Verdict::Continue => {}
        Verdict::Resolve(outcome) => reply(&slot, outcome),
        Verdict::ResolveAndClear(outcome) => {
            // Reply first so the `Finish` produced by clearing cannot win.
            reply(&slot, outcome);
            if let Some(queue) = weak.upgrade() {
                queue.clear();
            }
        }
    });

    queue.start();
    rx.await.unwrap_or(Err(QueueError::Aborted))
}

/// Run `handler` over every item. Fails with the first task error.
pub async fn each<T, R, H>(data: Vec<T>, handler: H, concurrency: usize) -> Result<(), QueueError>
where
    T: Send + 'static,
    R: Send + 'static,
    H: Handler<T, R>,
{
    let len = data.len();
    run(len, indexed(data, handler), concurrency, |event| {
        until_settled(event, || ())
    })
    .await
}

/// Like [`each`], collecting every result at its item's original index.
pub async fn map<T, R, H>(data: Vec<T>, handler: H, concurrency: usize) -> Result<Vec<R>, QueueError>
where
    T: Send + 'static,
    R: Send + 'static,
    H: Handler<T, R>,
{
    let len = data.len();
    let results: Arc<Mutex<Vec<Option<R>>>> =
        Arc::new(Mutex::new((0..len).map(|_| None).collect()));

    let inner = indexed(data, handler);
    let sink = Arc::clone(&results);
    let storing = move |index: usize| -> Execution<()> {
        let sink = Arc::clone(&sink);
        inner.call(index).map(move |value| {
            if let Some(slot) = sink
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .get_mut(index)
            {
                *slot = Some(value);
            }
        })
    };

    run(len, storing, concurrency, |event| until_settled(event, || ())).await?;

    let values = std::mem::take(&mut *results.lock().unwrap_or_else(PoisonError::into_inner));
    values
        .into_iter()
        .collect::<Option<Vec<R>>>()
        .ok_or(QueueError::Aborted)
}

/// `true` as soon as `predicate` holds for any item; remaining work is cleared.
pub async fn some<T, H>(data: Vec<T>, predicate: H, concurrency: usize) -> Result<bool, QueueError>
where
    T: Send + 'static,
    H: Handler<T, bool>,
{
    let len = data.len();
    run(len, indexed(data, predicate), concurrency, |event| match event {
        QueueEvent::TaskFinished { value, .. } if **value => Verdict::ResolveAndClear(Ok(true)),
        _ => until_settled(event, || false),
    })
    .await
}

/// `true` when `predicate` holds for every item.
pub async fn every<T, H>(data: Vec<T>, predicate: H, concurrency: usize) -> Result<bool, QueueError>
where
    T: Send + 'static,
    H: Handler<T, bool>,
{
    let negated = move |item: T| predicate.call(item).map(|holds| !holds);
    some(data, negated, concurrency).await.map(|found| !found)
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use super::*;
    use crate::error::TaskError;
    use crate::handler::{from_async, from_fn};

    #[tokio::test]
    async fn each_on_empty_data_resolves() {
        each(Vec::<u32>::new(), from_fn(|_: u32| Ok::<_, TaskError>(())), 2)
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn each_rejects_with_first_error() {
        let err = each(
            (0..5).collect(),
            from_fn(|n: u32| if n == 3 { Err("three") } else { Ok(()) }),
            1,
        )
        .await
        .unwrap_err();

        match err {
            QueueError::TaskFailed(task_err) => assert_eq!(task_err.message(), "three"),
            other => panic!("unexpected error: {other}"),
        }
    }

    #[tokio::test]
    async fn each_rejects_invalid_concurrency() {
        let err = each(vec![1u32], from_fn(|_: u32| Ok::<_, TaskError>(())), 0)
            .await
            .unwrap_err();
        assert!(matches!(err, QueueError::InvalidConcurrency(0)));
    }

    #[tokio::test]
    async fn map_keeps_item_order() {
        let out = map(
            vec!["a", "bb", "ccc"],
            from_async(|s: &'static str| async move { Ok::<_, TaskError>(s.len()) }),
            3,
        )
        .await
        .unwrap();
        assert_eq!(out, vec![1, 2, 3]);
    }

    #[tokio::test]
    async fn some_short_circuits() {
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&calls);
        let found = some(
            (0..100).collect(),
            from_fn(move |n: u32| {
                counter.fetch_add(1, Ordering::SeqCst);
                Ok::<_, TaskError>(n == 0)
            }),
            1,
        )
        .await
        .unwrap();

        assert!(found);
        assert!(calls.load(Ordering::SeqCst) < 100);
    }

    #[tokio::test]
    async fn every_on_empty_data_is_true() {
        let all = every(Vec::<u32>::new(), from_fn(|_: u32| Ok::<_, TaskError>(false)), 2)
            .await
            .unwrap();
        assert!(all);
    }
}
