//! Handler contract: what the queue calls for each task and how the result comes back.
//!
//! A handler returns an [`Execution`], the normalized form of the three shapes a
//! unit of work can take:
//! - an immediate value (or failure),
//! - a future that resolves later,
//! - a future plus a cancel callback the queue may fire on abort/clear/remove.
//!
//! Any `Fn(T) -> Execution<R>` closure is a [`Handler`]. [`from_fn`] and [`from_async`]
//! adapt plain synchronous and async functions.

use std::future::Future;
use std::marker::PhantomData;

use futures::FutureExt;
use futures::future::BoxFuture;
use tokio_util::sync::CancellationToken;

use crate::error::TaskError;
use crate::queue::CancelFn;

pub type TaskResult<R> = Result<R, TaskError>;

/// Normalized outcome of calling a handler once.
pub enum Execution<R> {
    Immediate(TaskResult<R>),
    Deferred(BoxFuture<'static, TaskResult<R>>),
    Cancellable {
        future: BoxFuture<'static, TaskResult<R>>,
        cancel: CancelFn,
    },
}

impl<R: Send + 'static> Execution<R> {
    pub fn ready(value: R) -> Self {
        Execution::Immediate(Ok(value))
    }

    pub fn failed(error: impl Into<TaskError>) -> Self {
        Execution::Immediate(Err(error.into()))
    }

    pub fn deferred<F>(future: F) -> Self
    where
        F: Future<Output = TaskResult<R>> + Send + 'static,
    {
        Execution::Deferred(future.boxed())
    }

    pub fn cancellable<F, C>(future: F, cancel: C) -> Self
    where
        F: Future<Output = TaskResult<R>> + Send + 'static,
        C: FnOnce() + Send + 'static,
    {
        Execution::Cancellable {
            future: future.boxed(),
            cancel: Box::new(cancel),
        }
    }

    /// Cancellable execution driven by a [`CancellationToken`].
    ///
    /// Cancelling fires the token; the future stops being polled as soon as the token
    /// is observed and resolves to an `Aborted` error.
    pub fn with_token<F>(future: F, token: CancellationToken) -> Self
    where
        F: Future<Output = TaskResult<R>> + Send + 'static,
    {
        let observed = token.clone();
        let guarded = async move {
            tokio::select! {
                biased;
                _ = observed.cancelled() => Err(TaskError::aborted("cancelled")),
                result = future => result,
            }
        };
        Execution::cancellable(guarded, move || token.cancel())
    }

    /// Transform the successful value, keeping the shape (and cancel callback).
    pub fn map<U, M>(self, f: M) -> Execution<U>
    where
        U: Send + 'static,
        M: FnOnce(R) -> U + Send + 'static,
    {
        match self {
            Execution::Immediate(result) => Execution::Immediate(result.map(f)),
            Execution::Deferred(future) => {
                Execution::Deferred(future.map(|result| result.map(f)).boxed())
            }
            Execution::Cancellable { future, cancel } => Execution::Cancellable {
                future: future.map(|result| result.map(f)).boxed(),
                cancel,
            },
        }
    }

    /// Split into a single awaitable future and the optional cancel callback.
    pub(crate) fn into_parts(self) -> (BoxFuture<'static, TaskResult<R>>, Option<CancelFn>) {
        match self {
            Execution::Immediate(result) => (futures::future::ready(result).boxed(), None),
            Execution::Deferred(future) => (future, None),
            Execution::Cancellable { future, cancel } => (future, Some(cancel)),
        }
    }
}

/// Performs the work for one task.
///
/// The queue never calls a handler again for the same attempt while the previous
/// call is still outstanding. Panics (during the call or inside the returned future)
/// are reported as [`TaskErrorKind::Panicked`](crate::TaskErrorKind::Panicked) failures.
pub trait Handler<T, R>: Send + Sync + 'static {
    fn call(&self, task: T) -> Execution<R>;
}

impl<T, R, F> Handler<T, R> for F
where
    F: Fn(T) -> Execution<R> + Send + Sync + 'static,
{
    fn call(&self, task: T) -> Execution<R> {
        self(task)
    }
}

/// Handler built from a synchronous function. See [`from_fn`].
pub struct FnHandler<F, T> {
    f: F,
    _marker: PhantomData<fn(T)>,
}

/// Adapt `Fn(T) -> Result<R, E>`; each call settles immediately.
pub fn from_fn<F, T>(f: F) -> FnHandler<F, T> {
    FnHandler {
        f,
        _marker: PhantomData,
    }
}

impl<T, R, E, F> Handler<T, R> for FnHandler<F, T>
where
    T: 'static,
    R: Send + 'static,
    E: Into<TaskError>,
    F: Fn(T) -> Result<R, E> + Send + Sync + 'static,
{
    fn call(&self, task: T) -> Execution<R> {
        Execution::Immediate((self.f)(task).map_err(Into::into))
    }
}

/// Handler built from an async function. See [`from_async`].
pub struct AsyncHandler<F, T> {
    f: F,
    _marker: PhantomData<fn(T)>,
}

/// Adapt `Fn(T) -> impl Future<Output = Result<R, E>>`.
pub fn from_async<F, T>(f: F) -> AsyncHandler<F, T> {
    AsyncHandler {
        f,
        _marker: PhantomData,
    }
}

impl<T, R, E, F, Fut> Handler<T, R> for AsyncHandler<F, T>
where
    T: 'static,
    R: Send + 'static,
    E: Into<TaskError>,
    F: Fn(T) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<R, E>> + Send + 'static,
{
    fn call(&self, task: T) -> Execution<R> {
        Execution::deferred((self.f)(task).map(|result| result.map_err(Into::into)))
    }
}

/// Render a panic payload for error reporting.
pub(crate) fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "handler panicked".to_string()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::sync::atomic::{AtomicBool, Ordering};

    use super::*;
    use crate::error::TaskErrorKind;

    #[tokio::test]
    async fn from_fn_settles_immediately() {
        let handler = from_fn(|n: u32| {
            if n % 2 == 0 {
                Ok(n * 10)
            } else {
                Err(format!("odd: {n}"))
            }
        });

        assert!(matches!(handler.call(2), Execution::Immediate(Ok(20))));
        match handler.call(3) {
            Execution::Immediate(Err(err)) => assert_eq!(err.message(), "odd: 3"),
            _ => panic!("expected an immediate failure"),
        }
    }

    #[tokio::test]
    async fn from_async_is_deferred() {
        let handler = from_async(|n: u32| async move { Ok::<_, TaskError>(n + 1) });
        let (future, cancel) = handler.call(41).into_parts();
        assert!(cancel.is_none());
        assert_eq!(future.await.unwrap(), 42);
    }

    #[tokio::test]
    async fn map_keeps_the_cancel_callback() {
        let cancelled = Arc::new(AtomicBool::new(false));
        let flag = Arc::clone(&cancelled);
        let execution = Execution::<i32>::cancellable(async { Ok(2) }, move || {
            flag.store(true, Ordering::SeqCst)
        })
        .map(|v: i32| v * 3);

        let (future, cancel) = execution.into_parts();
        cancel.expect("cancel survives map")();
        assert!(cancelled.load(Ordering::SeqCst));
        assert_eq!(future.await.unwrap(), 6);
    }

    #[tokio::test]
    async fn token_cancellation_resolves_as_aborted() {
        let token = CancellationToken::new();
        let execution =
            Execution::<()>::with_token(futures::future::pending(), token.clone());
        let (future, cancel) = execution.into_parts();

        cancel.expect("token executions are cancellable")();
        assert!(token.is_cancelled());
        let err = future.await.unwrap_err();
        assert_eq!(err.kind(), TaskErrorKind::Aborted);
    }
}
