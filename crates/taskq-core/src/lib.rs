//! taskq-core
//!
//! A concurrency-bounded, in-process task queue.
//!
//! # Modules
//! - **queue**: the [`TaskQueue`] facade, its bookkeeping and lifecycle state
//! - **handler**: the [`Handler`] contract and [`Execution`] shapes
//! - **notifier**: lifecycle events ([`QueueEvent`]) and listener registry
//! - **builder** / **config**: construction and [`QueueOptions`]
//! - **ops**: one-shot [`each`], [`map`], [`some`] and [`every`] helpers
//! - **observability**: serializable [`QueueCounts`] snapshots
//! - **error**: [`TaskError`] and [`QueueError`]

pub mod builder;
pub mod config;
pub mod error;
pub mod handler;
pub mod notifier;
pub mod observability;
pub mod ops;
pub mod queue;

pub use builder::TaskQueueBuilder;
pub use config::QueueOptions;
pub use error::{QueueError, TaskError, TaskErrorKind};
pub use handler::{Execution, Handler, TaskResult, from_async, from_fn};
pub use notifier::{ListenerId, QueueEvent};
pub use observability::QueueCounts;
pub use ops::{each, every, map, some};
pub use queue::{CancelFn, QueueState, TaskQueue, WeakTaskQueue};
