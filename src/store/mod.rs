//! Durable task storage for anvilq.
//!
//! Every backend implements [`TaskStore`]. The same [`StoreOps`] surface is
//! also available inside an open isolated section ([`Isolation`]), so a
//! multi-step change can run under one lock and either commit or roll back as
//! a unit.
//!
//! - **In-Memory**: fast, process-local, ideal for tests and single-process setups
//! - **PostgreSQL**: durable, shared by several producers (feature `postgres-store`)
//!
//! # Examples
//!
//! ```rust,no_run
//! use anvilq::prelude::*;
//!
//! # async fn demo() -> AnvilResult<()> {
//! let store: SharedStore = StoreFactory::in_memory(StoreConfig::default());
//! store.queue(vec![Task::new("email", serde_json::json!({"to": "a@b.c"}))]).await?;
//!
//! let session = Session::Store(store.as_ref());
//! let moved = session
//!     .isolated_change(|txn| {
//!         Box::pin(async move {
//!             let mut cursor = txn.queued(None).await?;
//!             let Some(mut task) = cursor.next().await? else {
//!                 return Ok(false);
//!             };
//!             task.started = Some(0);
//!             txn.run(&task).await?;
//!             Ok(true)
//!         })
//!     })
//!     .await?;
//! assert!(moved);
//! # Ok(())
//! # }
//! ```

use crate::config::{StoreBackendConfig, StoreConfig};
use crate::error::AnvilResult;
use crate::task::{Payload, Task, TaskId};
use async_trait::async_trait;
use futures::future::BoxFuture;
use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;

/// Implements [`StoreOps`] for a wrapper by forwarding to the result of `$ops`.
macro_rules! forward_store_ops {
    ($ty:ty, |$this:ident| $ops:expr) => {
        #[async_trait::async_trait]
        impl<P: $crate::task::Payload> $crate::store::StoreOps<P> for $ty {
            async fn get(&self, id: $crate::task::TaskId) -> $crate::error::AnvilResult<Option<$crate::task::Task<P>>> {
                let $this = self;
                $crate::store::StoreOps::<P>::get($ops, id).await
            }
            async fn remove(&self, id: $crate::task::TaskId) -> $crate::error::AnvilResult<bool> {
                let $this = self;
                $crate::store::StoreOps::<P>::remove($ops, id).await
            }
            async fn remove_by_reference(&self, reference_id: &str) -> $crate::error::AnvilResult<u64> {
                let $this = self;
                $crate::store::StoreOps::<P>::remove_by_reference($ops, reference_id).await
            }
            async fn first_with_reference(&self, reference_id: &str) -> $crate::error::AnvilResult<Option<$crate::task::Task<P>>> {
                let $this = self;
                $crate::store::StoreOps::<P>::first_with_reference($ops, reference_id).await
            }
            async fn last_with_reference(&self, reference_id: &str) -> $crate::error::AnvilResult<Option<$crate::task::Task<P>>> {
                let $this = self;
                $crate::store::StoreOps::<P>::last_with_reference($ops, reference_id).await
            }
            async fn queue(&self, tasks: Vec<$crate::task::Task<P>>) -> $crate::error::AnvilResult<()> {
                let $this = self;
                $crate::store::StoreOps::<P>::queue($ops, tasks).await
            }
            async fn run(&self, task: &$crate::task::Task<P>) -> $crate::error::AnvilResult<()> {
                let $this = self;
                $crate::store::StoreOps::<P>::run($ops, task).await
            }
            async fn failed(&self, task: &$crate::task::Task<P>) -> $crate::error::AnvilResult<()> {
                let $this = self;
                $crate::store::StoreOps::<P>::failed($ops, task).await
            }
            async fn requeue(&self, task: &$crate::task::Task<P>) -> $crate::error::AnvilResult<()> {
                let $this = self;
                $crate::store::StoreOps::<P>::requeue($ops, task).await
            }
            async fn queued(&self, task_type: Option<&str>) -> $crate::error::AnvilResult<$crate::store::ChunkedCursor<$crate::task::Task<P>>> {
                let $this = self;
                $crate::store::StoreOps::<P>::queued($ops, task_type).await
            }
            async fn running(&self, task_type: Option<&str>) -> $crate::error::AnvilResult<$crate::store::ChunkedCursor<$crate::task::Task<P>>> {
                let $this = self;
                $crate::store::StoreOps::<P>::running($ops, task_type).await
            }
            async fn failed_tasks(&self, task_type: Option<&str>) -> $crate::error::AnvilResult<$crate::store::ChunkedCursor<$crate::task::Task<P>>> {
                let $this = self;
                $crate::store::StoreOps::<P>::failed_tasks($ops, task_type).await
            }
            async fn queued_ids(&self, task_type: Option<&str>) -> $crate::error::AnvilResult<$crate::store::ChunkedCursor<$crate::task::TaskId>> {
                let $this = self;
                $crate::store::StoreOps::<P>::queued_ids($ops, task_type).await
            }
            async fn pending(&self, tag: Option<&str>) -> $crate::error::AnvilResult<$crate::store::ChunkedCursor<$crate::task::Task<P>>> {
                let $this = self;
                $crate::store::StoreOps::<P>::pending($ops, tag).await
            }
            async fn queue_size(&self, scope: $crate::store::QueueScope) -> $crate::error::AnvilResult<u64> {
                let $this = self;
                $crate::store::StoreOps::<P>::queue_size($ops, scope).await
            }
            async fn running_count(&self, scope: $crate::store::QueueScope) -> $crate::error::AnvilResult<u64> {
                let $this = self;
                $crate::store::StoreOps::<P>::running_count($ops, scope).await
            }
            async fn tags(&self) -> $crate::error::AnvilResult<std::collections::BTreeSet<String>> {
                let $this = self;
                $crate::store::StoreOps::<P>::tags($ops).await
            }
            async fn set_rate_limit(&self, tag: &str, limit: i64) -> $crate::error::AnvilResult<()> {
                let $this = self;
                $crate::store::StoreOps::<P>::set_rate_limit($ops, tag, limit).await
            }
            async fn get_rate_limit(&self, tag: &str) -> $crate::error::AnvilResult<i64> {
                let $this = self;
                $crate::store::StoreOps::<P>::get_rate_limit($ops, tag).await
            }
            async fn all_rate_limits(&self) -> $crate::error::AnvilResult<std::collections::HashMap<String, u32>> {
                let $this = self;
                $crate::store::StoreOps::<P>::all_rate_limits($ops).await
            }
            async fn set_max_retries(&self, tag: &str, limit: i64) -> $crate::error::AnvilResult<()> {
                let $this = self;
                $crate::store::StoreOps::<P>::set_max_retries($ops, tag, limit).await
            }
            async fn get_max_retries(&self, tags: &std::collections::BTreeSet<String>) -> $crate::error::AnvilResult<i64> {
                let $this = self;
                $crate::store::StoreOps::<P>::get_max_retries($ops, tags).await
            }
            async fn all_retry_limits(&self) -> $crate::error::AnvilResult<std::collections::HashMap<String, u32>> {
                let $this = self;
                $crate::store::StoreOps::<P>::all_retry_limits($ops).await
            }
            async fn task_type_estimate(&self, task_type: &str) -> $crate::error::AnvilResult<u64> {
                let $this = self;
                $crate::store::StoreOps::<P>::task_type_estimate($ops, task_type).await
            }
            async fn add_task_type_duration(&self, task_type: &str, duration_ms: u64) -> $crate::error::AnvilResult<()> {
                let $this = self;
                $crate::store::StoreOps::<P>::add_task_type_duration($ops, task_type, duration_ms).await
            }
            async fn set_task_type_estimate(&self, task_type: &str, estimate_ms: u64) -> $crate::error::AnvilResult<()> {
                let $this = self;
                $crate::store::StoreOps::<P>::set_task_type_estimate($ops, task_type, estimate_ms).await
            }
        }
    };
}

pub(crate) use forward_store_ops;

pub mod cursor;
pub mod memory;
pub mod notify;

pub use cursor::{ChunkedCursor, PageSource, VecSource};
pub use memory::InMemoryStore;
pub use notify::{ChangeChannel, ChangeEvent, ChangeListener};

#[cfg(feature = "postgres-store")]
#[cfg_attr(docsrs, doc(cfg(feature = "postgres-store")))]
pub mod postgres;

#[cfg(feature = "postgres-store")]
#[cfg_attr(docsrs, doc(cfg(feature = "postgres-store")))]
pub use postgres::PostgresStore;

/// Which tasks a count applies to.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum QueueScope {
    /// Every task
    All,
    /// Tasks of one type
    Type(String),
    /// Tasks of one group
    Group(String),
}

impl QueueScope {
    /// Whether `task` falls in this scope.
    pub fn matches<P>(&self, task: &Task<P>) -> bool {
        match self {
            QueueScope::All => true,
            QueueScope::Type(task_type) => task.task_type == *task_type,
            QueueScope::Group(group) => task.group.as_deref() == Some(group.as_str()),
        }
    }
}

/// Operations available both on a store and inside an isolated section.
///
/// Cursors are ordered by priority (highest first), then creation time, then
/// insertion order.
#[async_trait]
pub trait StoreOps<P: Payload>: Send + Sync {
    /// Fetch a task by id
    async fn get(&self, id: TaskId) -> AnvilResult<Option<Task<P>>>;

    /// Delete a task and its tags. Returns whether it existed.
    async fn remove(&self, id: TaskId) -> AnvilResult<bool>;

    /// Delete every task with the given correlation key
    async fn remove_by_reference(&self, reference_id: &str) -> AnvilResult<u64>;

    /// First task with the given correlation key in dispatch order
    async fn first_with_reference(&self, reference_id: &str) -> AnvilResult<Option<Task<P>>>;

    /// Last task with the given correlation key in dispatch order
    async fn last_with_reference(&self, reference_id: &str) -> AnvilResult<Option<Task<P>>>;

    /// Insert tasks as queued, all or nothing.
    ///
    /// Fails with `DuplicateTask` if any id is already stored or repeats in
    /// the batch. Assigns each task its insertion `order`.
    async fn queue(&self, tasks: Vec<Task<P>>) -> AnvilResult<()>;

    /// Persist `task` as running
    async fn run(&self, task: &Task<P>) -> AnvilResult<()>;

    /// Persist `task` as permanently failed
    async fn failed(&self, task: &Task<P>) -> AnvilResult<()>;

    /// Persist `task` as queued again
    async fn requeue(&self, task: &Task<P>) -> AnvilResult<()>;

    /// Queued tasks, optionally of one type
    async fn queued(&self, task_type: Option<&str>) -> AnvilResult<ChunkedCursor<Task<P>>>;

    /// Running tasks, optionally of one type
    async fn running(&self, task_type: Option<&str>) -> AnvilResult<ChunkedCursor<Task<P>>>;

    /// Failed tasks, optionally of one type
    async fn failed_tasks(&self, task_type: Option<&str>) -> AnvilResult<ChunkedCursor<Task<P>>>;

    /// Ids of queued tasks, optionally of one type
    async fn queued_ids(&self, task_type: Option<&str>) -> AnvilResult<ChunkedCursor<TaskId>>;

    /// Running then queued tasks, optionally only those carrying `tag`
    async fn pending(&self, tag: Option<&str>) -> AnvilResult<ChunkedCursor<Task<P>>>;

    /// Number of queued tasks in scope
    async fn queue_size(&self, scope: QueueScope) -> AnvilResult<u64>;

    /// Number of running tasks in scope
    async fn running_count(&self, scope: QueueScope) -> AnvilResult<u64>;

    /// Every tag carried by a stored task
    async fn tags(&self) -> AnvilResult<BTreeSet<String>>;

    /// Set the concurrency limit for a tag. Zero or less removes it.
    async fn set_rate_limit(&self, tag: &str, limit: i64) -> AnvilResult<()>;

    /// Concurrency limit for a tag, `-1` when unlimited
    async fn get_rate_limit(&self, tag: &str) -> AnvilResult<i64>;

    /// Every configured concurrency limit
    async fn all_rate_limits(&self) -> AnvilResult<HashMap<String, u32>>;

    /// Set the retry limit for a tag. Zero or less removes it.
    async fn set_max_retries(&self, tag: &str, limit: i64) -> AnvilResult<()>;

    /// Largest retry limit over `tags`, `-1` when none is configured
    async fn get_max_retries(&self, tags: &BTreeSet<String>) -> AnvilResult<i64>;

    /// Every configured retry limit
    async fn all_retry_limits(&self) -> AnvilResult<HashMap<String, u32>>;

    /// Average recorded duration for a task type in milliseconds, 0 when unknown
    async fn task_type_estimate(&self, task_type: &str) -> AnvilResult<u64>;

    /// Record one observed duration for a task type
    async fn add_task_type_duration(&self, task_type: &str, duration_ms: u64) -> AnvilResult<()>;

    /// Replace the recorded durations for a task type with one value
    async fn set_task_type_estimate(&self, task_type: &str, estimate_ms: u64) -> AnvilResult<()>;
}

/// An open isolated section.
///
/// Dropping it without [`Isolation::commit`] rolls it back.
#[async_trait]
pub trait Isolation<P: Payload>: StoreOps<P> {
    /// View as plain store operations
    fn as_ops(&self) -> &dyn StoreOps<P>;

    /// Make every change of the section visible and release the lock
    async fn commit(self: Box<Self>) -> AnvilResult<()>;

    /// Undo every change of the section and release the lock
    async fn rollback(self: Box<Self>) -> AnvilResult<()>;
}

/// A task store backend.
#[async_trait]
pub trait TaskStore<P: Payload>: StoreOps<P> {
    /// View as plain store operations
    fn as_ops(&self) -> &dyn StoreOps<P>;

    /// Open an exclusive section, waiting at most the configured lock timeout
    async fn begin_isolated(&self) -> AnvilResult<Box<dyn Isolation<P> + '_>>;

    /// Subscribe to change notifications
    fn changes(&self) -> ChangeListener;

    /// Wake everyone waiting for a change. Never blocks.
    fn signal_change(&self);

    /// Wait for the next change, or at most the configured poll interval
    async fn wait_for_change(&self) -> ChangeEvent;

    /// Release connections and background listeners
    async fn close(&self) -> AnvilResult<()>;
}

/// Shared handle to a store backend.
pub type SharedStore<P = serde_json::Value> = Arc<dyn TaskStore<P>>;

/// The store context an operation runs in.
///
/// Carrying the open section explicitly lets nested calls join it instead of
/// trying to take the isolation lock a second time.
pub enum Session<'a, P: Payload> {
    /// No section is open
    Store(&'a dyn TaskStore<P>),
    /// Running inside an open section
    Isolated(&'a dyn Isolation<P>),
}

impl<P: Payload> Clone for Session<'_, P> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<P: Payload> Copy for Session<'_, P> {}

impl<'a, P: Payload> Session<'a, P> {
    /// Store operations for this context.
    pub fn ops(&self) -> &'a dyn StoreOps<P> {
        match *self {
            Session::Store(store) => store.as_ops(),
            Session::Isolated(txn) => txn.as_ops(),
        }
    }

    /// Whether a section is already open.
    pub fn is_isolated(&self) -> bool {
        matches!(self, Session::Isolated(_))
    }

    /// Run `change` inside an isolated section.
    ///
    /// Outside a section a new one is opened, committed when `change`
    /// succeeds and rolled back when it fails. Inside a section `change` joins
    /// it and the outer owner decides.
    pub async fn isolated_change<R, F>(&self, change: F) -> AnvilResult<R>
    where
        R: Send,
        F: for<'t> FnOnce(&'t dyn Isolation<P>) -> BoxFuture<'t, AnvilResult<R>> + Send,
    {
        match *self {
            Session::Isolated(txn) => change(txn).await,
            Session::Store(store) => {
                let txn = store.begin_isolated().await?;
                match change(&*txn).await {
                    Ok(value) => {
                        txn.commit().await?;
                        Ok(value)
                    }
                    Err(err) => {
                        tracing::warn!(error = %err, "Isolated change failed, rolling back");
                        if let Err(rollback_err) = txn.rollback().await {
                            tracing::warn!(error = %rollback_err, "Rollback failed");
                        }
                        Err(err)
                    }
                }
            }
        }
    }
}

/// Factory methods for creating store backends
pub struct StoreFactory;

impl StoreFactory {
    /// Create an in-memory store
    pub fn in_memory<P: Payload>(config: StoreConfig) -> SharedStore<P> {
        Arc::new(InMemoryStore::with_config(config))
    }

    /// Connect a PostgreSQL store and create its tables
    #[cfg(feature = "postgres-store")]
    #[cfg_attr(docsrs, doc(cfg(feature = "postgres-store")))]
    pub async fn postgres<P: Payload>(config: StoreConfig) -> AnvilResult<SharedStore<P>> {
        let store = PostgresStore::connect(config).await?;
        store.create_tables().await?;
        Ok(Arc::new(store))
    }

    /// Create whichever backend `config` names
    pub async fn from_config<P: Payload>(config: StoreConfig) -> AnvilResult<SharedStore<P>> {
        match &config.backend {
            StoreBackendConfig::InMemory => Ok(Self::in_memory(config)),
            #[cfg(feature = "postgres-store")]
            StoreBackendConfig::Postgres(_) => Self::postgres(config).await,
        }
    }
}
