//! In-memory store implementation for anvilq.
//!
//! This backend keeps every task in process memory. It's perfect for
//! development, testing, and single-process applications where persistence
//! across restarts is not required.
//!
//! # Features
//!
//! - **Ordered index**: cursors walk a `BTreeSet` kept in dispatch order
//! - **Isolated sections**: one async gate serializes sections and auto-commit writes
//! - **Staged writes**: a section writes to a private copy published on commit
//! - **Zero dependencies**: No external services required
//!
//! Readers only ever see committed state.

use super::{
    ChangeChannel, ChangeEvent, ChangeListener, ChunkedCursor, Isolation, PageSource, QueueScope,
    StoreOps, TaskStore,
};
use crate::config::StoreConfig;
use crate::error::{AnvilError, AnvilResult};
use crate::task::{Payload, Task, TaskId, TaskState, dispatch_order};
use async_trait::async_trait;
use std::cmp::Reverse;
use std::collections::{BTreeSet, HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard, RwLock, RwLockReadGuard, RwLockWriteGuard};
use tokio::sync::OwnedMutexGuard;

/// Position of a task in the ordered index.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
struct OrderKey {
    bucket: u8,
    priority: Reverse<i32>,
    created: u64,
    order: u64,
    id: TaskId,
}

impl OrderKey {
    fn of<P>(task: &Task<P>) -> Self {
        Self {
            bucket: bucket(task.state),
            priority: Reverse(task.priority),
            created: task.created,
            order: task.order,
            id: task.id,
        }
    }
}

/// Running sorts before queued, queued before failed.
fn bucket(state: TaskState) -> u8 {
    match state {
        TaskState::Running => 0,
        TaskState::Pending | TaskState::Queued => 1,
        TaskState::Error => 2,
    }
}

#[derive(Debug, Clone, Copy, Default)]
struct Estimate {
    total_ms: u64,
    samples: u64,
}

/// Everything the store holds.
///
/// Every write validates before it changes anything, so a failed write leaves
/// the state untouched.
#[derive(Debug, Clone)]
struct State<P> {
    tasks: HashMap<TaskId, Task<P>>,
    index: BTreeSet<OrderKey>,
    next_order: u64,
    rate_limits: HashMap<String, u32>,
    retry_limits: HashMap<String, u32>,
    estimates: HashMap<String, Estimate>,
}

impl<P> Default for State<P> {
    fn default() -> Self {
        Self {
            tasks: HashMap::new(),
            index: BTreeSet::new(),
            next_order: 1,
            rate_limits: HashMap::new(),
            retry_limits: HashMap::new(),
            estimates: HashMap::new(),
        }
    }
}

impl<P> State<P> {
    fn take(&mut self, id: &TaskId) -> Option<Task<P>> {
        let task = self.tasks.remove(id)?;
        self.index.remove(&OrderKey::of(&task));
        Some(task)
    }

    fn put(&mut self, task: Task<P>) {
        self.take(&task.id);
        self.index.insert(OrderKey::of(&task));
        self.tasks.insert(task.id, task);
    }

    /// Tasks in index order, restricted to `scan`.
    fn scan<'s>(&'s self, scan: &'s Scan) -> impl Iterator<Item = &'s Task<P>> + 's {
        self.index
            .iter()
            .filter(|key| scan.buckets().contains(&key.bucket))
            .filter_map(|key| self.tasks.get(&key.id))
            .filter(|task| scan.matches(task))
    }

    fn count(&self, state: TaskState, scope: &QueueScope) -> u64 {
        self.tasks
            .values()
            .filter(|task| task.state == state && scope.matches(task))
            .count() as u64
    }

    fn with_reference(&self, reference_id: &str) -> impl Iterator<Item = &Task<P>> {
        self.tasks
            .values()
            .filter(move |task| task.reference_id.as_deref() == Some(reference_id))
    }
}

/// Limits of zero or less remove the entry.
fn set_limit(limits: &mut HashMap<String, u32>, tag: &str, limit: i64) {
    if limit <= 0 {
        limits.remove(tag);
    } else {
        limits.insert(tag.to_string(), u32::try_from(limit).unwrap_or(u32::MAX));
    }
}

/// Which slice of the index a cursor walks.
#[derive(Debug, Clone)]
enum Scan {
    Bucket {
        state: TaskState,
        task_type: Option<String>,
    },
    Pending {
        tag: Option<String>,
    },
}

impl Scan {
    fn bucket(state: TaskState, task_type: Option<&str>) -> Self {
        Scan::Bucket {
            state,
            task_type: task_type.map(str::to_string),
        }
    }

    fn buckets(&self) -> std::ops::RangeInclusive<u8> {
        match self {
            Scan::Bucket { state, .. } => bucket(*state)..=bucket(*state),
            Scan::Pending { .. } => 0..=1,
        }
    }

    fn matches<P>(&self, task: &Task<P>) -> bool {
        match self {
            Scan::Bucket { task_type, .. } => {
                task_type.as_deref().is_none_or(|t| task.task_type == t)
            }
            Scan::Pending { tag } => tag.as_deref().is_none_or(|t| task.has_tag(t)),
        }
    }
}

/// State shared by the store, its open section and its cursors.
struct Shared<P> {
    committed: RwLock<State<P>>,
    gate: Arc<tokio::sync::Mutex<()>>,
    changes: ChangeChannel,
    config: StoreConfig,
}

impl<P> Shared<P> {
    fn read(&self) -> AnvilResult<RwLockReadGuard<'_, State<P>>> {
        self.committed
            .read()
            .map_err(|_| AnvilError::store("memory store lock poisoned"))
    }

    fn write(&self) -> AnvilResult<RwLockWriteGuard<'_, State<P>>> {
        self.committed
            .write()
            .map_err(|_| AnvilError::store("memory store lock poisoned"))
    }

    async fn lock_gate(&self) -> AnvilResult<OwnedMutexGuard<()>> {
        let timeout = self.config.lock_timeout();
        match tokio::time::timeout(timeout, Arc::clone(&self.gate).lock_owned()).await {
            Ok(guard) => Ok(guard),
            Err(_) => {
                let timeout_ms = self.config.lock_timeout_ms;
                tracing::warn!(timeout_ms, "Timed out waiting for the isolation lock");
                Err(AnvilError::LockTimeout { timeout_ms })
            }
        }
    }
}

/// The private copy of an open section, made on its first write.
type Staged<P> = Arc<Mutex<Option<State<P>>>>;

fn lock_staged<P>(staged: &Staged<P>) -> AnvilResult<MutexGuard<'_, Option<State<P>>>> {
    staged
        .lock()
        .map_err(|_| AnvilError::store("section state poisoned"))
}

/// Store operations, either auto-commit or inside a section.
struct MemoryOps<P> {
    shared: Arc<Shared<P>>,
    /// Present while a section is open
    staged: Option<Staged<P>>,
}

impl<P> Clone for MemoryOps<P> {
    fn clone(&self) -> Self {
        Self {
            shared: Arc::clone(&self.shared),
            staged: self.staged.clone(),
        }
    }
}

impl<P: Payload> MemoryOps<P> {
    /// Read from the section's copy if it has written, else from committed state.
    fn view<R>(&self, read: impl FnOnce(&State<P>) -> R) -> AnvilResult<R> {
        if let Some(staged) = &self.staged {
            if let Some(state) = lock_staged(staged)?.as_ref() {
                return Ok(read(state));
            }
        }
        Ok(read(&*self.shared.read()?))
    }

    /// Apply one write.
    ///
    /// Outside a section this waits for the gate and writes committed state.
    /// Inside one it writes the section's copy.
    async fn mutate<R>(&self, change: impl FnOnce(&mut State<P>) -> AnvilResult<R> + Send) -> AnvilResult<R> {
        let Some(staged) = &self.staged else {
            let _gate = self.shared.lock_gate().await?;
            return change(&mut *self.shared.write()?);
        };

        let mut staged = lock_staged(staged)?;
        if staged.is_none() {
            *staged = Some(self.shared.read()?.clone());
        }
        match staged.as_mut() {
            Some(state) => change(state),
            None => Err(AnvilError::store("section state missing")),
        }
    }

    async fn set_state(&self, task: &Task<P>, state: TaskState) -> AnvilResult<()> {
        let mut updated = task.clone();
        updated.state = state;
        self.mutate(move |store| {
            let Some(existing) = store.tasks.get(&updated.id) else {
                return Err(AnvilError::TaskNotFound { id: updated.id });
            };
            updated.order = existing.order;
            store.put(updated);
            Ok(())
        })
        .await
    }

    fn cursor<T: Send + Sync + 'static>(&self, scan: Scan, project: fn(&Task<P>) -> T) -> ChunkedCursor<T> {
        let source = MemorySource {
            ops: self.clone(),
            scan,
            project,
        };
        ChunkedCursor::new(Arc::new(source), self.shared.config.cursor)
    }

    /// Publish the section's copy, if it wrote anything.
    fn publish(&self) -> AnvilResult<bool> {
        let Some(staged) = &self.staged else {
            return Ok(false);
        };
        match lock_staged(staged)?.take() {
            Some(state) => {
                *self.shared.write()? = state;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    /// Throw the section's copy away.
    fn discard(&self) -> AnvilResult<bool> {
        let Some(staged) = &self.staged else {
            return Ok(false);
        };
        Ok(lock_staged(staged)?.take().is_some())
    }
}

/// Cursor source reading the index page by page.
struct MemorySource<P, T> {
    ops: MemoryOps<P>,
    scan: Scan,
    project: fn(&Task<P>) -> T,
}

#[async_trait]
impl<P: Payload, T: Send + Sync + 'static> PageSource<T> for MemorySource<P, T> {
    async fn count(&self) -> AnvilResult<u64> {
        self.ops.view(|state| state.scan(&self.scan).count() as u64)
    }

    async fn fetch(&self, offset: u64, limit: u64) -> AnvilResult<Vec<T>> {
        self.ops.view(|state| {
            state
                .scan(&self.scan)
                .skip(offset as usize)
                .take(limit as usize)
                .map(self.project)
                .collect()
        })
    }
}

#[async_trait]
impl<P: Payload> StoreOps<P> for MemoryOps<P> {
    async fn get(&self, id: TaskId) -> AnvilResult<Option<Task<P>>> {
        self.view(|state| state.tasks.get(&id).cloned())
    }

    async fn remove(&self, id: TaskId) -> AnvilResult<bool> {
        self.mutate(move |store| Ok(store.take(&id).is_some())).await
    }

    async fn remove_by_reference(&self, reference_id: &str) -> AnvilResult<u64> {
        let reference_id = reference_id.to_string();
        self.mutate(move |store| {
            let ids: Vec<TaskId> = store.with_reference(&reference_id).map(|task| task.id).collect();
            for id in &ids {
                store.take(id);
            }
            Ok(ids.len() as u64)
        })
        .await
    }

    async fn first_with_reference(&self, reference_id: &str) -> AnvilResult<Option<Task<P>>> {
        self.view(|state| state.with_reference(reference_id).min_by(|a, b| dispatch_order(*a, *b)).cloned())
    }

    async fn last_with_reference(&self, reference_id: &str) -> AnvilResult<Option<Task<P>>> {
        self.view(|state| state.with_reference(reference_id).max_by(|a, b| dispatch_order(*a, *b)).cloned())
    }

    async fn queue(&self, tasks: Vec<Task<P>>) -> AnvilResult<()> {
        self.mutate(move |store| {
            let mut seen = HashSet::with_capacity(tasks.len());
            for task in &tasks {
                if store.tasks.contains_key(&task.id) || !seen.insert(task.id) {
                    return Err(AnvilError::DuplicateTask { id: task.id });
                }
            }
            for mut task in tasks {
                task.order = store.next_order;
                task.state = TaskState::Queued;
                store.next_order += 1;
                store.put(task);
            }
            Ok(())
        })
        .await
    }

    async fn run(&self, task: &Task<P>) -> AnvilResult<()> {
        self.set_state(task, TaskState::Running).await
    }

    async fn failed(&self, task: &Task<P>) -> AnvilResult<()> {
        self.set_state(task, TaskState::Error).await
    }

    async fn requeue(&self, task: &Task<P>) -> AnvilResult<()> {
        self.set_state(task, TaskState::Queued).await
    }

    async fn queued(&self, task_type: Option<&str>) -> AnvilResult<ChunkedCursor<Task<P>>> {
        Ok(self.cursor(Scan::bucket(TaskState::Queued, task_type), Task::clone))
    }

    async fn running(&self, task_type: Option<&str>) -> AnvilResult<ChunkedCursor<Task<P>>> {
        Ok(self.cursor(Scan::bucket(TaskState::Running, task_type), Task::clone))
    }

    async fn failed_tasks(&self, task_type: Option<&str>) -> AnvilResult<ChunkedCursor<Task<P>>> {
        Ok(self.cursor(Scan::bucket(TaskState::Error, task_type), Task::clone))
    }

    async fn queued_ids(&self, task_type: Option<&str>) -> AnvilResult<ChunkedCursor<TaskId>> {
        Ok(self.cursor(Scan::bucket(TaskState::Queued, task_type), |task| task.id))
    }

    async fn pending(&self, tag: Option<&str>) -> AnvilResult<ChunkedCursor<Task<P>>> {
        let scan = Scan::Pending {
            tag: tag.map(str::to_string),
        };
        Ok(self.cursor(scan, Task::clone))
    }

    async fn queue_size(&self, scope: QueueScope) -> AnvilResult<u64> {
        self.view(|state| state.count(TaskState::Queued, &scope))
    }

    async fn running_count(&self, scope: QueueScope) -> AnvilResult<u64> {
        self.view(|state| state.count(TaskState::Running, &scope))
    }

    async fn tags(&self) -> AnvilResult<BTreeSet<String>> {
        self.view(|state| {
            state
                .tasks
                .values()
                .flat_map(|task| task.tags.iter().cloned())
                .collect()
        })
    }

    async fn set_rate_limit(&self, tag: &str, limit: i64) -> AnvilResult<()> {
        let tag = tag.to_string();
        self.mutate(move |store| {
            set_limit(&mut store.rate_limits, &tag, limit);
            Ok(())
        })
        .await
    }

    async fn get_rate_limit(&self, tag: &str) -> AnvilResult<i64> {
        self.view(|state| state.rate_limits.get(tag).map_or(-1, |limit| i64::from(*limit)))
    }

    async fn all_rate_limits(&self) -> AnvilResult<HashMap<String, u32>> {
        self.view(|state| state.rate_limits.clone())
    }

    async fn set_max_retries(&self, tag: &str, limit: i64) -> AnvilResult<()> {
        let tag = tag.to_string();
        self.mutate(move |store| {
            set_limit(&mut store.retry_limits, &tag, limit);
            Ok(())
        })
        .await
    }

    async fn get_max_retries(&self, tags: &BTreeSet<String>) -> AnvilResult<i64> {
        self.view(|state| {
            tags.iter()
                .filter_map(|tag| state.retry_limits.get(tag))
                .max()
                .map_or(-1, |limit| i64::from(*limit))
        })
    }

    async fn all_retry_limits(&self) -> AnvilResult<HashMap<String, u32>> {
        self.view(|state| state.retry_limits.clone())
    }

    async fn task_type_estimate(&self, task_type: &str) -> AnvilResult<u64> {
        self.view(|state| {
            state
                .estimates
                .get(task_type)
                .filter(|estimate| estimate.samples > 0)
                .map_or(0, |estimate| estimate.total_ms / estimate.samples)
        })
    }

    async fn add_task_type_duration(&self, task_type: &str, duration_ms: u64) -> AnvilResult<()> {
        let task_type = task_type.to_string();
        self.mutate(move |store| {
            let entry = store.estimates.entry(task_type).or_default();
            entry.total_ms = entry.total_ms.saturating_add(duration_ms);
            entry.samples += 1;
            Ok(())
        })
        .await
    }

    async fn set_task_type_estimate(&self, task_type: &str, estimate_ms: u64) -> AnvilResult<()> {
        let task_type = task_type.to_string();
        self.mutate(move |store| {
            store.estimates.insert(
                task_type,
                Estimate {
                    total_ms: estimate_ms,
                    samples: 1,
                },
            );
            Ok(())
        })
        .await
    }
}

/// In-memory store backend implementation
pub struct InMemoryStore<P = serde_json::Value> {
    ops: MemoryOps<P>,
}

impl<P: Payload> InMemoryStore<P> {
    /// Create a new in-memory store with default configuration
    pub fn new() -> Self {
        Self::with_config(StoreConfig::default())
    }

    /// Create a new in-memory store with custom configuration
    pub fn with_config(config: StoreConfig) -> Self {
        let shared = Shared {
            committed: RwLock::new(State::default()),
            gate: Arc::new(tokio::sync::Mutex::new(())),
            changes: ChangeChannel::new(),
            config,
        };
        Self {
            ops: MemoryOps {
                shared: Arc::new(shared),
                staged: None,
            },
        }
    }

    /// Number of stored tasks in any state
    pub fn len(&self) -> usize {
        self.ops
            .shared
            .read()
            .map(|state| state.tasks.len())
            .unwrap_or(0)
    }

    /// Whether the store holds no task
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl<P: Payload> Default for InMemoryStore<P> {
    fn default() -> Self {
        Self::new()
    }
}

forward_store_ops!(InMemoryStore<P>, |this| &this.ops);

#[async_trait]
impl<P: Payload> TaskStore<P> for InMemoryStore<P> {
    fn as_ops(&self) -> &dyn StoreOps<P> {
        self
    }

    async fn begin_isolated(&self) -> AnvilResult<Box<dyn Isolation<P> + '_>> {
        let guard = self.ops.shared.lock_gate().await?;
        tracing::trace!("Isolated section opened");
        Ok(Box::new(MemoryIsolation {
            ops: MemoryOps {
                shared: Arc::clone(&self.ops.shared),
                staged: Some(Arc::new(Mutex::new(None))),
            },
            _guard: guard,
        }))
    }

    fn changes(&self) -> ChangeListener {
        self.ops.shared.changes.subscribe()
    }

    fn signal_change(&self) {
        self.ops.shared.changes.publish();
    }

    async fn wait_for_change(&self) -> ChangeEvent {
        let poll = self.ops.shared.config.change_poll_interval();
        self.changes().wait(poll).await
    }

    async fn close(&self) -> AnvilResult<()> {
        self.ops.shared.changes.close();
        Ok(())
    }
}

/// An open section of an [`InMemoryStore`].
///
/// Dropping it without committing discards its writes.
struct MemoryIsolation<P: Payload> {
    ops: MemoryOps<P>,
    _guard: OwnedMutexGuard<()>,
}

forward_store_ops!(MemoryIsolation<P>, |this| &this.ops);

#[async_trait]
impl<P: Payload> Isolation<P> for MemoryIsolation<P> {
    fn as_ops(&self) -> &dyn StoreOps<P> {
        self
    }

    async fn commit(self: Box<Self>) -> AnvilResult<()> {
        let written = self.ops.publish()?;
        tracing::debug!(written, "Isolated section committed");
        Ok(())
    }

    async fn rollback(self: Box<Self>) -> AnvilResult<()> {
        if self.ops.discard()? {
            tracing::warn!("Rolling back isolated section");
        }
        Ok(())
    }
}

impl<P: Payload> Drop for MemoryIsolation<P> {
    fn drop(&mut self) {
        // Cursors opened in the section may outlive it
        if let Err(err) = self.ops.discard() {
            tracing::warn!(error = %err, "Discarding dropped section failed");
        }
    }
}
