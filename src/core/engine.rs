//! The anvilq engine - prioritised, rate limited dispatch over a task store.
//!
//! The engine owns the queue semantics on top of any [`TaskStore`](crate::store::TaskStore):
//! - Submitting tasks and waking waiting consumers
//! - Selecting the next task while honouring per-tag concurrency limits
//! - Acknowledging, cancelling and retrying tasks
//! - Putting every running task back in the queue after a restart

use crate::config::EngineConfig;
use crate::core::listener::{Listeners, QueueListener, TaskOutcome};
use crate::error::{AnvilError, AnvilResult};
use crate::store::{ChangeEvent, ChunkedCursor, Isolation, QueueScope, Session, SharedStore};
use crate::task::{Payload, Task, TaskId, TaskState};
use crate::utils::monotonic_millis;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

/// Queue engine over a shared store.
pub struct QueueEngine<P: Payload = serde_json::Value> {
    /// Backing store
    store: SharedStore<P>,
    /// Configuration
    config: EngineConfig,
    /// Registered observers
    listeners: Listeners<P>,
}

impl<P: Payload> QueueEngine<P> {
    /// Create an engine over `store`
    pub fn new(store: SharedStore<P>, config: EngineConfig) -> Self {
        Self {
            store,
            config,
            listeners: Listeners::new(),
        }
    }

    /// The backing store
    pub fn store(&self) -> &SharedStore<P> {
        &self.store
    }

    /// Engine configuration
    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Register an observer
    pub fn add_listener(&self, listener: Arc<dyn QueueListener<P>>) {
        self.listeners.add(listener);
    }

    /// Remove every observer
    pub fn clear_listeners(&self) {
        self.listeners.clear();
    }

    fn session(&self) -> Session<'_, P> {
        Session::Store(self.store.as_ref())
    }

    /// Queue one task
    pub async fn submit(&self, task: Task<P>) -> AnvilResult<TaskId> {
        let id = task.id;
        self.submit_all(vec![task]).await?;
        Ok(id)
    }

    /// Queue a batch of tasks, all or nothing
    pub async fn submit_all(&self, tasks: Vec<Task<P>>) -> AnvilResult<Vec<TaskId>> {
        if tasks.is_empty() {
            return Ok(Vec::new());
        }

        let ids: Vec<TaskId> = tasks.iter().map(|task| task.id).collect();
        let observed: Vec<Task<P>> = if self.listeners.is_empty() {
            Vec::new()
        } else {
            tasks
                .iter()
                .cloned()
                .map(|mut task| {
                    task.state = TaskState::Queued;
                    task
                })
                .collect()
        };

        self.store.queue(tasks).await?;
        self.store.signal_change();

        tracing::debug!(count = ids.len(), "Tasks submitted");
        for task in &observed {
            self.listeners.notify("submit", |l| l.on_submit(task));
        }
        Ok(ids)
    }

    /// One selection attempt. Returns `None` when nothing is eligible.
    pub async fn try_acquire(&self) -> AnvilResult<Option<Task<P>>> {
        let task = self
            .session()
            .isolated_change(|txn| Box::pin(select_next(txn)))
            .await?;

        if let Some(task) = &task {
            tracing::debug!(task_id = %task.id, task_type = %task.task_type, "🔨 Task acquired");
            self.listeners.notify("acquire", |l| l.on_acquire(task));
        }
        Ok(task)
    }

    /// Wait until a task is eligible and mark it running.
    ///
    /// Fails with [`AnvilError::Closed`] once the store is closed.
    pub async fn acquire(&self) -> AnvilResult<Task<P>> {
        self.wait_for_task(&CancellationToken::new(), None)
            .await?
            .ok_or(AnvilError::Closed)
    }

    /// Like [`QueueEngine::acquire`] but gives up after `timeout`.
    pub async fn acquire_timeout(&self, timeout: Duration) -> AnvilResult<Option<Task<P>>> {
        self.wait_for_task(&CancellationToken::new(), Some(Instant::now() + timeout))
            .await
    }

    /// Like [`QueueEngine::acquire`] but returns `None` once `cancel` fires.
    ///
    /// Cancellation is only observed between attempts, so a selection that
    /// already committed is always returned.
    pub async fn acquire_until(&self, cancel: &CancellationToken) -> AnvilResult<Option<Task<P>>> {
        self.wait_for_task(cancel, None).await
    }

    async fn wait_for_task(
        &self,
        cancel: &CancellationToken,
        deadline: Option<Instant>,
    ) -> AnvilResult<Option<Task<P>>> {
        // Subscribed before the first attempt so a change in between is not missed
        let mut changes = self.store.changes();
        loop {
            if cancel.is_cancelled() {
                return Ok(None);
            }
            match self.try_acquire().await {
                Ok(Some(task)) => return Ok(Some(task)),
                Ok(None) => {}
                Err(AnvilError::LockTimeout { timeout_ms }) => {
                    tracing::warn!(timeout_ms, "Lock contention while acquiring, retrying");
                    continue;
                }
                Err(err) => return Err(err),
            }

            let mut poll = self.config.poll_interval();
            if let Some(deadline) = deadline {
                let remaining = deadline.saturating_duration_since(Instant::now());
                if remaining.is_zero() {
                    return Ok(None);
                }
                poll = poll.min(remaining);
            }

            tokio::select! {
                _ = cancel.cancelled() => return Ok(None),
                event = changes.wait(poll) => {
                    if event == ChangeEvent::Closed {
                        return Err(AnvilError::Closed);
                    }
                }
            }
        }
    }

    /// Mark a task done and record how long it ran.
    ///
    /// Returns `false` when the task is unknown.
    pub async fn acknowledge(&self, id: TaskId) -> AnvilResult<bool> {
        let removed = self
            .session()
            .isolated_change(move |txn| {
                Box::pin(async move {
                    let Some(task) = txn.get(id).await? else {
                        return Ok(None);
                    };
                    txn.remove(id).await?;
                    if let (TaskState::Running, Some(started)) = (task.state, task.started) {
                        let duration = monotonic_millis().saturating_sub(started);
                        txn.add_task_type_duration(&task.task_type, duration).await?;
                    }
                    Ok(Some(task))
                })
            })
            .await?;

        let Some(task) = removed else {
            tracing::debug!(task_id = %id, "Acknowledged unknown task");
            return Ok(false);
        };

        self.store.signal_change();
        tracing::debug!(task_id = %id, task_type = %task.task_type, "Task completed");
        self.listeners.notify("done", |l| l.on_done(&task, TaskOutcome::Completed));
        Ok(true)
    }

    /// Give a task up.
    ///
    /// With `requeue` a running task goes back in the queue, or to the error
    /// bucket once its retry limit is used up. Without it the task is removed.
    /// Returns `false` when nothing changed.
    pub async fn cancel(&self, id: TaskId, requeue: bool) -> AnvilResult<bool> {
        let changed = self
            .session()
            .isolated_change(move |txn| Box::pin(cancel_task(txn, id, requeue)))
            .await?;

        let Some((task, outcome)) = changed else {
            return Ok(false);
        };

        self.store.signal_change();
        match outcome {
            TaskOutcome::Failed => tracing::warn!(
                task_id = %id,
                task_type = %task.task_type,
                attempts = task.attempts,
                "Task failed after exhausting its retries"
            ),
            _ => tracing::debug!(task_id = %id, ?outcome, attempts = task.attempts, "Task cancelled"),
        }
        self.listeners.notify("done", |l| l.on_done(&task, outcome));
        Ok(true)
    }

    /// Put every running task back in the queue without counting a retry.
    pub async fn requeue_all(&self) -> AnvilResult<u64> {
        let count = self
            .session()
            .isolated_change(|txn| Box::pin(requeue_running(txn)))
            .await?;

        if count > 0 {
            self.store.signal_change();
            tracing::info!(count, "Requeued running tasks");
        }
        Ok(count)
    }

    /// Remove every task with the given correlation key
    pub async fn cancel_by_reference(&self, reference_id: &str) -> AnvilResult<u64> {
        let removed = self.store.remove_by_reference(reference_id).await?;
        if removed > 0 {
            self.store.signal_change();
        }
        Ok(removed)
    }

    /// Queued plus running tasks
    pub async fn size(&self) -> AnvilResult<u64> {
        let queued = self.store.queue_size(QueueScope::All).await?;
        let running = self.store.running_count(QueueScope::All).await?;
        Ok(queued + running)
    }

    /// Queued tasks in scope
    pub async fn queue_size(&self, scope: QueueScope) -> AnvilResult<u64> {
        self.store.queue_size(scope).await
    }

    /// Running tasks in scope
    pub async fn running_count(&self, scope: QueueScope) -> AnvilResult<u64> {
        self.store.running_count(scope).await
    }

    /// Tasks that exhausted their retries
    pub async fn failed_tasks(&self, task_type: Option<&str>) -> AnvilResult<ChunkedCursor<Task<P>>> {
        self.store.failed_tasks(task_type).await
    }

    /// Fetch a task by id
    pub async fn get(&self, id: TaskId) -> AnvilResult<Option<Task<P>>> {
        self.store.get(id).await
    }

    /// Set the concurrency limit for a tag. Zero or less removes it.
    pub async fn set_rate_limit(&self, tag: &str, limit: i64) -> AnvilResult<()> {
        self.store.set_rate_limit(tag, limit).await?;
        // A raised limit can unblock waiting consumers
        self.store.signal_change();
        Ok(())
    }

    /// Concurrency limit for a tag, `-1` when unlimited
    pub async fn rate_limit(&self, tag: &str) -> AnvilResult<i64> {
        self.store.get_rate_limit(tag).await
    }

    /// Set the retry limit for a tag. Zero or less removes it.
    pub async fn set_max_retries(&self, tag: &str, limit: i64) -> AnvilResult<()> {
        self.store.set_max_retries(tag, limit).await
    }

    /// Largest retry limit over `tags`, `-1` when none is configured
    pub async fn max_retries(&self, tags: &std::collections::BTreeSet<String>) -> AnvilResult<i64> {
        self.store.get_max_retries(tags).await
    }

    /// Average recorded duration for a task type in milliseconds
    pub async fn task_type_estimate(&self, task_type: &str) -> AnvilResult<u64> {
        self.store.task_type_estimate(task_type).await
    }

    /// Override the duration estimate for a task type
    pub async fn set_task_type_estimate(&self, task_type: &str, estimate_ms: u64) -> AnvilResult<()> {
        self.store.set_task_type_estimate(task_type, estimate_ms).await
    }

    /// Close the store. Waiting acquirers fail with [`AnvilError::Closed`].
    pub async fn close(&self) -> AnvilResult<()> {
        self.store.close().await
    }
}

/// Pick the first eligible queued task and mark it running.
async fn select_next<P: Payload>(txn: &dyn Isolation<P>) -> AnvilResult<Option<Task<P>>> {
    let limits = txn.all_rate_limits().await?;

    let chosen = if limits.is_empty() {
        let mut cursor = txn.queued(None).await?;
        let first = cursor.next().await?;
        cursor.close();
        first
    } else {
        let mut running: HashMap<String, u32> = HashMap::new();
        let mut chosen = None;
        let mut cursor = txn.pending(None).await?;

        while let Some(task) = cursor.next().await? {
            match task.state {
                // Running tasks come first in pending order
                TaskState::Running => {
                    for tag in task.tags.iter().filter(|tag| limits.contains_key(*tag)) {
                        *running.entry(tag.clone()).or_default() += 1;
                    }
                }
                TaskState::Queued => {
                    let blocked = task.tags.iter().any(|tag| {
                        limits
                            .get(tag)
                            .is_some_and(|limit| running.get(tag).copied().unwrap_or(0) >= *limit)
                    });
                    if !blocked {
                        chosen = Some(task);
                        break;
                    }
                }
                TaskState::Pending | TaskState::Error => {}
            }
        }
        cursor.close();
        chosen
    };

    let Some(mut task) = chosen else {
        return Ok(None);
    };
    task.started = Some(monotonic_millis());
    txn.run(&task).await?;
    task.state = TaskState::Running;
    Ok(Some(task))
}

async fn cancel_task<P: Payload>(
    txn: &dyn Isolation<P>,
    id: TaskId,
    requeue: bool,
) -> AnvilResult<Option<(Task<P>, TaskOutcome)>> {
    let Some(mut task) = txn.get(id).await? else {
        return Ok(None);
    };

    if !requeue {
        txn.remove(id).await?;
        return Ok(Some((task, TaskOutcome::Cancelled)));
    }
    if task.state != TaskState::Running {
        return Ok(None);
    }

    let max_retries = txn.get_max_retries(&task.tags).await?;
    if max_retries > 0 && i64::from(task.attempts) >= max_retries {
        txn.failed(&task).await?;
        task.state = TaskState::Error;
        return Ok(Some((task, TaskOutcome::Failed)));
    }

    task.attempts += 1;
    task.started = None;
    txn.requeue(&task).await?;
    task.state = TaskState::Queued;
    Ok(Some((task, TaskOutcome::Requeued)))
}

async fn requeue_running<P: Payload>(txn: &dyn Isolation<P>) -> AnvilResult<u64> {
    let parts = txn.running(None).await?.into_parallel().await?;
    let batches = futures::future::try_join_all(parts.into_iter().map(ChunkedCursor::collect_all)).await?;

    let mut count = 0;
    for mut task in batches.into_iter().flatten() {
        task.started = None;
        txn.requeue(&task).await?;
        count += 1;
    }
    Ok(count)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::StoreConfig;
    use crate::store::StoreFactory;
    use serde_json::json;
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicU64, Ordering};
    use tokio_test::assert_ok;

    fn create_test_engine() -> QueueEngine {
        let store = StoreFactory::in_memory(
            StoreConfig::default()
                .with_lock_timeout(500)
                .with_change_poll_interval(20),
        );
        QueueEngine::new(store, EngineConfig::default().with_poll_interval(20))
    }

    fn create_test_task(priority: i32) -> Task {
        Task::new("test_task", json!({"test": "data"})).with_priority(priority)
    }

    #[derive(Default)]
    struct Recording {
        events: Mutex<Vec<(TaskId, TaskOutcome)>>,
    }

    impl QueueListener<serde_json::Value> for Recording {
        fn on_done(&self, task: &Task, outcome: TaskOutcome) {
            self.events.lock().unwrap().push((task.id, outcome));
        }
    }

    #[tokio::test]
    async fn test_same_priority_is_fifo() {
        let engine = create_test_engine();
        let ids = engine
            .submit_all((0..3).map(|_| create_test_task(0)).collect())
            .await
            .unwrap();

        for id in ids {
            let task = engine.acquire().await.unwrap();
            assert_eq!(task.id, id);
            assert_eq!(task.state, TaskState::Running);
            assert!(task.started.is_some());
        }
        assert!(engine.try_acquire().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_higher_priority_first() {
        let engine = create_test_engine();
        let low_first = engine.submit(create_test_task(1)).await.unwrap();
        let high = engine.submit(create_test_task(5)).await.unwrap();
        let low_second = engine.submit(create_test_task(1)).await.unwrap();

        assert_eq!(engine.acquire().await.unwrap().id, high);
        assert_eq!(engine.acquire().await.unwrap().id, low_first);
        assert_eq!(engine.acquire().await.unwrap().id, low_second);
    }

    #[tokio::test]
    async fn test_rate_limit_blocks_tag() {
        let engine = create_test_engine();
        engine.set_rate_limit("io", 1).await.unwrap();

        let first = engine.submit(create_test_task(0).with_tag("io")).await.unwrap();
        let second = engine.submit(create_test_task(0).with_tag("io")).await.unwrap();
        let untagged = engine.submit(create_test_task(0)).await.unwrap();

        assert_eq!(engine.acquire().await.unwrap().id, first);
        // The second io task is skipped while the first one runs
        assert_eq!(engine.acquire().await.unwrap().id, untagged);
        assert!(engine.try_acquire().await.unwrap().is_none());

        assert!(engine.acknowledge(first).await.unwrap());
        assert_eq!(engine.acquire().await.unwrap().id, second);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_rate_limit_holds_under_concurrent_acquires() {
        let store = StoreFactory::in_memory(StoreConfig::default().with_change_poll_interval(20));
        let engine = Arc::new(QueueEngine::new(store, EngineConfig::default().with_poll_interval(20)));
        engine.set_rate_limit("slow", 2).await.unwrap();
        engine
            .submit_all((0..24).map(|_| create_test_task(0).with_tag("slow")).collect())
            .await
            .unwrap();

        let peak = Arc::new(AtomicU64::new(0));
        let done = Arc::new(AtomicU64::new(0));
        let workers: Vec<_> = (0..12)
            .map(|_| {
                let engine = Arc::clone(&engine);
                let peak = Arc::clone(&peak);
                let done = Arc::clone(&done);
                tokio::spawn(async move {
                    while let Some(task) = engine.acquire_timeout(Duration::from_millis(500)).await.unwrap() {
                        let running = engine.running_count(QueueScope::All).await.unwrap();
                        peak.fetch_max(running, Ordering::SeqCst);
                        tokio::time::sleep(Duration::from_millis(5)).await;
                        assert!(engine.acknowledge(task.id).await.unwrap());
                        done.fetch_add(1, Ordering::SeqCst);
                    }
                })
            })
            .collect();
        for worker in workers {
            worker.await.unwrap();
        }

        assert_eq!(done.load(Ordering::SeqCst), 24);
        let peak = peak.load(Ordering::SeqCst);
        assert!((1..=2).contains(&peak), "peak of {peak} running tasks");
        assert_eq!(engine.size().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_removing_rate_limit_unblocks() {
        let engine = create_test_engine();
        engine.set_rate_limit("io", 1).await.unwrap();
        engine.submit(create_test_task(0).with_tag("io")).await.unwrap();
        engine.submit(create_test_task(0).with_tag("io")).await.unwrap();

        engine.acquire().await.unwrap();
        assert!(engine.try_acquire().await.unwrap().is_none());

        engine.set_rate_limit("io", 0).await.unwrap();
        assert_eq!(engine.rate_limit("io").await.unwrap(), -1);
        assert!(engine.try_acquire().await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_retries_exhausted_moves_to_error() {
        let engine = create_test_engine();
        let recording = Arc::new(Recording::default());
        engine.add_listener(recording.clone());
        engine.set_max_retries("flaky", 2).await.unwrap();
        let id = engine.submit(create_test_task(0).with_tag("flaky")).await.unwrap();

        for attempt in 0..2 {
            let task = engine.acquire().await.unwrap();
            assert_eq!(task.attempts, attempt);
            assert!(engine.cancel(id, true).await.unwrap());
        }
        engine.acquire().await.unwrap();
        assert!(engine.cancel(id, true).await.unwrap());

        let failed = engine.get(id).await.unwrap().unwrap();
        assert_eq!(failed.state, TaskState::Error);
        assert_eq!(failed.attempts, 2);
        assert!(engine.try_acquire().await.unwrap().is_none());

        let failed = engine.failed_tasks(None).await.unwrap().collect_all().await.unwrap();
        assert_eq!(failed.len(), 1);

        let outcomes: Vec<_> = recording.events.lock().unwrap().iter().map(|(_, o)| *o).collect();
        assert_eq!(
            outcomes,
            vec![TaskOutcome::Requeued, TaskOutcome::Requeued, TaskOutcome::Failed]
        );
    }

    #[tokio::test]
    async fn test_requeue_without_limit_has_no_cap() {
        let engine = create_test_engine();
        let id = engine.submit(create_test_task(0)).await.unwrap();

        for _ in 0..5 {
            engine.acquire().await.unwrap();
            assert!(engine.cancel(id, true).await.unwrap());
        }
        let task = engine.get(id).await.unwrap().unwrap();
        assert_eq!(task.state, TaskState::Queued);
        assert_eq!(task.attempts, 5);
    }

    #[tokio::test]
    async fn test_cancel_semantics() {
        let engine = create_test_engine();
        let id = engine.submit(create_test_task(0)).await.unwrap();

        // Not running, nothing to requeue
        assert!(!assert_ok!(engine.cancel(id, true).await));
        assert_eq!(assert_ok!(engine.size().await), 1);

        assert!(assert_ok!(engine.cancel(id, false).await));
        assert!(assert_ok!(engine.get(id).await).is_none());
        assert!(!assert_ok!(engine.cancel(id, false).await));
    }

    #[tokio::test]
    async fn test_acknowledge_is_idempotent() {
        let engine = create_test_engine();
        let id = engine.submit(create_test_task(0)).await.unwrap();
        engine.acquire().await.unwrap();

        assert!(engine.acknowledge(id).await.unwrap());
        assert!(!engine.acknowledge(id).await.unwrap());
        assert_eq!(engine.size().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_acknowledge_records_duration() {
        let engine = create_test_engine();
        let id = engine.submit(create_test_task(0)).await.unwrap();
        engine.acquire().await.unwrap();
        tokio::time::sleep(Duration::from_millis(30)).await;
        engine.acknowledge(id).await.unwrap();

        assert!(engine.task_type_estimate("test_task").await.unwrap() >= 30);

        engine.set_task_type_estimate("test_task", 5).await.unwrap();
        assert_eq!(engine.task_type_estimate("test_task").await.unwrap(), 5);
    }

    #[tokio::test]
    async fn test_requeue_all_restores_running_tasks() {
        let engine = create_test_engine();
        engine
            .submit_all((0..3).map(|_| create_test_task(0)).collect())
            .await
            .unwrap();
        engine.acquire().await.unwrap();
        engine.acquire().await.unwrap();

        assert_eq!(engine.requeue_all().await.unwrap(), 2);
        assert_eq!(engine.running_count(QueueScope::All).await.unwrap(), 0);
        assert_eq!(engine.queue_size(QueueScope::All).await.unwrap(), 3);

        let task = engine.acquire().await.unwrap();
        assert_eq!(task.attempts, 0);
        assert_eq!(engine.requeue_all().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_acquire_woken_by_submit() {
        let store = StoreFactory::in_memory(StoreConfig::default());
        // Long poll so only the change signal can wake the waiter in time
        let engine = Arc::new(QueueEngine::new(store, EngineConfig::default().with_poll_interval(60_000)));

        let waiter = {
            let engine = Arc::clone(&engine);
            tokio::spawn(async move { engine.acquire().await })
        };
        tokio::time::sleep(Duration::from_millis(50)).await;

        let id = engine.submit(create_test_task(0)).await.unwrap();
        let task = tokio::time::timeout(Duration::from_secs(2), waiter)
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        assert_eq!(task.id, id);
    }

    #[tokio::test]
    async fn test_acquire_fails_after_close() {
        let engine = Arc::new(create_test_engine());
        let waiter = {
            let engine = Arc::clone(&engine);
            tokio::spawn(async move { engine.acquire().await })
        };
        tokio::time::sleep(Duration::from_millis(30)).await;
        engine.close().await.unwrap();

        let result = tokio::time::timeout(Duration::from_secs(2), waiter).await.unwrap().unwrap();
        assert!(matches!(result, Err(AnvilError::Closed)));
    }

    #[tokio::test]
    async fn test_acquire_timeout_returns_none() {
        let engine = create_test_engine();
        let task = engine.acquire_timeout(Duration::from_millis(60)).await.unwrap();
        assert!(task.is_none());
    }

    #[tokio::test]
    async fn test_acquire_until_stops_when_cancelled() {
        let engine = Arc::new(create_test_engine());
        let cancel = CancellationToken::new();
        let waiter = {
            let engine = Arc::clone(&engine);
            let cancel = cancel.clone();
            tokio::spawn(async move { engine.acquire_until(&cancel).await })
        };
        tokio::time::sleep(Duration::from_millis(30)).await;
        cancel.cancel();

        let result = tokio::time::timeout(Duration::from_secs(2), waiter).await.unwrap().unwrap();
        assert!(result.unwrap().is_none());

        // Nothing was left running by the aborted wait
        engine.submit(create_test_task(0)).await.unwrap();
        assert_eq!(engine.running_count(QueueScope::All).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_cancel_by_reference() {
        let engine = create_test_engine();
        engine.submit(create_test_task(0).with_reference("order-1")).await.unwrap();
        engine.submit(create_test_task(0).with_reference("order-1")).await.unwrap();
        engine.submit(create_test_task(0).with_reference("order-2")).await.unwrap();

        assert_eq!(engine.cancel_by_reference("order-1").await.unwrap(), 2);
        assert_eq!(engine.size().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_panicking_listener_does_not_break_dispatch() {
        struct Panicking;
        impl QueueListener<serde_json::Value> for Panicking {
            fn on_acquire(&self, _task: &Task) {
                panic!("listener bug");
            }
        }

        let engine = create_test_engine();
        engine.add_listener(Arc::new(Panicking));
        let id = engine.submit(create_test_task(0)).await.unwrap();

        assert_eq!(engine.acquire().await.unwrap().id, id);
        assert!(engine.acknowledge(id).await.unwrap());
    }
}
