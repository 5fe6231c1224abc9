//! PostgreSQL store implementation for anvilq.
//!
//! Tasks live in five tables derived from one base name:
//!
//! - `{t}`: task content (JSONB) plus the columns queries filter and sort on
//! - `{t}_tags`: one row per task tag
//! - `{t}_ratelimits` / `{t}_retrylimits`: per-tag limits
//! - `{t}_estimates`: observed durations per task type
//!
//! An isolated section is a transaction holding `LOCK TABLE {t} IN EXCLUSIVE
//! MODE`, which serializes it with other sections and with every write to the
//! task table, across all processes sharing the database. Change notifications
//! travel over `LISTEN/NOTIFY` on the `{t}_event` channel.

use super::{
    ChangeChannel, ChangeEvent, ChangeListener, ChunkedCursor, Isolation, PageSource, QueueScope,
    StoreOps, TaskStore,
};
use crate::config::{CursorConfig, StoreBackendConfig, StoreConfig};
use crate::error::{AnvilError, AnvilResult};
use crate::task::{Payload, Task, TaskId, TaskState};
use async_trait::async_trait;
use sqlx::pool::PoolConnection;
use sqlx::postgres::{PgListener, PgPoolOptions, PgRow};
use sqlx::{Connection, PgConnection, PgPool, Postgres, Row, Transaction};
use std::collections::{BTreeSet, HashMap, HashSet};
use std::marker::PhantomData;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;

const SCHEMA: &str = include_str!("schema.sql");

const COLUMNS: &str = "id, content, state, task_order";

/// SQLSTATE `lock_not_available`, raised when `lock_timeout` expires.
const LOCK_NOT_AVAILABLE: &str = "55P03";

/// Quoted names of the tables behind one store.
#[derive(Debug)]
struct Tables {
    base: String,
    tasks: String,
    tags: String,
    rate_limits: String,
    retry_limits: String,
    estimates: String,
    channel: String,
}

impl Tables {
    fn new(base: &str) -> AnvilResult<Self> {
        let valid = !base.is_empty()
            && base
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '_');
        if !valid {
            return Err(AnvilError::config(format!("invalid table name '{base}'")));
        }
        Ok(Self {
            base: base.to_string(),
            tasks: format!("\"{base}\""),
            tags: format!("\"{base}_tags\""),
            rate_limits: format!("\"{base}_ratelimits\""),
            retry_limits: format!("\"{base}_retrylimits\""),
            estimates: format!("\"{base}_estimates\""),
            channel: format!("{base}_event"),
        })
    }

    fn pending_order() -> String {
        format!(
            "CASE WHEN state = {} THEN 0 ELSE 1 END, priority DESC, created ASC, task_order ASC",
            TaskState::Running.code()
        )
    }
}

const DISPATCH_ORDER: &str = "priority DESC, created ASC, task_order ASC";
const REVERSE_ORDER: &str = "priority ASC, created DESC, task_order DESC";

fn decode<P: Payload>(row: &PgRow) -> AnvilResult<Task<P>> {
    let content: serde_json::Value = row.try_get("content")?;
    let mut task: Task<P> = serde_json::from_value(content)?;
    let state: i32 = row.try_get("state")?;
    task.state = TaskState::from_code(state)
        .ok_or_else(|| AnvilError::store(format!("unknown task state {state}")))?;
    task.order = row.try_get::<i64, _>("task_order")? as u64;
    Ok(task)
}

fn is_lock_timeout(err: &sqlx::Error) -> bool {
    err.as_database_error()
        .and_then(|db| db.code())
        .is_some_and(|code| code == LOCK_NOT_AVAILABLE)
}

/// Turn an expired `lock_timeout` into [`AnvilError::LockTimeout`].
fn lock_error(err: sqlx::Error, timeout_ms: u64) -> AnvilError {
    if is_lock_timeout(&err) {
        tracing::warn!(timeout_ms, "Timed out waiting for the isolation lock");
        AnvilError::LockTimeout { timeout_ms }
    } else {
        err.into()
    }
}

fn limit_value(limit: i64) -> i32 {
    i32::try_from(limit).unwrap_or(i32::MAX)
}

/// Where statements run: the pool, or the transaction of an open section.
#[derive(Clone)]
enum Conn {
    Pool(PgPool),
    Txn(Arc<tokio::sync::Mutex<Option<Transaction<'static, Postgres>>>>),
}

enum Handle<'a> {
    Pooled(PoolConnection<Postgres>),
    Txn(tokio::sync::MutexGuard<'a, Option<Transaction<'static, Postgres>>>),
}

impl Conn {
    async fn handle(&self) -> AnvilResult<Handle<'_>> {
        match self {
            Conn::Pool(pool) => Ok(Handle::Pooled(pool.acquire().await?)),
            Conn::Txn(txn) => Ok(Handle::Txn(txn.lock().await)),
        }
    }
}

impl Handle<'_> {
    fn conn(&mut self) -> AnvilResult<&mut PgConnection> {
        match self {
            Handle::Pooled(conn) => Ok(&mut **conn),
            Handle::Txn(guard) => guard.as_mut().map(|tx| &mut **tx).ok_or(AnvilError::Closed),
        }
    }
}

/// A `WHERE` clause with its text arguments, bound as `$1..$n`.
#[derive(Debug, Clone)]
struct Filter {
    clause: String,
    args: Vec<String>,
}

impl Filter {
    fn state(state: TaskState, task_type: Option<&str>) -> Self {
        let mut filter = Self {
            clause: format!("state = {}", state.code()),
            args: Vec::new(),
        };
        if let Some(task_type) = task_type {
            filter.clause.push_str(" AND task_type = $1");
            filter.args.push(task_type.to_string());
        }
        filter
    }

    fn scoped(state: TaskState, scope: &QueueScope) -> Self {
        match scope {
            QueueScope::All => Self::state(state, None),
            QueueScope::Type(task_type) => Self::state(state, Some(task_type)),
            QueueScope::Group(group) => Self {
                clause: format!("state = {} AND task_group = $1", state.code()),
                args: vec![group.clone()],
            },
        }
    }

    fn pending(tables: &Tables, tag: Option<&str>) -> Self {
        let mut filter = Self {
            clause: format!(
                "state IN ({}, {})",
                TaskState::Running.code(),
                TaskState::Queued.code()
            ),
            args: Vec::new(),
        };
        if let Some(tag) = tag {
            filter.clause.push_str(&format!(
                " AND id IN (SELECT id FROM {} WHERE tag = $1)",
                tables.tags
            ));
            filter.args.push(tag.to_string());
        }
        filter
    }
}

/// Cursor source running one bounded query per page.
struct PgSource<P, T> {
    conn: Conn,
    tables: Arc<Tables>,
    filter: Filter,
    order: String,
    project: fn(Task<P>) -> T,
}

#[async_trait]
impl<P: Payload, T: Send + Sync + 'static> PageSource<T> for PgSource<P, T> {
    async fn count(&self) -> AnvilResult<u64> {
        let sql = format!(
            "SELECT COUNT(*) FROM {} WHERE {}",
            self.tables.tasks, self.filter.clause
        );
        let mut query = sqlx::query_scalar::<_, i64>(&sql);
        for arg in &self.filter.args {
            query = query.bind(arg);
        }
        let mut handle = self.conn.handle().await?;
        let count = query.fetch_one(handle.conn()?).await?;
        Ok(count as u64)
    }

    async fn fetch(&self, offset: u64, limit: u64) -> AnvilResult<Vec<T>> {
        let next = self.filter.args.len();
        let sql = format!(
            "SELECT {COLUMNS} FROM {} WHERE {} ORDER BY {} OFFSET ${} LIMIT ${}",
            self.tables.tasks,
            self.filter.clause,
            self.order,
            next + 1,
            next + 2
        );
        let mut query = sqlx::query(&sql);
        for arg in &self.filter.args {
            query = query.bind(arg);
        }
        let query = query.bind(offset as i64).bind(limit as i64);

        let mut handle = self.conn.handle().await?;
        let rows = query.fetch_all(handle.conn()?).await?;
        rows.iter()
            .map(|row| decode(row).map(self.project))
            .collect()
    }
}

/// Store operations over either the pool or an open section.
struct PgOps<P> {
    conn: Conn,
    tables: Arc<Tables>,
    cursor: CursorConfig,
    lock_timeout_ms: u64,
    _payload: PhantomData<fn() -> P>,
}

impl<P: Payload> PgOps<P> {
    /// Start a write transaction.
    ///
    /// On the pool it takes `ROW EXCLUSIVE` on the task table first, so it
    /// waits for an open section no longer than the lock timeout. Inside a
    /// section this is a savepoint.
    async fn begin_write<'c>(&self, conn: &'c mut PgConnection) -> AnvilResult<Transaction<'c, Postgres>> {
        let mut tx = conn.begin().await?;
        if let Conn::Pool(_) = self.conn {
            let timeout_ms = self.lock_timeout_ms;
            sqlx::query(&format!("SET LOCAL lock_timeout = '{timeout_ms}ms'"))
                .execute(&mut *tx)
                .await?;
            sqlx::query(&format!("LOCK TABLE {} IN ROW EXCLUSIVE MODE", self.tables.tasks))
                .execute(&mut *tx)
                .await
                .map_err(|err| lock_error(err, timeout_ms))?;
        }
        Ok(tx)
    }

    fn source<T: Send + Sync + 'static>(
        &self,
        filter: Filter,
        order: String,
        project: fn(Task<P>) -> T,
    ) -> ChunkedCursor<T> {
        let source = PgSource {
            conn: self.conn.clone(),
            tables: Arc::clone(&self.tables),
            filter,
            order,
            project,
        };
        ChunkedCursor::new(Arc::new(source), self.cursor)
    }

    async fn count(&self, filter: Filter) -> AnvilResult<u64> {
        PgSource::<P, ()> {
            conn: self.conn.clone(),
            tables: Arc::clone(&self.tables),
            filter,
            order: String::new(),
            project: |_| (),
        }
        .count()
        .await
    }

    async fn by_reference(&self, reference_id: &str, order: &str) -> AnvilResult<Option<Task<P>>> {
        let sql = format!(
            "SELECT {COLUMNS} FROM {} WHERE reference_id = $1 ORDER BY {order} LIMIT 1",
            self.tables.tasks
        );
        let mut handle = self.conn.handle().await?;
        let row = sqlx::query(&sql)
            .bind(reference_id)
            .fetch_optional(handle.conn()?)
            .await?;
        row.as_ref().map(decode).transpose()
    }

    async fn set_state(&self, task: &Task<P>, state: TaskState) -> AnvilResult<()> {
        let mut updated = task.clone();
        updated.state = state;
        let content = serde_json::to_value(&updated)?;

        let mut handle = self.conn.handle().await?;
        let mut tx = self.begin_write(handle.conn()?).await?;
        let result = sqlx::query(&format!(
            "UPDATE {} SET content = $2, state = $3, priority = $4, task_type = $5, \
             task_group = $6, reference_id = $7 WHERE id = $1",
            self.tables.tasks
        ))
        .bind(updated.id)
        .bind(content)
        .bind(state.code())
        .bind(updated.priority)
        .bind(&updated.task_type)
        .bind(&updated.group)
        .bind(&updated.reference_id)
        .execute(&mut *tx)
        .await?;
        if result.rows_affected() == 0 {
            return Err(AnvilError::TaskNotFound { id: updated.id });
        }

        sqlx::query(&format!("DELETE FROM {} WHERE id = $1", self.tables.tags))
            .bind(updated.id)
            .execute(&mut *tx)
            .await?;
        insert_tags(&mut tx, &self.tables, &updated).await?;
        tx.commit().await?;
        Ok(())
    }

    async fn replace_limit(&self, table: &str, tag: &str, limit: i64) -> AnvilResult<()> {
        let mut handle = self.conn.handle().await?;
        let mut tx = self.begin_write(handle.conn()?).await?;
        sqlx::query(&format!("DELETE FROM {table} WHERE tag = $1"))
            .bind(tag)
            .execute(&mut *tx)
            .await?;
        if limit > 0 {
            sqlx::query(&format!("INSERT INTO {table} (tag, \"limit\") VALUES ($1, $2)"))
                .bind(tag)
                .bind(limit_value(limit))
                .execute(&mut *tx)
                .await?;
        }
        tx.commit().await?;
        Ok(())
    }

    async fn limits(&self, table: &str) -> AnvilResult<HashMap<String, u32>> {
        let mut handle = self.conn.handle().await?;
        let rows: Vec<(String, i32)> =
            sqlx::query_as(&format!("SELECT tag, \"limit\" FROM {table}"))
                .fetch_all(handle.conn()?)
                .await?;
        Ok(rows
            .into_iter()
            .filter(|(_, limit)| *limit > 0)
            .map(|(tag, limit)| (tag, limit as u32))
            .collect())
    }
}

async fn insert_tags<P: Payload>(
    conn: &mut PgConnection,
    tables: &Tables,
    task: &Task<P>,
) -> AnvilResult<()> {
    let sql = format!("INSERT INTO {} (id, tag) VALUES ($1, $2)", tables.tags);
    for tag in &task.tags {
        sqlx::query(&sql)
            .bind(task.id)
            .bind(tag)
            .execute(&mut *conn)
            .await?;
    }
    Ok(())
}

#[async_trait]
impl<P: Payload> StoreOps<P> for PgOps<P> {
    async fn get(&self, id: TaskId) -> AnvilResult<Option<Task<P>>> {
        let sql = format!("SELECT {COLUMNS} FROM {} WHERE id = $1", self.tables.tasks);
        let mut handle = self.conn.handle().await?;
        let row = sqlx::query(&sql)
            .bind(id)
            .fetch_optional(handle.conn()?)
            .await?;
        row.as_ref().map(decode).transpose()
    }

    async fn remove(&self, id: TaskId) -> AnvilResult<bool> {
        let mut handle = self.conn.handle().await?;
        let mut tx = self.begin_write(handle.conn()?).await?;
        let result = sqlx::query(&format!("DELETE FROM {} WHERE id = $1", self.tables.tasks))
            .bind(id)
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;
        Ok(result.rows_affected() > 0)
    }

    async fn remove_by_reference(&self, reference_id: &str) -> AnvilResult<u64> {
        let mut handle = self.conn.handle().await?;
        let mut tx = self.begin_write(handle.conn()?).await?;
        let result = sqlx::query(&format!(
            "DELETE FROM {} WHERE reference_id = $1",
            self.tables.tasks
        ))
        .bind(reference_id)
        .execute(&mut *tx)
        .await?;
        tx.commit().await?;
        Ok(result.rows_affected())
    }

    async fn first_with_reference(&self, reference_id: &str) -> AnvilResult<Option<Task<P>>> {
        self.by_reference(reference_id, DISPATCH_ORDER).await
    }

    async fn last_with_reference(&self, reference_id: &str) -> AnvilResult<Option<Task<P>>> {
        self.by_reference(reference_id, REVERSE_ORDER).await
    }

    async fn queue(&self, tasks: Vec<Task<P>>) -> AnvilResult<()> {
        let mut seen = HashSet::with_capacity(tasks.len());
        for task in &tasks {
            if !seen.insert(task.id) {
                return Err(AnvilError::DuplicateTask { id: task.id });
            }
        }
        let ids: Vec<TaskId> = seen.into_iter().collect();

        let mut handle = self.conn.handle().await?;
        let mut tx = self.begin_write(handle.conn()?).await?;

        let existing: Option<TaskId> = sqlx::query_scalar(&format!(
            "SELECT id FROM {} WHERE id = ANY($1) LIMIT 1",
            self.tables.tasks
        ))
        .bind(&ids)
        .fetch_optional(&mut *tx)
        .await?;
        if let Some(id) = existing {
            return Err(AnvilError::DuplicateTask { id });
        }

        let insert = format!(
            "INSERT INTO {} (id, content, state, priority, task_type, task_group, reference_id, created) \
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8)",
            self.tables.tasks
        );
        for mut task in tasks {
            task.state = TaskState::Queued;
            sqlx::query(&insert)
                .bind(task.id)
                .bind(serde_json::to_value(&task)?)
                .bind(TaskState::Queued.code())
                .bind(task.priority)
                .bind(&task.task_type)
                .bind(&task.group)
                .bind(&task.reference_id)
                .bind(task.created as i64)
                .execute(&mut *tx)
                .await?;
            insert_tags(&mut tx, &self.tables, &task).await?;
        }
        tx.commit().await?;
        Ok(())
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
        let filter = Filter::state(TaskState::Queued, task_type);
        Ok(self.source(filter, DISPATCH_ORDER.to_string(), |task| task))
    }

    async fn running(&self, task_type: Option<&str>) -> AnvilResult<ChunkedCursor<Task<P>>> {
        let filter = Filter::state(TaskState::Running, task_type);
        Ok(self.source(filter, DISPATCH_ORDER.to_string(), |task| task))
    }

    async fn failed_tasks(&self, task_type: Option<&str>) -> AnvilResult<ChunkedCursor<Task<P>>> {
        let filter = Filter::state(TaskState::Error, task_type);
        Ok(self.source(filter, DISPATCH_ORDER.to_string(), |task| task))
    }

    async fn queued_ids(&self, task_type: Option<&str>) -> AnvilResult<ChunkedCursor<TaskId>> {
        let filter = Filter::state(TaskState::Queued, task_type);
        Ok(self.source(filter, DISPATCH_ORDER.to_string(), |task| task.id))
    }

    async fn pending(&self, tag: Option<&str>) -> AnvilResult<ChunkedCursor<Task<P>>> {
        let filter = Filter::pending(&self.tables, tag);
        Ok(self.source(filter, Tables::pending_order(), |task| task))
    }

    async fn queue_size(&self, scope: QueueScope) -> AnvilResult<u64> {
        self.count(Filter::scoped(TaskState::Queued, &scope)).await
    }

    async fn running_count(&self, scope: QueueScope) -> AnvilResult<u64> {
        self.count(Filter::scoped(TaskState::Running, &scope)).await
    }

    async fn tags(&self) -> AnvilResult<BTreeSet<String>> {
        let mut handle = self.conn.handle().await?;
        let tags: Vec<String> =
            sqlx::query_scalar(&format!("SELECT DISTINCT tag FROM {}", self.tables.tags))
                .fetch_all(handle.conn()?)
                .await?;
        Ok(tags.into_iter().collect())
    }

    async fn set_rate_limit(&self, tag: &str, limit: i64) -> AnvilResult<()> {
        self.replace_limit(&self.tables.rate_limits, tag, limit).await
    }

    async fn get_rate_limit(&self, tag: &str) -> AnvilResult<i64> {
        let mut handle = self.conn.handle().await?;
        let limit: Option<i32> = sqlx::query_scalar(&format!(
            "SELECT \"limit\" FROM {} WHERE tag = $1",
            self.tables.rate_limits
        ))
        .bind(tag)
        .fetch_optional(handle.conn()?)
        .await?;
        Ok(limit.filter(|l| *l > 0).map_or(-1, i64::from))
    }

    async fn all_rate_limits(&self) -> AnvilResult<HashMap<String, u32>> {
        self.limits(&self.tables.rate_limits).await
    }

    async fn set_max_retries(&self, tag: &str, limit: i64) -> AnvilResult<()> {
        self.replace_limit(&self.tables.retry_limits, tag, limit).await
    }

    async fn get_max_retries(&self, tags: &BTreeSet<String>) -> AnvilResult<i64> {
        if tags.is_empty() {
            return Ok(-1);
        }
        let tags: Vec<String> = tags.iter().cloned().collect();
        let mut handle = self.conn.handle().await?;
        let max: Option<i32> = sqlx::query_scalar(&format!(
            "SELECT MAX(\"limit\") FROM {} WHERE tag = ANY($1)",
            self.tables.retry_limits
        ))
        .bind(&tags)
        .fetch_one(handle.conn()?)
        .await?;
        Ok(max.filter(|m| *m >= 1).map_or(-1, i64::from))
    }

    async fn all_retry_limits(&self) -> AnvilResult<HashMap<String, u32>> {
        self.limits(&self.tables.retry_limits).await
    }

    async fn task_type_estimate(&self, task_type: &str) -> AnvilResult<u64> {
        let mut handle = self.conn.handle().await?;
        let average: Option<i64> = sqlx::query_scalar(&format!(
            "SELECT AVG(duration)::BIGINT FROM {} WHERE task_type = $1",
            self.tables.estimates
        ))
        .bind(task_type)
        .fetch_one(handle.conn()?)
        .await?;
        Ok(average.map_or(0, |avg| avg.max(0) as u64))
    }

    async fn add_task_type_duration(&self, task_type: &str, duration_ms: u64) -> AnvilResult<()> {
        let mut handle = self.conn.handle().await?;
        let mut tx = self.begin_write(handle.conn()?).await?;
        sqlx::query(&format!(
            "INSERT INTO {} (task_type, duration) VALUES ($1, $2)",
            self.tables.estimates
        ))
        .bind(task_type)
        .bind(duration_ms as i64)
        .execute(&mut *tx)
        .await?;
        tx.commit().await?;
        Ok(())
    }

    async fn set_task_type_estimate(&self, task_type: &str, estimate_ms: u64) -> AnvilResult<()> {
        let mut handle = self.conn.handle().await?;
        let mut tx = self.begin_write(handle.conn()?).await?;
        sqlx::query(&format!(
            "DELETE FROM {} WHERE task_type = $1",
            self.tables.estimates
        ))
        .bind(task_type)
        .execute(&mut *tx)
        .await?;
        sqlx::query(&format!(
            "INSERT INTO {} (task_type, duration) VALUES ($1, $2)",
            self.tables.estimates
        ))
        .bind(task_type)
        .bind(estimate_ms as i64)
        .execute(&mut *tx)
        .await?;
        tx.commit().await?;
        Ok(())
    }
}

/// PostgreSQL store backend implementation
pub struct PostgresStore<P = serde_json::Value> {
    ops: PgOps<P>,
    pool: PgPool,
    config: StoreConfig,
    changes: ChangeChannel,
    shutdown: CancellationToken,
    tracker: TaskTracker,
}

impl<P: Payload> PostgresStore<P> {
    /// Connect using the `Postgres` backend section of `config`.
    ///
    /// Tables are not created here, see [`PostgresStore::create_tables`].
    pub async fn connect(config: StoreConfig) -> AnvilResult<Self> {
        let StoreBackendConfig::Postgres(pg) = &config.backend else {
            return Err(AnvilError::config("store backend is not postgres"));
        };
        let tables = Arc::new(Tables::new(&pg.table_name)?);
        let pool = PgPoolOptions::new()
            .max_connections(pg.pool_size)
            .connect(&pg.connection_string)
            .await?;

        let store = Self {
            ops: PgOps {
                conn: Conn::Pool(pool.clone()),
                tables,
                cursor: config.cursor,
                lock_timeout_ms: config.lock_timeout_ms,
                _payload: PhantomData,
            },
            pool,
            changes: ChangeChannel::new(),
            shutdown: CancellationToken::new(),
            tracker: TaskTracker::new(),
            config,
        };
        store.spawn_listener().await?;
        tracing::info!(table = %store.ops.tables.base, "🔨 Postgres store connected");
        Ok(store)
    }

    /// Forward `NOTIFY` messages on the event channel into the local change channel.
    async fn spawn_listener(&self) -> AnvilResult<()> {
        let mut listener = PgListener::connect_with(&self.pool).await?;
        listener.listen(&self.ops.tables.channel).await?;

        let changes = self.changes.clone();
        let shutdown = self.shutdown.clone();
        let retry = self.config.change_poll_interval();
        self.tracker.spawn(async move {
            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    received = listener.try_recv() => match received {
                        Ok(Some(_)) => changes.publish(),
                        // Connection dropped: changes may have been missed
                        Ok(None) => changes.publish(),
                        Err(err) => {
                            tracing::warn!(error = %err, "Change listener failed, retrying");
                            tokio::time::sleep(retry).await;
                        }
                    },
                }
            }
            tracing::debug!("Change listener stopped");
        });
        Ok(())
    }

    /// Create every table and index if missing.
    pub async fn create_tables(&self) -> AnvilResult<()> {
        let sql = SCHEMA.replace("{t}", &self.ops.tables.base);
        sqlx::raw_sql(&sql).execute(&self.pool).await?;
        Ok(())
    }

    /// Delete every task, limit and estimate.
    pub async fn reset(&self) -> AnvilResult<()> {
        let tables = &self.ops.tables;
        sqlx::raw_sql(&format!(
            "TRUNCATE {}, {}, {}, {}, {}",
            tables.tags, tables.tasks, tables.rate_limits, tables.retry_limits, tables.estimates
        ))
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Drop every table.
    pub async fn drop_tables(&self) -> AnvilResult<()> {
        let tables = &self.ops.tables;
        sqlx::raw_sql(&format!(
            "DROP TABLE IF EXISTS {}, {}, {}, {}, {}",
            tables.tags, tables.tasks, tables.rate_limits, tables.retry_limits, tables.estimates
        ))
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}

forward_store_ops!(PostgresStore<P>, |this| &this.ops);

#[async_trait]
impl<P: Payload> TaskStore<P> for PostgresStore<P> {
    fn as_ops(&self) -> &dyn StoreOps<P> {
        self
    }

    async fn begin_isolated(&self) -> AnvilResult<Box<dyn Isolation<P> + '_>> {
        let timeout_ms = self.config.lock_timeout_ms;
        let mut tx = self.pool.begin().await?;
        sqlx::query(&format!("SET LOCAL lock_timeout = '{timeout_ms}ms'"))
            .execute(&mut *tx)
            .await?;

        let lock = format!("LOCK TABLE {} IN EXCLUSIVE MODE", self.ops.tables.tasks);
        sqlx::query(&lock)
            .execute(&mut *tx)
            .await
            .map_err(|err| lock_error(err, timeout_ms))?;

        tracing::trace!("Isolated section opened");
        Ok(Box::new(PgIsolation {
            ops: PgOps {
                conn: Conn::Txn(Arc::new(tokio::sync::Mutex::new(Some(tx)))),
                tables: Arc::clone(&self.ops.tables),
                cursor: self.ops.cursor,
                lock_timeout_ms: self.ops.lock_timeout_ms,
                _payload: PhantomData,
            },
        }))
    }

    fn changes(&self) -> ChangeListener {
        self.changes.subscribe()
    }

    fn signal_change(&self) {
        self.changes.publish();
        let pool = self.pool.clone();
        let channel = self.ops.tables.channel.clone();
        self.tracker.spawn(async move {
            if let Err(err) = sqlx::query("SELECT pg_notify($1, '')")
                .bind(&channel)
                .execute(&pool)
                .await
            {
                tracing::warn!(error = %err, "Failed to publish change notification");
            }
        });
    }

    async fn wait_for_change(&self) -> ChangeEvent {
        self.changes().wait(self.config.change_poll_interval()).await
    }

    async fn close(&self) -> AnvilResult<()> {
        self.shutdown.cancel();
        self.changes.close();
        self.tracker.close();
        self.tracker.wait().await;
        self.pool.close().await;
        tracing::info!("Postgres store closed");
        Ok(())
    }
}

/// An open section of a [`PostgresStore`]. Dropping the transaction rolls it back.
struct PgIsolation<P> {
    ops: PgOps<P>,
}

impl<P> PgIsolation<P> {
    async fn finish(&self) -> AnvilResult<Transaction<'static, Postgres>> {
        let Conn::Txn(txn) = &self.ops.conn else {
            return Err(AnvilError::Closed);
        };
        txn.lock().await.take().ok_or(AnvilError::Closed)
    }
}

forward_store_ops!(PgIsolation<P>, |this| &this.ops);

#[async_trait]
impl<P: Payload> Isolation<P> for PgIsolation<P> {
    fn as_ops(&self) -> &dyn StoreOps<P> {
        self
    }

    async fn commit(self: Box<Self>) -> AnvilResult<()> {
        self.finish().await?.commit().await?;
        tracing::debug!("Isolated section committed");
        Ok(())
    }

    async fn rollback(self: Box<Self>) -> AnvilResult<()> {
        tracing::warn!("Rolling back isolated section");
        self.finish().await?.rollback().await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::PostgresConfig;
    use serde_json::json;

    fn create_test_task(priority: i32) -> Task {
        Task::new("test_task", json!({"test": "data"})).with_priority(priority)
    }

    async fn connect(table: &str) -> PostgresStore {
        let url = std::env::var("DATABASE_URL")
            .unwrap_or_else(|_| "postgresql://localhost/anvilq_test".to_string());
        let config = StoreConfig {
            backend: StoreBackendConfig::Postgres(PostgresConfig {
                connection_string: url,
                pool_size: 4,
                table_name: table.to_string(),
            }),
            lock_timeout_ms: 200,
            ..Default::default()
        };
        let store = PostgresStore::connect(config).await.unwrap();
        store.create_tables().await.unwrap();
        store.reset().await.unwrap();
        store
    }

    #[test]
    fn test_table_names() {
        let tables = Tables::new("jobs").unwrap();
        assert_eq!(tables.tasks, "\"jobs\"");
        assert_eq!(tables.tags, "\"jobs_tags\"");
        assert_eq!(tables.channel, "jobs_event");
        assert!(Tables::new("jobs; DROP TABLE x").is_err());
        assert!(Tables::new("").is_err());
    }

    #[test]
    fn test_filters() {
        let filter = Filter::state(TaskState::Queued, Some("email"));
        assert_eq!(filter.clause, "state = 1 AND task_type = $1");
        assert_eq!(filter.args, vec!["email".to_string()]);

        let tables = Tables::new("jobs").unwrap();
        let filter = Filter::pending(&tables, Some("io"));
        assert!(filter.clause.starts_with("state IN (2, 1)"));
        assert!(filter.clause.contains("\"jobs_tags\""));
    }

    #[tokio::test]
    #[ignore = "needs a running PostgreSQL (DATABASE_URL)"]
    async fn test_postgres_store_round_trip() {
        let store = connect("anvilq_test_basic").await;
        let low = create_test_task(1).with_tag("io").with_reference("r");
        let high = create_test_task(5);
        let (low_id, high_id) = (low.id, high.id);

        store.queue(vec![low, high]).await.unwrap();
        let ids = store.queued_ids(None).await.unwrap().collect_all().await.unwrap();
        assert_eq!(ids, vec![high_id, low_id]);

        let task = store.get(low_id).await.unwrap().unwrap();
        assert!(task.has_tag("io"));
        store.run(&task).await.unwrap();
        let pending = store.pending(None).await.unwrap().collect_all().await.unwrap();
        assert_eq!(pending[0].id, low_id);

        store.set_rate_limit("io", 2).await.unwrap();
        assert_eq!(store.get_rate_limit("io").await.unwrap(), 2);
        store.set_rate_limit("io", 0).await.unwrap();
        assert_eq!(store.get_rate_limit("io").await.unwrap(), -1);

        assert_eq!(store.remove_by_reference("r").await.unwrap(), 1);
        store.drop_tables().await.unwrap();
        store.close().await.unwrap();
    }

    #[tokio::test]
    #[ignore = "needs a running PostgreSQL (DATABASE_URL)"]
    async fn test_postgres_rollback_and_lock_timeout() {
        let store = connect("anvilq_test_isolation").await;
        let task = create_test_task(0);
        let id = task.id;

        let txn = store.begin_isolated().await.unwrap();
        txn.queue(vec![task]).await.unwrap();
        assert!(txn.get(id).await.unwrap().is_some());

        let err = store.begin_isolated().await.err().unwrap();
        assert!(matches!(err, AnvilError::LockTimeout { .. }));

        // Auto-commit writes give up after the same timeout
        let err = store.set_rate_limit("io", 1).await.unwrap_err();
        assert!(matches!(err, AnvilError::LockTimeout { timeout_ms: 200 }));
        let err = store.remove(id).await.unwrap_err();
        assert!(matches!(err, AnvilError::LockTimeout { .. }));

        txn.rollback().await.unwrap();
        assert!(store.get(id).await.unwrap().is_none());

        let duplicate = create_test_task(0);
        store.queue(vec![duplicate.clone()]).await.unwrap();
        let err = store
            .queue(vec![create_test_task(0), duplicate])
            .await
            .unwrap_err();
        assert!(matches!(err, AnvilError::DuplicateTask { .. }));
        assert_eq!(store.queue_size(QueueScope::All).await.unwrap(), 1);

        store.drop_tables().await.unwrap();
        store.close().await.unwrap();
    }
}
