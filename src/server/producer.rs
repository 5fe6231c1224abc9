//! The producer side: serves tasks from a [`QueueEngine`] to remote consumers.
//!
//! Each accepted connection gets its own session task. Every task handed out
//! is attributed to exactly one session in a producer-wide owner map, so a
//! disconnect only ever requeues what that session still holds.

use crate::config::ProducerConfig;
use crate::core::QueueEngine;
use crate::error::{AnvilError, AnvilResult};
use crate::server::command::{Command, ServerMessage, decode, encode};
use crate::server::frame_codec;
use crate::task::{Payload, Task, TaskId, TaskState};
use bytes::Bytes;
use futures::{SinkExt, StreamExt};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::net::tcp::OwnedWriteHalf;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio_util::codec::{FramedRead, FramedWrite, LengthDelimitedCodec};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;

/// State shared by the accept loop and every session.
struct Shared<P: Payload> {
    engine: Arc<QueueEngine<P>>,
    config: ProducerConfig,
    shutdown: CancellationToken,
    tracker: TaskTracker,
    consumers: AtomicUsize,
    next_session: AtomicU64,
    /// Which session holds each task it was handed or recovered
    owners: Mutex<HashMap<TaskId, u64>>,
}

impl<P: Payload> Shared<P> {
    fn owners(&self) -> MutexGuard<'_, HashMap<TaskId, u64>> {
        self.owners.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Forget `id` if `session` holds it. Returns false when another session does.
    fn release(&self, session: u64, id: TaskId) -> bool {
        let mut owners = self.owners();
        match owners.get(&id).copied() {
            Some(owner) if owner != session => false,
            Some(_) => {
                owners.remove(&id);
                true
            }
            None => true,
        }
    }
}

/// Accepts consumer connections and hands them tasks.
///
/// # Examples
///
/// ```rust,no_run
/// use anvilq::prelude::*;
/// use std::sync::Arc;
///
/// # async fn demo() -> AnvilResult<()> {
/// let store: SharedStore = StoreFactory::in_memory(StoreConfig::default());
/// let engine = Arc::new(QueueEngine::new(store, EngineConfig::default()));
/// let producer = Producer::bind(ProducerConfig::bind("127.0.0.1:7070"), engine).await?;
/// println!("listening on {}", producer.local_addr());
/// producer.close().await;
/// # Ok(())
/// # }
/// ```
pub struct Producer<P: Payload = serde_json::Value> {
    shared: Arc<Shared<P>>,
    local_addr: SocketAddr,
}

impl<P: Payload> Producer<P> {
    /// Bind the listening socket and start accepting connections
    pub async fn bind(config: ProducerConfig, engine: Arc<QueueEngine<P>>) -> AnvilResult<Self> {
        let listener = TcpListener::bind(&config.bind_address)
            .await
            .map_err(|e| AnvilError::transport(format!("Could not bind {}", config.bind_address), e))?;
        let local_addr = listener.local_addr()?;

        let shared = Arc::new(Shared {
            engine,
            config,
            shutdown: CancellationToken::new(),
            tracker: TaskTracker::new(),
            consumers: AtomicUsize::new(0),
            next_session: AtomicU64::new(1),
            owners: Mutex::new(HashMap::new()),
        });
        shared.tracker.spawn(accept_loop(listener, Arc::clone(&shared)));

        tracing::info!(%local_addr, "🔨 Producer listening");
        Ok(Self { shared, local_addr })
    }

    /// The address the producer is listening on
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Number of connected consumers
    pub fn consumer_count(&self) -> usize {
        self.shared.consumers.load(Ordering::SeqCst)
    }

    /// Number of tasks currently held by connected consumers
    pub fn held_count(&self) -> usize {
        self.shared.owners().len()
    }

    /// The engine tasks are served from
    pub fn engine(&self) -> &Arc<QueueEngine<P>> {
        &self.shared.engine
    }

    /// Whether [`Producer::close`] has been called
    pub fn is_closed(&self) -> bool {
        self.shared.shutdown.is_cancelled()
    }

    /// Disconnect every consumer, requeue what they held and stop listening.
    pub async fn close(&self) {
        self.shared.shutdown.cancel();
        self.shared.tracker.close();
        self.shared.tracker.wait().await;
        tracing::info!(local_addr = %self.local_addr, "Producer closed");
    }
}

impl<P: Payload> Drop for Producer<P> {
    fn drop(&mut self) {
        self.shared.shutdown.cancel();
    }
}

async fn accept_loop<P: Payload>(listener: TcpListener, shared: Arc<Shared<P>>) {
    loop {
        tokio::select! {
            _ = shared.shutdown.cancelled() => break,
            accepted = listener.accept() => match accepted {
                Ok((stream, peer)) => {
                    let session_id = shared.next_session.fetch_add(1, Ordering::SeqCst);
                    shared.tracker.spawn(serve(Arc::clone(&shared), stream, peer, session_id));
                }
                Err(e) => {
                    tracing::warn!(error = %e, "Failed to accept connection");
                    tokio::time::sleep(Duration::from_millis(100)).await;
                }
            }
        }
    }
    tracing::debug!("Producer stopped accepting connections");
}

struct Session {
    id: u64,
    /// Set on disconnect. Lock before the owner map.
    closed: Mutex<bool>,
    outbox: mpsc::UnboundedSender<Bytes>,
    /// Fires on disconnect; stops the writer and pending acquires
    cancel: CancellationToken,
}

impl Session {
    fn lock(&self) -> MutexGuard<'_, bool> {
        self.closed.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn send(&self, message: &ServerMessage<impl Payload>) -> AnvilResult<()> {
        let frame = encode(message)?;
        self.outbox.send(frame).map_err(|_| AnvilError::Closed)
    }
}

async fn serve<P: Payload>(shared: Arc<Shared<P>>, stream: TcpStream, peer: SocketAddr, session_id: u64) {
    let (read_half, write_half) = stream.into_split();
    let codec = frame_codec(shared.config.max_frame_length);
    let mut frames = FramedRead::new(read_half, codec.clone());
    let sink = FramedWrite::new(write_half, codec);

    let (outbox, outgoing) = mpsc::unbounded_channel();
    let session = Arc::new(Session {
        id: session_id,
        closed: Mutex::new(false),
        outbox,
        cancel: shared.shutdown.child_token(),
    });
    shared.tracker.spawn(write_frames(sink, outgoing, session.cancel.clone()));

    shared.consumers.fetch_add(1, Ordering::SeqCst);
    tracing::info!(session_id, %peer, "Consumer connected");

    let reason = loop {
        tokio::select! {
            _ = session.cancel.cancelled() => break "producer shutting down".to_string(),
            frame = frames.next() => match frame {
                None => break "closed by consumer".to_string(),
                Some(Err(e)) => break format!("read failed: {e}"),
                Some(Ok(frame)) => match decode::<Command>(&frame) {
                    Ok(command) => handle_command(&shared, &session, command).await,
                    Err(e) => {
                        tracing::warn!(session_id, error = %e, "Dropping consumer after malformed frame");
                        let _ = session.send(&ServerMessage::<P>::Error(e.to_string()));
                        break e.to_string();
                    }
                },
            },
        }
    };

    disconnect(&shared, &session, &reason).await;
}

async fn write_frames(
    mut sink: FramedWrite<OwnedWriteHalf, LengthDelimitedCodec>,
    mut outgoing: mpsc::UnboundedReceiver<Bytes>,
    cancel: CancellationToken,
) {
    loop {
        tokio::select! {
            // Frames already queued go out before a disconnect is honoured
            biased;
            frame = outgoing.recv() => match frame {
                Some(frame) => {
                    if let Err(e) = sink.send(frame).await {
                        tracing::debug!(error = %e, "Consumer write failed");
                        break;
                    }
                }
                None => break,
            },
            _ = cancel.cancelled() => break,
        }
    }
    let _ = SinkExt::<Bytes>::close(&mut sink).await;
}

async fn handle_command<P: Payload>(shared: &Arc<Shared<P>>, session: &Arc<Session>, command: Command) {
    let engine = &shared.engine;
    tracing::trace!(session_id = session.id, ?command, "Command received");

    let result = match command {
        Command::Ready => {
            spawn_acquire(shared, session);
            Ok(())
        }
        // Work reported done is done, whoever was last handed the task
        Command::Ack(id) => {
            shared.release(session.id, id);
            engine.acknowledge(id).await.map(drop)
        }
        Command::Nack { id, requeue } => settle(shared, session, id, requeue).await,
        Command::Error(id) => settle(shared, session, id, false).await,
        Command::Recover(ids) => recover(shared, session, ids).await,
    };

    if let Err(e) = result {
        tracing::warn!(session_id = session.id, error = %e, "Command failed");
    }
}

/// Give a task back to the engine, unless another session holds it.
async fn settle<P: Payload>(shared: &Shared<P>, session: &Session, id: TaskId, requeue: bool) -> AnvilResult<()> {
    if !shared.release(session.id, id) {
        tracing::debug!(session_id = session.id, task_id = %id, "Ignoring release of a task held elsewhere");
        return Ok(());
    }
    shared.engine.cancel(id, requeue).await.map(drop)
}

/// Attribute running tasks nobody holds to `session`.
///
/// A task that was requeued and handed to another session stays with that
/// session.
async fn recover<P: Payload>(shared: &Shared<P>, session: &Session, ids: Vec<TaskId>) -> AnvilResult<()> {
    let requested = ids.len();
    let mut running = Vec::with_capacity(requested);
    for id in ids {
        if let Some(task) = shared.engine.get(id).await? {
            if task.state == TaskState::Running {
                running.push(id);
            }
        }
    }

    let recovered = {
        let closed = session.lock();
        if *closed {
            0
        } else {
            let mut owners = shared.owners();
            running
                .into_iter()
                .filter(|id| match owners.get(id).copied() {
                    Some(owner) => owner == session.id,
                    None => {
                        owners.insert(*id, session.id);
                        true
                    }
                })
                .count()
        }
    };
    tracing::info!(session_id = session.id, requested, recovered, "Consumer recovered tasks");
    Ok(())
}

fn spawn_acquire<P: Payload>(shared: &Arc<Shared<P>>, session: &Arc<Session>) {
    let tracker = shared.tracker.clone();
    let shared = Arc::clone(shared);
    let session = Arc::clone(session);
    tracker.spawn(async move {
        match shared.engine.acquire_until(&session.cancel).await {
            Ok(Some(task)) => deliver(&shared, &session, task).await,
            Ok(None) => {}
            Err(AnvilError::Closed) => tracing::debug!(session_id = session.id, "Store closed while acquiring"),
            Err(e) => tracing::warn!(session_id = session.id, error = %e, "Acquire failed"),
        }
    });
}

async fn deliver<P: Payload>(shared: &Shared<P>, session: &Session, task: Task<P>) {
    let id = task.id;
    let sent = {
        let closed = session.lock();
        if *closed {
            None
        } else {
            let sent = session.send(&ServerMessage::Task(task));
            if sent.is_ok() {
                shared.owners().insert(id, session.id);
            }
            Some(sent)
        }
    };

    let requeue = match sent {
        Some(Ok(())) => {
            tracing::debug!(session_id = session.id, task_id = %id, "Task sent to consumer");
            return;
        }
        // The consumer left while the task was being selected
        None => true,
        Some(Err(AnvilError::Closed)) => true,
        Some(Err(e)) => {
            tracing::error!(session_id = session.id, task_id = %id, error = %e, "Could not encode task");
            false
        }
    };

    if let Err(e) = shared.engine.cancel(id, requeue).await {
        tracing::warn!(task_id = %id, error = %e, "Failed to release undelivered task");
    }
}

async fn disconnect<P: Payload>(shared: &Shared<P>, session: &Session, reason: &str) {
    let held: Vec<TaskId> = {
        let mut closed = session.lock();
        *closed = true;
        let mut owners = shared.owners();
        let held: Vec<TaskId> = owners
            .iter()
            .filter(|(_, owner)| **owner == session.id)
            .map(|(id, _)| *id)
            .collect();
        for id in &held {
            owners.remove(id);
        }
        held
    };
    session.cancel.cancel();

    for id in &held {
        if let Err(e) = shared.engine.cancel(*id, true).await {
            tracing::warn!(session_id = session.id, task_id = %id, error = %e, "Failed to requeue task");
        }
    }

    shared.consumers.fetch_sub(1, Ordering::SeqCst);
    tracing::info!(session_id = session.id, reason, requeued = held.len(), "Consumer disconnected");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{EngineConfig, StoreConfig};
    use crate::store::{QueueScope, StoreFactory};
    use serde_json::json;
    use tokio::net::tcp::OwnedReadHalf;

    type Client = (
        FramedRead<OwnedReadHalf, LengthDelimitedCodec>,
        FramedWrite<OwnedWriteHalf, LengthDelimitedCodec>,
    );

    fn create_test_engine() -> Arc<QueueEngine> {
        let store = StoreFactory::in_memory(StoreConfig::default().with_change_poll_interval(20));
        Arc::new(QueueEngine::new(store, EngineConfig::default().with_poll_interval(20)))
    }

    async fn create_test_producer() -> Producer {
        Producer::bind(ProducerConfig::bind("127.0.0.1:0"), create_test_engine())
            .await
            .unwrap()
    }

    async fn connect(producer: &Producer) -> Client {
        let stream = TcpStream::connect(producer.local_addr()).await.unwrap();
        let (read_half, write_half) = stream.into_split();
        let codec = frame_codec(1024 * 1024);
        (FramedRead::new(read_half, codec.clone()), FramedWrite::new(write_half, codec))
    }

    async fn send(client: &mut Client, command: Command) {
        client.1.send(encode(&command).unwrap()).await.unwrap();
    }

    async fn receive(client: &mut Client) -> ServerMessage<serde_json::Value> {
        let frame = tokio::time::timeout(Duration::from_secs(2), client.0.next())
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        decode(&frame).unwrap()
    }

    async fn eventually(mut check: impl AsyncFnMut() -> bool) {
        for _ in 0..100 {
            if check().await {
                return;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        panic!("condition not reached in time");
    }

    #[tokio::test]
    async fn test_ready_delivers_task() {
        let producer = create_test_producer().await;
        let id = producer.engine().submit(Task::new("test_task", json!({}))).await.unwrap();

        let mut client = connect(&producer).await;
        send(&mut client, Command::Ready).await;

        let ServerMessage::Task(task) = receive(&mut client).await else {
            panic!("expected a task");
        };
        assert_eq!(task.id, id);
        assert_eq!(producer.consumer_count(), 1);

        send(&mut client, Command::Ack(id)).await;
        let engine = Arc::clone(producer.engine());
        eventually(async || engine.size().await.unwrap() == 0).await;
        producer.close().await;
    }

    #[tokio::test]
    async fn test_disconnect_requeues_held_tasks() {
        let producer = create_test_producer().await;
        let engine = Arc::clone(producer.engine());
        engine.submit(Task::new("test_task", json!({}))).await.unwrap();

        let mut client = connect(&producer).await;
        send(&mut client, Command::Ready).await;
        receive(&mut client).await;
        assert_eq!(engine.running_count(QueueScope::All).await.unwrap(), 1);

        drop(client);
        eventually(async || engine.queue_size(QueueScope::All).await.unwrap() == 1).await;
        assert_eq!(engine.running_count(QueueScope::All).await.unwrap(), 0);
        eventually(async || producer.consumer_count() == 0).await;
        producer.close().await;
    }

    #[tokio::test]
    async fn test_malformed_frame_drops_consumer() {
        let producer = create_test_producer().await;
        let mut client = connect(&producer).await;
        client.1.send(Bytes::from_static(b"not json")).await.unwrap();

        assert!(matches!(receive(&mut client).await, ServerMessage::Error(_)));
        eventually(async || producer.consumer_count() == 0).await;
        producer.close().await;
    }

    #[tokio::test]
    async fn test_recover_reassociates_known_tasks() {
        let producer = create_test_producer().await;
        let engine = Arc::clone(producer.engine());
        let id = engine.submit(Task::new("test_task", json!({}))).await.unwrap();
        engine.acquire().await.unwrap();

        let mut client = connect(&producer).await;
        send(&mut client, Command::Recover(vec![id, uuid::Uuid::new_v4()])).await;
        eventually(async || producer.held_count() == 1).await;
        assert_eq!(engine.running_count(QueueScope::All).await.unwrap(), 1);

        // Recovered tasks are requeued like any other held task
        drop(client);
        eventually(async || engine.queue_size(QueueScope::All).await.unwrap() == 1).await;
        producer.close().await;
    }

    #[tokio::test]
    async fn test_recover_leaves_reassigned_task_with_its_holder() {
        let producer = create_test_producer().await;
        let engine = Arc::clone(producer.engine());
        let id = engine.submit(Task::new("test_task", json!({}))).await.unwrap();

        let mut first = connect(&producer).await;
        send(&mut first, Command::Ready).await;
        receive(&mut first).await;
        drop(first);
        eventually(async || engine.queue_size(QueueScope::All).await.unwrap() == 1).await;

        let mut holder = connect(&producer).await;
        send(&mut holder, Command::Ready).await;
        let ServerMessage::Task(task) = receive(&mut holder).await else {
            panic!("expected a task");
        };
        assert_eq!(task.id, id);

        // The first consumer comes back still believing it holds the task
        let mut returning = connect(&producer).await;
        eventually(async || producer.consumer_count() == 2).await;
        send(&mut returning, Command::Recover(vec![id])).await;
        send(&mut returning, Command::Nack { id, requeue: true }).await;
        drop(returning);
        eventually(async || producer.consumer_count() == 1).await;

        assert_eq!(engine.get(id).await.unwrap().unwrap().state, TaskState::Running);
        assert_eq!(producer.held_count(), 1);

        let mut idle = connect(&producer).await;
        send(&mut idle, Command::Ready).await;
        let nothing = tokio::time::timeout(Duration::from_millis(200), idle.0.next()).await;
        assert!(nothing.is_err());

        send(&mut holder, Command::Ack(id)).await;
        eventually(async || engine.size().await.unwrap() == 0).await;
        assert_eq!(producer.held_count(), 0);
        producer.close().await;
    }

    #[tokio::test]
    async fn test_close_stops_pending_acquires() {
        let producer = create_test_producer().await;
        let mut client = connect(&producer).await;
        send(&mut client, Command::Ready).await;
        tokio::time::sleep(Duration::from_millis(50)).await;

        tokio::time::timeout(Duration::from_secs(2), producer.close())
            .await
            .unwrap();
        assert!(producer.is_closed());

        // Nothing was handed out after the sessions ended
        let engine = Arc::clone(producer.engine());
        engine.submit(Task::new("test_task", json!({}))).await.unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(engine.running_count(QueueScope::All).await.unwrap(), 0);
    }
}
