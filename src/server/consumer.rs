//! The consumer side: receives tasks from a producer and reports back.
//!
//! A consumer survives producer restarts. While no connection is usable its
//! commands wait in an ordered buffer, and on reconnect it first re-claims
//! the tasks it still holds, then replays the buffer, then asks for work.
//!
//! # Examples
//!
//! ```rust,no_run
//! use anvilq::prelude::*;
//! use async_trait::async_trait;
//!
//! struct Printer;
//!
//! #[async_trait]
//! impl TaskHandler<serde_json::Value> for Printer {
//!     async fn handle(&self, consumer: &ConsumerHandle, task: Task) -> Result<(), HandlerError> {
//!         println!("{}: {}", task.task_type, task.payload);
//!         consumer.acknowledge(task.id).await?;
//!         consumer.ready().await?;
//!         Ok(())
//!     }
//! }
//!
//! # async fn demo() -> AnvilResult<()> {
//! let consumer = Consumer::new(ConsumerConfig::connect_to("127.0.0.1:7070"), Printer);
//! consumer.connect().await?;
//! # Ok(())
//! # }
//! ```

use crate::config::ConsumerConfig;
use crate::error::{AnvilError, AnvilResult};
use crate::server::command::{Command, ServerMessage, decode, encode};
use crate::server::frame_codec;
use crate::task::{Payload, Task, TaskId};
use async_trait::async_trait;
use bytes::Bytes;
use futures::{Sink, SinkExt, StreamExt};
use std::collections::{HashSet, VecDeque};
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::net::TcpStream;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio_util::codec::{FramedRead, FramedWrite, LengthDelimitedCodec};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use uuid::Uuid;

/// Error a [`TaskHandler`] may fail with.
pub type HandlerError = Box<dyn std::error::Error + Send + Sync>;

/// Application code that processes received tasks.
///
/// A handler that returns an error has its task cancelled without requeue.
#[async_trait]
pub trait TaskHandler<P: Payload>: Send + Sync + 'static {
    /// Process one task
    async fn handle(&self, consumer: &ConsumerHandle<P>, task: Task<P>) -> Result<(), HandlerError>;
}

/// Connection state of a [`Consumer`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ConsumerState {
    /// Not connected and not trying to be
    Disconnected,
    /// First connection attempt in progress
    Connecting,
    /// Connected with no task in hand
    Ready,
    /// Connected and processing at least one task
    Busy,
    /// Lost the connection and trying to get it back
    Recovering,
}

type FrameSink = FramedWrite<OwnedWriteHalf, LengthDelimitedCodec>;
type FrameStream = FramedRead<OwnedReadHalf, LengthDelimitedCodec>;

/// The write side of the connection plus everything waiting to go out on it.
struct Link {
    sink: Option<FrameSink>,
    /// Commands issued while no connection was usable, oldest first
    buffer: VecDeque<Command>,
    /// Bumped on every new connection so stale readers cannot drop a newer one
    generation: u64,
    /// Stops the reader of the current connection
    reader: CancellationToken,
}

struct Inner<P: Payload> {
    id: Uuid,
    config: ConsumerConfig,
    handler: Arc<dyn TaskHandler<P>>,
    state: Mutex<ConsumerState>,
    link: tokio::sync::Mutex<Link>,
    linked: AtomicBool,
    /// Tasks received and not yet settled over a live connection
    active: Mutex<HashSet<TaskId>>,
    in_flight: AtomicUsize,
    reconnecting: AtomicBool,
    /// Cancelled by `close`, replaced by the next `connect`
    lifetime: Mutex<CancellationToken>,
    tracker: TaskTracker,
}

/// Cheap handle for issuing commands, passed to every [`TaskHandler`] call.
pub struct ConsumerHandle<P: Payload = serde_json::Value> {
    inner: Arc<Inner<P>>,
}

impl<P: Payload> Clone for ConsumerHandle<P> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

/// A client that pulls tasks from a producer.
pub struct Consumer<P: Payload = serde_json::Value> {
    handle: ConsumerHandle<P>,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

impl<P: Payload> Consumer<P> {
    /// Create a disconnected consumer
    pub fn new(config: ConsumerConfig, handler: impl TaskHandler<P>) -> Self {
        let inner = Arc::new(Inner {
            id: Uuid::new_v4(),
            config,
            handler: Arc::new(handler),
            state: Mutex::new(ConsumerState::Disconnected),
            link: tokio::sync::Mutex::new(Link {
                sink: None,
                buffer: VecDeque::new(),
                generation: 0,
                reader: CancellationToken::new(),
            }),
            linked: AtomicBool::new(false),
            active: Mutex::new(HashSet::new()),
            in_flight: AtomicUsize::new(0),
            reconnecting: AtomicBool::new(false),
            lifetime: Mutex::new(CancellationToken::new()),
            tracker: TaskTracker::new(),
        });
        Self {
            handle: ConsumerHandle { inner },
        }
    }

    /// Connect to the producer and ask for a first task.
    ///
    /// Fails with a transport error when the producer refuses the connection
    /// or does not answer within the connect timeout.
    pub async fn connect(&self) -> AnvilResult<()> {
        let inner = &self.handle.inner;
        if inner.linked.load(Ordering::SeqCst) || inner.reconnecting.load(Ordering::SeqCst) {
            return Err(AnvilError::AlreadyRunning);
        }

        let lifetime = {
            let mut lifetime = lock(&inner.lifetime);
            if lifetime.is_cancelled() {
                *lifetime = CancellationToken::new();
            }
            lifetime.clone()
        };
        inner.tracker.reopen();

        if let Err(e) = inner.open_link(&lifetime, ConsumerState::Connecting).await {
            inner.set_state(ConsumerState::Disconnected);
            return Err(e);
        }

        inner.tracker.spawn(Arc::clone(inner).check_liveness(lifetime));
        Ok(())
    }

    /// A handle for issuing commands from other tasks
    pub fn handle(&self) -> ConsumerHandle<P> {
        self.handle.clone()
    }

    /// Current connection state
    pub fn state(&self) -> ConsumerState {
        self.handle.state()
    }

    /// Ask for one more task
    pub async fn ready(&self) -> AnvilResult<bool> {
        self.handle.ready().await
    }

    /// Report a task as done
    pub async fn acknowledge(&self, id: TaskId) -> AnvilResult<bool> {
        self.handle.acknowledge(id).await
    }

    /// Give a task up, optionally putting it back in the queue
    pub async fn cancel(&self, id: TaskId, requeue: bool) -> AnvilResult<bool> {
        self.handle.cancel(id, requeue).await
    }

    /// Report a task as failed for good
    pub async fn report_error(&self, id: TaskId) -> AnvilResult<bool> {
        self.handle.report_error(id).await
    }

    /// Tasks received and not yet settled
    pub fn active_tasks(&self) -> Vec<TaskId> {
        self.handle.inner.active_ids()
    }

    /// Commands waiting for a connection
    pub async fn buffered(&self) -> usize {
        self.handle.inner.link.lock().await.buffer.len()
    }

    /// Drop the connection and stop reconnecting.
    ///
    /// The producer sees an ordinary disconnect and requeues what this
    /// consumer held.
    pub async fn close(&self) {
        let inner = &self.handle.inner;
        lock(&inner.lifetime).cancel();

        {
            let mut link = inner.link.lock().await;
            link.reader.cancel();
            if let Some(mut sink) = link.sink.take() {
                let _ = SinkExt::<Bytes>::close(&mut sink).await;
            }
            inner.linked.store(false, Ordering::SeqCst);
        }

        inner.tracker.close();
        inner.tracker.wait().await;
        inner.set_state(ConsumerState::Disconnected);
        tracing::debug!(consumer = %inner.id, "Consumer closed");
    }
}

impl<P: Payload> fmt::Debug for Consumer<P> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Consumer")
            .field("id", &self.handle.inner.id)
            .field("host", &self.handle.inner.config.host_address)
            .field("state", &self.state())
            .finish()
    }
}

impl<P: Payload> ConsumerHandle<P> {
    /// Current connection state
    pub fn state(&self) -> ConsumerState {
        *lock(&self.inner.state)
    }

    /// Ask for one more task.
    ///
    /// Returns `true` when sent now and `false` when buffered for the next
    /// connection.
    pub async fn ready(&self) -> AnvilResult<bool> {
        self.inner.send(Command::Ready).await
    }

    /// Report a task as done
    pub async fn acknowledge(&self, id: TaskId) -> AnvilResult<bool> {
        self.inner.send(Command::Ack(id)).await
    }

    /// Give a task up, optionally putting it back in the queue
    pub async fn cancel(&self, id: TaskId, requeue: bool) -> AnvilResult<bool> {
        self.inner.send(Command::Nack { id, requeue }).await
    }

    /// Report a task as failed for good
    pub async fn report_error(&self, id: TaskId) -> AnvilResult<bool> {
        self.inner.send(Command::Error(id)).await
    }
}

async fn send_frame<S>(sink: &mut S, frame: Bytes) -> AnvilResult<()>
where
    S: Sink<Bytes> + Unpin,
    S::Error: std::error::Error + Send + Sync + 'static,
{
    sink.send(frame)
        .await
        .map_err(|e| AnvilError::transport("Write to producer failed", e))
}

impl<P: Payload> Inner<P> {
    fn set_state(&self, state: ConsumerState) {
        *lock(&self.state) = state;
    }

    fn lifetime(&self) -> CancellationToken {
        lock(&self.lifetime).clone()
    }

    fn active_ids(&self) -> Vec<TaskId> {
        lock(&self.active).iter().copied().collect()
    }

    fn connected_state(&self) -> ConsumerState {
        if self.in_flight.load(Ordering::SeqCst) > 0 {
            ConsumerState::Busy
        } else {
            ConsumerState::Ready
        }
    }

    async fn send(self: &Arc<Self>, command: Command) -> AnvilResult<bool> {
        let frame = encode(&command)?;
        let mut link = self.link.lock().await;

        if let Some(sink) = link.sink.as_mut() {
            match send_frame(sink, frame).await {
                Ok(()) => {
                    if let Some(id) = command.settles() {
                        lock(&self.active).remove(&id);
                    }
                    return Ok(true);
                }
                Err(e) => {
                    tracing::warn!(consumer = %self.id, error = %e, "Lost connection while sending");
                    link.sink = None;
                    link.reader.cancel();
                    self.linked.store(false, Ordering::SeqCst);
                }
            }
        }

        if !command.is_bufferable() {
            return Err(AnvilError::Closed);
        }
        tracing::debug!(consumer = %self.id, ?command, "Connection unavailable, command buffered");
        link.buffer.push_back(command);
        drop(link);

        self.start_reconnect();
        Ok(false)
    }

    /// Open a connection and bring the producer up to date before any other
    /// command can use it.
    async fn open_link(self: &Arc<Self>, lifetime: &CancellationToken, state: ConsumerState) -> AnvilResult<()> {
        self.set_state(state);
        let address = self.config.host_address.as_str();

        let stream = tokio::select! {
            _ = lifetime.cancelled() => return Err(AnvilError::Closed),
            connected = tokio::time::timeout(self.config.connect_timeout(), TcpStream::connect(address)) => {
                match connected {
                    Ok(Ok(stream)) => stream,
                    Ok(Err(e)) => return Err(AnvilError::transport(format!("Could not connect to {address}"), e)),
                    Err(e) => return Err(AnvilError::transport(format!("Timed out connecting to {address}"), e)),
                }
            }
        };
        let _ = stream.set_nodelay(true);

        let (read_half, write_half) = stream.into_split();
        let codec = frame_codec(self.config.max_frame_length);
        let frames = FramedRead::new(read_half, codec.clone());
        let mut sink = FramedWrite::new(write_half, codec);

        let mut link = self.link.lock().await;
        if lifetime.is_cancelled() {
            return Err(AnvilError::Closed);
        }

        self.handshake(&mut link.buffer, &mut sink).await?;

        link.generation += 1;
        link.reader = lifetime.child_token();
        link.sink = Some(sink);
        self.linked.store(true, Ordering::SeqCst);
        self.set_state(self.connected_state());

        let generation = link.generation;
        let reader = link.reader.clone();
        drop(link);

        self.tracker.spawn(Arc::clone(self).read_frames(frames, generation, reader));
        tracing::info!(consumer = %self.id, host = %address, "Connected to producer");
        Ok(())
    }

    /// RECOVER the held tasks, replay the buffer in order, then send READY.
    ///
    /// The active set is only cleared once all of it went out, so an
    /// interrupted handshake recovers the same tasks next time.
    async fn handshake<S>(&self, buffer: &mut VecDeque<Command>, sink: &mut S) -> AnvilResult<()>
    where
        S: Sink<Bytes> + Unpin,
        S::Error: std::error::Error + Send + Sync + 'static,
    {
        let recovered = self.active_ids();
        if !recovered.is_empty() {
            tracing::debug!(consumer = %self.id, count = recovered.len(), "Recovering held tasks");
            send_frame(sink, encode(&Command::Recover(recovered.clone()))?).await?;
        }

        if !buffer.is_empty() {
            tracing::debug!(consumer = %self.id, count = buffer.len(), "Replaying buffered commands");
        }
        while let Some(command) = buffer.front() {
            // Every buffered READY folds into the one sent below
            if *command != Command::Ready {
                send_frame(sink, encode(command)?).await?;
            }
            buffer.pop_front();
        }
        send_frame(sink, encode(&Command::Ready)?).await?;

        let mut active = lock(&self.active);
        for id in &recovered {
            active.remove(id);
        }
        Ok(())
    }

    async fn read_frames(self: Arc<Self>, mut frames: FrameStream, generation: u64, reader: CancellationToken) {
        let reason = loop {
            tokio::select! {
                _ = reader.cancelled() => return,
                frame = frames.next() => match frame {
                    None => break "connection closed by producer".to_string(),
                    Some(Err(e)) => break format!("read failed: {e}"),
                    Some(Ok(frame)) => match decode::<ServerMessage<P>>(&frame) {
                        Ok(ServerMessage::Task(task)) => self.dispatch(task),
                        Ok(ServerMessage::Error(message)) => break format!("producer error: {message}"),
                        Err(e) => break e.to_string(),
                    },
                },
            }
        };

        tracing::warn!(consumer = %self.id, reason, "Connection to producer lost");
        self.drop_link(generation).await;
        self.start_reconnect();
    }

    async fn drop_link(&self, generation: u64) {
        let mut link = self.link.lock().await;
        if link.generation == generation {
            link.sink = None;
            link.reader.cancel();
            self.linked.store(false, Ordering::SeqCst);
        }
    }

    fn dispatch(self: &Arc<Self>, task: Task<P>) {
        let id = task.id;
        lock(&self.active).insert(id);
        self.in_flight.fetch_add(1, Ordering::SeqCst);
        self.set_state(ConsumerState::Busy);
        tracing::debug!(consumer = %self.id, task_id = %id, "Processing task");

        let inner = Arc::clone(self);
        tokio::spawn(async move {
            let handle = ConsumerHandle {
                inner: Arc::clone(&inner),
            };
            match inner.handler.handle(&handle, task).await {
                Ok(()) => tracing::debug!(consumer = %inner.id, task_id = %id, "Task processed"),
                Err(e) => {
                    tracing::error!(consumer = %inner.id, task_id = %id, error = %e, "Task handler failed");
                    if let Err(e) = handle.cancel(id, false).await {
                        tracing::warn!(task_id = %id, error = %e, "Could not cancel failed task");
                    }
                }
            }

            if inner.in_flight.fetch_sub(1, Ordering::SeqCst) == 1 {
                let mut state = lock(&inner.state);
                if *state == ConsumerState::Busy {
                    *state = ConsumerState::Ready;
                }
            }
        });
    }

    /// Start the reconnect loop unless one is running or the consumer is closed.
    fn start_reconnect(self: &Arc<Self>) {
        let lifetime = self.lifetime();
        if lifetime.is_cancelled() {
            return;
        }
        let Some(retry_interval) = self.config.retry_interval() else {
            tracing::warn!(consumer = %self.id, "Connection lost and retrying is disabled");
            self.set_state(ConsumerState::Disconnected);
            return;
        };
        if self.reconnecting.swap(true, Ordering::SeqCst) {
            return;
        }
        self.set_state(ConsumerState::Recovering);

        let inner = Arc::clone(self);
        self.tracker.spawn(async move {
            loop {
                match inner.open_link(&lifetime, ConsumerState::Recovering).await {
                    Ok(()) => break,
                    Err(AnvilError::Closed) => break,
                    Err(e) => tracing::trace!(
                        consumer = %inner.id,
                        error = %e,
                        retry_ms = retry_interval.as_millis() as u64,
                        "Reconnect failed"
                    ),
                }
                tokio::select! {
                    _ = lifetime.cancelled() => break,
                    _ = tokio::time::sleep(retry_interval) => {}
                }
            }
            inner.reconnecting.store(false, Ordering::SeqCst);
        });
    }

    async fn check_liveness(self: Arc<Self>, lifetime: CancellationToken) {
        if self.config.retry_interval().is_none() {
            return;
        }
        let mut interval = tokio::time::interval(self.config.liveness_interval());
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = lifetime.cancelled() => break,
                _ = interval.tick() => {
                    if !self.linked.load(Ordering::SeqCst) && !self.reconnecting.load(Ordering::SeqCst) {
                        self.start_reconnect();
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{EngineConfig, ProducerConfig, StoreConfig};
    use crate::core::QueueEngine;
    use crate::server::Producer;
    use crate::store::{QueueScope, StoreFactory};
    use serde_json::json;
    use std::time::Duration;
    use tokio::sync::mpsc;

    /// Forwards every task to the test and leaves settling it to the test.
    struct Forwarding {
        tasks: mpsc::UnboundedSender<Task>,
    }

    #[async_trait]
    impl TaskHandler<serde_json::Value> for Forwarding {
        async fn handle(&self, _consumer: &ConsumerHandle, task: Task) -> Result<(), HandlerError> {
            let _ = self.tasks.send(task);
            Ok(())
        }
    }

    struct Failing;

    #[async_trait]
    impl TaskHandler<serde_json::Value> for Failing {
        async fn handle(&self, _consumer: &ConsumerHandle, _task: Task) -> Result<(), HandlerError> {
            Err("something went wrong".into())
        }
    }

    fn create_test_engine() -> Arc<QueueEngine> {
        let store = StoreFactory::in_memory(StoreConfig::default().with_change_poll_interval(20));
        Arc::new(QueueEngine::new(store, EngineConfig::default().with_poll_interval(20)))
    }

    fn create_test_config(producer: &Producer) -> ConsumerConfig {
        ConsumerConfig::connect_to(producer.local_addr().to_string())
            .with_connect_timeout(1000)
            .with_retry_interval(50)
            .with_liveness_interval(50)
    }

    fn forwarding() -> (Forwarding, mpsc::UnboundedReceiver<Task>) {
        let (tasks, received) = mpsc::unbounded_channel();
        (Forwarding { tasks }, received)
    }

    async fn next_task(received: &mut mpsc::UnboundedReceiver<Task>) -> Task {
        tokio::time::timeout(Duration::from_secs(2), received.recv())
            .await
            .unwrap()
            .unwrap()
    }

    async fn eventually(mut check: impl AsyncFnMut() -> bool) {
        for _ in 0..150 {
            if check().await {
                return;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        panic!("condition not reached in time");
    }

    #[tokio::test]
    async fn test_acquire_and_acknowledge_over_the_wire() {
        let engine = create_test_engine();
        let producer = Producer::bind(ProducerConfig::bind("127.0.0.1:0"), Arc::clone(&engine))
            .await
            .unwrap();
        let id = engine.submit(Task::new("test", json!({}))).await.unwrap();

        let (handler, mut received) = forwarding();
        let consumer = Consumer::new(create_test_config(&producer), handler);
        assert_eq!(consumer.state(), ConsumerState::Disconnected);
        consumer.connect().await.unwrap();

        let task = next_task(&mut received).await;
        assert_eq!(task.id, id);
        eventually(async || producer.consumer_count() == 1).await;
        assert_eq!(engine.queue_size(QueueScope::All).await.unwrap(), 0);
        assert_eq!(engine.running_count(QueueScope::All).await.unwrap(), 1);

        assert!(consumer.acknowledge(id).await.unwrap());
        eventually(async || engine.size().await.unwrap() == 0).await;
        assert!(consumer.active_tasks().is_empty());

        consumer.close().await;
        producer.close().await;
    }

    #[tokio::test]
    async fn test_cancel_over_the_wire() {
        let engine = create_test_engine();
        let producer = Producer::bind(ProducerConfig::bind("127.0.0.1:0"), Arc::clone(&engine))
            .await
            .unwrap();
        engine.submit(Task::new("test", json!({}))).await.unwrap();
        engine.submit(Task::new("test", json!({}))).await.unwrap();

        let (handler, mut received) = forwarding();
        let consumer = Consumer::new(create_test_config(&producer), handler);
        consumer.connect().await.unwrap();

        let first = next_task(&mut received).await;
        assert_eq!(engine.queue_size(QueueScope::All).await.unwrap(), 1);
        consumer.cancel(first.id, false).await.unwrap();
        eventually(async || engine.size().await.unwrap() == 1).await;

        consumer.ready().await.unwrap();
        let second = next_task(&mut received).await;
        assert_eq!(engine.queue_size(QueueScope::All).await.unwrap(), 0);

        consumer.cancel(second.id, true).await.unwrap();
        eventually(async || engine.queue_size(QueueScope::All).await.unwrap() == 1).await;
        assert_eq!(engine.size().await.unwrap(), 1);

        consumer.close().await;
        producer.close().await;
    }

    #[tokio::test]
    async fn test_consumer_disconnect_requeues_task() {
        let engine = create_test_engine();
        let producer = Producer::bind(ProducerConfig::bind("127.0.0.1:0"), Arc::clone(&engine))
            .await
            .unwrap();
        engine.submit(Task::new("test", json!({}))).await.unwrap();

        let (handler, mut received) = forwarding();
        let consumer = Consumer::new(create_test_config(&producer), handler);
        consumer.connect().await.unwrap();
        next_task(&mut received).await;
        assert_eq!(engine.running_count(QueueScope::All).await.unwrap(), 1);

        consumer.close().await;
        assert_eq!(consumer.state(), ConsumerState::Disconnected);

        eventually(async || producer.consumer_count() == 0).await;
        eventually(async || engine.running_count(QueueScope::All).await.unwrap() == 0).await;
        assert_eq!(engine.queue_size(QueueScope::All).await.unwrap(), 1);

        producer.close().await;
    }

    #[tokio::test]
    async fn test_handler_error_cancels_task() {
        let engine = create_test_engine();
        let producer = Producer::bind(ProducerConfig::bind("127.0.0.1:0"), Arc::clone(&engine))
            .await
            .unwrap();
        engine.submit(Task::new("test", json!({}))).await.unwrap();

        let consumer = Consumer::new(create_test_config(&producer), Failing);
        consumer.connect().await.unwrap();

        // Removed rather than requeued
        eventually(async || engine.size().await.unwrap() == 0).await;
        assert_eq!(engine.queue_size(QueueScope::All).await.unwrap(), 0);

        consumer.close().await;
        producer.close().await;
    }

    #[tokio::test]
    async fn test_connect_refused_is_transport_error() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let address = listener.local_addr().unwrap();
        drop(listener);

        let (handler, _received) = forwarding();
        let consumer = Consumer::new(
            ConsumerConfig::connect_to(address.to_string()).with_connect_timeout(500),
            handler,
        );
        let err = consumer.connect().await.unwrap_err();
        assert!(err.is_transport());
        assert_eq!(consumer.state(), ConsumerState::Disconnected);
    }

    #[tokio::test]
    async fn test_offline_acknowledge_is_replayed_after_producer_restart() {
        let engine = create_test_engine();
        let producer = Producer::bind(ProducerConfig::bind("127.0.0.1:0"), Arc::clone(&engine))
            .await
            .unwrap();
        let address = producer.local_addr();
        let id = engine.submit(Task::new("test", json!({}))).await.unwrap();

        let (handler, mut received) = forwarding();
        let consumer = Consumer::new(create_test_config(&producer), handler);
        consumer.connect().await.unwrap();
        next_task(&mut received).await;
        assert_eq!(engine.running_count(QueueScope::All).await.unwrap(), 1);

        producer.close().await;
        drop(producer);
        eventually(async || consumer.state() == ConsumerState::Recovering).await;

        // The producer requeued the task when the session ended
        assert_eq!(engine.queue_size(QueueScope::All).await.unwrap(), 1);
        assert_eq!(engine.running_count(QueueScope::All).await.unwrap(), 0);

        assert!(!consumer.acknowledge(id).await.unwrap());
        assert_eq!(consumer.buffered().await, 1);
        assert_eq!(engine.queue_size(QueueScope::All).await.unwrap(), 1);

        let restarted = Producer::bind(ProducerConfig::bind(address.to_string()), Arc::clone(&engine))
            .await
            .unwrap();
        eventually(async || restarted.consumer_count() == 1).await;
        eventually(async || engine.size().await.unwrap() == 0).await;
        eventually(async || consumer.state() == ConsumerState::Ready).await;
        assert_eq!(consumer.buffered().await, 0);

        consumer.close().await;
        restarted.close().await;
    }

    #[tokio::test]
    async fn test_retry_disabled_leaves_consumer_disconnected() {
        let engine = create_test_engine();
        let producer = Producer::bind(ProducerConfig::bind("127.0.0.1:0"), Arc::clone(&engine))
            .await
            .unwrap();

        let (handler, _received) = forwarding();
        let consumer = Consumer::new(create_test_config(&producer).with_retry_interval(0), handler);
        consumer.connect().await.unwrap();
        eventually(async || producer.consumer_count() == 1).await;

        producer.close().await;
        eventually(async || consumer.state() == ConsumerState::Disconnected).await;

        consumer.close().await;
    }

    #[tokio::test]
    async fn test_interrupted_handshake_keeps_held_tasks() {
        let (handler, _received) = forwarding();
        let consumer = Consumer::new(ConsumerConfig::connect_to("127.0.0.1:1"), handler);
        let inner = &consumer.handle.inner;
        let held = uuid::Uuid::new_v4();
        let settled = uuid::Uuid::new_v4();
        lock(&inner.active).insert(held);
        let mut buffer = VecDeque::from([Command::Ready, Command::Ack(settled)]);

        // The connection dies right after RECOVER went out
        let broken = futures::sink::unfold(0usize, |sent, _frame: Bytes| async move {
            if sent == 0 {
                Ok(sent + 1)
            } else {
                Err(std::io::Error::from(std::io::ErrorKind::BrokenPipe))
            }
        });
        let mut broken = std::pin::pin!(broken);
        let err = inner.handshake(&mut buffer, &mut broken).await.unwrap_err();
        assert!(err.is_transport());
        assert!(consumer.active_tasks().contains(&held));
        assert_eq!(buffer, VecDeque::from([Command::Ack(settled)]));

        let (mut frames, written) = futures::channel::mpsc::unbounded::<Bytes>();
        inner.handshake(&mut buffer, &mut frames).await.unwrap();
        drop(frames);
        let sent: Vec<Command> = written
            .map(|frame| decode::<Command>(&frame).unwrap())
            .collect()
            .await;
        assert_eq!(
            sent,
            vec![Command::Recover(vec![held]), Command::Ack(settled), Command::Ready]
        );
        assert!(buffer.is_empty());
        assert!(consumer.active_tasks().is_empty());
    }
}
