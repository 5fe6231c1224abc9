//! The anvilq facade and queue engine.
//!
//! [`Anvil`] wires a store, an engine and a producer together from one
//! [`AnvilConfig`]. Use the pieces directly for anything it does not cover.

use crate::config::AnvilConfig;
use crate::error::{AnvilError, AnvilResult};
use crate::server::Producer;
use crate::store::{SharedStore, StoreFactory};
use crate::task::{Payload, Task, TaskId};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::sync::RwLock;

pub mod engine;
pub mod listener;

pub use engine::QueueEngine;
pub use listener::{QueueListener, TaskOutcome};

/// A queue server.
///
/// # Examples
///
/// ```rust,no_run
/// use anvilq::prelude::*;
///
/// #[tokio::main]
/// async fn main() -> AnvilResult<()> {
///     let anvil: Anvil = Anvil::new(AnvilConfig::default()).await?;
///     anvil.start().await?;
///     anvil.submit(Task::new("email", serde_json::json!({"to": "a@b.c"}))).await?;
///     anvil.wait_for_shutdown().await
/// }
/// ```
pub struct Anvil<P: Payload = serde_json::Value> {
    engine: Arc<QueueEngine<P>>,
    producer: RwLock<Option<Producer<P>>>,
    config: AnvilConfig,
}

impl<P: Payload> Anvil<P> {
    /// Create the store named by `config` and an engine over it.
    pub async fn new(config: AnvilConfig) -> AnvilResult<Self> {
        config.validate().map_err(|errors| AnvilError::config(errors.join("; ")))?;
        let store = StoreFactory::from_config(config.store.clone()).await?;
        Ok(Self::with_store(config, store))
    }

    /// Use an existing store.
    pub fn with_store(config: AnvilConfig, store: SharedStore<P>) -> Self {
        let engine = Arc::new(QueueEngine::new(store, config.engine.clone()));
        Self {
            engine,
            producer: RwLock::new(None),
            config,
        }
    }

    /// Recover tasks left running by a previous process, then start serving
    /// consumers.
    pub async fn start(&self) -> AnvilResult<()> {
        let mut producer = self.producer.write().await;
        if producer.is_some() {
            return Err(AnvilError::AlreadyRunning);
        }

        let recovered = self.engine.requeue_all().await?;
        let bound = Producer::bind(self.config.producer.clone(), Arc::clone(&self.engine)).await?;

        tracing::info!(
            "🔨 Anvil started on {} ({} running tasks requeued)",
            bound.local_addr(),
            recovered
        );
        *producer = Some(bound);
        Ok(())
    }

    /// Disconnect every consumer and stop listening. The store stays open.
    pub async fn stop(&self) -> AnvilResult<()> {
        let Some(producer) = self.producer.write().await.take() else {
            return Err(AnvilError::NotRunning);
        };
        producer.close().await;
        tracing::info!("🔨 Anvil stopped");
        Ok(())
    }

    /// Stop if running, then close the store.
    pub async fn shutdown(&self) -> AnvilResult<()> {
        match self.stop().await {
            Ok(()) | Err(AnvilError::NotRunning) => {}
            Err(e) => return Err(e),
        }
        self.engine.close().await
    }

    /// Block until Ctrl+C, then shut down.
    pub async fn wait_for_shutdown(&self) -> AnvilResult<()> {
        tokio::signal::ctrl_c().await?;
        tracing::info!("Received Ctrl+C, shutting down...");
        self.shutdown().await
    }

    /// Queue one task
    pub async fn submit(&self, task: Task<P>) -> AnvilResult<TaskId> {
        self.engine.submit(task).await
    }

    /// Queue a batch of tasks, all or nothing
    pub async fn submit_all(&self, tasks: Vec<Task<P>>) -> AnvilResult<Vec<TaskId>> {
        self.engine.submit_all(tasks).await
    }

    /// Whether the producer is serving consumers
    pub async fn is_running(&self) -> bool {
        self.producer.read().await.is_some()
    }

    /// Address consumers connect to, while running
    pub async fn local_addr(&self) -> Option<SocketAddr> {
        self.producer.read().await.as_ref().map(Producer::local_addr)
    }

    /// Number of connected consumers
    pub async fn consumer_count(&self) -> usize {
        self.producer
            .read()
            .await
            .as_ref()
            .map_or(0, Producer::consumer_count)
    }

    /// The queue engine
    pub fn engine(&self) -> &Arc<QueueEngine<P>> {
        &self.engine
    }

    /// The backing store
    pub fn store(&self) -> &SharedStore<P> {
        self.engine.store()
    }

    /// Configuration
    pub fn config(&self) -> &AnvilConfig {
        &self.config
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::QueueScope;
    use crate::task::TaskState;
    use serde_json::json;
    use tokio_test::{assert_err, assert_ok};

    #[tokio::test]
    async fn test_lifecycle() {
        let anvil: Anvil = Anvil::new(AnvilConfig::testing()).await.unwrap();
        assert!(!anvil.is_running().await);
        assert!(matches!(assert_err!(anvil.stop().await), AnvilError::NotRunning));

        assert_ok!(anvil.start().await);
        assert!(anvil.is_running().await);
        assert!(anvil.local_addr().await.is_some());
        assert!(matches!(anvil.start().await, Err(AnvilError::AlreadyRunning)));

        anvil.stop().await.unwrap();
        assert!(!anvil.is_running().await);
        assert_eq!(anvil.consumer_count().await, 0);
        anvil.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_start_requeues_running_tasks() {
        let config = AnvilConfig::testing();
        let store = StoreFactory::in_memory(config.store.clone());

        // Simulate a previous process that died holding a task
        let previous = QueueEngine::new(Arc::clone(&store), config.engine.clone());
        let id = previous.submit(Task::new("test_task", json!({}))).await.unwrap();
        previous.acquire().await.unwrap();

        let anvil = Anvil::with_store(config, store);
        anvil.start().await.unwrap();
        assert_eq!(anvil.store().get(id).await.unwrap().unwrap().state, TaskState::Queued);
        assert_eq!(anvil.engine().running_count(QueueScope::All).await.unwrap(), 0);
        anvil.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_invalid_config_is_rejected() {
        let mut config = AnvilConfig::testing();
        config.producer.max_frame_length = 0;
        let result: AnvilResult<Anvil> = Anvil::new(config).await;
        assert!(matches!(result, Err(AnvilError::ConfigError { .. })));
    }
}
