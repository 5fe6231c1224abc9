//! # anvilq
//!
//! A durable priority task queue with per-tag rate limits, retry limits and
//! crash-safe distribution of work to remote consumers.
//!
//! ## Features
//!
//! - **Priority dispatch**: highest priority first, FIFO within a priority
//! - **Tag rate limits**: cap how many tasks carrying a tag run at once
//! - **Retry limits**: tasks that keep failing end up in an error bucket
//! - **Isolated changes**: multi-step store updates commit or roll back as a unit
//! - **Pluggable stores**: in-memory, or PostgreSQL with `postgres-store`
//! - **Crash recovery**: consumers re-claim their tasks and replay offline
//!   commands after a producer restart
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use anvilq::prelude::*;
//! use std::sync::Arc;
//!
//! struct Mailer;
//!
//! #[async_trait]
//! impl TaskHandler<serde_json::Value> for Mailer {
//!     async fn handle(&self, consumer: &ConsumerHandle, task: Task) -> Result<(), HandlerError> {
//!         println!("sending {}", task.payload);
//!         consumer.acknowledge(task.id).await?;
//!         consumer.ready().await?;
//!         Ok(())
//!     }
//! }
//!
//! #[tokio::main]
//! async fn main() -> AnvilResult<()> {
//!     let config = AnvilConfig::development();
//!     init_tracing(&config.logging);
//!
//!     let anvil: Anvil = Anvil::new(config.clone()).await?;
//!     anvil.engine().set_rate_limit("smtp", 2).await?;
//!     anvil.start().await?;
//!
//!     anvil
//!         .submit(Task::new("email", serde_json::json!({"to": "a@b.c"})).with_tag("smtp"))
//!         .await?;
//!
//!     let consumer = Consumer::new(config.consumer, Mailer);
//!     consumer.connect().await?;
//!
//!     anvil.wait_for_shutdown().await
//! }
//! ```

pub mod config;
pub mod core;
pub mod error;
pub mod server;
pub mod store;
pub mod task;
pub mod utils;

pub mod prelude {
    pub use crate::config::*;
    pub use crate::core::{Anvil, QueueEngine, QueueListener, TaskOutcome};
    pub use crate::error::{AnvilError, AnvilResult};
    pub use crate::server::consumer::HandlerError;
    pub use crate::server::{Consumer, ConsumerHandle, ConsumerState, Producer, TaskHandler};
    pub use crate::store::{
        ChunkedCursor, InMemoryStore, Isolation, QueueScope, Session, SharedStore, StoreFactory, StoreOps,
        TaskStore,
    };
    pub use crate::task::{Payload, Task, TaskId, TaskState};
    pub use crate::utils::init_tracing;
    pub use async_trait::async_trait;

    #[cfg(feature = "postgres-store")]
    #[cfg_attr(docsrs, doc(cfg(feature = "postgres-store")))]
    pub use crate::store::PostgresStore;
}

pub use crate::config::*;
pub use crate::core::{Anvil, QueueEngine};
pub use crate::error::{AnvilError, AnvilResult};
pub use crate::server::{Consumer, Producer, TaskHandler};
pub use crate::store::{SharedStore, StoreFactory, TaskStore};
pub use crate::task::{Task, TaskId, TaskState};
pub use async_trait::async_trait;
