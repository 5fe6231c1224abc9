//! Messages exchanged between producers and consumers.

use crate::error::{AnvilError, AnvilResult};
use crate::task::{Task, TaskId};
use bytes::Bytes;
use serde::{Deserialize, Serialize, de::DeserializeOwned};

/// Consumer to producer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", content = "args", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Command {
    /// Ask for one task
    Ready,
    /// The task completed
    Ack(TaskId),
    /// Give the task up, optionally putting it back in the queue
    Nack {
        /// Task being given up
        id: TaskId,
        /// Whether to requeue it
        requeue: bool,
    },
    /// Re-associate tasks this consumer still holds after a reconnect
    Recover(Vec<TaskId>),
    /// The task failed for good
    Error(TaskId),
}

impl Command {
    /// Whether the command may wait in the offline buffer.
    pub fn is_bufferable(&self) -> bool {
        !matches!(self, Command::Recover(_))
    }

    /// The task this command settles, if any.
    pub fn settles(&self) -> Option<TaskId> {
        match self {
            Command::Ack(id) | Command::Error(id) | Command::Nack { id, .. } => Some(*id),
            Command::Ready | Command::Recover(_) => None,
        }
    }
}

/// Producer to consumer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "body", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ServerMessage<P> {
    /// A task to process
    Task(Task<P>),
    /// The producer gave up on the connection
    Error(String),
}

/// Serialize a message into one frame body.
pub fn encode<T: Serialize>(message: &T) -> AnvilResult<Bytes> {
    Ok(Bytes::from(serde_json::to_vec(message)?))
}

/// Parse one frame body.
pub fn decode<T: DeserializeOwned>(frame: &[u8]) -> AnvilResult<T> {
    serde_json::from_slice(frame).map_err(|e| AnvilError::protocol(format!("Malformed frame: {e}")))
}
