//! TCP transport between a producer that owns the queue and remote consumers.
//!
//! Frames are length prefixed JSON documents. A consumer sends [`Command`]s,
//! the producer answers with [`ServerMessage`]s.
//!
//! # Features
//!
//! - **Crash recovery**: a consumer that reconnects re-claims the tasks it
//!   still holds, and commands issued while offline are replayed in order
//! - **Auto requeue**: tasks held by a consumer that vanishes go back in the queue

pub mod command;
pub mod consumer;
pub mod producer;

pub use command::{Command, ServerMessage};
pub use consumer::{Consumer, ConsumerHandle, ConsumerState, TaskHandler};
pub use producer::Producer;

use tokio_util::codec::LengthDelimitedCodec;

/// Frame codec shared by both ends of a connection.
pub(crate) fn frame_codec(max_frame_length: usize) -> LengthDelimitedCodec {
    LengthDelimitedCodec::builder()
        .max_frame_length(max_frame_length)
        .new_codec()
}
