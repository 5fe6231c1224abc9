//! Observability hooks fired by the queue engine.
//!
//! Hooks run after the change they describe has been committed. A panicking
//! hook is logged and swallowed, it never reaches the dispatch path.

use crate::task::{Payload, Task};
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::{Arc, RwLock};

/// How a task left the running state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TaskOutcome {
    /// Acknowledged and removed
    Completed,
    /// Put back in the queue for another attempt
    Requeued,
    /// Moved to the error bucket after its retries ran out
    Failed,
    /// Removed without completing
    Cancelled,
}

/// Receives engine events. Every method defaults to doing nothing.
///
/// Implementations must return quickly.
pub trait QueueListener<P: Payload>: Send + Sync {
    /// Tasks were queued
    fn on_submit(&self, _task: &Task<P>) {}

    /// A task was handed out
    fn on_acquire(&self, _task: &Task<P>) {}

    /// A task was acknowledged, requeued, failed or cancelled
    fn on_done(&self, _task: &Task<P>, _outcome: TaskOutcome) {}
}

/// The listeners registered with one engine.
pub(crate) struct Listeners<P: Payload> {
    inner: RwLock<Vec<Arc<dyn QueueListener<P>>>>,
}

impl<P: Payload> Listeners<P> {
    pub(crate) fn new() -> Self {
        Self {
            inner: RwLock::new(Vec::new()),
        }
    }

    pub(crate) fn add(&self, listener: Arc<dyn QueueListener<P>>) {
        if let Ok(mut inner) = self.inner.write() {
            inner.push(listener);
        }
    }

    pub(crate) fn clear(&self) {
        if let Ok(mut inner) = self.inner.write() {
            inner.clear();
        }
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.inner.read().map(|inner| inner.is_empty()).unwrap_or(true)
    }

    /// Call `event` on every listener, containing panics.
    pub(crate) fn notify(&self, event: &'static str, call: impl Fn(&dyn QueueListener<P>)) {
        let snapshot: Vec<_> = match self.inner.read() {
            Ok(inner) => inner.clone(),
            Err(_) => return,
        };
        for listener in snapshot {
            if catch_unwind(AssertUnwindSafe(|| call(listener.as_ref()))).is_err() {
                tracing::warn!(event, "Queue listener panicked");
            }
        }
    }
}
