//! Change notification between store writers and waiting acquirers.
//!
//! A [`ChangeChannel`] carries a version counter that every publish bumps.
//! Listeners remember the version they last saw, so a publish that happens
//! between [`ChangeChannel::subscribe`] and [`ChangeListener::wait`] is not lost.

use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;

/// Why a [`ChangeListener::wait`] returned.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChangeEvent {
    /// A change was published after the listener last looked
    Signalled,
    /// The poll interval elapsed with no change
    TimedOut,
    /// The channel was closed
    Closed,
}

/// Fan-out notifier shared by a store and all of its listeners.
#[derive(Debug, Clone)]
pub struct ChangeChannel {
    version: Arc<watch::Sender<u64>>,
    closed: CancellationToken,
}

impl ChangeChannel {
    /// Create an open channel.
    pub fn new() -> Self {
        let (version, _) = watch::channel(0);
        Self {
            version: Arc::new(version),
            closed: CancellationToken::new(),
        }
    }

    /// Wake every listener. Never blocks.
    pub fn publish(&self) {
        self.version.send_modify(|v| *v = v.wrapping_add(1));
        tracing::trace!(version = *self.version.borrow(), "Change published");
    }

    /// Start listening. Only publishes after this call wake the listener.
    pub fn subscribe(&self) -> ChangeListener {
        ChangeListener {
            receiver: self.version.subscribe(),
            closed: self.closed.clone(),
        }
    }

    /// Close the channel. Pending and future waits return [`ChangeEvent::Closed`].
    pub fn close(&self) {
        self.closed.cancel();
    }

    /// Whether [`ChangeChannel::close`] was called.
    pub fn is_closed(&self) -> bool {
        self.closed.is_cancelled()
    }
}

impl Default for ChangeChannel {
    fn default() -> Self {
        Self::new()
    }
}

/// A subscription to a [`ChangeChannel`].
#[derive(Debug)]
pub struct ChangeListener {
    receiver: watch::Receiver<u64>,
    closed: CancellationToken,
}

impl ChangeListener {
    /// Wait for the next change, or at most `poll`.
    pub async fn wait(&mut self, poll: Duration) -> ChangeEvent {
        if self.closed.is_cancelled() {
            return ChangeEvent::Closed;
        }

        tokio::select! {
            changed = self.receiver.changed() => match changed {
                Ok(()) => ChangeEvent::Signalled,
                Err(_) => ChangeEvent::Closed,
            },
            _ = self.closed.cancelled() => ChangeEvent::Closed,
            _ = tokio::time::sleep(poll) => ChangeEvent::TimedOut,
        }
    }

    /// Whether a change was published since the listener last looked.
    pub fn has_changed(&self) -> bool {
        self.receiver.has_changed().unwrap_or(false)
    }
}
