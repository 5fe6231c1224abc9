//! Task definition and lifecycle states.

use crate::utils::monotonic_millis;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::collections::BTreeSet;

/// Unique identifier for a task
pub type TaskId = uuid::Uuid;

/// Bound every task payload has to satisfy to be stored and sent over the wire.
pub trait Payload: Serialize + DeserializeOwned + Clone + Send + Sync + 'static {}

impl<T> Payload for T where T: Serialize + DeserializeOwned + Clone + Send + Sync + 'static {}

/// State of a task
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub enum TaskState {
    /// Not yet persisted
    Pending,
    /// Waiting to be handed to a consumer
    Queued,
    /// Owned by a consumer
    Running,
    /// Failed permanently (handler error or retry limit exhausted)
    Error,
}

impl TaskState {
    /// Numeric code used by relational backends.
    pub fn code(self) -> i32 {
        match self {
            TaskState::Pending => 0,
            TaskState::Queued => 1,
            TaskState::Running => 2,
            TaskState::Error => 3,
        }
    }

    /// Inverse of [`TaskState::code`].
    pub fn from_code(code: i32) -> Option<Self> {
        match code {
            0 => Some(TaskState::Pending),
            1 => Some(TaskState::Queued),
            2 => Some(TaskState::Running),
            3 => Some(TaskState::Error),
            _ => None,
        }
    }
}

/// A unit of work.
///
/// `P` is the application payload. The store never looks inside it.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Task<P = serde_json::Value> {
    /// Unique task identifier
    pub id: TaskId,
    /// Classification used for duration estimates and per-type queries
    pub task_type: String,
    /// Optional logical group
    pub group: Option<String>,
    /// Tags scoping rate limits, retry limits and filtered scans
    pub tags: BTreeSet<String>,
    /// Higher is served first
    pub priority: i32,
    /// Optional correlation key
    pub reference_id: Option<String>,
    /// Creation time in milliseconds, never decreasing within a process
    pub created: u64,
    /// Insertion sequence number, assigned by the store
    pub order: u64,
    /// How many times the task has been put back in the queue
    pub attempts: u32,
    /// When the task last moved to running
    pub started: Option<u64>,
    /// Current state
    pub state: TaskState,
    /// Application payload
    pub payload: P,
}

impl<P: Payload> Task<P> {
    /// Create a new pending task with a fresh id.
    pub fn new(task_type: impl Into<String>, payload: P) -> Self {
        Self {
            id: uuid::Uuid::new_v4(),
            task_type: task_type.into(),
            group: None,
            tags: BTreeSet::new(),
            priority: 0,
            reference_id: None,
            created: monotonic_millis(),
            order: 0,
            attempts: 0,
            started: None,
            state: TaskState::Pending,
            payload,
        }
    }

    /// Replace the generated id.
    pub fn with_id(mut self, id: TaskId) -> Self {
        self.id = id;
        self
    }

    /// Set the priority.
    pub fn with_priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }

    /// Add a tag.
    pub fn with_tag(mut self, tag: impl Into<String>) -> Self {
        self.tags.insert(tag.into());
        self
    }

    /// Add several tags.
    pub fn with_tags<I, S>(mut self, tags: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.tags.extend(tags.into_iter().map(Into::into));
        self
    }

    /// Set the group.
    pub fn with_group(mut self, group: impl Into<String>) -> Self {
        self.group = Some(group.into());
        self
    }

    /// Set the correlation key.
    pub fn with_reference(mut self, reference_id: impl Into<String>) -> Self {
        self.reference_id = Some(reference_id.into());
        self
    }
}

impl<P> Task<P> {
    /// Whether the task carries `tag`.
    pub fn has_tag(&self, tag: &str) -> bool {
        self.tags.contains(tag)
    }
}

/// Canonical dispatch order within one state: priority desc, created asc, order asc.
pub fn dispatch_order<P>(a: &Task<P>, b: &Task<P>) -> Ordering {
    b.priority
        .cmp(&a.priority)
        .then(a.created.cmp(&b.created))
        .then(a.order.cmp(&b.order))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn task(priority: i32) -> Task {
        Task::new("test_task", json!({"test": "data"})).with_priority(priority)
    }

    #[test]
    fn test_builder() {
        let id = uuid::Uuid::new_v4();
        let t = task(3)
            .with_id(id)
            .with_tag("slow")
            .with_tags(["io", "slow"])
            .with_group("billing")
            .with_reference("invoice-1");

        assert_eq!(t.id, id);
        assert_eq!(t.priority, 3);
        assert_eq!(t.tags.len(), 2);
        assert!(t.has_tag("io"));
        assert_eq!(t.group.as_deref(), Some("billing"));
        assert_eq!(t.reference_id.as_deref(), Some("invoice-1"));
        assert_eq!(t.state, TaskState::Pending);
        assert_eq!(t.attempts, 0);
    }

    #[test]
    fn test_created_never_decreases() {
        let a = task(0);
        let b = task(0);
        assert!(b.created >= a.created);
    }

    #[test]
    fn test_dispatch_order() {
        let mut low = task(1);
        let high = task(5);
        let mut later = task(1);
        low.created = 10;
        later.created = 20;

        let mut tasks = vec![later.clone(), high.clone(), low.clone()];
        tasks.sort_by(dispatch_order);
        let ids: Vec<_> = tasks.iter().map(|t| t.id).collect();
        assert_eq!(ids, vec![high.id, low.id, later.id]);
    }

    #[test]
    fn test_order_breaks_created_ties() {
        let mut a = task(0);
        let mut b = task(0);
        a.created = 5;
        b.created = 5;
        a.order = 2;
        b.order = 1;
        assert_eq!(dispatch_order(&a, &b), Ordering::Greater);
    }

    #[test]
    fn test_state_codes() {
        for state in [
            TaskState::Pending,
            TaskState::Queued,
            TaskState::Running,
            TaskState::Error,
        ] {
            assert_eq!(TaskState::from_code(state.code()), Some(state));
        }
        assert_eq!(TaskState::from_code(9), None);
    }
}
