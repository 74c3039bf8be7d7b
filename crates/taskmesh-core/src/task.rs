//! Task types.

use std::collections::HashMap;
use std::time::Instant;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::{Cancellation, TaskCancelled, TaskId};

/// Everything needed to register a task, minus its id.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TaskRequest {
    /// Kind of work, e.g. `transport` or `direct`.
    pub task_type: String,

    /// Action name, e.g. `cluster:admin/settings/update`.
    pub action: String,

    /// Human-readable description of the request.
    pub description: String,

    /// Parent task, if this is a child of other work.
    pub parent: Option<TaskId>,

    /// Caller-supplied headers carried along for audit purposes.
    pub headers: HashMap<String, String>,

    /// Whether the task can be cancelled.
    pub cancellable: bool,

    /// Whether cancelling the task also cancels its descendants.
    pub cancel_children: bool,
}

impl TaskRequest {
    /// Create a request for a non-cancellable task.
    pub fn new(task_type: impl Into<String>, action: impl Into<String>) -> Self {
        Self {
            task_type: task_type.into(),
            action: action.into(),
            description: String::new(),
            parent: None,
            headers: HashMap::new(),
            cancellable: false,
            cancel_children: false,
        }
    }

    /// Builder method to set the description.
    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    /// Builder method to set the parent task.
    pub fn with_parent(mut self, parent: TaskId) -> Self {
        self.parent = Some(parent);
        self
    }

    /// Builder method to add a header.
    pub fn with_header(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.insert(key.into(), value.into());
        self
    }

    /// Builder method to make the task cancellable.
    pub fn cancellable(mut self, cancel_children: bool) -> Self {
        self.cancellable = true;
        self.cancel_children = cancel_children;
        self
    }
}

/// A live unit of work tracked by a node's registry.
///
/// Tasks only know their parent. Children are found by scanning the registry
/// for tasks whose parent matches.
#[derive(Debug)]
pub struct Task {
    id: TaskId,
    task_type: String,
    action: String,
    description: String,
    parent: Option<TaskId>,
    start_time: DateTime<Utc>,
    started: Instant,
    headers: HashMap<String, String>,
    cancellation: Option<Cancellation>,
}

impl Task {
    /// Build a task from a request and the id allocated for it.
    pub fn new(id: TaskId, request: TaskRequest) -> Self {
        let cancellation = request
            .cancellable
            .then(|| Cancellation::new(request.cancel_children));
        Self {
            id,
            task_type: request.task_type,
            action: request.action,
            description: request.description,
            parent: request.parent,
            start_time: Utc::now(),
            started: Instant::now(),
            headers: request.headers,
            cancellation,
        }
    }

    pub fn id(&self) -> &TaskId {
        &self.id
    }

    pub fn task_type(&self) -> &str {
        &self.task_type
    }

    pub fn action(&self) -> &str {
        &self.action
    }

    pub fn description(&self) -> &str {
        &self.description
    }

    pub fn parent(&self) -> Option<&TaskId> {
        self.parent.as_ref()
    }

    /// Whether this task's parent is `parent`.
    pub fn has_parent(&self, parent: &TaskId) -> bool {
        self.parent.as_ref() == Some(parent)
    }

    pub fn start_time(&self) -> DateTime<Utc> {
        self.start_time
    }

    pub fn headers(&self) -> &HashMap<String, String> {
        &self.headers
    }

    /// The cancellation capability, if the task has one.
    pub fn cancellation(&self) -> Option<&Cancellation> {
        self.cancellation.as_ref()
    }

    pub fn is_cancellable(&self) -> bool {
        self.cancellation.is_some()
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancellation
            .as_ref()
            .is_some_and(Cancellation::is_cancelled)
    }

    /// Whether descendants should be cancelled with this task. Always false
    /// for tasks that cannot be cancelled.
    pub fn should_cancel_children_on_cancellation(&self) -> bool {
        self.cancellation
            .as_ref()
            .is_some_and(Cancellation::should_cancel_children_on_cancellation)
    }

    /// Returns an error if the task has been cancelled. Never fails for
    /// non-cancellable tasks.
    pub fn ensure_not_cancelled(&self) -> Result<(), TaskCancelled> {
        match &self.cancellation {
            Some(c) => c.ensure_not_cancelled(),
            None => Ok(()),
        }
    }

    /// Snapshot of the task for listings.
    pub fn info(&self) -> TaskInfo {
        TaskInfo {
            id: self.id.clone(),
            task_type: self.task_type.clone(),
            action: self.action.clone(),
            description: self.description.clone(),
            parent: self.parent.clone(),
            start_time: self.start_time,
            running_time_ms: self.started.elapsed().as_millis() as u64,
            cancellable: self.is_cancellable(),
            cancelled: self.is_cancelled(),
            headers: self.headers.clone(),
        }
    }
}

/// Point-in-time, serialisable view of a task.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskInfo {
    pub id: TaskId,
    pub task_type: String,
    pub action: String,
    pub description: String,
    pub parent: Option<TaskId>,
    pub start_time: DateTime<Utc>,
    pub running_time_ms: u64,
    pub cancellable: bool,
    pub cancelled: bool,
    pub headers: HashMap<String, String>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::NodeId;

    fn id(n: u64) -> TaskId {
        TaskId::new(NodeId::new("node-1"), n)
    }

    #[test]
    fn test_plain_task_is_never_cancelled() {
        let task = Task::new(id(1), TaskRequest::new("transport", "indices:data/read"));
        assert!(!task.is_cancellable());
        assert!(!task.should_cancel_children_on_cancellation());
        assert!(task.ensure_not_cancelled().is_ok());
        assert!(task.cancellation().is_none());
    }

    #[test]
    fn test_cancellable_task() {
        let request = TaskRequest::new("transport", "cluster:admin/reroute")
            .with_parent(id(1))
            .with_header("trace.id", "abc")
            .cancellable(true);
        let task = Task::new(id(2), request);

        assert!(task.has_parent(&id(1)));
        assert!(task.should_cancel_children_on_cancellation());
        task.cancellation().unwrap().cancel("shutting down");
        assert!(task.is_cancelled());
        assert_eq!(
            task.ensure_not_cancelled().unwrap_err().reason,
            "shutting down"
        );
    }

    #[test]
    fn test_info_serializes() {
        let task = Task::new(
            id(3),
            TaskRequest::new("direct", "internal:ping")
                .with_description("ping [node-2]")
                .with_header("user", "ops"),
        );
        let info = task.info();
        assert_eq!(info.headers.get("user").map(String::as_str), Some("ops"));

        let json = serde_json::to_string(&info).unwrap();
        let back: TaskInfo = serde_json::from_str(&json).unwrap();
        assert_eq!(back.id, info.id);
        assert_eq!(back.description, "ping [node-2]");
    }
}
