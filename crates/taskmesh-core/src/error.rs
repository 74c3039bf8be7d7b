//! Core domain errors.

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::TaskId;

/// Raised when a task, or the work it is doing, has been cancelled.
#[derive(Debug, Clone, PartialEq, Eq, Error, Serialize, Deserialize)]
#[error("task cancelled [{reason}]")]
pub struct TaskCancelled {
    /// Reason supplied by whoever cancelled the task.
    pub reason: String,
}

impl TaskCancelled {
    /// Create a new cancellation error.
    pub fn new(reason: impl Into<String>) -> Self {
        Self {
            reason: reason.into(),
        }
    }
}

/// Core domain errors for TaskMesh.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CoreError {
    /// The task itself was cancelled.
    #[error(transparent)]
    TaskCancelled(#[from] TaskCancelled),

    /// A new child was refused because its parent is banned on this node.
    #[error("parent task [{parent}] was cancelled [{reason}], not starting child tasks")]
    ParentCancelled { parent: TaskId, reason: String },

    /// Task id could not be parsed.
    #[error("Invalid task id: {0}")]
    InvalidTaskId(String),

    /// Cancellation was requested for a task that does not support it.
    #[error("Task is not cancellable: {0}")]
    NotCancellable(TaskId),
}

impl CoreError {
    /// Whether this error means the work was cancelled, either directly or
    /// through a cancelled ancestor.
    pub fn is_cancellation(&self) -> bool {
        matches!(self, Self::TaskCancelled(_) | Self::ParentCancelled { .. })
    }

    /// The cancellation reason, if this is a cancellation error.
    pub fn cancellation_reason(&self) -> Option<&str> {
        match self {
            Self::TaskCancelled(e) => Some(&e.reason),
            Self::ParentCancelled { reason, .. } => Some(reason),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::NodeId;

    #[test]
    fn test_cancelled_message_names_reason() {
        let err = TaskCancelled::new("user requested");
        assert_eq!(err.to_string(), "task cancelled [user requested]");
    }

    #[test]
    fn test_parent_cancelled_is_cancellation() {
        let err = CoreError::ParentCancelled {
            parent: TaskId::new(NodeId::new("n1"), 3),
            reason: "by user".to_string(),
        };
        assert!(err.is_cancellation());
        assert_eq!(err.cancellation_reason(), Some("by user"));
        assert!(err.to_string().contains("n1:3"));
        assert!(!CoreError::InvalidTaskId("x".into()).is_cancellation());
    }
}
