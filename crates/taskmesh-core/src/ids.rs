//! Newtype wrappers for identifiers to ensure type safety.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

use crate::CoreError;

/// Unique identifier for a node in the cluster.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct NodeId(String);

impl NodeId {
    /// Create a new NodeId from a string.
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Generate a new random NodeId.
    pub fn generate() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    /// Get the inner string reference.
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Consume and return the inner string.
    pub fn into_inner(self) -> String {
        self.0
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<String> for NodeId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl From<&str> for NodeId {
    fn from(s: &str) -> Self {
        Self(s.to_owned())
    }
}

/// Identity of a task: the node that registered it plus a node-local sequence
/// number. Sequence numbers are never reused within a node's lifetime, so the
/// pair is unique across the cluster.
///
/// Ordering is by node first, then by sequence number.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct TaskId {
    node: NodeId,
    id: u64,
}

impl TaskId {
    /// Create a TaskId from its parts.
    pub fn new(node: NodeId, id: u64) -> Self {
        Self { node, id }
    }

    /// The node that owns the task.
    pub fn node(&self) -> &NodeId {
        &self.node
    }

    /// The node-local sequence number.
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Whether the task lives on the given node.
    pub fn is_on(&self, node: &NodeId) -> bool {
        &self.node == node
    }
}

impl fmt::Display for TaskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.node, self.id)
    }
}

impl FromStr for TaskId {
    type Err = CoreError;

    /// Parses the `node:id` form produced by `Display`. Node ids may
    /// themselves contain colons, so the split happens on the last one.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (node, id) = s
            .rsplit_once(':')
            .ok_or_else(|| CoreError::InvalidTaskId(s.to_string()))?;
        if node.is_empty() {
            return Err(CoreError::InvalidTaskId(s.to_string()));
        }
        let id = id
            .parse::<u64>()
            .map_err(|_| CoreError::InvalidTaskId(s.to_string()))?;
        Ok(Self::new(NodeId::new(node), id))
    }
}
