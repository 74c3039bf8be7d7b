//! Node-level errors.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use taskmesh_core::{ClusterBlockError, CoreError, NodeId, TaskCancelled};

/// An operation ran and failed on its own merits.
///
/// Travels verbatim from the node that ran the operation back to the caller,
/// headers included.
#[derive(Debug, Clone, PartialEq, Eq, Error, Serialize, Deserialize)]
#[error("{message}")]
pub struct OperationError {
    pub message: String,
    pub headers: HashMap<String, String>,
}

impl OperationError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            headers: HashMap::new(),
        }
    }

    /// Builder method to add a header.
    pub fn with_header(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.insert(key.into(), value.into());
        self
    }
}

/// Error a node sends back in answer to a request.
#[derive(Debug, Clone, PartialEq, Eq, Error, Serialize, Deserialize)]
pub enum RemoteError {
    /// The receiving node is not (or no longer) the leader.
    #[error("node [{node}] is not the leader")]
    NotLeader { node: NodeId },

    #[error(transparent)]
    Cancelled(#[from] TaskCancelled),

    #[error(transparent)]
    Blocked(#[from] ClusterBlockError),

    #[error(transparent)]
    Operation(#[from] OperationError),

    /// The operation's block check failed on the receiving node.
    #[error("block check failed: {0}")]
    BlockCheck(#[source] OperationError),

    #[error("unknown action [{0}]")]
    UnknownAction(String),

    #[error("{0}")]
    Internal(String),
}

impl From<CoreError> for RemoteError {
    fn from(err: CoreError) -> Self {
        match err {
            CoreError::TaskCancelled(e) => Self::Cancelled(e),
            CoreError::ParentCancelled { reason, .. } => {
                Self::Cancelled(TaskCancelled::new(reason))
            }
            other => Self::Internal(other.to_string()),
        }
    }
}

/// Failure to get an answer from another node.
#[derive(Debug, Clone, Error)]
pub enum TransportError {
    #[error("node [{0}] is not connected")]
    NodeNotConnected(NodeId),

    #[error("connection to node [{0}] was closed")]
    ConnectionClosed(NodeId),

    /// The node answered with an error.
    #[error("[{node}] {error}")]
    Remote {
        node: NodeId,
        #[source]
        error: RemoteError,
    },
}

impl TransportError {
    /// Whether the request never got an answer. These are transient.
    pub fn is_connectivity(&self) -> bool {
        matches!(self, Self::NodeNotConnected(_) | Self::ConnectionClosed(_))
    }
}

/// Errors surfaced by the leader delegation executor.
#[derive(Debug, Error)]
pub enum DelegationError {
    /// The originating task was cancelled.
    #[error(transparent)]
    Cancelled(#[from] TaskCancelled),

    /// Timed out waiting for a usable leader or for a block to clear.
    #[error("leader not discovered within timeout{}", describe_cause(.cause))]
    LeaderNotDiscovered {
        #[source]
        cause: Option<Box<DelegationError>>,
    },

    /// Blocked by a block that will not clear on its own.
    #[error(transparent)]
    Blocked(ClusterBlockError),

    /// The operation's block check itself failed.
    #[error("block check failed: {0}")]
    BlockCheck(#[source] OperationError),

    /// The operation failed, locally or on the leader.
    #[error(transparent)]
    Operation(#[from] OperationError),

    #[error(transparent)]
    Connectivity(TransportError),

    #[error("node [{0}] is not the leader")]
    NotLeader(NodeId),

    #[error("unknown action [{0}]")]
    UnknownAction(String),

    #[error("node closed")]
    NodeClosed,

    #[error("{0}")]
    Internal(String),
}

fn describe_cause(cause: &Option<Box<DelegationError>>) -> String {
    match cause {
        Some(cause) => format!(": {cause}"),
        None => String::new(),
    }
}

impl DelegationError {
    pub fn is_cancellation(&self) -> bool {
        matches!(self, Self::Cancelled(_))
    }
}

impl From<RemoteError> for DelegationError {
    fn from(err: RemoteError) -> Self {
        match err {
            RemoteError::NotLeader { node } => Self::NotLeader(node),
            RemoteError::Cancelled(e) => Self::Cancelled(e),
            RemoteError::Blocked(e) => Self::Blocked(e),
            RemoteError::Operation(e) => Self::Operation(e),
            RemoteError::BlockCheck(e) => Self::BlockCheck(e),
            RemoteError::UnknownAction(action) => Self::UnknownAction(action),
            RemoteError::Internal(msg) => Self::Internal(msg),
        }
    }
}

/// Errors from the cancellation coordinator.
#[derive(Debug, Error)]
pub enum CancelError {
    #[error(transparent)]
    Core(#[from] CoreError),

    #[error(transparent)]
    Transport(#[from] TransportError),
}

impl From<CancelError> for RemoteError {
    fn from(err: CancelError) -> Self {
        match err {
            CancelError::Core(e) => e.into(),
            CancelError::Transport(TransportError::Remote { error, .. }) => error,
            CancelError::Transport(e) => Self::Internal(e.to_string()),
        }
    }
}
