//! Node-to-node requests.
//!
//! [`Transport`] is the sending side, [`NodeHandler`] the receiving side.
//! [`LocalTransport`] connects handlers living in the same process, which is
//! how the simulation binary and the tests run whole clusters.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, RwLock, Weak};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::debug;

use taskmesh_core::{BlockLevel, NodeId, TaskFilter, TaskId, TaskInfo};

use crate::action::{OperationRequest, OperationResponse};
use crate::error::{RemoteError, TransportError};

/// An operation forwarded to the leader.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DelegatedRequest {
    pub request: OperationRequest,
    pub level: BlockLevel,
    /// Task on the sending node that the leader-side work is a child of.
    pub parent_task: Option<TaskId>,
}

/// Cancel a single task on the node that owns it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CancelTaskRequest {
    pub task_id: TaskId,
    pub reason: String,
    pub wait_for_completion: bool,
}

impl CancelTaskRequest {
    pub fn new(task_id: TaskId, reason: impl Into<String>) -> Self {
        Self {
            task_id,
            reason: reason.into(),
            wait_for_completion: false,
        }
    }

    pub fn wait_for_completion(mut self, wait: bool) -> Self {
        self.wait_for_completion = wait;
        self
    }
}

/// Cancel either one task or every task matching a filter.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CancelTasksRequest {
    pub task_id: Option<TaskId>,
    pub filter: TaskFilter,
    pub reason: String,
    pub wait_for_completion: bool,
}

/// A node that failed to answer a fan-out request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeFailure {
    pub node: NodeId,
    pub error: String,
}

impl NodeFailure {
    pub fn new(node: NodeId, error: impl ToString) -> Self {
        Self {
            node,
            error: error.to_string(),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CancelTasksResponse {
    /// Tasks that were cancelled. Empty if the target had already finished.
    pub tasks: Vec<TaskInfo>,
    pub node_failures: Vec<NodeFailure>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ListTasksResponse {
    pub tasks: Vec<TaskInfo>,
    pub node_failures: Vec<NodeFailure>,
}

/// Install or lift a ban on children of `parent`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum BanRequest {
    Install {
        parent: TaskId,
        reason: String,
        /// Node driving the cancellation; the ban is dropped if it leaves.
        coordinator: NodeId,
        /// Acknowledge only once the children already running have finished.
        wait_for_completion: bool,
    },
    Lift {
        parent: TaskId,
    },
}

impl BanRequest {
    pub fn parent(&self) -> &TaskId {
        match self {
            Self::Install { parent, .. } | Self::Lift { parent } => parent,
        }
    }
}

/// Sends requests to other nodes.
#[async_trait]
pub trait Transport: Send + Sync {
    async fn send_operation(
        &self,
        node: &NodeId,
        request: DelegatedRequest,
    ) -> Result<OperationResponse, TransportError>;

    async fn send_cancel(
        &self,
        node: &NodeId,
        request: CancelTaskRequest,
    ) -> Result<CancelTasksResponse, TransportError>;

    async fn send_ban(&self, node: &NodeId, request: BanRequest) -> Result<(), TransportError>;

    async fn send_list_tasks(
        &self,
        node: &NodeId,
        filter: TaskFilter,
    ) -> Result<Vec<TaskInfo>, TransportError>;
}

/// Receives requests from other nodes.
#[async_trait]
pub trait NodeHandler: Send + Sync {
    async fn handle_operation(
        &self,
        request: DelegatedRequest,
    ) -> Result<OperationResponse, RemoteError>;

    async fn handle_cancel(
        &self,
        request: CancelTaskRequest,
    ) -> Result<CancelTasksResponse, RemoteError>;

    async fn handle_ban(&self, request: BanRequest) -> Result<(), RemoteError>;

    async fn handle_list_tasks(&self, filter: TaskFilter) -> Result<Vec<TaskInfo>, RemoteError>;
}

/// In-process transport.
///
/// Handlers are held weakly so that nodes holding the transport do not keep
/// each other alive. Each request runs on its own tokio task, as it would on
/// a remote node: dropping the sending future does not abort the handler.
#[derive(Default)]
pub struct LocalTransport {
    handlers: RwLock<HashMap<NodeId, Weak<dyn NodeHandler>>>,
    disconnected: RwLock<HashSet<NodeId>>,
}

impl LocalTransport {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn connect(&self, node: NodeId, handler: Weak<dyn NodeHandler>) {
        self.write_disconnected().remove(&node);
        self.handlers
            .write()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .insert(node, handler);
    }

    /// Make `node` unreachable until reconnected.
    pub fn disconnect(&self, node: &NodeId) {
        debug!(node = %node, "disconnecting node");
        self.write_disconnected().insert(node.clone());
    }

    pub fn reconnect(&self, node: &NodeId) {
        debug!(node = %node, "reconnecting node");
        self.write_disconnected().remove(node);
    }

    fn write_disconnected(&self) -> std::sync::RwLockWriteGuard<'_, HashSet<NodeId>> {
        self.disconnected
            .write()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }

    fn handler(&self, node: &NodeId) -> Result<Arc<dyn NodeHandler>, TransportError> {
        let disconnected = self
            .disconnected
            .read()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .contains(node);
        if disconnected {
            return Err(TransportError::NodeNotConnected(node.clone()));
        }
        self.handlers
            .read()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .get(node)
            .and_then(Weak::upgrade)
            .ok_or_else(|| TransportError::NodeNotConnected(node.clone()))
    }
}

/// Run `call` against `node`'s handler on a fresh tokio task.
async fn dispatch<T, F, Fut>(
    transport: &LocalTransport,
    node: &NodeId,
    call: F,
) -> Result<T, TransportError>
where
    T: Send + 'static,
    F: FnOnce(Arc<dyn NodeHandler>) -> Fut,
    Fut: std::future::Future<Output = Result<T, RemoteError>> + Send + 'static,
{
    let handler = transport.handler(node)?;
    let result = tokio::spawn(call(handler))
        .await
        .map_err(|_| TransportError::ConnectionClosed(node.clone()))?;
    result.map_err(|error| TransportError::Remote {
        node: node.clone(),
        error,
    })
}

#[async_trait]
impl Transport for LocalTransport {
    async fn send_operation(
        &self,
        node: &NodeId,
        request: DelegatedRequest,
    ) -> Result<OperationResponse, TransportError> {
        dispatch(self, node, |h| async move { h.handle_operation(request).await }).await
    }

    async fn send_cancel(
        &self,
        node: &NodeId,
        request: CancelTaskRequest,
    ) -> Result<CancelTasksResponse, TransportError> {
        dispatch(self, node, |h| async move { h.handle_cancel(request).await }).await
    }

    async fn send_ban(&self, node: &NodeId, request: BanRequest) -> Result<(), TransportError> {
        dispatch(self, node, |h| async move { h.handle_ban(request).await }).await
    }

    async fn send_list_tasks(
        &self,
        node: &NodeId,
        filter: TaskFilter,
    ) -> Result<Vec<TaskInfo>, TransportError> {
        dispatch(self, node, |h| async move { h.handle_list_tasks(filter).await }).await
    }
}
