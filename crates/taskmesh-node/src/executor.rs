//! Runs leader-only operations from any node.
//!
//! Each attempt checks the cluster blocks for the operation, then either runs
//! it here (this node is the leader, or local execution was requested) or
//! sends it to the leader. Retryable blocks, a missing leader, a leader that
//! stepped down and an unreachable leader all wait for the next cluster state
//! and try again, until the deadline computed on entry has passed. The
//! originating task's cancellation is observed at every wait.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{oneshot, watch};
use tokio::time::Instant;
use tracing::{debug, info, warn};

use taskmesh_core::{
    BlockLevel, Cancellation, ListenerId, NodeId, Task, TaskCancelled, TaskId, TaskRequest,
};

use crate::action::{ActionRegistry, LeaderOperation, OperationRequest, OperationResponse};
use crate::cluster::{ClusterMembershipView, ClusterState};
use crate::error::{DelegationError, RemoteError, TransportError};
use crate::registry::TaskRegistry;
use crate::transport::{DelegatedRequest, Transport};

/// Task type of the leader-side task tracking a delegated operation.
pub const LEADER_TASK_TYPE: &str = "leader";

enum Attempt {
    Done(OperationResponse),
    /// Try again on the next cluster state. Carries the reason, reported as
    /// the cause if the deadline passes first.
    Retry(Option<DelegationError>),
}

pub struct LeaderDelegationExecutor {
    local_node: NodeId,
    registry: Arc<TaskRegistry>,
    cluster: Arc<dyn ClusterMembershipView>,
    transport: Arc<dyn Transport>,
    actions: Arc<ActionRegistry>,
}

impl LeaderDelegationExecutor {
    pub fn new(
        registry: Arc<TaskRegistry>,
        cluster: Arc<dyn ClusterMembershipView>,
        transport: Arc<dyn Transport>,
        actions: Arc<ActionRegistry>,
    ) -> Self {
        Self {
            local_node: registry.local_node().clone(),
            registry,
            cluster,
            transport,
            actions,
        }
    }

    /// Run `request` on the leader, retrying until `timeout` elapses.
    ///
    /// `originating_task`, if given and still registered on this node, is the
    /// task the work is done for: cancelling it aborts the call, and the
    /// leader tracks the operation as its child.
    pub async fn run(
        &self,
        request: OperationRequest,
        level: BlockLevel,
        timeout: Duration,
        originating_task: Option<&TaskId>,
    ) -> Result<OperationResponse, DelegationError> {
        let operation = self
            .actions
            .get(&request.action)
            .ok_or_else(|| DelegationError::UnknownAction(request.action.clone()))?;
        let deadline = Instant::now() + timeout;

        let task = originating_task.and_then(|id| self.registry.get(id));
        let mut cancelled =
            CancellationSignal::new(task.as_deref().and_then(Task::cancellation));
        let mut observer = self.cluster.subscribe();
        let mut state = observer.borrow_and_update().clone();

        let mut attempts = 0u32;
        loop {
            if let Some(task) = &task {
                task.ensure_not_cancelled()?;
            }
            attempts += 1;

            let attempt = self
                .attempt(
                    operation.as_ref(),
                    &request,
                    level,
                    &state,
                    originating_task,
                    &mut cancelled,
                )
                .await?;
            let cause = match attempt {
                Attempt::Done(response) => {
                    if attempts > 1 {
                        info!(
                            action = %request.action,
                            attempts,
                            "operation completed after retries"
                        );
                    }
                    return Ok(response);
                }
                Attempt::Retry(cause) => cause,
            };

            debug!(
                action = %request.action,
                attempt = attempts,
                version = state.version,
                cause = ?cause.as_ref().map(ToString::to_string),
                "waiting for next cluster state"
            );
            state = wait_for_next_state(&mut observer, &mut cancelled, deadline, cause).await?;
        }
    }

    async fn attempt(
        &self,
        operation: &dyn LeaderOperation,
        request: &OperationRequest,
        level: BlockLevel,
        state: &Arc<ClusterState>,
        parent: Option<&TaskId>,
        cancelled: &mut CancellationSignal<'_>,
    ) -> Result<Attempt, DelegationError> {
        match operation.check_block(request, state, level) {
            Err(e) => return Err(DelegationError::BlockCheck(e)),
            Ok(Some(block)) if block.retryable() => {
                return Ok(Attempt::Retry(Some(DelegationError::Blocked(block))));
            }
            Ok(Some(block)) => return Err(DelegationError::Blocked(block)),
            Ok(None) => {}
        }

        if request.execute_locally || state.is_leader(&self.local_node) {
            let response = self
                .execute_operation(operation, request, state, parent)
                .await?;
            return Ok(Attempt::Done(response));
        }

        let Some(leader) = state.leader().cloned() else {
            return Ok(Attempt::Retry(None));
        };

        debug!(action = %request.action, leader = %leader, "delegating to leader");
        let delegated = DelegatedRequest {
            request: request.clone(),
            level,
            parent_task: parent.cloned(),
        };
        let result = tokio::select! {
            biased;
            reason = cancelled.cancelled() => return Err(DelegationError::Cancelled(reason)),
            result = self.transport.send_operation(&leader, delegated) => result,
        };

        match result {
            Ok(response) => Ok(Attempt::Done(response)),
            Err(TransportError::Remote {
                node,
                error: RemoteError::NotLeader { .. },
            }) => {
                debug!(node = %node, "delegation target is no longer the leader");
                Ok(Attempt::Retry(Some(DelegationError::NotLeader(node))))
            }
            Err(TransportError::Remote {
                error: RemoteError::Blocked(block),
                ..
            }) if block.retryable() => Ok(Attempt::Retry(Some(DelegationError::Blocked(block)))),
            Err(TransportError::Remote { error, .. }) => Err(error.into()),
            Err(e) => {
                warn!(leader = %leader, error = %e, "failed to reach leader");
                Ok(Attempt::Retry(Some(DelegationError::Connectivity(e))))
            }
        }
    }

    /// Run an operation on this node, tracked as a child of `parent`.
    ///
    /// A ban on `parent` refuses the work up front, and cancelling `parent`
    /// cancels it while it runs.
    async fn execute_operation(
        &self,
        operation: &dyn LeaderOperation,
        request: &OperationRequest,
        state: &ClusterState,
        parent: Option<&TaskId>,
    ) -> Result<OperationResponse, RemoteError> {
        let mut task_request =
            TaskRequest::new(LEADER_TASK_TYPE, request.action.clone()).cancellable(true);
        for (key, value) in &request.headers {
            task_request = task_request.with_header(key.clone(), value.clone());
        }
        if let Some(parent) = parent {
            task_request = task_request.with_parent(parent.clone());
        }

        let task = RegisteredTask::register(&self.registry, task_request)?;
        debug!(task_id = %task.id(), action = %request.action, "executing operation");
        let response = operation.execute(&task, request, state).await?;
        Ok(response)
    }

    /// Handle an operation delegated by another node.
    pub async fn handle_delegated(
        &self,
        delegated: DelegatedRequest,
    ) -> Result<OperationResponse, RemoteError> {
        let state = self.cluster.state();
        if !state.is_leader(&self.local_node) {
            return Err(RemoteError::NotLeader {
                node: self.local_node.clone(),
            });
        }

        let operation = self
            .actions
            .get(&delegated.request.action)
            .ok_or_else(|| RemoteError::UnknownAction(delegated.request.action.clone()))?;
        match operation.check_block(&delegated.request, &state, delegated.level) {
            Err(e) => return Err(RemoteError::BlockCheck(e)),
            Ok(Some(block)) => return Err(RemoteError::Blocked(block)),
            Ok(None) => {}
        }

        self.execute_operation(
            operation.as_ref(),
            &delegated.request,
            &state,
            delegated.parent_task.as_ref(),
        )
        .await
    }
}

async fn wait_for_next_state(
    observer: &mut watch::Receiver<Arc<ClusterState>>,
    cancelled: &mut CancellationSignal<'_>,
    deadline: Instant,
    cause: Option<DelegationError>,
) -> Result<Arc<ClusterState>, DelegationError> {
    if Instant::now() >= deadline {
        return Err(leader_not_discovered(cause));
    }

    tokio::select! {
        biased;
        reason = cancelled.cancelled() => Err(DelegationError::Cancelled(reason)),
        changed = tokio::time::timeout_at(deadline, observer.changed()) => match changed {
            Ok(Ok(())) => Ok(observer.borrow_and_update().clone()),
            Ok(Err(_)) => Err(DelegationError::NodeClosed),
            Err(_) => Err(leader_not_discovered(cause)),
        },
    }
}

fn leader_not_discovered(cause: Option<DelegationError>) -> DelegationError {
    DelegationError::LeaderNotDiscovered {
        cause: cause.map(Box::new),
    }
}

/// Resolves when the originating task is cancelled. Never resolves if there is
/// no such task.
struct CancellationSignal<'a> {
    registration: Option<(&'a Cancellation, ListenerId)>,
    rx: Option<oneshot::Receiver<TaskCancelled>>,
}

impl<'a> CancellationSignal<'a> {
    fn new(cancellation: Option<&'a Cancellation>) -> Self {
        let Some(cancellation) = cancellation else {
            return Self {
                registration: None,
                rx: None,
            };
        };
        let (tx, rx) = oneshot::channel();
        let id = cancellation.notify_if_cancelled(Box::new(move |reason| {
            let _ = tx.send(reason);
        }));
        Self {
            registration: id.map(|id| (cancellation, id)),
            rx: Some(rx),
        }
    }

    async fn cancelled(&mut self) -> TaskCancelled {
        let Some(rx) = self.rx.as_mut() else {
            return std::future::pending().await;
        };
        let result = rx.await;
        self.rx = None;
        match result {
            Ok(reason) => reason,
            Err(_) => std::future::pending().await,
        }
    }
}

impl Drop for CancellationSignal<'_> {
    fn drop(&mut self) {
        if let Some((cancellation, id)) = self.registration.take() {
            cancellation.remove_listener(id);
        }
    }
}

/// A task that is unregistered when dropped.
struct RegisteredTask<'a> {
    registry: &'a TaskRegistry,
    task: Arc<Task>,
}

impl<'a> RegisteredTask<'a> {
    fn register(registry: &'a TaskRegistry, request: TaskRequest) -> Result<Self, RemoteError> {
        let task = registry.register(request)?;
        Ok(Self { registry, task })
    }
}

impl std::ops::Deref for RegisteredTask<'_> {
    type Target = Arc<Task>;

    fn deref(&self) -> &Arc<Task> {
        &self.task
    }
}

impl Drop for RegisteredTask<'_> {
    fn drop(&mut self) {
        self.registry.unregister(self.task.id());
    }
}
