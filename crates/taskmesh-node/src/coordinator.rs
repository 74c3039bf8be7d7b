//! Cross-node cancellation.
//!
//! Cancelling a task whose children may live on other nodes runs in three
//! concurrent parts:
//!
//! 1. every node in the cluster installs a ban on the task, which refuses new
//!    children and cancels the ones already running there;
//! 2. the task itself is cancelled on its owning node;
//! 3. once the task has completed and every ban was acknowledged, the bans are
//!    lifted again. Nodes that still have children running keep their ban
//!    until those finish.
//!
//! Concurrent cancels of the same task share a single run of this logic.

use std::collections::{BTreeSet, HashMap};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use futures_util::future::join_all;
use tokio::sync::oneshot;
use tracing::{debug, info, warn};

use taskmesh_core::{CoreError, NodeId, Task, TaskFilter, TaskId};

use crate::cluster::ClusterMembershipView;
use crate::error::CancelError;
use crate::registry::TaskRegistry;
use crate::transport::{
    BanRequest, CancelTaskRequest, CancelTasksRequest, CancelTasksResponse, ListTasksResponse,
    NodeFailure, Transport,
};

pub struct CancellationCoordinator {
    local_node: NodeId,
    registry: Arc<TaskRegistry>,
    cluster: Arc<dyn ClusterMembershipView>,
    transport: Arc<dyn Transport>,
    /// Cancellations currently running, with callers waiting on them.
    in_flight: Mutex<HashMap<TaskId, Vec<oneshot::Sender<()>>>>,
}

/// Wakes everyone waiting on an in-flight cancellation when dropped, including
/// when the owning future is dropped half way.
struct InFlightGuard<'a> {
    coordinator: &'a CancellationCoordinator,
    task_id: TaskId,
}

impl Drop for InFlightGuard<'_> {
    fn drop(&mut self) {
        let waiters = self.coordinator.lock_in_flight().remove(&self.task_id);
        for waiter in waiters.into_iter().flatten() {
            let _ = waiter.send(());
        }
    }
}

impl CancellationCoordinator {
    pub fn new(
        registry: Arc<TaskRegistry>,
        cluster: Arc<dyn ClusterMembershipView>,
        transport: Arc<dyn Transport>,
    ) -> Arc<Self> {
        Arc::new(Self {
            local_node: registry.local_node().clone(),
            registry,
            cluster,
            transport,
            in_flight: Mutex::new(HashMap::new()),
        })
    }

    fn lock_in_flight(&self) -> MutexGuard<'_, HashMap<TaskId, Vec<oneshot::Sender<()>>>> {
        self.in_flight.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Cancel a task wherever it lives.
    ///
    /// A task that has already finished is not an error: the response just
    /// lists no tasks.
    pub async fn cancel(
        self: &Arc<Self>,
        request: CancelTaskRequest,
    ) -> Result<CancelTasksResponse, CancelError> {
        if request.task_id.is_on(&self.local_node) {
            return self.cancel_local(request).await;
        }
        let owner = request.task_id.node().clone();
        debug!(task_id = %request.task_id, node = %owner, "forwarding cancel to owning node");
        Ok(self.transport.send_cancel(&owner, request).await?)
    }

    /// Cancel a task registered on this node.
    pub async fn cancel_local(
        self: &Arc<Self>,
        request: CancelTaskRequest,
    ) -> Result<CancelTasksResponse, CancelError> {
        let Some(task) = self.registry.get(&request.task_id) else {
            debug!(task_id = %request.task_id, "task already finished, nothing to cancel");
            return Ok(CancelTasksResponse::default());
        };

        self.cancel_task_and_descendants(
            task.clone(),
            request.reason,
            request.wait_for_completion,
        )
        .await?;

        Ok(CancelTasksResponse {
            tasks: vec![task.info()],
            node_failures: Vec::new(),
        })
    }

    /// Cancel one task by id, or every cancellable task in the cluster that
    /// matches the filter.
    pub async fn cancel_tasks(
        self: &Arc<Self>,
        request: CancelTasksRequest,
    ) -> CancelTasksResponse {
        if let Some(task_id) = request.task_id {
            let owner = task_id.node().clone();
            let single = CancelTaskRequest {
                task_id,
                reason: request.reason,
                wait_for_completion: request.wait_for_completion,
            };
            return match self.cancel(single).await {
                Ok(response) => response,
                Err(e) => CancelTasksResponse {
                    tasks: Vec::new(),
                    node_failures: vec![NodeFailure::new(owner, e)],
                },
            };
        }

        let listing = self.list_tasks(&request.filter).await;
        let targets: Vec<CancelTaskRequest> = listing
            .tasks
            .into_iter()
            .filter(|t| t.cancellable)
            .map(|t| CancelTaskRequest {
                task_id: t.id,
                reason: request.reason.clone(),
                wait_for_completion: request.wait_for_completion,
            })
            .collect();

        let mut response = CancelTasksResponse {
            tasks: Vec::new(),
            node_failures: listing.node_failures,
        };
        let results = join_all(targets.into_iter().map(|target| {
            let owner = target.task_id.node().clone();
            async move { (owner, self.cancel(target).await) }
        }))
        .await;
        for (owner, result) in results {
            match result {
                Ok(r) => {
                    response.tasks.extend(r.tasks);
                    response.node_failures.extend(r.node_failures);
                }
                Err(e) => response.node_failures.push(NodeFailure::new(owner, e)),
            }
        }
        response
    }

    /// List tasks matching `filter` on every node in the cluster.
    pub async fn list_tasks(&self, filter: &TaskFilter) -> ListTasksResponse {
        let nodes = self.cluster_nodes();
        let results = join_all(nodes.iter().map(|node| {
            let filter = filter.clone();
            async move { (node, self.transport.send_list_tasks(node, filter).await) }
        }))
        .await;

        let mut response = ListTasksResponse::default();
        for (node, result) in results {
            match result {
                Ok(tasks) => response.tasks.extend(tasks),
                Err(e) => {
                    warn!(node = %node, error = %e, "failed to list tasks");
                    response.node_failures.push(NodeFailure::new(node.clone(), e));
                }
            }
        }
        response.tasks.sort_by(|a, b| a.id.cmp(&b.id));
        response
    }

    /// Cancel a local task and, if its policy says so, its descendants on
    /// every node.
    ///
    /// With `wait_for_completion` this resolves once the task and all of its
    /// descendants have finished. Otherwise it resolves once every node has
    /// acknowledged the ban and lifting continues in the background.
    pub async fn cancel_task_and_descendants(
        self: &Arc<Self>,
        task: Arc<Task>,
        reason: String,
        wait_for_completion: bool,
    ) -> Result<(), CancelError> {
        if !task.is_cancellable() {
            return Err(CoreError::NotCancellable(task.id().clone()).into());
        }

        let Some(_guard) = self.enter_in_flight(task.id()).await else {
            // Joined a cancellation that may not have waited for the task.
            if wait_for_completion {
                let _ = self.cancel_in_registry(&task, &reason).await;
            }
            return Ok(());
        };

        // An already cancelled task still bans: it may have been cancelled
        // locally without reaching its children.
        if !task.should_cancel_children_on_cancellation() {
            let completed = self.cancel_in_registry(&task, &reason);
            if wait_for_completion {
                let _ = completed.await;
            }
            return Ok(());
        }

        self.cancel_with_bans(&task, reason, wait_for_completion).await;
        Ok(())
    }

    /// Returns a guard if the caller should run the cancellation, or waits
    /// for the one already running and returns `None`.
    async fn enter_in_flight(&self, task_id: &TaskId) -> Option<InFlightGuard<'_>> {
        let waiter = {
            let mut in_flight = self.lock_in_flight();
            match in_flight.get_mut(task_id) {
                Some(waiters) => {
                    let (tx, rx) = oneshot::channel();
                    waiters.push(tx);
                    Some(rx)
                }
                None => {
                    in_flight.insert(task_id.clone(), Vec::new());
                    None
                }
            }
        };

        match waiter {
            Some(rx) => {
                debug!(task_id = %task_id, "joining in-flight cancellation");
                let _ = rx.await;
                None
            }
            None => Some(InFlightGuard {
                coordinator: self,
                task_id: task_id.clone(),
            }),
        }
    }

    /// Cancel the task in the local registry. The receiver resolves once the
    /// task has been unregistered.
    fn cancel_in_registry(&self, task: &Arc<Task>, reason: &str) -> oneshot::Receiver<()> {
        let (tx, rx) = oneshot::channel();
        if let Err(e) = self.registry.cancel(task, reason, move || {
            let _ = tx.send(());
        }) {
            warn!(task_id = %task.id(), error = %e, "failed to cancel task");
        }
        rx
    }

    async fn cancel_with_bans(
        self: &Arc<Self>,
        task: &Arc<Task>,
        reason: String,
        wait_for_completion: bool,
    ) {
        let parent = task.id().clone();
        let nodes = self.cluster_nodes();
        info!(
            task_id = %parent,
            nodes = nodes.len(),
            reason = %reason,
            "cancelling task and its descendants"
        );

        let install = BanRequest::Install {
            parent: parent.clone(),
            reason: reason.clone(),
            coordinator: self.local_node.clone(),
            wait_for_completion,
        };
        let bans_set = self.broadcast_ban(&nodes, install);
        let completed = self.cancel_in_registry(task, &reason);
        bans_set.await;
        debug!(task_id = %parent, "bans acknowledged by all nodes");

        let lift = BanRequest::Lift { parent };
        if wait_for_completion {
            let _ = completed.await;
            self.broadcast_ban(&nodes, lift).await;
        } else {
            let coordinator = self.clone();
            tokio::spawn(async move {
                let _ = completed.await;
                coordinator.broadcast_ban(&nodes, lift).await;
            });
        }
    }

    /// Send a ban request to every node and wait for all of them to answer.
    /// Failures are logged; a node that is gone has no children to ban.
    async fn broadcast_ban(&self, nodes: &BTreeSet<NodeId>, request: BanRequest) {
        let results = join_all(nodes.iter().map(|node| {
            let request = request.clone();
            async move { (node, self.transport.send_ban(node, request).await) }
        }))
        .await;

        for (node, result) in results {
            if let Err(e) = result {
                warn!(
                    node = %node,
                    parent = %request.parent(),
                    error = %e,
                    "failed to send ban request"
                );
            }
        }
    }

    /// Handle a ban request from a coordinating node.
    pub async fn handle_ban(self: &Arc<Self>, request: BanRequest) {
        match request {
            BanRequest::Install {
                parent,
                reason,
                coordinator,
                wait_for_completion,
            } => {
                let (tx, children_completed) = oneshot::channel();
                let children =
                    self.registry
                        .start_ban_on_child_tasks(&parent, &reason, &coordinator, move || {
                            let _ = tx.send(());
                        });

                let cancels = children
                    .into_iter()
                    .filter(|child| child.is_cancellable())
                    .map(|child| {
                        self.cancel_task_and_descendants(child, reason.clone(), wait_for_completion)
                    });
                for result in join_all(cancels).await {
                    if let Err(e) = result {
                        warn!(parent = %parent, error = %e, "failed to cancel child task");
                    }
                }

                if wait_for_completion {
                    let _ = children_completed.await;
                }
            }
            BanRequest::Lift { parent } => {
                self.registry.remove_ban(&parent);
            }
        }
    }

    fn cluster_nodes(&self) -> BTreeSet<NodeId> {
        let mut nodes = self.cluster.nodes();
        nodes.insert(self.local_node.clone());
        nodes
    }
}
