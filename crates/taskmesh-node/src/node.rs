//! Wiring of one node's components.

use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info};

use taskmesh_core::{BlockLevel, NodeId, TaskFilter, TaskId, TaskInfo};

use crate::action::{ActionRegistry, LeaderOperation, OperationRequest, OperationResponse};
use crate::cluster::ClusterMembershipView;
use crate::config::Config;
use crate::coordinator::CancellationCoordinator;
use crate::error::{CancelError, DelegationError, RemoteError};
use crate::executor::LeaderDelegationExecutor;
use crate::registry::TaskRegistry;
use crate::transport::{
    BanRequest, CancelTaskRequest, CancelTasksRequest, CancelTasksResponse, DelegatedRequest,
    ListTasksResponse, NodeHandler, Transport,
};

/// A cluster node: task registry, cancellation coordinator and leader
/// delegation executor sharing one cluster view and transport.
///
/// Built at startup and torn down with [`shutdown`](Self::shutdown) or on drop.
pub struct Node {
    config: Config,
    registry: Arc<TaskRegistry>,
    cluster: Arc<dyn ClusterMembershipView>,
    actions: Arc<ActionRegistry>,
    coordinator: Arc<CancellationCoordinator>,
    executor: LeaderDelegationExecutor,
    ban_sweeper: Mutex<Option<JoinHandle<()>>>,
}

impl Node {
    pub fn new(
        config: Config,
        cluster: Arc<dyn ClusterMembershipView>,
        transport: Arc<dyn Transport>,
    ) -> Arc<Self> {
        let registry = Arc::new(TaskRegistry::new(config.node_id.clone()));
        let actions = Arc::new(ActionRegistry::new());
        let coordinator =
            CancellationCoordinator::new(registry.clone(), cluster.clone(), transport.clone());
        let executor = LeaderDelegationExecutor::new(
            registry.clone(),
            cluster.clone(),
            transport,
            actions.clone(),
        );

        Arc::new(Self {
            config,
            registry,
            cluster,
            actions,
            coordinator,
            executor,
            ban_sweeper: Mutex::new(None),
        })
    }

    pub fn id(&self) -> &NodeId {
        &self.config.node_id
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn registry(&self) -> &Arc<TaskRegistry> {
        &self.registry
    }

    pub fn coordinator(&self) -> &Arc<CancellationCoordinator> {
        &self.coordinator
    }

    pub fn executor(&self) -> &LeaderDelegationExecutor {
        &self.executor
    }

    pub fn register_action(&self, operation: Arc<dyn LeaderOperation>) {
        debug!(node = %self.id(), action = %operation.action(), "registered action");
        self.actions.register(operation);
    }

    /// Start background work. Must be called from within a tokio runtime.
    pub fn start(&self) {
        let mut sweeper = self
            .ban_sweeper
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        if sweeper.is_some() {
            return;
        }
        *sweeper = Some(tokio::spawn(run_ban_sweeper(
            self.registry.clone(),
            self.cluster.clone(),
            self.config.ban_sweep_interval(),
        )));
        info!(node = %self.id(), "node started");
    }

    /// Stop background work. In-flight requests are not interrupted.
    pub fn shutdown(&self) {
        let sweeper = self
            .ban_sweeper
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(handle) = sweeper {
            handle.abort();
            info!(node = %self.id(), "node stopped");
        }
    }

    /// Run a leader-only operation with the configured leader timeout.
    pub async fn execute(
        &self,
        request: OperationRequest,
        level: BlockLevel,
        originating_task: Option<&TaskId>,
    ) -> Result<OperationResponse, DelegationError> {
        self.executor
            .run(request, level, self.config.leader_timeout(), originating_task)
            .await
    }

    /// Cancel a task anywhere in the cluster, waiting for completion if the
    /// node is configured to.
    pub async fn cancel_task(
        &self,
        task_id: TaskId,
        reason: impl Into<String>,
    ) -> Result<CancelTasksResponse, CancelError> {
        let request = CancelTaskRequest::new(task_id, reason)
            .wait_for_completion(self.config.cancel_wait_for_completion);
        self.coordinator.cancel(request).await
    }

    pub async fn cancel_tasks(&self, request: CancelTasksRequest) -> CancelTasksResponse {
        self.coordinator.cancel_tasks(request).await
    }

    pub async fn list_tasks(&self, filter: &TaskFilter) -> ListTasksResponse {
        self.coordinator.list_tasks(filter).await
    }
}

impl Drop for Node {
    fn drop(&mut self) {
        self.shutdown();
    }
}

#[async_trait]
impl NodeHandler for Node {
    async fn handle_operation(
        &self,
        request: DelegatedRequest,
    ) -> Result<OperationResponse, RemoteError> {
        self.executor.handle_delegated(request).await
    }

    async fn handle_cancel(
        &self,
        request: CancelTaskRequest,
    ) -> Result<CancelTasksResponse, RemoteError> {
        Ok(self.coordinator.cancel_local(request).await?)
    }

    async fn handle_ban(&self, request: BanRequest) -> Result<(), RemoteError> {
        self.coordinator.handle_ban(request).await;
        Ok(())
    }

    async fn handle_list_tasks(&self, filter: TaskFilter) -> Result<Vec<TaskInfo>, RemoteError> {
        Ok(self.registry.task_infos(&filter))
    }
}

/// Drop bans whose coordinating node has left the cluster, on every
/// membership change and at least once per `period`.
async fn run_ban_sweeper(
    registry: Arc<TaskRegistry>,
    cluster: Arc<dyn ClusterMembershipView>,
    period: Duration,
) {
    let mut changes = cluster.subscribe();
    let mut ticker = tokio::time::interval(period.max(Duration::from_millis(1)));
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

    loop {
        tokio::select! {
            changed = changes.changed() => {
                if changed.is_err() {
                    debug!(
                        node = %registry.local_node(),
                        "cluster view closed, stopping ban sweeper"
                    );
                    break;
                }
            }
            _ = ticker.tick() => {}
        }

        let state = changes.borrow_and_update().clone();
        let removed = registry.remove_orphaned_bans(&state.nodes);
        if removed > 0 {
            debug!(
                node = %registry.local_node(),
                removed,
                version = state.version,
                "swept orphaned bans"
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cluster::ClusterService;
    use crate::metrics::collect_metrics;
    use crate::testing::{wait_until, TestCluster};
    use crate::transport::LocalTransport;
    use taskmesh_core::TaskRequest;

    #[tokio::test]
    async fn test_sweeper_removes_orphaned_ban_on_membership_change() {
        let cluster = TestCluster::start(2).await;
        let n2 = cluster.node(1);
        let gone = NodeId::new("node-1");
        n2.registry().start_ban_on_child_tasks(
            &TaskId::new(gone.clone(), 7),
            "coordinator left",
            &gone,
            || {},
        );
        assert_eq!(n2.registry().ban_count(), 1);

        cluster.shutdown_node(0);
        wait_until(|| n2.registry().ban_count() == 0).await;
    }

    #[tokio::test]
    async fn test_sweeper_removes_ban_from_unknown_node_on_tick() {
        let cluster = TestCluster::start(1).await;
        let n1 = cluster.node(0);
        // Coordinator never was a member; only the periodic sweep catches it.
        let stranger = NodeId::new("stranger");
        n1.registry().start_ban_on_child_tasks(
            &TaskId::new(stranger.clone(), 1),
            "stray",
            &stranger,
            || {},
        );
        wait_until(|| n1.registry().ban_count() == 0).await;
    }

    #[tokio::test]
    async fn test_cancel_task_uses_configured_wait() {
        let service = ClusterService::new([NodeId::new("node-1")]);
        let transport = LocalTransport::new();
        let config = Config {
            cancel_wait_for_completion: true,
            ..Config::with_node_id(NodeId::new("node-1"))
        };
        let node = Node::new(config, service, transport.clone());
        let handler: Arc<dyn NodeHandler> = node.clone();
        transport.connect(node.id().clone(), Arc::downgrade(&handler));

        let task = node
            .registry()
            .register(TaskRequest::new("transport", "a").cancellable(false))
            .unwrap();
        let registry = node.registry().clone();
        let id = task.id().clone();
        let finisher = tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            registry.unregister(&id);
        });

        let response = node.cancel_task(task.id().clone(), "done").await.unwrap();
        assert_eq!(response.tasks.len(), 1);
        // Returned only after the task was gone.
        assert!(node.registry().get(task.id()).is_none());
        finisher.await.unwrap();
    }

    #[tokio::test]
    async fn test_list_tasks_spans_cluster() {
        let cluster = TestCluster::start(3).await;
        for i in 0..3 {
            cluster
                .node(i)
                .registry()
                .register(TaskRequest::new("transport", "indices:data/read/search"))
                .unwrap();
        }
        let listing = cluster.node(0).list_tasks(&TaskFilter::all()).await;
        assert_eq!(listing.tasks.len(), 3);
        assert!(listing.node_failures.is_empty());

        cluster.transport().disconnect(&NodeId::new("node-3"));
        let listing = cluster.node(0).list_tasks(&TaskFilter::all()).await;
        assert_eq!(listing.tasks.len(), 2);
        assert_eq!(listing.node_failures.len(), 1);
        assert_eq!(listing.node_failures[0].node, NodeId::new("node-3"));
    }

    #[tokio::test]
    async fn test_metrics_reflect_node_state() {
        let cluster = TestCluster::start(1).await;
        let node = cluster.node(0);
        node.registry()
            .register(TaskRequest::new("transport", "a"))
            .unwrap();
        let output = collect_metrics(node.registry());
        assert!(output.contains("taskmesh_tasks{state=\"running\"} 1"));
    }
}
