//! In-process clusters for tests.

use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;

use taskmesh_core::{NodeId, Task, TaskCancelled};

use crate::action::LeaderOperation;
use crate::cluster::ClusterService;
use crate::config::Config;
use crate::node::Node;
use crate::registry::TaskRegistry;
use crate::transport::{LocalTransport, NodeHandler};

pub(crate) struct TestCluster {
    service: Arc<ClusterService>,
    transport: Arc<LocalTransport>,
    nodes: Vec<Arc<Node>>,
}

impl TestCluster {
    /// Start `count` connected nodes named `node-1`, `node-2`, ... with no
    /// leader elected.
    pub(crate) async fn start(count: usize) -> Self {
        let ids: Vec<NodeId> = (1..=count).map(|i| NodeId::new(format!("node-{i}"))).collect();
        let service = ClusterService::new(ids.clone());
        let transport = LocalTransport::new();

        let nodes = ids
            .into_iter()
            .map(|id| {
                let config = Config {
                    ban_sweep_interval_ms: 20,
                    ..Config::with_node_id(id.clone())
                };
                let node = Node::new(config, service.clone(), transport.clone());
                let handler: Arc<dyn NodeHandler> = node.clone();
                transport.connect(id, Arc::downgrade(&handler));
                node.start();
                node
            })
            .collect();

        Self {
            service,
            transport,
            nodes,
        }
    }

    pub(crate) fn node(&self, index: usize) -> &Arc<Node> {
        &self.nodes[index]
    }

    pub(crate) fn service(&self) -> &Arc<ClusterService> {
        &self.service
    }

    pub(crate) fn transport(&self) -> &Arc<LocalTransport> {
        &self.transport
    }

    pub(crate) fn elect(&self, index: usize) {
        self.service
            .elect_leader(Some(self.nodes[index].id().clone()));
    }

    pub(crate) fn register_action(&self, operation: Arc<dyn LeaderOperation>) {
        for node in &self.nodes {
            node.register_action(operation.clone());
        }
    }

    /// Remove a node from the cluster as if it had crashed.
    pub(crate) fn shutdown_node(&self, index: usize) {
        let node = &self.nodes[index];
        node.shutdown();
        self.transport.disconnect(node.id());
        self.service.remove_node(node.id());
    }

    pub(crate) fn total_bans(&self) -> usize {
        self.nodes.iter().map(|n| n.registry().ban_count()).sum()
    }

    pub(crate) fn total_tasks(&self) -> usize {
        self.nodes.iter().map(|n| n.registry().len()).sum()
    }
}

/// Poll `condition` until it holds, failing the test after five seconds.
pub(crate) async fn wait_until(condition: impl Fn() -> bool) {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    while !condition() {
        assert!(
            tokio::time::Instant::now() < deadline,
            "condition not met within 5s"
        );
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

/// Simulate work on `task` that checks for cancellation between steps and
/// unregisters itself once cancelled.
pub(crate) fn spawn_worker(
    registry: Arc<TaskRegistry>,
    task: Arc<Task>,
) -> JoinHandle<TaskCancelled> {
    tokio::spawn(async move {
        loop {
            if let Err(cancelled) = task.ensure_not_cancelled() {
                registry.unregister(task.id());
                return cancelled;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
}
