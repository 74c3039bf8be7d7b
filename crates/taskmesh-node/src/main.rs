//! TaskMesh simulated cluster.
//!
//! Runs an in-process cluster, delegates a settings update across a leader
//! election and cancels a task tree spread over every node.

use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use clap::Parser;
use serde_json::{json, Map, Value};
use tokio::task::JoinHandle;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use taskmesh_core::{BlockLevel, ClusterBlock, NodeId, Task, TaskFilter, TaskRequest};
use taskmesh_node::metrics::collect_metrics;
use taskmesh_node::transport::CancelTasksRequest;
use taskmesh_node::{
    ClusterService, ClusterState, Config, LeaderOperation, LocalTransport, Node, NodeHandler,
    OperationError, OperationRequest, OperationResponse, TaskRegistry,
};

const SETTINGS_ACTION: &str = "cluster:admin/settings/update";

/// TaskMesh cluster simulation.
#[derive(Parser, Debug)]
#[command(name = "taskmesh-node", about = "Run a simulated TaskMesh cluster")]
struct Args {
    /// Number of nodes in the cluster
    #[arg(long, default_value = "3")]
    nodes: usize,

    /// Child tasks started on each node under the cancelled parent
    #[arg(long, default_value = "2")]
    children: usize,

    /// Timeout for the delegated operation in milliseconds
    #[arg(long, default_value = "5000")]
    timeout_ms: u64,

    /// Log level used when RUST_LOG is not set
    #[arg(long, default_value = "info")]
    log_level: String,
}

/// Merges the request payload into the cluster settings held by the leader.
#[derive(Default)]
struct UpdateSettings {
    settings: Mutex<Map<String, Value>>,
}

#[async_trait]
impl LeaderOperation for UpdateSettings {
    fn action(&self) -> &str {
        SETTINGS_ACTION
    }

    async fn execute(
        &self,
        task: &Arc<Task>,
        request: &OperationRequest,
        state: &ClusterState,
    ) -> Result<OperationResponse, OperationError> {
        task.ensure_not_cancelled()
            .map_err(|e| OperationError::new(e.to_string()))?;
        let Value::Object(update) = &request.payload else {
            return Err(OperationError::new("settings update must be an object")
                .with_header("action", SETTINGS_ACTION));
        };

        let mut settings = self.settings.lock().unwrap_or_else(PoisonError::into_inner);
        for (key, value) in update {
            settings.insert(key.clone(), value.clone());
        }
        Ok(OperationResponse::new(json!({
            "applied_by": task.id().node().as_str(),
            "cluster_version": state.version,
            "settings": Value::Object(settings.clone()),
        })))
    }
}

/// Simulated work that stops once its task is cancelled.
fn spawn_worker(registry: Arc<TaskRegistry>, task: Arc<Task>) -> JoinHandle<()> {
    tokio::spawn(async move {
        while task.ensure_not_cancelled().is_ok() {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        registry.unregister(task.id());
    })
}

fn print_json(label: &str, value: &impl serde::Serialize) -> Result<(), serde_json::Error> {
    println!("== {label}");
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();

    // Initialize tracing
    let filter =
        EnvFilter::try_from_default_env().or_else(|_| EnvFilter::try_new(&args.log_level))?;
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .init();

    let count = args.nodes.max(1);
    let ids: Vec<NodeId> = (1..=count)
        .map(|i| NodeId::new(format!("node-{i}")))
        .collect();
    info!(nodes = count, "Starting TaskMesh simulation");

    let cluster = ClusterService::new(ids.clone());
    cluster.add_block(ClusterBlock::no_leader());
    let transport = LocalTransport::new();

    let nodes: Vec<Arc<Node>> = ids
        .iter()
        .map(|id| {
            let node = Node::new(
                Config::with_node_id(id.clone()),
                cluster.clone(),
                transport.clone(),
            );
            let handler: Arc<dyn NodeHandler> = node.clone();
            transport.connect(id.clone(), Arc::downgrade(&handler));
            node.register_action(Arc::new(UpdateSettings::default()));
            node.start();
            node
        })
        .collect();
    let first = &nodes[0];
    let last = &nodes[count - 1];

    // Delegation started before any leader exists.
    let delegation = {
        let node = last.clone();
        let timeout = Duration::from_millis(args.timeout_ms);
        tokio::spawn(async move {
            let request = OperationRequest::new(
                SETTINGS_ACTION,
                json!({"cluster.routing.allocation.enable": "primaries"}),
            );
            node.executor()
                .run(request, BlockLevel::MetadataWrite, timeout, None)
                .await
        })
    };
    tokio::time::sleep(Duration::from_millis(100)).await;
    info!(leader = %first.id(), "Electing leader");
    cluster.elect_leader(Some(first.id().clone()));
    cluster.remove_block(ClusterBlock::no_leader().id);

    match delegation.await? {
        Ok(response) => print_json("delegated settings update", &response.payload)?,
        Err(e) => warn!(error = %e, "Delegated settings update failed"),
    }

    // A task tree with children on every node.
    let parent = first.registry().register(
        TaskRequest::new("transport", "indices:data/read/search")
            .with_description("search across all shards")
            .cancellable(true),
    )?;
    let mut workers = vec![spawn_worker(first.registry().clone(), parent.clone())];
    for node in &nodes {
        for shard in 0..args.children {
            let child = node.registry().register(
                TaskRequest::new("transport", "indices:data/read/search[phase/query]")
                    .with_description(format!("shard [{shard}]"))
                    .with_parent(parent.id().clone())
                    .cancellable(false),
            )?;
            workers.push(spawn_worker(node.registry().clone(), child));
        }
    }

    let tree = TaskFilter::all().with_action("indices:data/read/search*");
    print_json("tasks before cancellation", &last.list_tasks(&tree).await)?;

    let response = last
        .cancel_tasks(CancelTasksRequest {
            task_id: Some(parent.id().clone()),
            filter: TaskFilter::all(),
            reason: "user requested".to_string(),
            wait_for_completion: true,
        })
        .await;
    print_json("cancel response", &response)?;

    for worker in workers {
        worker.await?;
    }
    print_json("tasks after cancellation", &last.list_tasks(&tree).await)?;

    for node in &nodes {
        println!("== metrics {}", node.id());
        print!("{}", collect_metrics(node.registry()));
    }

    for node in &nodes {
        node.shutdown();
    }
    info!("TaskMesh simulation finished");
    Ok(())
}
