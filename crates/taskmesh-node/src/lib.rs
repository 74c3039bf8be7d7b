//! TaskMesh Node Library
//!
//! Per-node runtime for tracking and cancelling tasks across a cluster and
//! for delegating leader-only operations to the elected leader.

pub mod action;
pub mod ban;
pub mod cluster;
pub mod config;
pub mod coordinator;
pub mod error;
pub mod executor;
pub mod metrics;
pub mod node;
pub mod registry;
pub mod transport;

#[cfg(test)]
pub(crate) mod testing;

pub use action::{ActionRegistry, LeaderOperation, OperationRequest, OperationResponse};
pub use cluster::{ClusterBlockView, ClusterMembershipView, ClusterService, ClusterState};
pub use config::Config;
pub use coordinator::CancellationCoordinator;
pub use error::{CancelError, DelegationError, OperationError, RemoteError, TransportError};
pub use executor::LeaderDelegationExecutor;
pub use metrics::collect_metrics;
pub use node::Node;
pub use registry::TaskRegistry;
pub use transport::{
    BanRequest, CancelTaskRequest, CancelTasksRequest, CancelTasksResponse, DelegatedRequest,
    ListTasksResponse, LocalTransport, NodeFailure, NodeHandler, Transport,
};
