//! TaskMesh Core Domain Types
//!
//! This crate contains pure domain types with no dependencies on:
//! - Network/transport
//! - Async runtimes
//! - Cluster membership
//!
//! Everything a node needs to describe tasks, their cancellation and the
//! cluster-wide blocks that gate leader operations lives here.

pub mod block;
pub mod cancellation;
pub mod error;
pub mod filter;
pub mod ids;
pub mod task;

// Re-export commonly used types
pub use block::{BlockLevel, ClusterBlock, ClusterBlockError};
pub use cancellation::{Cancellation, CancellationListener, ListenerId};
pub use error::{CoreError, TaskCancelled};
pub use filter::TaskFilter;
pub use ids::{NodeId, TaskId};
pub use task::{Task, TaskInfo, TaskRequest};
