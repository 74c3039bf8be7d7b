//! Node configuration.

use std::time::Duration;

use taskmesh_core::NodeId;

/// Node configuration.
#[derive(Debug, Clone)]
pub struct Config {
    /// Identity of this node in the cluster.
    pub node_id: NodeId,

    /// How often bans whose coordinating node has left are swept (milliseconds).
    pub ban_sweep_interval_ms: u64,

    /// Default time to wait for a usable leader (seconds).
    pub leader_timeout_secs: u64,

    /// Whether cancellations wait for the task tree to finish by default.
    pub cancel_wait_for_completion: bool,
}

impl Config {
    /// Default configuration for the given node.
    pub fn with_node_id(node_id: NodeId) -> Self {
        Self {
            node_id,
            ..Self::default()
        }
    }

    pub fn ban_sweep_interval(&self) -> Duration {
        Duration::from_millis(self.ban_sweep_interval_ms)
    }

    pub fn leader_timeout(&self) -> Duration {
        Duration::from_secs(self.leader_timeout_secs)
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            node_id: NodeId::generate(),
            ban_sweep_interval_ms: 1_000,
            leader_timeout_secs: 30,
            cancel_wait_for_completion: false,
        }
    }
}
