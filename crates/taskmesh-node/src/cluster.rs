//! Read-only views of cluster membership, leadership and blocks.
//!
//! Leader election and membership are provided from outside; this crate only
//! observes them. [`ClusterService`] is an in-memory provider used by the
//! simulation binary and tests.

use std::collections::BTreeSet;
use std::sync::Arc;

use tokio::sync::watch;
use tracing::debug;

use taskmesh_core::{BlockLevel, ClusterBlock, ClusterBlockError, NodeId};

/// Immutable snapshot of the cluster.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ClusterState {
    /// Bumped on every change.
    pub version: u64,
    pub leader: Option<NodeId>,
    pub nodes: BTreeSet<NodeId>,
    pub blocks: Vec<ClusterBlock>,
}

impl ClusterState {
    pub fn leader(&self) -> Option<&NodeId> {
        self.leader.as_ref()
    }

    pub fn is_leader(&self, node: &NodeId) -> bool {
        self.leader.as_ref() == Some(node)
    }

    pub fn contains_node(&self, node: &NodeId) -> bool {
        self.nodes.contains(node)
    }

    /// The error an operation at `level` would hit, if any block applies.
    pub fn global_block_error(&self, level: BlockLevel) -> Option<ClusterBlockError> {
        let blocks = self.blocks_for(level);
        (!blocks.is_empty()).then(|| ClusterBlockError::new(blocks))
    }
}

/// Access to the current cluster-wide blocks.
pub trait ClusterBlockView {
    fn blocks_for(&self, level: BlockLevel) -> Vec<ClusterBlock>;
}

impl ClusterBlockView for ClusterState {
    fn blocks_for(&self, level: BlockLevel) -> Vec<ClusterBlock> {
        self.blocks
            .iter()
            .filter(|b| b.applies_to(level))
            .cloned()
            .collect()
    }
}

/// Observes cluster membership and leadership.
///
/// Subscribers get a `watch` receiver; dropping it unsubscribes.
pub trait ClusterMembershipView: Send + Sync {
    fn state(&self) -> Arc<ClusterState>;

    fn subscribe(&self) -> watch::Receiver<Arc<ClusterState>>;

    fn current_leader(&self) -> Option<NodeId> {
        self.state().leader.clone()
    }

    fn nodes(&self) -> BTreeSet<NodeId> {
        self.state().nodes.clone()
    }
}

/// In-memory cluster state holder.
pub struct ClusterService {
    tx: watch::Sender<Arc<ClusterState>>,
}

impl ClusterService {
    /// Create a cluster containing `nodes`, with no leader.
    pub fn new(nodes: impl IntoIterator<Item = NodeId>) -> Arc<Self> {
        let state = ClusterState {
            version: 1,
            nodes: nodes.into_iter().collect(),
            ..ClusterState::default()
        };
        let (tx, _rx) = watch::channel(Arc::new(state));
        Arc::new(Self { tx })
    }

    /// Apply a change and publish the new state.
    pub fn update(&self, change: impl FnOnce(&mut ClusterState)) -> Arc<ClusterState> {
        self.tx.send_modify(|current| {
            let mut next = ClusterState::clone(&**current);
            change(&mut next);
            next.version = current.version + 1;
            *current = Arc::new(next);
        });
        let state = self.tx.borrow().clone();
        debug!(
            version = state.version,
            leader = ?state.leader,
            nodes = state.nodes.len(),
            blocks = state.blocks.len(),
            "published cluster state"
        );
        state
    }

    pub fn add_node(&self, node: NodeId) -> Arc<ClusterState> {
        self.update(|state| {
            state.nodes.insert(node);
        })
    }

    /// Remove a node. A departing leader leaves the cluster leaderless.
    pub fn remove_node(&self, node: &NodeId) -> Arc<ClusterState> {
        self.update(|state| {
            state.nodes.remove(node);
            if state.leader.as_ref() == Some(node) {
                state.leader = None;
            }
        })
    }

    pub fn elect_leader(&self, leader: Option<NodeId>) -> Arc<ClusterState> {
        self.update(|state| state.leader = leader)
    }

    pub fn add_block(&self, block: ClusterBlock) -> Arc<ClusterState> {
        self.update(|state| {
            state.blocks.retain(|b| b.id != block.id);
            state.blocks.push(block);
        })
    }

    pub fn remove_block(&self, id: u32) -> Arc<ClusterState> {
        self.update(|state| state.blocks.retain(|b| b.id != id))
    }
}

impl ClusterMembershipView for ClusterService {
    fn state(&self) -> Arc<ClusterState> {
        self.tx.borrow().clone()
    }

    fn subscribe(&self) -> watch::Receiver<Arc<ClusterState>> {
        self.tx.subscribe()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn node(name: &str) -> NodeId {
        NodeId::new(name)
    }

    #[test]
    fn test_updates_bump_version() {
        let cluster = ClusterService::new([node("a"), node("b")]);
        let v1 = cluster.state().version;
        let state = cluster.elect_leader(Some(node("a")));
        assert_eq!(state.version, v1 + 1);
        assert!(state.is_leader(&node("a")));
        assert_eq!(cluster.current_leader(), Some(node("a")));
    }

    #[test]
    fn test_removing_leader_clears_it() {
        let cluster = ClusterService::new([node("a"), node("b")]);
        cluster.elect_leader(Some(node("a")));
        let state = cluster.remove_node(&node("a"));
        assert!(state.leader().is_none());
        assert_eq!(cluster.nodes().len(), 1);
    }

    #[test]
    fn test_block_lookup_by_level() {
        let cluster = ClusterService::new([node("a")]);
        cluster.add_block(ClusterBlock::no_leader());
        let state = cluster.state();
        assert!(state.global_block_error(BlockLevel::Read).is_none());
        let err = state.global_block_error(BlockLevel::MetadataWrite).unwrap();
        assert!(err.retryable());

        cluster.remove_block(ClusterBlock::no_leader().id);
        assert!(cluster
            .state()
            .global_block_error(BlockLevel::MetadataWrite)
            .is_none());
    }

    #[tokio::test]
    async fn test_subscribers_see_changes() {
        let cluster = ClusterService::new([node("a")]);
        let mut rx = cluster.subscribe();
        cluster.add_node(node("b"));
        rx.changed().await.unwrap();
        assert!(rx.borrow_and_update().contains_node(&node("b")));
    }
}
