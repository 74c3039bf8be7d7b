//! Cluster-wide blocks that gate operations.

use std::fmt;

use serde::{Deserialize, Serialize};

/// What kind of access a block prevents.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum BlockLevel {
    Read,
    Write,
    MetadataRead,
    MetadataWrite,
}

impl BlockLevel {
    /// Every level, for blocks that stop all operations.
    pub const ALL: [BlockLevel; 4] = [
        BlockLevel::Read,
        BlockLevel::Write,
        BlockLevel::MetadataRead,
        BlockLevel::MetadataWrite,
    ];
}

/// A condition that prevents operations at certain levels until it clears.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClusterBlock {
    pub id: u32,
    pub description: String,
    /// Retryable blocks are expected to clear on their own, so callers wait
    /// for the next cluster state instead of failing.
    pub retryable: bool,
    pub levels: Vec<BlockLevel>,
}

impl ClusterBlock {
    pub fn new(
        id: u32,
        description: impl Into<String>,
        retryable: bool,
        levels: impl IntoIterator<Item = BlockLevel>,
    ) -> Self {
        Self {
            id,
            description: description.into(),
            retryable,
            levels: levels.into_iter().collect(),
        }
    }

    /// Present until the node has recovered cluster state after startup.
    pub fn state_not_recovered() -> Self {
        Self::new(1, "state not recovered / initialized", true, BlockLevel::ALL)
    }

    /// Present while no leader is elected.
    pub fn no_leader() -> Self {
        Self::new(
            2,
            "no leader",
            true,
            [BlockLevel::Write, BlockLevel::MetadataWrite],
        )
    }

    pub fn applies_to(&self, level: BlockLevel) -> bool {
        self.levels.contains(&level)
    }
}

impl fmt::Display for ClusterBlock {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.id, self.description)
    }
}

/// One or more blocks that prevent an operation from running.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClusterBlockError {
    pub blocks: Vec<ClusterBlock>,
}

impl ClusterBlockError {
    pub fn new(blocks: Vec<ClusterBlock>) -> Self {
        Self { blocks }
    }

    /// Retryable only if every block involved is.
    pub fn retryable(&self) -> bool {
        self.blocks.iter().all(|b| b.retryable)
    }
}

impl fmt::Display for ClusterBlockError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "blocked by: ")?;
        for block in &self.blocks {
            write!(f, "[{block}];")?;
        }
        Ok(())
    }
}

impl std::error::Error for ClusterBlockError {}
