//! Operations that must run on the leader.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use taskmesh_core::{BlockLevel, ClusterBlockError, Task};

use crate::cluster::ClusterState;
use crate::error::OperationError;

/// A request for a leader-only operation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OperationRequest {
    pub action: String,
    pub payload: Value,
    pub headers: HashMap<String, String>,
    /// Run on the receiving node even if it is not the leader.
    pub execute_locally: bool,
}

impl OperationRequest {
    pub fn new(action: impl Into<String>, payload: Value) -> Self {
        Self {
            action: action.into(),
            payload,
            headers: HashMap::new(),
            execute_locally: false,
        }
    }

    /// Builder method to add a header.
    pub fn with_header(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.insert(key.into(), value.into());
        self
    }

    /// Builder method to force local execution.
    pub fn locally(mut self) -> Self {
        self.execute_locally = true;
        self
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct OperationResponse {
    pub payload: Value,
    pub headers: HashMap<String, String>,
}

impl OperationResponse {
    pub fn new(payload: Value) -> Self {
        Self {
            payload,
            headers: HashMap::new(),
        }
    }
}

/// An operation that mutates cluster state and therefore runs on the leader.
#[async_trait]
pub trait LeaderOperation: Send + Sync {
    /// Action name the operation is registered under.
    fn action(&self) -> &str;

    /// Blocks preventing the request from running, if any.
    ///
    /// An `Err` here is treated as a bug in the check and is never retried.
    fn check_block(
        &self,
        _request: &OperationRequest,
        state: &ClusterState,
        level: BlockLevel,
    ) -> Result<Option<ClusterBlockError>, OperationError> {
        Ok(state.global_block_error(level))
    }

    /// Run the operation. `task` is the task tracking this execution; long
    /// running operations should check it for cancellation.
    async fn execute(
        &self,
        task: &Arc<Task>,
        request: &OperationRequest,
        state: &ClusterState,
    ) -> Result<OperationResponse, OperationError>;
}

/// Operations known to a node, by action name.
#[derive(Default)]
pub struct ActionRegistry {
    actions: RwLock<HashMap<String, Arc<dyn LeaderOperation>>>,
}

impl ActionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, operation: Arc<dyn LeaderOperation>) {
        let action = operation.action().to_string();
        self.actions
            .write()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .insert(action, operation);
    }

    pub fn get(&self, action: &str) -> Option<Arc<dyn LeaderOperation>> {
        self.actions
            .read()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .get(action)
            .cloned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use taskmesh_core::ClusterBlock;

    struct Echo;

    #[async_trait]
    impl LeaderOperation for Echo {
        fn action(&self) -> &str {
            "test:echo"
        }

        async fn execute(
            &self,
            _task: &Arc<Task>,
            request: &OperationRequest,
            _state: &ClusterState,
        ) -> Result<OperationResponse, OperationError> {
            Ok(OperationResponse::new(request.payload.clone()))
        }
    }

    #[test]
    fn test_registry_lookup() {
        let actions = ActionRegistry::new();
        actions.register(Arc::new(Echo));
        assert!(actions.get("test:echo").is_some());
        assert!(actions.get("test:missing").is_none());
    }

    #[test]
    fn test_default_block_check_uses_level() {
        let state = ClusterState {
            blocks: vec![ClusterBlock::no_leader()],
            ..ClusterState::default()
        };
        let request = OperationRequest::new("test:echo", json!({}));
        assert!(Echo
            .check_block(&request, &state, BlockLevel::Read)
            .unwrap()
            .is_none());
        assert!(Echo
            .check_block(&request, &state, BlockLevel::MetadataWrite)
            .unwrap()
            .is_some());
    }
}
