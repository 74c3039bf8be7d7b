//! Task listing filters.

use serde::{Deserialize, Serialize};

use crate::{Task, TaskId};

/// Selects tasks for listing or cancellation.
///
/// An empty filter matches every task. Action patterns may contain `*`
/// wildcards; a task matches if any pattern matches its action.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskFilter {
    pub actions: Vec<String>,
    pub parent: Option<TaskId>,
    pub task_id: Option<TaskId>,
}

impl TaskFilter {
    /// Filter that matches all tasks.
    pub fn all() -> Self {
        Self::default()
    }

    pub fn with_action(mut self, pattern: impl Into<String>) -> Self {
        self.actions.push(pattern.into());
        self
    }

    pub fn with_parent(mut self, parent: TaskId) -> Self {
        self.parent = Some(parent);
        self
    }

    pub fn with_task_id(mut self, id: TaskId) -> Self {
        self.task_id = Some(id);
        self
    }

    pub fn matches(&self, task: &Task) -> bool {
        if let Some(id) = &self.task_id {
            if task.id() != id {
                return false;
            }
        }
        if let Some(parent) = &self.parent {
            if !task.has_parent(parent) {
                return false;
            }
        }
        self.actions.is_empty()
            || self
                .actions
                .iter()
                .any(|pattern| simple_match(pattern, task.action()))
    }
}

/// Glob match supporting only `*`, which matches any run of characters.
pub fn simple_match(pattern: &str, value: &str) -> bool {
    let Some(first_star) = pattern.find('*') else {
        return pattern == value;
    };

    let (prefix, rest) = pattern.split_at(first_star);
    let Some(mut remaining) = value.strip_prefix(prefix) else {
        return false;
    };

    let mut parts = rest.split('*').skip(1).peekable();
    while let Some(part) = parts.next() {
        if parts.peek().is_none() {
            // Last segment must anchor at the end.
            return remaining.ends_with(part);
        }
        if part.is_empty() {
            continue;
        }
        match remaining.find(part) {
            Some(pos) => remaining = &remaining[pos + part.len()..],
            None => return false,
        }
    }
    true
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{NodeId, TaskRequest};

    #[test]
    fn test_simple_match() {
        assert!(simple_match("cluster:admin/*", "cluster:admin/settings"));
        assert!(simple_match("*", "anything"));
        assert!(simple_match("*/read", "indices:data/read"));
        assert!(simple_match("a*c*e", "abcde"));
        assert!(simple_match("exact", "exact"));
        assert!(!simple_match("exact", "exactly"));
        assert!(!simple_match("a*c*e", "abcdef"));
        assert!(!simple_match("cluster:*", "indices:data"));
    }

    #[test]
    fn test_filter_matches() {
        let node = NodeId::new("n1");
        let parent = TaskId::new(node.clone(), 1);
        let task = Task::new(
            TaskId::new(node.clone(), 2),
            TaskRequest::new("transport", "cluster:admin/reroute").with_parent(parent.clone()),
        );

        assert!(TaskFilter::all().matches(&task));
        assert!(TaskFilter::all().with_parent(parent.clone()).matches(&task));
        assert!(TaskFilter::all().with_action("cluster:*").matches(&task));
        assert!(!TaskFilter::all().with_action("indices:*").matches(&task));
        assert!(!TaskFilter::all()
            .with_parent(TaskId::new(node.clone(), 9))
            .matches(&task));
        assert!(!TaskFilter::all()
            .with_task_id(TaskId::new(node, 1))
            .matches(&task));
    }
}
