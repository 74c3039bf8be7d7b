//! Per-node task registry.
//!
//! Allocates task ids, tracks live tasks and owns the node's ban table.
//! Registering or unregistering a task that has a parent takes the ban lock so
//! that a ban installation either sees the child (and counts it) or the child
//! sees the ban (and is refused). Tasks without a parent never touch it.

use std::collections::BTreeSet;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use dashmap::DashMap;
use tracing::{debug, info};

use taskmesh_core::{CoreError, NodeId, Task, TaskFilter, TaskId, TaskInfo, TaskRequest};

use crate::ban::{BanTable, ChildrenCompleted, LiftOutcome};

type CompletionListener = Box<dyn FnOnce() + Send>;

struct TaskEntry {
    task: Arc<Task>,
    on_completion: Mutex<Vec<CompletionListener>>,
}

/// Registry of the tasks running on one node.
///
/// Constructed once per node and shared by reference; nothing here is global.
pub struct TaskRegistry {
    local_node: NodeId,
    next_id: AtomicU64,
    tasks: DashMap<TaskId, TaskEntry>,
    bans: Mutex<BanTable>,
}

impl TaskRegistry {
    /// Create an empty registry for `local_node`.
    pub fn new(local_node: NodeId) -> Self {
        Self {
            local_node,
            next_id: AtomicU64::new(1),
            tasks: DashMap::new(),
            bans: Mutex::new(BanTable::new()),
        }
    }

    pub fn local_node(&self) -> &NodeId {
        &self.local_node
    }

    fn lock_bans(&self) -> MutexGuard<'_, BanTable> {
        self.bans.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Register a new task.
    ///
    /// Fails with [`CoreError::ParentCancelled`] without registering anything
    /// if the parent is banned on this node.
    pub fn register(&self, request: TaskRequest) -> Result<Arc<Task>, CoreError> {
        let id = TaskId::new(
            self.local_node.clone(),
            self.next_id.fetch_add(1, Ordering::Relaxed),
        );

        match request.parent.clone() {
            Some(parent) => {
                let bans = self.lock_bans();
                if let Some(reason) = bans.reason(&parent) {
                    debug!(
                        parent = %parent,
                        action = %request.action,
                        "refusing child of banned parent"
                    );
                    return Err(CoreError::ParentCancelled {
                        parent,
                        reason: reason.to_string(),
                    });
                }
                Ok(self.insert(id, request))
            }
            None => Ok(self.insert(id, request)),
        }
    }

    fn insert(&self, id: TaskId, request: TaskRequest) -> Arc<Task> {
        let task = Arc::new(Task::new(id.clone(), request));
        debug!(task_id = %id, action = %task.action(), "registered task");
        self.tasks.insert(
            id,
            TaskEntry {
                task: task.clone(),
                on_completion: Mutex::new(Vec::new()),
            },
        );
        task
    }

    /// Remove a task once its work is done. Idempotent.
    ///
    /// Runs any listeners waiting for the task to complete and, if the task
    /// was a child of a banned parent, counts it against that ban.
    pub fn unregister(&self, id: &TaskId) -> Option<Arc<Task>> {
        let parent = self.tasks.get(id)?.task.parent().cloned();

        let (entry, due) = match parent {
            Some(parent) => {
                let mut bans = self.lock_bans();
                match self.tasks.remove(id) {
                    Some((_, entry)) => {
                        let due = bans.child_completed(&parent);
                        (entry, due)
                    }
                    None => return None,
                }
            }
            None => {
                let (_, entry) = self.tasks.remove(id)?;
                (entry, Vec::new())
            }
        };

        debug!(task_id = %id, "unregistered task");
        let listeners = entry
            .on_completion
            .into_inner()
            .unwrap_or_else(PoisonError::into_inner);
        for listener in listeners {
            listener();
        }
        for callback in due {
            callback();
        }
        Some(entry.task)
    }

    pub fn get(&self, id: &TaskId) -> Option<Arc<Task>> {
        self.tasks.get(id).map(|entry| entry.task.clone())
    }

    /// Snapshot of the tasks matching `filter`, ordered by id.
    pub fn list(&self, filter: &TaskFilter) -> Vec<Arc<Task>> {
        let mut tasks: Vec<Arc<Task>> = self
            .tasks
            .iter()
            .filter(|entry| filter.matches(&entry.task))
            .map(|entry| entry.task.clone())
            .collect();
        tasks.sort_by(|a, b| a.id().cmp(b.id()));
        tasks
    }

    /// Like [`list`](Self::list) but returns serialisable snapshots.
    pub fn task_infos(&self, filter: &TaskFilter) -> Vec<TaskInfo> {
        self.list(filter).iter().map(|task| task.info()).collect()
    }

    pub fn len(&self) -> usize {
        self.tasks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }

    /// Cancel a local task.
    ///
    /// `on_completed` runs once the task has been unregistered, or right away
    /// if it already has been. It runs for every caller, even when the task
    /// was already cancelled. Returns whether this call cancelled the task.
    pub fn cancel(
        &self,
        task: &Arc<Task>,
        reason: &str,
        on_completed: impl FnOnce() + Send + 'static,
    ) -> Result<bool, CoreError> {
        let cancellation = task
            .cancellation()
            .ok_or_else(|| CoreError::NotCancellable(task.id().clone()))?;

        let finished = match self.tasks.get(task.id()) {
            Some(entry) => {
                entry
                    .on_completion
                    .lock()
                    .unwrap_or_else(PoisonError::into_inner)
                    .push(Box::new(on_completed));
                None
            }
            None => Some(on_completed),
        };

        let cancelled = cancellation.cancel(reason);
        if cancelled {
            info!(task_id = %task.id(), reason = %reason, "cancelled task");
        }
        if let Some(on_completed) = finished {
            on_completed();
        }
        Ok(cancelled)
    }

    /// Ban new children of `parent` on this node.
    ///
    /// Returns the children that are already registered so the caller can
    /// cancel them. `on_children_completed` runs once all of those have been
    /// unregistered, or immediately if there are none.
    pub fn start_ban_on_child_tasks(
        &self,
        parent: &TaskId,
        reason: &str,
        coordinator: &NodeId,
        on_children_completed: impl FnOnce() + Send + 'static,
    ) -> Vec<Arc<Task>> {
        let (children, due) = {
            let mut bans = self.lock_bans();
            let children: Vec<Arc<Task>> = self
                .tasks
                .iter()
                .filter(|entry| entry.task.has_parent(parent))
                .map(|entry| entry.task.clone())
                .collect();
            let due = bans.install(
                parent.clone(),
                reason,
                coordinator,
                children.len(),
                Box::new(on_children_completed) as ChildrenCompleted,
            );
            (children, due)
        };

        info!(
            parent = %parent,
            coordinator = %coordinator,
            children = children.len(),
            "installed ban"
        );
        for callback in due {
            callback();
        }
        children
    }

    /// Lift the ban on `parent`, deferring if children are still running.
    pub fn remove_ban(&self, parent: &TaskId) -> LiftOutcome {
        let outcome = self.lock_bans().lift(parent);
        debug!(parent = %parent, outcome = ?outcome, "lift ban");
        outcome
    }

    /// Remove bans installed by nodes that are no longer in `live_nodes`.
    /// Returns how many were removed.
    pub fn remove_orphaned_bans(&self, live_nodes: &BTreeSet<NodeId>) -> usize {
        let (removed, callbacks) = self.lock_bans().remove_orphaned(live_nodes);
        for parent in &removed {
            info!(parent = %parent, "removed ban from departed coordinator");
        }
        for callback in callbacks {
            callback();
        }
        removed.len()
    }

    /// Number of live bans on this node.
    pub fn ban_count(&self) -> usize {
        self.lock_bans().len()
    }

    pub fn banned_parents(&self) -> Vec<TaskId> {
        self.lock_bans().parents()
    }

    /// Children of `parent` still pending for its ban, if banned.
    pub fn ban_pending_children(&self, parent: &TaskId) -> Option<usize> {
        self.lock_bans().pending_children(parent)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    fn registry() -> TaskRegistry {
        TaskRegistry::new(NodeId::new("node-1"))
    }

    fn counter_listener(counter: &Arc<AtomicUsize>) -> impl FnOnce() + Send + 'static {
        let counter = counter.clone();
        move || {
            counter.fetch_add(1, Ordering::SeqCst);
        }
    }

    fn assert_send_sync<T: Send + Sync>() {}

    #[test]
    fn test_registry_shared_across_threads() {
        assert_send_sync::<TaskRegistry>();

        let registry = Arc::new(registry());
        let counter = Arc::new(AtomicUsize::new(0));
        let tasks: Vec<Arc<Task>> = (0..64)
            .map(|i| {
                registry
                    .register(TaskRequest::new("transport", format!("t{i}")).cancellable(false))
                    .unwrap()
            })
            .collect();

        std::thread::scope(|scope| {
            scope.spawn(|| {
                for task in &tasks {
                    registry
                        .cancel(task, "shutdown", counter_listener(&counter))
                        .unwrap();
                }
            });
            scope.spawn(|| {
                for task in &tasks {
                    registry.unregister(task.id());
                }
            });
        });

        // Each completion listener ran exactly once, whichever side won.
        assert_eq!(counter.load(Ordering::SeqCst), tasks.len());
        assert!(registry.is_empty());
    }

    #[test]
    fn test_register_allocates_increasing_ids() {
        let registry = registry();
        let a = registry.register(TaskRequest::new("transport", "a")).unwrap();
        let b = registry.register(TaskRequest::new("transport", "b")).unwrap();
        assert!(a.id() < b.id());
        assert_eq!(a.id().node(), &NodeId::new("node-1"));
        assert_eq!(registry.len(), 2);
    }

    #[test]
    fn test_unregister_is_idempotent() {
        let registry = registry();
        let task = registry.register(TaskRequest::new("transport", "a")).unwrap();
        assert!(registry.unregister(task.id()).is_some());
        assert!(registry.unregister(task.id()).is_none());
        assert!(registry.get(task.id()).is_none());
        assert!(registry.is_empty());
    }

    #[test]
    fn test_list_by_parent_and_action() {
        let registry = registry();
        let parent = registry
            .register(TaskRequest::new("transport", "cluster:admin/reroute").cancellable(true))
            .unwrap();
        registry
            .register(
                TaskRequest::new("transport", "indices:data/read").with_parent(parent.id().clone()),
            )
            .unwrap();
        registry
            .register(TaskRequest::new("transport", "indices:data/write"))
            .unwrap();

        let children = registry.list(&TaskFilter::all().with_parent(parent.id().clone()));
        assert_eq!(children.len(), 1);
        assert_eq!(children[0].action(), "indices:data/read");

        let reads = registry.list(&TaskFilter::all().with_action("indices:*"));
        assert_eq!(reads.len(), 2);
        assert_eq!(registry.list(&TaskFilter::all()).len(), 3);
    }

    #[test]
    fn test_cancel_notifies_on_completion() {
        let registry = registry();
        let task = registry
            .register(TaskRequest::new("transport", "a").cancellable(false))
            .unwrap();
        let counter = Arc::new(AtomicUsize::new(0));

        assert!(registry.cancel(&task, "stop", counter_listener(&counter)).unwrap());
        assert!(!registry.cancel(&task, "stop", counter_listener(&counter)).unwrap());
        assert_eq!(counter.load(Ordering::SeqCst), 0);
        assert!(task.ensure_not_cancelled().is_err());

        registry.unregister(task.id());
        assert_eq!(counter.load(Ordering::SeqCst), 2);

        // Already finished: acknowledged straight away.
        registry.cancel(&task, "stop", counter_listener(&counter)).unwrap();
        assert_eq!(counter.load(Ordering::SeqCst), 3);
    }

    #[test]
    fn test_cancel_rejects_plain_tasks() {
        let registry = registry();
        let task = registry.register(TaskRequest::new("transport", "a")).unwrap();
        let err = registry.cancel(&task, "stop", || {}).unwrap_err();
        assert!(matches!(err, CoreError::NotCancellable(_)));
    }

    #[test]
    fn test_ban_blocks_children() {
        let registry = registry();
        let parent = TaskId::new(NodeId::new("node-2"), 10);
        let children =
            registry.start_ban_on_child_tasks(&parent, "by user", &NodeId::new("node-2"), || {});
        assert!(children.is_empty());
        assert_eq!(registry.ban_count(), 1);

        let err = registry
            .register(TaskRequest::new("transport", "child").with_parent(parent.clone()))
            .unwrap_err();
        assert!(err.is_cancellation());
        assert_eq!(err.cancellation_reason(), Some("by user"));
        assert!(registry.is_empty());

        // Unrelated tasks still register.
        registry.register(TaskRequest::new("transport", "other")).unwrap();

        assert_eq!(registry.remove_ban(&parent), LiftOutcome::Removed);
        assert_eq!(registry.ban_count(), 0);
        registry
            .register(TaskRequest::new("transport", "child").with_parent(parent))
            .unwrap();
    }

    #[test]
    fn test_ban_waits_for_existing_children() {
        let registry = registry();
        let parent = TaskId::new(NodeId::new("node-2"), 10);
        let child = registry
            .register(
                TaskRequest::new("transport", "child")
                    .with_parent(parent.clone())
                    .cancellable(false),
            )
            .unwrap();

        let counter = Arc::new(AtomicUsize::new(0));
        let children = registry.start_ban_on_child_tasks(
            &parent,
            "by user",
            &NodeId::new("node-2"),
            counter_listener(&counter),
        );
        assert_eq!(children.len(), 1);
        assert_eq!(registry.ban_pending_children(&parent), Some(1));

        assert!(matches!(
            registry.remove_ban(&parent),
            LiftOutcome::Deferred { pending_children: 1 }
        ));
        assert_eq!(registry.ban_count(), 1);
        assert_eq!(counter.load(Ordering::SeqCst), 0);

        registry.unregister(child.id());
        assert_eq!(counter.load(Ordering::SeqCst), 1);
        assert_eq!(registry.ban_count(), 0);
    }

    #[test]
    fn test_orphaned_bans_removed() {
        let registry = registry();
        let parent = TaskId::new(NodeId::new("gone"), 1);
        registry.start_ban_on_child_tasks(&parent, "by user", &NodeId::new("gone"), || {});
        let live: BTreeSet<NodeId> = [NodeId::new("node-1")].into_iter().collect();
        assert_eq!(registry.remove_orphaned_bans(&live), 1);
        assert_eq!(registry.ban_count(), 0);
    }

    #[test]
    fn test_concurrent_register_and_ban() {
        let registry = Arc::new(registry());
        let parent = TaskId::new(NodeId::new("node-2"), 1);

        let registering: Vec<_> = (0..4)
            .map(|_| {
                let registry = registry.clone();
                let parent = parent.clone();
                std::thread::spawn(move || {
                    (0..200)
                        .filter(|_| {
                            registry
                                .register(
                                    TaskRequest::new("transport", "child")
                                        .with_parent(parent.clone()),
                                )
                                .is_ok()
                        })
                        .count()
                })
            })
            .collect();

        let children =
            registry.start_ban_on_child_tasks(&parent, "stop", &NodeId::new("node-2"), || {});
        let registered: usize = registering.into_iter().map(|h| h.join().unwrap()).sum();

        // Everything that got in before the ban was counted, nothing after.
        assert_eq!(children.len(), registered);
        assert_eq!(registry.ban_pending_children(&parent), Some(registered));
    }
}
