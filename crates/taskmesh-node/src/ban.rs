//! Ban table: parents whose new children must be rejected on this node.
//!
//! A ban is keyed by parent task id. It counts the children that were live on
//! this node when it was installed and is only lifted once that count reaches
//! zero. The table is not synchronised itself; [`TaskRegistry`] owns it behind
//! the same lock it takes when registering or unregistering child tasks, so the
//! pending count and the ban's existence always change together.
//!
//! [`TaskRegistry`]: crate::TaskRegistry

use std::collections::{BTreeSet, HashMap};

use taskmesh_core::{NodeId, TaskId};

/// Callback run once every child known at ban time has completed.
pub type ChildrenCompleted = Box<dyn FnOnce() + Send>;

struct Ban {
    reason: String,
    coordinator: NodeId,
    pending_children: usize,
    lift_requested: bool,
    on_children_completed: Vec<ChildrenCompleted>,
}

/// Result of asking for a ban to be lifted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LiftOutcome {
    Removed,
    /// Removal deferred until the remaining children complete.
    Deferred { pending_children: usize },
    NotFound,
}

#[derive(Default)]
pub struct BanTable {
    bans: HashMap<TaskId, Ban>,
}

impl BanTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.bans.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bans.is_empty()
    }

    /// The ban reason for `parent`, if banned.
    pub fn reason(&self, parent: &TaskId) -> Option<&str> {
        self.bans.get(parent).map(|b| b.reason.as_str())
    }

    pub fn pending_children(&self, parent: &TaskId) -> Option<usize> {
        self.bans.get(parent).map(|b| b.pending_children)
    }

    pub fn parents(&self) -> Vec<TaskId> {
        let mut parents: Vec<TaskId> = self.bans.keys().cloned().collect();
        parents.sort();
        parents
    }

    /// Install (or refresh) a ban. A refresh takes the new reason and
    /// coordinator.
    ///
    /// `live_children` is the number of children of `parent` currently
    /// registered. Returns callbacks that are due immediately because no
    /// children are pending.
    pub fn install(
        &mut self,
        parent: TaskId,
        reason: &str,
        coordinator: &NodeId,
        live_children: usize,
        on_children_completed: ChildrenCompleted,
    ) -> Vec<ChildrenCompleted> {
        let ban = self.bans.entry(parent).or_insert_with(|| Ban {
            reason: reason.to_string(),
            coordinator: coordinator.clone(),
            pending_children: 0,
            lift_requested: false,
            on_children_completed: Vec::new(),
        });
        ban.reason = reason.to_string();
        ban.coordinator = coordinator.clone();
        ban.pending_children = live_children;
        ban.lift_requested = false;
        ban.on_children_completed.push(on_children_completed);

        if ban.pending_children == 0 {
            std::mem::take(&mut ban.on_children_completed)
        } else {
            Vec::new()
        }
    }

    /// Record that a child of `parent` finished. Returns callbacks that are
    /// now due.
    pub fn child_completed(&mut self, parent: &TaskId) -> Vec<ChildrenCompleted> {
        let Some(ban) = self.bans.get_mut(parent) else {
            return Vec::new();
        };
        ban.pending_children = ban.pending_children.saturating_sub(1);
        if ban.pending_children > 0 {
            return Vec::new();
        }

        let due = std::mem::take(&mut ban.on_children_completed);
        if ban.lift_requested {
            self.bans.remove(parent);
        }
        due
    }

    /// Lift the ban on `parent`, now if no children are pending, otherwise as
    /// soon as the last one completes.
    pub fn lift(&mut self, parent: &TaskId) -> LiftOutcome {
        let Some(ban) = self.bans.get_mut(parent) else {
            return LiftOutcome::NotFound;
        };
        if ban.pending_children == 0 {
            self.bans.remove(parent);
            return LiftOutcome::Removed;
        }
        ban.lift_requested = true;
        LiftOutcome::Deferred {
            pending_children: ban.pending_children,
        }
    }

    /// Drop every ban whose coordinating node is not in `live_nodes`.
    ///
    /// Returns the removed parents together with any completion callbacks
    /// that were still waiting, so that nothing stays parked on them.
    pub fn remove_orphaned(
        &mut self,
        live_nodes: &BTreeSet<NodeId>,
    ) -> (Vec<TaskId>, Vec<ChildrenCompleted>) {
        let orphaned: Vec<TaskId> = self
            .bans
            .iter()
            .filter(|(_, ban)| !live_nodes.contains(&ban.coordinator))
            .map(|(parent, _)| parent.clone())
            .collect();

        let mut callbacks = Vec::new();
        for parent in &orphaned {
            if let Some(ban) = self.bans.remove(parent) {
                callbacks.extend(ban.on_children_completed);
            }
        }
        (orphaned, callbacks)
    }
}
