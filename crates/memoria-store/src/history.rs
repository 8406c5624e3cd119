//! Version-tree nodes.
//!
//! A [`HistoryNode`] splits into an immutable identity and a mutex-guarded
//! [`HistoryState`]. The store's lock is always taken before any node lock,
//! and no code holds two node locks without also holding the store lock.

use std::sync::{Mutex, MutexGuard};

use memoria_tree::PersistentTree;
use memoria_types::{SnapshotId, SnapshotStatus};

/// Mutable part of a version-tree node.
#[derive(Debug)]
pub(crate) struct HistoryState {
    pub parent: Option<SnapshotId>,
    pub children: Vec<SnapshotId>,
    pub status: SnapshotStatus,
    pub metadata: String,
    /// Live `Snapshot` handles bound to this node.
    pub references: usize,
    /// Published tree. Only replaced by commit, cleared by drop.
    pub tree: PersistentTree,
}

/// One snapshot in the version tree.
#[derive(Debug)]
pub struct HistoryNode {
    id: SnapshotId,
    state: Mutex<HistoryState>,
}

impl HistoryNode {
    pub(crate) fn new(
        id: SnapshotId,
        parent: Option<SnapshotId>,
        status: SnapshotStatus,
        tree: PersistentTree,
    ) -> Self {
        Self {
            id,
            state: Mutex::new(HistoryState {
                parent,
                children: Vec::new(),
                status,
                metadata: String::new(),
                references: 0,
                tree,
            }),
        }
    }

    pub(crate) fn from_state(id: SnapshotId, state: HistoryState) -> Self {
        Self {
            id,
            state: Mutex::new(state),
        }
    }

    pub fn id(&self) -> SnapshotId {
        self.id
    }

    pub(crate) fn lock(&self) -> MutexGuard<'_, HistoryState> {
        self.state.lock().expect("lock poisoned")
    }

    pub fn status(&self) -> SnapshotStatus {
        self.lock().status
    }

    pub fn parent(&self) -> Option<SnapshotId> {
        self.lock().parent
    }

    pub fn children(&self) -> Vec<SnapshotId> {
        self.lock().children.clone()
    }

    pub fn metadata(&self) -> String {
        self.lock().metadata.clone()
    }

    pub fn references(&self) -> usize {
        self.lock().references
    }

    /// The published tree (cheap clone).
    pub fn tree(&self) -> PersistentTree {
        self.lock().tree.clone()
    }
}

impl HistoryState {
    /// Mark the node dropped and release its published tree.
    pub(crate) fn mark_dropped(&mut self) {
        self.status = SnapshotStatus::Dropped;
        self.tree = PersistentTree::new();
    }

    pub(crate) fn remove_child(&mut self, child: SnapshotId) {
        self.children.retain(|c| *c != child);
    }

    /// Replace `old` in the child list with `new`, keeping its position.
    pub(crate) fn replace_child(&mut self, old: SnapshotId, new: &[SnapshotId]) {
        if let Some(pos) = self.children.iter().position(|c| *c == old) {
            self.children.splice(pos..=pos, new.iter().copied());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn new_node_is_unreferenced_and_childless() {
        let node = HistoryNode::new(
            SnapshotId::random(),
            None,
            SnapshotStatus::Active,
            PersistentTree::new(),
        );
        assert_eq!(node.references(), 0);
        assert!(node.children().is_empty());
        assert_eq!(node.status(), SnapshotStatus::Active);
        assert!(node.parent().is_none());
    }

    #[test]
    fn replace_child_keeps_order() {
        let node = HistoryNode::new(
            SnapshotId::random(),
            None,
            SnapshotStatus::Committed,
            PersistentTree::new(),
        );
        let [a, b, c, d, e] = [(); 5].map(|_| SnapshotId::random());
        node.lock().children = vec![a, b, c];
        node.lock().replace_child(b, &[d, e]);
        assert_eq!(node.children(), vec![a, d, e, c]);
        node.lock().remove_child(d);
        assert_eq!(node.children(), vec![a, e, c]);
    }

    #[test]
    fn mark_dropped_clears_tree() {
        let node = HistoryNode::new(
            SnapshotId::random(),
            None,
            SnapshotStatus::Committed,
            PersistentTree::new(),
        );
        node.lock().mark_dropped();
        assert_eq!(node.status(), SnapshotStatus::Dropped);
        assert!(node.tree().is_empty());
    }
}
