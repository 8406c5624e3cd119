use std::collections::BTreeMap;

use memoria_types::{NodeId, SnapshotId, SnapshotStatus};
use serde::{Deserialize, Serialize};

use crate::history::HistoryNode;

/// Summary of one snapshot.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct SnapshotDescription {
    pub id: SnapshotId,
    pub status: SnapshotStatus,
    pub parent: Option<SnapshotId>,
    pub children: Vec<SnapshotId>,
    pub metadata: String,
    /// Blocks visible in the published tree.
    pub blocks: usize,
    /// Root node of the published tree.
    pub root_node: Option<NodeId>,
    /// Live handles bound to the snapshot.
    pub references: usize,
}

impl SnapshotDescription {
    pub(crate) fn of(node: &HistoryNode) -> Self {
        let st = node.lock();
        Self {
            id: node.id(),
            status: st.status,
            parent: st.parent,
            children: st.children.clone(),
            metadata: st.metadata.clone(),
            blocks: st.tree.len(),
            root_node: st.tree.root_id(),
            references: st.references,
        }
    }
}

/// Summary of a whole store, snapshots listed depth-first from the root.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoreDescription {
    pub root: SnapshotId,
    pub master: SnapshotId,
    pub branches: BTreeMap<String, SnapshotId>,
    pub snapshots: Vec<SnapshotDescription>,
}

impl StoreDescription {
    pub fn snapshot(&self, id: SnapshotId) -> Option<&SnapshotDescription> {
        self.snapshots.iter().find(|s| s.id == id)
    }
}
