use std::sync::Arc;

use memoria_types::{BlockId, NodeId, SnapshotId};

use crate::block::BlockRef;

/// A leaf entry: logical key -> block, plus the snapshot that wrote it.
#[derive(Clone, Debug)]
pub struct LeafEntry {
    pub key: BlockId,
    pub block: BlockRef,
    /// Snapshot that installed this entry. A block is privately writable by a
    /// snapshot only when the entry's owner is that snapshot.
    pub owner: SnapshotId,
}

/// A branch entry: the smallest key reachable through `child`, and the child.
#[derive(Clone, Debug)]
pub struct BranchEntry {
    pub key: BlockId,
    pub child: Arc<Node>,
}

#[derive(Clone, Debug)]
pub enum NodeBody {
    Leaf(Vec<LeafEntry>),
    Branch(Vec<BranchEntry>),
}

/// One node of a persistent tree.
///
/// Nodes are immutable once shared: every tree that can reach a node through
/// more than one `Arc` treats it as read-only.
#[derive(Clone, Debug)]
pub struct Node {
    id: NodeId,
    owner: SnapshotId,
    body: NodeBody,
}

impl Node {
    pub fn leaf(id: NodeId, owner: SnapshotId, entries: Vec<LeafEntry>) -> Self {
        Self {
            id,
            owner,
            body: NodeBody::Leaf(entries),
        }
    }

    pub fn branch(id: NodeId, owner: SnapshotId, entries: Vec<BranchEntry>) -> Self {
        Self {
            id,
            owner,
            body: NodeBody::Branch(entries),
        }
    }

    pub fn id(&self) -> NodeId {
        self.id
    }

    /// Snapshot that created this node.
    pub fn owner(&self) -> SnapshotId {
        self.owner
    }

    pub fn body(&self) -> &NodeBody {
        &self.body
    }

    pub(crate) fn body_mut(&mut self) -> &mut NodeBody {
        &mut self.body
    }

    pub(crate) fn into_body(self) -> NodeBody {
        self.body
    }

    pub fn is_leaf(&self) -> bool {
        matches!(self.body, NodeBody::Leaf(_))
    }

    pub fn len(&self) -> usize {
        match &self.body {
            NodeBody::Leaf(entries) => entries.len(),
            NodeBody::Branch(entries) => entries.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Smallest key stored at or below this node.
    pub fn min_key(&self) -> Option<BlockId> {
        match &self.body {
            NodeBody::Leaf(entries) => entries.first().map(|e| e.key),
            NodeBody::Branch(entries) => entries.first().map(|e| e.key),
        }
    }

    /// Leaf entries, or an empty slice for a branch.
    pub fn leaf_entries(&self) -> &[LeafEntry] {
        match &self.body {
            NodeBody::Leaf(entries) => entries,
            NodeBody::Branch(_) => &[],
        }
    }

    /// Branch entries, or an empty slice for a leaf.
    pub fn branch_entries(&self) -> &[BranchEntry] {
        match &self.body {
            NodeBody::Leaf(_) => &[],
            NodeBody::Branch(entries) => entries,
        }
    }

    /// A copy of this node under a new identity and owner.
    ///
    /// Leaf entries are cloned, so every referenced block gains one reference.
    pub(crate) fn fork(&self, id: NodeId, owner: SnapshotId) -> Node {
        Node {
            id,
            owner,
            body: self.body.clone(),
        }
    }

    /// Number of leaf entries reachable from this node.
    pub fn count_entries(&self) -> usize {
        match &self.body {
            NodeBody::Leaf(entries) => entries.len(),
            NodeBody::Branch(entries) => entries.iter().map(|e| e.child.count_entries()).sum(),
        }
    }
}
