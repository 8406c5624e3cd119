//! The persistent B+tree and its copy-on-write write path.
//!
//! # Invariants
//!
//! - All leaves sit at the same depth.
//! - Branch nodes are never empty; an empty child is unlinked immediately.
//! - For branch entries `e[i]`, every key below `e[i].child` is `>= e[i].key`
//!   and `< e[i + 1].key`. Separators may be lower than the true minimum after
//!   a removal; lookups only rely on the ordering above.
//! - A node is edited in place only if it is owned by the writer and the
//!   writer's tree holds the only `Arc` to it.

use std::sync::Arc;

use memoria_types::{BlockId, NodeId};
use tracing::trace;

use crate::alloc::CowContext;
use crate::block::{Block, BlockRef};
use crate::error::TreeResult;
use crate::node::{BranchEntry, LeafEntry, Node, NodeBody};

/// Smallest supported node fan-out.
pub const MIN_FANOUT: usize = 4;

/// A persistent, copy-on-write map from logical block IDs to blocks.
///
/// Cloning is O(1) and yields an independent, frozen view.
#[derive(Clone, Debug, Default)]
pub struct PersistentTree {
    root: Option<Arc<Node>>,
    len: usize,
}

impl PersistentTree {
    pub fn new() -> Self {
        Self::default()
    }

    /// Wrap an existing root (used when rebuilding a loaded store).
    pub fn from_root(root: Option<Arc<Node>>) -> Self {
        let len = root.as_ref().map_or(0, |r| r.count_entries());
        Self { root, len }
    }

    pub fn root(&self) -> Option<&Arc<Node>> {
        self.root.as_ref()
    }

    pub fn root_id(&self) -> Option<NodeId> {
        self.root.as_ref().map(|r| r.id())
    }

    /// Number of blocks visible through this tree.
    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Whether both values share the same root node.
    pub fn same_root(&self, other: &PersistentTree) -> bool {
        match (&self.root, &other.root) {
            (Some(a), Some(b)) => Arc::ptr_eq(a, b),
            (None, None) => true,
            _ => false,
        }
    }

    /// Number of levels from the root to the leaves.
    pub fn depth(&self) -> usize {
        let mut depth = 0;
        let mut node = self.root.as_deref();
        while let Some(n) = node {
            depth += 1;
            node = n.branch_entries().first().map(|e| e.child.as_ref());
        }
        depth
    }

    /// Look up the leaf entry for `key`.
    pub fn find(&self, key: &BlockId) -> Option<&LeafEntry> {
        let mut node = self.root.as_deref()?;
        loop {
            match node.body() {
                NodeBody::Leaf(entries) => {
                    return entries
                        .binary_search_by(|e| e.key.cmp(key))
                        .ok()
                        .map(|i| &entries[i]);
                }
                NodeBody::Branch(entries) => {
                    node = &entries.get(child_index(entries, key))?.child;
                }
            }
        }
    }

    pub fn contains(&self, key: &BlockId) -> bool {
        self.find(key).is_some()
    }

    /// The block stored under `key`, without its ownership record.
    pub fn get(&self, key: &BlockId) -> Option<Arc<Block>> {
        self.find(key).map(|e| e.block.shared())
    }

    /// Store `block` under `key` on behalf of `ctx.owner`.
    ///
    /// Returns the entry previously stored under `key`. Every other tree value
    /// keeps observing exactly what it observed before the call.
    pub fn assign(
        &mut self,
        ctx: &CowContext<'_>,
        key: BlockId,
        block: Arc<Block>,
    ) -> TreeResult<Option<LeafEntry>> {
        let (old, split) = match self.root.as_mut() {
            None => {
                let entry = LeafEntry {
                    key,
                    block: BlockRef::new(block),
                    owner: ctx.owner,
                };
                let leaf = Node::leaf(ctx.ids.next_id()?, ctx.owner, vec![entry]);
                self.root = Some(Arc::new(leaf));
                self.len = 1;
                return Ok(None);
            }
            Some(slot) => {
                let root = writable(slot, ctx)?;
                insert(root, ctx, key, &block)?
            }
        };

        if let Some(split) = split {
            let id = ctx.ids.next_id()?;
            if let Some(left) = self.root.take() {
                let left_key = left.min_key().unwrap_or(split.key);
                let new_root = Node::branch(
                    id,
                    ctx.owner,
                    vec![
                        BranchEntry {
                            key: left_key,
                            child: left,
                        },
                        split,
                    ],
                );
                self.root = Some(Arc::new(new_root));
            }
        }

        if old.is_none() {
            self.len += 1;
        }
        Ok(old)
    }

    /// Remove `key` on behalf of `ctx.owner`, returning the removed entry.
    ///
    /// Removing an absent key copies nothing.
    pub fn remove(
        &mut self,
        ctx: &CowContext<'_>,
        key: &BlockId,
    ) -> TreeResult<Option<LeafEntry>> {
        if !self.contains(key) {
            return Ok(None);
        }
        let removed = match self.root.as_mut() {
            None => return Ok(None),
            Some(slot) => {
                let root = writable(slot, ctx)?;
                remove_from(root, ctx, key)?
            }
        };
        self.collapse_root();
        if removed.is_some() {
            self.len -= 1;
        }
        Ok(removed)
    }

    /// Entries in ascending key order.
    pub fn iter(&self) -> Iter<'_> {
        let mut iter = Iter {
            stack: Vec::new(),
            leaf: [].iter(),
        };
        if let Some(root) = self.root.as_deref() {
            iter.descend(root);
        }
        iter
    }

    pub fn keys(&self) -> impl Iterator<Item = BlockId> + '_ {
        self.iter().map(|e| e.key)
    }

    fn collapse_root(&mut self) {
        loop {
            let next = match self.root.as_deref() {
                None => return,
                Some(node) if node.is_empty() => None,
                Some(node) => match node.body() {
                    NodeBody::Branch(entries) if entries.len() == 1 => {
                        Some(Arc::clone(&entries[0].child))
                    }
                    _ => return,
                },
            };
            self.root = next;
        }
    }
}

/// In-order iterator over a tree's leaf entries.
pub struct Iter<'a> {
    stack: Vec<std::slice::Iter<'a, BranchEntry>>,
    leaf: std::slice::Iter<'a, LeafEntry>,
}

impl<'a> Iter<'a> {
    fn descend(&mut self, mut node: &'a Node) {
        loop {
            match node.body() {
                NodeBody::Leaf(entries) => {
                    self.leaf = entries.iter();
                    return;
                }
                NodeBody::Branch(entries) => {
                    let mut children = entries.iter();
                    match children.next() {
                        Some(first) => {
                            self.stack.push(children);
                            node = &first.child;
                        }
                        None => return,
                    }
                }
            }
        }
    }
}

impl<'a> Iterator for Iter<'a> {
    type Item = &'a LeafEntry;

    fn next(&mut self) -> Option<&'a LeafEntry> {
        loop {
            if let Some(entry) = self.leaf.next() {
                return Some(entry);
            }
            let next_child = loop {
                let top = self.stack.last_mut()?;
                match top.next() {
                    Some(entry) => break &entry.child,
                    None => {
                        self.stack.pop();
                    }
                }
            };
            self.descend(next_child);
        }
    }
}

/// Index of the child whose key range contains `key`.
fn child_index(entries: &[BranchEntry], key: &BlockId) -> usize {
    entries.partition_point(|e| e.key <= *key).saturating_sub(1)
}

/// Make the node in `slot` privately writable by `ctx.owner`.
///
/// A node owned by someone else, or shared with another tree value, is
/// replaced by a fresh copy first.
fn writable<'n>(slot: &'n mut Arc<Node>, ctx: &CowContext<'_>) -> TreeResult<&'n mut Node> {
    let shared = Arc::strong_count(slot) > 1 || Arc::weak_count(slot) > 0;
    if slot.owner() != ctx.owner || shared {
        let copy = slot.fork(ctx.ids.next_id()?, ctx.owner);
        trace!(
            from = %slot.id(),
            to = %copy.id(),
            owner = %ctx.owner.short_hex(),
            "copied tree node"
        );
        *slot = Arc::new(copy);
    }
    // Unique at this point, so this never clones.
    Ok(Arc::make_mut(slot))
}

fn insert(
    node: &mut Node,
    ctx: &CowContext<'_>,
    key: BlockId,
    block: &Arc<Block>,
) -> TreeResult<(Option<LeafEntry>, Option<BranchEntry>)> {
    match node.body_mut() {
        NodeBody::Leaf(entries) => {
            let entry = LeafEntry {
                key,
                block: BlockRef::new(Arc::clone(block)),
                owner: ctx.owner,
            };
            match entries.binary_search_by(|e| e.key.cmp(&key)) {
                Ok(i) => Ok((Some(std::mem::replace(&mut entries[i], entry)), None)),
                Err(i) => {
                    entries.insert(i, entry);
                    if entries.len() > ctx.fanout {
                        let right = entries.split_off(entries.len() / 2);
                        let sep = right[0].key;
                        let node = Node::leaf(ctx.ids.next_id()?, ctx.owner, right);
                        return Ok((
                            None,
                            Some(BranchEntry {
                                key: sep,
                                child: Arc::new(node),
                            }),
                        ));
                    }
                    Ok((None, None))
                }
            }
        }
        NodeBody::Branch(entries) => {
            let idx = child_index(entries, &key);
            let slot = &mut entries[idx];
            let child = writable(&mut slot.child, ctx)?;
            let (old, split) = insert(child, ctx, key, block)?;
            if key < slot.key {
                slot.key = key;
            }
            if let Some(split) = split {
                entries.insert(idx + 1, split);
                if entries.len() > ctx.fanout {
                    let right = entries.split_off(entries.len() / 2);
                    let sep = right[0].key;
                    let node = Node::branch(ctx.ids.next_id()?, ctx.owner, right);
                    return Ok((
                        old,
                        Some(BranchEntry {
                            key: sep,
                            child: Arc::new(node),
                        }),
                    ));
                }
            }
            Ok((old, None))
        }
    }
}

fn remove_from(
    node: &mut Node,
    ctx: &CowContext<'_>,
    key: &BlockId,
) -> TreeResult<Option<LeafEntry>> {
    match node.body_mut() {
        NodeBody::Leaf(entries) => Ok(entries
            .binary_search_by(|e| e.key.cmp(key))
            .ok()
            .map(|i| entries.remove(i))),
        NodeBody::Branch(entries) => {
            let idx = child_index(entries, key);
            let child = writable(&mut entries[idx].child, ctx)?;
            let removed = remove_from(child, ctx, key)?;
            let remaining = child.len();
            if remaining == 0 {
                entries.remove(idx);
            } else if remaining < ctx.underflow() {
                merge_with_neighbour(entries, idx, ctx)?;
            }
            Ok(removed)
        }
    }
}

/// Merge the child at `idx` with an adjacent sibling when both fit in one node.
fn merge_with_neighbour(
    entries: &mut Vec<BranchEntry>,
    idx: usize,
    ctx: &CowContext<'_>,
) -> TreeResult<()> {
    if entries.len() < 2 {
        return Ok(());
    }
    let left = if idx > 0 { idx - 1 } else { idx };
    let (a, b) = (&entries[left].child, &entries[left + 1].child);
    if a.is_leaf() != b.is_leaf() || a.len() + b.len() > ctx.fanout {
        return Ok(());
    }

    writable(&mut entries[left].child, ctx)?;
    let right = entries.remove(left + 1);
    let right_body = match Arc::try_unwrap(right.child) {
        Ok(node) => node.into_body(),
        Err(shared) => shared.body().clone(),
    };
    let target = Arc::make_mut(&mut entries[left].child);
    match (target.body_mut(), right_body) {
        (NodeBody::Leaf(dst), NodeBody::Leaf(src)) => dst.extend(src),
        (NodeBody::Branch(dst), NodeBody::Branch(src)) => dst.extend(src),
        _ => unreachable!("siblings checked to be at the same level"),
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use std::collections::{BTreeMap, HashMap, HashSet};

    use memoria_types::{SnapshotId, TypeTag};
    use proptest::prelude::*;

    use super::*;
    use crate::alloc::NodeIdGen;

    fn block(key: u128, byte: u8) -> Arc<Block> {
        Arc::new(Block::new(
            BlockId::from_u128(key),
            BlockId::random(),
            TypeTag::named("test", "raw"),
            vec![byte; 4],
        ))
    }

    fn key(k: u128) -> BlockId {
        BlockId::from_u128(k)
    }

    fn byte_at(tree: &PersistentTree, k: u128) -> Option<u8> {
        tree.find(&key(k)).map(|e| e.block.read()[0])
    }

    /// Count leaf entries per block uid across every distinct node reachable
    /// from `trees`.
    fn leaf_references(trees: &[&PersistentTree]) -> HashMap<BlockId, usize> {
        fn walk(
            node: &Arc<Node>,
            seen: &mut HashSet<*const Node>,
            counts: &mut HashMap<BlockId, usize>,
        ) {
            if !seen.insert(Arc::as_ptr(node)) {
                return;
            }
            match node.body() {
                NodeBody::Leaf(entries) => {
                    for e in entries {
                        *counts.entry(e.block.uid()).or_default() += 1;
                    }
                }
                NodeBody::Branch(entries) => {
                    for e in entries {
                        walk(&e.child, seen, counts);
                    }
                }
            }
        }
        let mut seen = HashSet::new();
        let mut counts = HashMap::new();
        for tree in trees {
            if let Some(root) = tree.root() {
                walk(root, &mut seen, &mut counts);
            }
        }
        counts
    }

    // -----------------------------------------------------------------------
    // Basic map behaviour
    // -----------------------------------------------------------------------

    #[test]
    fn empty_tree_finds_nothing() {
        let tree = PersistentTree::new();
        assert!(tree.is_empty());
        assert!(tree.find(&key(1)).is_none());
        assert_eq!(tree.depth(), 0);
        assert_eq!(tree.iter().count(), 0);
    }

    #[test]
    fn assign_and_find() {
        let ids = NodeIdGen::new();
        let owner = SnapshotId::random();
        let ctx = CowContext::new(owner, &ids, 8).unwrap();
        let mut tree = PersistentTree::new();

        assert!(tree.assign(&ctx, key(7), block(7, 70)).unwrap().is_none());
        let entry = tree.find(&key(7)).unwrap();
        assert_eq!(entry.owner, owner);
        assert_eq!(entry.block.read()[0], 70);
        assert_eq!(tree.len(), 1);
    }

    #[test]
    fn assign_replaces_and_returns_previous() {
        let ids = NodeIdGen::new();
        let ctx = CowContext::new(SnapshotId::random(), &ids, 8).unwrap();
        let mut tree = PersistentTree::new();
        tree.assign(&ctx, key(1), block(1, 1)).unwrap();
        let old = tree.assign(&ctx, key(1), block(1, 2)).unwrap().unwrap();
        assert_eq!(old.block.read()[0], 1);
        assert_eq!(byte_at(&tree, 1), Some(2));
        assert_eq!(tree.len(), 1);
    }

    #[test]
    fn splits_keep_every_key_reachable_and_sorted() {
        let ids = NodeIdGen::new();
        let ctx = CowContext::new(SnapshotId::random(), &ids, 4).unwrap();
        let mut tree = PersistentTree::new();
        for k in (0..200u128).rev() {
            tree.assign(&ctx, key(k), block(k, k as u8)).unwrap();
        }
        assert_eq!(tree.len(), 200);
        assert!(tree.depth() > 2);
        for k in 0..200u128 {
            assert_eq!(byte_at(&tree, k), Some(k as u8), "key {k}");
        }
        let keys: Vec<BlockId> = tree.keys().collect();
        assert_eq!(keys.len(), 200);
        assert!(keys.windows(2).all(|w| w[0] < w[1]));
    }

    #[test]
    fn remove_everything_empties_tree() {
        let ids = NodeIdGen::new();
        let ctx = CowContext::new(SnapshotId::random(), &ids, 4).unwrap();
        let mut tree = PersistentTree::new();
        for k in 0..64u128 {
            tree.assign(&ctx, key(k), block(k, 0)).unwrap();
        }
        for k in 0..64u128 {
            assert!(tree.remove(&ctx, &key(k)).unwrap().is_some());
        }
        assert!(tree.is_empty());
        assert!(tree.root().is_none());
    }

    // -----------------------------------------------------------------------
    // Copy-on-write
    // -----------------------------------------------------------------------

    #[test]
    fn old_root_is_unchanged_after_writes_by_another_owner() {
        let ids = NodeIdGen::new();
        let parent = CowContext::new(SnapshotId::random(), &ids, 4).unwrap();
        let mut base = PersistentTree::new();
        for k in 0..32u128 {
            base.assign(&parent, key(k), block(k, 1)).unwrap();
        }
        let frozen = base.clone();

        let child = CowContext::new(SnapshotId::random(), &ids, 4).unwrap();
        let mut work = base.clone();
        work.assign(&child, key(5), block(5, 2)).unwrap();
        work.remove(&child, &key(6)).unwrap();
        work.assign(&child, key(100), block(100, 3)).unwrap();

        for k in 0..32u128 {
            assert_eq!(byte_at(&frozen, k), Some(1));
        }
        assert_eq!(byte_at(&frozen, 100), None);
        assert_eq!(byte_at(&work, 5), Some(2));
        assert_eq!(byte_at(&work, 6), None);
        assert_eq!(frozen.len(), 32);
        assert_eq!(work.len(), 32);
    }

    #[test]
    fn owned_unshared_nodes_are_edited_in_place() {
        let ids = NodeIdGen::new();
        let ctx = CowContext::new(SnapshotId::random(), &ids, 8).unwrap();
        let mut tree = PersistentTree::new();
        tree.assign(&ctx, key(1), block(1, 1)).unwrap();
        let root = tree.root_id();
        tree.assign(&ctx, key(2), block(2, 2)).unwrap();
        assert_eq!(tree.root_id(), root);
    }

    #[test]
    fn foreign_root_is_copied_before_write() {
        let ids = NodeIdGen::new();
        let a = CowContext::new(SnapshotId::random(), &ids, 8).unwrap();
        let b = CowContext::new(SnapshotId::random(), &ids, 8).unwrap();
        let mut tree = PersistentTree::new();
        tree.assign(&a, key(1), block(1, 1)).unwrap();
        let before = tree.root_id();
        tree.assign(&b, key(2), block(2, 2)).unwrap();
        assert_ne!(tree.root_id(), before);
        assert_eq!(tree.root().unwrap().owner(), b.owner);
    }

    #[test]
    fn shared_owned_root_is_still_copied() {
        let ids = NodeIdGen::new();
        let ctx = CowContext::new(SnapshotId::random(), &ids, 8).unwrap();
        let mut tree = PersistentTree::new();
        tree.assign(&ctx, key(1), block(1, 1)).unwrap();
        let published = tree.clone();
        tree.assign(&ctx, key(1), block(1, 9)).unwrap();
        assert_eq!(byte_at(&published, 1), Some(1));
        assert_eq!(byte_at(&tree, 1), Some(9));
        assert!(!tree.same_root(&published));
    }

    #[test]
    fn removing_absent_key_copies_nothing() {
        let ids = NodeIdGen::new();
        let a = CowContext::new(SnapshotId::random(), &ids, 8).unwrap();
        let b = CowContext::new(SnapshotId::random(), &ids, 8).unwrap();
        let mut tree = PersistentTree::new();
        tree.assign(&a, key(1), block(1, 1)).unwrap();
        let before = tree.root_id();
        assert!(tree.remove(&b, &key(99)).unwrap().is_none());
        assert_eq!(tree.root_id(), before);
    }

    // -----------------------------------------------------------------------
    // Reference counting
    // -----------------------------------------------------------------------

    #[test]
    fn references_follow_leaf_copies() {
        let ids = NodeIdGen::new();
        let a = CowContext::new(SnapshotId::random(), &ids, 8).unwrap();
        let b = CowContext::new(SnapshotId::random(), &ids, 8).unwrap();
        let shared = block(1, 1);
        let mut base = PersistentTree::new();
        base.assign(&a, key(1), Arc::clone(&shared)).unwrap();
        assert_eq!(shared.references(), 1);

        let mut child = base.clone();
        assert_eq!(shared.references(), 1);

        // Copying the leaf to write key 2 duplicates the entry for key 1.
        child.assign(&b, key(2), block(2, 2)).unwrap();
        assert_eq!(shared.references(), 2);

        drop(child);
        assert_eq!(shared.references(), 1);
        drop(base);
        assert_eq!(shared.references(), 0);
    }

    #[test]
    fn replaced_block_loses_its_reference() {
        let ids = NodeIdGen::new();
        let ctx = CowContext::new(SnapshotId::random(), &ids, 8).unwrap();
        let first = block(1, 1);
        let mut tree = PersistentTree::new();
        tree.assign(&ctx, key(1), Arc::clone(&first)).unwrap();
        let old = tree.assign(&ctx, key(1), block(1, 2)).unwrap();
        drop(old);
        assert_eq!(first.references(), 0);
    }

    // -----------------------------------------------------------------------
    // Properties
    // -----------------------------------------------------------------------

    #[derive(Clone, Debug)]
    enum Op {
        Assign(u16, u8),
        Remove(u16),
        Checkpoint,
    }

    fn op() -> impl Strategy<Value = Op> {
        prop_oneof![
            4 => (0u16..300, any::<u8>()).prop_map(|(k, v)| Op::Assign(k, v)),
            2 => (0u16..300).prop_map(Op::Remove),
            1 => Just(Op::Checkpoint),
        ]
    }

    proptest! {
        #[test]
        fn matches_model_and_preserves_checkpoints(ops in proptest::collection::vec(op(), 1..400)) {
            let ids = NodeIdGen::new();
            let mut owner = SnapshotId::random();
            let mut tree = PersistentTree::new();
            let mut model: BTreeMap<u16, u8> = BTreeMap::new();
            let mut checkpoints: Vec<(PersistentTree, BTreeMap<u16, u8>)> = Vec::new();

            for op in ops {
                let ctx = CowContext::new(owner, &ids, 4).unwrap();
                match op {
                    Op::Assign(k, v) => {
                        tree.assign(&ctx, key(k as u128), block(k as u128, v)).unwrap();
                        model.insert(k, v);
                    }
                    Op::Remove(k) => {
                        let removed = tree.remove(&ctx, &key(k as u128)).unwrap();
                        prop_assert_eq!(removed.is_some(), model.remove(&k).is_some());
                    }
                    Op::Checkpoint => {
                        checkpoints.push((tree.clone(), model.clone()));
                        owner = SnapshotId::random();
                    }
                }
                prop_assert_eq!(tree.len(), model.len());
            }

            let seen: Vec<(u16, u8)> = tree
                .iter()
                .map(|e| (e.key.as_u128() as u16, e.block.read()[0]))
                .collect();
            let expected: Vec<(u16, u8)> = model.iter().map(|(k, v)| (*k, *v)).collect();
            prop_assert_eq!(seen, expected);

            for (frozen, frozen_model) in &checkpoints {
                prop_assert_eq!(frozen.len(), frozen_model.len());
                for (k, v) in frozen_model {
                    prop_assert_eq!(byte_at(frozen, *k as u128), Some(*v));
                }
            }

            let mut trees: Vec<&PersistentTree> = checkpoints.iter().map(|(t, _)| t).collect();
            trees.push(&tree);
            let counts = leaf_references(&trees);
            for t in &trees {
                for e in t.iter() {
                    prop_assert_eq!(e.block.references(), counts[&e.block.uid()]);
                }
            }
        }
    }
}
