use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard};

use memoria_tree::{CowContext, NodeIdGen, PersistentTree};
use memoria_types::{BlockId, SnapshotId, SnapshotStatus};
use tracing::{debug, info, warn};

use crate::codec::TypeRegistry;
use crate::config::StoreConfig;
use crate::describe::{SnapshotDescription, StoreDescription};
use crate::error::{StoreError, StoreResult};
use crate::history::HistoryNode;
use crate::names::validate_branch_name;
use crate::snapshot::Snapshot;

/// An in-memory, multi-version block store.
///
/// Cloning a `BlockStore` yields another handle to the same store; every
/// handle and every [`Snapshot`] opened from it share one version tree.
#[derive(Clone)]
pub struct BlockStore {
    pub(crate) shared: Arc<StoreShared>,
}

pub(crate) struct StoreShared {
    pub(crate) registry: Arc<TypeRegistry>,
    pub(crate) config: StoreConfig,
    pub(crate) ids: NodeIdGen,
    state: Mutex<StoreState>,
}

/// Store-wide indexes, guarded by the store lock.
pub(crate) struct StoreState {
    pub(crate) history: HashMap<SnapshotId, Arc<HistoryNode>>,
    pub(crate) root: SnapshotId,
    pub(crate) master: SnapshotId,
    pub(crate) branches: BTreeMap<String, SnapshotId>,
}

impl BlockStore {
    /// Create an empty store with the default configuration.
    pub fn create(registry: Arc<TypeRegistry>) -> StoreResult<Self> {
        Self::create_with_config(StoreConfig::default(), registry)
    }

    /// Create an empty store whose root snapshot is already committed.
    pub fn create_with_config(
        config: StoreConfig,
        registry: Arc<TypeRegistry>,
    ) -> StoreResult<Self> {
        config.validate()?;
        let root = SnapshotId::random();
        let node = Arc::new(HistoryNode::new(
            root,
            None,
            SnapshotStatus::Active,
            PersistentTree::new(),
        ));
        node.lock().status = SnapshotStatus::Committed;

        let mut history = HashMap::new();
        history.insert(root, node);
        let state = StoreState {
            history,
            root,
            master: root,
            branches: BTreeMap::new(),
        };
        info!(root = %root.short_hex(), "block store created");
        Ok(Self::from_parts(config, registry, NodeIdGen::new(), state))
    }

    pub(crate) fn from_parts(
        config: StoreConfig,
        registry: Arc<TypeRegistry>,
        ids: NodeIdGen,
        state: StoreState,
    ) -> Self {
        Self {
            shared: Arc::new(StoreShared {
                registry,
                config,
                ids,
                state: Mutex::new(state),
            }),
        }
    }

    pub(crate) fn lock(&self) -> MutexGuard<'_, StoreState> {
        self.shared.state.lock().expect("lock poisoned")
    }

    pub fn config(&self) -> &StoreConfig {
        &self.shared.config
    }

    pub fn registry(&self) -> &Arc<TypeRegistry> {
        &self.shared.registry
    }

    /// Tree-write context for `owner`.
    pub(crate) fn cow_context(&self, owner: SnapshotId) -> StoreResult<CowContext<'_>> {
        Ok(CowContext::new(owner, &self.shared.ids, self.shared.config.tree_fanout)?)
    }

    // -----------------------------------------------------------------------
    // Opening snapshots
    // -----------------------------------------------------------------------

    /// Open a read-only view of a committed snapshot.
    pub fn find(&self, id: SnapshotId) -> StoreResult<Snapshot> {
        let state = self.lock();
        let node = Arc::clone(state.node(id)?);
        self.open_committed(&state, node, "open")
    }

    /// Open the snapshot a named branch points at.
    pub fn find_branch(&self, name: &str) -> StoreResult<Snapshot> {
        let state = self.lock();
        let id = state.branch_target(name)?;
        let node = Arc::clone(state.node(id)?);
        self.open_committed(&state, node, "open branch")
    }

    /// Open the master head.
    pub fn master(&self) -> StoreResult<Snapshot> {
        let state = self.lock();
        let node = Arc::clone(state.node(state.master)?);
        self.open_committed(&state, node, "open master")
    }

    /// Bind a new handle to a committed node. Must run under the store lock so
    /// the node cannot be reaped in between.
    fn open_committed(
        &self,
        _state: &StoreState,
        node: Arc<HistoryNode>,
        operation: &'static str,
    ) -> StoreResult<Snapshot> {
        let tree = {
            let mut st = node.lock();
            if st.status != SnapshotStatus::Committed {
                return Err(StoreError::InvalidState {
                    snapshot: node.id(),
                    operation,
                    actual: st.status,
                });
            }
            st.references += 1;
            st.tree.clone()
        };
        Ok(Snapshot::bind(self.clone(), node, tree, false))
    }

    // -----------------------------------------------------------------------
    // Master and branches
    // -----------------------------------------------------------------------

    pub fn root_id(&self) -> SnapshotId {
        self.lock().root
    }

    pub fn master_id(&self) -> SnapshotId {
        self.lock().master
    }

    pub fn set_master(&self, id: SnapshotId) -> StoreResult<()> {
        let mut state = self.lock();
        state.require_committed(id, "set as master")?;
        state.master = id;
        info!(snapshot = %id.short_hex(), "master moved");
        Ok(())
    }

    /// Point `name` at a committed snapshot, creating the branch if needed.
    pub fn set_branch(&self, name: &str, id: SnapshotId) -> StoreResult<()> {
        validate_branch_name(name)?;
        let mut state = self.lock();
        state.require_committed(id, "set as branch")?;
        state.branches.insert(name.to_string(), id);
        info!(branch = name, snapshot = %id.short_hex(), "branch set");
        Ok(())
    }

    /// Delete a branch, returning the snapshot it pointed at.
    pub fn remove_branch(&self, name: &str) -> StoreResult<SnapshotId> {
        let mut state = self.lock();
        let id = state
            .branches
            .remove(name)
            .ok_or_else(|| StoreError::BranchNotFound(name.to_string()))?;
        info!(branch = name, "branch removed");
        Ok(id)
    }

    pub fn branch_target(&self, name: &str) -> StoreResult<SnapshotId> {
        self.lock().branch_target(name)
    }

    pub fn branch_names(&self) -> Vec<String> {
        self.lock().branches.keys().cloned().collect()
    }

    // -----------------------------------------------------------------------
    // Version tree
    // -----------------------------------------------------------------------

    /// Every snapshot currently in the version tree, sorted.
    pub fn snapshot_ids(&self) -> Vec<SnapshotId> {
        let mut ids: Vec<SnapshotId> = self.lock().history.keys().copied().collect();
        ids.sort();
        ids
    }

    pub fn status(&self, id: SnapshotId) -> StoreResult<SnapshotStatus> {
        Ok(self.lock().node(id)?.status())
    }

    /// Parents of `id`, nearest first, ending at the root.
    pub fn ancestors(&self, id: SnapshotId) -> StoreResult<Vec<SnapshotId>> {
        let state = self.lock();
        state.node(id)?;
        Ok(state.ancestors(id))
    }

    /// The nearest snapshot that is `a`, `b`, or an ancestor of both.
    pub fn common_ancestor(
        &self,
        a: SnapshotId,
        b: SnapshotId,
    ) -> StoreResult<Option<SnapshotId>> {
        let state = self.lock();
        state.node(a)?;
        state.node(b)?;
        let mut seen: HashSet<SnapshotId> = state.ancestors(a).into_iter().collect();
        seen.insert(a);
        if seen.contains(&b) {
            return Ok(Some(b));
        }
        Ok(state.ancestors(b).into_iter().find(|id| seen.contains(id)))
    }

    /// Drop a committed snapshot without opening it.
    ///
    /// The node is removed from the version tree once it is unreferenced and
    /// childless; until then it stays as a dropped placeholder.
    pub fn forget_snapshot(&self, id: SnapshotId) -> StoreResult<()> {
        let mut state = self.lock();
        let node = Arc::clone(state.node(id)?);
        if let Some(reason) = state.protection(id) {
            return Err(StoreError::Protected {
                snapshot: id,
                reason,
            });
        }
        {
            let mut st = node.lock();
            match st.status {
                SnapshotStatus::Committed => st.mark_dropped(),
                SnapshotStatus::Dropped => {}
                actual => {
                    return Err(StoreError::InvalidState {
                        snapshot: id,
                        operation: "forget",
                        actual,
                    })
                }
            }
        }
        let removed = state.reap(id);
        info!(snapshot = %id.short_hex(), removed, "snapshot forgotten");
        Ok(())
    }

    /// A serializable summary of the whole version tree.
    pub fn describe(&self) -> StoreDescription {
        let state = self.lock();
        let snapshots = state
            .preorder()
            .iter()
            .map(|node| SnapshotDescription::of(node))
            .collect();
        StoreDescription {
            root: state.root,
            master: state.master,
            branches: state.branches.clone(),
            snapshots,
        }
    }

    /// A fresh block ID that is not reserved by the store.
    pub fn new_block_id(&self) -> BlockId {
        loop {
            let id = BlockId::random();
            if !id.is_reserved() {
                return id;
            }
        }
    }

    /// Give back one handle's reference to `node`.
    ///
    /// The last release of an uncommitted node drops it; a dropped node that
    /// is unreferenced and childless leaves the version tree.
    pub(crate) fn release(&self, node: &HistoryNode) {
        let mut state = self.lock();
        {
            let mut st = node.lock();
            debug_assert!(st.references > 0, "snapshot reference underflow");
            st.references = st.references.saturating_sub(1);
            if st.references > 0 {
                return;
            }
            if st.status.is_uncommitted() {
                warn!(
                    snapshot = %node.id().short_hex(),
                    status = %st.status,
                    "last handle released without commit; dropping snapshot"
                );
                st.mark_dropped();
            }
        }
        state.reap(node.id());
    }
}

impl std::fmt::Debug for BlockStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.lock();
        f.debug_struct("BlockStore")
            .field("root", &state.root)
            .field("master", &state.master)
            .field("snapshots", &state.history.len())
            .field("branches", &state.branches)
            .finish()
    }
}

impl StoreState {
    pub(crate) fn node(&self, id: SnapshotId) -> StoreResult<&Arc<HistoryNode>> {
        self.history
            .get(&id)
            .ok_or(StoreError::SnapshotNotFound(id))
    }

    pub(crate) fn branch_target(&self, name: &str) -> StoreResult<SnapshotId> {
        self.branches
            .get(name)
            .copied()
            .ok_or_else(|| StoreError::BranchNotFound(name.to_string()))
    }

    fn require_committed(&self, id: SnapshotId, operation: &'static str) -> StoreResult<()> {
        let actual = self.node(id)?.status();
        if actual != SnapshotStatus::Committed {
            return Err(StoreError::InvalidState {
                snapshot: id,
                operation,
                actual,
            });
        }
        Ok(())
    }

    /// Why `id` may not be dropped or elided, if it is protected.
    pub(crate) fn protection(&self, id: SnapshotId) -> Option<&'static str> {
        if id == self.root {
            Some("root snapshot")
        } else if id == self.master {
            Some("master head")
        } else if self.branches.values().any(|b| *b == id) {
            Some("branch target")
        } else {
            None
        }
    }

    pub(crate) fn ancestors(&self, id: SnapshotId) -> Vec<SnapshotId> {
        let mut out = Vec::new();
        let mut current = self.history.get(&id).and_then(|n| n.parent());
        while let Some(p) = current {
            out.push(p);
            current = self.history.get(&p).and_then(|n| n.parent());
        }
        out
    }

    /// Version-tree nodes in depth-first pre-order from the root.
    pub(crate) fn preorder(&self) -> Vec<Arc<HistoryNode>> {
        let mut out = Vec::with_capacity(self.history.len());
        let mut stack = vec![self.root];
        while let Some(id) = stack.pop() {
            let Some(node) = self.history.get(&id) else {
                continue;
            };
            stack.extend(node.children().into_iter().rev());
            out.push(Arc::clone(node));
        }
        out
    }

    /// Remove `id` and then its ancestors for as long as each is dropped,
    /// unreferenced and childless. Returns the number of nodes removed.
    pub(crate) fn reap(&mut self, id: SnapshotId) -> usize {
        let mut removed = 0;
        let mut next = Some(id);
        while let Some(id) = next {
            if id == self.root {
                break;
            }
            let Some(node) = self.history.get(&id).cloned() else {
                break;
            };
            let parent = {
                let st = node.lock();
                if st.status != SnapshotStatus::Dropped
                    || st.references > 0
                    || !st.children.is_empty()
                {
                    break;
                }
                st.parent
            };
            self.history.remove(&id);
            if let Some(p) = parent.and_then(|p| self.history.get(&p)) {
                p.lock().remove_child(id);
            }
            debug!(snapshot = %id.short_hex(), "snapshot removed from version tree");
            removed += 1;
            next = parent;
        }
        removed
    }
}
