//! Working views over version-tree nodes.
//!
//! A [`Snapshot`] carries its own copy of the node's tree. On an active
//! snapshot every write lands in that private tree, which is published into
//! the node only by [`Snapshot::commit`]. Blocks are opened through a
//! per-snapshot pool that tracks whether each one is being read, updated or
//! removed.

use std::collections::HashMap;
use std::ops::{Deref, DerefMut};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, RwLockReadGuard, RwLockWriteGuard};

use memoria_tree::{Block, PersistentTree};
use memoria_types::{BlockId, SnapshotId, SnapshotStatus, TypeTag};
use tracing::{debug, info};

use crate::codec::BlockWalker;
use crate::describe::SnapshotDescription;
use crate::error::{StoreError, StoreResult};
use crate::history::HistoryNode;
use crate::store::BlockStore;

/// How a snapshot currently holds an open block.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum BlockState {
    /// Shared with other snapshots; read-only.
    Read,
    /// Privately owned by this snapshot; writable in place.
    Update,
    /// Marked for removal once the last handle is released.
    Delete,
}

/// A caller's reference to an open block.
pub struct BlockHandle {
    block: Arc<Block>,
    state: BlockState,
    snapshot: SnapshotId,
    writable: Arc<AtomicBool>,
}

impl BlockHandle {
    /// Logical key of the block.
    pub fn id(&self) -> BlockId {
        self.block.id()
    }

    /// Identity of the physical copy this handle points at.
    pub fn uid(&self) -> BlockId {
        self.block.uid()
    }

    pub fn tag(&self) -> TypeTag {
        self.block.tag()
    }

    pub fn size(&self) -> usize {
        self.block.size()
    }

    pub fn state(&self) -> BlockState {
        self.state
    }

    pub fn snapshot(&self) -> SnapshotId {
        self.snapshot
    }

    pub fn data(&self) -> RwLockReadGuard<'_, Vec<u8>> {
        self.block.read()
    }

    pub fn to_vec(&self) -> Vec<u8> {
        self.block.to_vec()
    }

    /// Write access to the content. Only handles in [`BlockState::Update`]
    /// on a still-writable snapshot may write.
    pub fn data_mut(&self) -> StoreResult<BlockDataMut<'_>> {
        if self.state != BlockState::Update || !self.writable.load(Ordering::Acquire) {
            return Err(StoreError::ReadOnlyBlock {
                block: self.block.id(),
            });
        }
        Ok(BlockDataMut(self.block.write()))
    }
}

impl std::fmt::Debug for BlockHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BlockHandle")
            .field("id", &self.block.id())
            .field("uid", &self.block.uid())
            .field("state", &self.state)
            .finish()
    }
}

/// Fixed-length mutable view of a block's content.
pub struct BlockDataMut<'a>(RwLockWriteGuard<'a, Vec<u8>>);

impl Deref for BlockDataMut<'_> {
    type Target = [u8];

    fn deref(&self) -> &[u8] {
        &self.0
    }
}

impl DerefMut for BlockDataMut<'_> {
    fn deref_mut(&mut self) -> &mut [u8] {
        &mut self.0
    }
}

struct OpenBlock {
    block: Arc<Block>,
    state: BlockState,
    handles: usize,
}

/// Holds one reference on a history node and gives it back on drop.
struct NodeLease {
    store: BlockStore,
    node: Arc<HistoryNode>,
    writable: Arc<AtomicBool>,
}

impl Drop for NodeLease {
    fn drop(&mut self) {
        self.writable.store(false, Ordering::Release);
        self.store.release(&self.node);
    }
}

/// A bound view over one snapshot of a [`BlockStore`].
///
/// Handles returned by [`BlockStore::find`], [`BlockStore::master`] and
/// [`BlockStore::find_branch`] are read-only views of committed snapshots.
/// [`Snapshot::branch`] returns the single writable handle of a new active
/// snapshot.
pub struct Snapshot {
    lease: NodeLease,
    id: SnapshotId,
    tree: PersistentTree,
    pool: HashMap<BlockId, OpenBlock>,
}

impl Snapshot {
    pub(crate) fn bind(
        store: BlockStore,
        node: Arc<HistoryNode>,
        tree: PersistentTree,
        writable: bool,
    ) -> Self {
        let id = node.id();
        Self {
            lease: NodeLease {
                store,
                node,
                writable: Arc::new(AtomicBool::new(writable)),
            },
            id,
            tree,
            pool: HashMap::new(),
        }
    }

    pub fn id(&self) -> SnapshotId {
        self.id
    }

    pub fn store(&self) -> &BlockStore {
        &self.lease.store
    }

    pub fn status(&self) -> SnapshotStatus {
        self.lease.node.status()
    }

    /// Whether handles opened for update may currently write.
    pub fn is_writable(&self) -> bool {
        self.lease.writable.load(Ordering::Acquire)
    }

    pub fn metadata(&self) -> String {
        self.lease.node.metadata()
    }

    pub fn parent_id(&self) -> Option<SnapshotId> {
        self.lease.node.parent()
    }

    pub fn children(&self) -> Vec<SnapshotId> {
        self.lease.node.children()
    }

    pub fn describe(&self) -> SnapshotDescription {
        SnapshotDescription::of(&self.lease.node)
    }

    /// Keys of the container blocks visible in this view, in order.
    pub fn block_ids(&self) -> Vec<BlockId> {
        self.tree
            .keys()
            .filter(|k| !k.is_reserved() && !self.is_pending_delete(k))
            .collect()
    }

    pub fn block_count(&self) -> usize {
        self.block_ids().len()
    }

    // -----------------------------------------------------------------------
    // Preconditions
    // -----------------------------------------------------------------------

    fn require_readable(&self, operation: &'static str) -> StoreResult<()> {
        let actual = self.status();
        if !actual.is_readable() {
            return Err(StoreError::InvalidState {
                snapshot: self.id,
                operation,
                actual,
            });
        }
        Ok(())
    }

    pub(crate) fn require_active(&self, operation: &'static str) -> StoreResult<()> {
        let actual = self.status();
        if actual != SnapshotStatus::Active {
            return Err(StoreError::InvalidState {
                snapshot: self.id,
                operation,
                actual,
            });
        }
        Ok(())
    }

    fn check_size(&self, size: usize) -> StoreResult<()> {
        let max = self.lease.store.config().max_block_size;
        if size > max {
            return Err(StoreError::ResourceExhausted(format!(
                "block of {size} bytes exceeds the {max}-byte limit"
            )));
        }
        Ok(())
    }

    fn not_found(&self, block: BlockId) -> StoreError {
        StoreError::BlockNotFound {
            snapshot: self.id,
            block,
        }
    }

    /// Reserved keys belong to the store and are not open to container code.
    fn check_key(&self, id: BlockId) -> StoreResult<()> {
        if id.is_reserved() {
            return Err(self.not_found(id));
        }
        Ok(())
    }

    fn is_pending_delete(&self, id: &BlockId) -> bool {
        self.pool
            .get(id)
            .is_some_and(|open| open.state == BlockState::Delete)
    }

    fn handle(&self, block: Arc<Block>, state: BlockState) -> BlockHandle {
        BlockHandle {
            block,
            state,
            snapshot: self.id,
            writable: Arc::clone(&self.lease.writable),
        }
    }

    // -----------------------------------------------------------------------
    // Block access
    // -----------------------------------------------------------------------

    /// Open a block for reading.
    ///
    /// The handle is in [`BlockState::Update`] if this active snapshot already
    /// owns the block, and in [`BlockState::Read`] otherwise.
    pub fn get_block(&mut self, id: BlockId) -> StoreResult<BlockHandle> {
        self.require_readable("read block")?;
        self.check_key(id)?;
        if let Some(open) = self.pool.get_mut(&id) {
            if open.state == BlockState::Delete {
                return Err(self.not_found(id));
            }
            open.handles += 1;
            let (block, state) = (Arc::clone(&open.block), open.state);
            return Ok(self.handle(block, state));
        }

        let entry = self.tree.find(&id).ok_or_else(|| self.not_found(id))?;
        let state = if self.is_writable() && entry.owner == self.id {
            BlockState::Update
        } else {
            BlockState::Read
        };
        let block = entry.block.shared();
        self.pool.insert(
            id,
            OpenBlock {
                block: Arc::clone(&block),
                state,
                handles: 1,
            },
        );
        Ok(self.handle(block, state))
    }

    /// Open a block for writing, copying it first if another snapshot can
    /// see it.
    ///
    /// The copy keeps the logical key and gets a new uid; the original stays
    /// untouched for every other snapshot.
    pub fn get_block_for_update(&mut self, id: BlockId) -> StoreResult<BlockHandle> {
        self.check_key(id)?;
        let block = self.open_for_update(id)?;
        if let Some(open) = self.pool.get_mut(&id) {
            open.handles += 1;
        }
        Ok(self.handle(block, BlockState::Update))
    }

    /// Bring `handle` into [`BlockState::Update`], copying the block if needed.
    pub fn update_block(&mut self, handle: &mut BlockHandle) -> StoreResult<()> {
        if handle.snapshot != self.id {
            return Err(self.not_found(handle.id()));
        }
        if handle.state == BlockState::Update && self.is_writable() {
            return Ok(());
        }
        handle.block = self.open_for_update(handle.id())?;
        handle.state = BlockState::Update;
        Ok(())
    }

    /// Make `id` privately owned and recorded as `Update` in the pool,
    /// without counting a handle.
    pub(crate) fn open_for_update(&mut self, id: BlockId) -> StoreResult<Arc<Block>> {
        self.require_active("update block")?;
        let (block, state) = match self.pool.get(&id) {
            Some(open) if open.state == BlockState::Delete => return Err(self.not_found(id)),
            Some(open) => (Arc::clone(&open.block), open.state),
            None => {
                let entry = self.tree.find(&id).ok_or_else(|| self.not_found(id))?;
                let state = if entry.owner == self.id {
                    BlockState::Update
                } else {
                    BlockState::Read
                };
                (entry.block.shared(), state)
            }
        };

        let block = match state {
            BlockState::Read => self.fork_block(&block)?,
            _ => block,
        };
        let open = self.pool.entry(id).or_insert_with(|| OpenBlock {
            block: Arc::clone(&block),
            state: BlockState::Update,
            handles: 0,
        });
        open.block = Arc::clone(&block);
        open.state = BlockState::Update;
        Ok(block)
    }

    fn fork_block(&mut self, block: &Arc<Block>) -> StoreResult<Arc<Block>> {
        let copy = Arc::new(block.fork(BlockId::random()));
        let ctx = self.lease.store.cow_context(self.id)?;
        self.tree.assign(&ctx, copy.id(), Arc::clone(&copy))?;
        debug!(
            snapshot = %self.id.short_hex(),
            block = %copy.id().short_hex(),
            from = %block.uid().short_hex(),
            to = %copy.uid().short_hex(),
            "block copied for update"
        );
        Ok(copy)
    }

    /// Allocate a zero-filled block of `size` bytes under a fresh key.
    pub fn create_block(&mut self, tag: TypeTag, size: usize) -> StoreResult<BlockHandle> {
        self.require_active("create block")?;
        self.check_size(size)?;
        self.lease.store.registry().get(&tag)?;

        let id = self.lease.store.new_block_id();
        let block = Arc::new(Block::zeroed(id, BlockId::random(), tag, size));
        self.install_block(Arc::clone(&block))?;
        self.pool.insert(
            id,
            OpenBlock {
                block: Arc::clone(&block),
                state: BlockState::Update,
                handles: 1,
            },
        );
        debug!(snapshot = %self.id.short_hex(), block = %id.short_hex(), size, "block created");
        Ok(self.handle(block, BlockState::Update))
    }

    /// Put `block` into this snapshot's tree under its own key.
    pub(crate) fn install_block(&mut self, block: Arc<Block>) -> StoreResult<()> {
        let ctx = self.lease.store.cow_context(self.id)?;
        self.tree.assign(&ctx, block.id(), block)?;
        Ok(())
    }

    /// Remove a block. An open block is only marked and disappears when its
    /// last handle is released (or at commit).
    pub fn remove_block(&mut self, id: BlockId) -> StoreResult<()> {
        self.require_active("remove block")?;
        self.check_key(id)?;
        if let Some(open) = self.pool.get_mut(&id) {
            if open.state == BlockState::Delete {
                return Err(self.not_found(id));
            }
            if open.handles > 0 {
                open.state = BlockState::Delete;
                return Ok(());
            }
            self.pool.remove(&id);
        }
        let ctx = self.lease.store.cow_context(self.id)?;
        if self.tree.remove(&ctx, &id)?.is_none() {
            return Err(self.not_found(id));
        }
        debug!(snapshot = %self.id.short_hex(), block = %id.short_hex(), "block removed");
        Ok(())
    }

    /// Return a handle to the pool.
    pub fn release_block(&mut self, handle: BlockHandle) -> StoreResult<()> {
        if handle.snapshot != self.id {
            return Err(self.not_found(handle.id()));
        }
        let id = handle.id();
        let Some(open) = self.pool.get_mut(&id) else {
            return Ok(());
        };
        open.handles = open.handles.saturating_sub(1);
        if open.handles > 0 {
            return Ok(());
        }
        if open.state != BlockState::Delete {
            self.pool.remove(&id);
            return Ok(());
        }
        // Outside the active state the tree is frozen; commit applies the mark.
        if self.status() != SnapshotStatus::Active {
            return Ok(());
        }
        self.pool.remove(&id);
        let ctx = self.lease.store.cow_context(self.id)?;
        self.tree.remove(&ctx, &id)?;
        debug!(snapshot = %self.id.short_hex(), block = %id.short_hex(), "block removed");
        Ok(())
    }

    /// Resize the block behind `handle` through its type's codec.
    pub fn resize_block(&mut self, handle: &mut BlockHandle, new_size: usize) -> StoreResult<()> {
        self.require_active("resize block")?;
        self.check_size(new_size)?;
        self.update_block(handle)?;
        let codec = Arc::clone(self.lease.store.registry().get(&handle.tag())?);
        let resized = codec.resize(&handle.block.read(), new_size)?;
        handle.block.replace_data(resized);
        Ok(())
    }

    /// Describe every block in this view to `walker`.
    pub fn walk_blocks(&self, walker: &mut dyn BlockWalker) -> StoreResult<()> {
        self.require_readable("walk")?;
        let registry = self.lease.store.registry();
        for entry in self.tree.iter() {
            if self.is_pending_delete(&entry.key) {
                continue;
            }
            registry.get(&entry.block.tag())?.describe(&entry.block, walker);
        }
        Ok(())
    }

    /// Current content of `id` as seen by this view, bypassing the pool.
    pub(crate) fn peek_block(&self, id: &BlockId) -> Option<Arc<Block>> {
        if self.is_pending_delete(id) {
            return None;
        }
        self.tree.get(id)
    }

    // -----------------------------------------------------------------------
    // Lifecycle
    // -----------------------------------------------------------------------

    /// Publish this snapshot's tree and freeze it.
    pub fn commit(&mut self) -> StoreResult<()> {
        let actual = self.status();
        if !actual.is_uncommitted() {
            return Err(StoreError::InvalidState {
                snapshot: self.id,
                operation: "commit",
                actual,
            });
        }

        let pending: Vec<BlockId> = self
            .pool
            .iter()
            .filter(|(_, open)| open.state == BlockState::Delete)
            .map(|(id, _)| *id)
            .collect();
        let mut tree = self.tree.clone();
        if !pending.is_empty() {
            let ctx = self.lease.store.cow_context(self.id)?;
            for id in &pending {
                tree.remove(&ctx, id)?;
            }
        }

        {
            let mut st = self.lease.node.lock();
            if !st.status.is_uncommitted() {
                return Err(StoreError::InvalidState {
                    snapshot: self.id,
                    operation: "commit",
                    actual: st.status,
                });
            }
            st.tree = tree.clone();
            st.status = SnapshotStatus::Committed;
        }
        self.tree = tree;

        self.lease.writable.store(false, Ordering::Release);
        self.pool.retain(|_, open| open.state != BlockState::Delete);
        for open in self.pool.values_mut() {
            open.state = BlockState::Read;
        }
        info!(
            snapshot = %self.id.short_hex(),
            blocks = self.tree.len(),
            removed = pending.len(),
            "snapshot committed"
        );
        Ok(())
    }

    /// Start a new active snapshot whose initial contents are this one's.
    pub fn branch(&self) -> StoreResult<Snapshot> {
        let store = &self.lease.store;
        let child_id = SnapshotId::random();
        let mut state = store.lock();
        let tree = {
            let mut st = self.lease.node.lock();
            if st.status != SnapshotStatus::Committed {
                return Err(StoreError::InvalidState {
                    snapshot: self.id,
                    operation: "branch",
                    actual: st.status,
                });
            }
            st.children.push(child_id);
            st.tree.clone()
        };
        let child = Arc::new(HistoryNode::new(
            child_id,
            Some(self.id),
            SnapshotStatus::Active,
            tree.clone(),
        ));
        child.lock().references = 1;
        state.history.insert(child_id, Arc::clone(&child));
        drop(state);

        info!(
            parent = %self.id.short_hex(),
            child = %child_id.short_hex(),
            "snapshot branched"
        );
        Ok(Snapshot::bind(store.clone(), child, tree, true))
    }

    /// Mark this snapshot dropped. It leaves the version tree once its last
    /// handle is gone and it has no children.
    pub fn drop(&mut self) -> StoreResult<()> {
        {
            let state = self.lease.store.lock();
            if let Some(reason) = state.protection(self.id) {
                return Err(StoreError::Protected {
                    snapshot: self.id,
                    reason,
                });
            }
            let mut st = self.lease.node.lock();
            if st.status == SnapshotStatus::Dropped {
                return Err(StoreError::InvalidState {
                    snapshot: self.id,
                    operation: "drop",
                    actual: st.status,
                });
            }
            st.mark_dropped();
        }
        self.lease.writable.store(false, Ordering::Release);
        self.pool.clear();
        self.tree = PersistentTree::new();
        info!(snapshot = %self.id.short_hex(), "snapshot dropped");
        Ok(())
    }

    /// Freeze the data of an active snapshot without committing it.
    pub fn lock_data(&mut self) -> StoreResult<()> {
        let mut st = self.lease.node.lock();
        if st.status != SnapshotStatus::Active {
            return Err(StoreError::InvalidState {
                snapshot: self.id,
                operation: "lock data",
                actual: st.status,
            });
        }
        st.status = SnapshotStatus::DataLocked;
        drop(st);
        self.lease.writable.store(false, Ordering::Release);
        debug!(snapshot = %self.id.short_hex(), "snapshot data locked");
        Ok(())
    }

    pub fn set_metadata(&mut self, metadata: impl Into<String>) -> StoreResult<()> {
        self.require_active("set metadata")?;
        self.lease.node.lock().metadata = metadata.into();
        Ok(())
    }

    pub fn set_as_master(&self) -> StoreResult<()> {
        self.lease.store.set_master(self.id)
    }

    pub fn set_as_branch(&self, name: &str) -> StoreResult<()> {
        self.lease.store.set_branch(name, self.id)
    }
}

impl std::fmt::Debug for Snapshot {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Snapshot")
            .field("id", &self.id)
            .field("writable", &self.is_writable())
            .field("blocks", &self.tree.len())
            .field("open", &self.pool.len())
            .finish()
    }
}
