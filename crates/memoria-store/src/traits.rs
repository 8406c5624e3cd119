use memoria_types::{BlockId, TypeTag};

use crate::error::StoreResult;
use crate::snapshot::{BlockHandle, Snapshot};

/// Block-level access used by container code built on top of the store.
///
/// All implementations must satisfy these invariants:
/// - A handle opened for update refers to a block no other snapshot can see.
/// - Blocks reachable from a committed snapshot are never modified.
/// - Removing a block with open handles defers the removal until the last
///   handle is released.
/// - The store never interprets block contents.
pub trait BlockIo: Send {
    /// Open a block for reading.
    fn get_block(&mut self, id: BlockId) -> StoreResult<BlockHandle>;

    /// Open a block for writing, copying it if it is shared.
    fn get_block_for_update(&mut self, id: BlockId) -> StoreResult<BlockHandle>;

    /// Allocate a zero-filled block of the given type and size.
    fn create_block(&mut self, tag: TypeTag, size: usize) -> StoreResult<BlockHandle>;

    /// Upgrade a handle to update mode.
    fn update_block(&mut self, handle: &mut BlockHandle) -> StoreResult<()>;

    fn remove_block(&mut self, id: BlockId) -> StoreResult<()>;

    fn release_block(&mut self, handle: BlockHandle) -> StoreResult<()>;

    fn resize_block(&mut self, handle: &mut BlockHandle, new_size: usize) -> StoreResult<()>;

    /// Look up a named container root.
    ///
    /// Returns `Ok(None)` if no root is registered under `name`.
    fn get_root(&self, name: &str) -> StoreResult<Option<BlockId>>;

    /// Register a named container root; a null ID removes it.
    fn set_root(&mut self, name: &str, id: BlockId) -> StoreResult<()>;

    /// A fresh block ID for container-managed keys.
    fn new_block_id(&self) -> BlockId;
}

impl BlockIo for Snapshot {
    fn get_block(&mut self, id: BlockId) -> StoreResult<BlockHandle> {
        Snapshot::get_block(self, id)
    }

    fn get_block_for_update(&mut self, id: BlockId) -> StoreResult<BlockHandle> {
        Snapshot::get_block_for_update(self, id)
    }

    fn create_block(&mut self, tag: TypeTag, size: usize) -> StoreResult<BlockHandle> {
        Snapshot::create_block(self, tag, size)
    }

    fn update_block(&mut self, handle: &mut BlockHandle) -> StoreResult<()> {
        Snapshot::update_block(self, handle)
    }

    fn remove_block(&mut self, id: BlockId) -> StoreResult<()> {
        Snapshot::remove_block(self, id)
    }

    fn release_block(&mut self, handle: BlockHandle) -> StoreResult<()> {
        Snapshot::release_block(self, handle)
    }

    fn resize_block(&mut self, handle: &mut BlockHandle, new_size: usize) -> StoreResult<()> {
        Snapshot::resize_block(self, handle, new_size)
    }

    fn get_root(&self, name: &str) -> StoreResult<Option<BlockId>> {
        Snapshot::get_root(self, name)
    }

    fn set_root(&mut self, name: &str, id: BlockId) -> StoreResult<()> {
        Snapshot::set_root(self, name, id)
    }

    fn new_block_id(&self) -> BlockId {
        self.store().new_block_id()
    }
}
