use std::fmt;
use std::ops::Deref;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};

use memoria_types::{BlockId, TypeTag};

/// An opaque, typed payload stored in a persistent tree.
///
/// `id` is the logical key the block lives under; `uid` names this physical
/// copy of the bytes. Forking a block for copy-on-write keeps `id` and draws a
/// new `uid`.
///
/// The content bytes sit behind a lock because a block that is privately
/// owned by an active snapshot is edited in place. Blocks reachable from a
/// committed snapshot are never written.
pub struct Block {
    id: BlockId,
    uid: BlockId,
    tag: TypeTag,
    data: RwLock<Vec<u8>>,
    references: AtomicUsize,
}

impl Block {
    pub fn new(id: BlockId, uid: BlockId, tag: TypeTag, data: Vec<u8>) -> Self {
        Self {
            id,
            uid,
            tag,
            data: RwLock::new(data),
            references: AtomicUsize::new(0),
        }
    }

    /// A zero-filled block of `size` bytes.
    pub fn zeroed(id: BlockId, uid: BlockId, tag: TypeTag, size: usize) -> Self {
        Self::new(id, uid, tag, vec![0u8; size])
    }

    pub fn id(&self) -> BlockId {
        self.id
    }

    pub fn uid(&self) -> BlockId {
        self.uid
    }

    pub fn tag(&self) -> TypeTag {
        self.tag
    }

    /// In-memory size of the content in bytes.
    pub fn size(&self) -> usize {
        self.read().len()
    }

    /// Number of live leaf entries referencing this block.
    pub fn references(&self) -> usize {
        self.references.load(Ordering::Acquire)
    }

    pub fn read(&self) -> RwLockReadGuard<'_, Vec<u8>> {
        self.data.read().expect("lock poisoned")
    }

    /// Write access to the content.
    ///
    /// Callers must hold the block exclusively for update; the tree itself
    /// never calls this.
    pub fn write(&self) -> RwLockWriteGuard<'_, Vec<u8>> {
        self.data.write().expect("lock poisoned")
    }

    pub fn to_vec(&self) -> Vec<u8> {
        self.read().clone()
    }

    /// Replace the content wholesale (used by resize).
    pub fn replace_data(&self, data: Vec<u8>) {
        *self.write() = data;
    }

    /// A private copy of this block under a new payload uid.
    ///
    /// The copy starts with no references.
    pub fn fork(&self, uid: BlockId) -> Block {
        Block::new(self.id, uid, self.tag, self.to_vec())
    }
}

impl fmt::Debug for Block {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Block")
            .field("id", &self.id)
            .field("uid", &self.uid)
            .field("tag", &self.tag)
            .field("size", &self.size())
            .field("references", &self.references())
            .finish()
    }
}

/// A counted reference from a leaf entry to a block.
///
/// Creating, cloning and dropping a `BlockRef` keeps [`Block::references`]
/// in step with the number of leaf entries that point at the block.
pub struct BlockRef(Arc<Block>);

impl BlockRef {
    pub fn new(block: Arc<Block>) -> Self {
        block.references.fetch_add(1, Ordering::AcqRel);
        Self(block)
    }

    /// The shared block, without touching the leaf reference count.
    pub fn shared(&self) -> Arc<Block> {
        Arc::clone(&self.0)
    }

    /// Whether both references point at the same physical block.
    pub fn same_block(&self, other: &Arc<Block>) -> bool {
        Arc::ptr_eq(&self.0, other)
    }
}

impl Clone for BlockRef {
    fn clone(&self) -> Self {
        Self::new(Arc::clone(&self.0))
    }
}

impl Drop for BlockRef {
    fn drop(&mut self) {
        let previous = self.0.references.fetch_sub(1, Ordering::AcqRel);
        debug_assert!(previous > 0, "block reference count underflow");
    }
}

impl Deref for BlockRef {
    type Target = Block;

    fn deref(&self) -> &Block {
        &self.0
    }
}

impl fmt::Debug for BlockRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "BlockRef({:?}, uid={})", self.0.id, self.0.uid.short_hex())
    }
}
