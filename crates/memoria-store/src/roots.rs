//! Named container roots.
//!
//! Each snapshot can map names to block IDs through a directory kept in the
//! reserved block [`BlockId::ROOT_DIRECTORY`]. The directory is an ordinary
//! block, so it is versioned and copied on write like any other.

use std::collections::BTreeMap;
use std::sync::Arc;

use memoria_tree::Block;
use memoria_types::{BlockId, TypeTag};
use tracing::debug;

use crate::error::StoreResult;
use crate::names::validate_container_name;
use crate::snapshot::Snapshot;

type RootDirectory = BTreeMap<String, BlockId>;

impl Snapshot {
    /// The block registered under `name`, if any.
    pub fn get_root(&self, name: &str) -> StoreResult<Option<BlockId>> {
        Ok(self.roots()?.get(name).copied())
    }

    /// Every registered root, by name.
    pub fn roots(&self) -> StoreResult<RootDirectory> {
        match self.peek_block(&BlockId::ROOT_DIRECTORY) {
            Some(block) => Ok(bincode::deserialize(&block.read())?),
            None => Ok(RootDirectory::new()),
        }
    }

    /// Register `id` under `name`. A null `id` removes the entry.
    pub fn set_root(&mut self, name: &str, id: BlockId) -> StoreResult<()> {
        self.require_active("set root")?;
        validate_container_name(name)?;
        let mut roots = self.roots()?;
        let changed = if id.is_null() {
            roots.remove(name).is_some()
        } else {
            roots.insert(name.to_string(), id) != Some(id)
        };
        if !changed {
            return Ok(());
        }

        let bytes = bincode::serialize(&roots)?;
        if self.peek_block(&BlockId::ROOT_DIRECTORY).is_some() {
            let block = self.open_for_update(BlockId::ROOT_DIRECTORY)?;
            block.replace_data(bytes);
        } else {
            self.install_block(Arc::new(Block::new(
                BlockId::ROOT_DIRECTORY,
                BlockId::random(),
                TypeTag::root_directory(),
                bytes,
            )))?;
        }
        debug!(snapshot = %self.id().short_hex(), root = name, block = %id.short_hex(), "root set");
        Ok(())
    }
}
