//! Multi-version block storage for Memoria.
//!
//! A [`BlockStore`] keeps a tree of snapshots. Every snapshot sees a
//! persistent copy-on-write map from block IDs to blocks; a child starts out
//! sharing all of its parent's blocks and copies a block (and the tree path
//! to it) only when it first writes to it. Container code works against the
//! [`BlockIo`] surface of a [`Snapshot`] and never sees other versions.
//!
//! # Lifecycle
//!
//! - [`BlockStore::create`] -- empty store whose root snapshot is committed
//! - [`Snapshot::branch`] -- new active child of a committed snapshot
//! - [`Snapshot::commit`] -- freeze an active snapshot so it can be branched
//! - [`Snapshot::drop`] / [`BlockStore::forget_snapshot`] -- mark for removal
//! - [`BlockStore::pack`] -- delete dropped snapshots and splice out chains
//! - [`BlockStore::store`] / [`BlockStore::load`] -- `MEMORIA` record streams
//!
//! # Design Rules
//!
//! 1. Blocks reachable from a committed snapshot are never modified.
//! 2. An active snapshot has exactly one writable handle.
//! 3. A block's reference count equals the number of tree leaves pointing at it.
//! 4. The store lock is taken before any snapshot lock.
//! 5. The store never interprets block contents; codecs do.

pub mod codec;
pub mod compact;
pub mod config;
pub mod describe;
pub mod error;
pub mod history;
pub mod names;
pub mod persist;
pub mod roots;
pub mod snapshot;
pub mod store;
pub mod traits;

// Re-export primary types at crate root for ergonomic imports.
pub use codec::{BlockCodec, BlockHeader, BlockWalker, RawCodec, TextWalker, TypeRegistry};
pub use compact::PackReport;
pub use config::StoreConfig;
pub use describe::{SnapshotDescription, StoreDescription};
pub use error::{ErrorKind, StoreError, StoreResult};
pub use history::HistoryNode;
pub use names::{validate_branch_name, validate_container_name};
pub use snapshot::{BlockDataMut, BlockHandle, BlockState, Snapshot};
pub use store::BlockStore;
pub use traits::BlockIo;

pub use memoria_pack::Endian;
pub use memoria_types::{BlockId, NodeId, SnapshotId, SnapshotStatus, TypeTag};

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::thread;

    use super::*;

    fn tag() -> TypeTag {
        TypeTag::named("counter", "cell")
    }

    fn registry() -> Arc<TypeRegistry> {
        Arc::new(TypeRegistry::new().with_raw(tag()))
    }

    fn store() -> BlockStore {
        let config = StoreConfig {
            tree_fanout: 8,
            ..StoreConfig::default()
        };
        BlockStore::create_with_config(config, registry()).unwrap()
    }

    fn fill(snap: &mut Snapshot, count: usize) -> Vec<BlockId> {
        (0..count)
            .map(|i| {
                let h = snap.create_block(tag(), 8).unwrap();
                h.data_mut().unwrap().copy_from_slice(&(i as u64).to_le_bytes());
                let id = h.id();
                snap.release_block(h).unwrap();
                id
            })
            .collect()
    }

    fn value(snap: &mut Snapshot, id: BlockId) -> u64 {
        let h = snap.get_block(id).unwrap();
        let mut bytes = [0u8; 8];
        bytes.copy_from_slice(&h.data());
        snap.release_block(h).unwrap();
        u64::from_le_bytes(bytes)
    }

    // -----------------------------------------------------------------------
    // End-to-end scenarios
    // -----------------------------------------------------------------------

    #[test]
    fn committed_root_is_visible_through_master() {
        let store = store();
        let mut snap = store.master().unwrap().branch().unwrap();
        let ids = fill(&mut snap, 1);
        snap.set_root("ctr1", ids[0]).unwrap();
        snap.commit().unwrap();
        snap.set_as_master().unwrap();

        let master = store.find(store.master_id()).unwrap();
        assert_eq!(master.get_root("ctr1").unwrap(), Some(ids[0]));
    }

    #[test]
    fn committed_root_is_inherited_by_branches() {
        let store = store();
        let mut snap = store.master().unwrap().branch().unwrap();
        let h = snap.create_block(tag(), 128).unwrap();
        let id = h.id();
        snap.release_block(h).unwrap();
        snap.set_root("ctr1", id).unwrap();
        snap.commit().unwrap();

        let next = snap.branch().unwrap();
        assert_eq!(next.status(), SnapshotStatus::Active);
        assert_eq!(next.get_root("ctr1").unwrap(), Some(id));
    }

    #[test]
    fn siblings_resolve_the_same_root_name_independently() {
        let store = store();
        let parent = store.master().unwrap();
        let mut left = parent.branch().unwrap();
        let mut right = parent.branch().unwrap();
        let l = fill(&mut left, 1)[0];
        let r = fill(&mut right, 1)[0];
        left.set_root("ctr1", l).unwrap();
        right.set_root("ctr1", r).unwrap();
        left.commit().unwrap();
        right.commit().unwrap();

        assert_eq!(left.get_root("ctr1").unwrap(), Some(l));
        assert_eq!(right.get_root("ctr1").unwrap(), Some(r));
        assert_eq!(parent.get_root("ctr1").unwrap(), None);
    }

    #[test]
    fn child_write_leaves_parent_untouched() {
        let store = store();
        let mut parent = store.master().unwrap().branch().unwrap();
        let ids = fill(&mut parent, 1);
        parent.commit().unwrap();

        let mut child = parent.branch().unwrap();
        let before = child.get_block(ids[0]).unwrap();
        let after = child.get_block_for_update(ids[0]).unwrap();
        assert_ne!(before.uid(), after.uid());
        after.data_mut().unwrap().copy_from_slice(&99u64.to_le_bytes());

        assert_eq!(value(&mut parent, ids[0]), 0);
        assert_eq!(value(&mut child, ids[0]), 99);
    }

    #[test]
    fn root_survives_store_and_load() {
        let store = store();
        let mut snap = store.master().unwrap().branch().unwrap();
        let ids = fill(&mut snap, 1);
        snap.set_root("ctr1", ids[0]).unwrap();
        snap.commit().unwrap();
        snap.set_as_master().unwrap();
        drop(snap);

        let bytes = store.store(Vec::new()).unwrap();
        let loaded = BlockStore::load(bytes.as_slice(), registry()).unwrap();
        let master = loaded.find(loaded.master_id()).unwrap();
        assert_eq!(master.get_root("ctr1").unwrap(), Some(ids[0]));
    }

    #[test]
    fn damaged_checksum_returns_no_store() {
        let store = store();
        let mut snap = store.master().unwrap().branch().unwrap();
        fill(&mut snap, 3);
        snap.commit().unwrap();

        let mut bytes = store.store(Vec::new()).unwrap();
        let last = bytes.len() - 1;
        bytes[last] = bytes[last].wrapping_add(1);
        let err = BlockStore::load(bytes.as_slice(), registry()).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::ChecksumMismatch);
    }

    #[test]
    fn truncated_stream_is_rejected() {
        let store = store();
        let mut snap = store.master().unwrap().branch().unwrap();
        fill(&mut snap, 3);
        snap.commit().unwrap();
        let bytes = store.store(Vec::new()).unwrap();

        let cut = &bytes[..bytes.len() - 4];
        let err = BlockStore::load(cut, registry()).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Format);
    }

    // -----------------------------------------------------------------------
    // Isolation and sharing
    // -----------------------------------------------------------------------

    #[test]
    fn siblings_do_not_see_each_other() {
        let store = store();
        let mut base = store.master().unwrap().branch().unwrap();
        let ids = fill(&mut base, 40);
        base.commit().unwrap();

        let mut left = base.branch().unwrap();
        let mut right = base.branch().unwrap();
        left.remove_block(ids[0]).unwrap();
        let h = right.get_block_for_update(ids[1]).unwrap();
        h.data_mut().unwrap().copy_from_slice(&7u64.to_le_bytes());
        right.release_block(h).unwrap();
        let extra = fill(&mut right, 1)[0];

        assert_eq!(left.block_count(), 39);
        assert_eq!(right.block_count(), 41);
        assert_eq!(base.block_count(), 40);
        assert_eq!(value(&mut left, ids[1]), 1);
        assert_eq!(value(&mut right, ids[1]), 7);
        assert!(left.get_block(extra).is_err());
        assert_eq!(value(&mut right, ids[0]), 0);
    }

    #[test]
    fn unchanged_blocks_are_shared_by_reference() {
        let store = store();
        let mut base = store.master().unwrap().branch().unwrap();
        // Few enough blocks to sit in a single leaf.
        let ids = fill(&mut base, 5);
        base.commit().unwrap();
        let shared = base.get_block(ids[0]).unwrap();
        let before = base.peek_block(&ids[0]).unwrap().references();

        let mut child = base.branch().unwrap();
        let h = child.get_block_for_update(ids[1]).unwrap();
        child.release_block(h).unwrap();
        let seen = child.get_block(ids[0]).unwrap();
        assert_eq!(seen.uid(), shared.uid());
        // The child copied the leaf, adding one reference to each neighbour.
        assert_eq!(base.peek_block(&ids[0]).unwrap().references(), before + 1);

        drop(seen);
        drop(child);
        assert_eq!(base.peek_block(&ids[0]).unwrap().references(), before);
    }

    #[test]
    fn dropping_every_snapshot_frees_blocks() {
        let store = store();
        let mut base = store.master().unwrap().branch().unwrap();
        let ids = fill(&mut base, 10);
        base.commit().unwrap();
        let block = base.peek_block(&ids[0]).unwrap();
        assert!(block.references() >= 1);

        store.set_branch("base", base.id()).unwrap();
        store.remove_branch("base").unwrap();
        base.drop().unwrap();
        drop(base);
        assert_eq!(block.references(), 0);
        assert_eq!(store.snapshot_ids(), vec![store.root_id()]);
    }

    // -----------------------------------------------------------------------
    // Concurrency
    // -----------------------------------------------------------------------

    #[test]
    fn parallel_branches_from_one_parent() {
        let store = store();
        let mut base = store.master().unwrap().branch().unwrap();
        let ids = fill(&mut base, 16);
        base.commit().unwrap();
        let base_id = base.id();

        let workers: Vec<_> = (0..4u64)
            .map(|n| {
                let store = store.clone();
                let ids = ids.clone();
                thread::spawn(move || {
                    let mut snap = store.find(base_id).unwrap().branch().unwrap();
                    for id in &ids {
                        let h = snap.get_block_for_update(*id).unwrap();
                        h.data_mut().unwrap().copy_from_slice(&(100 + n).to_le_bytes());
                        snap.release_block(h).unwrap();
                    }
                    snap.commit().unwrap();
                    snap.id()
                })
            })
            .collect();
        let children: Vec<SnapshotId> = workers.into_iter().map(|w| w.join().unwrap()).collect();

        assert_eq!(base.children().len(), 4);
        for (n, id) in children.iter().enumerate() {
            let mut snap = store.find(*id).unwrap();
            for block in &ids {
                assert_eq!(value(&mut snap, *block), 100 + n as u64);
            }
        }
        for (i, block) in ids.iter().enumerate() {
            assert_eq!(value(&mut base, *block), i as u64);
        }
    }

    #[test]
    fn readers_share_a_committed_snapshot_across_threads() {
        let store = store();
        let mut base = store.master().unwrap().branch().unwrap();
        let ids = fill(&mut base, 8);
        base.commit().unwrap();
        base.set_as_master().unwrap();

        let readers: Vec<_> = (0..4)
            .map(|_| {
                let store = store.clone();
                let ids = ids.clone();
                thread::spawn(move || {
                    let mut snap = store.master().unwrap();
                    ids.iter().map(|id| value(&mut snap, *id)).sum::<u64>()
                })
            })
            .collect();
        for r in readers {
            assert_eq!(r.join().unwrap(), (0..8).sum::<u64>());
        }
        assert_eq!(store.describe().snapshot(base.id()).unwrap().references, 1);
    }

    #[test]
    fn describe_serializes_to_json() {
        let store = store();
        let mut snap = store.master().unwrap().branch().unwrap();
        fill(&mut snap, 2);
        snap.set_metadata("first import").unwrap();
        snap.commit().unwrap();
        store.set_branch("main", snap.id()).unwrap();

        let json = serde_json::to_value(store.describe()).unwrap();
        assert_eq!(json["branches"]["main"], serde_json::to_value(snap.id()).unwrap());
        assert_eq!(json["snapshots"].as_array().unwrap().len(), 2);
        assert_eq!(json["snapshots"][1]["metadata"], "first import");
    }
}
