//! Persistent copy-on-write B+tree for the Memoria block store.
//!
//! A [`PersistentTree`] maps logical [`BlockId`]s to reference-counted
//! [`Block`]s. Trees are cheap to clone (one `Arc` bump on the root) and a
//! clone is a frozen view: mutations through one tree value never change what
//! any other value observes.
//!
//! # Copy-on-write
//!
//! Every node records the snapshot that created it. A write walks from the
//! root to the target leaf and, for every node on the path that is not owned
//! by the writing snapshot (or is shared with another tree value), installs a
//! private copy first. Nodes owned by the writer and reachable from nowhere
//! else are edited in place.
//!
//! # Reference counting
//!
//! Leaf entries hold [`BlockRef`]s. Creating or cloning a `BlockRef` bumps the
//! block's counter and dropping one lowers it, so a block's
//! [`Block::references`] always equals the number of live leaf entries that
//! point at it, across every tree value in the process.
//!
//! [`BlockId`]: memoria_types::BlockId

pub mod alloc;
pub mod block;
pub mod error;
pub mod node;
pub mod tree;

pub use alloc::{CowContext, NodeIdGen};
pub use block::{Block, BlockRef};
pub use error::{TreeError, TreeResult};
pub use node::{BranchEntry, LeafEntry, Node, NodeBody};
pub use tree::{PersistentTree, MIN_FANOUT};
