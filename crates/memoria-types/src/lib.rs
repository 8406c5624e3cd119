//! Foundation types for the Memoria block store.
//!
//! This crate provides the identifier, tagging and lifecycle types shared by
//! every other Memoria crate. It has no knowledge of trees, snapshots or
//! streams; it only defines the vocabulary they speak.
//!
//! # Key Types
//!
//! - [`BlockId`] -- 128-bit random identifier of a block (logical key or payload uid)
//! - [`SnapshotId`] -- 128-bit random identifier of a version-tree node
//! - [`NodeId`] -- monotonic identifier of a persistent-tree node
//! - [`TypeTag`] -- pair of hashes naming a block's container type and kind
//! - [`SnapshotStatus`] -- lifecycle state of a snapshot

pub mod error;
pub mod id;
pub mod status;
pub mod tag;

pub use error::TypeError;
pub use id::{BlockId, NodeId, SnapshotId};
pub use status::SnapshotStatus;
pub use tag::TypeTag;
