//! Tagged-record stream format for Memoria block stores.
//!
//! A stream is a 12-byte header followed by one-byte-tagged records and a
//! closing checksum record:
//!
//! ```text
//! "MEMORIA" | endian | store kind | 3 reserved
//! METADATA
//! HISTORY_NODE [BRANCH_NODE | LEAF_NODE | DATA_BLOCK]*   (repeated)
//! CHECKSUM (u64 count of the records before it)
//! ```
//!
//! This crate only frames and parses records. Deciding which records to emit,
//! and rebuilding a store from them, belongs to `memoria-store`.

pub mod error;
pub mod format;
pub mod reader;
pub mod record;
pub mod writer;

pub use error::{PackError, PackResult};
pub use format::{Endian, RecordTag, HEADER_LEN, SIGNATURE};
pub use reader::RecordReader;
pub use record::{
    BranchNodeRecord, DataBlockRecord, HistoryRecord, LeafNodeRecord, LeafRecordEntry,
    MetadataRecord, Record,
};
pub use writer::RecordWriter;
