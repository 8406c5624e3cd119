use memoria_types::{BlockId, NodeId, SnapshotId, SnapshotStatus, TypeTag};

/// Store-wide header record, written once before everything else.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct MetadataRecord {
    pub master: SnapshotId,
    pub root: SnapshotId,
    /// Next persistent-tree node ID to hand out.
    pub id_counter: u64,
    pub branches: Vec<(String, SnapshotId)>,
}

/// One version-tree node.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct HistoryRecord {
    pub status: SnapshotStatus,
    pub id: SnapshotId,
    pub root: Option<NodeId>,
    pub parent: Option<SnapshotId>,
    pub metadata: String,
    pub children: Vec<SnapshotId>,
}

/// A persistent-tree branch node: `(separator key, child node)` pairs.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct BranchNodeRecord {
    pub id: NodeId,
    pub owner: SnapshotId,
    pub entries: Vec<(BlockId, NodeId)>,
}

/// A leaf entry as written: the payload is named by its uid.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct LeafRecordEntry {
    pub key: BlockId,
    pub uid: BlockId,
    pub owner: SnapshotId,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct LeafNodeRecord {
    pub id: NodeId,
    pub owner: SnapshotId,
    pub entries: Vec<LeafRecordEntry>,
}

/// A block's bytes, as produced by its type's codec.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DataBlockRecord {
    pub id: BlockId,
    pub uid: BlockId,
    /// In-memory size of the block once deserialized.
    pub mem_size: u64,
    pub tag: TypeTag,
    pub payload: Vec<u8>,
}

/// Size of the `id` + `uid` block header at the front of a data block's content.
pub const BLOCK_HEADER_LEN: u64 = 32;

/// Any record other than the trailing checksum.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Record {
    Metadata(MetadataRecord),
    History(HistoryRecord),
    BranchNode(BranchNodeRecord),
    LeafNode(LeafNodeRecord),
    DataBlock(DataBlockRecord),
}
