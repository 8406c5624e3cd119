use memoria_pack::PackError;
use memoria_tree::TreeError;
use memoria_types::{BlockId, SnapshotId, SnapshotStatus, TypeTag};

/// Errors from block store operations.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    /// The snapshot's lifecycle status does not allow the operation.
    #[error("cannot {operation} snapshot {snapshot}: status is {actual}")]
    InvalidState {
        snapshot: SnapshotId,
        operation: &'static str,
        actual: SnapshotStatus,
    },

    /// The snapshot is the root, the master head or a branch target.
    #[error("snapshot {snapshot} is protected: {reason}")]
    Protected {
        snapshot: SnapshotId,
        reason: &'static str,
    },

    /// A write through a handle that is not open for update, or whose
    /// snapshot is no longer writable.
    #[error("block {block} is not writable through this handle")]
    ReadOnlyBlock { block: BlockId },

    #[error("snapshot not found: {0}")]
    SnapshotNotFound(SnapshotId),

    #[error("branch not found: {0}")]
    BranchNotFound(String),

    #[error("block {block} not found in snapshot {snapshot}")]
    BlockNotFound { snapshot: SnapshotId, block: BlockId },

    /// The stream is not a well-formed store image.
    #[error("format error: {0}")]
    Format(String),

    /// The checksum record does not match the records read.
    #[error("checksum mismatch: expected {expected} records, read {actual}")]
    ChecksumMismatch { expected: u64, actual: u64 },

    /// A snapshot still has uncommitted work.
    #[error("snapshot {snapshot} has uncommitted changes")]
    ConcurrentModification { snapshot: SnapshotId },

    #[error("resource exhausted: {0}")]
    ResourceExhausted(String),

    #[error("no codec registered for block type {0}")]
    UnknownBlockType(TypeTag),

    #[error("invalid name {name:?}: {reason}")]
    InvalidName { name: String, reason: String },

    /// A block codec rejected its input.
    #[error("codec error: {0}")]
    Codec(String),

    #[error("invalid configuration: {0}")]
    Config(String),

    #[error("serialization error: {0}")]
    Serialization(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Coarse classification of [`StoreError`]s.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    InvalidState,
    NotFound,
    Format,
    ChecksumMismatch,
    ConcurrentModification,
    ResourceExhausted,
    Io,
    Other,
}

impl StoreError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            StoreError::InvalidState { .. }
            | StoreError::Protected { .. }
            | StoreError::ReadOnlyBlock { .. } => ErrorKind::InvalidState,
            StoreError::SnapshotNotFound(_)
            | StoreError::BranchNotFound(_)
            | StoreError::BlockNotFound { .. } => ErrorKind::NotFound,
            StoreError::Format(_) => ErrorKind::Format,
            StoreError::ChecksumMismatch { .. } => ErrorKind::ChecksumMismatch,
            StoreError::ConcurrentModification { .. } => ErrorKind::ConcurrentModification,
            StoreError::ResourceExhausted(_) => ErrorKind::ResourceExhausted,
            StoreError::Io(_) => ErrorKind::Io,
            StoreError::UnknownBlockType(_)
            | StoreError::InvalidName { .. }
            | StoreError::Codec(_)
            | StoreError::Config(_)
            | StoreError::Serialization(_) => ErrorKind::Other,
        }
    }
}

impl From<PackError> for StoreError {
    fn from(err: PackError) -> Self {
        match err {
            PackError::ChecksumMismatch { expected, actual } => {
                StoreError::ChecksumMismatch { expected, actual }
            }
            PackError::MissingChecksum { records } => StoreError::ChecksumMismatch {
                expected: records + 1,
                actual: records,
            },
            PackError::Io(e) => StoreError::Io(e),
            other => StoreError::Format(other.to_string()),
        }
    }
}

impl From<TreeError> for StoreError {
    fn from(err: TreeError) -> Self {
        match err {
            TreeError::NodeIdsExhausted => StoreError::ResourceExhausted(err.to_string()),
            TreeError::InvalidFanout { .. } => StoreError::Config(err.to_string()),
        }
    }
}

impl From<bincode::Error> for StoreError {
    fn from(err: bincode::Error) -> Self {
        StoreError::Serialization(err.to_string())
    }
}

/// Result alias for store operations.
pub type StoreResult<T> = Result<T, StoreError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pack_errors_map_to_kinds() {
        let e: StoreError = PackError::InvalidSignature.into();
        assert_eq!(e.kind(), ErrorKind::Format);

        let e: StoreError = PackError::ChecksumMismatch { expected: 3, actual: 4 }.into();
        assert_eq!(e.kind(), ErrorKind::ChecksumMismatch);

        let e: StoreError = PackError::MissingChecksum { records: 2 }.into();
        assert_eq!(e.kind(), ErrorKind::ChecksumMismatch);

        let e: StoreError = PackError::Truncated.into();
        assert_eq!(e.kind(), ErrorKind::Format);
    }

    #[test]
    fn tree_errors_map_to_kinds() {
        let e: StoreError = TreeError::NodeIdsExhausted.into();
        assert_eq!(e.kind(), ErrorKind::ResourceExhausted);
        let e: StoreError = TreeError::InvalidFanout { fanout: 1, min: 4 }.into();
        assert!(matches!(e, StoreError::Config(_)));
    }

    #[test]
    fn protected_is_an_invalid_state() {
        let e = StoreError::Protected {
            snapshot: SnapshotId::random(),
            reason: "master head",
        };
        assert_eq!(e.kind(), ErrorKind::InvalidState);
        assert!(e.to_string().contains("master head"));
    }
}
