use thiserror::Error;

#[derive(Debug, Error)]
pub enum PackError {
    #[error("invalid stream signature")]
    InvalidSignature,

    #[error("unsupported endianness flag: {0}")]
    UnsupportedEndianness(u8),

    #[error("unsupported store kind: {0} (only in-memory stores can be loaded)")]
    UnsupportedStoreKind(u8),

    #[error("unknown record tag: {0}")]
    UnknownRecordTag(u8),

    #[error("record count mismatch: checksum says {expected}, read {actual}")]
    ChecksumMismatch { expected: u64, actual: u64 },

    #[error("stream ended after {records} records without a checksum record")]
    MissingChecksum { records: u64 },

    #[error("stream truncated inside a record")]
    Truncated,

    #[error("string field is not valid UTF-8")]
    InvalidUtf8,

    #[error("corrupt {record} record: {reason}")]
    Corrupt { record: &'static str, reason: String },

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

pub type PackResult<T> = Result<T, PackError>;
