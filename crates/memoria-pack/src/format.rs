//! Stream header, record tags and fixed-width field encoding.

use std::io::Read;

use memoria_types::{BlockId, NodeId, SnapshotId, TypeTag};
use serde::{Deserialize, Serialize};

use crate::error::{PackError, PackResult};

/// ASCII signature at the start of every stream.
pub const SIGNATURE: &[u8; 7] = b"MEMORIA";

/// Signature, endianness flag, store kind and three reserved bytes.
pub const HEADER_LEN: usize = 12;

/// Store-kind flag for in-memory stores, the only kind this format carries.
pub const STORE_KIND_IN_MEMORY: u8 = 0;

/// Byte order of every multi-byte integer after the header.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Endian {
    #[default]
    Little,
    Big,
}

impl Endian {
    pub fn flag(self) -> u8 {
        match self {
            Endian::Little => 0,
            Endian::Big => 1,
        }
    }

    pub fn from_flag(flag: u8) -> PackResult<Self> {
        match flag {
            0 => Ok(Endian::Little),
            1 => Ok(Endian::Big),
            other => Err(PackError::UnsupportedEndianness(other)),
        }
    }
}

pub fn encode_header(endian: Endian) -> [u8; HEADER_LEN] {
    let mut header = [0u8; HEADER_LEN];
    header[..7].copy_from_slice(SIGNATURE);
    header[7] = endian.flag();
    header[8] = STORE_KIND_IN_MEMORY;
    header
}

/// Validate a header and return the stream's byte order.
///
/// `bytes` may be shorter than [`HEADER_LEN`] when the input ran out early.
pub fn decode_header(bytes: &[u8]) -> PackResult<Endian> {
    if bytes.len() < SIGNATURE.len() || &bytes[..SIGNATURE.len()] != SIGNATURE {
        return Err(PackError::InvalidSignature);
    }
    if bytes.len() < HEADER_LEN {
        return Err(PackError::Truncated);
    }
    let endian = Endian::from_flag(bytes[7])?;
    if bytes[8] != STORE_KIND_IN_MEMORY {
        return Err(PackError::UnsupportedStoreKind(bytes[8]));
    }
    Ok(endian)
}

/// One-byte record tags.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u8)]
pub enum RecordTag {
    Metadata = 1,
    HistoryNode = 2,
    BranchNode = 3,
    LeafNode = 4,
    DataBlock = 5,
    Checksum = 6,
}

impl RecordTag {
    pub fn from_byte(byte: u8) -> PackResult<Self> {
        Ok(match byte {
            1 => RecordTag::Metadata,
            2 => RecordTag::HistoryNode,
            3 => RecordTag::BranchNode,
            4 => RecordTag::LeafNode,
            5 => RecordTag::DataBlock,
            6 => RecordTag::Checksum,
            other => return Err(PackError::UnknownRecordTag(other)),
        })
    }

    pub fn name(self) -> &'static str {
        match self {
            RecordTag::Metadata => "metadata",
            RecordTag::HistoryNode => "history node",
            RecordTag::BranchNode => "branch node",
            RecordTag::LeafNode => "leaf node",
            RecordTag::DataBlock => "data block",
            RecordTag::Checksum => "checksum",
        }
    }
}

/// Appends fixed-width fields to a record buffer.
pub(crate) struct Encoder {
    buf: Vec<u8>,
    endian: Endian,
}

impl Encoder {
    pub fn new(tag: RecordTag, endian: Endian) -> Self {
        Self {
            buf: vec![tag as u8],
            endian,
        }
    }

    pub fn u32(&mut self, v: u32) {
        match self.endian {
            Endian::Little => self.buf.extend_from_slice(&v.to_le_bytes()),
            Endian::Big => self.buf.extend_from_slice(&v.to_be_bytes()),
        }
    }

    pub fn u64(&mut self, v: u64) {
        match self.endian {
            Endian::Little => self.buf.extend_from_slice(&v.to_le_bytes()),
            Endian::Big => self.buf.extend_from_slice(&v.to_be_bytes()),
        }
    }

    /// A length or count field.
    pub fn count(&mut self, n: usize, record: &'static str) -> PackResult<()> {
        let n = u32::try_from(n).map_err(|_| PackError::Corrupt {
            record,
            reason: format!("{n} exceeds the u32 count field"),
        })?;
        self.u32(n);
        Ok(())
    }

    pub fn bytes(&mut self, bytes: &[u8]) {
        self.buf.extend_from_slice(bytes);
    }

    pub fn block_id(&mut self, id: &BlockId) {
        self.bytes(id.as_bytes());
    }

    pub fn snapshot_id(&mut self, id: &SnapshotId) {
        self.bytes(id.as_bytes());
    }

    pub fn node_id(&mut self, id: NodeId) {
        self.u64(id.value());
    }

    pub fn tag(&mut self, tag: TypeTag) {
        self.u64(tag.container);
        self.u64(tag.kind);
    }

    pub fn string(&mut self, s: &str, record: &'static str) -> PackResult<()> {
        self.count(s.len(), record)?;
        self.bytes(s.as_bytes());
        Ok(())
    }

    pub fn finish(self) -> Vec<u8> {
        self.buf
    }
}

/// Reads fixed-width fields from the body of one record.
///
/// Every short read is [`PackError::Truncated`]: the record tag has already
/// been consumed, so the input ended inside a record.
pub(crate) struct Decoder<'r, R> {
    input: &'r mut R,
    endian: Endian,
}

impl<'r, R: Read> Decoder<'r, R> {
    pub fn new(input: &'r mut R, endian: Endian) -> Self {
        Self { input, endian }
    }

    fn array<const N: usize>(&mut self) -> PackResult<[u8; N]> {
        let mut buf = [0u8; N];
        self.input.read_exact(&mut buf).map_err(eof_is_truncation)?;
        Ok(buf)
    }

    pub fn u32(&mut self) -> PackResult<u32> {
        let raw = self.array::<4>()?;
        Ok(match self.endian {
            Endian::Little => u32::from_le_bytes(raw),
            Endian::Big => u32::from_be_bytes(raw),
        })
    }

    pub fn u64(&mut self) -> PackResult<u64> {
        let raw = self.array::<8>()?;
        Ok(match self.endian {
            Endian::Little => u64::from_le_bytes(raw),
            Endian::Big => u64::from_be_bytes(raw),
        })
    }

    pub fn block_id(&mut self) -> PackResult<BlockId> {
        Ok(BlockId::from_bytes(self.array::<16>()?))
    }

    pub fn snapshot_id(&mut self) -> PackResult<SnapshotId> {
        Ok(SnapshotId::from_bytes(self.array::<16>()?))
    }

    pub fn node_id(&mut self) -> PackResult<NodeId> {
        Ok(NodeId::new(self.u64()?))
    }

    pub fn tag(&mut self) -> PackResult<TypeTag> {
        let container = self.u64()?;
        let kind = self.u64()?;
        Ok(TypeTag::new(container, kind))
    }

    /// Exactly `len` bytes, without trusting `len` for the allocation.
    pub fn bytes(&mut self, len: u64) -> PackResult<Vec<u8>> {
        let mut out = Vec::new();
        let read = (&mut *self.input).take(len).read_to_end(&mut out)?;
        if (read as u64) < len {
            return Err(PackError::Truncated);
        }
        Ok(out)
    }

    pub fn string(&mut self) -> PackResult<String> {
        let len = self.u32()?;
        let raw = self.bytes(u64::from(len))?;
        String::from_utf8(raw).map_err(|_| PackError::InvalidUtf8)
    }
}

fn eof_is_truncation(err: std::io::Error) -> PackError {
    if err.kind() == std::io::ErrorKind::UnexpectedEof {
        PackError::Truncated
    } else {
        PackError::Io(err)
    }
}

/// Initial capacity for a vector whose length comes from the stream.
pub(crate) fn bounded_capacity(count: u32) -> usize {
    (count as usize).min(1024)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn header_layout() {
        let header = encode_header(Endian::Big);
        assert_eq!(&header[..7], b"MEMORIA");
        assert_eq!(header[7], 1);
        assert_eq!(&header[8..], &[0, 0, 0, 0]);
        assert_eq!(decode_header(&header).unwrap(), Endian::Big);
    }

    #[test]
    fn header_rejects_bad_signature() {
        let mut header = encode_header(Endian::Little);
        header[0] = b'X';
        assert!(matches!(decode_header(&header), Err(PackError::InvalidSignature)));
        assert!(matches!(decode_header(b"MEM"), Err(PackError::InvalidSignature)));
    }

    #[test]
    fn header_rejects_bad_flags() {
        let mut header = encode_header(Endian::Little);
        header[7] = 2;
        assert!(matches!(
            decode_header(&header),
            Err(PackError::UnsupportedEndianness(2))
        ));

        let mut header = encode_header(Endian::Little);
        header[8] = 1;
        assert!(matches!(
            decode_header(&header),
            Err(PackError::UnsupportedStoreKind(1))
        ));
    }

    #[test]
    fn short_header_after_signature_is_truncation() {
        assert!(matches!(decode_header(b"MEMORIA\0"), Err(PackError::Truncated)));
    }

    #[test]
    fn record_tags() {
        assert_eq!(RecordTag::from_byte(5).unwrap(), RecordTag::DataBlock);
        assert!(matches!(RecordTag::from_byte(0), Err(PackError::UnknownRecordTag(0))));
        assert!(matches!(RecordTag::from_byte(7), Err(PackError::UnknownRecordTag(7))));
    }

    #[test]
    fn big_endian_fields_decode() {
        let mut enc = Encoder::new(RecordTag::Checksum, Endian::Big);
        enc.u64(0x0102_0304_0506_0708);
        let bytes = enc.finish();
        assert_eq!(&bytes[1..], &[1, 2, 3, 4, 5, 6, 7, 8]);

        let mut input = &bytes[1..];
        let mut dec = Decoder::new(&mut input, Endian::Big);
        assert_eq!(dec.u64().unwrap(), 0x0102_0304_0506_0708);
    }

    #[test]
    fn short_string_is_truncation() {
        let mut enc = Encoder::new(RecordTag::Metadata, Endian::Little);
        enc.u32(10);
        enc.bytes(b"abc");
        let bytes = enc.finish();
        let mut input = &bytes[1..];
        let mut dec = Decoder::new(&mut input, Endian::Little);
        assert!(matches!(dec.string(), Err(PackError::Truncated)));
    }

    #[test]
    fn endian_serde_names() {
        assert_eq!(serde_json::to_string(&Endian::Big).unwrap(), "\"big\"");
        let e: Endian = serde_json::from_str("\"little\"").unwrap();
        assert_eq!(e, Endian::Little);
    }
}
