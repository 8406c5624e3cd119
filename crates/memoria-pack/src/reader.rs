use std::io::{self, Read};

use memoria_types::SnapshotStatus;
use tracing::{debug, warn};

use crate::error::{PackError, PackResult};
use crate::format::{bounded_capacity, decode_header, Decoder, Endian, RecordTag, HEADER_LEN};
use crate::record::{
    BranchNodeRecord, DataBlockRecord, HistoryRecord, LeafNodeRecord, LeafRecordEntry,
    MetadataRecord, Record, BLOCK_HEADER_LEN,
};

/// Reads a tagged-record stream written by [`RecordWriter`].
///
/// [`RecordReader::next_record`] yields records until the checksum record,
/// which it validates against the number of records read.
///
/// [`RecordWriter`]: crate::RecordWriter
pub struct RecordReader<R: Read> {
    input: R,
    endian: Endian,
    records: u64,
    finished: bool,
}

impl<R: Read> RecordReader<R> {
    /// Read and validate the stream header.
    pub fn new(mut input: R) -> PackResult<Self> {
        let mut header = Vec::with_capacity(HEADER_LEN);
        (&mut input).take(HEADER_LEN as u64).read_to_end(&mut header)?;
        let endian = decode_header(&header)?;
        Ok(Self {
            input,
            endian,
            records: 0,
            finished: false,
        })
    }

    pub fn endian(&self) -> Endian {
        self.endian
    }

    /// Records read so far, not counting the checksum.
    pub fn records(&self) -> u64 {
        self.records
    }

    /// The next record, or `None` once the checksum record has been verified.
    pub fn next_record(&mut self) -> PackResult<Option<Record>> {
        if self.finished {
            return Ok(None);
        }
        let Some(byte) = self.read_tag_byte()? else {
            return Err(PackError::MissingChecksum {
                records: self.records,
            });
        };
        let tag = RecordTag::from_byte(byte)?;
        let mut dec = Decoder::new(&mut self.input, self.endian);

        let record = match tag {
            RecordTag::Checksum => {
                let expected = dec.u64()?;
                if expected != self.records {
                    return Err(PackError::ChecksumMismatch {
                        expected,
                        actual: self.records,
                    });
                }
                self.finished = true;
                self.check_trailing()?;
                debug!(records = self.records, "record stream verified");
                return Ok(None);
            }
            RecordTag::Metadata => Record::Metadata(read_metadata(&mut dec)?),
            RecordTag::HistoryNode => Record::History(read_history(&mut dec)?),
            RecordTag::BranchNode => Record::BranchNode(read_branch(&mut dec)?),
            RecordTag::LeafNode => Record::LeafNode(read_leaf(&mut dec)?),
            RecordTag::DataBlock => Record::DataBlock(read_data_block(&mut dec)?),
        };
        self.records += 1;
        Ok(Some(record))
    }

    /// Every record up to and including a verified checksum.
    pub fn read_all(mut self) -> PackResult<Vec<Record>> {
        let mut out = Vec::new();
        while let Some(record) = self.next_record()? {
            out.push(record);
        }
        Ok(out)
    }

    /// One byte, or `None` at a clean end of input.
    fn read_tag_byte(&mut self) -> PackResult<Option<u8>> {
        let mut byte = [0u8; 1];
        loop {
            match self.input.read(&mut byte) {
                Ok(0) => return Ok(None),
                Ok(_) => return Ok(Some(byte[0])),
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e.into()),
            }
        }
    }

    fn check_trailing(&mut self) -> PackResult<()> {
        let trailing = io::copy(&mut self.input, &mut io::sink())?;
        if trailing > 0 {
            warn!(bytes = trailing, "ignoring bytes after checksum record");
        }
        Ok(())
    }
}

fn read_metadata<R: Read>(dec: &mut Decoder<'_, R>) -> PackResult<MetadataRecord> {
    let master = dec.snapshot_id()?;
    let root = dec.snapshot_id()?;
    let id_counter = dec.u64()?;
    let count = dec.u32()?;
    let mut branches = Vec::with_capacity(bounded_capacity(count));
    for _ in 0..count {
        let name = dec.string()?;
        branches.push((name, dec.snapshot_id()?));
    }
    Ok(MetadataRecord {
        master,
        root,
        id_counter,
        branches,
    })
}

fn read_history<R: Read>(dec: &mut Decoder<'_, R>) -> PackResult<HistoryRecord> {
    let code = dec.u32()?;
    let status = SnapshotStatus::from_code(code).map_err(|e| PackError::Corrupt {
        record: RecordTag::HistoryNode.name(),
        reason: e.to_string(),
    })?;
    let id = dec.snapshot_id()?;
    let root = dec.node_id()?;
    let parent = dec.snapshot_id()?;
    let metadata = dec.string()?;
    let count = dec.u32()?;
    let mut children = Vec::with_capacity(bounded_capacity(count));
    for _ in 0..count {
        children.push(dec.snapshot_id()?);
    }
    Ok(HistoryRecord {
        status,
        id,
        root: (!root.is_null()).then_some(root),
        parent: parent.non_null(),
        metadata,
        children,
    })
}

fn read_branch<R: Read>(dec: &mut Decoder<'_, R>) -> PackResult<BranchNodeRecord> {
    let id = dec.node_id()?;
    let owner = dec.snapshot_id()?;
    let count = dec.u32()?;
    let mut entries = Vec::with_capacity(bounded_capacity(count));
    for _ in 0..count {
        let key = dec.block_id()?;
        entries.push((key, dec.node_id()?));
    }
    Ok(BranchNodeRecord { id, owner, entries })
}

fn read_leaf<R: Read>(dec: &mut Decoder<'_, R>) -> PackResult<LeafNodeRecord> {
    let id = dec.node_id()?;
    let owner = dec.snapshot_id()?;
    let count = dec.u32()?;
    let mut entries = Vec::with_capacity(bounded_capacity(count));
    for _ in 0..count {
        entries.push(LeafRecordEntry {
            key: dec.block_id()?,
            uid: dec.block_id()?,
            owner: dec.snapshot_id()?,
        });
    }
    Ok(LeafNodeRecord { id, owner, entries })
}

fn read_data_block<R: Read>(dec: &mut Decoder<'_, R>) -> PackResult<DataBlockRecord> {
    let serialized = dec.u64()?;
    let mem_size = dec.u64()?;
    let tag = dec.tag()?;
    if serialized < BLOCK_HEADER_LEN {
        return Err(PackError::Corrupt {
            record: RecordTag::DataBlock.name(),
            reason: format!("serialized size {serialized} is smaller than the block header"),
        });
    }
    let id = dec.block_id()?;
    let uid = dec.block_id()?;
    let payload = dec.bytes(serialized - BLOCK_HEADER_LEN)?;
    Ok(DataBlockRecord {
        id,
        uid,
        mem_size,
        tag,
        payload,
    })
}

#[cfg(test)]
mod tests {
    use memoria_types::{BlockId, NodeId, SnapshotId, TypeTag};

    use super::*;
    use crate::writer::RecordWriter;

    fn sample_records() -> Vec<Record> {
        let root = SnapshotId::random();
        let child = SnapshotId::random();
        let block = BlockId::random();
        let uid = BlockId::random();
        vec![
            Record::Metadata(MetadataRecord {
                master: child,
                root,
                id_counter: 42,
                branches: vec![("main".into(), child), ("release/1".into(), root)],
            }),
            Record::History(HistoryRecord {
                status: SnapshotStatus::Committed,
                id: root,
                root: None,
                parent: None,
                metadata: "initial".into(),
                children: vec![child],
            }),
            Record::History(HistoryRecord {
                status: SnapshotStatus::Committed,
                id: child,
                root: Some(NodeId::new(3)),
                parent: Some(root),
                metadata: String::new(),
                children: vec![],
            }),
            Record::BranchNode(BranchNodeRecord {
                id: NodeId::new(3),
                owner: child,
                entries: vec![(block, NodeId::new(2))],
            }),
            Record::LeafNode(LeafNodeRecord {
                id: NodeId::new(2),
                owner: child,
                entries: vec![LeafRecordEntry {
                    key: block,
                    uid,
                    owner: child,
                }],
            }),
            Record::DataBlock(DataBlockRecord {
                id: block,
                uid,
                mem_size: 4,
                tag: TypeTag::named("test", "raw"),
                payload: b"data".to_vec(),
            }),
        ]
    }

    fn encode(records: &[Record], endian: Endian) -> Vec<u8> {
        let mut writer = RecordWriter::new(Vec::new(), endian).unwrap();
        for r in records {
            writer.write(r).unwrap();
        }
        writer.finish().unwrap()
    }

    // -----------------------------------------------------------------------
    // Decoding
    // -----------------------------------------------------------------------

    #[test]
    fn reads_back_in_both_byte_orders() {
        let records = sample_records();
        for endian in [Endian::Little, Endian::Big] {
            let bytes = encode(&records, endian);
            let reader = RecordReader::new(bytes.as_slice()).unwrap();
            assert_eq!(reader.endian(), endian);
            assert_eq!(reader.read_all().unwrap(), records);
        }
    }

    #[test]
    fn byte_orders_differ_on_the_wire() {
        let records = sample_records();
        assert_ne!(encode(&records, Endian::Little), encode(&records, Endian::Big));
    }

    #[test]
    fn next_record_stops_after_checksum() {
        let bytes = encode(&sample_records()[..1], Endian::Little);
        let mut reader = RecordReader::new(bytes.as_slice()).unwrap();
        assert!(reader.next_record().unwrap().is_some());
        assert!(reader.next_record().unwrap().is_none());
        assert!(reader.next_record().unwrap().is_none());
        assert_eq!(reader.records(), 1);
    }

    #[test]
    fn trailing_bytes_are_ignored() {
        let mut bytes = encode(&sample_records(), Endian::Little);
        bytes.extend_from_slice(b"junk");
        let records = RecordReader::new(bytes.as_slice()).unwrap().read_all().unwrap();
        assert_eq!(records.len(), 6);
    }

    // -----------------------------------------------------------------------
    // Corruption
    // -----------------------------------------------------------------------

    #[test]
    fn corrupted_checksum_is_detected() {
        let mut bytes = encode(&sample_records(), Endian::Little);
        let last = bytes.len() - 1;
        bytes[last] ^= 0xFF;
        let err = RecordReader::new(bytes.as_slice()).unwrap().read_all().unwrap_err();
        assert!(matches!(err, PackError::ChecksumMismatch { actual: 6, .. }));
    }

    #[test]
    fn missing_checksum_is_detected() {
        let bytes = encode(&sample_records(), Endian::Little);
        let cut = &bytes[..bytes.len() - 9];
        let err = RecordReader::new(cut).unwrap().read_all().unwrap_err();
        assert!(matches!(err, PackError::MissingChecksum { records: 6 }));
    }

    #[test]
    fn truncation_inside_record_is_detected() {
        let bytes = encode(&sample_records(), Endian::Little);
        let cut = &bytes[..bytes.len() - 12];
        let err = RecordReader::new(cut).unwrap().read_all().unwrap_err();
        assert!(matches!(err, PackError::Truncated));
    }

    #[test]
    fn unknown_tag_is_rejected() {
        let mut bytes = encode(&[], Endian::Little);
        bytes[HEADER_LEN] = 0x7F;
        let err = RecordReader::new(bytes.as_slice()).unwrap().read_all().unwrap_err();
        assert!(matches!(err, PackError::UnknownRecordTag(0x7F)));
    }

    #[test]
    fn empty_input_has_no_signature() {
        assert!(matches!(
            RecordReader::new(&[][..]),
            Err(PackError::InvalidSignature)
        ));
    }

    #[test]
    fn bad_history_status_is_corrupt() {
        let records = &sample_records()[1..2];
        let mut bytes = encode(records, Endian::Little);
        bytes[HEADER_LEN + 1..HEADER_LEN + 5].copy_from_slice(&9u32.to_le_bytes());
        let err = RecordReader::new(bytes.as_slice()).unwrap().read_all().unwrap_err();
        assert!(matches!(err, PackError::Corrupt { .. }));
    }

    #[test]
    fn undersized_data_block_is_corrupt() {
        let records = &sample_records()[5..];
        let mut bytes = encode(records, Endian::Little);
        bytes[HEADER_LEN + 1..HEADER_LEN + 9].copy_from_slice(&8u64.to_le_bytes());
        let err = RecordReader::new(bytes.as_slice()).unwrap().read_all().unwrap_err();
        assert!(matches!(err, PackError::Corrupt { .. }));
    }
}
