use std::io::Write;

use memoria_types::{NodeId, SnapshotId};
use tracing::debug;

use crate::error::PackResult;
use crate::format::{encode_header, Encoder, Endian, RecordTag};
use crate::record::{Record, BLOCK_HEADER_LEN};

/// Writes a tagged-record stream.
///
/// The header is written on construction and the checksum record by
/// [`RecordWriter::finish`]; a stream that is dropped without `finish` will
/// fail to load.
pub struct RecordWriter<W: Write> {
    out: W,
    endian: Endian,
    records: u64,
}

impl<W: Write> RecordWriter<W> {
    pub fn new(mut out: W, endian: Endian) -> PackResult<Self> {
        out.write_all(&encode_header(endian))?;
        Ok(Self {
            out,
            endian,
            records: 0,
        })
    }

    pub fn endian(&self) -> Endian {
        self.endian
    }

    /// Records written so far, not counting the checksum.
    pub fn records(&self) -> u64 {
        self.records
    }

    pub fn write(&mut self, record: &Record) -> PackResult<()> {
        let bytes = encode_record(record, self.endian)?;
        self.out.write_all(&bytes)?;
        self.records += 1;
        Ok(())
    }

    /// Write the checksum record, flush, and hand back the sink.
    pub fn finish(mut self) -> PackResult<W> {
        let mut enc = Encoder::new(RecordTag::Checksum, self.endian);
        enc.u64(self.records);
        self.out.write_all(&enc.finish())?;
        self.out.flush()?;
        debug!(records = self.records, "record stream finished");
        Ok(self.out)
    }
}

fn encode_record(record: &Record, endian: Endian) -> PackResult<Vec<u8>> {
    let enc = match record {
        Record::Metadata(m) => {
            let name = RecordTag::Metadata.name();
            let mut enc = Encoder::new(RecordTag::Metadata, endian);
            enc.snapshot_id(&m.master);
            enc.snapshot_id(&m.root);
            enc.u64(m.id_counter);
            enc.count(m.branches.len(), name)?;
            for (branch, target) in &m.branches {
                enc.string(branch, name)?;
                enc.snapshot_id(target);
            }
            enc
        }
        Record::History(h) => {
            let name = RecordTag::HistoryNode.name();
            let mut enc = Encoder::new(RecordTag::HistoryNode, endian);
            enc.u32(h.status.code());
            enc.snapshot_id(&h.id);
            enc.node_id(h.root.unwrap_or(NodeId::null()));
            enc.snapshot_id(&h.parent.unwrap_or(SnapshotId::null()));
            enc.string(&h.metadata, name)?;
            enc.count(h.children.len(), name)?;
            for child in &h.children {
                enc.snapshot_id(child);
            }
            enc
        }
        Record::BranchNode(b) => {
            let mut enc = Encoder::new(RecordTag::BranchNode, endian);
            enc.node_id(b.id);
            enc.snapshot_id(&b.owner);
            enc.count(b.entries.len(), RecordTag::BranchNode.name())?;
            for (key, child) in &b.entries {
                enc.block_id(key);
                enc.node_id(*child);
            }
            enc
        }
        Record::LeafNode(l) => {
            let mut enc = Encoder::new(RecordTag::LeafNode, endian);
            enc.node_id(l.id);
            enc.snapshot_id(&l.owner);
            enc.count(l.entries.len(), RecordTag::LeafNode.name())?;
            for entry in &l.entries {
                enc.block_id(&entry.key);
                enc.block_id(&entry.uid);
                enc.snapshot_id(&entry.owner);
            }
            enc
        }
        Record::DataBlock(d) => {
            let mut enc = Encoder::new(RecordTag::DataBlock, endian);
            enc.u64(BLOCK_HEADER_LEN + d.payload.len() as u64);
            enc.u64(d.mem_size);
            enc.tag(d.tag);
            enc.block_id(&d.id);
            enc.block_id(&d.uid);
            enc.bytes(&d.payload);
            enc
        }
    };
    Ok(enc.finish())
}
