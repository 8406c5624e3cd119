use std::sync::atomic::{AtomicU64, Ordering};

use memoria_types::{NodeId, SnapshotId};

use crate::error::{TreeError, TreeResult};
use crate::tree::MIN_FANOUT;

/// Store-wide monotonic source of [`NodeId`]s.
///
/// Zero is reserved for "no node", so the first ID handed out is 1.
#[derive(Debug)]
pub struct NodeIdGen {
    next: AtomicU64,
}

impl NodeIdGen {
    pub fn new() -> Self {
        Self::starting_at(1)
    }

    /// Resume allocation at `next` (used when rebuilding a loaded store).
    pub fn starting_at(next: u64) -> Self {
        Self {
            next: AtomicU64::new(next.max(1)),
        }
    }

    pub fn next_id(&self) -> TreeResult<NodeId> {
        self.next
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| n.checked_add(1))
            .map(NodeId::new)
            .map_err(|_| TreeError::NodeIdsExhausted)
    }

    /// The value the next allocation will return.
    pub fn peek(&self) -> u64 {
        self.next.load(Ordering::Acquire)
    }
}

impl Default for NodeIdGen {
    fn default() -> Self {
        Self::new()
    }
}

/// Everything a tree write needs to know about the writer.
#[derive(Clone, Copy, Debug)]
pub struct CowContext<'a> {
    /// The snapshot performing the write; nodes it owns may be edited in place.
    pub owner: SnapshotId,
    /// Allocator for the IDs of copied and split nodes.
    pub ids: &'a NodeIdGen,
    /// Maximum number of entries per node.
    pub fanout: usize,
}

impl<'a> CowContext<'a> {
    pub fn new(owner: SnapshotId, ids: &'a NodeIdGen, fanout: usize) -> TreeResult<Self> {
        if fanout < MIN_FANOUT {
            return Err(TreeError::InvalidFanout {
                fanout,
                min: MIN_FANOUT,
            });
        }
        Ok(Self { owner, ids, fanout })
    }

    /// Entry count below which a node is merged into a neighbour.
    pub(crate) fn underflow(&self) -> usize {
        self.fanout / 4
    }
}
