use std::sync::Arc;

use memoria_types::{SnapshotId, SnapshotStatus};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::history::HistoryNode;
use crate::store::{BlockStore, StoreState};

/// Outcome of [`BlockStore::pack`].
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PackReport {
    /// Dropped snapshots with no children that were deleted.
    pub removed: usize,
    /// Snapshots spliced out of the version tree, their children moved up to
    /// their parent.
    pub elided: usize,
}

impl BlockStore {
    /// Compact the version tree.
    ///
    /// Works bottom-up. Unreferenced dropped snapshots are deleted, with any
    /// children they still have reattached to their parent. A committed
    /// snapshot with exactly one child is spliced out the same way unless it
    /// is the root, the master head, a branch target or still open somewhere.
    pub fn pack(&self) -> PackReport {
        let mut state = self.lock();
        let mut report = PackReport::default();
        let order = state.preorder();

        for node in order.iter().rev() {
            let id = node.id();
            if id == state.root {
                continue;
            }
            let (status, children, references) = {
                let st = node.lock();
                (st.status, st.children.clone(), st.references)
            };
            if references > 0 {
                continue;
            }
            match status {
                SnapshotStatus::Dropped if children.is_empty() => {
                    report.removed += state.reap(id);
                }
                SnapshotStatus::Dropped => {
                    splice_out(&mut state, node, &children);
                    report.elided += 1;
                }
                SnapshotStatus::Committed
                    if children.len() == 1 && state.protection(id).is_none() =>
                {
                    splice_out(&mut state, node, &children);
                    report.elided += 1;
                }
                _ => {}
            }
        }

        info!(removed = report.removed, elided = report.elided, "version tree packed");
        report
    }
}

/// Remove `node` and hand its children to its parent, in its place.
fn splice_out(state: &mut StoreState, node: &Arc<HistoryNode>, children: &[SnapshotId]) {
    let id = node.id();
    let Some(parent) = node.parent() else {
        return;
    };
    if let Some(p) = state.history.get(&parent) {
        p.lock().replace_child(id, children);
    }
    for child in children {
        if let Some(c) = state.history.get(child) {
            c.lock().parent = Some(parent);
        }
    }
    state.history.remove(&id);
    debug!(
        snapshot = %id.short_hex(),
        parent = %parent.short_hex(),
        children = children.len(),
        "snapshot elided"
    );
}
