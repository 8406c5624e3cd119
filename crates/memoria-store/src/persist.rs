//! Writing a store to a record stream and rebuilding it from one.
//!
//! `store` walks the version tree depth-first from the root. Each history
//! record is followed by the tree nodes and data blocks it reaches that have
//! not been written yet, so structure shared between snapshots is written
//! once. `load` reads every record into flat maps first and only then links
//! them, which lets it reject dangling references, duplicates and cycles
//! before any store exists.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::fs::File;
use std::io::{BufReader, BufWriter, Read, Write};
use std::path::Path;
use std::sync::Arc;

use memoria_pack::{
    BranchNodeRecord, DataBlockRecord, HistoryRecord, LeafNodeRecord, LeafRecordEntry,
    MetadataRecord, Record, RecordReader, RecordWriter,
};
use memoria_tree::{Block, BlockRef, BranchEntry, LeafEntry, Node, NodeBody, NodeIdGen, PersistentTree};
use memoria_types::{BlockId, NodeId, SnapshotId, SnapshotStatus};
use tracing::{debug, info, warn};

use crate::codec::{BlockHeader, TypeRegistry};
use crate::config::StoreConfig;
use crate::error::{StoreError, StoreResult};
use crate::history::{HistoryNode, HistoryState};
use crate::names::validate_branch_name;
use crate::store::{BlockStore, StoreState};

/// Deepest persistent tree a stream may describe. A tree with a fanout of at
/// least four never gets close for any count of 64-bit node IDs.
const MAX_TREE_DEPTH: usize = 64;

fn corrupt(msg: impl Into<String>) -> StoreError {
    StoreError::Format(msg.into())
}

// ---------------------------------------------------------------------------
// Writing
// ---------------------------------------------------------------------------

/// Emits tree nodes and data blocks, each at most once per stream.
struct TreeEmitter<'a, W: Write> {
    writer: RecordWriter<W>,
    registry: &'a TypeRegistry,
    nodes: HashSet<NodeId>,
    blocks: HashSet<BlockId>,
}

impl<'a, W: Write> TreeEmitter<'a, W> {
    fn new(writer: RecordWriter<W>, registry: &'a TypeRegistry) -> Self {
        Self {
            writer,
            registry,
            nodes: HashSet::new(),
            blocks: HashSet::new(),
        }
    }

    fn history(&mut self, node: &HistoryNode, children: Vec<SnapshotId>) -> StoreResult<()> {
        let (record, tree) = {
            let st = node.lock();
            let record = HistoryRecord {
                status: st.status,
                id: node.id(),
                root: st.tree.root_id(),
                parent: st.parent,
                metadata: st.metadata.clone(),
                children,
            };
            (record, st.tree.clone())
        };
        self.writer.write(&Record::History(record))?;
        if let Some(root) = tree.root() {
            self.subtree(root)?;
        }
        Ok(())
    }

    fn subtree(&mut self, root: &Arc<Node>) -> StoreResult<()> {
        let mut stack = vec![Arc::clone(root)];
        while let Some(node) = stack.pop() {
            if !self.nodes.insert(node.id()) {
                continue;
            }
            match node.body() {
                NodeBody::Branch(entries) => {
                    self.writer.write(&Record::BranchNode(BranchNodeRecord {
                        id: node.id(),
                        owner: node.owner(),
                        entries: entries.iter().map(|e| (e.key, e.child.id())).collect(),
                    }))?;
                    stack.extend(entries.iter().rev().map(|e| Arc::clone(&e.child)));
                }
                NodeBody::Leaf(entries) => {
                    self.writer.write(&Record::LeafNode(LeafNodeRecord {
                        id: node.id(),
                        owner: node.owner(),
                        entries: entries
                            .iter()
                            .map(|e| LeafRecordEntry {
                                key: e.key,
                                uid: e.block.uid(),
                                owner: e.owner,
                            })
                            .collect(),
                    }))?;
                    for entry in entries {
                        self.block(&entry.block)?;
                    }
                }
            }
        }
        Ok(())
    }

    fn block(&mut self, block: &Block) -> StoreResult<()> {
        if !self.blocks.insert(block.uid()) {
            return Ok(());
        }
        let payload = self.registry.get(&block.tag())?.serialize(block)?;
        self.writer.write(&Record::DataBlock(DataBlockRecord {
            id: block.id(),
            uid: block.uid(),
            mem_size: block.size() as u64,
            tag: block.tag(),
            payload,
        }))?;
        Ok(())
    }

    fn finish(self) -> StoreResult<(W, u64)> {
        let records = self.writer.records();
        Ok((self.writer.finish()?, records))
    }
}

impl BlockStore {
    /// Write every snapshot to `out`.
    ///
    /// Fails with [`StoreError::ConcurrentModification`] while any snapshot is
    /// active or data-locked. Dropped snapshots are written only when they
    /// still lead to live descendants.
    pub fn store<W: Write>(&self, out: W) -> StoreResult<W> {
        let state = self.lock();
        let order = state.preorder();
        if let Some(busy) = order.iter().find(|n| n.status().is_uncommitted()) {
            return Err(StoreError::ConcurrentModification {
                snapshot: busy.id(),
            });
        }
        let live = live_snapshots(&state, &order);

        let writer = RecordWriter::new(out, self.config().endian)?;
        let mut emitter = TreeEmitter::new(writer, self.registry());
        emitter.writer.write(&Record::Metadata(MetadataRecord {
            master: state.master,
            root: state.root,
            id_counter: self.shared.ids.peek(),
            branches: state
                .branches
                .iter()
                .map(|(name, id)| (name.clone(), *id))
                .collect(),
        }))?;

        for node in order.iter().filter(|n| live.contains(&n.id())) {
            let children = node
                .children()
                .into_iter()
                .filter(|c| live.contains(c))
                .collect();
            emitter.history(node, children)?;
        }
        let snapshots = live.len();
        let (out, records) = emitter.finish()?;
        info!(snapshots, records, "block store written");
        Ok(out)
    }

    /// Write one committed snapshot as a standalone stream in which it is
    /// the root, the master and the only snapshot.
    pub fn store_snapshot<W: Write>(&self, id: SnapshotId, out: W) -> StoreResult<W> {
        let node = {
            let state = self.lock();
            Arc::clone(state.node(id)?)
        };
        let (record, tree) = {
            let st = node.lock();
            if st.status != SnapshotStatus::Committed {
                return Err(StoreError::InvalidState {
                    snapshot: id,
                    operation: "store",
                    actual: st.status,
                });
            }
            let record = HistoryRecord {
                status: SnapshotStatus::Committed,
                id,
                root: st.tree.root_id(),
                parent: None,
                metadata: st.metadata.clone(),
                children: Vec::new(),
            };
            (record, st.tree.clone())
        };

        let writer = RecordWriter::new(out, self.config().endian)?;
        let mut emitter = TreeEmitter::new(writer, self.registry());
        emitter.writer.write(&Record::Metadata(MetadataRecord {
            master: id,
            root: id,
            id_counter: self.shared.ids.peek(),
            branches: Vec::new(),
        }))?;
        emitter.writer.write(&Record::History(record))?;
        if let Some(root) = tree.root() {
            emitter.subtree(root)?;
        }
        let (out, records) = emitter.finish()?;
        info!(snapshot = %id.short_hex(), records, "snapshot written");
        Ok(out)
    }

    pub fn store_to_path(&self, path: impl AsRef<Path>) -> StoreResult<()> {
        let file = File::create(path.as_ref())?;
        let out = self.store(BufWriter::new(file))?;
        out.into_inner()
            .map_err(|e| StoreError::Io(e.into_error()))?
            .sync_all()?;
        Ok(())
    }

    /// Rebuild a store with the default configuration.
    pub fn load<R: Read>(input: R, registry: Arc<TypeRegistry>) -> StoreResult<Self> {
        Self::load_with_config(input, StoreConfig::default(), registry)
    }

    pub fn load_with_config<R: Read>(
        input: R,
        config: StoreConfig,
        registry: Arc<TypeRegistry>,
    ) -> StoreResult<Self> {
        config.validate()?;
        let reader = RecordReader::new(input)?;
        let endian = reader.endian();
        let records = reader.read_all()?;
        let count = records.len();

        let image = Image::collect(records)?;
        let store = image.build(config, registry)?;
        info!(
            records = count,
            ?endian,
            snapshots = store.lock().history.len(),
            "block store loaded"
        );
        Ok(store)
    }

    pub fn load_from_path(path: impl AsRef<Path>, registry: Arc<TypeRegistry>) -> StoreResult<Self> {
        let file = File::open(path.as_ref())?;
        Self::load(BufReader::new(file), registry)
    }
}

/// Snapshots worth writing: everything except dropped nodes with no
/// non-dropped descendant. The root is always kept.
fn live_snapshots(state: &StoreState, preorder: &[Arc<HistoryNode>]) -> HashSet<SnapshotId> {
    let mut live = HashSet::new();
    // Children come after their parents in pre-order, so walking it backwards
    // settles every child before its parent.
    for node in preorder.iter().rev() {
        let keep = node.id() == state.root
            || node.status() != SnapshotStatus::Dropped
            || node.children().iter().any(|c| live.contains(c));
        if keep {
            live.insert(node.id());
        }
    }
    live
}

// ---------------------------------------------------------------------------
// Loading
// ---------------------------------------------------------------------------

/// Records of one stream, indexed by their on-stream identifiers.
struct Image {
    metadata: MetadataRecord,
    history: HashMap<SnapshotId, HistoryRecord>,
    branch_nodes: HashMap<NodeId, BranchNodeRecord>,
    leaf_nodes: HashMap<NodeId, LeafNodeRecord>,
    blocks: HashMap<BlockId, DataBlockRecord>,
}

impl Image {
    fn collect(records: Vec<Record>) -> StoreResult<Self> {
        let mut records = records.into_iter();
        let metadata = match records.next() {
            Some(Record::Metadata(m)) => m,
            Some(_) => return Err(corrupt("first record is not METADATA")),
            None => return Err(corrupt("stream has no records")),
        };

        let mut image = Image {
            metadata,
            history: HashMap::new(),
            branch_nodes: HashMap::new(),
            leaf_nodes: HashMap::new(),
            blocks: HashMap::new(),
        };
        for record in records {
            match record {
                Record::Metadata(_) => return Err(corrupt("duplicate METADATA record")),
                Record::History(h) => {
                    if h.status.is_uncommitted() {
                        return Err(corrupt(format!(
                            "snapshot {} is stored as {}",
                            h.id, h.status
                        )));
                    }
                    if image.history.insert(h.id, h).is_some() {
                        return Err(corrupt("duplicate HISTORY_NODE record"));
                    }
                }
                Record::BranchNode(b) => {
                    if image.leaf_nodes.contains_key(&b.id)
                        || image.branch_nodes.insert(b.id, b).is_some()
                    {
                        return Err(corrupt("duplicate tree node id"));
                    }
                }
                Record::LeafNode(l) => {
                    if image.branch_nodes.contains_key(&l.id)
                        || image.leaf_nodes.insert(l.id, l).is_some()
                    {
                        return Err(corrupt("duplicate tree node id"));
                    }
                }
                Record::DataBlock(d) => {
                    if image.blocks.insert(d.uid, d).is_some() {
                        return Err(corrupt("duplicate DATA_BLOCK record"));
                    }
                }
            }
        }
        debug!(
            snapshots = image.history.len(),
            nodes = image.branch_nodes.len() + image.leaf_nodes.len(),
            blocks = image.blocks.len(),
            "stream indexed"
        );
        Ok(image)
    }

    fn build(self, config: StoreConfig, registry: Arc<TypeRegistry>) -> StoreResult<BlockStore> {
        let blocks = self.decode_blocks(&registry)?;
        let mut linker = Linker {
            image: &self,
            blocks: &blocks,
            built: HashMap::new(),
            visiting: HashSet::new(),
        };

        let root = self.metadata.root;
        let order = self.check_history()?;
        let mut history = HashMap::with_capacity(order.len());
        for id in order {
            let record = &self.history[&id];
            let tree = match record.root {
                Some(node) => PersistentTree::from_root(Some(linker.node(node)?)),
                None => PersistentTree::new(),
            };
            let state = HistoryState {
                parent: record.parent,
                children: record.children.clone(),
                status: record.status,
                metadata: record.metadata.clone(),
                references: 0,
                tree,
            };
            history.insert(id, Arc::new(HistoryNode::from_state(id, state)));
        }
        let max_node = linker.built.keys().map(|n| n.value()).max();
        let unused_blocks = blocks.len() - linker.used_blocks();
        if unused_blocks > 0 {
            warn!(blocks = unused_blocks, "stream holds unreferenced data blocks");
        }

        let mut branches = BTreeMap::new();
        for (name, target) in &self.metadata.branches {
            validate_branch_name(name).map_err(|e| corrupt(e.to_string()))?;
            require_committed(&history, *target, "branch target")?;
            if branches.insert(name.clone(), *target).is_some() {
                return Err(corrupt(format!("branch {name:?} listed twice")));
            }
        }
        require_committed(&history, self.metadata.master, "master")?;

        let next = max_node.map_or(0, |v| v.saturating_add(1));
        let ids = NodeIdGen::starting_at(self.metadata.id_counter.max(next));
        let state = StoreState {
            history,
            root,
            master: self.metadata.master,
            branches,
        };
        Ok(BlockStore::from_parts(config, registry, ids, state))
    }

    /// Decode every data block through its registered codec, keyed by uid.
    fn decode_blocks(&self, registry: &TypeRegistry) -> StoreResult<HashMap<BlockId, Arc<Block>>> {
        let mut out = HashMap::with_capacity(self.blocks.len());
        for record in self.blocks.values() {
            let header = BlockHeader {
                id: record.id,
                uid: record.uid,
                tag: record.tag,
                mem_size: usize::try_from(record.mem_size)
                    .map_err(|_| corrupt(format!("block {} is too large", record.id)))?,
            };
            let data = registry.get(&record.tag)?.deserialize(&header, &record.payload)?;
            if data.len() != header.mem_size {
                return Err(corrupt(format!(
                    "block {} decoded to {} bytes, expected {}",
                    record.id,
                    data.len(),
                    header.mem_size
                )));
            }
            out.insert(
                record.uid,
                Arc::new(Block::new(record.id, record.uid, record.tag, data)),
            );
        }
        Ok(out)
    }

    /// Check parent and child links and return snapshots in pre-order.
    fn check_history(&self) -> StoreResult<Vec<SnapshotId>> {
        let root = self.metadata.root;
        match self.history.get(&root) {
            Some(r) if r.parent.is_none() => {}
            Some(_) => return Err(corrupt("root snapshot has a parent")),
            None => return Err(corrupt(format!("root snapshot {root} is missing"))),
        }

        let mut order = Vec::with_capacity(self.history.len());
        let mut seen = HashSet::new();
        let mut stack = vec![root];
        while let Some(id) = stack.pop() {
            if !seen.insert(id) {
                return Err(corrupt(format!("snapshot {id} is reachable twice")));
            }
            let record = &self.history[&id];
            for child in record.children.iter().rev() {
                let child_record = self
                    .history
                    .get(child)
                    .ok_or_else(|| corrupt(format!("snapshot {id} lists missing child {child}")))?;
                if child_record.parent != Some(id) {
                    return Err(corrupt(format!(
                        "snapshot {child} does not name {id} as its parent"
                    )));
                }
                stack.push(*child);
            }
            order.push(id);
        }
        if order.len() != self.history.len() {
            return Err(corrupt(format!(
                "{} snapshots are not reachable from the root",
                self.history.len() - order.len()
            )));
        }
        Ok(order)
    }
}

fn require_committed(
    history: &HashMap<SnapshotId, Arc<HistoryNode>>,
    id: SnapshotId,
    role: &str,
) -> StoreResult<()> {
    match history.get(&id) {
        Some(node) if node.status() == SnapshotStatus::Committed => Ok(()),
        Some(node) => Err(corrupt(format!("{role} {id} is {}", node.status()))),
        None => Err(corrupt(format!("{role} {id} is missing"))),
    }
}

/// Turns node records into shared tree nodes, building each node once.
struct Linker<'a> {
    image: &'a Image,
    blocks: &'a HashMap<BlockId, Arc<Block>>,
    built: HashMap<NodeId, Arc<Node>>,
    visiting: HashSet<NodeId>,
}

impl Linker<'_> {
    fn used_blocks(&self) -> usize {
        self.blocks
            .values()
            .filter(|b| b.references() > 0)
            .count()
    }

    fn node(&mut self, id: NodeId) -> StoreResult<Arc<Node>> {
        if let Some(node) = self.built.get(&id) {
            return Ok(Arc::clone(node));
        }
        if self.visiting.len() >= MAX_TREE_DEPTH {
            return Err(corrupt(format!(
                "tree below node {} is deeper than {MAX_TREE_DEPTH} levels",
                id.value()
            )));
        }
        if !self.visiting.insert(id) {
            return Err(corrupt(format!("tree node {} is its own ancestor", id.value())));
        }

        let image = self.image;
        let node = if let Some(leaf) = image.leaf_nodes.get(&id) {
            Node::leaf(id, leaf.owner, self.leaf_entries(leaf)?)
        } else if let Some(branch) = image.branch_nodes.get(&id) {
            Node::branch(id, branch.owner, self.branch_entries(branch)?)
        } else {
            return Err(corrupt(format!("tree node {} is missing", id.value())));
        };

        self.visiting.remove(&id);
        let node = Arc::new(node);
        self.built.insert(id, Arc::clone(&node));
        Ok(node)
    }

    fn leaf_entries(&self, leaf: &LeafNodeRecord) -> StoreResult<Vec<LeafEntry>> {
        check_ascending(leaf.entries.iter().map(|e| e.key), leaf.id)?;
        leaf.entries
            .iter()
            .map(|e| {
                let block = self.blocks.get(&e.uid).ok_or_else(|| {
                    corrupt(format!("data block {} is missing", e.uid))
                })?;
                if block.id() != e.key {
                    return Err(corrupt(format!(
                        "data block {} is keyed {} but stored under {}",
                        e.uid,
                        block.id(),
                        e.key
                    )));
                }
                Ok(LeafEntry {
                    key: e.key,
                    block: BlockRef::new(Arc::clone(block)),
                    owner: e.owner,
                })
            })
            .collect()
    }

    fn branch_entries(&mut self, branch: &BranchNodeRecord) -> StoreResult<Vec<BranchEntry>> {
        if branch.entries.is_empty() {
            return Err(corrupt(format!("branch node {} is empty", branch.id.value())));
        }
        check_ascending(branch.entries.iter().map(|(k, _)| *k), branch.id)?;
        let mut out = Vec::with_capacity(branch.entries.len());
        for (key, child) in &branch.entries {
            let child = self.node(*child)?;
            // Separators are lower bounds; removals never raise them.
            if child.min_key().map_or(true, |min| min < *key) {
                return Err(corrupt(format!(
                    "branch node {} separator is above its child's keys",
                    branch.id.value()
                )));
            }
            out.push(BranchEntry { key: *key, child });
        }
        Ok(out)
    }
}

fn check_ascending(keys: impl Iterator<Item = BlockId>, node: NodeId) -> StoreResult<()> {
    let mut prev: Option<BlockId> = None;
    for key in keys {
        if prev.is_some_and(|p| p >= key) {
            return Err(corrupt(format!("tree node {} keys are out of order", node.value())));
        }
        prev = Some(key);
    }
    Ok(())
}
