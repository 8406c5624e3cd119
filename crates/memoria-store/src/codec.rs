//! Per-type block codecs and the registry that maps type tags to them.
//!
//! The store never interprets block contents. When it writes an image it asks
//! the block's codec for bytes, and when it loads one it asks the codec to turn
//! those bytes back into block content. A [`TypeRegistry`] is passed to the
//! store at construction, so stores with different type sets can coexist.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use memoria_tree::Block;
use memoria_types::{BlockId, TypeTag};

use crate::error::{StoreError, StoreResult};

/// What a codec knows about a block it is asked to decode.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct BlockHeader {
    pub id: BlockId,
    pub uid: BlockId,
    pub tag: TypeTag,
    /// In-memory size the decoded content must have.
    pub mem_size: usize,
}

/// Receives a structural description of blocks.
pub trait BlockWalker {
    fn begin_block(&mut self, id: BlockId, tag: TypeTag, size: usize);
    fn attribute(&mut self, name: &str, value: &str);
    fn end_block(&mut self);
}

/// Encodes, decodes and describes one kind of block.
pub trait BlockCodec: Send + Sync {
    /// Human-readable name of the block kind.
    fn name(&self) -> &str;

    /// Stream bytes for `block`'s content.
    fn serialize(&self, block: &Block) -> StoreResult<Vec<u8>>;

    /// Block content rebuilt from stream bytes.
    fn deserialize(&self, header: &BlockHeader, bytes: &[u8]) -> StoreResult<Vec<u8>>;

    /// Content of `data` resized to `new_size` bytes.
    ///
    /// The default truncates or zero-extends.
    fn resize(&self, data: &[u8], new_size: usize) -> StoreResult<Vec<u8>> {
        let mut out = data.to_vec();
        out.resize(new_size, 0);
        Ok(out)
    }

    /// Report `block` to `walker`.
    fn describe(&self, block: &Block, walker: &mut dyn BlockWalker) {
        walker.begin_block(block.id(), block.tag(), block.size());
        walker.attribute("codec", self.name());
        walker.attribute("uid", &block.uid().to_hex());
        walker.end_block();
    }
}

/// Stores content bytes verbatim.
#[derive(Clone, Debug, Default)]
pub struct RawCodec;

impl BlockCodec for RawCodec {
    fn name(&self) -> &str {
        "raw"
    }

    fn serialize(&self, block: &Block) -> StoreResult<Vec<u8>> {
        Ok(block.to_vec())
    }

    fn deserialize(&self, header: &BlockHeader, bytes: &[u8]) -> StoreResult<Vec<u8>> {
        if bytes.len() != header.mem_size {
            return Err(StoreError::Codec(format!(
                "block {}: {} payload bytes for a {}-byte block",
                header.id,
                bytes.len(),
                header.mem_size
            )));
        }
        Ok(bytes.to_vec())
    }
}

/// Maps type tags to codecs.
#[derive(Clone)]
pub struct TypeRegistry {
    codecs: HashMap<TypeTag, Arc<dyn BlockCodec>>,
}

impl TypeRegistry {
    /// A registry that knows only the store's own root-directory blocks.
    pub fn new() -> Self {
        let mut codecs: HashMap<TypeTag, Arc<dyn BlockCodec>> = HashMap::new();
        codecs.insert(TypeTag::root_directory(), Arc::new(RawCodec));
        Self { codecs }
    }

    /// Register `codec` for `tag`, returning the codec it replaces.
    pub fn register(
        &mut self,
        tag: TypeTag,
        codec: Arc<dyn BlockCodec>,
    ) -> Option<Arc<dyn BlockCodec>> {
        self.codecs.insert(tag, codec)
    }

    /// Builder-style registration of a [`RawCodec`] for `tag`.
    pub fn with_raw(mut self, tag: TypeTag) -> Self {
        self.register(tag, Arc::new(RawCodec));
        self
    }

    pub fn contains(&self, tag: &TypeTag) -> bool {
        self.codecs.contains_key(tag)
    }

    pub fn get(&self, tag: &TypeTag) -> StoreResult<&Arc<dyn BlockCodec>> {
        self.codecs
            .get(tag)
            .ok_or(StoreError::UnknownBlockType(*tag))
    }

    pub fn len(&self) -> usize {
        self.codecs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.codecs.is_empty()
    }
}

impl Default for TypeRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for TypeRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut names: Vec<String> = self
            .codecs
            .iter()
            .map(|(tag, codec)| format!("{tag}={}", codec.name()))
            .collect();
        names.sort();
        f.debug_struct("TypeRegistry").field("codecs", &names).finish()
    }
}

/// A [`BlockWalker`] that collects one line per block, for tests and debugging.
#[derive(Clone, Debug, Default)]
pub struct TextWalker {
    pub lines: Vec<String>,
    current: Option<String>,
}

impl BlockWalker for TextWalker {
    fn begin_block(&mut self, id: BlockId, tag: TypeTag, size: usize) {
        self.current = Some(format!("{id} {tag} size={size}"));
    }

    fn attribute(&mut self, name: &str, value: &str) {
        if let Some(line) = self.current.as_mut() {
            line.push_str(&format!(" {name}={value}"));
        }
    }

    fn end_block(&mut self) {
        if let Some(line) = self.current.take() {
            self.lines.push(line);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn header(size: usize) -> BlockHeader {
        BlockHeader {
            id: BlockId::random(),
            uid: BlockId::random(),
            tag: TypeTag::new(1, 2),
            mem_size: size,
        }
    }

    #[test]
    fn new_registry_knows_root_directory() {
        let registry = TypeRegistry::new();
        assert!(registry.contains(&TypeTag::root_directory()));
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn unknown_tag_is_an_error() {
        let registry = TypeRegistry::new();
        let tag = TypeTag::named("app", "leaf");
        assert!(matches!(
            registry.get(&tag),
            Err(StoreError::UnknownBlockType(t)) if t == tag
        ));
        let registry = registry.with_raw(tag);
        assert_eq!(registry.get(&tag).unwrap().name(), "raw");
    }

    #[test]
    fn raw_codec_checks_size() {
        assert_eq!(RawCodec.deserialize(&header(3), b"abc").unwrap(), b"abc");
        assert!(matches!(
            RawCodec.deserialize(&header(4), b"abc"),
            Err(StoreError::Codec(_))
        ));
    }

    #[test]
    fn default_resize_truncates_and_extends() {
        assert_eq!(RawCodec.resize(b"abcd", 2).unwrap(), b"ab");
        assert_eq!(RawCodec.resize(b"ab", 4).unwrap(), b"ab\0\0");
    }

    #[test]
    fn text_walker_collects_describe_output() {
        let block = Block::new(BlockId::from_u128(9), BlockId::random(), TypeTag::new(1, 2), vec![0; 3]);
        let mut walker = TextWalker::default();
        RawCodec.describe(&block, &mut walker);
        assert_eq!(walker.lines.len(), 1);
        assert!(walker.lines[0].contains("size=3"));
        assert!(walker.lines[0].contains("codec=raw"));
    }
}
