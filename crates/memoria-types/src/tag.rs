use std::fmt;

use serde::{Deserialize, Serialize};

/// Type tag of a block: the owning container type and the concrete block kind.
///
/// Both halves are 64-bit hashes derived from names with domain-separated
/// BLAKE3, so two processes that register the same names agree on the tag
/// without coordination. The store itself never interprets a tag; it only
/// uses it to look up the codec for a block.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct TypeTag {
    /// Hash of the owning container type.
    pub container: u64,
    /// Hash of the block kind within that container.
    pub kind: u64,
}

impl TypeTag {
    pub const fn new(container: u64, kind: u64) -> Self {
        Self { container, kind }
    }

    /// Derive a tag from a container type name and a block kind name.
    pub fn named(container: &str, kind: &str) -> Self {
        Self {
            container: name_hash(b"memoria-container-v1:", container),
            kind: name_hash(b"memoria-block-kind-v1:", kind),
        }
    }

    /// Tag of the store's own root directory block.
    pub fn root_directory() -> Self {
        Self::named("memoria.store", "root-directory")
    }
}

fn name_hash(domain: &[u8], name: &str) -> u64 {
    let mut hasher = blake3::Hasher::new();
    hasher.update(domain);
    hasher.update(name.as_bytes());
    let digest = hasher.finalize();
    let mut head = [0u8; 8];
    head.copy_from_slice(&digest.as_bytes()[..8]);
    u64::from_le_bytes(head)
}

impl fmt::Debug for TypeTag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "TypeTag({:016x}:{:016x})", self.container, self.kind)
    }
}

impl fmt::Display for TypeTag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:016x}:{:016x}", self.container, self.kind)
    }
}
