use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::TypeError;

macro_rules! uuid_id {
    ($(#[$meta:meta])* $name:ident, $prefix:literal) => {
        $(#[$meta])*
        #[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        pub struct $name(Uuid);

        impl $name {
            /// Draw a fresh random identifier (UUID v4 layout).
            pub fn random() -> Self {
                let bytes: [u8; 16] = rand::random();
                Self(uuid::Builder::from_random_bytes(bytes).into_uuid())
            }

            /// The null identifier (all zeros). Represents "no target".
            pub const fn null() -> Self {
                Self(Uuid::nil())
            }

            /// Returns `true` if this is the null identifier.
            pub fn is_null(&self) -> bool {
                self.0.is_nil()
            }

            pub const fn from_u128(value: u128) -> Self {
                Self(Uuid::from_u128(value))
            }

            pub fn as_u128(&self) -> u128 {
                self.0.as_u128()
            }

            /// Create from the 16 raw bytes (big-endian UUID layout).
            pub const fn from_bytes(bytes: [u8; 16]) -> Self {
                Self(Uuid::from_bytes(bytes))
            }

            /// The 16 raw bytes (big-endian UUID layout).
            pub fn as_bytes(&self) -> &[u8; 16] {
                self.0.as_bytes()
            }

            /// Short hex representation (first 8 characters).
            pub fn short_hex(&self) -> String {
                hex::encode(&self.0.as_bytes()[..4])
            }

            /// Parse from 32 hex characters, with or without the display prefix.
            pub fn from_hex(s: &str) -> Result<Self, TypeError> {
                let s = s.strip_prefix($prefix).unwrap_or(s);
                let bytes = hex::decode(s).map_err(|e| TypeError::InvalidHex(e.to_string()))?;
                let arr: [u8; 16] = bytes
                    .as_slice()
                    .try_into()
                    .map_err(|_| TypeError::InvalidLength {
                        expected: 16,
                        actual: bytes.len(),
                    })?;
                Ok(Self::from_bytes(arr))
            }

            pub fn to_hex(&self) -> String {
                hex::encode(self.0.as_bytes())
            }

            /// `None` for the null identifier.
            pub fn non_null(self) -> Option<Self> {
                if self.is_null() {
                    None
                } else {
                    Some(self)
                }
            }
        }

        impl fmt::Debug for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}({})", stringify!($name), self.short_hex())
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}{}", $prefix, self.to_hex())
            }
        }

        impl FromStr for $name {
            type Err = TypeError;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                Self::from_hex(s)
            }
        }

        impl From<[u8; 16]> for $name {
            fn from(bytes: [u8; 16]) -> Self {
                Self::from_bytes(bytes)
            }
        }
    };
}

uuid_id!(
    /// Identifier of a block.
    ///
    /// Used in two roles: as the logical key under which a block lives in a
    /// snapshot's persistent tree (stable across copy-on-write forks), and as
    /// the payload `uid` naming one physical copy of the bytes (changes on
    /// every fork).
    BlockId,
    "blk:"
);

uuid_id!(
    /// Identifier of a snapshot (a node of the version tree).
    SnapshotId,
    "snp:"
);

impl BlockId {
    /// Reserved key of the per-snapshot root directory block.
    pub const ROOT_DIRECTORY: BlockId = BlockId::from_u128(1);

    /// Returns `true` for keys that the allocator never hands out.
    pub fn is_reserved(&self) -> bool {
        self.is_null() || *self == Self::ROOT_DIRECTORY
    }
}

/// Identifier of a persistent-tree node.
///
/// Node IDs come from a store-wide monotonic counter, so they are unique
/// within one store and survive a store/load round trip unchanged.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct NodeId(u64);

impl NodeId {
    pub const fn new(value: u64) -> Self {
        Self(value)
    }

    /// Zero is never allocated and encodes "no node" on the wire.
    pub const fn null() -> Self {
        Self(0)
    }

    pub fn is_null(&self) -> bool {
        self.0 == 0
    }

    pub fn value(&self) -> u64 {
        self.0
    }
}

impl fmt::Debug for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "NodeId({})", self.0)
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "node:{}", self.0)
    }
}
