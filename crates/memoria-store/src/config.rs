use std::path::Path;

use memoria_pack::Endian;
use memoria_tree::MIN_FANOUT;
use serde::{Deserialize, Serialize};

use crate::error::{StoreError, StoreResult};

/// Tuning knobs for a block store.
///
/// Every field has a default, so a TOML file only needs the keys it changes:
///
/// ```toml
/// tree_fanout = 32
/// endian = "big"
/// ```
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    /// Maximum entries per persistent-tree node.
    pub tree_fanout: usize,
    /// Largest block, in bytes, that `create_block` and `resize_block` accept.
    pub max_block_size: usize,
    /// Byte order used when writing a store image.
    pub endian: Endian,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            tree_fanout: 64,
            max_block_size: 16 * 1024 * 1024, // 16 MiB
            endian: Endian::Little,
        }
    }
}

impl StoreConfig {
    pub fn from_toml_str(text: &str) -> StoreResult<Self> {
        let config: StoreConfig =
            toml::from_str(text).map_err(|e| StoreError::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_file(path: impl AsRef<Path>) -> StoreResult<Self> {
        let text = std::fs::read_to_string(path)?;
        Self::from_toml_str(&text)
    }

    pub fn to_toml_string(&self) -> StoreResult<String> {
        toml::to_string(self).map_err(|e| StoreError::Config(e.to_string()))
    }

    pub fn validate(&self) -> StoreResult<()> {
        if self.tree_fanout < MIN_FANOUT {
            return Err(StoreError::Config(format!(
                "tree_fanout must be at least {MIN_FANOUT}, got {}",
                self.tree_fanout
            )));
        }
        if self.max_block_size == 0 {
            return Err(StoreError::Config("max_block_size must be positive".into()));
        }
        Ok(())
    }
}
