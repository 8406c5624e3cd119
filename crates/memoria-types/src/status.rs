use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::TypeError;

/// Lifecycle state of a snapshot.
///
/// ```text
/// Active --commit--> Committed --branch--> (new Active child)
/// Active --lock_data--> DataLocked --commit--> Committed
/// Active | Committed --drop--> Dropped (terminal)
/// ```
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SnapshotStatus {
    /// Open for writes by exactly one handle.
    Active,
    /// Frozen; may be branched from and read concurrently.
    Committed,
    /// Data frozen for bulk import, not yet committed.
    DataLocked,
    /// Marked for removal; physically deleted once unreferenced.
    Dropped,
}

impl SnapshotStatus {
    /// Wire code of this status.
    pub fn code(&self) -> u32 {
        match self {
            Self::Active => 0,
            Self::Committed => 1,
            Self::DataLocked => 2,
            Self::Dropped => 3,
        }
    }

    pub fn from_code(code: u32) -> Result<Self, TypeError> {
        match code {
            0 => Ok(Self::Active),
            1 => Ok(Self::Committed),
            2 => Ok(Self::DataLocked),
            3 => Ok(Self::Dropped),
            other => Err(TypeError::UnknownStatus(other)),
        }
    }

    /// Whether block contents may be read through a snapshot in this state.
    pub fn is_readable(&self) -> bool {
        !matches!(self, Self::Dropped)
    }

    /// Whether the snapshot holds work that has not been committed.
    pub fn is_uncommitted(&self) -> bool {
        matches!(self, Self::Active | Self::DataLocked)
    }
}

impl fmt::Display for SnapshotStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Active => "active",
            Self::Committed => "committed",
            Self::DataLocked => "data-locked",
            Self::Dropped => "dropped",
        };
        f.write_str(name)
    }
}
