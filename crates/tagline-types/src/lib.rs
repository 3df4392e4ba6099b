#![forbid(unsafe_code)]
//! Core identifiers and array geometry for the tagline driver.
//!
//! Unit-carrying newtypes prevent mixing disk numbers, per-disk block
//! offsets and per-tagline block indices; `ArrayGeometry` captures the
//! environment-provided shape of the remote RAID array.

use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

/// Default number of physical disks in the array.
pub const DEFAULT_DISK_COUNT: u8 = 8;
/// Default number of blocks per disk.
pub const DEFAULT_DISK_BLOCKS: u32 = 4096;
/// Default block size in bytes.
pub const DEFAULT_BLOCK_SIZE: usize = 1024;
/// Default number of blocks per track (INIT sizing only).
pub const DEFAULT_TRACK_BLOCKS: u32 = 64;
/// Default largest legal block index within one tagline.
pub const DEFAULT_MAX_TAG_BLOCKS: u32 = 1024;
/// Default block cache capacity in lines.
pub const DEFAULT_CACHE_CAPACITY: usize = 1024;

/// Physical disk number within the array.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct DiskId(pub u8);

/// Block offset within one physical disk.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct BlockOffset(pub u32);

/// Tagline number (a logical stream of blocks).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct TagId(pub u32);

/// Block index within one tagline.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct TagBlock(pub u32);

/// One physical copy of a logical block: a disk and an offset on it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct BlockLocation {
    pub disk: DiskId,
    pub offset: BlockOffset,
}

impl BlockOffset {
    /// Add a block count, returning `None` on overflow.
    #[must_use]
    pub fn checked_add(self, count: u32) -> Option<Self> {
        self.0.checked_add(count).map(Self)
    }
}

impl TagBlock {
    /// Add a block count, returning `None` on overflow.
    #[must_use]
    pub fn checked_add(self, count: u32) -> Option<Self> {
        self.0.checked_add(count).map(Self)
    }
}

impl fmt::Display for DiskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl fmt::Display for BlockOffset {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl fmt::Display for TagId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl fmt::Display for TagBlock {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl fmt::Display for BlockLocation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}", self.disk, self.offset)
    }
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum GeometryError {
    #[error("invalid geometry: {field} ({reason})")]
    InvalidField {
        field: &'static str,
        reason: &'static str,
    },
}

/// Shape of the remote RAID array.
///
/// These values are dictated by the environment the driver runs against;
/// defaults mirror the reference array. `validate()` must pass before the
/// geometry is used to build opcodes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ArrayGeometry {
    /// Number of physical disks.
    pub disk_count: u8,
    /// Blocks per disk.
    pub disk_blocks: u32,
    /// Bytes per block.
    pub block_size: usize,
    /// Blocks per track; only feeds the INIT opcode sizing.
    pub track_blocks: u32,
    /// Largest legal block index within one tagline, exclusive.
    pub max_tag_blocks: u32,
}

impl Default for ArrayGeometry {
    fn default() -> Self {
        Self {
            disk_count: DEFAULT_DISK_COUNT,
            disk_blocks: DEFAULT_DISK_BLOCKS,
            block_size: DEFAULT_BLOCK_SIZE,
            track_blocks: DEFAULT_TRACK_BLOCKS,
            max_tag_blocks: DEFAULT_MAX_TAG_BLOCKS,
        }
    }
}

impl ArrayGeometry {
    /// Check that every field is usable and that the opcode fields derived
    /// from this geometry fit their 8-bit slots.
    pub fn validate(&self) -> Result<(), GeometryError> {
        if self.disk_count < 2 {
            return Err(GeometryError::InvalidField {
                field: "disk_count",
                reason: "mirroring needs at least two disks",
            });
        }
        if self.disk_blocks == 0 {
            return Err(GeometryError::InvalidField {
                field: "disk_blocks",
                reason: "must be non-zero",
            });
        }
        if self.block_size == 0 {
            return Err(GeometryError::InvalidField {
                field: "block_size",
                reason: "must be non-zero",
            });
        }
        if self.track_blocks == 0 {
            return Err(GeometryError::InvalidField {
                field: "track_blocks",
                reason: "must be non-zero",
            });
        }
        if self.max_tag_blocks == 0 {
            return Err(GeometryError::InvalidField {
                field: "max_tag_blocks",
                reason: "must be non-zero",
            });
        }
        if self.disk_blocks / self.track_blocks + 3 > u32::from(u8::MAX) {
            return Err(GeometryError::InvalidField {
                field: "track_blocks",
                reason: "disk_blocks / track_blocks + 3 must fit in 8 bits",
            });
        }
        Ok(())
    }

    /// Block quantity carried by the INIT request.
    ///
    /// Call only after `validate()`; the quotient is checked there to fit.
    #[must_use]
    #[allow(clippy::cast_possible_truncation)] // bounded by validate()
    pub fn init_block_quantity(&self) -> u8 {
        (self.disk_blocks / self.track_blocks + 3) as u8
    }

    /// Bytes occupied by `count` whole blocks.
    #[must_use]
    pub fn span_bytes(&self, count: u32) -> usize {
        self.block_size * count as usize
    }
}
