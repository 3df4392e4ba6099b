//! The `(tag, tag_block) → (primary, backup)` placement table.

use crate::disk_table::{DiskStatus, DiskTable};
use tagline_types::{BlockLocation, TagBlock, TagId};

/// One of the two mirror copies of a cell.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Side {
    Primary,
    Backup,
}

impl Side {
    #[must_use]
    pub fn other(self) -> Self {
        match self {
            Self::Primary => Self::Backup,
            Self::Backup => Self::Primary,
        }
    }
}

/// Placement of one logical block: its two physical copies.
///
/// `None` means the side has never been written.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MirrorCell {
    pub primary: Option<BlockLocation>,
    pub backup: Option<BlockLocation>,
}

impl MirrorCell {
    #[must_use]
    pub fn side(&self, side: Side) -> Option<BlockLocation> {
        match side {
            Side::Primary => self.primary,
            Side::Backup => self.backup,
        }
    }

    pub fn set_side(&mut self, side: Side, location: BlockLocation) {
        match side {
            Side::Primary => self.primary = Some(location),
            Side::Backup => self.backup = Some(location),
        }
    }
}

/// Dense placement table plus the per-tag block counters.
///
/// Fully allocated at init; no allocation afterwards.
#[derive(Debug)]
pub struct TagMap {
    max_tags: u32,
    max_tag_blocks: u32,
    cells: Vec<MirrorCell>,
    counts: Vec<u32>,
}

impl TagMap {
    #[must_use]
    pub fn new(max_tags: u32, max_tag_blocks: u32) -> Self {
        let cell_count = max_tags as usize * max_tag_blocks as usize;
        Self {
            max_tags,
            max_tag_blocks,
            cells: vec![MirrorCell::default(); cell_count],
            counts: vec![0; max_tags as usize],
        }
    }

    #[must_use]
    pub fn max_tags(&self) -> u32 {
        self.max_tags
    }

    #[must_use]
    pub fn max_tag_blocks(&self) -> u32 {
        self.max_tag_blocks
    }

    fn index(&self, tag: TagId, block: TagBlock) -> usize {
        debug_assert!(tag.0 < self.max_tags);
        debug_assert!(block.0 < self.max_tag_blocks);
        tag.0 as usize * self.max_tag_blocks as usize + block.0 as usize
    }

    #[must_use]
    pub fn cell(&self, tag: TagId, block: TagBlock) -> &MirrorCell {
        &self.cells[self.index(tag, block)]
    }

    pub fn cell_mut(&mut self, tag: TagId, block: TagBlock) -> &mut MirrorCell {
        let index = self.index(tag, block);
        &mut self.cells[index]
    }

    /// One past the highest block ever written on this tag.
    #[must_use]
    pub fn count(&self, tag: TagId) -> u32 {
        self.counts[tag.0 as usize]
    }

    /// Raise the tag's counter to `one_past_end` (never lowers it).
    pub fn raise_count(&mut self, tag: TagId, one_past_end: u32) {
        let slot = &mut self.counts[tag.0 as usize];
        *slot = (*slot).max(one_past_end);
    }

    /// Diagnostic sweep of the placement invariants; used by tests.
    ///
    /// For every cell below its tag's counter that is mapped on either
    /// side: both sides must be mapped, on distinct `Ready` disks, at
    /// offsets under the disk's high-water mark.
    pub fn check_invariants(&self, disks: &DiskTable) -> std::result::Result<(), String> {
        for tag_raw in 0..self.max_tags {
            let tag = TagId(tag_raw);
            for block_raw in 0..self.count(tag) {
                let block = TagBlock(block_raw);
                let cell = self.cell(tag, block);
                let (Some(primary), Some(backup)) = (cell.primary, cell.backup) else {
                    if cell.primary.is_some() || cell.backup.is_some() {
                        return Err(format!("tag {tag} block {block}: half-mapped cell"));
                    }
                    continue; // hole left by a gap append
                };
                if primary.disk == backup.disk {
                    return Err(format!(
                        "tag {tag} block {block}: mirror copies share disk {}",
                        primary.disk
                    ));
                }
                for location in [primary, backup] {
                    let slot = disks.slot(location.disk);
                    if slot.status != DiskStatus::Ready {
                        return Err(format!(
                            "tag {tag} block {block}: disk {} is not ready",
                            location.disk
                        ));
                    }
                    if location.offset.0 >= slot.used() {
                        return Err(format!(
                            "tag {tag} block {block}: offset {} beyond high-water {}",
                            location.offset,
                            slot.used()
                        ));
                    }
                }
            }
        }
        Ok(())
    }
}
