//! Per-disk status and high-water tracking.

use tagline_types::{BlockOffset, DiskId};

/// Lifecycle of one physical disk.
///
/// `Uninitialized -FORMAT-> Ready -failure-> Failed -recover-> Ready`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DiskStatus {
    Uninitialized,
    Ready,
    Failed,
}

/// State of one physical disk.
///
/// Blocks fill linearly from offset 0; `used` counts how many have been
/// written, so offsets `0 .. used` are live and `used` is the next free
/// offset. `used == 0` means the disk is empty.
#[derive(Debug, Clone, Copy)]
pub struct DiskSlot {
    pub status: DiskStatus,
    used: u32,
}

impl DiskSlot {
    fn new() -> Self {
        Self {
            status: DiskStatus::Uninitialized,
            used: 0,
        }
    }

    #[must_use]
    pub fn used(&self) -> u32 {
        self.used
    }

    #[must_use]
    pub fn next_free(&self) -> BlockOffset {
        BlockOffset(self.used)
    }

    #[must_use]
    pub fn remaining(&self, disk_blocks: u32) -> u32 {
        disk_blocks.saturating_sub(self.used)
    }

    pub(crate) fn advance(&mut self, count: u32) {
        self.used += count;
    }
}

/// The disk table: one slot per physical disk.
#[derive(Debug)]
pub struct DiskTable {
    slots: Vec<DiskSlot>,
    disk_blocks: u32,
}

impl DiskTable {
    #[must_use]
    pub fn new(disk_count: u8, disk_blocks: u32) -> Self {
        Self {
            slots: vec![DiskSlot::new(); usize::from(disk_count)],
            disk_blocks,
        }
    }

    #[must_use]
    pub fn disk_count(&self) -> u8 {
        self.slots.len() as u8
    }

    #[must_use]
    pub fn disk_blocks(&self) -> u32 {
        self.disk_blocks
    }

    #[must_use]
    pub fn slot(&self, disk: DiskId) -> &DiskSlot {
        &self.slots[usize::from(disk.0)]
    }

    pub fn slot_mut(&mut self, disk: DiskId) -> &mut DiskSlot {
        &mut self.slots[usize::from(disk.0)]
    }

    /// Ready with at least `blocks` unwritten offsets left.
    #[must_use]
    pub fn fits(&self, disk: DiskId, blocks: u32) -> bool {
        let slot = self.slot(disk);
        slot.status == DiskStatus::Ready && slot.remaining(self.disk_blocks) >= blocks
    }

    pub fn iter(&self) -> impl Iterator<Item = (DiskId, &DiskSlot)> {
        self.slots
            .iter()
            .enumerate()
            .map(|(index, slot)| (DiskId(index as u8), slot))
    }
}
