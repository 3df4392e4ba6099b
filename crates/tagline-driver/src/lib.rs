#![forbid(unsafe_code)]
//! Mirrored tagline block-storage driver.
//!
//! Presents numbered logical streams ("taglines") of fixed-size blocks on
//! top of a remote RAID array reached over the bus. Every logical block is
//! stored twice, on two distinct disks; reads are served from the primary
//! copy (through the write-through cache) and a failed disk is rebuilt
//! from its mirrors during `status_poll`.

mod disk_table;
mod picker;
mod tag_map;

pub use disk_table::{DiskSlot, DiskStatus, DiskTable};
pub use tag_map::{MirrorCell, Side, TagMap};
pub use tagline_bus::{BusConfig, Payload, RaidBus, TcpRaidBus};
pub use tagline_cache::CacheStats;

use picker::DiskPicker;
use serde::{Deserialize, Serialize};
use tagline_cache::BlockCache;
use tagline_error::{Result, TagError};
use tagline_types::{
    ArrayGeometry, BlockLocation, BlockOffset, DiskId, TagBlock, TagId, DEFAULT_CACHE_CAPACITY,
};
use tagline_wire::{RaidOp, RequestType, DISK_FAILED};
use tracing::{info, warn};

/// Bounded random draws before disk selection falls back to a scan.
const MAX_DRAWS: usize = 64;

/// Everything `init` needs to build a driver.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DriverConfig {
    /// Number of taglines the driver will address.
    pub max_tags: u32,
    /// Block cache capacity in lines.
    pub cache_capacity: usize,
    /// Pin the disk-selection RNG; `None` seeds from the clock.
    pub seed: Option<u64>,
    pub geometry: ArrayGeometry,
    pub bus: BusConfig,
}

impl Default for DriverConfig {
    fn default() -> Self {
        Self {
            max_tags: 64,
            cache_capacity: DEFAULT_CACHE_CAPACITY,
            seed: None,
            geometry: ArrayGeometry::default(),
            bus: BusConfig::default(),
        }
    }
}

impl DriverConfig {
    #[must_use]
    pub fn new(max_tags: u32) -> Self {
        Self {
            max_tags,
            ..Self::default()
        }
    }
}

/// The driver: placement table, disk table, cache and bus in one value.
///
/// Constructed by [`TaglineDriver::init`], consumed by
/// [`TaglineDriver::close`]. Single-threaded; every operation takes
/// `&mut self` and at most one request is on the wire at a time.
#[derive(Debug)]
pub struct TaglineDriver<B: RaidBus> {
    geometry: ArrayGeometry,
    bus: B,
    cache: BlockCache,
    disks: DiskTable,
    tags: TagMap,
    picker: DiskPicker,
}

impl TaglineDriver<TcpRaidBus> {
    /// Connect to the configured RAID server and initialize the array.
    pub fn connect(config: DriverConfig) -> Result<Self> {
        let bus = TcpRaidBus::new(config.bus.clone(), config.geometry.block_size);
        Self::init(config, bus)
    }
}

impl<B: RaidBus> TaglineDriver<B> {
    /// Build the driver state, INIT the array and FORMAT every disk.
    ///
    /// On failure the partially-built value is dropped before returning,
    /// releasing everything acquired so far.
    pub fn init(config: DriverConfig, bus: B) -> Result<Self> {
        config
            .geometry
            .validate()
            .map_err(|error| TagError::Init(error.to_string()))?;
        if config.max_tags == 0 {
            return Err(TagError::Init("max_tags must be non-zero".to_owned()));
        }
        let cache = BlockCache::new(config.cache_capacity, config.geometry.block_size)
            .map_err(|error| TagError::Init(error.to_string()))?;

        let geometry = config.geometry;
        let picker = match config.seed {
            Some(seed) => DiskPicker::new(seed),
            None => DiskPicker::from_entropy(),
        };
        let mut driver = Self {
            geometry,
            bus,
            cache,
            disks: DiskTable::new(geometry.disk_count, geometry.disk_blocks),
            tags: TagMap::new(config.max_tags, geometry.max_tag_blocks),
            picker,
        };

        let init = RaidOp::new(
            RequestType::Init,
            geometry.init_block_quantity(),
            geometry.disk_count,
            0,
        );
        driver.exchange(init, Payload::None)?;

        for raw in 0..geometry.disk_count {
            let disk = DiskId(raw);
            if driver.disks.slot(disk).status == DiskStatus::Uninitialized {
                driver.exchange(RaidOp::new(RequestType::Format, 0, raw, 0), Payload::None)?;
                driver.disks.slot_mut(disk).status = DiskStatus::Ready;
            }
        }

        info!(
            target: "tagline::driver",
            max_tags = config.max_tags,
            disks = geometry.disk_count,
            "initialized tagline storage",
        );
        Ok(driver)
    }

    /// Read whole blocks starting at `start` into `out`.
    ///
    /// `out` must be a non-zero whole number of blocks, at most 255.
    pub fn read(&mut self, tag: TagId, start: TagBlock, out: &mut [u8]) -> Result<()> {
        let count = self.whole_blocks(out.len(), "read")?;
        self.check_span(tag, start, u32::from(count))?;
        let block_size = self.geometry.block_size;

        for i in 0..u32::from(count) {
            let block = TagBlock(start.0 + i);
            let Some(location) = self.tags.cell(tag, block).primary else {
                return Err(TagError::Unmapped {
                    tag: tag.0,
                    block: block.0,
                });
            };
            let span = i as usize * block_size..(i as usize + 1) * block_size;
            let cached = match self.cache.get(location.disk, location.offset) {
                Some(data) => {
                    out[span.clone()].copy_from_slice(data);
                    true
                }
                None => false,
            };
            if !cached {
                let request =
                    RaidOp::new(RequestType::Read, 1, location.disk.0, location.offset.0);
                self.exchange(request, Payload::Read(&mut out[span.clone()]))?;
                self.cache.put(location.disk, location.offset, &out[span]);
            }
        }

        info!(
            target: "tagline::driver",
            tag = tag.0,
            start = start.0,
            blocks = count,
            "read",
        );
        Ok(())
    }

    /// Write whole blocks starting at `start` from `data`.
    ///
    /// Appends past the tag's counter go to a fresh pair of disks as two
    /// mirrored bulk writes; rewrites reuse the existing placement,
    /// extending it cell-by-cell where the run leaves mapped territory.
    pub fn write(&mut self, tag: TagId, start: TagBlock, data: &[u8]) -> Result<()> {
        let count = self.whole_blocks(data.len(), "write")?;
        self.check_span(tag, start, u32::from(count))?;
        let count32 = u32::from(count);

        let rewrite = start.0 < self.tags.count(tag);
        // A rewrite's pair only matters if the run leaves mapped territory;
        // capacity is re-checked per allocated cell, so draw leniently and
        // never fail an in-place overwrite on a full array.
        let (primary_pick, backup_pick) = if rewrite {
            self.pick_distinct_pair()
        } else {
            let primary = self.pick_fitting_disk(count32, None)?;
            let backup = self.pick_fitting_disk(count32, Some(primary))?;
            (primary, backup)
        };

        if rewrite {
            self.rewrite_side(Side::Primary, tag, start, count32, data, primary_pick, backup_pick)?;
            self.rewrite_side(Side::Backup, tag, start, count32, data, backup_pick, primary_pick)?;
        } else {
            self.append(tag, start, count, data, primary_pick, backup_pick)?;
        }
        self.tags.raise_count(tag, start.0 + count32);

        info!(
            target: "tagline::driver",
            tag = tag.0,
            start = start.0,
            blocks = count,
            rewrite,
            "wrote",
        );
        Ok(())
    }

    /// Poll every disk's STATUS and rebuild any that report failure.
    pub fn status_poll(&mut self) -> Result<()> {
        for raw in 0..self.geometry.disk_count {
            let disk = DiskId(raw);
            let response =
                self.exchange(RaidOp::new(RequestType::Status, 0, raw, 0), Payload::None)?;
            if response.id == DISK_FAILED {
                warn!(target: "tagline::driver", disk = raw, "disk failed, rebuilding from mirrors");
                self.disks.slot_mut(disk).status = DiskStatus::Failed;
                self.recover(disk).map_err(|error| TagError::RecoveryFailed {
                    disk: raw,
                    source: Box::new(error),
                })?;
            }
        }
        Ok(())
    }

    /// CLOSE the server connection and tear the driver down.
    pub fn close(mut self) -> Result<()> {
        self.exchange(RaidOp::new(RequestType::Close, 0, 0, 0), Payload::None)?;
        self.cache.log_summary();
        info!(target: "tagline::driver", "tagline storage closed");
        Ok(())
    }

    #[must_use]
    pub fn cache_stats(&self) -> CacheStats {
        self.cache.stats()
    }

    #[must_use]
    pub fn geometry(&self) -> ArrayGeometry {
        self.geometry
    }

    /// One past the highest block ever written on this tag.
    #[must_use]
    pub fn tag_count(&self, tag: TagId) -> u32 {
        self.tags.count(tag)
    }

    /// Placement of one logical block.
    #[must_use]
    pub fn mapping(&self, tag: TagId, block: TagBlock) -> MirrorCell {
        *self.tags.cell(tag, block)
    }

    /// The disk's next unwritten offset (its high-water mark).
    #[must_use]
    pub fn disk_next_free(&self, disk: DiskId) -> BlockOffset {
        self.disks.slot(disk).next_free()
    }

    #[must_use]
    pub fn disk_status(&self, disk: DiskId) -> DiskStatus {
        self.disks.slot(disk).status
    }

    /// Diagnostic sweep of the placement invariants; used by tests.
    pub fn check_invariants(&self) -> std::result::Result<(), String> {
        self.tags.check_invariants(&self.disks)
    }

    fn exchange(&mut self, request: RaidOp, payload: Payload<'_>) -> Result<RaidOp> {
        let response = self.bus.exchange(request, payload)?;
        tagline_wire::verify_response(&request, &response)?;
        Ok(response)
    }

    fn whole_blocks(&self, len: usize, direction: &'static str) -> Result<u8> {
        let block_size = self.geometry.block_size;
        if len == 0 || len % block_size != 0 {
            return Err(TagError::InvalidArgument(format!(
                "{direction} buffer must be a non-zero multiple of {block_size} bytes, got {len}"
            )));
        }
        let count = len / block_size;
        u8::try_from(count).map_err(|_| {
            TagError::InvalidArgument(format!(
                "{direction} spans {count} blocks; the opcode carries at most 255"
            ))
        })
    }

    fn check_span(&self, tag: TagId, start: TagBlock, count: u32) -> Result<()> {
        if tag.0 >= self.tags.max_tags() {
            return Err(TagError::InvalidArgument(format!(
                "tag {tag} out of range (max_tags = {})",
                self.tags.max_tags()
            )));
        }
        let end = start.checked_add(count).ok_or_else(|| {
            TagError::InvalidArgument(format!("block span {start}+{count} overflows"))
        })?;
        if end.0 > self.geometry.max_tag_blocks {
            return Err(TagError::InvalidArgument(format!(
                "blocks {start}..{end} exceed the tagline limit of {}",
                self.geometry.max_tag_blocks
            )));
        }
        Ok(())
    }

    /// Draw a Ready disk with room for `blocks`, avoiding `exclude`.
    ///
    /// Random draws are bounded; a deterministic scan finishes the job so
    /// a pathological seed cannot spin forever.
    fn pick_fitting_disk(&mut self, blocks: u32, exclude: Option<DiskId>) -> Result<DiskId> {
        for _ in 0..MAX_DRAWS {
            let disk = self.picker.pick_disk(self.geometry.disk_count);
            if Some(disk) != exclude && self.disks.fits(disk, blocks) {
                return Ok(disk);
            }
        }
        for raw in 0..self.geometry.disk_count {
            let disk = DiskId(raw);
            if Some(disk) != exclude && self.disks.fits(disk, blocks) {
                return Ok(disk);
            }
        }
        Err(TagError::DiskFull { blocks })
    }

    /// Two distinct disks, capacity unchecked.
    fn pick_distinct_pair(&mut self) -> (DiskId, DiskId) {
        let primary = self.picker.pick_disk(self.geometry.disk_count);
        for _ in 0..MAX_DRAWS {
            let backup = self.picker.pick_disk(self.geometry.disk_count);
            if backup != primary {
                return (primary, backup);
            }
        }
        // disk_count >= 2 is validated at init
        let backup = DiskId((primary.0 + 1) % self.geometry.disk_count);
        (primary, backup)
    }

    /// Qualify the side's chosen disk for allocating `block`: it must not
    /// collide with the cell's mirror copy (or, while the mirror is still
    /// unallocated, with the other side's chosen disk) and must have room.
    fn pick_side_disk(
        &mut self,
        side: Side,
        tag: TagId,
        block: TagBlock,
        current: DiskId,
        other_pick: DiskId,
    ) -> Result<DiskId> {
        let forbidden = match self.tags.cell(tag, block).side(side.other()) {
            Some(mirror) => mirror.disk,
            None => other_pick,
        };
        if current != forbidden && self.disks.fits(current, 1) {
            return Ok(current);
        }
        for _ in 0..MAX_DRAWS {
            let disk = self.picker.pick_disk(self.geometry.disk_count);
            if disk != forbidden && self.disks.fits(disk, 1) {
                return Ok(disk);
            }
        }
        for raw in 0..self.geometry.disk_count {
            let disk = DiskId(raw);
            if disk != forbidden && self.disks.fits(disk, 1) {
                return Ok(disk);
            }
        }
        Err(TagError::DiskFull { blocks: 1 })
    }

    /// Append `count` fresh blocks: one bulk write per mirror side.
    fn append(
        &mut self,
        tag: TagId,
        start: TagBlock,
        count: u8,
        data: &[u8],
        primary: DiskId,
        backup: DiskId,
    ) -> Result<()> {
        let primary_base = self.disks.slot(primary).next_free();
        let backup_base = self.disks.slot(backup).next_free();

        self.exchange(
            RaidOp::new(RequestType::Write, count, primary.0, primary_base.0),
            Payload::Write(data),
        )?;
        self.exchange(
            RaidOp::new(RequestType::Write, count, backup.0, backup_base.0),
            Payload::Write(data),
        )?;

        let block_size = self.geometry.block_size;
        for i in 0..u32::from(count) {
            let chunk = &data[i as usize * block_size..(i as usize + 1) * block_size];
            let primary_loc = BlockLocation {
                disk: primary,
                offset: BlockOffset(primary_base.0 + i),
            };
            let backup_loc = BlockLocation {
                disk: backup,
                offset: BlockOffset(backup_base.0 + i),
            };
            self.cache.put(primary_loc.disk, primary_loc.offset, chunk);
            self.cache.put(backup_loc.disk, backup_loc.offset, chunk);
            let cell = self.tags.cell_mut(tag, TagBlock(start.0 + i));
            cell.primary = Some(primary_loc);
            cell.backup = Some(backup_loc);
        }
        self.disks.slot_mut(primary).advance(u32::from(count));
        self.disks.slot_mut(backup).advance(u32::from(count));
        Ok(())
    }

    /// Longest already-mapped run from `start` that is strictly
    /// sequential on one disk, capped at `count`. `None` when the first
    /// cell is unmapped on this side.
    fn contiguous_run(
        &self,
        side: Side,
        tag: TagId,
        start: TagBlock,
        count: u32,
    ) -> Option<(BlockLocation, u32)> {
        let origin = self.tags.cell(tag, start).side(side)?;
        let mut run = 1;
        while run < count {
            match self.tags.cell(tag, TagBlock(start.0 + run)).side(side) {
                Some(next)
                    if next.disk == origin.disk && next.offset.0 == origin.offset.0 + run =>
                {
                    run += 1;
                }
                _ => break,
            }
        }
        Some((origin, run))
    }

    /// Rewrite one mirror side: bulk-write the contiguous prefix, then
    /// walk the remainder cell-by-cell, overwriting mapped cells in place
    /// and allocating unmapped ones at the end of the side's chosen disk.
    #[allow(clippy::too_many_arguments)]
    fn rewrite_side(
        &mut self,
        side: Side,
        tag: TagId,
        start: TagBlock,
        count: u32,
        data: &[u8],
        mut chosen: DiskId,
        other_pick: DiskId,
    ) -> Result<()> {
        let block_size = self.geometry.block_size;

        let prefix = match self.contiguous_run(side, tag, start, count) {
            Some((origin, run)) => {
                #[allow(clippy::cast_possible_truncation)] // run <= count <= 255
                let quantity = run as u8;
                self.exchange(
                    RaidOp::new(RequestType::Write, quantity, origin.disk.0, origin.offset.0),
                    Payload::Write(&data[..run as usize * block_size]),
                )?;
                for i in 0..run {
                    let chunk = &data[i as usize * block_size..(i as usize + 1) * block_size];
                    self.cache
                        .put(origin.disk, BlockOffset(origin.offset.0 + i), chunk);
                }
                run
            }
            None => 0,
        };
        if prefix >= count {
            return Ok(());
        }

        for j in prefix..count {
            let block = TagBlock(start.0 + j);
            let chunk = &data[j as usize * block_size..(j as usize + 1) * block_size];
            match self.tags.cell(tag, block).side(side) {
                Some(location) => {
                    self.exchange(
                        RaidOp::new(RequestType::Write, 1, location.disk.0, location.offset.0),
                        Payload::Write(chunk),
                    )?;
                    self.cache.put(location.disk, location.offset, chunk);
                }
                None => {
                    chosen = self.pick_side_disk(side, tag, block, chosen, other_pick)?;
                    let offset = self.disks.slot(chosen).next_free();
                    self.exchange(
                        RaidOp::new(RequestType::Write, 1, chosen.0, offset.0),
                        Payload::Write(chunk),
                    )?;
                    self.cache.put(chosen, offset, chunk);
                    self.tags
                        .cell_mut(tag, block)
                        .set_side(side, BlockLocation { disk: chosen, offset });
                    self.disks.slot_mut(chosen).advance(1);
                }
            }
        }
        Ok(())
    }

    /// Rebuild every mirror copy that lived on `disk`.
    ///
    /// Offsets are preserved; the disk's high-water mark is untouched.
    fn recover(&mut self, disk: DiskId) -> Result<()> {
        self.exchange(RaidOp::new(RequestType::Format, 0, disk.0, 0), Payload::None)?;

        let mut block = vec![0_u8; self.geometry.block_size];
        for tag_raw in 0..self.tags.max_tags() {
            let tag = TagId(tag_raw);
            for block_raw in 0..self.tags.count(tag) {
                let cell = *self.tags.cell(tag, TagBlock(block_raw));
                let (Some(primary), Some(backup)) = (cell.primary, cell.backup) else {
                    continue;
                };
                if primary.disk == disk {
                    self.rebuild_copy(primary, backup, &mut block)?;
                }
                if backup.disk == disk {
                    self.rebuild_copy(backup, primary, &mut block)?;
                }
            }
        }

        self.disks.slot_mut(disk).status = DiskStatus::Ready;
        info!(target: "tagline::driver", disk = disk.0, "disk recovered");
        Ok(())
    }

    /// Restore one copy: cached bytes win, otherwise read the mirror.
    fn rebuild_copy(
        &mut self,
        lost: BlockLocation,
        mirror: BlockLocation,
        block: &mut [u8],
    ) -> Result<()> {
        let cached = match self.cache.get(lost.disk, lost.offset) {
            Some(data) => {
                block.copy_from_slice(data);
                true
            }
            None => false,
        };
        if !cached {
            self.exchange(
                RaidOp::new(RequestType::Read, 1, mirror.disk.0, mirror.offset.0),
                Payload::Read(&mut *block),
            )?;
        }
        self.exchange(
            RaidOp::new(RequestType::Write, 1, lost.disk.0, lost.offset.0),
            Payload::Write(&*block),
        )?;
        self.cache.put(lost.disk, lost.offset, block);
        Ok(())
    }
}
