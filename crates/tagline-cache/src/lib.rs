#![forbid(unsafe_code)]
//! Write-through block cache keyed on `(disk, offset)`.
//!
//! A fixed-capacity array of cache lines with LRU eviction driven by a
//! logical clock: the clock advances on every `get` and `put`, and the
//! line with the smallest stamp is the eviction victim. `put` never
//! implies I/O; the caller owns the backing write.

use tagline_error::{Result, TagError};
use tagline_types::{BlockOffset, DiskId};
use tracing::info;

/// Monotonic counters accumulated over the cache's lifetime.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
    pub inserts: u64,
    pub gets: u64,
}

impl CacheStats {
    /// Hit ratio in [0.0, 1.0]; 0.0 before any access.
    #[must_use]
    pub fn hit_ratio(&self) -> f64 {
        let total = self.hits + self.misses;
        if total == 0 {
            0.0
        } else {
            self.hits as f64 / total as f64
        }
    }
}

#[derive(Debug)]
struct CacheLine {
    disk: DiskId,
    offset: BlockOffset,
    stamp: u64,
    data: Vec<u8>,
}

/// Fixed-capacity write-through block cache.
#[derive(Debug)]
pub struct BlockCache {
    capacity: usize,
    block_size: usize,
    clock: u64,
    stats: CacheStats,
    lines: Vec<CacheLine>,
}

impl BlockCache {
    /// Create an empty cache holding up to `capacity` blocks of
    /// `block_size` bytes each.
    pub fn new(capacity: usize, block_size: usize) -> Result<Self> {
        if capacity == 0 {
            return Err(TagError::InvalidArgument(
                "cache capacity must be non-zero".to_owned(),
            ));
        }
        if block_size == 0 {
            return Err(TagError::InvalidArgument(
                "cache block size must be non-zero".to_owned(),
            ));
        }
        Ok(Self {
            capacity,
            block_size,
            clock: 0,
            stats: CacheStats::default(),
            lines: Vec::with_capacity(capacity),
        })
    }

    #[must_use]
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    #[must_use]
    pub fn block_size(&self) -> usize {
        self.block_size
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.lines.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.lines.is_empty()
    }

    #[must_use]
    pub fn stats(&self) -> CacheStats {
        self.stats
    }

    /// Look up one block. A hit refreshes the line's stamp.
    pub fn get(&mut self, disk: DiskId, offset: BlockOffset) -> Option<&[u8]> {
        self.clock += 1;
        self.stats.gets += 1;
        let found = self
            .lines
            .iter()
            .position(|line| line.disk == disk && line.offset == offset);
        match found {
            Some(index) => {
                self.stats.hits += 1;
                let line = &mut self.lines[index];
                line.stamp = self.clock;
                Some(&line.data)
            }
            None => {
                self.stats.misses += 1;
                None
            }
        }
    }

    /// Store one block, overwriting an existing line with the same key or
    /// evicting the least-recently-stamped line when full.
    ///
    /// `bytes` must be exactly one block.
    pub fn put(&mut self, disk: DiskId, offset: BlockOffset, bytes: &[u8]) {
        debug_assert_eq!(bytes.len(), self.block_size);
        self.clock += 1;
        self.stats.inserts += 1;

        if let Some(line) = self
            .lines
            .iter_mut()
            .find(|line| line.disk == disk && line.offset == offset)
        {
            self.stats.hits += 1;
            line.data.copy_from_slice(bytes);
            line.stamp = self.clock;
            return;
        }

        if self.lines.len() < self.capacity {
            self.lines.push(CacheLine {
                disk,
                offset,
                stamp: self.clock,
                data: bytes.to_vec(),
            });
            return;
        }

        // Evict the smallest stamp; the scan order breaks ties by index.
        self.stats.misses += 1;
        let mut victim = 0;
        for (index, line) in self.lines.iter().enumerate().skip(1) {
            if line.stamp < self.lines[victim].stamp {
                victim = index;
            }
        }
        let line = &mut self.lines[victim];
        line.disk = disk;
        line.offset = offset;
        line.data.copy_from_slice(bytes);
        line.stamp = self.clock;
    }

    /// Emit the lifetime statistics summary; called once, at driver close.
    pub fn log_summary(&self) {
        let stats = self.stats;
        info!(
            target: "tagline::cache",
            inserts = stats.inserts,
            gets = stats.gets,
            hits = stats.hits,
            misses = stats.misses,
            hit_ratio = stats.hit_ratio(),
            "cache statistics",
        );
    }

    #[cfg(test)]
    fn assert_invariants(&self) {
        assert!(self.lines.len() <= self.capacity);
        for (index, line) in self.lines.iter().enumerate() {
            assert!(line.stamp <= self.clock, "stamp beyond clock");
            assert_eq!(line.data.len(), self.block_size);
            for other in &self.lines[index + 1..] {
                assert!(
                    line.disk != other.disk || line.offset != other.offset,
                    "duplicate key {}@{}",
                    line.disk,
                    line.offset
                );
            }
        }
    }
}
