//! Size-bucketed free-list allocator over one linear byte range.
//!
//! Free regions are indexed twice: by size (`BTreeMap<size, offsets>`) for
//! best-fit acquisition, and by offset for neighbour lookup when a region
//! comes back. Released regions are merged with free neighbours on both
//! sides, so the free list never holds two adjacent entries.
//!
//! No GPU state lives here; `SubAllocator` wraps this with locking and the
//! release thread.

use std::collections::BTreeMap;

use thiserror::Error;

/// Granularity of non-uniform allocations.
pub const MIN_ALIGNMENT: u64 = 4;

/// A byte range `[offset, offset + size)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Region {
    pub offset: u64,
    pub size: u64,
}

impl Region {
    pub fn end(&self) -> u64 {
        self.offset + self.size
    }

    /// `end`, or `None` when the range wraps past `u64::MAX`.
    pub fn checked_end(&self) -> Option<u64> {
        self.offset.checked_add(self.size)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum RegionError {
    #[error("region {0:?} lies outside the {1}-byte range")]
    OutOfBounds(Region, u64),
    #[error("region {0:?} overlaps free region {1:?} (double release?)")]
    Overlap(Region, Region),
    #[error("zero-sized region at {0}")]
    Empty(u64),
}

/// `value` rounded up to a power-of-two `alignment`; `None` on overflow.
pub fn align_up(value: u64, alignment: u64) -> Option<u64> {
    debug_assert!(alignment.is_power_of_two());
    value.checked_add(alignment - 1).map(|v| v & !(alignment - 1))
}

pub struct RegionAllocator {
    capacity: u64,
    uniform_alignment: u64,
    by_size: BTreeMap<u64, Vec<u64>>,
    by_offset: BTreeMap<u64, u64>,
    used: u64,
    high_water: u64,
}

impl RegionAllocator {
    /// `uniform_alignment` is rounded up to a power of two no smaller than
    /// `MIN_ALIGNMENT`.
    pub fn new(capacity: u64, uniform_alignment: u64) -> Self {
        let uniform_alignment = uniform_alignment.max(MIN_ALIGNMENT).next_power_of_two();
        let mut alloc = Self {
            capacity,
            uniform_alignment,
            by_size: BTreeMap::new(),
            by_offset: BTreeMap::new(),
            used: 0,
            high_water: 0,
        };
        if capacity > 0 {
            alloc.insert_free(Region { offset: 0, size: capacity });
        }
        alloc
    }

    pub fn capacity(&self) -> u64 {
        self.capacity
    }

    pub fn uniform_alignment(&self) -> u64 {
        self.uniform_alignment
    }

    /// Bytes currently leased out.
    pub fn used(&self) -> u64 {
        self.used
    }

    pub fn free(&self) -> u64 {
        self.capacity - self.used
    }

    /// End of the highest leased byte; everything above is free.
    pub fn high_water(&self) -> u64 {
        self.high_water
    }

    pub fn largest_free(&self) -> u64 {
        self.by_size.keys().next_back().copied().unwrap_or(0)
    }

    pub fn free_region_count(&self) -> usize {
        self.by_offset.len()
    }

    /// Free regions in address order.
    pub fn free_regions(&self) -> impl Iterator<Item = Region> + '_ {
        self.by_offset.iter().map(|(&offset, &size)| Region { offset, size })
    }

    /// Size actually leased for a request of `size` bytes. `None` when
    /// rounding overflows.
    pub fn rounded_size(&self, size: u64, uniform: bool) -> Option<u64> {
        if uniform {
            align_up(size, self.uniform_alignment)
        } else {
            align_up(size, MIN_ALIGNMENT)
        }
    }

    fn insert_free(&mut self, region: Region) {
        self.by_size.entry(region.size).or_default().push(region.offset);
        self.by_offset.insert(region.offset, region.size);
    }

    fn remove_free(&mut self, region: Region) {
        if let Some(offsets) = self.by_size.get_mut(&region.size) {
            if let Some(pos) = offsets.iter().position(|&o| o == region.offset) {
                offsets.swap_remove(pos);
            }
            if offsets.is_empty() {
                self.by_size.remove(&region.size);
            }
        }
        self.by_offset.remove(&region.offset);
    }

    /// Lease `size` bytes. Uniform requests start on a uniform-aligned
    /// offset. Best fit: the smallest free bucket that can hold the request
    /// wins, ties go to the lowest address. Returns `None` when nothing fits.
    pub fn acquire(&mut self, size: u64, uniform: bool) -> Option<Region> {
        if size == 0 {
            log::error!("zero-sized sub-buffer request");
            return None;
        }
        let Some(want) = self.rounded_size(size, uniform) else {
            log::error!("sub-buffer request of {} bytes can't be aligned", size);
            return None;
        };
        let align = if uniform { self.uniform_alignment } else { MIN_ALIGNMENT };

        let mut found = None;
        for (&bucket, offsets) in self.by_size.range(want..) {
            let best = offsets
                .iter()
                .copied()
                .filter(|&o| align_up(o, align).is_some_and(|start| start - o + want <= bucket))
                .min();
            if let Some(offset) = best {
                found = Some(Region { offset, size: bucket });
                break;
            }
        }
        let block = found?;

        self.remove_free(block);
        // Free offsets lie below `capacity`, so aligning them can't overflow.
        let start = align_up(block.offset, align).unwrap_or(block.offset);
        let pad = start - block.offset;
        if pad > 0 {
            self.insert_free(Region { offset: block.offset, size: pad });
        }
        let tail = block.size - pad - want;
        if tail > 0 {
            self.insert_free(Region { offset: start + want, size: tail });
        }

        self.used += want;
        self.high_water = self.high_water.max(start + want);
        Some(Region { offset: start, size: want })
    }

    /// Return a region, merging it with free neighbours on both sides.
    ///
    /// A region overlapping free space (double release) or lying outside
    /// the range is rejected and the free list is left untouched.
    pub fn release(&mut self, region: Region) -> Result<(), RegionError> {
        if region.size == 0 {
            return Err(RegionError::Empty(region.offset));
        }
        if !matches!(region.checked_end(), Some(end) if end <= self.capacity) {
            return Err(RegionError::OutOfBounds(region, self.capacity));
        }

        let prev = self
            .by_offset
            .range(..=region.offset)
            .next_back()
            .map(|(&offset, &size)| Region { offset, size });
        let next = self
            .by_offset
            .range(region.offset..)
            .next()
            .map(|(&offset, &size)| Region { offset, size });

        if let Some(p) = prev {
            if p.end() > region.offset {
                return Err(RegionError::Overlap(region, p));
            }
        }
        if let Some(n) = next {
            if n.offset < region.end() {
                return Err(RegionError::Overlap(region, n));
            }
        }

        let mut merged = region;
        if let Some(p) = prev.filter(|p| p.end() == region.offset) {
            self.remove_free(p);
            merged = Region { offset: p.offset, size: p.size + merged.size };
        }
        if let Some(n) = next.filter(|n| n.offset == region.end()) {
            self.remove_free(n);
            merged.size += n.size;
        }
        self.insert_free(merged);

        self.used = self.used.saturating_sub(region.size);
        if merged.end() == self.capacity && merged.offset < self.high_water {
            self.high_water = merged.offset;
        }
        Ok(())
    }

    /// Forget every lease.
    pub fn reset(&mut self) {
        self.by_size.clear();
        self.by_offset.clear();
        self.used = 0;
        self.high_water = 0;
        if self.capacity > 0 {
            self.insert_free(Region { offset: 0, size: self.capacity });
        }
    }
}
