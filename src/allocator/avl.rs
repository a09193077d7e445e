use super::extent::{cbits, isp2, p2align, p2roundup, Extent};
use log::{debug, info, trace};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::ops::Bound::{Excluded, Unbounded};
use thiserror::Error;

pub const DEFAULT_BF_THRESHOLD: u64 = 128 * 1024;
pub const DEFAULT_BF_FREE_PCT: u64 = 4;

/// Strategy switch points. Best-fit is used once the largest free extent
/// drops below `bf_threshold` bytes or free space below `bf_free_pct`
/// percent of capacity.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct AllocatorConfig {
    pub bf_threshold: u64,
    pub bf_free_pct: u64,
    /// Upper bound for a single returned extent, aligned down to the block
    /// size at allocation time but never below the allocation unit.
    pub max_alloc_size_cap: u64,
}

impl Default for AllocatorConfig {
    fn default() -> Self {
        Self {
            bf_threshold: DEFAULT_BF_THRESHOLD,
            bf_free_pct: DEFAULT_BF_FREE_PCT,
            max_alloc_size_cap: u64::from(u32::MAX),
        }
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum AllocError {
    #[error("no space for {want:#x} bytes in units of {unit:#x}")]
    NoSpace { want: u64, unit: u64 },
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum AllocatorInvariantError {
    #[error("free extents {left} and {right} are adjacent")]
    Adjacent { left: Extent, right: Extent },
    #[error("free extents {left} and {right} overlap")]
    Overlap { left: Extent, right: Extent },
    #[error("size index disagrees with start index at {offset:#x}")]
    IndexMismatch { offset: u64 },
    #[error("tracked free {tracked:#x} but extents sum to {actual:#x}")]
    FreeMismatch { tracked: u64, actual: u64 },
}

const CURSOR_BUCKETS: usize = 64;

#[derive(Debug)]
struct FreeSpace {
    /// start -> end
    by_start: BTreeMap<u64, u64>,
    /// (length, start)
    by_size: BTreeSet<(u64, u64)>,
    /// First-fit resume points, one per power-of-two alignment.
    cursors: [u64; CURSOR_BUCKETS],
    num_free: u64,
}

impl FreeSpace {
    fn new() -> Self {
        Self {
            by_start: BTreeMap::new(),
            by_size: BTreeSet::new(),
            cursors: [0; CURSOR_BUCKETS],
            num_free: 0,
        }
    }

    fn largest(&self) -> u64 {
        self.by_size.last().map(|(length, _)| *length).unwrap_or(0)
    }

    fn insert(&mut self, start: u64, end: u64) {
        self.by_start.insert(start, end);
        self.by_size.insert((end - start, start));
        self.num_free += end - start;
    }

    fn remove(&mut self, start: u64, end: u64) {
        self.by_start.remove(&start);
        self.by_size.remove(&(end - start, start));
        self.num_free -= end - start;
    }

    fn add(&mut self, start: u64, length: u64) {
        assert!(length != 0, "zero-length free extent at {start:#x}");
        let end = start
            .checked_add(length)
            .unwrap_or_else(|| panic!("free extent {start:#x}~{length:#x} overflows"));
        let before = self
            .by_start
            .range(..=start)
            .next_back()
            .map(|(&s, &e)| (s, e));
        let after = self
            .by_start
            .range((Excluded(start), Unbounded))
            .next()
            .map(|(&s, &e)| (s, e));
        if let Some((s, e)) = before {
            assert!(
                e <= start,
                "released {start:#x}~{length:#x} overlaps free {s:#x}~{:#x}",
                e - s
            );
        }
        if let Some((s, e)) = after {
            assert!(
                s >= end,
                "released {start:#x}~{length:#x} overlaps free {s:#x}~{:#x}",
                e - s
            );
        }

        let merge_before = before.filter(|(_, e)| *e == start);
        let merge_after = after.filter(|(s, _)| *s == end);
        match (merge_before, merge_after) {
            (Some((bs, be)), Some((as_, ae))) => {
                self.remove(bs, be);
                self.remove(as_, ae);
                self.insert(bs, ae);
            }
            (Some((bs, be)), None) => {
                self.remove(bs, be);
                self.insert(bs, end);
            }
            (None, Some((as_, ae))) => {
                self.remove(as_, ae);
                self.insert(start, ae);
            }
            (None, None) => self.insert(start, end),
        }
    }

    /// Carves `[start, start + length)` out of the single free extent that
    /// contains it.
    fn take(&mut self, start: u64, length: u64) {
        assert!(length != 0, "zero-length removal at {start:#x}");
        assert!(
            length <= self.num_free,
            "removing {length:#x} with only {:#x} free",
            self.num_free
        );
        let end = start + length;
        let (rs, re) = self
            .by_start
            .range(..=start)
            .next_back()
            .map(|(&s, &e)| (s, e))
            .unwrap_or_else(|| panic!("{start:#x}~{length:#x} is not free"));
        assert!(re >= end, "{start:#x}~{length:#x} is not free");
        self.remove(rs, re);
        if rs < start {
            self.insert(rs, start);
        }
        if end < re {
            self.insert(end, re);
        }
    }

    fn pick_first_fit(&self, cursor: &mut u64, size: u64, align: u64) -> Option<u64> {
        let from = *cursor;
        let containing = self
            .by_start
            .range(..=from)
            .next_back()
            .filter(|(_, end)| **end > from);
        let following = self.by_start.range((Excluded(from), Unbounded));
        for (&start, &end) in containing.into_iter().chain(following) {
            let offset = p2roundup(start, align);
            if offset.checked_add(size).is_some_and(|stop| stop <= end) {
                *cursor = offset + size;
                return Some(offset);
            }
        }
        // One wrap back to the beginning unless this pass already was one.
        if from == 0 {
            return None;
        }
        *cursor = 0;
        self.pick_first_fit(cursor, size, align)
    }

    fn pick_best_fit(&self, size: u64, align: u64) -> Option<u64> {
        self.by_size.range((size, 0)..).find_map(|&(length, start)| {
            let offset = p2roundup(start, align);
            offset
                .checked_add(size)
                .is_some_and(|stop| stop <= start + length)
                .then_some(offset)
        })
    }
}

#[derive(Debug)]
struct AllocatorState {
    free: FreeSpace,
    num_total: u64,
    block_size: u64,
    config: AllocatorConfig,
}

impl AllocatorState {
    /// Returns `[offset, offset + length)` to free space; it must lie on the
    /// device.
    fn release(&mut self, offset: u64, length: u64) {
        let in_bounds = offset
            .checked_add(length)
            .is_some_and(|end| end <= self.num_total);
        assert!(
            in_bounds,
            "released {offset:#x}~{length:#x} lies beyond device size {:#x}",
            self.num_total
        );
        self.free.add(offset, length);
    }

    fn allocate_chunk(&mut self, size: u64, unit: u64) -> Option<Extent> {
        let max_size = self.free.largest();
        let mut size = size;
        let mut force_best_fit = false;
        if max_size < size {
            if max_size < unit {
                return None;
            }
            size = p2align(max_size, unit);
            force_best_fit = true;
        }

        let free_pct = self
            .free
            .num_free
            .saturating_mul(100)
            .checked_div(self.num_total)
            .unwrap_or(0);
        let best_fit = force_best_fit
            || max_size < self.config.bf_threshold
            || free_pct < self.config.bf_free_pct;

        let mut picked = None;
        loop {
            if best_fit {
                picked = self.free.pick_best_fit(size, unit);
                trace!("event=allocator_best_fit size={size:#x} picked={picked:?}");
            } else {
                let align = size & size.wrapping_neg();
                let bucket = (cbits(align) - 1) as usize;
                let mut cursor = self.free.cursors[bucket];
                picked = self.free.pick_first_fit(&mut cursor, size, unit);
                self.free.cursors[bucket] = cursor;
                trace!("event=allocator_first_fit size={size:#x} bucket={bucket} picked={picked:?}");
            }
            if picked.is_some() {
                break;
            }
            // Misaligned extents may still hold smaller pieces.
            size = p2align(size >> 1, unit);
            if size < unit {
                break;
            }
        }
        let offset = picked?;
        self.free.take(offset, size);
        Some(Extent::new(offset, size))
    }
}

/// Free-space allocator over a fixed address range, indexing free extents
/// both by offset and by size. All public calls hold one internal mutex for
/// their full duration.
#[derive(Debug)]
pub struct ExtentAllocator {
    name: String,
    state: Mutex<AllocatorState>,
}

impl ExtentAllocator {
    /// Starts with no free space; seed it with [`ExtentAllocator::init_add_free`].
    pub fn new(
        name: impl Into<String>,
        device_size: u64,
        block_size: u64,
        config: AllocatorConfig,
    ) -> Self {
        assert!(isp2(block_size), "block size {block_size:#x} is not a power of two");
        Self {
            name: name.into(),
            state: Mutex::new(AllocatorState {
                free: FreeSpace::new(),
                num_total: device_size,
                block_size,
                config,
            }),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn capacity(&self) -> u64 {
        self.state.lock().num_total
    }

    pub fn block_size(&self) -> u64 {
        self.state.lock().block_size
    }

    /// Allocates `want` bytes as chunks of at most `max_alloc_size` bytes
    /// (zero means unbounded), appending them to `extents`. Returns the bytes
    /// obtained, which may fall short of `want`; fails only when nothing at
    /// all could be allocated.
    pub fn allocate(
        &self,
        want: u64,
        unit: u64,
        max_alloc_size: u64,
        extents: &mut Vec<Extent>,
    ) -> Result<u64, AllocError> {
        debug!(
            "event=allocator_allocate name={} want={want:#x} unit={unit:#x} max_alloc_size={max_alloc_size:#x}",
            self.name
        );
        assert!(isp2(unit), "allocation unit {unit:#x} is not a power of two");
        assert!(
            want % unit == 0,
            "want {want:#x} is not a multiple of unit {unit:#x}"
        );

        let mut state = self.state.lock();
        let mut max_alloc_size = if max_alloc_size == 0 {
            want
        } else {
            max_alloc_size
        };
        let cap = state.config.max_alloc_size_cap;
        if max_alloc_size >= cap {
            // never round a small cap down to nothing
            max_alloc_size = p2align(cap, state.block_size).max(unit);
        }

        let mut allocated = 0;
        while allocated < want {
            let chunk = max_alloc_size.min(want - allocated);
            if chunk == 0 {
                break;
            }
            let Some(extent) = state.allocate_chunk(chunk, unit) else {
                break;
            };
            trace!("event=allocator_extent name={} extent={extent}", self.name);
            extents.push(extent);
            allocated += extent.length;
        }
        if allocated == 0 {
            info!(
                "event=allocator_enospc name={} want={want:#x} unit={unit:#x} free={:#x}",
                self.name, state.free.num_free
            );
            return Err(AllocError::NoSpace { want, unit });
        }
        Ok(allocated)
    }

    /// Returns a range to the free pool. The range must not be free already.
    pub fn release(&self, offset: u64, length: u64) {
        debug!(
            "event=allocator_release name={} offset={offset:#x} length={length:#x}",
            self.name
        );
        self.state.lock().release(offset, length);
    }

    pub fn release_extents(&self, extents: &[Extent]) {
        let mut state = self.state.lock();
        for extent in extents {
            debug!(
                "event=allocator_release name={} offset={:#x} length={:#x}",
                self.name, extent.offset, extent.length
            );
            state.release(extent.offset, extent.length);
        }
    }

    pub fn init_add_free(&self, offset: u64, length: u64) {
        if length == 0 {
            return;
        }
        debug!(
            "event=allocator_init_add_free name={} offset={offset:#x} length={length:#x}",
            self.name
        );
        self.state.lock().release(offset, length);
    }

    pub fn init_rm_free(&self, offset: u64, length: u64) {
        if length == 0 {
            return;
        }
        debug!(
            "event=allocator_init_rm_free name={} offset={offset:#x} length={length:#x}",
            self.name
        );
        self.state.lock().free.take(offset, length);
    }

    pub fn free_bytes(&self) -> u64 {
        self.state.lock().free.num_free
    }

    pub fn free_extent_count(&self) -> usize {
        self.state.lock().free.by_start.len()
    }

    /// 0.0 for a single contiguous free region, approaching 1.0 as free
    /// space splinters into block-sized pieces.
    pub fn fragmentation(&self) -> f64 {
        let state = self.state.lock();
        let free_blocks = p2align(state.free.num_free, state.block_size) / state.block_size;
        if free_blocks <= 1 {
            return 0.0;
        }
        (state.free.by_start.len() as f64 - 1.0) / (free_blocks as f64 - 1.0)
    }

    /// Free extents in offset order.
    pub fn dump(&self) -> Vec<Extent> {
        self.state
            .lock()
            .free
            .by_start
            .iter()
            .map(|(&start, &end)| Extent::new(start, end - start))
            .collect()
    }

    pub fn dump_with(&self, mut notify: impl FnMut(u64, u64)) {
        let state = self.state.lock();
        for (&start, &end) in &state.free.by_start {
            notify(start, end - start);
        }
    }

    /// Logs both indices at debug level.
    pub fn log_dump(&self) {
        let state = self.state.lock();
        debug!("event=allocator_dump name={} index=by_start", self.name);
        for (&start, &end) in &state.free.by_start {
            debug!("event=allocator_dump_extent start={start:#x} end={end:#x}");
        }
        debug!("event=allocator_dump name={} index=by_size", self.name);
        for &(length, start) in &state.free.by_size {
            debug!("event=allocator_dump_extent start={start:#x} length={length:#x}");
        }
    }

    /// Checks that both indices agree, that no two free extents touch, and
    /// that the free byte count matches.
    pub fn validate(&self) -> Result<(), AllocatorInvariantError> {
        let state = self.state.lock();
        let free = &state.free;
        if free.by_size.len() != free.by_start.len() {
            let offset = free
                .by_size
                .iter()
                .find(|(length, start)| free.by_start.get(start) != Some(&(start + length)))
                .map(|(_, start)| *start)
                .unwrap_or(0);
            return Err(AllocatorInvariantError::IndexMismatch { offset });
        }
        for &(length, start) in &free.by_size {
            if free.by_start.get(&start) != Some(&(start + length)) {
                return Err(AllocatorInvariantError::IndexMismatch { offset: start });
            }
        }
        let mut previous: Option<Extent> = None;
        let mut actual = 0;
        for (&start, &end) in &free.by_start {
            let extent = Extent::new(start, end - start);
            if let Some(left) = previous {
                if left.end() == start {
                    return Err(AllocatorInvariantError::Adjacent {
                        left,
                        right: extent,
                    });
                }
                if left.end() > start {
                    return Err(AllocatorInvariantError::Overlap {
                        left,
                        right: extent,
                    });
                }
            }
            actual += extent.length;
            previous = Some(extent);
        }
        if actual != free.num_free {
            return Err(AllocatorInvariantError::FreeMismatch {
                tracked: free.num_free,
                actual,
            });
        }
        Ok(())
    }

    /// Drops all free-space tracking.
    pub fn shutdown(&self) {
        debug!("event=allocator_shutdown name={}", self.name);
        let mut state = self.state.lock();
        state.free = FreeSpace::new();
    }
}
