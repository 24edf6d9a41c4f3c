//! In-process frame allocator.
//!
//! Frames are logical page numbers; no host memory backs them. Each zone
//! hands out naturally aligned blocks from a bump cursor and recycles freed
//! blocks only at the order they were freed with, so split pages never
//! coalesce back into larger blocks. Page contents are modelled as a dirty
//! bit per frame, which makes zero-fill observable.

use std::collections::{BTreeMap, BTreeSet, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::Mutex;

use super::{FrameAllocator, FrameError, GfpFlags, PhysicalPages};

/// Default maximum order (1024 pages, 4MB).
pub const DEFAULT_MAX_ORDER: u32 = 10;

/// First frame handed out; keeps frame 0 unused.
const BASE_PFN: u64 = 0x100;

#[derive(Debug)]
struct Zone {
    start: u64,
    next: u64,
    end: u64,
    /// Freed blocks keyed by order.
    recycled: BTreeMap<u32, Vec<u64>>,
    in_use: usize,
}

impl Zone {
    fn new(start: u64, pages: usize) -> Self {
        Self {
            start,
            next: start,
            end: start + pages as u64,
            recycled: BTreeMap::new(),
            in_use: 0,
        }
    }

    fn contains(&self, pfn: u64) -> bool {
        (self.start..self.end).contains(&pfn)
    }

    fn take(&mut self, order: u32) -> Option<u64> {
        let count = 1u64 << order;
        if let Some(pfn) = self.recycled.get_mut(&order).and_then(Vec::pop) {
            self.in_use += count as usize;
            return Some(pfn);
        }

        let aligned = self.next.next_multiple_of(count);
        let block_end = aligned.checked_add(count)?;
        if block_end > self.end {
            return None;
        }
        // Frames skipped for alignment stay usable as single pages.
        if aligned > self.next {
            self.recycled
                .entry(0)
                .or_default()
                .extend(self.next..aligned);
        }
        self.next = block_end;
        self.in_use += count as usize;
        Some(aligned)
    }

    fn give(&mut self, pfn: u64, order: u32) {
        self.in_use = self.in_use.saturating_sub(1 << order);
        self.recycled.entry(order).or_default().push(pfn);
    }
}

#[derive(Debug)]
struct State {
    low: Zone,
    high: Option<Zone>,
    failing: BTreeSet<u32>,
    dirty: HashSet<u64>,
}

impl State {
    fn zone_for(&mut self, pfn: u64) -> &mut Zone {
        match self.high.as_mut() {
            Some(high) if high.contains(pfn) => high,
            _ => &mut self.low,
        }
    }
}

/// Logical frame allocator with fault injection and usage counters.
#[derive(Debug)]
pub struct SimulatedFrameAllocator {
    state: Mutex<State>,
    capacity: usize,
    max_order: u32,
    allocations: AtomicU64,
    failed_allocations: AtomicU64,
    frees: AtomicU64,
    pages_zeroed: AtomicU64,
    pages_synced: AtomicU64,
}

impl SimulatedFrameAllocator {
    /// Creates an allocator with `total_pages` low-memory frames.
    #[must_use]
    pub fn new(total_pages: usize) -> Self {
        Self::with_highmem(total_pages, 0)
    }

    /// Creates an allocator with separate low- and high-memory zones.
    #[must_use]
    pub fn with_highmem(low_pages: usize, high_pages: usize) -> Self {
        let low = Zone::new(BASE_PFN, low_pages);
        let high = (high_pages > 0).then(|| Zone::new(low.end, high_pages));
        Self {
            state: Mutex::new(State {
                low,
                high,
                failing: BTreeSet::new(),
                dirty: HashSet::new(),
            }),
            capacity: low_pages + high_pages,
            max_order: DEFAULT_MAX_ORDER,
            allocations: AtomicU64::new(0),
            failed_allocations: AtomicU64::new(0),
            frees: AtomicU64::new(0),
            pages_zeroed: AtomicU64::new(0),
            pages_synced: AtomicU64::new(0),
        }
    }

    /// Caps the largest order served.
    #[must_use]
    pub fn with_max_order(mut self, max_order: u32) -> Self {
        self.max_order = max_order;
        self
    }

    /// Makes every subsequent allocation of `order` fail.
    pub fn fail_order(&self, order: u32) {
        self.state.lock().failing.insert(order);
    }

    /// Undoes [`fail_order`](Self::fail_order).
    pub fn restore_order(&self, order: u32) {
        self.state.lock().failing.remove(&order);
    }

    /// Marks frames as holding data, as if a device or CPU wrote to them.
    pub fn write_pages(&self, pfn: u64, count: usize) {
        let mut state = self.state.lock();
        state.dirty.extend(pfn..pfn + count as u64);
    }

    /// Whether the frame holds data that was never zeroed.
    #[must_use]
    pub fn is_dirty(&self, pfn: u64) -> bool {
        self.state.lock().dirty.contains(&pfn)
    }

    /// Number of frames holding unzeroed data.
    #[must_use]
    pub fn dirty_pages(&self) -> usize {
        self.state.lock().dirty.len()
    }

    /// Total frames managed.
    #[must_use]
    pub fn capacity_pages(&self) -> usize {
        self.capacity
    }

    /// Frames currently handed out.
    #[must_use]
    pub fn pages_in_use(&self) -> usize {
        let state = self.state.lock();
        state.low.in_use + state.high.as_ref().map_or(0, |zone| zone.in_use)
    }

    /// Successful `alloc_pages` calls.
    #[must_use]
    pub fn allocations(&self) -> u64 {
        self.allocations.load(Ordering::Relaxed)
    }

    /// Failed `alloc_pages` calls.
    #[must_use]
    pub fn failed_allocations(&self) -> u64 {
        self.failed_allocations.load(Ordering::Relaxed)
    }

    /// `free_pages` calls.
    #[must_use]
    pub fn frees(&self) -> u64 {
        self.frees.load(Ordering::Relaxed)
    }

    /// Frames zero-filled, at allocation or on request.
    #[must_use]
    pub fn pages_zeroed(&self) -> u64 {
        self.pages_zeroed.load(Ordering::Relaxed)
    }

    /// Frames synchronized for device access.
    #[must_use]
    pub fn pages_synced(&self) -> u64 {
        self.pages_synced.load(Ordering::Relaxed)
    }

    fn fail(&self, err: FrameError) -> Result<PhysicalPages, FrameError> {
        self.failed_allocations.fetch_add(1, Ordering::Relaxed);
        Err(err)
    }
}

impl FrameAllocator for SimulatedFrameAllocator {
    fn alloc_pages(&self, order: u32, flags: GfpFlags) -> Result<PhysicalPages, FrameError> {
        if order > self.max_order {
            return self.fail(FrameError::OrderUnsupported {
                order,
                max_order: self.max_order,
            });
        }

        let mut state = self.state.lock();
        if state.failing.contains(&order) {
            drop(state);
            return self.fail(FrameError::Injected { order });
        }

        let from_high = if flags.contains(GfpFlags::HIGHMEM) {
            state.high.as_mut().and_then(|zone| zone.take(order))
        } else {
            None
        };
        let block = match from_high {
            Some(pfn) => PhysicalPages {
                pfn,
                order,
                highmem: true,
            },
            None => match state.low.take(order) {
                Some(pfn) => PhysicalPages {
                    pfn,
                    order,
                    highmem: false,
                },
                None => {
                    drop(state);
                    return self.fail(FrameError::Exhausted { order });
                }
            },
        };

        if flags.contains(GfpFlags::ZERO) {
            for pfn in block.pfn..block.pfn + block.page_count() as u64 {
                state.dirty.remove(&pfn);
            }
            self.pages_zeroed
                .fetch_add(block.page_count() as u64, Ordering::Relaxed);
        }
        self.allocations.fetch_add(1, Ordering::Relaxed);
        Ok(block)
    }

    fn free_pages(&self, pages: PhysicalPages) {
        self.state.lock().zone_for(pages.pfn).give(pages.pfn, pages.order);
        self.frees.fetch_add(1, Ordering::Relaxed);
    }

    fn max_order(&self) -> u32 {
        self.max_order
    }

    fn zero_pages(&self, pfn: u64, count: usize) {
        let mut state = self.state.lock();
        for frame in pfn..pfn + count as u64 {
            state.dirty.remove(&frame);
        }
        self.pages_zeroed.fetch_add(count as u64, Ordering::Relaxed);
    }

    fn sync_for_device(&self, _pfn: u64, count: usize) {
        self.pages_synced.fetch_add(count as u64, Ordering::Relaxed);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn blocks_are_naturally_aligned() {
        let frames = SimulatedFrameAllocator::new(4096);
        let single = frames.alloc_pages(0, GfpFlags::LOW_ORDER).unwrap();
        let block = frames.alloc_pages(8, GfpFlags::HIGH_ORDER).unwrap();
        assert_eq!(block.pfn % 256, 0);
        assert_ne!(single.pfn, block.pfn);
        assert_eq!(frames.pages_in_use(), 257);
        assert_eq!(frames.allocations(), 2);
    }

    #[test]
    fn alignment_gap_is_reused_for_single_pages() {
        let frames = SimulatedFrameAllocator::new(4096);
        let first = frames.alloc_pages(0, GfpFlags::LOW_ORDER).unwrap();
        let _block = frames.alloc_pages(4, GfpFlags::HIGH_ORDER).unwrap();
        let second = frames.alloc_pages(0, GfpFlags::LOW_ORDER).unwrap();
        assert_eq!(second.pfn, first.pfn + 1);
    }

    #[test]
    fn exhaustion_and_recycling() {
        let frames = SimulatedFrameAllocator::new(16);
        let block = frames.alloc_pages(4, GfpFlags::HIGH_ORDER).unwrap();
        assert_eq!(
            frames.alloc_pages(0, GfpFlags::LOW_ORDER),
            Err(FrameError::Exhausted { order: 0 })
        );
        frames.free_pages(block);
        assert_eq!(frames.pages_in_use(), 0);
        let again = frames.alloc_pages(4, GfpFlags::HIGH_ORDER).unwrap();
        assert_eq!(again.pfn, block.pfn);
        assert_eq!(frames.failed_allocations(), 1);
        assert_eq!(frames.frees(), 1);
    }

    #[test]
    fn split_pages_do_not_coalesce() {
        let frames = SimulatedFrameAllocator::new(16);
        let block = frames.alloc_pages(4, GfpFlags::LOW_ORDER).unwrap();
        for page in frames.split(block) {
            frames.free_pages(page);
        }
        assert_eq!(frames.pages_in_use(), 0);
        assert!(frames.alloc_pages(4, GfpFlags::LOW_ORDER).is_err());
        assert!(frames.alloc_pages(0, GfpFlags::LOW_ORDER).is_ok());
    }

    #[test]
    fn injected_and_unsupported_orders_fail() {
        let frames = SimulatedFrameAllocator::new(1024).with_max_order(4);
        assert_eq!(
            frames.alloc_pages(8, GfpFlags::HIGH_ORDER),
            Err(FrameError::OrderUnsupported {
                order: 8,
                max_order: 4
            })
        );
        frames.fail_order(0);
        assert_eq!(
            frames.alloc_pages(0, GfpFlags::LOW_ORDER),
            Err(FrameError::Injected { order: 0 })
        );
        frames.restore_order(0);
        assert!(frames.alloc_pages(0, GfpFlags::LOW_ORDER).is_ok());
    }

    #[test]
    fn highmem_zone_preferred_when_allowed() {
        let frames = SimulatedFrameAllocator::with_highmem(64, 64);
        let high = frames.alloc_pages(0, GfpFlags::LOW_ORDER).unwrap();
        assert!(high.highmem);
        let low = frames
            .alloc_pages(0, GfpFlags::LOW_ORDER - GfpFlags::HIGHMEM)
            .unwrap();
        assert!(!low.highmem);

        frames.free_pages(high);
        frames.free_pages(low);
        assert_eq!(frames.pages_in_use(), 0);
    }

    #[test]
    fn zeroing_clears_dirty_frames() {
        let frames = SimulatedFrameAllocator::new(64);
        let block = frames.alloc_pages(2, GfpFlags::LOW_ORDER).unwrap();
        frames.write_pages(block.pfn, 4);
        assert_eq!(frames.dirty_pages(), 4);

        frames.zero_pages(block.pfn, 2);
        assert!(!frames.is_dirty(block.pfn));
        assert!(frames.is_dirty(block.pfn + 3));

        frames.free_pages(block);
        let reused = frames.alloc_pages(2, GfpFlags::LOW_ORDER).unwrap();
        assert_eq!(reused.pfn, block.pfn);
        assert_eq!(frames.dirty_pages(), 0);
    }
}
