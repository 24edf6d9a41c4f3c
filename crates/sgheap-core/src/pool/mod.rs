//! Page pools: per-(order, cacheability) caches of idle, zeroed chunks.
//!
//! A pool keeps freed chunks for reuse instead of handing them back to the
//! frame allocator. Idle chunks are filed by zone so reclaim can prefer
//! giving back low-memory pages. Every pool owns its own lock; callers never
//! hold it across calls.

mod set;

pub use set::{PoolKey, PoolSet};

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::Mutex;

use crate::frame::{FrameAllocator, FrameError, GfpFlags, PhysicalPages};
use crate::size_class::order_to_size;

/// Opaque pressure hint passed down by the memory-pressure subsystem.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReclaimHint {
    /// Whether high-memory chunks may be counted and evicted.
    pub allow_highmem: bool,
}

impl ReclaimHint {
    /// Hint for reclaim that may only touch low memory.
    #[must_use]
    pub const fn lowmem_only() -> Self {
        Self {
            allow_highmem: false,
        }
    }
}

impl Default for ReclaimHint {
    fn default() -> Self {
        Self {
            allow_highmem: true,
        }
    }
}

#[derive(Debug, Default)]
struct IdleChunks {
    high: Vec<PhysicalPages>,
    low: Vec<PhysicalPages>,
}

impl IdleChunks {
    fn take_for_reclaim(&mut self, allow_highmem: bool) -> Option<PhysicalPages> {
        self.low.pop().or_else(|| {
            if allow_highmem {
                self.high.pop()
            } else {
                None
            }
        })
    }
}

/// Cache of idle chunks of a single order.
pub struct PagePool {
    order: u32,
    cached: bool,
    gfp: GfpFlags,
    frames: Arc<dyn FrameAllocator>,
    idle: Mutex<IdleChunks>,
    hits: AtomicU64,
    misses: AtomicU64,
}

impl std::fmt::Debug for PagePool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let (high, low) = self.counts();
        f.debug_struct("PagePool")
            .field("order", &self.order)
            .field("cached", &self.cached)
            .field("high", &high)
            .field("low", &low)
            .finish_non_exhaustive()
    }
}

impl PagePool {
    /// Creates an empty pool for chunks of `order`.
    ///
    /// Fails when the frame allocator cannot serve blocks that large.
    pub fn new(
        frames: Arc<dyn FrameAllocator>,
        order: u32,
        cached: bool,
    ) -> Result<Self, FrameError> {
        let max_order = frames.max_order();
        if order > max_order {
            return Err(FrameError::OrderUnsupported { order, max_order });
        }
        Ok(Self {
            order,
            cached,
            gfp: GfpFlags::for_order(order),
            frames,
            idle: Mutex::new(IdleChunks::default()),
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
        })
    }

    /// Order of every chunk in this pool.
    #[must_use]
    pub fn order(&self) -> u32 {
        self.order
    }

    /// Cacheability class this pool serves.
    #[must_use]
    pub fn cached(&self) -> bool {
        self.cached
    }

    /// Takes an idle chunk, or allocates a fresh zeroed one.
    ///
    /// High-memory chunks are handed out before low-memory ones so low
    /// memory stays available to reclaim.
    pub fn alloc(&self) -> Result<PhysicalPages, FrameError> {
        let reused = {
            let mut idle = self.idle.lock();
            idle.high.pop().or_else(|| idle.low.pop())
        };
        if let Some(chunk) = reused {
            self.hits.fetch_add(1, Ordering::Relaxed);
            return Ok(chunk);
        }

        self.misses.fetch_add(1, Ordering::Relaxed);
        self.frames.alloc_pages(self.order, self.gfp)
    }

    /// Files a zeroed chunk as idle.
    pub fn free(&self, chunk: PhysicalPages) {
        debug_assert_eq!(chunk.order, self.order);
        let mut idle = self.idle.lock();
        if chunk.highmem {
            idle.high.push(chunk);
        } else {
            idle.low.push(chunk);
        }
    }

    /// Reclaims idle chunks.
    ///
    /// With `nr_pages == 0` nothing is evicted and the number of idle pages
    /// visible to `hint` is returned. Otherwise low-memory chunks are
    /// evicted first, then high-memory chunks if the hint allows, until at
    /// least `nr_pages` pages are freed or the pool is empty. Returns the
    /// pages freed.
    pub fn shrink(&self, hint: ReclaimHint, nr_pages: usize) -> usize {
        if nr_pages == 0 {
            let idle = self.idle.lock();
            let chunks = idle.low.len()
                + if hint.allow_highmem {
                    idle.high.len()
                } else {
                    0
                };
            return chunks << self.order;
        }

        let mut freed = 0;
        while freed < nr_pages {
            let Some(chunk) = self.idle.lock().take_for_reclaim(hint.allow_highmem) else {
                break;
            };
            self.frames.free_pages(chunk);
            freed += chunk.page_count();
        }
        freed
    }

    /// `(high_count, low_count)` of idle chunks.
    #[must_use]
    pub fn counts(&self) -> (usize, usize) {
        let idle = self.idle.lock();
        (idle.high.len(), idle.low.len())
    }

    /// Idle pages across both zones.
    #[must_use]
    pub fn idle_pages(&self) -> usize {
        let (high, low) = self.counts();
        (high + low) << self.order
    }

    /// Idle bytes across both zones.
    #[must_use]
    pub fn idle_bytes(&self) -> usize {
        let (high, low) = self.counts();
        (high + low) * order_to_size(self.order)
    }

    /// Allocations served from idle chunks.
    #[must_use]
    pub fn hits(&self) -> u64 {
        self.hits.load(Ordering::Relaxed)
    }

    /// Allocations that went to the frame allocator.
    #[must_use]
    pub fn misses(&self) -> u64 {
        self.misses.load(Ordering::Relaxed)
    }

    /// Returns every idle chunk to the frame allocator. Returns the number
    /// of chunks released.
    pub fn drain(&self) -> usize {
        let idle = std::mem::take(&mut *self.idle.lock());
        let mut released = 0;
        for chunk in idle.high.into_iter().chain(idle.low) {
            self.frames.free_pages(chunk);
            released += 1;
        }
        released
    }
}

impl Drop for PagePool {
    fn drop(&mut self) {
        self.drain();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frame::SimulatedFrameAllocator;

    fn frames_with_highmem() -> Arc<SimulatedFrameAllocator> {
        Arc::new(SimulatedFrameAllocator::with_highmem(1024, 1024))
    }

    #[test]
    fn miss_then_hit() {
        let frames = Arc::new(SimulatedFrameAllocator::new(1024));
        let pool = PagePool::new(frames.clone(), 4, false).unwrap();

        let chunk = pool.alloc().unwrap();
        assert_eq!(chunk.order, 4);
        assert_eq!((pool.hits(), pool.misses()), (0, 1));

        pool.free(chunk);
        assert_eq!(pool.idle_pages(), 16);
        let again = pool.alloc().unwrap();
        assert_eq!(again, chunk);
        assert_eq!((pool.hits(), pool.misses()), (1, 1));
        assert_eq!(frames.allocations(), 1);
    }

    #[test]
    fn rejects_orders_the_allocator_cannot_serve() {
        let frames = Arc::new(SimulatedFrameAllocator::new(1024).with_max_order(4));
        assert_eq!(
            PagePool::new(frames, 8, true).err(),
            Some(FrameError::OrderUnsupported {
                order: 8,
                max_order: 4
            })
        );
    }

    #[test]
    fn high_memory_reused_first() {
        let frames = frames_with_highmem();
        let pool = PagePool::new(frames, 0, false).unwrap();
        let high = PhysicalPages {
            pfn: 2000,
            order: 0,
            highmem: true,
        };
        let low = PhysicalPages {
            pfn: 300,
            order: 0,
            highmem: false,
        };
        pool.free(low);
        pool.free(high);
        assert_eq!(pool.counts(), (1, 1));
        assert_eq!(pool.alloc().unwrap(), high);
        assert_eq!(pool.alloc().unwrap(), low);
    }

    #[test]
    fn shrink_reports_without_evicting() {
        let frames = frames_with_highmem();
        let pool = PagePool::new(frames.clone(), 4, true).unwrap();
        let high = pool.alloc().unwrap();
        let low = frames
            .alloc_pages(4, GfpFlags::HIGH_ORDER - GfpFlags::HIGHMEM)
            .unwrap();
        pool.free(high);
        pool.free(low);

        assert_eq!(pool.shrink(ReclaimHint::default(), 0), 32);
        assert_eq!(pool.shrink(ReclaimHint::lowmem_only(), 0), 16);
        assert_eq!(pool.counts(), (1, 1));
    }

    #[test]
    fn shrink_evicts_low_first_and_respects_hint() {
        let frames = frames_with_highmem();
        let pool = PagePool::new(frames.clone(), 0, false).unwrap();
        for _ in 0..3 {
            let high = pool.alloc().unwrap();
            assert!(high.highmem);
            pool.free(high);
            let low = frames
                .alloc_pages(0, GfpFlags::LOW_ORDER - GfpFlags::HIGHMEM)
                .unwrap();
            pool.free(low);
        }
        // Only the first allocation missed; later ones reused the idle chunk.
        assert_eq!(pool.counts(), (1, 3));

        assert_eq!(pool.shrink(ReclaimHint::lowmem_only(), 10), 3);
        assert_eq!(pool.counts(), (1, 0));
        assert_eq!(pool.shrink(ReclaimHint::lowmem_only(), 10), 0);
        assert_eq!(pool.shrink(ReclaimHint::default(), 10), 1);
        assert_eq!(frames.pages_in_use(), 0);
    }

    #[test]
    fn shrink_stops_once_enough_pages_freed() {
        let frames = Arc::new(SimulatedFrameAllocator::new(4096));
        let pool = PagePool::new(frames.clone(), 4, false).unwrap();
        let chunks: Vec<_> = (0..4).map(|_| pool.alloc().unwrap()).collect();
        for chunk in chunks {
            pool.free(chunk);
        }

        assert_eq!(pool.shrink(ReclaimHint::default(), 20), 32);
        assert_eq!(pool.idle_pages(), 32);
        assert_eq!(frames.pages_in_use(), 32);
    }

    #[test]
    fn drop_drains_idle_chunks() {
        let frames = Arc::new(SimulatedFrameAllocator::new(4096));
        {
            let pool = PagePool::new(frames.clone(), 8, true).unwrap();
            let chunk = pool.alloc().unwrap();
            pool.free(chunk);
            assert_eq!(frames.pages_in_use(), 256);
        }
        assert_eq!(frames.pages_in_use(), 0);
    }
}
