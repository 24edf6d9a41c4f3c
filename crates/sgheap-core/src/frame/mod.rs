//! Raw page-frame allocator interface.
//!
//! Heaps never touch physical memory directly. They request power-of-two
//! blocks of frames through [`FrameAllocator`] and hand them back when a
//! pool is drained or a buffer bypasses pooling.

mod simulated;

pub use simulated::SimulatedFrameAllocator;

use serde::Serialize;
use thiserror::Error;

use crate::size_class::{PAGE_SHIFT, order_to_size};

bitflags::bitflags! {
    /// Allocation behaviour requested from the frame allocator.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct GfpFlags: u32 {
        /// Frames may come from the high-memory zone.
        const HIGHMEM = 1 << 0;
        /// Frames must be zero-filled before they are returned.
        const ZERO = 1 << 1;
        /// Failure is expected and should not be reported.
        const NOWARN = 1 << 2;
        /// Do not retry after the first failed attempt.
        const NORETRY = 1 << 3;
        /// The allocator may block to reclaim memory.
        const WAIT = 1 << 4;
    }
}

impl GfpFlags {
    /// Flags for multi-page pool chunks. These fail fast rather than
    /// stall, so assembly can fall back to a smaller class.
    pub const HIGH_ORDER: Self = Self::HIGHMEM
        .union(Self::ZERO)
        .union(Self::NOWARN)
        .union(Self::NORETRY);

    /// Flags for single pages and contiguous blocks.
    pub const LOW_ORDER: Self = Self::HIGHMEM
        .union(Self::ZERO)
        .union(Self::NOWARN)
        .union(Self::WAIT);

    /// Pool flags for chunks of `order`.
    #[must_use]
    pub const fn for_order(order: u32) -> Self {
        if order > 0 {
            Self::HIGH_ORDER
        } else {
            Self::LOW_ORDER
        }
    }
}

/// A naturally aligned block of `1 << order` physical frames.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub struct PhysicalPages {
    /// First page frame number.
    pub pfn: u64,
    /// Block order.
    pub order: u32,
    /// Whether the block lives in the high-memory zone.
    pub highmem: bool,
}

impl PhysicalPages {
    /// Number of frames in the block.
    #[must_use]
    pub const fn page_count(self) -> usize {
        1 << self.order
    }

    /// Byte size of the block.
    #[must_use]
    pub const fn bytes(self) -> usize {
        order_to_size(self.order)
    }

    /// Physical address of the first frame.
    #[must_use]
    pub const fn phys_addr(self) -> u64 {
        self.pfn << PAGE_SHIFT
    }
}

/// Frame allocator failures.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum FrameError {
    #[error("no free block of order {order}")]
    Exhausted { order: u32 },
    #[error("order {order} exceeds the allocator maximum of {max_order}")]
    OrderUnsupported { order: u32, max_order: u32 },
    #[error("allocation of order {order} failed by injection")]
    Injected { order: u32 },
}

/// Source of physical frames.
///
/// Implementations must be safe to call from several threads at once.
pub trait FrameAllocator: Send + Sync {
    /// Allocates one block of `1 << order` frames.
    fn alloc_pages(&self, order: u32, flags: GfpFlags) -> Result<PhysicalPages, FrameError>;

    /// Returns a block previously obtained from [`alloc_pages`](Self::alloc_pages)
    /// or [`split`](Self::split).
    fn free_pages(&self, pages: PhysicalPages);

    /// Largest order the allocator can serve.
    fn max_order(&self) -> u32;

    /// Breaks a block into independently freeable order-0 pages.
    fn split(&self, pages: PhysicalPages) -> Vec<PhysicalPages> {
        (0..pages.page_count() as u64)
            .map(|i| PhysicalPages {
                pfn: pages.pfn + i,
                order: 0,
                highmem: pages.highmem,
            })
            .collect()
    }

    /// Zero-fills `count` frames starting at `pfn`.
    fn zero_pages(&self, _pfn: u64, _count: usize) {}

    /// Makes CPU writes to `count` frames starting at `pfn` visible to devices.
    fn sync_for_device(&self, _pfn: u64, _count: usize) {}
}

impl std::fmt::Debug for dyn FrameAllocator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FrameAllocator")
            .field("max_order", &self.max_order())
            .finish_non_exhaustive()
    }
}
