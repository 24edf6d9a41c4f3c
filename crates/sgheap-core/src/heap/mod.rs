//! Heap capability surface and the two heap implementations.

mod buffer;
mod contig;
mod sg_table;
mod system;

pub use buffer::{Buffer, BufferRequest};
pub use contig::ContiguousHeap;
pub use sg_table::{SgEntry, SgTable};
pub use system::{Chunk, SystemHeap};

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

use serde::Serialize;

use crate::error::Result;
use crate::iommu::IommuMapper;
use crate::log::HeapLogRecord;
use crate::pool::ReclaimHint;
use crate::report::HeapReport;

/// Allocation strategy of a heap.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum HeapKind {
    /// Pooled multi-chunk allocation.
    System,
    /// Single physically contiguous block.
    SystemContig,
}

impl fmt::Display for HeapKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::System => "system",
            Self::SystemContig => "system_contig",
        })
    }
}

/// Operations every heap provides.
///
/// Optional capabilities (reclaim, diagnostics, physical address lookup,
/// device mapping) have defaults that report "not supported".
pub trait Heap: Send + Sync {
    fn name(&self) -> &str;

    fn kind(&self) -> HeapKind;

    /// Allocates and commits a buffer.
    fn allocate(&self, request: BufferRequest) -> Result<Buffer>;

    /// Releases a buffer allocated by this heap.
    ///
    /// A buffer from another heap is handed back untouched in `Err` so the
    /// caller can return it to its origin.
    fn free(&self, buffer: Buffer) -> Result<(), Buffer>;

    /// Reclaims idle memory. See [`SystemHeap::shrink`] for the contract.
    fn shrink(&self, _hint: ReclaimHint, _nr_pages: usize) -> usize {
        0
    }

    /// Idle-pool diagnostics.
    fn report(&self) -> Option<HeapReport> {
        None
    }

    /// Physical start address and length of a contiguous buffer.
    fn phys(&self, _buffer: &Buffer) -> Option<(u64, usize)> {
        None
    }

    /// Device-address mapping capability.
    fn iommu(&self) -> Option<&dyn IommuMapper> {
        None
    }

    /// Snapshot of the lifecycle log.
    fn lifecycle_logs(&self) -> Vec<HeapLogRecord>;

    /// Takes and clears the lifecycle log.
    fn drain_lifecycle_logs(&self) -> Vec<HeapLogRecord>;

    /// Tears the heap down, returning idle memory to the frame allocator.
    fn destroy(self: Box<Self>);
}

static NEXT_BUFFER_ID: AtomicU64 = AtomicU64::new(1);

fn next_buffer_id() -> u64 {
    NEXT_BUFFER_ID.fetch_add(1, Ordering::Relaxed)
}

fn elapsed_us(start: std::time::Instant) -> u64 {
    u64::try_from(start.elapsed().as_micros()).unwrap_or(u64::MAX)
}
