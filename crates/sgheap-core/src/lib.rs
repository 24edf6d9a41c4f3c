//! # sgheap-core
//!
//! Buffer heaps for large, physically discontiguous memory consumed as
//! scatter-gather lists.
//!
//! Two allocation strategies are provided:
//! - [`SystemHeap`]: pooled multi-chunk allocation. A request is decomposed
//!   into power-of-two chunks drawn from per-(size class, cacheability) page
//!   pools, largest first, and committed as an [`SgTable`].
//! - [`ContiguousHeap`]: a single physically contiguous block taken straight
//!   from the frame allocator, trimmed to the requested length.
//!
//! Idle pooled chunks are given back under memory pressure through
//! [`Heap::shrink`], usually driven by a [`MemoryPressure`] registry.

#![deny(unsafe_code)]

pub mod config;
pub mod error;
pub mod frame;
pub mod heap;
pub mod iommu;
pub mod log;
pub mod pool;
pub mod pressure;
pub mod report;
pub mod size_class;
#[allow(unsafe_code)]
mod sys;

pub use config::HeapConfig;
pub use error::{ArgumentError, HeapError, OomReason, Result};
pub use frame::{FrameAllocator, FrameError, GfpFlags, PhysicalPages, SimulatedFrameAllocator};
pub use heap::{
    Buffer, BufferRequest, Chunk, ContiguousHeap, Heap, HeapKind, SgEntry, SgTable, SystemHeap,
};
pub use iommu::{DomainId, IommuDomain, IommuError, IommuMapper, LinearIovaDomain};
pub use log::{HeapLogLevel, HeapLogRecord};
pub use pool::{PagePool, PoolKey, PoolSet, ReclaimHint};
pub use pressure::MemoryPressure;
pub use report::{HeapReport, PoolReport};
pub use size_class::{PAGE_SHIFT, PAGE_SIZE, SizeClass, SizeClassTable};
