//! Allocation requests and the committed buffers heaps hand out.

use std::collections::BTreeMap;
use std::sync::Arc;

use crate::frame::FrameAllocator;
use crate::iommu::{self, DomainId, IommuDomain, IommuError, IommuMapping, Mapped};
use crate::size_class::PAGE_SIZE;

use super::{HeapKind, SgTable};

/// Parameters of an allocation request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BufferRequest {
    /// Requested length in bytes.
    pub len: usize,
    /// Required alignment in bytes.
    pub align: usize,
    /// Whether the buffer will be mapped CPU-cacheable.
    pub cached: bool,
}

impl BufferRequest {
    /// Uncached, page-aligned request for `len` bytes.
    #[must_use]
    pub const fn new(len: usize) -> Self {
        Self {
            len,
            align: PAGE_SIZE,
            cached: false,
        }
    }

    #[must_use]
    pub const fn cached(mut self, cached: bool) -> Self {
        self.cached = cached;
        self
    }

    #[must_use]
    pub const fn align(mut self, align: usize) -> Self {
        self.align = align;
        self
    }
}

/// A committed allocation.
///
/// Owned by the client until it is handed back through
/// [`Heap::free`](super::Heap::free). Dropping a buffer instead leaks its
/// frames.
#[must_use = "buffers must be returned with Heap::free"]
#[derive(Debug)]
pub struct Buffer {
    id: u64,
    origin: HeapKind,
    size: usize,
    cached: bool,
    forced_reclaim: bool,
    table: SgTable,
    mappings: BTreeMap<DomainId, IommuMapping>,
}

impl Buffer {
    pub(crate) fn new(origin: HeapKind, size: usize, cached: bool, table: SgTable) -> Self {
        Self {
            id: super::next_buffer_id(),
            origin,
            size,
            cached,
            forced_reclaim: false,
            table,
            mappings: BTreeMap::new(),
        }
    }

    /// Process-unique buffer id.
    #[must_use]
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Kind of heap that allocated the buffer.
    #[must_use]
    pub fn origin(&self) -> HeapKind {
        self.origin
    }

    /// Requested length in bytes.
    #[must_use]
    pub fn size(&self) -> usize {
        self.size
    }

    #[must_use]
    pub fn cached(&self) -> bool {
        self.cached
    }

    #[must_use]
    pub fn forced_reclaim(&self) -> bool {
        self.forced_reclaim
    }

    /// Flags the buffer as torn down by memory pressure: on free its chunks
    /// skip zeroing and go straight back to the frame allocator.
    pub fn mark_forced_reclaim(&mut self) {
        self.forced_reclaim = true;
    }

    #[must_use]
    pub fn sg_table(&self) -> &SgTable {
        &self.table
    }

    /// Device address and reference count of the mapping in `domain`.
    #[must_use]
    pub fn iommu_mapping(&self, domain: DomainId) -> Option<(u64, usize)> {
        self.mappings
            .get(&domain)
            .map(|mapping| (mapping.iova, mapping.refs))
    }

    /// Domains the buffer is currently mapped into.
    pub fn mapped_domains(&self) -> impl Iterator<Item = DomainId> + '_ {
        self.mappings.keys().copied()
    }

    /// Zero-fills every page the buffer covers.
    pub(crate) fn zero_fill(&self, frames: &dyn FrameAllocator) {
        for entry in &self.table {
            frames.zero_pages(entry.pfn, entry.page_count());
        }
    }

    pub(crate) fn map_into(&mut self, domain: &Arc<dyn IommuDomain>) -> Result<Mapped, IommuError> {
        iommu::map_buffer(&mut self.mappings, &self.table, domain)
    }

    pub(crate) fn unmap_from(&mut self, domain: DomainId) -> Option<usize> {
        iommu::unmap_buffer(&mut self.mappings, domain)
    }

    pub(crate) fn unmap_all(&mut self) -> usize {
        iommu::unmap_all(&mut self.mappings)
    }

    pub(crate) fn into_table(self) -> SgTable {
        debug_assert!(self.mappings.is_empty());
        self.table
    }
}
