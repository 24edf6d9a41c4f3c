//! Pooled multi-chunk heap.
//!
//! A request is covered greedily with the largest size class that fits the
//! remaining length, never growing past the class of the previous chunk.
//! Chunks come from the (class, cacheability) pool, which falls back to the
//! frame allocator when it has nothing idle. When a class cannot be served
//! the next smaller one is tried; when none can, every chunk taken so far
//! goes back to its pool and the request fails.

use std::sync::Arc;
use std::time::Instant;

use crate::config::HeapConfig;
use crate::error::{ArgumentError, HeapError, OomReason, Result};
use crate::frame::{FrameAllocator, PhysicalPages};
use crate::iommu::{DomainId, IommuDomain, IommuError, IommuMapper};
use crate::log::{HeapLog, HeapLogLevel, HeapLogRecord, LogFields};
use crate::pool::{PoolKey, PoolSet, ReclaimHint};
use crate::report::HeapReport;
use crate::size_class::{PAGE_SIZE, SizeClass, SizeClassTable, page_align, pages_for_len};

use super::{Buffer, BufferRequest, Heap, HeapKind, SgEntry, SgTable, elapsed_us};

/// One chunk in transit between a pool and a buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Chunk {
    pub pages: PhysicalPages,
    pub class: SizeClass,
    /// Cacheability of the pool the chunk came from.
    pub cached: bool,
}

/// Heap drawing power-of-two chunks from per-(class, cacheability) pools.
#[derive(Debug)]
pub struct SystemHeap {
    config: HeapConfig,
    frames: Arc<dyn FrameAllocator>,
    table: Arc<SizeClassTable>,
    pools: PoolSet,
    log: HeapLog,
}

impl SystemHeap {
    /// Creates a heap over the process-wide size-class table.
    pub fn new(frames: Arc<dyn FrameAllocator>, config: HeapConfig) -> Result<Self> {
        Self::with_table(frames, SizeClassTable::global(), config)
    }

    /// Creates a heap over a custom size-class table.
    ///
    /// Every pool is created or none is.
    pub fn with_table(
        frames: Arc<dyn FrameAllocator>,
        table: Arc<SizeClassTable>,
        config: HeapConfig,
    ) -> Result<Self> {
        let pools = PoolSet::create(&frames, Arc::clone(&table))?;
        let log = HeapLog::new(config.heap_name.clone(), config.log_capacity);
        log.record(
            HeapLogLevel::Info,
            "create",
            "pools",
            "success",
            LogFields::default(),
            format!("pools={};orders={:?}", pools.len(), table.orders()),
        );
        Ok(Self {
            config,
            frames,
            table,
            pools,
            log,
        })
    }

    #[must_use]
    pub fn config(&self) -> &HeapConfig {
        &self.config
    }

    #[must_use]
    pub fn pools(&self) -> &PoolSet {
        &self.pools
    }

    /// Obtains one chunk for `remaining` bytes.
    ///
    /// Tries every class that fits `remaining` and does not exceed
    /// `ceiling_order`, largest first, and returns the first one its pool
    /// can serve.
    pub fn acquire_chunk(&self, remaining: usize, ceiling_order: u32, cached: bool) -> Option<Chunk> {
        for class in self.table.candidates(remaining, ceiling_order) {
            let key = PoolKey {
                class_index: class.index,
                cached,
            };
            let Some(pool) = self.pools.get(key) else {
                continue;
            };
            match pool.alloc() {
                Ok(pages) => {
                    return Some(Chunk {
                        pages,
                        class,
                        cached,
                    });
                }
                Err(err) => self.log.record(
                    HeapLogLevel::Debug,
                    "allocate",
                    "degrade",
                    "retry_smaller",
                    LogFields::size(remaining).order(class.order),
                    err.to_string(),
                ),
            }
        }
        None
    }

    /// Hands an unused chunk back to its pool.
    pub fn release_chunk(&self, chunk: Chunk) {
        match self.pools.pool_for_order(chunk.pages.order, chunk.cached) {
            Some(pool) => pool.free(chunk.pages),
            None => self.frames.free_pages(chunk.pages),
        }
    }

    /// Covers `total_bytes` with chunks and commits them to a table.
    ///
    /// `total_bytes` must be page-aligned. Requests above half the system
    /// page count are rejected before any pool is touched. On failure every
    /// chunk obtained so far has been released.
    pub fn assemble(&self, total_bytes: usize, cached: bool) -> Result<SgTable> {
        debug_assert_eq!(total_bytes % PAGE_SIZE, 0);
        let requested_pages = pages_for_len(total_bytes);
        let limit_pages = self.config.admission_limit_pages();
        if requested_pages > limit_pages {
            self.log.record(
                HeapLogLevel::Warn,
                "allocate",
                "admission",
                "rejected",
                LogFields::size(total_bytes),
                format!("pages={requested_pages};limit={limit_pages}"),
            );
            return Err(HeapError::AdmissionRejected {
                requested_pages,
                limit_pages,
            });
        }

        let started = Instant::now();
        let mut pending: Vec<Chunk> = Vec::new();
        let mut remaining = total_bytes;
        let mut ceiling = self.table.largest_order();
        while remaining > 0 {
            let Some(chunk) = self.acquire_chunk(remaining, ceiling, cached) else {
                return Err(self.unwind(pending, total_bytes, OomReason::NoSizeClass));
            };
            remaining -= chunk.class.bytes();
            ceiling = chunk.class.order;
            pending.push(chunk);
        }

        let Some(mut table) = self.table_with_capacity(pending.len()) else {
            return Err(self.unwind(pending, total_bytes, OomReason::TableMetadata));
        };
        for chunk in &pending {
            table.push(SgEntry::from_pages(chunk.pages));
        }

        self.log.record(
            HeapLogLevel::Trace,
            "allocate",
            "assemble",
            "success",
            LogFields::size(total_bytes)
                .order(ceiling)
                .elapsed_us(elapsed_us(started)),
            format!("chunks={};cached={cached}", table.len()),
        );
        Ok(table)
    }

    fn table_with_capacity(&self, entries: usize) -> Option<SgTable> {
        if self
            .config
            .max_sg_entries
            .is_some_and(|max| entries > max)
        {
            return None;
        }
        SgTable::with_capacity(entries).ok()
    }

    fn unwind(&self, pending: Vec<Chunk>, total_bytes: usize, reason: OomReason) -> HeapError {
        let chunks = pending.len();
        for chunk in pending {
            self.release_chunk(chunk);
        }
        self.log.record(
            HeapLogLevel::Warn,
            "allocate",
            "rollback",
            "oom",
            LogFields::size(total_bytes),
            format!("chunks_returned={chunks};reason={reason}"),
        );
        HeapError::OutOfMemory {
            requested: total_bytes,
            reason,
        }
    }

    /// Returns one table entry to its pool, or to the frame allocator when
    /// `bypass_pools` is set.
    fn release_entry(&self, entry: &SgEntry, cached: bool, bypass_pools: bool) {
        let Some(block) = entry.as_block() else {
            self.log.record(
                HeapLogLevel::Error,
                "free",
                "release",
                "malformed_entry",
                LogFields::size(entry.length),
                format!("pfn={:#x}", entry.pfn),
            );
            return;
        };
        let pool = if bypass_pools {
            None
        } else {
            self.pools.pool_for_order(block.order, cached)
        };
        match pool {
            Some(pool) => pool.free(block),
            None => self.frames.free_pages(block),
        }
    }

    /// Reclaims idle chunks.
    ///
    /// `nr_pages == 0` only reports. Otherwise pools are drained largest
    /// class first, the uncached pool of a class before its cached pool,
    /// until at least `nr_pages` pages have been freed. Either way the
    /// result is the number of idle pages still resident afterwards, not the
    /// number evicted by this call.
    pub fn shrink(&self, hint: ReclaimHint, nr_pages: usize) -> usize {
        if nr_pages > 0 {
            let mut freed = 0;
            'classes: for class in self.table.iter() {
                for cached in [false, true] {
                    let key = PoolKey {
                        class_index: class.index,
                        cached,
                    };
                    if let Some(pool) = self.pools.get(key) {
                        freed += pool.shrink(hint, nr_pages - freed);
                        if freed >= nr_pages {
                            break 'classes;
                        }
                    }
                }
            }
            self.log.record(
                HeapLogLevel::Debug,
                "shrink",
                "evict",
                if freed >= nr_pages { "satisfied" } else { "exhausted" },
                LogFields::default(),
                format!("requested={nr_pages};freed={freed}"),
            );
        }

        let resident: usize = self
            .pools
            .iter()
            .map(|(_, pool)| pool.shrink(hint, 0))
            .sum();
        self.log.record(
            HeapLogLevel::Trace,
            "shrink",
            "report",
            "snapshot",
            LogFields::default(),
            format!("resident={resident};allow_highmem={}", hint.allow_highmem),
        );
        resident
    }

    /// Drains every pool. Returns the chunks handed back.
    pub fn destroy(self) -> usize {
        self.pools.destroy()
    }
}

impl Heap for SystemHeap {
    fn name(&self) -> &str {
        &self.config.heap_name
    }

    fn kind(&self) -> HeapKind {
        HeapKind::System
    }

    fn allocate(&self, request: BufferRequest) -> Result<Buffer> {
        if request.align > PAGE_SIZE {
            self.log.record(
                HeapLogLevel::Warn,
                "allocate",
                "validate",
                "invalid_argument",
                LogFields::size(request.len),
                format!("align={}", request.align),
            );
            return Err(ArgumentError::Alignment {
                align: request.align,
                granularity: PAGE_SIZE,
            }
            .into());
        }
        if request.len == 0 {
            return Err(ArgumentError::ZeroLength.into());
        }

        let Some(aligned) = page_align(request.len) else {
            return Err(HeapError::AdmissionRejected {
                requested_pages: pages_for_len(request.len),
                limit_pages: self.config.admission_limit_pages(),
            });
        };
        let table = self.assemble(aligned, request.cached)?;
        Ok(Buffer::new(
            HeapKind::System,
            request.len,
            request.cached,
            table,
        ))
    }

    fn free(&self, mut buffer: Buffer) -> Result<(), Buffer> {
        if buffer.origin() != HeapKind::System {
            self.log.record(
                HeapLogLevel::Error,
                "free",
                "release",
                "foreign_buffer",
                LogFields::size(buffer.size()),
                format!("buffer={};origin={}", buffer.id(), buffer.origin()),
            );
            return Err(buffer);
        }

        let unmapped = buffer.unmap_all();
        let forced = buffer.forced_reclaim();
        let cached = buffer.cached();
        let size = buffer.size();
        // Pooled chunks must be clean; forced reclaim skips the pools.
        if !forced {
            buffer.zero_fill(self.frames.as_ref());
        }
        let table = buffer.into_table();
        for entry in &table {
            self.release_entry(entry, cached, forced);
        }

        self.log.record(
            HeapLogLevel::Trace,
            "free",
            "release",
            if forced { "forced_reclaim" } else { "pooled" },
            LogFields::size(size),
            format!("chunks={};unmapped_domains={unmapped}", table.len()),
        );
        Ok(())
    }

    fn shrink(&self, hint: ReclaimHint, nr_pages: usize) -> usize {
        SystemHeap::shrink(self, hint, nr_pages)
    }

    fn report(&self) -> Option<HeapReport> {
        Some(HeapReport::capture(self.name(), self.kind(), &self.pools))
    }

    fn iommu(&self) -> Option<&dyn IommuMapper> {
        Some(self)
    }

    fn lifecycle_logs(&self) -> Vec<HeapLogRecord> {
        self.log.snapshot()
    }

    fn drain_lifecycle_logs(&self) -> Vec<HeapLogRecord> {
        self.log.drain()
    }

    fn destroy(self: Box<Self>) {
        SystemHeap::destroy(*self);
    }
}

impl IommuMapper for SystemHeap {
    fn map_iommu(
        &self,
        buffer: &mut Buffer,
        domain: &Arc<dyn IommuDomain>,
    ) -> Result<u64, IommuError> {
        match buffer.map_into(domain) {
            Ok(mapped) => {
                self.log.record(
                    HeapLogLevel::Trace,
                    "map_iommu",
                    "map",
                    if mapped.refs == 1 { "mapped" } else { "ref_taken" },
                    LogFields::size(buffer.sg_table().total_len()),
                    format!(
                        "buffer={};{};iova={:#x};refs={}",
                        buffer.id(),
                        domain.id(),
                        mapped.iova,
                        mapped.refs
                    ),
                );
                Ok(mapped.iova)
            }
            Err(err) => {
                self.log.record(
                    HeapLogLevel::Warn,
                    "map_iommu",
                    "map",
                    "failed",
                    LogFields::size(buffer.sg_table().total_len()),
                    err.to_string(),
                );
                Err(err)
            }
        }
    }

    fn unmap_iommu(&self, buffer: &mut Buffer, domain: DomainId) -> usize {
        let remaining = buffer.unmap_from(domain);
        self.log.record(
            HeapLogLevel::Trace,
            "unmap_iommu",
            "unmap",
            match remaining {
                None => "not_mapped",
                Some(0) => "unmapped",
                Some(_) => "ref_dropped",
            },
            LogFields::default(),
            format!("buffer={};{domain}", buffer.id()),
        );
        remaining.unwrap_or(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frame::SimulatedFrameAllocator;

    fn heap_with(frames: &Arc<SimulatedFrameAllocator>) -> SystemHeap {
        let shared: Arc<dyn FrameAllocator> = frames.clone();
        SystemHeap::new(
            shared,
            HeapConfig::default().with_total_system_pages(1 << 20),
        )
        .unwrap()
    }

    fn orders(buffer: &Buffer) -> Vec<u32> {
        buffer
            .sg_table()
            .iter()
            .filter_map(|entry| entry.as_block().map(|block| block.order))
            .collect()
    }

    #[test]
    fn acquire_chunk_degrades_to_smaller_class() {
        let frames = Arc::new(SimulatedFrameAllocator::new(8192));
        let heap = heap_with(&frames);
        frames.fail_order(8);

        let chunk = heap.acquire_chunk(300 * PAGE_SIZE, 8, false).unwrap();
        assert_eq!(chunk.class.order, 4);
        heap.release_chunk(chunk);
        assert_eq!(heap.pools().idle_pages(), 16);

        assert!(heap.acquire_chunk(PAGE_SIZE - 1, 8, false).is_none());
        assert!(
            heap.lifecycle_logs()
                .iter()
                .any(|record| record.event == "degrade" && record.order == Some(8))
        );
    }

    #[test]
    fn assemble_is_greedy_and_non_increasing() {
        let frames = Arc::new(SimulatedFrameAllocator::new(8192));
        let heap = heap_with(&frames);
        let buffer = heap.allocate(BufferRequest::new(289 * PAGE_SIZE)).unwrap();
        assert_eq!(orders(&buffer), vec![8, 4, 4, 0]);
        assert_eq!(buffer.sg_table().total_len(), 289 * PAGE_SIZE);
        heap.free(buffer).unwrap();
    }

    #[test]
    fn unaligned_length_rounds_up() {
        let frames = Arc::new(SimulatedFrameAllocator::new(1024));
        let heap = heap_with(&frames);
        let buffer = heap.allocate(BufferRequest::new(PAGE_SIZE + 1)).unwrap();
        assert_eq!(buffer.size(), PAGE_SIZE + 1);
        assert_eq!(buffer.sg_table().total_len(), 2 * PAGE_SIZE);
        heap.free(buffer).unwrap();
    }

    #[test]
    fn invalid_requests() {
        let frames = Arc::new(SimulatedFrameAllocator::new(1024));
        let heap = heap_with(&frames);
        let err = heap
            .allocate(BufferRequest::new(PAGE_SIZE).align(2 * PAGE_SIZE))
            .unwrap_err();
        assert_eq!(err.errno(), -libc::EINVAL);
        let err = heap.allocate(BufferRequest::new(0)).unwrap_err();
        assert!(matches!(
            err,
            HeapError::InvalidArgument(ArgumentError::ZeroLength)
        ));
        assert!(matches!(
            heap.allocate(BufferRequest::new(usize::MAX)),
            Err(HeapError::AdmissionRejected { .. })
        ));
        assert_eq!(frames.allocations(), 0);
    }

    #[test]
    fn metadata_failure_unwinds_chunks() {
        let frames = Arc::new(SimulatedFrameAllocator::new(8192));
        let shared: Arc<dyn FrameAllocator> = frames.clone();
        let heap = SystemHeap::new(
            shared,
            HeapConfig::default()
                .with_total_system_pages(1 << 20)
                .with_max_sg_entries(2),
        )
        .unwrap();

        let err = heap.allocate(BufferRequest::new(18 * PAGE_SIZE)).unwrap_err();
        assert!(matches!(
            err,
            HeapError::OutOfMemory {
                reason: OomReason::TableMetadata,
                ..
            }
        ));
        assert_eq!(heap.pools().idle_pages(), 18);
        assert_eq!(frames.pages_in_use(), 18);
    }

    #[test]
    fn free_zeroes_pooled_chunks() {
        let frames = Arc::new(SimulatedFrameAllocator::new(1024));
        let heap = heap_with(&frames);
        let buffer = heap
            .allocate(BufferRequest::new(16 * PAGE_SIZE).cached(true))
            .unwrap();
        let pfn = buffer.sg_table().entries()[0].pfn;
        frames.write_pages(pfn, 16);

        heap.free(buffer).unwrap();
        assert_eq!(frames.dirty_pages(), 0);
        assert_eq!(heap.pools().pool_for_order(4, true).unwrap().counts(), (0, 1));
    }

    #[test]
    fn forced_reclaim_bypasses_pools_and_zeroing() {
        let frames = Arc::new(SimulatedFrameAllocator::new(1024));
        let heap = heap_with(&frames);
        let mut buffer = heap
            .allocate(BufferRequest::new(16 * PAGE_SIZE).cached(true))
            .unwrap();
        let pfn = buffer.sg_table().entries()[0].pfn;
        frames.write_pages(pfn, 16);
        buffer.mark_forced_reclaim();

        heap.free(buffer).unwrap();
        assert_eq!(heap.pools().idle_pages(), 0);
        assert_eq!(frames.pages_in_use(), 0);
        assert_eq!(frames.dirty_pages(), 16);
    }

    #[test]
    fn shrink_reports_resident_total() {
        let frames = Arc::new(SimulatedFrameAllocator::new(8192));
        let heap = heap_with(&frames);
        let big = heap.allocate(BufferRequest::new(256 * PAGE_SIZE)).unwrap();
        let small = heap
            .allocate(BufferRequest::new(17 * PAGE_SIZE).cached(true))
            .unwrap();
        heap.free(big).unwrap();
        heap.free(small).unwrap();

        let hint = ReclaimHint::default();
        assert_eq!(heap.shrink(hint, 0), 273);
        assert_eq!(heap.shrink(hint, 0), 273);
        // The 256-page uncached chunk alone satisfies the request.
        assert_eq!(heap.shrink(hint, 100), 17);
        assert_eq!(heap.shrink(hint, 1000), 0);
        assert_eq!(frames.pages_in_use(), 0);
    }

    #[test]
    fn iommu_mapping_is_refcounted_per_domain() {
        use crate::iommu::LinearIovaDomain;

        let frames = Arc::new(SimulatedFrameAllocator::new(1024));
        let heap = heap_with(&frames);
        let linear = Arc::new(LinearIovaDomain::new(DomainId(0), 0x8000_0000, 1 << 30));
        let domain: Arc<dyn IommuDomain> = linear.clone();
        let mapper = heap.iommu().unwrap();

        let mut buffer = heap.allocate(BufferRequest::new(4 * PAGE_SIZE)).unwrap();
        let iova = mapper.map_iommu(&mut buffer, &domain).unwrap();
        assert_eq!(mapper.map_iommu(&mut buffer, &domain).unwrap(), iova);
        assert_eq!(buffer.iommu_mapping(DomainId(0)), Some((iova, 2)));

        assert_eq!(mapper.unmap_iommu(&mut buffer, DomainId(0)), 1);
        assert_eq!(mapper.unmap_iommu(&mut buffer, DomainId(9)), 0);

        heap.free(buffer).unwrap();
        assert_eq!(linear.live_ranges(), 0);
        assert_eq!(linear.unmaps(), 1);
    }

    #[test]
    fn destroy_returns_idle_memory() {
        let frames = Arc::new(SimulatedFrameAllocator::new(1024));
        let heap = heap_with(&frames);
        let buffer = heap.allocate(BufferRequest::new(17 * PAGE_SIZE)).unwrap();
        heap.free(buffer).unwrap();
        assert_eq!(heap.destroy(), 2);
        assert_eq!(frames.pages_in_use(), 0);
    }
}
