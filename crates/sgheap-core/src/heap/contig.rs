//! Single-block contiguous heap.
//!
//! Requests are rounded up to a power-of-two block taken straight from the
//! frame allocator. The block is split into pages and the tail beyond the
//! page-aligned length is returned at once. Nothing is pooled.

use std::sync::Arc;
use std::time::Instant;

use crate::config::HeapConfig;
use crate::error::{ArgumentError, HeapError, OomReason, Result};
use crate::frame::{FrameAllocator, GfpFlags, PhysicalPages};
use crate::log::{HeapLog, HeapLogLevel, HeapLogRecord, LogFields};
use crate::size_class::{PAGE_SHIFT, PAGE_SIZE, order_for_len, pages_for_len};

use super::{Buffer, BufferRequest, Heap, HeapKind, SgEntry, SgTable, elapsed_us};

#[derive(Debug)]
pub struct ContiguousHeap {
    config: HeapConfig,
    frames: Arc<dyn FrameAllocator>,
    log: HeapLog,
}

impl ContiguousHeap {
    #[must_use]
    pub fn new(frames: Arc<dyn FrameAllocator>, config: HeapConfig) -> Self {
        let log = HeapLog::new(config.heap_name.clone(), config.log_capacity);
        Self {
            config,
            frames,
            log,
        }
    }

    /// Allocates one physically contiguous region of `len` bytes.
    ///
    /// `align` may not exceed the power-of-two block that covers `len`.
    /// The returned table has exactly one entry.
    pub fn allocate_contiguous(&self, len: usize, align: usize) -> Result<SgTable> {
        if len == 0 {
            return Err(ArgumentError::ZeroLength.into());
        }
        let oom = |reason| HeapError::OutOfMemory {
            requested: len,
            reason,
        };
        let order = order_for_len(len).ok_or(oom(OomReason::Frames))?;
        let granularity = 1usize.checked_shl(order + PAGE_SHIFT).unwrap_or(usize::MAX);
        if align > granularity {
            self.log.record(
                HeapLogLevel::Warn,
                "allocate",
                "validate",
                "invalid_argument",
                LogFields::size(len).order(order),
                format!("align={align};granularity={granularity}"),
            );
            return Err(ArgumentError::Alignment { align, granularity }.into());
        }

        let started = Instant::now();
        let block = match self.frames.alloc_pages(order, GfpFlags::LOW_ORDER) {
            Ok(block) => block,
            Err(err) => {
                self.log.record(
                    HeapLogLevel::Warn,
                    "allocate",
                    "contiguous",
                    "oom",
                    LogFields::size(len).order(order),
                    err.to_string(),
                );
                return Err(oom(OomReason::Frames));
            }
        };

        let retained = pages_for_len(len);
        let pages = self.frames.split(block);
        for &page in &pages[retained..] {
            self.frames.free_pages(page);
        }

        let table = SgTable::with_capacity(1)
            .ok()
            .filter(|_| self.config.max_sg_entries.is_none_or(|max| max >= 1));
        let Some(mut table) = table else {
            for &page in &pages[..retained] {
                self.frames.free_pages(page);
            }
            self.log.record(
                HeapLogLevel::Warn,
                "allocate",
                "contiguous",
                "oom",
                LogFields::size(len).order(order),
                "table metadata allocation failed",
            );
            return Err(oom(OomReason::TableMetadata));
        };
        table.push(SgEntry {
            pfn: block.pfn,
            length: retained * PAGE_SIZE,
            offset: 0,
            highmem: block.highmem,
        });
        self.frames.sync_for_device(block.pfn, retained);

        self.log.record(
            HeapLogLevel::Trace,
            "allocate",
            "contiguous",
            "success",
            LogFields::size(len)
                .order(order)
                .elapsed_us(elapsed_us(started)),
            format!("retained={retained};trimmed={}", pages.len() - retained),
        );
        Ok(table)
    }

    fn release(&self, table: &SgTable) {
        for entry in table {
            for i in 0..entry.page_count() as u64 {
                self.frames.free_pages(PhysicalPages {
                    pfn: entry.pfn + i,
                    order: 0,
                    highmem: entry.highmem,
                });
            }
        }
    }
}

impl Heap for ContiguousHeap {
    fn name(&self) -> &str {
        &self.config.heap_name
    }

    fn kind(&self) -> HeapKind {
        HeapKind::SystemContig
    }

    fn allocate(&self, request: BufferRequest) -> Result<Buffer> {
        let table = self.allocate_contiguous(request.len, request.align)?;
        Ok(Buffer::new(
            HeapKind::SystemContig,
            request.len,
            request.cached,
            table,
        ))
    }

    fn free(&self, mut buffer: Buffer) -> Result<(), Buffer> {
        if buffer.origin() != HeapKind::SystemContig {
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
        buffer.unmap_all();
        let size = buffer.size();
        let table = buffer.into_table();
        self.release(&table);
        self.log.record(
            HeapLogLevel::Trace,
            "free",
            "release",
            "returned",
            LogFields::size(size),
            format!("pages={}", pages_for_len(table.total_len())),
        );
        Ok(())
    }

    fn phys(&self, buffer: &Buffer) -> Option<(u64, usize)> {
        if buffer.origin() != HeapKind::SystemContig {
            return None;
        }
        let entry = buffer.sg_table().entries().first()?;
        Some((entry.phys_addr(), buffer.size()))
    }

    fn lifecycle_logs(&self) -> Vec<HeapLogRecord> {
        self.log.snapshot()
    }

    fn drain_lifecycle_logs(&self) -> Vec<HeapLogRecord> {
        self.log.drain()
    }

    fn destroy(self: Box<Self>) {}
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frame::SimulatedFrameAllocator;

    fn heap_with(frames: &Arc<SimulatedFrameAllocator>, config: HeapConfig) -> ContiguousHeap {
        let shared: Arc<dyn FrameAllocator> = frames.clone();
        ContiguousHeap::new(shared, config)
    }

    #[test]
    fn trims_tail_pages() {
        let frames = Arc::new(SimulatedFrameAllocator::new(64));
        let heap = heap_with(&frames, HeapConfig::default());

        let table = heap.allocate_contiguous(10 * PAGE_SIZE, PAGE_SIZE).unwrap();
        assert_eq!(table.len(), 1);
        assert_eq!(table.entries()[0].length, 10 * PAGE_SIZE);
        assert_eq!(frames.pages_in_use(), 10);
        assert_eq!(frames.frees(), 6);
        assert_eq!(frames.pages_synced(), 10);
        heap.release(&table);
        assert_eq!(frames.pages_in_use(), 0);
    }

    #[test]
    fn alignment_checked_against_block_size() {
        let frames = Arc::new(SimulatedFrameAllocator::new(64));
        let heap = heap_with(&frames, HeapConfig::default());

        assert!(heap.allocate_contiguous(3 * PAGE_SIZE, 4 * PAGE_SIZE).is_ok());
        let err = heap
            .allocate_contiguous(3 * PAGE_SIZE, 8 * PAGE_SIZE)
            .unwrap_err();
        assert!(matches!(
            err,
            HeapError::InvalidArgument(ArgumentError::Alignment {
                granularity, ..
            }) if granularity == 4 * PAGE_SIZE
        ));
        assert!(matches!(
            heap.allocate_contiguous(0, PAGE_SIZE),
            Err(HeapError::InvalidArgument(ArgumentError::ZeroLength))
        ));
    }

    #[test]
    fn frame_exhaustion_is_out_of_memory() {
        let frames = Arc::new(SimulatedFrameAllocator::new(8));
        let heap = heap_with(&frames, HeapConfig::default());
        let err = heap.allocate_contiguous(9 * PAGE_SIZE, PAGE_SIZE).unwrap_err();
        assert!(matches!(
            err,
            HeapError::OutOfMemory {
                reason: OomReason::Frames,
                ..
            }
        ));
        assert!(heap.allocate_contiguous(usize::MAX, 0).is_err());
    }

    #[test]
    fn metadata_failure_frees_retained_pages() {
        let frames = Arc::new(SimulatedFrameAllocator::new(64));
        let heap = heap_with(&frames, HeapConfig::default().with_max_sg_entries(0));
        let err = heap.allocate_contiguous(5 * PAGE_SIZE, PAGE_SIZE).unwrap_err();
        assert!(matches!(
            err,
            HeapError::OutOfMemory {
                reason: OomReason::TableMetadata,
                ..
            }
        ));
        assert_eq!(frames.pages_in_use(), 0);
    }

    #[test]
    fn phys_reports_start_and_requested_size() {
        let frames = Arc::new(SimulatedFrameAllocator::new(64));
        let heap = heap_with(&frames, HeapConfig::default());
        let buffer = heap
            .allocate(BufferRequest::new(3 * PAGE_SIZE - 100))
            .unwrap();
        let (addr, len) = heap.phys(&buffer).unwrap();
        assert_eq!(addr, buffer.sg_table().entries()[0].phys_addr());
        assert_eq!(len, 3 * PAGE_SIZE - 100);
        assert_eq!(buffer.sg_table().total_len(), 3 * PAGE_SIZE);

        heap.free(buffer).unwrap();
        assert_eq!(frames.pages_in_use(), 0);
        assert!(heap.lifecycle_logs().iter().any(|r| r.symbol == "free"));
    }
}
