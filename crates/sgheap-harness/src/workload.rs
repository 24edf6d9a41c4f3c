//! Workload replay.
//!
//! A workload is a JSON document naming a heap configuration and a list of
//! steps. Steps run in order against a fresh heap backed by a
//! [`SimulatedFrameAllocator`]; every step result and every heap lifecycle
//! record is written to the [`LogEmitter`].
//!
//! ```json
//! {
//!   "name": "camera-burst",
//!   "heap": { "kind": "system", "frame_pages": 4096, "total_system_pages": 65536 },
//!   "steps": [
//!     { "op": "alloc", "id": "preview", "len": 1052672, "cached": true },
//!     { "op": "map", "id": "preview", "domain": 0 },
//!     { "op": "free", "id": "preview" },
//!     { "op": "shrink", "pages": 0 }
//!   ]
//! }
//! ```

use std::collections::BTreeMap;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use sgheap_core::size_class::SizeClassError;
use sgheap_core::{
    Buffer, BufferRequest, ContiguousHeap, DomainId, FrameAllocator, Heap, HeapConfig, HeapError,
    HeapKind, HeapReport, IommuDomain, IommuMapper, LinearIovaDomain, PAGE_SIZE, ReclaimHint,
    SimulatedFrameAllocator, SizeClassTable, SystemHeap,
};
use thiserror::Error;

use crate::structured_log::{LogEmitter, LogEntry, LogLevel};

/// Device address space given to each workload domain.
const DOMAIN_SPAN: u64 = 1 << 32;

#[derive(Debug, Error)]
pub enum WorkloadError {
    #[error("failed to read workload {path}: {source}")]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("malformed workload: {0}")]
    Parse(#[from] serde_json::Error),
    #[error("invalid size-class orders: {0}")]
    SizeClasses(#[from] SizeClassError),
    #[error("heap construction failed: {0}")]
    HeapCreation(#[source] HeapError),
    #[error("step {step}: no live buffer named '{id}'")]
    UnknownBuffer { step: usize, id: String },
    #[error("step {step}: buffer '{id}' is still live")]
    DuplicateBuffer { step: usize, id: String },
    #[error("step {step}: {kind} heap does not support '{op}'")]
    Unsupported {
        step: usize,
        kind: HeapKind,
        op: &'static str,
    },
    #[error("step {step}: domain {domain} has no IOVA window below 2^64")]
    DomainOutOfRange { step: usize, domain: u32 },
    #[error("log output failed: {0}")]
    Log(#[from] std::io::Error),
}

/// Which heap a workload drives.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HeapChoice {
    #[default]
    System,
    SystemContig,
}

/// Heap and frame-allocator setup.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct HeapSpec {
    pub kind: HeapChoice,
    pub name: String,
    /// Low-memory frames backing the heap.
    pub frame_pages: usize,
    /// High-memory frames backing the heap.
    pub highmem_pages: usize,
    /// Largest order the frame allocator serves.
    pub max_order: Option<u32>,
    /// Admission base; taken from the environment when absent.
    pub total_system_pages: Option<usize>,
    /// Size-class orders, largest first.
    pub orders: Option<Vec<u32>>,
    pub log_capacity: Option<usize>,
    pub max_sg_entries: Option<usize>,
}

impl Default for HeapSpec {
    fn default() -> Self {
        Self {
            kind: HeapChoice::System,
            name: String::from("system"),
            frame_pages: 16_384,
            highmem_pages: 0,
            max_order: None,
            total_system_pages: None,
            orders: None,
            log_capacity: None,
            max_sg_entries: None,
        }
    }
}

impl HeapSpec {
    fn config(&self) -> HeapConfig {
        let mut config = HeapConfig::from_env().with_heap_name(self.name.clone());
        if let Some(pages) = self.total_system_pages {
            config = config.with_total_system_pages(pages);
        }
        if let Some(capacity) = self.log_capacity {
            config = config.with_log_capacity(capacity);
        }
        if let Some(max) = self.max_sg_entries {
            config = config.with_max_sg_entries(max);
        }
        config
    }

    fn frames(&self) -> SimulatedFrameAllocator {
        let frames = SimulatedFrameAllocator::with_highmem(self.frame_pages, self.highmem_pages);
        match self.max_order {
            Some(order) => frames.with_max_order(order),
            None => frames,
        }
    }
}

fn default_align() -> usize {
    PAGE_SIZE
}

fn default_true() -> bool {
    true
}

/// One workload action.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case", deny_unknown_fields)]
pub enum Step {
    /// Allocates a buffer and names it `id`. With `expect_errno` set the
    /// allocation is expected to fail with that (negative) errno.
    Alloc {
        id: String,
        len: usize,
        #[serde(default)]
        cached: bool,
        #[serde(default = "default_align")]
        align: usize,
        #[serde(default)]
        expect_errno: Option<i32>,
    },
    /// Frees buffer `id`; `forced` marks it for reclaim first.
    Free {
        id: String,
        #[serde(default)]
        forced: bool,
    },
    /// Runs the reclaimer; `pages == 0` only counts.
    Shrink {
        pages: usize,
        #[serde(default = "default_true")]
        allow_highmem: bool,
    },
    /// Makes the frame allocator refuse `order`.
    FailOrder { order: u32 },
    RestoreOrder { order: u32 },
    /// Maps buffer `id` into device domain `domain`.
    Map { id: String, domain: u32 },
    Unmap { id: String, domain: u32 },
    /// Captures a pool report into the summary.
    Report,
}

impl Step {
    #[must_use]
    pub fn op(&self) -> &'static str {
        match self {
            Self::Alloc { .. } => "alloc",
            Self::Free { .. } => "free",
            Self::Shrink { .. } => "shrink",
            Self::FailOrder { .. } => "fail_order",
            Self::RestoreOrder { .. } => "restore_order",
            Self::Map { .. } => "map",
            Self::Unmap { .. } => "unmap",
            Self::Report => "report",
        }
    }
}

/// A scripted heap workload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Workload {
    pub name: String,
    #[serde(default)]
    pub heap: HeapSpec,
    pub steps: Vec<Step>,
}

/// Result of replaying a workload.
#[derive(Debug, Clone, Serialize)]
pub struct RunSummary {
    pub workload: String,
    pub heap: String,
    pub kind: HeapKind,
    pub steps: usize,
    pub allocations: usize,
    pub failed_allocations: usize,
    pub frees: usize,
    /// Results of each shrink step, in order.
    pub shrink_results: Vec<usize>,
    /// Device addresses returned by map steps, in order.
    pub iovas: Vec<u64>,
    /// Steps whose result did not match the script.
    pub mismatches: Vec<String>,
    /// Buffers the script never freed; the runner frees them at the end.
    pub leaked_buffers: Vec<String>,
    /// Frames backing the heap, low and high memory together.
    pub frame_capacity: usize,
    pub frames_in_use_at_end: usize,
    pub frames_in_use_after_destroy: usize,
    pub frame_allocations: u64,
    pub pages_zeroed: u64,
    pub reports: Vec<HeapReport>,
}

impl RunSummary {
    /// No mismatched step, and destroying the heap returned every frame.
    #[must_use]
    pub fn passed(&self) -> bool {
        self.mismatches.is_empty() && self.frames_in_use_after_destroy == 0
    }
}

impl Workload {
    pub fn from_json(text: &str) -> Result<Self, WorkloadError> {
        Ok(serde_json::from_str(text)?)
    }

    pub fn from_file(path: &Path) -> Result<Self, WorkloadError> {
        let text = std::fs::read_to_string(path).map_err(|source| WorkloadError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_json(&text)
    }

    /// Replays every step against a fresh heap.
    pub fn run<W: Write>(&self, emitter: &mut LogEmitter<W>) -> Result<RunSummary, WorkloadError> {
        let frames = Arc::new(self.heap.frames());
        let shared: Arc<dyn FrameAllocator> = frames.clone();
        let config = self.heap.config();
        let heap: Box<dyn Heap> = match self.heap.kind {
            HeapChoice::System => {
                let table = match &self.heap.orders {
                    Some(orders) => Arc::new(SizeClassTable::new(orders)?),
                    None => SizeClassTable::global(),
                };
                let heap = SystemHeap::with_table(shared, table, config)
                    .map_err(WorkloadError::HeapCreation)?;
                Box::new(heap)
            }
            HeapChoice::SystemContig => Box::new(ContiguousHeap::new(shared, config)),
        };

        emitter.emit_entry(
            LogEntry::new(String::new(), LogLevel::Info, "workload_start")
                .with_heap(heap.name())
                .with_details(serde_json::json!({
                    "run_id": emitter.run_id(),
                    "workload": self.name,
                    "kind": heap.kind(),
                    "frame_capacity": frames.capacity_pages(),
                    "steps": self.steps.len(),
                })),
        )?;

        let mut replay = Replay {
            heap: heap.as_ref(),
            frames: &frames,
            live: BTreeMap::new(),
            domains: BTreeMap::new(),
            summary: RunSummary {
                workload: self.name.clone(),
                heap: heap.name().to_string(),
                kind: heap.kind(),
                steps: self.steps.len(),
                allocations: 0,
                failed_allocations: 0,
                frees: 0,
                shrink_results: Vec::new(),
                iovas: Vec::new(),
                mismatches: Vec::new(),
                leaked_buffers: Vec::new(),
                frame_capacity: frames.capacity_pages(),
                frames_in_use_at_end: 0,
                frames_in_use_after_destroy: 0,
                frame_allocations: 0,
                pages_zeroed: 0,
                reports: Vec::new(),
            },
        };
        for (index, step) in self.steps.iter().enumerate() {
            replay.step(index, step, emitter)?;
            emitter.emit_heap_records(heap.name(), &heap.drain_lifecycle_logs())?;
        }
        let mut summary = replay.finish(emitter)?;
        emitter.emit_heap_records(heap.name(), &heap.drain_lifecycle_logs())?;

        let name = heap.name().to_string();
        heap.destroy();
        summary.frames_in_use_after_destroy = frames.pages_in_use();
        summary.frame_allocations = frames.allocations();
        summary.pages_zeroed = frames.pages_zeroed();

        let level = if summary.passed() {
            LogLevel::Info
        } else {
            LogLevel::Warn
        };
        emitter.emit_entry(
            LogEntry::new(String::new(), level, "workload_end")
                .with_heap(name)
                .with_outcome(if summary.passed() { "pass" } else { "fail" })
                .with_details(serde_json::json!({
                    "mismatches": summary.mismatches.len(),
                    "leaked_buffers": summary.leaked_buffers.len(),
                    "frames_in_use_after_destroy": summary.frames_in_use_after_destroy,
                })),
        )?;
        emitter.flush()?;
        Ok(summary)
    }
}

struct Replay<'a> {
    heap: &'a dyn Heap,
    frames: &'a SimulatedFrameAllocator,
    live: BTreeMap<String, Buffer>,
    domains: BTreeMap<u32, Arc<dyn IommuDomain>>,
    summary: RunSummary,
}

impl Replay<'_> {
    fn step<W: Write>(
        &mut self,
        index: usize,
        step: &Step,
        emitter: &mut LogEmitter<W>,
    ) -> Result<(), WorkloadError> {
        match step {
            Step::Alloc {
                id,
                len,
                cached,
                align,
                expect_errno,
            } => {
                if self.live.contains_key(id) {
                    return Err(WorkloadError::DuplicateBuffer {
                        step: index,
                        id: id.clone(),
                    });
                }
                let request = BufferRequest::new(*len).cached(*cached).align(*align);
                match (self.heap.allocate(request), expect_errno) {
                    (Ok(buffer), None) => {
                        self.summary.allocations += 1;
                        self.live.insert(id.clone(), buffer);
                    }
                    (Ok(buffer), Some(errno)) => {
                        self.summary.allocations += 1;
                        self.live.insert(id.clone(), buffer);
                        self.mismatch(
                            index,
                            step,
                            format!("allocated '{id}' but expected errno {errno}"),
                            emitter,
                        )?;
                    }
                    (Err(err), expected) => {
                        self.summary.failed_allocations += 1;
                        emitter.emit_entry(
                            LogEntry::new(String::new(), LogLevel::Debug, "alloc_failed")
                                .with_heap(self.heap.name())
                                .with_size(*len)
                                .with_errno(err.errno())
                                .with_details(serde_json::json!({
                                    "step": index,
                                    "id": id,
                                    "error": err.to_string(),
                                })),
                        )?;
                        if *expected != Some(err.errno()) {
                            self.mismatch(index, step, format!("'{id}' failed: {err}"), emitter)?;
                        }
                    }
                }
            }
            Step::Free { id, forced } => {
                let mut buffer = self.take(index, id)?;
                if *forced {
                    buffer.mark_forced_reclaim();
                }
                match self.heap.free(buffer) {
                    Ok(()) => self.summary.frees += 1,
                    Err(buffer) => {
                        let refused = format!("'{id}' refused by {}", self.heap.name());
                        self.live.insert(id.clone(), buffer);
                        self.mismatch(index, step, refused, emitter)?;
                    }
                }
            }
            Step::Shrink {
                pages,
                allow_highmem,
            } => {
                let hint = ReclaimHint {
                    allow_highmem: *allow_highmem,
                };
                let resident = self.heap.shrink(hint, *pages);
                self.summary.shrink_results.push(resident);
            }
            Step::FailOrder { order } => self.frames.fail_order(*order),
            Step::RestoreOrder { order } => self.frames.restore_order(*order),
            Step::Map { id, domain } => {
                let mapper = mapper(self.heap, index, step)?;
                let base = domain_base(*domain).ok_or(WorkloadError::DomainOutOfRange {
                    step: index,
                    domain: *domain,
                })?;
                let domain = Arc::clone(self.domains.entry(*domain).or_insert_with(|| {
                    let created: Arc<dyn IommuDomain> =
                        Arc::new(LinearIovaDomain::new(DomainId(*domain), base, DOMAIN_SPAN));
                    created
                }));
                let buffer = self
                    .live
                    .get_mut(id)
                    .ok_or_else(|| WorkloadError::UnknownBuffer {
                        step: index,
                        id: id.clone(),
                    })?;
                match mapper.map_iommu(buffer, &domain) {
                    Ok(iova) => self.summary.iovas.push(iova),
                    Err(err) => self.mismatch(index, step, err.to_string(), emitter)?,
                }
            }
            Step::Unmap { id, domain } => {
                let mapper = mapper(self.heap, index, step)?;
                let buffer = self
                    .live
                    .get_mut(id)
                    .ok_or_else(|| WorkloadError::UnknownBuffer {
                        step: index,
                        id: id.clone(),
                    })?;
                mapper.unmap_iommu(buffer, DomainId(*domain));
            }
            Step::Report => {
                if let Some(report) = self.heap.report() {
                    self.summary.reports.push(report);
                }
            }
        }
        Ok(())
    }

    fn take(&mut self, index: usize, id: &str) -> Result<Buffer, WorkloadError> {
        self.live
            .remove(id)
            .ok_or_else(|| WorkloadError::UnknownBuffer {
                step: index,
                id: id.to_string(),
            })
    }

    fn mismatch<W: Write>(
        &mut self,
        index: usize,
        step: &Step,
        message: String,
        emitter: &mut LogEmitter<W>,
    ) -> Result<(), WorkloadError> {
        emitter.emit_entry(
            LogEntry::new(String::new(), LogLevel::Warn, "step_mismatch")
                .with_heap(self.heap.name())
                .with_outcome("mismatch")
                .with_details(serde_json::json!({
                    "step": index,
                    "op": step.op(),
                    "message": message,
                })),
        )?;
        self.summary
            .mismatches
            .push(format!("step {index} ({}): {message}", step.op()));
        Ok(())
    }

    /// Frees whatever the script left live.
    fn finish<W: Write>(mut self, emitter: &mut LogEmitter<W>) -> Result<RunSummary, WorkloadError> {
        self.summary.frames_in_use_at_end = self.frames.pages_in_use();
        for (id, buffer) in std::mem::take(&mut self.live) {
            emitter.emit_entry(
                LogEntry::new(String::new(), LogLevel::Warn, "buffer_leaked")
                    .with_heap(self.heap.name())
                    .with_size(buffer.size())
                    .with_details(serde_json::json!({ "id": id })),
            )?;
            if let Err(buffer) = self.heap.free(buffer) {
                self.summary
                    .mismatches
                    .push(format!("'{id}' ({} bytes) refused at teardown", buffer.size()));
            }
            self.summary.leaked_buffers.push(id);
        }
        Ok(self.summary)
    }
}

/// Start of a domain's IOVA window; domain `n` owns `[(n + 1) * span, (n + 2) * span)`.
fn domain_base(domain: u32) -> Option<u64> {
    u64::from(domain).checked_add(1)?.checked_mul(DOMAIN_SPAN)
}

fn mapper<'h>(
    heap: &'h dyn Heap,
    index: usize,
    step: &Step,
) -> Result<&'h dyn IommuMapper, WorkloadError> {
    heap.iommu().ok_or(WorkloadError::Unsupported {
        step: index,
        kind: heap.kind(),
        op: step.op(),
    })
}
