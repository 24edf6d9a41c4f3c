//! Workload replay harness for sgheap.
//!
//! This crate provides:
//! - Workload files: JSON scripts of allocate/free/shrink/map steps replayed
//!   against a heap backed by a simulated frame allocator
//! - Structured logging: heap lifecycle records exported as JSONL
//! - Log validation: schema checks over emitted JSONL files

#![forbid(unsafe_code)]

pub mod structured_log;
pub mod workload;

pub use structured_log::{LogEmitter, LogEntry, LogLevel};
pub use workload::{RunSummary, Step, Workload, WorkloadError};
