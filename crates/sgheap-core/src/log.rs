//! Structured heap lifecycle records.
//!
//! Every heap decision (allocation, release, reclaim, pool setup, device
//! mapping) appends one record to a bounded in-memory log. When the log is
//! full the oldest record is dropped.

use std::collections::VecDeque;

use parking_lot::Mutex;
use serde::Serialize;

/// Lifecycle log level.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum HeapLogLevel {
    Trace,
    Debug,
    Info,
    Warn,
    Error,
}

impl HeapLogLevel {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Trace => "trace",
            Self::Debug => "debug",
            Self::Info => "info",
            Self::Warn => "warn",
            Self::Error => "error",
        }
    }
}

/// Structured heap lifecycle record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct HeapLogRecord {
    /// Monotonic decision id, unique per heap.
    pub decision_id: u64,
    /// Correlation id: `sgheap::<heap>::<symbol>::<decision_id:016x>`.
    pub trace_id: String,
    /// Severity level.
    pub level: HeapLogLevel,
    /// Heap operation (`allocate`, `free`, `shrink`, `create`, ...).
    pub symbol: &'static str,
    /// Event kind (`assemble`, `rollback`, `evict`, ...).
    pub event: &'static str,
    /// Machine-readable outcome label.
    pub outcome: &'static str,
    /// Byte size involved in the event.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub size: Option<usize>,
    /// Chunk order involved in the event.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub order: Option<u32>,
    /// Wall time spent in the operation, in microseconds.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub elapsed_us: Option<u64>,
    /// Free-form details for debugging.
    pub details: String,
}

/// Optional numeric fields of a record.
#[derive(Debug, Clone, Copy, Default)]
pub(crate) struct LogFields {
    pub size: Option<usize>,
    pub order: Option<u32>,
    pub elapsed_us: Option<u64>,
}

impl LogFields {
    pub(crate) fn size(size: usize) -> Self {
        Self {
            size: Some(size),
            ..Self::default()
        }
    }

    pub(crate) fn order(mut self, order: u32) -> Self {
        self.order = Some(order);
        self
    }

    pub(crate) fn elapsed_us(mut self, elapsed_us: u64) -> Self {
        self.elapsed_us = Some(elapsed_us);
        self
    }
}

#[derive(Debug)]
struct LogState {
    next_decision_id: u64,
    records: VecDeque<HeapLogRecord>,
}

/// Bounded lifecycle log owned by one heap.
#[derive(Debug)]
pub(crate) struct HeapLog {
    heap: String,
    capacity: usize,
    state: Mutex<LogState>,
}

impl HeapLog {
    pub(crate) fn new(heap: impl Into<String>, capacity: usize) -> Self {
        Self {
            heap: heap.into(),
            capacity,
            state: Mutex::new(LogState {
                next_decision_id: 1,
                records: VecDeque::with_capacity(capacity.min(256)),
            }),
        }
    }

    pub(crate) fn record(
        &self,
        level: HeapLogLevel,
        symbol: &'static str,
        event: &'static str,
        outcome: &'static str,
        fields: LogFields,
        details: impl Into<String>,
    ) {
        if self.capacity == 0 {
            return;
        }
        let mut state = self.state.lock();
        let decision_id = state.next_decision_id;
        state.next_decision_id = state.next_decision_id.wrapping_add(1);
        if state.records.len() == self.capacity {
            state.records.pop_front();
        }
        state.records.push_back(HeapLogRecord {
            decision_id,
            trace_id: format!("sgheap::{}::{}::{:016x}", self.heap, symbol, decision_id),
            level,
            symbol,
            event,
            outcome,
            size: fields.size,
            order: fields.order,
            elapsed_us: fields.elapsed_us,
            details: details.into(),
        });
    }

    pub(crate) fn snapshot(&self) -> Vec<HeapLogRecord> {
        self.state.lock().records.iter().cloned().collect()
    }

    pub(crate) fn drain(&self) -> Vec<HeapLogRecord> {
        self.state.lock().records.drain(..).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn records_carry_trace_and_decision_ids() {
        let log = HeapLog::new("system", 16);
        log.record(
            HeapLogLevel::Trace,
            "allocate",
            "assemble",
            "success",
            LogFields::size(4096).order(0).elapsed_us(3),
            "chunks=1",
        );
        log.record(
            HeapLogLevel::Warn,
            "allocate",
            "assemble",
            "oom",
            LogFields::default(),
            "",
        );

        let records = log.drain();
        assert_eq!(records.len(), 2);
        assert_eq!(records[0].decision_id, 1);
        assert_eq!(records[0].trace_id, "sgheap::system::allocate::0000000000000001");
        assert_eq!(records[0].elapsed_us, Some(3));
        assert_eq!(records[1].decision_id, 2);
        assert_eq!(records[1].level, HeapLogLevel::Warn);
        assert!(log.snapshot().is_empty());
    }

    #[test]
    fn oldest_record_dropped_at_capacity() {
        let log = HeapLog::new("h", 2);
        for _ in 0..3 {
            log.record(
                HeapLogLevel::Debug,
                "shrink",
                "report",
                "snapshot",
                LogFields::default(),
                "",
            );
        }
        let ids: Vec<u64> = log.snapshot().iter().map(|r| r.decision_id).collect();
        assert_eq!(ids, vec![2, 3]);
    }

    #[test]
    fn zero_capacity_disables_recording() {
        let log = HeapLog::new("h", 0);
        log.record(
            HeapLogLevel::Info,
            "create",
            "pools",
            "success",
            LogFields::default(),
            "",
        );
        assert!(log.snapshot().is_empty());
    }

    #[test]
    fn serializes_without_absent_fields() {
        let log = HeapLog::new("h", 4);
        log.record(
            HeapLogLevel::Info,
            "destroy",
            "drain",
            "success",
            LogFields::default(),
            "chunks=0",
        );
        let json = serde_json::to_value(&log.snapshot()[0]).unwrap();
        assert_eq!(json["level"], "info");
        assert_eq!(json["symbol"], "destroy");
        assert!(json.get("size").is_none());
    }
}
