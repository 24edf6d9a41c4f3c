//! Idle-pool diagnostics.

use std::fmt;

use serde::Serialize;

use crate::heap::HeapKind;
use crate::pool::PoolSet;
use crate::size_class::order_to_size;

/// Idle chunks held by one pool.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct PoolReport {
    pub order: u32,
    pub cached: bool,
    pub high_count: usize,
    pub low_count: usize,
    pub high_bytes: usize,
    pub low_bytes: usize,
    /// Allocations served from idle chunks.
    pub hits: u64,
    /// Allocations that went to the frame allocator.
    pub misses: u64,
}

/// Read-only snapshot of a heap's pools, uncached pools first.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct HeapReport {
    pub heap: String,
    pub kind: HeapKind,
    pub pools: Vec<PoolReport>,
}

impl HeapReport {
    pub(crate) fn capture(heap: &str, kind: HeapKind, pools: &PoolSet) -> Self {
        let pools = pools
            .iter()
            .map(|(key, pool)| {
                let (high_count, low_count) = pool.counts();
                let chunk = order_to_size(pool.order());
                PoolReport {
                    order: pool.order(),
                    cached: key.cached,
                    high_count,
                    low_count,
                    high_bytes: high_count * chunk,
                    low_bytes: low_count * chunk,
                    hits: pool.hits(),
                    misses: pool.misses(),
                }
            })
            .collect();
        Self {
            heap: heap.to_owned(),
            kind,
            pools,
        }
    }

    /// Idle bytes across every pool and zone.
    #[must_use]
    pub fn idle_bytes(&self) -> usize {
        self.pools
            .iter()
            .map(|pool| pool.high_bytes + pool.low_bytes)
            .sum()
    }
}

impl fmt::Display for HeapReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for pool in &self.pools {
            let label = if pool.cached { "  cached" } else { "uncached" };
            writeln!(
                f,
                "{:3} order {} highmem pages in {} pool = {:12} total",
                pool.high_count, pool.order, label, pool.high_bytes
            )?;
            writeln!(
                f,
                "{:3} order {}  lowmem pages in {} pool = {:12} total",
                pool.low_count, pool.order, label, pool.low_bytes
            )?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classic_text_layout() {
        let report = HeapReport {
            heap: "system".into(),
            kind: HeapKind::System,
            pools: vec![
                PoolReport {
                    order: 8,
                    cached: false,
                    high_count: 2,
                    low_count: 0,
                    high_bytes: 2 * 1_048_576,
                    low_bytes: 0,
                    hits: 0,
                    misses: 2,
                },
                PoolReport {
                    order: 0,
                    cached: true,
                    high_count: 0,
                    low_count: 12,
                    high_bytes: 0,
                    low_bytes: 12 * 4096,
                    hits: 5,
                    misses: 12,
                },
            ],
        };
        let text = report.to_string();
        let lines: Vec<&str> = text.lines().collect();
        assert_eq!(
            lines,
            vec![
                "  2 order 8 highmem pages in uncached pool =      2097152 total",
                "  0 order 8  lowmem pages in uncached pool =            0 total",
                "  0 order 0 highmem pages in   cached pool =            0 total",
                " 12 order 0  lowmem pages in   cached pool =        49152 total",
            ]
        );
        assert_eq!(report.idle_bytes(), 2_097_152 + 49_152);
    }
}
