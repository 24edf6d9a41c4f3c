//! Scatter-gather tables describing a buffer's physical chunks.

use std::collections::TryReserveError;

use serde::Serialize;

use crate::frame::PhysicalPages;
use crate::size_class::{PAGE_SHIFT, PAGE_SIZE};

/// One contiguous run of physical memory.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct SgEntry {
    /// First page frame number.
    pub pfn: u64,
    /// Length in bytes; always a non-zero multiple of the page size.
    pub length: usize,
    /// Byte offset into the first page; always 0 for heap-built tables.
    pub offset: usize,
    pub highmem: bool,
}

impl SgEntry {
    pub(crate) fn from_pages(pages: PhysicalPages) -> Self {
        Self {
            pfn: pages.pfn,
            length: pages.bytes(),
            offset: 0,
            highmem: pages.highmem,
        }
    }

    #[must_use]
    pub fn page_count(&self) -> usize {
        self.length / PAGE_SIZE
    }

    #[must_use]
    pub fn phys_addr(&self) -> u64 {
        self.pfn << PAGE_SHIFT
    }

    /// The entry as one buddy block, if its page count is a power of two.
    #[must_use]
    pub fn as_block(&self) -> Option<PhysicalPages> {
        let pages = self.page_count();
        pages.is_power_of_two().then(|| PhysicalPages {
            pfn: self.pfn,
            order: pages.trailing_zeros(),
            highmem: self.highmem,
        })
    }
}

/// Ordered scatter-gather list describing a buffer's backing memory.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(transparent)]
pub struct SgTable {
    entries: Vec<SgEntry>,
}

impl SgTable {
    /// Reserves room for exactly `entries` entries, failing instead of
    /// aborting when the reservation cannot be made.
    pub(crate) fn with_capacity(entries: usize) -> Result<Self, TryReserveError> {
        let mut storage = Vec::new();
        storage.try_reserve_exact(entries)?;
        Ok(Self { entries: storage })
    }

    pub(crate) fn push(&mut self, entry: SgEntry) {
        debug_assert!(entry.length > 0);
        self.entries.push(entry);
    }

    #[must_use]
    pub fn entries(&self) -> &[SgEntry] {
        &self.entries
    }

    pub fn iter(&self) -> std::slice::Iter<'_, SgEntry> {
        self.entries.iter()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Sum of entry lengths in bytes.
    #[must_use]
    pub fn total_len(&self) -> usize {
        self.entries.iter().map(|entry| entry.length).sum()
    }
}

impl<'a> IntoIterator for &'a SgTable {
    type Item = &'a SgEntry;
    type IntoIter = std::slice::Iter<'a, SgEntry>;

    fn into_iter(self) -> Self::IntoIter {
        self.entries.iter()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn entry_block_round_trip() {
        let block = PhysicalPages {
            pfn: 0x800,
            order: 4,
            highmem: true,
        };
        let entry = SgEntry::from_pages(block);
        assert_eq!(entry.page_count(), 16);
        assert_eq!(entry.as_block(), Some(block));

        let trimmed = SgEntry {
            length: 10 * PAGE_SIZE,
            ..entry
        };
        assert_eq!(trimmed.as_block(), None);
    }

    #[test]
    fn table_totals() {
        let mut table = SgTable::with_capacity(2).unwrap();
        table.push(SgEntry::from_pages(PhysicalPages {
            pfn: 0x100,
            order: 8,
            highmem: false,
        }));
        table.push(SgEntry::from_pages(PhysicalPages {
            pfn: 0x300,
            order: 0,
            highmem: false,
        }));
        assert_eq!(table.len(), 2);
        assert_eq!(table.total_len(), 257 * PAGE_SIZE);
        assert!(table.iter().all(|entry| entry.offset == 0));
    }

    #[test]
    fn impossible_reservation_fails() {
        assert!(SgTable::with_capacity(usize::MAX).is_err());
    }
}
