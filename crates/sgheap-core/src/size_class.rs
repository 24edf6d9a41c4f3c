//! Size classes for pooled chunk allocation.
//!
//! Chunks are handed out in a fixed set of power-of-two page counts,
//! expressed as buddy orders (`pages = 1 << order`). The table is kept in
//! descending order so the first entry is the largest chunk a single
//! allocation step may ever return.

use std::sync::{Arc, OnceLock};

use thiserror::Error;

/// Log2 of the page size.
pub const PAGE_SHIFT: u32 = 12;

/// Page size in bytes (4KB).
pub const PAGE_SIZE: usize = 1 << PAGE_SHIFT;

/// Orders served by the default table: 256, 16 and 1 pages.
pub const DEFAULT_ORDERS: [u32; 3] = [8, 4, 0];

/// Largest order a table may contain. Keeps byte sizes well inside `usize`.
pub const MAX_TABLE_ORDER: u32 = 20;

/// Rejected size-class table layouts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum SizeClassError {
    #[error("size-class table is empty")]
    Empty,
    #[error("order {order} at index {index} is not strictly below its predecessor")]
    NotDescending { index: usize, order: u32 },
    #[error("order {order} exceeds the maximum table order {}", MAX_TABLE_ORDER)]
    OrderTooLarge { order: u32 },
}

/// Byte size of a chunk of the given order.
#[must_use]
pub const fn order_to_size(order: u32) -> usize {
    PAGE_SIZE << order
}

/// Rounds a byte length up to the next page boundary.
///
/// Returns `None` when the rounded length does not fit in `usize`.
#[must_use]
pub fn page_align(len: usize) -> Option<usize> {
    len.checked_add(PAGE_SIZE - 1).map(|end| end & !(PAGE_SIZE - 1))
}

/// Number of pages needed to hold `len` bytes.
#[must_use]
pub fn pages_for_len(len: usize) -> usize {
    len.div_ceil(PAGE_SIZE)
}

/// Smallest order whose block covers `len` bytes.
///
/// A zero length maps to order 0. Returns `None` if no representable
/// power-of-two page count covers the length.
#[must_use]
pub fn order_for_len(len: usize) -> Option<u32> {
    let pages = pages_for_len(len).max(1);
    pages
        .checked_next_power_of_two()
        .map(|pow| pow.trailing_zeros())
}

/// One entry of a [`SizeClassTable`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SizeClass {
    /// Position in the table (0 is the largest class).
    pub index: usize,
    /// Buddy order of chunks in this class.
    pub order: u32,
}

impl SizeClass {
    /// Byte size of one chunk of this class.
    #[must_use]
    pub const fn bytes(self) -> usize {
        order_to_size(self.order)
    }

    /// Page count of one chunk of this class.
    #[must_use]
    pub const fn pages(self) -> usize {
        1 << self.order
    }
}

/// Descending list of supported chunk granularities.
///
/// Immutable once built. Heaps share one table by `Arc`; the process-wide
/// default is available through [`SizeClassTable::global`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SizeClassTable {
    orders: Box<[u32]>,
}

static GLOBAL_TABLE: OnceLock<Arc<SizeClassTable>> = OnceLock::new();

impl SizeClassTable {
    /// Builds a table from strictly descending orders.
    pub fn new(orders: &[u32]) -> Result<Self, SizeClassError> {
        let Some(&first) = orders.first() else {
            return Err(SizeClassError::Empty);
        };
        if first > MAX_TABLE_ORDER {
            return Err(SizeClassError::OrderTooLarge { order: first });
        }
        for (index, pair) in orders.windows(2).enumerate() {
            if pair[1] >= pair[0] {
                return Err(SizeClassError::NotDescending {
                    index: index + 1,
                    order: pair[1],
                });
            }
        }
        Ok(Self {
            orders: orders.into(),
        })
    }

    /// The process-wide default table (`{256, 16, 1}` pages).
    #[must_use]
    pub fn global() -> Arc<Self> {
        Arc::clone(GLOBAL_TABLE.get_or_init(|| {
            Arc::new(Self {
                orders: DEFAULT_ORDERS.into(),
            })
        }))
    }

    /// Orders in descending order.
    #[must_use]
    pub fn orders(&self) -> &[u32] {
        &self.orders
    }

    /// Number of classes.
    #[must_use]
    pub fn len(&self) -> usize {
        self.orders.len()
    }

    /// Always false; construction rejects empty tables.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.orders.is_empty()
    }

    /// Order of the largest class.
    #[must_use]
    pub fn largest_order(&self) -> u32 {
        self.orders[0]
    }

    /// Order of the smallest class.
    #[must_use]
    pub fn smallest_order(&self) -> u32 {
        self.orders[self.orders.len() - 1]
    }

    /// Table index of `order`, if the table serves it.
    #[must_use]
    pub fn index_of(&self, order: u32) -> Option<usize> {
        self.orders.iter().position(|&o| o == order)
    }

    /// Class at `index`.
    #[must_use]
    pub fn get(&self, index: usize) -> Option<SizeClass> {
        self.orders
            .get(index)
            .map(|&order| SizeClass { index, order })
    }

    /// All classes, largest first.
    pub fn iter(&self) -> impl Iterator<Item = SizeClass> + '_ {
        self.orders
            .iter()
            .enumerate()
            .map(|(index, &order)| SizeClass { index, order })
    }

    /// Classes eligible for the next chunk, largest first.
    ///
    /// A class is eligible when one chunk does not exceed `remaining` bytes
    /// and its order does not exceed `ceiling_order`.
    pub fn candidates(
        &self,
        remaining: usize,
        ceiling_order: u32,
    ) -> impl Iterator<Item = SizeClass> + '_ {
        self.iter()
            .filter(move |class| class.bytes() <= remaining && class.order <= ceiling_order)
    }
}
