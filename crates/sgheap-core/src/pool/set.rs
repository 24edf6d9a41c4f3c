use std::sync::Arc;

use crate::error::{HeapError, Result};
use crate::frame::FrameAllocator;
use crate::size_class::SizeClassTable;

use super::PagePool;

/// Identifies one pool: a size-class index plus cacheability.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct PoolKey {
    pub class_index: usize,
    pub cached: bool,
}

/// One pool per (size class, cacheability), fixed at construction.
#[derive(Debug)]
pub struct PoolSet {
    table: Arc<SizeClassTable>,
    uncached: Box<[PagePool]>,
    cached: Box<[PagePool]>,
}

impl PoolSet {
    /// Creates every pool, or none.
    ///
    /// If any pool cannot be built, the ones already created are dropped
    /// (and drained) before the error is returned.
    pub fn create(frames: &Arc<dyn FrameAllocator>, table: Arc<SizeClassTable>) -> Result<Self> {
        let build = |cached: bool| -> Result<Box<[PagePool]>> {
            table
                .iter()
                .map(|class| {
                    PagePool::new(Arc::clone(frames), class.order, cached).map_err(|source| {
                        HeapError::PoolCreationFailed {
                            order: class.order,
                            cached,
                            source,
                        }
                    })
                })
                .collect()
        };
        let uncached = build(false)?;
        let cached = build(true)?;
        Ok(Self {
            table,
            uncached,
            cached,
        })
    }

    /// The size-class table the pools were built from.
    #[must_use]
    pub fn table(&self) -> &Arc<SizeClassTable> {
        &self.table
    }

    /// Number of pools in the set.
    #[must_use]
    pub fn len(&self) -> usize {
        self.uncached.len() + self.cached.len()
    }

    /// Always false for a constructed set.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    #[must_use]
    pub fn get(&self, key: PoolKey) -> Option<&PagePool> {
        let pools = if key.cached {
            &self.cached
        } else {
            &self.uncached
        };
        pools.get(key.class_index)
    }

    /// Pool serving chunks of `order`, if the table has that class.
    #[must_use]
    pub fn pool_for_order(&self, order: u32, cached: bool) -> Option<&PagePool> {
        self.table.index_of(order).and_then(|class_index| {
            self.get(PoolKey {
                class_index,
                cached,
            })
        })
    }

    /// Every pool with its key: uncached pools first, each largest first.
    pub fn iter(&self) -> impl Iterator<Item = (PoolKey, &PagePool)> + '_ {
        keyed(false, &self.uncached).chain(keyed(true, &self.cached))
    }

    /// Idle pages across all pools, regardless of zone.
    #[must_use]
    pub fn idle_pages(&self) -> usize {
        self.iter().map(|(_, pool)| pool.idle_pages()).sum()
    }

    /// Tears the set down, draining every pool. Returns chunks released.
    pub fn destroy(self) -> usize {
        self.iter().map(|(_, pool)| pool.drain()).sum()
    }
}

fn keyed(cached: bool, pools: &[PagePool]) -> impl Iterator<Item = (PoolKey, &PagePool)> + '_ {
    pools.iter().enumerate().map(move |(class_index, pool)| {
        (
            PoolKey {
                class_index,
                cached,
            },
            pool,
        )
    })
}
