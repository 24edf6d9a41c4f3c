//! Device-address (IOMMU) mapping.
//!
//! A buffer may be mapped into several device address domains. Each domain
//! gets its own address and reference count on the buffer: the first map
//! allocates and programs the address, later maps only bump the count, and
//! the unmap that brings the count to zero tears the mapping down.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::Mutex;
use serde::Serialize;
use thiserror::Error;

use crate::heap::{Buffer, SgTable};
use crate::size_class::page_align;

/// Identifies a device address domain.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
pub struct DomainId(pub u32);

impl fmt::Display for DomainId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "domain{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum IommuError {
    #[error("{domain}: no device address space left for {size} bytes")]
    AddressSpaceExhausted { domain: DomainId, size: usize },
    #[error("{domain}: mapping {size} bytes at {iova:#x} failed")]
    MapFailed {
        domain: DomainId,
        iova: u64,
        size: usize,
    },
}

/// A device address space.
pub trait IommuDomain: Send + Sync {
    fn id(&self) -> DomainId;

    /// Reserves `size` bytes of device address space.
    fn iova_alloc(&self, size: usize) -> Option<u64>;

    /// Programs the translation for `table` at `iova`.
    fn map(&self, iova: u64, size: usize, table: &SgTable) -> Result<(), IommuError>;

    /// Removes the translation at `iova`.
    fn unmap(&self, iova: u64, size: usize);

    /// Releases address space obtained from [`iova_alloc`](Self::iova_alloc).
    fn iova_free(&self, iova: u64, size: usize);
}

/// Heap capability for mapping buffers into device domains.
pub trait IommuMapper: Send + Sync {
    /// Maps `buffer` into `domain`, or takes another reference on an
    /// existing mapping. Returns the device address.
    fn map_iommu(&self, buffer: &mut Buffer, domain: &Arc<dyn IommuDomain>)
    -> Result<u64, IommuError>;

    /// Drops one reference on the mapping in `domain`. Returns the references
    /// left; unmapping a domain the buffer is not mapped into returns 0.
    fn unmap_iommu(&self, buffer: &mut Buffer, domain: DomainId) -> usize;
}

/// Live mapping of one buffer in one domain.
pub(crate) struct IommuMapping {
    pub(crate) domain: Arc<dyn IommuDomain>,
    pub(crate) iova: u64,
    pub(crate) size: usize,
    pub(crate) refs: usize,
}

impl fmt::Debug for IommuMapping {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("IommuMapping")
            .field("domain", &self.domain.id())
            .field("iova", &format_args!("{:#x}", self.iova))
            .field("size", &self.size)
            .field("refs", &self.refs)
            .finish()
    }
}

/// Outcome of a successful map request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct Mapped {
    pub(crate) iova: u64,
    pub(crate) refs: usize,
}

pub(crate) fn map_buffer(
    mappings: &mut BTreeMap<DomainId, IommuMapping>,
    table: &SgTable,
    domain: &Arc<dyn IommuDomain>,
) -> Result<Mapped, IommuError> {
    let id = domain.id();
    if let Some(mapping) = mappings.get_mut(&id) {
        mapping.refs += 1;
        return Ok(Mapped {
            iova: mapping.iova,
            refs: mapping.refs,
        });
    }

    let size = table.total_len();
    let iova = domain
        .iova_alloc(size)
        .ok_or(IommuError::AddressSpaceExhausted { domain: id, size })?;
    if let Err(err) = domain.map(iova, size, table) {
        domain.iova_free(iova, size);
        return Err(err);
    }
    mappings.insert(
        id,
        IommuMapping {
            domain: Arc::clone(domain),
            iova,
            size,
            refs: 1,
        },
    );
    Ok(Mapped { iova, refs: 1 })
}

/// Returns the references left, or `None` if the domain was not mapped.
pub(crate) fn unmap_buffer(
    mappings: &mut BTreeMap<DomainId, IommuMapping>,
    id: DomainId,
) -> Option<usize> {
    let mapping = mappings.get_mut(&id)?;
    mapping.refs -= 1;
    if mapping.refs > 0 {
        return Some(mapping.refs);
    }
    if let Some(mapping) = mappings.remove(&id) {
        teardown(&mapping);
    }
    Some(0)
}

/// Tears down every mapping regardless of count. Returns domains unmapped.
pub(crate) fn unmap_all(mappings: &mut BTreeMap<DomainId, IommuMapping>) -> usize {
    let torn_down = mappings.len();
    for mapping in std::mem::take(mappings).into_values() {
        teardown(&mapping);
    }
    torn_down
}

fn teardown(mapping: &IommuMapping) {
    mapping.domain.unmap(mapping.iova, mapping.size);
    mapping.domain.iova_free(mapping.iova, mapping.size);
}

#[derive(Debug)]
struct LinearState {
    next: u64,
    live: BTreeMap<u64, usize>,
    fail_map: bool,
}

/// Bump-allocating device domain, for tests and the workload harness.
///
/// Freed address space is not reused.
#[derive(Debug)]
pub struct LinearIovaDomain {
    id: DomainId,
    end: u64,
    state: Mutex<LinearState>,
    maps: AtomicU64,
    unmaps: AtomicU64,
}

impl LinearIovaDomain {
    #[must_use]
    pub fn new(id: DomainId, base: u64, size: u64) -> Self {
        Self {
            id,
            end: base.saturating_add(size),
            state: Mutex::new(LinearState {
                next: base,
                live: BTreeMap::new(),
                fail_map: false,
            }),
            maps: AtomicU64::new(0),
            unmaps: AtomicU64::new(0),
        }
    }

    /// Makes subsequent `map` calls fail.
    pub fn set_fail_map(&self, fail: bool) {
        self.state.lock().fail_map = fail;
    }

    /// Address ranges currently reserved.
    #[must_use]
    pub fn live_ranges(&self) -> usize {
        self.state.lock().live.len()
    }

    #[must_use]
    pub fn is_live(&self, iova: u64) -> bool {
        self.state.lock().live.contains_key(&iova)
    }

    #[must_use]
    pub fn maps(&self) -> u64 {
        self.maps.load(Ordering::Relaxed)
    }

    #[must_use]
    pub fn unmaps(&self) -> u64 {
        self.unmaps.load(Ordering::Relaxed)
    }
}

impl IommuDomain for LinearIovaDomain {
    fn id(&self) -> DomainId {
        self.id
    }

    fn iova_alloc(&self, size: usize) -> Option<u64> {
        let len = u64::try_from(page_align(size.max(1))?).ok()?;
        let mut state = self.state.lock();
        let iova = state.next;
        let next = iova.checked_add(len)?;
        if next > self.end {
            return None;
        }
        state.next = next;
        state.live.insert(iova, size);
        Some(iova)
    }

    fn map(&self, iova: u64, size: usize, _table: &SgTable) -> Result<(), IommuError> {
        if self.state.lock().fail_map {
            return Err(IommuError::MapFailed {
                domain: self.id,
                iova,
                size,
            });
        }
        self.maps.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    fn unmap(&self, _iova: u64, _size: usize) {
        self.unmaps.fetch_add(1, Ordering::Relaxed);
    }

    fn iova_free(&self, iova: u64, _size: usize) {
        self.state.lock().live.remove(&iova);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::heap::SgEntry;
    use crate::size_class::PAGE_SIZE;

    fn table(pages: usize) -> SgTable {
        let mut table = SgTable::with_capacity(1).unwrap();
        table.push(SgEntry {
            pfn: 0x400,
            length: pages * PAGE_SIZE,
            offset: 0,
            highmem: false,
        });
        table
    }

    fn domain() -> (Arc<LinearIovaDomain>, Arc<dyn IommuDomain>) {
        let linear = Arc::new(LinearIovaDomain::new(DomainId(1), 0x1000_0000, 1 << 24));
        let shared: Arc<dyn IommuDomain> = linear.clone();
        (linear, shared)
    }

    #[test]
    fn first_map_programs_later_maps_count() {
        let (linear, shared) = domain();
        let table = table(4);
        let mut mappings = BTreeMap::new();

        let first = map_buffer(&mut mappings, &table, &shared).unwrap();
        let second = map_buffer(&mut mappings, &table, &shared).unwrap();
        assert_eq!(first.iova, 0x1000_0000);
        assert_eq!(second, Mapped {
            iova: first.iova,
            refs: 2
        });
        assert_eq!(linear.maps(), 1);

        assert_eq!(unmap_buffer(&mut mappings, DomainId(1)), Some(1));
        assert!(linear.is_live(first.iova));
        assert_eq!(unmap_buffer(&mut mappings, DomainId(1)), Some(0));
        assert!(!linear.is_live(first.iova));
        assert_eq!(linear.unmaps(), 1);
        assert_eq!(unmap_buffer(&mut mappings, DomainId(1)), None);
    }

    #[test]
    fn failed_map_releases_address_space() {
        let (linear, shared) = domain();
        linear.set_fail_map(true);
        let mut mappings = BTreeMap::new();

        let err = map_buffer(&mut mappings, &table(2), &shared).unwrap_err();
        assert!(matches!(err, IommuError::MapFailed { .. }));
        assert!(mappings.is_empty());
        assert_eq!(linear.live_ranges(), 0);
    }

    #[test]
    fn exhausted_domain_reports_size() {
        let linear = Arc::new(LinearIovaDomain::new(DomainId(7), 0, PAGE_SIZE as u64));
        let shared: Arc<dyn IommuDomain> = linear;
        let mut mappings = BTreeMap::new();
        assert_eq!(
            map_buffer(&mut mappings, &table(2), &shared),
            Err(IommuError::AddressSpaceExhausted {
                domain: DomainId(7),
                size: 2 * PAGE_SIZE
            })
        );
    }

    #[test]
    fn unmap_all_tears_down_every_domain() {
        let (linear, shared) = domain();
        let other = Arc::new(LinearIovaDomain::new(DomainId(2), 0, 1 << 24));
        let other_shared: Arc<dyn IommuDomain> = other.clone();
        let table = table(1);
        let mut mappings = BTreeMap::new();
        map_buffer(&mut mappings, &table, &shared).unwrap();
        map_buffer(&mut mappings, &table, &shared).unwrap();
        map_buffer(&mut mappings, &table, &other_shared).unwrap();

        assert_eq!(unmap_all(&mut mappings), 2);
        assert!(mappings.is_empty());
        assert_eq!(linear.live_ranges(), 0);
        assert_eq!(other.live_ranges(), 0);
    }
}
