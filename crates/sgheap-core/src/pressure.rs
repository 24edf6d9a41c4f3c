//! Memory-pressure registry.
//!
//! Heaps that hold reclaimable memory register here; the pressure source
//! asks for a count of idle pages, then for a scan that evicts them.

use std::sync::Arc;

use parking_lot::RwLock;

use crate::heap::Heap;
use crate::pool::ReclaimHint;

#[derive(Default)]
pub struct MemoryPressure {
    heaps: RwLock<Vec<Arc<dyn Heap>>>,
}

impl std::fmt::Debug for MemoryPressure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let names: Vec<String> = self
            .heaps
            .read()
            .iter()
            .map(|heap| heap.name().to_owned())
            .collect();
        f.debug_struct("MemoryPressure")
            .field("heaps", &names)
            .finish()
    }
}

impl MemoryPressure {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, heap: Arc<dyn Heap>) {
        self.heaps.write().push(heap);
    }

    /// Removes `heap`. Returns whether it was registered.
    pub fn unregister(&self, heap: &Arc<dyn Heap>) -> bool {
        let mut heaps = self.heaps.write();
        let before = heaps.len();
        heaps.retain(|registered| !Arc::ptr_eq(registered, heap));
        heaps.len() != before
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.heaps.read().len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.heaps.read().is_empty()
    }

    /// Reclaimable pages across every registered heap.
    #[must_use]
    pub fn count(&self, hint: ReclaimHint) -> usize {
        self.snapshot()
            .iter()
            .map(|heap| heap.shrink(hint, 0))
            .sum()
    }

    /// Asks every heap to evict `nr_pages`. Returns the summed results,
    /// which are the pages still resident afterwards.
    pub fn scan(&self, hint: ReclaimHint, nr_pages: usize) -> usize {
        self.snapshot()
            .iter()
            .map(|heap| heap.shrink(hint, nr_pages))
            .sum()
    }

    // Shrinking runs without the registry lock held.
    fn snapshot(&self) -> Vec<Arc<dyn Heap>> {
        self.heaps.read().clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::HeapConfig;
    use crate::frame::{FrameAllocator, SimulatedFrameAllocator};
    use crate::heap::{BufferRequest, ContiguousHeap, SystemHeap};
    use crate::size_class::PAGE_SIZE;

    #[test]
    fn aggregates_registered_heaps() {
        let sim = Arc::new(SimulatedFrameAllocator::new(4096));
        let frames: Arc<dyn FrameAllocator> = sim.clone();
        let config = HeapConfig::default().with_total_system_pages(4096);
        let a: Arc<dyn Heap> = Arc::new(SystemHeap::new(frames.clone(), config.clone()).unwrap());
        let b: Arc<dyn Heap> = Arc::new(SystemHeap::new(frames.clone(), config.clone()).unwrap());
        let contig: Arc<dyn Heap> = Arc::new(ContiguousHeap::new(frames, config));

        for heap in [&a, &b] {
            let buffer = heap.allocate(BufferRequest::new(17 * PAGE_SIZE)).unwrap();
            heap.free(buffer).unwrap();
        }

        let pressure = MemoryPressure::new();
        pressure.register(Arc::clone(&a));
        pressure.register(Arc::clone(&b));
        pressure.register(Arc::clone(&contig));
        assert_eq!(pressure.len(), 3);

        let hint = ReclaimHint::default();
        assert_eq!(pressure.count(hint), 34);
        assert_eq!(pressure.scan(hint, 16), 2);
        assert_eq!(sim.pages_in_use(), 2);

        assert!(pressure.unregister(&b));
        assert!(!pressure.unregister(&b));
        assert_eq!(pressure.count(hint), 1);
    }
}
