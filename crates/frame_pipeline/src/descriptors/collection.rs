use std::collections::VecDeque;

use crate::{
    config::ConfigError,
    device::{CpuDescriptorHandle, Device},
    Error, Exhausted, HeapKind, InvalidFree, Result,
};

use super::{DescriptorAllocation, DescriptorHeap, DescriptorPage};

/// Identifies a transient page checked out of a collection.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct PageId {
    kind: HeapKind,
    index: u32,
}

impl PageId {
    #[must_use]
    pub fn kind(self) -> HeapKind {
        self.kind
    }

    #[must_use]
    pub fn index(self) -> u32 {
        self.index
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum PageState {
    Free,
    Used,
}

/// How a heap of `capacity` descriptors is divided between the static page
/// and `page_count` equally sized transient pages.
///
/// The space left after the static region is trimmed to a multiple of
/// `page_count`, and the trimmed remainder is folded into the static page. With
/// no transient pages, the whole heap is static.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Partition {
    pub static_size: u32,
    pub page_count: u32,
    pub page_size: u32,
}

impl Partition {
    /// ## Errors
    ///
    /// Fails if `static_size` is larger than `capacity`.
    pub fn new(capacity: u32, page_count: u32, static_size: u32) -> Result<Self, ConfigError> {
        let mut remaining = capacity.checked_sub(static_size).ok_or_else(|| {
            ConfigError::Invalid(format!(
                "static region of {static_size} exceeds heap capacity {capacity}"
            ))
        })?;

        if page_count == 0 {
            remaining = 0;
        } else {
            remaining -= remaining % page_count;
        }

        Ok(Self {
            static_size: capacity - remaining,
            page_count,
            page_size: if page_count == 0 { 0 } else { remaining / page_count },
        })
    }
}

/// A descriptor heap divided into one long-lived static page and a set of
/// transient pages that are checked out per command context.
///
/// Pages are handed out oldest-freed first. Every transient page is either
/// free (queued in `free`) or used, never both.
pub struct DescriptorHeapPageCollection<D: Device> {
    heap: DescriptorHeap<D>,
    static_page: DescriptorPage,
    pages: Vec<DescriptorPage>,
    states: Vec<PageState>,
    free: VecDeque<u32>,
}

impl<D: Device> DescriptorHeapPageCollection<D> {
    pub fn new(
        device: &D,
        kind: HeapKind,
        capacity: u32,
        page_count: u32,
        static_size: u32,
    ) -> Result<Self> {
        let partition = Partition::new(capacity, page_count, static_size)?;
        let mut heap = DescriptorHeap::new(device, kind, capacity, kind.is_shader_visible())?;

        let static_offset = heap.allocate(partition.static_size)?;
        let static_page = DescriptorPage::new(kind, None, static_offset, partition.static_size);

        let mut pages = Vec::with_capacity(page_count as usize);
        for index in 0..page_count {
            let offset = heap.allocate(partition.page_size)?;
            pages.push(DescriptorPage::new(kind, Some(index), offset, partition.page_size));
        }

        debug_assert_eq!(heap.remaining(), 0);

        log::debug!(
            "{kind:?} collection: {capacity} descriptors, static {}, {page_count} pages of {}",
            partition.static_size,
            partition.page_size
        );

        Ok(Self {
            heap,
            static_page,
            pages,
            states: vec![PageState::Free; page_count as usize],
            free: (0..page_count).collect(),
        })
    }

    /// Allocates long-lived descriptors from the static page.
    ///
    /// ## Errors
    ///
    /// Returns `Error::CapacityExceeded` if the static page is full.
    pub fn allocate_from_static(&mut self, count: u32) -> Result<DescriptorAllocation> {
        self.static_page.allocate(count)
    }

    /// Checks out the least recently freed transient page.
    ///
    /// ## Errors
    ///
    /// Returns `Error::PoolExhausted` if every page is checked out.
    pub fn allocate_page(&mut self) -> Result<PageId> {
        let Some(index) = self.free.pop_front() else {
            log::warn!("{:?} collection has no free pages", self.kind());
            return Err(Error::PoolExhausted(Exhausted::Pages(self.kind())));
        };

        self.states[index as usize] = PageState::Used;
        log::trace!("{:?} page {index} checked out", self.kind());

        Ok(PageId {
            kind: self.kind(),
            index,
        })
    }

    /// Returns a checked-out page to the free set and resets it.
    ///
    /// `completed` is the fence value the GPU is known to have reached, and
    /// must cover the last submission that used the page.
    ///
    /// ## Errors
    ///
    /// Returns `Error::InvalidFree` if the page does not belong to this
    /// collection, is not checked out, or may still be read by the GPU. The
    /// collection is unchanged in each case.
    pub fn free_page(&mut self, page: PageId, completed: u64) -> Result<()> {
        let index = self.used_index(page)?;
        self.pages[index].reset(completed)?;

        self.states[index] = PageState::Free;
        self.free.push_back(page.index);
        log::trace!("{:?} page {} returned", self.kind(), page.index);
        Ok(())
    }

    /// Allocates transient descriptors from a checked-out page.
    ///
    /// ## Errors
    ///
    /// Fails if the page is not checked out or is full.
    pub fn allocate_from_page(&mut self, page: PageId, count: u32) -> Result<DescriptorAllocation> {
        let index = self.used_index(page)?;
        self.pages[index].allocate(count)
    }

    /// Copies `count` descriptors at `source` into fresh slots of a
    /// checked-out page.
    ///
    /// ## Errors
    ///
    /// Fails if the page is not checked out or is full, or if the device
    /// rejects the copy.
    pub fn copy_to_page(
        &mut self,
        device: &D,
        page: PageId,
        source: CpuDescriptorHandle,
        count: u32,
    ) -> Result<DescriptorAllocation> {
        let index = self.used_index(page)?;
        self.pages[index].copy_from(device, &self.heap, source, count)
    }

    /// Records that the submission signalling `fence_value` reads from `page`.
    ///
    /// ## Errors
    ///
    /// Fails if the page is not checked out.
    pub fn mark_used(&mut self, page: PageId, fence_value: u64) -> Result<()> {
        let index = self.used_index(page)?;
        self.pages[index].mark_used(fence_value);
        Ok(())
    }

    fn used_index(&self, page: PageId) -> Result<usize> {
        let index = page.index as usize;

        if page.kind != self.kind() || index >= self.pages.len() {
            return Err(Error::InvalidFree(InvalidFree::ForeignPage {
                collection: self.kind(),
                index: page.index,
            }));
        }

        if self.states[index] != PageState::Used {
            let error = InvalidFree::PageNotCheckedOut {
                kind: self.kind(),
                index: page.index,
            };
            log::error!("{error}");
            return Err(Error::InvalidFree(error));
        }

        Ok(index)
    }

    #[must_use]
    pub fn kind(&self) -> HeapKind {
        self.heap.kind()
    }

    #[must_use]
    pub fn heap(&self) -> &DescriptorHeap<D> {
        &self.heap
    }

    #[must_use]
    pub fn static_page(&self) -> &DescriptorPage {
        &self.static_page
    }

    /// `None` if `index` is out of range.
    #[must_use]
    pub fn page(&self, index: u32) -> Option<&DescriptorPage> {
        self.pages.get(index as usize)
    }

    #[must_use]
    pub fn page_count(&self) -> usize {
        self.pages.len()
    }

    #[must_use]
    pub fn page_size(&self) -> u32 {
        self.pages.first().map_or(0, DescriptorPage::size)
    }

    #[must_use]
    pub fn free_page_count(&self) -> usize {
        self.free.len()
    }

    #[must_use]
    pub fn used_page_count(&self) -> usize {
        self.pages.len() - self.free.len()
    }

    #[must_use]
    pub fn is_checked_out(&self, page: PageId) -> bool {
        self.used_index(page).is_ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::host::HostDevice;

    fn collection(
        capacity: u32,
        page_count: u32,
        static_size: u32,
    ) -> DescriptorHeapPageCollection<HostDevice> {
        DescriptorHeapPageCollection::new(
            &HostDevice::new(),
            HeapKind::CbvSrvUav,
            capacity,
            page_count,
            static_size,
        )
        .unwrap()
    }

    fn assert_disjoint(collection: &DescriptorHeapPageCollection<HostDevice>) {
        let mut seen = vec![false; collection.page_count()];
        for &index in &collection.free {
            assert!(!seen[index as usize], "page {index} queued twice");
            seen[index as usize] = true;
            assert_eq!(collection.states[index as usize], PageState::Free);
        }

        for (index, state) in collection.states.iter().enumerate() {
            assert_eq!(*state == PageState::Free, seen[index]);
        }
    }

    #[test]
    fn partition_folds_remainder_into_static() {
        let partition = Partition::new(2048, 3, 256).unwrap();
        assert_eq!(
            partition,
            Partition {
                static_size: 257,
                page_count: 3,
                page_size: 597,
            }
        );

        let collection = collection(2048, 3, 256);
        assert_eq!(collection.static_page().size(), 257);
        assert_eq!(collection.page_size(), 597);
        assert_eq!(collection.page(0).unwrap().offset(), 257);
        assert_eq!(collection.page(2).unwrap().offset(), 257 + 2 * 597);
    }

    #[test]
    fn partition_covers_the_heap() {
        for capacity in [0, 1, 7, 100, 1000, 1024, 2048, 65_536] {
            for static_size in [0, 1, 13, 256, 999] {
                if static_size > capacity {
                    assert!(Partition::new(capacity, 3, static_size).is_err());
                    continue;
                }

                for page_count in 1..20 {
                    let p = Partition::new(capacity, page_count, static_size).unwrap();
                    assert_eq!(p.page_size, (capacity - static_size) / page_count);
                    assert_eq!(p.static_size + page_count * p.page_size, capacity);
                    assert!(p.static_size >= static_size);
                }
            }
        }
    }

    #[test]
    fn no_pages_means_all_static() {
        let collection = collection(100, 0, 10);
        assert_eq!(collection.static_page().size(), 100);
        assert_eq!(collection.page_count(), 0);
        assert_eq!(collection.page_size(), 0);
    }

    #[test]
    fn page_checkout_is_a_bijection() {
        let mut collection = collection(1024, 4, 0);

        let a = collection.allocate_page().unwrap();
        let b = collection.allocate_page().unwrap();
        assert_ne!(a, b);
        assert!(collection.is_checked_out(a));
        assert!(!collection.free.contains(&a.index()));
        assert_eq!(collection.used_page_count(), 2);
        assert_disjoint(&collection);

        collection.allocate_from_page(a, 10).unwrap();
        collection.mark_used(a, 1).unwrap();
        collection.free_page(a, 1).unwrap();

        assert!(!collection.is_checked_out(a));
        assert!(collection.free.contains(&a.index()));
        assert_eq!(collection.page(a.index()).unwrap().top(), 0);
        assert_disjoint(&collection);

        // Freed pages go to the back of the queue.
        let c = collection.allocate_page().unwrap();
        let d = collection.allocate_page().unwrap();
        let e = collection.allocate_page().unwrap();
        assert_eq!((c.index(), d.index(), e.index()), (2, 3, 0));

        assert!(matches!(
            collection.allocate_page(),
            Err(Error::PoolExhausted(Exhausted::Pages(HeapKind::CbvSrvUav)))
        ));
        assert_disjoint(&collection);

        let _ = (b, c, d, e);
    }

    #[test]
    fn invalid_frees_are_rejected() {
        let mut collection = collection(64, 2, 0);
        let page = collection.allocate_page().unwrap();

        collection.mark_used(page, 3).unwrap();
        assert!(matches!(
            collection.free_page(page, 2),
            Err(Error::InvalidFree(InvalidFree::PageInFlight { .. }))
        ));
        assert!(collection.is_checked_out(page));

        collection.free_page(page, 3).unwrap();
        assert!(matches!(
            collection.free_page(page, 3),
            Err(Error::InvalidFree(InvalidFree::PageNotCheckedOut { .. }))
        ));
        assert!(matches!(
            collection.allocate_from_page(page, 1),
            Err(Error::InvalidFree(InvalidFree::PageNotCheckedOut { .. }))
        ));

        let foreign = PageId {
            kind: HeapKind::Sampler,
            index: 0,
        };
        assert!(matches!(
            collection.free_page(foreign, 10),
            Err(Error::InvalidFree(InvalidFree::ForeignPage { .. }))
        ));
        assert_disjoint(&collection);
    }

    #[test]
    fn static_allocations_survive_page_recycling() {
        let mut collection = collection(64, 2, 16);

        let material = collection.allocate_from_static(4).unwrap();
        let page = collection.allocate_page().unwrap();
        collection.allocate_from_page(page, 8).unwrap();
        collection.free_page(page, 0).unwrap();

        assert_eq!(collection.static_page().top(), 4);
        assert_eq!(material.index(), 0);
        assert!(collection.allocate_from_static(13).is_err());
    }
}
