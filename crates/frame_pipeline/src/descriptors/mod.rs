//! Descriptor heaps, the pages carved out of them, and the per-kind registry
//! that owns them.
//!
//! Allocations never point at the memory they describe. They record which
//! region of which kind of heap they came from, and are turned into handles
//! by [`Descriptors`], which checks that a transient allocation's page has not
//! been recycled in the meantime.

use smallvec::SmallVec;

use crate::{
    config::DescriptorConfig,
    device::{CpuDescriptorHandle, Device, GpuDescriptorHandle},
    Error, HeapKind, Result,
};

mod collection;
mod heap;
mod page;

pub use collection::{DescriptorHeapPageCollection, PageId, Partition};
pub use heap::DescriptorHeap;
pub use page::DescriptorPage;

/// Where in a kind's heaps an allocation lives.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Region {
    /// The CPU-only staging heap, used as a source for descriptor copies.
    Staging,
    /// The static page of the shader-visible heap.
    Static,
    /// A transient page, as of the given reset generation.
    Page { index: u32, generation: u32 },
}

/// A contiguous range of descriptors.
///
/// This is a plain value: it does not keep its page alive and may outlive
/// it. Resolving a transient allocation after its page was recycled fails with
/// `Error::StaleAllocation`.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct DescriptorAllocation {
    pub(crate) kind: HeapKind,
    pub(crate) region: Region,
    /// Absolute index into the heap of the first descriptor.
    pub(crate) index: u32,
    pub(crate) size: u32,
}

impl DescriptorAllocation {
    /// The `offset`th descriptor of the allocation.
    ///
    /// ## Panics
    ///
    /// Panics if `offset` is not less than the allocation's size.
    #[must_use]
    pub fn at(&self, offset: u32) -> DescriptorSlot {
        assert!(
            offset < self.size,
            "slot {offset} is outside an allocation of {} descriptors",
            self.size
        );

        DescriptorSlot { base: *self, offset }
    }

    /// The first descriptor of the allocation.
    ///
    /// ## Panics
    ///
    /// Panics if the allocation is empty.
    #[must_use]
    pub fn first(&self) -> DescriptorSlot {
        self.at(0)
    }

    pub fn slots(&self) -> impl Iterator<Item = DescriptorSlot> + '_ {
        (0..self.size).map(|offset| self.at(offset))
    }

    #[must_use]
    pub fn kind(&self) -> HeapKind {
        self.kind
    }

    #[must_use]
    pub fn region(&self) -> Region {
        self.region
    }

    #[must_use]
    pub fn index(&self) -> u32 {
        self.index
    }

    #[must_use]
    pub fn size(&self) -> u32 {
        self.size
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.size == 0
    }
}

/// One descriptor within an allocation.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct DescriptorSlot {
    base: DescriptorAllocation,
    offset: u32,
}

impl DescriptorSlot {
    #[must_use]
    pub fn allocation(&self) -> &DescriptorAllocation {
        &self.base
    }

    #[must_use]
    pub fn offset(&self) -> u32 {
        self.offset
    }

    /// Absolute index into the heap.
    #[must_use]
    pub fn index(&self) -> u32 {
        self.base.index + self.offset
    }
}

/// The pages checked out for one command context, one per shader-visible
/// kind.
pub type CheckedOutPages = SmallVec<[PageId; 2]>;

/// Owns one page collection per descriptor kind, plus a CPU-only staging heap
/// for each shader-visible kind that has one configured.
pub struct Descriptors<D: Device> {
    collections: Vec<DescriptorHeapPageCollection<D>>,
    staging: Vec<Option<DescriptorHeap<D>>>,
}

impl<D: Device> Descriptors<D> {
    pub fn new(device: &D, config: &DescriptorConfig) -> Result<Self> {
        let mut collections = Vec::with_capacity(HeapKind::COUNT);
        let mut staging = Vec::with_capacity(HeapKind::COUNT);

        for kind in HeapKind::ALL {
            let heap = config.get(kind);
            collections.push(DescriptorHeapPageCollection::new(
                device,
                kind,
                heap.capacity,
                heap.page_count,
                heap.static_size,
            )?);

            staging.push(if heap.staging_capacity > 0 {
                Some(DescriptorHeap::new(device, kind, heap.staging_capacity, false)?)
            } else {
                None
            });
        }

        Ok(Self {
            collections,
            staging,
        })
    }

    #[must_use]
    pub fn collection(&self, kind: HeapKind) -> &DescriptorHeapPageCollection<D> {
        &self.collections[kind.index()]
    }

    pub fn collection_mut(&mut self, kind: HeapKind) -> &mut DescriptorHeapPageCollection<D> {
        &mut self.collections[kind.index()]
    }

    /// `None` if no staging heap is configured for `kind`.
    #[must_use]
    pub fn staging_heap(&self, kind: HeapKind) -> Option<&DescriptorHeap<D>> {
        self.staging[kind.index()].as_ref()
    }

    /// Allocates persistent descriptors, for views that live as long as the
    /// resource they describe (materials, persistent render targets).
    ///
    /// ## Errors
    ///
    /// Returns `Error::CapacityExceeded` if the kind's static page is full.
    pub fn allocate_static(&mut self, kind: HeapKind, count: u32) -> Result<DescriptorAllocation> {
        self.collection_mut(kind).allocate_from_static(count)
    }

    /// Allocates persistent descriptors in the CPU-only staging heap. These
    /// cannot be bound, only copied into transient pages.
    ///
    /// ## Errors
    ///
    /// Returns `Error::CapacityExceeded` if the staging heap is full or there
    /// is no staging heap for `kind`.
    pub fn allocate_staging(&mut self, kind: HeapKind, count: u32) -> Result<DescriptorAllocation> {
        let Some(heap) = self.staging[kind.index()].as_mut() else {
            return Err(Error::CapacityExceeded {
                kind,
                requested: count,
                available: 0,
            });
        };

        let index = heap.allocate(count)?;
        Ok(DescriptorAllocation {
            kind,
            region: Region::Staging,
            index,
            size: count,
        })
    }

    /// Checks out one page from every shader-visible collection. If any
    /// collection has no free page, the pages already taken are returned and
    /// the error is propagated.
    ///
    /// ## Errors
    ///
    /// Returns `Error::PoolExhausted` if a collection has no free page.
    pub fn check_out_pages(&mut self) -> Result<CheckedOutPages> {
        let mut pages = CheckedOutPages::new();

        for kind in HeapKind::ALL {
            if !kind.is_shader_visible() || self.collection(kind).page_count() == 0 {
                continue;
            }

            match self.collection_mut(kind).allocate_page() {
                Ok(page) => pages.push(page),
                Err(error) => {
                    // None of these pages were recorded into.
                    for page in pages {
                        self.collection_mut(page.kind()).free_page(page, u64::MAX)?;
                    }
                    return Err(error);
                }
            }
        }

        Ok(pages)
    }

    /// Returns pages to their collections. `completed` must cover the last
    /// submission that used them.
    ///
    /// ## Errors
    ///
    /// Fails on the first page that cannot be freed; the pages before it have
    /// been returned.
    pub fn free_pages(&mut self, pages: &[PageId], completed: u64) -> Result<()> {
        for &page in pages {
            self.collection_mut(page.kind()).free_page(page, completed)?;
        }
        Ok(())
    }

    /// Resolves the CPU handle of a descriptor.
    ///
    /// ## Errors
    ///
    /// Returns `Error::StaleAllocation` if the slot's page has been recycled
    /// since the allocation was made.
    pub fn cpu_handle(&self, slot: DescriptorSlot) -> Result<CpuDescriptorHandle> {
        Ok(self.heap_for(slot.allocation())?.cpu_handle(slot.index()))
    }

    /// Resolves the GPU handle of a descriptor.
    ///
    /// ## Errors
    ///
    /// Returns `Error::NotShaderVisible` for staging allocations and CPU-only
    /// kinds, and `Error::StaleAllocation` as for [`Self::cpu_handle`].
    pub fn gpu_handle(&self, slot: DescriptorSlot) -> Result<GpuDescriptorHandle> {
        let kind = slot.allocation().kind();
        self.heap_for(slot.allocation())?
            .gpu_handle(slot.index())
            .ok_or(Error::NotShaderVisible(kind))
    }

    fn heap_for(&self, allocation: &DescriptorAllocation) -> Result<&DescriptorHeap<D>> {
        let kind = allocation.kind();
        let collection = self.collection(kind);

        match allocation.region() {
            Region::Staging => self
                .staging_heap(kind)
                .ok_or(Error::NotShaderVisible(kind)),
            Region::Static => Ok(collection.heap()),
            Region::Page { index, generation } => match collection.page(index) {
                Some(page) if page.generation() == generation => Ok(collection.heap()),
                _ => Err(Error::StaleAllocation {
                    kind,
                    index: allocation.index(),
                }),
            },
        }
    }
}
