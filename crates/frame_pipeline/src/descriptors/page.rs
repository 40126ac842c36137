use crate::{
    device::{CpuDescriptorHandle, Device},
    Error, HeapKind, InvalidFree, Result,
};

use super::{DescriptorAllocation, DescriptorHeap, Region};

/// A fixed sub-range of a descriptor heap, bump-allocated and reset as a
/// whole.
///
/// A page does not refer to its heap; allocations carry the page's region so
/// handles can be resolved through whoever owns the heap.
#[derive(Debug)]
pub struct DescriptorPage {
    kind: HeapKind,
    /// `None` for the static page.
    index: Option<u32>,
    offset: u32,
    size: u32,
    top: u32,
    /// Incremented on every reset so that allocations made before the reset
    /// can be told apart from live ones.
    generation: u32,
    /// Fence value of the last submission that referenced this page.
    last_use: u64,
}

impl DescriptorPage {
    pub(crate) fn new(kind: HeapKind, index: Option<u32>, offset: u32, size: u32) -> Self {
        Self {
            kind,
            index,
            offset,
            size,
            top: 0,
            generation: 0,
            last_use: 0,
        }
    }

    /// Reserves `count` descriptors from the page.
    ///
    /// ## Errors
    ///
    /// Returns `Error::CapacityExceeded` if the page has fewer than `count`
    /// descriptors left.
    pub fn allocate(&mut self, count: u32) -> Result<DescriptorAllocation> {
        if count > self.remaining() {
            log::error!(
                "{:?} page {:?} overflow: {} requested, {} of {} remaining",
                self.kind,
                self.index,
                count,
                self.remaining(),
                self.size
            );

            return Err(Error::CapacityExceeded {
                kind: self.kind,
                requested: count,
                available: self.remaining(),
            });
        }

        let allocation = DescriptorAllocation {
            kind: self.kind,
            region: self.region(),
            index: self.offset + self.top,
            size: count,
        };

        self.top += count;
        log::trace!(
            "{:?} {:?}: allocated {} at {}",
            self.kind,
            allocation.region,
            count,
            allocation.index
        );
        Ok(allocation)
    }

    /// Allocates `count` descriptors and fills them with a copy of the
    /// descriptors at `source`, which must live in a CPU-only heap.
    ///
    /// ## Errors
    ///
    /// Fails if the page is full or the device rejects the copy. A rejected
    /// copy leaves the page as it was.
    pub fn copy_from<D: Device>(
        &mut self,
        device: &D,
        heap: &DescriptorHeap<D>,
        source: CpuDescriptorHandle,
        count: u32,
    ) -> Result<DescriptorAllocation> {
        debug_assert_eq!(heap.kind(), self.kind);

        let top = self.top;
        let allocation = self.allocate(count)?;

        if let Err(error) =
            device.copy_descriptors(self.kind, heap.cpu_handle(allocation.index), source, count)
        {
            self.top = top;
            return Err(error.into());
        }

        Ok(allocation)
    }

    /// Records that the submission signalling `fence_value` references this
    /// page.
    pub fn mark_used(&mut self, fence_value: u64) {
        self.last_use = self.last_use.max(fence_value);
    }

    /// Makes the whole page available again.
    ///
    /// `completed` is the fence value the GPU is known to have reached.
    ///
    /// ## Errors
    ///
    /// Returns `InvalidFree::PageInFlight` if the last submission that used
    /// the page has not completed. The page is left untouched.
    pub fn reset(&mut self, completed: u64) -> Result<()> {
        if self.last_use > completed {
            let error = InvalidFree::PageInFlight {
                kind: self.kind,
                index: self.index.unwrap_or(u32::MAX),
                last_use: self.last_use,
                completed,
            };

            log::error!("{error}");
            return Err(Error::InvalidFree(error));
        }

        self.top = 0;
        self.generation = self.generation.wrapping_add(1);
        Ok(())
    }

    #[must_use]
    pub fn region(&self) -> Region {
        match self.index {
            Some(index) => Region::Page {
                index,
                generation: self.generation,
            },
            None => Region::Static,
        }
    }

    #[must_use]
    pub fn kind(&self) -> HeapKind {
        self.kind
    }

    #[must_use]
    pub fn offset(&self) -> u32 {
        self.offset
    }

    #[must_use]
    pub fn size(&self) -> u32 {
        self.size
    }

    #[must_use]
    pub fn top(&self) -> u32 {
        self.top
    }

    #[must_use]
    pub fn remaining(&self) -> u32 {
        self.size - self.top
    }

    #[must_use]
    pub fn generation(&self) -> u32 {
        self.generation
    }

    #[must_use]
    pub fn last_use(&self) -> u64 {
        self.last_use
    }
}
