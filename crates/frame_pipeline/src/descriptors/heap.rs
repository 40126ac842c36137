use crate::{
    device::{CpuDescriptorHandle, Device, GpuDescriptorHandle},
    Error, HeapKind, Result,
};

/// A fixed-capacity block of descriptors of one kind, handed out by bumping a
/// high-water mark.
///
/// Nothing is ever freed at this level. Reuse happens in the pages that are
/// carved out of the heap.
pub struct DescriptorHeap<D: Device> {
    raw: D::DescriptorHeap,
    kind: HeapKind,
    capacity: u32,
    top: u32,
    stride: u32,
    cpu_start: CpuDescriptorHandle,
    gpu_start: Option<GpuDescriptorHandle>,
}

impl<D: Device> DescriptorHeap<D> {
    pub fn new(device: &D, kind: HeapKind, capacity: u32, shader_visible: bool) -> Result<Self> {
        let raw = device.create_descriptor_heap(kind, capacity, shader_visible)?;
        let cpu_start = device.cpu_heap_start(&raw);
        let gpu_start = device.gpu_heap_start(&raw);

        Ok(Self {
            raw,
            kind,
            capacity,
            top: 0,
            stride: device.descriptor_stride(kind),
            cpu_start,
            gpu_start,
        })
    }

    /// Reserves `count` descriptors and returns the index of the first.
    ///
    /// ## Errors
    ///
    /// Returns `Error::CapacityExceeded` if fewer than `count` descriptors
    /// remain. The heap is left unchanged.
    pub fn allocate(&mut self, count: u32) -> Result<u32> {
        if count > self.remaining() {
            log::error!(
                "{:?} heap overflow: {} requested, {} of {} remaining",
                self.kind,
                count,
                self.remaining(),
                self.capacity
            );

            return Err(Error::CapacityExceeded {
                kind: self.kind,
                requested: count,
                available: self.remaining(),
            });
        }

        let index = self.top;
        self.top += count;
        Ok(index)
    }

    /// The CPU handle of the descriptor at `index`. This is address arithmetic
    /// only; whether anything lives at `index` is not checked.
    #[must_use]
    pub fn cpu_handle(&self, index: u32) -> CpuDescriptorHandle {
        self.cpu_start.offset(index, self.stride)
    }

    /// The GPU handle of the descriptor at `index`, or `None` if the heap is
    /// not shader-visible.
    #[must_use]
    pub fn gpu_handle(&self, index: u32) -> Option<GpuDescriptorHandle> {
        self.gpu_start.map(|start| start.offset(index, self.stride))
    }

    #[must_use]
    pub fn kind(&self) -> HeapKind {
        self.kind
    }

    #[must_use]
    pub fn capacity(&self) -> u32 {
        self.capacity
    }

    #[must_use]
    pub fn top(&self) -> u32 {
        self.top
    }

    #[must_use]
    pub fn remaining(&self) -> u32 {
        self.capacity - self.top
    }

    #[must_use]
    pub fn stride(&self) -> u32 {
        self.stride
    }

    #[must_use]
    pub fn is_shader_visible(&self) -> bool {
        self.gpu_start.is_some()
    }

    #[must_use]
    pub fn raw(&self) -> &D::DescriptorHeap {
        &self.raw
    }
}
