//! The GPU operations the allocator and submission core depend on.
//!
//! Everything above this module is written against the [`Device`] trait. The
//! [`host`] device keeps descriptors in memory and simulates the GPU timeline,
//! and is what tests and the demo run on. On Windows, [`Dx12Device`] implements
//! the same trait over Direct3D 12.

use serde::{Deserialize, Serialize};

pub mod host;

#[cfg(target_os = "windows")]
mod dx12;

#[cfg(target_os = "windows")]
pub use dx12::Dx12Device;

/// The kind of descriptor stored in a heap.
///
/// A heap holds descriptors of exactly one kind. Only `CbvSrvUav` and
/// `Sampler` heaps can be bound for shader access; render-target and
/// depth-stencil views are only ever addressed from the CPU.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum HeapKind {
    CbvSrvUav,
    Sampler,
    Rtv,
    Dsv,
}

impl HeapKind {
    pub const COUNT: usize = 4;

    pub const ALL: [HeapKind; Self::COUNT] = [
        HeapKind::CbvSrvUav,
        HeapKind::Sampler,
        HeapKind::Rtv,
        HeapKind::Dsv,
    ];

    /// Dense index of the kind, for per-kind tables.
    #[must_use]
    pub fn index(self) -> usize {
        match self {
            HeapKind::CbvSrvUav => 0,
            HeapKind::Sampler => 1,
            HeapKind::Rtv => 2,
            HeapKind::Dsv => 3,
        }
    }

    /// Whether heaps of this kind are created shader-visible, which is what
    /// gives them GPU handles and per-context transient pages.
    #[must_use]
    pub fn is_shader_visible(self) -> bool {
        matches!(self, HeapKind::CbvSrvUav | HeapKind::Sampler)
    }
}

/// CPU address of a descriptor.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct CpuDescriptorHandle(pub usize);

impl CpuDescriptorHandle {
    #[must_use]
    pub fn offset(self, index: u32, stride: u32) -> Self {
        Self(self.0 + index as usize * stride as usize)
    }
}

/// GPU address of a descriptor in a shader-visible heap.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct GpuDescriptorHandle(pub u64);

impl GpuDescriptorHandle {
    #[must_use]
    pub fn offset(self, index: u32, stride: u32) -> Self {
        Self(self.0 + u64::from(index) * u64::from(stride))
    }
}

#[derive(Clone, Debug, PartialEq, Eq, thiserror::Error)]
pub enum DeviceError {
    /// The device was removed or reset. Nothing created from it is usable
    /// anymore.
    #[error("the GPU device was lost")]
    Lost,
    /// A device call failed.
    #[error("{operation} failed: {message}")]
    Api {
        operation: &'static str,
        message: String,
    },
    /// The call was rejected because it would have been undefined behavior on
    /// the GPU (e.g. resetting a command allocator that is still executing).
    #[error("invalid device usage: {0}")]
    InvalidUsage(&'static str),
}

/// The subset of an explicit GPU API that the core consumes.
///
/// Calls that record a GPU-timeline operation (`execute_command_list`,
/// `signal`) only enqueue it; completion is observable solely through
/// `completed_value`/`wait_for_value` on a fence.
pub trait Device {
    type DescriptorHeap;
    type Fence: Clone;
    type CommandAllocator;
    type CommandList;
    /// A resource whose lifetime is tied to a submission, such as an upload
    /// buffer.
    type Resource;

    fn create_descriptor_heap(
        &self,
        kind: HeapKind,
        capacity: u32,
        shader_visible: bool,
    ) -> Result<Self::DescriptorHeap, DeviceError>;

    /// The distance in bytes between two adjacent descriptors of `kind`.
    fn descriptor_stride(&self, kind: HeapKind) -> u32;

    fn cpu_heap_start(&self, heap: &Self::DescriptorHeap) -> CpuDescriptorHandle;

    /// `None` if the heap is not shader-visible.
    fn gpu_heap_start(&self, heap: &Self::DescriptorHeap) -> Option<GpuDescriptorHandle>;

    /// Copies `count` descriptors on the CPU timeline. The source range must
    /// live in a heap that is not shader-visible.
    fn copy_descriptors(
        &self,
        kind: HeapKind,
        dst: CpuDescriptorHandle,
        src: CpuDescriptorHandle,
        count: u32,
    ) -> Result<(), DeviceError>;

    fn create_fence(&self, initial_value: u64) -> Result<Self::Fence, DeviceError>;

    /// The last value the GPU has reached on `fence`. Never blocks.
    fn completed_value(&self, fence: &Self::Fence) -> u64;

    /// Blocks the calling thread until the GPU reaches `value` on `fence`.
    fn wait_for_value(&self, fence: &Self::Fence, value: u64) -> Result<(), DeviceError>;

    /// Enqueues a signal of `fence` to `value` behind all previously executed
    /// work.
    fn signal(&self, fence: &Self::Fence, value: u64) -> Result<(), DeviceError>;

    fn create_command_allocator(&self) -> Result<Self::CommandAllocator, DeviceError>;

    fn reset_command_allocator(&self, allocator: &Self::CommandAllocator)
        -> Result<(), DeviceError>;

    /// Creates a command list in the recording state.
    fn create_command_list(
        &self,
        allocator: &Self::CommandAllocator,
    ) -> Result<Self::CommandList, DeviceError>;

    /// Reopens a closed command list for recording into `allocator`.
    fn reset_command_list(
        &self,
        list: &mut Self::CommandList,
        allocator: &Self::CommandAllocator,
    ) -> Result<(), DeviceError>;

    fn close_command_list(&self, list: &mut Self::CommandList) -> Result<(), DeviceError>;

    fn execute_command_list(&self, list: &Self::CommandList) -> Result<(), DeviceError>;

    /// Creates a CPU-writable buffer for staging uploads.
    fn create_upload_buffer(&self, size: u64) -> Result<Self::Resource, DeviceError>;
}
