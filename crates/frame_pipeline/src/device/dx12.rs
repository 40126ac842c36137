use windows::{
    core::{ComInterface, PCSTR},
    Win32::{
        Foundation::{CloseHandle, HANDLE},
        Graphics::{
            Direct3D::D3D_FEATURE_LEVEL_11_0,
            Direct3D12::*,
            Dxgi::{
                Common::{DXGI_FORMAT_UNKNOWN, DXGI_SAMPLE_DESC},
                CreateDXGIFactory2, DXGIGetDebugInterface1, IDXGIAdapter, IDXGIDebug1,
                IDXGIFactory6, DXGI_CREATE_FACTORY_DEBUG, DXGI_DEBUG_ALL,
                DXGI_DEBUG_RLO_IGNORE_INTERNAL, DXGI_DEBUG_RLO_SUMMARY,
                DXGI_ERROR_DEVICE_HUNG, DXGI_ERROR_DEVICE_REMOVED, DXGI_ERROR_DEVICE_RESET,
                DXGI_GPU_PREFERENCE_HIGH_PERFORMANCE, DXGI_GPU_PREFERENCE_MINIMUM_POWER,
            },
        },
        System::Threading::{CreateEventW, WaitForSingleObject},
    },
};

use crate::config::{Config, PowerPreference};

use super::{CpuDescriptorHandle, Device, DeviceError, GpuDescriptorHandle, HeapKind};

/// A [`Device`] over a Direct3D 12 device and its direct queue.
pub struct Dx12Device {
    is_debug: bool,
    device: ID3D12Device,
    queue: ID3D12CommandQueue,
    /// Signalled by fences for blocking waits. Waits happen on the submitting
    /// thread only.
    event: HANDLE,
    _factory: IDXGIFactory6,
}

impl Dx12Device {
    /// Selects an adapter by the configured power preference, falling back
    /// to WARP, and creates a device and direct queue on it.
    ///
    /// ## Errors
    ///
    /// Fails if no device can be created.
    pub fn new(config: &Config) -> Result<Self, DeviceError> {
        let is_debug = config.enable_debug();

        let factory: IDXGIFactory6 = {
            let flags = if is_debug {
                DXGI_CREATE_FACTORY_DEBUG
            } else {
                0
            };

            unsafe { CreateDXGIFactory2(flags) }.map_err(|e| api("CreateDXGIFactory2", &e))?
        };

        let power_preference = match config.power_preference {
            PowerPreference::LowPower => DXGI_GPU_PREFERENCE_MINIMUM_POWER,
            PowerPreference::HighPerformance => DXGI_GPU_PREFERENCE_HIGH_PERFORMANCE,
        };

        let adapter: IDXGIAdapter = unsafe { factory.EnumAdapterByGpuPreference(0, power_preference) }
            .or_else(|_| {
                log::warn!("no hardware adapter found, falling back to WARP");
                unsafe { factory.EnumWarpAdapter() }
            })
            .map_err(|e| api("EnumWarpAdapter", &e))?;

        if is_debug {
            let mut debug: Option<ID3D12Debug> = None;
            match unsafe { D3D12GetDebugInterface(&mut debug) } {
                Ok(()) => {
                    if let Some(debug) = debug {
                        unsafe { debug.EnableDebugLayer() };
                    }
                }
                Err(e) => log::warn!("D3D12 debug layer unavailable: {e}"),
            }
        }

        let device = {
            let mut device: Option<ID3D12Device> = None;
            unsafe { D3D12CreateDevice(&adapter, D3D_FEATURE_LEVEL_11_0, &mut device) }
                .map_err(|e| api("D3D12CreateDevice", &e))?;
            device.ok_or(DeviceError::Api {
                operation: "D3D12CreateDevice",
                message: "no device returned".into(),
            })?
        };

        if is_debug {
            Self::install_message_callback(&device);
        }

        let queue: ID3D12CommandQueue = unsafe {
            device.CreateCommandQueue(&D3D12_COMMAND_QUEUE_DESC {
                Type: D3D12_COMMAND_LIST_TYPE_DIRECT,
                ..Default::default()
            })
        }
        .map_err(|e| api("CreateCommandQueue", &e))?;

        let event =
            unsafe { CreateEventW(None, false, false, None) }.map_err(|e| api("CreateEventW", &e))?;

        log::info!("created D3D12 device (debug: {is_debug})");

        Ok(Self {
            is_debug,
            device,
            queue,
            event,
            _factory: factory,
        })
    }

    #[must_use]
    pub fn device(&self) -> &ID3D12Device {
        &self.device
    }

    #[must_use]
    pub fn queue(&self) -> &ID3D12CommandQueue {
        &self.queue
    }

    fn install_message_callback(device: &ID3D12Device) {
        let Ok(queue) = device.cast::<ID3D12InfoQueue1>() else {
            log::warn!("D3D12 info queue unavailable, debug messages will not be logged");
            return;
        };

        let mut cookie = 0;
        if let Err(e) = unsafe {
            queue.RegisterMessageCallback(
                Some(d3d12_debug_callback),
                D3D12_MESSAGE_CALLBACK_IGNORE_FILTERS,
                std::ptr::null(),
                &mut cookie,
            )
        } {
            log::warn!("failed to register D3D12 message callback: {e}");
        }
    }

    /// Maps a failed call to a device error, distinguishing device removal.
    fn check(&self, operation: &'static str, error: &windows::core::Error) -> DeviceError {
        let code = error.code();
        if code == DXGI_ERROR_DEVICE_REMOVED
            || code == DXGI_ERROR_DEVICE_RESET
            || code == DXGI_ERROR_DEVICE_HUNG
        {
            let reason = unsafe { self.device.GetDeviceRemovedReason() };
            log::error!("{operation}: device lost ({reason:?})");
            DeviceError::Lost
        } else {
            let error = api(operation, error);
            log::error!("{error}");
            error
        }
    }
}

impl Drop for Dx12Device {
    fn drop(&mut self) {
        if let Err(e) = unsafe { CloseHandle(self.event) }.ok() {
            log::error!("failed to close fence event: {e}");
        }

        if self.is_debug {
            match unsafe { DXGIGetDebugInterface1::<IDXGIDebug1>(0) } {
                Ok(debug) => {
                    if let Err(e) = unsafe {
                        debug.ReportLiveObjects(
                            DXGI_DEBUG_ALL,
                            DXGI_DEBUG_RLO_SUMMARY | DXGI_DEBUG_RLO_IGNORE_INTERNAL,
                        )
                    } {
                        log::warn!("failed to report live objects: {e}");
                    }
                }
                Err(e) => log::warn!("DXGI debug interface unavailable: {e}"),
            }
        }
    }
}

impl Device for Dx12Device {
    type DescriptorHeap = ID3D12DescriptorHeap;
    type Fence = ID3D12Fence;
    type CommandAllocator = ID3D12CommandAllocator;
    type CommandList = ID3D12GraphicsCommandList;
    type Resource = ID3D12Resource;

    fn create_descriptor_heap(
        &self,
        kind: HeapKind,
        capacity: u32,
        shader_visible: bool,
    ) -> Result<ID3D12DescriptorHeap, DeviceError> {
        let desc = D3D12_DESCRIPTOR_HEAP_DESC {
            Type: heap_type(kind),
            NumDescriptors: capacity,
            Flags: if shader_visible {
                D3D12_DESCRIPTOR_HEAP_FLAG_SHADER_VISIBLE
            } else {
                D3D12_DESCRIPTOR_HEAP_FLAG_NONE
            },
            NodeMask: 0,
        };

        unsafe { self.device.CreateDescriptorHeap(&desc) }
            .map_err(|e| self.check("CreateDescriptorHeap", &e))
    }

    fn descriptor_stride(&self, kind: HeapKind) -> u32 {
        unsafe { self.device.GetDescriptorHandleIncrementSize(heap_type(kind)) }
    }

    fn cpu_heap_start(&self, heap: &ID3D12DescriptorHeap) -> CpuDescriptorHandle {
        CpuDescriptorHandle(unsafe { heap.GetCPUDescriptorHandleForHeapStart() }.ptr)
    }

    fn gpu_heap_start(&self, heap: &ID3D12DescriptorHeap) -> Option<GpuDescriptorHandle> {
        let desc = unsafe { heap.GetDesc() };
        if (desc.Flags & D3D12_DESCRIPTOR_HEAP_FLAG_SHADER_VISIBLE).0 == 0 {
            return None;
        }

        Some(GpuDescriptorHandle(
            unsafe { heap.GetGPUDescriptorHandleForHeapStart() }.ptr,
        ))
    }

    fn copy_descriptors(
        &self,
        kind: HeapKind,
        dst: CpuDescriptorHandle,
        src: CpuDescriptorHandle,
        count: u32,
    ) -> Result<(), DeviceError> {
        unsafe {
            self.device.CopyDescriptorsSimple(
                count,
                D3D12_CPU_DESCRIPTOR_HANDLE { ptr: dst.0 },
                D3D12_CPU_DESCRIPTOR_HANDLE { ptr: src.0 },
                heap_type(kind),
            );
        }
        Ok(())
    }

    fn create_fence(&self, initial_value: u64) -> Result<ID3D12Fence, DeviceError> {
        unsafe { self.device.CreateFence(initial_value, D3D12_FENCE_FLAG_NONE) }
            .map_err(|e| self.check("CreateFence", &e))
    }

    fn completed_value(&self, fence: &ID3D12Fence) -> u64 {
        // Reads as u64::MAX once the device is removed; the next call that
        // touches the device reports it.
        unsafe { fence.GetCompletedValue() }
    }

    fn wait_for_value(&self, fence: &ID3D12Fence, value: u64) -> Result<(), DeviceError> {
        if unsafe { fence.GetCompletedValue() } >= value {
            return Ok(());
        }

        unsafe { fence.SetEventOnCompletion(value, self.event) }
            .map_err(|e| self.check("SetEventOnCompletion", &e))?;
        unsafe { WaitForSingleObject(self.event, u32::MAX) };

        if unsafe { fence.GetCompletedValue() } == u64::MAX {
            if let Err(e) = unsafe { self.device.GetDeviceRemovedReason() } {
                return Err(self.check("WaitForSingleObject", &e));
            }
        }

        Ok(())
    }

    fn signal(&self, fence: &ID3D12Fence, value: u64) -> Result<(), DeviceError> {
        unsafe { self.queue.Signal(fence, value) }.map_err(|e| self.check("Signal", &e))
    }

    fn create_command_allocator(&self) -> Result<ID3D12CommandAllocator, DeviceError> {
        unsafe {
            self.device
                .CreateCommandAllocator(D3D12_COMMAND_LIST_TYPE_DIRECT)
        }
        .map_err(|e| self.check("CreateCommandAllocator", &e))
    }

    fn reset_command_allocator(&self, allocator: &ID3D12CommandAllocator) -> Result<(), DeviceError> {
        unsafe { allocator.Reset() }.map_err(|e| self.check("ID3D12CommandAllocator::Reset", &e))
    }

    fn create_command_list(
        &self,
        allocator: &ID3D12CommandAllocator,
    ) -> Result<ID3D12GraphicsCommandList, DeviceError> {
        unsafe {
            self.device.CreateCommandList(
                0,
                D3D12_COMMAND_LIST_TYPE_DIRECT,
                allocator,
                None::<&ID3D12PipelineState>,
            )
        }
        .map_err(|e| self.check("CreateCommandList", &e))
    }

    fn reset_command_list(
        &self,
        list: &mut ID3D12GraphicsCommandList,
        allocator: &ID3D12CommandAllocator,
    ) -> Result<(), DeviceError> {
        unsafe { list.Reset(allocator, None::<&ID3D12PipelineState>) }
            .map_err(|e| self.check("ID3D12GraphicsCommandList::Reset", &e))
    }

    fn close_command_list(&self, list: &mut ID3D12GraphicsCommandList) -> Result<(), DeviceError> {
        unsafe { list.Close() }.map_err(|e| self.check("ID3D12GraphicsCommandList::Close", &e))
    }

    fn execute_command_list(&self, list: &ID3D12GraphicsCommandList) -> Result<(), DeviceError> {
        let list: ID3D12CommandList = list
            .cast()
            .map_err(|e| self.check("ID3D12GraphicsCommandList::cast", &e))?;
        unsafe { self.queue.ExecuteCommandLists(&[Some(list)]) };
        Ok(())
    }

    fn create_upload_buffer(&self, size: u64) -> Result<ID3D12Resource, DeviceError> {
        let mut buffer: Option<ID3D12Resource> = None;
        unsafe {
            self.device.CreateCommittedResource(
                &D3D12_HEAP_PROPERTIES {
                    Type: D3D12_HEAP_TYPE_UPLOAD,
                    CPUPageProperty: D3D12_CPU_PAGE_PROPERTY_UNKNOWN,
                    MemoryPoolPreference: D3D12_MEMORY_POOL_UNKNOWN,
                    CreationNodeMask: 0,
                    VisibleNodeMask: 0,
                },
                D3D12_HEAP_FLAG_NONE,
                &D3D12_RESOURCE_DESC {
                    Dimension: D3D12_RESOURCE_DIMENSION_BUFFER,
                    Alignment: 0,
                    Width: size,
                    Height: 1,
                    DepthOrArraySize: 1,
                    MipLevels: 1,
                    Format: DXGI_FORMAT_UNKNOWN,
                    SampleDesc: DXGI_SAMPLE_DESC {
                        Count: 1,
                        Quality: 0,
                    },
                    Layout: D3D12_TEXTURE_LAYOUT_ROW_MAJOR,
                    Flags: D3D12_RESOURCE_FLAG_NONE,
                },
                D3D12_RESOURCE_STATE_GENERIC_READ,
                None,
                &mut buffer,
            )
        }
        .map_err(|e| self.check("CreateCommittedResource", &e))?;

        buffer.ok_or(DeviceError::Api {
            operation: "CreateCommittedResource",
            message: "no resource returned".into(),
        })
    }
}

fn heap_type(kind: HeapKind) -> D3D12_DESCRIPTOR_HEAP_TYPE {
    match kind {
        HeapKind::CbvSrvUav => D3D12_DESCRIPTOR_HEAP_TYPE_CBV_SRV_UAV,
        HeapKind::Sampler => D3D12_DESCRIPTOR_HEAP_TYPE_SAMPLER,
        HeapKind::Rtv => D3D12_DESCRIPTOR_HEAP_TYPE_RTV,
        HeapKind::Dsv => D3D12_DESCRIPTOR_HEAP_TYPE_DSV,
    }
}

fn api(operation: &'static str, error: &windows::core::Error) -> DeviceError {
    DeviceError::Api {
        operation,
        message: error.to_string(),
    }
}

unsafe extern "system" fn d3d12_debug_callback(
    _category: D3D12_MESSAGE_CATEGORY,
    severity: D3D12_MESSAGE_SEVERITY,
    id: D3D12_MESSAGE_ID,
    description: PCSTR,
    _context: *mut std::ffi::c_void,
) {
    let description = description.to_string().unwrap_or_default();

    match severity {
        D3D12_MESSAGE_SEVERITY_CORRUPTION | D3D12_MESSAGE_SEVERITY_ERROR => {
            log::error!("D3D12: {id:?} {description}");
        }
        D3D12_MESSAGE_SEVERITY_WARNING => log::warn!("D3D12: {id:?} {description}"),
        D3D12_MESSAGE_SEVERITY_INFO => log::info!("D3D12: {id:?} {description}"),
        _ => log::debug!("D3D12: {id:?} {description}"),
    }
}
