//! A software device that keeps descriptors in memory and plays the part of
//! the GPU.
//!
//! Submitted work is queued in order and "executes" when it retires. When work
//! retires depends on the device's [`Retirement`] mode:
//!
//! - `OnWait`: nothing retires until the CPU waits on a fence value, at which
//!   point queued work retires in order until the value is reached. This makes
//!   tests deterministic: the GPU never gets ahead of what was waited for.
//! - `Manual`: work only retires through [`HostDevice::retire_next`] and
//!   friends, usually called from another thread.
//! - `Worker`: a background thread retires one queued operation per `latency`.
//!
//! The device rejects the misuse the core is built to avoid, the same way a
//! validation layer would: resetting a command allocator whose lists are still
//! queued, executing an open command list, waiting for a value nothing will
//! ever signal.

use std::{collections::VecDeque, sync::Arc, thread::JoinHandle, time::Duration};

use parking_lot::{Condvar, Mutex, MutexGuard};

use super::{CpuDescriptorHandle, Device, DeviceError, GpuDescriptorHandle, HeapKind};

const HEAP_SHIFT: u32 = 32;
const HEAP_OFFSET_MASK: u64 = (1 << HEAP_SHIFT) - 1;
const GPU_ADDRESS_BIT: u64 = 1 << 63;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Retirement {
    OnWait,
    Manual,
    Worker { latency: Duration },
}

/// A command recorded into a [`HostCommandList`].
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum HostCommand {
    /// An opaque labelled command, standing in for draws and dispatches.
    Marker(String),
    /// A copy out of an upload buffer.
    CopyFromBuffer { bytes: u64 },
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct HostHeap {
    id: usize,
    shader_visible: bool,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct HostFence {
    id: usize,
}

#[derive(Debug)]
pub struct HostCommandAllocator {
    id: usize,
}

#[derive(Debug)]
pub struct HostCommandList {
    allocator: usize,
    commands: Vec<HostCommand>,
    open: bool,
}

impl HostCommandList {
    /// Records a command.
    ///
    /// ## Errors
    ///
    /// Fails if the list has been closed.
    pub fn record(&mut self, command: HostCommand) -> Result<(), DeviceError> {
        if !self.open {
            return Err(DeviceError::InvalidUsage("recording into a closed command list"));
        }

        self.commands.push(command);
        Ok(())
    }

    #[must_use]
    pub fn is_open(&self) -> bool {
        self.open
    }

    #[must_use]
    pub fn commands(&self) -> &[HostCommand] {
        &self.commands
    }
}

/// An upload buffer. Clones share the allocation; `holders()` counts them so
/// tests can observe when the core lets go of a buffer.
#[derive(Clone, Debug)]
pub struct HostBuffer {
    size: u64,
    data: Arc<Mutex<Vec<u8>>>,
}

impl HostBuffer {
    #[must_use]
    pub fn size(&self) -> u64 {
        self.size
    }

    pub fn write(&self, offset: usize, bytes: &[u8]) {
        let mut data = self.data.lock();
        data[offset..offset + bytes.len()].copy_from_slice(bytes);
    }

    #[must_use]
    pub fn holders(&self) -> usize {
        Arc::strong_count(&self.data)
    }
}

struct HeapStorage {
    kind: HeapKind,
    shader_visible: bool,
    descriptors: Vec<u64>,
}

enum Op {
    Execute {
        allocator: usize,
        commands: Vec<HostCommand>,
    },
    Signal {
        fence: usize,
        value: u64,
    },
}

struct State {
    retirement: Retirement,
    heaps: Vec<HeapStorage>,
    fences: Vec<u64>,
    /// Number of queued executions per command allocator.
    allocator_executions: Vec<u32>,
    queue: VecDeque<Op>,
    executed: Vec<HostCommand>,
    lost: bool,
    shutdown: bool,
}

impl State {
    /// Retires the oldest queued operation. Returns false if the queue is
    /// empty.
    fn retire_one(&mut self) -> bool {
        match self.queue.pop_front() {
            Some(Op::Execute {
                allocator,
                commands,
            }) => {
                self.allocator_executions[allocator] -= 1;
                self.executed.extend(commands);
                true
            }
            Some(Op::Signal { fence, value }) => {
                let completed = &mut self.fences[fence];
                *completed = (*completed).max(value);
                true
            }
            None => false,
        }
    }

    fn will_reach(&self, fence: usize, value: u64) -> bool {
        self.queue.iter().any(|op| match op {
            Op::Signal { fence: f, value: v } => *f == fence && *v >= value,
            Op::Execute { .. } => false,
        })
    }

    fn check_lost(&self) -> Result<(), DeviceError> {
        if self.lost {
            Err(DeviceError::Lost)
        } else {
            Ok(())
        }
    }

    fn resolve(
        &self,
        kind: HeapKind,
        handle: CpuDescriptorHandle,
        count: u32,
    ) -> Result<(usize, usize), DeviceError> {
        let raw = handle.0 as u64;
        let heap = (raw >> HEAP_SHIFT)
            .checked_sub(1)
            .ok_or(DeviceError::InvalidUsage("null descriptor handle"))? as usize;
        let storage = self
            .heaps
            .get(heap)
            .ok_or(DeviceError::InvalidUsage("descriptor handle names no heap"))?;

        if storage.kind != kind {
            return Err(DeviceError::InvalidUsage("descriptor kind does not match heap"));
        }

        let stride = u64::from(stride_of(kind));
        let byte_offset = raw & HEAP_OFFSET_MASK;
        if byte_offset % stride != 0 {
            return Err(DeviceError::InvalidUsage("misaligned descriptor handle"));
        }

        let index = (byte_offset / stride) as usize;
        if index + count as usize > storage.descriptors.len() {
            return Err(DeviceError::InvalidUsage("descriptor range exceeds heap"));
        }

        Ok((heap, index))
    }
}

struct Shared {
    state: Mutex<State>,
    /// Notified whenever queued work retires or the device is lost.
    retired: Condvar,
    /// Notified whenever work is queued, for the worker thread.
    queued: Condvar,
}

struct Worker {
    shared: Arc<Shared>,
    thread: Mutex<Option<JoinHandle<()>>>,
}

impl Drop for Worker {
    fn drop(&mut self) {
        self.shared.state.lock().shutdown = true;
        self.shared.queued.notify_all();

        if let Some(thread) = self.thread.lock().take() {
            if thread.join().is_err() {
                log::error!("host queue worker panicked");
            }
        }
    }
}

/// A simulated GPU. Clones refer to the same device.
#[derive(Clone)]
pub struct HostDevice {
    shared: Arc<Shared>,
    _worker: Option<Arc<Worker>>,
}

impl Default for HostDevice {
    fn default() -> Self {
        Self::new()
    }
}

impl HostDevice {
    /// A device whose queued work retires when waited upon.
    #[must_use]
    pub fn new() -> Self {
        Self::with_retirement(Retirement::OnWait)
    }

    #[must_use]
    pub fn with_retirement(retirement: Retirement) -> Self {
        let shared = Arc::new(Shared {
            state: Mutex::new(State {
                retirement,
                heaps: Vec::new(),
                fences: Vec::new(),
                allocator_executions: Vec::new(),
                queue: VecDeque::new(),
                executed: Vec::new(),
                lost: false,
                shutdown: false,
            }),
            retired: Condvar::new(),
            queued: Condvar::new(),
        });

        let worker = match retirement {
            Retirement::Worker { latency } => {
                let thread_shared = shared.clone();
                let thread = std::thread::Builder::new()
                    .name("host-gpu-queue".into())
                    .spawn(move || run_queue(&thread_shared, latency))
                    .ok();

                if thread.is_none() {
                    log::error!("failed to spawn the host queue worker; work will retire on wait");
                    shared.state.lock().retirement = Retirement::OnWait;
                }

                Some(Arc::new(Worker {
                    shared: shared.clone(),
                    thread: Mutex::new(thread),
                }))
            }
            Retirement::OnWait | Retirement::Manual => None,
        };

        Self {
            shared,
            _worker: worker,
        }
    }

    /// A device that retires queued work on a background thread.
    #[must_use]
    pub fn threaded(latency: Duration) -> Self {
        Self::with_retirement(Retirement::Worker { latency })
    }

    /// Retires the oldest queued operation. Returns false if nothing was
    /// queued.
    pub fn retire_next(&self) -> bool {
        let retired = self.shared.state.lock().retire_one();
        if retired {
            self.shared.retired.notify_all();
        }
        retired
    }

    /// Retires queued operations until `fence` reaches `value` or the queue
    /// runs dry.
    pub fn retire_until(&self, fence: &HostFence, value: u64) {
        let mut state = self.shared.state.lock();
        while state.fences[fence.id] < value && state.retire_one() {}
        drop(state);
        self.shared.retired.notify_all();
    }

    /// Retires everything that has been queued.
    pub fn retire_all(&self) {
        let mut state = self.shared.state.lock();
        while state.retire_one() {}
        drop(state);
        self.shared.retired.notify_all();
    }

    #[must_use]
    pub fn queued_operations(&self) -> usize {
        self.shared.state.lock().queue.len()
    }

    /// All commands that have finished executing, in execution order.
    #[must_use]
    pub fn executed_commands(&self) -> Vec<HostCommand> {
        self.shared.state.lock().executed.clone()
    }

    /// Simulates device removal. Pending and future waits fail with
    /// [`DeviceError::Lost`].
    pub fn lose_device(&self) {
        self.shared.state.lock().lost = true;
        self.shared.retired.notify_all();
    }

    /// Writes a descriptor payload, standing in for view creation.
    ///
    /// ## Errors
    ///
    /// Fails if the handle does not address a descriptor of `kind`.
    pub fn write_descriptor(
        &self,
        kind: HeapKind,
        handle: CpuDescriptorHandle,
        payload: u64,
    ) -> Result<(), DeviceError> {
        let mut state = self.shared.state.lock();
        let (heap, index) = state.resolve(kind, handle, 1)?;
        state.heaps[heap].descriptors[index] = payload;
        Ok(())
    }

    /// Reads a descriptor payload through its CPU handle.
    ///
    /// ## Errors
    ///
    /// Fails if the handle does not address a descriptor of `kind`.
    pub fn read_descriptor(
        &self,
        kind: HeapKind,
        handle: CpuDescriptorHandle,
    ) -> Result<u64, DeviceError> {
        let state = self.shared.state.lock();
        let (heap, index) = state.resolve(kind, handle, 1)?;
        Ok(state.heaps[heap].descriptors[index])
    }

    /// Reads a descriptor payload the way a shader would, through its GPU
    /// handle.
    ///
    /// ## Errors
    ///
    /// Fails if the handle does not address a descriptor of `kind` in a
    /// shader-visible heap.
    pub fn read_gpu_descriptor(
        &self,
        kind: HeapKind,
        handle: GpuDescriptorHandle,
    ) -> Result<u64, DeviceError> {
        if handle.0 & GPU_ADDRESS_BIT == 0 {
            return Err(DeviceError::InvalidUsage("not a GPU descriptor handle"));
        }

        let cpu = CpuDescriptorHandle((handle.0 & !GPU_ADDRESS_BIT) as usize);
        let state = self.shared.state.lock();
        let (heap, index) = state.resolve(kind, cpu, 1)?;

        if !state.heaps[heap].shader_visible {
            return Err(DeviceError::InvalidUsage("GPU access to a CPU-only heap"));
        }

        Ok(state.heaps[heap].descriptors[index])
    }

    fn lock(&self) -> MutexGuard<'_, State> {
        self.shared.state.lock()
    }
}

fn stride_of(kind: HeapKind) -> u32 {
    match kind {
        HeapKind::CbvSrvUav => 32,
        HeapKind::Sampler => 16,
        HeapKind::Rtv | HeapKind::Dsv => 8,
    }
}

fn heap_base(id: usize) -> u64 {
    (id as u64 + 1) << HEAP_SHIFT
}

fn run_queue(shared: &Shared, latency: Duration) {
    let mut state = shared.state.lock();

    loop {
        if state.shutdown {
            return;
        }

        if state.queue.is_empty() || state.lost {
            shared.queued.wait(&mut state);
            continue;
        }

        MutexGuard::unlocked(&mut state, || std::thread::sleep(latency));

        if state.shutdown {
            return;
        }

        state.retire_one();
        shared.retired.notify_all();
    }
}

impl Device for HostDevice {
    type DescriptorHeap = HostHeap;
    type Fence = HostFence;
    type CommandAllocator = HostCommandAllocator;
    type CommandList = HostCommandList;
    type Resource = HostBuffer;

    fn create_descriptor_heap(
        &self,
        kind: HeapKind,
        capacity: u32,
        shader_visible: bool,
    ) -> Result<HostHeap, DeviceError> {
        let mut state = self.lock();
        state.check_lost()?;

        if u64::from(capacity) * u64::from(stride_of(kind)) > HEAP_OFFSET_MASK {
            return Err(DeviceError::Api {
                operation: "create_descriptor_heap",
                message: format!("{capacity} {kind:?} descriptors exceed the heap size limit"),
            });
        }

        if shader_visible && !kind.is_shader_visible() {
            return Err(DeviceError::InvalidUsage(
                "render-target and depth-stencil heaps cannot be shader-visible",
            ));
        }

        let id = state.heaps.len();
        state.heaps.push(HeapStorage {
            kind,
            shader_visible,
            descriptors: vec![0; capacity as usize],
        });

        Ok(HostHeap { id, shader_visible })
    }

    fn descriptor_stride(&self, kind: HeapKind) -> u32 {
        stride_of(kind)
    }

    fn cpu_heap_start(&self, heap: &HostHeap) -> CpuDescriptorHandle {
        CpuDescriptorHandle(heap_base(heap.id) as usize)
    }

    fn gpu_heap_start(&self, heap: &HostHeap) -> Option<GpuDescriptorHandle> {
        heap.shader_visible
            .then(|| GpuDescriptorHandle(heap_base(heap.id) | GPU_ADDRESS_BIT))
    }

    fn copy_descriptors(
        &self,
        kind: HeapKind,
        dst: CpuDescriptorHandle,
        src: CpuDescriptorHandle,
        count: u32,
    ) -> Result<(), DeviceError> {
        let mut state = self.lock();
        state.check_lost()?;

        let (src_heap, src_index) = state.resolve(kind, src, count)?;
        let (dst_heap, dst_index) = state.resolve(kind, dst, count)?;

        if state.heaps[src_heap].shader_visible {
            return Err(DeviceError::InvalidUsage(
                "descriptor copies must read from a CPU-only heap",
            ));
        }

        let count = count as usize;
        let copied = state.heaps[src_heap].descriptors[src_index..src_index + count].to_vec();
        state.heaps[dst_heap].descriptors[dst_index..dst_index + count].copy_from_slice(&copied);

        Ok(())
    }

    fn create_fence(&self, initial_value: u64) -> Result<HostFence, DeviceError> {
        let mut state = self.lock();
        state.check_lost()?;

        let id = state.fences.len();
        state.fences.push(initial_value);
        Ok(HostFence { id })
    }

    fn completed_value(&self, fence: &HostFence) -> u64 {
        self.lock().fences[fence.id]
    }

    fn wait_for_value(&self, fence: &HostFence, value: u64) -> Result<(), DeviceError> {
        let mut state = self.lock();

        loop {
            state.check_lost()?;

            if state.fences[fence.id] >= value {
                return Ok(());
            }

            if !state.will_reach(fence.id, value) {
                return Err(DeviceError::InvalidUsage(
                    "waiting for a fence value that no queued work will signal",
                ));
            }

            match state.retirement {
                Retirement::OnWait => {
                    state.retire_one();
                }
                Retirement::Manual | Retirement::Worker { .. } => {
                    self.shared.retired.wait(&mut state);
                }
            }
        }
    }

    fn signal(&self, fence: &HostFence, value: u64) -> Result<(), DeviceError> {
        let mut state = self.lock();
        state.check_lost()?;
        state.queue.push_back(Op::Signal {
            fence: fence.id,
            value,
        });
        drop(state);

        self.shared.queued.notify_all();
        Ok(())
    }

    fn create_command_allocator(&self) -> Result<HostCommandAllocator, DeviceError> {
        let mut state = self.lock();
        state.check_lost()?;

        let id = state.allocator_executions.len();
        state.allocator_executions.push(0);
        Ok(HostCommandAllocator { id })
    }

    fn reset_command_allocator(&self, allocator: &HostCommandAllocator) -> Result<(), DeviceError> {
        let state = self.lock();
        state.check_lost()?;

        if state.allocator_executions[allocator.id] > 0 {
            return Err(DeviceError::InvalidUsage(
                "command allocator reset while its command lists are executing",
            ));
        }

        Ok(())
    }

    fn create_command_list(
        &self,
        allocator: &HostCommandAllocator,
    ) -> Result<HostCommandList, DeviceError> {
        self.lock().check_lost()?;

        Ok(HostCommandList {
            allocator: allocator.id,
            commands: Vec::new(),
            open: true,
        })
    }

    fn reset_command_list(
        &self,
        list: &mut HostCommandList,
        allocator: &HostCommandAllocator,
    ) -> Result<(), DeviceError> {
        self.lock().check_lost()?;

        if list.open {
            return Err(DeviceError::InvalidUsage("command list reset while recording"));
        }

        list.allocator = allocator.id;
        list.commands.clear();
        list.open = true;
        Ok(())
    }

    fn close_command_list(&self, list: &mut HostCommandList) -> Result<(), DeviceError> {
        if !list.open {
            return Err(DeviceError::InvalidUsage("command list closed twice"));
        }

        list.open = false;
        Ok(())
    }

    fn execute_command_list(&self, list: &HostCommandList) -> Result<(), DeviceError> {
        if list.open {
            return Err(DeviceError::InvalidUsage("executing an open command list"));
        }

        let mut state = self.lock();
        state.check_lost()?;

        state.allocator_executions[list.allocator] += 1;
        state.queue.push_back(Op::Execute {
            allocator: list.allocator,
            commands: list.commands.clone(),
        });
        drop(state);

        self.shared.queued.notify_all();
        Ok(())
    }

    fn create_upload_buffer(&self, size: u64) -> Result<HostBuffer, DeviceError> {
        self.lock().check_lost()?;

        let len = usize::try_from(size).map_err(|_| DeviceError::Api {
            operation: "create_upload_buffer",
            message: format!("{size} bytes is not addressable"),
        })?;

        Ok(HostBuffer {
            size,
            data: Arc::new(Mutex::new(vec![0; len])),
        })
    }
}
