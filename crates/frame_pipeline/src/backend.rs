use crate::{
    config::Config,
    context::{ActiveContext, ContextPool},
    descriptors::{DescriptorAllocation, DescriptorSlot, Descriptors, PageId, Region},
    device::{CpuDescriptorHandle, Device, DeviceError, GpuDescriptorHandle},
    fence::Fence,
    Error, HeapKind, Result,
};

/// The allocation and submission core, built around an injected device.
///
/// Owns the descriptor heaps, the command context pool and the fence that
/// orders submissions. Dropping the backend waits for all submitted work.
pub struct Backend<D: Device> {
    descriptors: Descriptors<D>,
    pool: ContextPool<D>,
    fence: Fence<D>,
    device: D,
}

impl<D: Device> Backend<D> {
    /// ## Errors
    ///
    /// Fails if the configuration is invalid or the device cannot create the
    /// heaps, contexts or fence.
    pub fn new(device: D, config: &Config) -> Result<Self> {
        config.validate()?;

        let descriptors = Descriptors::new(&device, &config.descriptors)?;
        let pool = ContextPool::new(&device, config.pool_size())?;
        let fence = Fence::new(&device, 0)?;

        log::info!(
            "backend created with {} command contexts, {} frames in flight",
            pool.size(),
            config.frames_in_flight
        );

        for kind in HeapKind::ALL {
            let collection = descriptors.collection(kind);
            log::debug!(
                "{kind:?}: {} static descriptors, {} pages of {}",
                collection.static_page().size(),
                collection.page_count(),
                collection.page_size()
            );
        }

        Ok(Self {
            descriptors,
            pool,
            fence,
            device,
        })
    }

    /// Allocates descriptors that live as long as the backend.
    ///
    /// ## Errors
    ///
    /// Returns `Error::CapacityExceeded` if the kind's static region is full.
    pub fn allocate_static(&mut self, kind: HeapKind, count: u32) -> Result<DescriptorAllocation> {
        self.descriptors.allocate_static(kind, count)
    }

    /// Allocates descriptors in the CPU-only staging heap, to be copied into
    /// transient pages with [`Self::copy_to_transient`].
    ///
    /// ## Errors
    ///
    /// Returns `Error::CapacityExceeded` if the staging heap is full or not
    /// configured.
    pub fn allocate_staging(&mut self, kind: HeapKind, count: u32) -> Result<DescriptorAllocation> {
        self.descriptors.allocate_staging(kind, count)
    }

    /// Acquires a command context for recording, blocking on the oldest
    /// submission if none is free.
    ///
    /// ## Errors
    ///
    /// Returns `Error::PoolExhausted` if every context is being recorded or
    /// no transient page is free while nothing is pending.
    pub fn get_new_command_context(&mut self) -> Result<ActiveContext> {
        self.pool.acquire(&self.device, &mut self.descriptors)
    }

    /// Acquires a context wrapped in a guard that releases it if it is
    /// dropped without being submitted.
    ///
    /// ## Errors
    ///
    /// As for [`Self::get_new_command_context`].
    pub fn record(&mut self) -> Result<Recording<'_, D>> {
        let context = self.get_new_command_context()?;
        Ok(Recording {
            backend: self,
            context,
            submitted: false,
        })
    }

    /// Allocates descriptors from the context's transient page. They are
    /// valid until the context's submission retires.
    ///
    /// ## Errors
    ///
    /// Returns `Error::NotShaderVisible` for kinds without transient pages,
    /// and `Error::CapacityExceeded` if the page is full.
    pub fn allocate_transient(
        &mut self,
        context: &ActiveContext,
        kind: HeapKind,
        count: u32,
    ) -> Result<DescriptorAllocation> {
        let page = self.transient_page(context, kind, count)?;
        self.descriptors
            .collection_mut(kind)
            .allocate_from_page(page, count)
    }

    /// Copies staged descriptors into the context's transient page, where
    /// shaders can reach them.
    ///
    /// ## Errors
    ///
    /// Fails if `source` is not a staging allocation or the page is full.
    pub fn copy_to_transient(
        &mut self,
        context: &ActiveContext,
        source: &DescriptorAllocation,
    ) -> Result<DescriptorAllocation> {
        let kind = source.kind();
        let page = self.transient_page(context, kind, source.size())?;

        let staging = match (source.region(), self.descriptors.staging_heap(kind)) {
            (Region::Staging, Some(heap)) => heap.cpu_handle(source.index()),
            _ => {
                log::error!("{kind:?} descriptor copy from {:?}", source.region());
                return Err(DeviceError::InvalidUsage(
                    "descriptor copies must read from a staging allocation",
                )
                .into());
            }
        };

        self.descriptors
            .collection_mut(kind)
            .copy_to_page(&self.device, page, staging, source.size())
    }

    fn transient_page(&self, context: &ActiveContext, kind: HeapKind, count: u32) -> Result<PageId> {
        if let Some(page) = self.pool.context(context)?.page(kind) {
            return Ok(page);
        }

        if kind.is_shader_visible() {
            log::error!("{kind:?}: no transient pages configured");
            Err(Error::CapacityExceeded {
                kind,
                requested: count,
                available: 0,
            })
        } else {
            Err(Error::NotShaderVisible(kind))
        }
    }

    /// Keeps `resource` alive until the context's submission retires.
    ///
    /// ## Errors
    ///
    /// Fails if the context is not active.
    pub fn track_resource(&mut self, context: &ActiveContext, resource: D::Resource) -> Result<()> {
        self.pool.track(context, resource)
    }

    /// ## Errors
    ///
    /// Fails if the context is not active.
    pub fn command_list(&mut self, context: &ActiveContext) -> Result<&mut D::CommandList> {
        self.pool.command_list_mut(context)
    }

    /// Submits the context's commands and returns the fence value that marks
    /// their completion. With `wait`, returns only once the GPU has reached
    /// it.
    ///
    /// ## Errors
    ///
    /// Fails if the context is not active or the device rejects the
    /// submission.
    pub fn submit(&mut self, context: ActiveContext, wait: bool) -> Result<u64> {
        let target = self.fence.next_value();
        self.pool.submit(
            &self.device,
            context,
            &mut self.fence,
            target,
            wait,
            &mut self.descriptors,
        )
    }

    /// Returns a context without submitting it.
    ///
    /// ## Errors
    ///
    /// Fails if the context is not active.
    pub fn release(&mut self, context: ActiveContext) -> Result<()> {
        self.pool.release(&self.device, context, &mut self.descriptors)
    }

    /// Recycles every context whose submission has retired, without
    /// blocking.
    ///
    /// ## Errors
    ///
    /// Fails if a retired context cannot be reset.
    pub fn recycle_completed(&mut self) -> Result<usize> {
        self.pool.recycle_completed(&self.device, &mut self.descriptors)
    }

    /// Waits for all submitted work and recycles every pending context.
    ///
    /// ## Errors
    ///
    /// Fails if the device is lost while waiting.
    pub fn flush(&mut self) -> Result<()> {
        let pending = self.pool.pending_count();
        self.pool.flush(&self.device, &mut self.descriptors)?;
        log::info!(
            "flushed {pending} submissions, fence at {}",
            self.fence.value(&self.device)
        );
        Ok(())
    }

    /// The last fence value the GPU is known to have reached.
    pub fn completed_value(&self) -> u64 {
        self.fence.value(&self.device)
    }

    /// ## Errors
    ///
    /// Fails if the slot's page was recycled since it was allocated.
    pub fn cpu_handle(&self, slot: DescriptorSlot) -> Result<CpuDescriptorHandle> {
        self.descriptors.cpu_handle(slot)
    }

    /// ## Errors
    ///
    /// Fails for descriptors shaders cannot address, or if the slot's page
    /// was recycled since it was allocated.
    pub fn gpu_handle(&self, slot: DescriptorSlot) -> Result<GpuDescriptorHandle> {
        self.descriptors.gpu_handle(slot)
    }

    #[must_use]
    pub fn device(&self) -> &D {
        &self.device
    }

    #[must_use]
    pub fn descriptors(&self) -> &Descriptors<D> {
        &self.descriptors
    }

    #[must_use]
    pub fn pool(&self) -> &ContextPool<D> {
        &self.pool
    }

    #[must_use]
    pub fn fence(&self) -> &Fence<D> {
        &self.fence
    }
}

impl<D: Device> Drop for Backend<D> {
    fn drop(&mut self) {
        if let Err(error) = self.flush() {
            log::error!("failed to flush submissions on shutdown: {error}");
        }
    }
}

/// A command context that is released back to the pool if it goes out of
/// scope without being submitted.
pub struct Recording<'a, D: Device> {
    backend: &'a mut Backend<D>,
    context: ActiveContext,
    submitted: bool,
}

impl<'a, D: Device> Recording<'a, D> {
    #[must_use]
    pub fn context(&self) -> &ActiveContext {
        &self.context
    }

    /// ## Errors
    ///
    /// See [`Backend::allocate_transient`].
    pub fn allocate_transient(&mut self, kind: HeapKind, count: u32) -> Result<DescriptorAllocation> {
        self.backend.allocate_transient(&self.context, kind, count)
    }

    /// ## Errors
    ///
    /// See [`Backend::copy_to_transient`].
    pub fn copy_to_transient(&mut self, source: &DescriptorAllocation) -> Result<DescriptorAllocation> {
        self.backend.copy_to_transient(&self.context, source)
    }

    /// ## Errors
    ///
    /// See [`Backend::track_resource`].
    pub fn track(&mut self, resource: D::Resource) -> Result<()> {
        self.backend.track_resource(&self.context, resource)
    }

    /// ## Errors
    ///
    /// See [`Backend::command_list`].
    pub fn command_list(&mut self) -> Result<&mut D::CommandList> {
        self.backend.command_list(&self.context)
    }

    #[must_use]
    pub fn backend(&self) -> &Backend<D> {
        &*self.backend
    }

    /// ## Errors
    ///
    /// See [`Backend::submit`].
    pub fn submit(self) -> Result<u64> {
        self.finish(false)
    }

    /// Submits and waits for the GPU to finish.
    ///
    /// ## Errors
    ///
    /// See [`Backend::submit`].
    pub fn submit_and_wait(self) -> Result<u64> {
        self.finish(true)
    }

    fn finish(mut self, wait: bool) -> Result<u64> {
        self.submitted = true;
        let context = self.context.claim();
        self.backend.submit(context, wait)
    }
}

impl<'a, D: Device> Drop for Recording<'a, D> {
    fn drop(&mut self) {
        if self.submitted {
            return;
        }

        log::debug!("context {} dropped unsubmitted", self.context.slot());
        if let Err(error) = self.backend.release(self.context.claim()) {
            log::error!("failed to release command context: {error}");
        }
    }
}
