use std::{
    collections::VecDeque,
    sync::atomic::{AtomicU32, Ordering},
};

use crate::{
    descriptors::{CheckedOutPages, Descriptors},
    device::Device,
    fence::Fence,
    Error, Exhausted, InvalidFree, Result,
};

use super::{ActiveContext, CommandContextData, SlotState};

static NEXT_POOL_ID: AtomicU32 = AtomicU32::new(0);

struct PendingCommandContext<D: Device> {
    slot: usize,
    fence: D::Fence,
    target: u64,
}

/// A fixed set of command contexts cycling Available -> Active -> Pending ->
/// Available.
///
/// Pending contexts are recycled strictly in submission order, and only once
/// the GPU has reached the fence value their submission signalled. When no
/// context is available, acquisition blocks on the oldest pending one.
pub struct ContextPool<D: Device> {
    id: u32,
    contexts: Vec<CommandContextData<D>>,
    states: Vec<SlotState>,
    available: VecDeque<usize>,
    pending: VecDeque<PendingCommandContext<D>>,
}

impl<D: Device> ContextPool<D> {
    pub fn new(device: &D, size: usize) -> Result<Self> {
        let mut contexts = Vec::with_capacity(size);

        for _ in 0..size {
            let allocator = device.create_command_allocator()?;
            let mut list = device.create_command_list(&allocator)?;
            // Lists are created recording; acquisition expects them closed.
            device.close_command_list(&mut list)?;

            contexts.push(CommandContextData {
                allocator,
                list,
                pages: CheckedOutPages::new(),
                resources: Vec::new(),
                last_target: 0,
            });
        }

        Ok(Self {
            id: NEXT_POOL_ID.fetch_add(1, Ordering::Relaxed),
            contexts,
            states: vec![SlotState::Available; size],
            available: (0..size).collect(),
            pending: VecDeque::new(),
        })
    }

    /// Takes a context for recording.
    ///
    /// If no context or no transient page is free, blocks until the oldest
    /// pending submission retires and reuses what it held. The returned
    /// context has a reset command list and one fresh transient page per
    /// shader-visible kind.
    ///
    /// ## Errors
    ///
    /// Returns `Error::PoolExhausted` if every context is active, or if a
    /// descriptor collection has no free page and nothing is pending. In the
    /// latter case the context stays available. Device failures are
    /// propagated.
    pub fn acquire(&mut self, device: &D, descriptors: &mut Descriptors<D>) -> Result<ActiveContext> {
        loop {
            if self.available.is_empty() {
                if self.pending.is_empty() {
                    log::warn!("context pool {}: every context is being recorded", self.id);
                    return Err(Error::PoolExhausted(Exhausted::Contexts));
                }

                log::debug!("context pool {}: no context available, waiting", self.id);
                self.retire_oldest(device, descriptors, true)?;
            }

            let Some(slot) = self.available.pop_front() else {
                return Err(Error::PoolExhausted(Exhausted::Contexts));
            };

            match self.prepare(device, slot, descriptors) {
                Ok(()) => {
                    self.states[slot] = SlotState::Active;
                    log::debug!("context pool {}: acquired context {slot}", self.id);

                    return Ok(ActiveContext {
                        pool: self.id,
                        slot,
                    });
                }
                Err(Error::PoolExhausted(Exhausted::Pages(kind))) if !self.pending.is_empty() => {
                    self.available.push_front(slot);
                    log::debug!("context pool {}: no free {kind:?} page, waiting", self.id);
                    self.retire_oldest(device, descriptors, true)?;
                }
                Err(error) => {
                    self.available.push_front(slot);
                    return Err(error);
                }
            }
        }
    }

    fn prepare(&mut self, device: &D, slot: usize, descriptors: &mut Descriptors<D>) -> Result<()> {
        let context = &mut self.contexts[slot];
        device.reset_command_allocator(&context.allocator)?;
        device.reset_command_list(&mut context.list, &context.allocator)?;

        match descriptors.check_out_pages() {
            Ok(pages) => {
                context.pages = pages;
                Ok(())
            }
            Err(error) => {
                // Leave the list closed, as every available context's is.
                device.close_command_list(&mut context.list)?;
                Err(error)
            }
        }
    }

    /// Closes and executes the context's command list and signals `target` on
    /// `fence` behind it.
    ///
    /// With `wait`, blocks until the GPU is done and returns the context to
    /// the available set immediately. Otherwise the context is queued until
    /// [`Self::recycle_completed`], [`Self::flush`] or an acquisition that
    /// has to wait for it.
    ///
    /// ## Errors
    ///
    /// Returns `Error::NonMonotonicSignal` if `target` does not exceed the
    /// last value requested on `fence`, and `InvalidFree::ContextNotActive`
    /// if the context does not belong to this pool. If the submission is
    /// rejected before reaching the queue, the context is released.
    pub fn submit(
        &mut self,
        device: &D,
        context: ActiveContext,
        fence: &mut Fence<D>,
        target: u64,
        wait: bool,
        descriptors: &mut Descriptors<D>,
    ) -> Result<u64> {
        let slot = self.slot_of(&context)?;

        if target <= fence.last_requested() {
            log::error!(
                "context {slot} submitted with fence value {target} after {}",
                fence.last_requested()
            );
            self.release_slot(device, slot, descriptors)?;
            return Err(Error::NonMonotonicSignal {
                last: fence.last_requested(),
                requested: target,
            });
        }

        if let Err(error) = device.close_command_list(&mut self.contexts[slot].list) {
            self.release_closed(slot, descriptors)?;
            return Err(error.into());
        }

        if let Err(error) = device.execute_command_list(&self.contexts[slot].list) {
            log::error!("context pool {}: context {slot} was not executed: {error}", self.id);
            self.release_closed(slot, descriptors)?;
            return Err(error.into());
        }

        // From here on the GPU may read the context, so it can only be
        // recycled through the fence.
        self.states[slot] = SlotState::Pending;
        self.pending.push_back(PendingCommandContext {
            slot,
            fence: fence.raw().clone(),
            target,
        });

        fence.signal(device, target)?;

        let context = &mut self.contexts[slot];
        context.last_target = target;
        for &page in &context.pages {
            descriptors.collection_mut(page.kind()).mark_used(page, target)?;
        }

        log::debug!("context pool {}: submitted context {slot} at {target}", self.id);

        if wait {
            fence.wait(device, target)?;
            if let Some(index) = self.pending.iter().position(|pending| pending.slot == slot) {
                self.pending.remove(index);
            }
            self.clear(device, slot, fence.value(device), descriptors)?;
        }

        Ok(target)
    }

    /// Returns an unsubmitted context to the pool. Its pages are freed
    /// without waiting since the GPU never saw them.
    ///
    /// ## Errors
    ///
    /// Returns `InvalidFree::ContextNotActive` if the context does not belong
    /// to this pool.
    pub fn release(
        &mut self,
        device: &D,
        context: ActiveContext,
        descriptors: &mut Descriptors<D>,
    ) -> Result<()> {
        let slot = self.slot_of(&context)?;
        self.release_slot(device, slot, descriptors)
    }

    fn release_slot(&mut self, device: &D, slot: usize, descriptors: &mut Descriptors<D>) -> Result<()> {
        let closed = device.close_command_list(&mut self.contexts[slot].list);
        self.release_closed(slot, descriptors)?;
        closed.map_err(Error::from)
    }

    /// Releases a context whose list is already closed but never reached the
    /// queue.
    fn release_closed(&mut self, slot: usize, descriptors: &mut Descriptors<D>) -> Result<()> {
        let context = &mut self.contexts[slot];
        let pages = std::mem::take(&mut context.pages);
        context.resources.clear();
        self.states[slot] = SlotState::Available;
        self.available.push_back(slot);
        log::debug!("context pool {}: released context {slot}", self.id);

        descriptors.free_pages(&pages, u64::MAX)
    }

    /// Recycles every pending context whose submission has retired, oldest
    /// first, without blocking. Returns how many were recycled.
    ///
    /// ## Errors
    ///
    /// Fails if a context's pages or allocator cannot be reset.
    pub fn recycle_completed(&mut self, device: &D, descriptors: &mut Descriptors<D>) -> Result<usize> {
        let mut recycled = 0;
        while self.retire_oldest(device, descriptors, false)?.is_some() {
            recycled += 1;
        }
        Ok(recycled)
    }

    /// Waits for all pending submissions and recycles their contexts.
    ///
    /// ## Errors
    ///
    /// Fails if the device is lost while waiting.
    pub fn flush(&mut self, device: &D, descriptors: &mut Descriptors<D>) -> Result<()> {
        while self.retire_oldest(device, descriptors, true)?.is_some() {}
        Ok(())
    }

    /// Recycles the oldest pending context if its submission has retired, or
    /// after waiting for it when `block` is set. The pending entry is only
    /// removed once the wait has succeeded.
    fn retire_oldest(
        &mut self,
        device: &D,
        descriptors: &mut Descriptors<D>,
        block: bool,
    ) -> Result<Option<usize>> {
        let Some(oldest) = self.pending.front() else {
            return Ok(None);
        };

        if block {
            device.wait_for_value(&oldest.fence, oldest.target)?;
        } else if device.completed_value(&oldest.fence) < oldest.target {
            return Ok(None);
        }

        let completed = device.completed_value(&oldest.fence).max(oldest.target);
        let slot = oldest.slot;
        self.pending.pop_front();

        self.clear(device, slot, completed, descriptors)?;
        Ok(Some(slot))
    }

    /// Returns a retired context's pages and resources and makes it
    /// available.
    fn clear(
        &mut self,
        device: &D,
        slot: usize,
        completed: u64,
        descriptors: &mut Descriptors<D>,
    ) -> Result<()> {
        let context = &mut self.contexts[slot];
        debug_assert!(context.last_target <= completed);

        descriptors.free_pages(&context.pages, completed)?;
        context.pages.clear();
        let dropped = context.resources.len();
        context.resources.clear();

        self.states[slot] = SlotState::Available;
        self.available.push_back(slot);
        log::debug!(
            "context pool {}: recycled context {slot} at {completed}, {dropped} resources dropped",
            self.id
        );

        device.reset_command_allocator(&self.contexts[slot].allocator)?;
        Ok(())
    }

    /// Keeps `resource` alive until the context's next submission retires.
    ///
    /// ## Errors
    ///
    /// Returns `InvalidFree::ContextNotActive` if the context does not belong
    /// to this pool.
    pub fn track(&mut self, context: &ActiveContext, resource: D::Resource) -> Result<()> {
        let slot = self.slot_of(context)?;
        self.contexts[slot].resources.push(resource);
        Ok(())
    }

    /// ## Errors
    ///
    /// Returns `InvalidFree::ContextNotActive` if the context does not belong
    /// to this pool.
    pub fn context(&self, context: &ActiveContext) -> Result<&CommandContextData<D>> {
        let slot = self.slot_of(context)?;
        Ok(&self.contexts[slot])
    }

    /// The context's command list, open for recording.
    ///
    /// ## Errors
    ///
    /// Returns `InvalidFree::ContextNotActive` if the context does not belong
    /// to this pool.
    pub fn command_list_mut(&mut self, context: &ActiveContext) -> Result<&mut D::CommandList> {
        let slot = self.slot_of(context)?;
        Ok(&mut self.contexts[slot].list)
    }

    fn slot_of(&self, context: &ActiveContext) -> Result<usize> {
        if context.pool != self.id || self.states.get(context.slot) != Some(&SlotState::Active) {
            let error = InvalidFree::ContextNotActive(context.slot);
            log::error!("context pool {}: {error}", self.id);
            return Err(Error::InvalidFree(error));
        }

        Ok(context.slot)
    }

    #[must_use]
    pub fn size(&self) -> usize {
        self.contexts.len()
    }

    #[must_use]
    pub fn available_count(&self) -> usize {
        self.available.len()
    }

    #[must_use]
    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }

    #[must_use]
    pub fn active_count(&self) -> usize {
        self.states
            .iter()
            .filter(|state| **state == SlotState::Active)
            .count()
    }

    /// The fence values of the pending submissions, oldest first.
    pub fn pending_targets(&self) -> impl Iterator<Item = u64> + '_ {
        self.pending.iter().map(|pending| pending.target)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        config::DescriptorConfig,
        device::host::{HostBuffer, HostCommand, HostDevice, Retirement},
        HeapKind,
    };

    struct Harness {
        device: HostDevice,
        descriptors: Descriptors<HostDevice>,
        pool: ContextPool<HostDevice>,
        fence: Fence<HostDevice>,
    }

    impl Harness {
        fn new(retirement: Retirement, size: usize) -> Self {
            let device = HostDevice::with_retirement(retirement);
            let descriptors = Descriptors::new(&device, &DescriptorConfig::default()).unwrap();
            let pool = ContextPool::new(&device, size).unwrap();
            let fence = Fence::new(&device, 0).unwrap();

            Self {
                device,
                descriptors,
                pool,
                fence,
            }
        }

        fn acquire(&mut self) -> Result<ActiveContext> {
            self.pool.acquire(&self.device, &mut self.descriptors)
        }

        fn submit(&mut self, context: ActiveContext, wait: bool) -> Result<u64> {
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

        fn assert_conserved(&self) {
            assert_eq!(
                self.pool.available_count() + self.pool.pending_count() + self.pool.active_count(),
                self.pool.size()
            );
        }
    }

    #[test]
    fn fourth_acquisition_waits_for_the_first_submission() {
        let mut h = Harness::new(Retirement::OnWait, 3);

        let buffer = h.device.create_upload_buffer(64).unwrap();

        let mut slots = Vec::new();
        for expected in 1..=3 {
            let context = h.acquire().unwrap();
            slots.push(context.slot());

            if expected == 1 {
                h.pool.track(&context, buffer.clone()).unwrap();
                for kind in [HeapKind::CbvSrvUav, HeapKind::Sampler] {
                    let page = h.pool.context(&context).unwrap().page(kind).unwrap();
                    h.descriptors
                        .collection_mut(kind)
                        .allocate_from_page(page, 8)
                        .unwrap();
                }
            }

            assert_eq!(h.submit(context, false).unwrap(), expected);
            h.assert_conserved();
        }

        assert_eq!(h.pool.pending_count(), 3);
        assert_eq!(h.fence.value(&h.device), 0);
        assert_eq!(buffer.holders(), 2);

        let context = h.acquire().unwrap();
        assert_eq!(context.slot(), slots[0]);
        assert_eq!(h.fence.value(&h.device), 1);
        assert!(h.fence.value(&h.device) < 2, "must not wait longer than needed");
        assert_eq!(h.pool.pending_targets().collect::<Vec<_>>(), [2, 3]);
        h.assert_conserved();

        let data = h.pool.context(&context).unwrap();
        assert_eq!(data.tracked_resources(), 0);
        assert_eq!(buffer.holders(), 1);
        for kind in [HeapKind::CbvSrvUav, HeapKind::Sampler] {
            let page = data.page(kind).unwrap();
            assert_eq!(h.descriptors.collection(kind).page(page.index()).unwrap().top(), 0);
        }

        h.pool.release(&h.device, context, &mut h.descriptors).unwrap();
    }

    #[test]
    fn recycling_follows_submission_order() {
        let mut h = Harness::new(Retirement::Manual, 3);

        let mut order = Vec::new();
        for _ in 0..3 {
            let context = h.acquire().unwrap();
            order.push(context.slot());
            h.submit(context, false).unwrap();
        }

        // Nothing retired yet.
        assert_eq!(h.pool.recycle_completed(&h.device, &mut h.descriptors).unwrap(), 0);

        // Retire the first two submissions only.
        h.device.retire_until(h.fence.raw(), 2);
        assert_eq!(h.pool.recycle_completed(&h.device, &mut h.descriptors).unwrap(), 2);
        h.assert_conserved();

        let a = h.acquire().unwrap();
        let b = h.acquire().unwrap();
        assert_eq!([a.slot(), b.slot()], [order[0], order[1]]);

        h.pool.release(&h.device, a, &mut h.descriptors).unwrap();
        h.pool.release(&h.device, b, &mut h.descriptors).unwrap();

        h.device.retire_all();
        h.pool.flush(&h.device, &mut h.descriptors).unwrap();
        assert_eq!(h.pool.available_count(), 3);
    }

    #[test]
    fn every_context_active_is_backpressure() {
        let mut h = Harness::new(Retirement::OnWait, 2);

        let a = h.acquire().unwrap();
        let b = h.acquire().unwrap();

        let error = h.acquire().unwrap_err();
        assert!(matches!(error, Error::PoolExhausted(Exhausted::Contexts)));
        assert!(error.is_backpressure());
        h.assert_conserved();

        h.pool.release(&h.device, a, &mut h.descriptors).unwrap();
        h.submit(b, true).unwrap();
        assert_eq!(h.pool.available_count(), 2);
    }

    #[test]
    fn page_exhaustion_leaves_the_context_available() {
        let device = HostDevice::new();
        let mut config = DescriptorConfig::default();
        config.sampler.page_count = 1;
        let mut descriptors = Descriptors::new(&device, &config).unwrap();
        let mut pool = ContextPool::new(&device, 2).unwrap();

        let first = pool.acquire(&device, &mut descriptors).unwrap();
        let error = pool.acquire(&device, &mut descriptors).unwrap_err();
        assert!(matches!(
            error,
            Error::PoolExhausted(Exhausted::Pages(HeapKind::Sampler))
        ));

        assert_eq!(pool.available_count(), 1);
        assert_eq!(pool.active_count(), 1);

        // The cbv page taken before the sampler failure was returned.
        let cbv = descriptors.collection(HeapKind::CbvSrvUav);
        assert_eq!(cbv.used_page_count(), 1);

        pool.release(&device, first, &mut descriptors).unwrap();
        let again = pool.acquire(&device, &mut descriptors).unwrap();
        pool.release(&device, again, &mut descriptors).unwrap();
    }

    #[test]
    fn pages_are_held_until_the_submission_retires() {
        let mut h = Harness::new(Retirement::Manual, 2);

        let context = h.acquire().unwrap();
        let page = h.pool.context(&context).unwrap().page(HeapKind::CbvSrvUav).unwrap();
        h.descriptors
            .collection_mut(HeapKind::CbvSrvUav)
            .allocate_from_page(page, 16)
            .unwrap();
        h.submit(context, false).unwrap();

        let cbv = h.descriptors.collection(HeapKind::CbvSrvUav);
        assert!(cbv.is_checked_out(page));

        h.device.retire_all();
        h.pool.recycle_completed(&h.device, &mut h.descriptors).unwrap();

        let cbv = h.descriptors.collection(HeapKind::CbvSrvUav);
        assert!(!cbv.is_checked_out(page));
        assert_eq!(cbv.page(page.index()).unwrap().top(), 0);
    }

    #[test]
    fn resources_are_dropped_after_retirement() {
        let mut h = Harness::new(Retirement::Manual, 2);
        let buffer: HostBuffer = h.device.create_upload_buffer(256).unwrap();

        let context = h.acquire().unwrap();
        h.pool.track(&context, buffer.clone()).unwrap();
        assert_eq!(h.pool.context(&context).unwrap().tracked_resources(), 1);
        h.submit(context, false).unwrap();
        assert_eq!(buffer.holders(), 2);

        h.pool.recycle_completed(&h.device, &mut h.descriptors).unwrap();
        assert_eq!(buffer.holders(), 2, "still in flight");

        h.device.retire_all();
        h.pool.recycle_completed(&h.device, &mut h.descriptors).unwrap();
        assert_eq!(buffer.holders(), 1);
    }

    #[test]
    fn recorded_commands_reach_the_queue() {
        let mut h = Harness::new(Retirement::OnWait, 1);

        let context = h.acquire().unwrap();
        h.pool
            .command_list_mut(&context)
            .unwrap()
            .record(HostCommand::Marker("draw".into()))
            .unwrap();
        h.submit(context, true).unwrap();

        assert_eq!(h.device.executed_commands(), [HostCommand::Marker("draw".into())]);

        // The allocator was reset and the list reopened empty.
        let context = h.acquire().unwrap();
        let list = h.pool.context(&context).unwrap().command_list();
        assert!(list.is_open());
        assert!(list.commands().is_empty());
        h.pool.release(&h.device, context, &mut h.descriptors).unwrap();
    }

    #[test]
    fn stale_tokens_are_rejected() {
        let mut h = Harness::new(Retirement::OnWait, 1);
        let mut other = Harness::new(Retirement::OnWait, 1);

        let foreign = other.acquire().unwrap();
        assert!(matches!(
            h.pool.track(&foreign, h.device.create_upload_buffer(4).unwrap()),
            Err(Error::InvalidFree(InvalidFree::ContextNotActive(0)))
        ));

        let context = h.acquire().unwrap();
        let duplicate = context.claim();
        h.submit(context, true).unwrap();
        assert!(matches!(
            h.submit(duplicate, false),
            Err(Error::InvalidFree(InvalidFree::ContextNotActive(0)))
        ));
        h.assert_conserved();

        other.pool.release(&other.device, foreign, &mut other.descriptors).unwrap();
    }

    #[test]
    fn non_monotonic_target_releases_the_context() {
        let mut h = Harness::new(Retirement::OnWait, 1);

        let context = h.acquire().unwrap();
        h.submit(context, true).unwrap();

        let context = h.acquire().unwrap();
        let error = h
            .pool
            .submit(&h.device, context, &mut h.fence, 1, false, &mut h.descriptors)
            .unwrap_err();

        assert!(matches!(
            error,
            Error::NonMonotonicSignal {
                last: 1,
                requested: 1
            }
        ));
        assert_eq!(h.pool.available_count(), 1);
        assert_eq!(h.descriptors.collection(HeapKind::CbvSrvUav).used_page_count(), 0);
    }

    #[test]
    fn page_exhaustion_waits_for_the_oldest_submission() {
        let device = HostDevice::new();
        let mut config = DescriptorConfig::default();
        config.sampler.page_count = 2;
        let mut descriptors = Descriptors::new(&device, &config).unwrap();
        let mut pool = ContextPool::new(&device, 3).unwrap();
        let mut fence = Fence::new(&device, 0).unwrap();

        for target in 1..=2 {
            let context = pool.acquire(&device, &mut descriptors).unwrap();
            pool.submit(&device, context, &mut fence, target, false, &mut descriptors)
                .unwrap();
        }
        assert_eq!(pool.available_count(), 1);
        assert_eq!(pool.pending_count(), 2);

        let third = pool.acquire(&device, &mut descriptors).unwrap();
        assert_eq!(fence.value(&device), 1);
        assert_eq!(pool.pending_targets().collect::<Vec<_>>(), [2]);
        assert_eq!(pool.active_count(), 1);

        pool.release(&device, third, &mut descriptors).unwrap();
        pool.flush(&device, &mut descriptors).unwrap();
        assert_eq!(pool.available_count(), 3);
    }

    #[test]
    fn rejected_execution_releases_the_context() {
        let mut h = Harness::new(Retirement::Manual, 2);

        let context = h.acquire().unwrap();
        h.device.lose_device();

        assert!(matches!(
            h.submit(context, false),
            Err(Error::Device(crate::DeviceError::Lost))
        ));
        assert_eq!(h.pool.active_count(), 0);
        assert_eq!(h.pool.available_count(), 2);
        h.assert_conserved();
    }
}
