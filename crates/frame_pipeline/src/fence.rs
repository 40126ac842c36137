use std::cell::Cell;

use crate::{device::Device, Error, Result};

/// A monotonic CPU/GPU synchronization counter.
///
/// The CPU asks the queue to signal increasing values behind submitted work,
/// and observes how far the GPU has got with [`Fence::value`]. Values only
/// ever move forward in both directions.
pub struct Fence<D: Device> {
    raw: D::Fence,
    last_requested: u64,
    last_completed: Cell<u64>,
}

impl<D: Device> Fence<D> {
    pub fn new(device: &D, initial_value: u64) -> Result<Self> {
        Ok(Self {
            raw: device.create_fence(initial_value)?,
            last_requested: initial_value,
            last_completed: Cell::new(initial_value),
        })
    }

    /// The value the next call to [`Fence::signal_next`] will request.
    #[must_use]
    pub fn next_value(&self) -> u64 {
        self.last_requested + 1
    }

    #[must_use]
    pub fn last_requested(&self) -> u64 {
        self.last_requested
    }

    /// Asks the queue to signal `value` once all work submitted before this
    /// call has retired.
    ///
    /// ## Errors
    ///
    /// Returns `Error::NonMonotonicSignal` if `value` does not exceed the last
    /// requested value, or a device error if the signal could not be queued.
    pub fn signal(&mut self, device: &D, value: u64) -> Result<()> {
        if value <= self.last_requested {
            log::error!(
                "fence signal {} requested after {}",
                value,
                self.last_requested
            );
            return Err(Error::NonMonotonicSignal {
                last: self.last_requested,
                requested: value,
            });
        }

        device.signal(&self.raw, value)?;
        self.last_requested = value;
        Ok(())
    }

    /// Signals the next value in sequence and returns it.
    ///
    /// ## Errors
    ///
    /// Fails if the device cannot queue the signal.
    pub fn signal_next(&mut self, device: &D) -> Result<u64> {
        let value = self.next_value();
        self.signal(device, value)?;
        Ok(value)
    }

    /// Polls the value the GPU has reached. Never blocks.
    pub fn value(&self, device: &D) -> u64 {
        let observed = self
            .last_completed
            .get()
            .max(device.completed_value(&self.raw));
        self.last_completed.set(observed);
        observed
    }

    pub fn is_complete(&self, device: &D, value: u64) -> bool {
        value <= self.last_completed.get() || value <= self.value(device)
    }

    /// Blocks until the GPU reaches `value`. Returns immediately if it
    /// already has.
    ///
    /// ## Errors
    ///
    /// Fails if the device is lost while waiting.
    pub fn wait(&self, device: &D, value: u64) -> Result<()> {
        if self.is_complete(device, value) {
            return Ok(());
        }

        log::trace!("waiting for fence value {value}");
        device.wait_for_value(&self.raw, value)?;
        self.last_completed.set(self.last_completed.get().max(value));
        Ok(())
    }

    /// Waits for everything signalled so far.
    ///
    /// ## Errors
    ///
    /// Fails if the device is lost while waiting.
    pub fn wait_idle(&self, device: &D) -> Result<()> {
        self.wait(device, self.last_requested)
    }

    #[must_use]
    pub fn raw(&self) -> &D::Fence {
        &self.raw
    }
}
