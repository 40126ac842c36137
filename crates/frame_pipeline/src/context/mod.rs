//! Command contexts and the pool that cycles them through the GPU.
//!
//! A context is a command allocator and list, plus the transient descriptor
//! pages and resources the recorded commands refer to. Once submitted, none
//! of it may be touched until the fence value the submission signals has been
//! reached.

use crate::{descriptors::CheckedOutPages, descriptors::PageId, device::Device, HeapKind};

mod pool;

pub use pool::ContextPool;

/// The per-slot state of a pooled command context.
pub struct CommandContextData<D: Device> {
    allocator: D::CommandAllocator,
    list: D::CommandList,
    pages: CheckedOutPages,
    /// Kept alive until the submission that uses them retires.
    resources: Vec<D::Resource>,
    /// The fence value of the last submission of this context, 0 if never
    /// submitted.
    last_target: u64,
}

impl<D: Device> CommandContextData<D> {
    /// The transient page checked out for `kind`, if any.
    #[must_use]
    pub fn page(&self, kind: HeapKind) -> Option<PageId> {
        self.pages.iter().copied().find(|page| page.kind() == kind)
    }

    #[must_use]
    pub fn pages(&self) -> &[PageId] {
        &self.pages
    }

    #[must_use]
    pub fn command_list(&self) -> &D::CommandList {
        &self.list
    }

    #[must_use]
    pub fn tracked_resources(&self) -> usize {
        self.resources.len()
    }

    #[must_use]
    pub fn last_target(&self) -> u64 {
        self.last_target
    }
}

/// Names a context that has been acquired and not yet submitted or released.
///
/// Not `Clone`: a context can be submitted once.
#[derive(Debug, PartialEq, Eq)]
#[must_use = "an acquired context must be submitted or released"]
pub struct ActiveContext {
    pool: u32,
    slot: usize,
}

impl ActiveContext {
    /// The pool slot this context occupies.
    #[must_use]
    pub fn slot(&self) -> usize {
        self.slot
    }

    /// A second token for the same slot, for the recording guard which has
    /// to hand its token on when it is consumed.
    pub(crate) fn claim(&self) -> Self {
        Self {
            pool: self.pool,
            slot: self.slot,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum SlotState {
    Available,
    Active,
    Pending,
}
