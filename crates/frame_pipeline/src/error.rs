use crate::{config::ConfigError, device::DeviceError, HeapKind};

pub type Result<T, E = Error> = std::result::Result<T, E>;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// A heap or page does not have room for the request. The descriptor
    /// configuration is too small for the demand placed on it.
    #[error("{kind:?} allocation of {requested} descriptors exceeds the {available} remaining")]
    CapacityExceeded {
        kind: HeapKind,
        requested: u32,
        available: u32,
    },
    /// Every command context or descriptor page is in use. The caller should
    /// wait or drop the unit of work.
    #[error("{0}")]
    PoolExhausted(Exhausted),
    /// A page or context was returned that is not checked out, or while the
    /// GPU may still read it.
    #[error("invalid free: {0}")]
    InvalidFree(InvalidFree),
    /// The allocation points into a page that has been recycled since it was
    /// made.
    #[error("{kind:?} allocation at index {index} refers to a recycled page")]
    StaleAllocation { kind: HeapKind, index: u32 },
    /// The allocation lives in a heap that cannot be addressed by shaders.
    #[error("{0:?} descriptors in this region have no GPU handle")]
    NotShaderVisible(HeapKind),
    /// The fence was asked to signal a value it has already passed.
    #[error("fence signal {requested} does not follow {last}")]
    NonMonotonicSignal { last: u64, requested: u64 },
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error(transparent)]
    Device(#[from] DeviceError),
}

impl Error {
    /// Returns true for the conditions a frame loop is expected to absorb by
    /// waiting or skipping work; everything else is a bug or a fatal device
    /// failure.
    #[must_use]
    pub fn is_backpressure(&self) -> bool {
        matches!(self, Error::PoolExhausted(_))
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, thiserror::Error)]
pub enum Exhausted {
    #[error("all command contexts are being recorded")]
    Contexts,
    #[error("no free {0:?} descriptor pages")]
    Pages(HeapKind),
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, thiserror::Error)]
pub enum InvalidFree {
    #[error("{kind:?} page {index} is not checked out")]
    PageNotCheckedOut { kind: HeapKind, index: u32 },
    #[error(
        "{kind:?} page {index} was last used by submission {last_use} but only {completed} has completed"
    )]
    PageInFlight {
        kind: HeapKind,
        index: u32,
        last_use: u64,
        completed: u64,
    },
    #[error("page {index} does not belong to the {collection:?} collection")]
    ForeignPage { collection: HeapKind, index: u32 },
    #[error("command context {0} is not active in this pool")]
    ContextNotActive(usize),
}
