//! Descriptor allocation and frame-pipelined command submission for explicit
//! GPU APIs.
//!
//! The CPU records frame N+1 while the GPU executes frame N. Everything the
//! GPU may still read (command allocators, transient descriptor pages, upload
//! buffers) is held by the command context that recorded it, and is only
//! reset once the fence value signalled behind that context's submission has
//! been reached.
//!
//! ## Goals
//!
//! - Bump-allocated descriptor ranges never exceed their heap.
//! - Transient descriptors are never reused while the GPU may read them.
//! - Exhaustion blocks or reports back instead of corrupting state.
//! - No globals. The device is injected, and tests run on the software
//!   [`device::host::HostDevice`].
//!
//! ## Non-goals
//!
//! - Rendering algorithms, shading models, asset formats.
//! - Windowing and presentation.

pub mod backend;
pub mod config;
pub mod context;
pub mod descriptors;
pub mod device;
pub mod fence;

mod error;

pub use backend::{Backend, Recording};
pub use config::{Config, ConfigError, DescriptorConfig, HeapConfig, PowerPreference};
pub use context::{ActiveContext, ContextPool};
pub use descriptors::{DescriptorAllocation, DescriptorSlot, Descriptors};
pub use device::{Device, DeviceError, HeapKind};
pub use error::{Error, Exhausted, InvalidFree, Result};
pub use fence::Fence;
