//! Helio GPU - explicit frame-pipeline layer
//!
//! An explicit GPU model in the style of modern low-level APIs:
//!
//! - Resources carry a single tracked [`ResourceState`]; every use must be
//!   preceded by an explicit [`ResourceBarrier`]
//! - Views are carved out of four fixed-capacity pools and freed with a
//!   frame-delayed reclaim ([`ViewAllocator`])
//! - Queues expose monotonic completion markers, blocking waits and
//!   queue-to-queue waits ([`Queue`])
//! - A ring of frame slots lets the CPU record ahead of the GPU ([`FrameRing`])
//!
//! Execution happens in-process on a software [`Device`] that validates every
//! barrier and access the way a debug layer would. Work runs lazily whenever
//! the device is polled or a CPU wait is performed.

pub mod command;
pub mod context;
pub mod descriptor;
pub mod device;
pub mod frame;
pub mod queue;
pub mod resource;
pub mod state;

pub use command::{CommandList, Kernel, RecordedCommand, ResourceAccess, WorkKind};
pub use context::{GraphicsConfig, GraphicsContext, ViewPoolCapacities};
pub use descriptor::{SamplerDesc, ViewAllocator, ViewDesc, ViewHandle, ViewPool, ViewPoolKind, ViewRange};
pub use device::{Device, ExecutionRecord};
pub use frame::{FrameRing, FrameSlot};
pub use queue::{Queue, QueueKind};
pub use resource::{
    BufferData, BufferDesc, ResourceData, ResourceId, ResourceMemory, TextureData, TextureDesc,
};
pub use state::{ResourceBarrier, ResourceState};

/// Result type for GPU layer operations
pub type Result<T> = std::result::Result<T, Error>;

/// Errors raised by the GPU layer
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("{pool:?} view pool exhausted: requested {requested}, {available} free")]
    Exhausted {
        pool: ViewPoolKind,
        requested: u32,
        available: u32,
    },

    #[error("Invalid resource state on '{resource}': expected {expected}, found {actual}")]
    InvalidTransition {
        resource: String,
        expected: ResourceState,
        actual: ResourceState,
    },

    #[error("Unknown resource {0:?}")]
    UnknownResource(ResourceId),

    #[error("Device removed: {reason}")]
    DeviceRemoved { reason: String },

    #[error("Recording error: {0}")]
    Recording(String),
}

impl Error {
    /// True for errors that leave the device unusable
    pub fn is_fatal(&self) -> bool {
        matches!(self, Error::DeviceRemoved { .. } | Error::Config(_))
    }
}
