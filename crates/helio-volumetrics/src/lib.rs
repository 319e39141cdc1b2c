//! Helio Volumetrics - deferred frame pipeline with froxel light transport
//!
//! Runs a fixed sequence of passes against the explicit GPU layer in
//! `helio-gpu`:
//!
//! - Shadow: sun depth plus an optional blurred exponential shadow map
//! - Geometry: G-buffer and depth, double-buffered across frames
//! - Skybox: environment cube wherever depth is at the far plane
//! - Lighting: compute-shaded direct and image-based lighting
//! - Volumetric: density, temporally reprojected scattering, integration
//!   and compositing over a frustum-aligned grid
//! - Tonemap: in-place exposure and display mapping
//!
//! Every pass declares the resource states it expects and leaves, so the
//! order can be audited without recording a frame.
//!
//! Passes record kernels that the in-process device from `helio-gpu`
//! executes on the CPU when their queue is drained. `wgpu` supplies only
//! the descriptor vocabulary (formats, usages, dimensions); no adapter or
//! GPU device is ever opened.

pub mod camera;
pub mod config;
pub mod constants;
pub mod environment;
pub mod gbuffer;
pub mod lights;
pub mod passes;
pub mod scene;
pub mod volumetric;

mod raster;
mod renderer;

pub use camera::{Camera, FrameTiming, PassConstantsBuilder};
pub use config::{RendererConfig, ShadowSetup, VolumeFlags, ESM_EXPONENT, GROUP_SIZE};
pub use environment::EnvironmentMaps;
pub use gbuffer::GBuffer;
pub use lights::{DirectionalLight, LightSet, PointLight, PointLightHandle};
pub use passes::{audit_pass_order, FramePass, FrameResource, TransitionAudit};
pub use renderer::{average_luminance, Renderer};
pub use scene::{Geometry, GeometryHandle, Instance, InstanceHandle, Material, MaterialHandle, Scene};
pub use volumetric::{GlobalFog, VolumetricRenderer};

/// Result type for pipeline operations
pub type Result<T> = std::result::Result<T, Error>;

/// Errors raised while building or running the pipeline
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error(transparent)]
    Gpu(#[from] helio_gpu::Error),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Capacity exceeded: {0}")]
    Capacity(String),

    #[error("Pass '{pass}': {message}")]
    Pass { pass: String, message: String },

    #[error("Scene error: {0}")]
    Scene(String),
}

impl Error {
    /// True when the device is gone and nothing further can be submitted
    pub fn is_device_removed(&self) -> bool {
        matches!(self, Error::Gpu(helio_gpu::Error::DeviceRemoved { .. }))
    }
}
