//! Helio - deferred rendering with volumetric light transport
//!
//! Umbrella crate over the explicit GPU layer and the frame pipeline built on it.

pub use helio_gpu as gpu;
pub use helio_volumetrics as volumetrics;

pub mod prelude {
    pub use crate::gpu::{GraphicsConfig, GraphicsContext, QueueKind, ResourceState};
    pub use crate::volumetrics::{
        Camera, DirectionalLight, FrameResource, FrameTiming, Geometry, GlobalFog, LightSet, Material, PointLight,
        Renderer, RendererConfig, Scene, ShadowSetup, VolumeFlags,
    };
    pub use glam;
}
