//! Froxel volumes and their per-frame state
//!
//! Owns the two transient media volumes, the scattering history pair and the
//! integrated volume. Exactly one history volume is written each frame; the
//! other supplies last frame's result and the roles swap after every frame.

pub mod fog;
pub mod froxel;
pub(crate) mod kernels;

use std::collections::HashMap;

use glam::{UVec2, UVec3};
use helio_gpu::{GraphicsContext, ResourceId, TextureDesc, ViewDesc, ViewPoolKind, ViewRange};

use crate::config::RendererConfig;
use crate::constants::{LightScatteringConstants, VolumetricFrameConstants, VolumetricsConstants};
use crate::passes::{BoundResource, FrameResource};
use crate::{Error, Result};

pub use fog::{evaluate_medium, henyey_greenstein, GlobalFog, Medium};
pub use froxel::{halton, jitter_offset, FroxelMapping};

/// Volumes in view-slot order; each gets an SRV and a UAV
const VOLUMES: [(&str, wgpu::TextureFormat); 5] = [
    ("VBuffer A", wgpu::TextureFormat::Rgba16Float),
    ("VBuffer B", wgpu::TextureFormat::Rgba16Float),
    ("Light Scattering 0", wgpu::TextureFormat::Rgba16Float),
    ("Light Scattering 1", wgpu::TextureFormat::Rgba16Float),
    ("Integrated Scattering", wgpu::TextureFormat::Rgba16Float),
];

pub struct VolumetricRenderer {
    mapping: FroxelMapping,
    volumes: [ResourceId; 5],
    /// SRV then UAV for each volume
    views: ViewRange,
    /// History volume written this frame (0 or 1)
    current: usize,
    history_valid: bool,
    history_weight: f32,
    use_temporal_reprojection: bool,
    jitter_multiplier: f32,
    flags: u32,
}

impl VolumetricRenderer {
    pub fn new(ctx: &mut GraphicsContext, config: &RendererConfig) -> Result<Self> {
        config.validate()?;
        let resolution = config.froxel_resolution;
        let device = ctx.device().clone();
        let volumes = VOLUMES
            .iter()
            .map(|&(label, format)| {
                device.create_texture(
                    TextureDesc::d3(
                        label,
                        resolution,
                        format,
                        wgpu::TextureUsages::STORAGE_BINDING | wgpu::TextureUsages::TEXTURE_BINDING,
                    ),
                    FrameResource::VBufferA.boundary_state(),
                )
            })
            .collect::<helio_gpu::Result<Vec<_>>>()?;
        let volumes: [ResourceId; 5] = volumes
            .try_into()
            .map_err(|_| Error::Config("froxel volume count mismatch".into()))?;

        let views = ctx.views_mut().allocate(ViewPoolKind::ShaderResource, 10)?;
        for (i, id) in volumes.iter().enumerate() {
            let i = i as u32;
            ctx.views_mut().write_view(views.handle(i * 2), ViewDesc::ShaderResource(*id))?;
            ctx.views_mut().write_view(views.handle(i * 2 + 1), ViewDesc::UnorderedAccess(*id))?;
        }

        log::info!(
            "Froxel grid {}x{}x{} over {} units, temporal reprojection {}",
            resolution.x,
            resolution.y,
            resolution.z,
            config.max_volume_distance,
            if config.use_temporal_reprojection { "on" } else { "off" }
        );

        Ok(Self {
            mapping: FroxelMapping::new(resolution, config.max_volume_distance),
            volumes,
            views,
            current: 0,
            history_valid: false,
            history_weight: config.history_weight,
            use_temporal_reprojection: config.use_temporal_reprojection,
            jitter_multiplier: config.light_scattering_jitter_multiplier,
            flags: config.volume_flags.bits(),
        })
    }

    pub fn mapping(&self) -> FroxelMapping {
        self.mapping
    }

    pub fn resolution(&self) -> UVec3 {
        self.mapping.resolution
    }

    /// Volume written by the scattering stage this frame
    pub fn scattering_volume(&self) -> ResourceId {
        self.volumes[2 + self.current]
    }

    pub fn history_volume(&self) -> ResourceId {
        self.volumes[2 + (self.current ^ 1)]
    }

    pub fn integrated_volume(&self) -> ResourceId {
        self.volumes[4]
    }

    pub fn media_volumes(&self) -> (ResourceId, ResourceId) {
        (self.volumes[0], self.volumes[1])
    }

    pub fn history_valid(&self) -> bool {
        self.history_valid
    }

    pub fn set_history_weight(&mut self, weight: f32) {
        self.history_weight = weight.clamp(0.0, 1.0);
    }

    pub fn set_temporal_reprojection(&mut self, enabled: bool) {
        if enabled != self.use_temporal_reprojection {
            self.use_temporal_reprojection = enabled;
            self.history_valid = false;
        }
    }

    /// Drops the history so the next frame starts from its own sample
    pub fn reset_history(&mut self) {
        self.history_valid = false;
    }

    pub fn frame_constants(
        &self,
        fog: &GlobalFog,
        frame_index_mod16: u32,
        depth_size: UVec2,
        prev_depth_size: UVec2,
    ) -> VolumetricFrameConstants {
        let jitter = if self.use_temporal_reprojection {
            jitter_offset(frame_index_mod16, self.jitter_multiplier)
        } else {
            glam::Vec3::ZERO
        };
        VolumetricFrameConstants {
            volume: VolumetricsConstants {
                volume_resolution: self.mapping.resolution.to_array(),
                max_volume_distance: self.mapping.max_distance,
                use_temporal_reprojection: self.use_temporal_reprojection as u32,
                light_scattering_jitter_multiplier: self.jitter_multiplier,
                history_weight: self.history_weight,
                flags: self.flags,
                jitter: jitter.to_array(),
                history_valid: self.history_valid as u32,
            },
            scattering: LightScatteringConstants {
                depth_buffer_dimensions: depth_size.to_array(),
                prev_depth_buffer_dimensions: prev_depth_size.to_array(),
            },
            fog: fog.to_gpu(),
        }
    }

    pub fn bind(&self, resources: &mut HashMap<FrameResource, BoundResource>) {
        let slots = [
            (FrameResource::VBufferA, 0),
            (FrameResource::VBufferB, 1),
            (FrameResource::Scattering, 2 + self.current),
            (FrameResource::ScatteringHistory, 2 + (self.current ^ 1)),
            (FrameResource::IntegratedVolume, 4),
        ];
        for (resource, slot) in slots {
            let mut bound = BoundResource::new(self.volumes[slot]);
            bound.srv = Some(self.views.handle(slot as u32 * 2));
            bound.uav = Some(self.views.handle(slot as u32 * 2 + 1));
            resources.insert(resource, bound);
        }
    }

    /// Swaps the history roles once a frame has been recorded
    pub fn end_frame(&mut self) {
        self.current ^= 1;
        self.history_valid = true;
    }

    pub fn release(&self, ctx: &mut GraphicsContext) -> Result<()> {
        ctx.views_mut().free(self.views)?;
        for id in self.volumes {
            ctx.destroy_deferred(id);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use helio_gpu::GraphicsConfig;

    fn renderer(temporal: bool) -> (GraphicsContext, VolumetricRenderer) {
        let mut ctx = GraphicsContext::new(GraphicsConfig {
            width: 16,
            height: 16,
            ..Default::default()
        })
        .unwrap();
        let config = RendererConfig {
            froxel_resolution: UVec3::new(16, 8, 8),
            use_temporal_reprojection: temporal,
            ..Default::default()
        };
        let volumetrics = VolumetricRenderer::new(&mut ctx, &config).unwrap();
        (ctx, volumetrics)
    }

    #[test]
    fn history_roles_swap_every_frame() {
        let (_ctx, mut volumetrics) = renderer(true);
        let (written, history) = (volumetrics.scattering_volume(), volumetrics.history_volume());
        assert!(!volumetrics.history_valid());
        volumetrics.end_frame();
        assert_eq!(volumetrics.scattering_volume(), history);
        assert_eq!(volumetrics.history_volume(), written);
        assert!(volumetrics.history_valid());
    }

    #[test]
    fn jitter_only_with_temporal_reprojection() {
        let (_ctx, volumetrics) = renderer(false);
        let constants = volumetrics.frame_constants(&GlobalFog::default(), 3, UVec2::ONE, UVec2::ONE);
        assert_eq!(constants.volume.jitter, [0.0; 3]);

        let (_ctx, volumetrics) = renderer(true);
        let constants = volumetrics.frame_constants(&GlobalFog::default(), 3, UVec2::ONE, UVec2::ONE);
        assert_ne!(constants.volume.jitter, [0.0; 3]);
        assert_eq!(constants.volume.history_valid, 0);
    }

    #[test]
    fn every_volume_resolves_through_its_own_views() {
        let (ctx, volumetrics) = renderer(true);
        let mut resources = HashMap::new();
        volumetrics.bind(&mut resources);
        assert_eq!(resources.len(), VOLUMES.len());

        let mut ids: Vec<_> = resources.values().map(|b| b.id).collect();
        ids.sort();
        ids.dedup();
        assert_eq!(ids.len(), VOLUMES.len());
        for bound in resources.values() {
            assert_eq!(ctx.views().resolve(bound.srv.unwrap()).unwrap(), bound.id);
            assert_eq!(ctx.views().resolve(bound.uav.unwrap()).unwrap(), bound.id);
            assert_eq!(ctx.device().texture_desc(bound.id).unwrap().size.depth_or_array_layers, 8);
        }
    }

    #[test]
    fn misaligned_grid_is_rejected() {
        let mut ctx = GraphicsContext::new(GraphicsConfig::default()).unwrap();
        let config = RendererConfig {
            froxel_resolution: UVec3::new(64, 36, 32),
            ..Default::default()
        };
        assert!(VolumetricRenderer::new(&mut ctx, &config).is_err());
    }
}
