//! Directional shadow pass
//!
//! Renders depth from the sun's orthographic camera, then optionally builds
//! a quarter-resolution exponential shadow map blurred with a separable
//! ping-pong filter.

use std::sync::Arc;

use glam::{Mat4, UVec3, Vec3, Vec4};
use helio_gpu::{Kernel, ResourceAccess, ResourceId, ResourceMemory, ResourceState, Result as GpuResult, TextureData};

use super::geometry::{for_each_world_triangle, vertex_count};
use super::{FramePass, FrameResource, PassContext, StateDeclaration};
use crate::config::group_count;
use crate::constants::LightingConstants;
use crate::raster::rasterize_triangle;
use crate::scene::DrawList;
use crate::Result;

const ESM_BLUR_WEIGHTS: [f32; 5] = [1.0 / 16.0, 4.0 / 16.0, 6.0 / 16.0, 4.0 / 16.0, 1.0 / 16.0];

pub struct ShadowPass;

impl FramePass for ShadowPass {
    fn name(&self) -> &str {
        "shadow"
    }

    fn declare_states(&self, states: &mut StateDeclaration) {
        use ResourceState::*;
        states
            .transition(FrameResource::ShadowMap, NonPixelShaderResource, NonPixelShaderResource)
            .transition(FrameResource::EsmTarget, NonPixelShaderResource, NonPixelShaderResource)
            .transition(FrameResource::EsmScratch, NonPixelShaderResource, NonPixelShaderResource);
    }

    fn record(&self, ctx: &mut PassContext) -> Result<()> {
        use ResourceState::*;
        let frame = ctx.frame;

        ctx.transition(FrameResource::ShadowMap, NonPixelShaderResource, DepthWrite)?;
        let target = ctx.dsv(FrameResource::ShadowMap)?;
        ctx.list.clear_depth(target, 1.0);
        ctx.draw(
            vertex_count(&frame.draws),
            frame.draws.draws.len() as u32,
            ShadowDepthKernel {
                lighting: frame.lighting,
                transforms: frame.transforms,
                draws: frame.draws.clone(),
                target,
            },
        );
        ctx.transition(FrameResource::ShadowMap, DepthWrite, NonPixelShaderResource)?;

        if !frame.use_esm {
            return Ok(());
        }

        let groups = [group_count(frame.esm_size), group_count(frame.esm_size), 1];
        ctx.transition(FrameResource::EsmTarget, NonPixelShaderResource, UnorderedAccess)?;
        let convert = EsmConvertKernel {
            lighting: frame.lighting,
            shadow_map: ctx.srv(FrameResource::ShadowMap)?,
            target: ctx.uav(FrameResource::EsmTarget)?,
        };
        ctx.dispatch(groups, convert);

        // horizontal: target -> scratch
        ctx.transition(FrameResource::EsmTarget, UnorderedAccess, NonPixelShaderResource)?;
        ctx.transition(FrameResource::EsmScratch, NonPixelShaderResource, UnorderedAccess)?;
        let horizontal = EsmBlurKernel {
            source: ctx.srv(FrameResource::EsmTarget)?,
            target: ctx.uav(FrameResource::EsmScratch)?,
            axis: UVec3::X,
        };
        ctx.dispatch(groups, horizontal);

        // vertical: scratch -> target
        ctx.transition(FrameResource::EsmScratch, UnorderedAccess, NonPixelShaderResource)?;
        ctx.transition(FrameResource::EsmTarget, NonPixelShaderResource, UnorderedAccess)?;
        let vertical = EsmBlurKernel {
            source: ctx.srv(FrameResource::EsmScratch)?,
            target: ctx.uav(FrameResource::EsmTarget)?,
            axis: UVec3::Y,
        };
        ctx.dispatch(groups, vertical);
        ctx.transition(FrameResource::EsmTarget, UnorderedAccess, NonPixelShaderResource)?;
        Ok(())
    }
}

struct ShadowDepthKernel {
    lighting: ResourceId,
    transforms: ResourceId,
    draws: Arc<DrawList>,
    target: ResourceId,
}

impl Kernel for ShadowDepthKernel {
    fn label(&self) -> &str {
        "shadow depth"
    }

    fn accesses(&self) -> Vec<ResourceAccess> {
        vec![
            ResourceAccess::new(self.lighting, ResourceState::GenericRead),
            ResourceAccess::new(self.transforms, ResourceState::GenericRead),
            ResourceAccess::new(self.target, ResourceState::DepthWrite),
        ]
    }

    fn execute(&self, memory: &mut ResourceMemory) -> GpuResult<()> {
        let lights: LightingConstants = memory.buffer(self.lighting)?.read(0)?;
        let light_vp = Mat4::from_cols_array_2d(&lights.sun.view_projection);
        let draws = &self.draws;
        let transforms = self.transforms;
        memory.with_texture_mut(self.target, |depth, memory| {
            let size = depth.extent();
            for_each_world_triangle(memory, transforms, draws, |_, tri| {
                let clip = tri.map(|p| light_vp * p.extend(1.0));
                rasterize_triangle(clip, size.x, size.y, |x, y, z| {
                    let coord = UVec3::new(x, y, 0);
                    if z < depth.load(coord).x {
                        depth.store(coord, Vec4::new(z, 0.0, 0.0, 0.0));
                    }
                });
            })
        })?;
        Ok(())
    }
}

/// Converts depth to `exp(c * depth)`, averaged over 4x4 shadow texels
struct EsmConvertKernel {
    lighting: ResourceId,
    shadow_map: ResourceId,
    target: ResourceId,
}

impl Kernel for EsmConvertKernel {
    fn label(&self) -> &str {
        "esm convert"
    }

    fn accesses(&self) -> Vec<ResourceAccess> {
        vec![
            ResourceAccess::new(self.lighting, ResourceState::GenericRead),
            ResourceAccess::new(self.shadow_map, ResourceState::NonPixelShaderResource),
            ResourceAccess::new(self.target, ResourceState::UnorderedAccess),
        ]
    }

    fn execute(&self, memory: &mut ResourceMemory) -> GpuResult<()> {
        let lights: LightingConstants = memory.buffer(self.lighting)?.read(0)?;
        let shadow_map = self.shadow_map;
        memory.with_texture_mut(self.target, |esm, memory| {
            let shadow = memory.texture(shadow_map)?;
            let size = esm.extent();
            let ratio = (shadow.extent().x / size.x.max(1)).max(1);
            for y in 0..size.y {
                for x in 0..size.x {
                    let mut sum = 0.0;
                    for dy in 0..ratio {
                        for dx in 0..ratio {
                            let d = shadow.load(UVec3::new(x * ratio + dx, y * ratio + dy, 0)).x;
                            sum += (lights.esm_exponent * d).exp();
                        }
                    }
                    let value = sum / (ratio * ratio) as f32;
                    esm.store(UVec3::new(x, y, 0), Vec4::new(value, 0.0, 0.0, 0.0));
                }
            }
            Ok(())
        })
    }
}

struct EsmBlurKernel {
    source: ResourceId,
    target: ResourceId,
    axis: UVec3,
}

impl Kernel for EsmBlurKernel {
    fn label(&self) -> &str {
        if self.axis == UVec3::X {
            "esm blur horizontal"
        } else {
            "esm blur vertical"
        }
    }

    fn accesses(&self) -> Vec<ResourceAccess> {
        vec![
            ResourceAccess::new(self.source, ResourceState::NonPixelShaderResource),
            ResourceAccess::new(self.target, ResourceState::UnorderedAccess),
        ]
    }

    fn execute(&self, memory: &mut ResourceMemory) -> GpuResult<()> {
        let (source, axis) = (self.source, self.axis.as_ivec3());
        memory.with_texture_mut(self.target, |target, memory| {
            let source = memory.texture(source)?;
            let size = source.extent().as_ivec3();
            for y in 0..size.y {
                for x in 0..size.x {
                    let center = glam::IVec3::new(x, y, 0);
                    let value: f32 = ESM_BLUR_WEIGHTS
                        .iter()
                        .enumerate()
                        .map(|(i, w)| {
                            let p = (center + axis * (i as i32 - 2)).clamp(glam::IVec3::ZERO, size - 1);
                            w * source.load(p.as_uvec3()).x
                        })
                        .sum();
                    target.store(center.as_uvec3(), Vec4::new(value, 0.0, 0.0, 0.0));
                }
            }
            Ok(())
        })
    }
}

/// Fraction of sunlight reaching `world`
pub(crate) fn sun_visibility(
    lights: &LightingConstants,
    shadow_map: &TextureData,
    esm: Option<&TextureData>,
    world: Vec3,
) -> f32 {
    let clip = Mat4::from_cols_array_2d(&lights.sun.view_projection) * world.extend(1.0);
    let ndc = clip.truncate() / clip.w;
    let uv = glam::Vec2::new(ndc.x * 0.5 + 0.5, 0.5 - ndc.y * 0.5);
    if !(0.0..=1.0).contains(&uv.x) || !(0.0..=1.0).contains(&uv.y) || !(0.0..=1.0).contains(&ndc.z) {
        return 1.0;
    }

    if let (Some(esm), true) = (esm, lights.sun.use_esm != 0) {
        let occluder = esm.sample_linear(uv.extend(0.5)).x;
        return (occluder * (-lights.esm_exponent * ndc.z).exp()).clamp(0.0, 1.0);
    }

    // 2x2 percentage-closer filter
    let size = shadow_map.extent();
    let p = uv * glam::Vec2::new(size.x as f32, size.y as f32) - 0.5;
    let base = p.floor();
    let f = p - base;
    let tap = |dx: f32, dy: f32| {
        let t = (base + glam::Vec2::new(dx, dy)).clamp(glam::Vec2::ZERO, glam::Vec2::new(size.x as f32 - 1.0, size.y as f32 - 1.0));
        let stored = shadow_map.load(UVec3::new(t.x as u32, t.y as u32, 0)).x;
        if ndc.z - lights.shadow_bias <= stored {
            1.0
        } else {
            0.0
        }
    };
    let top = tap(0.0, 0.0) * (1.0 - f.x) + tap(1.0, 0.0) * f.x;
    let bottom = tap(0.0, 1.0) * (1.0 - f.x) + tap(1.0, 1.0) * f.x;
    top * (1.0 - f.y) + bottom * f.y
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{ShadowSetup, ESM_EXPONENT};
    use crate::lights::LightSet;
    use helio_gpu::TextureDesc;

    fn lights(use_esm: bool) -> LightingConstants {
        let setup = ShadowSetup::default().with_esm(use_esm);
        let bytes = LightSet::new(0).to_gpu_bytes(&setup);
        bytemuck::pod_read_unaligned(&bytes[..LightingConstants::SIZE as usize])
    }

    fn map(size: u32, depth: f32) -> TextureData {
        let mut tex = TextureData::new(TextureDesc::d2(
            "shadow",
            size,
            size,
            wgpu::TextureFormat::Depth32Float,
            wgpu::TextureUsages::RENDER_ATTACHMENT,
        ));
        tex.fill(Vec4::new(depth, 0.0, 0.0, 0.0));
        tex
    }

    #[test]
    fn empty_shadow_map_is_fully_lit() {
        let lights = lights(false);
        assert_eq!(sun_visibility(&lights, &map(16, 1.0), None, Vec3::ZERO), 1.0);
    }

    #[test]
    fn occluder_in_front_shadows_the_point() {
        let lights = lights(false);
        assert_eq!(sun_visibility(&lights, &map(16, 0.0), None, Vec3::ZERO), 0.0);
    }

    #[test]
    fn esm_visibility_falls_off_behind_occluder() {
        let lights = lights(true);
        let mut esm = map(4, 0.0);
        esm.fill(Vec4::new((ESM_EXPONENT * 0.05).exp(), 0.0, 0.0, 0.0));
        let shadow = map(16, 0.05);
        let lit = sun_visibility(&lights, &shadow, Some(&esm), Vec3::new(0.0, 9.0, 0.0));
        let dark = sun_visibility(&lights, &shadow, Some(&esm), Vec3::new(0.0, -5.0, 0.0));
        assert!(lit > dark, "{lit} vs {dark}");
    }
}
