//! Deferred lighting
//!
//! One compute dispatch over 8x8 pixel tiles. Each covered pixel is shaded
//! with the sun (shadowed), every point light, the irradiance ambient term
//! and a reflection lookup into the prefiltered environment.

use std::f32::consts::PI;

use glam::{UVec3, Vec3, Vec4};
use helio_gpu::{Kernel, ResourceAccess, ResourceId, ResourceMemory, ResourceState, Result as GpuResult};

use super::shadow::sun_visibility;
use super::{FramePass, FrameResource, PassContext, StateDeclaration};
use crate::config::group_count;
use crate::constants::{GpuPointLight, LightingConstants, PassConstants};
use crate::environment::{evaluate_irradiance, sample_cube};
use crate::raster::pixel_to_ndc;
use crate::Result;

pub struct LightingPass;

impl FramePass for LightingPass {
    fn name(&self) -> &str {
        "lighting"
    }

    fn declare_states(&self, states: &mut StateDeclaration) {
        use ResourceState::*;
        states
            .transition(FrameResource::GBufferAlbedo, RenderTarget, NonPixelShaderResource)
            .transition(FrameResource::GBufferNormal, RenderTarget, NonPixelShaderResource)
            .transition(FrameResource::GBufferRoughnessMetal, RenderTarget, NonPixelShaderResource)
            .transition(FrameResource::Depth, DepthRead, NonPixelShaderResource)
            .transition(FrameResource::Output, RenderTarget, UnorderedAccess)
            .read(FrameResource::ShadowMap, NonPixelShaderResource)
            .read(FrameResource::EsmTarget, NonPixelShaderResource)
            .read(FrameResource::Irradiance, NonPixelShaderResource)
            .read(FrameResource::PrefilteredCube, NonPixelShaderResource);
    }

    fn record(&self, ctx: &mut PassContext) -> Result<()> {
        use ResourceState::*;
        for gbuffer in [
            FrameResource::GBufferAlbedo,
            FrameResource::GBufferNormal,
            FrameResource::GBufferRoughnessMetal,
        ] {
            ctx.transition(gbuffer, RenderTarget, NonPixelShaderResource)?;
        }
        ctx.transition(FrameResource::Depth, DepthRead, NonPixelShaderResource)?;
        ctx.transition(FrameResource::Output, RenderTarget, UnorderedAccess)?;
        for read in [
            FrameResource::ShadowMap,
            FrameResource::EsmTarget,
            FrameResource::Irradiance,
            FrameResource::PrefilteredCube,
        ] {
            ctx.expect_state(read, NonPixelShaderResource)?;
        }

        let frame = ctx.frame;
        let kernel = LightingKernel {
            pass_constants: frame.pass_constants,
            lighting: frame.lighting,
            albedo: ctx.srv(FrameResource::GBufferAlbedo)?,
            normal: ctx.srv(FrameResource::GBufferNormal)?,
            roughness_metal: ctx.srv(FrameResource::GBufferRoughnessMetal)?,
            depth: ctx.srv(FrameResource::Depth)?,
            shadow_map: ctx.srv(FrameResource::ShadowMap)?,
            esm: ctx.srv(FrameResource::EsmTarget)?,
            irradiance: ctx.srv(FrameResource::Irradiance)?,
            prefiltered: ctx.srv(FrameResource::PrefilteredCube)?,
            output: ctx.uav(FrameResource::Output)?,
        };
        let size = frame.output_size;
        ctx.dispatch([group_count(size.x), group_count(size.y), 1], kernel);
        Ok(())
    }
}

/// Light buffer header and its point lights
pub(crate) fn read_lights(memory: &ResourceMemory, id: ResourceId) -> GpuResult<(LightingConstants, Vec<GpuPointLight>)> {
    let buffer = memory.buffer(id)?;
    let header: LightingConstants = buffer.read(0)?;
    let points = buffer.read_slice(LightingConstants::SIZE, header.point_light_count as usize)?;
    Ok((header, points))
}

/// Direction towards a point light and the radiance arriving from it
pub(crate) fn point_light_incidence(light: &GpuPointLight, world: Vec3) -> Option<(Vec3, Vec3)> {
    let to_light = Vec3::from_array(light.position) - world;
    let distance = to_light.length();
    if distance >= light.range || distance <= 1e-5 {
        return None;
    }
    let window = (1.0 - (distance / light.range).powi(4)).clamp(0.0, 1.0);
    let attenuation = light.intensity * window * window / (1.0 + distance * distance);
    Some((to_light / distance, Vec3::from_array(light.color) * attenuation))
}

struct Surface {
    albedo: Vec3,
    normal: Vec3,
    roughness: f32,
    metalness: f32,
}

fn shade(surface: &Surface, view: Vec3, to_light: Vec3, radiance: Vec3) -> Vec3 {
    let n_dot_l = surface.normal.dot(to_light);
    if n_dot_l <= 0.0 {
        return Vec3::ZERO;
    }
    let diffuse = surface.albedo * (1.0 - surface.metalness) / PI;
    let half = (view + to_light).normalize_or_zero();
    let alpha = (surface.roughness * surface.roughness).max(1e-3);
    let shininess = (2.0 / (alpha * alpha) - 2.0).clamp(1.0, 4096.0);
    let specular_color = Vec3::splat(0.04).lerp(surface.albedo, surface.metalness);
    let specular =
        specular_color * (shininess + 8.0) / (8.0 * PI) * surface.normal.dot(half).max(0.0).powf(shininess);
    (diffuse + specular) * radiance * n_dot_l
}

struct LightingKernel {
    pass_constants: ResourceId,
    lighting: ResourceId,
    albedo: ResourceId,
    normal: ResourceId,
    roughness_metal: ResourceId,
    depth: ResourceId,
    shadow_map: ResourceId,
    esm: ResourceId,
    irradiance: ResourceId,
    prefiltered: ResourceId,
    output: ResourceId,
}

impl Kernel for LightingKernel {
    fn label(&self) -> &str {
        "deferred lighting"
    }

    fn accesses(&self) -> Vec<ResourceAccess> {
        let mut accesses = vec![
            ResourceAccess::new(self.pass_constants, ResourceState::GenericRead),
            ResourceAccess::new(self.lighting, ResourceState::GenericRead),
            ResourceAccess::new(self.output, ResourceState::UnorderedAccess),
        ];
        accesses.extend(
            [
                self.albedo,
                self.normal,
                self.roughness_metal,
                self.depth,
                self.shadow_map,
                self.esm,
                self.irradiance,
                self.prefiltered,
            ]
            .map(|id| ResourceAccess::new(id, ResourceState::NonPixelShaderResource)),
        );
        accesses
    }

    fn execute(&self, memory: &mut ResourceMemory) -> GpuResult<()> {
        let pass: PassConstants = memory.buffer(self.pass_constants)?.read(0)?;
        let (lights, points) = read_lights(memory, self.lighting)?;
        let inv_view_proj = pass.inv_view_proj();
        let eye = Vec3::from_array(pass.world_eye_pos);
        let sun_radiance = Vec3::from_array(lights.sun.color) * lights.sun.intensity;
        let to_sun = -Vec3::from_array(lights.sun.direction);

        memory.with_texture_mut(self.output, |output, memory| {
            let albedo = memory.texture(self.albedo)?;
            let normal = memory.texture(self.normal)?;
            let roughness_metal = memory.texture(self.roughness_metal)?;
            let depth = memory.texture(self.depth)?;
            let shadow_map = memory.texture(self.shadow_map)?;
            let esm = memory.texture(self.esm)?;
            let irradiance = memory.texture(self.irradiance)?;
            let prefiltered = memory.texture(self.prefiltered)?;

            let size = output.extent();
            for y in 0..size.y {
                for x in 0..size.x {
                    let coord = UVec3::new(x, y, 0);
                    let z = depth.load(coord).x;
                    if z >= 1.0 {
                        continue;
                    }
                    let world = inv_view_proj.project_point3(pixel_to_ndc(x, y, size.x, size.y).extend(z));
                    let rm = roughness_metal.load(coord);
                    let surface = Surface {
                        albedo: albedo.load(coord).truncate(),
                        normal: (normal.load(coord).truncate() * 2.0 - 1.0).normalize_or_zero(),
                        roughness: rm.x,
                        metalness: rm.y,
                    };
                    let view = (eye - world).normalize_or_zero();

                    let visibility = sun_visibility(&lights, shadow_map, Some(esm), world);
                    let mut color = shade(&surface, view, to_sun, sun_radiance * visibility);
                    for light in &points {
                        if let Some((to_light, radiance)) = point_light_incidence(light, world) {
                            color += shade(&surface, view, to_light, radiance);
                        }
                    }
                    let ambient = evaluate_irradiance(irradiance, surface.normal) * lights.ambient_intensity;
                    color += surface.albedo * (1.0 - surface.metalness) / PI * ambient;
                    let reflected = (-view).reflect(surface.normal);
                    let specular_color = Vec3::splat(0.04).lerp(surface.albedo, surface.metalness);
                    color += sample_cube(prefiltered, reflected).truncate() * specular_color * lights.ambient_intensity;

                    output.store(coord, Vec4::from((color, 1.0)));
                }
            }
            Ok(())
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn surface(albedo: f32) -> Surface {
        Surface {
            albedo: Vec3::splat(albedo),
            normal: Vec3::Y,
            roughness: 0.5,
            metalness: 0.0,
        }
    }

    #[test]
    fn light_below_the_horizon_contributes_nothing() {
        assert_eq!(shade(&surface(0.8), Vec3::Y, -Vec3::Y, Vec3::ONE), Vec3::ZERO);
    }

    #[test]
    fn brighter_albedo_reflects_more() {
        let view = Vec3::new(0.0, 1.0, 1.0).normalize();
        let to_light = Vec3::new(1.0, 1.0, 0.0).normalize();
        let dark = shade(&surface(0.2), view, to_light, Vec3::ONE);
        let bright = shade(&surface(0.8), view, to_light, Vec3::ONE);
        assert!(bright.x > dark.x);
    }

    #[test]
    fn point_lights_fade_to_zero_at_range() {
        let light = GpuPointLight {
            position: [0.0, 0.0, 0.0],
            range: 5.0,
            color: [1.0; 3],
            intensity: 10.0,
        };
        let near = point_light_incidence(&light, Vec3::new(1.0, 0.0, 0.0)).unwrap();
        assert!((near.0 - Vec3::NEG_X).length() < 1e-6);
        assert!(point_light_incidence(&light, Vec3::new(5.0, 0.0, 0.0)).is_none());
        let edge = point_light_incidence(&light, Vec3::new(4.99, 0.0, 0.0)).unwrap();
        assert!(edge.1.x < near.1.x * 1e-2);
    }
}
