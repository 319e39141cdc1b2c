//! Image-based ambient lighting
//!
//! The environment cubemap is reduced on the compute queue into an L1
//! spherical-harmonics irradiance table and a Phong-lobe prefiltered cube.
//! The job is ordered against the direct queue with queue-to-queue waits
//! only; the CPU never blocks on it.

use std::collections::HashMap;
use std::f32::consts::PI;

use glam::{UVec3, Vec2, Vec3, Vec4};
use helio_gpu::{
    CommandList, GraphicsContext, Kernel, QueueKind, ResourceAccess, ResourceId, ResourceMemory, ResourceState,
    Result as GpuResult, TextureData, TextureDesc, ViewDesc, ViewPoolKind, ViewRange,
};

use crate::config::group_count;
use crate::passes::{BoundResource, FrameResource};
use crate::Result;

const SH_Y00: f32 = 0.282_095;
const SH_Y1: f32 = 0.488_603;
/// Phong exponent of the prefiltered lobe
const PREFILTER_POWER: f32 = 32.0;

/// Unit direction through `uv` on cube face `face` (+X, -X, +Y, -Y, +Z, -Z)
pub fn cube_direction(face: u32, uv: Vec2) -> Vec3 {
    let u = uv.x * 2.0 - 1.0;
    let v = uv.y * 2.0 - 1.0;
    let dir = match face {
        0 => Vec3::new(1.0, -v, -u),
        1 => Vec3::new(-1.0, -v, u),
        2 => Vec3::new(u, 1.0, v),
        3 => Vec3::new(u, -1.0, -v),
        4 => Vec3::new(u, -v, 1.0),
        _ => Vec3::new(-u, -v, -1.0),
    };
    dir.normalize()
}

/// Inverse of [`cube_direction`]
pub fn direction_to_face(dir: Vec3) -> (u32, Vec2) {
    let a = dir.abs();
    let (face, u, v, major) = if a.x >= a.y && a.x >= a.z {
        if dir.x > 0.0 {
            (0, -dir.z, -dir.y, a.x)
        } else {
            (1, dir.z, -dir.y, a.x)
        }
    } else if a.y >= a.z {
        if dir.y > 0.0 {
            (2, dir.x, dir.z, a.y)
        } else {
            (3, dir.x, -dir.z, a.y)
        }
    } else if dir.z > 0.0 {
        (4, dir.x, -dir.y, a.z)
    } else {
        (5, -dir.x, -dir.y, a.z)
    };
    let major = major.max(1e-12);
    (face, Vec2::new(u / major, v / major) * 0.5 + 0.5)
}

/// Bilinear lookup within one face
pub fn sample_cube(cube: &TextureData, dir: Vec3) -> Vec4 {
    let (face, uv) = direction_to_face(dir);
    cube.sample_linear(uv.extend((face as f32 + 0.5) / 6.0))
}

fn texel_solid_angle(size: u32, uv: Vec2) -> f32 {
    let p = uv * 2.0 - 1.0;
    let texel = 2.0 / size as f32;
    texel * texel / (1.0 + p.length_squared()).powf(1.5)
}

fn for_each_texel(size: u32, mut f: impl FnMut(UVec3, Vec3, f32)) {
    for face in 0..6 {
        for y in 0..size {
            for x in 0..size {
                let uv = Vec2::new((x as f32 + 0.5) / size as f32, (y as f32 + 0.5) / size as f32);
                f(UVec3::new(x, y, face), cube_direction(face, uv), texel_solid_angle(size, uv));
            }
        }
    }
}

/// Cosine-convolved irradiance from the four stored L1 coefficients
pub fn evaluate_irradiance(sh: &TextureData, normal: Vec3) -> Vec3 {
    let c = |i: u32| sh.load(UVec3::new(i, 0, 0)).truncate();
    let band0 = PI * SH_Y00 * c(0);
    let band1 = 2.0 * PI / 3.0 * SH_Y1 * (c(1) * normal.y + c(2) * normal.z + c(3) * normal.x);
    (band0 + band1).max(Vec3::ZERO)
}

/// Mean radiance over the sphere
pub fn ambient_radiance(sh: &TextureData) -> Vec3 {
    sh.load(UVec3::ZERO).truncate() * SH_Y00
}

/// Procedural sky used when no environment is supplied: zenith, horizon, ground
pub fn sky_gradient(size: u32, zenith: Vec3, horizon: Vec3, ground: Vec3) -> Vec<Vec4> {
    let mut texels = vec![Vec4::ZERO; (size * size * 6) as usize];
    for_each_texel(size, |texel, dir, _| {
        let color = if dir.y >= 0.0 {
            horizon.lerp(zenith, dir.y.sqrt())
        } else {
            horizon.lerp(ground, (-dir.y).sqrt())
        };
        texels[((texel.z * size + texel.y) * size + texel.x) as usize] = color.extend(1.0);
    });
    texels
}

/// Source cube plus the maps derived from it
pub struct EnvironmentMaps {
    pub cube: ResourceId,
    pub irradiance: ResourceId,
    pub prefiltered: ResourceId,
    /// cube SRV, irradiance SRV/UAV, prefiltered SRV/UAV
    views: ViewRange,
    size: u32,
    prefiltered_size: u32,
}

impl EnvironmentMaps {
    pub fn new(ctx: &mut GraphicsContext, size: u32, prefiltered_size: u32) -> Result<Self> {
        let device = ctx.device().clone();
        let hdr = wgpu::TextureFormat::Rgba16Float;
        let sampled = wgpu::TextureUsages::TEXTURE_BINDING;
        let storage = wgpu::TextureUsages::TEXTURE_BINDING | wgpu::TextureUsages::STORAGE_BINDING;

        let cube = device.create_texture(
            TextureDesc::cube("Environment Cube", size, hdr, sampled | wgpu::TextureUsages::COPY_DST),
            FrameResource::EnvironmentCube.boundary_state(),
        )?;
        let irradiance = device.create_texture(
            TextureDesc::d2("Irradiance SH", 4, 1, wgpu::TextureFormat::Rgba32Float, storage),
            FrameResource::Irradiance.boundary_state(),
        )?;
        let prefiltered = device.create_texture(
            TextureDesc::cube("Prefiltered Environment", prefiltered_size, hdr, storage),
            FrameResource::PrefilteredCube.boundary_state(),
        )?;

        let views = ctx.views_mut().allocate(ViewPoolKind::ShaderResource, 5)?;
        let descs = [
            ViewDesc::ShaderResource(cube),
            ViewDesc::ShaderResource(irradiance),
            ViewDesc::UnorderedAccess(irradiance),
            ViewDesc::ShaderResource(prefiltered),
            ViewDesc::UnorderedAccess(prefiltered),
        ];
        for (i, desc) in descs.into_iter().enumerate() {
            ctx.views_mut().write_view(views.handle(i as u32), desc)?;
        }

        let maps = Self {
            cube,
            irradiance,
            prefiltered,
            views,
            size,
            prefiltered_size,
        };
        maps.upload(
            ctx,
            &sky_gradient(
                size,
                Vec3::new(0.25, 0.45, 0.9),
                Vec3::new(0.8, 0.85, 0.9),
                Vec3::new(0.2, 0.18, 0.15),
            ),
        )?;
        Ok(maps)
    }

    pub fn size(&self) -> u32 {
        self.size
    }

    /// Replaces the source cube contents; texels are face-major
    pub fn upload(&self, ctx: &GraphicsContext, texels: &[Vec4]) -> Result<()> {
        ctx.device().write_texture(self.cube, texels)?;
        Ok(())
    }

    pub fn bind(&self, resources: &mut HashMap<FrameResource, BoundResource>) {
        let mut cube = BoundResource::new(self.cube);
        cube.srv = Some(self.views.handle(0));
        let mut irradiance = BoundResource::new(self.irradiance);
        irradiance.srv = Some(self.views.handle(1));
        irradiance.uav = Some(self.views.handle(2));
        let mut prefiltered = BoundResource::new(self.prefiltered);
        prefiltered.srv = Some(self.views.handle(3));
        prefiltered.uav = Some(self.views.handle(4));

        resources.insert(FrameResource::EnvironmentCube, cube);
        resources.insert(FrameResource::Irradiance, irradiance);
        resources.insert(FrameResource::PrefilteredCube, prefiltered);
    }

    /// Queues the reduction on the compute queue and returns its marker
    ///
    /// The compute queue first waits for everything already submitted to the
    /// direct queue; the direct queue then waits for the job before any later
    /// frame samples the results.
    pub fn preprocess(&self, ctx: &GraphicsContext) -> Result<u64> {
        use ResourceState::*;
        let (direct, compute) = (ctx.direct_queue(), ctx.compute_queue());
        let cube_state = FrameResource::EnvironmentCube.boundary_state();
        let irradiance_state = FrameResource::Irradiance.boundary_state();
        let prefiltered_state = FrameResource::PrefilteredCube.boundary_state();

        let waited_for = compute.insert_wait_for_queue(direct)?;

        let mut list = CommandList::new("Environment Preprocessing", QueueKind::Compute);
        list.transition(self.cube, cube_state, NonPixelShaderResource);
        list.transition(self.irradiance, irradiance_state, UnorderedAccess);
        list.transition(self.prefiltered, prefiltered_state, UnorderedAccess);
        let views = ctx.views();
        list.dispatch(
            [1, 1, 1],
            IrradianceKernel {
                source: views.resolve(self.views.handle(0))?,
                target: views.resolve(self.views.handle(2))?,
            },
        );
        list.dispatch(
            [group_count(self.prefiltered_size), group_count(self.prefiltered_size), 6],
            PrefilterKernel {
                source: views.resolve(self.views.handle(0))?,
                target: views.resolve(self.views.handle(4))?,
            },
        );
        list.transition(self.cube, NonPixelShaderResource, cube_state);
        list.transition(self.irradiance, UnorderedAccess, irradiance_state);
        list.transition(self.prefiltered, UnorderedAccess, prefiltered_state);
        list.close();

        let marker = compute.submit(list)?;
        direct.insert_wait_for_value(compute, marker)?;
        log::info!(
            "Environment preprocessing queued on compute marker {} after direct marker {}",
            marker,
            waited_for
        );
        Ok(marker)
    }

    /// Returns the views and schedules the textures for destruction
    pub fn release(&self, ctx: &mut GraphicsContext) -> Result<()> {
        ctx.views_mut().free(self.views)?;
        for id in [self.cube, self.irradiance, self.prefiltered] {
            ctx.destroy_deferred(id);
        }
        Ok(())
    }
}

struct IrradianceKernel {
    source: ResourceId,
    target: ResourceId,
}

impl Kernel for IrradianceKernel {
    fn label(&self) -> &str {
        "irradiance sh"
    }

    fn accesses(&self) -> Vec<ResourceAccess> {
        vec![
            ResourceAccess::new(self.source, ResourceState::NonPixelShaderResource),
            ResourceAccess::new(self.target, ResourceState::UnorderedAccess),
        ]
    }

    fn execute(&self, memory: &mut ResourceMemory) -> GpuResult<()> {
        let source = memory.texture(self.source)?;
        let size = source.extent().x;
        let mut coefficients = [Vec3::ZERO; 4];
        for_each_texel(size, |texel, dir, weight| {
            let radiance = source.load(texel).truncate() * weight;
            coefficients[0] += radiance * SH_Y00;
            coefficients[1] += radiance * SH_Y1 * dir.y;
            coefficients[2] += radiance * SH_Y1 * dir.z;
            coefficients[3] += radiance * SH_Y1 * dir.x;
        });
        let target = memory.texture_mut(self.target)?;
        for (i, c) in coefficients.iter().enumerate() {
            target.store(UVec3::new(i as u32, 0, 0), c.extend(0.0));
        }
        Ok(())
    }
}

struct PrefilterKernel {
    source: ResourceId,
    target: ResourceId,
}

impl Kernel for PrefilterKernel {
    fn label(&self) -> &str {
        "prefilter environment"
    }

    fn accesses(&self) -> Vec<ResourceAccess> {
        vec![
            ResourceAccess::new(self.source, ResourceState::NonPixelShaderResource),
            ResourceAccess::new(self.target, ResourceState::UnorderedAccess),
        ]
    }

    fn execute(&self, memory: &mut ResourceMemory) -> GpuResult<()> {
        let source = self.source;
        memory.with_texture_mut(self.target, |target, memory| {
            let source = memory.texture(source)?;
            let source_size = source.extent().x;
            let mut samples = Vec::with_capacity((source_size * source_size * 6) as usize);
            for_each_texel(source_size, |texel, dir, weight| {
                samples.push((dir, source.load(texel).truncate(), weight));
            });

            for_each_texel(target.extent().x, |texel, normal, _| {
                let mut sum = Vec3::ZERO;
                let mut total = 0.0;
                for (dir, radiance, weight) in &samples {
                    let lobe = normal.dot(*dir).max(0.0).powf(PREFILTER_POWER) * weight;
                    sum += *radiance * lobe;
                    total += lobe;
                }
                let value = if total > 0.0 { sum / total } else { Vec3::ZERO };
                target.store(texel, value.extend(1.0));
            });
            Ok(())
        })
    }
}
