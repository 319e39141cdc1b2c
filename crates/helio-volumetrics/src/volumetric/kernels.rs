//! Compute programs of the four volume stages

use glam::{UVec2, UVec3, Vec2, Vec3, Vec4};
use helio_gpu::{
    Error as GpuError, Kernel, ResourceAccess, ResourceId, ResourceMemory, ResourceState, Result as GpuResult,
    TextureData,
};

use super::fog::{evaluate_medium, henyey_greenstein};
use super::froxel::FroxelMapping;
use crate::config::VolumeFlags;
use crate::constants::{PassConstants, VolumetricFrameConstants};
use crate::environment::ambient_radiance;
use crate::passes::{point_light_incidence, read_lights, sun_visibility};
use crate::raster::pixel_to_ndc;

fn read_frame(memory: &ResourceMemory, pass: ResourceId, volume: ResourceId) -> GpuResult<(PassConstants, VolumetricFrameConstants)> {
    Ok((memory.buffer(pass)?.read(0)?, memory.buffer(volume)?.read(0)?))
}

fn mapping(constants: &VolumetricFrameConstants) -> FroxelMapping {
    FroxelMapping::new(
        UVec3::from_array(constants.volume.volume_resolution),
        constants.volume.max_volume_distance,
    )
}

fn for_each_cell(resolution: UVec3, mut f: impl FnMut(UVec3)) {
    for z in 0..resolution.z {
        for y in 0..resolution.y {
            for x in 0..resolution.x {
                f(UVec3::new(x, y, z));
            }
        }
    }
}

/// Positive view depth stored at a pixel, sampled with clamped coordinates
fn surface_depth(pass: &PassConstants, depth: &TextureData, dims: UVec2, uv: Vec2) -> f32 {
    let max = dims.max(UVec2::ONE) - 1;
    let pixel = (uv * dims.as_vec2()).floor().clamp(Vec2::ZERO, max.as_vec2()).as_uvec2();
    let ndc = depth.load(pixel.extend(0)).x;
    if ndc >= 1.0 {
        f32::INFINITY
    } else {
        pass.ndc_to_view_depth(ndc)
    }
}

/// Writes `(scattering, extinction)` and `(emission, phase g)` per froxel
pub(crate) struct DensityKernel {
    pub pass_constants: ResourceId,
    pub volume_constants: ResourceId,
    pub vbuffer_a: ResourceId,
    pub vbuffer_b: ResourceId,
}

impl Kernel for DensityKernel {
    fn label(&self) -> &str {
        "volume density"
    }

    fn accesses(&self) -> Vec<ResourceAccess> {
        vec![
            ResourceAccess::new(self.pass_constants, ResourceState::GenericRead),
            ResourceAccess::new(self.volume_constants, ResourceState::GenericRead),
            ResourceAccess::new(self.vbuffer_a, ResourceState::UnorderedAccess),
            ResourceAccess::new(self.vbuffer_b, ResourceState::UnorderedAccess),
        ]
    }

    fn execute(&self, memory: &mut ResourceMemory) -> GpuResult<()> {
        let (pass, constants) = read_frame(memory, self.pass_constants, self.volume_constants)?;
        let mapping = mapping(&constants);
        let (inv_proj, inv_view) = (pass.inv_proj(), pass.inv_view());

        let mut media = Vec::with_capacity(
            (mapping.resolution.x * mapping.resolution.y * mapping.resolution.z) as usize,
        );
        for_each_cell(mapping.resolution, |cell| {
            let world = mapping.uvw_to_world(mapping.cell_center(cell), inv_proj, inv_view);
            media.push((cell, evaluate_medium(&constants.fog, world)));
        });

        let a = memory.texture_mut(self.vbuffer_a)?;
        for (cell, medium) in &media {
            a.store(*cell, medium.packed_a());
        }
        let b = memory.texture_mut(self.vbuffer_b)?;
        for (cell, medium) in &media {
            b.store(*cell, medium.packed_b());
        }
        Ok(())
    }
}

/// In-scattered radiance per froxel, blended with last frame's history
pub(crate) struct ScatteringKernel {
    pub pass_constants: ResourceId,
    pub volume_constants: ResourceId,
    pub lighting: ResourceId,
    pub vbuffer_a: ResourceId,
    pub vbuffer_b: ResourceId,
    pub history: ResourceId,
    pub depth: ResourceId,
    pub prev_depth: ResourceId,
    pub shadow_map: ResourceId,
    pub esm: ResourceId,
    pub irradiance: ResourceId,
    pub target: ResourceId,
}

impl ScatteringKernel {
    fn check_dimensions(&self, memory: &ResourceMemory, constants: &VolumetricFrameConstants) -> GpuResult<()> {
        let pairs = [
            (self.depth, constants.scattering.depth_buffer_dimensions),
            (self.prev_depth, constants.scattering.prev_depth_buffer_dimensions),
        ];
        for (id, dims) in pairs {
            let extent = memory.texture(id)?.extent();
            if extent.truncate() != UVec2::from_array(dims) {
                return Err(GpuError::Recording(format!(
                    "'{}' is {}x{} but constants describe {}x{}",
                    memory.label(id)?,
                    extent.x,
                    extent.y,
                    dims[0],
                    dims[1]
                )));
            }
        }
        Ok(())
    }
}

impl Kernel for ScatteringKernel {
    fn label(&self) -> &str {
        "volume light scattering"
    }

    fn accesses(&self) -> Vec<ResourceAccess> {
        let mut accesses = vec![
            ResourceAccess::new(self.pass_constants, ResourceState::GenericRead),
            ResourceAccess::new(self.volume_constants, ResourceState::GenericRead),
            ResourceAccess::new(self.lighting, ResourceState::GenericRead),
            ResourceAccess::new(self.target, ResourceState::UnorderedAccess),
        ];
        accesses.extend(
            [
                self.vbuffer_a,
                self.vbuffer_b,
                self.history,
                self.depth,
                self.prev_depth,
                self.shadow_map,
                self.esm,
                self.irradiance,
            ]
            .map(|id| ResourceAccess::new(id, ResourceState::NonPixelShaderResource)),
        );
        accesses
    }

    fn execute(&self, memory: &mut ResourceMemory) -> GpuResult<()> {
        let (pass, constants) = read_frame(memory, self.pass_constants, self.volume_constants)?;
        let (lights, points) = read_lights(memory, self.lighting)?;
        self.check_dimensions(memory, &constants)?;

        let mapping = mapping(&constants);
        let volume = constants.volume;
        let flags = VolumeFlags::from_bits_truncate(volume.flags);
        let temporal = volume.use_temporal_reprojection != 0;
        let blend_history = temporal && volume.history_valid != 0;
        let jitter = if temporal {
            Vec3::from_array(volume.jitter) / mapping.resolution.as_vec3()
        } else {
            Vec3::ZERO
        };
        let depth_dims = UVec2::from_array(constants.scattering.depth_buffer_dimensions);
        let prev_depth_dims = UVec2::from_array(constants.scattering.prev_depth_buffer_dimensions);

        let (inv_proj, inv_view, view) = (pass.inv_proj(), pass.inv_view(), pass.view());
        let (prev_view, prev_view_proj) = (pass.prev_view(), pass.prev_view_proj());
        let eye = Vec3::from_array(pass.world_eye_pos);
        let sun_travel = Vec3::from_array(lights.sun.direction);
        let sun_radiance = Vec3::from_array(lights.sun.color) * lights.sun.intensity;

        memory.with_texture_mut(self.target, |target, memory| {
            let vbuffer_a = memory.texture(self.vbuffer_a)?;
            let vbuffer_b = memory.texture(self.vbuffer_b)?;
            let history = memory.texture(self.history)?;
            let depth = memory.texture(self.depth)?;
            let prev_depth = memory.texture(self.prev_depth)?;
            let shadow_map = memory.texture(self.shadow_map)?;
            let esm = memory.texture(self.esm)?;
            let ambient = if flags.contains(VolumeFlags::DISABLE_AMBIENT) {
                Vec3::ZERO
            } else {
                ambient_radiance(memory.texture(self.irradiance)?) * lights.ambient_intensity
            };

            for_each_cell(mapping.resolution, |cell| {
                let a = vbuffer_a.load(cell);
                let b = vbuffer_b.load(cell);
                let (scattering, extinction) = (a.truncate(), a.w);
                let (emission, g) = (b.truncate(), b.w);

                let center = mapping.cell_center(cell);
                let world = mapping.uvw_to_world((center + jitter).clamp(Vec3::ZERO, Vec3::ONE), inv_proj, inv_view);
                let to_camera = (eye - world).normalize_or_zero();

                let mut radiance = ambient;
                if !flags.contains(VolumeFlags::DISABLE_SUN) {
                    let visibility = sun_visibility(&lights, shadow_map, Some(esm), world);
                    radiance += sun_radiance * visibility * henyey_greenstein(sun_travel.dot(to_camera), g);
                }
                if !flags.contains(VolumeFlags::DISABLE_POINT_LIGHTS) {
                    for light in &points {
                        if let Some((to_light, incoming)) = point_light_incidence(light, world) {
                            radiance += incoming * henyey_greenstein((-to_light).dot(to_camera), g);
                        }
                    }
                }
                let mut inscatter = scattering * radiance + emission;

                if blend_history {
                    let anchor = mapping.uvw_to_world(center, inv_proj, inv_view);
                    let reprojected = mapping
                        .world_to_uvw(anchor, prev_view, prev_view_proj)
                        .filter(|uvw| uvw.cmpge(Vec3::ZERO).all() && uvw.cmple(Vec3::ONE).all());
                    if let Some(prev_uvw) = reprojected {
                        // newly revealed: hidden behind last frame's surface, visible now
                        let prev_cell_depth = -prev_view.transform_point3(anchor).z;
                        let cell_depth = -view.transform_point3(anchor).z;
                        let was_hidden =
                            prev_cell_depth > surface_depth(&pass, prev_depth, prev_depth_dims, prev_uvw.truncate());
                        let is_visible = cell_depth < surface_depth(&pass, depth, depth_dims, center.truncate());
                        if !(was_hidden && is_visible) {
                            let previous = history.sample_linear(prev_uvw).truncate();
                            inscatter = inscatter.lerp(previous, volume.history_weight);
                        }
                    }
                }

                target.store(cell, inscatter.extend(extinction));
            });
            Ok(())
        })
    }
}

/// Front-to-back march along the depth axis, one thread per column
pub(crate) struct IntegrationKernel {
    pub volume_constants: ResourceId,
    pub scattering: ResourceId,
    pub target: ResourceId,
}

impl Kernel for IntegrationKernel {
    fn label(&self) -> &str {
        "volume integration"
    }

    fn accesses(&self) -> Vec<ResourceAccess> {
        vec![
            ResourceAccess::new(self.volume_constants, ResourceState::GenericRead),
            ResourceAccess::new(self.scattering, ResourceState::NonPixelShaderResource),
            ResourceAccess::new(self.target, ResourceState::UnorderedAccess),
        ]
    }

    fn execute(&self, memory: &mut ResourceMemory) -> GpuResult<()> {
        let constants: VolumetricFrameConstants = memory.buffer(self.volume_constants)?.read(0)?;
        let mapping = mapping(&constants);
        let thickness: Vec<f32> = (0..mapping.resolution.z).map(|k| mapping.slice_thickness(k)).collect();

        memory.with_texture_mut(self.target, |target, memory| {
            let scattering = memory.texture(self.scattering)?;
            for y in 0..mapping.resolution.y {
                for x in 0..mapping.resolution.x {
                    let mut radiance = Vec3::ZERO;
                    let mut transmittance = 1.0;
                    for (k, dz) in thickness.iter().enumerate() {
                        let cell = UVec3::new(x, y, k as u32);
                        let sample = scattering.load(cell);
                        radiance += transmittance * sample.truncate() * *dz;
                        transmittance *= (-sample.w * dz).exp();
                        target.store(cell, radiance.extend(transmittance));
                    }
                }
            }
            Ok(())
        })
    }
}

/// Composites the integrated volume onto the lit output
pub(crate) struct ApplyKernel {
    pub pass_constants: ResourceId,
    pub volume_constants: ResourceId,
    pub depth: ResourceId,
    pub integrated: ResourceId,
    pub output: ResourceId,
}

/// Integrated `(inscatter, transmittance)` up to froxel depth `w`
///
/// Cell `k` holds the march up to the far edge of its slice, so the lookup is
/// shifted by half a cell and fades in from the camera over the first slice.
pub(crate) fn sample_integrated(volume: &TextureData, uv: Vec2, w: f32) -> Vec4 {
    let z = volume.extent().z.max(1) as f32;
    let first_edge = 1.0 / z;
    if w < first_edge {
        let first = volume.sample_linear(uv.extend(0.5 / z));
        return Vec4::new(0.0, 0.0, 0.0, 1.0).lerp(first, (w / first_edge).max(0.0));
    }
    volume.sample_linear(uv.extend(w - 0.5 / z))
}

impl Kernel for ApplyKernel {
    fn label(&self) -> &str {
        "volume apply"
    }

    fn accesses(&self) -> Vec<ResourceAccess> {
        vec![
            ResourceAccess::new(self.pass_constants, ResourceState::GenericRead),
            ResourceAccess::new(self.volume_constants, ResourceState::GenericRead),
            ResourceAccess::new(self.depth, ResourceState::NonPixelShaderResource),
            ResourceAccess::new(self.integrated, ResourceState::NonPixelShaderResource),
            ResourceAccess::new(self.output, ResourceState::UnorderedAccess),
        ]
    }

    fn execute(&self, memory: &mut ResourceMemory) -> GpuResult<()> {
        let (pass, constants) = read_frame(memory, self.pass_constants, self.volume_constants)?;
        let mapping = mapping(&constants);

        memory.with_texture_mut(self.output, |output, memory| {
            let depth = memory.texture(self.depth)?;
            let integrated = memory.texture(self.integrated)?;
            let size = output.extent();
            let depth_size = depth.extent();
            for y in 0..size.y {
                for x in 0..size.x {
                    let coord = UVec3::new(x, y, 0);
                    let d = depth.load(coord.min(depth_size.saturating_sub(UVec3::ONE))).x;
                    let view_depth = if d >= 1.0 {
                        mapping.max_distance
                    } else {
                        pass.ndc_to_view_depth(d).min(mapping.max_distance)
                    };
                    let ndc = pixel_to_ndc(x, y, size.x, size.y);
                    let uv = Vec2::new(ndc.x * 0.5 + 0.5, 0.5 - ndc.y * 0.5);
                    let fog = sample_integrated(integrated, uv, mapping.depth_to_slice(view_depth));
                    let color = output.load(coord);
                    let composited = color.truncate() * fog.w + fog.truncate();
                    output.store(coord, composited.extend(color.w));
                }
            }
            Ok(())
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use helio_gpu::TextureDesc;

    fn column(values: &[Vec4]) -> TextureData {
        let mut volume = TextureData::new(TextureDesc::d3(
            "column",
            UVec3::new(1, 1, values.len() as u32),
            wgpu::TextureFormat::Rgba16Float,
            wgpu::TextureUsages::STORAGE_BINDING,
        ));
        for (k, v) in values.iter().enumerate() {
            volume.store(UVec3::new(0, 0, k as u32), *v);
        }
        volume
    }

    #[test]
    fn integrated_lookup_starts_clear_at_the_camera() {
        let volume = column(&[Vec4::new(1.0, 1.0, 1.0, 0.5), Vec4::new(2.0, 2.0, 2.0, 0.25)]);
        assert_eq!(sample_integrated(&volume, Vec2::splat(0.5), 0.0), Vec4::new(0.0, 0.0, 0.0, 1.0));
        let first_edge = sample_integrated(&volume, Vec2::splat(0.5), 0.5);
        assert!((first_edge - Vec4::new(1.0, 1.0, 1.0, 0.5)).length() < 1e-5);
        let far = sample_integrated(&volume, Vec2::splat(0.5), 1.0);
        assert!((far - Vec4::new(2.0, 2.0, 2.0, 0.25)).length() < 1e-5);
    }

    #[test]
    fn surface_depth_clamps_to_the_given_dimensions() {
        let mut depth = TextureData::new(TextureDesc::d2(
            "depth",
            4,
            4,
            wgpu::TextureFormat::Depth32Float,
            wgpu::TextureUsages::RENDER_ATTACHMENT,
        ));
        depth.fill(Vec4::new(1.0, 0.0, 0.0, 0.0));
        let pass: PassConstants = bytemuck::Zeroable::zeroed();
        // uv beyond the edge still lands on a valid texel
        assert_eq!(surface_depth(&pass, &depth, UVec2::new(4, 4), Vec2::new(1.5, -0.5)), f32::INFINITY);
    }
}
