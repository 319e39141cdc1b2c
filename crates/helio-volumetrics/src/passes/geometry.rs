//! G-buffer pass

use std::sync::Arc;

use glam::{Mat4, UVec3, Vec3, Vec4};
use helio_gpu::{Kernel, ResourceAccess, ResourceId, ResourceMemory, ResourceState, Result as GpuResult};

use super::{FramePass, FrameResource, PassContext, StateDeclaration};
use crate::constants::{GpuMaterial, PassConstants};
use crate::raster::rasterize_triangle;
use crate::scene::DrawList;
use crate::Result;

/// Fills albedo, normal, roughness/metalness and depth for every instance
pub struct GeometryPass;

impl FramePass for GeometryPass {
    fn name(&self) -> &str {
        "geometry"
    }

    fn declare_states(&self, states: &mut StateDeclaration) {
        use ResourceState::*;
        states
            .transition(FrameResource::GBufferAlbedo, NonPixelShaderResource, RenderTarget)
            .transition(FrameResource::GBufferNormal, NonPixelShaderResource, RenderTarget)
            .transition(FrameResource::GBufferRoughnessMetal, NonPixelShaderResource, RenderTarget)
            .transition(FrameResource::Depth, NonPixelShaderResource, DepthWrite);
    }

    fn record(&self, ctx: &mut PassContext) -> Result<()> {
        use ResourceState::*;
        let frame = ctx.frame;

        for target in [
            FrameResource::GBufferAlbedo,
            FrameResource::GBufferNormal,
            FrameResource::GBufferRoughnessMetal,
        ] {
            ctx.transition(target, NonPixelShaderResource, RenderTarget)?;
            let rtv = ctx.rtv(target)?;
            ctx.list.clear_render_target(rtv, Vec4::ZERO);
        }
        ctx.transition(FrameResource::Depth, NonPixelShaderResource, DepthWrite)?;
        let depth = ctx.dsv(FrameResource::Depth)?;
        ctx.list.clear_depth(depth, 1.0);

        let kernel = GeometryKernel {
            pass_constants: frame.pass_constants,
            transforms: frame.transforms,
            materials: frame.materials,
            draws: frame.draws.clone(),
            albedo: ctx.rtv(FrameResource::GBufferAlbedo)?,
            normal: ctx.rtv(FrameResource::GBufferNormal)?,
            roughness_metal: ctx.rtv(FrameResource::GBufferRoughnessMetal)?,
            depth,
        };
        ctx.draw(vertex_count(&frame.draws), frame.draws.draws.len() as u32, kernel);
        Ok(())
    }
}

pub(crate) fn vertex_count(draws: &DrawList) -> u32 {
    draws
        .draws
        .iter()
        .filter_map(|d| draws.geometry(d.geometry))
        .map(|g| g.triangle_count() as u32 * 3)
        .sum()
}

/// Calls `f(draw_index, world_triangle)` for every triangle of every draw
///
/// Instance `i` uses row `i` of the transform buffer.
pub(crate) fn for_each_world_triangle(
    memory: &ResourceMemory,
    transforms: ResourceId,
    draws: &DrawList,
    mut f: impl FnMut(usize, [Vec3; 3]),
) -> GpuResult<()> {
    let matrices: Vec<[[f32; 4]; 4]> = memory.buffer(transforms)?.read_slice(0, draws.draws.len())?;
    for (index, (draw, model)) in draws.draws.iter().zip(&matrices).enumerate() {
        let Some(geometry) = draws.geometry(draw.geometry) else {
            continue;
        };
        let model = Mat4::from_cols_array_2d(model);
        for tri in geometry.triangles() {
            f(index, tri.map(|p| model.transform_point3(p)));
        }
    }
    Ok(())
}

#[derive(Clone, Copy)]
struct Fragment {
    depth: f32,
    albedo: Vec4,
    normal: Vec4,
    roughness_metal: Vec4,
}

struct GeometryKernel {
    pass_constants: ResourceId,
    transforms: ResourceId,
    materials: ResourceId,
    draws: Arc<DrawList>,
    albedo: ResourceId,
    normal: ResourceId,
    roughness_metal: ResourceId,
    depth: ResourceId,
}

impl Kernel for GeometryKernel {
    fn label(&self) -> &str {
        "gbuffer"
    }

    fn accesses(&self) -> Vec<ResourceAccess> {
        vec![
            ResourceAccess::new(self.pass_constants, ResourceState::GenericRead),
            ResourceAccess::new(self.transforms, ResourceState::GenericRead),
            ResourceAccess::new(self.materials, ResourceState::GenericRead),
            ResourceAccess::new(self.albedo, ResourceState::RenderTarget),
            ResourceAccess::new(self.normal, ResourceState::RenderTarget),
            ResourceAccess::new(self.roughness_metal, ResourceState::RenderTarget),
            ResourceAccess::new(self.depth, ResourceState::DepthWrite),
        ]
    }

    fn execute(&self, memory: &mut ResourceMemory) -> GpuResult<()> {
        let pass: PassConstants = memory.buffer(self.pass_constants)?.read(0)?;
        let view_proj = pass.view_proj();
        let eye = Vec3::from_array(pass.world_eye_pos);

        let depth = memory.texture(self.depth)?;
        let size = depth.extent();
        let mut fragments: Vec<Fragment> = depth
            .texels()
            .iter()
            .map(|t| Fragment {
                depth: t.x,
                albedo: Vec4::ZERO,
                normal: Vec4::ZERO,
                roughness_metal: Vec4::ZERO,
            })
            .collect();
        let mut written = vec![false; fragments.len()];

        let material_count = self.draws.draws.iter().map(|d| d.material.index() + 1).max().unwrap_or(0);
        let materials: Vec<GpuMaterial> = memory.buffer(self.materials)?.read_slice(0, material_count)?;

        for_each_world_triangle(memory, self.transforms, &self.draws, |index, tri| {
            let material = self.draws.draws[index].material.index();
            let material = materials.get(material).copied().unwrap_or_default();
            let mut normal = (tri[1] - tri[0]).cross(tri[2] - tri[0]).normalize_or_zero();
            // two-sided: face the viewer
            if normal.dot(eye - tri[0]) < 0.0 {
                normal = -normal;
            }
            let clip = tri.map(|p| view_proj * p.extend(1.0));
            rasterize_triangle(clip, size.x, size.y, |x, y, z| {
                let i = (y * size.x + x) as usize;
                let Some(current) = fragments.get(i) else {
                    return;
                };
                if z < current.depth {
                    fragments[i] = Fragment {
                        depth: z,
                        albedo: Vec3::from_array(material.albedo).extend(1.0),
                        normal: (normal * 0.5 + 0.5).extend(0.0),
                        roughness_metal: Vec4::new(material.roughness, material.metalness, 0.0, 0.0),
                    };
                    written[i] = true;
                }
            });
        })?;

        let targets = [self.albedo, self.normal, self.roughness_metal, self.depth];
        for (slot, target) in targets.into_iter().enumerate() {
            let texture = memory.texture_mut(target)?;
            for (i, fragment) in fragments.iter().enumerate().filter(|(i, _)| written[*i]) {
                let coord = UVec3::new(i as u32 % size.x, i as u32 / size.x, 0);
                let value = match slot {
                    0 => fragment.albedo,
                    1 => fragment.normal,
                    2 => fragment.roughness_metal,
                    _ => Vec4::new(fragment.depth, 0.0, 0.0, 0.0),
                };
                texture.store(coord, value);
            }
        }
        Ok(())
    }
}
