use glam::{UVec3, Vec3, Vec4};
use helio_gpu::{Kernel, ResourceAccess, ResourceId, ResourceMemory, ResourceState, Result as GpuResult};

use super::{FramePass, FrameResource, PassContext, StateDeclaration};
use crate::constants::PassConstants;
use crate::environment::sample_cube;
use crate::raster::pixel_to_ndc;
use crate::Result;

/// Fills pixels left at the far plane with the environment cubemap
pub struct SkyboxPass;

impl FramePass for SkyboxPass {
    fn name(&self) -> &str {
        "skybox"
    }

    fn declare_states(&self, states: &mut StateDeclaration) {
        use ResourceState::*;
        states
            .transition(FrameResource::Depth, DepthWrite, DepthRead)
            .transition(FrameResource::Output, UnorderedAccess, RenderTarget)
            .read(FrameResource::EnvironmentCube, PixelShaderResource);
    }

    fn record(&self, ctx: &mut PassContext) -> Result<()> {
        use ResourceState::*;
        ctx.transition(FrameResource::Depth, DepthWrite, DepthRead)?;
        ctx.transition(FrameResource::Output, UnorderedAccess, RenderTarget)?;
        ctx.expect_state(FrameResource::EnvironmentCube, PixelShaderResource)?;

        let output = ctx.rtv(FrameResource::Output)?;
        ctx.list.clear_render_target(output, Vec4::ZERO);
        let kernel = SkyboxKernel {
            pass_constants: ctx.frame.pass_constants,
            depth: ctx.dsv(FrameResource::Depth)?,
            environment: ctx.srv(FrameResource::EnvironmentCube)?,
            output,
        };
        // full-screen quad as a 4-vertex strip
        ctx.draw(4, 1, kernel);
        Ok(())
    }
}

struct SkyboxKernel {
    pass_constants: ResourceId,
    depth: ResourceId,
    environment: ResourceId,
    output: ResourceId,
}

impl Kernel for SkyboxKernel {
    fn label(&self) -> &str {
        "skybox"
    }

    fn accesses(&self) -> Vec<ResourceAccess> {
        vec![
            ResourceAccess::new(self.pass_constants, ResourceState::GenericRead),
            ResourceAccess::new(self.depth, ResourceState::DepthRead),
            ResourceAccess::new(self.environment, ResourceState::PixelShaderResource),
            ResourceAccess::new(self.output, ResourceState::RenderTarget),
        ]
    }

    fn execute(&self, memory: &mut ResourceMemory) -> GpuResult<()> {
        let pass: PassConstants = memory.buffer(self.pass_constants)?.read(0)?;
        let inv_view_proj = pass.inv_view_proj();
        let eye = Vec3::from_array(pass.world_eye_pos);
        let (depth, environment) = (self.depth, self.environment);

        memory.with_texture_mut(self.output, |output, memory| {
            let depth = memory.texture(depth)?;
            let environment = memory.texture(environment)?;
            let size = output.extent();
            for y in 0..size.y {
                for x in 0..size.x {
                    let coord = UVec3::new(x, y, 0);
                    // depth test: equal to the cleared far plane
                    if depth.load(coord).x < 1.0 {
                        continue;
                    }
                    let ndc = pixel_to_ndc(x, y, size.x, size.y);
                    let far = inv_view_proj.project_point3(ndc.extend(1.0));
                    let color = sample_cube(environment, (far - eye).normalize_or_zero());
                    output.store(coord, color.truncate().extend(1.0));
                }
            }
            Ok(())
        })
    }
}
