use glam::{UVec3, Vec3};
use helio_gpu::{Kernel, ResourceAccess, ResourceId, ResourceMemory, ResourceState, Result as GpuResult};

use super::{FramePass, FrameResource, PassContext, StateDeclaration};
use crate::config::group_count;
use crate::Result;

const DISPLAY_GAMMA: f32 = 2.2;

/// Exposure plus Reinhard, in place on the output
pub struct TonemapPass;

impl FramePass for TonemapPass {
    fn name(&self) -> &str {
        "tonemap"
    }

    fn declare_states(&self, states: &mut StateDeclaration) {
        states.read(FrameResource::Output, ResourceState::UnorderedAccess);
    }

    fn record(&self, ctx: &mut PassContext) -> Result<()> {
        ctx.expect_state(FrameResource::Output, ResourceState::UnorderedAccess)?;
        let kernel = TonemapKernel {
            output: ctx.uav(FrameResource::Output)?,
            exposure: ctx.frame.tonemap_exposure,
        };
        let size = ctx.frame.output_size;
        ctx.dispatch([group_count(size.x), group_count(size.y), 1], kernel);
        Ok(())
    }
}

pub(crate) fn tonemap(color: Vec3, exposure: f32) -> Vec3 {
    let exposed = (color * exposure).max(Vec3::ZERO);
    (exposed / (Vec3::ONE + exposed)).powf(1.0 / DISPLAY_GAMMA)
}

struct TonemapKernel {
    output: ResourceId,
    exposure: f32,
}

impl Kernel for TonemapKernel {
    fn label(&self) -> &str {
        "tonemap"
    }

    fn accesses(&self) -> Vec<ResourceAccess> {
        vec![ResourceAccess::new(self.output, ResourceState::UnorderedAccess)]
    }

    fn execute(&self, memory: &mut ResourceMemory) -> GpuResult<()> {
        let output = memory.texture_mut(self.output)?;
        let size = output.extent();
        for y in 0..size.y {
            for x in 0..size.x {
                let coord = UVec3::new(x, y, 0);
                let texel = output.load(coord);
                output.store(coord, tonemap(texel.truncate(), self.exposure).extend(texel.w));
            }
        }
        Ok(())
    }
}
