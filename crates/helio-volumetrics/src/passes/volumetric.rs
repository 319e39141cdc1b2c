//! Volumetric light transport
//!
//! Density -> scattering (with temporal reprojection) -> integration -> apply.
//! Every volume leaves the pass in the state it entered, so the history pair
//! can swap roles between frames without extra transitions.

use helio_gpu::ResourceState;

use super::{FramePass, FrameResource, PassContext, StateDeclaration};
use crate::config::{group_count, GROUP_SIZE};
use crate::volumetric::kernels::{ApplyKernel, DensityKernel, IntegrationKernel, ScatteringKernel};
use crate::Result;

pub struct VolumetricPass;

impl FramePass for VolumetricPass {
    fn name(&self) -> &str {
        "volumetric"
    }

    fn declare_states(&self, states: &mut StateDeclaration) {
        use ResourceState::*;
        for volume in [
            FrameResource::VBufferA,
            FrameResource::VBufferB,
            FrameResource::Scattering,
            FrameResource::IntegratedVolume,
        ] {
            states.transition(volume, NonPixelShaderResource, NonPixelShaderResource);
        }
        for read in [
            FrameResource::ScatteringHistory,
            FrameResource::Depth,
            FrameResource::PrevDepth,
            FrameResource::ShadowMap,
            FrameResource::EsmTarget,
            FrameResource::Irradiance,
        ] {
            states.read(read, NonPixelShaderResource);
        }
        states.read(FrameResource::Output, UnorderedAccess);
    }

    fn record(&self, ctx: &mut PassContext) -> Result<()> {
        use ResourceState::*;
        let frame = ctx.frame;
        let res = frame.froxel_resolution;
        let volume_groups = [res.x / GROUP_SIZE, res.y / GROUP_SIZE, res.z / GROUP_SIZE];

        ctx.transition(FrameResource::VBufferA, NonPixelShaderResource, UnorderedAccess)?;
        ctx.transition(FrameResource::VBufferB, NonPixelShaderResource, UnorderedAccess)?;
        let density = DensityKernel {
            pass_constants: frame.pass_constants,
            volume_constants: frame.volumetrics,
            vbuffer_a: ctx.uav(FrameResource::VBufferA)?,
            vbuffer_b: ctx.uav(FrameResource::VBufferB)?,
        };
        ctx.dispatch(volume_groups, density);
        ctx.transition(FrameResource::VBufferA, UnorderedAccess, NonPixelShaderResource)?;
        ctx.transition(FrameResource::VBufferB, UnorderedAccess, NonPixelShaderResource)?;

        ctx.transition(FrameResource::Scattering, NonPixelShaderResource, UnorderedAccess)?;
        for read in [
            FrameResource::ScatteringHistory,
            FrameResource::Depth,
            FrameResource::PrevDepth,
            FrameResource::ShadowMap,
            FrameResource::EsmTarget,
            FrameResource::Irradiance,
        ] {
            ctx.expect_state(read, NonPixelShaderResource)?;
        }
        let scattering = ScatteringKernel {
            pass_constants: frame.pass_constants,
            volume_constants: frame.volumetrics,
            lighting: frame.lighting,
            vbuffer_a: ctx.srv(FrameResource::VBufferA)?,
            vbuffer_b: ctx.srv(FrameResource::VBufferB)?,
            history: ctx.srv(FrameResource::ScatteringHistory)?,
            depth: ctx.srv(FrameResource::Depth)?,
            prev_depth: ctx.srv(FrameResource::PrevDepth)?,
            shadow_map: ctx.srv(FrameResource::ShadowMap)?,
            esm: ctx.srv(FrameResource::EsmTarget)?,
            irradiance: ctx.srv(FrameResource::Irradiance)?,
            target: ctx.uav(FrameResource::Scattering)?,
        };
        ctx.dispatch(volume_groups, scattering);
        ctx.transition(FrameResource::Scattering, UnorderedAccess, NonPixelShaderResource)?;

        ctx.transition(FrameResource::IntegratedVolume, NonPixelShaderResource, UnorderedAccess)?;
        let integration = IntegrationKernel {
            volume_constants: frame.volumetrics,
            scattering: ctx.srv(FrameResource::Scattering)?,
            target: ctx.uav(FrameResource::IntegratedVolume)?,
        };
        // one thread per column: the depth axis is walked inside the kernel
        ctx.dispatch([volume_groups[0], volume_groups[1], 1], integration);
        ctx.transition(FrameResource::IntegratedVolume, UnorderedAccess, NonPixelShaderResource)?;

        ctx.expect_state(FrameResource::Output, UnorderedAccess)?;
        let apply = ApplyKernel {
            pass_constants: frame.pass_constants,
            volume_constants: frame.volumetrics,
            depth: ctx.srv(FrameResource::Depth)?,
            integrated: ctx.srv(FrameResource::IntegratedVolume)?,
            output: ctx.uav(FrameResource::Output)?,
        };
        let size = frame.output_size;
        ctx.dispatch([group_count(size.x), group_count(size.y), 1], apply);
        Ok(())
    }
}
