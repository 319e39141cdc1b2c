//! Frame orchestration
//!
//! The renderer owns every frame resource and runs the passes in a fixed
//! order: shadow, geometry, skybox, lighting, volumetric, tonemap. Per-frame
//! upload buffers are kept once per frame slot so a slot's data is only
//! rewritten after the GPU has retired the frame that last used it.

use std::collections::HashMap;
use std::sync::Arc;

use glam::{UVec2, Vec3, Vec4};
use helio_gpu::{
    BufferDesc, Device, GraphicsContext, ResourceId, ResourceState, TextureDesc, ViewDesc, ViewPoolKind, ViewRange,
};

use crate::camera::{Camera, FrameTiming, PassConstantsBuilder};
use crate::config::{RendererConfig, ShadowSetup};
use crate::constants::PassConstants;
use crate::environment::EnvironmentMaps;
use crate::gbuffer::GBuffer;
use crate::lights::LightSet;
use crate::passes::{
    audit_pass_order, BoundResource, FrameBindings, FramePass, FrameResource, GeometryPass, LightingPass,
    PassContext, ShadowPass, SkyboxPass, StateTracker, TonemapPass, TransitionAudit, VolumetricPass,
};
use crate::scene::Scene;
use crate::volumetric::{GlobalFog, VolumetricRenderer};
use crate::{Error, Result};

const TRANSFORM_STRIDE: u64 = std::mem::size_of::<[[f32; 4]; 4]>() as u64;
const MATERIAL_STRIDE: u64 = std::mem::size_of::<crate::constants::GpuMaterial>() as u64;

/// Sun shadow map and the exponential shadow map pair
struct ShadowTargets {
    map: ResourceId,
    esm: ResourceId,
    esm_scratch: ResourceId,
    dsv: ViewRange,
    /// shadow map SRV, ESM SRV
    srvs: ViewRange,
}

impl ShadowTargets {
    fn new(ctx: &mut GraphicsContext, setup: &ShadowSetup) -> Result<Self> {
        let device = ctx.device().clone();
        let map = device.create_texture(
            TextureDesc::d2(
                "Shadow Map",
                setup.map_size,
                setup.map_size,
                wgpu::TextureFormat::Depth32Float,
                wgpu::TextureUsages::RENDER_ATTACHMENT | wgpu::TextureUsages::TEXTURE_BINDING,
            ),
            FrameResource::ShadowMap.boundary_state(),
        )?;
        let esm_size = setup.esm_size();
        let esm_desc = |label: &str| {
            TextureDesc::d2(
                label,
                esm_size,
                esm_size,
                wgpu::TextureFormat::R32Float,
                wgpu::TextureUsages::STORAGE_BINDING | wgpu::TextureUsages::TEXTURE_BINDING,
            )
        };
        let esm = device.create_texture(esm_desc("ESM"), FrameResource::EsmTarget.boundary_state())?;
        let esm_scratch = device.create_texture(esm_desc("ESM Scratch"), FrameResource::EsmScratch.boundary_state())?;

        let views = ctx.views_mut();
        let dsv = views.allocate(ViewPoolKind::DepthStencil, 1)?;
        let srvs = views.allocate(ViewPoolKind::ShaderResource, 2)?;
        views.write_view(dsv.handle(0), ViewDesc::DepthStencil(map))?;
        views.write_view(srvs.handle(0), ViewDesc::ShaderResource(map))?;
        views.write_view(srvs.handle(1), ViewDesc::ShaderResource(esm))?;

        log::debug!("Shadow map {0}x{0}, ESM {1}x{1}", setup.map_size, esm_size);
        Ok(Self {
            map,
            esm,
            esm_scratch,
            dsv,
            srvs,
        })
    }

    /// Views the ESM blur writes through; taken for one frame at a time
    fn blur_views(&self, ctx: &mut GraphicsContext) -> Result<Option<ViewRange>> {
        let views = ctx.views_mut();
        let Some(range) = views.allocate_optional(ViewPoolKind::ShaderResource, 3, "exponential shadow map") else {
            return Ok(None);
        };
        views.write_view(range.handle(0), ViewDesc::UnorderedAccess(self.esm))?;
        views.write_view(range.handle(1), ViewDesc::ShaderResource(self.esm_scratch))?;
        views.write_view(range.handle(2), ViewDesc::UnorderedAccess(self.esm_scratch))?;
        Ok(Some(range))
    }

    fn bind(&self, resources: &mut HashMap<FrameResource, BoundResource>, blur: Option<ViewRange>) {
        let mut map = BoundResource::new(self.map);
        map.dsv = Some(self.dsv.handle(0));
        map.srv = Some(self.srvs.handle(0));
        let mut esm = BoundResource::new(self.esm);
        esm.srv = Some(self.srvs.handle(1));
        let mut scratch = BoundResource::new(self.esm_scratch);
        if let Some(range) = blur {
            esm.uav = Some(range.handle(0));
            scratch.srv = Some(range.handle(1));
            scratch.uav = Some(range.handle(2));
        }
        resources.insert(FrameResource::ShadowMap, map);
        resources.insert(FrameResource::EsmTarget, esm);
        resources.insert(FrameResource::EsmScratch, scratch);
    }

    fn release(&self, ctx: &mut GraphicsContext) -> Result<()> {
        ctx.views_mut().free(self.dsv)?;
        ctx.views_mut().free(self.srvs)?;
        for id in [self.map, self.esm, self.esm_scratch] {
            ctx.destroy_deferred(id);
        }
        Ok(())
    }
}

/// Upload buffers owned by one frame slot
#[derive(Debug, Clone, Copy)]
struct FrameBuffers {
    lighting: ResourceId,
    transforms: ResourceId,
    materials: ResourceId,
    volumetrics: ResourceId,
}

impl FrameBuffers {
    fn new(device: &Device, config: &RendererConfig, slot: usize) -> Result<Self> {
        let create = |label: &str, size: u64| {
            device.create_buffer(
                BufferDesc::new(
                    format!("{} {}", label, slot),
                    size.max(16),
                    wgpu::BufferUsages::STORAGE | wgpu::BufferUsages::COPY_DST,
                ),
                ResourceState::GenericRead,
            )
        };
        Ok(Self {
            lighting: create("Lights", LightSet::buffer_size(config.max_point_lights))?,
            transforms: create("Instance Transforms", config.max_instances as u64 * TRANSFORM_STRIDE)?,
            materials: create("Materials", config.max_materials as u64 * MATERIAL_STRIDE)?,
            volumetrics: create(
                "Volumetric Constants",
                std::mem::size_of::<crate::constants::VolumetricFrameConstants>() as u64,
            )?,
        })
    }

    fn ids(&self) -> [ResourceId; 4] {
        [self.lighting, self.transforms, self.materials, self.volumetrics]
    }
}

pub struct Renderer {
    config: RendererConfig,
    passes: Vec<Box<dyn FramePass>>,
    shadow: ShadowTargets,
    gbuffer: GBuffer,
    environment: EnvironmentMaps,
    volumetrics: VolumetricRenderer,
    frame_buffers: Vec<FrameBuffers>,
    constants: PassConstantsBuilder,
    frames_rendered: u64,
}

impl Renderer {
    /// Creates every frame resource at the context's back-buffer size
    ///
    /// Fails on configurations the pipeline cannot run with and on a pass
    /// order whose state contracts do not chain.
    pub fn new(ctx: &mut GraphicsContext, config: RendererConfig) -> Result<Self> {
        config.validate()?;
        let size = UVec2::new(ctx.width(), ctx.height());

        let shadow = ShadowTargets::new(ctx, &config.shadow)?;
        let gbuffer = GBuffer::new(ctx, size)?;
        let environment = EnvironmentMaps::new(ctx, config.environment_size, config.prefiltered_size)?;
        let volumetrics = VolumetricRenderer::new(ctx, &config)?;
        let frame_buffers = (0..ctx.ring_size())
            .map(|slot| FrameBuffers::new(ctx.device(), &config, slot))
            .collect::<Result<Vec<_>>>()?;

        let passes: Vec<Box<dyn FramePass>> = vec![
            Box::new(ShadowPass),
            Box::new(GeometryPass),
            Box::new(SkyboxPass),
            Box::new(LightingPass),
            Box::new(VolumetricPass),
            Box::new(TonemapPass),
        ];

        let renderer = Self {
            config,
            passes,
            shadow,
            gbuffer,
            environment,
            volumetrics,
            frame_buffers,
            constants: PassConstantsBuilder::new(),
            frames_rendered: 0,
        };
        renderer.audit_transitions()?;

        log::info!(
            "Renderer ready at {}x{}: passes [{}], views in use {:?}",
            size.x,
            size.y,
            renderer.pass_names().join(", "),
            ctx.views().occupancy()
        );
        Ok(renderer)
    }

    pub fn config(&self) -> &RendererConfig {
        &self.config
    }

    pub fn pass_names(&self) -> Vec<&str> {
        self.passes.iter().map(|p| p.name()).collect()
    }

    /// Statically checks the pass list's state contracts
    pub fn audit_transitions(&self) -> Result<TransitionAudit> {
        let passes: Vec<&dyn FramePass> = self.passes.iter().map(|p| p.as_ref()).collect();
        audit_pass_order(&passes)
    }

    pub fn size(&self) -> UVec2 {
        self.gbuffer.size()
    }

    pub fn frames_rendered(&self) -> u64 {
        self.frames_rendered
    }

    pub fn gbuffer(&self) -> &GBuffer {
        &self.gbuffer
    }

    pub fn environment(&self) -> &EnvironmentMaps {
        &self.environment
    }

    pub fn volumetrics(&self) -> &VolumetricRenderer {
        &self.volumetrics
    }

    pub fn volumetrics_mut(&mut self) -> &mut VolumetricRenderer {
        &mut self.volumetrics
    }

    /// Final image and the state it rests in between frames
    pub fn output(&self) -> (ResourceId, ResourceState) {
        (self.gbuffer.output(), FrameResource::Output.boundary_state())
    }

    /// Replaces the environment cube; takes effect after the next preprocessing
    pub fn upload_environment(&self, ctx: &GraphicsContext, texels: &[Vec4]) -> Result<()> {
        self.environment.upload(ctx, texels)
    }

    /// Queues the environment reduction on the compute queue
    pub fn preprocess_environment(&self, ctx: &GraphicsContext) -> Result<u64> {
        self.environment.preprocess(ctx)
    }

    /// Camera and history are both discarded; the next frame starts clean
    pub fn reset_history(&mut self) {
        self.constants.reset();
        self.volumetrics.reset_history();
    }

    fn bind(&self, resources: &mut HashMap<FrameResource, BoundResource>, blur: Option<ViewRange>) {
        self.shadow.bind(resources, blur);
        self.gbuffer.bind(resources);
        self.environment.bind(resources);
        self.volumetrics.bind(resources);
    }

    /// Physical resource currently bound as `resource`
    ///
    /// Between frames the most recently written scattering volume is the one
    /// bound as [`FrameResource::ScatteringHistory`].
    pub fn resource(&self, resource: FrameResource) -> Option<ResourceId> {
        let mut resources = HashMap::new();
        self.bind(&mut resources, None);
        resources.get(&resource).map(|b| b.id)
    }

    /// Waits for all queued work and returns the texels of `resource`
    pub fn read_back(&self, ctx: &GraphicsContext, resource: FrameResource) -> Result<Vec<Vec4>> {
        let id = self.resource(resource).ok_or_else(|| Error::Pass {
            pass: "readback".into(),
            message: format!("{:?} is not a renderer resource", resource),
        })?;
        ctx.wait_for_gpu_idle()?;
        Ok(ctx.device().read_texture(id)?)
    }

    fn upload(
        &self,
        ctx: &GraphicsContext,
        scene: &Scene,
        lights: &LightSet,
        fog: &GlobalFog,
        shadow: &ShadowSetup,
        frame_index_mod16: u32,
    ) -> Result<FrameBuffers> {
        let live = lights.point_lights().count() as u32;
        if live > self.config.max_point_lights {
            return Err(Error::Capacity(format!(
                "{} point lights exceed the light buffer's {}",
                live, self.config.max_point_lights
            )));
        }
        let transforms = scene.transform_bytes();
        if transforms.len() as u64 > self.config.max_instances as u64 * TRANSFORM_STRIDE {
            return Err(Error::Capacity(format!(
                "{} instances exceed the transform buffer's {}",
                scene.instances().len(),
                self.config.max_instances
            )));
        }
        let materials = scene.material_bytes();
        if materials.len() as u64 > self.config.max_materials as u64 * MATERIAL_STRIDE {
            return Err(Error::Capacity(format!(
                "material table exceeds the material buffer's {} entries",
                self.config.max_materials
            )));
        }

        let buffers = self.frame_buffers[ctx.frame_index()];
        let volume = self.volumetrics.frame_constants(
            fog,
            frame_index_mod16,
            self.gbuffer.depth_size(),
            self.gbuffer.prev_depth_size(),
        );
        let device = ctx.device();
        device.write_buffer(buffers.lighting, 0, &lights.to_gpu_bytes(shadow))?;
        device.write_buffer(buffers.transforms, 0, &transforms)?;
        device.write_buffer(buffers.materials, 0, &materials)?;
        device.write_buffer(buffers.volumetrics, 0, bytemuck::bytes_of(&volume))?;
        Ok(buffers)
    }

    /// Opens the frame and records all six passes into it
    ///
    /// The frame stays open afterwards so an overlay can draw into
    /// [`Renderer::output`] before [`Renderer::finish_frame`].
    pub fn render(
        &mut self,
        ctx: &mut GraphicsContext,
        scene: &Scene,
        lights: &LightSet,
        camera: &Camera,
        fog: &GlobalFog,
        timing: FrameTiming,
    ) -> Result<()> {
        ctx.check_device_removed_status()?;
        if self.gbuffer.size() != UVec2::new(ctx.width(), ctx.height()) {
            return Err(Error::Config(format!(
                "renderer is {}x{} but the back buffers are {}x{}",
                self.gbuffer.size().x,
                self.gbuffer.size().y,
                ctx.width(),
                ctx.height()
            )));
        }
        self.gbuffer.prepare_frame(ctx)?;

        let frame_number = ctx.total_frame_count();
        let constants = self.constants.build(camera, self.gbuffer.size(), timing, frame_number);
        let blur = if self.config.shadow.use_esm {
            self.shadow.blur_views(ctx)?
        } else {
            None
        };
        let encoded = self.encode(ctx, scene, lights, fog, &constants, blur);
        if let Some(range) = blur {
            ctx.views_mut().free(range)?;
        }
        encoded?;

        self.gbuffer.flip_depth();
        self.volumetrics.end_frame();
        self.frames_rendered += 1;
        log::trace!("Frame {} recorded", frame_number);
        Ok(())
    }

    /// Uploads this slot's data, opens the frame and records the passes
    fn encode(
        &self,
        ctx: &mut GraphicsContext,
        scene: &Scene,
        lights: &LightSet,
        fog: &GlobalFog,
        constants: &PassConstants,
        blur: Option<ViewRange>,
    ) -> Result<()> {
        let shadow_setup = ShadowSetup {
            use_esm: blur.is_some(),
            ..self.config.shadow
        };
        let buffers = self.upload(ctx, scene, lights, fog, &shadow_setup, constants.frame_index_mod16)?;
        ctx.begin_draw(bytemuck::bytes_of(constants))?;

        let mut resources = HashMap::new();
        self.bind(&mut resources, blur);
        let bindings = FrameBindings {
            resources,
            pass_constants: ctx.pass_constants_buffer(),
            lighting: buffers.lighting,
            transforms: buffers.transforms,
            materials: buffers.materials,
            volumetrics: buffers.volumetrics,
            draws: Arc::new(scene.draw_list()),
            output_size: self.gbuffer.size(),
            prev_depth_size: self.gbuffer.prev_depth_size(),
            froxel_resolution: self.volumetrics.resolution(),
            shadow_size: self.config.shadow.map_size,
            esm_size: self.config.shadow.esm_size(),
            use_esm: shadow_setup.use_esm,
            tonemap_exposure: self.config.tonemap_exposure,
        };
        let recorded = self.record(ctx, &bindings);
        if recorded.is_err() {
            // this call opened the list, so it must not outlive the failure
            ctx.abort_frame();
        }
        recorded
    }

    fn record(&self, ctx: &mut GraphicsContext, bindings: &FrameBindings) -> Result<()> {
        let mut tracker = StateTracker::at_boundary(bindings.resources.keys());
        let (list, views) = ctx.recording_parts()?;
        for pass in &self.passes {
            log::trace!("Recording pass '{}'", pass.name());
            list.marker(pass.name());
            let mut pass_ctx = PassContext {
                list: &mut *list,
                views,
                frame: bindings,
                tracker: &mut tracker,
                pass: pass.name(),
            };
            pass.record(&mut pass_ctx)?;
        }

        let unclosed = tracker.unclosed();
        if !unclosed.is_empty() {
            return Err(Error::Pass {
                pass: "frame end".into(),
                message: format!("resources left outside their boundary state: {:?}", unclosed),
            });
        }
        Ok(())
    }

    /// Copies the output to the back buffer, submits and presents
    pub fn finish_frame(&self, ctx: &mut GraphicsContext) -> Result<u64> {
        let (output, state) = self.output();
        ctx.copy_to_back_buffer(output, state)?;
        let marker = ctx.end_frame()?;
        ctx.present()?;
        Ok(marker)
    }

    /// One complete frame; returns the direct-queue marker it signals
    pub fn render_frame(
        &mut self,
        ctx: &mut GraphicsContext,
        scene: &Scene,
        lights: &LightSet,
        camera: &Camera,
        fog: &GlobalFog,
        timing: FrameTiming,
    ) -> Result<u64> {
        self.render(ctx, scene, lights, camera, fog, timing)?;
        self.finish_frame(ctx)
    }

    /// Recreates the resolution-dependent targets and the back buffers
    ///
    /// The froxel grid is resolution independent and survives untouched;
    /// last frame's depth keeps its old size until it is next written. The
    /// GPU is drained first and the old views are reclaimed before any new
    /// ones are allocated. On failure the renderer keeps its old size.
    pub fn resize(&mut self, ctx: &mut GraphicsContext, width: u32, height: u32) -> Result<()> {
        if width == 0 || height == 0 {
            return Err(Error::Config(format!("zero-sized output {}x{}", width, height)));
        }
        if ctx.frames().current().is_recording() {
            return Err(Error::Config("resize while a frame is recording".into()));
        }
        log::info!(
            "Resizing renderer {}x{} -> {}x{}",
            self.gbuffer.size().x,
            self.gbuffer.size().y,
            width,
            height
        );
        ctx.wait_for_gpu_idle()?;
        self.gbuffer.resize(ctx, UVec2::new(width, height))?;
        ctx.resize(width, height)?;
        Ok(())
    }

    /// Returns every view and schedules every resource for destruction
    pub fn release(self, ctx: &mut GraphicsContext) -> Result<()> {
        self.shadow.release(ctx)?;
        self.gbuffer.release(ctx)?;
        self.environment.release(ctx)?;
        self.volumetrics.release(ctx)?;
        for buffers in &self.frame_buffers {
            for id in buffers.ids() {
                ctx.destroy_deferred(id);
            }
        }
        Ok(())
    }
}

/// Mean Rec. 709 luminance of a block of texels
pub fn average_luminance(texels: &[Vec4]) -> f32 {
    if texels.is_empty() {
        return 0.0;
    }
    let weights = Vec3::new(0.2126, 0.7152, 0.0722);
    texels.iter().map(|t| t.truncate().dot(weights)).sum::<f32>() / texels.len() as f32
}

#[cfg(test)]
mod tests {
    use super::*;
    use glam::UVec3;
    use helio_gpu::GraphicsConfig;

    fn setup() -> (GraphicsContext, Renderer) {
        let mut ctx = GraphicsContext::new(GraphicsConfig {
            width: 16,
            height: 16,
            ..Default::default()
        })
        .unwrap();
        let config = RendererConfig {
            froxel_resolution: UVec3::new(8, 8, 8),
            max_volume_distance: 20.0,
            shadow: ShadowSetup::default().with_map_size(16),
            ..Default::default()
        };
        let renderer = Renderer::new(&mut ctx, config).unwrap();
        (ctx, renderer)
    }

    #[test]
    fn passes_run_in_fixed_order() {
        let (_ctx, renderer) = setup();
        assert_eq!(
            renderer.pass_names(),
            ["shadow", "geometry", "skybox", "lighting", "volumetric", "tonemap"]
        );
    }

    #[test]
    fn frame_submits_and_flips_history() {
        let (mut ctx, mut renderer) = setup();
        let scene = Scene::new(4, 4);
        let lights = LightSet::new(4);
        let history = renderer.volumetrics().history_volume();
        renderer
            .render_frame(&mut ctx, &scene, &lights, &Camera::default(), &GlobalFog::default(), FrameTiming::default())
            .unwrap();
        ctx.wait_for_gpu_idle().unwrap();
        assert_eq!(renderer.frames_rendered(), 1);
        assert_eq!(renderer.volumetrics().scattering_volume(), history);
        assert!(renderer.volumetrics().history_valid());
    }

    #[test]
    fn too_many_point_lights_is_a_capacity_error() {
        let (mut ctx, mut renderer) = setup();
        let mut lights = LightSet::new(32);
        for i in 0..17 {
            lights
                .add_point_light(crate::lights::PointLight::new(Vec3::X * i as f32, Vec3::ONE, 1.0, 2.0))
                .unwrap();
        }
        let err = renderer
            .render(
                &mut ctx,
                &Scene::new(1, 1),
                &lights,
                &Camera::default(),
                &GlobalFog::default(),
                FrameTiming::default(),
            )
            .unwrap_err();
        assert!(matches!(err, Error::Capacity(_)));
    }

    struct FailingPass;

    impl FramePass for FailingPass {
        fn name(&self) -> &str {
            "failing"
        }

        fn declare_states(&self, _states: &mut crate::passes::StateDeclaration) {}

        fn record(&self, _ctx: &mut PassContext) -> Result<()> {
            Err(Error::Pass {
                pass: "failing".into(),
                message: "refused to record".into(),
            })
        }
    }

    #[test]
    fn failed_recording_leaves_the_frame_reopenable() {
        let (mut ctx, mut renderer) = setup();
        let scene = Scene::new(4, 4);
        let lights = LightSet::new(4);
        let history = renderer.volumetrics().history_volume();

        renderer.passes.push(Box::new(FailingPass));
        let err = renderer
            .render(&mut ctx, &scene, &lights, &Camera::default(), &GlobalFog::default(), FrameTiming::default())
            .unwrap_err();
        assert!(matches!(err, Error::Pass { .. }));
        assert!(!ctx.frames().current().is_recording());
        assert_eq!(renderer.frames_rendered(), 0);
        assert_eq!(renderer.volumetrics().history_volume(), history);

        renderer.passes.pop();
        renderer
            .render_frame(&mut ctx, &scene, &lights, &Camera::default(), &GlobalFog::default(), FrameTiming::default())
            .unwrap();
        ctx.wait_for_gpu_idle().unwrap();
        assert_eq!(renderer.frames_rendered(), 1);
        ctx.check_device_removed_status().unwrap();
    }

    #[test]
    fn luminance_weights_green_highest() {
        let red = average_luminance(&[Vec4::new(1.0, 0.0, 0.0, 1.0)]);
        let green = average_luminance(&[Vec4::new(0.0, 1.0, 0.0, 1.0)]);
        assert!(green > red);
        assert_eq!(average_luminance(&[]), 0.0);
    }
}
