//! Shared scenario setup for the pipeline tests

#![allow(dead_code)]

use glam::{Mat4, UVec3, Vec3, Vec4};
use helio_gpu::{GraphicsConfig, GraphicsContext, ViewPoolCapacities};
use helio_volumetrics::{
    Camera, FrameTiming, Geometry, GlobalFog, LightSet, Material, Renderer, RendererConfig, Scene, ShadowSetup,
    VolumeFlags,
};

pub const EPSILON: f32 = 1e-4;

/// Relative comparison that degrades to absolute near zero
pub fn approx(a: f32, b: f32, eps: f32) -> bool {
    (a - b).abs() <= eps * (1.0 + a.abs().max(b.abs()))
}

pub fn approx_texels(a: &[Vec4], b: &[Vec4], eps: f32) -> Option<(usize, Vec4, Vec4)> {
    assert_eq!(a.len(), b.len());
    a.iter()
        .zip(b)
        .enumerate()
        .find(|(_, (x, y))| (0..4).any(|c| !approx(x[c], y[c], eps)))
        .map(|(i, (x, y))| (i, *x, *y))
}

pub fn context(width: u32, height: u32) -> GraphicsContext {
    let _ = env_logger::builder().is_test(true).try_init();
    GraphicsContext::new(GraphicsConfig {
        width,
        height,
        ring_size: 2,
        ..Default::default()
    })
    .unwrap()
}

/// View slots a freshly built renderer holds in each pool
pub fn renderer_occupancy(width: u32, height: u32, config: &RendererConfig) -> [u32; 4] {
    let mut ctx = context(width, height);
    let _renderer = Renderer::new(&mut ctx, config.clone()).unwrap();
    ctx.views().occupancy()
}

/// A context whose view pools hold exactly `occupancy` with nothing spare
pub fn exact_context(width: u32, height: u32, occupancy: [u32; 4]) -> GraphicsContext {
    let _ = env_logger::builder().is_test(true).try_init();
    let [render_target, depth_stencil, shader_resource, sampler] = occupancy;
    GraphicsContext::new(GraphicsConfig {
        width,
        height,
        ring_size: 2,
        view_pool_capacities: ViewPoolCapacities {
            render_target,
            depth_stencil,
            shader_resource,
            sampler,
        },
        ..Default::default()
    })
    .unwrap()
}

pub fn shadow() -> ShadowSetup {
    ShadowSetup::default().with_map_size(64).with_extent(60.0, 30.0)
}

/// Small grid suitable for many frames
pub fn small_config() -> RendererConfig {
    RendererConfig {
        froxel_resolution: UVec3::new(16, 16, 16),
        max_volume_distance: 50.0,
        shadow: shadow(),
        ..Default::default()
    }
}

pub fn camera(width: u32, height: u32) -> Camera {
    Camera::perspective(
        Vec3::new(0.0, 2.0, -10.0),
        Vec3::new(0.0, 2.0, 0.0),
        std::f32::consts::FRAC_PI_3,
        width as f32 / height as f32,
        0.1,
        100.0,
    )
}

pub fn empty_scene() -> Scene {
    Scene::new(8, 8)
}

/// A lit ground plane under the fog
pub fn ground_scene() -> Scene {
    let mut scene = Scene::new(8, 8);
    let ground = scene.add_geometry(Geometry::quad([
        Vec3::new(-30.0, 0.0, -30.0),
        Vec3::new(30.0, 0.0, -30.0),
        Vec3::new(30.0, 0.0, 30.0),
        Vec3::new(-30.0, 0.0, 30.0),
    ]));
    let material = scene
        .add_material(Material {
            albedo: Vec3::splat(0.6),
            roughness: 0.8,
            metalness: 0.0,
        })
        .unwrap();
    scene.add_instance(Mat4::IDENTITY, ground, material).unwrap();
    scene
}

/// Sun only: no point lights, no ambient
pub fn sun_only() -> LightSet {
    LightSet::new(16).with_ambient(0.0)
}

pub fn fog(albedo: f32) -> GlobalFog {
    GlobalFog::default()
        .with_extinction(0.05)
        .with_albedo(Vec3::splat(albedo))
        .with_height(20.0, 5.0)
}

pub fn timing(frame: u32) -> FrameTiming {
    FrameTiming {
        total_time: frame as f32 / 60.0,
        delta_time: 1.0 / 60.0,
    }
}

pub fn render_frames(
    ctx: &mut GraphicsContext,
    renderer: &mut Renderer,
    scene: &Scene,
    lights: &LightSet,
    fog: &GlobalFog,
    frames: u32,
) {
    let camera = camera(ctx.width(), ctx.height());
    for frame in 0..frames {
        renderer
            .render_frame(ctx, scene, lights, &camera, fog, timing(frame))
            .unwrap();
    }
}

pub fn without_ambient(config: RendererConfig) -> RendererConfig {
    RendererConfig {
        volume_flags: config.volume_flags | VolumeFlags::DISABLE_AMBIENT,
        ..config
    }
}
