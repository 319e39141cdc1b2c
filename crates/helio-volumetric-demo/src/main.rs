//! Headless volumetric fog walkthrough
//!
//! Renders a lit courtyard under height fog while the camera orbits it,
//! logging the mean output luminance of every frame. Halfway through the
//! output is resized the way a window would be.
//!
//! Run with `RUST_LOG=info` to see the per-frame report.

use glam::{Mat4, UVec3, Vec3};
use helio_gpu::{GraphicsConfig, GraphicsContext};
use helio_volumetrics::environment::sky_gradient;
use helio_volumetrics::{
    average_luminance, Camera, DirectionalLight, FrameResource, FrameTiming, Geometry, GlobalFog, LightSet,
    Material, PointLight, Renderer, RendererConfig, Result, Scene, ShadowSetup,
};

const FRAMES: u32 = 24;
const WIDTH: u32 = 160;
const HEIGHT: u32 = 90;

fn main() -> Result<()> {
    env_logger::init();
    log::info!("Starting volumetric fog walkthrough");

    let mut ctx = GraphicsContext::new(GraphicsConfig {
        width: WIDTH,
        height: HEIGHT,
        ..Default::default()
    })?;
    let config = RendererConfig {
        froxel_resolution: UVec3::new(64, 40, 32),
        max_volume_distance: 60.0,
        shadow: ShadowSetup::default().with_map_size(256).with_extent(80.0, 40.0).with_esm(true),
        ..Default::default()
    };
    let mut renderer = Renderer::new(&mut ctx, config)?;

    let size = renderer.environment().size();
    renderer.upload_environment(
        &ctx,
        &sky_gradient(size, Vec3::new(0.25, 0.45, 0.9), Vec3::splat(0.7), Vec3::splat(0.08)),
    )?;
    let environment_marker = renderer.preprocess_environment(&ctx)?;
    log::info!("Environment job on compute marker {}", environment_marker);

    let scene = courtyard()?;
    let mut lights = LightSet::new(16)
        .with_ambient(0.3)
        .with_sun(DirectionalLight {
            direction: Vec3::new(0.3, -0.8, 0.5).normalize(),
            color: Vec3::new(1.0, 0.9, 0.75),
            intensity: 3.0,
        });
    let lanterns = [
        Vec3::new(-6.0, 2.5, 4.0),
        Vec3::new(6.0, 2.5, 4.0),
        Vec3::new(0.0, 3.0, -6.0),
    ]
    .into_iter()
    .map(|position| lights.add_point_light(PointLight::new(position, Vec3::new(1.0, 0.6, 0.3), 40.0, 12.0)))
    .collect::<Result<Vec<_>>>()?;

    let fog = GlobalFog::default()
        .with_extinction(0.04)
        .with_albedo(Vec3::splat(0.8))
        .with_anisotropy(0.3)
        .with_height(12.0, 6.0);

    for frame in 0..FRAMES {
        if frame == FRAMES / 2 {
            renderer.resize(&mut ctx, WIDTH * 2, HEIGHT * 2)?;
            log::info!("Resized output to {}x{}", ctx.width(), ctx.height());
        }

        let t = frame as f32 / FRAMES as f32;
        for (i, handle) in lanterns.iter().enumerate() {
            if let Some(light) = lights.point_light_mut(*handle) {
                light.intensity = 40.0 + 10.0 * (t * 12.0 + i as f32).sin();
            }
        }

        let angle = t * std::f32::consts::TAU;
        let camera = Camera::perspective(
            Vec3::new(angle.cos() * 18.0, 4.0, angle.sin() * 18.0),
            Vec3::new(0.0, 1.5, 0.0),
            std::f32::consts::FRAC_PI_3,
            ctx.width() as f32 / ctx.height() as f32,
            0.1,
            200.0,
        );
        let timing = FrameTiming {
            total_time: frame as f32 / 60.0,
            delta_time: 1.0 / 60.0,
        };
        renderer.render_frame(&mut ctx, &scene, &lights, &camera, &fog, timing)?;

        let output = renderer.read_back(&ctx, FrameResource::Output)?;
        log::info!("Frame {:>2}: mean luminance {:.4}", frame, average_luminance(&output));
    }

    log::info!(
        "Rendered {} frames, views still allocated (rtv, dsv, srv, sampler): {:?}",
        renderer.frames_rendered(),
        ctx.views().occupancy()
    );
    renderer.release(&mut ctx)?;
    ctx.flush_deferred()?;
    Ok(())
}

/// Ground plane with two walls and a free-standing pillar
fn courtyard() -> Result<Scene> {
    let mut scene = Scene::new(16, 8);
    let stone = scene.add_material(Material {
        albedo: Vec3::new(0.55, 0.52, 0.48),
        roughness: 0.9,
        metalness: 0.0,
    })?;
    let bronze = scene.add_material(Material {
        albedo: Vec3::new(0.8, 0.5, 0.2),
        roughness: 0.35,
        metalness: 1.0,
    })?;

    let ground = scene.add_geometry(Geometry::quad([
        Vec3::new(-40.0, 0.0, -40.0),
        Vec3::new(40.0, 0.0, -40.0),
        Vec3::new(40.0, 0.0, 40.0),
        Vec3::new(-40.0, 0.0, 40.0),
    ]));
    let wall = scene.add_geometry(Geometry::quad([
        Vec3::new(-10.0, 0.0, 0.0),
        Vec3::new(10.0, 0.0, 0.0),
        Vec3::new(10.0, 6.0, 0.0),
        Vec3::new(-10.0, 6.0, 0.0),
    ]));
    let pillar_face = scene.add_geometry(Geometry::quad([
        Vec3::new(-0.75, 0.0, 0.75),
        Vec3::new(0.75, 0.0, 0.75),
        Vec3::new(0.75, 5.0, 0.75),
        Vec3::new(-0.75, 5.0, 0.75),
    ]));

    scene.add_instance(Mat4::IDENTITY, ground, stone)?;
    scene.add_instance(Mat4::from_translation(Vec3::new(0.0, 0.0, -10.0)), wall, stone)?;
    scene.add_instance(
        Mat4::from_translation(Vec3::new(-10.0, 0.0, 0.0)) * Mat4::from_rotation_y(std::f32::consts::FRAC_PI_2),
        wall,
        stone,
    )?;
    for quarter in 0..4 {
        let rotation = Mat4::from_rotation_y(quarter as f32 * std::f32::consts::FRAC_PI_2);
        scene.add_instance(rotation, pillar_face, bronze)?;
    }
    Ok(scene)
}
