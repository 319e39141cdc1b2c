//! Temporal accumulation and density purity of the froxel volumes

mod common;

use common::*;
use glam::{Vec3, Vec4};
use helio_gpu::GraphicsContext;
use helio_volumetrics::{FrameResource, GlobalFog, LightSet, PointLight, Renderer, RendererConfig, Scene};

fn renderer(config: RendererConfig) -> (GraphicsContext, Renderer) {
    let mut ctx = context(16, 16);
    let renderer = Renderer::new(&mut ctx, without_ambient(config)).unwrap();
    (ctx, renderer)
}

fn frame_and_read(
    ctx: &mut GraphicsContext,
    renderer: &mut Renderer,
    scene: &Scene,
    lights: &LightSet,
    fog: &GlobalFog,
    resource: FrameResource,
) -> Vec<Vec4> {
    render_frames(ctx, renderer, scene, lights, fog, 1);
    renderer.read_back(ctx, resource).unwrap()
}

fn rgb_sum(texels: &[Vec4]) -> f32 {
    texels.iter().map(|t| t.x + t.y + t.z).sum()
}

// ---------------------------------------------------------------------------
// Reprojection
// ---------------------------------------------------------------------------

#[test]
fn integrated_volume_does_not_drift_without_reprojection() {
    let (mut ctx, mut renderer) = renderer(RendererConfig {
        use_temporal_reprojection: false,
        ..small_config()
    });
    let (scene, lights, fog) = (empty_scene(), sun_only(), fog(0.7));

    let first = frame_and_read(&mut ctx, &mut renderer, &scene, &lights, &fog, FrameResource::IntegratedVolume);
    let second = frame_and_read(&mut ctx, &mut renderer, &scene, &lights, &fog, FrameResource::IntegratedVolume);
    assert!(rgb_sum(&first) > 0.0);
    assert_eq!(approx_texels(&first, &second, EPSILON), None);
}

#[test]
fn full_history_weight_retains_the_first_frame() {
    let (mut ctx, mut renderer) = renderer(RendererConfig {
        use_temporal_reprojection: true,
        history_weight: 1.0,
        ..small_config()
    });
    let (scene, lights) = (empty_scene(), sun_only());

    let first = frame_and_read(&mut ctx, &mut renderer, &scene, &lights, &fog(0.7), FrameResource::IntegratedVolume);
    // brighter fog this frame; full retention keeps last frame's scattering
    let second = frame_and_read(&mut ctx, &mut renderer, &scene, &lights, &fog(0.95), FrameResource::IntegratedVolume);
    assert!(rgb_sum(&first) > 0.0);
    assert_eq!(approx_texels(&first, &second, 1e-3), None);
}

#[test]
fn history_reset_takes_the_new_sample() {
    let (mut ctx, mut renderer) = renderer(RendererConfig {
        use_temporal_reprojection: true,
        history_weight: 1.0,
        ..small_config()
    });
    let (scene, lights) = (empty_scene(), sun_only());

    let first = frame_and_read(&mut ctx, &mut renderer, &scene, &lights, &fog(0.2), FrameResource::IntegratedVolume);
    renderer.reset_history();
    assert!(!renderer.volumetrics().history_valid());
    let reset = frame_and_read(&mut ctx, &mut renderer, &scene, &lights, &fog(0.8), FrameResource::IntegratedVolume);
    assert!(rgb_sum(&reset) > 2.0 * rgb_sum(&first));
}

#[test]
fn history_volumes_alternate() {
    let (mut ctx, mut renderer) = renderer(small_config());
    let (scene, lights, fog) = (empty_scene(), sun_only(), fog(0.5));
    let mut written = Vec::new();
    for _ in 0..4 {
        written.push(renderer.volumetrics().scattering_volume());
        render_frames(&mut ctx, &mut renderer, &scene, &lights, &fog, 1);
    }
    assert_ne!(written[0], written[1]);
    assert_eq!(written[0], written[2]);
    assert_eq!(written[1], written[3]);
}

// ---------------------------------------------------------------------------
// Density
// ---------------------------------------------------------------------------

#[test]
fn density_ignores_lights_jitter_and_history() {
    let (mut ctx, mut renderer) = renderer(small_config());
    let (scene, fog) = (ground_scene(), fog(0.6));

    let mut busy = sun_only();
    busy.sun.intensity = 7.0;
    busy.add_point_light(PointLight::new(Vec3::new(0.0, 3.0, 0.0), Vec3::ONE, 50.0, 10.0))
        .unwrap();

    render_frames(&mut ctx, &mut renderer, &scene, &sun_only(), &fog, 1);
    let a0 = renderer.read_back(&ctx, FrameResource::VBufferA).unwrap();
    let b0 = renderer.read_back(&ctx, FrameResource::VBufferB).unwrap();

    for lights in [busy, sun_only()] {
        render_frames(&mut ctx, &mut renderer, &scene, &lights, &fog, 1);
        assert_eq!(renderer.read_back(&ctx, FrameResource::VBufferA).unwrap(), a0);
        assert_eq!(renderer.read_back(&ctx, FrameResource::VBufferB).unwrap(), b0);
    }
    assert!(a0.iter().any(|t| t.w > 0.0));
}

#[test]
fn scattering_flags_remove_their_contribution() {
    use helio_volumetrics::VolumeFlags;
    let inscatter = |flags: VolumeFlags| {
        let (mut ctx, mut renderer) = renderer(RendererConfig {
            use_temporal_reprojection: false,
            volume_flags: flags,
            ..small_config()
        });
        let mut lights = sun_only();
        lights
            .add_point_light(PointLight::new(Vec3::new(0.0, 2.0, 5.0), Vec3::ONE, 80.0, 15.0))
            .unwrap();
        let texels = frame_and_read(
            &mut ctx,
            &mut renderer,
            &empty_scene(),
            &lights,
            &fog(0.8),
            FrameResource::ScatteringHistory,
        );
        rgb_sum(&texels)
    };
    let all = inscatter(VolumeFlags::empty());
    let no_sun = inscatter(VolumeFlags::DISABLE_SUN);
    let dark = inscatter(VolumeFlags::DISABLE_SUN | VolumeFlags::DISABLE_POINT_LIGHTS);
    assert!(all > no_sun && no_sun > dark, "{} {} {}", all, no_sun, dark);
    assert!(approx(dark, 0.0, EPSILON));
}
