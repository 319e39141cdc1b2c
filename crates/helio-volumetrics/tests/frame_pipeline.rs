//! End-to-end frame scenarios: fog response, resize, pass contracts, device loss

mod common;

use common::*;
use glam::{UVec2, UVec3};
use helio_gpu::{CommandList, QueueKind, ResourceState};
use helio_volumetrics::passes::{GeometryPass, LightingPass, ShadowPass, SkyboxPass, TonemapPass, VolumetricPass};
use helio_volumetrics::{
    audit_pass_order, average_luminance, FramePass, FrameResource, Renderer, RendererConfig, ShadowSetup, VolumeFlags,
};

// ---------------------------------------------------------------------------
// Fog response
// ---------------------------------------------------------------------------

fn fog_luminance(albedo: f32, history_weight: f32, use_temporal_reprojection: bool) -> f32 {
    let mut ctx = context(32, 24);
    let config = RendererConfig {
        froxel_resolution: UVec3::new(64, 40, 32),
        max_volume_distance: 50.0,
        history_weight,
        use_temporal_reprojection,
        volume_flags: VolumeFlags::DISABLE_AMBIENT,
        shadow: shadow(),
        ..Default::default()
    };
    let mut renderer = Renderer::new(&mut ctx, config).unwrap();
    render_frames(&mut ctx, &mut renderer, &ground_scene(), &sun_only(), &fog(albedo), 3);
    let output = renderer.read_back(&ctx, FrameResource::Output).unwrap();
    assert!(output.iter().all(|t| t.is_finite()));
    average_luminance(&output)
}

#[test]
fn brighter_fog_albedo_brightens_the_frame() {
    let luminance: Vec<f32> = [0.2, 0.5, 0.9]
        .into_iter()
        .map(|albedo| fog_luminance(albedo, 0.9, false))
        .collect();
    for pair in luminance.windows(2) {
        assert!(pair[1] > pair[0], "luminance not increasing: {:?}", luminance);
    }
}

#[test]
fn history_weight_is_inert_without_reprojection() {
    let light = fog_luminance(0.6, 0.1, false);
    let heavy = fog_luminance(0.6, 0.95, false);
    assert!(approx(light, heavy, EPSILON), "{} vs {}", light, heavy);
}

#[test]
fn froxel_grid_must_align_with_dispatch_groups() {
    let mut ctx = context(16, 16);
    let config = RendererConfig {
        froxel_resolution: UVec3::new(64, 36, 32),
        ..small_config()
    };
    let err = Renderer::new(&mut ctx, config).err().unwrap();
    assert!(matches!(err, helio_volumetrics::Error::Config(_)), "{err}");
}

// ---------------------------------------------------------------------------
// Resize
// ---------------------------------------------------------------------------

#[test]
fn resize_keeps_view_occupancy_and_samples_safely() {
    let mut ctx = context(32, 24);
    let config = RendererConfig {
        shadow: ShadowSetup::default().with_map_size(32).with_esm(true),
        ..small_config()
    };
    let mut renderer = Renderer::new(&mut ctx, config).unwrap();
    let scene = ground_scene();
    let lights = sun_only();
    render_frames(&mut ctx, &mut renderer, &scene, &lights, &fog(0.8), 2);
    let before = ctx.views().occupancy();

    for (width, height) in [(48, 40), (16, 12)] {
        renderer.resize(&mut ctx, width, height).unwrap();
        assert_eq!(ctx.views().occupancy(), before);
        assert_ne!(renderer.gbuffer().prev_depth_size(), UVec2::new(width, height));

        render_frames(&mut ctx, &mut renderer, &scene, &lights, &fog(0.8), 3);
        ctx.wait_for_gpu_idle().unwrap();
        ctx.check_device_removed_status().unwrap();
        assert_eq!(ctx.views().occupancy(), before);
        assert_eq!(renderer.gbuffer().prev_depth_size(), UVec2::new(width, height));

        let output = renderer.read_back(&ctx, FrameResource::Output).unwrap();
        assert_eq!(output.len(), (width * height) as usize);
        assert!(output.iter().all(|t| t.is_finite()));
    }
}

#[test]
fn resize_during_a_frame_is_rejected() {
    let mut ctx = context(16, 16);
    let mut renderer = Renderer::new(&mut ctx, small_config()).unwrap();
    renderer
        .render(&mut ctx, &empty_scene(), &sun_only(), &camera(16, 16), &fog(0.5), timing(0))
        .unwrap();
    assert!(renderer.resize(&mut ctx, 32, 32).is_err());
    renderer.finish_frame(&mut ctx).unwrap();
    renderer.resize(&mut ctx, 32, 32).unwrap();
}

// ---------------------------------------------------------------------------
// View budget
// ---------------------------------------------------------------------------

fn esm_config() -> RendererConfig {
    RendererConfig {
        shadow: shadow().with_esm(true),
        ..small_config()
    }
}

#[test]
fn exhausted_views_skip_the_shadow_blur_every_frame() {
    let config = esm_config();
    let occupancy = renderer_occupancy(24, 16, &config);
    let mut ctx = exact_context(24, 16, occupancy);
    let mut renderer = Renderer::new(&mut ctx, config.clone()).unwrap();
    assert_eq!(ctx.views().occupancy(), occupancy);

    let scene = ground_scene();
    let lights = sun_only();
    render_frames(&mut ctx, &mut renderer, &scene, &lights, &fog(0.7), 4);
    ctx.wait_for_gpu_idle().unwrap();
    ctx.check_device_removed_status().unwrap();
    assert_eq!(renderer.frames_rendered(), 4);
    assert_eq!(ctx.views().occupancy(), occupancy);

    let skipped = renderer.read_back(&ctx, FrameResource::Output).unwrap();
    assert!(skipped.iter().all(|t| t.is_finite()));

    // without a blur the frame is the plain shadow-map frame
    let mut plain_ctx = context(24, 16);
    let plain_config = RendererConfig {
        shadow: shadow().with_esm(false),
        ..config
    };
    let mut plain = Renderer::new(&mut plain_ctx, plain_config).unwrap();
    render_frames(&mut plain_ctx, &mut plain, &scene, &lights, &fog(0.7), 4);
    let expected = plain.read_back(&plain_ctx, FrameResource::Output).unwrap();
    assert_eq!(approx_texels(&skipped, &expected, EPSILON), None);
}

#[test]
fn resize_fits_in_an_exactly_sized_view_budget() {
    let config = esm_config();
    let occupancy = renderer_occupancy(24, 16, &config);
    let mut ctx = exact_context(24, 16, occupancy);
    let mut renderer = Renderer::new(&mut ctx, config).unwrap();
    let scene = ground_scene();
    let lights = sun_only();
    render_frames(&mut ctx, &mut renderer, &scene, &lights, &fog(0.7), 3);

    for (width, height) in [(32, 32), (16, 12)] {
        renderer.resize(&mut ctx, width, height).unwrap();
        assert_eq!(ctx.views().occupancy(), occupancy);
        assert_eq!(renderer.gbuffer().size(), UVec2::new(width, height));

        render_frames(&mut ctx, &mut renderer, &scene, &lights, &fog(0.7), 3);
        ctx.wait_for_gpu_idle().unwrap();
        ctx.check_device_removed_status().unwrap();
        assert_eq!(ctx.views().occupancy(), occupancy);
        assert_eq!(renderer.gbuffer().prev_depth_size(), UVec2::new(width, height));

        let output = renderer.read_back(&ctx, FrameResource::Output).unwrap();
        assert_eq!(output.len(), (width * height) as usize);
        assert!(output.iter().all(|t| t.is_finite()));
    }
}

// ---------------------------------------------------------------------------
// Pass contracts
// ---------------------------------------------------------------------------

#[test]
fn fixed_pass_order_closes_every_chain() {
    let mut ctx = context(16, 16);
    let renderer = Renderer::new(&mut ctx, small_config()).unwrap();
    let audit = renderer.audit_transitions().unwrap();

    let users = |resource: FrameResource| -> Vec<String> {
        audit.chains[&resource].iter().map(|(pass, _, _)| pass.clone()).collect()
    };
    assert_eq!(users(FrameResource::Output), ["skybox", "lighting", "volumetric", "tonemap"]);
    assert_eq!(users(FrameResource::Depth), ["geometry", "skybox", "lighting", "volumetric"]);
    assert_eq!(users(FrameResource::ShadowMap), ["shadow", "lighting", "volumetric"]);

    let (_, entry, _) = &audit.chains[&FrameResource::GBufferAlbedo][1];
    assert_eq!(*entry, ResourceState::RenderTarget);
}

#[test]
fn reordered_passes_fail_the_audit() {
    let passes: [&dyn FramePass; 6] = [
        &ShadowPass,
        &GeometryPass,
        &LightingPass,
        &SkyboxPass,
        &VolumetricPass,
        &TonemapPass,
    ];
    let err = audit_pass_order(&passes).unwrap_err().to_string();
    assert!(err.contains("lighting") && err.contains("geometry"), "{err}");
}

// ---------------------------------------------------------------------------
// Device loss
// ---------------------------------------------------------------------------

#[test]
fn device_removal_stops_rendering() {
    let mut ctx = context(16, 16);
    let mut renderer = Renderer::new(&mut ctx, small_config()).unwrap();
    render_frames(&mut ctx, &mut renderer, &empty_scene(), &sun_only(), &fog(0.5), 1);

    // the output rests in UnorderedAccess, so this barrier faults on execution
    let (output, _) = renderer.output();
    let mut list = CommandList::new("stale barrier", QueueKind::Direct);
    list.transition(output, ResourceState::RenderTarget, ResourceState::UnorderedAccess);
    list.close();
    ctx.direct_queue().submit(list).unwrap();

    let err = ctx.wait_for_gpu_idle().unwrap_err();
    assert!(err.is_fatal());
    assert!(ctx.check_device_removed_status().is_err());

    let err = renderer
        .render_frame(&mut ctx, &empty_scene(), &sun_only(), &camera(16, 16), &fog(0.5), timing(1))
        .unwrap_err();
    assert!(err.is_device_removed(), "{err}");
}
