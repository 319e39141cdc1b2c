//! Deferred view reclamation under randomised allocate/free/frame sequences

use std::collections::HashMap;

use helio_gpu::{Error, GraphicsConfig, GraphicsContext, ViewPoolCapacities, ViewPoolKind, ViewRange};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

fn context(ring_size: usize) -> GraphicsContext {
    let _ = env_logger::builder().is_test(true).try_init();
    GraphicsContext::new(GraphicsConfig {
        width: 4,
        height: 4,
        ring_size,
        view_pool_capacities: ViewPoolCapacities {
            shader_resource: 32,
            ..Default::default()
        },
        ..Default::default()
    })
    .unwrap()
}

fn run_sequence(seed: u64, ring_size: usize, frames: usize) {
    let mut ctx = context(ring_size);
    let mut rng = StdRng::seed_from_u64(seed);
    let mut live: Vec<ViewRange> = Vec::new();
    let mut freed: Vec<(ViewRange, u64)> = Vec::new();
    let mut markers: HashMap<u64, u64> = HashMap::new();

    for _ in 0..frames {
        let frame = ctx.total_frame_count();
        ctx.begin_draw(&[0; 16]).unwrap();

        for _ in 0..rng.gen_range(0..6) {
            if live.is_empty() || rng.gen_bool(0.55) {
                let count = rng.gen_range(1..5);
                match ctx.views_mut().allocate(ViewPoolKind::ShaderResource, count) {
                    Ok(range) => {
                        let processed = ctx.views().current_frame();
                        for (old, freed_at) in freed.iter().filter(|(old, _)| old.overlaps(&range)) {
                            assert!(
                                processed >= freed_at + ring_size as u64,
                                "range {:?} freed at frame {} reused as {:?} at frame {}",
                                old,
                                freed_at,
                                range,
                                processed
                            );
                            let marker = markers[freed_at];
                            assert!(
                                ctx.direct_queue().is_complete(marker),
                                "frame {} (marker {}) still in flight when its view was reused",
                                freed_at,
                                marker
                            );
                        }
                        freed.retain(|(old, _)| !old.overlaps(&range));
                        live.push(range);
                    }
                    Err(Error::Exhausted { .. }) => {}
                    Err(err) => panic!("unexpected allocation error: {err}"),
                }
            } else {
                let range = live.swap_remove(rng.gen_range(0..live.len()));
                ctx.views_mut().free(range).unwrap();
                freed.push((range, frame));
            }
        }

        let marker = ctx.end_frame().unwrap();
        markers.insert(frame, marker);
        ctx.present().unwrap();
    }
}

// ============================================================================
// Properties
// ============================================================================

#[test]
fn freed_ranges_wait_a_full_ring_before_reuse() {
    for seed in 0..8 {
        run_sequence(seed, 2, 120);
    }
}

#[test]
fn longer_rings_delay_reuse_further() {
    for seed in 100..104 {
        run_sequence(seed, 3, 120);
    }
}

#[test]
fn occupancy_returns_to_zero_after_the_ring_drains() {
    let mut ctx = context(2);
    let baseline = ctx.views().pool(ViewPoolKind::ShaderResource).in_use();
    let ranges: Vec<_> = (0..4)
        .map(|_| ctx.views_mut().allocate(ViewPoolKind::ShaderResource, 3).unwrap())
        .collect();
    for range in ranges {
        ctx.views_mut().free(range).unwrap();
    }
    let pool = ctx.views().pool(ViewPoolKind::ShaderResource);
    assert_eq!(pool.in_use(), baseline);
    assert_eq!(pool.pending(), 12);

    for _ in 0..2 {
        ctx.begin_draw(&[0; 16]).unwrap();
        ctx.end_frame().unwrap();
        ctx.present().unwrap();
    }
    let pool = ctx.views().pool(ViewPoolKind::ShaderResource);
    assert_eq!(pool.pending(), 0);
    assert_eq!(pool.available(), pool.capacity() - baseline);
}
