//! Triangle rasterization shared by the depth and geometry programs

use glam::{Vec2, Vec3, Vec4};

fn edge(a: Vec2, b: Vec2, p: Vec2) -> f32 {
    (b - a).perp_dot(p - a)
}

/// Maps NDC x/y to continuous pixel coordinates (y down)
pub(crate) fn ndc_to_screen(ndc: Vec2, width: u32, height: u32) -> Vec2 {
    Vec2::new((ndc.x * 0.5 + 0.5) * width as f32, (0.5 - ndc.y * 0.5) * height as f32)
}

/// NDC x/y of a pixel center
pub(crate) fn pixel_to_ndc(x: u32, y: u32, width: u32, height: u32) -> Vec2 {
    let uv = Vec2::new((x as f32 + 0.5) / width as f32, (y as f32 + 0.5) / height as f32);
    Vec2::new(uv.x * 2.0 - 1.0, 1.0 - uv.y * 2.0)
}

/// Calls `f(x, y, ndc_depth)` for every pixel center covered by a clip-space triangle
///
/// Triangles crossing the camera plane are dropped; fragments outside the
/// [0, 1] depth range are clipped.
pub(crate) fn rasterize_triangle(clip: [Vec4; 3], width: u32, height: u32, mut f: impl FnMut(u32, u32, f32)) {
    if clip.iter().any(|c| c.w <= 1e-6) || width == 0 || height == 0 {
        return;
    }
    let ndc: [Vec3; 3] = clip.map(|c| c.truncate() / c.w);
    let screen: [Vec2; 3] = ndc.map(|n| ndc_to_screen(n.truncate(), width, height));

    let area = edge(screen[0], screen[1], screen[2]);
    if area.abs() < 1e-9 {
        return;
    }

    let min = screen[0].min(screen[1]).min(screen[2]).floor().max(Vec2::ZERO);
    let max = screen[0].max(screen[1]).max(screen[2]).ceil().min(Vec2::new(width as f32, height as f32));
    if min.x >= max.x || min.y >= max.y {
        return;
    }

    for y in min.y as u32..max.y as u32 {
        for x in min.x as u32..max.x as u32 {
            let p = Vec2::new(x as f32 + 0.5, y as f32 + 0.5);
            let w0 = edge(screen[1], screen[2], p) / area;
            let w1 = edge(screen[2], screen[0], p) / area;
            let w2 = edge(screen[0], screen[1], p) / area;
            if w0 < 0.0 || w1 < 0.0 || w2 < 0.0 {
                continue;
            }
            let depth = w0 * ndc[0].z + w1 * ndc[1].z + w2 * ndc[2].z;
            if (0.0..=1.0).contains(&depth) {
                f(x, y, depth);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn full_screen_triangle_covers_every_pixel() {
        let clip = [
            Vec4::new(-1.0, -1.0, 0.5, 1.0),
            Vec4::new(3.0, -1.0, 0.5, 1.0),
            Vec4::new(-1.0, 3.0, 0.5, 1.0),
        ];
        let mut count = 0;
        rasterize_triangle(clip, 8, 4, |_, _, depth| {
            assert!((depth - 0.5).abs() < 1e-6);
            count += 1;
        });
        assert_eq!(count, 32);
    }

    #[test]
    fn winding_does_not_matter() {
        let a = [
            Vec4::new(-1.0, -1.0, 0.2, 1.0),
            Vec4::new(1.0, -1.0, 0.2, 1.0),
            Vec4::new(-1.0, 1.0, 0.2, 1.0),
        ];
        let b = [a[0], a[2], a[1]];
        let (mut na, mut nb) = (0, 0);
        rasterize_triangle(a, 16, 16, |_, _, _| na += 1);
        rasterize_triangle(b, 16, 16, |_, _, _| nb += 1);
        assert_eq!(na, nb);
        assert!(na > 0);
    }

    #[test]
    fn triangles_behind_the_camera_are_dropped() {
        let clip = [Vec4::new(0.0, 0.0, 0.5, -1.0); 3];
        rasterize_triangle(clip, 4, 4, |_, _, _| panic!("fragment emitted"));
    }

    #[test]
    fn pixel_centers_round_trip_through_screen_space() {
        let ndc = pixel_to_ndc(3, 1, 8, 4);
        let screen = ndc_to_screen(ndc, 8, 4);
        assert!((screen - Vec2::new(3.5, 1.5)).length() < 1e-5);
    }
}
