//! Froxel-space mapping
//!
//! Froxel space is `uvw` in [0, 1]^3: `uv` follows the screen (y down) and
//! `w` is a non-linear function of view depth that spends more slices close
//! to the camera.

use glam::{Mat4, UVec3, Vec2, Vec3};

/// Power of the slice distribution: `depth = max_distance * w^p`
pub const DEPTH_DISTRIBUTION: f32 = 2.0;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct FroxelMapping {
    pub resolution: UVec3,
    pub max_distance: f32,
}

impl FroxelMapping {
    pub fn new(resolution: UVec3, max_distance: f32) -> Self {
        Self {
            resolution,
            max_distance,
        }
    }

    pub fn slice_to_depth(&self, w: f32) -> f32 {
        self.max_distance * w.max(0.0).powf(DEPTH_DISTRIBUTION)
    }

    pub fn depth_to_slice(&self, depth: f32) -> f32 {
        (depth.max(0.0) / self.max_distance).powf(1.0 / DEPTH_DISTRIBUTION)
    }

    pub fn cell_center(&self, cell: UVec3) -> Vec3 {
        (cell.as_vec3() + Vec3::splat(0.5)) / self.resolution.as_vec3()
    }

    /// View-depth extent of slice `k`
    pub fn slice_thickness(&self, k: u32) -> f32 {
        let z = self.resolution.z as f32;
        self.slice_to_depth((k + 1) as f32 / z) - self.slice_to_depth(k as f32 / z)
    }

    /// World position of a froxel-space point
    pub fn uvw_to_world(&self, uvw: Vec3, inv_proj: Mat4, inv_view: Mat4) -> Vec3 {
        let ndc = Vec2::new(uvw.x * 2.0 - 1.0, 1.0 - uvw.y * 2.0);
        let far = inv_proj.project_point3(ndc.extend(1.0));
        let ray = far / -far.z;
        inv_view.transform_point3(ray * self.slice_to_depth(uvw.z))
    }

    /// Froxel-space coordinate of a world position seen through `view`/`view_proj`
    ///
    /// `None` when the point is behind the camera; the result may lie outside
    /// the unit cube.
    pub fn world_to_uvw(&self, world: Vec3, view: Mat4, view_proj: Mat4) -> Option<Vec3> {
        let clip = view_proj * world.extend(1.0);
        if clip.w <= 1e-6 {
            return None;
        }
        let ndc = clip.truncate().truncate() / clip.w;
        let depth = -view.transform_point3(world).z;
        Some(Vec3::new(ndc.x * 0.5 + 0.5, 0.5 - ndc.y * 0.5, self.depth_to_slice(depth)))
    }
}

/// Radical inverse of `index` in `base`
pub fn halton(mut index: u32, base: u32) -> f32 {
    let mut result = 0.0;
    let mut fraction = 1.0;
    let inv_base = 1.0 / base as f32;
    while index > 0 {
        fraction *= inv_base;
        result += fraction * (index % base) as f32;
        index /= base;
    }
    result
}

/// Froxel-space jitter for a frame, centred on zero and scaled by `multiplier` cells
pub fn jitter_offset(frame_index_mod16: u32, multiplier: f32) -> Vec3 {
    let i = frame_index_mod16 % 16 + 1;
    (Vec3::new(halton(i, 2), halton(i, 3), halton(i, 5)) - Vec3::splat(0.5)) * multiplier
}
