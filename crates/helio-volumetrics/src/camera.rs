//! Camera utilities

use glam::{Mat4, UVec2, Vec3};

use crate::constants::PassConstants;

/// A perspective camera
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Camera {
    pub position: Vec3,
    pub target: Vec3,
    pub up: Vec3,
    /// Vertical field of view in radians
    pub fov_y: f32,
    pub aspect: f32,
    pub near: f32,
    pub far: f32,
}

impl Camera {
    pub fn perspective(position: Vec3, target: Vec3, fov_y: f32, aspect: f32, near: f32, far: f32) -> Self {
        Self {
            position,
            target,
            up: Vec3::Y,
            fov_y,
            aspect,
            near,
            far,
        }
    }

    pub fn view(&self) -> Mat4 {
        Mat4::look_at_rh(self.position, self.target, self.up)
    }

    pub fn projection(&self) -> Mat4 {
        Mat4::perspective_rh(self.fov_y, self.aspect, self.near, self.far)
    }

    pub fn set_aspect_ratio(&mut self, aspect: f32) {
        self.aspect = aspect;
    }
}

impl Default for Camera {
    fn default() -> Self {
        Self::perspective(
            Vec3::new(0.0, 2.0, -10.0),
            Vec3::new(0.0, 2.0, 0.0),
            std::f32::consts::FRAC_PI_4,
            16.0 / 9.0,
            0.1,
            100.0,
        )
    }
}

/// Frame timing fed into the pass constants
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct FrameTiming {
    pub total_time: f32,
    pub delta_time: f32,
}

/// Builds per-frame pass constants, remembering last frame's matrices
#[derive(Debug, Default)]
pub struct PassConstantsBuilder {
    previous: Option<(Mat4, Mat4)>,
}

impl PassConstantsBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Forgets the previous matrices; the next frame reprojects onto itself
    pub fn reset(&mut self) {
        self.previous = None;
    }

    pub fn build(&mut self, camera: &Camera, size: UVec2, timing: FrameTiming, frame_number: u64) -> PassConstants {
        let view = camera.view();
        let proj = camera.projection();
        let view_proj = proj * view;
        let (prev_view, prev_proj) = self.previous.unwrap_or((view, proj));
        self.previous = Some((view, proj));

        let (n, f) = (camera.near, camera.far);
        let size = size.max(UVec2::ONE);
        PassConstants {
            view: view.to_cols_array_2d(),
            inv_view: view.inverse().to_cols_array_2d(),
            proj: proj.to_cols_array_2d(),
            inv_proj: proj.inverse().to_cols_array_2d(),
            view_proj: view_proj.to_cols_array_2d(),
            inv_view_proj: view_proj.inverse().to_cols_array_2d(),
            prev_view: prev_view.to_cols_array_2d(),
            prev_proj: prev_proj.to_cols_array_2d(),
            prev_view_proj: (prev_proj * prev_view).to_cols_array_2d(),
            world_eye_pos: camera.position.to_array(),
            flags: 0,
            rt_size: size.to_array(),
            inv_rt_size: (1.0 / size.as_vec2()).to_array(),
            near_plane: n,
            far_plane: f,
            view_depth_to_ndc: [f / (f - n), f * n / (f - n)],
            total_time: timing.total_time,
            delta_time: timing.delta_time,
            frame_index_mod16: (frame_number % 16) as u32,
            _pad: 0,
        }
    }
}
