//! GPU-visible constant layouts
//!
//! All blocks are `#[repr(C)]` plain data written into per-frame upload
//! buffers; matrices are stored column-major.

use glam::Mat4;

/// Per-frame camera and timing constants
#[repr(C)]
#[derive(Copy, Clone, Debug, bytemuck::Pod, bytemuck::Zeroable)]
pub struct PassConstants {
    pub view: [[f32; 4]; 4],
    pub inv_view: [[f32; 4]; 4],
    pub proj: [[f32; 4]; 4],
    pub inv_proj: [[f32; 4]; 4],
    pub view_proj: [[f32; 4]; 4],
    pub inv_view_proj: [[f32; 4]; 4],
    pub prev_view: [[f32; 4]; 4],
    pub prev_proj: [[f32; 4]; 4],
    pub prev_view_proj: [[f32; 4]; 4],
    pub world_eye_pos: [f32; 3],
    pub flags: u32,
    pub rt_size: [u32; 2],
    pub inv_rt_size: [f32; 2],
    pub near_plane: f32,
    pub far_plane: f32,
    /// `ndc = x - y / view_depth`
    pub view_depth_to_ndc: [f32; 2],
    pub total_time: f32,
    pub delta_time: f32,
    pub frame_index_mod16: u32,
    pub _pad: u32,
}

impl PassConstants {
    pub fn view(&self) -> Mat4 {
        Mat4::from_cols_array_2d(&self.view)
    }

    pub fn inv_view(&self) -> Mat4 {
        Mat4::from_cols_array_2d(&self.inv_view)
    }

    pub fn inv_proj(&self) -> Mat4 {
        Mat4::from_cols_array_2d(&self.inv_proj)
    }

    pub fn view_proj(&self) -> Mat4 {
        Mat4::from_cols_array_2d(&self.view_proj)
    }

    pub fn inv_view_proj(&self) -> Mat4 {
        Mat4::from_cols_array_2d(&self.inv_view_proj)
    }

    pub fn prev_view(&self) -> Mat4 {
        Mat4::from_cols_array_2d(&self.prev_view)
    }

    pub fn prev_view_proj(&self) -> Mat4 {
        Mat4::from_cols_array_2d(&self.prev_view_proj)
    }

    /// Positive view-space distance of an NDC depth value
    pub fn ndc_to_view_depth(&self, ndc: f32) -> f32 {
        let [a, b] = self.view_depth_to_ndc;
        b / (a - ndc).max(1e-6)
    }

    pub fn view_depth_to_ndc(&self, depth: f32) -> f32 {
        let [a, b] = self.view_depth_to_ndc;
        a - b / depth.max(1e-6)
    }
}

#[repr(C)]
#[derive(Copy, Clone, Debug, bytemuck::Pod, bytemuck::Zeroable)]
pub struct GpuDirectionalLight {
    /// Direction the light travels in
    pub direction: [f32; 3],
    pub intensity: f32,
    pub color: [f32; 3],
    pub use_esm: u32,
    pub view_projection: [[f32; 4]; 4],
}

/// Header of the per-frame light buffer; point lights follow it
#[repr(C)]
#[derive(Copy, Clone, Debug, bytemuck::Pod, bytemuck::Zeroable)]
pub struct LightingConstants {
    pub sun: GpuDirectionalLight,
    pub ambient_intensity: f32,
    pub point_light_count: u32,
    pub esm_exponent: f32,
    pub shadow_bias: f32,
}

impl LightingConstants {
    pub const SIZE: u64 = std::mem::size_of::<Self>() as u64;
}

#[repr(C)]
#[derive(Copy, Clone, Debug, Default, PartialEq, bytemuck::Pod, bytemuck::Zeroable)]
pub struct GpuPointLight {
    pub position: [f32; 3],
    pub range: f32,
    pub color: [f32; 3],
    pub intensity: f32,
}

#[repr(C)]
#[derive(Copy, Clone, Debug, Default, PartialEq, bytemuck::Pod, bytemuck::Zeroable)]
pub struct GpuMaterial {
    pub albedo: [f32; 3],
    pub roughness: f32,
    pub metalness: f32,
    pub _pad: [f32; 3],
}

#[repr(C)]
#[derive(Copy, Clone, Debug, PartialEq, bytemuck::Pod, bytemuck::Zeroable)]
pub struct VolumetricsConstants {
    pub volume_resolution: [u32; 3],
    pub max_volume_distance: f32,
    pub use_temporal_reprojection: u32,
    pub light_scattering_jitter_multiplier: f32,
    pub history_weight: f32,
    pub flags: u32,
    /// Froxel-space offset of this frame's scattering samples
    pub jitter: [f32; 3],
    /// Zero until the history volume holds a completed frame
    pub history_valid: u32,
}

#[repr(C)]
#[derive(Copy, Clone, Debug, PartialEq, bytemuck::Pod, bytemuck::Zeroable)]
pub struct LightScatteringConstants {
    pub depth_buffer_dimensions: [u32; 2],
    pub prev_depth_buffer_dimensions: [u32; 2],
}

#[repr(C)]
#[derive(Copy, Clone, Debug, PartialEq, bytemuck::Pod, bytemuck::Zeroable)]
pub struct GlobalFogConstants {
    pub albedo: [f32; 3],
    pub extinction: f32,
    pub emission: [f32; 3],
    pub anisotropy: f32,
    pub center: [f32; 3],
    pub max_height: f32,
    pub height_smoothing: f32,
    pub radius: f32,
    pub radius_smoothing: f32,
    pub _pad: f32,
}

/// Everything the volume stages read, uploaded as one block per frame
#[repr(C)]
#[derive(Copy, Clone, Debug, PartialEq, bytemuck::Pod, bytemuck::Zeroable)]
pub struct VolumetricFrameConstants {
    pub volume: VolumetricsConstants,
    pub scattering: LightScatteringConstants,
    pub fog: GlobalFogConstants,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn layouts_are_sixteen_byte_multiples() {
        assert_eq!(std::mem::size_of::<PassConstants>() % 16, 0);
        assert_eq!(std::mem::size_of::<LightingConstants>() % 16, 0);
        assert_eq!(std::mem::size_of::<GpuPointLight>(), 32);
        assert_eq!(std::mem::size_of::<GpuMaterial>(), 32);
        assert_eq!(std::mem::size_of::<VolumetricFrameConstants>(), 128);
    }

    #[test]
    fn depth_conversion_round_trips() {
        let (n, f) = (0.1f32, 100.0f32);
        let constants = PassConstants {
            view_depth_to_ndc: [f / (f - n), f * n / (f - n)],
            ..bytemuck::Zeroable::zeroed()
        };
        assert!(constants.view_depth_to_ndc(n).abs() < 1e-5);
        assert!((constants.view_depth_to_ndc(f) - 1.0).abs() < 1e-5);
        let d = constants.ndc_to_view_depth(constants.view_depth_to_ndc(12.5));
        assert!((d - 12.5).abs() < 1e-3);
    }
}
