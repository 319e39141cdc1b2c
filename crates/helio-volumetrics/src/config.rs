//! Renderer configuration

use glam::{Mat4, UVec3, Vec3};

use crate::{Error, Result};

/// Compute group edge length used by every volume and screen-space dispatch
pub const GROUP_SIZE: u32 = 8;

/// Exponent of the exponential shadow map
pub const ESM_EXPONENT: f32 = 80.0;

bitflags::bitflags! {
    /// Contributions the light-scattering stage may skip
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct VolumeFlags: u32 {
        const DISABLE_AMBIENT = 1;
        const DISABLE_SUN = 2;
        const DISABLE_POINT_LIGHTS = 4;
    }
}

/// Directional shadow projection
///
/// The extent and backoff are tuned to the scale of a scene; treat them as
/// per-scenario settings.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ShadowSetup {
    /// Shadow map edge in texels
    pub map_size: u32,
    /// Width and height of the orthographic light frustum
    pub ortho_extent: f32,
    pub near: f32,
    pub far: f32,
    /// Distance the light camera is pulled back from `focus` along the light direction
    pub backoff: f32,
    /// Point the light camera looks at
    pub focus: Vec3,
    /// Depth bias applied when comparing against the raw shadow map
    pub bias: f32,
    /// Sample the blurred exponential shadow map instead of the raw depth
    pub use_esm: bool,
}

impl Default for ShadowSetup {
    fn default() -> Self {
        Self {
            map_size: 1024,
            ortho_extent: 20.0,
            near: 0.1,
            far: 100.0,
            backoff: 10.0,
            focus: Vec3::ZERO,
            bias: 0.005,
            use_esm: false,
        }
    }
}

impl ShadowSetup {
    pub fn with_map_size(mut self, size: u32) -> Self {
        self.map_size = size;
        self
    }

    pub fn with_extent(mut self, extent: f32, backoff: f32) -> Self {
        self.ortho_extent = extent;
        self.backoff = backoff;
        self
    }

    pub fn with_esm(mut self, enabled: bool) -> Self {
        self.use_esm = enabled;
        self
    }

    /// Edge of the quarter-resolution exponential shadow map
    pub fn esm_size(&self) -> u32 {
        (self.map_size / 4).max(1)
    }

    /// View-projection of the light camera for a light travelling along `direction`
    pub fn view_projection(&self, direction: Vec3) -> Mat4 {
        let dir = direction.try_normalize().unwrap_or(Vec3::NEG_Y);
        let eye = self.focus - dir * self.backoff;
        let up = if dir.abs().dot(Vec3::Y) > 0.99 { Vec3::Z } else { Vec3::Y };
        let view = Mat4::look_at_rh(eye, self.focus, up);
        let half = self.ortho_extent * 0.5;
        let proj = Mat4::orthographic_rh(-half, half, -half, half, self.near, self.far);
        proj * view
    }
}

/// Renderer configuration
///
/// Fixed at construction; only the output resolution may change afterwards.
#[derive(Debug, Clone)]
pub struct RendererConfig {
    /// Froxel grid size; every axis must be a multiple of [`GROUP_SIZE`]
    pub froxel_resolution: UVec3,
    /// View-space distance covered by the far end of the froxel grid
    pub max_volume_distance: f32,
    /// Share of the reprojected history kept each frame
    pub history_weight: f32,
    pub use_temporal_reprojection: bool,
    /// Scale of the per-frame froxel jitter
    pub light_scattering_jitter_multiplier: f32,
    pub volume_flags: VolumeFlags,
    pub max_point_lights: u32,
    pub max_instances: u32,
    pub max_materials: u32,
    pub shadow: ShadowSetup,
    /// Exposure applied before tonemapping
    pub tonemap_exposure: f32,
    /// Edge of the source environment cubemap faces
    pub environment_size: u32,
    /// Edge of the prefiltered environment cubemap faces
    pub prefiltered_size: u32,
}

impl Default for RendererConfig {
    fn default() -> Self {
        Self {
            froxel_resolution: UVec3::new(512, 288, 128),
            max_volume_distance: 100.0,
            history_weight: 0.9,
            use_temporal_reprojection: true,
            light_scattering_jitter_multiplier: 1.0,
            volume_flags: VolumeFlags::empty(),
            max_point_lights: 16,
            max_instances: 1024,
            max_materials: 64,
            shadow: ShadowSetup::default(),
            tonemap_exposure: 1.0,
            environment_size: 16,
            prefiltered_size: 8,
        }
    }
}

impl RendererConfig {
    /// Rejects configurations the pipeline cannot run with
    pub fn validate(&self) -> Result<()> {
        let res = self.froxel_resolution;
        if res.min_element() == 0 || res.x % GROUP_SIZE != 0 || res.y % GROUP_SIZE != 0 || res.z % GROUP_SIZE != 0 {
            return Err(Error::Config(format!(
                "froxel resolution {}x{}x{} must be a non-zero multiple of {}",
                res.x, res.y, res.z, GROUP_SIZE
            )));
        }
        if !(self.max_volume_distance > 0.0) {
            return Err(Error::Config(format!(
                "max_volume_distance must be positive, got {}",
                self.max_volume_distance
            )));
        }
        if !(0.0..=1.0).contains(&self.history_weight) {
            return Err(Error::Config(format!(
                "history_weight must lie in [0, 1], got {}",
                self.history_weight
            )));
        }
        if self.shadow.map_size < 4 || self.shadow.ortho_extent <= 0.0 || self.shadow.far <= self.shadow.near {
            return Err(Error::Config(format!("invalid shadow setup {:?}", self.shadow)));
        }
        if self.environment_size == 0 || self.prefiltered_size == 0 {
            return Err(Error::Config("environment cubemaps need a non-zero size".into()));
        }
        Ok(())
    }

    /// Dispatch group counts of the three volume stages
    pub fn volume_groups(&self) -> [u32; 3] {
        let res = self.froxel_resolution / GROUP_SIZE;
        [res.x, res.y, res.z]
    }
}

/// Group count covering `size` with [`GROUP_SIZE`] threads
pub fn group_count(size: u32) -> u32 {
    size.div_ceil(GROUP_SIZE)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_is_valid() {
        let config = RendererConfig::default();
        config.validate().unwrap();
        assert_eq!(config.volume_groups(), [64, 36, 16]);
    }

    #[test]
    fn misaligned_froxel_grid_is_fatal() {
        let config = RendererConfig {
            froxel_resolution: UVec3::new(64, 36, 32),
            ..Default::default()
        };
        assert!(matches!(config.validate(), Err(Error::Config(_))));
    }

    #[test]
    fn out_of_range_history_weight_is_rejected() {
        let config = RendererConfig {
            history_weight: 1.5,
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn shadow_projection_maps_focus_to_center() {
        let setup = ShadowSetup::default();
        let clip = setup.view_projection(Vec3::new(0.0, -0.9, 0.1)) * setup.focus.extend(1.0);
        let ndc = clip.truncate() / clip.w;
        assert!(ndc.x.abs() < 1e-5 && ndc.y.abs() < 1e-5);
        assert!(ndc.z > 0.0 && ndc.z < 1.0);
    }

    #[test]
    fn group_count_rounds_up() {
        assert_eq!(group_count(64), 8);
        assert_eq!(group_count(65), 9);
        assert_eq!(group_count(1), 1);
    }
}
