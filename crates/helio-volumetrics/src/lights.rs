//! Light set and its per-frame GPU layout

use glam::Vec3;

use crate::config::{ShadowSetup, ESM_EXPONENT};
use crate::constants::{GpuDirectionalLight, GpuPointLight, LightingConstants};
use crate::{Error, Result};

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DirectionalLight {
    /// Direction the light travels in
    pub direction: Vec3,
    pub color: Vec3,
    pub intensity: f32,
}

impl Default for DirectionalLight {
    fn default() -> Self {
        Self {
            direction: Vec3::new(0.0, -0.9, 0.1).normalize(),
            color: Vec3::ONE,
            intensity: 2.0,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PointLight {
    pub position: Vec3,
    pub color: Vec3,
    pub intensity: f32,
    pub range: f32,
}

impl PointLight {
    pub fn new(position: Vec3, color: Vec3, intensity: f32, range: f32) -> Self {
        Self {
            position,
            color,
            intensity,
            range,
        }
    }

    fn to_gpu(self) -> GpuPointLight {
        GpuPointLight {
            position: self.position.to_array(),
            range: self.range,
            color: self.color.to_array(),
            intensity: self.intensity,
        }
    }
}

/// Stable index of a point light slot
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct PointLightHandle(u32);

/// One directional light plus a fixed-capacity set of point lights
#[derive(Debug, Clone)]
pub struct LightSet {
    pub sun: DirectionalLight,
    /// Scale of the image-based ambient term
    pub ambient_intensity: f32,
    point_lights: Vec<Option<PointLight>>,
}

impl LightSet {
    pub fn new(capacity: u32) -> Self {
        Self {
            sun: DirectionalLight::default(),
            ambient_intensity: 1.0,
            point_lights: vec![None; capacity as usize],
        }
    }

    pub fn with_sun(mut self, sun: DirectionalLight) -> Self {
        self.sun = sun;
        self
    }

    pub fn with_ambient(mut self, intensity: f32) -> Self {
        self.ambient_intensity = intensity;
        self
    }

    pub fn capacity(&self) -> u32 {
        self.point_lights.len() as u32
    }

    pub fn add_point_light(&mut self, light: PointLight) -> Result<PointLightHandle> {
        let slot = self
            .point_lights
            .iter()
            .position(Option::is_none)
            .ok_or_else(|| Error::Capacity(format!("all {} point light slots are in use", self.capacity())))?;
        self.point_lights[slot] = Some(light);
        Ok(PointLightHandle(slot as u32))
    }

    pub fn point_light(&self, handle: PointLightHandle) -> Option<&PointLight> {
        self.point_lights.get(handle.0 as usize)?.as_ref()
    }

    pub fn point_light_mut(&mut self, handle: PointLightHandle) -> Option<&mut PointLight> {
        self.point_lights.get_mut(handle.0 as usize)?.as_mut()
    }

    pub fn remove_point_light(&mut self, handle: PointLightHandle) -> Option<PointLight> {
        self.point_lights.get_mut(handle.0 as usize)?.take()
    }

    pub fn point_lights(&self) -> impl Iterator<Item = &PointLight> + '_ {
        self.point_lights.iter().flatten()
    }

    /// Bytes of the per-frame light buffer for a given capacity
    pub fn buffer_size(capacity: u32) -> u64 {
        LightingConstants::SIZE + std::mem::size_of::<GpuPointLight>() as u64 * capacity as u64
    }

    /// Header followed by the packed point lights
    pub fn to_gpu_bytes(&self, shadow: &ShadowSetup) -> Vec<u8> {
        let points: Vec<GpuPointLight> = self.point_lights().map(|l| l.to_gpu()).collect();
        let header = LightingConstants {
            sun: GpuDirectionalLight {
                direction: self.sun.direction.normalize_or_zero().to_array(),
                intensity: self.sun.intensity,
                color: self.sun.color.to_array(),
                use_esm: shadow.use_esm as u32,
                view_projection: shadow.view_projection(self.sun.direction).to_cols_array_2d(),
            },
            ambient_intensity: self.ambient_intensity,
            point_light_count: points.len() as u32,
            esm_exponent: ESM_EXPONENT,
            shadow_bias: shadow.bias,
        };
        let mut bytes = bytemuck::bytes_of(&header).to_vec();
        bytes.extend_from_slice(bytemuck::cast_slice(&points));
        bytes
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn capacity_is_enforced_and_slots_are_reused() {
        let mut lights = LightSet::new(2);
        let a = lights.add_point_light(PointLight::new(Vec3::ZERO, Vec3::ONE, 1.0, 5.0)).unwrap();
        let _b = lights.add_point_light(PointLight::new(Vec3::X, Vec3::ONE, 1.0, 5.0)).unwrap();
        assert!(matches!(
            lights.add_point_light(PointLight::new(Vec3::Y, Vec3::ONE, 1.0, 5.0)),
            Err(Error::Capacity(_))
        ));
        lights.remove_point_light(a);
        let c = lights.add_point_light(PointLight::new(Vec3::Z, Vec3::ONE, 1.0, 5.0)).unwrap();
        assert_eq!(c, a);
        assert_eq!(lights.point_light(c).unwrap().position, Vec3::Z);
    }

    #[test]
    fn gpu_layout_packs_live_lights_after_header() {
        let mut lights = LightSet::new(4);
        let a = lights.add_point_light(PointLight::new(Vec3::ONE, Vec3::ONE, 3.0, 5.0)).unwrap();
        lights.add_point_light(PointLight::new(Vec3::ZERO, Vec3::ONE, 7.0, 5.0)).unwrap();
        lights.remove_point_light(a);

        let bytes = lights.to_gpu_bytes(&ShadowSetup::default());
        let header: LightingConstants = bytemuck::pod_read_unaligned(&bytes[..LightingConstants::SIZE as usize]);
        assert_eq!(header.point_light_count, 1);
        let light: GpuPointLight = bytemuck::pod_read_unaligned(&bytes[LightingConstants::SIZE as usize..]);
        assert_eq!(light.intensity, 7.0);
        assert!(bytes.len() as u64 <= LightSet::buffer_size(4));
    }
}
