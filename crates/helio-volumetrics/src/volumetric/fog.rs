//! Analytic participating media

use glam::{Vec3, Vec4};

use crate::constants::GlobalFogConstants;

/// Height- and radius-limited global fog
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct GlobalFog {
    /// Single-scattering albedo; scattering = albedo * extinction
    pub albedo: Vec3,
    /// Extinction coefficient per world unit inside the fog
    pub extinction: f32,
    pub emission: Vec3,
    /// Henyey-Greenstein `g`
    pub anisotropy: f32,
    pub center: Vec3,
    /// Height above which the fog has faded out
    pub max_height: f32,
    pub height_smoothing: f32,
    pub radius: f32,
    pub radius_smoothing: f32,
}

impl Default for GlobalFog {
    fn default() -> Self {
        Self {
            albedo: Vec3::splat(0.8),
            extinction: 0.05,
            emission: Vec3::ZERO,
            anisotropy: 0.3,
            center: Vec3::ZERO,
            max_height: 10.0,
            height_smoothing: 4.0,
            radius: 80.0,
            radius_smoothing: 20.0,
        }
    }
}

impl GlobalFog {
    pub fn with_albedo(mut self, albedo: Vec3) -> Self {
        self.albedo = albedo;
        self
    }

    pub fn with_extinction(mut self, extinction: f32) -> Self {
        self.extinction = extinction;
        self
    }

    pub fn with_emission(mut self, emission: Vec3) -> Self {
        self.emission = emission;
        self
    }

    pub fn with_anisotropy(mut self, g: f32) -> Self {
        self.anisotropy = g;
        self
    }

    pub fn with_height(mut self, max_height: f32, smoothing: f32) -> Self {
        self.max_height = max_height;
        self.height_smoothing = smoothing;
        self
    }

    pub fn with_radius(mut self, radius: f32, smoothing: f32) -> Self {
        self.radius = radius;
        self.radius_smoothing = smoothing;
        self
    }

    pub fn to_gpu(&self) -> GlobalFogConstants {
        GlobalFogConstants {
            albedo: self.albedo.to_array(),
            extinction: self.extinction,
            emission: self.emission.to_array(),
            anisotropy: self.anisotropy.clamp(-0.99, 0.99),
            center: self.center.to_array(),
            max_height: self.max_height,
            height_smoothing: self.height_smoothing,
            radius: self.radius,
            radius_smoothing: self.radius_smoothing,
            _pad: 0.0,
        }
    }
}

fn smoothstep(edge0: f32, edge1: f32, x: f32) -> f32 {
    if edge1 <= edge0 {
        return if x < edge0 { 0.0 } else { 1.0 };
    }
    let t = ((x - edge0) / (edge1 - edge0)).clamp(0.0, 1.0);
    t * t * (3.0 - 2.0 * t)
}

/// Medium properties of one froxel, as stored in the two transient volumes
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Medium {
    pub scattering: Vec3,
    pub extinction: f32,
    pub emission: Vec3,
    pub phase_g: f32,
}

impl Medium {
    /// `(scattering, extinction)`
    pub fn packed_a(&self) -> Vec4 {
        self.scattering.extend(self.extinction)
    }

    /// `(emission, phase g)`
    pub fn packed_b(&self) -> Vec4 {
        self.emission.extend(self.phase_g)
    }
}

/// Fog density at a world position; depends on nothing else
pub fn evaluate_medium(fog: &GlobalFogConstants, world: Vec3) -> Medium {
    let height = 1.0 - smoothstep(fog.max_height - fog.height_smoothing, fog.max_height, world.y);
    let distance = world.distance(Vec3::from_array(fog.center));
    let radial = 1.0 - smoothstep(fog.radius - fog.radius_smoothing, fog.radius, distance);
    let density = height * radial;

    let extinction = fog.extinction * density;
    Medium {
        scattering: Vec3::from_array(fog.albedo) * extinction,
        extinction,
        emission: Vec3::from_array(fog.emission) * density,
        phase_g: fog.anisotropy,
    }
}

/// Henyey-Greenstein phase function, normalised over the sphere
pub fn henyey_greenstein(cos_theta: f32, g: f32) -> f32 {
    let g2 = g * g;
    let denom = (1.0 + g2 - 2.0 * g * cos_theta).max(1e-6);
    (1.0 - g2) / (4.0 * std::f32::consts::PI * denom * denom.sqrt())
}
