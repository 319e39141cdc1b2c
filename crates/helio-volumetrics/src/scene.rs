//! Scene arenas - geometry, materials and instances addressed by handle

use std::sync::Arc;

use glam::{Mat4, Vec3};

use crate::constants::GpuMaterial;
use crate::{Error, Result};

/// Indexed triangle list in object space
#[derive(Debug, Clone, PartialEq)]
pub struct Geometry {
    positions: Vec<Vec3>,
    indices: Vec<u32>,
}

impl Geometry {
    pub fn new(positions: Vec<Vec3>, indices: Vec<u32>) -> Result<Self> {
        if indices.len() % 3 != 0 {
            return Err(Error::Scene(format!("{} indices do not form triangles", indices.len())));
        }
        if let Some(bad) = indices.iter().find(|&&i| i as usize >= positions.len()) {
            return Err(Error::Scene(format!(
                "index {} out of range for {} vertices",
                bad,
                positions.len()
            )));
        }
        Ok(Self { positions, indices })
    }

    /// Two triangles spanning four corners given in winding order
    pub fn quad(corners: [Vec3; 4]) -> Self {
        Self {
            positions: corners.to_vec(),
            indices: vec![0, 1, 2, 0, 2, 3],
        }
    }

    pub fn triangles(&self) -> impl Iterator<Item = [Vec3; 3]> + '_ {
        self.indices.chunks_exact(3).map(|t| {
            [
                self.positions[t[0] as usize],
                self.positions[t[1] as usize],
                self.positions[t[2] as usize],
            ]
        })
    }

    pub fn triangle_count(&self) -> usize {
        self.indices.len() / 3
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Material {
    pub albedo: Vec3,
    pub roughness: f32,
    pub metalness: f32,
}

impl Default for Material {
    fn default() -> Self {
        Self {
            albedo: Vec3::splat(0.8),
            roughness: 0.5,
            metalness: 0.0,
        }
    }
}

impl Material {
    fn to_gpu(self) -> GpuMaterial {
        GpuMaterial {
            albedo: self.albedo.to_array(),
            roughness: self.roughness,
            metalness: self.metalness,
            _pad: [0.0; 3],
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct GeometryHandle(u32);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct MaterialHandle(u32);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct InstanceHandle(u32);

impl GeometryHandle {
    pub fn index(self) -> usize {
        self.0 as usize
    }
}

impl MaterialHandle {
    pub fn index(self) -> usize {
        self.0 as usize
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Instance {
    pub transform: Mat4,
    pub geometry: GeometryHandle,
    pub material: MaterialHandle,
}

/// One draw per instance; the draw's position is its row in the transform buffer
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DrawInstance {
    pub geometry: GeometryHandle,
    pub material: MaterialHandle,
}

/// Snapshot of what to draw this frame
#[derive(Debug, Clone, Default)]
pub struct DrawList {
    pub geometries: Vec<Arc<Geometry>>,
    pub draws: Vec<DrawInstance>,
}

impl DrawList {
    pub fn geometry(&self, handle: GeometryHandle) -> Option<&Geometry> {
        self.geometries.get(handle.index()).map(Arc::as_ref)
    }
}

/// The scene database
pub struct Scene {
    geometries: Vec<Arc<Geometry>>,
    materials: Vec<Material>,
    instances: Vec<Instance>,
    max_instances: u32,
    max_materials: u32,
}

impl Scene {
    pub fn new(max_instances: u32, max_materials: u32) -> Self {
        Self {
            geometries: Vec::new(),
            materials: Vec::new(),
            instances: Vec::new(),
            max_instances,
            max_materials,
        }
    }

    pub fn add_geometry(&mut self, geometry: Geometry) -> GeometryHandle {
        self.geometries.push(Arc::new(geometry));
        GeometryHandle(self.geometries.len() as u32 - 1)
    }

    pub fn add_material(&mut self, material: Material) -> Result<MaterialHandle> {
        if self.materials.len() as u32 >= self.max_materials {
            return Err(Error::Capacity(format!("material table holds {} entries", self.max_materials)));
        }
        self.materials.push(material);
        Ok(MaterialHandle(self.materials.len() as u32 - 1))
    }

    pub fn add_instance(
        &mut self,
        transform: Mat4,
        geometry: GeometryHandle,
        material: MaterialHandle,
    ) -> Result<InstanceHandle> {
        if geometry.index() >= self.geometries.len() {
            return Err(Error::Scene(format!("unknown geometry {:?}", geometry)));
        }
        if material.index() >= self.materials.len() {
            return Err(Error::Scene(format!("unknown material {:?}", material)));
        }
        if self.instances.len() as u32 >= self.max_instances {
            return Err(Error::Capacity(format!("instance table holds {} entries", self.max_instances)));
        }
        self.instances.push(Instance {
            transform,
            geometry,
            material,
        });
        Ok(InstanceHandle(self.instances.len() as u32 - 1))
    }

    pub fn instance(&self, handle: InstanceHandle) -> Option<&Instance> {
        self.instances.get(handle.0 as usize)
    }

    pub fn set_transform(&mut self, handle: InstanceHandle, transform: Mat4) -> Result<()> {
        let instance = self
            .instances
            .get_mut(handle.0 as usize)
            .ok_or_else(|| Error::Scene(format!("unknown instance {:?}", handle)))?;
        instance.transform = transform;
        Ok(())
    }

    pub fn material_mut(&mut self, handle: MaterialHandle) -> Option<&mut Material> {
        self.materials.get_mut(handle.index())
    }

    pub fn instances(&self) -> &[Instance] {
        &self.instances
    }

    pub fn draw_list(&self) -> DrawList {
        DrawList {
            geometries: self.geometries.clone(),
            draws: self
                .instances
                .iter()
                .map(|i| DrawInstance {
                    geometry: i.geometry,
                    material: i.material,
                })
                .collect(),
        }
    }

    /// Per-instance world matrices in draw order
    pub fn transform_bytes(&self) -> Vec<u8> {
        let matrices: Vec<[[f32; 4]; 4]> = self.instances.iter().map(|i| i.transform.to_cols_array_2d()).collect();
        bytemuck::cast_slice(&matrices).to_vec()
    }

    pub fn material_bytes(&self) -> Vec<u8> {
        let materials: Vec<GpuMaterial> = self.materials.iter().map(|m| m.to_gpu()).collect();
        bytemuck::cast_slice(&materials).to_vec()
    }

    pub fn transform_buffer_size(&self) -> u64 {
        self.max_instances as u64 * std::mem::size_of::<[[f32; 4]; 4]>() as u64
    }

    pub fn material_buffer_size(&self) -> u64 {
        self.max_materials as u64 * std::mem::size_of::<GpuMaterial>() as u64
    }
}
