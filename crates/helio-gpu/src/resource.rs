//! GPU resources and the device memory that backs them

use std::collections::HashMap;

use glam::{UVec3, Vec3, Vec4};

use crate::state::{ResourceBarrier, ResourceState};
use crate::{Error, Result};

/// Unique identifier for a resource
#[derive(Debug, Copy, Clone, Hash, Eq, PartialEq, PartialOrd, Ord)]
pub struct ResourceId(u64);

impl ResourceId {
    pub(crate) fn new() -> Self {
        use std::sync::atomic::{AtomicU64, Ordering};
        static COUNTER: AtomicU64 = AtomicU64::new(1);
        Self(COUNTER.fetch_add(1, Ordering::Relaxed))
    }

    pub fn raw(self) -> u64 {
        self.0
    }
}

/// Texture creation parameters
#[derive(Debug, Clone, PartialEq)]
pub struct TextureDesc {
    pub label: String,
    pub size: wgpu::Extent3d,
    pub dimension: wgpu::TextureDimension,
    pub format: wgpu::TextureFormat,
    pub usage: wgpu::TextureUsages,
}

impl TextureDesc {
    pub fn d2(
        label: impl Into<String>,
        width: u32,
        height: u32,
        format: wgpu::TextureFormat,
        usage: wgpu::TextureUsages,
    ) -> Self {
        Self {
            label: label.into(),
            size: wgpu::Extent3d {
                width,
                height,
                depth_or_array_layers: 1,
            },
            dimension: wgpu::TextureDimension::D2,
            format,
            usage,
        }
    }

    /// Six-layer 2D array used as a cubemap
    pub fn cube(label: impl Into<String>, size: u32, format: wgpu::TextureFormat, usage: wgpu::TextureUsages) -> Self {
        Self {
            label: label.into(),
            size: wgpu::Extent3d {
                width: size,
                height: size,
                depth_or_array_layers: 6,
            },
            dimension: wgpu::TextureDimension::D2,
            format,
            usage,
        }
    }

    pub fn d3(
        label: impl Into<String>,
        resolution: UVec3,
        format: wgpu::TextureFormat,
        usage: wgpu::TextureUsages,
    ) -> Self {
        Self {
            label: label.into(),
            size: wgpu::Extent3d {
                width: resolution.x,
                height: resolution.y,
                depth_or_array_layers: resolution.z,
            },
            dimension: wgpu::TextureDimension::D3,
            format,
            usage,
        }
    }

    pub fn extent(&self) -> UVec3 {
        UVec3::new(self.size.width, self.size.height, self.size.depth_or_array_layers)
    }

    pub fn texel_count(&self) -> usize {
        self.size.width as usize * self.size.height as usize * self.size.depth_or_array_layers as usize
    }

    pub fn is_depth(&self) -> bool {
        self.format.is_depth_stencil_format()
    }
}

/// Buffer creation parameters
#[derive(Debug, Clone, PartialEq)]
pub struct BufferDesc {
    pub label: String,
    pub size: u64,
    pub usage: wgpu::BufferUsages,
}

impl BufferDesc {
    pub fn new(label: impl Into<String>, size: u64, usage: wgpu::BufferUsages) -> Self {
        Self {
            label: label.into(),
            size,
            usage,
        }
    }
}

/// Texel storage of a texture
///
/// Every format is widened to RGBA `f32`; depth formats keep depth in `x`.
/// Out-of-bounds loads return zero and out-of-bounds stores are dropped.
#[derive(Debug, Clone)]
pub struct TextureData {
    desc: TextureDesc,
    texels: Vec<Vec4>,
}

impl TextureData {
    pub fn new(desc: TextureDesc) -> Self {
        let texels = vec![Vec4::ZERO; desc.texel_count()];
        Self { desc, texels }
    }

    pub fn desc(&self) -> &TextureDesc {
        &self.desc
    }

    pub fn extent(&self) -> UVec3 {
        self.desc.extent()
    }

    fn index(&self, coord: UVec3) -> Option<usize> {
        let extent = self.extent();
        if coord.x >= extent.x || coord.y >= extent.y || coord.z >= extent.z {
            return None;
        }
        Some(((coord.z * extent.y + coord.y) * extent.x + coord.x) as usize)
    }

    pub fn load(&self, coord: UVec3) -> Vec4 {
        self.index(coord).map_or(Vec4::ZERO, |i| self.texels[i])
    }

    pub fn store(&mut self, coord: UVec3, value: Vec4) {
        if let Some(i) = self.index(coord) {
            self.texels[i] = value;
        }
    }

    /// Linear filtering with clamp-to-edge addressing; `uvw` in [0, 1]
    pub fn sample_linear(&self, uvw: Vec3) -> Vec4 {
        let extent = self.extent();
        if extent.x == 0 || extent.y == 0 || extent.z == 0 {
            return Vec4::ZERO;
        }
        let size = extent.as_vec3();
        let max = (extent - UVec3::ONE).as_vec3();
        let p = (uvw * size - Vec3::splat(0.5)).clamp(Vec3::ZERO, max);
        let base = p.floor();
        let f = p - base;
        let i0 = base.as_uvec3();
        let i1 = (base + Vec3::ONE).min(max).as_uvec3();

        let c = |x: u32, y: u32, z: u32| self.load(UVec3::new(x, y, z));
        let x00 = c(i0.x, i0.y, i0.z).lerp(c(i1.x, i0.y, i0.z), f.x);
        let x10 = c(i0.x, i1.y, i0.z).lerp(c(i1.x, i1.y, i0.z), f.x);
        let x01 = c(i0.x, i0.y, i1.z).lerp(c(i1.x, i0.y, i1.z), f.x);
        let x11 = c(i0.x, i1.y, i1.z).lerp(c(i1.x, i1.y, i1.z), f.x);
        let y0 = x00.lerp(x10, f.y);
        let y1 = x01.lerp(x11, f.y);
        y0.lerp(y1, f.z)
    }

    pub fn fill(&mut self, value: Vec4) {
        self.texels.fill(value);
    }

    pub fn texels(&self) -> &[Vec4] {
        &self.texels
    }

    pub fn texels_mut(&mut self) -> &mut [Vec4] {
        &mut self.texels
    }
}

/// Byte storage of a buffer
#[derive(Debug, Clone)]
pub struct BufferData {
    desc: BufferDesc,
    bytes: Vec<u8>,
}

impl BufferData {
    pub fn new(desc: BufferDesc) -> Self {
        let bytes = vec![0; desc.size as usize];
        Self { desc, bytes }
    }

    pub fn desc(&self) -> &BufferDesc {
        &self.desc
    }

    pub fn bytes(&self) -> &[u8] {
        &self.bytes
    }

    fn range(&self, offset: u64, len: usize) -> Result<std::ops::Range<usize>> {
        let start = offset as usize;
        let end = start.checked_add(len).filter(|end| *end <= self.bytes.len());
        end.map(|end| start..end).ok_or_else(|| {
            Error::Recording(format!(
                "access of {} bytes at offset {} overruns buffer '{}' ({} bytes)",
                len,
                offset,
                self.desc.label,
                self.bytes.len()
            ))
        })
    }

    pub fn write(&mut self, offset: u64, data: &[u8]) -> Result<()> {
        let range = self.range(offset, data.len())?;
        self.bytes[range].copy_from_slice(data);
        Ok(())
    }

    pub fn read<T: bytemuck::Pod>(&self, offset: u64) -> Result<T> {
        let range = self.range(offset, std::mem::size_of::<T>())?;
        Ok(bytemuck::pod_read_unaligned(&self.bytes[range]))
    }

    pub fn read_slice<T: bytemuck::Pod>(&self, offset: u64, count: usize) -> Result<Vec<T>> {
        let stride = std::mem::size_of::<T>();
        let range = self.range(offset, stride * count)?;
        Ok(self.bytes[range]
            .chunks_exact(stride)
            .map(bytemuck::pod_read_unaligned)
            .collect())
    }
}

/// Storage of a single resource
#[derive(Debug, Clone)]
pub enum ResourceData {
    Texture(TextureData),
    Buffer(BufferData),
}

/// A resource as the device sees it
#[derive(Debug, Clone)]
pub struct GpuResource {
    pub(crate) label: String,
    pub(crate) state: ResourceState,
    pub(crate) data: ResourceData,
}

impl GpuResource {
    pub fn label(&self) -> &str {
        &self.label
    }

    pub fn state(&self) -> ResourceState {
        self.state
    }

    pub fn data(&self) -> &ResourceData {
        &self.data
    }
}

/// All device memory, keyed by resource id
#[derive(Default)]
pub struct ResourceMemory {
    resources: HashMap<ResourceId, GpuResource>,
}

impl ResourceMemory {
    pub(crate) fn insert(&mut self, id: ResourceId, resource: GpuResource) {
        self.resources.insert(id, resource);
    }

    pub(crate) fn remove(&mut self, id: ResourceId) -> Option<GpuResource> {
        self.resources.remove(&id)
    }

    pub fn len(&self) -> usize {
        self.resources.len()
    }

    pub fn is_empty(&self) -> bool {
        self.resources.is_empty()
    }

    pub fn contains(&self, id: ResourceId) -> bool {
        self.resources.contains_key(&id)
    }

    pub fn get(&self, id: ResourceId) -> Result<&GpuResource> {
        self.resources.get(&id).ok_or(Error::UnknownResource(id))
    }

    fn get_mut(&mut self, id: ResourceId) -> Result<&mut GpuResource> {
        self.resources.get_mut(&id).ok_or(Error::UnknownResource(id))
    }

    pub fn state(&self, id: ResourceId) -> Result<ResourceState> {
        Ok(self.get(id)?.state)
    }

    pub fn label(&self, id: ResourceId) -> Result<&str> {
        Ok(&self.get(id)?.label)
    }

    pub fn texture(&self, id: ResourceId) -> Result<&TextureData> {
        let resource = self.get(id)?;
        match &resource.data {
            ResourceData::Texture(texture) => Ok(texture),
            ResourceData::Buffer(_) => Err(Error::Recording(format!("'{}' is not a texture", resource.label))),
        }
    }

    pub fn texture_mut(&mut self, id: ResourceId) -> Result<&mut TextureData> {
        let resource = self.get_mut(id)?;
        match &mut resource.data {
            ResourceData::Texture(texture) => Ok(texture),
            ResourceData::Buffer(_) => Err(Error::Recording(format!("'{}' is not a texture", resource.label))),
        }
    }

    pub fn buffer(&self, id: ResourceId) -> Result<&BufferData> {
        let resource = self.get(id)?;
        match &resource.data {
            ResourceData::Buffer(buffer) => Ok(buffer),
            ResourceData::Texture(_) => Err(Error::Recording(format!("'{}' is not a buffer", resource.label))),
        }
    }

    pub fn buffer_mut(&mut self, id: ResourceId) -> Result<&mut BufferData> {
        let resource = self.get_mut(id)?;
        match &mut resource.data {
            ResourceData::Buffer(buffer) => Ok(buffer),
            ResourceData::Texture(_) => Err(Error::Recording(format!("'{}' is not a buffer", resource.label))),
        }
    }

    /// Mutably borrows one texture while the rest of memory stays readable
    pub fn with_texture_mut<R>(
        &mut self,
        id: ResourceId,
        f: impl FnOnce(&mut TextureData, &ResourceMemory) -> Result<R>,
    ) -> Result<R> {
        let mut resource = self.resources.remove(&id).ok_or(Error::UnknownResource(id))?;
        let result = match &mut resource.data {
            ResourceData::Texture(texture) => f(texture, self),
            ResourceData::Buffer(_) => Err(Error::Recording(format!("'{}' is not a texture", resource.label))),
        };
        self.resources.insert(id, resource);
        result
    }

    /// Fails unless `id` is currently in `expected`
    pub fn require_state(&self, id: ResourceId, expected: ResourceState) -> Result<()> {
        let resource = self.get(id)?;
        if resource.state != expected {
            return Err(Error::InvalidTransition {
                resource: resource.label.clone(),
                expected,
                actual: resource.state,
            });
        }
        Ok(())
    }

    pub(crate) fn apply_barrier(&mut self, barrier: &ResourceBarrier) -> Result<()> {
        self.require_state(barrier.resource, barrier.before)?;
        self.get_mut(barrier.resource)?.state = barrier.after;
        Ok(())
    }

    pub(crate) fn copy(&mut self, src: ResourceId, dst: ResourceId) -> Result<()> {
        let source = self.get(src)?.data.clone();
        let label = self.get(dst)?.label.clone();
        let target = self.get_mut(dst)?;
        match (&source, &mut target.data) {
            (ResourceData::Texture(from), ResourceData::Texture(to)) if from.extent() == to.extent() => {
                to.texels.copy_from_slice(&from.texels);
                Ok(())
            }
            (ResourceData::Buffer(from), ResourceData::Buffer(to)) if from.bytes.len() == to.bytes.len() => {
                to.bytes.copy_from_slice(&from.bytes);
                Ok(())
            }
            _ => Err(Error::Recording(format!("copy into '{}' with mismatched source", label))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn volume(extent: UVec3) -> TextureData {
        TextureData::new(TextureDesc::d3(
            "test volume",
            extent,
            wgpu::TextureFormat::Rgba16Float,
            wgpu::TextureUsages::STORAGE_BINDING,
        ))
    }

    #[test]
    fn out_of_bounds_loads_are_zero_and_stores_dropped() {
        let mut tex = volume(UVec3::new(2, 2, 2));
        tex.store(UVec3::new(5, 0, 0), Vec4::ONE);
        assert_eq!(tex.load(UVec3::new(5, 0, 0)), Vec4::ZERO);
        assert!(tex.texels().iter().all(|t| *t == Vec4::ZERO));
    }

    #[test]
    fn linear_sample_at_texel_center_is_exact() {
        let mut tex = volume(UVec3::new(4, 4, 4));
        tex.store(UVec3::new(1, 2, 3), Vec4::new(1.0, 2.0, 3.0, 4.0));
        let uvw = (Vec3::new(1.0, 2.0, 3.0) + 0.5) / 4.0;
        assert_eq!(tex.sample_linear(uvw), Vec4::new(1.0, 2.0, 3.0, 4.0));
    }

    #[test]
    fn linear_sample_interpolates_between_texels() {
        let mut tex = volume(UVec3::new(2, 1, 1));
        tex.store(UVec3::new(0, 0, 0), Vec4::ZERO);
        tex.store(UVec3::new(1, 0, 0), Vec4::splat(2.0));
        let mid = tex.sample_linear(Vec3::new(0.5, 0.5, 0.5));
        assert!((mid.x - 1.0).abs() < 1e-6);
        // clamp-to-edge outside the texel centers
        assert_eq!(tex.sample_linear(Vec3::new(2.0, 0.5, 0.5)), Vec4::splat(2.0));
    }

    #[test]
    fn buffer_reads_reject_overruns() {
        let mut buf = BufferData::new(BufferDesc::new("cb", 8, wgpu::BufferUsages::UNIFORM));
        buf.write(0, bytemuck::bytes_of(&[1.0f32, 2.0])).unwrap();
        assert_eq!(buf.read::<[f32; 2]>(0).unwrap(), [1.0, 2.0]);
        assert!(buf.read::<[f32; 3]>(0).is_err());
        assert!(buf.write(6, &[0; 4]).is_err());
    }
}
