//! Resource states and transitions

use std::fmt;

use crate::resource::ResourceId;

/// The mode a resource is currently valid to be used in
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ResourceState {
    Common,
    Present,
    RenderTarget,
    DepthWrite,
    DepthRead,
    /// Readable from pixel shaders
    PixelShaderResource,
    /// Readable from compute and other non-pixel stages
    NonPixelShaderResource,
    UnorderedAccess,
    CopySource,
    CopyDest,
    /// CPU-written upload memory, readable by every stage
    GenericRead,
}

impl ResourceState {
    /// States in which a resource may be written by the GPU
    pub fn is_writable(self) -> bool {
        matches!(
            self,
            ResourceState::RenderTarget
                | ResourceState::DepthWrite
                | ResourceState::UnorderedAccess
                | ResourceState::CopyDest
                | ResourceState::Common
        )
    }

    /// States a shader may sample from
    pub fn is_shader_readable(self) -> bool {
        matches!(
            self,
            ResourceState::PixelShaderResource
                | ResourceState::NonPixelShaderResource
                | ResourceState::GenericRead
        )
    }
}

impl fmt::Display for ResourceState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ResourceState::Common => "COMMON",
            ResourceState::Present => "PRESENT",
            ResourceState::RenderTarget => "RENDER_TARGET",
            ResourceState::DepthWrite => "DEPTH_WRITE",
            ResourceState::DepthRead => "DEPTH_READ",
            ResourceState::PixelShaderResource => "PIXEL_SHADER_RESOURCE",
            ResourceState::NonPixelShaderResource => "NON_PIXEL_SHADER_RESOURCE",
            ResourceState::UnorderedAccess => "UNORDERED_ACCESS",
            ResourceState::CopySource => "COPY_SOURCE",
            ResourceState::CopyDest => "COPY_DEST",
            ResourceState::GenericRead => "GENERIC_READ",
        };
        f.write_str(name)
    }
}

/// A single state transition recorded into a command list
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ResourceBarrier {
    pub resource: ResourceId,
    pub before: ResourceState,
    pub after: ResourceState,
}

impl ResourceBarrier {
    pub fn transition(resource: ResourceId, before: ResourceState, after: ResourceState) -> Self {
        Self {
            resource,
            before,
            after,
        }
    }

    /// Reverses the transition
    pub fn inverse(&self) -> Self {
        Self {
            resource: self.resource,
            before: self.after,
            after: self.before,
        }
    }
}
