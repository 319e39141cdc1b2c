//! Frame passes and the state contract between them
//!
//! Each pass declares, per resource it touches, the state it expects on
//! entry and the state it leaves behind. Recording goes through a
//! [`StateTracker`] that rejects any transition whose `before` state differs
//! from what the previous pass left, and [`audit_pass_order`] checks the same
//! contract statically over a pass list.

mod geometry;
mod lighting;
mod shadow;
mod skybox;
mod tonemap;
mod volumetric;

pub use geometry::GeometryPass;
pub use lighting::LightingPass;
pub use shadow::ShadowPass;
pub use skybox::SkyboxPass;
pub use tonemap::TonemapPass;
pub use volumetric::VolumetricPass;

pub(crate) use lighting::{point_light_incidence, read_lights};
pub(crate) use shadow::sun_visibility;

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use glam::{UVec2, UVec3};
use helio_gpu::{CommandList, Kernel, ResourceId, ResourceState, ViewAllocator, ViewDesc, ViewHandle};

use crate::scene::DrawList;
use crate::{Error, Result};

/// Logical resources threaded between passes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum FrameResource {
    ShadowMap,
    /// Blurred exponential shadow map
    EsmTarget,
    /// Ping-pong partner of [`FrameResource::EsmTarget`]
    EsmScratch,
    GBufferAlbedo,
    GBufferNormal,
    GBufferRoughnessMetal,
    /// Depth written this frame
    Depth,
    /// Depth written last frame
    PrevDepth,
    Output,
    EnvironmentCube,
    /// L1 spherical-harmonics irradiance, one coefficient per texel
    Irradiance,
    PrefilteredCube,
    VBufferA,
    VBufferB,
    /// History volume written this frame
    Scattering,
    /// History volume written last frame
    ScatteringHistory,
    IntegratedVolume,
}

impl FrameResource {
    /// State every resource is in between frames
    pub fn boundary_state(self) -> ResourceState {
        match self {
            FrameResource::Output => ResourceState::UnorderedAccess,
            FrameResource::EnvironmentCube => ResourceState::PixelShaderResource,
            _ => ResourceState::NonPixelShaderResource,
        }
    }
}

/// One pass's entry/exit contract for one resource
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StateUse {
    pub resource: FrameResource,
    pub entry: ResourceState,
    pub exit: ResourceState,
}

/// Collects a pass's state contract
#[derive(Debug, Default)]
pub struct StateDeclaration {
    uses: Vec<StateUse>,
}

impl StateDeclaration {
    /// Resource read in `state` and left there
    pub fn read(&mut self, resource: FrameResource, state: ResourceState) -> &mut Self {
        self.transition(resource, state, state)
    }

    pub fn transition(&mut self, resource: FrameResource, entry: ResourceState, exit: ResourceState) -> &mut Self {
        self.uses.push(StateUse { resource, entry, exit });
        self
    }

    pub fn uses(&self) -> &[StateUse] {
        &self.uses
    }
}

/// A pass in the fixed frame sequence
///
/// Passes hold no frame state: everything they record is derived from the
/// bound resources and constants in the [`PassContext`].
pub trait FramePass: Send + Sync {
    fn name(&self) -> &str;

    fn declare_states(&self, states: &mut StateDeclaration);

    fn record(&self, ctx: &mut PassContext) -> Result<()>;

    fn declaration(&self) -> StateDeclaration {
        let mut states = StateDeclaration::default();
        self.declare_states(&mut states);
        states
    }
}

/// A resource plus the view slots it is bound through
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BoundResource {
    pub id: ResourceId,
    pub srv: Option<ViewHandle>,
    pub uav: Option<ViewHandle>,
    pub rtv: Option<ViewHandle>,
    pub dsv: Option<ViewHandle>,
}

impl BoundResource {
    pub fn new(id: ResourceId) -> Self {
        Self {
            id,
            srv: None,
            uav: None,
            rtv: None,
            dsv: None,
        }
    }
}

/// Everything bound for one frame
pub struct FrameBindings {
    pub resources: HashMap<FrameResource, BoundResource>,
    pub pass_constants: ResourceId,
    pub lighting: ResourceId,
    pub transforms: ResourceId,
    pub materials: ResourceId,
    pub volumetrics: ResourceId,
    pub draws: Arc<DrawList>,
    pub output_size: UVec2,
    pub prev_depth_size: UVec2,
    pub froxel_resolution: UVec3,
    pub shadow_size: u32,
    pub esm_size: u32,
    pub use_esm: bool,
    pub tonemap_exposure: f32,
}

/// Current state of every frame resource while recording
#[derive(Debug, Clone)]
pub struct StateTracker {
    states: BTreeMap<FrameResource, ResourceState>,
}

impl StateTracker {
    pub fn at_boundary<'a>(resources: impl IntoIterator<Item = &'a FrameResource>) -> Self {
        Self {
            states: resources.into_iter().map(|r| (*r, r.boundary_state())).collect(),
        }
    }

    pub fn state(&self, resource: FrameResource) -> Option<ResourceState> {
        self.states.get(&resource).copied()
    }

    fn set(&mut self, resource: FrameResource, state: ResourceState) {
        self.states.insert(resource, state);
    }

    /// Resources not back in their boundary state
    pub fn unclosed(&self) -> Vec<(FrameResource, ResourceState)> {
        self.states
            .iter()
            .filter(|(r, s)| r.boundary_state() != **s)
            .map(|(r, s)| (*r, *s))
            .collect()
    }
}

/// Recording context handed to each pass
pub struct PassContext<'a> {
    pub list: &'a mut CommandList,
    pub views: &'a ViewAllocator,
    pub frame: &'a FrameBindings,
    pub(crate) tracker: &'a mut StateTracker,
    pub(crate) pass: &'a str,
}

impl<'a> PassContext<'a> {
    fn error(&self, message: String) -> Error {
        Error::Pass {
            pass: self.pass.to_string(),
            message,
        }
    }

    fn bound(&self, resource: FrameResource) -> Result<&BoundResource> {
        self.frame
            .resources
            .get(&resource)
            .ok_or_else(|| self.error(format!("{:?} is not bound", resource)))
    }

    pub fn id(&self, resource: FrameResource) -> Result<ResourceId> {
        Ok(self.bound(resource)?.id)
    }

    fn through_view(
        &self,
        resource: FrameResource,
        handle: Option<ViewHandle>,
        kind: &str,
        matches: impl Fn(ViewDesc) -> bool,
    ) -> Result<ResourceId> {
        let handle = handle.ok_or_else(|| self.error(format!("{:?} has no {} view", resource, kind)))?;
        match self.views.view(handle) {
            Some(desc) if matches(desc) => desc
                .resource()
                .ok_or_else(|| self.error(format!("{} view of {:?} is a sampler", kind, resource))),
            other => Err(self.error(format!("{} view of {:?} holds {:?}", kind, resource, other))),
        }
    }

    /// Resource behind the shader-readable view
    pub fn srv(&self, resource: FrameResource) -> Result<ResourceId> {
        let bound = *self.bound(resource)?;
        self.through_view(resource, bound.srv, "shader-resource", |d| {
            d == ViewDesc::ShaderResource(bound.id)
        })
    }

    /// Resource behind the unordered-access view
    pub fn uav(&self, resource: FrameResource) -> Result<ResourceId> {
        let bound = *self.bound(resource)?;
        self.through_view(resource, bound.uav, "unordered-access", |d| {
            d == ViewDesc::UnorderedAccess(bound.id)
        })
    }

    pub fn rtv(&self, resource: FrameResource) -> Result<ResourceId> {
        let bound = *self.bound(resource)?;
        self.through_view(resource, bound.rtv, "render-target", |d| d == ViewDesc::RenderTarget(bound.id))
    }

    pub fn dsv(&self, resource: FrameResource) -> Result<ResourceId> {
        let bound = *self.bound(resource)?;
        self.through_view(resource, bound.dsv, "depth-stencil", |d| d == ViewDesc::DepthStencil(bound.id))
    }

    /// Records a transition; `before` must be the tracked state
    pub fn transition(&mut self, resource: FrameResource, before: ResourceState, after: ResourceState) -> Result<()> {
        let current = self.tracker.state(resource);
        if current != Some(before) {
            return Err(self.error(format!(
                "transition of {:?} from {} but it is in {:?}",
                resource, before, current
            )));
        }
        let id = self.id(resource)?;
        self.list.transition(id, before, after);
        self.tracker.set(resource, after);
        Ok(())
    }

    /// Fails unless `resource` is currently in `state`
    pub fn expect_state(&self, resource: FrameResource, state: ResourceState) -> Result<()> {
        match self.tracker.state(resource) {
            Some(current) if current == state => Ok(()),
            current => Err(self.error(format!("{:?} expected in {} but is in {:?}", resource, state, current))),
        }
    }

    pub fn dispatch(&mut self, groups: [u32; 3], kernel: impl Kernel + 'static) {
        self.list.dispatch(groups, kernel);
    }

    pub fn draw(&mut self, vertex_count: u32, instance_count: u32, kernel: impl Kernel + 'static) {
        self.list.draw(vertex_count, instance_count, kernel);
    }
}

/// Per-resource transition chain established by an audit
#[derive(Debug, Clone, PartialEq)]
pub struct TransitionAudit {
    pub chains: BTreeMap<FrameResource, Vec<(String, ResourceState, ResourceState)>>,
}

/// Checks that every pass finds each resource in the state the previous
/// user left it, and that every chain closes back to the boundary state
pub fn audit_pass_order(passes: &[&dyn FramePass]) -> Result<TransitionAudit> {
    let mut current: BTreeMap<FrameResource, ResourceState> = BTreeMap::new();
    let mut chains: BTreeMap<FrameResource, Vec<(String, ResourceState, ResourceState)>> = BTreeMap::new();

    for pass in passes {
        for StateUse { resource, entry, exit } in pass.declaration().uses().iter().copied() {
            let found = *current.entry(resource).or_insert_with(|| resource.boundary_state());
            if found != entry {
                let previous = chains
                    .get(&resource)
                    .and_then(|c| c.last())
                    .map_or("frame start", |(name, _, _)| name.as_str());
                return Err(Error::Pass {
                    pass: pass.name().to_string(),
                    message: format!(
                        "expects {:?} in {} but {} left it in {}",
                        resource, entry, previous, found
                    ),
                });
            }
            current.insert(resource, exit);
            chains
                .entry(resource)
                .or_default()
                .push((pass.name().to_string(), entry, exit));
        }
    }

    if let Some((resource, state)) = current.iter().find(|(r, s)| r.boundary_state() != **s) {
        return Err(Error::Pass {
            pass: "frame end".into(),
            message: format!(
                "{:?} left in {} instead of {}",
                resource,
                state,
                resource.boundary_state()
            ),
        });
    }

    Ok(TransitionAudit { chains })
}
