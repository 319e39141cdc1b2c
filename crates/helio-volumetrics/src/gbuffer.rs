//! Resolution-dependent render targets
//!
//! The G-buffer, the lit output and a double-buffered depth target. Depth
//! alternates every frame so the volumetric pass can read last frame's depth
//! while this frame's is written; the two may differ in size right after a
//! resize.

use std::collections::HashMap;

use glam::UVec2;
use helio_gpu::{GraphicsContext, ResourceId, TextureDesc, ViewDesc, ViewPoolKind, ViewRange};

use crate::passes::{BoundResource, FrameResource};
use crate::Result;

const COLOR_TARGETS: [(FrameResource, &str, wgpu::TextureFormat); 4] = [
    (FrameResource::GBufferAlbedo, "GBuffer Albedo", wgpu::TextureFormat::Rgba8Unorm),
    (FrameResource::GBufferNormal, "GBuffer Normal", wgpu::TextureFormat::Rgba16Float),
    (
        FrameResource::GBufferRoughnessMetal,
        "GBuffer Roughness Metal",
        wgpu::TextureFormat::Rgba8Unorm,
    ),
    (FrameResource::Output, "Lit Output", wgpu::TextureFormat::Rgba16Float),
];

struct ColorTargets {
    ids: [ResourceId; 4],
    /// One render-target view per target
    rtvs: ViewRange,
    /// Shader-resource views of the G-buffer, then the output's unordered-access view
    srvs: ViewRange,
}

struct DepthTarget {
    id: ResourceId,
    size: UVec2,
    dsv: ViewRange,
    srv: ViewRange,
}

pub struct GBuffer {
    size: UVec2,
    color: ColorTargets,
    depth: [DepthTarget; 2],
    current: usize,
}

impl GBuffer {
    pub fn new(ctx: &mut GraphicsContext, size: UVec2) -> Result<Self> {
        let color = Self::create_color(ctx, size)?;
        let depth = [Self::create_depth(ctx, size, 0)?, Self::create_depth(ctx, size, 1)?];
        Ok(Self {
            size,
            color,
            depth,
            current: 0,
        })
    }

    fn create_color(ctx: &mut GraphicsContext, size: UVec2) -> Result<ColorTargets> {
        let rtvs = ctx.views_mut().allocate(ViewPoolKind::RenderTarget, 4)?;
        let srvs = match ctx.views_mut().allocate(ViewPoolKind::ShaderResource, 4) {
            Ok(srvs) => srvs,
            Err(err) => {
                ctx.views_mut().free(rtvs)?;
                return Err(err.into());
            }
        };

        let device = ctx.device().clone();
        let mut ids = Vec::with_capacity(COLOR_TARGETS.len());
        for (resource, label, format) in COLOR_TARGETS {
            let usage = if resource == FrameResource::Output {
                wgpu::TextureUsages::RENDER_ATTACHMENT
                    | wgpu::TextureUsages::STORAGE_BINDING
                    | wgpu::TextureUsages::COPY_SRC
            } else {
                wgpu::TextureUsages::RENDER_ATTACHMENT | wgpu::TextureUsages::TEXTURE_BINDING
            };
            ids.push(device.create_texture(
                TextureDesc::d2(label, size.x, size.y, format, usage),
                resource.boundary_state(),
            )?);
        }
        let ids = [ids[0], ids[1], ids[2], ids[3]];

        let views = ctx.views_mut();
        for (i, id) in ids.iter().enumerate() {
            views.write_view(rtvs.handle(i as u32), ViewDesc::RenderTarget(*id))?;
        }
        for (i, id) in ids[..3].iter().enumerate() {
            views.write_view(srvs.handle(i as u32), ViewDesc::ShaderResource(*id))?;
        }
        views.write_view(srvs.handle(3), ViewDesc::UnorderedAccess(ids[3]))?;
        Ok(ColorTargets { ids, rtvs, srvs })
    }

    fn create_depth(ctx: &mut GraphicsContext, size: UVec2, index: usize) -> Result<DepthTarget> {
        let dsv = ctx.views_mut().allocate(ViewPoolKind::DepthStencil, 1)?;
        let srv = match ctx.views_mut().allocate(ViewPoolKind::ShaderResource, 1) {
            Ok(srv) => srv,
            Err(err) => {
                ctx.views_mut().free(dsv)?;
                return Err(err.into());
            }
        };
        let id = ctx.device().create_texture(
            TextureDesc::d2(
                format!("Depth {}", index),
                size.x,
                size.y,
                wgpu::TextureFormat::Depth32Float,
                wgpu::TextureUsages::RENDER_ATTACHMENT | wgpu::TextureUsages::TEXTURE_BINDING,
            ),
            FrameResource::Depth.boundary_state(),
        )?;
        let views = ctx.views_mut();
        views.write_view(dsv.handle(0), ViewDesc::DepthStencil(id))?;
        views.write_view(srv.handle(0), ViewDesc::ShaderResource(id))?;
        Ok(DepthTarget { id, size, dsv, srv })
    }

    /// Color targets plus the depth target in slot `index`, all or nothing
    fn create_targets(ctx: &mut GraphicsContext, size: UVec2, index: usize) -> Result<(ColorTargets, DepthTarget)> {
        let color = Self::create_color(ctx, size)?;
        match Self::create_depth(ctx, size, index) {
            Ok(depth) => Ok((color, depth)),
            Err(err) => {
                ctx.views_mut().free(color.rtvs)?;
                ctx.views_mut().free(color.srvs)?;
                for id in color.ids {
                    ctx.destroy_deferred(id);
                }
                Err(err)
            }
        }
    }

    fn release_color(&self, ctx: &mut GraphicsContext) -> Result<()> {
        ctx.views_mut().free(self.color.rtvs)?;
        ctx.views_mut().free(self.color.srvs)?;
        for id in self.color.ids {
            ctx.destroy_deferred(id);
        }
        Ok(())
    }

    fn release_depth(ctx: &mut GraphicsContext, depth: &DepthTarget) -> Result<()> {
        ctx.views_mut().free(depth.dsv)?;
        ctx.views_mut().free(depth.srv)?;
        ctx.destroy_deferred(depth.id);
        Ok(())
    }

    pub fn size(&self) -> UVec2 {
        self.size
    }

    pub fn output(&self) -> ResourceId {
        self.color.ids[3]
    }

    pub fn depth(&self) -> ResourceId {
        self.depth[self.current].id
    }

    pub fn prev_depth(&self) -> ResourceId {
        self.depth[self.current ^ 1].id
    }

    pub fn depth_size(&self) -> UVec2 {
        self.depth[self.current].size
    }

    pub fn prev_depth_size(&self) -> UVec2 {
        self.depth[self.current ^ 1].size
    }

    /// Recreates the resolution-dependent targets; last frame's depth is kept
    ///
    /// Waits for the GPU and reclaims the old views before creating the new
    /// ones, so a resize needs no more view capacity than a steady frame. If
    /// creation fails the targets are rebuilt at the old size and the error
    /// is returned.
    pub fn resize(&mut self, ctx: &mut GraphicsContext, size: UVec2) -> Result<()> {
        if size == self.size {
            return Ok(());
        }
        self.release_color(ctx)?;
        Self::release_depth(ctx, &self.depth[self.current])?;
        ctx.flush_deferred()?;

        match Self::create_targets(ctx, size, self.current) {
            Ok((color, depth)) => {
                self.color = color;
                self.depth[self.current] = depth;
                self.size = size;
                Ok(())
            }
            Err(err) => {
                log::error!(
                    "G-buffer resize to {}x{} failed, restoring {}x{}: {}",
                    size.x,
                    size.y,
                    self.size.x,
                    self.size.y,
                    err
                );
                ctx.flush_deferred()?;
                let (color, depth) = Self::create_targets(ctx, self.size, self.current)?;
                self.color = color;
                self.depth[self.current] = depth;
                Err(err)
            }
        }
    }

    /// Brings the depth target about to be written to the current size
    ///
    /// Only happens on the first frame that writes a slot after a resize. The
    /// stale target is reclaimed after a GPU drain so the replacement fits in
    /// the views it gave up.
    pub fn prepare_frame(&mut self, ctx: &mut GraphicsContext) -> Result<()> {
        if self.depth[self.current].size == self.size {
            return Ok(());
        }
        log::debug!(
            "Recreating depth {} at {}x{}",
            self.current,
            self.size.x,
            self.size.y
        );
        Self::release_depth(ctx, &self.depth[self.current])?;
        ctx.flush_deferred()?;
        self.depth[self.current] = Self::create_depth(ctx, self.size, self.current)?;
        Ok(())
    }

    /// This frame's depth becomes next frame's history
    pub fn flip_depth(&mut self) {
        self.current ^= 1;
    }

    pub fn bind(&self, resources: &mut HashMap<FrameResource, BoundResource>) {
        for (i, (resource, _, _)) in COLOR_TARGETS.iter().enumerate() {
            let mut bound = BoundResource::new(self.color.ids[i]);
            bound.rtv = Some(self.color.rtvs.handle(i as u32));
            if *resource == FrameResource::Output {
                bound.uav = Some(self.color.srvs.handle(3));
            } else {
                bound.srv = Some(self.color.srvs.handle(i as u32));
            }
            resources.insert(*resource, bound);
        }

        for (resource, depth) in [
            (FrameResource::Depth, &self.depth[self.current]),
            (FrameResource::PrevDepth, &self.depth[self.current ^ 1]),
        ] {
            let mut bound = BoundResource::new(depth.id);
            bound.dsv = Some(depth.dsv.handle(0));
            bound.srv = Some(depth.srv.handle(0));
            resources.insert(resource, bound);
        }
    }

    pub fn release(&self, ctx: &mut GraphicsContext) -> Result<()> {
        self.release_color(ctx)?;
        for depth in &self.depth {
            Self::release_depth(ctx, depth)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use helio_gpu::GraphicsConfig;

    fn context() -> GraphicsContext {
        GraphicsContext::new(GraphicsConfig {
            width: 16,
            height: 8,
            ..Default::default()
        })
        .unwrap()
    }

    #[test]
    fn resize_keeps_previous_depth_until_it_is_rewritten() {
        let mut ctx = context();
        let mut gbuffer = GBuffer::new(&mut ctx, UVec2::new(16, 8)).unwrap();
        gbuffer.flip_depth();
        gbuffer.resize(&mut ctx, UVec2::new(32, 16)).unwrap();
        assert_eq!(gbuffer.depth_size(), UVec2::new(32, 16));
        assert_eq!(gbuffer.prev_depth_size(), UVec2::new(16, 8));

        gbuffer.flip_depth();
        gbuffer.prepare_frame(&mut ctx).unwrap();
        assert_eq!(gbuffer.depth_size(), UVec2::new(32, 16));
        assert_eq!(gbuffer.prev_depth_size(), UVec2::new(32, 16));
    }

    #[test]
    fn resize_fits_in_the_views_it_gives_up() {
        // back buffers plus color targets, two depths, nothing spare
        let mut ctx = GraphicsContext::new(GraphicsConfig {
            width: 16,
            height: 8,
            view_pool_capacities: helio_gpu::ViewPoolCapacities {
                render_target: 2 + 4,
                depth_stencil: 2,
                shader_resource: 4 + 2,
                sampler: 1,
            },
            ..Default::default()
        })
        .unwrap();
        let mut gbuffer = GBuffer::new(&mut ctx, UVec2::new(16, 8)).unwrap();
        let full = ctx.views().occupancy();

        gbuffer.flip_depth();
        gbuffer.resize(&mut ctx, UVec2::new(32, 16)).unwrap();
        assert_eq!(ctx.views().occupancy(), full);
        assert_eq!(gbuffer.size(), UVec2::new(32, 16));

        gbuffer.flip_depth();
        gbuffer.prepare_frame(&mut ctx).unwrap();
        assert_eq!(gbuffer.prev_depth_size(), UVec2::new(32, 16));
        assert_eq!(ctx.views().occupancy(), full);

        let mut resources = HashMap::new();
        gbuffer.bind(&mut resources);
        let output = resources[&FrameResource::Output];
        assert_eq!(ctx.views().resolve(output.uav.unwrap()).unwrap(), gbuffer.output());
    }

    #[test]
    fn bindings_resolve_through_their_views() {
        let mut ctx = context();
        let gbuffer = GBuffer::new(&mut ctx, UVec2::new(16, 8)).unwrap();
        let mut resources = HashMap::new();
        gbuffer.bind(&mut resources);
        let output = resources[&FrameResource::Output];
        assert_eq!(ctx.views().resolve(output.uav.unwrap()).unwrap(), gbuffer.output());
        let depth = resources[&FrameResource::Depth];
        assert_eq!(ctx.views().view(depth.dsv.unwrap()), Some(ViewDesc::DepthStencil(gbuffer.depth())));
        assert_ne!(gbuffer.depth(), gbuffer.prev_depth());
    }
}
