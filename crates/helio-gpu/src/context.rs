//! Graphics context: device, queues, view pools, frame ring and back buffers
//!
//! Constructed once and passed by reference to everything that records GPU
//! work.

use crate::command::CommandList;
use crate::descriptor::{ViewAllocator, ViewDesc, ViewHandle, ViewPoolKind, ViewRange};
use crate::device::Device;
use crate::frame::FrameRing;
use crate::queue::{Queue, QueueKind};
use crate::resource::{ResourceId, TextureDesc};
use crate::state::ResourceState;
use crate::{Error, Result};

/// Capacities of the four view pools
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ViewPoolCapacities {
    pub render_target: u32,
    pub depth_stencil: u32,
    pub shader_resource: u32,
    pub sampler: u32,
}

impl Default for ViewPoolCapacities {
    fn default() -> Self {
        Self {
            // back buffers plus renderer targets
            render_target: 2 + 16,
            depth_stencil: 16,
            shader_resource: 256,
            sampler: 8,
        }
    }
}

/// Graphics context configuration
#[derive(Debug, Clone)]
pub struct GraphicsConfig {
    /// Back-buffer width in pixels
    pub width: u32,
    /// Back-buffer height in pixels
    pub height: u32,
    /// Frames in flight; also the back-buffer count
    pub ring_size: usize,
    pub view_pool_capacities: ViewPoolCapacities,
    pub back_buffer_format: wgpu::TextureFormat,
    /// Size of each frame slot's constant upload buffer
    pub pass_constants_size: u64,
}

impl Default for GraphicsConfig {
    fn default() -> Self {
        Self {
            width: 1280,
            height: 720,
            ring_size: 2,
            view_pool_capacities: ViewPoolCapacities::default(),
            back_buffer_format: wgpu::TextureFormat::Rgba8Unorm,
            pass_constants_size: 1024,
        }
    }
}

impl GraphicsConfig {
    pub fn validate(&self) -> Result<()> {
        if self.width == 0 || self.height == 0 {
            return Err(Error::Config(format!("zero-sized back buffer {}x{}", self.width, self.height)));
        }
        if self.ring_size == 0 {
            return Err(Error::Config("ring_size must be at least 1".into()));
        }
        if (self.view_pool_capacities.render_target as usize) < self.ring_size {
            return Err(Error::Config(format!(
                "render-target pool of {} cannot hold {} back buffers",
                self.view_pool_capacities.render_target, self.ring_size
            )));
        }
        Ok(())
    }
}

pub struct GraphicsContext {
    config: GraphicsConfig,
    device: Device,
    direct: Queue,
    compute: Queue,
    views: ViewAllocator,
    frames: FrameRing,
    back_buffers: Vec<ResourceId>,
    back_buffer_views: ViewRange,
    /// Resources released while the GPU may still use them, with the frame of release
    pending_destroys: Vec<(u64, ResourceId)>,
}

impl GraphicsContext {
    pub fn new(config: GraphicsConfig) -> Result<Self> {
        config.validate()?;

        let device = Device::new();
        let direct = device.create_queue(QueueKind::Direct);
        let compute = device.create_queue(QueueKind::Compute);

        let caps = config.view_pool_capacities;
        let mut views = ViewAllocator::new(
            [caps.render_target, caps.depth_stencil, caps.shader_resource, caps.sampler],
            config.ring_size,
        );
        let frames = FrameRing::new(&device, config.ring_size, config.pass_constants_size)?;
        let (back_buffers, back_buffer_views) =
            Self::create_back_buffers(&device, &mut views, &config, config.width, config.height)?;

        log::info!(
            "Graphics context ready: {}x{}, {} frames in flight",
            config.width,
            config.height,
            config.ring_size
        );

        Ok(Self {
            config,
            device,
            direct,
            compute,
            views,
            frames,
            back_buffers,
            back_buffer_views,
            pending_destroys: Vec::new(),
        })
    }

    fn create_back_buffers(
        device: &Device,
        views: &mut ViewAllocator,
        config: &GraphicsConfig,
        width: u32,
        height: u32,
    ) -> Result<(Vec<ResourceId>, ViewRange)> {
        let range = views.allocate(ViewPoolKind::RenderTarget, config.ring_size as u32)?;
        let mut buffers = Vec::with_capacity(config.ring_size);
        for i in 0..config.ring_size {
            let id = device.create_texture(
                TextureDesc::d2(
                    format!("Back Buffer {}", i),
                    width,
                    height,
                    config.back_buffer_format,
                    wgpu::TextureUsages::RENDER_ATTACHMENT | wgpu::TextureUsages::COPY_DST,
                ),
                ResourceState::Present,
            )?;
            views.write_view(range.handle(i as u32), ViewDesc::RenderTarget(id))?;
            buffers.push(id);
        }
        Ok((buffers, range))
    }

    pub fn config(&self) -> &GraphicsConfig {
        &self.config
    }

    pub fn device(&self) -> &Device {
        &self.device
    }

    pub fn direct_queue(&self) -> &Queue {
        &self.direct
    }

    pub fn compute_queue(&self) -> &Queue {
        &self.compute
    }

    pub fn views(&self) -> &ViewAllocator {
        &self.views
    }

    pub fn views_mut(&mut self) -> &mut ViewAllocator {
        &mut self.views
    }

    pub fn frames(&self) -> &FrameRing {
        &self.frames
    }

    pub fn width(&self) -> u32 {
        self.config.width
    }

    pub fn height(&self) -> u32 {
        self.config.height
    }

    pub fn ring_size(&self) -> usize {
        self.frames.ring_size()
    }

    /// Slot index of the frame being recorded
    pub fn frame_index(&self) -> usize {
        self.frames.current_index()
    }

    pub fn total_frame_count(&self) -> u64 {
        self.frames.total_frames()
    }

    pub fn back_buffer(&self) -> ResourceId {
        self.back_buffers[self.frames.current_index()]
    }

    pub fn back_buffer_view(&self) -> ViewHandle {
        self.back_buffer_views.handle(self.frames.current_index() as u32)
    }

    /// Current slot's per-frame constant buffer
    pub fn pass_constants_buffer(&self) -> ResourceId {
        self.frames.current().constant_buffer()
    }

    /// Uploads this frame's constants and opens its command list
    pub fn begin_draw(&mut self, pass_constants: &[u8]) -> Result<()> {
        self.check_device_removed_status()?;
        self.device.write_buffer(self.pass_constants_buffer(), 0, pass_constants)?;
        let back_buffer = self.back_buffer();
        let list = self.frames.begin_recording(QueueKind::Direct)?;
        list.transition(back_buffer, ResourceState::Present, ResourceState::RenderTarget);
        Ok(())
    }

    pub fn command_list(&mut self) -> Result<&mut CommandList> {
        self.frames.command_list()
    }

    /// Discards the current frame's open list after a failed recording
    ///
    /// The slot keeps its previous marker, so the next [`Self::begin_draw`]
    /// reopens it as if this frame had never started.
    pub fn abort_frame(&mut self) -> bool {
        self.frames.abort_recording().is_some()
    }

    /// The open command list alongside the view tables it records against
    pub fn recording_parts(&mut self) -> Result<(&mut CommandList, &ViewAllocator)> {
        let list = self.frames.command_list()?;
        Ok((list, &self.views))
    }

    /// Copies `src` into the back buffer, restoring both states afterwards
    pub fn copy_to_back_buffer(&mut self, src: ResourceId, src_state: ResourceState) -> Result<()> {
        let back_buffer = self.back_buffer();
        let list = self.frames.command_list()?;
        list.transition(src, src_state, ResourceState::CopySource);
        list.transition(back_buffer, ResourceState::RenderTarget, ResourceState::CopyDest);
        list.copy_resource(src, back_buffer);
        list.transition(src, ResourceState::CopySource, src_state);
        list.transition(back_buffer, ResourceState::CopyDest, ResourceState::RenderTarget);
        Ok(())
    }

    /// Returns the back buffer to present state and submits the frame
    pub fn end_frame(&mut self) -> Result<u64> {
        let back_buffer = self.back_buffer();
        self.frames
            .command_list()?
            .transition(back_buffer, ResourceState::RenderTarget, ResourceState::Present);
        self.frames.end_frame(&self.direct)
    }

    /// Flips to the next frame slot and reclaims views and resources that became safe
    pub fn present(&mut self) -> Result<()> {
        self.check_device_removed_status()?;
        self.frames.begin_frame(&self.direct)?;
        let frame = self.frames.total_frames();
        self.views.process_frame(frame);
        self.process_destroys(Some(frame))
    }

    /// Destroys `id` once every frame that may still reference it has retired
    pub fn destroy_deferred(&mut self, id: ResourceId) {
        self.pending_destroys.push((self.frames.total_frames(), id));
    }

    pub fn pending_destroy_count(&self) -> usize {
        self.pending_destroys.len()
    }

    /// Drains the GPU and releases everything still pending
    pub fn flush_deferred(&mut self) -> Result<()> {
        self.wait_for_gpu_idle()?;
        self.views.process_all();
        self.process_destroys(None)
    }

    fn process_destroys(&mut self, frame: Option<u64>) -> Result<()> {
        let ring = self.ring_size() as u64;
        let (ready, waiting): (Vec<_>, Vec<_>) = self
            .pending_destroys
            .drain(..)
            .partition(|(freed_at, _)| frame.map_or(true, |f| freed_at + ring <= f));
        self.pending_destroys = waiting;
        for (_, id) in ready {
            self.device.destroy_resource(id)?;
        }
        Ok(())
    }

    /// Blocks until both queues have drained
    pub fn wait_for_gpu_idle(&self) -> Result<()> {
        self.direct.wait_for_idle()?;
        self.compute.wait_for_idle()
    }

    /// Recreates the back buffers at a new size
    pub fn resize(&mut self, width: u32, height: u32) -> Result<()> {
        if width == 0 || height == 0 {
            return Err(Error::Config(format!("zero-sized back buffer {}x{}", width, height)));
        }
        if self.frames.current().is_recording() {
            return Err(Error::Recording("resize while a frame is recording".into()));
        }
        log::info!(
            "Resizing back buffers {}x{} -> {}x{}",
            self.config.width,
            self.config.height,
            width,
            height
        );

        self.wait_for_gpu_idle()?;
        self.views.free(self.back_buffer_views)?;
        for id in self.back_buffers.drain(..) {
            self.device.destroy_resource(id)?;
        }
        self.views.process_all();
        self.process_destroys(None)?;

        let (buffers, range) = Self::create_back_buffers(&self.device, &mut self.views, &self.config, width, height)?;
        self.back_buffers = buffers;
        self.back_buffer_views = range;
        self.config.width = width;
        self.config.height = height;
        Ok(())
    }

    pub fn check_device_removed_status(&self) -> Result<()> {
        let status = self.device.check_device_removed_status();
        if let Err(err) = &status {
            log::error!("Device health check failed: {}", err);
        }
        status
    }
}

impl Drop for GraphicsContext {
    fn drop(&mut self) {
        if let Err(err) = self.wait_for_gpu_idle() {
            log::error!("Failed to drain GPU work at shutdown: {}", err);
        }
    }
}
