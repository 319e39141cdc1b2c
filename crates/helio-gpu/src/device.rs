//! Software device: resource memory plus the queue scheduler

use std::collections::VecDeque;
use std::sync::Arc;

use glam::Vec4;
use parking_lot::Mutex;

use crate::command::{self, CommandList};
use crate::queue::{Queue, QueueKind};
use crate::resource::{
    BufferData, BufferDesc, GpuResource, ResourceData, ResourceId, ResourceMemory, TextureData, TextureDesc,
};
use crate::state::ResourceState;
use crate::{Error, Result};

/// One executed submission, in global execution order
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExecutionRecord {
    pub queue: QueueKind,
    pub label: String,
    /// Completion marker signalled by the submission
    pub marker: u64,
    pub sequence: u64,
}

pub(crate) enum Submission {
    Execute { list: CommandList, signal: u64 },
    Wait { queue: usize, value: u64 },
    Signal(u64),
}

pub(crate) struct QueueState {
    pub(crate) kind: QueueKind,
    /// Highest marker handed out
    pub(crate) signalled: u64,
    pub(crate) completed: u64,
    pub(crate) pending: VecDeque<Submission>,
}

pub(crate) struct DeviceState {
    pub(crate) memory: ResourceMemory,
    pub(crate) queues: Vec<QueueState>,
    timeline: Vec<ExecutionRecord>,
    sequence: u64,
    removed: Option<String>,
}

impl DeviceState {
    pub(crate) fn ensure_alive(&self) -> Result<()> {
        match &self.removed {
            Some(reason) => Err(Error::DeviceRemoved { reason: reason.clone() }),
            None => Ok(()),
        }
    }

    fn remove(&mut self, reason: String) -> Error {
        if self.removed.is_none() {
            log::error!("Device removed: {}", reason);
            self.removed = Some(reason.clone());
        }
        Error::DeviceRemoved { reason }
    }

    /// Runs at most one ready submission per queue; returns whether anything ran
    fn step(&mut self) -> Result<bool> {
        let mut progressed = false;
        for index in 0..self.queues.len() {
            let ready = match self.queues[index].pending.front() {
                None => false,
                Some(Submission::Wait { queue, value }) => self.queues[*queue].completed >= *value,
                Some(_) => true,
            };
            if !ready {
                continue;
            }
            let Some(submission) = self.queues[index].pending.pop_front() else {
                continue;
            };
            progressed = true;
            match submission {
                Submission::Wait { .. } => {}
                Submission::Signal(value) => self.queues[index].completed = value,
                Submission::Execute { list, signal } => {
                    let label = list.label().to_string();
                    if let Err(err) = command::execute(&mut self.memory, list.into_commands()) {
                        return Err(self.remove(format!("fault in '{}': {}", label, err)));
                    }
                    self.queues[index].completed = signal;
                    self.sequence += 1;
                    self.timeline.push(ExecutionRecord {
                        queue: self.queues[index].kind,
                        label,
                        marker: signal,
                        sequence: self.sequence,
                    });
                }
            }
        }
        Ok(progressed)
    }

    /// Executes until `queue` reaches `value`; a stall before that is a hang
    pub(crate) fn run_until(&mut self, queue: usize, value: u64) -> Result<()> {
        self.ensure_alive()?;
        while self.queues[queue].completed < value {
            if !self.step()? {
                let kind = self.queues[queue].kind;
                let completed = self.queues[queue].completed;
                return Err(self.remove(format!(
                    "{:?} queue hung waiting for marker {} (completed {})",
                    kind, value, completed
                )));
            }
        }
        Ok(())
    }

    fn run_all(&mut self) -> Result<()> {
        self.ensure_alive()?;
        while self.step()? {}
        Ok(())
    }
}

/// Handle to the shared software device
#[derive(Clone)]
pub struct Device {
    pub(crate) shared: Arc<Mutex<DeviceState>>,
}

impl Device {
    pub fn new() -> Self {
        log::info!("Creating software device");
        Self {
            shared: Arc::new(Mutex::new(DeviceState {
                memory: ResourceMemory::default(),
                queues: Vec::new(),
                timeline: Vec::new(),
                sequence: 0,
                removed: None,
            })),
        }
    }

    pub fn create_queue(&self, kind: QueueKind) -> Queue {
        let mut state = self.shared.lock();
        state.queues.push(QueueState {
            kind,
            signalled: 0,
            completed: 0,
            pending: VecDeque::new(),
        });
        Queue::new(self.clone(), state.queues.len() - 1, kind)
    }

    pub fn create_texture(&self, desc: TextureDesc, initial_state: ResourceState) -> Result<ResourceId> {
        let mut state = self.shared.lock();
        state.ensure_alive()?;
        let id = ResourceId::new();
        log::debug!(
            "Created texture '{}' {}x{}x{} {:?} with id {:?}",
            desc.label,
            desc.size.width,
            desc.size.height,
            desc.size.depth_or_array_layers,
            desc.format,
            id
        );
        state.memory.insert(
            id,
            GpuResource {
                label: desc.label.clone(),
                state: initial_state,
                data: ResourceData::Texture(TextureData::new(desc)),
            },
        );
        Ok(id)
    }

    pub fn create_buffer(&self, desc: BufferDesc, initial_state: ResourceState) -> Result<ResourceId> {
        let mut state = self.shared.lock();
        state.ensure_alive()?;
        let id = ResourceId::new();
        log::debug!("Created buffer '{}' ({} bytes) with id {:?}", desc.label, desc.size, id);
        state.memory.insert(
            id,
            GpuResource {
                label: desc.label.clone(),
                state: initial_state,
                data: ResourceData::Buffer(BufferData::new(desc)),
            },
        );
        Ok(id)
    }

    /// Releases memory immediately; the caller guarantees the GPU is done with it
    pub fn destroy_resource(&self, id: ResourceId) -> Result<()> {
        let mut state = self.shared.lock();
        let resource = state.memory.remove(id).ok_or(Error::UnknownResource(id))?;
        log::debug!("Destroyed '{}' ({:?})", resource.label(), id);
        Ok(())
    }

    /// CPU write into upload memory, visible to work that executes afterwards
    pub fn write_buffer(&self, id: ResourceId, offset: u64, data: &[u8]) -> Result<()> {
        let mut state = self.shared.lock();
        state.ensure_alive()?;
        state.memory.buffer_mut(id)?.write(offset, data)
    }

    /// CPU write of texel data, used for uploads of externally produced content
    pub fn write_texture(&self, id: ResourceId, texels: &[Vec4]) -> Result<()> {
        let mut state = self.shared.lock();
        state.ensure_alive()?;
        let texture = state.memory.texture_mut(id)?;
        if texture.texels().len() != texels.len() {
            return Err(Error::Recording(format!(
                "upload of {} texels into '{}' ({} texels)",
                texels.len(),
                texture.desc().label,
                texture.texels().len()
            )));
        }
        texture.texels_mut().copy_from_slice(texels);
        Ok(())
    }

    /// Texels as of the work executed so far
    pub fn read_texture(&self, id: ResourceId) -> Result<Vec<Vec4>> {
        let state = self.shared.lock();
        Ok(state.memory.texture(id)?.texels().to_vec())
    }

    pub fn read_buffer<T: bytemuck::Pod>(&self, id: ResourceId, offset: u64) -> Result<T> {
        let state = self.shared.lock();
        state.memory.buffer(id)?.read(offset)
    }

    pub fn texture_desc(&self, id: ResourceId) -> Result<TextureDesc> {
        let state = self.shared.lock();
        Ok(state.memory.texture(id)?.desc().clone())
    }

    /// State as of the work executed so far
    pub fn resource_state(&self, id: ResourceId) -> Result<ResourceState> {
        self.shared.lock().memory.state(id)
    }

    pub fn resource_count(&self) -> usize {
        self.shared.lock().memory.len()
    }

    pub fn contains(&self, id: ResourceId) -> bool {
        self.shared.lock().memory.contains(id)
    }

    /// Executes all work that can run
    pub fn poll(&self) -> Result<()> {
        self.shared.lock().run_all()
    }

    /// Health query: fails once the device has been removed
    pub fn check_device_removed_status(&self) -> Result<()> {
        self.shared.lock().ensure_alive()
    }

    /// Marks the device removed, as a GPU fault would
    pub fn report_fault(&self, reason: impl Into<String>) -> Error {
        self.shared.lock().remove(reason.into())
    }

    pub fn timeline(&self) -> Vec<ExecutionRecord> {
        self.shared.lock().timeline.clone()
    }
}

impl Default for Device {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::command::{Kernel, ResourceAccess};

    struct Fill {
        target: ResourceId,
        value: f32,
    }

    impl Kernel for Fill {
        fn label(&self) -> &str {
            "fill"
        }

        fn accesses(&self) -> Vec<ResourceAccess> {
            vec![ResourceAccess::new(self.target, ResourceState::UnorderedAccess)]
        }

        fn execute(&self, memory: &mut ResourceMemory) -> Result<()> {
            memory.texture_mut(self.target)?.fill(Vec4::splat(self.value));
            Ok(())
        }
    }

    fn target(device: &Device) -> ResourceId {
        device
            .create_texture(
                TextureDesc::d2(
                    "target",
                    2,
                    2,
                    wgpu::TextureFormat::Rgba32Float,
                    wgpu::TextureUsages::STORAGE_BINDING,
                ),
                ResourceState::NonPixelShaderResource,
            )
            .unwrap()
    }

    #[test]
    fn work_runs_lazily_when_waited_on() {
        let device = Device::new();
        let queue = device.create_queue(QueueKind::Direct);
        let tex = target(&device);

        let mut list = CommandList::new("fill", QueueKind::Direct);
        list.transition(tex, ResourceState::NonPixelShaderResource, ResourceState::UnorderedAccess);
        list.dispatch([1, 1, 1], Fill { target: tex, value: 3.0 });
        list.close();
        let marker = queue.submit(list).unwrap();

        assert_eq!(device.read_texture(tex).unwrap()[0], Vec4::ZERO);
        queue.wait_for_fence_blocking(marker).unwrap();
        assert_eq!(device.read_texture(tex).unwrap()[0], Vec4::splat(3.0));
        assert_eq!(device.resource_state(tex).unwrap(), ResourceState::UnorderedAccess);
    }

    #[test]
    fn access_in_wrong_state_removes_device() {
        let device = Device::new();
        let queue = device.create_queue(QueueKind::Direct);
        let tex = target(&device);

        let mut list = CommandList::new("missing barrier", QueueKind::Direct);
        list.dispatch([1, 1, 1], Fill { target: tex, value: 1.0 });
        list.close();
        let marker = queue.submit(list).unwrap();

        let err = queue.wait_for_fence_blocking(marker).unwrap_err();
        assert!(matches!(err, Error::DeviceRemoved { .. }));
        assert!(device.check_device_removed_status().is_err());
        assert!(device.create_texture(TextureDesc::d2("late", 1, 1, wgpu::TextureFormat::R32Float, wgpu::TextureUsages::empty()), ResourceState::Common).is_err());
    }

    #[test]
    fn waiting_for_an_unsubmitted_marker_is_a_hang() {
        let device = Device::new();
        let queue = device.create_queue(QueueKind::Direct);
        assert!(matches!(
            queue.wait_for_fence_blocking(5),
            Err(Error::DeviceRemoved { .. })
        ));
    }
}
