//! Command recording

use glam::Vec4;

use crate::queue::QueueKind;
use crate::resource::{ResourceId, ResourceMemory};
use crate::state::{ResourceBarrier, ResourceState};
use crate::Result;

/// A compiled GPU program together with everything bound to it
///
/// Constants and view-resolved resource ids are captured when the kernel is
/// recorded; `execute` runs later, when the queue reaches it.
pub trait Kernel: Send {
    fn label(&self) -> &str;

    /// Resources touched by the kernel and the state each must be in
    fn accesses(&self) -> Vec<ResourceAccess>;

    fn execute(&self, memory: &mut ResourceMemory) -> Result<()>;
}

/// A resource a kernel touches, with the state it requires
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ResourceAccess {
    pub resource: ResourceId,
    pub state: ResourceState,
}

impl ResourceAccess {
    pub fn new(resource: ResourceId, state: ResourceState) -> Self {
        Self { resource, state }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkKind {
    Dispatch { groups: [u32; 3] },
    Draw { vertex_count: u32, instance_count: u32 },
}

pub enum RecordedCommand {
    Barrier(Vec<ResourceBarrier>),
    Work { kind: WorkKind, kernel: Box<dyn Kernel> },
    Copy { src: ResourceId, dst: ResourceId },
    ClearColor { target: ResourceId, state: ResourceState, color: Vec4 },
    ClearDepth { target: ResourceId, depth: f32 },
    Marker(String),
}

impl std::fmt::Debug for RecordedCommand {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RecordedCommand::Barrier(barriers) => f.debug_tuple("Barrier").field(barriers).finish(),
            RecordedCommand::Work { kind, kernel } => f
                .debug_struct("Work")
                .field("kind", kind)
                .field("kernel", &kernel.label())
                .finish(),
            RecordedCommand::Copy { src, dst } => f.debug_struct("Copy").field("src", src).field("dst", dst).finish(),
            RecordedCommand::ClearColor { target, color, .. } => f
                .debug_struct("ClearColor")
                .field("target", target)
                .field("color", color)
                .finish(),
            RecordedCommand::ClearDepth { target, depth } => f
                .debug_struct("ClearDepth")
                .field("target", target)
                .field("depth", depth)
                .finish(),
            RecordedCommand::Marker(label) => f.debug_tuple("Marker").field(label).finish(),
        }
    }
}

/// An ordered list of commands for one queue
///
/// Barriers are batched and flushed in front of the next non-barrier command.
#[derive(Debug)]
pub struct CommandList {
    label: String,
    queue: QueueKind,
    commands: Vec<RecordedCommand>,
    batched: Vec<ResourceBarrier>,
    closed: bool,
}

impl CommandList {
    pub fn new(label: impl Into<String>, queue: QueueKind) -> Self {
        Self {
            label: label.into(),
            queue,
            commands: Vec::new(),
            batched: Vec::new(),
            closed: false,
        }
    }

    pub fn label(&self) -> &str {
        &self.label
    }

    pub fn queue(&self) -> QueueKind {
        self.queue
    }

    pub fn is_closed(&self) -> bool {
        self.closed
    }

    pub fn commands(&self) -> &[RecordedCommand] {
        &self.commands
    }

    /// Queues a transition; identical states are skipped
    pub fn transition(&mut self, resource: ResourceId, before: ResourceState, after: ResourceState) {
        if before != after {
            self.batched.push(ResourceBarrier::transition(resource, before, after));
        }
    }

    pub fn barrier(&mut self, barrier: ResourceBarrier) {
        self.transition(barrier.resource, barrier.before, barrier.after);
    }

    pub fn flush_barriers(&mut self) {
        if !self.batched.is_empty() {
            let batch = std::mem::take(&mut self.batched);
            self.commands.push(RecordedCommand::Barrier(batch));
        }
    }

    fn push(&mut self, command: RecordedCommand) {
        self.flush_barriers();
        self.commands.push(command);
    }

    pub fn dispatch(&mut self, groups: [u32; 3], kernel: impl Kernel + 'static) {
        self.push(RecordedCommand::Work {
            kind: WorkKind::Dispatch { groups },
            kernel: Box::new(kernel),
        });
    }

    pub fn draw(&mut self, vertex_count: u32, instance_count: u32, kernel: impl Kernel + 'static) {
        self.push(RecordedCommand::Work {
            kind: WorkKind::Draw {
                vertex_count,
                instance_count,
            },
            kernel: Box::new(kernel),
        });
    }

    pub fn copy_resource(&mut self, src: ResourceId, dst: ResourceId) {
        self.push(RecordedCommand::Copy { src, dst });
    }

    pub fn clear_render_target(&mut self, target: ResourceId, color: Vec4) {
        self.push(RecordedCommand::ClearColor {
            target,
            state: ResourceState::RenderTarget,
            color,
        });
    }

    pub fn clear_unordered_access(&mut self, target: ResourceId, value: Vec4) {
        self.push(RecordedCommand::ClearColor {
            target,
            state: ResourceState::UnorderedAccess,
            color: value,
        });
    }

    pub fn clear_depth(&mut self, target: ResourceId, depth: f32) {
        self.push(RecordedCommand::ClearDepth { target, depth });
    }

    pub fn marker(&mut self, label: impl Into<String>) {
        self.push(RecordedCommand::Marker(label.into()));
    }

    pub fn close(&mut self) {
        self.flush_barriers();
        self.closed = true;
    }

    /// Every transition recorded so far, in order
    pub fn barriers(&self) -> impl Iterator<Item = &ResourceBarrier> + '_ {
        self.commands
            .iter()
            .filter_map(|c| match c {
                RecordedCommand::Barrier(batch) => Some(batch.iter()),
                _ => None,
            })
            .flatten()
            .chain(self.batched.iter())
    }

    /// Labels of the recorded dispatches and draws, in order
    pub fn work_labels(&self) -> Vec<&str> {
        self.commands
            .iter()
            .filter_map(|c| match c {
                RecordedCommand::Work { kernel, .. } => Some(kernel.label()),
                _ => None,
            })
            .collect()
    }

    pub(crate) fn into_commands(self) -> Vec<RecordedCommand> {
        self.commands
    }
}

/// Runs a closed command list against device memory
pub(crate) fn execute(memory: &mut ResourceMemory, commands: Vec<RecordedCommand>) -> Result<()> {
    for command in commands {
        match command {
            RecordedCommand::Barrier(batch) => {
                for barrier in &batch {
                    memory.apply_barrier(barrier)?;
                }
            }
            RecordedCommand::Work { kernel, .. } => {
                for access in kernel.accesses() {
                    memory.require_state(access.resource, access.state)?;
                }
                log::trace!("Executing '{}'", kernel.label());
                kernel.execute(memory)?;
            }
            RecordedCommand::Copy { src, dst } => {
                memory.require_state(src, ResourceState::CopySource)?;
                memory.require_state(dst, ResourceState::CopyDest)?;
                memory.copy(src, dst)?;
            }
            RecordedCommand::ClearColor { target, state, color } => {
                memory.require_state(target, state)?;
                memory.texture_mut(target)?.fill(color);
            }
            RecordedCommand::ClearDepth { target, depth } => {
                memory.require_state(target, ResourceState::DepthWrite)?;
                memory.texture_mut(target)?.fill(Vec4::new(depth, 0.0, 0.0, 0.0));
            }
            RecordedCommand::Marker(label) => log::trace!("Marker '{}'", label),
        }
    }
    Ok(())
}
