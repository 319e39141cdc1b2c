//! Frame-slot ring
//!
//! `ring_size` slots rotate every frame. Each slot owns its recording state,
//! an upload buffer for per-frame constants, and the marker that proves the
//! GPU has finished with the slot's previous use.

use crate::command::CommandList;
use crate::device::Device;
use crate::queue::{Queue, QueueKind};
use crate::resource::{BufferDesc, ResourceId};
use crate::state::ResourceState;
use crate::{Error, Result};

pub struct FrameSlot {
    index: usize,
    fence_value: u64,
    /// Total frame number this slot was last begun for
    frame_number: u64,
    constant_buffer: ResourceId,
    command_list: Option<CommandList>,
}

impl FrameSlot {
    pub fn index(&self) -> usize {
        self.index
    }

    pub fn fence_value(&self) -> u64 {
        self.fence_value
    }

    pub fn frame_number(&self) -> u64 {
        self.frame_number
    }

    pub fn constant_buffer(&self) -> ResourceId {
        self.constant_buffer
    }

    pub fn is_recording(&self) -> bool {
        self.command_list.is_some()
    }
}

pub struct FrameRing {
    slots: Vec<FrameSlot>,
    current: usize,
    total_frames: u64,
}

impl FrameRing {
    pub fn new(device: &Device, ring_size: usize, constant_buffer_size: u64) -> Result<Self> {
        if ring_size == 0 {
            return Err(Error::Config("frame ring needs at least one slot".into()));
        }
        let slots = (0..ring_size)
            .map(|index| {
                let constant_buffer = device.create_buffer(
                    BufferDesc::new(
                        format!("Frame {} Constants", index),
                        constant_buffer_size.max(4),
                        wgpu::BufferUsages::UNIFORM | wgpu::BufferUsages::MAP_WRITE,
                    ),
                    ResourceState::GenericRead,
                )?;
                Ok(FrameSlot {
                    index,
                    fence_value: 0,
                    frame_number: 0,
                    constant_buffer,
                    command_list: None,
                })
            })
            .collect::<Result<Vec<_>>>()?;

        Ok(Self {
            slots,
            current: 0,
            total_frames: 0,
        })
    }

    pub fn ring_size(&self) -> usize {
        self.slots.len()
    }

    pub fn current_index(&self) -> usize {
        self.current
    }

    pub fn total_frames(&self) -> u64 {
        self.total_frames
    }

    pub fn current(&self) -> &FrameSlot {
        &self.slots[self.current]
    }

    pub fn slot(&self, index: usize) -> Option<&FrameSlot> {
        self.slots.get(index)
    }

    pub fn slots(&self) -> &[FrameSlot] {
        &self.slots
    }

    /// Advances to the next slot, blocking only while the GPU still owns it
    pub fn begin_frame(&mut self, queue: &Queue) -> Result<()> {
        self.total_frames += 1;
        self.current = (self.total_frames % self.slots.len() as u64) as usize;
        let slot = &mut self.slots[self.current];
        slot.frame_number = self.total_frames;
        if !queue.is_complete(slot.fence_value) {
            log::trace!(
                "Frame {} waiting on slot {} marker {}",
                self.total_frames,
                slot.index,
                slot.fence_value
            );
            queue.wait_for_fence_blocking(slot.fence_value)?;
        }
        Ok(())
    }

    /// Opens the current slot's command list
    pub fn begin_recording(&mut self, queue: QueueKind) -> Result<&mut CommandList> {
        let frame = self.total_frames;
        let slot = &mut self.slots[self.current];
        if slot.command_list.is_some() {
            return Err(Error::Recording(format!("frame {} is already recording", frame)));
        }
        Ok(slot.command_list.insert(CommandList::new(format!("Frame {}", frame), queue)))
    }

    pub fn command_list(&mut self) -> Result<&mut CommandList> {
        let frame = self.total_frames;
        self.slots[self.current]
            .command_list
            .as_mut()
            .ok_or_else(|| Error::Recording(format!("frame {} is not recording", frame)))
    }

    /// Submits the current slot's commands and stores the resulting marker
    pub fn end_frame(&mut self, queue: &Queue) -> Result<u64> {
        let frame = self.total_frames;
        let slot = &mut self.slots[self.current];
        let mut list = slot
            .command_list
            .take()
            .ok_or_else(|| Error::Recording(format!("frame {} ended without recording", frame)))?;
        list.close();
        let marker = queue.submit(list)?;
        slot.fence_value = marker;
        log::trace!("Frame {} submitted on slot {}, marker {}", frame, slot.index, marker);
        Ok(marker)
    }

    /// Drops the current slot's open list without submitting it
    ///
    /// Nothing recorded has executed, so resource states are exactly what
    /// they were before recording began. Returns the discarded list, if any.
    pub fn abort_recording(&mut self) -> Option<CommandList> {
        let frame = self.total_frames;
        let list = self.slots[self.current].command_list.take();
        if list.is_some() {
            log::warn!("Frame {} recording aborted", frame);
        }
        list
    }

    /// Markers of every slot, for waits at shutdown or resize
    pub fn outstanding_markers(&self) -> impl Iterator<Item = u64> + '_ {
        self.slots.iter().map(|s| s.fence_value)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn slot_is_reused_only_after_its_marker_completes() {
        let device = Device::new();
        let queue = device.create_queue(QueueKind::Direct);
        let mut ring = FrameRing::new(&device, 2, 64).unwrap();

        ring.begin_recording(QueueKind::Direct).unwrap().marker("frame 0");
        let first = ring.end_frame(&queue).unwrap();
        ring.begin_frame(&queue).unwrap();
        ring.begin_recording(QueueKind::Direct).unwrap().marker("frame 1");
        let second = ring.end_frame(&queue).unwrap();

        // Neither frame has been forced to execute yet
        assert_eq!(queue.completed_value(), 0);

        ring.begin_frame(&queue).unwrap();
        assert_eq!(ring.current_index(), 0);
        assert!(queue.is_complete(first));
        assert!(!queue.is_complete(second));
    }

    #[test]
    fn double_begin_recording_is_an_error() {
        let device = Device::new();
        let mut ring = FrameRing::new(&device, 2, 64).unwrap();
        ring.begin_recording(QueueKind::Direct).unwrap();
        assert!(ring.begin_recording(QueueKind::Direct).is_err());
        assert!(FrameRing::new(&device, 0, 64).is_err());
    }

    #[test]
    fn aborted_recording_can_be_reopened() {
        let device = Device::new();
        let queue = device.create_queue(QueueKind::Direct);
        let mut ring = FrameRing::new(&device, 2, 64).unwrap();

        ring.begin_recording(QueueKind::Direct).unwrap().marker("abandoned");
        let dropped = ring.abort_recording().unwrap();
        assert_eq!(dropped.label(), "Frame 0");
        assert!(!ring.current().is_recording());
        assert!(ring.abort_recording().is_none());
        assert!(ring.end_frame(&queue).is_err());

        ring.begin_recording(QueueKind::Direct).unwrap().marker("retry");
        let marker = ring.end_frame(&queue).unwrap();
        assert_eq!(marker, 1);
    }
}
