//! Command queues and completion markers

use crate::command::CommandList;
use crate::device::{Device, Submission};
use crate::{Error, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum QueueKind {
    /// Graphics + compute, drives per-frame rendering
    Direct,
    /// Asynchronous compute for batch work
    Compute,
}

/// A command queue with a monotonic completion counter
///
/// Markers start at zero (always complete) and increase by one per
/// signalling submission.
#[derive(Clone)]
pub struct Queue {
    device: Device,
    index: usize,
    kind: QueueKind,
}

impl Queue {
    pub(crate) fn new(device: Device, index: usize, kind: QueueKind) -> Self {
        Self { device, index, kind }
    }

    pub fn kind(&self) -> QueueKind {
        self.kind
    }

    /// Submits a closed command list; returns the marker it will signal
    pub fn submit(&self, list: CommandList) -> Result<u64> {
        if !list.is_closed() {
            return Err(Error::Recording(format!("command list '{}' submitted while open", list.label())));
        }
        if list.queue() != self.kind {
            return Err(Error::Recording(format!(
                "{:?} command list '{}' submitted to the {:?} queue",
                list.queue(),
                list.label(),
                self.kind
            )));
        }
        let mut state = self.device.shared.lock();
        state.ensure_alive()?;
        let queue = &mut state.queues[self.index];
        queue.signalled += 1;
        let signal = queue.signalled;
        log::trace!("{:?} queue: '{}' submitted, marker {}", self.kind, list.label(), signal);
        queue.pending.push_back(Submission::Execute { list, signal });
        Ok(signal)
    }

    /// Appends a bare signal; returns its marker
    pub fn signal(&self) -> Result<u64> {
        let mut state = self.device.shared.lock();
        state.ensure_alive()?;
        let queue = &mut state.queues[self.index];
        queue.signalled += 1;
        let signal = queue.signalled;
        queue.pending.push_back(Submission::Signal(signal));
        Ok(signal)
    }

    pub fn completed_value(&self) -> u64 {
        self.device.shared.lock().queues[self.index].completed
    }

    pub fn last_signalled_value(&self) -> u64 {
        self.device.shared.lock().queues[self.index].signalled
    }

    pub fn is_complete(&self, marker: u64) -> bool {
        self.completed_value() >= marker
    }

    /// Submissions not yet executed, waits included
    pub fn pending_submissions(&self) -> usize {
        self.device.shared.lock().queues[self.index].pending.len()
    }

    /// Blocks the CPU until the queue has reached `marker`
    pub fn wait_for_fence_blocking(&self, marker: u64) -> Result<()> {
        self.device.shared.lock().run_until(self.index, marker)
    }

    /// Blocks until everything submitted so far has completed
    pub fn wait_for_idle(&self) -> Result<()> {
        let marker = self.signal()?;
        self.wait_for_fence_blocking(marker)
    }

    /// Later submissions on this queue wait for `other`'s latest marker
    pub fn insert_wait_for_queue(&self, other: &Queue) -> Result<u64> {
        let marker = other.last_signalled_value();
        self.insert_wait_for_value(other, marker)?;
        Ok(marker)
    }

    /// Later submissions on this queue wait for `other` to reach `marker`
    pub fn insert_wait_for_value(&self, other: &Queue, marker: u64) -> Result<()> {
        if other.index == self.index {
            return Err(Error::Config(format!("{:?} queue cannot wait on itself", self.kind)));
        }
        let mut state = self.device.shared.lock();
        state.ensure_alive()?;
        log::trace!("{:?} queue waits for {:?} marker {}", self.kind, other.kind, marker);
        state.queues[self.index].pending.push_back(Submission::Wait {
            queue: other.index,
            value: marker,
        });
        Ok(())
    }

    pub fn device(&self) -> &Device {
        &self.device
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn closed(label: &str, kind: QueueKind) -> CommandList {
        let mut list = CommandList::new(label, kind);
        list.marker(label);
        list.close();
        list
    }

    #[test]
    fn markers_increase_monotonically() {
        let device = Device::new();
        let queue = device.create_queue(QueueKind::Direct);
        assert!(queue.is_complete(0));
        let a = queue.submit(closed("a", QueueKind::Direct)).unwrap();
        let b = queue.submit(closed("b", QueueKind::Direct)).unwrap();
        assert!(b > a);
        queue.wait_for_fence_blocking(a).unwrap();
        assert_eq!(queue.completed_value(), a);
        assert!(!queue.is_complete(b));
    }

    #[test]
    fn open_or_foreign_lists_are_rejected() {
        let device = Device::new();
        let queue = device.create_queue(QueueKind::Direct);
        assert!(queue.submit(CommandList::new("open", QueueKind::Direct)).is_err());
        assert!(queue.submit(closed("compute", QueueKind::Compute)).is_err());
    }

    #[test]
    fn cross_queue_wait_holds_back_later_work() {
        let device = Device::new();
        let direct = device.create_queue(QueueKind::Direct);
        let compute = device.create_queue(QueueKind::Compute);

        compute.submit(closed("batch", QueueKind::Compute)).unwrap();
        direct.insert_wait_for_queue(&compute).unwrap();
        let frame = direct.submit(closed("frame", QueueKind::Direct)).unwrap();
        direct.wait_for_fence_blocking(frame).unwrap();

        let order: Vec<_> = device.timeline().into_iter().map(|r| r.label).collect();
        assert_eq!(order, vec!["batch", "frame"]);
    }

    #[test]
    fn self_wait_is_rejected() {
        let device = Device::new();
        let direct = device.create_queue(QueueKind::Direct);
        assert!(direct.insert_wait_for_queue(&direct).is_err());
    }
}
