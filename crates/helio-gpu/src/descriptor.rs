//! View pools and deferred view reclamation
//!
//! Four fixed-capacity pools hand out contiguous view ranges. Freeing a range
//! only queues it: the slots stay intact (the GPU may still read them) until
//! [`ViewPool::process_frame`] observes a frame at least `ring_size` frames
//! after the one the range was freed in.

use std::collections::HashMap;

use crate::resource::ResourceId;
use crate::{Error, Result};

/// The four view pools
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ViewPoolKind {
    RenderTarget,
    DepthStencil,
    /// Shader-readable and unordered-access views
    ShaderResource,
    Sampler,
}

impl ViewPoolKind {
    pub const ALL: [ViewPoolKind; 4] = [
        ViewPoolKind::RenderTarget,
        ViewPoolKind::DepthStencil,
        ViewPoolKind::ShaderResource,
        ViewPoolKind::Sampler,
    ];

    fn slot(self) -> usize {
        match self {
            ViewPoolKind::RenderTarget => 0,
            ViewPoolKind::DepthStencil => 1,
            ViewPoolKind::ShaderResource => 2,
            ViewPoolKind::Sampler => 3,
        }
    }
}

/// A contiguous run of slots in one pool
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ViewRange {
    pool: ViewPoolKind,
    start: u32,
    count: u32,
}

impl ViewRange {
    pub fn pool(&self) -> ViewPoolKind {
        self.pool
    }

    pub fn start(&self) -> u32 {
        self.start
    }

    pub fn count(&self) -> u32 {
        self.count
    }

    /// Handle of the `offset`-th slot in the range
    pub fn handle(&self, offset: u32) -> ViewHandle {
        debug_assert!(offset < self.count, "view offset {} out of range {}", offset, self.count);
        ViewHandle {
            pool: self.pool,
            index: self.start + offset,
        }
    }

    pub fn overlaps(&self, other: &ViewRange) -> bool {
        self.pool == other.pool && self.start < other.start + other.count && other.start < self.start + self.count
    }
}

/// A single view slot
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ViewHandle {
    pub pool: ViewPoolKind,
    pub index: u32,
}

/// Sampler state
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SamplerDesc {
    pub filter: wgpu::FilterMode,
    pub address_mode: wgpu::AddressMode,
    pub compare: Option<wgpu::CompareFunction>,
}

impl Default for SamplerDesc {
    fn default() -> Self {
        Self {
            filter: wgpu::FilterMode::Linear,
            address_mode: wgpu::AddressMode::ClampToEdge,
            compare: None,
        }
    }
}

/// What a view slot points at
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum ViewDesc {
    ShaderResource(ResourceId),
    UnorderedAccess(ResourceId),
    RenderTarget(ResourceId),
    DepthStencil(ResourceId),
    Sampler(SamplerDesc),
}

impl ViewDesc {
    pub fn resource(&self) -> Option<ResourceId> {
        match *self {
            ViewDesc::ShaderResource(id)
            | ViewDesc::UnorderedAccess(id)
            | ViewDesc::RenderTarget(id)
            | ViewDesc::DepthStencil(id) => Some(id),
            ViewDesc::Sampler(_) => None,
        }
    }

    fn pool(&self) -> ViewPoolKind {
        match self {
            ViewDesc::ShaderResource(_) | ViewDesc::UnorderedAccess(_) => ViewPoolKind::ShaderResource,
            ViewDesc::RenderTarget(_) => ViewPoolKind::RenderTarget,
            ViewDesc::DepthStencil(_) => ViewPoolKind::DepthStencil,
            ViewDesc::Sampler(_) => ViewPoolKind::Sampler,
        }
    }
}

#[derive(Debug, Clone, Copy)]
struct PendingFree {
    range: ViewRange,
    freed_at: u64,
}

/// Bump allocator over a free list with a ring of pending-free lists
pub struct ViewPool {
    kind: ViewPoolKind,
    capacity: u32,
    ring_size: u64,
    top: u32,
    /// Reclaimed `(start, count)` runs, sorted and coalesced
    free_list: Vec<(u32, u32)>,
    /// Indexed by `frame % ring_size`
    pending: Vec<Vec<PendingFree>>,
    slots: Vec<Option<ViewDesc>>,
    /// Live ranges by start slot; a range leaves this map when freed
    live: HashMap<u32, u32>,
    in_use: u32,
    pending_count: u32,
}

impl ViewPool {
    pub fn new(kind: ViewPoolKind, capacity: u32, ring_size: usize) -> Self {
        let ring_size = ring_size.max(1);
        Self {
            kind,
            capacity,
            ring_size: ring_size as u64,
            top: 0,
            free_list: Vec::new(),
            pending: vec![Vec::new(); ring_size],
            slots: vec![None; capacity as usize],
            live: HashMap::new(),
            in_use: 0,
            pending_count: 0,
        }
    }

    pub fn kind(&self) -> ViewPoolKind {
        self.kind
    }

    pub fn capacity(&self) -> u32 {
        self.capacity
    }

    /// Slots held by live ranges, excluding ranges awaiting reclaim
    pub fn in_use(&self) -> u32 {
        self.in_use
    }

    /// Slots freed but not yet reclaimed
    pub fn pending(&self) -> u32 {
        self.pending_count
    }

    /// Slots that can be handed out right now
    pub fn available(&self) -> u32 {
        self.capacity - self.in_use - self.pending_count
    }

    pub fn allocate(&mut self, count: u32) -> Result<ViewRange> {
        if count == 0 {
            return Err(Error::Config(format!("zero-sized {:?} view range", self.kind)));
        }

        let start = if let Some(i) = self.free_list.iter().position(|&(_, len)| len >= count) {
            let (start, len) = self.free_list[i];
            if len == count {
                self.free_list.remove(i);
            } else {
                self.free_list[i] = (start + count, len - count);
            }
            start
        } else if self.top + count <= self.capacity {
            let start = self.top;
            self.top += count;
            start
        } else {
            return Err(Error::Exhausted {
                pool: self.kind,
                requested: count,
                available: self.available(),
            });
        };

        self.live.insert(start, count);
        self.in_use += count;
        log::trace!("{:?} views [{}..{}) allocated", self.kind, start, start + count);
        Ok(ViewRange {
            pool: self.kind,
            start,
            count,
        })
    }

    /// Queues `range` for reclaim once `frame + ring_size` has been processed
    pub fn free(&mut self, range: ViewRange, frame: u64) -> Result<()> {
        if range.pool != self.kind || range.start + range.count > self.capacity {
            return Err(Error::Config(format!(
                "range {:?} does not belong to the {:?} pool",
                range, self.kind
            )));
        }
        if self.live.get(&range.start) != Some(&range.count) {
            return Err(Error::Config(format!(
                "range {:?} is not live in the {:?} pool (already freed or never allocated)",
                range, self.kind
            )));
        }
        self.live.remove(&range.start);
        let slot = (frame % self.ring_size) as usize;
        self.pending[slot].push(PendingFree { range, freed_at: frame });
        self.in_use -= range.count;
        self.pending_count += range.count;
        Ok(())
    }

    /// Reclaims ranges freed at a frame `<= frame - ring_size`; returns slot count reclaimed
    pub fn process_frame(&mut self, frame: u64) -> u32 {
        let ring_size = self.ring_size;
        let slot = (frame % ring_size) as usize;
        let (ready, waiting): (Vec<_>, Vec<_>) = std::mem::take(&mut self.pending[slot])
            .into_iter()
            .partition(|p| p.freed_at + ring_size <= frame);
        self.pending[slot] = waiting;

        let reclaimed = ready.iter().map(|p| self.reclaim(p.range)).sum();
        if reclaimed > 0 {
            log::debug!("{:?} pool reclaimed {} views at frame {}", self.kind, reclaimed, frame);
        }
        reclaimed
    }

    /// Reclaims everything pending; only valid once the GPU is idle
    pub fn process_all(&mut self) -> u32 {
        let pending: Vec<_> = self.pending.iter_mut().flat_map(std::mem::take).collect();
        pending.iter().map(|p| self.reclaim(p.range)).sum()
    }

    fn reclaim(&mut self, range: ViewRange) -> u32 {
        for slot in &mut self.slots[range.start as usize..(range.start + range.count) as usize] {
            *slot = None;
        }
        self.pending_count -= range.count;

        let at = self.free_list.partition_point(|&(start, _)| start < range.start);
        self.free_list.insert(at, (range.start, range.count));
        // merge with neighbours
        if at + 1 < self.free_list.len() {
            let (start, len) = self.free_list[at];
            let (next_start, next_len) = self.free_list[at + 1];
            if start + len == next_start {
                self.free_list[at] = (start, len + next_len);
                self.free_list.remove(at + 1);
            }
        }
        if at > 0 {
            let (prev_start, prev_len) = self.free_list[at - 1];
            let (start, len) = self.free_list[at];
            if prev_start + prev_len == start {
                self.free_list[at - 1] = (prev_start, prev_len + len);
                self.free_list.remove(at);
            }
        }
        // hand the tail back to the bump pointer
        if let Some(&(start, len)) = self.free_list.last() {
            if start + len == self.top {
                self.top = start;
                self.free_list.pop();
            }
        }
        range.count
    }

    pub fn write_view(&mut self, handle: ViewHandle, desc: ViewDesc) -> Result<()> {
        if handle.pool != self.kind || desc.pool() != self.kind {
            return Err(Error::Config(format!("{:?} written into the {:?} pool", desc, self.kind)));
        }
        let slot = self
            .slots
            .get_mut(handle.index as usize)
            .ok_or_else(|| Error::Config(format!("view index {} beyond {:?} pool", handle.index, self.kind)))?;
        *slot = Some(desc);
        Ok(())
    }

    pub fn view(&self, handle: ViewHandle) -> Option<ViewDesc> {
        self.slots.get(handle.index as usize).copied().flatten()
    }
}

/// The four view pools plus the frame they were last processed at
pub struct ViewAllocator {
    pools: [ViewPool; 4],
    current_frame: u64,
}

impl ViewAllocator {
    pub fn new(capacities: [u32; 4], ring_size: usize) -> Self {
        let pools = ViewPoolKind::ALL.map(|kind| ViewPool::new(kind, capacities[kind.slot()], ring_size));
        Self {
            pools,
            current_frame: 0,
        }
    }

    pub fn pool(&self, kind: ViewPoolKind) -> &ViewPool {
        &self.pools[kind.slot()]
    }

    pub fn pool_mut(&mut self, kind: ViewPoolKind) -> &mut ViewPool {
        &mut self.pools[kind.slot()]
    }

    pub fn current_frame(&self) -> u64 {
        self.current_frame
    }

    pub fn allocate(&mut self, kind: ViewPoolKind, count: u32) -> Result<ViewRange> {
        self.pool_mut(kind).allocate(count)
    }

    /// Allocation for optional work: exhaustion is logged and skipped
    pub fn allocate_optional(&mut self, kind: ViewPoolKind, count: u32, feature: &str) -> Option<ViewRange> {
        match self.allocate(kind, count) {
            Ok(range) => Some(range),
            Err(err) => {
                log::warn!("Skipping '{}' this frame: {}", feature, err);
                None
            }
        }
    }

    /// Frees `range` at the current frame
    pub fn free(&mut self, range: ViewRange) -> Result<()> {
        let frame = self.current_frame;
        self.pool_mut(range.pool()).free(range, frame)
    }

    pub fn process_frame(&mut self, frame: u64) -> u32 {
        self.current_frame = frame;
        self.pools.iter_mut().map(|pool| pool.process_frame(frame)).sum()
    }

    pub fn process_all(&mut self) -> u32 {
        self.pools.iter_mut().map(ViewPool::process_all).sum()
    }

    pub fn write_view(&mut self, handle: ViewHandle, desc: ViewDesc) -> Result<()> {
        self.pool_mut(handle.pool).write_view(handle, desc)
    }

    pub fn view(&self, handle: ViewHandle) -> Option<ViewDesc> {
        self.pool(handle.pool).view(handle)
    }

    /// Resource behind a view slot
    pub fn resolve(&self, handle: ViewHandle) -> Result<ResourceId> {
        self.view(handle)
            .and_then(|desc| desc.resource())
            .ok_or_else(|| Error::Recording(format!("view {:?} is empty", handle)))
    }

    /// Live slots per pool, in [`ViewPoolKind::ALL`] order
    pub fn occupancy(&self) -> [u32; 4] {
        [0, 1, 2, 3].map(|i| self.pools[i].in_use())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn freed_range_is_not_reused_within_the_ring() {
        let mut pool = ViewPool::new(ViewPoolKind::ShaderResource, 4, 2);
        let a = pool.allocate(4).unwrap();
        pool.free(a, 10).unwrap();

        assert!(matches!(pool.allocate(1), Err(Error::Exhausted { .. })));
        assert_eq!(pool.process_frame(11), 0);
        assert!(pool.allocate(1).is_err());
        assert_eq!(pool.process_frame(12), 4);
        assert_eq!(pool.allocate(4).unwrap().start(), 0);
    }

    #[test]
    fn freed_slots_stay_readable_until_reclaimed() {
        let mut pool = ViewPool::new(ViewPoolKind::Sampler, 2, 2);
        let range = pool.allocate(1).unwrap();
        pool.write_view(range.handle(0), ViewDesc::Sampler(SamplerDesc::default())).unwrap();
        pool.free(range, 0).unwrap();
        assert!(pool.view(range.handle(0)).is_some());
        pool.process_frame(2);
        assert!(pool.view(range.handle(0)).is_none());
    }

    #[test]
    fn reclaimed_ranges_coalesce() {
        let mut pool = ViewPool::new(ViewPoolKind::RenderTarget, 8, 2);
        let a = pool.allocate(2).unwrap();
        let b = pool.allocate(2).unwrap();
        let _c = pool.allocate(2).unwrap();
        pool.free(a, 0).unwrap();
        pool.free(b, 0).unwrap();
        pool.process_frame(2);

        let joined = pool.allocate(4).unwrap();
        assert_eq!((joined.start(), joined.count()), (0, 4));
    }

    #[test]
    fn foreign_range_is_rejected() {
        let mut views = ViewAllocator::new([4, 4, 4, 4], 2);
        let rtv = views.allocate(ViewPoolKind::RenderTarget, 1).unwrap();
        assert!(views.pool_mut(ViewPoolKind::DepthStencil).free(rtv, 0).is_err());
        assert!(views
            .write_view(rtv.handle(0), ViewDesc::Sampler(SamplerDesc::default()))
            .is_err());
    }

    #[test]
    fn double_free_is_rejected() {
        let mut pool = ViewPool::new(ViewPoolKind::ShaderResource, 4, 2);
        let a = pool.allocate(2).unwrap();
        let _b = pool.allocate(1).unwrap();
        pool.free(a, 0).unwrap();

        assert!(matches!(pool.free(a, 0), Err(Error::Config(_))));
        assert!(matches!(pool.free(a, 1), Err(Error::Config(_))));
        assert_eq!((pool.in_use(), pool.pending()), (1, 2));
        assert_eq!(pool.available(), 1);
    }

    #[test]
    fn range_that_was_never_allocated_is_rejected() {
        let mut pool = ViewPool::new(ViewPoolKind::ShaderResource, 8, 2);
        let a = pool.allocate(4).unwrap();
        let inner = ViewRange {
            pool: ViewPoolKind::ShaderResource,
            start: 1,
            count: 2,
        };
        let wider = ViewRange {
            pool: ViewPoolKind::ShaderResource,
            start: 0,
            count: 6,
        };
        assert!(pool.free(inner, 0).is_err());
        assert!(pool.free(wider, 0).is_err());
        assert_eq!(pool.in_use(), 4);

        pool.free(a, 0).unwrap();
        pool.process_frame(2);
        let again = pool.allocate(4).unwrap();
        assert_eq!(again.start(), 0);
        pool.free(again, 2).unwrap();
    }

    #[test]
    fn optional_allocation_skips_on_exhaustion() {
        let mut views = ViewAllocator::new([1, 1, 1, 1], 2);
        assert!(views.allocate_optional(ViewPoolKind::Sampler, 1, "shadow sampler").is_some());
        assert!(views.allocate_optional(ViewPoolKind::Sampler, 1, "esm sampler").is_none());
    }
}
