//! Per-frame streaming memory.
//!
//! Each in-flight frame leases const-buffer and vertex memory from two
//! arenas. An arena hands out opaque [`BufferHandle`]s instead of raw
//! offsets: the handle is the weak reference root arguments are allowed to
//! keep, while the arena (and the driver buffer behind it) stays the owner.
//! When the frame's fence completes, the whole lease is released in bulk.

use strafe_utils::{Pool, PoolHandle};

/// Weak reference to a region inside a driver-owned buffer. Ask the arena for
/// the offset when binding; never cache the offset itself.
pub type BufferHandle = PoolHandle;

pub const CONST_BUFFER_ARENA_SIZE: u32 = 8 * 1024 * 1024;
pub const STREAMING_VERTEX_ARENA_SIZE: u32 = 2 * 1024 * 1024;

#[derive(Debug, Clone, Copy)]
struct Allocation {
    offset: u32,
    size: u32,
}

/// Offset allocator over a fixed-capacity buffer, with handle indirection.
#[derive(Debug, Default)]
pub struct BufferArena {
    capacity: u32,
    /// Live allocations, sorted by offset.
    allocations: Vec<Allocation>,
    handles: Pool<u32>,
}

impl BufferArena {
    pub fn new(capacity: u32) -> Self {
        Self {
            capacity,
            allocations: Vec::new(),
            handles: Pool::new(),
        }
    }

    /// Allocates `size` bytes and returns a handle to the region.
    ///
    /// ## Panics
    /// Panics when no gap of `size` bytes exists; frame arenas are sized so
    /// that running out is a configuration bug, not a recoverable state.
    pub fn allocate(&mut self, size: u32) -> BufferHandle {
        assert!(size > 0, "zero-sized arena allocation");

        let offset = self
            .find_gap(size)
            .expect("frame arena exhausted, raise the arena size");

        let insert_at = self
            .allocations
            .partition_point(|alloc| alloc.offset < offset);
        self.allocations.insert(insert_at, Allocation { offset, size });

        self.handles.allocate(offset)
    }

    fn find_gap(&self, size: u32) -> Option<u32> {
        let mut cursor = 0;
        for alloc in &self.allocations {
            if alloc.offset - cursor >= size {
                return Some(cursor);
            }
            cursor = alloc.offset + alloc.size;
        }
        (self.capacity - cursor >= size).then_some(cursor)
    }

    /// Current byte offset of a leased region.
    ///
    /// ## Panics
    /// Panics if the handle is stale.
    pub fn offset(&self, handle: BufferHandle) -> u32 {
        *self.handles.get(handle)
    }

    /// Whether a handle still refers to a live lease. Handles from before the
    /// last [`BufferArena::reset`] are stale.
    pub fn is_valid(&self, handle: BufferHandle) -> bool {
        self.handles.is_valid(handle)
    }

    /// Releases one region early. Regions not released individually go away
    /// on [`BufferArena::reset`].
    pub fn release(&mut self, handle: BufferHandle) {
        let offset = *self.handles.get(handle);
        self.handles.deallocate(handle);

        let index = self
            .allocations
            .iter()
            .position(|alloc| alloc.offset == offset)
            .expect("arena allocation list out of sync");
        self.allocations.remove(index);
    }

    /// Bulk release at frame retirement. Every outstanding handle goes stale.
    pub fn reset(&mut self) {
        self.allocations.clear();
        self.handles.clear();
    }

    pub fn allocated_bytes(&self) -> u32 {
        self.allocations.iter().map(|alloc| alloc.size).sum()
    }
}

/// Per-frame state: the streaming arenas plus the fence the frame retires on.
#[derive(Debug)]
pub struct Frame {
    pub const_buffers: BufferArena,
    pub streaming_vertices: BufferArena,
    /// Fence value covering the frame's last submission, if submitted.
    pub fence_value: Option<u64>,
}

impl Frame {
    pub fn new() -> Self {
        Self {
            const_buffers: BufferArena::new(CONST_BUFFER_ARENA_SIZE),
            streaming_vertices: BufferArena::new(STREAMING_VERTEX_ARENA_SIZE),
            fence_value: None,
        }
    }

    /// Called when the frame's fence has passed: all leases are released and
    /// the frame can be reused.
    pub fn retire(&mut self) {
        self.const_buffers.reset();
        self.streaming_vertices.reset();
        self.fence_value = None;
    }
}

impl Default for Frame {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn allocations_do_not_overlap() {
        let mut arena = BufferArena::new(256);
        let a = arena.allocate(64);
        let b = arena.allocate(64);
        let c = arena.allocate(64);

        let offsets = [arena.offset(a), arena.offset(b), arena.offset(c)];
        assert_eq!(offsets, [0, 64, 128]);
    }

    #[test]
    fn released_gaps_are_reused() {
        let mut arena = BufferArena::new(192);
        let _a = arena.allocate(64);
        let b = arena.allocate(64);
        let _c = arena.allocate(64);

        arena.release(b);
        let d = arena.allocate(32);
        assert_eq!(arena.offset(d), 64);

        // Still fits behind d inside the old gap
        let e = arena.allocate(32);
        assert_eq!(arena.offset(e), 96);
    }

    #[test]
    fn reset_invalidates_handles() {
        let mut arena = BufferArena::new(128);
        let a = arena.allocate(64);
        arena.reset();

        assert_eq!(arena.allocated_bytes(), 0);
        assert!(std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| arena.offset(a))).is_err());

        let b = arena.allocate(64);
        assert_eq!(arena.offset(b), 0);
    }

    #[test]
    #[should_panic(expected = "frame arena exhausted")]
    fn exhaustion_panics() {
        let mut arena = BufferArena::new(64);
        let _ = arena.allocate(64);
        let _ = arena.allocate(1);
    }

    #[test]
    fn frame_retire_releases_everything() {
        let mut frame = Frame::new();
        let _cb = frame.const_buffers.allocate(256);
        let _vb = frame.streaming_vertices.allocate(1024);
        frame.fence_value = Some(7);

        frame.retire();
        assert_eq!(frame.const_buffers.allocated_bytes(), 0);
        assert_eq!(frame.streaming_vertices.allocated_bytes(), 0);
        assert_eq!(frame.fence_value, None);
    }
}
