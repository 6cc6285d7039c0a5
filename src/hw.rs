//! Boundary traits for the hardware queue/pool subsystem.
//!
//! The queue manager, the buffer-pool manager and the physical memory map are
//! opaque services as far as the datapath is concerned. Each backend (real
//! hardware bindings, or the software model in [`crate::sim`]) implements
//! these three traits.

use std::ptr::NonNull;

use crate::errors::Result;
use crate::frame::FrameDesc;
use crate::mem::PhysAddr;
use crate::pool::PoolId;

/// A frame queue identifier, scoped to one interface.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug)]
pub struct QueueId(pub u16);

/// One dequeued ring entry. The descriptor must be consumed (acknowledged)
/// after translation so the hardware can reuse the ring slot.
#[derive(Clone, Copy, Debug)]
pub struct RingEntry {
    pub fd: FrameDesc,
    pub slot: u32,
}

/// Transient "try again" signal from the pool manager on release.
#[derive(Clone, Copy, Debug)]
pub struct PoolBusy;

/// Hardware frame-queue operations.
///
/// A portal is the per-core access context for a set of queues. It is not
/// safely shareable: every execution context must call `affine_portal` once
/// before touching any queue, and must not hand its queues to another
/// context. The call is idempotent per context.
pub trait FrameQueueService {
    fn affine_portal(&self) -> Result<()>;

    /// Arms a bounded, self-terminating dequeue of up to `frames` entries.
    fn set_volatile_dequeue(&self, queue: QueueId, frames: u16) -> Result<()>;

    /// Pulls one ring entry if one is available right now.
    fn dequeue(&self, queue: QueueId) -> Option<RingEntry>;

    /// Acknowledges a ring entry, returning the slot to the hardware.
    fn consume(&self, queue: QueueId, entry: RingEntry);

    /// Whether the volatile dequeue command armed on `queue` is still active.
    fn vdq_active(&self, queue: QueueId) -> bool;

    /// Offers descriptors to the queue; returns how many were accepted,
    /// which may be fewer than offered (including zero).
    fn enqueue(&self, queue: QueueId, fds: &[FrameDesc]) -> usize;
}

/// Hardware buffer-pool operations. Shared by all contexts on the interface;
/// atomicity is the service's responsibility.
pub trait BufferPoolService {
    /// Non-blocking. `None` means the pool is currently empty.
    fn acquire(&self, pool: PoolId) -> Option<PhysAddr>;

    /// May transiently refuse with [`PoolBusy`]; the caller owns retry policy.
    fn release(&self, pool: PoolId, addr: PhysAddr) -> std::result::Result<(), PoolBusy>;
}

/// Physical→process address mapping.
pub trait MemoryService {
    fn physical_to_process(&self, addr: PhysAddr) -> Option<NonNull<u8>>;
}

/// Everything the datapath needs from one backend.
pub trait HwServices: FrameQueueService + BufferPoolService + MemoryService {}

impl<T: FrameQueueService + BufferPoolService + MemoryService> HwServices for T {}
