//! Buffer-pool bookkeeping and lifecycle.

use std::ptr::NonNull;

use crossbeam::utils::Backoff;
use log::{error, trace, warn};

use crate::errors::{Error, Result};
use crate::hw::BufferPoolService;
use crate::hw::MemoryService;
use crate::mbuf::PacketBuf;
use crate::mem::{AddrSpace, PhysAddr};

/// A small-integer pool identifier as carried on the wire.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug)]
pub struct PoolId(pub u8);

/// Wire pool id meaning "hardware must not auto-release this buffer".
/// Written whenever a descriptor references a buffer with more than one
/// owner.
pub const BPID_NO_RELEASE: u8 = 0xff;

pub const MAX_POOLS: usize = 64;

/// Driver-side record for one registered pool.
#[derive(Clone, Copy, Debug)]
pub struct PoolInfo {
    pub id: PoolId,
    /// Usable buffer bytes past the reserved metadata region.
    pub buf_size: u32,
    /// Bytes reserved in front of every buffer for descriptor bookkeeping.
    pub meta_size: u32,
    /// Whether the hardware recognizes this pool (zero-copy eligible).
    pub hw_backed: bool,
}

/// Registry mapping wire pool ids to [`PoolInfo`].
pub struct PoolTable {
    slots: [Option<PoolInfo>; MAX_POOLS],
}

impl PoolTable {
    pub fn new() -> Self {
        Self {
            slots: [None; MAX_POOLS],
        }
    }

    pub fn register(&mut self, info: PoolInfo) {
        let idx = info.id.0 as usize;
        assert!(idx < MAX_POOLS, "pool id {idx} out of range");
        self.slots[idx] = Some(info);
    }

    #[inline]
    pub fn get(&self, id: PoolId) -> Option<&PoolInfo> {
        self.slots.get(id.0 as usize)?.as_ref()
    }
}

impl Default for PoolTable {
    fn default() -> Self {
        Self::new()
    }
}

/// Bound on the release busy-retry spin.
///
/// The hardware may transiently refuse a release; the retry is a busy spin
/// with backoff, never a scheduler yield. On exhaustion the caller gets
/// [`Error::ReleaseTimeout`] and decides whether to leak the buffer.
#[derive(Clone, Copy, Debug)]
pub struct ReleasePolicy {
    pub max_spins: u32,
}

impl Default for ReleasePolicy {
    fn default() -> Self {
        Self { max_spins: 65_536 }
    }
}

/// Acquires one buffer and (re)initializes the packet metadata that precedes
/// it. Non-blocking: pool exhaustion reports `None` immediately.
pub(crate) fn acquire_buf<H>(hw: &H, info: &PoolInfo) -> Option<NonNull<PacketBuf>>
where
    H: BufferPoolService + MemoryService,
{
    let phys = hw.acquire(info.id)?;
    trace!("got buffer {phys:?} from pool {:?}", info.id);
    let vaddr = match AddrSpace::new(hw).to_process_pointer(phys) {
        Ok(p) => p,
        Err(e) => {
            // The pool handed us something the memory map does not know.
            // Push it straight back rather than leak it.
            warn!("acquired buffer not mapped: {e}");
            let _ = hw.release(info.id, phys);
            return None;
        }
    };
    // SAFETY: the pool guarantees `meta_size` reserved bytes in front of the
    // buffer address it hands out, and the buffer is exclusively ours until
    // released.
    unsafe {
        let pkt = PacketBuf::from_buffer_ptr(vaddr, info.meta_size);
        PacketBuf::reset(pkt, vaddr, phys, info);
        Some(pkt)
    }
}

/// Returns one buffer to its pool, spinning through transient busy signals.
pub(crate) fn release_buf<H>(
    hw: &H,
    pool: PoolId,
    addr: PhysAddr,
    policy: ReleasePolicy,
) -> Result<()>
where
    H: BufferPoolService,
{
    trace!("free {addr:?} to pool {pool:?}");
    let backoff = Backoff::new();
    for _ in 0..policy.max_spins {
        match hw.release(pool, addr) {
            Ok(()) => return Ok(()),
            Err(_busy) => backoff.spin(),
        }
    }
    error!("pool {pool:?} busy for {} spins, giving up", policy.max_spins);
    Err(Error::ReleaseTimeout(pool))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sim::{SimNic, SimPoolSpec};

    #[test]
    fn acquire_on_empty_pool_returns_none_immediately() {
        let nic = SimNic::new(
            &[SimPoolSpec {
                id: PoolId(1),
                buf_size: 1024,
                count: 2,
            }],
            1,
            8,
        );
        let info = *nic.pool_info(PoolId(1));
        let a = acquire_buf(&nic, &info).unwrap();
        let b = acquire_buf(&nic, &info).unwrap();
        // Pool drained: must not loop or block.
        assert!(acquire_buf(&nic, &info).is_none());
        unsafe {
            release_buf(&nic, info.id, (*a.as_ptr()).buf_phys(), ReleasePolicy::default())
                .unwrap();
            release_buf(&nic, info.id, (*b.as_ptr()).buf_phys(), ReleasePolicy::default())
                .unwrap();
        }
        assert!(acquire_buf(&nic, &info).is_some());
    }

    #[test]
    fn release_retries_through_transient_busy() {
        let nic = SimNic::new(
            &[SimPoolSpec {
                id: PoolId(1),
                buf_size: 1024,
                count: 1,
            }],
            1,
            8,
        );
        let info = *nic.pool_info(PoolId(1));
        let pkt = acquire_buf(&nic, &info).unwrap();
        let phys = unsafe { (*pkt.as_ptr()).buf_phys() };
        nic.inject_release_busy(PoolId(1), 3);
        release_buf(&nic, info.id, phys, ReleasePolicy::default()).unwrap();
        assert!(acquire_buf(&nic, &info).is_some());
    }

    #[test]
    fn release_gives_up_after_bounded_spins() {
        let nic = SimNic::new(
            &[SimPoolSpec {
                id: PoolId(1),
                buf_size: 1024,
                count: 1,
            }],
            1,
            8,
        );
        let info = *nic.pool_info(PoolId(1));
        let pkt = acquire_buf(&nic, &info).unwrap();
        let phys = unsafe { (*pkt.as_ptr()).buf_phys() };
        nic.inject_release_busy(PoolId(1), u32::MAX);
        let res = release_buf(&nic, info.id, phys, ReleasePolicy { max_spins: 16 });
        assert!(matches!(res, Err(Error::ReleaseTimeout(_))));
    }
}
