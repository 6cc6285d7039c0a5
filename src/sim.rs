//! Software model of the hardware queue/pool subsystem.
//!
//! Backs the service traits with an arena of pool buffers, frame-queue rings
//! with volatile-dequeue semantics and an emulated parser that fills RX
//! annotations the way the hardware would. Used by the tests and the demo
//! binary; a real backend would wrap the vendor's portal bindings instead.

use std::alloc::{Layout, alloc_zeroed, dealloc};
use std::collections::VecDeque;
use std::ptr::NonNull;
use std::slice;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};

use crossbeam::queue::ArrayQueue;
use log::{trace, warn};

use crate::errors::{Error, Result};
use crate::frame::{FdFormat, FrameDesc, MAX_SG_ENTRIES, SG_ENTRY_SIZE, SgEntry};
use crate::hw::{BufferPoolService, FrameQueueService, MemoryService, PoolBusy, QueueId, RingEntry};
use crate::mbuf::{BUF_META_SIZE, DEFAULT_HEADROOM};
use crate::mem::PhysAddr;
use crate::parse::{CW_VLAN, annot_mut, class_word_for, slow_classify, zero_annotation};
use crate::pool::{BPID_NO_RELEASE, MAX_POOLS, PoolId, PoolInfo};
use crate::unsafe_refcell::UnsafeRefCell;

/// Base of the modeled physical address range. Offsetting it keeps physical
/// and process addresses from ever looking interchangeable.
pub const SIM_PHYS_BASE: u64 = 0x4000_0000;

const SLOT_ALIGN: usize = 64;

#[derive(Clone, Copy, Debug)]
pub struct SimPoolSpec {
    pub id: PoolId,
    pub buf_size: u32,
    pub count: usize,
}

struct Arena {
    base: NonNull<u8>,
    layout: Layout,
}

impl Arena {
    fn new(len: usize) -> Arena {
        let layout = Layout::from_size_align(len.max(SLOT_ALIGN), SLOT_ALIGN).unwrap();
        // SAFETY: layout has non-zero size.
        let ptr = unsafe { alloc_zeroed(layout) };
        Arena {
            base: NonNull::new(ptr).expect("arena allocation failed"),
            layout,
        }
    }
}

impl Drop for Arena {
    fn drop(&mut self) {
        // SAFETY: allocated in new() with the same layout.
        unsafe { dealloc(self.base.as_ptr(), self.layout) };
    }
}

struct SimPool {
    info: PoolInfo,
    /// Physical range of this pool's buffers, for release validation.
    phys_lo: u64,
    phys_hi: u64,
    free: ArrayQueue<u64>,
    /// Remaining injected `PoolBusy` responses for release().
    busy_budget: AtomicU32,
}

impl SimPool {
    fn owns(&self, addr: u64) -> bool {
        (self.phys_lo..self.phys_hi).contains(&addr)
    }
}

struct VdqState {
    remaining: u16,
}

struct SimQueue {
    ring: UnsafeRefCell<VecDeque<FrameDesc>>,
    vdq: UnsafeRefCell<VdqState>,
    consumed: AtomicU64,
}

/// The modeled NIC. Share it across contexts with an `Arc`; ring state is
/// only sound under the single-owner portal discipline (one context per
/// queue), which is exactly the contract of the service traits.
pub struct SimNic {
    arena: Arena,
    arena_len: usize,
    pools: Vec<Option<SimPool>>,
    queues: Vec<SimQueue>,
    ring_capacity: usize,
    /// Max descriptors accepted per enqueue() call; lets tests exercise the
    /// partial-acceptance retry.
    enqueue_limit: AtomicU32,
    loopback: Vec<(QueueId, QueueId, PoolId)>,
    affined: AtomicU32,
    wire_drops: AtomicU64,
}

// SAFETY: pools and counters are internally synchronized; queue ring state
// is only touched by the single context affined to the portal that owns the
// queue. Loopback delivery runs on the transmitting context.
unsafe impl Send for SimNic {}
unsafe impl Sync for SimNic {}

impl SimNic {
    pub fn new(pools: &[SimPoolSpec], nqueues: usize, ring_capacity: usize) -> SimNic {
        let mut total = 0usize;
        for spec in pools {
            assert!((spec.id.0 as usize) < MAX_POOLS, "pool id out of range");
            total += spec.count * slot_size(spec.buf_size);
        }
        let arena = Arena::new(total);

        let mut slots: Vec<Option<SimPool>> = (0..MAX_POOLS).map(|_| None).collect();
        let mut off = 0usize;
        for spec in pools {
            let phys_lo = SIM_PHYS_BASE + off as u64;
            let free = ArrayQueue::new(spec.count.max(1));
            for _ in 0..spec.count {
                let phys = SIM_PHYS_BASE + (off + BUF_META_SIZE as usize) as u64;
                free.push(phys).unwrap();
                off += slot_size(spec.buf_size);
            }
            slots[spec.id.0 as usize] = Some(SimPool {
                info: PoolInfo {
                    id: spec.id,
                    buf_size: spec.buf_size,
                    meta_size: BUF_META_SIZE,
                    hw_backed: true,
                },
                phys_lo,
                phys_hi: SIM_PHYS_BASE + off as u64,
                free,
                busy_budget: AtomicU32::new(0),
            });
        }

        let queues = (0..nqueues)
            .map(|_| SimQueue {
                ring: UnsafeRefCell::new(VecDeque::new()),
                vdq: UnsafeRefCell::new(VdqState { remaining: 0 }),
                consumed: AtomicU64::new(0),
            })
            .collect();

        SimNic {
            arena,
            arena_len: total,
            pools: slots,
            queues,
            ring_capacity,
            enqueue_limit: AtomicU32::new(u32::MAX),
            loopback: Vec::new(),
            affined: AtomicU32::new(0),
            wire_drops: AtomicU64::new(0),
        }
    }

    /// Connects `tx` to `rx`: frames enqueued on `tx` cross the wire
    /// immediately and reappear as received frames built from `rx_pool`.
    pub fn wire_loopback(&mut self, tx: QueueId, rx: QueueId, rx_pool: PoolId) {
        self.loopback.push((tx, rx, rx_pool));
    }

    pub fn pool_info(&self, id: PoolId) -> &PoolInfo {
        &self.pool(id).expect("pool not configured").info
    }

    pub fn pool_available(&self, id: PoolId) -> usize {
        self.pool(id).expect("pool not configured").free.len()
    }

    /// Makes the next `n` release() calls on `id` report busy.
    pub fn inject_release_busy(&self, id: PoolId, n: u32) {
        self.pool(id)
            .expect("pool not configured")
            .busy_budget
            .store(n, Ordering::SeqCst);
    }

    pub fn set_enqueue_limit(&self, per_call: u32) {
        self.enqueue_limit.store(per_call, Ordering::SeqCst);
    }

    pub fn affined_contexts(&self) -> u32 {
        self.affined.load(Ordering::SeqCst)
    }

    pub fn consumed(&self, q: QueueId) -> u64 {
        self.queue(q).consumed.load(Ordering::SeqCst)
    }

    pub fn wire_drops(&self) -> u64 {
        self.wire_drops.load(Ordering::SeqCst)
    }

    /// Hardware-side receive: takes a buffer from `pool`, writes the frame
    /// and a parser annotation into it and posts a contiguous descriptor on
    /// `q`. Returns false when the frame was dropped (no buffer, oversized
    /// frame or full ring).
    pub fn inject_rx_frame(&self, q: QueueId, pool: PoolId, frame: &[u8]) -> bool {
        self.deliver(q, pool, frame)
    }

    /// Posts a raw descriptor on `q` without touching any buffer. For
    /// malformed-input tests.
    pub fn inject_rx_fd(&self, q: QueueId, fd: FrameDesc) -> bool {
        let queue = self.queue(q);
        // SAFETY: setup/test context owns the queue.
        let mut ring = unsafe { queue.ring.borrow_mut() };
        if ring.len() >= self.ring_capacity {
            return false;
        }
        ring.push_back(fd);
        true
    }

    /// Copies out the descriptors currently sitting on a queue, without
    /// disturbing them.
    pub fn pending_fds(&self, q: QueueId) -> Vec<FrameDesc> {
        let queue = self.queue(q);
        // SAFETY: inspecting context owns the queue.
        let ring = unsafe { queue.ring.borrow() };
        ring.iter().copied().collect()
    }

    /// Drains a queue the way the wire side would: payloads are copied out
    /// and every buffer carrying a true pool id is auto-released.
    pub fn harvest(&self, q: QueueId) -> Vec<Vec<u8>> {
        let fds: Vec<FrameDesc> = {
            let queue = self.queue(q);
            // SAFETY: harvesting context owns the queue.
            let mut ring = unsafe { queue.ring.borrow_mut() };
            ring.drain(..).collect()
        };
        fds.iter().filter_map(|fd| self.egress_frame(fd)).collect()
    }

    fn pool(&self, id: PoolId) -> Option<&SimPool> {
        self.pools.get(id.0 as usize)?.as_ref()
    }

    fn queue(&self, q: QueueId) -> &SimQueue {
        &self.queues[q.0 as usize]
    }

    fn translate(&self, addr: PhysAddr) -> Option<*mut u8> {
        let off = addr.0.checked_sub(SIM_PHYS_BASE)?;
        if (off as usize) < self.arena_len {
            // SAFETY: offset checked against the arena length.
            Some(unsafe { self.arena.base.as_ptr().add(off as usize) })
        } else {
            None
        }
    }

    fn auto_release(&self, bpid: u8, addr: PhysAddr) {
        if bpid == BPID_NO_RELEASE {
            return;
        }
        let Some(pool) = self.pool(PoolId(bpid)) else {
            warn!("egress references unknown pool {bpid}");
            return;
        };
        if !pool.owns(addr.0) {
            warn!("egress releases {addr:?} which pool {bpid} does not own");
            return;
        }
        pool.free
            .push(addr.0)
            .expect("pool overfull: buffer released twice");
    }

    /// Reads one outgoing frame's payload and performs the hardware-side
    /// auto-release of its buffers.
    fn egress_frame(&self, fd: &FrameDesc) -> Option<Vec<u8>> {
        match fd.fd_format() {
            Some(FdFormat::Contig) => {
                let base = self.translate(fd.addr)?;
                // SAFETY: descriptor geometry was validated by the producer.
                let bytes = unsafe {
                    slice::from_raw_parts(base.add(fd.offset as usize), fd.len as usize).to_vec()
                };
                self.auto_release(fd.bpid, fd.addr);
                Some(bytes)
            }
            Some(FdFormat::Sg) => {
                let base = self.translate(fd.addr)?;
                let mut bytes = Vec::with_capacity(fd.len as usize);
                for i in 0..MAX_SG_ENTRIES {
                    let off = fd.offset as usize + i * SG_ENTRY_SIZE;
                    // SAFETY: the table was written inside the carrier.
                    let raw = unsafe { slice::from_raw_parts(base.add(off), SG_ENTRY_SIZE) };
                    let entry = SgEntry::decode(raw.try_into().unwrap());
                    let seg_base = self.translate(entry.addr)?;
                    // SAFETY: entry geometry was validated by the producer.
                    unsafe {
                        bytes.extend_from_slice(slice::from_raw_parts(
                            seg_base.add(entry.offset as usize),
                            entry.len as usize,
                        ));
                    }
                    self.auto_release(entry.bpid, entry.addr);
                    if entry.is_final {
                        break;
                    }
                }
                self.auto_release(fd.bpid, fd.addr);
                Some(bytes)
            }
            None => {
                warn!("egress of malformed descriptor, format {}", fd.format);
                None
            }
        }
    }

    fn deliver(&self, q: QueueId, pool_id: PoolId, frame: &[u8]) -> bool {
        let Some(pool) = self.pool(pool_id) else {
            warn!("rx delivery into unknown pool {pool_id:?}");
            return false;
        };
        let data_off = DEFAULT_HEADROOM;
        if data_off as usize + frame.len() > pool.info.buf_size as usize {
            self.wire_drops.fetch_add(1, Ordering::SeqCst);
            return false;
        }
        let Some(phys) = pool.free.pop() else {
            self.wire_drops.fetch_add(1, Ordering::SeqCst);
            return false;
        };
        let base = self.translate(PhysAddr(phys)).expect("pool buffer is mapped");

        // SAFETY: the buffer just left the free list; nobody else holds it.
        unsafe {
            base.add(data_off as usize)
                .copy_from_nonoverlapping(frame.as_ptr(), frame.len());
            // What the hardware parser would have produced.
            zero_annotation(base);
            let (t, l2, l3) = slow_classify(frame);
            let annot = annot_mut(base);
            annot.class_word = class_word_for(t);
            if l2 as usize > etherparse::Ethernet2Header::LEN {
                annot.class_word |= CW_VLAN;
            }
            annot.l3_off = l2;
            annot.l4_off = (l2 as u16 + l3).min(u8::MAX as u16) as u8;
            annot.hash = flow_hash(frame).to_be();
        }

        let fd = FrameDesc::contig(PhysAddr(phys), pool_id.0, data_off, frame.len() as u32);
        let queue = self.queue(q);
        // SAFETY: delivery runs on the context owning the wire for this ring.
        let mut ring = unsafe { queue.ring.borrow_mut() };
        if ring.len() >= self.ring_capacity {
            drop(ring);
            self.auto_release(pool_id.0, PhysAddr(phys));
            self.wire_drops.fetch_add(1, Ordering::SeqCst);
            return false;
        }
        ring.push_back(fd);
        true
    }
}

fn slot_size(buf_size: u32) -> usize {
    let raw = BUF_META_SIZE as usize + buf_size as usize;
    (raw + SLOT_ALIGN - 1) & !(SLOT_ALIGN - 1)
}

/// FNV-1a over the whole frame; stands in for the parser's 5-tuple hash.
fn flow_hash(frame: &[u8]) -> u64 {
    let mut h = 0xcbf2_9ce4_8422_2325u64;
    for &b in frame {
        h ^= b as u64;
        h = h.wrapping_mul(0x100_0000_01b3);
    }
    h
}

impl MemoryService for SimNic {
    fn physical_to_process(&self, addr: PhysAddr) -> Option<NonNull<u8>> {
        self.translate(addr).and_then(NonNull::new)
    }
}

impl BufferPoolService for SimNic {
    fn acquire(&self, pool: PoolId) -> Option<PhysAddr> {
        self.pool(pool)?.free.pop().map(PhysAddr)
    }

    fn release(&self, pool: PoolId, addr: PhysAddr) -> std::result::Result<(), PoolBusy> {
        let Some(p) = self.pool(pool) else {
            warn!("release into unknown pool {pool:?}");
            return Ok(());
        };
        if p.busy_budget
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |b| b.checked_sub(1))
            .is_ok()
        {
            return Err(PoolBusy);
        }
        // Hardware tracks buffers purely by address; addresses it never
        // handed out are its caller's bug, not a reason to wedge the pool.
        if !p.owns(addr.0) {
            warn!("release of {addr:?} which pool {pool:?} does not own");
            return Ok(());
        }
        p.free
            .push(addr.0)
            .expect("pool overfull: buffer released twice");
        Ok(())
    }
}

impl FrameQueueService for SimNic {
    fn affine_portal(&self) -> Result<()> {
        self.affined.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn set_volatile_dequeue(&self, queue: QueueId, frames: u16) -> Result<()> {
        let q = self.queue(queue);
        // SAFETY: caller context owns this queue's portal.
        let mut vdq = unsafe { q.vdq.borrow_mut() };
        if vdq.remaining > 0 {
            return Err(Error::QueueBusy(queue));
        }
        vdq.remaining = frames;
        Ok(())
    }

    fn dequeue(&self, queue: QueueId) -> Option<RingEntry> {
        let q = self.queue(queue);
        // SAFETY: caller context owns this queue's portal.
        let mut vdq = unsafe { q.vdq.borrow_mut() };
        if vdq.remaining == 0 {
            return None;
        }
        let mut ring = unsafe { q.ring.borrow_mut() };
        match ring.pop_front() {
            Some(fd) => {
                vdq.remaining -= 1;
                Some(RingEntry {
                    fd,
                    slot: q.consumed.load(Ordering::Relaxed) as u32,
                })
            }
            None => {
                // Ring empty: the command expires.
                vdq.remaining = 0;
                None
            }
        }
    }

    fn consume(&self, queue: QueueId, entry: RingEntry) {
        trace!("consume slot {} on {queue:?}", entry.slot);
        self.queue(queue).consumed.fetch_add(1, Ordering::Relaxed);
    }

    fn vdq_active(&self, queue: QueueId) -> bool {
        // SAFETY: caller context owns this queue's portal.
        unsafe { self.queue(queue).vdq.borrow() }.remaining > 0
    }

    fn enqueue(&self, queue: QueueId, fds: &[FrameDesc]) -> usize {
        let limit = self.enqueue_limit.load(Ordering::SeqCst) as usize;
        if let Some(&(_, rx, rx_pool)) = self.loopback.iter().find(|(tx, _, _)| *tx == queue) {
            let n = fds.len().min(limit);
            for fd in &fds[..n] {
                if let Some(bytes) = self.egress_frame(fd) {
                    if !self.deliver(rx, rx_pool, &bytes) {
                        trace!("loopback frame dropped on {rx:?}");
                    }
                }
            }
            return n;
        }
        let q = self.queue(queue);
        // SAFETY: caller context owns this queue's portal.
        let mut ring = unsafe { q.ring.borrow_mut() };
        let room = self.ring_capacity.saturating_sub(ring.len());
        let n = fds.len().min(limit).min(room);
        ring.extend(fds[..n].iter().copied());
        n
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn volatile_dequeue_expires_on_empty_ring() {
        let nic = SimNic::new(
            &[SimPoolSpec {
                id: PoolId(1),
                buf_size: 1024,
                count: 4,
            }],
            1,
            8,
        );
        let q = QueueId(0);
        nic.set_volatile_dequeue(q, 4).unwrap();
        assert!(nic.vdq_active(q));
        assert!(nic.dequeue(q).is_none());
        assert!(!nic.vdq_active(q));
    }

    #[test]
    fn enqueue_respects_injected_acceptance_limit() {
        let nic = SimNic::new(
            &[SimPoolSpec {
                id: PoolId(1),
                buf_size: 1024,
                count: 4,
            }],
            1,
            64,
        );
        nic.set_enqueue_limit(2);
        let fds = [FrameDesc::default(); 5];
        assert_eq!(nic.enqueue(QueueId(0), &fds), 2);
        assert_eq!(nic.enqueue(QueueId(0), &fds[2..]), 2);
        assert_eq!(nic.enqueue(QueueId(0), &fds[4..]), 1);
    }

    #[test]
    fn injected_frame_round_trips_through_harvest() {
        let nic = SimNic::new(
            &[SimPoolSpec {
                id: PoolId(1),
                buf_size: 1024,
                count: 4,
            }],
            2,
            8,
        );
        let frame = [0x5au8; 60];
        assert!(nic.inject_rx_frame(QueueId(0), PoolId(1), &frame));
        // Simulate the driver looping it back out unchanged.
        nic.set_volatile_dequeue(QueueId(0), 1).unwrap();
        let entry = nic.dequeue(QueueId(0)).unwrap();
        nic.consume(QueueId(0), entry);
        assert_eq!(nic.enqueue(QueueId(1), &[entry.fd]), 1);
        let out = nic.harvest(QueueId(1));
        assert_eq!(out, vec![frame.to_vec()]);
        assert_eq!(nic.pool_available(PoolId(1)), 4);
    }
}
