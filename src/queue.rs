//! Batched receive and transmit.
//!
//! An [`Interface`] drives one NIC's frame queues over a hardware backend.
//! Every execution context creates its own [`Portal`] before the first burst
//! call; portals are not shareable and no lock protects queue state, the
//! single-owner discipline is the whole synchronization story.

use std::fmt;
use std::marker::PhantomData;
use std::mem;
use std::ops::{Deref, DerefMut};
use std::ptr::NonNull;

use arrayvec::ArrayVec;
use crossbeam::utils::Backoff;
use log::{debug, error, trace, warn};
use triomphe::Arc;

use crate::errors::{Error, Result};
use crate::frame::{FrameDesc, MAX_SG_ENTRIES, fd_to_pkt, pkt_to_sg_fd};
use crate::hw::{HwServices, QueueId};
use crate::mbuf::{OffloadFlags, PacketBuf, claim_for_hw, free_chain, free_seg, iter_chain};
use crate::parse::{
    PacketType, annot_mut, request_hw_checksum, software_checksum, tx_headroom_ok,
    zero_annotation,
};
use crate::pool::{PoolId, PoolTable, ReleasePolicy, acquire_buf};

/// Ceiling on one volatile-dequeue request.
pub const MAX_BURST: u16 = 63;

/// Descriptors offered to the hardware per submission chunk.
pub const MAX_TX_RING_SLOTS: usize = 8;

/// Proof that the current execution context performed its one-time portal
/// affinity. Not `Send`: a portal belongs to exactly one context.
pub struct Portal {
    _single_owner: PhantomData<*mut u8>,
}

/// One interface's datapath state: the backend handle, the pool registry,
/// and the pool substitute buffers are drawn from.
pub struct Interface<H: HwServices> {
    hw: Arc<H>,
    pools: PoolTable,
    own_pool: PoolId,
    ifid: u16,
    policy: ReleasePolicy,
}

impl<H: HwServices> Interface<H> {
    /// Panics if `own_pool` is not registered as a hardware-backed pool;
    /// that is a wiring mistake, not an operational failure.
    pub fn new(hw: Arc<H>, pools: PoolTable, own_pool: PoolId, ifid: u16) -> Interface<H> {
        let info = pools
            .get(own_pool)
            .unwrap_or_else(|| panic!("interface pool {own_pool:?} not registered"));
        assert!(info.hw_backed, "interface pool must be hardware backed");
        Interface {
            hw,
            pools,
            own_pool,
            ifid,
            policy: ReleasePolicy::default(),
        }
    }

    pub fn with_release_policy(mut self, policy: ReleasePolicy) -> Self {
        self.policy = policy;
        self
    }

    /// Performs the hardware affinity step for the calling context and hands
    /// back the proof the burst calls require. Call once per context.
    pub fn portal(&self) -> Result<Portal> {
        self.hw.affine_portal().map_err(|e| {
            error!("failure in affining portal: {e}");
            Error::PortalAffinity
        })?;
        Ok(Portal {
            _single_owner: PhantomData,
        })
    }

    /// Takes one buffer from the interface pool. `None` on exhaustion.
    pub fn alloc(&self) -> Option<Pkt<'_, H>> {
        let info = self.pools.get(self.own_pool).expect("checked in new()");
        let raw = acquire_buf(&*self.hw, info)?;
        // SAFETY: freshly acquired, exclusively ours.
        unsafe { (*raw.as_ptr()).port = self.ifid };
        Some(Pkt { raw, nic: self })
    }

    pub(crate) fn free_raw(&self, first: NonNull<PacketBuf>) {
        // SAFETY: called with the last live handle to the chain.
        unsafe { free_chain(&*self.hw, self.policy, first) };
    }

    /// Receives up to `min(max, MAX_BURST)` packets into `out`, returning
    /// how many were produced. Frames whose translation fails are dropped
    /// (their buffers released) and do not appear in `out`; fewer results
    /// than requested is normal operation.
    pub fn receive<'nic>(
        &'nic self,
        _portal: &Portal,
        queue: QueueId,
        out: &mut Vec<Pkt<'nic, H>>,
        max: usize,
    ) -> usize {
        let req = max.min(MAX_BURST as usize) as u16;
        if req == 0 {
            return 0;
        }
        if let Err(e) = self.hw.set_volatile_dequeue(queue, req) {
            debug!("volatile dequeue not armed: {e}");
            return 0;
        }
        let mut produced = 0;
        loop {
            let Some(entry) = self.hw.dequeue(queue) else {
                if self.hw.vdq_active(queue) {
                    // Command still running, the next frame is on its way.
                    std::hint::spin_loop();
                    continue;
                }
                break;
            };
            match fd_to_pkt(&*self.hw, &self.pools, self.policy, self.ifid, &entry.fd) {
                Ok(raw) => {
                    trace!("FD -> pkt, len {}", entry.fd.len);
                    out.push(Pkt { raw, nic: self });
                    produced += 1;
                }
                Err(e) => debug!("dropping received frame: {e}"),
            }
            self.hw.consume(queue, entry);
            if !self.hw.vdq_active(queue) {
                break;
            }
        }
        produced
    }

    /// Transmits a batch. Consumed packets are removed from `pkts`; on
    /// return it holds only the buffers the caller still owns (conversion
    /// failures truncate the batch to the already-converted prefix). Returns
    /// the number of packets submitted.
    pub fn transmit(&self, _portal: &Portal, queue: QueueId, pkts: &mut Vec<Pkt<'_, H>>) -> usize {
        trace!("transmitting {} buffers on {queue:?}", pkts.len());
        let mut it = mem::take(pkts).into_iter();
        let mut sent = 0;
        let mut truncated = false;
        loop {
            let mut fds: ArrayVec<FrameDesc, MAX_TX_RING_SLOTS> = ArrayVec::new();
            while !fds.is_full() {
                let Some(pkt) = it.next() else { break };
                match self.build_tx_fd(pkt) {
                    Ok(fd) => fds.push(fd),
                    Err((pkt, e)) => {
                        debug!("batch truncated: {e}");
                        pkts.push(pkt);
                        truncated = true;
                        break;
                    }
                }
            }
            if fds.is_empty() {
                break;
            }
            sent += self.submit(queue, &fds);
            if truncated {
                break;
            }
        }
        pkts.extend(it);
        sent
    }

    /// TX handler that accepts nothing. With a zero return the caller
    /// retains every buffer and reclaims them itself.
    pub fn transmit_drop_all(
        &self,
        _portal: &Portal,
        _queue: QueueId,
        _pkts: &mut Vec<Pkt<'_, H>>,
    ) -> usize {
        debug!("drop all packets");
        0
    }

    /// Offers a chunk until the hardware has taken all of it, advancing past
    /// partial acceptance. The spin is bounded; a queue that refuses
    /// descriptors past the bound loses the rest of the chunk.
    fn submit(&self, queue: QueueId, fds: &[FrameDesc]) -> usize {
        let mut off = 0;
        let mut backoff = Backoff::new();
        let mut idle = 0u32;
        while off < fds.len() {
            let taken = self.hw.enqueue(queue, &fds[off..]);
            off += taken;
            if taken == 0 {
                idle += 1;
                if idle >= self.policy.max_spins {
                    error!(
                        "{queue:?} refused descriptors for {idle} spins, dropping {}",
                        fds.len() - off
                    );
                    break;
                }
                backoff.spin();
            } else {
                idle = 0;
                backoff = Backoff::new();
            }
        }
        off
    }

    /// Converts one packet for transmission. On success the packet has been
    /// consumed (hardware or the remaining owners hold its memory); on
    /// failure it is handed back untouched.
    fn build_tx_fd<'p>(
        &self,
        pkt: Pkt<'p, H>,
    ) -> std::result::Result<FrameDesc, (Pkt<'p, H>, Error)> {
        let raw = pkt.raw;
        // SAFETY: the handle is the only reference to the chain.
        unsafe {
            let p = raw.as_ptr();
            let owner_pool = match (*p).owner {
                Some(o) => (*o.as_ptr()).pool,
                None => (*p).pool,
            };
            let hw_pool = self.pools.get(owner_pool).filter(|i| i.hw_backed).copied();
            let Some(info) = hw_pool else {
                debug!("foreign buffer, copying into pool {:?}", self.own_pool);
                return self.copy_to_own_pool(pkt);
            };
            let nb = (*p).nb_segs;
            if nb == 1 {
                Ok(self.contig_tx_fd(pkt))
            } else if nb as usize <= MAX_SG_ENTRIES {
                match pkt_to_sg_fd(&*self.hw, self.policy, raw, &info) {
                    Ok(fd) => {
                        mem::forget(pkt);
                        Ok(fd)
                    }
                    Err(e) => Err((pkt, e)),
                }
            } else {
                Err((pkt, Error::TooManySegments(nb)))
            }
        }
    }

    /// Zero-copy single-segment conversion, with the exclusive/shared
    /// ownership policy and checksum handling.
    fn contig_tx_fd(&self, pkt: Pkt<'_, H>) -> FrameDesc {
        let raw = pkt.raw;
        // SAFETY: the handle is the only reference to the segment.
        unsafe {
            let p = raw.as_ptr();
            let is_alias = (*p).owner.is_some();
            let addr = (*p).data_phys();
            let offset = (*p).data_off;
            let len = (*p).pkt_len;
            let bpid = claim_for_hw(raw);
            let mut fd = FrameDesc::contig(addr, bpid, offset, len);
            if (*p).flags.wants_tx_checksum() {
                if !tx_headroom_ok(offset) {
                    warn!(
                        "not enough headroom for checksum offload, \
                         calculating checksum in software"
                    );
                    software_checksum(raw);
                } else {
                    let base = (*p).data_base();
                    zero_annotation(base);
                    request_hw_checksum(&*p, &mut fd, annot_mut(base));
                }
            }
            if is_alias {
                // The entry references the owner's buffer; the shell goes
                // back to its pool now.
                free_seg(&*self.hw, self.policy, raw);
            }
            mem::forget(pkt);
            fd
        }
    }

    /// Slow path for buffers the hardware pool subsystem does not recognize:
    /// gather the payload into a buffer from the interface pool, carry the
    /// essential metadata over and retire the original.
    fn copy_to_own_pool<'p>(
        &self,
        pkt: Pkt<'p, H>,
    ) -> std::result::Result<FrameDesc, (Pkt<'p, H>, Error)> {
        let own_info = *self.pools.get(self.own_pool).expect("checked in new()");
        let Some(sub) = acquire_buf(&*self.hw, &own_info) else {
            debug!("no pool buffers for substitute");
            return Err((pkt, Error::PoolExhausted(self.own_pool)));
        };
        // SAFETY: `sub` is freshly acquired; `pkt` is exclusively ours.
        unsafe {
            let s = sub.as_ptr();
            let p = pkt.raw.as_ptr();
            let data_off = (*p).data_off;
            let total = (*p).pkt_len;
            if data_off as u32 + total > (*s).buf_len {
                let _ = crate::pool::release_buf(
                    &*self.hw,
                    own_info.id,
                    (*s).buf_phys(),
                    self.policy,
                );
                return Err((pkt, Error::TooBigPacket(total as usize)));
            }
            let mut dst = (*s).buf_addr.add(data_off as usize);
            for seg in iter_chain(pkt.raw) {
                let part = (*seg.as_ptr()).payload();
                dst.copy_from_nonoverlapping(part.as_ptr(), part.len());
                dst = dst.add(part.len());
            }
            (*s).data_off = data_off;
            (*s).data_len = total;
            (*s).pkt_len = total;
            (*s).port = (*p).port;
            (*s).flags = (*p).flags;
            (*s).ptype = (*p).ptype;
            (*s).rss_hash = (*p).rss_hash;
            (*s).l2_len = (*p).l2_len;
            (*s).l3_len = (*p).l3_len;
            drop(pkt);
            Ok(FrameDesc::contig(
                (*s).buf_phys(),
                own_info.id.0,
                data_off,
                total,
            ))
        }
    }
}

/// Owning handle to a packet (chain). Dereferences to the first segment's
/// payload; dropping it frees the whole chain back to its pools.
pub struct Pkt<'nic, H: HwServices> {
    pub(crate) raw: NonNull<PacketBuf>,
    pub(crate) nic: &'nic Interface<H>,
}

impl<'nic, H: HwServices> Pkt<'nic, H> {
    fn first(&self) -> &PacketBuf {
        // SAFETY: the handle owns the chain.
        unsafe { self.raw.as_ref() }
    }

    pub fn pkt_len(&self) -> u32 {
        self.first().pkt_len
    }

    pub fn nb_segs(&self) -> u16 {
        self.first().nb_segs
    }

    pub fn port(&self) -> u16 {
        self.first().port
    }

    pub fn packet_type(&self) -> PacketType {
        self.first().ptype
    }

    pub fn rss_hash(&self) -> u32 {
        self.first().rss_hash
    }

    pub fn offload_flags(&self) -> OffloadFlags {
        self.first().flags
    }

    pub fn flags_mut(&mut self) -> &mut OffloadFlags {
        // SAFETY: exclusive handle.
        unsafe { &mut (*self.raw.as_ptr()).flags }
    }

    /// Classification and header lengths drive the checksum paths; a sender
    /// building packets by hand sets them explicitly.
    pub fn set_offload_layout(&mut self, t: PacketType, l2_len: u8, l3_len: u16) {
        // SAFETY: exclusive handle.
        unsafe {
            let p = self.raw.as_ptr();
            (*p).ptype = t;
            (*p).l2_len = l2_len;
            (*p).l3_len = l3_len;
        }
    }

    /// Appends bytes to the last segment.
    pub fn append(&mut self, bytes: &[u8]) -> Result<()> {
        // SAFETY: exclusive handle; the last segment's tailroom bounds the
        // write.
        unsafe {
            let last = iter_chain(self.raw).last().expect("chain is never empty");
            let s = last.as_ptr();
            if bytes.len() as u32 > (*s).tailroom() {
                return Err(Error::TooBigPacket(bytes.len()));
            }
            let at = (*s).data_off as usize + (*s).data_len as usize;
            (*s).data_base()
                .add(at)
                .copy_from_nonoverlapping(bytes.as_ptr(), bytes.len());
            (*s).data_len += bytes.len() as u32;
            (*self.raw.as_ptr()).pkt_len += bytes.len() as u32;
        }
        Ok(())
    }

    /// Links `tail` behind this packet, merging it into one chain.
    pub fn chain(&mut self, tail: Pkt<'nic, H>) {
        debug_assert!(
            std::ptr::eq(self.nic, tail.nic),
            "chaining across interfaces"
        );
        // SAFETY: both handles are exclusive; `tail` is consumed.
        unsafe {
            let last = iter_chain(self.raw).last().expect("chain is never empty");
            (*last.as_ptr()).next = Some(tail.raw);
            let f = self.raw.as_ptr();
            let t = tail.raw.as_ptr();
            (*f).nb_segs += (*t).nb_segs;
            (*f).pkt_len += (*t).pkt_len;
        }
        mem::forget(tail);
    }

    /// Creates an aliased view sharing this packet's payload. The view's
    /// shell comes from the interface pool; the payload buffer becomes
    /// shared-owned and will not be auto-released until every view is gone.
    /// Multi-segment packets are not supported (`None`).
    pub fn clone_view(&self) -> Option<Pkt<'nic, H>> {
        // SAFETY: shared fields are read under an exclusive handle; the
        // ownership bump keeps the owner alive for the new view.
        unsafe {
            if (*self.raw.as_ptr()).nb_segs != 1 {
                return None;
            }
            let info = self.nic.pools.get(self.nic.own_pool).expect("checked in new()");
            let shell = acquire_buf(&*self.nic.hw, info)?;
            let p = self.raw.as_ptr();
            let owner = match (*p).owner {
                Some(o) => o,
                None => self.raw,
            };
            (*owner.as_ptr()).ownership = (*owner.as_ptr()).ownership.add_owner();
            let s = shell.as_ptr();
            (*s).owner = Some(owner);
            (*s).data_off = (*p).data_off;
            (*s).data_len = (*p).data_len;
            (*s).pkt_len = (*p).pkt_len;
            (*s).port = (*p).port;
            (*s).flags = (*p).flags;
            (*s).ptype = (*p).ptype;
            (*s).rss_hash = (*p).rss_hash;
            (*s).l2_len = (*p).l2_len;
            (*s).l3_len = (*p).l3_len;
            Some(Pkt {
                raw: shell,
                nic: self.nic,
            })
        }
    }

    /// Per-segment payload views.
    pub fn segments(&self) -> Vec<&[u8]> {
        iter_chain(self.raw)
            // SAFETY: the handle owns every segment.
            .map(|seg| unsafe { (*seg.as_ptr()).payload() })
            .collect()
    }
}

impl<'nic, H: HwServices> Deref for Pkt<'nic, H> {
    type Target = [u8];

    fn deref(&self) -> &[u8] {
        self.first().payload()
    }
}

impl<'nic, H: HwServices> DerefMut for Pkt<'nic, H> {
    fn deref_mut(&mut self) -> &mut [u8] {
        // SAFETY: exclusive handle.
        unsafe { (*self.raw.as_ptr()).payload_mut() }
    }
}

impl<'nic, H: HwServices> Drop for Pkt<'nic, H> {
    fn drop(&mut self) {
        self.nic.free_raw(self.raw);
    }
}

impl<'nic, H: HwServices> fmt::Debug for Pkt<'nic, H> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Pkt")
            .field("len", &self.pkt_len())
            .field("segs", &self.nb_segs())
            .finish()
    }
}
