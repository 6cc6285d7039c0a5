//! In-memory packet buffers.
//!
//! Every pool buffer is preceded by a fixed metadata region holding a
//! [`PacketBuf`] header; the driver (re)writes that header each time a buffer
//! enters its view, either from an `acquire` or from a received descriptor.
//! A packet is a chain of one or more segments linked through `next`; the
//! first segment carries the totals (`pkt_len`, `nb_segs`).

use std::ptr::NonNull;
use std::slice;

use bitflags::bitflags;

use crate::errors::{Error, Result};
use crate::hw::BufferPoolService;
use crate::mem::PhysAddr;
use crate::parse::PacketType;
use crate::pool::{PoolId, PoolInfo, ReleasePolicy, release_buf};

/// Metadata bytes reserved in front of every pool buffer.
pub const BUF_META_SIZE: u32 = 128;

/// Default data offset for freshly acquired buffers. Leaves room for the
/// annotation block plus prepend headroom.
pub const DEFAULT_HEADROOM: u16 = 128;

const _: () = assert!(size_of::<PacketBuf>() <= BUF_META_SIZE as usize);

/// Who may release a buffer's backing memory.
///
/// `Exclusive` buffers have a single owner and may be auto-released by
/// hardware; `Shared(n)` buffers have `n >= 2` owners and must only go back
/// to their pool once the last owner lets go.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum Ownership {
    Exclusive,
    Shared(u32),
}

impl Ownership {
    #[inline]
    pub fn is_shared(self) -> bool {
        matches!(self, Ownership::Shared(_))
    }

    /// One more owner.
    pub(crate) fn add_owner(self) -> Ownership {
        match self {
            Ownership::Exclusive => Ownership::Shared(2),
            Ownership::Shared(n) => Ownership::Shared(n + 1),
        }
    }

    /// One owner lets go. `None` means the buffer has no owners left and its
    /// memory must be released.
    pub(crate) fn drop_owner(self) -> Option<Ownership> {
        match self {
            Ownership::Exclusive => None,
            Ownership::Shared(2) => Some(Ownership::Exclusive),
            Ownership::Shared(n) => Some(Ownership::Shared(n - 1)),
        }
    }
}

bitflags! {
    /// Per-packet offload and classification status flags.
    #[derive(Clone, Copy, PartialEq, Eq, Debug, Default)]
    pub struct OffloadFlags: u32 {
        /// RX: the RSS hash field is valid.
        const RX_RSS_HASH = 1 << 0;
        /// RX: the frame carried a VLAN tag.
        const RX_VLAN = 1 << 1;
        /// TX: request L3 header checksum.
        const TX_IP_CKSUM = 1 << 8;
        /// TX: request TCP checksum.
        const TX_TCP_CKSUM = 1 << 9;
        /// TX: request UDP checksum.
        const TX_UDP_CKSUM = 1 << 10;
    }
}

impl OffloadFlags {
    #[inline]
    pub fn wants_tx_checksum(self) -> bool {
        self.intersects(Self::TX_IP_CKSUM | Self::TX_TCP_CKSUM | Self::TX_UDP_CKSUM)
    }
}

/// Per-buffer header living in the reserved metadata region.
///
/// `buf_addr`/`buf_phys` always describe this buffer's own backing store.
/// When `owner` is set the segment is an aliased view: its payload lives in
/// the owner's buffer and `data_off`/`data_len` are relative to that buffer.
#[repr(C)]
pub struct PacketBuf {
    pub(crate) buf_addr: *mut u8,
    pub(crate) buf_phys: PhysAddr,
    pub(crate) buf_len: u32,
    pub(crate) data_off: u16,
    pub(crate) data_len: u32,
    pub(crate) pkt_len: u32,
    pub(crate) nb_segs: u16,
    pub(crate) port: u16,
    pub(crate) pool: PoolId,
    pub(crate) ownership: Ownership,
    pub(crate) flags: OffloadFlags,
    pub(crate) ptype: PacketType,
    pub(crate) rss_hash: u32,
    pub(crate) l2_len: u8,
    pub(crate) l3_len: u16,
    pub(crate) next: Option<NonNull<PacketBuf>>,
    pub(crate) owner: Option<NonNull<PacketBuf>>,
}

impl PacketBuf {
    /// Derives the header location from a buffer pointer.
    ///
    /// # Safety
    /// `vaddr` must point at the start of a pool buffer preceded by at least
    /// `meta_size` reserved bytes.
    #[inline]
    pub(crate) unsafe fn from_buffer_ptr(vaddr: NonNull<u8>, meta_size: u32) -> NonNull<PacketBuf> {
        // SAFETY: per contract the metadata region directly precedes vaddr.
        unsafe {
            NonNull::new_unchecked(vaddr.as_ptr().sub(meta_size as usize) as *mut PacketBuf)
        }
    }

    /// Rewrites the header for a buffer that just entered the driver's view.
    ///
    /// # Safety
    /// `pkt` must come from [`PacketBuf::from_buffer_ptr`] for `vaddr`, and
    /// no other reference to the header may be live.
    pub(crate) unsafe fn reset(
        pkt: NonNull<PacketBuf>,
        vaddr: NonNull<u8>,
        phys: PhysAddr,
        info: &PoolInfo,
    ) {
        // SAFETY: exclusive access per contract; write() avoids reading the
        // stale header left by the previous user of the buffer.
        unsafe {
            pkt.as_ptr().write(PacketBuf {
                buf_addr: vaddr.as_ptr(),
                buf_phys: phys,
                buf_len: info.buf_size,
                data_off: DEFAULT_HEADROOM,
                data_len: 0,
                pkt_len: 0,
                nb_segs: 1,
                port: 0,
                pool: info.id,
                ownership: Ownership::Exclusive,
                flags: OffloadFlags::empty(),
                ptype: PacketType::default(),
                rss_hash: 0,
                l2_len: 0,
                l3_len: 0,
                next: None,
                owner: None,
            });
        }
    }

    #[inline]
    pub(crate) fn buf_phys(&self) -> PhysAddr {
        self.buf_phys
    }

    /// Base pointer of the buffer the payload actually lives in.
    #[inline]
    pub(crate) fn data_base(&self) -> *mut u8 {
        match self.owner {
            // SAFETY: an alias never outlives its owner's buffer.
            Some(o) => unsafe { (*o.as_ptr()).buf_addr },
            None => self.buf_addr,
        }
    }

    /// Physical address of the buffer the payload lives in.
    #[inline]
    pub(crate) fn data_phys(&self) -> PhysAddr {
        match self.owner {
            // SAFETY: as for data_base.
            Some(o) => unsafe { (*o.as_ptr()).buf_phys },
            None => self.buf_phys,
        }
    }

    #[inline]
    pub fn payload(&self) -> &[u8] {
        // SAFETY: data_off/data_len stay within the backing buffer.
        unsafe {
            slice::from_raw_parts(
                self.data_base().add(self.data_off as usize),
                self.data_len as usize,
            )
        }
    }

    #[inline]
    pub fn payload_mut(&mut self) -> &mut [u8] {
        // SAFETY: as for payload; &mut self gives us the exclusive view.
        unsafe {
            slice::from_raw_parts_mut(
                self.data_base().add(self.data_off as usize),
                self.data_len as usize,
            )
        }
    }

    #[inline]
    pub(crate) fn tailroom(&self) -> u32 {
        self.buf_len - self.data_off as u32 - self.data_len
    }

    /// Appends bytes to this segment's data, growing `data_len` (and, for a
    /// lone first segment, `pkt_len`).
    pub(crate) fn append(&mut self, bytes: &[u8]) -> Result<()> {
        if bytes.len() as u32 > self.tailroom() {
            return Err(Error::TooBigPacket(bytes.len()));
        }
        let at = self.data_off as usize + self.data_len as usize;
        // SAFETY: tailroom check above keeps the write in bounds.
        unsafe {
            slice::from_raw_parts_mut(self.data_base().add(at), bytes.len())
                .copy_from_slice(bytes);
        }
        self.data_len += bytes.len() as u32;
        self.pkt_len += bytes.len() as u32;
        Ok(())
    }
}

pub(crate) struct ChainIter {
    cur: Option<NonNull<PacketBuf>>,
}

impl Iterator for ChainIter {
    type Item = NonNull<PacketBuf>;

    fn next(&mut self) -> Option<NonNull<PacketBuf>> {
        let seg = self.cur?;
        // SAFETY: chain links are owned by the chain head we iterate from.
        self.cur = unsafe { (*seg.as_ptr()).next };
        Some(seg)
    }
}

#[inline]
pub(crate) fn iter_chain(first: NonNull<PacketBuf>) -> ChainIter {
    ChainIter { cur: Some(first) }
}

/// Decides the wire pool id for a segment that is about to be handed to
/// hardware, applying the exclusive/shared ownership policy.
///
/// An exclusive segment travels with its true pool id so hardware can
/// auto-release it. A shared one travels with the no-release sentinel and the
/// local claim is dropped here. For an aliased view the decision is applied
/// to the true owner; freeing the alias shell afterwards is the caller's job
/// (via [`free_seg`]).
///
/// # Safety
/// `seg` (and its owner, if aliased) must be valid with no other live
/// references.
pub(crate) unsafe fn claim_for_hw(seg: NonNull<PacketBuf>) -> u8 {
    let s = seg.as_ptr();
    // SAFETY: exclusive access per contract.
    unsafe {
        match (*s).owner {
            None => match (*s).ownership {
                Ownership::Exclusive => (*s).pool.0,
                Ownership::Shared(_) => {
                    (*s).ownership = (*s).ownership.drop_owner().expect("shared has owners");
                    crate::pool::BPID_NO_RELEASE
                }
            },
            Some(owner) => {
                let o = owner.as_ptr();
                if (*o).ownership.is_shared() {
                    crate::pool::BPID_NO_RELEASE
                } else {
                    // Hardware takes a claim on the owner; the alias shell
                    // free below hands ours back.
                    (*o).ownership = (*o).ownership.add_owner();
                    (*o).pool.0
                }
            }
        }
    }
}

/// Frees exactly one segment object: drops its claim on the backing buffer
/// (or on its owner's, for an aliased view) and returns whatever memory has
/// no owners left to its pool. A failed bounded release is logged inside
/// `release_buf` and the buffer is leaked rather than stalling the caller.
///
/// # Safety
/// `seg` must be a valid, exclusively held segment; it is dead after this.
pub(crate) unsafe fn free_seg<H: BufferPoolService>(
    hw: &H,
    policy: ReleasePolicy,
    seg: NonNull<PacketBuf>,
) {
    let s = seg.as_ptr();
    // SAFETY: exclusive access per contract.
    unsafe {
        if let Some(owner) = (*s).owner {
            let o = owner.as_ptr();
            match (*o).ownership.drop_owner() {
                Some(remaining) => (*o).ownership = remaining,
                None => {
                    let _ = release_buf(hw, (*o).pool, (*o).buf_phys, policy);
                }
            }
            // The shell itself carries no payload; its own buffer goes back.
            let _ = release_buf(hw, (*s).pool, (*s).buf_phys, policy);
        } else {
            match (*s).ownership.drop_owner() {
                Some(remaining) => (*s).ownership = remaining,
                None => {
                    let _ = release_buf(hw, (*s).pool, (*s).buf_phys, policy);
                }
            }
        }
    }
}

/// Frees a whole chain, segment by segment.
///
/// # Safety
/// As for [`free_seg`], for every segment in the chain.
pub(crate) unsafe fn free_chain<H: BufferPoolService>(
    hw: &H,
    policy: ReleasePolicy,
    first: NonNull<PacketBuf>,
) {
    let mut cur = Some(first);
    while let Some(seg) = cur {
        // SAFETY: read the link before the segment dies.
        let next = unsafe { (*seg.as_ptr()).next };
        unsafe { free_seg(hw, policy, seg) };
        cur = next;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ownership_transitions() {
        assert_eq!(Ownership::Exclusive.add_owner(), Ownership::Shared(2));
        assert_eq!(Ownership::Shared(2).add_owner(), Ownership::Shared(3));
        assert_eq!(Ownership::Shared(3).drop_owner(), Some(Ownership::Shared(2)));
        assert_eq!(Ownership::Shared(2).drop_owner(), Some(Ownership::Exclusive));
        assert_eq!(Ownership::Exclusive.drop_owner(), None);
    }

    #[test]
    fn tx_checksum_mask() {
        assert!(!OffloadFlags::RX_RSS_HASH.wants_tx_checksum());
        assert!(OffloadFlags::TX_IP_CKSUM.wants_tx_checksum());
        assert!(
            (OffloadFlags::RX_VLAN | OffloadFlags::TX_UDP_CKSUM).wants_tx_checksum()
        );
    }
}
