//! Frame descriptors and descriptor↔packet translation.
//!
//! A contiguous descriptor references exactly one buffer. A scatter-gather
//! descriptor references a carrier buffer holding a table of per-segment
//! entries in wire byte order; the table, not the carrier, describes the
//! payload. Translation owns the conversion in both directions, including
//! the ownership policy for buffers handed to hardware.

use std::ptr::NonNull;
use std::slice;

use bitflags::bitflags;
use log::{debug, log_enabled, trace};

use crate::errors::{Error, Result};
use crate::hw::HwServices;
use crate::mbuf::{PacketBuf, claim_for_hw, free_chain, free_seg};
use crate::mem::{AddrSpace, PhysAddr};
use crate::parse::{annot_mut, packet_info, request_hw_checksum, software_checksum,
    zero_annotation, TX_ANNOT_MIN};
use crate::pool::{PoolId, PoolInfo, PoolTable, ReleasePolicy, acquire_buf, release_buf};

/// Wire format codes.
pub const FMT_CONTIG: u8 = 0;
pub const FMT_SG: u8 = 4;

/// Hard bound on scatter-gather table length.
pub const MAX_SG_ENTRIES: usize = 16;
pub const SG_ENTRY_SIZE: usize = 16;

bitflags! {
    /// Descriptor command flags.
    #[derive(Clone, Copy, PartialEq, Eq, Debug, Default)]
    pub struct FdCmd: u32 {
        /// Annotation carries valid result-request fields.
        const PARSE_RESULTS = 1 << 30;
        /// Compute L3 (and, if requested, L4) checksums on the way out.
        const DO_CHECKSUM = 1 << 28;
    }
}

/// Compact hardware-queue entry.
#[derive(Clone, Copy, Debug, Default)]
pub struct FrameDesc {
    pub addr: PhysAddr,
    pub format: u8,
    pub bpid: u8,
    pub offset: u16,
    pub len: u32,
    pub cmd: FdCmd,
}

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum FdFormat {
    Contig,
    Sg,
}

impl FrameDesc {
    pub fn contig(addr: PhysAddr, bpid: u8, offset: u16, len: u32) -> FrameDesc {
        FrameDesc {
            addr,
            format: FMT_CONTIG,
            bpid,
            offset,
            len,
            cmd: FdCmd::empty(),
        }
    }

    #[inline]
    pub fn fd_format(&self) -> Option<FdFormat> {
        match self.format {
            FMT_CONTIG => Some(FdFormat::Contig),
            FMT_SG => Some(FdFormat::Sg),
            _ => None,
        }
    }
}

/// One scatter-gather table entry, in process byte order. The wire form is
/// 16 big-endian bytes produced by [`SgEntry::encode`].
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub struct SgEntry {
    pub addr: PhysAddr,
    pub offset: u16,
    pub len: u32,
    pub bpid: u8,
    pub is_final: bool,
}

impl SgEntry {
    pub fn encode(&self, out: &mut [u8]) {
        out[0..8].copy_from_slice(&self.addr.0.to_be_bytes());
        let w1 = ((self.is_final as u32) << 31) | (self.len & 0x000f_ffff);
        out[8..12].copy_from_slice(&w1.to_be_bytes());
        let w2 = ((self.bpid as u32) << 16) | (self.offset as u32 & 0x1fff);
        out[12..16].copy_from_slice(&w2.to_be_bytes());
    }

    pub fn decode(raw: &[u8; SG_ENTRY_SIZE]) -> SgEntry {
        let addr = u64::from_be_bytes(raw[0..8].try_into().unwrap());
        let w1 = u32::from_be_bytes(raw[8..12].try_into().unwrap());
        let w2 = u32::from_be_bytes(raw[12..16].try_into().unwrap());
        SgEntry {
            addr: PhysAddr(addr),
            offset: (w2 & 0x1fff) as u16,
            len: w1 & 0x000f_ffff,
            bpid: (w2 >> 16) as u8,
            is_final: w1 & (1 << 31) != 0,
        }
    }
}

pub(crate) enum SgStep {
    Entry(SgEntry),
    Final(SgEntry),
    Overflow,
}

/// Bounded walk over a wire-encoded scatter-gather table. Malformed input
/// that never sets a final flag terminates in [`SgStep::Overflow`] instead
/// of running away.
pub(crate) struct SgWalker<'a> {
    table: &'a [u8],
    idx: usize,
}

impl<'a> SgWalker<'a> {
    pub(crate) fn new(table: &'a [u8]) -> Self {
        Self { table, idx: 0 }
    }

    pub(crate) fn next(&mut self) -> SgStep {
        if self.idx >= MAX_SG_ENTRIES {
            return SgStep::Overflow;
        }
        let off = self.idx * SG_ENTRY_SIZE;
        let Some(raw) = self.table.get(off..off + SG_ENTRY_SIZE) else {
            return SgStep::Overflow;
        };
        self.idx += 1;
        let entry = SgEntry::decode(raw.try_into().unwrap());
        if entry.is_final {
            SgStep::Final(entry)
        } else {
            SgStep::Entry(entry)
        }
    }
}

/// Hex dump of a received frame's leading bytes, trace level only.
fn display_frame(fd: &FrameDesc, payload: &[u8]) {
    if !log_enabled!(log::Level::Trace) {
        return;
    }
    let shown = payload.len().min(64);
    let mut hex = String::with_capacity(shown * 3);
    for b in &payload[..shown] {
        hex.push_str(&format!("{b:02x} "));
    }
    trace!(
        "fd {:?} format {} off {} len {}: {hex}",
        fd.addr, fd.format, fd.offset, fd.len
    );
}

/// Translates one received descriptor into a packet buffer (chain).
///
/// On any failure the referenced memory goes back to its pool and the caller
/// drops the frame; nothing here is fatal.
pub(crate) fn fd_to_pkt<H: HwServices>(
    hw: &H,
    pools: &PoolTable,
    policy: ReleasePolicy,
    ifid: u16,
    fd: &FrameDesc,
) -> Result<NonNull<PacketBuf>> {
    match fd.fd_format() {
        Some(FdFormat::Contig) => {}
        Some(FdFormat::Sg) => return sg_fd_to_pkt(hw, pools, policy, ifid, fd),
        None => {
            let _ = release_buf(hw, PoolId(fd.bpid), fd.addr, policy);
            return Err(Error::BadFormat(fd.format));
        }
    }

    let Some(info) = pools.get(PoolId(fd.bpid)).copied() else {
        let _ = release_buf(hw, PoolId(fd.bpid), fd.addr, policy);
        return Err(Error::UnknownPool(PoolId(fd.bpid)));
    };
    let vaddr = match AddrSpace::new(hw).to_process_pointer(fd.addr) {
        Ok(p) => p,
        Err(e) => {
            let _ = release_buf(hw, info.id, fd.addr, policy);
            return Err(e);
        }
    };
    if fd.offset as u32 + fd.len > info.buf_size {
        let _ = release_buf(hw, info.id, fd.addr, policy);
        return Err(Error::TooBigPacket(fd.len as usize));
    }

    // SAFETY: the descriptor references a pool buffer with our reserved
    // metadata region in front; hardware handed it over, so we own it.
    unsafe {
        let pkt = PacketBuf::from_buffer_ptr(vaddr, info.meta_size);
        PacketBuf::reset(pkt, vaddr, fd.addr, &info);
        let p = pkt.as_ptr();
        (*p).data_off = fd.offset;
        (*p).data_len = fd.len;
        (*p).pkt_len = fd.len;
        (*p).port = ifid;
        display_frame(fd, (*p).payload());
        packet_info(pkt);
        Ok(pkt)
    }
}

/// Scatter-gather receive translation: reads the table out of the carrier
/// buffer, chains the segments, classifies once from the first segment and
/// finally releases the carrier (it held only the table).
fn sg_fd_to_pkt<H: HwServices>(
    hw: &H,
    pools: &PoolTable,
    policy: ReleasePolicy,
    ifid: u16,
    fd: &FrameDesc,
) -> Result<NonNull<PacketBuf>> {
    debug!("received an SG frame");
    let carrier_pool = PoolId(fd.bpid);
    let Some(carrier_info) = pools.get(carrier_pool).copied() else {
        let _ = release_buf(hw, carrier_pool, fd.addr, policy);
        return Err(Error::UnknownPool(carrier_pool));
    };
    let carrier_vaddr = match AddrSpace::new(hw).to_process_pointer(fd.addr) {
        Ok(p) => p,
        Err(e) => {
            let _ = release_buf(hw, carrier_pool, fd.addr, policy);
            return Err(e);
        }
    };
    if fd.offset as u32 >= carrier_info.buf_size {
        let _ = release_buf(hw, carrier_pool, fd.addr, policy);
        return Err(Error::BadFormat(fd.format));
    }

    // SAFETY: table bytes live inside the carrier buffer we now own.
    let table = unsafe {
        slice::from_raw_parts(
            carrier_vaddr.as_ptr().add(fd.offset as usize),
            (carrier_info.buf_size - fd.offset as u32) as usize,
        )
    };

    let mut first: Option<NonNull<PacketBuf>> = None;
    let mut prev: Option<NonNull<PacketBuf>> = None;
    let mut walker = SgWalker::new(table);

    // Frees whatever was partially assembled, carrier included.
    let bail = |hw: &H, first: Option<NonNull<PacketBuf>>, err: Error| -> Result<NonNull<PacketBuf>> {
        if let Some(f) = first {
            // SAFETY: the chain so far is exclusively ours.
            unsafe { free_chain(hw, policy, f) };
        }
        let _ = release_buf(hw, carrier_pool, fd.addr, policy);
        Err(err)
    };

    loop {
        let (entry, last) = match walker.next() {
            SgStep::Entry(e) => (e, false),
            SgStep::Final(e) => (e, true),
            SgStep::Overflow => return bail(hw, first, Error::SgOverflow),
        };
        let Some(seg_info) = pools.get(PoolId(entry.bpid)).copied() else {
            return bail(hw, first, Error::UnknownPool(PoolId(entry.bpid)));
        };
        let seg_vaddr = match AddrSpace::new(hw).to_process_pointer(entry.addr) {
            Ok(p) => p,
            Err(e) => return bail(hw, first, e),
        };
        if entry.offset as u32 + entry.len > seg_info.buf_size {
            let _ = release_buf(hw, seg_info.id, entry.addr, policy);
            return bail(hw, first, Error::TooBigPacket(entry.len as usize));
        }
        // SAFETY: each table entry references a pool buffer handed over by
        // hardware together with the frame.
        unsafe {
            let seg = PacketBuf::from_buffer_ptr(seg_vaddr, seg_info.meta_size);
            PacketBuf::reset(seg, seg_vaddr, entry.addr, &seg_info);
            let s = seg.as_ptr();
            (*s).data_off = entry.offset;
            (*s).data_len = entry.len;
            match first {
                None => {
                    (*s).pkt_len = entry.len;
                    (*s).port = ifid;
                    first = Some(seg);
                }
                Some(f) => {
                    let fp = f.as_ptr();
                    (*fp).pkt_len += entry.len;
                    (*fp).nb_segs += 1;
                    (*prev.unwrap().as_ptr()).next = Some(seg);
                }
            }
            prev = Some(seg);
        }
        if last {
            break;
        }
    }

    let first = first.expect("final entry implies at least one segment");
    // SAFETY: chain is fully assembled and exclusively ours.
    unsafe { packet_info(first) };
    let _ = release_buf(hw, carrier_pool, fd.addr, policy);
    Ok(first)
}

/// Builds a scatter-gather descriptor for a segment chain.
///
/// Acquires one carrier from `carrier_pool` for the table; every failure
/// path releases it again, so no partial table ever reaches hardware. On
/// success the chain's buffers belong to hardware (or to their remaining
/// owners, for shared segments) and alias shells have been returned.
pub(crate) fn pkt_to_sg_fd<H: HwServices>(
    hw: &H,
    policy: ReleasePolicy,
    first: NonNull<PacketBuf>,
    carrier_pool: &PoolInfo,
) -> Result<FrameDesc> {
    debug!("creating SG descriptor to transmit");
    // SAFETY: the chain head is exclusively ours for the whole build.
    let nb_segs = unsafe { (*first.as_ptr()).nb_segs };
    if nb_segs as usize > MAX_SG_ENTRIES {
        return Err(Error::TooManySegments(nb_segs));
    }
    let table_bytes = nb_segs as usize * SG_ENTRY_SIZE;

    let Some(carrier) = acquire_buf(hw, carrier_pool) else {
        return Err(Error::PoolExhausted(carrier_pool.id));
    };
    let c = carrier.as_ptr();

    // SAFETY: carrier is freshly acquired and exclusively ours.
    unsafe {
        let mut fd = FrameDesc {
            addr: (*c).buf_phys,
            format: FMT_SG,
            bpid: carrier_pool.id.0,
            offset: 0,
            len: (*first.as_ptr()).pkt_len,
            cmd: FdCmd::empty(),
        };

        let mut sgt_off = (*c).data_off;
        if (*first.as_ptr()).flags.wants_tx_checksum() {
            // The annotation must not overlap the table; move the table back
            // if the carrier's default offset is too small.
            let bumped = sgt_off.max(TX_ANNOT_MIN);
            if bumped as usize + table_bytes <= (*c).buf_len as usize {
                sgt_off = bumped;
                zero_annotation((*c).buf_addr);
                request_hw_checksum(&*first.as_ptr(), &mut fd, annot_mut((*c).buf_addr));
            } else {
                debug!("no room for offload annotation, checksumming in software");
                software_checksum(first);
            }
        }
        if sgt_off as usize + table_bytes > (*c).buf_len as usize {
            let _ = release_buf(hw, carrier_pool.id, (*c).buf_phys, policy);
            return Err(Error::CarrierTooSmall { segs: nb_segs });
        }
        (*c).data_off = sgt_off;
        fd.offset = sgt_off;

        let table = slice::from_raw_parts_mut((*c).buf_addr.add(sgt_off as usize), table_bytes);
        let mut idx = 0;
        let mut cur = Some(first);
        while let Some(seg) = cur {
            assert!(
                idx < nb_segs as usize,
                "corrupt chain: more segments than nb_segs"
            );
            let s = seg.as_ptr();
            let next = (*s).next;
            let entry = SgEntry {
                addr: (*s).data_phys(),
                offset: (*s).data_off,
                len: (*s).data_len,
                bpid: claim_for_hw(seg),
                is_final: next.is_none(),
            };
            entry.encode(&mut table[idx * SG_ENTRY_SIZE..(idx + 1) * SG_ENTRY_SIZE]);
            if (*s).owner.is_some() {
                // Alias shells carry no payload of their own; the entry now
                // references the true owner's buffer.
                free_seg(hw, policy, seg);
            }
            idx += 1;
            cur = next;
        }
        assert_eq!(
            idx, nb_segs as usize,
            "corrupt chain: fewer segments than nb_segs"
        );
        Ok(fd)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hw::MemoryService;
    use crate::mbuf::{DEFAULT_HEADROOM, Ownership};
    use crate::pool::acquire_buf;
    use crate::sim::{SimNic, SimPoolSpec};

    fn nic() -> SimNic {
        SimNic::new(
            &[
                SimPoolSpec {
                    id: PoolId(1),
                    buf_size: 2048,
                    count: 64,
                },
                SimPoolSpec {
                    id: PoolId(2),
                    buf_size: 512,
                    count: 8,
                },
            ],
            1,
            64,
        )
    }

    fn pools(nic: &SimNic) -> PoolTable {
        let mut t = PoolTable::new();
        t.register(*nic.pool_info(PoolId(1)));
        t.register(*nic.pool_info(PoolId(2)));
        t
    }

    /// Builds an n-segment chain from pool 1 with distinct (offset, len).
    fn chain(nic: &SimNic, n: usize) -> NonNull<PacketBuf> {
        let info = *nic.pool_info(PoolId(1));
        let mut first: Option<NonNull<PacketBuf>> = None;
        let mut prev: Option<NonNull<PacketBuf>> = None;
        for i in 0..n {
            let seg = acquire_buf(nic, &info).unwrap();
            unsafe {
                let s = seg.as_ptr();
                (*s).data_off = DEFAULT_HEADROOM + i as u16;
                (*s).data_len = 100 + i as u32;
                match first {
                    None => {
                        (*s).pkt_len = (*s).data_len;
                        first = Some(seg);
                    }
                    Some(f) => {
                        (*f.as_ptr()).pkt_len += (*s).data_len;
                        (*f.as_ptr()).nb_segs += 1;
                        (*prev.unwrap().as_ptr()).next = Some(seg);
                    }
                }
                prev = Some(seg);
            }
        }
        first.unwrap()
    }

    #[test]
    fn sg_entry_wire_codec() {
        let e = SgEntry {
            addr: PhysAddr(0x4000_1234),
            offset: 0x155,
            len: 0x3_2100,
            bpid: 7,
            is_final: true,
        };
        let mut raw = [0u8; SG_ENTRY_SIZE];
        e.encode(&mut raw);
        // Big-endian address, final bit on top of the length word.
        assert_eq!(&raw[0..8], &0x4000_1234u64.to_be_bytes());
        assert_eq!(raw[8], 0x80);
        assert_eq!(u32::from_be_bytes(raw[8..12].try_into().unwrap()) & 0xf_ffff, 0x3_2100);
        assert_eq!(SgEntry::decode(&raw), e);

        let e2 = SgEntry { is_final: false, ..e };
        e2.encode(&mut raw);
        assert_eq!(raw[8] & 0x80, 0);
        assert_eq!(SgEntry::decode(&raw), e2);
    }

    #[test]
    fn sg_round_trip_preserves_geometry() {
        for n in [1usize, 2, 7, MAX_SG_ENTRIES] {
            let nic = nic();
            let table = pools(&nic);
            let policy = ReleasePolicy::default();
            let first = chain(&nic, n);
            let (want_segs, want_len, want_geom) = unsafe {
                let f = first.as_ptr();
                let geom: Vec<(u16, u32)> = crate::mbuf::iter_chain(first)
                    .map(|s| ((*s.as_ptr()).data_off, (*s.as_ptr()).data_len))
                    .collect();
                ((*f).nb_segs, (*f).pkt_len, geom)
            };

            let carrier_info = *nic.pool_info(PoolId(2));
            let fd = pkt_to_sg_fd(&nic, policy, first, &carrier_info).unwrap();
            assert_eq!(fd.fd_format(), Some(FdFormat::Sg));
            assert_eq!(fd.len, want_len);

            let back = fd_to_pkt(&nic, &table, policy, 9, &fd).unwrap();
            unsafe {
                let b = back.as_ptr();
                assert_eq!((*b).nb_segs, want_segs);
                assert_eq!((*b).pkt_len, want_len);
                assert_eq!((*b).port, 9);
                let geom: Vec<(u16, u32)> = crate::mbuf::iter_chain(back)
                    .map(|s| ((*s.as_ptr()).data_off, (*s.as_ptr()).data_len))
                    .collect();
                assert_eq!(geom, want_geom);
                // Carrier went back to its pool during translation.
                assert_eq!(nic.pool_available(PoolId(2)), 8);
                crate::mbuf::free_chain(&nic, policy, back);
            }
            assert_eq!(nic.pool_available(PoolId(1)), 64);
        }
    }

    #[test]
    fn sg_build_rejects_oversized_chain() {
        let nic = nic();
        let policy = ReleasePolicy::default();
        let first = chain(&nic, MAX_SG_ENTRIES + 1);
        let before = nic.pool_available(PoolId(2));
        let carrier_info = *nic.pool_info(PoolId(2));
        let err = pkt_to_sg_fd(&nic, policy, first, &carrier_info).unwrap_err();
        assert!(matches!(err, Error::TooManySegments(n) if n as usize == MAX_SG_ENTRIES + 1));
        // No carrier leaked, chain untouched and still freeable.
        assert_eq!(nic.pool_available(PoolId(2)), before);
        unsafe {
            assert_eq!((*first.as_ptr()).nb_segs as usize, MAX_SG_ENTRIES + 1);
            crate::mbuf::free_chain(&nic, policy, first);
        }
        assert_eq!(nic.pool_available(PoolId(1)), 64);
    }

    #[test]
    fn sg_build_rejects_small_carrier() {
        let nic = SimNic::new(
            &[
                SimPoolSpec {
                    id: PoolId(1),
                    buf_size: 2048,
                    count: 32,
                },
                // Too small for headroom plus a full table.
                SimPoolSpec {
                    id: PoolId(3),
                    buf_size: 192,
                    count: 4,
                },
            ],
            1,
            64,
        );
        let policy = ReleasePolicy::default();
        let first = chain(&nic, 8);
        let carrier_info = *nic.pool_info(PoolId(3));
        let err = pkt_to_sg_fd(&nic, policy, first, &carrier_info).unwrap_err();
        assert!(matches!(err, Error::CarrierTooSmall { segs: 8 }));
        assert_eq!(nic.pool_available(PoolId(3)), 4);
        unsafe { crate::mbuf::free_chain(&nic, policy, first) };
    }

    #[test]
    fn rx_rejects_unterminated_table() {
        let nic = nic();
        let table = pools(&nic);
        let policy = ReleasePolicy::default();
        let info = *nic.pool_info(PoolId(1));
        let carrier_info = *nic.pool_info(PoolId(2));

        // A full table where no entry carries the final flag.
        let segs: Vec<_> = (0..MAX_SG_ENTRIES)
            .map(|_| acquire_buf(&nic, &info).unwrap())
            .collect();
        let carrier = acquire_buf(&nic, &carrier_info).unwrap();
        let fd = unsafe {
            let c = carrier.as_ptr();
            for (i, seg) in segs.iter().enumerate() {
                let e = SgEntry {
                    addr: (*seg.as_ptr()).buf_phys(),
                    offset: DEFAULT_HEADROOM,
                    len: 64,
                    bpid: 1,
                    is_final: false,
                };
                let off = (*c).data_off as usize + i * SG_ENTRY_SIZE;
                let out = std::slice::from_raw_parts_mut((*c).buf_addr.add(off), SG_ENTRY_SIZE);
                e.encode(out);
            }
            FrameDesc {
                addr: (*c).buf_phys,
                format: FMT_SG,
                bpid: carrier_info.id.0,
                offset: (*c).data_off,
                len: 64 * MAX_SG_ENTRIES as u32,
                cmd: FdCmd::empty(),
            }
        };

        let err = fd_to_pkt(&nic, &table, policy, 0, &fd).unwrap_err();
        assert!(matches!(err, Error::SgOverflow));
        // Everything went back: the segments and the carrier.
        assert_eq!(nic.pool_available(PoolId(1)), 64);
        assert_eq!(nic.pool_available(PoolId(2)), 8);
    }

    #[test]
    fn rx_rejects_unknown_format_and_releases() {
        let nic = nic();
        let table = pools(&nic);
        let policy = ReleasePolicy::default();
        let info = *nic.pool_info(PoolId(1));
        let buf = acquire_buf(&nic, &info).unwrap();
        let fd = unsafe {
            FrameDesc {
                addr: (*buf.as_ptr()).buf_phys(),
                format: 7,
                bpid: 1,
                offset: DEFAULT_HEADROOM,
                len: 60,
                cmd: FdCmd::empty(),
            }
        };
        let err = fd_to_pkt(&nic, &table, policy, 0, &fd).unwrap_err();
        assert!(matches!(err, Error::BadFormat(7)));
        assert_eq!(nic.pool_available(PoolId(1)), 64);
    }

    #[test]
    fn rx_rejects_unmapped_address() {
        let nic = nic();
        let table = pools(&nic);
        let fd = FrameDesc::contig(PhysAddr(0x10), 1, DEFAULT_HEADROOM, 60);
        let err = fd_to_pkt(&nic, &table, ReleasePolicy::default(), 0, &fd).unwrap_err();
        assert!(matches!(err, Error::NotMapped(0x10)));
    }

    #[test]
    fn shared_segment_gets_sentinel_until_last_owner() {
        let nic = nic();
        let policy = ReleasePolicy::default();
        let first = chain(&nic, 2);
        unsafe {
            // Second segment shared with another holder.
            let second = (*first.as_ptr()).next.unwrap();
            (*second.as_ptr()).ownership = Ownership::Shared(2);

            let carrier_info = *nic.pool_info(PoolId(2));
            let fd = pkt_to_sg_fd(&nic, policy, first, &carrier_info).unwrap();

            let base = nic
                .physical_to_process(fd.addr)
                .unwrap()
                .as_ptr()
                .add(fd.offset as usize);
            let e0 = SgEntry::decode(
                std::slice::from_raw_parts(base, SG_ENTRY_SIZE).try_into().unwrap(),
            );
            let e1 = SgEntry::decode(
                std::slice::from_raw_parts(base.add(SG_ENTRY_SIZE), SG_ENTRY_SIZE)
                    .try_into()
                    .unwrap(),
            );
            assert_eq!(e0.bpid, 1);
            assert_eq!(e1.bpid, crate::pool::BPID_NO_RELEASE);
            assert!(e1.is_final && !e0.is_final);
            // The local claim was dropped: one owner remains.
            assert_eq!((*second.as_ptr()).ownership, Ownership::Exclusive);

            // A later conversion of the now-exclusive buffer uses its true pool.
            (*second.as_ptr()).next = None;
            (*second.as_ptr()).nb_segs = 1;
            (*second.as_ptr()).pkt_len = (*second.as_ptr()).data_len;
            let fd2 = pkt_to_sg_fd(&nic, policy, second, &carrier_info).unwrap();
            let base2 = nic
                .physical_to_process(fd2.addr)
                .unwrap()
                .as_ptr()
                .add(fd2.offset as usize);
            let e = SgEntry::decode(
                std::slice::from_raw_parts(base2, SG_ENTRY_SIZE).try_into().unwrap(),
            );
            assert_eq!(e.bpid, 1);
        }
    }
}
